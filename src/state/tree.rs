//! # State trees observed by the bridge.
//!
//! [`StateTree`] is the seam between the bridge and a state owner. The bridge
//! never mutates a tree's internals directly: it reads and writes through
//! dotted [`StatePath`]s and learns about external mutations from observers
//! registered with [`StateTree::on_change`].
//!
//! ## Observer contract
//! - A change at `P` is reported once, as `(P, new value)`; `None` means `P`
//!   was removed.
//! - Writing a value equal to the current one is not a change.
//! - Observers may read the tree; they are invoked after the tree released
//!   its internal locks.
//!
//! [`ObservableTree`] is the in-memory implementation over a JSON document:
//! a change at `P` goes to the observers registered at `P`, or, when there are
//! none, to those of the nearest observed ancestor.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use super::path::StatePath;
use crate::error::TreeError;
use crate::result::panic_message;

/// Callback invoked with the changed path and its new value.
pub type ChangeObserver = Arc<dyn Fn(&StatePath, Option<&Value>) + Send + Sync>;

/// Identifier of an observer registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// A path-addressable, observable state container.
pub trait StateTree: Send + Sync + 'static {
    /// Name used in logs and errors.
    fn label(&self) -> &str {
        "state-tree"
    }

    /// Deep copy of the node at `path`, `None` when absent.
    fn read(&self, path: &StatePath) -> Option<Value>;

    /// Writes `value` at `path`, creating missing intermediate objects.
    fn write(&self, path: &StatePath, value: Value) -> Result<(), TreeError>;

    /// Removes the node at `path` and returns it. Removing an absent node is not an error.
    fn remove(&self, path: &StatePath) -> Result<Option<Value>, TreeError>;

    /// Every node path at or below `under`, `under` included when it exists.
    fn paths(&self, under: &StatePath) -> Vec<StatePath>;

    fn on_change(&self, path: &StatePath, observer: ChangeObserver) -> ObserverId;

    fn remove_observer(&self, id: ObserverId) -> bool;
}

#[derive(Default)]
struct ObserverTable {
    next_id: u64,
    by_path: HashMap<StatePath, Vec<(ObserverId, ChangeObserver)>>,
}

/// In-memory [`StateTree`] over a JSON object.
pub struct ObservableTree {
    label: String,
    root: RwLock<Value>,
    observers: Mutex<ObserverTable>,
}

impl ObservableTree {
    /// Creates a tree; the root must be a JSON object.
    pub fn new(label: impl Into<String>, initial: Value) -> Result<Self, TreeError> {
        if !initial.is_object() {
            return Err(TreeError::InvalidRoot {
                reason: "root must be an object".into(),
            });
        }
        Ok(Self {
            label: label.into(),
            root: RwLock::new(initial),
            observers: Mutex::new(ObserverTable::default()),
        })
    }

    pub fn empty(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            root: RwLock::new(Value::Object(Map::new())),
            observers: Mutex::new(ObserverTable::default()),
        }
    }

    /// Deep copy of the whole document.
    pub fn snapshot(&self) -> Value {
        self.root.read().clone()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().by_path.values().map(Vec::len).sum()
    }

    fn notify(&self, path: &StatePath, value: Option<&Value>) {
        let targets: Vec<ChangeObserver> = {
            let table = self.observers.lock();
            let mut at = Some(path.clone());
            let mut found = Vec::new();
            while let Some(p) = at {
                if let Some(list) = table.by_path.get(&p).filter(|l| !l.is_empty()) {
                    found = list.iter().map(|(_, o)| Arc::clone(o)).collect();
                    break;
                }
                at = p.parent();
            }
            found
        };

        for observer in targets {
            let res = std::panic::catch_unwind(AssertUnwindSafe(|| observer(path, value)));
            if let Err(panic) = res {
                tracing::warn!(tree = %self.label, path = %path, reason = %panic_message(panic.as_ref()), "change observer panicked");
            }
        }
    }
}

impl StateTree for ObservableTree {
    fn label(&self) -> &str {
        &self.label
    }

    fn read(&self, path: &StatePath) -> Option<Value> {
        let root = self.root.read();
        lookup(&root, path).cloned()
    }

    fn write(&self, path: &StatePath, value: Value) -> Result<(), TreeError> {
        let changed = {
            let mut root = self.root.write();
            match path.segments().collect::<Vec<_>>().split_last() {
                None => {
                    if !value.is_object() {
                        return Err(TreeError::InvalidRoot {
                            reason: "root must be an object".into(),
                        });
                    }
                    if *root == value {
                        false
                    } else {
                        *root = value.clone();
                        true
                    }
                }
                Some((last, parents)) => {
                    let mut node: &mut Value = &mut root;
                    let mut at = StatePath::root();
                    for seg in parents {
                        node = child_or_create(node, seg, &at)?;
                        at = at.join(seg);
                    }
                    set_child(node, last, value.clone(), &at)?
                }
            }
        };

        if changed {
            self.notify(path, Some(&value));
        }
        Ok(())
    }

    fn remove(&self, path: &StatePath) -> Result<Option<Value>, TreeError> {
        let removed = {
            let mut root = self.root.write();
            let segs: Vec<&str> = path.segments().collect();
            let Some((last, parents)) = segs.split_last() else {
                return Err(TreeError::InvalidRoot {
                    reason: "the root cannot be removed".into(),
                });
            };

            let mut node: &mut Value = &mut root;
            for seg in parents {
                node = match child_mut(node, seg) {
                    Some(child) => child,
                    None => return Ok(None),
                };
            }
            match node {
                Value::Object(map) => map.remove(*last),
                Value::Array(items) => match last.parse::<usize>() {
                    Ok(idx) if idx < items.len() => Some(items.remove(idx)),
                    _ => None,
                },
                _ => None,
            }
        };

        if removed.is_some() {
            self.notify(path, None);
        }
        Ok(removed)
    }

    fn paths(&self, under: &StatePath) -> Vec<StatePath> {
        let root = self.root.read();
        let mut out = Vec::new();
        if let Some(node) = lookup(&root, under) {
            collect_paths(node, under.clone(), &mut out);
        }
        out
    }

    fn on_change(&self, path: &StatePath, observer: ChangeObserver) -> ObserverId {
        let mut table = self.observers.lock();
        table.next_id += 1;
        let id = ObserverId(table.next_id);
        table
            .by_path
            .entry(path.clone())
            .or_default()
            .push((id, observer));
        id
    }

    fn remove_observer(&self, id: ObserverId) -> bool {
        let mut table = self.observers.lock();
        let mut removed = false;
        table.by_path.retain(|_, list| {
            let before = list.len();
            list.retain(|(oid, _)| *oid != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }
}

fn lookup<'a>(root: &'a Value, path: &StatePath) -> Option<&'a Value> {
    let mut node = root;
    for seg in path.segments() {
        node = match node {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

fn child_mut<'a>(node: &'a mut Value, seg: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => map.get_mut(seg),
        Value::Array(items) => items.get_mut(seg.parse::<usize>().ok()?),
        _ => None,
    }
}

/// Descends into `seg`, creating an empty object when it is missing from an object node.
fn child_or_create<'a>(
    node: &'a mut Value,
    seg: &str,
    at: &StatePath,
) -> Result<&'a mut Value, TreeError> {
    match node {
        Value::Object(map) => Ok(map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => {
            let len = items.len();
            let idx = parse_index(seg, at)?;
            items.get_mut(idx).ok_or_else(|| TreeError::IndexOutOfBounds {
                path: at.to_string(),
                index: idx,
                len,
            })
        }
        _ => Err(TreeError::NotAContainer {
            path: at.to_string(),
        }),
    }
}

/// Sets `node[seg] = value`; returns whether anything changed.
///
/// An array accepts an index equal to its length as an append.
fn set_child(node: &mut Value, seg: &str, value: Value, at: &StatePath) -> Result<bool, TreeError> {
    match node {
        Value::Object(map) => match map.get_mut(seg) {
            Some(existing) if *existing == value => Ok(false),
            Some(existing) => {
                *existing = value;
                Ok(true)
            }
            None => {
                map.insert(seg.to_string(), value);
                Ok(true)
            }
        },
        Value::Array(items) => {
            let idx = parse_index(seg, at)?;
            let len = items.len();
            if idx < len {
                if items[idx] == value {
                    return Ok(false);
                }
                items[idx] = value;
                Ok(true)
            } else if idx == len {
                items.push(value);
                Ok(true)
            } else {
                Err(TreeError::IndexOutOfBounds {
                    path: at.to_string(),
                    index: idx,
                    len,
                })
            }
        }
        _ => Err(TreeError::NotAContainer {
            path: at.to_string(),
        }),
    }
}

fn parse_index(seg: &str, at: &StatePath) -> Result<usize, TreeError> {
    seg.parse::<usize>().map_err(|_| TreeError::Rejected {
        path: at.join(seg).to_string(),
        reason: "array segments must be numeric".into(),
    })
}

fn collect_paths(node: &Value, at: StatePath, out: &mut Vec<StatePath>) {
    match node {
        Value::Object(map) => {
            for (key, child) in map {
                collect_paths(child, at.join(key), out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_paths(child, at.join(&i.to_string()), out);
            }
        }
        _ => {}
    }
    out.push(at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording(tree: &ObservableTree, at: &str) -> Arc<Mutex<Vec<(String, Option<Value>)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        tree.on_change(
            &at.into(),
            Arc::new(move |p: &StatePath, v: Option<&Value>| {
                s.lock().push((p.to_string(), v.cloned()));
            }),
        );
        seen
    }

    #[test]
    fn test_write_creates_intermediate_objects() {
        let tree = ObservableTree::empty("a");
        tree.write(&"user.profile.name".into(), json!("Ada")).unwrap();
        assert_eq!(tree.snapshot(), json!({ "user": { "profile": { "name": "Ada" } } }));
        assert_eq!(tree.read(&"user.profile".into()), Some(json!({ "name": "Ada" })));
    }

    #[test]
    fn test_descending_into_scalar_fails() {
        let tree = ObservableTree::new("b", json!({ "cfg": 5 })).unwrap();
        let err = tree.write(&"cfg.mode".into(), json!("x")).unwrap_err();
        assert_eq!(err, TreeError::NotAContainer { path: "cfg".into() });
        assert_eq!(tree.read(&"cfg.mode".into()), None);
    }

    #[test]
    fn test_arrays_are_indexed_and_appendable() {
        let tree = ObservableTree::new("a", json!({ "items": [1, 2] })).unwrap();
        tree.write(&"items.1".into(), json!(20)).unwrap();
        tree.write(&"items.2".into(), json!(3)).unwrap();
        assert_eq!(tree.read(&"items".into()), Some(json!([1, 20, 3])));

        let err = tree.write(&"items.9".into(), json!(0)).unwrap_err();
        assert!(matches!(err, TreeError::IndexOutOfBounds { index: 9, len: 3, .. }));
    }

    #[test]
    fn test_changes_route_to_nearest_observed_ancestor() {
        let tree = ObservableTree::empty("a");
        let root = recording(&tree, "");
        let user = recording(&tree, "user");

        tree.write(&"user.name".into(), json!("Ada")).unwrap();
        tree.write(&"other".into(), json!(1)).unwrap();

        assert_eq!(*user.lock(), vec![("user.name".to_string(), Some(json!("Ada")))]);
        assert_eq!(*root.lock(), vec![("other".to_string(), Some(json!(1)))]);
    }

    #[test]
    fn test_equal_write_is_not_a_change() {
        let tree = ObservableTree::new("a", json!({ "x": 1 })).unwrap();
        let seen = recording(&tree, "");
        tree.write(&"x".into(), json!(1)).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_remove_reports_none_and_is_lenient() {
        let tree = ObservableTree::new("a", json!({ "x": { "y": 1 } })).unwrap();
        let seen = recording(&tree, "");

        assert_eq!(tree.remove(&"x.y".into()).unwrap(), Some(json!(1)));
        assert_eq!(tree.remove(&"x.y".into()).unwrap(), None);
        assert_eq!(tree.remove(&"nope.deeper".into()).unwrap(), None);
        assert!(tree.remove(&StatePath::root()).is_err());
        assert_eq!(*seen.lock(), vec![("x.y".to_string(), None)]);
    }

    #[test]
    fn test_paths_lists_every_node() {
        let tree = ObservableTree::new("a", json!({ "u": { "n": 1, "l": [true] } })).unwrap();
        let mut paths: Vec<String> = tree.paths(&StatePath::root()).iter().map(|p| p.to_string()).collect();
        paths.sort();
        assert_eq!(paths, vec!["", "u", "u.l", "u.l.0", "u.n"]);
        assert!(tree.paths(&"missing".into()).is_empty());
    }

    #[test]
    fn test_remove_observer() {
        let tree = ObservableTree::empty("a");
        let id = tree.on_change(&"x".into(), Arc::new(|_: &StatePath, _: Option<&Value>| {}));
        assert_eq!(tree.observer_count(), 1);
        assert!(tree.remove_observer(id));
        assert!(!tree.remove_observer(id));
        assert_eq!(tree.observer_count(), 0);
    }
}
