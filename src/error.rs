//! Error types used by the bridge runtime and by state trees.
//!
//! This module defines:
//!
//! - [`BridgeError`]: the error carried by every failed [`BridgeResult`](crate::BridgeResult).
//! - [`ErrorCode`]: the taxonomy a [`BridgeError`] is classified by.
//! - [`TreeError`]: errors raised by a [`StateTree`](crate::StateTree) implementation.
//!
//! Each type provides `as_label` for logs. A [`BridgeError`] also carries a
//! `recoverable` flag that is set by the component raising it, never inferred by
//! the caller.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;

/// Classification of bridge failures.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    /// A component could not be constructed or connected.
    InitializationFailed,
    /// An event could not be delivered (bus closed, handler failure).
    CommunicationError,
    /// The two state trees could not be kept consistent.
    SyncError,
    /// Listener or watcher bookkeeping failed.
    ListenerError,
    /// The operation is not valid in the current state.
    InvalidState,
    /// The component has been disconnected.
    ComponentInactive,
    /// An event payload failed boundary validation.
    InvalidPayload,
    /// Every recovery attempt failed.
    RecoveryFailed,
    /// Unexpected internal failure (caught panic, corrupted bookkeeping).
    Internal,
}

impl ErrorCode {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use statebridge::ErrorCode;
    ///
    /// assert_eq!(ErrorCode::SyncError.as_label(), "sync_error");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorCode::InitializationFailed => "initialization_failed",
            ErrorCode::CommunicationError => "communication_error",
            ErrorCode::SyncError => "sync_error",
            ErrorCode::ListenerError => "listener_error",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::ComponentInactive => "component_inactive",
            ErrorCode::InvalidPayload => "invalid_payload",
            ErrorCode::RecoveryFailed => "recovery_failed",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Underlying cause attached to a [`BridgeError`].
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// # Error produced by bridge operations.
///
/// Carries the originating component and operation so a failure can be traced
/// without a backtrace. Cheap to clone: the cause is shared.
///
/// # Example
/// ```
/// use statebridge::{BridgeError, ErrorCode};
///
/// let err = BridgeError::new(ErrorCode::SyncError, "state", "set_state", "mirror rejected")
///     .recoverable(true);
/// assert!(err.recoverable);
/// assert_eq!(err.as_label(), "sync_error");
/// ```
#[derive(Error, Debug, Clone)]
#[error("{component}.{operation} failed [{code}]: {message}")]
pub struct BridgeError {
    /// Failure classification.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Component that raised the error (`event-bus`, `state-manager`, ...).
    pub component: &'static str,
    /// Operation that failed.
    pub operation: &'static str,
    /// Whether automatic recovery may fix the failure.
    pub recoverable: bool,
    /// Wall-clock time the error was raised.
    pub timestamp: SystemTime,
    /// Originating error, if any.
    #[source]
    pub cause: Option<Cause>,
}

impl BridgeError {
    /// Creates a non-recoverable error without a cause.
    pub fn new(
        code: ErrorCode,
        component: &'static str,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            component,
            operation,
            recoverable: false,
            timestamp: SystemTime::now(),
            cause: None,
        }
    }

    /// Sets the recoverable flag.
    #[inline]
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Attaches the originating error.
    #[inline]
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Shorthand for a `ComponentInactive` error (never recoverable by retry).
    pub fn inactive(component: &'static str, operation: &'static str) -> Self {
        Self::new(
            ErrorCode::ComponentInactive,
            component,
            operation,
            "component is not connected",
        )
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        self.code.as_label()
    }

    /// Returns the cause as a [`BridgeError`] if it is one.
    pub fn cause_bridge_error(&self) -> Option<&BridgeError> {
        self.cause
            .as_deref()
            .and_then(|c| c.downcast_ref::<BridgeError>())
    }
}

/// # Errors produced by state tree implementations.
///
/// Returned from [`StateTree::write`](crate::StateTree::write) and
/// [`StateTree::remove`](crate::StateTree::remove); the state manager wraps
/// them into a [`BridgeError`] with [`ErrorCode::SyncError`].
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    /// A path segment tried to descend into a scalar value.
    #[error("cannot descend into non-container value at `{path}`")]
    NotAContainer {
        /// Path of the scalar node.
        path: String,
    },

    /// A numeric segment addressed past the end of an array.
    #[error("index {index} out of bounds at `{path}` (len {len})")]
    IndexOutOfBounds {
        /// Path of the array node.
        path: String,
        /// Requested index.
        index: usize,
        /// Array length.
        len: usize,
    },

    /// The root node cannot be removed or replaced by a non-object.
    #[error("invalid root operation: {reason}")]
    InvalidRoot {
        /// Why the operation was rejected.
        reason: String,
    },

    /// The tree refused the write (read-only node, validation hook, ...).
    #[error("write rejected at `{path}`: {reason}")]
    Rejected {
        /// Path of the rejected write.
        path: String,
        /// Reason given by the tree.
        reason: String,
    },
}

impl TreeError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use statebridge::TreeError;
    ///
    /// let err = TreeError::Rejected { path: "a".into(), reason: "read-only".into() };
    /// assert_eq!(err.as_label(), "tree_rejected");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TreeError::NotAContainer { .. } => "tree_not_a_container",
            TreeError::IndexOutOfBounds { .. } => "tree_index_out_of_bounds",
            TreeError::InvalidRoot { .. } => "tree_invalid_root",
            TreeError::Rejected { .. } => "tree_rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = BridgeError::new(ErrorCode::SyncError, "state-manager", "set_state", "boom");
        assert_eq!(
            err.to_string(),
            "state-manager.set_state failed [sync_error]: boom"
        );
        assert!(!err.recoverable);
    }

    #[test]
    fn test_cause_is_exposed_as_source() {
        let inner = TreeError::Rejected {
            path: "a.b".into(),
            reason: "locked".into(),
        };
        let err = BridgeError::new(ErrorCode::SyncError, "state-manager", "set_state", "mirror")
            .with_cause(inner.clone());

        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source, Some(inner.to_string()));
    }

    #[test]
    fn test_nested_bridge_error_cause_downcasts() {
        let original = BridgeError::new(ErrorCode::SyncError, "a", "b", "c").recoverable(true);
        let wrapped = BridgeError::new(ErrorCode::RecoveryFailed, "x", "y", "z")
            .with_cause(original.clone());

        let cause = wrapped.cause_bridge_error().map(|e| e.code);
        assert_eq!(cause, Some(ErrorCode::SyncError));
    }
}
