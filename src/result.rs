//! # Result propagation: the envelope every bridge operation returns.
//!
//! [`BridgeResult<T>`] is the success/failure envelope used at every component
//! boundary. Internal failures (tree errors, caught panics) are converted into a
//! [`BridgeError`] at the edge of the operation that observed them; nothing
//! unwinds across the bridge's public surface.
//!
//! ## Combinators
//! ```text
//! execute(component, op, code, f)        f() ─► Ok(v)  ─► Ok(v)
//!                                              ─► Err(e) ─► Err(BridgeError{code, cause: e})
//!                                              ─► panic  ─► Err(BridgeError{Internal})
//!
//! with_recovery(result, recover)         Ok(v)                      ─► Ok(v)
//!                                        Err(e), !e.recoverable     ─► Err(e)
//!                                        Err(e), recover() ─► Ok(v) ─► Ok(v)
//!                                        Err(e), recover() ─► Err   ─► Err(RecoveryFailed{cause: e})
//! ```
//!
//! [`unwrap`] is only meant for true edges (callers that are not
//! envelope-aware); core components never call it on each other.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use crate::error::{BridgeError, ErrorCode};

/// Envelope returned by every bridge operation.
pub type BridgeResult<T> = Result<T, BridgeError>;

impl ErrorCode {
    /// Default `recoverable` flag for errors converted by [`execute`].
    ///
    /// Transient delivery/sync/listener failures are recoverable; everything
    /// else requires intervention.
    pub fn is_recoverable_by_default(&self) -> bool {
        matches!(
            self,
            ErrorCode::CommunicationError | ErrorCode::SyncError | ErrorCode::ListenerError
        )
    }
}

/// Runs `f` and converts any failure into a [`BridgeError`].
///
/// - `Err(e)` where `e` already is a [`BridgeError`] passes through unchanged.
/// - Any other error is wrapped with `code` and kept as the cause.
/// - A panic becomes an [`ErrorCode::Internal`] error (not recoverable).
///
/// # Example
/// ```
/// use statebridge::{execute, ErrorCode};
///
/// let res = execute("demo", "parse", ErrorCode::InvalidPayload, || "42".parse::<u32>());
/// assert_eq!(res.unwrap(), 42);
///
/// let res = execute("demo", "parse", ErrorCode::InvalidPayload, || "x".parse::<u32>());
/// assert_eq!(res.unwrap_err().code, ErrorCode::InvalidPayload);
/// ```
pub fn execute<T, E, F>(
    component: &'static str,
    operation: &'static str,
    code: ErrorCode,
    f: F,
) -> BridgeResult<T>
where
    F: FnOnce() -> Result<T, E>,
    E: std::error::Error + Send + Sync + 'static,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(convert(component, operation, code, err)),
        Err(panic) => Err(from_panic(component, operation, panic.as_ref())),
    }
}

/// Async counterpart of [`execute`]: awaits `fut` with the same conversion rules.
pub async fn execute_async<T, E, Fut>(
    component: &'static str,
    operation: &'static str,
    code: ErrorCode,
    fut: Fut,
) -> BridgeResult<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(convert(component, operation, code, err)),
        Err(panic) => Err(from_panic(component, operation, panic.as_ref())),
    }
}

/// Runs `recovery` when `result` failed with a recoverable error.
///
/// If recovery fails too, the returned error has code
/// [`ErrorCode::RecoveryFailed`], names the original code in its message and
/// carries the original error as its cause.
pub async fn with_recovery<T, F, Fut>(result: BridgeResult<T>, recovery: F) -> BridgeResult<T>
where
    F: FnOnce(&BridgeError) -> Fut,
    Fut: Future<Output = BridgeResult<T>>,
{
    let original = match result {
        Ok(value) => return Ok(value),
        Err(err) if !err.recoverable => return Err(err),
        Err(err) => err,
    };

    match recovery(&original).await {
        Ok(value) => {
            tracing::debug!(code = original.as_label(), "recovered from failure");
            Ok(value)
        }
        Err(recovery_err) => Err(BridgeError::new(
            ErrorCode::RecoveryFailed,
            original.component,
            original.operation,
            format!(
                "recovery for {} failed: {}",
                original.code, recovery_err.message
            ),
        )
        .with_cause(original)),
    }
}

/// Extracts the value or panics with the error's message.
///
/// Only for edges adapting to callers that are not envelope-aware.
#[track_caller]
pub fn unwrap<T>(result: BridgeResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("{err}"),
    }
}

fn convert<E>(component: &'static str, operation: &'static str, code: ErrorCode, err: E) -> BridgeError
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let Some(bridge) = (&err as &dyn Any).downcast_ref::<BridgeError>() {
        return bridge.clone();
    }
    BridgeError::new(code, component, operation, err.to_string())
        .recoverable(code.is_recoverable_by_default())
        .with_cause(err)
}

pub(crate) fn from_panic(
    component: &'static str,
    operation: &'static str,
    panic: &(dyn Any + Send),
) -> BridgeError {
    BridgeError::new(
        ErrorCode::Internal,
        component,
        operation,
        format!("panicked: {}", panic_message(panic)),
    )
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TreeError;

    fn recoverable_sync() -> BridgeError {
        BridgeError::new(ErrorCode::SyncError, "state-manager", "set_state", "mirror failed")
            .recoverable(true)
    }

    #[test]
    fn test_execute_wraps_foreign_error_with_cause() {
        let res: BridgeResult<()> = execute("state-manager", "write", ErrorCode::SyncError, || {
            Err(TreeError::Rejected {
                path: "a".into(),
                reason: "nope".into(),
            })
        });
        let err = res.unwrap_err();
        assert_eq!(err.code, ErrorCode::SyncError);
        assert!(err.recoverable);
        assert!(err.cause.is_some());
    }

    #[test]
    fn test_execute_passes_bridge_error_through() {
        let res: BridgeResult<()> =
            execute("x", "y", ErrorCode::Internal, || Err(recoverable_sync()));
        let err = res.unwrap_err();
        assert_eq!(err.code, ErrorCode::SyncError);
        assert_eq!(err.component, "state-manager");
    }

    #[test]
    fn test_execute_catches_panic() {
        let res: BridgeResult<()> = execute("bus", "dispatch", ErrorCode::CommunicationError, || {
            if true {
                panic!("handler exploded");
            }
            Ok::<(), TreeError>(())
        });
        let err = res.unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        assert!(err.message.contains("handler exploded"));
        assert!(!err.recoverable);
    }

    #[tokio::test]
    async fn test_execute_async_catches_panic() {
        let res: BridgeResult<u8> = execute_async("health", "strategy", ErrorCode::Internal, async {
            if true {
                panic!("async boom");
            }
            Ok::<u8, TreeError>(1)
        })
        .await;
        assert!(res.unwrap_err().message.contains("async boom"));
    }

    #[tokio::test]
    async fn test_with_recovery_runs_for_recoverable_errors() {
        let res = with_recovery(Err(recoverable_sync()), |_| async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_with_recovery_skips_non_recoverable_errors() {
        let fatal = BridgeError::new(ErrorCode::Internal, "a", "b", "c");
        let mut called = false;
        let res: BridgeResult<u8> = with_recovery(Err(fatal), |_| {
            called = true;
            async { Ok(1) }
        })
        .await;
        assert!(!called);
        assert_eq!(res.unwrap_err().code, ErrorCode::Internal);
    }

    #[tokio::test]
    async fn test_with_recovery_wraps_failed_recovery() {
        let res: BridgeResult<u8> = with_recovery(Err(recoverable_sync()), |_| async {
            Err(BridgeError::new(ErrorCode::Internal, "r", "r", "still broken"))
        })
        .await;

        let err = res.unwrap_err();
        assert_eq!(err.code, ErrorCode::RecoveryFailed);
        assert!(err.message.contains("sync_error"));
        assert_eq!(err.cause_bridge_error().map(|e| e.code), Some(ErrorCode::SyncError));
    }

    #[test]
    #[should_panic(expected = "mirror failed")]
    fn test_unwrap_panics_at_edges() {
        let _: () = unwrap(Err(recoverable_sync()));
    }
}
