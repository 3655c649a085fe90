use std::time::Duration;

use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

/// Failure taxonomy for the debug-session layer.
///
/// Launch/attach/evaluate failures are returned to the client as failed
/// responses on the request that caused them; they are never allowed to
/// escape as uncaught faults. Debuggee crashes are *not* errors at this
/// level: the client learns about them through the `exited`/`terminated`
/// event pair.
#[derive(Debug, Error)]
pub enum DebugError {
    /// The debuggee never reached a debuggable state within the bound.
    #[error("debuggee was not ready within {0:?}")]
    LaunchTimeout(Duration),

    /// The debuggee failed before reaching a debuggable state. The message
    /// carries the causal failure verbatim so the client can display it.
    #[error("{0}")]
    LaunchFailure(String),

    /// The debuggee has no evaluation class loader, so expressions cannot
    /// be compiled against it.
    #[error("expression evaluation is not supported for this debuggee")]
    EvaluationUnsupported,

    /// Opaque pass-through from the debug backend.
    #[error("{0}")]
    Backend(String),

    /// The operation was aborted by an explicit cancel or server shutdown.
    #[error("operation was cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dap protocol error: {0}")]
    Protocol(String),
}

impl DebugError {
    /// The request-level state check failed (wrong session state for the
    /// command). Kept as `Protocol` so the message reaches the client.
    pub(crate) fn invalid_state(command: &str, state: impl std::fmt::Display) -> Self {
        DebugError::Protocol(format!("`{command}` is not valid while {state}"))
    }
}
