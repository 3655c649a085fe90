//! The debug backend boundary.
//!
//! The session drives an opaque low-level debugging engine through this
//! trait: breakpoint binding, resuming, stack/scope/variable inspection and
//! expression evaluation against a live process. Failures are
//! backend-specific messages passed through verbatim. Stop notifications
//! arrive on a broadcast channel so a restarted session can resubscribe
//! without touching the backend's own task.

use std::path::Path;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::debuggee::EvaluationClassLoader;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    pub source: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeInfo {
    pub name: String,
    pub variables_reference: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub type_name: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluated {
    pub type_name: Option<String>,
    pub result: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
    Pause,
}

impl StopReason {
    pub fn as_dap_reason(self) -> &'static str {
        match self {
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Pause => "pause",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEvent {
    pub thread_id: i64,
    pub reason: StopReason,
}

pub trait DebugBackend: Send + Sync + 'static {
    /// Connect the engine to the debuggee's bound debug port.
    fn attach(&self, host: &str, port: u16) -> Result<(), BackendError>;

    /// Bind breakpoints at the requested lines; returns one verified flag
    /// per requested line, in request order.
    fn set_breakpoints(&self, source: &Path, lines: &[u32]) -> Result<Vec<bool>, BackendError>;

    fn resume(&self, thread_id: i64) -> Result<(), BackendError>;

    fn threads(&self) -> Result<Vec<ThreadInfo>, BackendError>;

    fn stack_trace(&self, thread_id: i64) -> Result<Vec<StackFrame>, BackendError>;

    fn scopes(&self, frame_id: i64) -> Result<Vec<ScopeInfo>, BackendError>;

    fn variables(&self, variables_reference: i64) -> Result<Vec<VariableInfo>, BackendError>;

    fn evaluate(
        &self,
        frame_id: i64,
        expression: &str,
        class_loader: &EvaluationClassLoader,
    ) -> Result<Evaluated, BackendError>;

    fn subscribe_stops(&self) -> broadcast::Receiver<StopEvent>;
}

/// Backend used until the real JDWP engine is wired in: every inspection
/// call fails with a uniform message and no stop events are ever produced.
pub struct DetachedBackend {
    stops: broadcast::Sender<StopEvent>,
}

impl DetachedBackend {
    pub fn new() -> Self {
        let (stops, _) = broadcast::channel(16);
        Self { stops }
    }

    fn unavailable<T>(&self) -> Result<T, BackendError> {
        Err(BackendError("no debug engine is attached".to_string()))
    }
}

impl Default for DetachedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugBackend for DetachedBackend {
    fn attach(&self, _host: &str, _port: u16) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_breakpoints(&self, _source: &Path, lines: &[u32]) -> Result<Vec<bool>, BackendError> {
        Ok(vec![false; lines.len()])
    }

    fn resume(&self, _thread_id: i64) -> Result<(), BackendError> {
        self.unavailable()
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>, BackendError> {
        Ok(Vec::new())
    }

    fn stack_trace(&self, _thread_id: i64) -> Result<Vec<StackFrame>, BackendError> {
        self.unavailable()
    }

    fn scopes(&self, _frame_id: i64) -> Result<Vec<ScopeInfo>, BackendError> {
        self.unavailable()
    }

    fn variables(&self, _variables_reference: i64) -> Result<Vec<VariableInfo>, BackendError> {
        self.unavailable()
    }

    fn evaluate(
        &self,
        _frame_id: i64,
        _expression: &str,
        _class_loader: &EvaluationClassLoader,
    ) -> Result<Evaluated, BackendError> {
        self.unavailable()
    }

    fn subscribe_stops(&self) -> broadcast::Receiver<StopEvent> {
        self.stops.subscribe()
    }
}
