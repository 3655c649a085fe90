//! Per-connection protocol session.
//!
//! One session exists per accepted socket. It drives the debug backend from
//! client requests and multiplexes the shared debuggee execution (output,
//! ready, exit) into protocol events. All writes go through a single task,
//! which is what makes the wire ordering guarantee cheap to uphold: the
//! `exited` event always precedes `terminated`, and the socket is shut down
//! only after `terminated` has been flushed.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::backend::{DebugBackend, StopEvent};
use crate::dap::codec::{DapReader, DapWriter};
use crate::dap::messages::{Event, Request, Response};
use crate::debuggee::{Debuggee, DebuggeeExit, DebuggeeHandle, DebuggeeSignals, ReadyInfo};
use crate::error::{DebugError, DebugResult};
use crate::output::{OutputLine, OutputMultiplexer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Initialized,
    Launching,
    Attaching,
    Running,
    StoppedAtBreakpoint,
    Exited,
    Terminated,
    Disconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connected => "connected",
            SessionState::Initialized => "initialized",
            SessionState::Launching => "launching",
            SessionState::Attaching => "attaching",
            SessionState::Running => "running",
            SessionState::StoppedAtBreakpoint => "stopped",
            SessionState::Exited => "exited",
            SessionState::Terminated => "terminated",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the session reported back to the server when it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionOutcome {
    pub restart: bool,
}

pub(crate) struct Session {
    state: SessionState,
    next_seq: i64,
    restart_requested: bool,
    debuggee: Arc<dyn Debuggee>,
    backend: Arc<dyn DebugBackend>,
    signals: DebuggeeSignals,
    handle: DebuggeeHandle,
    output: Arc<OutputMultiplexer>,
    cancel: CancellationToken,
    launch_timeout: Duration,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        debuggee: Arc<dyn Debuggee>,
        backend: Arc<dyn DebugBackend>,
        signals: DebuggeeSignals,
        handle: DebuggeeHandle,
        output: Arc<OutputMultiplexer>,
        cancel: CancellationToken,
        launch_timeout: Duration,
    ) -> Self {
        Self {
            state: SessionState::Connected,
            next_seq: 1,
            restart_requested: false,
            debuggee,
            backend,
            signals,
            handle,
            output,
            cancel,
            launch_timeout,
        }
    }

    /// Drive the session until its socket must close. Always consumes the
    /// session; the socket is fully shut down on return.
    pub(crate) async fn run(mut self, stream: TcpStream) -> SessionOutcome {
        let (read_half, write_half) = stream.into_split();
        let mut writer = DapWriter::new(write_half);

        let (request_tx, mut request_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_requests(read_half, request_tx));

        let mut output_rx = self.output.attach();
        let mut exit_rx = self.signals.exit.clone();
        let mut stops = self.backend.subscribe_stops();
        let mut stops_open = true;
        let mut output_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Forced close: resource release pre-empts the normal
                    // event ordering. The client observes the socket close.
                    tracing::debug!(target: "kiln.dap", "session cancelled; closing socket");
                    break;
                }
                exit = wait_exit(&mut exit_rx) => {
                    // Flush output produced before the exit was observed so
                    // the transcript is complete before the terminal pair.
                    self.drain_output(&mut writer, &mut output_rx).await;
                    self.emit_exit_pair(&mut writer, &exit).await;
                    break;
                }
                request = request_rx.recv() => {
                    let Some(request) = request else {
                        // Client closed its end without a disconnect request.
                        break;
                    };
                    if self.handle_request(&mut writer, &request).await {
                        break;
                    }
                }
                line = output_rx.recv(), if output_open => {
                    match line {
                        Some(line) => self.emit_output(&mut writer, &line).await,
                        None => output_open = false,
                    }
                }
                stop = stops.recv(), if stops_open => {
                    match stop {
                        Ok(event) => self.emit_stopped(&mut writer, event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(target: "kiln.dap", skipped, "missed backend stop events");
                        }
                        Err(broadcast::error::RecvError::Closed) => stops_open = false,
                    }
                }
            }
        }

        // Lines still unread in our channel rejoin the multiplexer backlog
        // here, so a restart handoff never loses output.
        self.output.detach(&mut output_rx);
        // Flush + FIN strictly after the last event was written.
        let _ = writer.shutdown().await;
        reader_task.abort();
        self.state = SessionState::Closed;

        SessionOutcome {
            restart: self.restart_requested,
        }
    }

    fn alloc_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        seq
    }

    /// Handle one request, writing its response. Returns `true` when the
    /// session must close (disconnect processed or the socket is broken).
    async fn handle_request(
        &mut self,
        writer: &mut DapWriter<OwnedWriteHalf>,
        request: &Request,
    ) -> bool {
        if request.message_type != "request" {
            return false;
        }

        let result = match request.command.as_str() {
            "initialize" => self.initialize(),
            "launch" => self.launch().await,
            "attach" => self.attach().await,
            "setBreakpoints" => self.set_breakpoints(request),
            "configurationDone" => self.configuration_done(),
            "continue" => self.continue_request(request),
            "threads" => self.threads(),
            "stackTrace" => self.stack_trace(request),
            "scopes" => self.scopes(request),
            "variables" => self.variables(request),
            "evaluate" => self.evaluate(request),
            "disconnect" => self.disconnect(request),
            unknown => Err(DebugError::Protocol(format!("unknown command: {unknown}"))),
        };

        let disconnecting = self.state == SessionState::Disconnecting;

        match result {
            Ok(body) => {
                let response = Response::success(self.alloc_seq(), request, body);
                if writer.write_response(&response).await.is_err() {
                    return true;
                }
                if request.command == "initialize" {
                    let initialized = Event::new(self.alloc_seq(), "initialized", None);
                    if writer.write_event(&initialized).await.is_err() {
                        return true;
                    }
                }
            }
            Err(err) => {
                tracing::debug!(
                    target: "kiln.dap",
                    command = %request.command,
                    error = %err,
                    "request failed"
                );
                let response = Response::error(self.alloc_seq(), request, err.to_string());
                if writer.write_response(&response).await.is_err() {
                    return true;
                }
            }
        }

        disconnecting
    }

    fn expect_state(&self, command: &str, allowed: &[SessionState]) -> DebugResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DebugError::invalid_state(command, self.state))
        }
    }

    fn initialize(&mut self) -> DebugResult<Option<Value>> {
        self.expect_state("initialize", &[SessionState::Connected])?;
        self.state = SessionState::Initialized;

        Ok(Some(json!({
            "supportsConfigurationDoneRequest": true,
            "supportsEvaluateForHovers": true,
            "supportsConditionalBreakpoints": false,
            "supportsHitConditionalBreakpoints": false,
            "supportsLogPoints": false,
            "supportsStepBack": false,
            "supportsRestartRequest": false,
        })))
    }

    async fn launch(&mut self) -> DebugResult<Option<Value>> {
        self.expect_state("launch", &[SessionState::Initialized])?;
        self.state = SessionState::Launching;
        self.bind_backend().await?;
        Ok(None)
    }

    async fn attach(&mut self) -> DebugResult<Option<Value>> {
        self.expect_state("attach", &[SessionState::Initialized])?;
        self.state = SessionState::Attaching;
        self.bind_backend().await?;
        Ok(None)
    }

    /// Wait (bounded) for the shared debuggee execution to become
    /// debuggable, then point the backend at its debug port.
    async fn bind_backend(&mut self) -> DebugResult<()> {
        let ready = self.wait_for_ready().await?;
        if let Some(port) = ready.port {
            self.backend
                .attach(&ready.host, port)
                .map_err(|err| DebugError::Backend(err.0))?;
        }
        Ok(())
    }

    async fn wait_for_ready(&self) -> DebugResult<ReadyInfo> {
        let mut ready_rx = self.signals.ready.clone();
        let mut exit_rx = self.signals.exit.clone();
        let timeout = tokio::time::sleep(self.launch_timeout);
        tokio::pin!(timeout);

        loop {
            if let Some(info) = ready_rx.borrow_and_update().clone() {
                return Ok(info);
            }
            if let Some(exit) = exit_rx.borrow_and_update().clone() {
                return Err(launch_failure(exit));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DebugError::Cancelled),
                _ = &mut timeout => return Err(DebugError::LaunchTimeout(self.launch_timeout)),
                changed = ready_rx.changed() => {
                    if changed.is_err() {
                        return Err(DebugError::Cancelled);
                    }
                }
                changed = exit_rx.changed() => {
                    if changed.is_err() {
                        return Err(DebugError::Cancelled);
                    }
                }
            }
        }
    }

    fn set_breakpoints(&mut self, request: &Request) -> DebugResult<Option<Value>> {
        self.expect_state(
            "setBreakpoints",
            &[
                SessionState::Initialized,
                SessionState::Launching,
                SessionState::Attaching,
            ],
        )?;

        #[derive(Debug, Deserialize)]
        struct Source {
            path: Option<String>,
        }

        #[derive(Debug, Deserialize)]
        struct SourceBreakpoint {
            line: u32,
        }

        #[derive(Debug, Deserialize)]
        struct Args {
            source: Source,
            #[serde(default)]
            breakpoints: Vec<SourceBreakpoint>,
        }

        let args: Args = serde_json::from_value(request.arguments.clone())?;
        let Some(path) = args.source.path else {
            return Ok(Some(json!({ "breakpoints": [] })));
        };

        let lines: Vec<u32> = args.breakpoints.iter().map(|bp| bp.line).collect();
        let verified = self
            .backend
            .set_breakpoints(Path::new(&path), &lines)
            .map_err(|err| DebugError::Backend(err.0))?;

        let breakpoints: Vec<Value> = lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                json!({
                    "line": line,
                    "verified": verified.get(i).copied().unwrap_or(false),
                })
            })
            .collect();

        Ok(Some(json!({ "breakpoints": breakpoints })))
    }

    fn configuration_done(&mut self) -> DebugResult<Option<Value>> {
        self.expect_state(
            "configurationDone",
            &[SessionState::Launching, SessionState::Attaching],
        )?;
        self.state = SessionState::Running;
        Ok(None)
    }

    fn continue_request(&mut self, request: &Request) -> DebugResult<Option<Value>> {
        self.expect_state("continue", &[SessionState::StoppedAtBreakpoint])?;

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            thread_id: i64,
        }

        let args: Args = serde_json::from_value(request.arguments.clone())?;
        self.backend
            .resume(args.thread_id)
            .map_err(|err| DebugError::Backend(err.0))?;
        self.state = SessionState::Running;

        Ok(Some(json!({ "allThreadsContinued": false })))
    }

    fn threads(&mut self) -> DebugResult<Option<Value>> {
        let threads = self
            .backend
            .threads()
            .map_err(|err| DebugError::Backend(err.0))?;
        let threads: Vec<Value> = threads
            .into_iter()
            .map(|t| json!({ "id": t.id, "name": t.name }))
            .collect();
        Ok(Some(json!({ "threads": threads })))
    }

    fn stack_trace(&mut self, request: &Request) -> DebugResult<Option<Value>> {
        self.expect_state("stackTrace", &[SessionState::StoppedAtBreakpoint])?;

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            thread_id: i64,
        }

        let args: Args = serde_json::from_value(request.arguments.clone())?;
        let frames = self
            .backend
            .stack_trace(args.thread_id)
            .map_err(|err| DebugError::Backend(err.0))?;

        let total = frames.len();
        let frames: Vec<Value> = frames
            .into_iter()
            .map(|frame| {
                json!({
                    "id": frame.id,
                    "name": frame.name,
                    "source": frame.source.map(|name| json!({ "name": name })),
                    "line": frame.line,
                    "column": 1,
                })
            })
            .collect();

        Ok(Some(json!({ "stackFrames": frames, "totalFrames": total })))
    }

    fn scopes(&mut self, request: &Request) -> DebugResult<Option<Value>> {
        self.expect_state("scopes", &[SessionState::StoppedAtBreakpoint])?;

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            frame_id: i64,
        }

        let args: Args = serde_json::from_value(request.arguments.clone())?;
        let scopes = self
            .backend
            .scopes(args.frame_id)
            .map_err(|err| DebugError::Backend(err.0))?;
        let scopes: Vec<Value> = scopes
            .into_iter()
            .map(|scope| {
                json!({
                    "name": scope.name,
                    "variablesReference": scope.variables_reference,
                    "expensive": false,
                })
            })
            .collect();

        Ok(Some(json!({ "scopes": scopes })))
    }

    fn variables(&mut self, request: &Request) -> DebugResult<Option<Value>> {
        self.expect_state("variables", &[SessionState::StoppedAtBreakpoint])?;

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            variables_reference: i64,
        }

        let args: Args = serde_json::from_value(request.arguments.clone())?;
        let variables = self
            .backend
            .variables(args.variables_reference)
            .map_err(|err| DebugError::Backend(err.0))?;
        let variables: Vec<Value> = variables
            .into_iter()
            .map(|var| {
                json!({
                    "name": var.name,
                    "type": var.type_name,
                    "value": var.value,
                    "variablesReference": 0,
                })
            })
            .collect();

        Ok(Some(json!({ "variables": variables })))
    }

    fn evaluate(&mut self, request: &Request) -> DebugResult<Option<Value>> {
        self.expect_state("evaluate", &[SessionState::StoppedAtBreakpoint])?;

        let Some(class_loader) = self.debuggee.evaluation_class_loader() else {
            return Err(DebugError::EvaluationUnsupported);
        };

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            expression: String,
            frame_id: Option<i64>,
        }

        let args: Args = serde_json::from_value(request.arguments.clone())?;
        let Some(frame_id) = args.frame_id else {
            return Err(DebugError::Protocol(
                "evaluate requires a frameId".to_string(),
            ));
        };

        let evaluated = self
            .backend
            .evaluate(frame_id, &args.expression, class_loader)
            .map_err(|err| DebugError::Backend(err.0))?;

        Ok(Some(json!({
            "result": evaluated.result,
            "type": evaluated.type_name,
            "variablesReference": 0,
        })))
    }

    fn disconnect(&mut self, request: &Request) -> DebugResult<Option<Value>> {
        #[derive(Debug, Default, Deserialize)]
        struct Args {
            #[serde(default)]
            restart: bool,
        }

        let args: Args = if request.arguments.is_null() {
            Args::default()
        } else {
            serde_json::from_value(request.arguments.clone()).unwrap_or_default()
        };

        self.restart_requested = args.restart;
        if !args.restart {
            // Without restart intent the debuggee dies with the session.
            self.handle.cancel();
        }
        self.state = SessionState::Disconnecting;
        tracing::debug!(target: "kiln.dap", restart = args.restart, "client disconnected");
        Ok(None)
    }

    async fn emit_output(&mut self, writer: &mut DapWriter<OwnedWriteHalf>, line: &OutputLine) {
        let event = Event::new(
            self.alloc_seq(),
            "output",
            Some(json!({
                "category": line.category.as_dap_category(),
                "output": format!("{}\n", line.text),
            })),
        );
        let _ = writer.write_event(&event).await;
    }

    async fn emit_stopped(&mut self, writer: &mut DapWriter<OwnedWriteHalf>, stop: StopEvent) {
        if matches!(
            self.state,
            SessionState::Running | SessionState::StoppedAtBreakpoint
        ) {
            self.state = SessionState::StoppedAtBreakpoint;
            let event = Event::new(
                self.alloc_seq(),
                "stopped",
                Some(json!({
                    "reason": stop.reason.as_dap_reason(),
                    "threadId": stop.thread_id,
                    "allThreadsStopped": false,
                })),
            );
            let _ = writer.write_event(&event).await;
        }
    }

    async fn emit_exit_pair(
        &mut self,
        writer: &mut DapWriter<OwnedWriteHalf>,
        exit: &DebuggeeExit,
    ) {
        self.state = SessionState::Exited;
        let exited = Event::new(
            self.alloc_seq(),
            "exited",
            Some(json!({ "exitCode": exit.summary.code.unwrap_or(-1) })),
        );
        let _ = writer.write_event(&exited).await;

        self.state = SessionState::Terminated;
        let terminated = Event::new(self.alloc_seq(), "terminated", None);
        let _ = writer.write_event(&terminated).await;
    }

    async fn drain_output(
        &mut self,
        writer: &mut DapWriter<OwnedWriteHalf>,
        output_rx: &mut mpsc::UnboundedReceiver<OutputLine>,
    ) {
        while let Ok(line) = output_rx.try_recv() {
            self.emit_output(writer, &line).await;
        }
    }
}

fn launch_failure(exit: DebuggeeExit) -> DebugError {
    let message = exit.error.unwrap_or_else(|| {
        if exit.summary.cancelled {
            "debuggee was cancelled before it was ready".to_string()
        } else {
            "debuggee terminated before it was ready".to_string()
        }
    });
    DebugError::LaunchFailure(message)
}

/// Resolve once the debuggee's single terminal report is available; pends
/// forever if the execution is torn down without one (the session is then
/// closed through cancellation instead).
async fn wait_exit(rx: &mut watch::Receiver<Option<DebuggeeExit>>) -> DebuggeeExit {
    loop {
        if let Some(exit) = rx.borrow_and_update().clone() {
            return exit;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn read_requests(read_half: OwnedReadHalf, tx: mpsc::UnboundedSender<Request>) {
    let mut reader = DapReader::new(read_half);
    loop {
        match reader.read_request().await {
            Ok(Some(request)) => {
                if tx.send(request).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(target: "kiln.dap", error = %err, "request stream ended");
                break;
            }
        }
    }
}
