//! End-to-end lifecycle tests: a scripted debuggee and backend behind a
//! real TCP server, driven by a minimal protocol client.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use kiln_dap::backend::{
    BackendError, DebugBackend, Evaluated, ScopeInfo, StackFrame, StopEvent, StopReason,
    ThreadInfo, VariableInfo,
};
use kiln_dap::dap::{DapReader, DapWriter, Event, Request, Response};
use kiln_dap::debuggee::{
    Debuggee, DebuggeeExit, DebuggeeHandle, DebuggeeListener, EvaluationClassLoader, ReadyInfo,
};
use kiln_dap::output::{OutputCategory, OutputLine};
use kiln_dap::{DebugServer, DebugServerConfig, DebugServerHandle, DetachedBackend};
use kiln_process::ExitSummary;

// ---------------------------------------------------------------------------
// scripted debuggee

enum MockCommand {
    Ready(Option<u16>),
    Line(String),
    Exit(i32),
    Fail(String),
}

struct MockDebuggee {
    commands: Mutex<Option<mpsc::UnboundedReceiver<MockCommand>>>,
    cancelled: Arc<AtomicBool>,
    class_loader: Option<EvaluationClassLoader>,
}

#[derive(Clone)]
struct MockControl {
    tx: mpsc::UnboundedSender<MockCommand>,
    cancelled: Arc<AtomicBool>,
}

impl MockDebuggee {
    fn new(class_loader: Option<EvaluationClassLoader>) -> (Arc<Self>, MockControl) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let debuggee = Arc::new(Self {
            commands: Mutex::new(Some(rx)),
            cancelled: cancelled.clone(),
            class_loader,
        });
        (debuggee, MockControl { tx, cancelled })
    }
}

impl MockControl {
    fn ready(&self, port: Option<u16>) {
        let _ = self.tx.send(MockCommand::Ready(port));
    }

    fn line(&self, text: &str) {
        let _ = self.tx.send(MockCommand::Line(text.to_string()));
    }

    fn exit(&self, code: i32) {
        let _ = self.tx.send(MockCommand::Exit(code));
    }

    fn fail(&self, message: &str) {
        let _ = self.tx.send(MockCommand::Fail(message.to_string()));
    }

    fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Debuggee for MockDebuggee {
    fn name(&self) -> &str {
        "mock"
    }

    fn class_path_entries(&self) -> &[kiln_dap::debuggee::ClassPathEntry] {
        &[]
    }

    fn java_runtime(&self) -> Option<&kiln_dap::debuggee::JavaRuntime> {
        None
    }

    fn evaluation_class_loader(&self) -> Option<&EvaluationClassLoader> {
        self.class_loader.as_ref()
    }

    fn run(&self, listener: DebuggeeListener) -> DebuggeeHandle {
        let cancel = CancellationToken::new();
        let handle = DebuggeeHandle::new(cancel.clone(), &listener);
        let mut commands = self.commands.lock().take().expect("run called twice");
        let cancelled = self.cancelled.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        cancelled.store(true, Ordering::SeqCst);
                        listener.on_terminated(DebuggeeExit::cancelled());
                        return;
                    }
                    command = commands.recv() => match command {
                        Some(MockCommand::Ready(port)) => {
                            listener.on_ready(ReadyInfo {
                                host: "127.0.0.1".to_string(),
                                port,
                            });
                        }
                        Some(MockCommand::Line(text)) => {
                            listener.on_output(OutputLine::new(OutputCategory::Stdout, text));
                        }
                        Some(MockCommand::Exit(code)) => {
                            listener.on_terminated(DebuggeeExit {
                                summary: ExitSummary {
                                    code: Some(code),
                                    cancelled: false,
                                },
                                error: None,
                            });
                            return;
                        }
                        Some(MockCommand::Fail(message)) => {
                            listener.on_terminated(DebuggeeExit {
                                summary: ExitSummary {
                                    code: None,
                                    cancelled: false,
                                },
                                error: Some(message),
                            });
                            return;
                        }
                        None => return,
                    }
                }
            }
        });

        handle
    }
}

// ---------------------------------------------------------------------------
// scripted backend

struct ScriptedBackend {
    stops: broadcast::Sender<StopEvent>,
    attached: Mutex<Option<(String, u16)>>,
    resumed: Mutex<Vec<i64>>,
    verified_lines: Vec<u32>,
}

impl ScriptedBackend {
    fn new(verified_lines: Vec<u32>) -> Arc<Self> {
        let (stops, _) = broadcast::channel(16);
        Arc::new(Self {
            stops,
            attached: Mutex::new(None),
            resumed: Mutex::new(Vec::new()),
            verified_lines,
        })
    }

    fn emit_stop(&self, thread_id: i64, reason: StopReason) {
        let _ = self.stops.send(StopEvent { thread_id, reason });
    }

    fn resumed(&self) -> Vec<i64> {
        self.resumed.lock().clone()
    }

    fn attached(&self) -> Option<(String, u16)> {
        self.attached.lock().clone()
    }
}

impl DebugBackend for ScriptedBackend {
    fn attach(&self, host: &str, port: u16) -> Result<(), BackendError> {
        *self.attached.lock() = Some((host.to_string(), port));
        Ok(())
    }

    fn set_breakpoints(
        &self,
        _source: &std::path::Path,
        lines: &[u32],
    ) -> Result<Vec<bool>, BackendError> {
        Ok(lines
            .iter()
            .map(|line| self.verified_lines.contains(line))
            .collect())
    }

    fn resume(&self, thread_id: i64) -> Result<(), BackendError> {
        self.resumed.lock().push(thread_id);
        Ok(())
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>, BackendError> {
        Ok(vec![ThreadInfo {
            id: 1,
            name: "main".to_string(),
        }])
    }

    fn stack_trace(&self, thread_id: i64) -> Result<Vec<StackFrame>, BackendError> {
        Ok(vec![StackFrame {
            id: thread_id * 100,
            name: "Main.main".to_string(),
            source: Some("Main.java".to_string()),
            line: 3,
        }])
    }

    fn scopes(&self, frame_id: i64) -> Result<Vec<ScopeInfo>, BackendError> {
        Ok(vec![ScopeInfo {
            name: "Locals".to_string(),
            variables_reference: frame_id + 1,
        }])
    }

    fn variables(&self, _variables_reference: i64) -> Result<Vec<VariableInfo>, BackendError> {
        Ok(vec![VariableInfo {
            name: "greeting".to_string(),
            type_name: Some("java.lang.String".to_string()),
            value: "\"foo\"".to_string(),
        }])
    }

    fn evaluate(
        &self,
        _frame_id: i64,
        expression: &str,
        _class_loader: &EvaluationClassLoader,
    ) -> Result<Evaluated, BackendError> {
        if expression == "greeting" {
            Ok(Evaluated {
                type_name: Some("String".to_string()),
                result: "\"foo\"".to_string(),
            })
        } else {
            Err(BackendError(format!("cannot resolve `{expression}`")))
        }
    }

    fn subscribe_stops(&self) -> broadcast::Receiver<StopEvent> {
        self.stops.subscribe()
    }
}

// ---------------------------------------------------------------------------
// protocol test client

struct TestClient {
    reader: DapReader<OwnedReadHalf>,
    writer: DapWriter<OwnedWriteHalf>,
    next_seq: i64,
    pending_events: VecDeque<Event>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, write) = stream.into_split();
        Self {
            reader: DapReader::new(read),
            writer: DapWriter::new(write),
            next_seq: 1,
            pending_events: VecDeque::new(),
        }
    }

    async fn send(&mut self, command: &str, arguments: Value) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.writer
            .write_request(&Request::new(seq, command, arguments))
            .await
            .expect("write request");
        seq
    }

    async fn response_for(&mut self, seq: i64) -> Response {
        loop {
            let value = self
                .reader
                .read_value()
                .await
                .expect("read")
                .expect("stream ended while waiting for a response");
            match value["type"].as_str() {
                Some("response") => {
                    let response: Response = serde_json::from_value(value).expect("response");
                    if response.request_seq == seq {
                        return response;
                    }
                }
                Some("event") => {
                    self.pending_events
                        .push_back(serde_json::from_value(value).expect("event"));
                }
                _ => {}
            }
        }
    }

    async fn request(&mut self, command: &str, arguments: Value) -> Response {
        let seq = self.send(command, arguments).await;
        self.response_for(seq).await
    }

    /// Next event, reading past anything else. `None` on EOF.
    async fn next_event(&mut self) -> Option<Event> {
        if let Some(event) = self.pending_events.pop_front() {
            return Some(event);
        }
        loop {
            let value = self.reader.read_value().await.expect("read")?;
            if value["type"] == "event" {
                return Some(serde_json::from_value(value).expect("event"));
            }
        }
    }

    async fn event_named(&mut self, name: &str) -> Event {
        loop {
            match self.next_event().await {
                Some(event) if event.event == name => return event,
                Some(_) => continue,
                None => panic!("stream ended while waiting for `{name}` event"),
            }
        }
    }

    /// Everything remaining on the wire, until the server's EOF.
    async fn drain_events(&mut self) -> Vec<Event> {
        let mut events: Vec<Event> = self.pending_events.drain(..).collect();
        while let Ok(Some(value)) = self.reader.read_value().await {
            if value["type"] == "event" {
                events.push(serde_json::from_value(value).expect("event"));
            }
        }
        events
    }
}

// ---------------------------------------------------------------------------
// harness

fn short_config() -> DebugServerConfig {
    DebugServerConfig {
        grace_period: Duration::from_secs(5),
        launch_timeout: Duration::from_secs(2),
        auto_close_session: true,
    }
}

async fn start_server(
    debuggee: Arc<dyn Debuggee>,
    backend: Arc<dyn DebugBackend>,
    config: DebugServerConfig,
) -> DebugServerHandle {
    DebugServer::bind("127.0.0.1", 0, debuggee, backend, config)
        .await
        .expect("bind")
        .start()
}

async fn closed_within(handle: &DebugServerHandle, bound: Duration) {
    tokio::time::timeout(bound, handle.closed())
        .await
        .expect("server did not close in time");
}

async fn handshake(client: &mut TestClient) {
    let response = client.request("initialize", json!({"adapterID": "kiln"})).await;
    assert!(response.success);
    client.event_named("initialized").await;
}

// ---------------------------------------------------------------------------
// tests

#[tokio::test]
async fn a_clean_run_emits_output_then_exited_then_terminated_then_eof() {
    let (debuggee, control) = MockDebuggee::new(None);
    let handle = start_server(debuggee, Arc::new(DetachedBackend::new()), short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;

    control.ready(Some(5005));
    assert!(client.request("launch", json!({})).await.success);
    assert!(client.request("configurationDone", json!({})).await.success);

    control.line("Hello, World!");
    control.exit(0);

    let events: Vec<Event> = client
        .drain_events()
        .await
        .into_iter()
        .filter(|event| event.event != "initialized")
        .collect();

    let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(kinds, ["output", "exited", "terminated"]);

    let output = events[0].body.as_ref().unwrap();
    assert_eq!(output["category"], "stdout");
    assert_eq!(output["output"], "Hello, World!\n");
    assert_eq!(events[1].body.as_ref().unwrap()["exitCode"], 0);

    closed_within(&handle, Duration::from_secs(5)).await;
    assert_eq!(handle.output().captured_text(), "Hello, World!");
}

#[tokio::test]
async fn server_cancel_closes_the_socket_without_the_event_pair() {
    let (debuggee, control) = MockDebuggee::new(None);
    let handle = start_server(debuggee, Arc::new(DetachedBackend::new()), short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;

    handle.cancel();

    let events = client.drain_events().await;
    assert!(events.iter().all(|e| e.event != "exited" && e.event != "terminated"));

    closed_within(&handle, Duration::from_secs(5)).await;
    assert!(control.was_cancelled());
}

#[tokio::test]
async fn a_second_connection_stalls_until_the_first_session_ends() {
    let (debuggee, _control) = MockDebuggee::new(None);
    let handle = start_server(debuggee, Arc::new(DetachedBackend::new()), short_config()).await;

    let mut first = TestClient::connect(handle.local_addr()).await;
    handshake(&mut first).await;

    // The second connection completes at the TCP level but its handshake
    // gets no reply while the first session is active.
    let mut second = TestClient::connect(handle.local_addr()).await;
    let seq = second.send("initialize", json!({"adapterID": "kiln"})).await;
    let stalled = tokio::time::timeout(Duration::from_millis(300), second.response_for(seq)).await;
    assert!(stalled.is_err(), "second session was admitted too early");

    assert!(first.request("disconnect", json!({"restart": true})).await.success);
    assert!(first.next_event().await.is_none());

    // Now the server accepts the queued connection and answers.
    let response = tokio::time::timeout(Duration::from_secs(2), second.response_for(seq))
        .await
        .expect("second session was never admitted");
    assert!(response.success);

    assert!(second.request("disconnect", json!({"restart": false})).await.success);
    closed_within(&handle, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn restart_handoff_keeps_the_debuggee_running_across_sessions() {
    let (debuggee, control) = MockDebuggee::new(None);
    let handle = start_server(debuggee, Arc::new(DetachedBackend::new()), short_config()).await;

    let mut first = TestClient::connect(handle.local_addr()).await;
    handshake(&mut first).await;
    control.ready(Some(5005));
    assert!(first.request("launch", json!({})).await.success);
    assert!(first.request("configurationDone", json!({})).await.success);

    control.line("before restart");
    let output = first.event_named("output").await;
    assert_eq!(output.body.unwrap()["output"], "before restart\n");

    assert!(first.request("disconnect", json!({"restart": true})).await.success);
    assert!(first.next_event().await.is_none());
    assert!(!control.was_cancelled());

    // Output produced between sessions is queued for the next one.
    control.line("after restart");

    let mut second = TestClient::connect(handle.local_addr()).await;
    handshake(&mut second).await;
    // The debuggee is already ready, so launch resolves immediately.
    assert!(second.request("launch", json!({})).await.success);
    assert!(second.request("configurationDone", json!({})).await.success);

    let output = second.event_named("output").await;
    assert_eq!(output.body.unwrap()["output"], "after restart\n");

    control.exit(0);
    second.event_named("exited").await;
    second.event_named("terminated").await;

    closed_within(&handle, Duration::from_secs(5)).await;
    assert_eq!(
        handle.output().captured_text(),
        "before restart\nafter restart"
    );
}

#[tokio::test]
async fn an_expired_restart_window_cancels_the_debuggee_and_closes() {
    let (debuggee, control) = MockDebuggee::new(None);
    let config = DebugServerConfig {
        grace_period: Duration::from_millis(200),
        ..short_config()
    };
    let handle = start_server(debuggee, Arc::new(DetachedBackend::new()), config).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;
    control.ready(Some(5005));
    assert!(client.request("launch", json!({})).await.success);
    assert!(client.request("disconnect", json!({"restart": true})).await.success);
    assert!(client.next_event().await.is_none());

    closed_within(&handle, Duration::from_secs(5)).await;
    assert!(control.was_cancelled());
}

#[tokio::test]
async fn disconnect_without_restart_intent_cancels_the_debuggee() {
    let (debuggee, control) = MockDebuggee::new(None);
    let handle = start_server(debuggee, Arc::new(DetachedBackend::new()), short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;
    control.ready(Some(5005));
    assert!(client.request("launch", json!({})).await.success);

    assert!(client.request("disconnect", json!({"restart": false})).await.success);
    assert!(client.next_event().await.is_none());

    closed_within(&handle, Duration::from_secs(5)).await;
    assert!(control.was_cancelled());
}

#[tokio::test]
async fn set_breakpoints_reports_per_line_verification() {
    let (debuggee, control) = MockDebuggee::new(None);
    let backend = ScriptedBackend::new(vec![3, 10]);
    let handle = start_server(debuggee, backend, short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;
    control.ready(Some(5005));
    assert!(client.request("launch", json!({})).await.success);

    let response = client
        .request(
            "setBreakpoints",
            json!({
                "source": {"path": "/work/src/Main.java"},
                "breakpoints": [{"line": 3}, {"line": 7}, {"line": 10}],
            }),
        )
        .await;
    assert!(response.success);

    let breakpoints = response.body.unwrap()["breakpoints"].clone();
    assert_eq!(
        breakpoints,
        json!([
            {"line": 3, "verified": true},
            {"line": 7, "verified": false},
            {"line": 10, "verified": true},
        ])
    );

    assert!(client.request("disconnect", json!({})).await.success);
    closed_within(&handle, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn stop_events_and_continue_drive_the_running_stopped_walk() {
    let (debuggee, control) = MockDebuggee::new(None);
    let backend = ScriptedBackend::new(vec![3]);
    let handle = start_server(debuggee, backend.clone(), short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;
    control.ready(Some(6006));
    assert!(client.request("launch", json!({})).await.success);
    assert_eq!(backend.attached(), Some(("127.0.0.1".to_string(), 6006)));
    assert!(client.request("configurationDone", json!({})).await.success);

    let walk = [
        "Breakpoint in main method",
        "Breakpoint in hello class",
        "Breakpoint in hello inner class",
        "Breakpoint in hello object",
        "Breakpoint in hello java class constructor",
        "Breakpoint in hello java greet method",
        "Finished all breakpoints",
    ];
    for text in walk {
        control.line(text);
        let output = client.event_named("output").await;
        assert_eq!(output.body.unwrap()["output"], format!("{text}\n"));

        backend.emit_stop(1, StopReason::Breakpoint);
        let stopped = client.event_named("stopped").await;
        let body = stopped.body.unwrap();
        assert_eq!(body["reason"], "breakpoint");
        assert_eq!(body["threadId"], 1);

        let response = client.request("continue", json!({"threadId": 1})).await;
        assert!(response.success);
        assert_eq!(response.body.unwrap()["allThreadsContinued"], false);
    }
    assert_eq!(backend.resumed(), vec![1; 7]);

    control.exit(0);
    client.event_named("exited").await;
    client.event_named("terminated").await;

    closed_within(&handle, Duration::from_secs(5)).await;
    assert_eq!(handle.output().captured_text(), walk.join("\n"));
}

#[tokio::test]
async fn inspection_requests_work_while_stopped() {
    let (debuggee, control) = MockDebuggee::new(None);
    let backend = ScriptedBackend::new(vec![3]);
    let handle = start_server(debuggee, backend.clone(), short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;
    control.ready(Some(6006));
    assert!(client.request("launch", json!({})).await.success);
    assert!(client.request("configurationDone", json!({})).await.success);

    backend.emit_stop(1, StopReason::Breakpoint);
    client.event_named("stopped").await;

    let threads = client.request("threads", json!({})).await;
    assert_eq!(threads.body.unwrap()["threads"], json!([{"id": 1, "name": "main"}]));

    let frames = client.request("stackTrace", json!({"threadId": 1})).await;
    let frames = frames.body.unwrap();
    assert_eq!(frames["totalFrames"], 1);
    assert_eq!(frames["stackFrames"][0]["name"], "Main.main");
    assert_eq!(frames["stackFrames"][0]["line"], 3);

    let scopes = client.request("scopes", json!({"frameId": 100})).await;
    assert_eq!(scopes.body.unwrap()["scopes"][0]["variablesReference"], 101);

    let variables = client
        .request("variables", json!({"variablesReference": 101}))
        .await;
    let variables = variables.body.unwrap();
    assert_eq!(variables["variables"][0]["name"], "greeting");
    assert_eq!(variables["variables"][0]["value"], "\"foo\"");

    assert!(client.request("disconnect", json!({})).await.success);
    closed_within(&handle, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn evaluate_returns_a_typed_result_while_stopped() {
    let loader = EvaluationClassLoader {
        class_path: vec!["/work/classes".into()],
    };
    let (debuggee, control) = MockDebuggee::new(Some(loader));
    let backend = ScriptedBackend::new(vec![3]);
    let handle = start_server(debuggee, backend.clone(), short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;
    control.ready(Some(6006));
    assert!(client.request("launch", json!({})).await.success);
    assert!(client.request("configurationDone", json!({})).await.success);

    backend.emit_stop(1, StopReason::Breakpoint);
    client.event_named("stopped").await;

    let response = client
        .request("evaluate", json!({"expression": "greeting", "frameId": 100}))
        .await;
    assert!(response.success);
    let body = response.body.unwrap();
    assert_eq!(body["result"], "\"foo\"");
    assert_eq!(body["type"], "String");

    assert!(client.request("disconnect", json!({})).await.success);
    closed_within(&handle, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn evaluate_without_a_class_loader_is_rejected() {
    let (debuggee, control) = MockDebuggee::new(None);
    let backend = ScriptedBackend::new(vec![3]);
    let handle = start_server(debuggee, backend.clone(), short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;
    control.ready(Some(6006));
    assert!(client.request("launch", json!({})).await.success);
    assert!(client.request("configurationDone", json!({})).await.success);

    backend.emit_stop(1, StopReason::Breakpoint);
    client.event_named("stopped").await;

    let response = client
        .request("evaluate", json!({"expression": "greeting", "frameId": 100}))
        .await;
    assert!(!response.success);
    assert!(response
        .message
        .unwrap()
        .contains("evaluation is not supported"));

    assert!(client.request("disconnect", json!({})).await.success);
    closed_within(&handle, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn evaluate_outside_a_stop_is_an_invalid_state() {
    let (debuggee, control) = MockDebuggee::new(None);
    let handle = start_server(debuggee, Arc::new(DetachedBackend::new()), short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;
    control.ready(Some(5005));
    assert!(client.request("launch", json!({})).await.success);
    assert!(client.request("configurationDone", json!({})).await.success);

    let response = client
        .request("evaluate", json!({"expression": "1 + 1", "frameId": 1}))
        .await;
    assert!(!response.success);
    assert!(response.message.unwrap().contains("not valid while running"));

    assert!(client.request("disconnect", json!({})).await.success);
    closed_within(&handle, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn launch_fails_when_the_debuggee_is_never_ready() {
    let (debuggee, _control) = MockDebuggee::new(None);
    let config = DebugServerConfig {
        launch_timeout: Duration::from_millis(200),
        ..short_config()
    };
    let handle = start_server(debuggee, Arc::new(DetachedBackend::new()), config).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;

    let response = client.request("launch", json!({})).await;
    assert!(!response.success);
    assert!(response.message.unwrap().contains("not ready within"));

    assert!(client.request("disconnect", json!({})).await.success);
    closed_within(&handle, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn launch_failure_surfaces_the_debuggee_cause() {
    let (debuggee, control) = MockDebuggee::new(None);
    let handle = start_server(debuggee, Arc::new(DetachedBackend::new()), short_config()).await;

    let mut client = TestClient::connect(handle.local_addr()).await;
    handshake(&mut client).await;

    // Fail while the launch is waiting for readiness; the cause must come
    // back verbatim on the launch response.
    let seq = client.send("launch", json!({})).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    control.fail("failed to run mock: java: command not found");

    let response = client.response_for(seq).await;
    assert!(!response.success);
    assert!(response.message.unwrap().contains("command not found"));
}
