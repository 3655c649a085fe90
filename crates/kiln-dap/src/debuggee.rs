//! Debuggee execution: what is being debugged and how it is run.
//!
//! A [`Debuggee`] describes the thing under debug (launched main class,
//! attached remote process, or a test-suite run) and can be run exactly
//! once per debug server. The execution reports into a channel-backed
//! [`DebuggeeListener`] (ready signal, output lines, terminated) instead of
//! calling back on the runner's own task, so per-stream output order is
//! preserved without tying the execution to the session's protocol task.
//!
//! The terminated notification fires exactly once on every exit path
//! (normal exit, failure, cancellation). Dependents register cleanup solely
//! in reaction to it, so this is the most safety-critical property here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use kiln_process::{CommandSpec, ExitSummary, SpawnOptions};

use crate::jdwp_port::{PortPromise, PortScanner, Scanned};
use crate::output::{OutputCategory, OutputLine, OutputMultiplexer};

/// Tagged line prefix the in-JVM test harness writes for framework events.
/// `##kiln-test:started:<name>` / `##kiln-test:ignored:<name>`.
pub const TEST_EVENT_PREFIX: &str = "##kiln-test:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassPathKind {
    Directory,
    Jar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPathEntry {
    pub path: PathBuf,
    pub kind: ClassPathKind,
}

impl ClassPathEntry {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ClassPathKind::Directory,
        }
    }

    pub fn jar(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: ClassPathKind::Jar,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaRuntime {
    pub java_home: PathBuf,
    pub version: Option<String>,
}

/// Opaque handle the backend uses to compile expressions against the
/// debuggee's classpath. Its absence makes `evaluate` requests fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationClassLoader {
    pub class_path: Vec<PathBuf>,
}

/// Signal that the debuggee reached a debuggable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyInfo {
    pub host: String,
    /// The bound debug port, when one is known (always present for launch
    /// and attach modes; test harnesses may run without an agent).
    pub port: Option<u16>,
}

/// Terminal report for a debuggee execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggeeExit {
    pub summary: ExitSummary,
    /// The causal failure when the execution ended before reaching a
    /// debuggable state. Surfaced verbatim in the launch/attach response.
    pub error: Option<String>,
}

impl DebuggeeExit {
    pub fn cancelled() -> Self {
        Self {
            summary: ExitSummary {
                code: None,
                cancelled: true,
            },
            error: None,
        }
    }
}

struct ListenerInner {
    ready: watch::Sender<Option<ReadyInfo>>,
    exit: watch::Sender<Option<DebuggeeExit>>,
    output: Arc<OutputMultiplexer>,
    terminated_fired: AtomicBool,
}

/// Channel-backed sink a debuggee execution reports into.
#[derive(Clone)]
pub struct DebuggeeListener {
    inner: Arc<ListenerInner>,
}

/// The receiving side of a [`DebuggeeListener`], watched by sessions.
#[derive(Clone)]
pub struct DebuggeeSignals {
    pub ready: watch::Receiver<Option<ReadyInfo>>,
    pub exit: watch::Receiver<Option<DebuggeeExit>>,
}

impl DebuggeeListener {
    pub fn new(output: Arc<OutputMultiplexer>) -> (Self, DebuggeeSignals) {
        let (ready_tx, ready_rx) = watch::channel(None);
        let (exit_tx, exit_rx) = watch::channel(None);
        (
            Self {
                inner: Arc::new(ListenerInner {
                    ready: ready_tx,
                    exit: exit_tx,
                    output,
                    terminated_fired: AtomicBool::new(false),
                }),
            },
            DebuggeeSignals {
                ready: ready_rx,
                exit: exit_rx,
            },
        )
    }

    /// Report that the debuggee is ready to be debugged. Only the first
    /// call has an effect.
    pub fn on_ready(&self, info: ReadyInfo) {
        self.inner.ready.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(info);
            true
        });
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.borrow().is_some()
    }

    pub fn on_output(&self, line: OutputLine) {
        self.inner.output.append(line);
    }

    /// Report termination. Fires at most once; returns whether this call
    /// was the one that fired.
    pub fn on_terminated(&self, exit: DebuggeeExit) -> bool {
        if self.inner.terminated_fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.inner.exit.send(Some(exit));
        true
    }

    pub fn exit_signal(&self) -> watch::Receiver<Option<DebuggeeExit>> {
        self.inner.exit.subscribe()
    }
}

/// Cancellable handle to a running debuggee execution.
#[derive(Clone)]
pub struct DebuggeeHandle {
    cancel: CancellationToken,
    exit: watch::Receiver<Option<DebuggeeExit>>,
}

impl DebuggeeHandle {
    pub fn new(cancel: CancellationToken, listener: &DebuggeeListener) -> Self {
        Self {
            cancel,
            exit: listener.exit_signal(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the execution's single terminal report.
    pub async fn wait(&self) -> DebuggeeExit {
        let mut rx = self.exit.clone();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Listener dropped without terminating; only reachable when
                // the whole server is being torn down.
                return DebuggeeExit::cancelled();
            }
        }
    }
}

/// The thing being debugged. Owned by the debug server for its entire
/// lifetime; `run` is called at most once per server instance.
pub trait Debuggee: Send + Sync + 'static {
    /// Diagnostic label.
    fn name(&self) -> &str;

    fn class_path_entries(&self) -> &[ClassPathEntry];

    fn java_runtime(&self) -> Option<&JavaRuntime>;

    fn evaluation_class_loader(&self) -> Option<&EvaluationClassLoader>;

    /// Start the execution, reporting into `listener`. Cancelling the
    /// returned handle terminates the execution; the listener receives its
    /// terminated notification on every exit path.
    fn run(&self, listener: DebuggeeListener) -> DebuggeeHandle;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub main_class: String,
    pub args: Vec<String>,
    pub jvm_options: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Suspend the JVM until the backend attaches.
    pub suspend: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSelection {
    pub suite: String,
    /// Specific test cases within the suite; empty runs the whole suite.
    pub tests: Vec<String>,
}

impl TestSelection {
    fn as_arg(&self) -> String {
        if self.tests.is_empty() {
            self.suite.clone()
        } else {
            format!("{}#{}", self.suite, self.tests.join(","))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSuiteSpec {
    pub runner_main_class: String,
    pub selections: Vec<TestSelection>,
    pub jvm_options: Vec<String>,
    pub env: Vec<(String, String)>,
}

pub struct AttachSpec {
    pub host: String,
    pub port: AttachPort,
}

pub enum AttachPort {
    Fixed(u16),
    /// Resolved by scanning the remote process's log stream for the JDWP
    /// banner; the build layer owns that stream and hands us the promise.
    Discovered(Mutex<Option<PortPromise>>),
}

enum DebuggeeCommand {
    Launch(LaunchSpec),
    Attach(AttachSpec),
    TestSuite(TestSuiteSpec),
}

/// Production [`Debuggee`]: one constructor per mode.
pub struct JavaDebuggee {
    name: String,
    class_path: Vec<ClassPathEntry>,
    java_runtime: Option<JavaRuntime>,
    evaluation_class_loader: Option<EvaluationClassLoader>,
    command: DebuggeeCommand,
}

impl JavaDebuggee {
    pub fn launch(name: impl Into<String>, class_path: Vec<ClassPathEntry>, spec: LaunchSpec) -> Self {
        Self {
            name: name.into(),
            class_path,
            java_runtime: None,
            evaluation_class_loader: None,
            command: DebuggeeCommand::Launch(spec),
        }
    }

    pub fn attach(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            class_path: Vec::new(),
            java_runtime: None,
            evaluation_class_loader: None,
            command: DebuggeeCommand::Attach(AttachSpec {
                host: host.into(),
                port: AttachPort::Fixed(port),
            }),
        }
    }

    pub fn attach_discovered(
        name: impl Into<String>,
        host: impl Into<String>,
        promise: PortPromise,
    ) -> Self {
        Self {
            name: name.into(),
            class_path: Vec::new(),
            java_runtime: None,
            evaluation_class_loader: None,
            command: DebuggeeCommand::Attach(AttachSpec {
                host: host.into(),
                port: AttachPort::Discovered(Mutex::new(Some(promise))),
            }),
        }
    }

    pub fn test_suite(
        name: impl Into<String>,
        class_path: Vec<ClassPathEntry>,
        spec: TestSuiteSpec,
    ) -> Self {
        Self {
            name: name.into(),
            class_path,
            java_runtime: None,
            evaluation_class_loader: None,
            command: DebuggeeCommand::TestSuite(spec),
        }
    }

    pub fn with_java_runtime(mut self, runtime: JavaRuntime) -> Self {
        self.java_runtime = Some(runtime);
        self
    }

    pub fn with_evaluation_class_loader(mut self, loader: EvaluationClassLoader) -> Self {
        self.evaluation_class_loader = Some(loader);
        self
    }

    fn java_binary(&self) -> PathBuf {
        match &self.java_runtime {
            Some(runtime) => runtime.java_home.join("bin").join("java"),
            None => PathBuf::from("java"),
        }
    }

    fn class_path_arg(&self) -> Option<String> {
        if self.class_path.is_empty() {
            return None;
        }
        let sep = if cfg!(windows) { ";" } else { ":" };
        Some(
            self.class_path
                .iter()
                .map(|entry| entry.path.display().to_string())
                .collect::<Vec<_>>()
                .join(sep),
        )
    }

    fn java_command(
        &self,
        jvm_options: &[String],
        main_class: &str,
        args: &[String],
        env: &[(String, String)],
        suspend: bool,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(self.java_binary()).arg(format!(
            "-agentlib:jdwp=transport=dt_socket,server=y,suspend={},address=0",
            if suspend { "y" } else { "n" }
        ));
        spec = spec.args(jvm_options.iter().cloned());
        if let Some(class_path) = self.class_path_arg() {
            spec = spec.arg("-cp").arg(class_path);
        }
        spec = spec.arg(main_class).args(args.iter().cloned());
        for (key, value) in env {
            spec = spec.env(key.clone(), value.clone());
        }
        spec
    }
}

impl Debuggee for JavaDebuggee {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_path_entries(&self) -> &[ClassPathEntry] {
        &self.class_path
    }

    fn java_runtime(&self) -> Option<&JavaRuntime> {
        self.java_runtime.as_ref()
    }

    fn evaluation_class_loader(&self) -> Option<&EvaluationClassLoader> {
        self.evaluation_class_loader.as_ref()
    }

    fn run(&self, listener: DebuggeeListener) -> DebuggeeHandle {
        let cancel = CancellationToken::new();
        let handle = DebuggeeHandle::new(cancel.clone(), &listener);

        match &self.command {
            DebuggeeCommand::Launch(spec) => {
                let command = self.java_command(
                    &spec.jvm_options,
                    &spec.main_class,
                    &spec.args,
                    &spec.env,
                    spec.suspend,
                );
                spawn_process_execution(self.name.clone(), command, listener, cancel, false);
            }
            DebuggeeCommand::TestSuite(spec) => {
                let args: Vec<String> = spec.selections.iter().map(TestSelection::as_arg).collect();
                let command = self.java_command(
                    &spec.jvm_options,
                    &spec.runner_main_class,
                    &args,
                    &spec.env,
                    true,
                );
                spawn_process_execution(self.name.clone(), command, listener, cancel, true);
            }
            DebuggeeCommand::Attach(spec) => {
                let promise = match &spec.port {
                    AttachPort::Fixed(port) => Err(*port),
                    AttachPort::Discovered(promise) => Ok(promise.lock().take()),
                };
                spawn_attach_execution(spec.host.clone(), promise, listener, cancel);
            }
        }

        handle
    }
}

/// Framework-level test event, forwarded to the client as a debug-log line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TestEvent {
    Started(String),
    Ignored(String),
}

impl TestEvent {
    fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix(TEST_EVENT_PREFIX)?;
        let (kind, name) = rest.split_once(':')?;
        match kind {
            "started" => Some(TestEvent::Started(name.to_string())),
            "ignored" => Some(TestEvent::Ignored(name.to_string())),
            _ => None,
        }
    }

    fn as_debug_line(&self) -> String {
        match self {
            TestEvent::Started(name) => format!("Test started: {name}"),
            TestEvent::Ignored(name) => format!("Test ignored: {name}"),
        }
    }
}

fn spawn_process_execution(
    name: String,
    command: CommandSpec,
    listener: DebuggeeListener,
    cancel: CancellationToken,
    test_mode: bool,
) {
    tokio::spawn(async move {
        let exit = run_process_execution(&name, command, &listener, &cancel, test_mode).await;
        listener.on_terminated(exit);
    });
}

async fn run_process_execution(
    name: &str,
    command: CommandSpec,
    listener: &DebuggeeListener,
    cancel: &CancellationToken,
    test_mode: bool,
) -> DebuggeeExit {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    let (mut scanner, _port) = PortScanner::new();

    let proc_cancel = cancel.clone();
    let proc_task = tokio::spawn(async move {
        kiln_process::spawn_streamed(&command, line_tx, proc_cancel, SpawnOptions::default()).await
    });

    // The channel closes once the process has exited and both streams are
    // drained, so every line is handled before the terminal report below.
    while let Some(line) = line_rx.recv().await {
        match scanner.scan(&line.text) {
            Scanned::Banner(port) => {
                tracing::debug!(target: "kiln.dap", port, debuggee = name, "debug agent listening");
                listener.on_ready(ReadyInfo {
                    host: "127.0.0.1".to_string(),
                    port: Some(port),
                });
            }
            Scanned::PassThrough => {
                if test_mode {
                    if let Some(event) = TestEvent::parse(&line.text) {
                        listener.on_output(OutputLine::new(
                            OutputCategory::Console,
                            event.as_debug_line(),
                        ));
                        continue;
                    }
                }
                listener.on_output(OutputLine::new(line.stream.into(), line.text));
            }
        }
    }

    match proc_task.await {
        Ok(Ok(summary)) => {
            let error = if !summary.cancelled && !listener.is_ready() {
                let code = summary
                    .code
                    .map_or_else(|| "killed by signal".to_string(), |c| format!("code {c}"));
                Some(format!(
                    "{name} terminated ({code}) before the debug agent was ready"
                ))
            } else {
                None
            };
            DebuggeeExit { summary, error }
        }
        Ok(Err(err)) => DebuggeeExit {
            summary: ExitSummary {
                code: None,
                cancelled: cancel.is_cancelled(),
            },
            error: Some(format!("failed to run {name}: {err}")),
        },
        Err(join_err) => DebuggeeExit {
            summary: ExitSummary {
                code: None,
                cancelled: cancel.is_cancelled(),
            },
            error: Some(format!("{name} execution panicked: {join_err}")),
        },
    }
}

fn spawn_attach_execution(
    host: String,
    port: Result<Option<PortPromise>, u16>,
    listener: DebuggeeListener,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        match port {
            Err(port) => listener.on_ready(ReadyInfo {
                host: host.clone(),
                port: Some(port),
            }),
            Ok(Some(promise)) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        listener.on_terminated(DebuggeeExit::cancelled());
                        return;
                    }
                    resolved = promise.resolved() => match resolved {
                        Ok(port) => listener.on_ready(ReadyInfo {
                            host: host.clone(),
                            port: Some(port),
                        }),
                        Err(_) => {
                            listener.on_terminated(DebuggeeExit {
                                summary: ExitSummary { code: None, cancelled: false },
                                error: Some(
                                    "log stream ended before the debug port was announced"
                                        .to_string(),
                                ),
                            });
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                // `run` is called once per server; a second call would find
                // the promise already taken.
                listener.on_terminated(DebuggeeExit {
                    summary: ExitSummary {
                        code: None,
                        cancelled: false,
                    },
                    error: Some("attach target was already consumed".to_string()),
                });
                return;
            }
        }

        // We do not own the remote process; the execution completes when
        // the server cancels it.
        cancel.cancelled().await;
        listener.on_terminated(DebuggeeExit::cancelled());
    });
}
