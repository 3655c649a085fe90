//! Cancellable child-process execution with streamed output.
//!
//! JVM debuggees are chatty and long-lived. Buffering their whole
//! stdout/stderr in memory (as `Command::output()` does) is both an OOM
//! hazard and useless for a debug session, which needs every line as soon
//! as it is produced. This crate spawns a child in its own process group,
//! forwards each output line into a channel tagged with its stream, and
//! tears the whole process tree down when the cancellation token fires.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

pub use tokio_util::sync::CancellationToken;

/// Which of the child's standard streams a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// One line of child output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// A full command invocation (cwd + program + args + extra environment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: Option<PathBuf>,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            cwd: None,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // We keep quoting simple; the goal is human-readable debugging output,
        // not round-trippable shell snippets.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// How a child execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSummary {
    /// The exit code, when the child exited normally. `None` when it was
    /// killed by a signal or never reached `exec`.
    pub code: Option<i32>,
    /// Set when the execution was ended by the cancellation token rather
    /// than by the child itself.
    pub cancelled: bool,
}

impl ExitSummary {
    pub fn success(self) -> bool {
        !self.cancelled && self.code == Some(0)
    }
}

/// Options controlling child execution.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// How long to wait after sending a graceful termination signal before
    /// force-killing the process tree.
    pub kill_grace: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// Spawn `spec` and stream every stdout/stderr line into `sink`.
///
/// Lines are delivered in per-stream order. The future resolves once the
/// child has exited and both streams have been drained, so the final lines
/// are always in the channel before the exit summary is observable. When
/// `cancel` fires, the whole process tree is terminated (SIGTERM, a bounded
/// grace period, then SIGKILL) and the summary reports `cancelled: true`.
pub async fn spawn_streamed(
    spec: &CommandSpec,
    sink: mpsc::UnboundedSender<OutputLine>,
    cancel: CancellationToken,
    opts: SpawnOptions,
) -> io::Result<ExitSummary> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    // Put the child into its own process group on Unix so cancellation can
    // kill the whole process tree (wrapper scripts spawning a JVM child that
    // would otherwise keep the output pipes open).
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            // This is executed after `fork` in the child process.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    tracing::debug!(target: "kiln.process", command = %spec, "spawned child process");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

    let stdout_task = tokio::spawn(forward_lines(stdout, StreamKind::Stdout, sink.clone()));
    let stderr_task = tokio::spawn(forward_lines(stderr, StreamKind::Stderr, sink));

    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            cancelled = true;
            terminate_process_tree(&mut child, opts.kill_grace).await?
        }
    };

    // Both readers hit EOF once the process tree is gone; waiting for them
    // here keeps "exit observed" strictly after "last line delivered".
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    Ok(ExitSummary {
        code: status.code(),
        cancelled,
    })
}

async fn forward_lines(
    reader: impl AsyncRead + Unpin,
    stream: StreamKind,
    sink: mpsc::UnboundedSender<OutputLine>,
) {
    let mut lines = BufReader::new(reader).lines();
    let mut receiver_gone = false;
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                // Keep draining after the receiver is dropped so the child
                // never blocks on a full pipe.
                if !receiver_gone && sink.send(OutputLine { stream, text }).is_err() {
                    receiver_gone = true;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(target: "kiln.process", stream = stream.as_str(), error = %err, "output stream read failed");
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.wait().await;
    };

    // Negative pid targets the process group, which we set to the child's pid
    // via `setpgid(0, 0)` in `pre_exec`.
    let pgid = -(pid as i32);
    unsafe {
        let _ = libc::kill(pgid, libc::SIGTERM);
    }

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }

    unsafe {
        let _ = libc::kill(pgid, libc::SIGKILL);
    }
    child.wait().await
}

#[cfg(windows)]
async fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let _ = grace;

    // `Child::kill()` only terminates the immediate process; `taskkill /T`
    // terminates the full tree rooted at the pid so inherited pipe handles
    // are released.
    if let Some(pid) = child.id() {
        let _ = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }

    let _ = child.start_kill();
    child.wait().await
}

#[cfg(not(any(unix, windows)))]
async fn terminate_process_tree(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let _ = grace;
    let _ = child.start_kill();
    child.wait().await
}
