//! The debug server: listening socket, single-active-session admission, and
//! ownership of the shared debuggee execution.
//!
//! Admission is structural rather than policed: the accept loop runs
//! sessions inline, so while a session is active the listener is simply not
//! polled and further connections sit in the OS backlog with their protocol
//! handshake stalled. When a session ends with restart intent the loop goes
//! back to accepting for a bounded grace window, handing the still-running
//! debuggee to whichever client connects next.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::DebugBackend;
use crate::debuggee::{Debuggee, DebuggeeHandle, DebuggeeListener, DebuggeeSignals};
use crate::output::OutputMultiplexer;
use crate::session::Session;

/// Bound on waiting for the debuggee to die during server teardown.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DebugServerConfig {
    /// How long the server keeps accepting after a restart-intent
    /// disconnect before giving up and cancelling the debuggee.
    pub grace_period: Duration,
    /// Bound on waiting for the debuggee to become debuggable while
    /// handling `launch`/`attach`.
    pub launch_timeout: Duration,
    /// Shut the server down as soon as a session ends without restart
    /// intent. When off, the server returns to listening instead.
    pub auto_close_session: bool,
}

impl Default for DebugServerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            launch_timeout: Duration::from_secs(30),
            auto_close_session: true,
        }
    }
}

/// The debuggee execution shared across sessions of one server.
#[derive(Clone)]
struct Execution {
    handle: DebuggeeHandle,
    signals: DebuggeeSignals,
}

pub struct DebugServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    debuggee: Arc<dyn Debuggee>,
    backend: Arc<dyn DebugBackend>,
    config: DebugServerConfig,
}

impl DebugServer {
    pub async fn bind(
        host: &str,
        port: u16,
        debuggee: Arc<dyn Debuggee>,
        backend: Arc<dyn DebugBackend>,
        config: DebugServerConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            debuggee,
            backend,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn uri(&self) -> String {
        format!("tcp://{}", self.local_addr)
    }

    /// Spawn the accept loop and return a handle for observing and closing
    /// the server.
    pub fn start(self) -> DebugServerHandle {
        let output = Arc::new(OutputMultiplexer::new());
        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();
        let uri = self.uri();

        tokio::spawn(run_loop(
            self.listener,
            self.debuggee,
            self.backend,
            self.config,
            output.clone(),
            cancel.clone(),
            closed.clone(),
        ));

        DebugServerHandle {
            addr: self.local_addr,
            uri,
            cancel,
            closed,
            output,
        }
    }
}

#[derive(Clone)]
pub struct DebugServerHandle {
    addr: SocketAddr,
    uri: String,
    cancel: CancellationToken,
    closed: CancellationToken,
    output: Arc<OutputMultiplexer>,
}

impl DebugServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Transcript of everything the debuggee has printed so far.
    pub fn output(&self) -> &Arc<OutputMultiplexer> {
        &self.output
    }

    /// Ask the server to close now. The active session's socket is dropped
    /// and the debuggee is cancelled; wait on [`closed`](Self::closed) for
    /// teardown to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the server has fully shut down.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

async fn run_loop(
    listener: TcpListener,
    debuggee: Arc<dyn Debuggee>,
    backend: Arc<dyn DebugBackend>,
    config: DebugServerConfig,
    output: Arc<OutputMultiplexer>,
    cancel: CancellationToken,
    closed: CancellationToken,
) {
    let mut execution: Option<Execution> = None;
    let mut grace_deadline: Option<Instant> = None;

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep_until_opt(grace_deadline) => {
                tracing::info!(target: "kiln.dap", "restart window expired; closing");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(target: "kiln.dap", error = %err, "accept failed");
                continue;
            }
        };
        grace_deadline = None;
        tracing::info!(target: "kiln.dap", %peer, "client connected");

        // The debuggee starts with the first session and survives restarts.
        let execution = match execution.as_ref() {
            Some(execution) => execution.clone(),
            None => {
                let (sink, signals) = DebuggeeListener::new(output.clone());
                let handle = debuggee.run(sink);
                let started = Execution { handle, signals };
                execution = Some(started.clone());
                started
            }
        };

        let session = Session::new(
            debuggee.clone(),
            backend.clone(),
            execution.signals.clone(),
            execution.handle.clone(),
            output.clone(),
            cancel.child_token(),
            config.launch_timeout,
        );

        // Run the session inline: nothing is accepted while it is active.
        let outcome = session.run(stream).await;
        tracing::info!(target: "kiln.dap", restart = outcome.restart, "session ended");

        if outcome.restart {
            grace_deadline = Some(Instant::now() + config.grace_period);
            continue;
        }
        if config.auto_close_session {
            break;
        }
    }

    // Closing: dropping the listener makes the OS refuse any further
    // connection attempts, then tear the debuggee down with a bounded wait.
    drop(listener);
    if let Some(execution) = execution {
        execution.handle.cancel();
        if tokio::time::timeout(SHUTDOWN_WAIT, execution.handle.wait())
            .await
            .is_err()
        {
            tracing::warn!(target: "kiln.dap", "debuggee did not terminate during shutdown");
        }
    }
    closed.cancel();
    tracing::info!(target: "kiln.dap", "server closed");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
