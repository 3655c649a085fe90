//! JDWP port discovery.
//!
//! A JVM started with `-agentlib:jdwp=transport=dt_socket,server=y` writes a
//! single banner line to its output once the debug agent has bound a port:
//!
//! ```text
//! Listening for transport dt_socket at address: 55005
//! ```
//!
//! The debuggee runner scans every output line through a [`PortScanner`];
//! the first match resolves a one-shot [`PortPromise`] with the parsed port
//! and the banner line is swallowed instead of being forwarded to the
//! client transcript. Later matches are ignored; everything else passes
//! through unmodified.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{DebugError, DebugResult};

pub const JDWP_BANNER_PREFIX: &str = "Listening for transport dt_socket at address: ";

/// Outcome of scanning one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scanned {
    /// The line was the JDWP listen banner; it must not be forwarded.
    Banner(u16),
    /// An ordinary line, forwarded unmodified.
    PassThrough,
}

pub struct PortScanner {
    tx: Option<oneshot::Sender<u16>>,
}

impl PortScanner {
    pub fn new() -> (Self, PortPromise) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, PortPromise { rx })
    }

    pub fn scan(&mut self, line: &str) -> Scanned {
        let Some(rest) = line.strip_prefix(JDWP_BANNER_PREFIX) else {
            return Scanned::PassThrough;
        };
        let Ok(port) = rest.trim().parse::<u16>() else {
            return Scanned::PassThrough;
        };

        // The promise resolves at most once; the banner is still swallowed
        // if the JVM prints it again.
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(port);
        }
        Scanned::Banner(port)
    }
}

/// One-shot future for the discovered port.
pub struct PortPromise {
    rx: oneshot::Receiver<u16>,
}

impl PortPromise {
    /// Wait without a bound. Fails only if the scanner was dropped before a
    /// banner was seen, which means the log stream ended.
    pub async fn resolved(self) -> DebugResult<u16> {
        self.rx.await.map_err(|_| DebugError::Cancelled)
    }

    pub async fn wait(self, timeout: Duration) -> DebugResult<u16> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(port)) => Ok(port),
            Ok(Err(_)) => Err(DebugError::Cancelled),
            Err(_) => Err(DebugError::LaunchTimeout(timeout)),
        }
    }
}
