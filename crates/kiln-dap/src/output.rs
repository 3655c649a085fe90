//! Output multiplexer: captures every debuggee output line, keeps an
//! append-only transcript, and forwards lines to whichever session is
//! currently bound. Lines produced before any session connects are queued
//! and flushed to the first session that attaches.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use kiln_process::StreamKind;

/// DAP output category for a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCategory {
    Stdout,
    Stderr,
    /// Debug-log lines produced by the runner itself (test framework
    /// events, diagnostics) rather than the debuggee's streams.
    Console,
}

impl OutputCategory {
    pub fn as_dap_category(self) -> &'static str {
        match self {
            OutputCategory::Stdout => "stdout",
            OutputCategory::Stderr => "stderr",
            OutputCategory::Console => "console",
        }
    }
}

impl From<StreamKind> for OutputCategory {
    fn from(stream: StreamKind) -> Self {
        match stream {
            StreamKind::Stdout => OutputCategory::Stdout,
            StreamKind::Stderr => OutputCategory::Stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub category: OutputCategory,
    pub text: String,
}

impl OutputLine {
    pub fn new(category: OutputCategory, text: impl Into<String>) -> Self {
        Self {
            category,
            text: text.into(),
        }
    }
}

#[derive(Default)]
struct Inner {
    lines: Vec<OutputLine>,
    /// Number of lines already handed to a session.
    delivered: usize,
    session: Option<mpsc::UnboundedSender<OutputLine>>,
}

#[derive(Default)]
pub struct OutputMultiplexer {
    inner: Mutex<Inner>,
}

impl OutputMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one line and forward it to the attached session, if any.
    /// Delivery order equals append order.
    pub fn append(&self, line: OutputLine) {
        let mut inner = self.inner.lock();
        inner.lines.push(line.clone());
        if let Some(session) = &inner.session {
            if session.send(line).is_ok() {
                inner.delivered = inner.lines.len();
            } else {
                inner.session = None;
            }
        }
    }

    /// Bind a session. Any undelivered backlog is flushed into the channel
    /// before new lines, so the first session sees everything produced
    /// before it connected.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<OutputLine> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let backlog = inner.lines[inner.delivered..].to_vec();
        for line in backlog {
            let _ = tx.send(line);
        }
        inner.delivered = inner.lines.len();
        inner.session = Some(tx);
        rx
    }

    /// Unbind the session, reclaiming anything still sitting unread in its
    /// channel. Reclaimed lines rejoin the backlog so the next session
    /// receives them; a line counts as delivered only once a session has
    /// actually pulled it out of the channel.
    pub fn detach(&self, rx: &mut mpsc::UnboundedReceiver<OutputLine>) {
        let mut inner = self.inner.lock();
        inner.session = None;
        // The lock blocks concurrent appends, so the channel cannot grow
        // while we count what the session never read.
        let mut unread = 0;
        while rx.try_recv().is_ok() {
            unread += 1;
        }
        inner.delivered -= unread;
    }

    /// Snapshot of everything captured so far, for diagnostics and tests.
    pub fn captured(&self) -> Vec<OutputLine> {
        self.inner.lock().lines.clone()
    }

    /// The captured stdout/stderr transcript as newline-joined text.
    pub fn captured_text(&self) -> String {
        self.inner
            .lock()
            .lines
            .iter()
            .filter(|line| line.category != OutputCategory::Console)
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
