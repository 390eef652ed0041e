//! Status sink implemented by whatever presents the proxy to its operator.
//!
//! The core reports through three calls only: a status line, an active flag
//! (true while a client is being served) and free-form log lines.

use parking_lot::Mutex;

/// Presentation capability consumed by the proxy.
pub trait Ui: Send + Sync {
    /// Replace the status line.
    fn set_status(&self, status: &str);

    /// Report whether a client is currently being served.
    fn set_active(&self, active: bool);

    /// Append a log line.
    fn log(&self, line: &str);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct SilentUi;

impl Ui for SilentUi {
    fn set_status(&self, _status: &str) {}

    fn set_active(&self, _active: bool) {}

    fn log(&self, _line: &str) {}
}

/// Remembers the latest status and active flag so an embedder can poll them.
#[derive(Debug, Default)]
pub struct StatusUi {
    inner: Mutex<StatusInner>,
}

#[derive(Debug, Default)]
struct StatusInner {
    status: String,
    active: bool,
    clients: u64,
}

impl StatusUi {
    /// Create an empty status sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status line.
    pub fn status(&self) -> String {
        self.inner.lock().status.clone()
    }

    /// Whether a client is being served.
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Number of inactive -> active edges seen.
    pub fn clients(&self) -> u64 {
        self.inner.lock().clients
    }
}

impl Ui for StatusUi {
    fn set_status(&self, status: &str) {
        self.inner.lock().status = status.to_string();
    }

    fn set_active(&self, active: bool) {
        let mut inner = self.inner.lock();
        if active && !inner.active {
            inner.clients += 1;
        }
        inner.active = active;
    }

    fn log(&self, _line: &str) {}
}

/// Emits status changes and log lines through `tracing`.
#[derive(Debug, Default)]
pub struct VerboseUi;

impl Ui for VerboseUi {
    fn set_status(&self, status: &str) {
        tracing::info!(target: "snowflake::ui", "status: {}", status);
    }

    fn set_active(&self, active: bool) {
        tracing::info!(target: "snowflake::ui", active, "client activity changed");
    }

    fn log(&self, line: &str) {
        tracing::info!(target: "snowflake::ui", "{}", line);
    }
}
