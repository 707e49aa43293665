//! Push-style notifications for the host
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel; a host
//! that does not subscribe simply misses them.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::hit::Hit;
use crate::runner::RunSummary;

/// Severity of a per-record log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One entry of an execution context's log buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    /// Ask the host to show the message to the user
    pub prompt: bool,
    /// How long a prompt may stay open, in seconds
    pub timeout_secs: Option<u64>,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            prompt: false,
            timeout_secs: None,
        }
    }

    #[must_use]
    pub const fn prompting(mut self, timeout_secs: Option<u64>) -> Self {
        self.prompt = true;
        self.timeout_secs = timeout_secs;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Log {
        bot: usize,
        record: String,
        entry: LogEntry,
    },
    HitFound(Hit),
    WorkersChanged {
        target: usize,
        active: usize,
    },
    ProgressSaved {
        position: usize,
    },
    ProxiesReloaded {
        total: usize,
        alive: usize,
    },
    Finished(RunSummary),
    /// Configuration or exhaustion error that stopped the run
    Fatal {
        message: String,
    },
}

const EVENT_CAPACITY: usize = 1024;

/// Sending half shared by the dispatcher and its workers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Sends to current subscribers; having none is not an error
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }
}
