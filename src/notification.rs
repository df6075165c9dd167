//! User-facing notifications raised by the bridge.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{error, info, warn};

use bridge_protocol::message::MessageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl From<MessageType> for Severity {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Ok => Severity::Info,
            MessageType::Warning => Severity::Warning,
            MessageType::Error => Severity::Error,
        }
    }
}

/// What happened, independent of how it is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleEvent {
    Connected,
    Disconnected,
    SpecificationLoaded,
    SpecificationInvalid,
    DataflowLoaded,
    DataflowInvalid,
    DataflowExported,
    RunStarted,
    RunFinished,
    RunRejected,
    RunStopRefused,
    CapabilityFetchFailed,
    PeerReplaced,
    PeerRejected,
    ChangeNotificationFailed,
    PeerMessage,
}

/// Toasts are shown to the user; log entries only land in the editor log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Display {
    Toast,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: LifecycleEvent,
    pub severity: Severity,
    pub title: String,
    pub details: Vec<String>,
    pub display: Display,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(event: LifecycleEvent, severity: Severity, title: impl Into<String>) -> Self {
        Self {
            event,
            severity,
            title: title.into(),
            details: Vec::new(),
            display: Display::Toast,
            at: Utc::now(),
        }
    }

    pub fn info(event: LifecycleEvent, title: impl Into<String>) -> Self {
        Self::new(event, Severity::Info, title)
    }

    pub fn warning(event: LifecycleEvent, title: impl Into<String>) -> Self {
        Self::new(event, Severity::Warning, title)
    }

    pub fn error(event: LifecycleEvent, title: impl Into<String>) -> Self {
        Self::new(event, Severity::Error, title)
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    pub fn details<I, S>(mut self, details: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.details.extend(details.into_iter().map(Into::into));
        self
    }

    /// Only record in the log, do not pop up.
    pub fn log_only(mut self) -> Self {
        self.display = Display::Log;
        self
    }
}

/// Receives notifications. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sends notifications to `tracing`; used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        let details = n.details.join("; ");
        match n.severity {
            Severity::Info => info!(event = %n.event, details, "{}", n.title),
            Severity::Warning => warn!(event = %n.event, details, "{}", n.title),
            Severity::Error => error!(event = %n.event, details, "{}", n.title),
        }
    }
}

/// Keeps every notification, for tests and for an editor that drains them.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.all().into_iter().map(|n| n.event).collect()
    }

    pub fn count(&self, event: LifecycleEvent) -> usize {
        self.all().iter().filter(|n| n.event == event).count()
    }

    pub fn drain(&self) -> Vec<Notification> {
        self.seen
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: Notification) {
        TracingNotifier.notify(notification.clone());
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(notification);
        }
    }
}
