//! # Push Events
//!
//! The named events exchanged over the push channel and the handler registry
//! the client dispatches inbound events to.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Free-text log line streamed from the bot.
pub const LOG_EVENT: &str = "log";
/// Topic-scoped dashboard refresh.
pub const DASHBOARD_UPDATE_EVENT: &str = "dashboard_update";
/// Client → server: start streaming a topic.
pub const SUBSCRIBE_EVENT: &str = "subscribe";
/// Client → server: stop streaming a topic.
pub const UNSUBSCRIBE_EVENT: &str = "unsubscribe";
/// Client → server keep-alive.
pub const PING_EVENT: &str = "ping";

/// Payload key that carries the topic of scoped events and control messages.
pub const DEFAULT_TOPIC_FIELD: &str = "pair";

/// A named event with an arbitrary JSON payload, the unit of the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload; `null` when absent.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// An event with a payload.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// A subscribe control event for `topic`.
    pub fn subscribe(topic_field: &str, topic: &str) -> Self {
        Self::new(SUBSCRIBE_EVENT, json!({ topic_field: topic }))
    }

    /// An unsubscribe control event for `topic`.
    pub fn unsubscribe(topic_field: &str, topic: &str) -> Self {
        Self::new(UNSUBSCRIBE_EVENT, json!({ topic_field: topic }))
    }

    /// A keep-alive ping stamped with the sender's wall clock.
    pub fn ping(timestamp_ms: i64) -> Self {
        Self::new(PING_EVENT, json!({ "ts": timestamp_ms }))
    }

    /// The topic the event is scoped to, if its payload names one.
    pub fn topic(&self, topic_field: &str) -> Option<&str> {
        self.data.get(topic_field).and_then(Value::as_str)
    }
}

/// Severity attached to a streamed log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Something unusual that did not stop the bot.
    #[serde(alias = "warn")]
    Warning,
    /// A failed operation.
    Error,
    /// The bot cannot continue.
    #[serde(alias = "fatal")]
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Payload of a [`LOG_EVENT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// The log text.
    pub message: String,
    /// Severity; `info` when the server omits it.
    #[serde(default)]
    pub level: LogLevel,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload of a [`DASHBOARD_UPDATE_EVENT`]: the topic plus whatever the backend sent.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardUpdate {
    /// The currency pair the update is scoped to.
    pub pair: String,
    /// The full payload, topic field included.
    pub data: Value,
}

impl DashboardUpdate {
    fn from_envelope(envelope: &Envelope, topic_field: &str) -> Option<Self> {
        Some(Self {
            pair: envelope.topic(topic_field)?.to_string(),
            data: envelope.data.clone(),
        })
    }
}

type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// # Event Handlers
///
/// Handlers keyed by event name. Cloning shares the registry, so handlers
/// added after the client is built still receive events.
///
/// ```
/// use lib_fxdash::ingestors::push_client::EventHandlers;
///
/// let handlers = EventHandlers::new()
///     .on_log(|line| println!("[{}] {}", line.level, line.message))
///     .on_dashboard_update(|update| println!("{} refreshed", update.pair));
/// assert_eq!(handlers.handler_count("log"), 1);
/// ```
#[derive(Clone, Default)]
pub struct EventHandlers {
    handlers: Arc<RwLock<HashMap<String, Vec<Handler>>>>,
    topic_field: Option<Arc<str>>,
}

impl EventHandlers {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `field` instead of [`DEFAULT_TOPIC_FIELD`] to read topics.
    pub fn with_topic_field(mut self, field: &str) -> Self {
        self.topic_field = Some(Arc::from(field));
        self
    }

    /// The payload key topics are read from.
    pub fn topic_field(&self) -> &str {
        self.topic_field.as_deref().unwrap_or(DEFAULT_TOPIC_FIELD)
    }

    /// Registers a raw handler for `event`.
    pub fn on<F>(self, event: &str, handler: F) -> Self
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.add(event, handler);
        self
    }

    /// Registers a raw handler for `event` on a shared registry.
    pub fn add<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Registers a handler for [`LOG_EVENT`]s. Malformed payloads are logged and skipped.
    pub fn on_log<F>(self, handler: F) -> Self
    where
        F: Fn(&LogLine) + Send + Sync + 'static,
    {
        self.on(LOG_EVENT, move |envelope| {
            match serde_json::from_value::<LogLine>(envelope.data.clone()) {
                Ok(line) => handler(&line),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed log event"),
            }
        })
    }

    /// Registers a handler for [`DASHBOARD_UPDATE_EVENT`]s. Updates without a topic are skipped.
    pub fn on_dashboard_update<F>(self, handler: F) -> Self
    where
        F: Fn(&DashboardUpdate) + Send + Sync + 'static,
    {
        let topic_field = self.topic_field().to_string();
        self.on(DASHBOARD_UPDATE_EVENT, move |envelope| {
            match DashboardUpdate::from_envelope(envelope, &topic_field) {
                Some(update) => handler(&update),
                None => tracing::warn!("Skipping dashboard update without '{}'", topic_field),
            }
        })
    }

    /// Number of handlers registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Runs every handler registered for the envelope's event and returns how
    /// many ran. A panicking handler is logged and does not stop the others.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        // Snapshot so handlers may register further handlers without deadlocking.
        let matching: Vec<Handler> = match self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.event)
        {
            Some(handlers) => handlers.clone(),
            None => {
                tracing::trace!(event = %envelope.event, "No handler for push event");
                return 0;
            }
        };

        for handler in &matching {
            if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                tracing::error!(event = %envelope.event, "Push event handler panicked");
            }
        }
        matching.len()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let events: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("EventHandlers")
            .field("events", &events)
            .field("topic_field", &self.topic_field())
            .finish()
    }
}
