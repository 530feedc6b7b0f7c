//! # Resilient Push-Event Client
//!
//! A reconnecting, subscription-aware client for the backend's real-time
//! event channel.
//!
//! * [`state`]: the reconnect/backoff state machine, free of I/O.
//! * [`transport`]: the connect primitive and its WebSocket implementation.
//! * [`events`]: event payloads and the handler registry.
//! * [`client`]: the background session tying them together.

pub mod client;
pub mod events;
pub mod state;
pub mod transport;

pub use client::{ConnectionStatus, PushClient, PushClientConfig, PushClientError, RAPID_CLOSE_WINDOW};
pub use events::{DashboardUpdate, Envelope, EventHandlers, LogLevel, LogLine};
pub use state::{BackoffPolicy, ConnectionState, DisconnectReason};
pub use transport::{resolve_push_url, EventTransport, TransportError, WsTransport};
