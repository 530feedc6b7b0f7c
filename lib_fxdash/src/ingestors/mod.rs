//! Real-time data sources.

pub mod push_client;

pub use push_client::{PushClient, PushClientConfig};
