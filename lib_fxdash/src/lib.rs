//! # lib_fxdash
//!
//! Client-side plumbing for the forex bot dashboard. Every view of the
//! dashboard talks to the backend through the three mechanisms in this crate:
//!
//! - **`core::request_queue`**: caps concurrent backend calls and bounds the backlog.
//! - **`core::staggered_polling`**: per-component refresh timers with jitter.
//! - **`ingestors::push_client`**: the reconnecting push-event channel.
//!
//! Modules are gated by cargo features so a consumer only pulls in the
//! networking stack it needs.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

// Declare the modules to re-export
#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "retrieve")]
pub mod retrieve;

// Re-export the entry points views reach for most often
#[cfg(feature = "core")]
pub use crate::core::{RequestQueue, RequestQueueConfig, StaggeredPoller};
#[cfg(feature = "ingestors")]
pub use crate::ingestors::{PushClient, PushClientConfig};
