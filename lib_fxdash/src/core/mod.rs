//! # Core Request Discipline
//!
//! The two leaf mechanisms every dashboard view shares when it talks to the
//! backend over HTTP. Neither depends on the other; a view may wrap the same
//! backend call in both (a staggered poll whose tick submits through the queue).
//!
//! ## Core Components:
//!
//! - **`request_queue`**: A bounded FIFO admission queue. At most
//!   `max_concurrent` tasks run at once, at most `max_queue_size` wait, and every
//!   task is raced against a per-request timeout.
//!
//! - **`staggered_polling`**: A registry mapping a component name to a refresh
//!   cadence. Each registration receives a random offset so that views polling
//!   on the same nominal interval do not all fire in the same tick.
//!
//! Both are explicitly constructed objects. Share them between views with an
//! `Arc`; nothing in this module is process-global.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Bounded concurrent request queue with per-request timeouts.
pub mod request_queue;
/// Jittered per-component polling scheduler.
pub mod staggered_polling;

// --- Public API Re-exports ---
pub use request_queue::{QueueError, QueueStatus, RequestHandle, RequestQueue, RequestQueueConfig};
pub use staggered_polling::{PollRegistration, PollStatus, StaggeredPoller};
