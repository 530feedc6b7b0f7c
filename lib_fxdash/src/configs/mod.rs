//! # Configuration Modules
//!
//! Where the dashboard finds its backend, and the tuning of the queue, the
//! push client and the poll cadences.

/// Environment-derived dashboard configuration and backend URL resolution.
pub mod config_dashboard;

pub use config_dashboard::{resolve_base_url, ConfigError, DashboardConfig, PollIntervals};
