//! # Data Retrieval Module
//!
//! HTTP access to the dashboard backend.
//!
//! ## Contained Modules:
//!
//! - **`http`**: a generic JSON `ApiClient` on top of `reqwest` with a typed
//!   [`ApiError`](http::ApiError). It does not retry; transient failures are
//!   reported to the caller, which decides whether to resubmit.
//! - **`dashboard_api`**: the backend's REST endpoints (positions, trades,
//!   stats, config, bot control) as methods returning JSON values.

pub mod dashboard_api;
pub mod http;

pub use dashboard_api::DashboardApi;
pub use http::{ApiClient, ApiError, ApiResponse};
