//! # Dashboard Configuration
//!
//! Resolves the backend base URL from where the dashboard is served and reads
//! tuning overrides from the environment (and a `.env` file, via `dotenvy`).
//!
//! | Variable                     | Meaning                                  | Default                 |
//! |------------------------------|------------------------------------------|-------------------------|
//! | `FXDASH_HOST`                | host the dashboard is served from        | `localhost`             |
//! | `FXDASH_API_URL`             | backend URL for deployed hosts           | `https://{host}`        |
//! | `FXDASH_PUSH_PATH`           | path of the push channel                 | `/ws`                   |
//! | `FXDASH_MAX_CONCURRENT`      | request queue concurrency                | `3`                     |
//! | `FXDASH_MAX_QUEUE`           | request queue backlog                    | `10`                    |
//! | `FXDASH_REQUEST_TIMEOUT_MS`  | per-request timeout                      | `30000`                 |
//! | `FXDASH_RECONNECT_ATTEMPTS`  | push reconnect budget                    | `5`                     |
//! | `FXDASH_RECONNECT_BASE_MS`   | first reconnect delay                    | `1000`                  |
//! | `FXDASH_RECONNECT_MAX_MS`    | reconnect delay cap                      | `30000`                 |
//! | `FXDASH_KEEPALIVE_MS`        | keep-alive ping period, `0` disables     | `20000`                 |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::core::RequestQueueConfig;
use crate::ingestors::push_client::{resolve_push_url, PushClientConfig, TransportError};

/// Backend used whenever the dashboard runs on the developer's machine.
pub const LOCAL_BACKEND_URL: &str = "http://localhost:8000";

const LOCAL_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "0.0.0.0", "::1"];

/// Errors raised while building a [`DashboardConfig`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// The raw value.
        value: String,
    },

    /// The backend URL cannot be turned into a push endpoint.
    #[error("Invalid backend URL '{url}': {reason}")]
    InvalidUrl {
        /// The resolved backend URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Picks the backend base URL for a dashboard served from `host`.
///
/// Local hosts always talk to [`LOCAL_BACKEND_URL`]. Any other host uses
/// `override_url` when one is given, or the same host over HTTPS otherwise.
/// The result never ends with a slash.
pub fn resolve_base_url(host: &str, override_url: Option<&str>) -> String {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || LOCAL_HOSTS.contains(&host) {
        return LOCAL_BACKEND_URL.to_string();
    }

    match override_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => format!("https://{host}"),
    }
}

/// Refresh cadences of the polled views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollIntervals {
    /// Open positions.
    pub positions: Duration,
    /// Trade history.
    pub trades: Duration,
    /// Account statistics.
    pub stats: Duration,
    /// Bot running state.
    pub bot_status: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            positions: Duration::from_secs(5),
            trades: Duration::from_secs(30),
            stats: Duration::from_secs(15),
            bot_status: Duration::from_secs(10),
        }
    }
}

/// Everything the dashboard core needs to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    /// Host the dashboard is served from.
    pub host: String,
    /// Backend URL for deployed hosts, if configured.
    pub api_url: Option<String>,
    /// Backend REST base URL, without trailing slash.
    pub api_base_url: String,
    /// Path of the push channel on the backend.
    pub push_path: String,
    /// Request queue limits.
    pub queue: RequestQueueConfig,
    /// Push client settings; `push.url` is derived from the two fields above.
    pub push: PushClientConfig,
    /// Poll cadences.
    pub poll: PollIntervals,
}

impl DashboardConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("FXDASH_HOST").unwrap_or_else(|| "localhost".to_string());
        let api_url = lookup("FXDASH_API_URL");
        let api_base_url = resolve_base_url(&host, api_url.as_deref());
        let push_path = lookup("FXDASH_PUSH_PATH").unwrap_or_else(|| "/ws".to_string());

        let queue_defaults = RequestQueueConfig::default();
        let queue = RequestQueueConfig {
            max_concurrent: parse_or(&lookup, "FXDASH_MAX_CONCURRENT", queue_defaults.max_concurrent)?,
            max_queue_size: parse_or(&lookup, "FXDASH_MAX_QUEUE", queue_defaults.max_queue_size)?,
            request_timeout: millis_or(&lookup, "FXDASH_REQUEST_TIMEOUT_MS", queue_defaults.request_timeout)?,
            dispatch_delay: queue_defaults.dispatch_delay,
        };

        let mut push = PushClientConfig::default();
        push.backoff.max_attempts = parse_or(&lookup, "FXDASH_RECONNECT_ATTEMPTS", push.backoff.max_attempts)?;
        push.backoff.base_delay = millis_or(&lookup, "FXDASH_RECONNECT_BASE_MS", push.backoff.base_delay)?;
        push.backoff.max_delay = millis_or(&lookup, "FXDASH_RECONNECT_MAX_MS", push.backoff.max_delay)?;
        push.keepalive_interval = millis_or(&lookup, "FXDASH_KEEPALIVE_MS", push.keepalive_interval)?;

        let mut config = Self {
            host,
            api_url,
            api_base_url,
            push_path,
            queue,
            push,
            poll: PollIntervals::default(),
        };
        config.refresh_push_url()?;
        Ok(config)
    }

    /// Re-resolves the backend with command-line values taking precedence;
    /// whichever of `host` and `api_url` is `None` keeps its configured value.
    pub fn with_backend_overrides(mut self, host: Option<&str>, api_url: Option<&str>) -> Result<Self, ConfigError> {
        if host.is_none() && api_url.is_none() {
            return Ok(self);
        }
        if let Some(host) = host {
            self.host = host.to_string();
        }
        if let Some(url) = api_url {
            self.api_url = Some(url.to_string());
        }
        let base_url = resolve_base_url(&self.host, self.api_url.as_deref());
        self.with_api_base_url(&base_url)
    }

    /// Points the configuration at a different backend.
    pub fn with_api_base_url(mut self, url: &str) -> Result<Self, ConfigError> {
        self.api_base_url = url.trim_end_matches('/').to_string();
        self.refresh_push_url()?;
        Ok(self)
    }

    fn refresh_push_url(&mut self) -> Result<(), ConfigError> {
        self.push.url = resolve_push_url(&self.api_base_url, &self.push_path).map_err(|e| match e {
            TransportError::InvalidUrl { url, reason } => ConfigError::InvalidUrl { url, reason },
            other => ConfigError::InvalidUrl {
                url: self.api_base_url.clone(),
                reason: other.to_string(),
            },
        })?;
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}
