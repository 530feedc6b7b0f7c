//! # Dashboard Feed
//!
//! A headless dashboard: it refreshes positions, trades, statistics and bot
//! state on staggered timers through the shared request queue, follows the
//! push channel for one currency pair, and writes everything it sees to the
//! log.
//!
//! ## Features:
//! - **Configuration**: `.env` and `FXDASH_*` variables, overridden by flags.
//! - **Logging**: console plus daily-rotated JSON files in `--log-dir`.
//! - **Graceful Shutdown**: `tokio-graceful` stops timers, drops the backlog
//!   and closes the push channel on Ctrl+C or SIGTERM.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{error, info, warn};

use lib_fxdash::configs::DashboardConfig;
use lib_fxdash::core::{RequestQueue, StaggeredPoller};
use lib_fxdash::ingestors::push_client::{ConnectionState, EventHandlers, LogLevel, PushClient};
use lib_fxdash::loggers::setup_logging;
use lib_fxdash::retrieve::dashboard_api::{coerce_f64, coerce_i64};
use lib_fxdash::retrieve::{ApiClient, ApiError, DashboardApi};

/// How long the feed waits before retrying a push channel that gave up.
const MANUAL_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Command-line arguments for the dashboard feed.
#[derive(Parser, Debug)]
#[command(author, version, about = "Follows a forex bot backend from the terminal", long_about = None)]
struct Args {
    /// Currency pair to follow on the push channel.
    #[arg(short, long, default_value = "EUR_USD")]
    pair: String,

    /// Host the dashboard is served from. Local hosts use the local backend.
    #[arg(long)]
    host: Option<String>,

    /// Backend URL used when the host is not local.
    #[arg(long)]
    api_url: Option<String>,

    /// Directory for the JSON log files.
    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is loaded before clap so `LOG_DIR` can come from it.
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let _guard = setup_logging(&args.log_dir, "dashboard_feed").context("initializing logging")?;

    let config = load_config(&args)?;
    info!(backend = %config.api_base_url, push = %config.push.url, pair = %args.pair, "Dashboard feed starting");

    let shutdown = Shutdown::default();
    let pair = args.pair;
    shutdown.spawn_task_fn(move |guard| async move {
        if let Err(e) = run_feed(config, pair, guard).await {
            error!("Dashboard feed failed: {:#}", e);
        }
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => info!("shutdown: gracefully {}s after shutdown signal received", elapsed.as_secs_f64()),
        Err(e) => warn!("shutdown: forcefully due to timeout: {}", e),
    }

    info!("Bye!");
    Ok(())
}

/// Environment configuration with `--host` and `--api-url` applied on top.
fn load_config(args: &Args) -> anyhow::Result<DashboardConfig> {
    DashboardConfig::from_env()
        .and_then(|config| config.with_backend_overrides(args.host.as_deref(), args.api_url.as_deref()))
        .context("loading dashboard configuration")
}

/// Asks the push client for a fresh attempt; `false` once it has stopped.
fn retry_push(push: &PushClient) -> bool {
    info!("Retrying push channel");
    match push.retry() {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Push channel retry failed");
            false
        }
    }
}

async fn run_feed(config: DashboardConfig, pair: String, guard: ShutdownGuard) -> anyhow::Result<()> {
    let client = ApiClient::new(&config.api_base_url, None, config.queue.request_timeout)?;
    let api = DashboardApi::new(client);
    let queue = RequestQueue::new(config.queue.clone());
    let poller = StaggeredPoller::new();

    let handlers = EventHandlers::new()
        .on_log(|line| match line.level {
            LogLevel::Error | LogLevel::Critical => error!(target: "bot", data = ?line.data, "{}", line.message),
            LogLevel::Warning => warn!(target: "bot", data = ?line.data, "{}", line.message),
            LogLevel::Info | LogLevel::Debug => info!(target: "bot", data = ?line.data, "{}", line.message),
        })
        .on_dashboard_update(|update| {
            info!(
                pair = %update.pair,
                balance = ?update.data.get("balance").and_then(coerce_f64),
                open_trades = ?update.data.get("open_trades").and_then(coerce_i64),
                "Dashboard update"
            );
        });
    let push = PushClient::websocket(config.push.clone(), handlers);
    push.subscribe(pair.as_str())?;
    push.connect()?;

    let a = api.clone();
    schedule(&poller, &queue, "positions", config.poll.positions, move || {
        let a = a.clone();
        async move { a.positions().await }
    }, render_positions);
    let a = api.clone();
    schedule(&poller, &queue, "trades", config.poll.trades, move || {
        let a = a.clone();
        async move { a.trades(Some(50)).await }
    }, render_trades);
    let a = api.clone();
    schedule(&poller, &queue, "stats", config.poll.stats, move || {
        let a = a.clone();
        async move { a.stats().await }
    }, render_stats);
    let a = api.clone();
    schedule(&poller, &queue, "bot_status", config.poll.bot_status, move || {
        let a = a.clone();
        async move { a.bot_status().await }
    }, render_bot_status);

    for poll in poller.status() {
        info!(
            component = %poll.component_name,
            nominal_ms = poll.nominal_interval.as_millis() as u64,
            effective_ms = poll.effective_interval.as_millis() as u64,
            "Poll registered"
        );
    }

    let mut status = push.watch_status();
    let mut giving_up = false;
    loop {
        tokio::select! {
            _ = guard.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                giving_up = current.state == ConnectionState::GivingUp;
                info!(
                    state = %current.state,
                    attempts = current.attempts,
                    last_error = current.last_error.as_deref().unwrap_or(""),
                    "Push channel status"
                );
            }
            _ = tokio::time::sleep(MANUAL_RETRY_AFTER), if giving_up => {
                if !retry_push(&push) {
                    break;
                }
            }
        }
    }

    poller.stop_all();
    let dropped = queue.clear();
    push.shutdown().await;
    info!(dropped_requests = dropped, "Dashboard feed stopped");
    Ok(())
}

/// Registers `name` with the poller; each tick submits `fetch` through the
/// queue and hands the result to `render`.
fn schedule<F, Fut>(
    poller: &StaggeredPoller,
    queue: &RequestQueue,
    name: &'static str,
    interval: Duration,
    fetch: F,
    render: fn(&Value),
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ApiError>> + Send + 'static,
{
    poller.register(name, interval);
    let queue = queue.clone();
    let fetch = Arc::new(fetch);
    poller.start_async(name, move || {
        let fetch = Arc::clone(&fetch);
        let handle = queue.submit(Some(name), move || (*fetch)());
        async move {
            match handle.await {
                Ok(value) => render(&value),
                Err(e) if e.is_transient() => warn!(component = name, error = %e, "Refresh skipped"),
                Err(e) => error!(component = name, error = %e, "Refresh failed"),
            }
        }
    });
}

fn render_positions(value: &Value) {
    let positions = value.as_array().map(Vec::as_slice).unwrap_or_default();
    let unrealized: f64 = positions
        .iter()
        .filter_map(|p| p.get("unrealized_pl").and_then(coerce_f64))
        .sum();
    info!(open = positions.len(), unrealized_pl = unrealized, "Positions");
}

fn render_trades(value: &Value) {
    let trades = value.as_array().map(Vec::as_slice).unwrap_or_default();
    let latest = trades.first().and_then(|t| t.get("pair")).and_then(Value::as_str);
    info!(count = trades.len(), latest = latest.unwrap_or("-"), "Trades");
}

fn render_stats(value: &Value) {
    info!(
        balance = ?value.get("balance").and_then(coerce_f64),
        win_rate = ?value.get("win_rate").and_then(coerce_f64),
        total_trades = ?value.get("total_trades").and_then(coerce_i64),
        "Stats"
    );
}

fn render_bot_status(value: &Value) {
    let running = value.get("running").and_then(Value::as_bool).unwrap_or(false);
    info!(running, "Bot status");
}
