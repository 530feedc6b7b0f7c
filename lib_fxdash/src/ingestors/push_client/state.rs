//! # Connection State Machine
//!
//! The reconnect, backoff and give-up policy of the push client, with no I/O.
//! The client feeds [`ConnectionEvent`]s into a [`ReconnectMachine`] and
//! performs the [`Action`]s it returns; everything here can be exercised
//! without a transport.
//!
//! ```text
//!                 connect()                 transport up
//! Disconnected ─────────────▶ Connecting ─────────────────▶ Connected
//!      ▲  │ reconnect due        │  connect error              │
//!      │  └──────────────────────┘  (attempts ≤ max: backoff)  │ closed by server: reconnect now
//!      │                         │                             │ transport failure: backoff
//!      │                         ▼ attempts > max              │ closed by us: stay down
//!      └──── retry() ──────── GivingUp ◀────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Where the push client currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected. Either never started, closed on purpose, or waiting
    /// for a scheduled reconnect.
    Disconnected,
    /// A transport connect is in progress.
    Connecting,
    /// The transport is up and subscriptions have been replayed.
    Connected,
    /// The attempt budget is spent; only a manual retry leaves this state.
    GivingUp,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::GivingUp => "giving up",
        };
        f.write_str(label)
    }
}

/// Why an established connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection (restart, deploy, kick).
    ServerInitiated,
    /// This client closed the connection.
    ClientInitiated,
    /// The network or protocol failed underneath the connection.
    TransportFailure(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerInitiated => f.write_str("server closed the connection"),
            DisconnectReason::ClientInitiated => f.write_str("client closed the connection"),
            DisconnectReason::TransportFailure(detail) => write!(f, "transport failure: {detail}"),
        }
    }
}

/// Exponential backoff with a cap and an attempt budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Failures tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the `attempt`-th consecutive failure
    /// (1-based): `min(base * 2^(attempt - 1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Inputs of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// `connect()` was called.
    ConnectRequested,
    /// The user asked to retry; resets the attempt budget.
    ManualRetry,
    /// The transport finished connecting.
    TransportConnected,
    /// The transport failed to connect.
    ConnectFailed(String),
    /// An established (or establishing) transport went away.
    TransportClosed(DisconnectReason),
    /// The scheduled reconnect delay elapsed.
    ReconnectDue,
    /// The client is being torn down.
    Shutdown,
}

/// Side effects the client must perform after a transition, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start a transport connect.
    OpenTransport,
    /// Drop the current transport link, if any.
    CloseTransport,
    /// Arm the reconnect timer, replacing any pending one.
    ScheduleReconnect(Duration),
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Send a subscribe message for every recorded topic.
    Resubscribe,
    /// Begin periodic keep-alive pings.
    StartKeepAlive,
    /// Stop keep-alive pings.
    StopKeepAlive,
}

/// The transition table of the push client.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    policy: BackoffPolicy,
    state: ConnectionState,
    attempts: u32,
    last_error: Option<String>,
}

impl ReconnectMachine {
    /// A machine in the initial `Disconnected` state.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_error: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Message of the most recent failure, cleared on connect.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The backoff policy in use.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Applies one event and returns the side effects to perform.
    /// Events that make no sense in the current state are ignored.
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<Action> {
        use ConnectionState::{Connected, Connecting, Disconnected, GivingUp};

        match (self.state, event) {
            (_, ConnectionEvent::Shutdown) => {
                self.state = Disconnected;
                vec![Action::CancelReconnect, Action::StopKeepAlive, Action::CloseTransport]
            }
            (Disconnected, ConnectionEvent::ConnectRequested) => {
                self.state = Connecting;
                vec![Action::CancelReconnect, Action::OpenTransport]
            }
            (Disconnected | GivingUp, ConnectionEvent::ManualRetry)
            | (GivingUp, ConnectionEvent::ConnectRequested) => {
                self.attempts = 0;
                self.state = Connecting;
                vec![Action::CancelReconnect, Action::OpenTransport]
            }
            (Disconnected, ConnectionEvent::ReconnectDue) => {
                self.state = Connecting;
                vec![Action::OpenTransport]
            }
            (Connecting, ConnectionEvent::TransportConnected) => {
                self.state = Connected;
                self.attempts = 0;
                self.last_error = None;
                vec![Action::Resubscribe, Action::StartKeepAlive]
            }
            (Connecting, ConnectionEvent::ConnectFailed(error)) => self.fail(error),
            (Connecting, ConnectionEvent::TransportClosed(reason)) => self.fail(reason.to_string()),
            (Connected, ConnectionEvent::TransportClosed(reason)) => {
                let mut actions = vec![Action::StopKeepAlive];
                match reason {
                    DisconnectReason::ServerInitiated => {
                        self.last_error = Some(reason.to_string());
                        self.state = Connecting;
                        actions.push(Action::OpenTransport);
                    }
                    DisconnectReason::ClientInitiated => {
                        self.state = Disconnected;
                    }
                    DisconnectReason::TransportFailure(_) => {
                        actions.extend(self.fail(reason.to_string()));
                    }
                }
                actions
            }
            (state, event) => {
                tracing::trace!(%state, ?event, "Ignoring connection event");
                Vec::new()
            }
        }
    }

    fn fail(&mut self, error: String) -> Vec<Action> {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error);

        if self.attempts <= self.policy.max_attempts {
            self.state = ConnectionState::Disconnected;
            vec![Action::ScheduleReconnect(self.policy.delay_for(self.attempts))]
        } else {
            self.state = ConnectionState::GivingUp;
            Vec::new()
        }
    }
}
