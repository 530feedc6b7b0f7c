//! # Push Client
//!
//! One logical, subscription-capable connection to the backend's push
//! channel that survives network drops and server restarts.
//!
//! The connection lives in a background task that owns the transport link,
//! the reconnect timer and the keep-alive timer. The [`PushClient`] handle only
//! sends commands to it and reads its published [`ConnectionStatus`], so no
//! lock is ever held across a transport call.

use std::collections::BTreeSet;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};

use super::events::{Envelope, EventHandlers, DEFAULT_TOPIC_FIELD};
use super::state::{Action, BackoffPolicy, ConnectionEvent, ConnectionState, DisconnectReason, ReconnectMachine};
use super::transport::{EventTransport, TransportError, TransportLink, TransportSignal, WsTransport};

/// A server close sooner than this after connecting counts as rapid.
pub const RAPID_CLOSE_WINDOW: Duration = Duration::from_secs(5);

/// Rapid server closes in a row before each further one is logged as a warning.
const RAPID_CLOSE_WARN_AFTER: u32 = 3;

/// Settings of a [`PushClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushClientConfig {
    /// WebSocket endpoint used by [`PushClient::websocket`].
    pub url: String,
    /// Reconnect backoff and attempt budget.
    pub backoff: BackoffPolicy,
    /// Period of the keep-alive ping while connected. Zero disables pings.
    pub keepalive_interval: Duration,
    /// Upper bound for one transport connect.
    pub connect_timeout: Duration,
    /// Payload key that carries the topic.
    pub topic_field: String,
}

impl Default for PushClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws".to_string(),
            backoff: BackoffPolicy::default(),
            keepalive_interval: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            topic_field: DEFAULT_TOPIC_FIELD.to_string(),
        }
    }
}

/// Snapshot of the session, as a status badge would show it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// State machine position.
    pub state: ConnectionState,
    /// Shorthand for `state == Connected`.
    pub connected: bool,
    /// Consecutive failures since the last successful connect.
    pub attempts: u32,
    /// Most recent failure, cleared on connect.
    pub last_error: Option<String>,
    /// Recorded topics, sorted.
    pub subscriptions: Vec<String>,
    /// Consecutive server closes that came within [`RAPID_CLOSE_WINDOW`] of
    /// connecting. These reconnect immediately and never spend the budget.
    pub rapid_server_closes: u32,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected: false,
            attempts: 0,
            last_error: None,
            subscriptions: Vec::new(),
            rapid_server_closes: 0,
        }
    }
}

/// Errors returned by [`PushClient`] calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushClientError {
    /// The background task has shut down.
    #[error("push client is not running")]
    NotRunning,
}

#[derive(Debug)]
enum Command {
    Connect,
    Retry,
    Subscribe(String),
    Unsubscribe(String),
    Emit(Envelope),
    Shutdown,
}

/// # Push Client
///
/// Handle to a reconnecting push-event session.
///
/// * `connect` starts the session; failures back off exponentially until the
///   attempt budget is spent, after which only [`retry`](Self::retry) reconnects.
/// * Subscriptions are recorded whatever the connection state, sent at once
///   when connected and replayed in full after every connect.
/// * Inbound events go to the [`EventHandlers`]; events scoped to a topic the
///   client is not subscribed to are discarded first.
///
/// Must be created inside a tokio runtime.
pub struct PushClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    handlers: EventHandlers,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushClient {
    /// Starts the background session over `transport`. Nothing connects until
    /// [`connect`](Self::connect) is called.
    pub fn new(config: PushClientConfig, transport: Arc<dyn EventTransport>, handlers: EventHandlers) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::default());

        let session = Session {
            machine: ReconnectMachine::new(config.backoff.clone()),
            transport,
            handlers: handlers.clone(),
            topic_field: config.topic_field.clone(),
            connect_timeout: config.connect_timeout,
            keepalive_interval: config.keepalive_interval,
            subscriptions: BTreeSet::new(),
            link: None,
            pending_connect: None,
            reconnect_at: None,
            keepalive: None,
            connected_at: None,
            rapid_closes: 0,
            status_tx,
        };
        let task = tokio::spawn(session.run(command_rx));

        Self {
            commands,
            status,
            handlers,
            task: Mutex::new(Some(task)),
        }
    }

    /// A client speaking WebSocket to `config.url`.
    pub fn websocket(config: PushClientConfig, handlers: EventHandlers) -> Self {
        let transport = Arc::new(WsTransport::new(config.url.clone()));
        Self::new(config, transport, handlers)
    }

    /// Starts connecting. No-op while connecting or connected.
    pub fn connect(&self) -> Result<(), PushClientError> {
        self.send(Command::Connect)
    }

    /// Reconnects with a fresh attempt budget, typically after giving up.
    pub fn retry(&self) -> Result<(), PushClientError> {
        self.send(Command::Retry)
    }

    /// Records `topic` and subscribes to it now if connected.
    pub fn subscribe(&self, topic: impl Into<String>) -> Result<(), PushClientError> {
        self.send(Command::Subscribe(topic.into()))
    }

    /// Forgets `topic` and unsubscribes from it now if connected.
    pub fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), PushClientError> {
        self.send(Command::Unsubscribe(topic.into()))
    }

    /// Moves interest from `old` to `new`: unsubscribe first, then subscribe.
    pub fn switch_topic(&self, old: &str, new: &str) -> Result<(), PushClientError> {
        if old != new {
            self.unsubscribe(old)?;
        }
        self.subscribe(new)
    }

    /// Sends an application event. Dropped with a warning while not connected.
    pub fn emit(&self, event: impl Into<String>, data: Value) -> Result<(), PushClientError> {
        self.send(Command::Emit(Envelope::new(event, data)))
    }

    /// Current session snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that sees every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// The handler registry; handlers added here take effect immediately.
    pub fn handlers(&self) -> &EventHandlers {
        &self.handlers
    }

    /// Closes the connection and waits for the background task to finish.
    /// Later calls return [`PushClientError::NotRunning`].
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Push client task failed");
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), PushClientError> {
        self.commands.send(command).map_err(|_| PushClientError::NotRunning)
    }
}

impl std::fmt::Debug for PushClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushClient").field("status", &*self.status.borrow()).finish()
    }
}

type ConnectFuture = BoxFuture<'static, Result<TransportLink, TransportError>>;

/// State owned by the background task.
struct Session {
    machine: ReconnectMachine,
    transport: Arc<dyn EventTransport>,
    handlers: EventHandlers,
    topic_field: String,
    connect_timeout: Duration,
    keepalive_interval: Duration,
    subscriptions: BTreeSet<String>,
    link: Option<TransportLink>,
    pending_connect: Option<ConnectFuture>,
    reconnect_at: Option<Pin<Box<Sleep>>>,
    keepalive: Option<Interval>,
    connected_at: Option<Instant>,
    rapid_closes: u32,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Session {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                result = next_connect(&mut self.pending_connect) => {
                    self.pending_connect = None;
                    self.on_connect_result(result).await;
                }
                signal = next_signal(&mut self.link) => self.on_signal(signal).await,
                () = next_reconnect(&mut self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.apply(ConnectionEvent::ReconnectDue).await;
                }
                () = next_keepalive(&mut self.keepalive) => {
                    self.send(Envelope::ping(chrono::Utc::now().timestamp_millis())).await;
                }
            }
        }

        self.apply(ConnectionEvent::Shutdown).await;
        tracing::debug!("Push client stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.apply(ConnectionEvent::ConnectRequested).await,
            Command::Retry => {
                tracing::info!("Manual push channel retry");
                self.apply(ConnectionEvent::ManualRetry).await;
            }
            Command::Subscribe(topic) => {
                if self.subscriptions.insert(topic.clone()) && self.is_connected() {
                    self.send(Envelope::subscribe(&self.topic_field, &topic)).await;
                }
                self.publish_status();
            }
            Command::Unsubscribe(topic) => {
                if self.subscriptions.remove(&topic) && self.is_connected() {
                    self.send(Envelope::unsubscribe(&self.topic_field, &topic)).await;
                }
                self.publish_status();
            }
            Command::Emit(envelope) => {
                if self.is_connected() {
                    self.send(envelope).await;
                } else {
                    tracing::warn!(event = %envelope.event, state = %self.machine.state(), "Dropping push event while not connected");
                }
            }
            Command::Shutdown => {}
        }
    }

    async fn on_connect_result(&mut self, result: Result<TransportLink, TransportError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.connected_at = Some(Instant::now());
                self.apply(ConnectionEvent::TransportConnected).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = self.machine.attempts() + 1, "Push channel connect failed");
                self.apply(ConnectionEvent::ConnectFailed(e.to_string())).await;
            }
        }
    }

    async fn on_signal(&mut self, signal: Option<TransportSignal>) {
        match signal {
            Some(TransportSignal::Event(envelope)) => self.dispatch(&envelope),
            Some(TransportSignal::Closed(reason)) => {
                self.link = None;
                self.track_rapid_closes(&reason);
                tracing::info!(%reason, "Push channel disconnected");
                self.apply(ConnectionEvent::TransportClosed(reason)).await;
            }
            None => {
                self.link = None;
                let reason = DisconnectReason::TransportFailure("link dropped".to_string());
                self.track_rapid_closes(&reason);
                tracing::warn!(%reason, "Push channel disconnected");
                self.apply(ConnectionEvent::TransportClosed(reason)).await;
            }
        }
    }

    /// Server closes reconnect without backoff, so a backend that accepts and
    /// drops every connection would loop silently. Count those and warn.
    fn track_rapid_closes(&mut self, reason: &DisconnectReason) {
        let lived = self.connected_at.take().map(|at| at.elapsed());
        match (reason, lived) {
            (DisconnectReason::ServerInitiated, Some(lived)) if lived < RAPID_CLOSE_WINDOW => {
                self.rapid_closes = self.rapid_closes.saturating_add(1);
                if self.rapid_closes >= RAPID_CLOSE_WARN_AFTER {
                    tracing::warn!(
                        rapid_closes = self.rapid_closes,
                        lived_ms = lived.as_millis() as u64,
                        "Server keeps closing the push channel right after connect"
                    );
                }
            }
            _ => self.rapid_closes = 0,
        }
    }

    fn dispatch(&self, envelope: &Envelope) {
        if let Some(topic) = envelope.topic(&self.topic_field) {
            if !self.subscriptions.contains(topic) {
                tracing::trace!(event = %envelope.event, topic, "Discarding event for unsubscribed topic");
                return;
            }
        }
        self.handlers.dispatch(envelope);
    }

    /// Feeds one event into the state machine and performs its actions.
    async fn apply(&mut self, event: ConnectionEvent) {
        let before = self.machine.state();
        let actions = self.machine.handle(event);
        let after = self.machine.state();

        if before != after {
            match after {
                ConnectionState::GivingUp => tracing::error!(
                    attempts = self.machine.attempts(),
                    last_error = self.machine.last_error().unwrap_or_default(),
                    "Push channel giving up; waiting for manual retry"
                ),
                _ => tracing::info!(from = %before, to = %after, "Push channel state changed"),
            }
        }

        for action in actions {
            self.perform(action).await;
        }
        self.publish_status();
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::OpenTransport => {
                self.link = None;
                let connect = self.transport.connect();
                let timeout = self.connect_timeout;
                self.pending_connect = Some(Box::pin(async move {
                    tokio::time::timeout(timeout, connect)
                        .await
                        .unwrap_or(Err(TransportError::Timeout(timeout)))
                }));
            }
            Action::CloseTransport => {
                self.pending_connect = None;
                self.link = None;
            }
            Action::ScheduleReconnect(delay) => {
                tracing::info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.machine.attempts(),
                    "Push channel reconnect scheduled"
                );
                self.reconnect_at = Some(Box::pin(sleep(delay)));
            }
            Action::CancelReconnect => self.reconnect_at = None,
            Action::Resubscribe => {
                let topics: Vec<String> = self.subscriptions.iter().cloned().collect();
                if !topics.is_empty() {
                    tracing::debug!(?topics, "Replaying subscriptions");
                }
                for topic in topics {
                    self.send(Envelope::subscribe(&self.topic_field, &topic)).await;
                }
            }
            Action::StartKeepAlive => {
                self.keepalive = (!self.keepalive_interval.is_zero()).then(|| {
                    let period = self.keepalive_interval;
                    let mut keepalive = interval_at(Instant::now() + period, period);
                    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    keepalive
                });
            }
            Action::StopKeepAlive => self.keepalive = None,
        }
    }

    /// Queues `envelope` on the current link. The returned future owns its
    /// sender, so no borrow of the session is held while it waits.
    fn send(&self, envelope: Envelope) -> impl Future<Output = ()> + Send + 'static {
        let outbound = self.link.as_ref().map(|link| link.outbound.clone());
        async move {
            let Some(outbound) = outbound else {
                tracing::debug!(event = %envelope.event, "No push link; event not sent");
                return;
            };
            if let Err(e) = outbound.send(envelope).await {
                tracing::warn!(event = %e.0.event, "Push link closed before event was sent");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.machine.state() == ConnectionState::Connected
    }

    fn publish_status(&self) {
        let next = ConnectionStatus {
            state: self.machine.state(),
            connected: self.is_connected(),
            attempts: self.machine.attempts(),
            last_error: self.machine.last_error().map(str::to_string),
            subscriptions: self.subscriptions.iter().cloned().collect(),
            rapid_server_closes: self.rapid_closes,
        };
        self.status_tx.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
    }
}

async fn next_connect(pending_connect: &mut Option<ConnectFuture>) -> Result<TransportLink, TransportError> {
    match pending_connect {
        Some(connect) => connect.await,
        None => pending().await,
    }
}

async fn next_signal(link: &mut Option<TransportLink>) -> Option<TransportSignal> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => pending().await,
    }
}

async fn next_reconnect(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn next_keepalive(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(keepalive) => {
            keepalive.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::push_client::events::{DASHBOARD_UPDATE_EVENT, PING_EVENT, SUBSCRIBE_EVENT, UNSUBSCRIBE_EVENT};
    use serde_json::json;
    use std::collections::VecDeque;

    #[derive(Clone, Copy)]
    enum Script {
        Accept,
        Refuse(&'static str),
    }

    /// Server side of one accepted link.
    struct ServerEnd {
        from_client: mpsc::Receiver<Envelope>,
        to_client: mpsc::Sender<TransportSignal>,
    }

    impl ServerEnd {
        fn drain(&mut self) -> Vec<Envelope> {
            let mut sent = Vec::new();
            while let Ok(envelope) = self.from_client.try_recv() {
                sent.push(envelope);
            }
            sent
        }
    }

    #[derive(Default)]
    struct ScriptedState {
        script: VecDeque<Script>,
        attempts: Vec<Instant>,
        accepted: VecDeque<ServerEnd>,
    }

    /// Plays back connect outcomes in order; refuses once the script runs out.
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        state: Arc<Mutex<ScriptedState>>,
    }

    impl ScriptedTransport {
        fn new(script: impl IntoIterator<Item = Script>) -> Self {
            let transport = Self::default();
            transport.push(script);
            transport
        }

        fn push(&self, script: impl IntoIterator<Item = Script>) {
            self.state.lock().unwrap().script.extend(script);
        }

        fn attempts(&self) -> Vec<Instant> {
            self.state.lock().unwrap().attempts.clone()
        }

        fn next_link(&self) -> ServerEnd {
            self.state.lock().unwrap().accepted.pop_front().expect("an accepted link")
        }
    }

    impl EventTransport for ScriptedTransport {
        fn connect(&self) -> ConnectFuture {
            let mut state = self.state.lock().unwrap();
            state.attempts.push(Instant::now());
            let result = match state.script.pop_front() {
                Some(Script::Accept) => {
                    let (outbound, from_client) = mpsc::channel(64);
                    let (to_client, inbound) = mpsc::channel(64);
                    state.accepted.push_back(ServerEnd { from_client, to_client });
                    Ok(TransportLink { outbound, inbound })
                }
                Some(Script::Refuse(reason)) => Err(TransportError::Connect(reason.to_string())),
                None => Err(TransportError::Connect("script exhausted".to_string())),
            };
            Box::pin(async move { result })
        }
    }

    fn config(max_attempts: u32) -> PushClientConfig {
        PushClientConfig {
            url: "ws://test/ws".to_string(),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                max_attempts,
            },
            keepalive_interval: Duration::ZERO,
            connect_timeout: Duration::from_secs(1),
            topic_field: DEFAULT_TOPIC_FIELD.to_string(),
        }
    }

    async fn wait_for_state(client: &PushClient, state: ConnectionState) {
        client
            .watch_status()
            .wait_for(|status| status.state == state)
            .await
            .expect("client running");
    }

    /// Lets the session task drain its queue.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn events(sent: &[Envelope]) -> Vec<(String, Option<String>)> {
        sent.iter()
            .map(|e| (e.event.clone(), e.topic(DEFAULT_TOPIC_FIELD).map(str::to_string)))
            .collect()
    }

    fn control(event: &str, topic: &str) -> (String, Option<String>) {
        (event.to_string(), Some(topic.to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_before_connect_are_sent_once_on_connect() {
        let transport = ScriptedTransport::new([Script::Accept]);
        let client = PushClient::new(config(3), Arc::new(transport.clone()), EventHandlers::new());

        client.subscribe("EUR_USD").unwrap();
        client.subscribe("EUR_USD").unwrap();
        client.connect().unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;
        settle().await;

        let mut server = transport.next_link();
        assert_eq!(events(&server.drain()), vec![control(SUBSCRIBE_EVENT, "EUR_USD")]);

        let status = client.status();
        assert!(status.connected);
        assert_eq!(status.attempts, 0);
        assert_eq!(status.subscriptions, vec!["EUR_USD".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_active_topics_once_and_filters_the_rest() {
        let transport = ScriptedTransport::new([Script::Accept, Script::Accept]);
        let updates = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&updates);
        let handlers = EventHandlers::new().on_dashboard_update(move |update| seen.lock().unwrap().push(update.pair.clone()));
        let client = PushClient::new(config(3), Arc::new(transport.clone()), handlers);

        client.connect().unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;
        client.subscribe("EUR_USD").unwrap();
        client.subscribe("GBP_USD").unwrap();
        client.unsubscribe("GBP_USD").unwrap();
        settle().await;

        let mut first = transport.next_link();
        assert_eq!(
            events(&first.drain()),
            vec![
                control(SUBSCRIBE_EVENT, "EUR_USD"),
                control(SUBSCRIBE_EVENT, "GBP_USD"),
                control(UNSUBSCRIBE_EVENT, "GBP_USD"),
            ]
        );

        // Server restart: immediate reconnect, no backoff.
        let before = Instant::now();
        first.to_client.send(TransportSignal::Closed(DisconnectReason::ServerInitiated)).await.unwrap();
        settle().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        assert_eq!(transport.attempts().len(), 2);
        assert!(transport.attempts()[1] - before < Duration::from_millis(50));

        let mut second = transport.next_link();
        settle().await;
        assert_eq!(events(&second.drain()), vec![control(SUBSCRIBE_EVENT, "EUR_USD")]);

        for pair in ["GBP_USD", "EUR_USD", "USD_JPY"] {
            let update = Envelope::new(DASHBOARD_UPDATE_EVENT, json!({ "pair": pair, "open_trades": 2 }));
            second.to_client.send(TransportSignal::Event(update)).await.unwrap();
        }
        settle().await;
        assert_eq!(*updates.lock().unwrap(), vec!["EUR_USD".to_string()]);
        assert_eq!(client.status().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_server_closes_are_counted_until_a_connection_holds() {
        let transport = ScriptedTransport::new([Script::Accept; 5]);
        let client = PushClient::new(config(1), Arc::new(transport.clone()), EventHandlers::new());

        client.connect().unwrap();
        for expected in 1..=4 {
            wait_for_state(&client, ConnectionState::Connected).await;
            let link = transport.next_link();
            link.to_client.send(TransportSignal::Closed(DisconnectReason::ServerInitiated)).await.unwrap();
            settle().await;
            let status = client.status();
            assert_eq!(status.rapid_server_closes, expected);
            // Immediate reconnects never touch the attempt budget.
            assert_eq!(status.attempts, 0);
            assert_ne!(status.state, ConnectionState::GivingUp);
        }

        // A connection that outlives the window ends the streak.
        wait_for_state(&client, ConnectionState::Connected).await;
        let link = transport.next_link();
        sleep(RAPID_CLOSE_WINDOW + Duration::from_secs(1)).await;
        link.to_client.send(TransportSignal::Closed(DisconnectReason::ServerInitiated)).await.unwrap();
        settle().await;
        assert_eq!(client.status().rapid_server_closes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_errors_back_off_then_give_up_until_retry() {
        let transport = ScriptedTransport::new([
            Script::Refuse("refused 1"),
            Script::Refuse("refused 2"),
            Script::Refuse("refused 3"),
            Script::Refuse("refused 4"),
        ]);
        let client = PushClient::new(config(3), Arc::new(transport.clone()), EventHandlers::new());

        client.connect().unwrap();
        wait_for_state(&client, ConnectionState::GivingUp).await;

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<Duration> = attempts.windows(2).map(|pair| pair[1] - pair[0]).collect();
        for (gap, expected) in gaps.iter().zip([100, 200, 400]) {
            let expected = Duration::from_millis(expected);
            assert!(*gap >= expected && *gap < expected + Duration::from_millis(5), "gap {gap:?} vs {expected:?}");
        }

        let status = client.status();
        assert_eq!(status.attempts, 4);
        assert_eq!(status.last_error.as_deref(), Some("connect failed: refused 4"));

        // No fifth automatic attempt.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.attempts().len(), 4);

        transport.push([Script::Accept]);
        client.retry().unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;
        assert_eq!(client.status().attempts, 0);
        assert_eq!(client.status().last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_reconnects_after_backoff() {
        let transport = ScriptedTransport::new([Script::Accept, Script::Accept]);
        let client = PushClient::new(config(3), Arc::new(transport.clone()), EventHandlers::new());

        client.connect().unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;
        let first = transport.next_link();

        let dropped_at = Instant::now();
        drop(first);
        wait_for_state(&client, ConnectionState::Disconnected).await;
        assert_eq!(client.status().attempts, 1);

        wait_for_state(&client, ConnectionState::Connected).await;
        assert!(transport.attempts()[1] - dropped_at >= Duration::from_millis(100));
        assert_eq!(client.status().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_while_connected() {
        let transport = ScriptedTransport::new([Script::Accept]);
        let mut config = config(3);
        config.keepalive_interval = Duration::from_secs(20);
        let client = PushClient::new(config, Arc::new(transport.clone()), EventHandlers::new());

        client.connect().unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;
        let mut server = transport.next_link();

        sleep(Duration::from_secs(19)).await;
        assert!(server.drain().is_empty());

        sleep(Duration::from_secs(42)).await;
        let pings = server.drain();
        assert_eq!(pings.len(), 3);
        assert!(pings.iter().all(|e| e.event == PING_EVENT && e.data["ts"].is_i64()));
    }

    #[tokio::test(start_paused = true)]
    async fn switch_topic_unsubscribes_before_subscribing() {
        let transport = ScriptedTransport::new([Script::Accept]);
        let client = PushClient::new(config(3), Arc::new(transport.clone()), EventHandlers::new());

        client.subscribe("EUR_USD").unwrap();
        client.connect().unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;
        client.switch_topic("EUR_USD", "AUD_USD").unwrap();
        client.emit("note", json!({ "text": "hello" })).unwrap();
        settle().await;

        let mut server = transport.next_link();
        assert_eq!(
            events(&server.drain()),
            vec![
                control(SUBSCRIBE_EVENT, "EUR_USD"),
                control(UNSUBSCRIBE_EVENT, "EUR_USD"),
                control(SUBSCRIBE_EVENT, "AUD_USD"),
                ("note".to_string(), None),
            ]
        );
        assert_eq!(client.status().subscriptions, vec!["AUD_USD".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_while_disconnected_is_dropped() {
        let transport = ScriptedTransport::new([Script::Accept]);
        let client = PushClient::new(config(3), Arc::new(transport.clone()), EventHandlers::new());

        client.emit("note", Value::Null).unwrap();
        client.connect().unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;
        settle().await;

        assert!(transport.next_link().drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_the_link_and_stops_the_client() {
        let transport = ScriptedTransport::new([Script::Accept]);
        let client = PushClient::new(config(3), Arc::new(transport.clone()), EventHandlers::new());

        client.connect().unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;
        let mut server = transport.next_link();

        client.shutdown().await;
        assert_eq!(client.status().state, ConnectionState::Disconnected);
        assert!(server.from_client.recv().await.is_none());
        assert_eq!(client.subscribe("EUR_USD"), Err(PushClientError::NotRunning));
        assert_eq!(client.connect(), Err(PushClientError::NotRunning));
    }
}
