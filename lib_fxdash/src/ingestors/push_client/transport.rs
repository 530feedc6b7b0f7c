//! # Push Transport
//!
//! The connect primitive the push client sits on. A transport only knows how
//! to open one link; reconnecting, backoff and subscriptions are the client's
//! business. A link is a pair of channels so that the client's event loop can
//! `select!` over it next to its own timers and commands.

use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use super::events::Envelope;
use super::state::DisconnectReason;

/// Capacity of the per-link channels.
const LINK_CHANNEL_CAPACITY: usize = 256;

/// Failures to establish or use a link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint could not be reached or refused the handshake.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The handshake did not finish in time.
    #[error("connect timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The configured endpoint is not a usable URL.
    #[error("invalid push endpoint {url}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// What a link reports back to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// An inbound named event.
    Event(Envelope),
    /// The link is gone. Sent once, as the last signal.
    Closed(DisconnectReason),
}

/// One established connection. Dropping `outbound` closes it from the client side.
#[derive(Debug)]
pub struct TransportLink {
    /// Events to send to the server.
    pub outbound: mpsc::Sender<Envelope>,
    /// Events and the final close notification from the server.
    pub inbound: mpsc::Receiver<TransportSignal>,
}

/// A connect primitive for the push-event channel.
pub trait EventTransport: Send + Sync + 'static {
    /// Opens a new link. Each call is an independent connection attempt.
    fn connect(&self) -> BoxFuture<'static, Result<TransportLink, TransportError>>;
}

/// Builds the WebSocket endpoint for the push channel from the backend's
/// HTTP base URL: `http` becomes `ws`, `https` becomes `wss`, and `path`
/// replaces the base path.
pub fn resolve_push_url(base_url: &str, path: &str) -> Result<String, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };

    let mut url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid(format!("cannot switch to scheme '{scheme}'")))?;
    url.set_path(path);
    Ok(url.to_string())
}

/// # WebSocket Transport
///
/// Speaks JSON text frames of the form `{"event": "...", "data": ...}` over
/// `tokio-tungstenite`. Each link is served by one pump task that owns the
/// socket; the pump classifies how the socket ended so the client can choose
/// between reconnecting immediately and backing off.
#[derive(Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// A transport for the given `ws://` or `wss://` endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The endpoint this transport connects to.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTransport").field("url", &self.url).finish()
    }
}

impl EventTransport for WsTransport {
    fn connect(&self) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        let url = self.url.clone();
        Box::pin(async move {
            tracing::debug!(%url, "Opening push channel");
            let (socket, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            let (outbound_tx, outbound_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
            let (inbound_tx, inbound_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
            tokio::spawn(pump(socket, outbound_rx, inbound_tx));

            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Moves frames between the socket and the link channels until either side ends.
async fn pump(
    socket: Socket,
    mut outbound: mpsc::Receiver<Envelope>,
    inbound: mpsc::Sender<TransportSignal>,
) {
    let (mut sink, mut source) = socket.split();

    let reason = loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(event = %envelope.event, error = %e, "Dropping unencodable push event");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        break DisconnectReason::TransportFailure(e.to_string());
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break DisconnectReason::ClientInitiated;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Envelope>(text.as_str()) {
                    Ok(envelope) => {
                        if inbound.send(TransportSignal::Event(envelope)).await.is_err() {
                            break DisconnectReason::ClientInitiated;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed push frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Push channel closed by server");
                    break DisconnectReason::ServerInitiated;
                }
                // Ping, pong and binary frames carry no events.
                Some(Ok(_)) => {}
                Some(Err(e)) => break DisconnectReason::TransportFailure(e.to_string()),
                None => break DisconnectReason::TransportFailure("stream ended without close frame".to_string()),
            },
        }
    };

    tracing::debug!(%reason, "Push channel pump finished");
    let _ = inbound.send(TransportSignal::Closed(reason)).await;
}
