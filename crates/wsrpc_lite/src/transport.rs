//! Connection lifecycle: socket state, reconnect backoff, error-rate
//! sampling, and the websocket/stateless transport drivers.
//!
//! The worker task owns all of this state; connect attempts and
//! stateless POSTs run on short-lived spawned tasks and funnel their
//! outcomes back through the worker's event channel.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Bytes;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::client::ClientConfig;
use crate::outbox::OutboxEntry;

pub(crate) use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsError = tokio_tungstenite::tungstenite::Error;

/// Connection lifecycle states.
///
/// `Degraded` is terminal: once latched, the persistent socket is never
/// attempted again for the life of the client instance and all traffic
/// rides the polled stateless transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Degraded,
}

/// Events funneled into the worker from spawned I/O tasks.
pub(crate) enum TransportEvent {
    Connected(Box<WsStream>),
    ConnectFailed,
    /// Outcome of a stateless POST. The entry rides along so a failed
    /// attempt can be re-queued at the head of the outbox.
    HttpDone {
        entry: OutboxEntry,
        result: Result<String, reqwest::Error>,
    },
}

/// Reconnect backoff: multiplicative growth from a floor up to a
/// ceiling, reset to the floor after one successful handshake.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    current: Duration,
    floor: Duration,
    ceiling: Duration,
    factor: u32,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration, factor: u32) -> Self {
        Self {
            current: floor,
            floor,
            ceiling,
            factor,
        }
    }

    /// Delay before the next attempt; grows the delay for the attempt
    /// after that.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * self.factor).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Counts transport errors per sampling window. A window that closes
/// over the threshold latches the client into degraded mode.
#[derive(Debug)]
pub(crate) struct ErrorSampler {
    count: u32,
    threshold: u32,
}

impl ErrorSampler {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    pub fn record(&mut self) {
        self.count += 1;
    }

    /// Close the current window: report whether the threshold was
    /// exceeded and start the next window from zero.
    pub fn close_window(&mut self) -> bool {
        let exceeded = self.count > self.threshold;
        self.count = 0;
        exceeded
    }
}

pub(crate) struct TransportManager {
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    pub ws_url: Url,
    pub http_url: Url,
    pub backoff: Backoff,
    pub sampler: ErrorSampler,
}

impl TransportManager {
    pub fn new(
        cfg: &ClientConfig,
    ) -> Result<(Self, watch::Receiver<ConnectionState>), url::ParseError> {
        let (ws_url, http_url) = derive_urls(&cfg.endpoint, cfg.secure)?;
        let initial = if cfg.disable_websocket {
            ConnectionState::Degraded
        } else {
            ConnectionState::Connecting
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let manager = Self {
            state: initial,
            state_tx,
            ws_url,
            http_url,
            backoff: Backoff::new(
                cfg.reconnect_floor,
                cfg.reconnect_ceiling,
                cfg.reconnect_factor,
            ),
            sampler: ErrorSampler::new(cfg.error_threshold),
        };
        Ok((manager, state_rx))
    }

    /// Apply a state transition. Degraded is a one-way latch: once
    /// latched, every later transition is ignored.
    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state == ConnectionState::Degraded {
            return;
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn is_degraded(&self) -> bool {
        self.state == ConnectionState::Degraded
    }
}

/// Derive the socket and stateless URLs from one endpoint. Secure
/// endpoints use wss/https, insecure ones ws/http; the authority and
/// path are shared.
fn derive_urls(endpoint: &str, secure: bool) -> Result<(Url, Url), url::ParseError> {
    let (ws_scheme, http_scheme) = if secure {
        ("wss", "https")
    } else {
        ("ws", "http")
    };
    let ws_url = Url::parse(&format!("{ws_scheme}://{endpoint}"))?;
    let http_url = Url::parse(&format!("{http_scheme}://{endpoint}"))?;
    Ok((ws_url, http_url))
}

/// The worker-owned persistent socket, absent while disconnected.
pub(crate) enum Socket {
    Closed,
    Open(Box<WsStream>),
}

impl Socket {
    /// Next raw frame. Pends forever while no socket is open, so the
    /// worker can select on it unconditionally.
    pub async fn next_frame(&mut self) -> Option<Result<WsMessage, WsError>> {
        match self {
            Socket::Open(ws) => ws.next().await,
            Socket::Closed => std::future::pending().await,
        }
    }

    pub async fn send_text(&mut self, payload: &str) -> Result<(), WsError> {
        match self {
            Socket::Open(ws) => ws.send(WsMessage::Text(payload.to_string().into())).await,
            Socket::Closed => Err(WsError::ConnectionClosed),
        }
    }

    pub async fn send_pong(&mut self, data: Bytes) -> Result<(), WsError> {
        match self {
            Socket::Open(ws) => ws.send(WsMessage::Pong(data)).await,
            Socket::Closed => Err(WsError::ConnectionClosed),
        }
    }

    /// Best-effort close; the socket is gone either way.
    pub async fn close(&mut self) {
        if let Socket::Open(ws) = self {
            let _ = ws.close().await;
        }
        *self = Socket::Closed;
    }
}

/// Attempt the websocket handshake off the worker task, funneling the
/// outcome back as a `TransportEvent`.
pub(crate) fn spawn_connect(
    ws_url: Url,
    timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        let event = match tokio::time::timeout(timeout, connect_async(ws_url.as_str())).await {
            Ok(Ok((stream, _response))) => TransportEvent::Connected(Box::new(stream)),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "websocket handshake failed");
                TransportEvent::ConnectFailed
            }
            Err(_) => {
                tracing::debug!("websocket handshake timed out");
                TransportEvent::ConnectFailed
            }
        };
        let _ = events.send(event);
    });
}

/// POST one serialized group to the stateless endpoint, funneling the
/// response body (or the failure) back with the entry it belongs to.
///
/// Error responses still carry an envelope body, so the status code is
/// not inspected here; an unparseable body is the dispatcher's problem.
pub(crate) fn spawn_post(
    http: reqwest::Client,
    url: Url,
    entry: OutboxEntry,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    tokio::spawn(async move {
        let result = async {
            let response = http.post(url).body(entry.payload.clone()).send().await?;
            response.text().await
        }
        .await;
        let _ = events.send(TransportEvent::HttpDone { entry, result });
    });
}
