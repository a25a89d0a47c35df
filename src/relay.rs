//! One long-lived subscription per relay.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::RelayError,
    event::Event,
    message::{ClientMessage, RelayMessage, SubscriptionFilter},
};

/// How far past the local clock an event's `created_at` may move the cursor.
pub const CURSOR_SKEW_SECS: u64 = 300;

pub type RelayStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Connection lifecycle of a single relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Closing,
}

/// An event read from a relay, on its way to the router.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub relay: String,
    pub event: Event,
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub tor_socks: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// Owns the connection to one relay. A manager runs once; a supervisor that
/// wants to reconnect builds a new one.
pub struct RelayManager {
    index: usize,
    url: String,
    opts: RelayOptions,
    state: RelayState,
    latest: Option<u64>,
    forwarded: u64,
}

impl RelayManager {
    pub fn new(index: usize, url: &str, opts: RelayOptions) -> Self {
        Self {
            index,
            url: url.to_string(),
            opts,
            state: RelayState::Disconnected,
            latest: None,
            forwarded: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Largest `created_at` among events forwarded on this connection, capped
    /// at [`CURSOR_SKEW_SECS`] past the local clock.
    pub fn latest(&self) -> Option<u64> {
        self.latest
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    fn transition(&mut self, next: RelayState) {
        tracing::debug!(relay = %self.url, from = ?self.state, to = ?next, "relay state");
        self.state = next;
    }

    /// Connect, subscribe with `filter`, and forward events into `tx` until
    /// `cancel` fires or the connection fails.
    pub async fn run(
        &mut self,
        filter: &SubscriptionFilter,
        tx: mpsc::Sender<Inbound>,
        cancel: CancellationToken,
    ) -> Result<(), RelayError> {
        self.transition(RelayState::Connecting);
        let connect = tokio::time::timeout(
            self.opts.connect_timeout,
            connect_ws(&self.url, self.opts.tor_socks.as_deref()),
        );
        let mut ws = tokio::select! {
            _ = cancel.cancelled() => {
                self.transition(RelayState::Disconnected);
                return Ok(());
            }
            res = connect => match res {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    self.transition(RelayState::Disconnected);
                    return Err(e);
                }
                Err(_) => {
                    self.transition(RelayState::Disconnected);
                    return Err(RelayError::Timeout(self.opts.connect_timeout.as_secs()));
                }
            },
        };

        let sub_id = subscription_id(self.index);
        let req = ClientMessage::Req {
            sub_id: &sub_id,
            filter,
        };
        if let Err(e) = ws.send(Message::Text(req.to_json())).await {
            self.transition(RelayState::Disconnected);
            return Err(e.into());
        }
        self.transition(RelayState::Subscribed);
        tracing::info!(relay = %self.url, %sub_id, since = filter.since, "subscribed");

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = tokio::time::timeout(self.opts.read_timeout, ws.next()) => frame,
            };
            let msg = match frame {
                Err(_) => continue,
                Ok(None) => {
                    tracing::warn!(relay = %self.url, "connection closed by relay");
                    self.transition(RelayState::Disconnected);
                    return Ok(());
                }
                Ok(Some(Err(e))) => {
                    self.transition(RelayState::Disconnected);
                    return Err(e.into());
                }
                Ok(Some(Ok(msg))) => msg,
            };
            match msg {
                Message::Text(txt) => {
                    if !self.on_frame(&txt, &sub_id, &tx) {
                        break;
                    }
                }
                Message::Close(_) => {
                    tracing::warn!(relay = %self.url, "relay sent close");
                    self.transition(RelayState::Disconnected);
                    return Ok(());
                }
                _ => {}
            }
        }

        self.transition(RelayState::Closing);
        let close = ClientMessage::Close { sub_id: &sub_id };
        if let Err(e) = ws.send(Message::Text(close.to_json())).await {
            tracing::debug!(relay = %self.url, error = %e, "close frame not sent");
        }
        if let Err(e) = ws.close(None).await {
            tracing::debug!(relay = %self.url, error = %e, "websocket close failed");
        }
        self.transition(RelayState::Disconnected);
        tracing::info!(relay = %self.url, forwarded = self.forwarded, "relay closed");
        Ok(())
    }

    /// Handle one text frame. Returns `false` when the read loop should stop.
    fn on_frame(&mut self, txt: &str, sub_id: &str, tx: &mpsc::Sender<Inbound>) -> bool {
        if self.state == RelayState::Subscribed {
            self.transition(RelayState::Streaming);
        }
        let Some(msg) = RelayMessage::parse(txt) else {
            tracing::debug!(relay = %self.url, "dropping unrecognized frame");
            return true;
        };
        match msg {
            RelayMessage::Event { sub_id: sub, event } => {
                if sub != sub_id {
                    tracing::debug!(relay = %self.url, %sub, "event for unknown subscription");
                    return true;
                }
                let created_at = event.created_at.min(unix_now() + CURSOR_SKEW_SECS);
                let inbound = Inbound {
                    relay: self.url.clone(),
                    event: *event,
                };
                match tx.try_send(inbound) {
                    Ok(()) => {
                        self.forwarded += 1;
                        self.latest = Some(self.latest.unwrap_or(0).max(created_at));
                    }
                    Err(mpsc::error::TrySendError::Full(dropped)) => {
                        tracing::warn!(relay = %self.url, event_id = %dropped.event.id, "dispatch queue full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::debug!(relay = %self.url, "dispatcher gone");
                        return false;
                    }
                }
            }
            RelayMessage::Notice(text) => tracing::info!(relay = %self.url, %text, "notice"),
            RelayMessage::Eose(_) => tracing::debug!(relay = %self.url, "end of stored events"),
            RelayMessage::Ok {
                event_id, accepted, ..
            } => tracing::debug!(relay = %self.url, %event_id, accepted, "unexpected OK"),
            RelayMessage::Closed { sub_id: sub, message } => {
                if sub == sub_id {
                    tracing::warn!(relay = %self.url, %message, "subscription closed by relay");
                    return false;
                }
            }
        }
        true
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Subscription id unique to this connection: relay index plus start time.
pub fn subscription_id(index: usize) -> String {
    format!("nostremail-{index}-{}", unix_now())
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
pub async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<RelayStream, RelayError> {
    let url = Url::parse(relay)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(RelayError::Address(relay.to_string()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::Address(relay.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RelayError::Address(relay.to_string()))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Open and cleanly close a connection to check that `relay` is reachable.
pub async fn probe(relay: &str, tor_socks: Option<&str>, timeout: Duration) -> Result<(), RelayError> {
    let mut ws = tokio::time::timeout(timeout, connect_ws(relay, tor_socks))
        .await
        .map_err(|_| RelayError::Timeout(timeout.as_secs()))??;
    ws.close(None).await?;
    Ok(())
}

/// Blanket trait for boxed async read/write streams.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
