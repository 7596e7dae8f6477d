//! Client transport.
//!
//! Keeps a WebSocket open to the hub, feeds every frame into a [`Mirror`],
//! and measures round-trip time with ping/pong.

use crate::mirror::{Applied, Mirror};
use futures_util::{SinkExt, StreamExt};
use ratroom_core::{ConnectionState, RatId, RatIdError, WS_CONNECT_PATH};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid rat id: {0}")]
    InvalidRatId(#[from] RatIdError),
    #[error("hub url must start with ws:// or wss://, got {0:?}")]
    InvalidUrl(String),
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub base url, e.g. `ws://localhost:3131`.
    pub base_url: String,
    pub rat_id: RatId,
    pub ping_interval: Duration,
    /// Retry after the connection drops.
    pub reconnect: bool,
    pub max_backoff: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, rat_id: &str) -> Result<Self, ClientError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("ws://") || base_url.starts_with("wss://")) {
            return Err(ClientError::InvalidUrl(base_url));
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            rat_id: rat_id.parse()?,
            ping_interval: Duration::from_secs(10),
            reconnect: true,
            max_backoff: Duration::from_secs(30),
        })
    }

    /// Full WebSocket url for this client.
    pub fn url(&self) -> String {
        format!("{}{}/{}", self.base_url, WS_CONNECT_PATH, self.rat_id)
    }
}

/// A running client. Dropping it stops the connection.
pub struct ClientHandle {
    mirror: Mirror,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Connect in the background, keeping `mirror` up to date.
pub fn connect(config: ClientConfig, mirror: Mirror) -> ClientHandle {
    let (stop, stopped) = oneshot::channel();
    let task = tokio::spawn(run(config, mirror.clone(), stopped));
    ClientHandle {
        mirror,
        stop: Some(stop),
        task,
    }
}

impl ClientHandle {
    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    /// Send a close frame and wait for the task to finish.
    pub async fn close(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.task.await;
    }

    /// Drop the connection without a close handshake.
    pub fn abort(self) {
        self.task.abort();
        self.mirror.set_state(ConnectionState::Closed);
    }
}

enum Ended {
    /// Asked to stop.
    Stopped,
    /// Another connection took over this rat id.
    Replaced,
    /// Connection dropped; may retry.
    Lost,
}

async fn run(config: ClientConfig, mirror: Mirror, mut stopped: oneshot::Receiver<()>) {
    let url = config.url();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let attempt = tokio::select! {
            _ = &mut stopped => break,
            attempt = tokio_tungstenite::connect_async(url.as_str()) => attempt,
        };

        match attempt {
            Ok((ws, _)) => {
                tracing::info!(rat_id = %config.rat_id, "Connected to {}", url);
                backoff = INITIAL_BACKOFF;
                match session(ws, &config, &mirror, &mut stopped).await {
                    Ended::Stopped | Ended::Replaced => break,
                    Ended::Lost => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot connect to {}: {}", url, e);
            }
        }

        if !config.reconnect {
            break;
        }
        mirror.set_state(ConnectionState::Reconnecting);

        tokio::select! {
            _ = &mut stopped => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }

    mirror.set_state(ConnectionState::Closed);
}

async fn session(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: &ClientConfig,
    mirror: &Mirror,
    stopped: &mut oneshot::Receiver<()>,
) -> Ended {
    let (mut sink, mut stream) = ws.split();
    mirror.begin_session();
    mirror.set_state(ConnectionState::Live);

    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    let mut seq: u64 = 0;
    let mut pending: Option<(u64, Instant)> = None;

    loop {
        tokio::select! {
            _ = &mut *stopped => {
                let _ = sink.send(Message::Close(None)).await;
                return Ended::Stopped;
            }

            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::warn!("Connection lost: {}", e);
                        return Ended::Lost;
                    }
                    None => return Ended::Lost,
                };

                match msg {
                    Message::Text(text) => match mirror.apply_text(text.as_str()) {
                        Ok(Applied::Updated(kind)) => tracing::trace!(kind, "Applied"),
                        Ok(Applied::Ignored(kind)) => {
                            tracing::debug!(kind = %kind, "Ignoring unknown message type");
                        }
                        Err(e) => tracing::warn!("Discarding frame: {}", e),
                    },
                    Message::Pong(payload) => {
                        if let Some((want, sent)) = pending
                            && payload[..] == want.to_be_bytes()
                        {
                            mirror.record_round_trip(sent.elapsed());
                            pending = None;
                        }
                    }
                    Message::Close(frame) => {
                        let replaced = frame
                            .as_ref()
                            .is_some_and(|f| f.reason.as_str() == "replaced");
                        tracing::info!(replaced, "Hub closed the connection");
                        return if replaced { Ended::Replaced } else { Ended::Lost };
                    }
                    _ => {}
                }
            }

            _ = ping.tick() => {
                seq += 1;
                pending = Some((seq, Instant::now()));
                if sink.send(Message::Ping(seq.to_be_bytes().to_vec().into())).await.is_err() {
                    return Ended::Lost;
                }
            }
        }
    }
}
