//! Rat room sync hub.
//!
//! Watches world state through the [`adapter`], fans the resulting
//! messages out through the [`hub`], and serves them over WebSockets at
//! `/ws-connect/{rat_id}`.
//!
//! Nothing runs on load. The process entry point calls [`initialize`] and
//! drives the returned [`ServerHandle`].

pub mod adapter;
pub mod config;
pub mod hub;
pub mod registry;
mod routes;
mod transport;

pub use adapter::{AdapterStats, EventAdapter, NormalizationError, RawWorldEvent, normalize};
pub use config::{ChainConfig, Config, ConfigError, HubConfig, PrivateKey};
pub use hub::{Hub, HubError, LeaveReason, Registration};
pub use registry::{CloseReason, ConnectionId, DuplicatePolicy, Outbound};

use axum::Router;
use axum::routing::get;
use ratroom_core::WS_CONNECT_PATH;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub(crate) struct AppState {
    hub: Hub,
    config: Arc<HubConfig>,
}

/// Build the HTTP + WebSocket router around a running hub.
pub fn router(hub: Hub, config: HubConfig) -> Router {
    let state = AppState {
        hub,
        config: Arc::new(config),
    };

    Router::new()
        .route(
            &format!("{WS_CONNECT_PATH}/{{rat_id}}"),
            get(transport::ws_connect),
        )
        .route("/clients", get(routes::clients))
        .route("/events/latest", get(routes::latest_events))
        .route("/test/ping", get(routes::ping))
        .route("/test/throw", get(routes::throw))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A running server.
pub struct ServerHandle {
    hub: Hub,
    chain: ChainConfig,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<std::io::Result<()>>,
}

/// Start the hub and the HTTP server.
pub async fn initialize(config: Config) -> Result<ServerHandle, InitError> {
    config.hub.validate()?;

    let hub = Hub::spawn(&config.hub);
    let app = router(hub.clone(), config.hub.clone());

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|source| InitError::Bind {
            addr: config.listen,
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| InitError::Bind {
        addr: config.listen,
        source,
    })?;
    tracing::info!(chain_id = config.chain.chain_id(), "Listening on http://{}", local_addr);

    let (shutdown, signal) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = signal.await;
            })
            .await
    });

    Ok(ServerHandle {
        hub,
        chain: config.chain,
        local_addr,
        shutdown: Some(shutdown),
        server,
    })
}

impl ServerHandle {
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A world-state adapter wired to this server's hub.
    pub fn adapter(&self) -> EventAdapter {
        EventAdapter::new(self.hub.clone(), &self.chain)
    }

    /// Close every connection and stop serving.
    pub async fn shutdown(mut self) -> std::io::Result<()> {
        self.hub.shutdown();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.server.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}
