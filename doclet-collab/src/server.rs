//! HTTP surface of the collaboration hub.
//!
//! Architecture:
//! ```text
//!                     ┌──────────────── CollabServer ────────────────┐
//!  GET /healthz ────► │ 200                                          │
//!                     │                                              │
//!  GET /ws?document_id│  upgrade ─► ConnectionActor ─► MessageRouter │
//!     &client_id ───► │                 ▲                  │   │     │
//!                     │                 │           registry   bridge ──► broker
//!                     │                 └────── relay ◄──────────┘     │
//!                     └──────────────────────────────────────────────┘
//! ```
//!
//! Every actor future is tracked so shutdown can wait for connections to
//! say goodbye before the broker subscriptions are released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::actor::{ActorConfig, ConnectionActor};
use crate::bridge::{BridgeStats, BrokerBridge};
use crate::broker::Broker;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::registry::{ConnectionRegistry, RegistryStats};
use crate::router::MessageRouter;

/// Body of the 400 returned for an incomplete join request.
pub const MISSING_PARAMS: &str = "missing document_id or client_id";

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub decode_failures: u64,
    pub registry: RegistryStats,
    pub bridge: Option<BridgeStats>,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
}

/// Query string of `GET /ws`.
#[derive(Debug, Deserialize)]
struct JoinParams {
    document_id: Option<String>,
    client_id: Option<String>,
}

#[derive(Clone)]
struct AppState {
    router: Arc<MessageRouter>,
    actor: ActorConfig,
    queue_capacity: usize,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<AtomicServerStats>,
}

/// The collaboration hub.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    bridge: Option<Arc<BrokerBridge>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    /// Hub that shares events with other instances through `broker`.
    pub fn new(config: ServerConfig, broker: Arc<dyn Broker>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(BrokerBridge::new(
            broker,
            config.subject_namespace.clone(),
            registry.clone(),
        ));
        let router = Arc::new(MessageRouter::new(registry.clone(), bridge.clone()));
        Self::assemble(config, registry, router, Some(bridge))
    }

    /// Hub serving only its own connections.
    pub fn local(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(MessageRouter::local(registry.clone()));
        Self::assemble(config, registry, router, None)
    }

    fn assemble(
        config: ServerConfig,
        registry: Arc<ConnectionRegistry>,
        router: Arc<MessageRouter>,
        bridge: Option<Arc<BrokerBridge>>,
    ) -> Self {
        Self {
            config,
            registry,
            router,
            bridge,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Subscribe to the broker. Must succeed before serving.
    pub async fn start(&self) -> Result<()> {
        if let Some(bridge) = &self.bridge {
            bridge.start().await?;
        }
        Ok(())
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            router: self.router.clone(),
            actor: ActorConfig::from(&self.config),
            queue_capacity: self.config.outbound_queue_capacity,
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
            stats: self.stats.clone(),
        };

        Router::new()
            .route("/healthz", get(healthz))
            .route("/ws", get(ws_handler))
            .with_state(state)
    }

    /// Bind `config.bind_addr` and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on `listener` until [`shutdown`](Self::shutdown) is called,
    /// then drain connections and release the broker.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        log::info!("collaboration hub listening on {}", listener.local_addr()?);

        let token = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;

        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        self.tracker.close();
        log::info!("waiting for {} connections to close", self.tracker.len());
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            log::warn!(
                "shutdown grace of {:?} elapsed with {} connections open",
                self.config.shutdown_grace,
                self.tracker.len()
            );
        }
        if let Some(bridge) = &self.bridge {
            bridge.shutdown().await;
        }
        log::info!("collaboration hub stopped");
    }

    /// Stop accepting connections and close the open ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> Option<&Arc<BrokerBridge>> {
        self.bridge.as_ref()
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_received: self.router.frames_received(),
            decode_failures: self.router.decode_failures(),
            registry: self.registry.stats().await,
            bridge: self.bridge.as_ref().map(|bridge| bridge.stats()),
        }
    }
}

/// GET /healthz
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<JoinParams>,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (Some(document_id), Some(client_id)) =
        (non_blank(params.document_id), non_blank(params.client_id))
    else {
        return (StatusCode::BAD_REQUEST, MISSING_PARAMS).into_response();
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    if state.shutdown.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    log::debug!("upgrading client {client_id} on document {document_id}");
    let tracker = state.tracker.clone();
    upgrade
        .max_message_size(state.actor.max_frame_bytes)
        .on_upgrade(move |socket| {
            tracker.track_future(handle_socket(state, socket, document_id, client_id))
        })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn handle_socket(state: AppState, socket: WebSocket, document_id: String, client_id: String) {
    state.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    state.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let (conn, outbound) = Connection::new(document_id, client_id, state.queue_capacity);
    let (sink, stream) = socket.split();
    ConnectionActor::new(conn, state.router, state.actor, state.shutdown)
        .run(sink, stream, outbound)
        .await;

    state.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
}
