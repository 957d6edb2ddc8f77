//! HTTP/WebSocket surface: `/ws` upgrades into the connection handler,
//! `/rpc/{method}` exposes the registry's management calls, `/health`
//! reports liveness.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use parlor_core::conn::UserAttrs;
use parlor_core::rpc::{dispatch, CallCtx, MethodMap};

use crate::client::{handle_ws_connection, ConnRegistry};
use crate::registry::{manager_methods, start_reaper, ManagerRpc, RoomRegistry, RoomTypes};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Outbound frames buffered per connection before pushes are dropped.
    pub max_send_queue: usize,
    /// Concurrent envelope workers across all connections.
    pub worker_permits: usize,
    /// Idle-reaper period. Zero disables the reaper.
    pub reap_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            max_send_queue: 256,
            worker_permits: 16,
            reap_interval_secs: 3600,
        }
    }
}

struct AppState {
    registry: Arc<RoomRegistry>,
    conns: Arc<ConnRegistry>,
    permits: Arc<Semaphore>,
    manager: MethodMap,
    send_queue: usize,
}

/// Running server. Dropping the handle stops the accept loop and the
/// reaper.
pub struct ServerHandle {
    port: u16,
    registry: Arc<RoomRegistry>,
    server: JoinHandle<()>,
    reaper: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.server.abort();
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
    }
}

/// Bind the listener and start serving. `types` is the full table of room
/// types this deployment offers.
pub async fn start(config: ServerConfig, types: RoomTypes) -> io::Result<ServerHandle> {
    let manager = manager_methods().map_err(io::Error::other)?;
    let registry = Arc::new(RoomRegistry::new(types));
    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        conns: Arc::new(ConnRegistry::new()),
        permits: Arc::new(Semaphore::new(config.worker_permits)),
        manager,
        send_queue: config.max_send_queue,
    });

    let router = build_router(state);
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
    let port = listener.local_addr()?.port();
    tracing::info!(port, "server listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!(error = %err, "server task exited");
        }
    });

    let reaper = (config.reap_interval_secs > 0).then(|| {
        start_reaper(
            Arc::clone(&registry),
            Duration::from_secs(config.reap_interval_secs),
        )
    });

    Ok(ServerHandle {
        port,
        registry,
        server,
        reaper,
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rpc/{method}", post(rpc_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_ws_connection(
            socket,
            UserAttrs::with_addr(addr.to_string()),
            Arc::clone(&state.registry),
            Arc::clone(&state.conns),
            Arc::clone(&state.permits),
            state.send_queue,
        )
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "rooms": state.registry.count(),
        "connections": state.conns.count(),
    }))
}

/// Management RPC over plain HTTP. The receiver is stack-local, so
/// concurrent management calls only contend on the registry itself.
async fn rpc_handler(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
    body: Option<Json<Value>>,
) -> Json<Value> {
    let params = body.map(|Json(value)| value);
    let mut manager = ManagerRpc::new(Arc::clone(&state.registry));
    match dispatch(
        &state.manager,
        &method,
        params.as_ref(),
        CallCtx::empty(),
        &mut manager,
    ) {
        Ok(result) => Json(json!({
            "success": true,
            "result": result.unwrap_or(Value::Null),
        })),
        Err(err) => {
            tracing::warn!(method, error = %err, "management call failed");
            Json(json!({
                "success": false,
                "error": {"code": err.code(), "message": err.to_string()},
            }))
        }
    }
}
