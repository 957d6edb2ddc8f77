//! Per-connection plumbing: the WebSocket reader/writer split, the bind
//! control message, and envelope multiplexing into the room registry.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Semaphore};

use parlor_core::conn::{ConnHandle, OutboundFrame, UserAttrs};
use parlor_core::ids::ConnId;
use parlor_core::wire::{BindRequest, Envelope, ErrorFrame, BIND_METHOD};

use crate::registry::RoomRegistry;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// All currently open connections, keyed by id. Purely for accounting;
/// routing goes through the handles held by room rosters.
pub struct ConnRegistry {
    conns: DashMap<ConnId, ConnHandle>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        user: UserAttrs,
        send_queue: usize,
    ) -> (ConnHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(send_queue);
        let conn = ConnHandle::new(tx, user);
        self.conns.insert(conn.id().clone(), conn.clone());
        (conn, rx)
    }

    pub fn unregister(&self, id: &ConnId) {
        self.conns.remove(id);
    }

    pub fn count(&self) -> usize {
        self.conns.len()
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive one WebSocket connection to completion.
///
/// The writer half lives in its own task, draining the connection's send
/// queue and keeping the socket alive with periodic pings. The reader
/// half parses envelopes and hands each one to a worker task, gated by
/// the shared permit pool so one chatty client cannot monopolize the
/// server. On any exit path the connection is unbound and unregistered.
pub async fn handle_ws_connection(
    socket: WebSocket,
    user: UserAttrs,
    registry: Arc<RoomRegistry>,
    conns: Arc<ConnRegistry>,
    permits: Arc<Semaphore>,
    send_queue: usize,
) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut rx) = conns.register(user, send_queue);
    tracing::info!(conn_id = %conn.id(), "connection opened");

    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close) => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let registry = Arc::clone(&registry);
                let conn = conn.clone();
                tokio::spawn(async move {
                    handle_envelope(&registry, &conn, text.as_str());
                    drop(permit);
                });
            }
            Message::Close(_) => break,
            // Pings are answered by the transport layer.
            _ => {}
        }
    }

    if let Some(room_id) = conn.bound_room() {
        registry.unbind(room_id, &conn);
    }
    conns.unregister(conn.id());
    writer.abort();
    tracing::info!(conn_id = %conn.id(), "connection closed");
}

/// Multiplex one inbound envelope.
///
/// The bind control message is intercepted here; everything else goes to
/// the registry against the connection's bound room, and a non-void
/// result is pushed back to the originating connection.
pub fn handle_envelope(registry: &RoomRegistry, conn: &ConnHandle, raw: &str) {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(conn_id = %conn.id(), error = %err, "unparseable envelope");
            conn.push_json(&ErrorFrame::parse_error());
            return;
        }
    };

    if envelope.method_name == BIND_METHOD {
        handle_bind(registry, conn, envelope.params);
        return;
    }

    let Some(room_id) = conn.bound_room() else {
        conn.push_json(&ErrorFrame::invalid_request(
            "connection is not bound to a room",
        ));
        return;
    };

    if let Some(result) = registry.invoke(
        room_id,
        &envelope.method_name,
        envelope.params.as_ref(),
        Some(conn),
    ) {
        conn.push_json(&result);
    }
}

fn handle_bind(registry: &RoomRegistry, conn: &ConnHandle, params: Option<serde_json::Value>) {
    let request: BindRequest =
        match serde_json::from_value(params.unwrap_or(serde_json::Value::Null)) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(conn_id = %conn.id(), error = %err, "malformed bind request");
                conn.push_json(&ErrorFrame::invalid_request("malformed bind request"));
                return;
            }
        };

    // The whole unbind-old + bind-new transaction runs under the
    // connection's rebind lock; workers may process two bind envelopes
    // concurrently, and the connection must never sit in two rosters.
    let _rebind = conn.bind_guard();
    let bound = conn.bound_room();
    if bound == Some(request.room_id) {
        return;
    }
    if let Some(old) = bound {
        registry.unbind(old, conn);
    }

    match registry.bind(request.room_id, conn, request.bind_params.as_ref()) {
        // A rejecting room has already pushed its reason.
        Ok(_accepted) => {}
        Err(err) => {
            tracing::warn!(conn_id = %conn.id(), error = %err, "bind failed");
            conn.push_json(&ErrorFrame::from(&err));
        }
    }
}
