use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ids::{ConnId, RoomId};

/// Ambient attributes resolved when a connection is accepted.
/// Immutable for the lifetime of the connection.
#[derive(Clone, Debug)]
pub struct UserAttrs {
    pub user_id: Uuid,
    pub remote_addr: Option<String>,
}

impl UserAttrs {
    pub fn anonymous() -> Self {
        Self {
            user_id: Uuid::new_v4(),
            remote_addr: None,
        }
    }

    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            remote_addr: Some(addr.into()),
            ..Self::anonymous()
        }
    }
}

/// Frame handed to the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Ask the writer to close the socket (sent when a room is removed).
    Close,
}

#[derive(Debug)]
struct ConnInner {
    id: ConnId,
    tx: mpsc::Sender<OutboundFrame>,
    /// Zero-or-one bound room. Read by the multiplexer on every envelope,
    /// written only on bind/unbind.
    bound: Mutex<Option<RoomId>>,
    /// Serializes whole rebind transactions (unbind old + bind new).
    /// Never held while `bound` is locked by a third party: room locks are
    /// only ever taken after this one, so the order is binding -> room ->
    /// bound slot.
    binding: Mutex<()>,
    user: UserAttrs,
}

/// Handle to one physical connection. Cheap to clone; equality is by id.
///
/// Pushes are fire-and-forget: a full or closed send queue is logged and
/// never fails the caller.
#[derive(Clone, Debug)]
pub struct ConnHandle(Arc<ConnInner>);

impl ConnHandle {
    pub fn new(tx: mpsc::Sender<OutboundFrame>, user: UserAttrs) -> Self {
        Self(Arc::new(ConnInner {
            id: ConnId::new(),
            tx,
            bound: Mutex::new(None),
            binding: Mutex::new(()),
            user,
        }))
    }

    pub fn id(&self) -> &ConnId {
        &self.0.id
    }

    pub fn user(&self) -> &UserAttrs {
        &self.0.user
    }

    pub fn bound_room(&self) -> Option<RoomId> {
        *self.0.bound.lock()
    }

    pub fn set_bound_room(&self, room_id: Option<RoomId>) {
        *self.0.bound.lock() = room_id;
    }

    /// Take the connection's rebind lock. Two bind requests racing on the
    /// same connection would otherwise each read the old binding and leave
    /// the connection in two rosters at once.
    pub fn bind_guard(&self) -> MutexGuard<'_, ()> {
        self.0.binding.lock()
    }

    /// Queue a raw text frame. Returns false if the frame was dropped.
    pub fn push_text(&self, text: String) -> bool {
        match self.0.tx.try_send(OutboundFrame::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn_id = %self.0.id, "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Serialize and queue a message.
    pub fn push_json<T: Serialize>(&self, msg: &T) -> bool {
        match serde_json::to_string(msg) {
            Ok(text) => self.push_text(text),
            Err(err) => {
                tracing::error!(conn_id = %self.0.id, error = %err, "failed to serialize outbound message");
                false
            }
        }
    }

    /// Ask the writer task to close the socket. Best effort.
    pub fn close(&self) {
        let _ = self.0.tx.try_send(OutboundFrame::Close);
    }
}

impl PartialEq for ConnHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ConnHandle {}
