use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::conn::ConnHandle;
use crate::error::RpcError;
use crate::ids::RoomId;

/// Last-inbound / last-outbound message times for one room.
///
/// Stored as epoch millis in atomics so the registry and the reaper can
/// read them without taking the room lock; they are diagnostics, not
/// correctness-critical state. Zero means "never".
#[derive(Debug, Default)]
pub struct Activity {
    last_in_ms: AtomicI64,
    last_out_ms: AtomicI64,
}

impl Activity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp_in(&self) {
        self.last_in_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn stamp_out(&self) {
        self.last_out_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_in(&self) -> Option<DateTime<Utc>> {
        millis_to_time(self.last_in_ms.load(Ordering::Relaxed))
    }

    pub fn last_out(&self) -> Option<DateTime<Utc>> {
        millis_to_time(self.last_out_ms.load(Ordering::Relaxed))
    }
}

fn millis_to_time(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}

/// Framework-owned identity of a room, fixed at creation.
#[derive(Clone, Copy, Debug)]
pub struct RoomMeta {
    pub id: RoomId,
    pub type_name: &'static str,
    pub created_at: DateTime<Utc>,
}

/// The set of connections currently bound to a room, plus its shared
/// activity stamps. Embedded in every concrete room; mutated only under
/// the room's own lock.
#[derive(Debug)]
pub struct Roster {
    conns: Vec<ConnHandle>,
    activity: Arc<Activity>,
}

impl Roster {
    pub fn new() -> Self {
        Self {
            conns: Vec::new(),
            activity: Arc::new(Activity::new()),
        }
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    pub fn add(&mut self, conn: ConnHandle) {
        if !self.conns.contains(&conn) {
            self.conns.push(conn);
        }
    }

    /// Safe to call for a connection that was never bound.
    pub fn remove(&mut self, conn: &ConnHandle) {
        self.conns.retain(|c| c != conn);
    }

    pub fn contains(&self, conn: &ConnHandle) -> bool {
        self.conns.contains(conn)
    }

    pub fn conns(&self) -> &[ConnHandle] {
        &self.conns
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Detach every connection, returning the handles for teardown.
    pub fn drain(&mut self) -> Vec<ConnHandle> {
        std::mem::take(&mut self.conns)
    }

    /// Push a message to one bound connection. Fire and forget.
    pub fn push_to<T: Serialize>(&self, conn: &ConnHandle, msg: &T) {
        self.activity.stamp_out();
        conn.push_json(msg);
    }

    /// Push a message to every bound connection.
    pub fn push_all<T: Serialize>(&self, msg: &T) {
        if self.conns.is_empty() {
            return;
        }
        self.activity.stamp_out();
        match serde_json::to_string(msg) {
            Ok(text) => {
                for conn in &self.conns {
                    conn.push_text(text.clone());
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize broadcast message");
            }
        }
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

/// One independently addressable, stateful unit of server-side logic.
///
/// Every entry point here runs under the room's own lock, taken by the
/// registry wrapper; implementations never need to lock anything
/// themselves. Lifecycle: constructed by a factory, `init` once before
/// any bind, then serves binds and RPC calls until removed (explicitly or
/// by the idle reaper), at which point `destroy` runs and every bound
/// connection is force-closed.
pub trait Room: Send + 'static {
    fn roster(&self) -> &Roster;

    fn roster_mut(&mut self) -> &mut Roster;

    /// Downcast hook for the dispatcher. Implementations return `self`.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// One-time setup from JSON construction params. A failure here
    /// aborts registration and discards the instance.
    fn init(&mut self, _params: Option<&Value>) -> Result<(), RpcError> {
        Ok(())
    }

    /// Decide whether to accept a new connection. A rejecting room is
    /// responsible for pushing the reason to the connection itself
    /// before returning false.
    fn bind(&mut self, conn: ConnHandle, _params: Option<&Value>) -> bool {
        self.roster_mut().add(conn);
        true
    }

    fn unbind(&mut self, conn: &ConnHandle) {
        self.roster_mut().remove(conn);
    }

    /// Cheap, side-effect-free snapshot for operator tooling. Must not
    /// leak secrets such as a room passcode.
    fn view(&self) -> Value {
        Value::Null
    }

    /// Idle policy consulted by the reaper. Each room type defines its
    /// own notion of "abandoned".
    fn may_reap(&self, meta: &RoomMeta, now: DateTime<Utc>) -> bool;

    /// Last-chance cleanup on removal: cancel timers, drop resources.
    fn destroy(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{OutboundFrame, UserAttrs};
    use tokio::sync::mpsc;

    fn conn() -> (ConnHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnHandle::new(tx, UserAttrs::anonymous()), rx)
    }

    #[test]
    fn activity_starts_empty() {
        let activity = Activity::new();
        assert!(activity.last_in().is_none());
        assert!(activity.last_out().is_none());
    }

    #[test]
    fn stamps_are_readable() {
        let activity = Activity::new();
        activity.stamp_in();
        activity.stamp_out();
        assert!(activity.last_in().is_some());
        assert!(activity.last_out().is_some());
    }

    #[test]
    fn roster_add_is_idempotent_per_connection() {
        let mut roster = Roster::new();
        let (c, _rx) = conn();
        roster.add(c.clone());
        roster.add(c.clone());
        assert_eq!(roster.len(), 1);
        assert!(roster.contains(&c));
    }

    #[test]
    fn roster_remove_unknown_connection_is_a_noop() {
        let mut roster = Roster::new();
        let (a, _rx_a) = conn();
        let (b, _rx_b) = conn();
        roster.add(a.clone());
        roster.remove(&b);
        assert_eq!(roster.len(), 1);
        roster.remove(&a);
        assert!(roster.is_empty());
    }

    #[test]
    fn push_all_reaches_every_connection_and_stamps_outbound() {
        let mut roster = Roster::new();
        let (a, mut rx_a) = conn();
        let (b, mut rx_b) = conn();
        roster.add(a);
        roster.add(b);

        roster.push_all(&serde_json::json!({"type": "tick"}));

        assert!(matches!(rx_a.try_recv().unwrap(), OutboundFrame::Text(_)));
        assert!(matches!(rx_b.try_recv().unwrap(), OutboundFrame::Text(_)));
        assert!(roster.activity().last_out().is_some());
    }

    #[test]
    fn push_all_to_empty_roster_does_not_stamp() {
        let roster = Roster::new();
        roster.push_all(&serde_json::json!({"type": "tick"}));
        assert!(roster.activity().last_out().is_none());
    }

    #[test]
    fn drain_returns_all_handles() {
        let mut roster = Roster::new();
        let (a, _rx_a) = conn();
        let (b, _rx_b) = conn();
        roster.add(a.clone());
        roster.add(b.clone());

        let drained = roster.drain();
        assert_eq!(drained, vec![a, b]);
        assert!(roster.is_empty());
    }
}
