//! Room registry: owns every live room, creates them from the registered
//! type table, routes RPC calls to them, and reaps the abandoned ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use parlor_core::conn::ConnHandle;
use parlor_core::error::RpcError;
use parlor_core::ids::RoomId;
use parlor_core::room::{Activity, Room, RoomMeta};
use parlor_core::rpc::{dispatch, CallCtx, MethodMap, MethodMapBuilder, ParamDef};
use parlor_core::wire::ErrorFrame;

/// Produces a fresh room instance together with its method map. The map is
/// built per instance but validated once at registration time, so a
/// duplicate method name keeps the type from ever becoming available.
pub type RoomFactory = fn() -> Result<(Box<dyn Room>, MethodMap), RpcError>;

/// Immutable-after-startup table of room type names to factories.
pub struct RoomTypes {
    factories: HashMap<&'static str, RoomFactory>,
}

impl RoomTypes {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a room type. Probes the factory once so construction-time
    /// errors (duplicate method names, above all) fail startup instead of
    /// the first create call.
    pub fn register(
        mut self,
        name: &'static str,
        factory: RoomFactory,
    ) -> Result<Self, RpcError> {
        factory()?;
        if self.factories.insert(name, factory).is_some() {
            return Err(RpcError::Internal(format!(
                "room type '{name}' registered twice"
            )));
        }
        Ok(self)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn create(&self, name: &str) -> Result<(&'static str, Box<dyn Room>, MethodMap), RpcError> {
        let (canonical, factory) = self
            .factories
            .get_key_value(name)
            .ok_or_else(|| RpcError::UnknownRoomType(name.to_string()))?;
        let (room, methods) = factory()?;
        Ok((canonical, room, methods))
    }
}

impl Default for RoomTypes {
    fn default() -> Self {
        Self::new()
    }
}

/// Framework wrapper around one live room: identity, activity stamps
/// readable without the lock, the immutable method map, and the room's
/// own mutual-exclusion lock.
struct RoomHandle {
    meta: RoomMeta,
    activity: Arc<Activity>,
    methods: MethodMap,
    inner: Mutex<Box<dyn Room>>,
}

/// Operator-facing summary of one live room.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub room_type: &'static str,
    pub created_at: DateTime<Utc>,
    pub last_in_msg_at: Option<DateTime<Utc>>,
    pub last_out_msg_at: Option<DateTime<Utc>>,
    pub view: Value,
}

/// Owns the id-to-room map. Create/list/invoke/remove run concurrently for
/// unrelated rooms; only calls against the same room serialize, on that
/// room's own lock.
pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<RoomHandle>>,
    types: RoomTypes,
}

impl RoomRegistry {
    pub fn new(types: RoomTypes) -> Self {
        Self {
            rooms: DashMap::new(),
            types,
        }
    }

    /// Create and register a room of `type_name`. An `init` failure
    /// discards the instance without registering it.
    pub fn create(
        &self,
        type_name: &str,
        init_params: Option<&Value>,
    ) -> Result<RoomId, RpcError> {
        let (canonical, mut room, methods) = self.types.create(type_name)?;
        room.init(init_params)?;

        let id = RoomId::new();
        let handle = RoomHandle {
            meta: RoomMeta {
                id,
                type_name: canonical,
                created_at: Utc::now(),
            },
            activity: Arc::clone(room.roster().activity()),
            methods,
            inner: Mutex::new(room),
        };
        self.rooms.insert(id, Arc::new(handle));
        tracing::info!(room_id = %id, room_type = canonical, "room created");
        Ok(id)
    }

    /// All live rooms, oldest first.
    pub fn list(&self) -> Vec<RoomSummary> {
        let mut handles: Vec<Arc<RoomHandle>> = self
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        handles.sort_by_key(|h| h.meta.created_at);

        handles
            .into_iter()
            .map(|handle| {
                let view = handle.inner.lock().view();
                RoomSummary {
                    room_id: handle.meta.id,
                    room_type: handle.meta.type_name,
                    created_at: handle.meta.created_at,
                    last_in_msg_at: handle.activity.last_in(),
                    last_out_msg_at: handle.activity.last_out(),
                    view,
                }
            })
            .collect()
    }

    /// Dispatch `method` against the room's own method map, with the
    /// connection (if any) as ambient context. Every failure is logged and
    /// returned as a structured error frame: one bad call must never take
    /// down the connection or the registry. Domain failures pass through
    /// as the room produced them.
    pub fn invoke(
        &self,
        room_id: RoomId,
        method: &str,
        params: Option<&Value>,
        conn: Option<&ConnHandle>,
    ) -> Option<Value> {
        let Some(handle) = self.get(room_id) else {
            let err = RpcError::UnknownRoom(room_id);
            tracing::warn!(room_id = %room_id, method, "invoke on unknown room");
            return Some(ErrorFrame::from(&err).to_value());
        };

        handle.activity.stamp_in();

        let ctx = match conn {
            Some(conn) => CallCtx::with_conn(conn),
            None => CallCtx::empty(),
        };
        let mut room = handle.inner.lock();
        match dispatch(&handle.methods, method, params, ctx, room.as_any_mut()) {
            Ok(result) => result,
            Err(RpcError::Domain(value)) => Some(value),
            Err(err) => {
                tracing::error!(room_id = %room_id, method, error = %err, "dispatch failed");
                Some(ErrorFrame::from(&err).to_value())
            }
        }
    }

    /// Ask the room to accept the connection; on acceptance the binding is
    /// recorded on the handle. A rejecting room has already pushed its
    /// reason to the connection.
    pub fn bind(
        &self,
        room_id: RoomId,
        conn: &ConnHandle,
        bind_params: Option<&Value>,
    ) -> Result<bool, RpcError> {
        let handle = self.get(room_id).ok_or(RpcError::UnknownRoom(room_id))?;
        let mut room = handle.inner.lock();
        // A concurrent remove() deletes the map entry before taking the
        // room lock; a bind that got the lock second would otherwise
        // attach the connection to the drained instance and leave it
        // "bound" to a room that no longer exists.
        if !self.rooms.contains_key(&room_id) {
            return Err(RpcError::UnknownRoom(room_id));
        }
        let accepted = room.bind(conn.clone(), bind_params);
        if accepted {
            conn.set_bound_room(Some(room_id));
            tracing::debug!(room_id = %room_id, conn_id = %conn.id(), "connection bound");
        }
        Ok(accepted)
    }

    /// Detach the connection from the room (if it still exists) and clear
    /// the binding either way.
    pub fn unbind(&self, room_id: RoomId, conn: &ConnHandle) {
        if let Some(handle) = self.get(room_id) {
            handle.inner.lock().unbind(conn);
        }
        conn.set_bound_room(None);
        tracing::debug!(room_id = %room_id, conn_id = %conn.id(), "connection unbound");
    }

    /// Remove a room: force-unbind and close every bound connection, run
    /// `destroy`, delete from the map. Removing a nonexistent id is a
    /// no-op.
    pub fn remove(&self, room_id: RoomId) {
        let Some((_, handle)) = self.rooms.remove(&room_id) else {
            return;
        };
        let mut room = handle.inner.lock();
        for conn in room.roster_mut().drain() {
            conn.set_bound_room(None);
            conn.close();
        }
        room.destroy();
        tracing::info!(room_id = %room_id, room_type = handle.meta.type_name, "room removed");
    }

    /// Broadcast a value to every connection bound to the room.
    pub fn push_to_room<T: Serialize>(&self, room_id: RoomId, msg: &T) {
        if let Some(handle) = self.get(room_id) {
            handle.inner.lock().roster().push_all(msg);
        }
    }

    /// One reaper pass: remove every room whose own idle predicate says
    /// so. A room busy serving a call is skipped — it is not idle.
    pub fn reap(&self, now: DateTime<Utc>) -> usize {
        let mut doomed = Vec::new();
        for entry in self.rooms.iter() {
            let handle = entry.value();
            if let Some(room) = handle.inner.try_lock() {
                if room.may_reap(&handle.meta, now) {
                    doomed.push(handle.meta.id);
                }
            }
        }
        for id in &doomed {
            tracing::info!(room_id = %id, "reaping idle room");
            self.remove(*id);
        }
        doomed.len()
    }

    pub fn count(&self) -> usize {
        self.rooms.len()
    }

    pub fn contains(&self, room_id: RoomId) -> bool {
        self.rooms.contains_key(&room_id)
    }

    fn get(&self, room_id: RoomId) -> Option<Arc<RoomHandle>> {
        self.rooms.get(&room_id).map(|entry| Arc::clone(entry.value()))
    }
}

/// Start the periodic idle reaper. Reap passes log what they remove and
/// never break the schedule.
pub fn start_reaper(
    registry: Arc<RoomRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            reap_pass(&registry);
        }
    })
}

/// One guarded reaper pass: a panic in a room's `may_reap` or `destroy`
/// aborts the pass, not the schedule.
fn reap_pass(registry: &RoomRegistry) {
    let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        registry.reap(Utc::now())
    }));
    match pass {
        Ok(removed) if removed > 0 => tracing::info!(removed, "idle reaper pass"),
        Ok(_) => {}
        Err(_) => tracing::error!("idle reaper pass panicked"),
    }
}

/// RPC receiver exposing the registry's own operations. Stateless apart
/// from the registry reference, so every call site can build one on the
/// stack — no shared lock serializes unrelated callers.
pub struct ManagerRpc {
    registry: Arc<RoomRegistry>,
}

impl ManagerRpc {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }
}

/// Method map for the registry's RPC surface, consumed by the HTTP entry
/// point. No connection-typed parameters: these calls carry no ambient
/// context.
pub fn manager_methods() -> Result<MethodMap, RpcError> {
    MethodMapBuilder::<ManagerRpc>::new()
        .method(
            "createRoom",
            vec![
                ParamDef::payload("roomType"),
                ParamDef::with_default("initParams", "null"),
            ],
            |mgr: &mut ManagerRpc, args| {
                let room_type: String = args.get("roomType")?;
                let init_params: Option<Value> = args.opt("initParams")?;
                let id = mgr.registry.create(&room_type, init_params.as_ref())?;
                let value = serde_json::to_value(id)
                    .map_err(|err| RpcError::Internal(err.to_string()))?;
                Ok(Some(value))
            },
        )
        .method("listRooms", vec![], |mgr: &mut ManagerRpc, _args| {
            let summaries = mgr.registry.list();
            let value = serde_json::to_value(summaries)
                .map_err(|err| RpcError::Internal(err.to_string()))?;
            Ok(Some(value))
        })
        .method(
            "removeRoom",
            vec![ParamDef::payload("roomId")],
            |mgr: &mut ManagerRpc, args| {
                let room_id: RoomId = args.get("roomId")?;
                mgr.registry.remove(room_id);
                Ok(None)
            },
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_core::conn::{OutboundFrame, UserAttrs};
    use parlor_core::room::Roster;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct CounterRoom {
        roster: Roster,
        count: u64,
    }

    fn counter_factory() -> Result<(Box<dyn Room>, MethodMap), RpcError> {
        let methods = MethodMapBuilder::<CounterRoom>::new()
            .method("inc", vec![], |room: &mut CounterRoom, _args| {
                room.count += 1;
                Ok(None)
            })
            .method("get", vec![], |room: &mut CounterRoom, _args| {
                Ok(Some(json!(room.count)))
            })
            .build()?;
        Ok((
            Box::new(CounterRoom {
                roster: Roster::new(),
                count: 0,
            }),
            methods,
        ))
    }

    impl Room for CounterRoom {
        fn roster(&self) -> &Roster {
            &self.roster
        }
        fn roster_mut(&mut self) -> &mut Roster {
            &mut self.roster
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
        fn view(&self) -> Value {
            json!({"count": self.count})
        }
        fn may_reap(&self, _meta: &RoomMeta, _now: DateTime<Utc>) -> bool {
            false
        }
    }

    struct EphemeralRoom {
        roster: Roster,
    }

    fn ephemeral_factory() -> Result<(Box<dyn Room>, MethodMap), RpcError> {
        Ok((
            Box::new(EphemeralRoom {
                roster: Roster::new(),
            }),
            MethodMapBuilder::<EphemeralRoom>::new().build()?,
        ))
    }

    impl Room for EphemeralRoom {
        fn roster(&self) -> &Roster {
            &self.roster
        }
        fn roster_mut(&mut self) -> &mut Roster {
            &mut self.roster
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
        fn may_reap(&self, _meta: &RoomMeta, _now: DateTime<Utc>) -> bool {
            true
        }
    }

    fn registry() -> Arc<RoomRegistry> {
        let types = RoomTypes::new()
            .register("Counter", counter_factory)
            .unwrap()
            .register("Ephemeral", ephemeral_factory)
            .unwrap();
        Arc::new(RoomRegistry::new(types))
    }

    fn conn() -> (ConnHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnHandle::new(tx, UserAttrs::anonymous()), rx)
    }

    #[test]
    fn create_unknown_type_fails() {
        let reg = registry();
        let err = reg.create("NoSuchGame", None).unwrap_err();
        assert!(matches!(err, RpcError::UnknownRoomType(_)));
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn list_is_ordered_by_creation_time() {
        let reg = registry();
        let first = reg.create("Counter", None).unwrap();
        let second = reg.create("Counter", None).unwrap();

        let rooms = reg.list();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].room_id, first);
        assert_eq!(rooms[1].room_id, second);
        assert_eq!(rooms[0].room_type, "Counter");
        assert!(rooms[0].created_at <= rooms[1].created_at);
        assert!(rooms[0].last_in_msg_at.is_none());
        assert_eq!(rooms[0].view["count"], 0);
    }

    #[test]
    fn invoke_runs_room_method() {
        let reg = registry();
        let id = reg.create("Counter", None).unwrap();

        assert!(reg.invoke(id, "inc", None, None).is_none());
        let result = reg.invoke(id, "get", None, None).unwrap();
        assert_eq!(result, json!(1));
    }

    #[test]
    fn invoke_on_unknown_room_returns_error_frame() {
        let reg = registry();
        let result = reg.invoke(RoomId::new(), "inc", None, None).unwrap();
        assert_eq!(result["type"], "error");
        assert_eq!(result["code"], "UNKNOWN_ROOM");
    }

    #[test]
    fn invoke_unknown_method_still_stamps_inbound() {
        let reg = registry();
        let id = reg.create("Counter", None).unwrap();

        let result = reg.invoke(id, "doesNotExist", None, None).unwrap();
        assert_eq!(result["code"], "UNKNOWN_METHOD");

        // Registry-level bookkeeping happens before method lookup.
        let rooms = reg.list();
        assert!(rooms[0].last_in_msg_at.is_some());
    }

    #[test]
    fn bind_records_binding_on_the_connection() {
        let reg = registry();
        let id = reg.create("Counter", None).unwrap();
        let (c, _rx) = conn();

        assert!(reg.bind(id, &c, None).unwrap());
        assert_eq!(c.bound_room(), Some(id));
    }

    #[test]
    fn bind_to_unknown_room_fails() {
        let reg = registry();
        let (c, _rx) = conn();
        let err = reg.bind(RoomId::new(), &c, None).unwrap_err();
        assert!(matches!(err, RpcError::UnknownRoom(_)));
        assert!(c.bound_room().is_none());
    }

    #[test]
    fn remove_closes_and_unbinds_every_connection() {
        let reg = registry();
        let id = reg.create("Counter", None).unwrap();
        let (a, mut rx_a) = conn();
        let (b, mut rx_b) = conn();
        reg.bind(id, &a, None).unwrap();
        reg.bind(id, &b, None).unwrap();

        reg.remove(id);

        assert!(a.bound_room().is_none());
        assert!(b.bound_room().is_none());
        assert_eq!(rx_a.try_recv().unwrap(), OutboundFrame::Close);
        assert_eq!(rx_b.try_recv().unwrap(), OutboundFrame::Close);

        let result = reg.invoke(id, "inc", None, None).unwrap();
        assert_eq!(result["code"], "UNKNOWN_ROOM");
    }

    #[test]
    fn remove_nonexistent_room_is_a_noop() {
        let reg = registry();
        reg.remove(RoomId::new());
        reg.remove(RoomId::new());
    }

    #[test]
    fn concurrent_mutations_serialize_per_room() {
        let reg = registry();
        let id = reg.create("Counter", None).unwrap();

        let mut workers = Vec::new();
        for _ in 0..4 {
            let reg = Arc::clone(&reg);
            workers.push(std::thread::spawn(move || {
                for _ in 0..250 {
                    reg.invoke(id, "inc", None, None);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        let result = reg.invoke(id, "get", None, None).unwrap();
        assert_eq!(result, json!(1000));
    }

    #[test]
    fn reap_removes_only_willing_rooms() {
        let reg = registry();
        let keeper = reg.create("Counter", None).unwrap();
        let goner = reg.create("Ephemeral", None).unwrap();

        let removed = reg.reap(Utc::now());
        assert_eq!(removed, 1);
        assert!(reg.contains(keeper));
        assert!(!reg.contains(goner));
    }

    struct FaultyRoom {
        roster: Roster,
    }

    fn faulty_factory() -> Result<(Box<dyn Room>, MethodMap), RpcError> {
        Ok((
            Box::new(FaultyRoom {
                roster: Roster::new(),
            }),
            MethodMapBuilder::<FaultyRoom>::new().build()?,
        ))
    }

    impl Room for FaultyRoom {
        fn roster(&self) -> &Roster {
            &self.roster
        }
        fn roster_mut(&mut self) -> &mut Roster {
            &mut self.roster
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
        fn may_reap(&self, _meta: &RoomMeta, _now: DateTime<Utc>) -> bool {
            panic!("idle predicate blew up")
        }
    }

    #[test]
    fn reaper_pass_survives_a_panicking_room() {
        let types = RoomTypes::new()
            .register("Faulty", faulty_factory)
            .unwrap()
            .register("Ephemeral", ephemeral_factory)
            .unwrap();
        let reg = Arc::new(RoomRegistry::new(types));
        let faulty = reg.create("Faulty", None).unwrap();
        let goner = reg.create("Ephemeral", None).unwrap();

        // Both passes hit the panicking predicate; neither may propagate.
        reap_pass(&reg);
        reap_pass(&reg);
        assert!(reg.contains(faulty));

        reg.remove(faulty);
        reap_pass(&reg);
        assert!(!reg.contains(goner));
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn bind_never_survives_a_concurrent_remove() {
        let reg = registry();
        for round in 0..50 {
            let id = reg.create("Counter", None).unwrap();
            let (c, _rx) = conn();
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let remover = {
                let reg = Arc::clone(&reg);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    reg.remove(id);
                })
            };
            let binder = {
                let reg = Arc::clone(&reg);
                let c = c.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let _ = reg.bind(id, &c, None);
                })
            };
            remover.join().unwrap();
            binder.join().unwrap();

            assert!(!reg.contains(id));
            assert!(
                c.bound_room().is_none(),
                "round {round}: connection bound to a removed room"
            );
        }
    }

    #[test]
    fn push_to_room_broadcasts() {
        let reg = registry();
        let id = reg.create("Counter", None).unwrap();
        let (a, mut rx_a) = conn();
        let (b, mut rx_b) = conn();
        reg.bind(id, &a, None).unwrap();
        reg.bind(id, &b, None).unwrap();

        reg.push_to_room(id, &json!({"type": "tick"}));

        assert!(matches!(rx_a.try_recv().unwrap(), OutboundFrame::Text(_)));
        assert!(matches!(rx_b.try_recv().unwrap(), OutboundFrame::Text(_)));
    }

    #[test]
    fn manager_create_list_remove() {
        let reg = registry();
        let methods = manager_methods().unwrap();
        let mut mgr = ManagerRpc::new(Arc::clone(&reg));

        let params = json!({"roomType": "Counter"});
        let created = dispatch(
            &methods,
            "createRoom",
            Some(&params),
            CallCtx::empty(),
            &mut mgr,
        )
        .unwrap()
        .unwrap();
        let id: RoomId = serde_json::from_value(created).unwrap();
        assert!(reg.contains(id));

        let listed = dispatch(&methods, "listRooms", None, CallCtx::empty(), &mut mgr)
            .unwrap()
            .unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let params = json!({"roomId": id});
        dispatch(
            &methods,
            "removeRoom",
            Some(&params),
            CallCtx::empty(),
            &mut mgr,
        )
        .unwrap();
        assert!(!reg.contains(id));
    }

    #[test]
    fn manager_create_unknown_type_propagates() {
        let reg = registry();
        let methods = manager_methods().unwrap();
        let mut mgr = ManagerRpc::new(reg);

        let params = json!({"roomType": "NoSuchGame"});
        let err = dispatch(
            &methods,
            "createRoom",
            Some(&params),
            CallCtx::empty(),
            &mut mgr,
        )
        .unwrap_err();
        assert!(matches!(err, RpcError::UnknownRoomType(_)));
    }

    #[test]
    fn registering_the_same_type_name_twice_fails() {
        let result = RoomTypes::new()
            .register("Counter", counter_factory)
            .unwrap()
            .register("Counter", counter_factory);
        assert!(result.is_err());
    }

    #[test]
    fn type_names_are_sorted() {
        let types = RoomTypes::new()
            .register("Counter", counter_factory)
            .unwrap()
            .register("Ephemeral", ephemeral_factory)
            .unwrap();
        assert_eq!(types.names(), vec!["Counter", "Ephemeral"]);
    }
}
