//! `Echo` room type: the smallest useful room, and the reference for how
//! concrete rooms declare methods, guard binds, and schedule timers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use parlor_core::conn::ConnHandle;
use parlor_core::error::RpcError;
use parlor_core::room::{Room, RoomMeta, Roster};
use parlor_core::rpc::{CallArgs, MethodMap, MethodMapBuilder, ParamDef, RpcResult};
use parlor_core::timer::CancelableTimer;
use parlor_core::wire::ErrorFrame;

pub const TYPE: &str = "Echo";

/// Echo rooms with no traffic for this long are eligible for reaping.
const IDLE_AFTER_SECS: i64 = 3600;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct InitParams {
    passcode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinParams {
    passcode: Option<String>,
}

pub struct EchoRoom {
    roster: Roster,
    passcode: Option<String>,
    /// First user to bind; kept so clients can tell who opened the room.
    owner: Option<Uuid>,
    pings: u64,
    pending: Option<CancelableTimer>,
}

pub fn factory() -> Result<(Box<dyn Room>, MethodMap), RpcError> {
    let methods = MethodMapBuilder::<EchoRoom>::new()
        .method(
            "ping",
            vec![
                ParamDef::with_default("delayMs", "0"),
                ParamDef::connection("conn"),
            ],
            ping,
        )
        .method(
            "say",
            vec![
                ParamDef::payload("text"),
                ParamDef::with_default("loud", "false"),
                ParamDef::connection("conn"),
            ],
            say,
        )
        .build()?;

    let room = EchoRoom {
        roster: Roster::new(),
        passcode: None,
        owner: None,
        pings: 0,
        pending: None,
    };
    Ok((Box::new(room), methods))
}

/// Answer the caller with a pong, optionally after a delay. A new ping
/// supersedes any still-pending delayed one.
fn ping(room: &mut EchoRoom, args: &CallArgs<'_>) -> RpcResult {
    let delay_ms: u64 = args.get("delayMs")?;
    let conn = args.conn()?.clone();

    room.pings += 1;
    room.pending = None;
    let pong = json!({"type": "pong", "pings": room.pings});

    if delay_ms == 0 {
        room.roster.push_to(&conn, &pong);
    } else {
        let activity = Arc::clone(room.roster.activity());
        room.pending = Some(CancelableTimer::schedule(
            Duration::from_millis(delay_ms),
            move || {
                activity.stamp_out();
                conn.push_json(&pong);
            },
        ));
    }
    Ok(None)
}

/// Broadcast a line of text to everyone in the room.
fn say(room: &mut EchoRoom, args: &CallArgs<'_>) -> RpcResult {
    let text: String = args.get("text")?;
    let loud: bool = args.get("loud")?;
    let from = args.conn()?.user().user_id;

    let text = if loud { text.to_uppercase() } else { text };
    room.roster
        .push_all(&json!({"type": "said", "from": from, "text": text}));
    Ok(None)
}

impl Room for EchoRoom {
    fn roster(&self) -> &Roster {
        &self.roster
    }

    fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn init(&mut self, params: Option<&Value>) -> Result<(), RpcError> {
        let params: InitParams = match params {
            None | Some(Value::Null) => InitParams::default(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
                RpcError::InvalidParameter {
                    method: "createRoom".to_string(),
                    param: "initParams".to_string(),
                    detail: err.to_string(),
                }
            })?,
        };
        self.passcode = params.passcode;
        Ok(())
    }

    fn bind(&mut self, conn: ConnHandle, params: Option<&Value>) -> bool {
        if let Some(expected) = &self.passcode {
            let offered = params
                .cloned()
                .and_then(|value| serde_json::from_value::<JoinParams>(value).ok())
                .and_then(|join| join.passcode);
            if offered.as_deref() != Some(expected.as_str()) {
                conn.push_json(&ErrorFrame::new(
                    "PASSCODE_REJECTED",
                    "wrong or missing passcode",
                ));
                return false;
            }
        }
        self.owner.get_or_insert(conn.user().user_id);
        self.roster.add(conn);
        true
    }

    fn view(&self) -> Value {
        json!({
            "hasPasscode": self.passcode.is_some(),
            "owner": self.owner,
            "connections": self.roster.len(),
            "pings": self.pings,
        })
    }

    fn may_reap(&self, meta: &RoomMeta, now: DateTime<Utc>) -> bool {
        let last_active = self
            .roster
            .activity()
            .last_out()
            .or_else(|| self.roster.activity().last_in())
            .unwrap_or(meta.created_at);
        (now - last_active).num_seconds() >= IDLE_AFTER_SECS
    }

    fn destroy(&mut self) {
        // Dropping the timer cancels it.
        self.pending = None;
    }
}
