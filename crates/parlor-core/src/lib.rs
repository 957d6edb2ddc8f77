//! Transport-independent core of the parlor room server: identifiers,
//! wire envelope, error taxonomy, the reflection-free RPC method map and
//! dispatcher, the room contract, connection handles, and cancelable
//! timers.

pub mod conn;
pub mod error;
pub mod ids;
pub mod room;
pub mod rpc;
pub mod timer;
pub mod wire;
