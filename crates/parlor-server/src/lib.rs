//! WebSocket/HTTP server hosting multiplexed, stateful rooms: the room
//! registry, the per-connection multiplexer, the HTTP management surface,
//! and the built-in `Echo` room type.

pub mod client;
pub mod echo;
pub mod registry;
pub mod server;

pub use registry::{RoomRegistry, RoomTypes};
pub use server::{start, ServerConfig, ServerHandle};
