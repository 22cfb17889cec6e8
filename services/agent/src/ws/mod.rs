//! WebSocket audio gateway.
//!
//! - `protocol`: the JSON control messages exchanged with the client.
//! - `session`: connection lifecycle, from the `init` handshake to hangup.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
