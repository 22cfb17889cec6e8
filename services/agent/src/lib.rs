//! Voxline Agent Library Crate
//!
//! The web service around `voxline-core`: configuration, shared state, the
//! WebSocket audio gateway and routing. The `agent` binary is a thin wrapper
//! around this library.

pub mod audio_utils;
pub mod config;
pub mod router;
pub mod state;
pub mod ws;
