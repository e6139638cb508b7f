//! WebSocket relay transport
//!
//! A small presence-aware pub/sub protocol over WebSocket. Clients send
//! `join`, `publish` and `leave` frames; the server answers with presence
//! frames and delivers envelopes to the session's members.

mod client;
mod frames;
mod server;

pub use client::WebSocketRelay;
pub use frames::RelayFrame;
pub use server::{RelayServer, RelayServerHandle, RelayState};
