//! Network module for terminal channels.
//!
//! - [`websocket`]: listener, upgrade and per-channel frame pump
//! - [`handshake`]: in-band authentication of a new channel

pub mod handshake;
pub mod websocket;

pub use handshake::{authenticate, ChannelState, HandshakeError, DEFAULT_AUTH_TIMEOUT};
pub use websocket::{handle_connection, serve_channel, ChannelContext, ChannelServer, ChannelSettings};
