//! Channel message definitions for TermRelay.
//!
//! Every frame on a terminal channel is a single JSON object whose `type`
//! field selects the variant. Client and broker directions use separate
//! enums so that neither side can construct the other's messages by mistake.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Authenticated identity a session belongs to.
///
/// Serialized as a bare integer so that `auth_ok` carries the same id the
/// credential was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(pub i64);

impl Principal {
    /// Returns the raw numeric id.
    pub fn id(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Principal {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Messages sent by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Credential presentation. Only legal as the first message.
    Auth {
        /// Opaque signed credential blob.
        init_data: String,
    },
    /// Keystrokes for the shell.
    Input {
        /// Raw input, written to the terminal unchanged.
        data: String,
    },
    /// Terminal geometry change.
    Resize {
        /// Number of rows.
        rows: u16,
        /// Number of columns.
        cols: u16,
    },
    /// Liveness check.
    Ping,
}

/// Messages sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake succeeded.
    AuthOk {
        /// The principal resolved from the credential.
        principal: Principal,
    },
    /// Handshake or session failure. The connection closes after this.
    Error {
        /// Human-readable, peer-safe description.
        message: String,
    },
    /// Bytes produced by the shell, decoded as UTF-8.
    Output {
        /// Decoded terminal output.
        data: String,
    },
    /// The session ended. Nothing follows this message.
    Exit,
    /// Reply to `ping`.
    Pong,
}

impl ServerMessage {
    /// Creates an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns true for messages after which the broker closes the channel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerMessage::Error { .. } | ServerMessage::Exit)
    }
}

impl ClientMessage {
    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// An inbound text frame after parsing.
///
/// Frames that do not decode as a [`ClientMessage`] are kept verbatim so the
/// caller can decide whether to treat them as keystrokes or reject them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A well-formed structured message.
    Message(ClientMessage),
    /// Anything else, with the original payload.
    Raw(String),
}

impl InboundFrame {
    /// Parses a text frame, falling back to [`InboundFrame::Raw`].
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => InboundFrame::Message(message),
            Err(_) => InboundFrame::Raw(text.to_string()),
        }
    }
}
