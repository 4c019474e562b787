//! IPC message types for CLI-daemon communication.
//!
//! Requests and responses are externally tagged JSON, one object per line.

use serde::{Deserialize, Serialize};

use crate::session::SessionInfo;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all live sessions.
    ListSessions,
    /// Close a principal's session.
    CloseSession {
        /// Principal whose session should be closed.
        principal: i64,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of live sessions.
        session_count: usize,
        /// Number of open channels.
        channel_count: usize,
        /// Address terminal channels are accepted on.
        listen_addr: String,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// List of live sessions.
    Sessions {
        /// Information about each session.
        sessions: Vec<SessionInfo>,
    },
    /// Result of a close request.
    SessionClosed {
        /// The principal named in the request.
        principal: i64,
        /// Whether the principal had a session.
        existed: bool,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}
