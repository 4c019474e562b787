//! Unix Domain Socket IPC between the `termrelay-daemon` CLI and a running daemon.
//!
//! The protocol is newline-delimited JSON: each request and each response is
//! a single JSON object followed by `\n`.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/termrelay/daemon.sock`
//! - Fallback: `/tmp/termrelay-$UID/daemon.sock`
//!
//! `daemon.socket_path` in the config file overrides both.
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path, remove_pid_file, write_pid_file};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Get the default socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/termrelay/daemon.sock`
/// 2. Otherwise: `/tmp/termrelay-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => PathBuf::from(runtime_dir)
            .join("termrelay")
            .join("daemon.sock"),
        _ => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/termrelay-{}", uid)).join("daemon.sock")
        }
    }
}
