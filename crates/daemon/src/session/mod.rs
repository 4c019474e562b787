//! Session management module.
//!
//! This module provides PTY allocation, the per-principal session registry,
//! the session lifecycle, and the byte bridge between a channel and a shell.

pub mod bridge;
pub mod handle;
pub mod manager;
pub mod profile;
pub mod pty;
pub mod registry;

pub use bridge::{Dispatch, Dispatcher, ReaderEvent, Utf8Decoder};
pub use handle::{Session, SessionHandle, SessionInfo};
pub use manager::{SessionManager, SessionSettings};
pub use profile::{ProfileStore, ShellProfile};
pub use pty::{
    ChildProcess, PtyBackend, PtyController, PtyPair, SessionError, SessionId, SessionStatus,
    ShellCommand, UnixPtyBackend, WindowSize,
};
pub use registry::SessionRegistry;
