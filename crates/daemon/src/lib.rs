//! # TermRelay Daemon Library
//!
//! This crate provides the broker side of TermRelay: it authenticates
//! WebSocket channels and gives each owner one interactive shell on a
//! pseudo-terminal of the host.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────┐   ┌────────────────────────────────┐  │
//! │  │  Channel Server   │   │        IPC Control Socket      │  │
//! │  │ (handshake, pump) │   │  (status, sessions, stop)      │  │
//! │  └─────────┬─────────┘   └───────────────┬────────────────┘  │
//! │            │                             │                   │
//! │  ┌─────────▼─────────────────────────────▼────────────────┐  │
//! │  │        Session Manager  +  Session Registry            │  │
//! │  └─────────┬──────────────────────────────────────────────┘  │
//! │  ┌─────────▼─────────┐   ┌────────────────────────────────┐  │
//! │  │    I/O Bridge     │   │   PTY Backend (fork + exec)    │  │
//! │  └───────────────────┘   └────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, environment overrides and validation
//! - [`auth`]: Credential verification and the owner allow-list
//! - [`session`]: PTY backend, registry, lifecycle and I/O bridge
//! - [`network`]: WebSocket listener and channel handshake
//! - [`ipc`]: Local control socket for the CLI
//! - [`orchestrator`]: Main daemon coordinator

pub mod auth;
pub mod config;
pub mod ipc;
pub mod network;
pub mod orchestrator;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use auth::{AuthError, Authenticator};
pub use config::Config;
pub use network::{ChannelContext, ChannelServer, ChannelSettings, ChannelState, HandshakeError};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use session::{
    PtyBackend, Session, SessionError, SessionHandle, SessionId, SessionInfo, SessionManager,
    SessionSettings, SessionStatus, UnixPtyBackend,
};
