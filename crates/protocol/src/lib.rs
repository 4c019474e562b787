//! # TermRelay Protocol Library
//!
//! Message schema and credential verification shared by the TermRelay broker
//! and its clients.
//!
//! ## Overview
//!
//! - **Channel Messages**: JSON frames exchanged over a terminal channel, one
//!   object per frame, discriminated by `type`
//! - **Credentials**: verification of signed `init_data` blobs presented in the
//!   in-band `auth` message
//!
//! ## Channel Flow
//!
//! ```text
//! client                          broker
//!   │  {"type":"auth",...}          │
//!   │ ─────────────────────────────>│  verify credential
//!   │        {"type":"auth_ok",...} │
//!   │ <─────────────────────────────│  spawn shell
//!   │  input / resize / ping        │
//!   │ ─────────────────────────────>│
//!   │        output / pong / exit   │
//!   │ <─────────────────────────────│
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, InboundFrame, InitDataValidator, ServerMessage};
//!
//! let validator = InitDataValidator::new("123:token").unwrap();
//! let init_data = validator.sign_for_user(42, protocol::crypto::unix_now());
//!
//! let frame = ClientMessage::Auth { init_data }.to_json().unwrap();
//! let InboundFrame::Message(ClientMessage::Auth { init_data }) = InboundFrame::parse(&frame) else {
//!     unreachable!()
//! };
//!
//! let verified = validator.verify_now(&init_data).unwrap();
//! let reply = ServerMessage::AuthOk { principal: verified.principal };
//! assert_eq!(reply.to_json().unwrap(), r#"{"type":"auth_ok","principal":42}"#);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Channel message definitions
//! - [`crypto`]: Signed credential verification
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod messages;

pub use crypto::{InitDataValidator, VerifiedInitData, DEFAULT_MAX_AGE_SECS};
pub use error::{CredentialError, ProtocolError, Result};
pub use messages::{ClientMessage, InboundFrame, Principal, ServerMessage};
