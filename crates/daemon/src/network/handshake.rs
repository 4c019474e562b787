//! In-band authentication for a freshly accepted channel.
//!
//! A channel starts unauthenticated. The first application frame must be an
//! `auth` message carrying a credential that verifies and names an owner,
//! and it must arrive within the deadline. Anything else ends the channel
//! before a shell is started.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use protocol::{ClientMessage, InboundFrame, Principal};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::auth::{AuthError, Authenticator};

/// Default time a channel has to authenticate.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a channel failed to authenticate.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// No `auth` message before the deadline.
    #[error("no credential within {0:?}")]
    Timeout(Duration),

    /// The credential was refused.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The first frame was not an `auth` message.
    #[error("expected auth message, got {0}")]
    UnexpectedMessage(&'static str),

    /// An `auth` message on a channel that is already authenticated.
    #[error("channel already authenticated")]
    AlreadyAuthenticated,

    /// The peer went away.
    #[error("channel closed during authentication")]
    Closed,

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl HandshakeError {
    /// Message safe to send to the peer. Internal detail stays in the logs.
    pub fn peer_message(&self) -> &'static str {
        match self {
            HandshakeError::Timeout(_) => "Authentication failed: timed out",
            HandshakeError::Auth(AuthError::Credential(_)) => {
                "Authentication failed: invalid credential"
            }
            HandshakeError::Auth(AuthError::NotAllowed(_)) => "Authentication failed: access denied",
            HandshakeError::UnexpectedMessage(_) => "Authentication failed: expected auth message",
            HandshakeError::AlreadyAuthenticated => "Protocol violation: already authenticated",
            HandshakeError::Closed | HandshakeError::Transport(_) => "Authentication failed",
        }
    }

    /// Returns true if the peer can still be told about the failure.
    pub fn peer_reachable(&self) -> bool {
        !matches!(self, HandshakeError::Closed | HandshakeError::Transport(_))
    }
}

/// Authentication state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// Waiting for the credential.
    #[default]
    Unauthenticated,
    /// Bound to a principal. Never changes after this.
    Authenticated(Principal),
}

impl ChannelState {
    /// Returns the bound principal.
    pub fn principal(&self) -> Option<Principal> {
        match self {
            ChannelState::Unauthenticated => None,
            ChannelState::Authenticated(p) => Some(*p),
        }
    }

    /// Returns true once authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.principal().is_some()
    }

    /// Binds the channel to `principal`. Only legal once.
    pub fn admit(&mut self, principal: Principal) -> Result<Principal, HandshakeError> {
        match self {
            ChannelState::Unauthenticated => {
                *self = ChannelState::Authenticated(principal);
                Ok(principal)
            }
            ChannelState::Authenticated(_) => Err(HandshakeError::AlreadyAuthenticated),
        }
    }
}

/// Waits for the first frame and authenticates it.
///
/// Transport-level ping and pong frames are skipped; they carry no
/// application data.
pub async fn authenticate<S>(
    stream: &mut S,
    authenticator: &Authenticator,
    deadline: Duration,
) -> Result<Principal, HandshakeError>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let init_data = tokio::time::timeout(deadline, first_credential(stream))
        .await
        .map_err(|_| HandshakeError::Timeout(deadline))??;

    Ok(authenticator.authenticate(&init_data)?)
}

async fn first_credential<S>(stream: &mut S) -> Result<String, HandshakeError>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        let frame = match stream.next().await {
            None | Some(Ok(WsMessage::Close(_))) => return Err(HandshakeError::Closed),
            Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                return Err(HandshakeError::Closed)
            }
            Some(Err(e)) => return Err(HandshakeError::Transport(e.to_string())),
            Some(Ok(frame)) => frame,
        };

        let text = match frame {
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            WsMessage::Binary(_) => return Err(HandshakeError::UnexpectedMessage("binary frame")),
            WsMessage::Close(_) => return Err(HandshakeError::Closed),
            WsMessage::Text(text) => text,
        };

        return match InboundFrame::parse(&text) {
            InboundFrame::Message(ClientMessage::Auth { init_data }) => Ok(init_data),
            InboundFrame::Message(ClientMessage::Input { .. }) => {
                Err(HandshakeError::UnexpectedMessage("input"))
            }
            InboundFrame::Message(ClientMessage::Resize { .. }) => {
                Err(HandshakeError::UnexpectedMessage("resize"))
            }
            InboundFrame::Message(ClientMessage::Ping) => {
                Err(HandshakeError::UnexpectedMessage("ping"))
            }
            InboundFrame::Raw(_) => Err(HandshakeError::UnexpectedMessage("malformed frame")),
        };
    }
}
