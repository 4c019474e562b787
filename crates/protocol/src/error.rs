//! Error types for the protocol crate.

use thiserror::Error;

/// Reasons a signed `init_data` credential is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// The credential carries no `hash` field.
    #[error("credential has no hash")]
    MissingHash,

    /// The hash does not match the signed fields.
    #[error("credential signature mismatch")]
    BadSignature,

    /// `auth_date` is missing or not a unix timestamp.
    #[error("credential has no valid auth_date")]
    MissingAuthDate,

    /// The credential is older than the accepted window.
    #[error("credential expired: issued {age_secs}s ago, limit is {max_age_secs}s")]
    Expired {
        /// Seconds since `auth_date`.
        age_secs: u64,
        /// Maximum accepted age.
        max_age_secs: u64,
    },

    /// No `user` object, or the user has no integer `id`.
    #[error("credential has no user id")]
    MissingUser,

    /// The verifier was built without a signing token.
    #[error("no bot token configured")]
    NoSigningKey,
}

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A credential failed verification.
    #[error("invalid credential: {0}")]
    Credential(#[from] CredentialError),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
