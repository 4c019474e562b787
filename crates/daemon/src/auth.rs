//! Credential verification plus ownership policy.
//!
//! A principal may open a terminal only if its credential verifies and its
//! id is on the owner list. Both checks fail closed: no bot token or no
//! owners means nobody gets in.

use std::collections::HashSet;

use protocol::{CredentialError, InitDataValidator, Principal};
use thiserror::Error;

use crate::config::SecurityConfig;

/// Why a credential was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Signature, freshness or shape check failed.
    #[error("invalid credential: {0}")]
    Credential(#[from] CredentialError),

    /// The credential is valid but the principal is not an owner.
    #[error("principal {0} is not allowed")]
    NotAllowed(Principal),
}

/// Resolves credentials to allowed principals.
#[derive(Debug, Clone)]
pub struct Authenticator {
    validator: Option<InitDataValidator>,
    owners: HashSet<Principal>,
}

impl Authenticator {
    /// Creates an authenticator. `validator` is `None` when no token is configured.
    pub fn new(validator: Option<InitDataValidator>, owners: impl IntoIterator<Item = Principal>) -> Self {
        Self {
            validator,
            owners: owners.into_iter().collect(),
        }
    }

    /// Builds the authenticator from security settings.
    pub fn from_config(config: &SecurityConfig) -> Self {
        let validator = match InitDataValidator::new(&config.bot_token) {
            Ok(v) => Some(v.with_max_age(config.max_auth_age_secs)),
            Err(_) => {
                tracing::warn!("No bot token configured; every channel will be refused");
                None
            }
        };
        if config.owner_ids.is_empty() {
            tracing::warn!("No owner ids configured; every channel will be refused");
        }
        Self::new(validator, config.owner_ids.iter().copied().map(Principal))
    }

    /// Returns true if credentials can be accepted at all.
    pub fn is_configured(&self) -> bool {
        self.validator.is_some() && !self.owners.is_empty()
    }

    /// Returns true if `principal` is an owner.
    pub fn is_owner(&self, principal: Principal) -> bool {
        self.owners.contains(&principal)
    }

    /// Verifies `init_data` and checks ownership.
    pub fn authenticate(&self, init_data: &str) -> Result<Principal, AuthError> {
        let validator = self.validator.as_ref().ok_or(CredentialError::NoSigningKey)?;
        let verified = validator.verify_now(init_data)?;

        if !self.is_owner(verified.principal) {
            return Err(AuthError::NotAllowed(verified.principal));
        }
        Ok(verified.principal)
    }
}
