//! Signed credential verification.
//!
//! Peers authenticate with a Telegram Web App `init_data` string: a URL-encoded
//! query whose fields are signed with a key derived from the bot token. The
//! broker never issues credentials; [`InitDataValidator::sign`] exists so that
//! operators and tests can mint a credential for a known token.
//!
//! Verification steps:
//!
//! 1. Split the query into fields and remove `hash`.
//! 2. Build the data-check-string: remaining `key=value` pairs sorted by key,
//!    joined with `\n`.
//! 3. `secret = HMAC-SHA256(key = "WebAppData", msg = bot_token)`.
//! 4. Compare `HMAC-SHA256(key = secret, msg = data_check_string)` with `hash`
//!    in constant time.
//! 5. Reject credentials whose `auth_date` is older than the accepted age.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CredentialError;
use crate::messages::Principal;

type HmacSha256 = Hmac<Sha256>;

/// Key used to derive the signing secret from the bot token.
const WEB_APP_KEY: &[u8] = b"WebAppData";

/// Default maximum credential age: 24 hours.
pub const DEFAULT_MAX_AGE_SECS: u64 = 86_400;

/// Length of the derived signing secret.
pub const SECRET_LENGTH: usize = 32;

/// A credential that passed signature and freshness checks.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedInitData {
    /// Identity taken from `user.id`.
    pub principal: Principal,
    /// Unix timestamp the credential was issued at.
    pub auth_date: u64,
    /// The decoded `user` object.
    pub user: serde_json::Value,
    /// All signed fields except `hash`, decoded.
    pub fields: BTreeMap<String, String>,
}

/// Verifies `init_data` credentials for a single bot token.
#[derive(Clone)]
pub struct InitDataValidator {
    secret: [u8; SECRET_LENGTH],
    max_age_secs: u64,
}

impl std::fmt::Debug for InitDataValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitDataValidator")
            .field("secret", &"<redacted>")
            .field("max_age_secs", &self.max_age_secs)
            .finish()
    }
}

impl InitDataValidator {
    /// Creates a validator for the given bot token.
    ///
    /// An empty token is refused: with no key every credential would have to
    /// be either accepted or rejected, and accepting is never correct.
    pub fn new(bot_token: &str) -> Result<Self, CredentialError> {
        if bot_token.is_empty() {
            return Err(CredentialError::NoSigningKey);
        }

        let mut mac = new_mac(WEB_APP_KEY)?;
        mac.update(bot_token.as_bytes());
        let digest = mac.finalize().into_bytes();
        let mut secret = [0u8; SECRET_LENGTH];
        secret.copy_from_slice(&digest);

        Ok(Self {
            secret,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        })
    }

    /// Sets the maximum accepted credential age.
    pub fn with_max_age(mut self, max_age_secs: u64) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    /// Returns the maximum accepted credential age.
    pub fn max_age_secs(&self) -> u64 {
        self.max_age_secs
    }

    /// Verifies a credential against the current system time.
    pub fn verify_now(&self, init_data: &str) -> Result<VerifiedInitData, CredentialError> {
        self.verify(init_data, unix_now())
    }

    /// Verifies a credential as of `now` (unix seconds).
    pub fn verify(&self, init_data: &str, now: u64) -> Result<VerifiedInitData, CredentialError> {
        let mut fields = parse_fields(init_data);
        let received = fields.remove("hash").ok_or(CredentialError::MissingHash)?;
        let received = hex::decode(received.trim()).map_err(|_| CredentialError::BadSignature)?;

        let mut mac = new_mac(&self.secret)?;
        mac.update(data_check_string(&fields).as_bytes());
        mac.verify_slice(&received)
            .map_err(|_| CredentialError::BadSignature)?;

        let auth_date: u64 = fields
            .get("auth_date")
            .and_then(|v| v.parse().ok())
            .ok_or(CredentialError::MissingAuthDate)?;

        let age_secs = now.saturating_sub(auth_date);
        if age_secs > self.max_age_secs {
            return Err(CredentialError::Expired {
                age_secs,
                max_age_secs: self.max_age_secs,
            });
        }

        let user: serde_json::Value = fields
            .get("user")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .ok_or(CredentialError::MissingUser)?;
        let id = user
            .get("id")
            .and_then(serde_json::Value::as_i64)
            .ok_or(CredentialError::MissingUser)?;

        Ok(VerifiedInitData {
            principal: Principal(id),
            auth_date,
            user,
            fields,
        })
    }

    /// Produces a signed `init_data` string for the given fields.
    ///
    /// Any `hash` entry in `fields` is ignored.
    pub fn sign<'a, I>(&self, fields: I) -> String
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let fields: BTreeMap<String, String> = fields
            .into_iter()
            .filter(|(k, _)| *k != "hash")
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let hash = match new_mac(&self.secret) {
            Ok(mut mac) => {
                mac.update(data_check_string(&fields).as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            Err(_) => String::new(),
        };

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &fields {
            query.append_pair(k, v);
        }
        query.append_pair("hash", &hash);
        query.finish()
    }

    /// Signs a minimal credential for `user_id` issued at `auth_date`.
    pub fn sign_for_user(&self, user_id: i64, auth_date: u64) -> String {
        let user = serde_json::json!({ "id": user_id }).to_string();
        let auth_date = auth_date.to_string();
        self.sign([("auth_date", auth_date.as_str()), ("user", user.as_str())])
    }
}

fn new_mac(key: &[u8]) -> Result<HmacSha256, CredentialError> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CredentialError::NoSigningKey)
}

/// Decodes the query string. Later duplicates replace earlier ones.
fn parse_fields(init_data: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(init_data.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn data_check_string(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
