use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Shared-storage key holding the persisted session.
pub const SESSION_KEY: &str = "verity.auth.token";

const TOKEN_HASH_LEN: usize = 16;

/// Tokens issued by the identity service for one signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_fingerprint: Option<String>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// True when the session expires within `buffer` from now.
    pub fn expires_within(&self, buffer: std::time::Duration) -> bool {
        let buffer = Duration::from_std(buffer).unwrap_or(Duration::MAX);
        match Utc::now().checked_add_signed(buffer) {
            Some(deadline) => self.expires_at <= deadline,
            None => true,
        }
    }

    pub fn token_hash(&self) -> String {
        token_hash(&self.access_token)
    }
}

/// Short SHA-256 prefix identifying an access token without exposing it.
pub fn token_hash(token: &str) -> String {
    let mut digest = hex::encode(Sha256::digest(token.as_bytes()));
    digest.truncate(TOKEN_HASH_LEN);
    digest
}

/// Server-side view of the user behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}
