use std::future::Future;

use thiserror::Error;

use crate::session::{Identity, Session};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("network error: {0}")]
    Network(String),

    #[error("identity service timed out")]
    Timeout,

    #[error("refresh token not found")]
    RefreshTokenNotFound,

    #[error("refresh token already used")]
    RefreshTokenAlreadyUsed,

    /// "Invalid Refresh Token" without a more specific code.
    #[error("invalid refresh token")]
    InvalidRefreshToken,

    #[error("session expired")]
    SessionExpired,

    #[error("session not found")]
    SessionNotFound,

    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("identity service returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("malformed identity response: {0}")]
    Decode(String),

    #[error("no session")]
    NoSession,

    #[error("session storage failed: {0}")]
    Storage(String),
}

/// How the verifier treats a failed refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The refresh token is gone for good; sign out.
    Expired,
    /// Connectivity problem; keep trusting the current session.
    Transient,
    /// A sibling tab probably rotated the token first; re-read storage.
    Race,
}

impl IdentityError {
    /// Maps a GoTrue-style error body onto a typed error.
    pub fn from_api(status: u16, code: Option<&str>, message: &str) -> Self {
        match code {
            Some("refresh_token_not_found") => return IdentityError::RefreshTokenNotFound,
            Some("refresh_token_already_used") => return IdentityError::RefreshTokenAlreadyUsed,
            Some("session_expired") => return IdentityError::SessionExpired,
            Some("session_not_found") => return IdentityError::SessionNotFound,
            Some("bad_jwt") | Some("no_authorization") => return IdentityError::Unauthorized,
            _ => {}
        }

        let lowered = message.to_ascii_lowercase();
        if lowered.contains("already used") {
            return IdentityError::RefreshTokenAlreadyUsed;
        }
        if lowered.contains("refresh token not found") {
            return IdentityError::RefreshTokenNotFound;
        }
        if lowered.contains("invalid refresh token") {
            return IdentityError::InvalidRefreshToken;
        }

        match (status, code) {
            (_, Some("invalid_grant")) => IdentityError::InvalidGrant(message.to_string()),
            (401, _) => IdentityError::Unauthorized,
            _ => IdentityError::Api {
                status,
                code: code.map(str::to_string),
                message: message.to_string(),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            IdentityError::Network(_) | IdentityError::Timeout | IdentityError::Storage(_) => true,
            IdentityError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn refresh_failure(&self) -> RefreshFailure {
        match self {
            IdentityError::RefreshTokenAlreadyUsed | IdentityError::InvalidRefreshToken => {
                RefreshFailure::Race
            }
            IdentityError::Decode(_) => RefreshFailure::Transient,
            error if error.is_transient() => RefreshFailure::Transient,
            _ => RefreshFailure::Expired,
        }
    }
}

/// Remote identity provider.
///
/// `get_session` reads the locally persisted session; every other call
/// talks to the service. Implementations persist sessions they obtain and
/// drop the local session on `sign_out` even if the remote call fails.
pub trait IdentityService: Send + Sync + 'static {
    fn get_session(&self) -> impl Future<Output = Result<Option<Session>, IdentityError>> + Send;

    fn refresh_session(&self) -> impl Future<Output = Result<Session, IdentityError>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), IdentityError>> + Send;

    /// Server-side verification of an access token.
    fn get_user(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<Identity, IdentityError>> + Send;

    /// Redeems an impersonation exchange token for the target's session.
    fn exchange_token(
        &self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Session, IdentityError>> + Send;

    /// Establishes `session` as the current one.
    fn set_session(
        &self,
        session: Session,
    ) -> impl Future<Output = Result<Session, IdentityError>> + Send;
}
