use thiserror::Error;
use verity_storage::StorageError;

use crate::identity::IdentityError;

/// Typed failures surfaced to feature modules.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("network error: {0}")]
    Network(String),

    #[error("session token is about to expire")]
    TokenExpiring,

    #[error("refresh token expired; signed out")]
    RefreshTokenExpired,

    #[error("session is bound to another device (user {user_id})")]
    DeviceMismatch { user_id: String },

    #[error("authentication required")]
    AuthRequired,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("an impersonation session is already active")]
    ImpersonationConflict,

    #[error("exchange token unavailable: {0}")]
    ExchangeTokenUnavailable(String),

    #[error("invalid impersonation target: {0}")]
    InvalidImpersonationTarget(String),

    #[error("no impersonation session is active")]
    NotImpersonating,

    #[error("impersonation failed (rolled back: {rolled_back}): {reason}")]
    ImpersonationFailed { rolled_back: bool, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("identity service error: {0}")]
    Identity(IdentityError),
}

impl AuthError {
    /// Errors after which the only safe state is signed out on the login page.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshTokenExpired
                | AuthError::DeviceMismatch { .. }
                | AuthError::ImpersonationFailed {
                    rolled_back: false,
                    ..
                }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::Network(_) | AuthError::TokenExpiring | AuthError::ExchangeTokenUnavailable(_)
        )
    }
}

impl From<IdentityError> for AuthError {
    fn from(error: IdentityError) -> Self {
        if error.is_transient() {
            AuthError::Network(error.to_string())
        } else {
            AuthError::Identity(error)
        }
    }
}
