use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::Identity;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("CSRF token unavailable: {0}")]
    CsrfUnavailable(String),

    #[error("target is not provisioned: {0}")]
    TargetNotProvisioned(String),

    #[error("caller is not allowed to impersonate: {0}")]
    Forbidden(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("authorization endpoint returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed authorization response: {0}")]
    Decode(String),
}

impl AuthorizationError {
    /// Maps an error reason code onto a typed error.
    pub fn from_reason(status: u16, reason: Option<&str>, message: &str) -> Self {
        match (status, reason) {
            (_, Some("target_not_provisioned")) | (404, None) => {
                AuthorizationError::TargetNotProvisioned(message.to_string())
            }
            (_, Some("forbidden")) | (403, None) => AuthorizationError::Forbidden(message.to_string()),
            _ => AuthorizationError::Api {
                status,
                message: message.to_string(),
            },
        }
    }
}

/// Short-lived grant redeemable for the target's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeGrant {
    pub exchange_token: String,
    #[serde(default)]
    pub target_role: Option<String>,
}

/// Remote endpoint that issues impersonation exchange tokens.
pub trait AuthorizationEndpoint: Send + Sync + 'static {
    fn fetch_csrf_token(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<String, AuthorizationError>> + Send;

    fn request_exchange(
        &self,
        access_token: &str,
        csrf_token: &str,
        target: &str,
        reason: &str,
    ) -> impl Future<Output = Result<ExchangeGrant, AuthorizationError>> + Send;

    /// Audit record for the end of an impersonation session.
    fn end_impersonation(
        &self,
        access_token: &str,
        admin_id: &str,
        target: &str,
    ) -> impl Future<Output = Result<(), AuthorizationError>> + Send;
}

/// Local pre-check of whether `admin` may impersonate `target`. The remote
/// endpoint still has the final say.
pub trait AccessPolicy: Send + Sync + 'static {
    fn can_impersonate(&self, admin: &Identity, target: &str) -> bool;
}

/// Allows callers whose role is on the list.
#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    allowed_roles: Vec<String>,
}

impl RolePolicy {
    pub fn new<S: Into<String>>(roles: impl IntoIterator<Item = S>) -> Self {
        Self {
            allowed_roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

impl AccessPolicy for RolePolicy {
    fn can_impersonate(&self, admin: &Identity, _target: &str) -> bool {
        admin
            .role
            .as_deref()
            .is_some_and(|role| self.allowed_roles.iter().any(|allowed| allowed == role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(role: Option<&str>) -> Identity {
        Identity {
            user_id: "admin".to_string(),
            email: None,
            role: role.map(str::to_string),
        }
    }

    #[test]
    fn role_policy_checks_the_allow_list() {
        let policy = RolePolicy::new(["super_admin", "admin"]);
        assert!(policy.can_impersonate(&identity(Some("admin")), "u2"));
        assert!(!policy.can_impersonate(&identity(Some("auditor")), "u2"));
        assert!(!policy.can_impersonate(&identity(None), "u2"));
        assert!(!RolePolicy::default().can_impersonate(&identity(Some("admin")), "u2"));
    }

    #[test]
    fn reason_codes_are_distinguished() {
        assert!(matches!(
            AuthorizationError::from_reason(400, Some("target_not_provisioned"), "x"),
            AuthorizationError::TargetNotProvisioned(_)
        ));
        assert!(matches!(
            AuthorizationError::from_reason(403, None, "x"),
            AuthorizationError::Forbidden(_)
        ));
        assert!(matches!(
            AuthorizationError::from_reason(500, None, "x"),
            AuthorizationError::Api { status: 500, .. }
        ));
    }
}
