use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use verity_core::TransitionKind;

use crate::error::AuthError;
use crate::identity::IdentityService;
use crate::transition::TransitionCoordinator;
use crate::verifier::SessionVerifier;

/// Failure reported by the data backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote error (status {status:?}): {message}")]
pub struct RemoteError {
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn is_authorization_denied(&self) -> bool {
        matches!(self.status, Some(401 | 403))
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("authentication required")]
    AuthRequired,

    #[error("permission denied ({status}): {message}")]
    PermissionDenied { status: u16, message: String },

    #[error("data access unavailable during {transition}")]
    Unavailable { transition: TransitionKind },

    #[error(transparent)]
    Remote(RemoteError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Chainable query against one table. Only `execute` touches the network.
pub trait QueryBuilder: Sized + Send + 'static {
    fn select(self, columns: &str) -> Self;
    fn eq(self, column: &str, value: Value) -> Self;
    fn order(self, column: &str, ascending: bool) -> Self;
    fn limit(self, count: usize) -> Self;
    fn insert(self, row: Value) -> Self;
    fn update(self, patch: Value) -> Self;
    fn delete(self) -> Self;
    fn execute(self) -> impl Future<Output = Result<Value, RemoteError>> + Send;
}

/// Entry point to the data backend.
pub trait ResourceAccessor: Send + Sync + 'static {
    type Query: QueryBuilder;

    fn from(&self, table: &str) -> Self::Query;

    fn rpc(
        &self,
        function: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, RemoteError>> + Send;
}

/// Admission check shared by every query a proxy hands out.
struct AccessGate<I: IdentityService> {
    verifier: Arc<SessionVerifier<I>>,
    transitions: TransitionCoordinator,
}

impl<I: IdentityService> AccessGate<I> {
    async fn admit(&self) -> Result<(), AccessError> {
        let transition = self.transitions.kind();
        if !self.transitions.is_safe_for_data_access() {
            debug!(%transition, "data access refused during transition");
            return Err(AccessError::Unavailable { transition });
        }

        let result = self.verifier.verify().await?;
        if result.authenticated {
            Ok(())
        } else {
            Err(AccessError::AuthRequired)
        }
    }

    fn inspect(&self, outcome: Result<Value, RemoteError>) -> Result<Value, AccessError> {
        match outcome {
            Ok(value) => Ok(value),
            Err(error) if error.is_authorization_denied() => {
                warn!(status = ?error.status, "remote denied authorization; invalidating auth cache");
                self.verifier.invalidate();
                Err(AccessError::PermissionDenied {
                    status: error.status.unwrap_or(403),
                    message: error.message,
                })
            }
            Err(error) => Err(AccessError::Remote(error)),
        }
    }
}

/// Decorates a [`ResourceAccessor`] so every executing call is authenticated.
pub struct SecureAccessProxy<R: ResourceAccessor, I: IdentityService> {
    inner: Arc<R>,
    gate: Arc<AccessGate<I>>,
}

impl<R: ResourceAccessor, I: IdentityService> Clone for SecureAccessProxy<R, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<R: ResourceAccessor, I: IdentityService> SecureAccessProxy<R, I> {
    pub fn new(
        inner: Arc<R>,
        verifier: Arc<SessionVerifier<I>>,
        transitions: TransitionCoordinator,
    ) -> Self {
        Self {
            inner,
            gate: Arc::new(AccessGate {
                verifier,
                transitions,
            }),
        }
    }

    pub fn from(&self, table: &str) -> SecureQuery<R::Query, I> {
        SecureQuery {
            inner: self.inner.from(table),
            gate: Arc::clone(&self.gate),
        }
    }

    pub async fn rpc(&self, function: &str, params: Value) -> Result<Value, AccessError> {
        self.gate.admit().await?;
        let outcome = self.inner.rpc(function, params).await;
        self.gate.inspect(outcome)
    }
}

/// A [`QueryBuilder`] whose chain stays wrapped until `execute`.
pub struct SecureQuery<Q: QueryBuilder, I: IdentityService> {
    inner: Q,
    gate: Arc<AccessGate<I>>,
}

impl<Q: QueryBuilder, I: IdentityService> SecureQuery<Q, I> {
    fn map(self, f: impl FnOnce(Q) -> Q) -> Self {
        Self {
            inner: f(self.inner),
            gate: self.gate,
        }
    }

    pub fn select(self, columns: &str) -> Self {
        self.map(|query| query.select(columns))
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.map(|query| query.eq(column, value))
    }

    pub fn order(self, column: &str, ascending: bool) -> Self {
        self.map(|query| query.order(column, ascending))
    }

    pub fn limit(self, count: usize) -> Self {
        self.map(|query| query.limit(count))
    }

    pub fn insert(self, row: Value) -> Self {
        self.map(|query| query.insert(row))
    }

    pub fn update(self, patch: Value) -> Self {
        self.map(|query| query.update(patch))
    }

    pub fn delete(self) -> Self {
        self.map(QueryBuilder::delete)
    }

    pub async fn execute(self) -> Result<Value, AccessError> {
        self.gate.admit().await?;
        let outcome = self.inner.execute().await;
        self.gate.inspect(outcome)
    }
}
