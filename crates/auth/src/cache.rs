use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::session::{Identity, Session};

/// Outcome of one session verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub identity: Option<Identity>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Authenticated from the local session only; the identity service was unreachable.
    pub degraded: bool,
    pub reason: Option<String>,
}

impl VerificationResult {
    pub fn authenticated(session: &Session, identity: Identity) -> Self {
        Self {
            authenticated: true,
            user_id: Some(session.user_id.clone()),
            identity: Some(identity),
            expires_at: Some(session.expires_at),
            degraded: false,
            reason: None,
        }
    }

    pub fn degraded(session: &Session, reason: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            user_id: Some(session.user_id.clone()),
            identity: None,
            expires_at: Some(session.expires_at),
            degraded: true,
            reason: Some(reason.into()),
        }
    }

    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            user_id: None,
            identity: None,
            expires_at: None,
            degraded: false,
            reason: Some(reason.into()),
        }
    }

    fn is_trusted(&self) -> bool {
        self.authenticated && !self.degraded
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: VerificationResult,
    stored_at: Instant,
}

/// Single-entry verification cache with separate TTLs for trusted and
/// untrusted (negative or degraded) results.
#[derive(Debug)]
pub struct AuthCache {
    positive_ttl: Duration,
    negative_ttl: Duration,
    entry: Mutex<Option<CacheEntry>>,
}

impl AuthCache {
    pub fn new(positive_ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            positive_ttl,
            negative_ttl,
            entry: Mutex::new(None),
        }
    }

    /// Returns the cached result while it is inside its TTL.
    pub fn get(&self) -> Option<VerificationResult> {
        let entry = self.lock();
        let entry = entry.as_ref()?;
        let ttl = self.ttl_for(&entry.result);
        if entry.stored_at.elapsed() < ttl {
            debug!(authenticated = entry.result.authenticated, "auth cache hit");
            Some(entry.result.clone())
        } else {
            None
        }
    }

    /// Last stored result regardless of age.
    pub fn last(&self) -> Option<VerificationResult> {
        self.lock().as_ref().map(|entry| entry.result.clone())
    }

    pub fn store(&self, result: VerificationResult) {
        *self.lock() = Some(CacheEntry {
            result,
            stored_at: Instant::now(),
        });
    }

    pub fn invalidate(&self) {
        if self.lock().take().is_some() {
            debug!("auth cache invalidated");
        }
    }

    fn ttl_for(&self, result: &VerificationResult) -> Duration {
        if result.is_trusted() {
            self.positive_ttl
        } else {
            self.negative_ttl
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<CacheEntry>> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
