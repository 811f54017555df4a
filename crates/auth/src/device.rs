use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use verity_core::event::{EventBus, EventPayload, EventSource, emit};
use verity_storage::TabStorage;

use crate::error::AuthError;
use crate::session::token_hash;
use crate::transition::TransitionCoordinator;

/// Prefix of every fingerprint record key: `verity.fp:{user}:{token_hash}`.
pub const FINGERPRINT_PREFIX: &str = "verity.fp:";

/// Source of the raw, device-specific signal a fingerprint is derived from.
pub trait DeviceSignal: Send + Sync + 'static {
    fn signal(&self) -> String;
}

/// A signal fixed at construction.
#[derive(Debug, Clone)]
pub struct FixedSignal(String);

impl FixedSignal {
    pub fn new(signal: impl Into<String>) -> Self {
        Self(signal.into())
    }
}

impl DeviceSignal for FixedSignal {
    fn signal(&self) -> String {
        self.0.clone()
    }
}

pub fn fingerprint(signal: &str) -> String {
    hex::encode(Sha256::digest(signal.as_bytes()))
}

fn user_prefix(user_id: &str) -> String {
    format!("{FINGERPRINT_PREFIX}{user_id}:")
}

fn record_key(user_id: &str, token_hash: &str) -> String {
    format!("{FINGERPRINT_PREFIX}{user_id}:{token_hash}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCheck {
    /// No earlier record for the user; this device is now bound.
    Bound,
    Matched,
    /// Mismatch absorbed by the post-login grace window.
    Tolerated,
    Disabled,
}

pub struct DeviceBindingValidator {
    storage: TabStorage,
    signal: Arc<dyn DeviceSignal>,
    transitions: TransitionCoordinator,
    grace_window: Duration,
    enabled: bool,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl DeviceBindingValidator {
    pub fn new(
        storage: TabStorage,
        signal: Arc<dyn DeviceSignal>,
        transitions: TransitionCoordinator,
        grace_window: Duration,
    ) -> Self {
        Self {
            storage,
            signal,
            transitions,
            grace_window,
            enabled: true,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn current_fingerprint(&self) -> String {
        fingerprint(&self.signal.signal())
    }

    /// Checks that `access_token` is used from a device already bound to
    /// `user_id`. A mismatch purges the user's records and is never retried.
    pub fn validate(&self, access_token: &str, user_id: &str) -> Result<DeviceCheck, AuthError> {
        if !self.enabled {
            return Ok(DeviceCheck::Disabled);
        }

        let current = self.current_fingerprint();
        let key = record_key(user_id, &token_hash(access_token));
        let keys = self.storage.keys_with_prefix(&user_prefix(user_id))?;

        if keys.is_empty() {
            self.storage.set(&key, &current)?;
            info!(user_id, "device bound on first use");
            return Ok(DeviceCheck::Bound);
        }

        let mut matched = false;
        for record in &keys {
            if self.storage.get(record)?.as_deref() == Some(current.as_str()) {
                matched = true;
                break;
            }
        }

        if matched {
            self.storage.set(&key, &current)?;
            debug!(user_id, "device fingerprint matched");
            return Ok(DeviceCheck::Matched);
        }

        if self.transitions.in_login_grace_window(self.grace_window) {
            self.storage.set(&key, &current)?;
            warn!(user_id, "device fingerprint mismatch tolerated during login grace window");
            return Ok(DeviceCheck::Tolerated);
        }

        let purged = self.purge_user(user_id)?;
        warn!(user_id, purged, "device fingerprint mismatch; session rejected");
        emit(
            self.event_bus.as_ref(),
            "auth.device.mismatch",
            EventSource::Auth,
            EventPayload::DeviceMismatch {
                user_id: user_id.to_string(),
            },
        );
        Err(AuthError::DeviceMismatch {
            user_id: user_id.to_string(),
        })
    }

    pub fn purge_user(&self, user_id: &str) -> Result<usize, AuthError> {
        Ok(self.storage.remove_prefix(&user_prefix(user_id))?)
    }

    pub fn purge_all(&self) -> Result<usize, AuthError> {
        let purged = self.storage.remove_prefix(FINGERPRINT_PREFIX)?;
        if purged > 0 {
            debug!(purged, "fingerprint records purged");
        }
        Ok(purged)
    }
}
