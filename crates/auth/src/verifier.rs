use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use verity_core::TransitionKind;
use verity_core::event::{EventBus, EventPayload, EventSource, emit};

use crate::cache::{AuthCache, VerificationResult};
use crate::device::DeviceBindingValidator;
use crate::error::AuthError;
use crate::identity::{IdentityService, RefreshFailure};
use crate::session::{Identity, Session};
use crate::transition::TransitionCoordinator;

#[derive(Debug, Clone, Copy)]
pub struct VerifierSettings {
    /// Sessions expiring within this window are refreshed before verification.
    pub refresh_buffer: Duration,
    /// Pause before re-reading storage after a suspected refresh race.
    pub race_settle_delay: Duration,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(60),
            race_settle_delay: Duration::from_millis(500),
        }
    }
}

/// Authoritative, cached check of the current session.
///
/// Remote verification is single-flight: concurrent callers queue on one
/// lock and observe the result the first caller cached.
pub struct SessionVerifier<I: IdentityService> {
    identity: Arc<I>,
    cache: Arc<AuthCache>,
    transitions: TransitionCoordinator,
    device: Arc<DeviceBindingValidator>,
    settings: VerifierSettings,
    flight: Mutex<()>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl<I: IdentityService> SessionVerifier<I> {
    pub fn new(
        identity: Arc<I>,
        cache: Arc<AuthCache>,
        transitions: TransitionCoordinator,
        device: Arc<DeviceBindingValidator>,
        settings: VerifierSettings,
    ) -> Self {
        Self {
            identity,
            cache,
            transitions,
            device,
            settings,
            flight: Mutex::new(()),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn settings(&self) -> VerifierSettings {
        self.settings
    }

    /// Most recent result, fresh or not, without any remote call.
    pub fn snapshot(&self) -> Option<VerificationResult> {
        self.cache.last()
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    pub async fn verify(&self) -> Result<VerificationResult, AuthError> {
        if let Some(cached) = self.cache.get() {
            return Ok(cached);
        }

        let _flight = self.flight.lock().await;
        if let Some(cached) = self.cache.get() {
            debug!("verification coalesced with in-flight check");
            return Ok(cached);
        }

        let outcome = self.verify_remote().await;
        match &outcome {
            Ok(result) => self.cache.store(result.clone()),
            Err(AuthError::Network(_)) => {}
            Err(error) => self
                .cache
                .store(VerificationResult::unauthenticated(error.to_string())),
        }
        outcome
    }

    /// Refreshes the current session now, whatever its expiry.
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let _flight = self.flight.lock().await;
        let session = self
            .identity
            .get_session()
            .await?
            .ok_or(AuthError::AuthRequired)?;
        let refreshed = self.refresh(&session).await?;
        self.cache.invalidate();
        Ok(refreshed)
    }

    /// Returns a session that is not inside the refresh buffer, refreshing
    /// first when needed.
    pub async fn ensure_fresh(&self) -> Result<Session, AuthError> {
        let _flight = self.flight.lock().await;
        let session = self
            .identity
            .get_session()
            .await?
            .ok_or(AuthError::AuthRequired)?;
        if !session.expires_within(self.settings.refresh_buffer) {
            return Ok(session);
        }

        let refreshed = self.refresh(&session).await?;
        if refreshed.expires_within(self.settings.refresh_buffer) {
            return Err(AuthError::TokenExpiring);
        }
        self.cache.invalidate();
        Ok(refreshed)
    }

    /// Signs out, purges fingerprint records and caches the unauthenticated state.
    pub async fn sign_out(&self, reason: &str) {
        let user_id = self.cache.last().and_then(|result| result.user_id);
        self.sign_out_inner(user_id, reason).await;
    }

    async fn verify_remote(&self) -> Result<VerificationResult, AuthError> {
        let Some(mut session) = self.identity.get_session().await? else {
            return Ok(self.unauthenticated("no session"));
        };

        if session.expires_within(self.settings.refresh_buffer) {
            session = self.refresh(&session).await?;
        }
        if session.is_expired() {
            return Err(AuthError::Network(
                "session expired and could not be refreshed".to_string(),
            ));
        }

        match self.identity.get_user(&session.access_token).await {
            Ok(identity) => self.accept(&session, identity).await,
            Err(error) if error.is_transient() => {
                self.check_device(&session).await?;
                warn!(
                    user_id = %session.user_id,
                    %error,
                    "identity service unreachable; continuing in degraded mode"
                );
                emit(
                    self.event_bus.as_ref(),
                    "auth.session.verified",
                    EventSource::Auth,
                    EventPayload::SessionVerified {
                        user_id: session.user_id.clone(),
                        degraded: true,
                    },
                );
                Ok(VerificationResult::degraded(&session, error.to_string()))
            }
            Err(error) => {
                warn!(user_id = %session.user_id, %error, "session rejected by identity service");
                self.sign_out_inner(Some(session.user_id.clone()), "session rejected")
                    .await;
                Ok(self.unauthenticated(error.to_string()))
            }
        }
    }

    async fn accept(
        &self,
        session: &Session,
        identity: Identity,
    ) -> Result<VerificationResult, AuthError> {
        if identity.user_id != session.user_id {
            warn!(
                session_user = %session.user_id,
                verified_user = %identity.user_id,
                "verified identity does not match session"
            );
            self.sign_out_inner(Some(session.user_id.clone()), "identity mismatch")
                .await;
            return Ok(self.unauthenticated("identity mismatch"));
        }

        self.check_device(session).await?;
        debug!(user_id = %session.user_id, "session verified");
        emit(
            self.event_bus.as_ref(),
            "auth.session.verified",
            EventSource::Auth,
            EventPayload::SessionVerified {
                user_id: session.user_id.clone(),
                degraded: false,
            },
        );
        Ok(VerificationResult::authenticated(session, identity))
    }

    async fn check_device(&self, session: &Session) -> Result<(), AuthError> {
        match self.device.validate(&session.access_token, &session.user_id) {
            Ok(_) => Ok(()),
            Err(error @ AuthError::DeviceMismatch { .. }) => {
                self.sign_out_inner(Some(session.user_id.clone()), "device mismatch")
                    .await;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    async fn refresh(&self, session: &Session) -> Result<Session, AuthError> {
        let owns_transition = self.transitions.is_stable();
        if owns_transition {
            self.transitions.start_transition(
                TransitionKind::RefreshingToken,
                Some("session near expiry".to_string()),
            );
        }

        let outcome = self.classify_refresh(session).await;

        if owns_transition && self.transitions.kind() == TransitionKind::RefreshingToken {
            self.transitions.end_transition();
        }
        outcome
    }

    async fn classify_refresh(&self, session: &Session) -> Result<Session, AuthError> {
        let error = match self.identity.refresh_session().await {
            Ok(refreshed) => {
                info!(
                    user_id = %refreshed.user_id,
                    expires_at = %refreshed.expires_at,
                    "session refreshed"
                );
                emit(
                    self.event_bus.as_ref(),
                    "auth.session.refreshed",
                    EventSource::Auth,
                    EventPayload::SessionRefreshed {
                        user_id: refreshed.user_id.clone(),
                        expires_at: refreshed.expires_at,
                    },
                );
                return Ok(refreshed);
            }
            Err(error) => error,
        };

        match error.refresh_failure() {
            RefreshFailure::Expired => {
                warn!(user_id = %session.user_id, %error, "refresh token expired");
                self.sign_out_inner(Some(session.user_id.clone()), "refresh token expired")
                    .await;
                Err(AuthError::RefreshTokenExpired)
            }
            RefreshFailure::Transient => {
                warn!(
                    user_id = %session.user_id,
                    %error,
                    "refresh failed transiently; keeping current session"
                );
                Ok(session.clone())
            }
            RefreshFailure::Race => self.resolve_refresh_race(session).await,
        }
    }

    async fn resolve_refresh_race(&self, stale: &Session) -> Result<Session, AuthError> {
        debug!(
            delay_ms = self.settings.race_settle_delay.as_millis() as u64,
            "refresh token rotated elsewhere; waiting for sibling tab"
        );
        tokio::time::sleep(self.settings.race_settle_delay).await;

        match self.identity.get_session().await? {
            Some(latest) if latest.refresh_token != stale.refresh_token && !latest.is_expired() => {
                info!(user_id = %latest.user_id, "adopted session refreshed by a sibling tab");
                Ok(latest)
            }
            _ => {
                warn!(user_id = %stale.user_id, "refresh race unresolved; signing out");
                self.sign_out_inner(Some(stale.user_id.clone()), "refresh race unresolved")
                    .await;
                Err(AuthError::RefreshTokenExpired)
            }
        }
    }

    async fn sign_out_inner(&self, user_id: Option<String>, reason: &str) {
        if let Err(error) = self.identity.sign_out().await {
            warn!(%error, "remote sign-out failed");
        }
        if let Err(error) = self.device.purge_all() {
            warn!(%error, "failed to purge fingerprint records");
        }
        self.cache
            .store(VerificationResult::unauthenticated(reason.to_string()));
        info!(?user_id, reason, "signed out");
        emit(
            self.event_bus.as_ref(),
            "auth.session.signed_out",
            EventSource::Auth,
            EventPayload::SignedOut {
                user_id,
                reason: reason.to_string(),
            },
        );
    }

    fn unauthenticated(&self, reason: impl Into<String>) -> VerificationResult {
        let reason = reason.into();
        emit(
            self.event_bus.as_ref(),
            "auth.session.invalidated",
            EventSource::Auth,
            EventPayload::SessionInvalidated {
                reason: reason.clone(),
            },
        );
        VerificationResult::unauthenticated(reason)
    }
}
