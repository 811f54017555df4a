use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use verity_core::TransitionKind;
use verity_core::event::{EventBus, EventPayload, EventSource, emit};
use verity_storage::TabStorage;

use crate::authorization::{AccessPolicy, AuthorizationEndpoint, AuthorizationError};
use crate::cross_tab::IMPERSONATION_ENDED_KEY;
use crate::device::DeviceBindingValidator;
use crate::error::AuthError;
use crate::identity::IdentityService;
use crate::navigation::Navigator;
use crate::session::{Identity, Session};
use crate::transition::TransitionCoordinator;
use crate::verifier::SessionVerifier;

/// Tab-scoped key holding the active [`ImpersonationState`].
pub const IMPERSONATION_STATE_KEY: &str = "verity.impersonation.state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpersonationPhase {
    Idle,
    /// Exchange requested; identities are being swapped.
    Pending,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpersonationState {
    pub original_session: Session,
    pub admin: Identity,
    pub target: String,
    #[serde(default)]
    pub target_user_id: Option<String>,
    #[serde(default)]
    pub target_role: Option<String>,
    pub reason: String,
    pub started_at: DateTime<Utc>,
}

impl ImpersonationState {
    /// True once the target session was redeemed. Snapshots written before
    /// that point are leftovers of a start that never finished.
    pub fn is_complete(&self) -> bool {
        self.target_user_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ImpersonationSettings {
    pub login_path: String,
    /// Keys that survive the purge when impersonation ends.
    pub preserved_keys: Vec<String>,
}

impl Default for ImpersonationSettings {
    fn default() -> Self {
        Self {
            login_path: "/login".to_string(),
            preserved_keys: vec![
                "verity.preferences.theme".to_string(),
                "verity.preferences.locale".to_string(),
            ],
        }
    }
}

/// Storage and navigation surfaces the manager mutates.
pub struct ImpersonationContext {
    pub shared_storage: TabStorage,
    pub tab_storage: TabStorage,
    pub navigator: Arc<dyn Navigator>,
    pub transitions: TransitionCoordinator,
    pub device: Arc<DeviceBindingValidator>,
}

pub struct ImpersonationManager<I: IdentityService, A: AuthorizationEndpoint> {
    identity: Arc<I>,
    authority: Arc<A>,
    policy: Arc<dyn AccessPolicy>,
    verifier: Arc<SessionVerifier<I>>,
    context: ImpersonationContext,
    settings: ImpersonationSettings,
    phase: Mutex<ImpersonationPhase>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl<I: IdentityService, A: AuthorizationEndpoint> ImpersonationManager<I, A> {
    /// Restores an active impersonation persisted in tab storage.
    pub fn new(
        identity: Arc<I>,
        authority: Arc<A>,
        policy: Arc<dyn AccessPolicy>,
        verifier: Arc<SessionVerifier<I>>,
        context: ImpersonationContext,
        settings: ImpersonationSettings,
    ) -> Self {
        let restored = match context
            .tab_storage
            .get_json::<ImpersonationState>(IMPERSONATION_STATE_KEY)
        {
            Ok(Some(state)) if state.is_complete() => {
                info!(admin = %state.admin.user_id, target = %state.target, "restored active impersonation");
                ImpersonationPhase::Active
            }
            Ok(Some(state)) => {
                warn!(target = %state.target, "discarding impersonation state from an unfinished start");
                forget_state(&context.tab_storage);
                ImpersonationPhase::Idle
            }
            Ok(None) => ImpersonationPhase::Idle,
            Err(error) => {
                warn!(%error, "discarding unreadable impersonation state");
                forget_state(&context.tab_storage);
                ImpersonationPhase::Idle
            }
        };

        Self {
            identity,
            authority,
            policy,
            verifier,
            context,
            settings,
            phase: Mutex::new(restored),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn phase(&self) -> ImpersonationPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.phase() == ImpersonationPhase::Active
    }

    /// The persisted snapshot of a completed start.
    pub fn state(&self) -> Option<ImpersonationState> {
        self.context
            .tab_storage
            .get_json::<ImpersonationState>(IMPERSONATION_STATE_KEY)
            .ok()
            .flatten()
            .filter(ImpersonationState::is_complete)
    }

    /// Swaps the current identity for `target`.
    pub async fn start(&self, target: &str, reason: &str) -> Result<ImpersonationState, AuthError> {
        self.claim()?;
        let prepared = self.prepare(target).await;
        let (admin, session) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                self.set_phase(ImpersonationPhase::Idle);
                return Err(error);
            }
        };

        let transitions = &self.context.transitions;
        transitions.start_transition(
            TransitionKind::Impersonating,
            Some(format!("impersonating {target}")),
        );
        let outcome = self.swap(admin, session, target, reason).await;
        transitions.end_transition();
        outcome
    }

    /// Ends impersonation: audit, sign-out, purge, sibling signal and a hard
    /// navigation to the login page.
    pub async fn end(&self) -> Result<(), AuthError> {
        let state = self.state();
        if state.is_none() && self.phase() != ImpersonationPhase::Active {
            return Err(AuthError::NotImpersonating);
        }

        let transitions = &self.context.transitions;
        transitions.start_transition(
            TransitionKind::LoggingOut,
            Some("impersonation ended".to_string()),
        );

        if let Some(state) = &state {
            self.audit_end(state).await;
        }
        if let Err(error) = self.identity.sign_out().await {
            warn!(%error, "sign-out failed while ending impersonation");
        }
        self.purge_client_state();
        self.signal_siblings();
        self.set_phase(ImpersonationPhase::Idle);

        if let Some(state) = state {
            info!(admin = %state.admin.user_id, target = %state.target, "impersonation ended");
            emit(
                self.event_bus.as_ref(),
                "auth.impersonation.ended",
                EventSource::Auth,
                EventPayload::ImpersonationEnded {
                    admin_id: state.admin.user_id,
                    target_id: state.target_user_id.unwrap_or(state.target),
                },
            );
        }

        transitions.end_transition();
        self.context.navigator.hard_navigate(&self.settings.login_path);
        Ok(())
    }

    fn claim(&self) -> Result<(), AuthError> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != ImpersonationPhase::Idle {
            return Err(AuthError::ImpersonationConflict);
        }
        *phase = ImpersonationPhase::Pending;
        Ok(())
    }

    fn set_phase(&self, next: ImpersonationPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    async fn prepare(&self, target: &str) -> Result<(Identity, Session), AuthError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(AuthError::InvalidImpersonationTarget(
                "target is empty".to_string(),
            ));
        }

        let verification = self.verifier.verify().await?;
        let admin = match verification.identity {
            Some(identity) if verification.authenticated => identity,
            _ => return Err(AuthError::AuthRequired),
        };

        if admin.user_id == target || admin.email.as_deref() == Some(target) {
            return Err(AuthError::InvalidImpersonationTarget(
                "cannot impersonate yourself".to_string(),
            ));
        }
        if !self.policy.can_impersonate(&admin, target) {
            return Err(AuthError::PermissionDenied(format!(
                "{} may not impersonate {target}",
                admin.user_id
            )));
        }

        let session = self.verifier.ensure_fresh().await?;
        Ok((admin, session))
    }

    async fn swap(
        &self,
        admin: Identity,
        session: Session,
        target: &str,
        reason: &str,
    ) -> Result<ImpersonationState, AuthError> {
        let mut state = ImpersonationState {
            original_session: session.clone(),
            admin,
            target: target.trim().to_string(),
            target_user_id: None,
            target_role: None,
            reason: reason.to_string(),
            started_at: Utc::now(),
        };
        if let Err(error) = self
            .context
            .tab_storage
            .set_json(IMPERSONATION_STATE_KEY, &state)
        {
            self.set_phase(ImpersonationPhase::Idle);
            return Err(error.into());
        }

        let grant = match self.request_grant(&session, &state.target, reason).await {
            Ok(grant) => grant,
            Err(error) => {
                forget_state(&self.context.tab_storage);
                self.set_phase(ImpersonationPhase::Idle);
                self.emit_failed(&state.target, &error, true);
                return Err(error);
            }
        };

        if let Err(error) = self.identity.sign_out().await {
            warn!(%error, "remote sign-out failed before impersonation swap");
        }

        match self.identity.exchange_token(&grant.exchange_token).await {
            Ok(target_session) => {
                state.target_user_id = Some(target_session.user_id.clone());
                state.target_role = grant.target_role;
                if let Err(error) = self
                    .context
                    .tab_storage
                    .set_json(IMPERSONATION_STATE_KEY, &state)
                {
                    warn!(%error, "failed to persist impersonation state");
                }
                self.set_phase(ImpersonationPhase::Active);
                self.verifier.invalidate();

                info!(
                    admin = %state.admin.user_id,
                    target = %target_session.user_id,
                    "impersonation started"
                );
                emit(
                    self.event_bus.as_ref(),
                    "auth.impersonation.started",
                    EventSource::Auth,
                    EventPayload::ImpersonationStarted {
                        admin_id: state.admin.user_id.clone(),
                        target_id: target_session.user_id,
                    },
                );
                Ok(state)
            }
            Err(exchange_error) => {
                warn!(error = %exchange_error, "exchange token redemption failed; restoring original session");
                self.roll_back(&state, exchange_error.to_string()).await
            }
        }
    }

    async fn request_grant(
        &self,
        session: &Session,
        target: &str,
        reason: &str,
    ) -> Result<crate::authorization::ExchangeGrant, AuthError> {
        let csrf_token = self
            .authority
            .fetch_csrf_token(&session.access_token)
            .await
            .map_err(|error| AuthError::ExchangeTokenUnavailable(error.to_string()))?;

        self.authority
            .request_exchange(&session.access_token, &csrf_token, target, reason)
            .await
            .map_err(|error| match error {
                AuthorizationError::Forbidden(message) => AuthError::PermissionDenied(message),
                AuthorizationError::TargetNotProvisioned(message) => {
                    AuthError::InvalidImpersonationTarget(message)
                }
                other => AuthError::ExchangeTokenUnavailable(other.to_string()),
            })
    }

    async fn roll_back(
        &self,
        state: &ImpersonationState,
        reason: String,
    ) -> Result<ImpersonationState, AuthError> {
        self.verifier.invalidate();
        match self
            .identity
            .set_session(state.original_session.clone())
            .await
        {
            Ok(_) => {
                forget_state(&self.context.tab_storage);
                self.set_phase(ImpersonationPhase::Idle);
                info!(admin = %state.admin.user_id, "original session restored");
                let error = AuthError::ImpersonationFailed {
                    rolled_back: true,
                    reason,
                };
                self.emit_failed(&state.target, &error, true);
                Err(error)
            }
            Err(restore_error) => {
                error!(
                    admin = %state.admin.user_id,
                    error = %restore_error,
                    "original session could not be restored; purging client state"
                );
                if let Err(error) = self.identity.sign_out().await {
                    warn!(%error, "sign-out failed during purge");
                }
                self.purge_client_state();
                self.set_phase(ImpersonationPhase::Idle);
                let error = AuthError::ImpersonationFailed {
                    rolled_back: false,
                    reason: format!("{reason}; restore failed: {restore_error}"),
                };
                self.emit_failed(&state.target, &error, false);
                self.context.navigator.hard_navigate(&self.settings.login_path);
                Err(error)
            }
        }
    }

    async fn audit_end(&self, state: &ImpersonationState) {
        let session = match self.identity.get_session().await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "no session for impersonation end audit");
                return;
            }
        };

        if let Err(error) = self
            .authority
            .end_impersonation(&session.access_token, &state.admin.user_id, &state.target)
            .await
        {
            warn!(%error, "impersonation end audit failed");
        }
    }

    fn purge_client_state(&self) {
        let preserved = &self.settings.preserved_keys;
        for storage in [&self.context.shared_storage, &self.context.tab_storage] {
            if let Err(error) = storage.clear_except(preserved) {
                error!(%error, "failed to purge client storage");
            }
        }
        if let Err(error) = self.context.device.purge_all() {
            error!(%error, "failed to purge fingerprint records");
        }
        self.verifier.invalidate();
    }

    fn signal_siblings(&self) {
        let storage = &self.context.shared_storage;
        let stamp = Utc::now().timestamp_millis().to_string();
        if let Err(error) = storage
            .set(IMPERSONATION_ENDED_KEY, &stamp)
            .and_then(|()| storage.remove(IMPERSONATION_ENDED_KEY))
        {
            warn!(%error, "failed to signal sibling tabs");
        }
    }

    fn emit_failed(&self, target: &str, error: &AuthError, rolled_back: bool) {
        emit(
            self.event_bus.as_ref(),
            "auth.impersonation.failed",
            EventSource::Auth,
            EventPayload::ImpersonationFailed {
                target: target.to_string(),
                reason: error.to_string(),
                rolled_back,
            },
        );
    }
}

fn forget_state(storage: &TabStorage) {
    if let Err(error) = storage.remove(IMPERSONATION_STATE_KEY) {
        warn!(%error, "failed to remove impersonation state");
    }
}
