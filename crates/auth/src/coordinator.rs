use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use verity_core::TransitionKind;
use verity_core::event::EventBus;
use verity_storage::TabStorage;

use crate::authorization::{AccessPolicy, AuthorizationEndpoint};
use crate::cache::{AuthCache, VerificationResult};
use crate::cross_tab::CrossTabSynchronizer;
use crate::device::{DeviceBindingValidator, DeviceSignal};
use crate::error::AuthError;
use crate::identity::IdentityService;
use crate::impersonation::{
    IMPERSONATION_STATE_KEY, ImpersonationContext, ImpersonationManager, ImpersonationState,
};
use crate::navigation::Navigator;
use crate::proxy::{ResourceAccessor, SecureAccessProxy};
use crate::session::Session;
use crate::settings::AuthSettings;
use crate::transition::TransitionCoordinator;
use crate::verifier::SessionVerifier;

/// External collaborators one tab's coordinator is wired to.
pub struct Collaborators<I, A> {
    pub identity: Arc<I>,
    pub authority: Arc<A>,
    pub policy: Arc<dyn AccessPolicy>,
    pub navigator: Arc<dyn Navigator>,
    pub device_signal: Arc<dyn DeviceSignal>,
    /// Storage shared with sibling tabs.
    pub shared_storage: TabStorage,
    /// Storage private to this tab.
    pub tab_storage: TabStorage,
    pub event_bus: Option<Arc<dyn EventBus>>,
}

/// Synchronous snapshot for feature modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub verification: Option<VerificationResult>,
    pub transition: TransitionKind,
    pub impersonating: bool,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        self.verification
            .as_ref()
            .is_some_and(|result| result.authenticated)
    }
}

/// Owns one isolated instance of every auth component for a single tab.
pub struct AuthCoordinator<I: IdentityService, A: AuthorizationEndpoint> {
    settings: AuthSettings,
    identity: Arc<I>,
    navigator: Arc<dyn Navigator>,
    shared_storage: TabStorage,
    tab_storage: TabStorage,
    event_bus: Option<Arc<dyn EventBus>>,
    cache: Arc<AuthCache>,
    transitions: TransitionCoordinator,
    device: Arc<DeviceBindingValidator>,
    verifier: Arc<SessionVerifier<I>>,
    impersonation: ImpersonationManager<I, A>,
}

impl<I: IdentityService, A: AuthorizationEndpoint> AuthCoordinator<I, A> {
    pub fn new(settings: AuthSettings, collaborators: Collaborators<I, A>) -> Self {
        let Collaborators {
            identity,
            authority,
            policy,
            navigator,
            device_signal,
            shared_storage,
            tab_storage,
            event_bus,
        } = collaborators;

        let cache = Arc::new(AuthCache::new(settings.positive_ttl, settings.negative_ttl));
        let transitions = match &event_bus {
            Some(event_bus) => {
                TransitionCoordinator::with_event_bus(settings.transition_deadline, event_bus.clone())
            }
            None => TransitionCoordinator::new(settings.transition_deadline),
        };
        transitions.mirror_legacy_flags(tab_storage.clone());

        let mut device = DeviceBindingValidator::new(
            shared_storage.clone(),
            device_signal,
            transitions.clone(),
            settings.grace_window,
        )
        .enabled(settings.device_binding);
        if let Some(event_bus) = &event_bus {
            device = device.with_event_bus(event_bus.clone());
        }
        let device = Arc::new(device);

        let mut verifier = SessionVerifier::new(
            identity.clone(),
            cache.clone(),
            transitions.clone(),
            device.clone(),
            settings.verifier,
        );
        if let Some(event_bus) = &event_bus {
            verifier = verifier.with_event_bus(event_bus.clone());
        }
        let verifier = Arc::new(verifier);

        let mut impersonation = ImpersonationManager::new(
            identity.clone(),
            authority,
            policy,
            verifier.clone(),
            ImpersonationContext {
                shared_storage: shared_storage.clone(),
                tab_storage: tab_storage.clone(),
                navigator: navigator.clone(),
                transitions: transitions.clone(),
                device: device.clone(),
            },
            settings.impersonation.clone(),
        );
        if let Some(event_bus) = &event_bus {
            impersonation = impersonation.with_event_bus(event_bus.clone());
        }

        Self {
            settings,
            identity,
            navigator,
            shared_storage,
            tab_storage,
            event_bus,
            cache,
            transitions,
            device,
            verifier,
            impersonation,
        }
    }

    pub fn transitions(&self) -> &TransitionCoordinator {
        &self.transitions
    }

    pub fn verifier(&self) -> &Arc<SessionVerifier<I>> {
        &self.verifier
    }

    pub fn device(&self) -> &DeviceBindingValidator {
        &self.device
    }

    pub fn impersonation(&self) -> &ImpersonationManager<I, A> {
        &self.impersonation
    }

    pub fn get_auth_state(&self) -> AuthState {
        AuthState {
            verification: self.cache.last(),
            transition: self.transitions.kind(),
            impersonating: self.impersonation.is_active(),
        }
    }

    /// Verifies the current session once no transition forbids data access.
    pub async fn verify_session(&self) -> Result<VerificationResult, AuthError> {
        self.await_admission().await;
        self.verifier.verify().await
    }

    pub fn is_safe_for_api_calls(&self) -> bool {
        self.transitions.is_safe_for_data_access()
    }

    pub fn is_safe_to_redirect(&self) -> bool {
        self.transitions.is_safe_to_redirect()
    }

    /// Verifies and sends the user to the login page when unauthenticated.
    pub async fn require_auth(&self) -> Result<VerificationResult, AuthError> {
        self.await_admission().await;
        match self.verifier.verify().await {
            Ok(result) if result.authenticated => Ok(result),
            Ok(_) => {
                self.redirect_to_login();
                Err(AuthError::AuthRequired)
            }
            Err(error) => {
                self.navigate_after(&error);
                Err(error)
            }
        }
    }

    /// Re-verification hook for feature modules that received a 401.
    pub async fn handle_401_error(&self) -> Result<VerificationResult, AuthError> {
        info!("authorization failure reported; re-verifying session");
        self.await_admission().await;
        self.verifier.invalidate();
        self.require_auth().await
    }

    /// Establishes `session` after a completed sign-in.
    pub async fn complete_login(&self, session: Session) -> Result<VerificationResult, AuthError> {
        self.transitions.start_transition(
            TransitionKind::LoginCompleting,
            Some("login completing".to_string()),
        );
        let outcome = self.establish(session).await;
        self.transitions.end_transition();
        outcome
    }

    /// Handles the OAuth redirect: adopt the session, verify, then redirect
    /// to `return_to` once stable.
    pub async fn handle_oauth_callback(
        &self,
        session: Session,
        return_to: &str,
    ) -> Result<VerificationResult, AuthError> {
        self.transitions.start_transition(
            TransitionKind::OauthCallback,
            Some("oauth callback".to_string()),
        );
        let adopted = self.identity.set_session(session).await;
        self.transitions.end_transition();
        let session = match adopted {
            Ok(session) => session,
            Err(error) => {
                warn!(%error, "oauth callback session rejected");
                return Err(error.into());
            }
        };

        self.transitions.start_transition(
            TransitionKind::LoginCompleting,
            Some(format!("oauth login for {}", session.user_id)),
        );
        let verified = self.verify_established().await;
        self.transitions.end_transition();

        let result = verified?;
        if result.authenticated {
            let navigator = self.navigator.clone();
            let return_to = return_to.to_string();
            self.transitions
                .when_stable(move || navigator.redirect(&return_to));
        }
        Ok(result)
    }

    /// Explicit sign-out followed by a redirect to the login page.
    pub async fn sign_out(&self, reason: &str) {
        self.transitions.start_transition(
            TransitionKind::LoggingOut,
            Some(reason.to_string()),
        );
        self.verifier.sign_out(reason).await;
        self.transitions.end_transition();
        self.redirect_to_login();
    }

    /// Drops cached verification and tab-local state, then re-verifies.
    pub async fn clear_caches(&self) -> Result<VerificationResult, AuthError> {
        self.transitions.start_transition(
            TransitionKind::CacheClearing,
            Some("cache clear requested".to_string()),
        );
        self.verifier.invalidate();
        let mut keep = self.settings.impersonation.preserved_keys.clone();
        keep.push(IMPERSONATION_STATE_KEY.to_string());
        let cleared = self.tab_storage.clear_except(&keep);
        self.transitions.end_transition();

        let removed = cleared?;
        info!(removed, "tab caches cleared");
        self.verifier.verify().await
    }

    pub async fn start_impersonation(
        &self,
        target: &str,
        reason: &str,
    ) -> Result<ImpersonationState, AuthError> {
        let outcome = self.impersonation.start(target, reason).await;
        if let Err(error) = &outcome {
            warn!(%error, target, "impersonation start failed");
        }
        outcome
    }

    pub async fn end_impersonation(&self) -> Result<(), AuthError> {
        self.impersonation.end().await
    }

    pub fn secure_accessor<R: ResourceAccessor>(&self, accessor: Arc<R>) -> SecureAccessProxy<R, I> {
        SecureAccessProxy::new(accessor, self.verifier.clone(), self.transitions.clone())
    }

    pub fn cross_tab_synchronizer(&self) -> CrossTabSynchronizer<I> {
        let synchronizer = CrossTabSynchronizer::new(self.verifier.clone(), self.navigator.clone());
        match &self.event_bus {
            Some(event_bus) => synchronizer.with_event_bus(event_bus.clone()),
            None => synchronizer,
        }
    }

    /// Starts reacting to sibling-tab storage writes.
    pub fn spawn_cross_tab_sync(&self) -> JoinHandle<()> {
        self.cross_tab_synchronizer()
            .spawn(self.shared_storage.subscribe())
    }

    /// Returns in-memory state to its initial condition.
    pub fn reset(&self) {
        self.cache.invalidate();
        self.transitions.reset();
    }

    async fn establish(&self, session: Session) -> Result<VerificationResult, AuthError> {
        self.identity.set_session(session).await?;
        self.verify_established().await
    }

    async fn verify_established(&self) -> Result<VerificationResult, AuthError> {
        self.verifier.invalidate();
        let result = self.verifier.verify().await?;
        if result.authenticated {
            info!(user_id = ?result.user_id, "login completed");
        }
        Ok(result)
    }

    /// Parks the caller while the active transition forbids data access.
    /// The deadline timer bounds the wait.
    async fn await_admission(&self) {
        if !self.transitions.is_safe_for_data_access() {
            debug!(transition = self.transitions.kind().as_str(), "waiting for transition to end");
            self.transitions.wait_until_stable().await;
        }
    }

    fn redirect_to_login(&self) {
        let navigator = self.navigator.clone();
        let login_path = self.settings.impersonation.login_path.clone();
        if self.transitions.is_safe_to_redirect() {
            navigator.redirect(&login_path);
            return;
        }

        let cache = self.cache.clone();
        self.transitions.when_stable(move || {
            // A sign-in may have landed while the redirect was parked.
            if cache.last().is_some_and(|result| result.authenticated) {
                debug!("deferred login redirect dropped; session is authenticated");
                return;
            }
            navigator.redirect(&login_path);
        });
    }

    fn navigate_after(&self, error: &AuthError) {
        if error.is_terminal() {
            self.navigator
                .hard_navigate(&self.settings.impersonation.login_path);
        }
    }
}
