//! Client-side session coordination: cached verification, transitions,
//! device binding, cross-tab synchronization, impersonation and gated data
//! access.

pub mod authorization;
pub mod cache;
pub mod coordinator;
pub mod cross_tab;
pub mod device;
pub mod error;
pub mod http;
pub mod identity;
pub mod impersonation;
pub mod navigation;
pub mod proxy;
pub mod session;
pub mod settings;
pub mod transition;
pub mod verifier;

pub use authorization::{
    AccessPolicy, AuthorizationEndpoint, AuthorizationError, ExchangeGrant, RolePolicy,
};
pub use cache::{AuthCache, VerificationResult};
pub use coordinator::{AuthCoordinator, AuthState, Collaborators};
pub use cross_tab::{CrossTabSynchronizer, SyncAction};
pub use device::{DeviceBindingValidator, DeviceCheck, DeviceSignal, FixedSignal};
pub use error::AuthError;
pub use http::{HttpAuthorizationClient, HttpIdentityClient};
pub use identity::{IdentityError, IdentityService};
pub use impersonation::{ImpersonationManager, ImpersonationPhase, ImpersonationState};
pub use navigation::{Navigation, NavigationLog, Navigator};
pub use proxy::{AccessError, QueryBuilder, RemoteError, ResourceAccessor, SecureAccessProxy};
pub use session::{Identity, Session};
pub use settings::AuthSettings;
pub use transition::TransitionCoordinator;
pub use verifier::SessionVerifier;

#[cfg(not(feature = "native"))]
compile_error!("verity-auth requires the `native` feature.");
