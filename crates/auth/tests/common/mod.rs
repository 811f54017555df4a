//! Test doubles for driving one or more tabs against an in-process identity
//! service.
//!
//! The fake service rotates refresh tokens on every refresh and rejects a
//! reused token the way a GoTrue-compatible backend does, so refresh races
//! between tabs behave as they would against the real thing.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use verity_auth::authorization::{AuthorizationEndpoint, AuthorizationError, ExchangeGrant};
use verity_auth::identity::{IdentityError, IdentityService};
use verity_auth::proxy::{QueryBuilder, RemoteError, ResourceAccessor};
use verity_auth::session::{Identity, SESSION_KEY, Session};
use verity_auth::{AuthCoordinator, AuthSettings, Collaborators, FixedSignal, NavigationLog, RolePolicy};
use verity_core::event::EventBus;
use verity_storage::{
    MemoryBackend, SharedStorage, StorageBackend, StorageError, TabId, TabStorage,
};

pub const ADMIN: &str = "admin-1";
pub const ADA: &str = "user-1";
pub const BOB: &str = "user-2";

pub const THEME_KEY: &str = "verity.preferences.theme";
pub const LOCALE_KEY: &str = "verity.preferences.locale";

/// Initialize tracing once per test binary.
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

struct ServerState {
    users: Vec<Identity>,
    access_tokens: HashMap<String, String>,
    refresh_tokens: HashMap<String, String>,
    used_refresh_tokens: HashSet<String>,
    grants: HashMap<String, String>,
    lifetime: chrono::Duration,
    issued: u64,
}

/// In-process identity service shared by every tab of a test.
pub struct FakeIdentityServer {
    state: Mutex<ServerState>,
    latency: Mutex<Duration>,
    online: AtomicBool,
    exchange_fails: AtomicBool,
    restore_fails: AtomicBool,
    sign_out_revokes_access: AtomicBool,
    get_user_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
}

impl FakeIdentityServer {
    pub fn new() -> Arc<Self> {
        let users = vec![
            Identity {
                user_id: ADMIN.to_string(),
                email: Some("admin@example.com".to_string()),
                role: Some("admin".to_string()),
            },
            Identity {
                user_id: ADA.to_string(),
                email: Some("ada@example.com".to_string()),
                role: Some("member".to_string()),
            },
            Identity {
                user_id: BOB.to_string(),
                email: Some("bob@example.com".to_string()),
                role: Some("member".to_string()),
            },
        ];

        Arc::new(Self {
            state: Mutex::new(ServerState {
                users,
                access_tokens: HashMap::new(),
                refresh_tokens: HashMap::new(),
                used_refresh_tokens: HashSet::new(),
                grants: HashMap::new(),
                lifetime: chrono::Duration::hours(1),
                issued: 0,
            }),
            latency: Mutex::new(Duration::ZERO),
            online: AtomicBool::new(true),
            exchange_fails: AtomicBool::new(false),
            restore_fails: AtomicBool::new(false),
            sign_out_revokes_access: AtomicBool::new(true),
            get_user_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
        })
    }

    /// Issues a fresh session for `user_id` with the default lifetime.
    pub fn issue(&self, user_id: &str) -> Session {
        let lifetime = self.state.lock().unwrap().lifetime;
        self.issue_expiring_in(user_id, lifetime)
    }

    pub fn issue_expiring_in(&self, user_id: &str, lifetime: chrono::Duration) -> Session {
        let mut state = self.state.lock().unwrap();
        state.issued += 1;
        let n = state.issued;
        let session = Session {
            user_id: user_id.to_string(),
            access_token: format!("access-{user_id}-{n}"),
            refresh_token: format!("refresh-{user_id}-{n}"),
            expires_at: Utc::now() + lifetime,
            device_fingerprint: None,
        };
        state
            .access_tokens
            .insert(session.access_token.clone(), user_id.to_string());
        state
            .refresh_tokens
            .insert(session.refresh_token.clone(), user_id.to_string());
        session
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn fail_exchange(&self, fail: bool) {
        self.exchange_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restore(&self, fail: bool) {
        self.restore_fails.store(fail, Ordering::SeqCst);
    }

    /// Models a backend whose access tokens are plain JWTs that stay valid
    /// until expiry after a logout.
    pub fn keep_access_tokens_on_sign_out(&self) {
        self.sign_out_revokes_access.store(false, Ordering::SeqCst);
    }

    pub fn revoke_access(&self, access_token: &str) {
        self.state.lock().unwrap().access_tokens.remove(access_token);
    }

    pub fn revoke_refresh(&self, refresh_token: &str) {
        self.state.lock().unwrap().refresh_tokens.remove(refresh_token);
    }

    pub fn mark_refresh_used(&self, refresh_token: &str) {
        let mut state = self.state.lock().unwrap();
        state.refresh_tokens.remove(refresh_token);
        state.used_refresh_tokens.insert(refresh_token.to_string());
    }

    pub fn get_user_calls(&self) -> usize {
        self.get_user_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.get_user_calls.store(0, Ordering::SeqCst);
        self.refresh_calls.store(0, Ordering::SeqCst);
        self.sign_out_calls.store(0, Ordering::SeqCst);
    }

    /// Finds a user by id or email.
    pub fn resolve(&self, target: &str) -> Option<Identity> {
        self.state
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|user| user.user_id == target || user.email.as_deref() == Some(target))
            .cloned()
    }

    fn grant(&self, target: &str) -> Option<String> {
        let user = self.resolve(target)?;
        let mut state = self.state.lock().unwrap();
        state.issued += 1;
        let token = format!("grant-{}", state.issued);
        state.grants.insert(token.clone(), user.user_id);
        Some(token)
    }

    async fn round_trip(&self) -> Result<(), IdentityError> {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IdentityError::Network("connection refused".to_string()))
        }
    }

    async fn get_user(&self, access_token: &str) -> Result<Identity, IdentityError> {
        self.get_user_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;
        let user_id = self
            .state
            .lock()
            .unwrap()
            .access_tokens
            .get(access_token)
            .cloned()
            .ok_or(IdentityError::Unauthorized)?;
        self.resolve(&user_id).ok_or(IdentityError::Unauthorized)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, IdentityError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.round_trip().await?;
        let user_id = {
            let mut state = self.state.lock().unwrap();
            if state.used_refresh_tokens.contains(refresh_token) {
                return Err(IdentityError::RefreshTokenAlreadyUsed);
            }
            let Some(user_id) = state.refresh_tokens.remove(refresh_token) else {
                return Err(IdentityError::RefreshTokenNotFound);
            };
            state.used_refresh_tokens.insert(refresh_token.to_string());
            user_id
        };
        Ok(self.issue(&user_id))
    }

    async fn sign_out(&self, session: &Session) {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.revoke_refresh(&session.refresh_token);
        if self.sign_out_revokes_access.load(Ordering::SeqCst) {
            self.revoke_access(&session.access_token);
        }
    }

    async fn redeem(&self, exchange_token: &str) -> Result<Session, IdentityError> {
        self.round_trip().await?;
        if self.exchange_fails.load(Ordering::SeqCst) {
            return Err(IdentityError::InvalidGrant("exchange token expired".to_string()));
        }
        let user_id = self
            .state
            .lock()
            .unwrap()
            .grants
            .remove(exchange_token)
            .ok_or_else(|| IdentityError::InvalidGrant("unknown exchange token".to_string()))?;
        Ok(self.issue(&user_id))
    }
}

/// Per-tab identity client persisting its session in shared storage.
pub struct FakeIdentityClient {
    server: Arc<FakeIdentityServer>,
    storage: TabStorage,
}

impl FakeIdentityClient {
    pub fn new(server: Arc<FakeIdentityServer>, storage: TabStorage) -> Self {
        Self { server, storage }
    }

    fn persist(&self, session: &Session) -> Result<(), IdentityError> {
        self.storage
            .set_json(SESSION_KEY, session)
            .map_err(|error| IdentityError::Storage(error.to_string()))
    }

    fn stored(&self) -> Result<Option<Session>, IdentityError> {
        self.storage
            .get_json(SESSION_KEY)
            .map_err(|error| IdentityError::Storage(error.to_string()))
    }
}

impl IdentityService for FakeIdentityClient {
    async fn get_session(&self) -> Result<Option<Session>, IdentityError> {
        self.stored()
    }

    async fn refresh_session(&self) -> Result<Session, IdentityError> {
        let current = self.stored()?.ok_or(IdentityError::NoSession)?;
        let refreshed = self.server.refresh(&current.refresh_token).await?;
        self.persist(&refreshed)?;
        Ok(refreshed)
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        if let Some(session) = self.stored()? {
            self.server.sign_out(&session).await;
        }
        self.storage
            .remove(SESSION_KEY)
            .map_err(|error| IdentityError::Storage(error.to_string()))
    }

    async fn get_user(&self, access_token: &str) -> Result<Identity, IdentityError> {
        self.server.get_user(access_token).await
    }

    async fn exchange_token(&self, token_hash: &str) -> Result<Session, IdentityError> {
        let session = self.server.redeem(token_hash).await?;
        self.persist(&session)?;
        Ok(session)
    }

    async fn set_session(&self, session: Session) -> Result<Session, IdentityError> {
        if self.server.restore_fails.load(Ordering::SeqCst) {
            return Err(IdentityError::SessionNotFound);
        }
        let identity = self.server.get_user(&session.access_token).await?;
        if identity.user_id != session.user_id {
            return Err(IdentityError::Unauthorized);
        }
        self.persist(&session)?;
        Ok(session)
    }
}

/// Authorization endpoint backed by the fake identity server.
pub struct FakeAuthority {
    server: Arc<FakeIdentityServer>,
    csrf_fails: AtomicBool,
    deny: AtomicBool,
    exchange_requests: AtomicUsize,
    end_calls: AtomicUsize,
}

const CSRF_TOKEN: &str = "csrf-token-1";

impl FakeAuthority {
    pub fn new(server: Arc<FakeIdentityServer>) -> Self {
        Self {
            server,
            csrf_fails: AtomicBool::new(false),
            deny: AtomicBool::new(false),
            exchange_requests: AtomicUsize::new(0),
            end_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_csrf(&self, fail: bool) {
        self.csrf_fails.store(fail, Ordering::SeqCst);
    }

    pub fn deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn exchange_requests(&self) -> usize {
        self.exchange_requests.load(Ordering::SeqCst)
    }

    pub fn end_calls(&self) -> usize {
        self.end_calls.load(Ordering::SeqCst)
    }
}

impl AuthorizationEndpoint for FakeAuthority {
    async fn fetch_csrf_token(&self, _access_token: &str) -> Result<String, AuthorizationError> {
        if self.csrf_fails.load(Ordering::SeqCst) {
            return Err(AuthorizationError::CsrfUnavailable("503".to_string()));
        }
        Ok(CSRF_TOKEN.to_string())
    }

    async fn request_exchange(
        &self,
        _access_token: &str,
        csrf_token: &str,
        target: &str,
        _reason: &str,
    ) -> Result<ExchangeGrant, AuthorizationError> {
        self.exchange_requests.fetch_add(1, Ordering::SeqCst);
        if csrf_token != CSRF_TOKEN || self.deny.load(Ordering::SeqCst) {
            return Err(AuthorizationError::Forbidden("not an administrator".to_string()));
        }
        let role = self.server.resolve(target).and_then(|user| user.role);
        let exchange_token = self
            .server
            .grant(target)
            .ok_or_else(|| AuthorizationError::TargetNotProvisioned(target.to_string()))?;
        Ok(ExchangeGrant {
            exchange_token,
            target_role: role,
        })
    }

    async fn end_impersonation(
        &self,
        _access_token: &str,
        _admin_id: &str,
        _target: &str,
    ) -> Result<(), AuthorizationError> {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct AccessLog {
    executed: Mutex<Vec<Vec<String>>>,
    next_failure: Mutex<Option<RemoteError>>,
}

/// Data backend recording every executed query.
#[derive(Clone, Default)]
pub struct FakeAccessor {
    log: Arc<AccessLog>,
}

impl FakeAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: RemoteError) {
        *self.log.next_failure.lock().unwrap() = Some(error);
    }

    pub fn executed(&self) -> Vec<Vec<String>> {
        self.log.executed.lock().unwrap().clone()
    }

    fn complete(log: &AccessLog, ops: Vec<String>) -> Result<Value, RemoteError> {
        log.executed.lock().unwrap().push(ops.clone());
        match log.next_failure.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(json!({ "ops": ops })),
        }
    }
}

pub struct FakeQuery {
    log: Arc<AccessLog>,
    ops: Vec<String>,
}

impl FakeQuery {
    fn push(mut self, op: String) -> Self {
        self.ops.push(op);
        self
    }
}

impl QueryBuilder for FakeQuery {
    fn select(self, columns: &str) -> Self {
        self.push(format!("select {columns}"))
    }

    fn eq(self, column: &str, value: Value) -> Self {
        self.push(format!("eq {column} {value}"))
    }

    fn order(self, column: &str, ascending: bool) -> Self {
        self.push(format!("order {column} {}", if ascending { "asc" } else { "desc" }))
    }

    fn limit(self, count: usize) -> Self {
        self.push(format!("limit {count}"))
    }

    fn insert(self, row: Value) -> Self {
        self.push(format!("insert {row}"))
    }

    fn update(self, patch: Value) -> Self {
        self.push(format!("update {patch}"))
    }

    fn delete(self) -> Self {
        self.push("delete".to_string())
    }

    async fn execute(self) -> Result<Value, RemoteError> {
        FakeAccessor::complete(&self.log, self.ops)
    }
}

impl ResourceAccessor for FakeAccessor {
    type Query = FakeQuery;

    fn from(&self, table: &str) -> FakeQuery {
        FakeQuery {
            log: Arc::clone(&self.log),
            ops: vec![format!("from {table}")],
        }
    }

    async fn rpc(&self, function: &str, params: Value) -> Result<Value, RemoteError> {
        FakeAccessor::complete(&self.log, vec![format!("rpc {function} {params}")])
    }
}

/// Backend that accepts writes but refuses every removal.
struct NoRemovalBackend(MemoryBackend);

impl StorageBackend for NoRemovalBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.0.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<Option<String>, StorageError> {
        self.0.set(key, value)
    }

    fn remove(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::QueryFailed("storage is read-only for removals".to_string()))
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.0.keys()
    }
}

/// Tab-local storage whose removals always fail.
pub fn no_removal_tab_storage(name: &str) -> TabStorage {
    SharedStorage::new(Arc::new(NoRemovalBackend(MemoryBackend::new()))).tab(TabId::named(name))
}

pub type TestCoordinator = AuthCoordinator<FakeIdentityClient, FakeAuthority>;

/// One simulated browser tab.
pub struct TestTab {
    pub coordinator: TestCoordinator,
    pub navigator: Arc<NavigationLog>,
    pub authority: Arc<FakeAuthority>,
    /// Handle on the origin-wide storage, written as this tab.
    pub shared: TabStorage,
    /// This tab's private storage.
    pub local: TabStorage,
}

pub struct TabOptions {
    pub settings: AuthSettings,
    pub device: String,
    pub local: Option<TabStorage>,
    pub event_bus: Option<Arc<dyn EventBus>>,
}

impl Default for TabOptions {
    fn default() -> Self {
        Self {
            settings: AuthSettings::default(),
            device: "device-a".to_string(),
            local: None,
            event_bus: None,
        }
    }
}

pub fn open_tab(storage: &SharedStorage, server: &Arc<FakeIdentityServer>, name: &str) -> TestTab {
    open_tab_with(storage, server, name, TabOptions::default())
}

pub fn open_tab_with(
    storage: &SharedStorage,
    server: &Arc<FakeIdentityServer>,
    name: &str,
    options: TabOptions,
) -> TestTab {
    let shared = storage.tab(TabId::named(name));
    let local = options
        .local
        .unwrap_or_else(|| TabStorage::isolated(TabId::named(name)));
    let navigator = Arc::new(NavigationLog::new());
    let authority = Arc::new(FakeAuthority::new(Arc::clone(server)));

    let coordinator = AuthCoordinator::new(
        options.settings,
        Collaborators {
            identity: Arc::new(FakeIdentityClient::new(Arc::clone(server), shared.clone())),
            authority: Arc::clone(&authority),
            policy: Arc::new(RolePolicy::new(["admin"])),
            navigator: navigator.clone(),
            device_signal: Arc::new(FixedSignal::new(options.device)),
            shared_storage: shared.clone(),
            tab_storage: local.clone(),
            event_bus: options.event_bus,
        },
    );

    TestTab {
        coordinator,
        navigator,
        authority,
        shared,
        local,
    }
}

/// Stores `session` as the origin's persisted session.
pub fn seed_session(tab: &TestTab, session: &Session) {
    tab.shared.set_json(SESSION_KEY, session).unwrap();
}

pub fn stored_session(tab: &TestTab) -> Option<Session> {
    tab.shared.get_json(SESSION_KEY).unwrap()
}
