use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use verity_core::TransitionKind;
use verity_core::event::{EventBus, EventPayload, EventSource, emit};
use verity_storage::TabStorage;

/// Admission decisions for one transition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPolicy {
    pub data_access: bool,
    pub redirect: bool,
}

pub fn policy(kind: TransitionKind) -> TransitionPolicy {
    let (data_access, redirect) = match kind {
        TransitionKind::Stable => (true, true),
        TransitionKind::OauthCallback => (false, false),
        TransitionKind::LoginCompleting => (true, false),
        TransitionKind::LoggingOut => (false, true),
        TransitionKind::RefreshingToken => (true, false),
        TransitionKind::Impersonating => (false, false),
        TransitionKind::CacheClearing => (false, true),
    };
    TransitionPolicy {
        data_access,
        redirect,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionState {
    pub kind: TransitionKind,
    pub since: Instant,
    pub started_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl TransitionState {
    fn stable() -> Self {
        Self {
            kind: TransitionKind::Stable,
            since: Instant::now(),
            started_at: Utc::now(),
            reason: None,
        }
    }
}

type Deferred = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    state: TransitionState,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    deferred: VecDeque<Deferred>,
    login_started: Option<Instant>,
}

struct Shared {
    inner: Mutex<Inner>,
    deadline: Duration,
    kind_tx: watch::Sender<TransitionKind>,
    event_bus: Option<Arc<dyn EventBus>>,
    legacy_flags: Mutex<Option<LegacyFlags>>,
}

/// Per-tab state machine serialising unsafe periods.
///
/// Exactly one [`TransitionState`] is current. A transition that is not
/// ended within the deadline is forced back to `stable`.
#[derive(Clone)]
pub struct TransitionCoordinator {
    shared: Arc<Shared>,
}

impl TransitionCoordinator {
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

    pub fn new(deadline: Duration) -> Self {
        Self::build(deadline, None)
    }

    pub fn with_event_bus(deadline: Duration, event_bus: Arc<dyn EventBus>) -> Self {
        Self::build(deadline, Some(event_bus))
    }

    fn build(deadline: Duration, event_bus: Option<Arc<dyn EventBus>>) -> Self {
        let (kind_tx, _) = watch::channel(TransitionKind::Stable);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: TransitionState::stable(),
                    generation: 0,
                    timer: None,
                    deferred: VecDeque::new(),
                    login_started: None,
                }),
                deadline,
                kind_tx,
                event_bus,
                legacy_flags: Mutex::new(None),
            }),
        }
    }

    /// Mirrors legacy string flags into `storage` on every state change.
    pub fn mirror_legacy_flags(&self, storage: TabStorage) {
        let flags = LegacyFlags::new(storage);
        flags.mirror(self.kind());
        *self
            .shared
            .legacy_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(flags);
    }

    pub fn current(&self) -> TransitionState {
        self.lock().state.clone()
    }

    pub fn kind(&self) -> TransitionKind {
        self.lock().state.kind
    }

    pub fn is_stable(&self) -> bool {
        self.kind() == TransitionKind::Stable
    }

    pub fn is_safe_for_data_access(&self) -> bool {
        policy(self.kind()).data_access
    }

    pub fn is_safe_to_redirect(&self) -> bool {
        policy(self.kind()).redirect
    }

    /// True while `window` has not elapsed since the last `login_completing` start.
    pub fn in_login_grace_window(&self, window: Duration) -> bool {
        self.lock()
            .login_started
            .is_some_and(|started| started.elapsed() < window)
    }

    pub fn subscribe(&self) -> watch::Receiver<TransitionKind> {
        self.shared.kind_tx.subscribe()
    }

    /// Enters `kind`, superseding any active transition.
    pub fn start_transition(&self, kind: TransitionKind, reason: Option<String>) {
        if kind == TransitionKind::Stable {
            self.end_transition();
            return;
        }

        let generation = {
            let mut inner = self.lock();
            if inner.state.kind != TransitionKind::Stable {
                warn!(
                    previous = %inner.state.kind,
                    next = %kind,
                    elapsed_ms = inner.state.since.elapsed().as_millis() as u64,
                    "superseding active transition"
                );
            }
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }

            inner.generation += 1;
            inner.state = TransitionState {
                kind,
                since: Instant::now(),
                started_at: Utc::now(),
                reason: reason.clone(),
            };
            if kind == TransitionKind::LoginCompleting {
                inner.login_started = Some(inner.state.since);
            }
            inner.timer = self.arm_timer(inner.generation);
            inner.generation
        };

        info!(%kind, ?reason, generation, "transition started");
        self.notify(kind);
        emit(
            self.shared.event_bus.as_ref(),
            "transition.started",
            EventSource::Auth,
            EventPayload::TransitionStarted { kind, reason },
        );
    }

    /// Returns to `stable` and runs deferred work in FIFO order. Returns
    /// `false` when already stable.
    pub fn end_transition(&self) -> bool {
        self.finish(None, false)
    }

    /// Runs `op` now when stable, otherwise once the current transition ends.
    pub fn when_stable<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.lock();
            if inner.state.kind != TransitionKind::Stable {
                inner.deferred.push_back(Box::new(op));
                return;
            }
        }
        op();
    }

    pub async fn wait_until_stable(&self) {
        let mut receiver = self.shared.kind_tx.subscribe();
        let _ = receiver
            .wait_for(|kind| *kind == TransitionKind::Stable)
            .await;
    }

    /// Forces `stable` regardless of what is active; used by `reset`.
    pub fn reset(&self) {
        self.finish(None, true);
        self.lock().login_started = None;
    }

    fn finish(&self, expected_generation: Option<u64>, forced: bool) -> bool {
        let (kind, deferred) = {
            let mut inner = self.lock();
            if inner.state.kind == TransitionKind::Stable {
                return false;
            }
            if expected_generation.is_some_and(|generation| generation != inner.generation) {
                return false;
            }

            let kind = inner.state.kind;
            if let Some(timer) = inner.timer.take() {
                if expected_generation.is_none() {
                    timer.abort();
                }
            }
            inner.state = TransitionState::stable();
            (kind, std::mem::take(&mut inner.deferred))
        };

        match (expected_generation, forced) {
            (Some(_), _) => warn!(
                %kind,
                deadline_secs = self.shared.deadline.as_secs(),
                deferred = deferred.len(),
                "transition exceeded deadline; forced back to stable"
            ),
            (None, true) => warn!(%kind, deferred = deferred.len(), "transition reset to stable"),
            (None, false) => info!(%kind, deferred = deferred.len(), "transition ended"),
        }

        self.notify(TransitionKind::Stable);
        for op in deferred {
            op();
        }
        emit(
            self.shared.event_bus.as_ref(),
            "transition.ended",
            EventSource::Auth,
            EventPayload::TransitionEnded { kind, forced },
        );
        true
    }

    fn arm_timer(&self, generation: u64) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime available; transition auto-recovery disabled");
            return None;
        };

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let deadline = self.shared.deadline;
        Some(handle.spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(shared) = weak.upgrade() {
                TransitionCoordinator { shared }.finish(Some(generation), true);
            }
        }))
    }

    fn notify(&self, kind: TransitionKind) {
        self.shared.kind_tx.send_replace(kind);
        if let Some(flags) = self
            .shared
            .legacy_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            flags.mirror(kind);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TransitionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionCoordinator")
            .field("state", &self.current())
            .finish()
    }
}

/// Legacy flag name paired with the transition kind that raises it.
pub const LEGACY_FLAGS: [(&str, TransitionKind); 6] = [
    ("isLoggingOut", TransitionKind::LoggingOut),
    ("isOAuthCallback", TransitionKind::OauthCallback),
    ("isLoginCompleting", TransitionKind::LoginCompleting),
    ("isRefreshingToken", TransitionKind::RefreshingToken),
    ("impersonationInProgress", TransitionKind::Impersonating),
    ("isClearingCache", TransitionKind::CacheClearing),
];

/// One-way adapter writing legacy boolean flags derived from the current
/// transition kind. The flags are never read back.
#[derive(Debug, Clone)]
pub struct LegacyFlags {
    storage: TabStorage,
}

impl LegacyFlags {
    pub fn new(storage: TabStorage) -> Self {
        Self { storage }
    }

    pub fn derive(kind: TransitionKind) -> impl Iterator<Item = (&'static str, bool)> {
        LEGACY_FLAGS
            .into_iter()
            .map(move |(name, raised_by)| (name, raised_by == kind))
    }

    fn mirror(&self, kind: TransitionKind) {
        for (name, raised) in Self::derive(kind) {
            let result = if raised {
                self.storage.set(name, "true")
            } else {
                self.storage.remove(name)
            };
            if let Err(error) = result {
                warn!(flag = name, %error, "failed to mirror legacy flag");
            }
        }
    }
}
