use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use verity_core::event::{EventBus, EventPayload, EventSource, emit};
use verity_storage::{StorageEvent, StorageEventError, StorageEvents};

use crate::device::FINGERPRINT_PREFIX;
use crate::identity::IdentityService;
use crate::navigation::Navigator;
use crate::session::SESSION_KEY;
use crate::verifier::SessionVerifier;

/// Shared-storage key a tab writes when it ends impersonation.
pub const IMPERSONATION_ENDED_KEY: &str = "verity.impersonation.ended";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncAction {
    Ignored,
    Reverified,
    Reloaded,
}

fn classify(event: &StorageEvent) -> SyncAction {
    match event.key.as_deref() {
        None => SyncAction::Reverified,
        Some(IMPERSONATION_ENDED_KEY) if event.new_value.is_some() => SyncAction::Reloaded,
        Some(SESSION_KEY) => SyncAction::Reverified,
        Some(key) if key.starts_with(FINGERPRINT_PREFIX) => SyncAction::Reverified,
        Some(_) => SyncAction::Ignored,
    }
}

/// Treats sibling-tab storage writes as hints to re-verify locally.
pub struct CrossTabSynchronizer<I: IdentityService> {
    verifier: Arc<SessionVerifier<I>>,
    navigator: Arc<dyn Navigator>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl<I: IdentityService> CrossTabSynchronizer<I> {
    pub fn new(verifier: Arc<SessionVerifier<I>>, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            verifier,
            navigator,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub async fn handle_event(&self, event: &StorageEvent) -> SyncAction {
        let action = classify(event);
        self.apply(action, event.key.clone()).await;
        action
    }

    /// Consumes `events` until the stream closes. Events already queued
    /// behind the first one are folded into a single action.
    pub async fn run(self, mut events: StorageEvents) {
        loop {
            let (mut action, mut key) = match events.recv().await {
                Ok(event) => (classify(&event), event.key),
                Err(StorageEventError::Lagged(missed)) => {
                    warn!(missed, "storage events lagged; treating as session change");
                    (SyncAction::Reverified, None)
                }
                Err(StorageEventError::Closed) => break,
            };

            tokio::task::yield_now().await;
            let mut coalesced = 0_usize;
            while let Some(next) = events.try_recv() {
                coalesced += 1;
                let (next_action, next_key) = match next {
                    Ok(event) => (classify(&event), event.key),
                    Err(StorageEventError::Lagged(_)) => (SyncAction::Reverified, None),
                    Err(StorageEventError::Closed) => break,
                };
                if next_action > action {
                    action = next_action;
                    key = next_key;
                }
            }
            if coalesced > 0 {
                debug!(coalesced, ?action, "coalesced storage events");
            }

            self.apply(action, key).await;
        }
        debug!("storage event stream closed; cross-tab sync stopped");
    }

    pub fn spawn(self, events: StorageEvents) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn apply(&self, action: SyncAction, key: Option<String>) {
        match action {
            SyncAction::Ignored => {}
            SyncAction::Reloaded => {
                info!("impersonation ended in another tab; reloading");
                self.verifier.invalidate();
                emit(
                    self.event_bus.as_ref(),
                    "tab.reload.requested",
                    EventSource::Auth,
                    EventPayload::ReloadRequested {
                        reason: "impersonation ended".to_string(),
                    },
                );
                self.navigator.reload();
            }
            SyncAction::Reverified => {
                debug!(?key, "session changed in another tab; re-verifying");
                emit(
                    self.event_bus.as_ref(),
                    "tab.session.changed",
                    EventSource::Auth,
                    EventPayload::ForeignSessionChange { key },
                );
                self.verifier.invalidate();
                match self.verifier.verify().await {
                    Ok(result) => debug!(
                        authenticated = result.authenticated,
                        degraded = result.degraded,
                        "re-verified after foreign change"
                    ),
                    Err(error) => warn!(%error, "re-verification after foreign change failed"),
                }
            }
        }
    }
}
