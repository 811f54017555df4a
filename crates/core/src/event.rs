use chrono::{DateTime, Utc};
#[cfg(feature = "native")]
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
#[cfg(feature = "native")]
use tokio::sync::broadcast;
use uuid::Uuid;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, crate::error::EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::error::EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Lowercase segments of a-z, 0-9 and underscores, separated by dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("system" | "auth" | "transition" | "tab")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "auth.session.verified")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Optional correlation ID linking related events (e.g., start and end of a transition)
    pub correlation_id: Option<Uuid>,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    /// Create a new event with a correlation ID.
    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: Some(correlation_id),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core system component
    System(String),
    /// Authentication subsystem
    Auth,
    /// A browser tab, by tab id
    Tab(String),
}

/// Named periods during which the default safety policies are overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    #[default]
    Stable,
    OauthCallback,
    LoginCompleting,
    LoggingOut,
    RefreshingToken,
    Impersonating,
    CacheClearing,
}

impl TransitionKind {
    pub const ALL: [TransitionKind; 7] = [
        TransitionKind::Stable,
        TransitionKind::OauthCallback,
        TransitionKind::LoginCompleting,
        TransitionKind::LoggingOut,
        TransitionKind::RefreshingToken,
        TransitionKind::Impersonating,
        TransitionKind::CacheClearing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Stable => "stable",
            TransitionKind::OauthCallback => "oauth_callback",
            TransitionKind::LoginCompleting => "login_completing",
            TransitionKind::LoggingOut => "logging_out",
            TransitionKind::RefreshingToken => "refreshing_token",
            TransitionKind::Impersonating => "impersonating",
            TransitionKind::CacheClearing => "cache_clearing",
        }
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransitionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown transition kind: {s}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    StartupComplete,
    ShutdownRequested {
        reason: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Session events ─────────────────────────────────────────────
    SessionVerified {
        user_id: String,
        degraded: bool,
    },
    SessionRefreshed {
        user_id: String,
        expires_at: DateTime<Utc>,
    },
    SessionInvalidated {
        reason: String,
    },
    SignedOut {
        user_id: Option<String>,
        reason: String,
    },
    DeviceMismatch {
        user_id: String,
    },

    // ── Impersonation events ───────────────────────────────────────
    ImpersonationStarted {
        admin_id: String,
        target_id: String,
    },
    ImpersonationEnded {
        admin_id: String,
        target_id: String,
    },
    ImpersonationFailed {
        target: String,
        reason: String,
        rolled_back: bool,
    },

    // ── Transition events ──────────────────────────────────────────
    TransitionStarted {
        kind: TransitionKind,
        reason: Option<String>,
    },
    TransitionEnded {
        kind: TransitionKind,
        forced: bool,
    },

    // ── Tab events ─────────────────────────────────────────────────
    ForeignSessionChange {
        key: Option<String>,
    },
    ReloadRequested {
        reason: String,
    },
}

#[cfg(feature = "native")]
pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError>;
    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError>;
}

#[cfg(feature = "native")]
#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    auth_sender: broadcast::Sender<Event>,
    transition_sender: broadcast::Sender<Event>,
    tab_sender: broadcast::Sender<Event>,
}

#[cfg(feature = "native")]
impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (auth_sender, _) = broadcast::channel(capacity);
        let (transition_sender, _) = broadcast::channel(capacity);
        let (tab_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            auth_sender,
            transition_sender,
            tab_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "auth" => Some(&self.auth_sender),
            "transition" => Some(&self.transition_sender),
            "tab" => Some(&self.tab_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, crate::error::EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            ));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                auth: Some(self.auth_sender.subscribe()),
                transition: Some(self.transition_sender.subscribe()),
                tab: Some(self.tab_sender.subscribe()),
            });
        }

        let sender = self.sender_for_domain(first_segment).ok_or_else(|| {
            crate::error::EventBusError::InvalidPattern(pattern.to_string())
        })?;

        let mut receivers = DomainReceivers::default();
        let receiver = Some(sender.subscribe());
        match first_segment {
            "system" => receivers.system = receiver,
            "auth" => receivers.auth = receiver,
            "transition" => receivers.transition = receiver,
            _ => receivers.tab = receiver,
        }
        Ok(receivers)
    }
}

#[cfg(feature = "native")]
impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(feature = "native")]
impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| {
                crate::error::EventBusError::InvalidChannel(event.channel.to_string())
            })?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| crate::error::EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

/// Publish a payload on a named channel, dropping it silently when the
/// channel name is invalid or no bus is attached.
#[cfg(feature = "native")]
pub fn emit(
    event_bus: Option<&std::sync::Arc<dyn EventBus>>,
    channel_name: &str,
    source: EventSource,
    payload: EventPayload,
) {
    let Some(event_bus) = event_bus else {
        return;
    };

    let Ok(channel) = Channel::new(channel_name) else {
        return;
    };

    let _ = event_bus.publish(Event::new(channel, source, payload));
}

#[cfg(feature = "native")]
#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    auth: Option<broadcast::Receiver<Event>>,
    transition: Option<broadcast::Receiver<Event>>,
    tab: Option<broadcast::Receiver<Event>>,
}

#[cfg(feature = "native")]
pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

#[cfg(feature = "native")]
impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, crate::error::EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let auth_receiver = self.receivers.auth.as_mut();
            let transition_receiver = self.receivers.transition.as_mut();
            let tab_receiver = self.receivers.tab.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(auth_receiver) => result,
                result = recv_from_domain(transition_receiver) => result,
                result = recv_from_domain(tab_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(crate::error::EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(crate::error::EventBusError::Lagged(count));
                }
            }
        }
    }

    /// Non-blocking receive; `None` when nothing matching is queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        let matcher = &self.matcher;
        let receivers = [
            self.receivers.system.as_mut(),
            self.receivers.auth.as_mut(),
            self.receivers.transition.as_mut(),
            self.receivers.tab.as_mut(),
        ];

        for receiver in receivers.into_iter().flatten() {
            while let Ok(event) = receiver.try_recv() {
                if matcher.is_match(event.channel.as_str()) {
                    return Some(event);
                }
            }
        }
        None
    }
}

#[cfg(feature = "native")]
async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(feature = "native")]
fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}


#[cfg(all(test, feature = "native"))]
mod event_bus_tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn make_event(channel: &str, payload: EventPayload) -> Event {
        Event::new(
            Channel::new(channel).unwrap(),
            EventSource::System("test".into()),
            payload,
        )
    }

    #[tokio::test]
    async fn publish_to_auth_routes_to_auth_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("auth.**").unwrap();

        bus.publish(make_event(
            "auth.session.verified",
            EventPayload::SessionVerified {
                user_id: "u1".into(),
                degraded: false,
            },
        ))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "auth.session.verified");
    }

    #[tokio::test]
    async fn transition_event_not_received_by_auth_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("auth.**").unwrap();

        bus.publish(make_event(
            "transition.started",
            EventPayload::TransitionStarted {
                kind: TransitionKind::Impersonating,
                reason: None,
            },
        ))
        .unwrap();

        let result = timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(result.is_err(), "auth subscriber must not see transition events");
    }

    #[tokio::test]
    async fn firehose_receives_every_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("**").unwrap();

        bus.publish(make_event("system.startup", EventPayload::StartupComplete))
            .unwrap();
        bus.publish(make_event(
            "tab.reload.requested",
            EventPayload::ReloadRequested {
                reason: "test".into(),
            },
        ))
        .unwrap();

        let mut channels = Vec::new();
        for _ in 0..2 {
            let event = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timed out")
                .unwrap();
            channels.push(event.channel.to_string());
        }
        channels.sort();
        assert_eq!(channels, vec!["system.startup", "tab.reload.requested"]);
    }

    #[tokio::test]
    async fn glob_filters_non_matching_channels_within_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("auth.impersonation.*").unwrap();

        bus.publish(make_event(
            "auth.session.invalidated",
            EventPayload::SessionInvalidated {
                reason: "test".into(),
            },
        ))
        .unwrap();
        bus.publish(make_event(
            "auth.impersonation.started",
            EventPayload::ImpersonationStarted {
                admin_id: "admin".into(),
                target_id: "target".into(),
            },
        ))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "auth.impersonation.started");
    }

    #[tokio::test]
    async fn subscribe_unknown_literal_domain_returns_error() {
        let bus = BroadcastEventBus::default();
        assert!(matches!(
            bus.subscribe("chat.**"),
            Err(crate::error::EventBusError::InvalidPattern(_))
        ));
        assert!(bus.subscribe("").is_err());
    }

    #[tokio::test]
    async fn try_recv_returns_queued_matching_event() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("tab.**").unwrap();
        assert!(sub.try_recv().is_none());

        bus.publish(make_event(
            "tab.session.changed",
            EventPayload::ForeignSessionChange { key: None },
        ))
        .unwrap();
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn lagged_subscriber_returns_lagged_error() {
        let bus = BroadcastEventBus::new(2);
        let mut sub = bus.subscribe("system.**").unwrap();

        for _ in 0..5 {
            bus.publish(make_event("system.startup", EventPayload::StartupComplete))
                .unwrap();
        }

        let result = sub.recv().await;
        assert!(matches!(
            result,
            Err(crate::error::EventBusError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn emit_without_bus_is_a_no_op() {
        emit(
            None,
            "auth.session.verified",
            EventSource::Auth,
            EventPayload::StartupComplete,
        );
    }
}
