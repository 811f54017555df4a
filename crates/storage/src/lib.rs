use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

#[cfg(feature = "native")]
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(feature = "native")]
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "native")]
    #[error("failed to open database at {path}: {reason}")]
    ConnectionFailed { path: PathBuf, reason: String },

    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("value for {key} could not be (de)serialized: {reason}")]
    Serialization { key: String, reason: String },

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Raw key/value persistence shared by every tab of one origin.
///
/// Backends are synchronous, matching browser `localStorage` semantics; the
/// event fan-out lives in [`SharedStorage`].
pub trait StorageBackend: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key` and returns the previous value.
    fn set(&self, key: &str, value: &str) -> Result<Option<String>, StorageError>;

    /// Removes `key` and returns the previous value.
    fn remove(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        self.entries.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.insert(key.to_string(), value.to_string()))
    }

    fn remove(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries()?.remove(key))
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries()?.keys().cloned().collect())
    }
}

/// Identifies one tab (one coordinator instance) sharing a storage origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TabId(String);

impl TabId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mutation observed on shared storage. `key == None` means the whole
/// store was cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: TabId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageEventError {
    #[error("storage event stream closed")]
    Closed,

    #[error("storage event stream lagged: {0} events missed")]
    Lagged(u64),
}

struct SharedInner {
    backend: Arc<dyn StorageBackend>,
    events: broadcast::Sender<StorageEvent>,
}

/// One storage origin: a backend plus the mutation event fan-out every tab
/// handle publishes into.
#[derive(Clone)]
pub struct SharedStorage {
    inner: Arc<SharedInner>,
}

impl SharedStorage {
    pub const DEFAULT_EVENT_CAPACITY: usize = 256;

    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let (events, _) = broadcast::channel(Self::DEFAULT_EVENT_CAPACITY);
        Self {
            inner: Arc::new(SharedInner { backend, events }),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    #[cfg(feature = "native")]
    pub fn open_sqlite(path: &Path) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(SqliteBackend::open(path)?)))
    }

    /// Returns a handle bound to `tab`. Events written through it are
    /// delivered to every other tab's subscription, never to its own.
    pub fn tab(&self, tab: TabId) -> TabStorage {
        TabStorage {
            inner: Arc::clone(&self.inner),
            tab,
        }
    }
}

/// Storage handle owned by one tab.
#[derive(Clone)]
pub struct TabStorage {
    inner: Arc<SharedInner>,
    tab: TabId,
}

impl TabStorage {
    /// A private, unshared store, the equivalent of `sessionStorage`.
    pub fn isolated(tab: TabId) -> Self {
        SharedStorage::in_memory().tab(tab)
    }

    pub fn tab_id(&self) -> &TabId {
        &self.tab
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.backend.get(key)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old_value = self.inner.backend.set(key, value)?;
        if old_value.as_deref() != Some(value) {
            self.publish(Some(key.to_string()), old_value, Some(value.to_string()));
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        if let Some(old_value) = self.inner.backend.remove(key)? {
            self.publish(Some(key.to_string()), Some(old_value), None);
        }
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.backend.keys()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .keys()?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|error| StorageError::Serialization {
                key: key.to_string(),
                reason: error.to_string(),
            })
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|error| StorageError::Serialization {
            key: key.to_string(),
            reason: error.to_string(),
        })?;
        self.set(key, &raw)
    }

    /// Removes every key whose name starts with `prefix`; returns how many went.
    pub fn remove_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let keys = self.keys_with_prefix(prefix)?;
        for key in &keys {
            self.remove(key)?;
        }
        Ok(keys.len())
    }

    /// Removes every key except those listed in `preserved`.
    pub fn clear_except(&self, preserved: &[String]) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in self.keys()? {
            if preserved.iter().any(|keep| keep == &key) {
                continue;
            }
            self.remove(&key)?;
            removed += 1;
        }
        debug!(tab = %self.tab, removed, "cleared storage");
        Ok(removed)
    }

    /// Removes everything and announces a full clear to sibling tabs.
    pub fn clear(&self) -> Result<(), StorageError> {
        for key in self.keys()? {
            self.inner.backend.remove(&key)?;
        }
        self.publish(None, None, None);
        Ok(())
    }

    pub fn subscribe(&self) -> StorageEvents {
        StorageEvents {
            receiver: self.inner.events.subscribe(),
            own: self.tab.clone(),
        }
    }

    fn publish(&self, key: Option<String>, old_value: Option<String>, new_value: Option<String>) {
        let _ = self.inner.events.send(StorageEvent {
            key,
            old_value,
            new_value,
            origin: self.tab.clone(),
        });
    }
}

impl fmt::Debug for TabStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabStorage").field("tab", &self.tab).finish()
    }
}

/// Mutation events caused by other tabs.
pub struct StorageEvents {
    receiver: broadcast::Receiver<StorageEvent>,
    own: TabId,
}

impl StorageEvents {
    pub async fn recv(&mut self) -> Result<StorageEvent, StorageEventError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.origin != self.own => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(StorageEventError::Closed),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(StorageEventError::Lagged(count));
                }
            }
        }
    }

    /// Non-blocking receive of the next foreign event, if one is queued.
    pub fn try_recv(&mut self) -> Option<Result<StorageEvent, StorageEventError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.origin != self.own => return Some(Ok(event)),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Some(Err(StorageEventError::Closed));
                }
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    return Some(Err(StorageEventError::Lagged(count)));
                }
            }
        }
    }
}

#[cfg(feature = "native")]
pub struct SqliteBackend {
    path: PathBuf,
    connection: Mutex<Connection>,
}

#[cfg(feature = "native")]
impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let connection = open_native_connection(path)?;
        run_migrations(&connection)?;
        Ok(Self {
            path: path.to_path_buf(),
            connection: Mutex::new(connection),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.connection.lock().map_err(|_| StorageError::Poisoned)
    }
}

#[cfg(feature = "native")]
impl fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(feature = "native")]
impl StorageBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.connection()?
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|error| StorageError::QueryFailed(error.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<Option<String>, StorageError> {
        let connection = self.connection()?;
        let tx = connection
            .unchecked_transaction()
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
        let previous: Option<String> = tx
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
        tx.execute(
            "INSERT INTO kv_entries (key, value) VALUES (?1, ?2) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![key, value],
        )
        .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
        tx.commit()
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
        Ok(previous)
    }

    fn remove(&self, key: &str) -> Result<Option<String>, StorageError> {
        let connection = self.connection()?;
        let previous: Option<String> = connection
            .query_row(
                "DELETE FROM kv_entries WHERE key = ?1 RETURNING value",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
        Ok(previous)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let connection = self.connection()?;
        let mut statement = connection
            .prepare("SELECT key FROM kv_entries ORDER BY key")
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
        let keys = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
        Ok(keys)
    }
}

#[cfg(feature = "native")]
fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| StorageError::ConnectionFailed {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
    }

    Connection::open(path).map_err(|error| StorageError::ConnectionFailed {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

#[cfg(feature = "native")]
fn open_native_connection(path: &Path) -> Result<Connection, StorageError> {
    let connection = open_connection(path)?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .map_err(|error| StorageError::ConnectionFailed {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .map_err(|error| StorageError::ConnectionFailed {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
    Ok(connection)
}

#[cfg(feature = "native")]
struct Migration {
    version: u32,
    sql: &'static str,
}

#[cfg(feature = "native")]
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/001_initial.sql"),
}];

#[cfg(feature = "native")]
fn run_migrations(connection: &Connection) -> Result<(), StorageError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|error| StorageError::MigrationFailed {
            version: 0,
            reason: format!("failed to create _migrations table: {error}"),
        })?;

    for migration in MIGRATIONS {
        let is_applied: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = ?1)",
                params![migration.version],
                |row| row.get(0),
            )
            .map_err(|error| StorageError::MigrationFailed {
                version: migration.version,
                reason: format!("failed to query migration state: {error}"),
            })?;

        if is_applied != 0 {
            continue;
        }

        let tx =
            connection
                .unchecked_transaction()
                .map_err(|error| StorageError::MigrationFailed {
                    version: migration.version,
                    reason: format!("failed to begin transaction: {error}"),
                })?;

        tx.execute_batch(migration.sql)
            .map_err(|error| StorageError::MigrationFailed {
                version: migration.version,
                reason: error.to_string(),
            })?;

        tx.execute(
            "INSERT INTO _migrations (version) VALUES (?1)",
            params![migration.version],
        )
        .map_err(|error| StorageError::MigrationFailed {
            version: migration.version,
            reason: format!("failed to record migration: {error}"),
        })?;

        tx.commit().map_err(|error| StorageError::MigrationFailed {
            version: migration.version,
            reason: format!("failed to commit migration: {error}"),
        })?;

        info!(version = migration.version, "applied migration");
    }

    Ok(())
}

#[cfg(not(feature = "native"))]
compile_error!("verity-storage requires the `native` feature.");

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn two_tabs() -> (TabStorage, TabStorage) {
        let shared = SharedStorage::in_memory();
        (shared.tab(TabId::named("a")), shared.tab(TabId::named("b")))
    }

    #[test]
    fn set_and_get_round_trip_across_tabs() {
        let (a, b) = two_tabs();
        a.set("k", "v").unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn isolated_storage_is_not_shared() {
        let first = TabStorage::isolated(TabId::named("a"));
        let second = TabStorage::isolated(TabId::named("a"));
        first.set("k", "v").unwrap();
        assert!(second.get("k").unwrap().is_none());
    }

    #[tokio::test]
    async fn events_are_delivered_to_other_tabs_only() {
        let (a, b) = two_tabs();
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.set("session", "one").unwrap();

        let event = b_events.recv().await.unwrap();
        assert_eq!(event.key.as_deref(), Some("session"));
        assert_eq!(event.old_value, None);
        assert_eq!(event.new_value.as_deref(), Some("one"));
        assert_eq!(event.origin, TabId::named("a"));

        assert!(a_events.try_recv().is_none());
    }

    #[tokio::test]
    async fn unchanged_value_does_not_emit() {
        let (a, b) = two_tabs();
        a.set("k", "v").unwrap();
        let mut events = b.subscribe();
        a.set("k", "v").unwrap();
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn removing_missing_key_does_not_emit() {
        let (a, b) = two_tabs();
        let mut events = b.subscribe();
        a.remove("absent").unwrap();
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn clear_except_keeps_preserved_keys() {
        let (a, _) = two_tabs();
        a.set("theme", "dark").unwrap();
        a.set("session", "x").unwrap();
        a.set("fingerprint", "y").unwrap();

        let removed = a.clear_except(&["theme".to_string()]).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(a.keys().unwrap(), vec!["theme".to_string()]);
    }

    #[tokio::test]
    async fn clear_announces_full_clear() {
        let (a, b) = two_tabs();
        a.set("x", "1").unwrap();
        let mut events = b.subscribe();
        a.clear().unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.key, None);
        assert!(a.keys().unwrap().is_empty());
    }

    #[test]
    fn remove_prefix_only_touches_matching_keys() {
        let (a, _) = two_tabs();
        a.set("fp:u1:aa", "1").unwrap();
        a.set("fp:u1:bb", "2").unwrap();
        a.set("fp:u2:cc", "3").unwrap();

        assert_eq!(a.remove_prefix("fp:u1:").unwrap(), 2);
        assert_eq!(a.keys().unwrap(), vec!["fp:u2:cc".to_string()]);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn json_helpers_round_trip_and_report_bad_payloads() {
        let (a, _) = two_tabs();
        let sample = Sample {
            name: "x".into(),
            count: 2,
        };
        a.set_json("sample", &sample).unwrap();
        assert_eq!(a.get_json::<Sample>("sample").unwrap(), Some(sample));

        a.set("broken", "{not json").unwrap();
        assert!(matches!(
            a.get_json::<Sample>("broken"),
            Err(StorageError::Serialization { .. })
        ));
        assert_eq!(a.get_json::<Sample>("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn lagged_subscription_reports_lag() {
        let (a, b) = two_tabs();
        let mut events = b.subscribe();
        for index in 0..(SharedStorage::DEFAULT_EVENT_CAPACITY + 10) {
            a.set("k", &index.to_string()).unwrap();
        }
        assert!(matches!(
            events.recv().await,
            Err(StorageEventError::Lagged(_))
        ));
    }

    #[test]
    fn sqlite_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("verity.db");

        {
            let storage = SharedStorage::open_sqlite(&path).unwrap();
            let tab = storage.tab(TabId::new());
            tab.set("fp:u1:abc", "digest").unwrap();
            tab.set("session", "one").unwrap();
            tab.set("session", "two").unwrap();
            tab.remove("fp:u1:abc").unwrap();
        }

        let backend = SqliteBackend::open(&path).unwrap();
        assert_eq!(backend.get("session").unwrap().as_deref(), Some("two"));
        assert_eq!(backend.get("fp:u1:abc").unwrap(), None);
        assert_eq!(backend.keys().unwrap(), vec!["session".to_string()]);
    }

    #[test]
    fn sqlite_set_returns_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("kv.db")).unwrap();

        assert_eq!(backend.set("k", "1").unwrap(), None);
        assert_eq!(backend.set("k", "2").unwrap().as_deref(), Some("1"));
        assert_eq!(backend.remove("k").unwrap().as_deref(), Some("2"));
        assert_eq!(backend.remove("k").unwrap(), None);
    }
}
