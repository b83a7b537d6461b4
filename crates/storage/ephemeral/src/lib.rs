use std::collections::{BTreeMap, HashMap};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use memsync_core::{
    config::SessionConfig,
    model::{AuthorizedKey, SessionMode},
    traits::{AccountService, RemoteStore, Session},
};
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EphemeralError {
    #[error("remote unreachable")]
    Unreachable,
    #[error("session is read-only")]
    ReadOnly,
}

type Table = HashMap<String, Vec<u8>>;

struct RemoteInner {
    databases: RwLock<HashMap<String, Table>>,
    keys: RwLock<Vec<AuthorizedKey>>,
    identity: String,
    online: AtomicBool,
    sync_calls: AtomicUsize,
}

/// In-process stand-in for the remote service. Clones share state, so several
/// `EphemeralStore`s can play independent processes syncing one account.
#[derive(Clone)]
pub struct EphemeralRemote {
    inner: Arc<RemoteInner>,
}

impl EphemeralRemote {
    #[must_use]
    pub fn new(identity: &str) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                databases: RwLock::new(HashMap::new()),
                keys: RwLock::new(vec![AuthorizedKey::new(identity, Some("primary"))]),
                identity: identity.to_owned(),
                online: AtomicBool::new(true),
                sync_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Number of sync calls that reached the remote, failed ones included.
    pub fn sync_count(&self) -> usize {
        self.inner.sync_calls.load(Ordering::SeqCst)
    }

    pub fn authorize_key(&self, key: AuthorizedKey) {
        self.inner.keys.write().push(key);
    }

    /// Snapshot of a remote database, for assertions.
    pub fn snapshot(&self, database: &str) -> BTreeMap<String, Vec<u8>> {
        self.inner
            .databases
            .read()
            .get(database)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn ensure_online(&self) -> Result<(), EphemeralError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(EphemeralError::Unreachable)
        }
    }
}

impl Default for EphemeralRemote {
    fn default() -> Self {
        Self::new("ephemeral-device")
    }
}

#[derive(Default)]
struct LocalDb {
    data: Table,
    // committed since the last sync; None marks a delete
    dirty: HashMap<String, Option<Vec<u8>>>,
    last_sync: Option<DateTime<Utc>>,
}

struct StoreInner {
    remote: EphemeralRemote,
    local: RwLock<HashMap<String, LocalDb>>,
    sessions_opened: AtomicUsize,
}

/// Local replica held by one process.
#[derive(Clone)]
pub struct EphemeralStore {
    inner: Arc<StoreInner>,
}

impl EphemeralStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_remote(EphemeralRemote::default())
    }

    #[must_use]
    pub fn with_remote(remote: EphemeralRemote) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                remote,
                local: RwLock::new(HashMap::new()),
                sessions_opened: AtomicUsize::new(0),
            }),
        }
    }

    pub fn remote(&self) -> &EphemeralRemote {
        &self.inner.remote
    }

    pub fn sync_count(&self) -> usize {
        self.inner.remote.sync_count()
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Keys committed locally but not yet synced.
    pub fn pending_sync(&self, database: &str) -> usize {
        self.inner
            .local
            .read()
            .get(database)
            .map(|db| db.dirty.len())
            .unwrap_or(0)
    }

    /// Pretend the last sync of `database` happened at `at`.
    pub fn set_last_sync(&self, database: &str, at: Option<DateTime<Utc>>) {
        let mut local = self.inner.local.write();
        local.entry(database.to_owned()).or_default().last_sync = at;
    }
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EphemeralSession {
    store: Arc<StoreInner>,
    database: String,
    mode: SessionMode,
    pending: BTreeMap<String, Option<Vec<u8>>>,
}

impl EphemeralSession {
    fn ensure_writable(&self) -> Result<(), EphemeralError> {
        if self.mode.is_read_only() {
            Err(EphemeralError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl Session for EphemeralSession {
    type Error = EphemeralError;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.clone());
        }
        let local = self.store.local.read();
        Ok(local
            .get(&self.database)
            .and_then(|db| db.data.get(key).cloned()))
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        let mut keys: Vec<String> = {
            let local = self.store.local.read();
            local
                .get(&self.database)
                .map(|db| {
                    db.data
                        .keys()
                        .filter(|k| k.starts_with(prefix) && !self.pending.contains_key(*k))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        keys.extend(
            self.pending
                .iter()
                .filter(|(k, v)| v.is_some() && k.starts_with(prefix))
                .map(|(k, _)| k.clone()),
        );
        keys.sort();
        Ok(keys)
    }

    fn last_sync(&self) -> Result<Option<DateTime<Utc>>, Self::Error> {
        let local = self.store.local.read();
        Ok(local.get(&self.database).and_then(|db| db.last_sync))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        self.ensure_writable()?;
        self.pending.insert(key.to_owned(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), Self::Error> {
        self.ensure_writable()?;
        self.pending.insert(key.to_owned(), None);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ensure_writable()?;
        let mut local = self.store.local.write();
        let db = local.entry(self.database.clone()).or_default();
        for (key, value) in std::mem::take(&mut self.pending) {
            match &value {
                Some(v) => {
                    db.data.insert(key.clone(), v.clone());
                }
                None => {
                    db.data.remove(&key);
                }
            }
            db.dirty.insert(key, value);
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        let remote = &self.store.remote;
        remote.inner.sync_calls.fetch_add(1, Ordering::SeqCst);
        remote.ensure_online()?;
        let mut local = self.store.local.write();
        let db = local.entry(self.database.clone()).or_default();
        let mut databases = remote.inner.databases.write();
        let table = databases.entry(self.database.clone()).or_default();
        for (key, value) in db.dirty.drain() {
            match value {
                Some(v) => {
                    table.insert(key, v);
                }
                None => {
                    table.remove(&key);
                }
            }
        }
        db.data = table.clone();
        db.last_sync = Some(Utc::now());
        Ok(())
    }
}

impl RemoteStore for EphemeralStore {
    type Error = EphemeralError;
    type Session = EphemeralSession;

    fn open(
        &self,
        config: &SessionConfig,
        mode: SessionMode,
    ) -> Result<Self::Session, Self::Error> {
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(EphemeralSession {
            store: Arc::clone(&self.inner),
            database: config.database().to_owned(),
            mode,
            pending: BTreeMap::new(),
        })
    }

    fn reset(&self, config: &SessionConfig) -> Result<(), Self::Error> {
        self.inner.remote.ensure_online()?;
        self.inner.local.write().remove(config.database());
        self.inner
            .remote
            .inner
            .databases
            .write()
            .remove(config.database());
        Ok(())
    }
}

impl AccountService for EphemeralStore {
    type Error = EphemeralError;

    fn id(&self, _config: &SessionConfig) -> Result<String, Self::Error> {
        self.inner.remote.ensure_online()?;
        Ok(self.inner.remote.inner.identity.clone())
    }

    fn list_authorized_keys(
        &self,
        _config: &SessionConfig,
    ) -> Result<Vec<AuthorizedKey>, Self::Error> {
        self.inner.remote.ensure_online()?;
        Ok(self.inner.remote.inner.keys.read().clone())
    }

    fn unlink_key(&self, _config: &SessionConfig, key_id: &str) -> Result<bool, Self::Error> {
        self.inner.remote.ensure_online()?;
        let mut keys = self.inner.remote.inner.keys.write();
        let before = keys.len();
        keys.retain(|k| k.id != key_id);
        Ok(keys.len() != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new("file:///unused", "test").unwrap()
    }

    #[test]
    fn uncommitted_writes_are_discarded() {
        let store = EphemeralStore::new();
        let cfg = config();
        {
            let mut s = store.open(&cfg, SessionMode::ReadWrite).unwrap();
            s.set("fact:1", b"x").unwrap();
            assert_eq!(s.get("fact:1").unwrap(), Some(b"x".to_vec()));
        }
        let s = store.open(&cfg, SessionMode::ReadOnly).unwrap();
        assert_eq!(s.get("fact:1").unwrap(), None);
        assert_eq!(store.sessions_opened(), 2);
    }

    #[test]
    fn read_only_session_rejects_writes() {
        let store = EphemeralStore::new();
        let mut s = store.open(&config(), SessionMode::ReadOnly).unwrap();
        assert!(matches!(s.set("a", b"1"), Err(EphemeralError::ReadOnly)));
        assert!(matches!(s.delete("a"), Err(EphemeralError::ReadOnly)));
    }

    #[test]
    fn sync_exchanges_changes_between_replicas() {
        let remote = EphemeralRemote::default();
        let a = EphemeralStore::with_remote(remote.clone());
        let b = EphemeralStore::with_remote(remote.clone());
        let cfg = config();

        let mut sa = a.open(&cfg, SessionMode::ReadWrite).unwrap();
        sa.set("block:1", b"one").unwrap();
        sa.commit().unwrap();
        assert_eq!(a.pending_sync("test"), 1);
        sa.sync().unwrap();
        assert_eq!(a.pending_sync("test"), 0);
        assert!(sa.last_sync().unwrap().is_some());

        let mut sb = b.open(&cfg, SessionMode::ReadWrite).unwrap();
        assert_eq!(sb.get("block:1").unwrap(), None);
        sb.sync().unwrap();
        assert_eq!(sb.get("block:1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(remote.sync_count(), 2);

        sb.delete("block:1").unwrap();
        sb.commit().unwrap();
        sb.sync().unwrap();
        assert!(remote.snapshot("test").is_empty());
    }

    #[test]
    fn offline_remote_fails_sync_but_keeps_local_commit() {
        let store = EphemeralStore::new();
        store.remote().set_online(false);
        let mut s = store.open(&config(), SessionMode::ReadWrite).unwrap();
        s.set("fact:1", b"v").unwrap();
        s.commit().unwrap();
        assert!(matches!(s.sync(), Err(EphemeralError::Unreachable)));
        assert_eq!(s.get("fact:1").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.pending_sync("test"), 1);
    }

    #[test]
    fn list_keys_merges_pending_writes() {
        let store = EphemeralStore::new();
        let cfg = config();
        let mut s = store.open(&cfg, SessionMode::ReadWrite).unwrap();
        s.set("fact:1", b"1").unwrap();
        s.set("fact:2", b"2").unwrap();
        s.commit().unwrap();
        s.delete("fact:1").unwrap();
        s.set("fact:3", b"3").unwrap();
        assert_eq!(s.list_keys("fact:").unwrap(), vec!["fact:2", "fact:3"]);
    }

    #[test]
    fn account_keys_can_be_unlinked() {
        let store = EphemeralStore::new();
        let cfg = config();
        store
            .remote()
            .authorize_key(AuthorizedKey::new("laptop", None));
        assert_eq!(store.id(&cfg).unwrap(), "ephemeral-device");
        assert_eq!(store.list_authorized_keys(&cfg).unwrap().len(), 2);
        assert!(store.unlink_key(&cfg, "laptop").unwrap());
        assert!(!store.unlink_key(&cfg, "laptop").unwrap());
    }
}
