//! Working-tree store: one directory per database under `<root>/databases`,
//! one file per key, named by the key's SHA-256. Syncs against a `file://` directory remote, or a git
//! remote when built with feature `remote-git`.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use memsync_core::{
    config::{SessionConfig, RESERVED_DEVICES_DATABASE},
    model::{AuthorizedKey, SessionMode},
    traits::{AccountService, RemoteStore, Session},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

mod remote;

use crate::remote::Remote;
#[cfg(feature = "remote-git")]
pub use crate::remote::CredentialMode;

#[derive(Debug, Error)]
pub enum GitStoreError {
    #[error("io: {0}")]
    Io(String),
    #[error("serde: {0}")]
    Serde(String),
    #[error("git: {0}")]
    Git(String),
    #[error("session is read-only")]
    ReadOnly,
    #[error("unsupported remote: {0}")]
    Unsupported(String),
}

pub(crate) type Table = BTreeMap<String, Vec<u8>>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Change {
    Set,
    Delete,
}

/// Keys committed locally since the last sync.
#[derive(Default, Serialize, Deserialize)]
struct Journal {
    dirty: BTreeMap<String, Change>,
}

#[derive(Serialize, Deserialize)]
struct SyncStamp {
    last_sync: DateTime<Utc>,
}

pub struct GitStore {
    root: PathBuf,
    device_id: String,
    registered: Arc<AtomicBool>,
    #[cfg(feature = "remote-git")]
    cred: Option<remote::CredentialConfig>,
}

impl GitStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, GitStoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("databases")).map_err(io_err)?;
        fs::create_dir_all(root.join("meta")).map_err(io_err)?;
        Ok(Self {
            root,
            device_id: Self::default_device_id(),
            registered: Arc::new(AtomicBool::new(false)),
            #[cfg(feature = "remote-git")]
            cred: None,
        })
    }

    fn default_device_id() -> String {
        if let Ok(id) = std::env::var("MEMSYNC_DEVICE_ID") {
            if !id.trim().is_empty() {
                return id.trim().to_string();
            }
        }
        std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "device".to_string())
    }

    pub fn set_device_id(&mut self, id: &str) {
        if !id.trim().is_empty() {
            self.device_id = id.trim().to_string();
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[cfg(feature = "remote-git")]
    pub fn set_credentials(
        &mut self,
        mode: CredentialMode,
        username: Option<String>,
        secret_env: Option<String>,
    ) {
        self.cred = Some(remote::CredentialConfig::new(mode, username, secret_env));
    }

    fn remote(&self, config: &SessionConfig) -> Result<Remote, GitStoreError> {
        #[allow(unused_mut)]
        let mut remote = Remote::parse(config.host(), &self.root)?;
        #[cfg(feature = "remote-git")]
        remote.set_credentials(self.cred.clone());
        Ok(remote)
    }

    fn paths(&self, database: &str) -> Result<DbPaths, GitStoreError> {
        let paths = DbPaths {
            data: self.root.join("databases").join(database),
            meta: self.root.join("meta").join(database),
        };
        fs::create_dir_all(&paths.data).map_err(io_err)?;
        fs::create_dir_all(&paths.meta).map_err(io_err)?;
        Ok(paths)
    }

    /// Pending local changes for `database`, for status output.
    pub fn pending_changes(&self, database: &str) -> Result<usize, GitStoreError> {
        let paths = self.paths(database)?;
        Ok(load_journal(&paths.journal())?.dirty.len())
    }
}

#[derive(Clone)]
struct DbPaths {
    data: PathBuf,
    meta: PathBuf,
}

impl DbPaths {
    fn journal(&self) -> PathBuf {
        self.meta.join("JOURNAL.json")
    }

    fn stamp(&self) -> PathBuf {
        self.meta.join("SYNC.json")
    }

    fn lock(&self) -> PathBuf {
        self.meta.join("LOCK")
    }

    fn value(&self, key: &str) -> PathBuf {
        self.data.join(key_file_name(key))
    }

    /// Run `f` holding the per-database exclusive file lock.
    fn locked<T>(
        &self,
        f: impl FnOnce() -> Result<T, GitStoreError>,
    ) -> Result<T, GitStoreError> {
        with_file_lock(&self.lock(), f)
    }
}

/// Run `f` holding an exclusive `fs4` lock on `path`. Other processes, and
/// other handles in this process, block until `f` returns.
pub(crate) fn with_file_lock<T>(
    path: &Path,
    f: impl FnOnce() -> Result<T, GitStoreError>,
) -> Result<T, GitStoreError> {
    let lockf = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| GitStoreError::Io(format!("open lock {}: {}", path.display(), e)))?;
    fs4::FileExt::lock_exclusive(&lockf).map_err(io_err)?;
    let res = f();
    let _ = fs4::FileExt::unlock(&lockf);
    res
}

pub struct GitSession {
    paths: DbPaths,
    database: String,
    mode: SessionMode,
    remote: Remote,
    device_id: String,
    registered: Arc<AtomicBool>,
    pending: BTreeMap<String, Option<Vec<u8>>>,
}

impl GitSession {
    fn ensure_writable(&self) -> Result<(), GitStoreError> {
        if self.mode.is_read_only() {
            Err(GitStoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn register_device(&self) -> Result<(), GitStoreError> {
        if self.registered.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.remote.locked(RESERVED_DEVICES_DATABASE, || {
            let mut devices = self.remote.fetch(RESERVED_DEVICES_DATABASE)?;
            if !devices.contains_key(&self.device_id) {
                let record = AuthorizedKey::new(&self.device_id, Some("device"));
                let data = serde_json::to_vec(&record).map_err(serde_err)?;
                devices.insert(self.device_id.clone(), data);
                self.remote.publish(RESERVED_DEVICES_DATABASE, &devices)?;
                info!(device = %self.device_id, "registered device with remote");
            }
            Ok(())
        })?;
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Session for GitSession {
    type Error = GitStoreError;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.clone());
        }
        read_value(&self.paths.data, key)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        let mut keys: Vec<String> = read_table(&self.paths.data)?
            .into_keys()
            .filter(|k| k.starts_with(prefix) && !self.pending.contains_key(k))
            .collect();
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
        let path = self.paths.stamp();
        match fs::read(&path) {
            Ok(data) => {
                let stamp: SyncStamp = serde_json::from_slice(&data).map_err(serde_err)?;
                Ok(Some(stamp.last_sync))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
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
        let pending = std::mem::take(&mut self.pending);
        let paths = self.paths.clone();
        paths.locked(|| {
            let mut journal = load_journal(&paths.journal())?;
            for (key, value) in &pending {
                let path = paths.value(key);
                match value {
                    Some(data) => {
                        write_atomic(&paths.data, &path, &encode_entry(key, data)?)?;
                        journal.dirty.insert(key.clone(), Change::Set);
                    }
                    None => {
                        remove_if_exists(&path)?;
                        journal.dirty.insert(key.clone(), Change::Delete);
                    }
                }
            }
            save_journal(&paths, &journal)?;
            debug!(database = %self.database, keys = pending.len(), "local commit");
            Ok(())
        })
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        let span = tracing::info_span!("storage.git.sync", database = %self.database);
        let _guard = span.enter();
        let paths = self.paths.clone();
        paths.locked(|| {
            let journal = load_journal(&paths.journal())?;
            // fetch, overlay and publish as one step against the remote
            let merged = self.remote.locked(&self.database, || {
                let mut merged = self.remote.fetch(&self.database)?;
                for (key, change) in &journal.dirty {
                    match change {
                        Change::Set => match read_value(&paths.data, key)? {
                            Some(data) => {
                                merged.insert(key.clone(), data);
                            }
                            None => {
                                warn!(key = %key, "journaled value missing locally; skipping");
                            }
                        },
                        Change::Delete => {
                            merged.remove(key);
                        }
                    }
                }
                if !journal.dirty.is_empty() {
                    self.remote.publish(&self.database, &merged)?;
                }
                Ok(merged)
            })?;
            write_table(&paths.data, &merged)?;
            save_journal(&paths, &Journal::default())?;
            let stamp = SyncStamp {
                last_sync: Utc::now(),
            };
            let data = serde_json::to_vec_pretty(&stamp).map_err(serde_err)?;
            write_atomic(&paths.meta, &paths.stamp(), &data)?;
            debug!(
                pushed = journal.dirty.len(),
                total = merged.len(),
                "sync complete"
            );
            Ok(())
        })?;
        self.register_device()
    }
}

impl RemoteStore for GitStore {
    type Error = GitStoreError;
    type Session = GitSession;

    fn open(
        &self,
        config: &SessionConfig,
        mode: SessionMode,
    ) -> Result<Self::Session, Self::Error> {
        Ok(GitSession {
            paths: self.paths(config.database())?,
            database: config.database().to_owned(),
            mode,
            remote: self.remote(config)?,
            device_id: self.device_id.clone(),
            registered: Arc::clone(&self.registered),
            pending: BTreeMap::new(),
        })
    }

    fn reset(&self, config: &SessionConfig) -> Result<(), Self::Error> {
        let remote = self.remote(config)?;
        let paths = self.paths(config.database())?;
        paths.locked(|| {
            remote.locked(config.database(), || remote.wipe(config.database()))?;
            fs::remove_dir_all(&paths.data).map_err(io_err)?;
            fs::create_dir_all(&paths.data).map_err(io_err)?;
            remove_if_exists(&paths.journal())?;
            remove_if_exists(&paths.stamp())
        })
    }
}

impl AccountService for GitStore {
    type Error = GitStoreError;

    fn id(&self, _config: &SessionConfig) -> Result<String, Self::Error> {
        Ok(self.device_id.clone())
    }

    fn list_authorized_keys(
        &self,
        config: &SessionConfig,
    ) -> Result<Vec<AuthorizedKey>, Self::Error> {
        let remote = self.remote(config)?;
        let devices = remote.locked(RESERVED_DEVICES_DATABASE, || {
            remote.fetch(RESERVED_DEVICES_DATABASE)
        })?;
        let mut keys = Vec::with_capacity(devices.len());
        for (id, data) in devices {
            match serde_json::from_slice::<AuthorizedKey>(&data) {
                Ok(k) => keys.push(k),
                Err(e) => warn!(device = %id, error = %e, "skipping unreadable device record"),
            }
        }
        keys.sort_by(|a, b| a.added_at.cmp(&b.added_at));
        Ok(keys)
    }

    fn unlink_key(&self, config: &SessionConfig, key_id: &str) -> Result<bool, Self::Error> {
        let remote = self.remote(config)?;
        let removed = remote.locked(RESERVED_DEVICES_DATABASE, || {
            let mut devices = remote.fetch(RESERVED_DEVICES_DATABASE)?;
            if devices.remove(key_id).is_none() {
                return Ok(false);
            }
            remote.publish(RESERVED_DEVICES_DATABASE, &devices)?;
            Ok(true)
        })?;
        if !removed {
            return Ok(false);
        }
        if key_id == self.device_id {
            self.registered.store(false, Ordering::SeqCst);
        }
        Ok(true)
    }
}

pub(crate) fn io_err(e: std::io::Error) -> GitStoreError {
    GitStoreError::Io(e.to_string())
}

fn serde_err(e: serde_json::Error) -> GitStoreError {
    GitStoreError::Serde(e.to_string())
}

/// File name for a key: hex SHA-256, so every name has the same length no
/// matter how long the key is.
pub(crate) fn key_file_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn is_key_file_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Value file layout: key length (u32, big-endian), key bytes, value bytes.
pub(crate) fn encode_entry(key: &str, value: &[u8]) -> Result<Vec<u8>, GitStoreError> {
    let len = u32::try_from(key.len())
        .map_err(|_| GitStoreError::Serde(format!("key too long: {} bytes", key.len())))?;
    let mut out = Vec::with_capacity(4 + key.len() + value.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(value);
    Ok(out)
}

pub(crate) fn decode_entry(data: &[u8]) -> Option<(String, Vec<u8>)> {
    let len: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let end = 4usize.checked_add(u32::from_be_bytes(len) as usize)?;
    let key = String::from_utf8(data.get(4..end)?.to_vec()).ok()?;
    Some((key, data[end..].to_vec()))
}

fn read_value(dir: &Path, key: &str) -> Result<Option<Vec<u8>>, GitStoreError> {
    let path = dir.join(key_file_name(key));
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(e)),
    };
    match decode_entry(&data) {
        Some((stored, value)) if stored == key => Ok(Some(value)),
        Some(_) => Ok(None),
        None => Err(GitStoreError::Serde(format!(
            "corrupt value file {}",
            path.display()
        ))),
    }
}

fn key_file_names(dir: &Path) -> Result<Vec<String>, GitStoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_key_file_name(name) {
                names.push(name.to_owned());
            }
        }
    }
    Ok(names)
}

pub(crate) fn read_table(dir: &Path) -> Result<Table, GitStoreError> {
    let mut table = Table::new();
    for name in key_file_names(dir)? {
        let data = fs::read(dir.join(&name)).map_err(io_err)?;
        match decode_entry(&data) {
            Some((key, value)) if key_file_name(&key) == name => {
                table.insert(key, value);
            }
            _ => warn!(file = %name, "skipping unreadable value file"),
        }
    }
    Ok(table)
}

/// Make `dir` hold exactly `table`.
pub(crate) fn write_table(dir: &Path, table: &Table) -> Result<(), GitStoreError> {
    fs::create_dir_all(dir).map_err(io_err)?;
    let wanted: BTreeMap<String, (&String, &Vec<u8>)> = table
        .iter()
        .map(|(key, data)| (key_file_name(key), (key, data)))
        .collect();
    for name in key_file_names(dir)? {
        if !wanted.contains_key(&name) {
            remove_if_exists(&dir.join(&name))?;
        }
    }
    for (name, (key, data)) in &wanted {
        let entry = encode_entry(key, data)?;
        let path = dir.join(name);
        if fs::read(&path).map(|cur| cur == entry).unwrap_or(false) {
            continue;
        }
        write_atomic(dir, &path, &entry)?;
    }
    Ok(())
}

/// Suffix for temporary names; unique per process and instant.
pub(crate) fn unique_suffix() -> String {
    let ts = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    format!("{}-{}", std::process::id(), ts)
}

fn load_journal(path: &Path) -> Result<Journal, GitStoreError> {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).map_err(serde_err),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Journal::default()),
        Err(e) => Err(io_err(e)),
    }
}

fn save_journal(paths: &DbPaths, journal: &Journal) -> Result<(), GitStoreError> {
    let data = serde_json::to_vec_pretty(journal).map_err(serde_err)?;
    write_atomic(&paths.meta, &paths.journal(), &data)
}

fn remove_if_exists(path: &Path) -> Result<(), GitStoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GitStoreError::Io(format!(
            "remove_file {}: {}",
            path.display(),
            e
        ))),
    }
}

pub(crate) fn write_atomic(dir: &Path, final_path: &Path, data: &[u8]) -> Result<(), GitStoreError> {
    let tmp = dir.join(format!(".tmp-{}", unique_suffix()));
    {
        let mut f = File::create(&tmp).map_err(|e| {
            GitStoreError::Io(format!("create tmp {}: {}", tmp.display(), e))
        })?;
        f.write_all(data)
            .map_err(|e| GitStoreError::Io(format!("write tmp {}: {}", tmp.display(), e)))?;
        f.sync_all()
            .map_err(|e| GitStoreError::Io(format!("sync tmp {}: {}", tmp.display(), e)))?;
    }
    fs::rename(&tmp, final_path).map_err(|e| {
        GitStoreError::Io(format!(
            "rename {} -> {}: {}",
            tmp.display(),
            final_path.display(),
            e
        ))
    })?;
    #[cfg(unix)]
    {
        let dir_file = File::open(dir)
            .map_err(|e| GitStoreError::Io(format!("open dir {}: {}", dir.display(), e)))?;
        dir_file
            .sync_all()
            .map_err(|e| GitStoreError::Io(format!("sync dir {}: {}", dir.display(), e)))?;
    }
    Ok(())
}
