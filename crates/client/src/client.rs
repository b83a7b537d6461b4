use chrono::{DateTime, Utc};
use memsync_core::{
    config::SessionConfig,
    errors::{ClientError, Operation},
    model::{AuthorizedKey, SessionMode},
    traits::{AccountService, RemoteStore, Session},
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::tx::{ReadTx, WriteTx};

/// Brokers every read and write against a remote-synced store.
///
/// No connection is held between calls: each operation opens a session,
/// runs, and drops it. Reads sync first when the local replica is older than
/// the staleness threshold; writes sync afterwards when auto-sync is on.
pub struct StorageClient<S: RemoteStore> {
    config: SessionConfig,
    store: S,
}

impl<S: RemoteStore> StorageClient<S> {
    /// Build a client without touching the remote.
    pub fn new(config: SessionConfig, store: S) -> Self {
        Self { config, store }
    }

    /// Build a client and try one initial sync. A failed sync is logged and
    /// left for the next staleness check to retry.
    pub fn connect(config: SessionConfig, store: S) -> Self {
        let client = Self::new(config, store);
        if let Err(e) = client.sync() {
            warn!(
                error = %e,
                database = %client.config.database(),
                "initial sync failed; continuing with local data"
            );
        }
        client
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn open(&self, mode: SessionMode) -> Result<S::Session, ClientError> {
        self.store
            .open(&self.config, mode)
            .map_err(|e| ClientError::connectivity(Operation::Open, None, e))
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        self.run_read_only(|tx| tx.get(key))
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), ClientError> {
        self.run_read_write(|tx| tx.set(key, value))
    }

    pub fn delete(&self, key: &str) -> Result<(), ClientError> {
        self.run_read_write(|tx| tx.delete(key))
    }

    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), ClientError> {
        self.run_read_write(|tx| tx.set_json(key, value))
    }

    /// Decode the JSON value at `key`. Absent keys yield `ClientError::NotFound`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, ClientError> {
        self.run_read_only(|tx| tx.get_json(key))
    }

    pub fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ClientError> {
        self.run_read_only(|tx| tx.list_keys(prefix))
    }

    /// Run `work` in one read-only session after the staleness check.
    pub fn run_read_only<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&ReadTx<S::Session>) -> Result<T, E>,
        E: From<ClientError>,
    {
        self.sync_if_stale()?;
        let tx = ReadTx::new(self.open(SessionMode::ReadOnly)?);
        work(&tx)
    }

    /// Run `work` in one read-write session. Writes are committed, and synced
    /// when auto-sync is on, only if `work` succeeds. On error the session is
    /// dropped with its writes discarded.
    pub fn run_read_write<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut WriteTx<S::Session>) -> Result<T, E>,
        E: From<ClientError>,
    {
        let mut tx = WriteTx::new(self.open(SessionMode::ReadWrite)?);
        let out = work(&mut tx)?;
        let mut session = tx.into_session();
        session
            .commit()
            .map_err(|e| ClientError::connectivity(Operation::Commit, None, e))?;
        if self.config.auto_sync() {
            debug!(database = %self.config.database(), "auto-sync after write");
            session
                .sync()
                .map_err(|e| ClientError::connectivity(Operation::Sync, None, e))?;
        }
        Ok(out)
    }

    /// Push and pull against the remote unconditionally.
    pub fn sync(&self) -> Result<(), ClientError> {
        let span = tracing::info_span!("storage.client.sync", database = %self.config.database());
        let _guard = span.enter();
        let mut session = self.open(SessionMode::ReadWrite)?;
        session
            .sync()
            .map_err(|e| ClientError::connectivity(Operation::Sync, None, e))?;
        debug!("sync complete");
        Ok(())
    }

    pub fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, ClientError> {
        let session = self.open(SessionMode::ReadOnly)?;
        session
            .last_sync()
            .map_err(|e| ClientError::connectivity(Operation::Open, None, e))
    }

    /// True when the database never synced or its last sync is at least the
    /// staleness threshold old.
    pub fn is_stale(&self) -> Result<bool, ClientError> {
        let last = self.last_synced_at()?;
        Ok(stale_at(last, Utc::now(), self.config.staleness()))
    }

    /// Sync when stale. Returns whether a sync ran.
    pub fn sync_if_stale(&self) -> Result<bool, ClientError> {
        if !self.is_stale()? {
            return Ok(false);
        }
        debug!(database = %self.config.database(), "local data stale; syncing");
        self.sync()?;
        Ok(true)
    }

    /// Wipe all local and remote data for the configured database.
    pub fn reset(&self) -> Result<(), ClientError> {
        warn!(database = %self.config.database(), "resetting database");
        self.store
            .reset(&self.config)
            .map_err(|e| ClientError::connectivity(Operation::Reset, None, e))?;
        info!(database = %self.config.database(), "database reset");
        Ok(())
    }
}

impl<S: RemoteStore + AccountService> StorageClient<S> {
    pub fn id(&self) -> Result<String, ClientError> {
        AccountService::id(&self.store, &self.config)
            .map_err(|e| ClientError::connectivity(Operation::Account, None, e))
    }

    pub fn list_authorized_keys(&self) -> Result<Vec<AuthorizedKey>, ClientError> {
        self.store
            .list_authorized_keys(&self.config)
            .map_err(|e| ClientError::connectivity(Operation::Account, None, e))
    }

    pub fn unlink_key(&self, key_id: &str) -> Result<(), ClientError> {
        let removed = self
            .store
            .unlink_key(&self.config, key_id)
            .map_err(|e| ClientError::connectivity(Operation::Account, Some(key_id), e))?;
        if !removed {
            return Err(ClientError::not_found(Operation::Account, key_id));
        }
        info!(key_id, "authorized key unlinked");
        Ok(())
    }
}

fn stale_at(last: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
    let Some(last) = last else {
        return true;
    };
    // a clock that went backwards reads as zero elapsed
    let elapsed = (now - last).to_std().unwrap_or_default();
    elapsed >= threshold
}
