use chrono::{DateTime, Utc};

use crate::{
    config::SessionConfig,
    model::{AuthorizedKey, SessionMode},
};

/// A transactional session against one database of a remote-synced store.
///
/// Writes are buffered and only applied by `commit`. Dropping a session
/// without committing discards them and releases whatever the session holds.
pub trait Session {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Self::Error>;

    /// Time of the last successful sync of this database, if any.
    fn last_sync(&self) -> Result<Option<DateTime<Utc>>, Self::Error>;

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error>;
    fn delete(&mut self, key: &str) -> Result<(), Self::Error>;
    fn commit(&mut self) -> Result<(), Self::Error>;

    /// Push local changes and pull remote ones.
    fn sync(&mut self) -> Result<(), Self::Error>;
}

/// Opens sessions. Implementations hold no live connection between calls.
/// No async in core; callers should use spawn_blocking when invoking from async contexts.
pub trait RemoteStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Session: Session<Error = Self::Error>;

    fn open(&self, config: &SessionConfig, mode: SessionMode)
        -> Result<Self::Session, Self::Error>;

    /// Wipe local and remote data for the configured database.
    fn reset(&self, config: &SessionConfig) -> Result<(), Self::Error>;
}

/// Account sub-service of the remote backend. Independent of sessions.
pub trait AccountService {
    type Error: std::error::Error + Send + Sync + 'static;

    fn id(&self, config: &SessionConfig) -> Result<String, Self::Error>;
    fn list_authorized_keys(&self, config: &SessionConfig)
        -> Result<Vec<AuthorizedKey>, Self::Error>;

    /// Returns false when no key with that id exists.
    fn unlink_key(&self, config: &SessionConfig, key_id: &str) -> Result<bool, Self::Error>;
}
