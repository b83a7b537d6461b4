//! Lazily-built default client for call sites that do not carry one.
//!
//! Prefer passing a `StorageClient` explicitly. A `DefaultClient` belongs to
//! the outermost entry point (a binary's `main`, a test fixture) and is
//! handed down from there; it is never a process-global.

use std::sync::Arc;

use memsync_core::{errors::ClientError, traits::RemoteStore};
use parking_lot::Mutex;
use tracing::debug;

use crate::client::StorageClient;

type Factory<S> = Box<dyn Fn() -> Result<StorageClient<S>, ClientError> + Send + Sync>;

pub struct DefaultClient<S: RemoteStore> {
    factory: Factory<S>,
    slot: Mutex<Option<Arc<StorageClient<S>>>>,
}

impl<S: RemoteStore> DefaultClient<S> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<StorageClient<S>, ClientError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            slot: Mutex::new(None),
        }
    }

    /// Return the shared client, building it on first use. Callers racing on
    /// first use wait on the guard, so the factory runs once. A failed build
    /// leaves the slot empty for the next caller to retry.
    pub fn get(&self) -> Result<Arc<StorageClient<S>>, ClientError> {
        let mut slot = self.slot.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        debug!("constructing default storage client");
        let client = Arc::new((self.factory)()?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Drop the held client. Returns whether one was held. Handles already
    /// given out stay valid; the next `get` builds a new instance.
    pub fn reset(&self) -> bool {
        let dropped = self.slot.lock().take().is_some();
        if dropped {
            debug!("default storage client reset");
        }
        dropped
    }

    pub fn is_initialized(&self) -> bool {
        self.slot.lock().is_some()
    }
}
