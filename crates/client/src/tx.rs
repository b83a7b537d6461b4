//! Handles given to units of work inside a session.

use std::ops::Deref;

use memsync_core::{
    errors::{ClientError, Operation},
    traits::Session,
};
use serde::{de::DeserializeOwned, Serialize};

/// Read access to an open session.
pub struct ReadTx<X: Session> {
    session: X,
}

impl<X: Session> ReadTx<X> {
    pub(crate) fn new(session: X) -> Self {
        Self { session }
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        self.session
            .get(key)
            .map_err(|e| ClientError::connectivity(Operation::Get, Some(key), e))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, ClientError> {
        let bytes = self
            .get(key)?
            .ok_or_else(|| ClientError::not_found(Operation::Get, key))?;
        serde_json::from_slice(&bytes).map_err(|source| ClientError::Encoding {
            op: Operation::Get,
            key: key.to_owned(),
            source,
        })
    }

    pub fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ClientError> {
        self.session
            .list_keys(prefix)
            .map_err(|e| ClientError::connectivity(Operation::ListKeys, Some(prefix), e))
    }
}

/// Read-write access. Writes become visible to other sessions on commit.
pub struct WriteTx<X: Session> {
    inner: ReadTx<X>,
}

impl<X: Session> WriteTx<X> {
    pub(crate) fn new(session: X) -> Self {
        Self {
            inner: ReadTx::new(session),
        }
    }

    pub(crate) fn into_session(self) -> X {
        self.inner.session
    }

    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<(), ClientError> {
        self.inner
            .session
            .set(key, value)
            .map_err(|e| ClientError::connectivity(Operation::Set, Some(key), e))
    }

    pub fn set_json<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<(), ClientError> {
        let bytes = serde_json::to_vec(value).map_err(|source| ClientError::Encoding {
            op: Operation::Set,
            key: key.to_owned(),
            source,
        })?;
        self.set(key, &bytes)
    }

    pub fn delete(&mut self, key: &str) -> Result<(), ClientError> {
        self.inner
            .session
            .delete(key)
            .map_err(|e| ClientError::connectivity(Operation::Delete, Some(key), e))
    }
}

impl<X: Session> Deref for WriteTx<X> {
    type Target = ReadTx<X>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
