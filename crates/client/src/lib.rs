//! Storage client for a remote-synced key-value store.
//!
//! Each operation runs in its own short-lived session so that no idle
//! connection blocks other processes sharing the same remote database.

pub mod accessor;
pub mod client;
pub mod tx;

pub use crate::accessor::DefaultClient;
pub use crate::client::StorageClient;
pub use crate::tx::{ReadTx, WriteTx};
pub use memsync_core::{keys, ClientError, ErrorKind, Operation, SessionConfig};
