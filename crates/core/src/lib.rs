//! Core key schema, session configuration, errors, and store traits.
//! No async and no IO within this crate.

pub mod config;
pub mod errors;
pub mod keys;
pub mod model;
pub mod traits;

pub use crate::config::{SessionConfig, DEFAULT_DATABASE, DEFAULT_STALENESS};
pub use crate::errors::{BoxError, ClientError, ConfigError, ErrorKind, Operation};
pub use crate::keys::EntityKind;
pub use crate::model::{AuthorizedKey, SessionMode};
pub use crate::traits::{AccountService, RemoteStore, Session};
