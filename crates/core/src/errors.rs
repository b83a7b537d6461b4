use std::fmt;

use thiserror::Error;

/// Boxed backend error carried as the source of a connectivity failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("malformed host {host:?}: {reason}")]
    MalformedHost { host: String, reason: String },
    #[error("invalid database name: {0:?}")]
    InvalidDatabase(String),
}

/// The client operation that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Get,
    Set,
    Delete,
    ListKeys,
    Commit,
    Sync,
    Reset,
    Account,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Open => "open",
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Delete => "delete",
            Operation::ListKeys => "list_keys",
            Operation::Commit => "commit",
            Operation::Sync => "sync",
            Operation::Reset => "reset",
            Operation::Account => "account",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    NotFound,
    Encoding,
    Configuration,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{op} failed{}: {source}", key_suffix(.key))]
    Connectivity {
        op: Operation,
        key: Option<String>,
        #[source]
        source: BoxError,
    },
    #[error("{op}: not found: {key}")]
    NotFound { op: Operation, key: String },
    #[error("{op} could not encode/decode {key}: {source}")]
    Encoding {
        op: Operation,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(k) => format!(" for {k}"),
        None => String::new(),
    }
}

impl ClientError {
    pub fn connectivity<E>(op: Operation, key: Option<&str>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ClientError::Connectivity {
            op,
            key: key.map(str::to_owned),
            source: Box::new(source),
        }
    }

    pub fn not_found(op: Operation, key: &str) -> Self {
        ClientError::NotFound {
            op,
            key: key.to_owned(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connectivity { .. } => ErrorKind::Connectivity,
            ClientError::NotFound { .. } => ErrorKind::NotFound,
            ClientError::Encoding { .. } => ErrorKind::Encoding,
            ClientError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Operation that failed, when the error is tied to one.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            ClientError::Connectivity { op, .. }
            | ClientError::NotFound { op, .. }
            | ClientError::Encoding { op, .. } => Some(*op),
            ClientError::Configuration(_) => None,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            ClientError::Connectivity { key, .. } => key.as_deref(),
            ClientError::NotFound { key, .. } | ClientError::Encoding { key, .. } => Some(key),
            ClientError::Configuration(_) => None,
        }
    }
}
