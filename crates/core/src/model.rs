use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device or key registered with the remote account.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthorizedKey {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl AuthorizedKey {
    pub fn new(id: &str, label: Option<&str>) -> Self {
        Self {
            id: id.to_owned(),
            label: label.map(str::to_owned),
            added_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    ReadOnly,
    ReadWrite,
}

impl SessionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, SessionMode::ReadOnly)
    }
}
