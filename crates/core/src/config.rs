use std::{sync::OnceLock, time::Duration};

use regex::Regex;
use url::Url;

use crate::errors::ConfigError;

pub const DEFAULT_DATABASE: &str = "memory";
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(60);

/// Remote database reserved for account/device records.
pub const RESERVED_DEVICES_DATABASE: &str = "__devices";

const ALLOWED_SCHEMES: &[&str] = &["file", "http", "https", "ssh", "git"];

/// Settings for one client. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    host: String,
    database: String,
    auto_sync: bool,
    staleness: Duration,
}

impl SessionConfig {
    pub fn new(host: &str, database: &str) -> Result<Self, ConfigError> {
        let host = validate_host(host)?;
        let database = validate_database(database)?;
        Ok(Self {
            host,
            database,
            auto_sync: true,
            staleness: DEFAULT_STALENESS,
        })
    }

    #[must_use]
    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = enabled;
        self
    }

    #[must_use]
    pub fn with_staleness(mut self, threshold: Duration) -> Self {
        self.staleness = threshold;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn auto_sync(&self) -> bool {
        self.auto_sync
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }
}

// scp-style git remotes: user@host:path
fn scp_remote() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+@[A-Za-z0-9_.\-]+:[^\s]+$").ok())
        .as_ref()
}

fn database_name() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-]+$").ok())
        .as_ref()
}

pub fn validate_host(raw: &str) -> Result<String, ConfigError> {
    let host = raw.trim();
    if host.is_empty() {
        return Err(ConfigError::EmptyHost);
    }
    if scp_remote().is_some_and(|re| re.is_match(host)) {
        return Ok(host.to_owned());
    }
    let url = Url::parse(host).map_err(|e| ConfigError::MalformedHost {
        host: host.to_owned(),
        reason: e.to_string(),
    })?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(ConfigError::MalformedHost {
            host: host.to_owned(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(host.to_owned())
}

pub fn validate_database(raw: &str) -> Result<String, ConfigError> {
    let name = raw.trim();
    let valid = database_name().is_some_and(|re| re.is_match(name));
    if !valid || name == RESERVED_DEVICES_DATABASE {
        return Err(ConfigError::InvalidDatabase(raw.to_owned()));
    }
    Ok(name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_defaults() {
        let cfg = SessionConfig::new("file:///tmp/remote", DEFAULT_DATABASE).unwrap();
        assert_eq!(cfg.host(), "file:///tmp/remote");
        assert_eq!(cfg.database(), "memory");
        assert!(cfg.auto_sync());
        assert_eq!(cfg.staleness(), DEFAULT_STALENESS);

        let cfg = cfg
            .with_auto_sync(false)
            .with_staleness(Duration::from_secs(5));
        assert!(!cfg.auto_sync());
        assert_eq!(cfg.staleness(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_bad_hosts() {
        assert_eq!(SessionConfig::new("  ", "db"), Err(ConfigError::EmptyHost));
        assert!(matches!(
            SessionConfig::new("not a url", "db"),
            Err(ConfigError::MalformedHost { .. })
        ));
        assert!(matches!(
            SessionConfig::new("ftp://example.com/x", "db"),
            Err(ConfigError::MalformedHost { .. })
        ));
        assert!(SessionConfig::new("git@github.com:me/memories.git", "db").is_ok());
        assert!(SessionConfig::new("https://github.com/me/memories.git", "db").is_ok());
    }

    #[test]
    fn rejects_bad_database_names() {
        assert!(matches!(
            SessionConfig::new("file:///tmp/r", "a/b"),
            Err(ConfigError::InvalidDatabase(_))
        ));
        assert!(matches!(
            SessionConfig::new("file:///tmp/r", ""),
            Err(ConfigError::InvalidDatabase(_))
        ));
        assert!(matches!(
            SessionConfig::new("file:///tmp/r", RESERVED_DEVICES_DATABASE),
            Err(ConfigError::InvalidDatabase(_))
        ));
    }

    #[test]
    fn patterns_compile_once_and_are_reused() {
        let first = scp_remote().map(|re| re as *const Regex);
        assert!(first.is_some());
        assert_eq!(scp_remote().map(|re| re as *const Regex), first);
        assert!(database_name().is_some());
        for _ in 0..3 {
            assert!(SessionConfig::new("git@host:repo.git", "db_1-x").is_ok());
        }
    }
}
