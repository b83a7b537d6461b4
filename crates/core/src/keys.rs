//! Key namespace shared by every caller of the store.
//!
//! Keys are `<prefix><identifier>`. The prefixes are part of the on-disk and
//! remote format and must not change.

pub const BLOCK_PREFIX: &str = "block:";
pub const FACT_PREFIX: &str = "fact:";
pub const FACT_BY_KEY_PREFIX: &str = "fact:bykey:";
pub const PROFILE_PREFIX: &str = "profile:";
pub const EMBEDDING_PREFIX: &str = "embedding:";

/// The profile kind has exactly one instance.
pub const PROFILE_KEY: &str = "profile:user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Block,
    Fact,
    FactByKey,
    Profile,
    Embedding,
}

impl EntityKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            EntityKind::Block => BLOCK_PREFIX,
            EntityKind::Fact => FACT_PREFIX,
            EntityKind::FactByKey => FACT_BY_KEY_PREFIX,
            EntityKind::Profile => PROFILE_PREFIX,
            EntityKind::Embedding => EMBEDDING_PREFIX,
        }
    }

    /// Classify a key by its prefix. `fact:bykey:` is checked before `fact:`.
    pub fn of(key: &str) -> Option<EntityKind> {
        [
            EntityKind::FactByKey,
            EntityKind::Fact,
            EntityKind::Block,
            EntityKind::Profile,
            EntityKind::Embedding,
        ]
        .into_iter()
        .find(|kind| key.starts_with(kind.prefix()))
    }
}

pub fn block_key(id: &str) -> String {
    format!("{BLOCK_PREFIX}{id}")
}

pub fn fact_key(id: &str) -> String {
    format!("{FACT_PREFIX}{id}")
}

/// Secondary index key for looking a fact up by its user-defined key.
pub fn fact_by_key(user_key: &str) -> String {
    format!("{FACT_BY_KEY_PREFIX}{user_key}")
}

pub fn profile_key() -> String {
    PROFILE_KEY.to_owned()
}

pub fn embedding_key(chunk_id: &str) -> String {
    format!("{EMBEDDING_PREFIX}{chunk_id}")
}

pub fn new_block_id() -> String {
    format!("blk_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_fact_id() -> String {
    format!("fact_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_bit_exact() {
        assert_eq!(block_key("7"), "block:7");
        assert_eq!(fact_key("42"), "fact:42");
        assert_eq!(fact_by_key("home-city"), "fact:bykey:home-city");
        assert_eq!(profile_key(), "profile:user");
        assert_eq!(embedding_key("c-1"), "embedding:c-1");
    }

    #[test]
    fn classify_prefers_secondary_index() {
        assert_eq!(EntityKind::of("fact:bykey:x"), Some(EntityKind::FactByKey));
        assert_eq!(EntityKind::of("fact:x"), Some(EntityKind::Fact));
        assert_eq!(EntityKind::of(PROFILE_KEY), Some(EntityKind::Profile));
        assert_eq!(EntityKind::of("embedding:c"), Some(EntityKind::Embedding));
        assert_eq!(EntityKind::of("other:1"), None);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = new_fact_id();
        let b = new_fact_id();
        assert_ne!(a, b);
        assert!(a.starts_with("fact_"));
        assert!(new_block_id().starts_with("blk_"));
    }
}
