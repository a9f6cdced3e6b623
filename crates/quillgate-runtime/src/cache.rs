//! Critic verdict cache.
//!
//! Identical artifact text judged against an identical rubric is not sent
//! to the critic twice. Regenerations that come back unchanged are common
//! enough to matter for cost.

use moka::future::Cache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use quillgate_core::run::text_digest;

use crate::services::{CriticVerdict, Rubric};

/// Cache key: artifact text digest plus rubric fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VerdictKey {
    text_digest: String,
    rubric_hash: u64,
}

impl VerdictKey {
    pub fn new(text: &str, rubric: &Rubric) -> Self {
        Self {
            text_digest: text_digest(text),
            rubric_hash: hash_rubric(rubric),
        }
    }
}

/// Verdict cache using moka.
pub struct VerdictCache {
    cache: Cache<VerdictKey, CriticVerdict>,
}

impl VerdictCache {
    /// Create a new cache with the given bounds.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    pub async fn get(&self, key: &VerdictKey) -> Option<CriticVerdict> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: VerdictKey, verdict: CriticVerdict) {
        self.cache.insert(key, verdict).await;
    }

    /// Clear the cache.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for VerdictCache {
    fn default() -> Self {
        Self::new(1_000, Duration::from_secs(3600))
    }
}

fn hash_rubric(rubric: &Rubric) -> u64 {
    let mut hasher = DefaultHasher::new();
    for item in &rubric.items {
        item.criterion_id.hash(&mut hasher);
        item.dimension.hash(&mut hasher);
        item.section.hash(&mut hasher);
        item.description.hash(&mut hasher);
    }
    hasher.finish()
}
