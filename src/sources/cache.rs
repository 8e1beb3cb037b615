use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::sources::RawItem;

struct Entry {
    source: String,
    items: Vec<RawItem>,
    stored_at: DateTime<Utc>,
}

/// A cached response handed out as a degraded substitute.
#[derive(Clone, Debug)]
pub struct CacheLookup {
    pub key: String,
    pub items: Vec<RawItem>,
    pub stored_at: DateTime<Utc>,
}

/// In-memory response cache keyed by the normalized request.
///
/// Expired entries are kept until evicted by capacity so they can still
/// serve as a stale fallback.
pub struct ResponseCache {
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, Entry>>,
}

impl ResponseCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_fresh(&self, key: &str) -> Option<Vec<RawItem>> {
        let entries = self.entries.read().unwrap();
        let entry = entries.get(key)?;
        if self.clock.now() - entry.stored_at < self.ttl {
            Some(entry.items.clone())
        } else {
            None
        }
    }

    pub fn put(&self, source: &str, key: &str, items: Vec<RawItem>) {
        let mut entries = self.entries.write().unwrap();

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                source: source.to_string(),
                items,
                stored_at: self.clock.now(),
            },
        );
    }

    /// Most recent entry whose key starts with `prefix`, else the most recent
    /// entry of `source`. Expired entries qualify; empty ones don't.
    pub fn stale_fallback(&self, prefix: &str, source: &str) -> Option<CacheLookup> {
        let entries = self.entries.read().unwrap();

        let newest = |matches: &dyn Fn(&str, &Entry) -> bool| {
            entries
                .iter()
                .filter(|(k, e)| !e.items.is_empty() && matches(k.as_str(), *e))
                .max_by_key(|(_, e)| e.stored_at)
                .map(|(k, e)| CacheLookup {
                    key: k.clone(),
                    items: e.items.clone(),
                    stored_at: e.stored_at,
                })
        };

        let prefix = format!("{prefix}|");
        newest(&|k, _| k.starts_with(&prefix)).or_else(|| newest(&|_, e| e.source == source))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}
