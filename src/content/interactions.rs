use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::content::types::InteractionEvent;
use crate::content::{StoreError, INTERACTIONS_FILE};
use crate::storage::StorageManager;

/// Read-only view of `interactions.csv`, appended by the presentation layer.
///
/// The file is re-read on every query; it is only consulted by the trending
/// pass, which runs at most a few times a day.
pub struct InteractionLog {
    storage: Arc<dyn StorageManager>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrendingEntry {
    pub content_id: u64,
    pub interactions: usize,
    pub last_interaction: DateTime<Utc>,
}

impl InteractionLog {
    pub fn new(storage: Arc<dyn StorageManager>) -> Self {
        Self { storage }
    }

    /// Events created at or after `since`. Malformed rows are skipped.
    pub fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<InteractionEvent>, StoreError> {
        if !self.storage.exists(INTERACTIONS_FILE) {
            return Ok(vec![]);
        }

        let data = self.storage.read(INTERACTIONS_FILE)?;
        let mut reader = csv::Reader::from_reader(data.as_slice());
        let mut events = vec![];
        let mut skipped = 0;

        for row in reader.deserialize::<InteractionEvent>() {
            match row {
                Ok(event) if event.created_at >= since => events.push(event),
                Ok(_) => {}
                Err(err) => {
                    skipped += 1;
                    log::debug!("skipping malformed interaction row: {err}");
                }
            }
        }

        if skipped > 0 {
            log::warn!("{INTERACTIONS_FILE}: skipped {skipped} malformed rows");
        }

        Ok(events)
    }

    /// Content ranked by interaction count since `since`, ties broken by the
    /// most recent interaction.
    pub fn top_content(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<TrendingEntry>, StoreError> {
        let mut counts: HashMap<u64, TrendingEntry> = HashMap::new();

        for event in self.events_since(since)? {
            let entry = counts.entry(event.content_id).or_insert(TrendingEntry {
                content_id: event.content_id,
                interactions: 0,
                last_interaction: event.created_at,
            });
            entry.interactions += 1;
            entry.last_interaction = entry.last_interaction.max(event.created_at);
        }

        let mut ranked: Vec<TrendingEntry> = counts.into_values().collect();
        ranked.sort_by(|a, b| {
            b.interactions
                .cmp(&a.interactions)
                .then(b.last_interaction.cmp(&a.last_interaction))
                .then(a.content_id.cmp(&b.content_id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }
}
