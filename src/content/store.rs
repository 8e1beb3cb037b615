use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::content::types::{ContentItem, EmbeddingState, EmbeddingStatus, NewContent, UpsertOutcome};
use crate::content::{
    NewEmbedding, StoreError, COMPACT_MIN_ENTRIES, CONTENTS_FILE, CONTENTS_JOURNAL_FILE,
    CONTENT_VECTORS_FILE,
};
use crate::semantic::{VectorIndex, VectorStorage};
use crate::storage::StorageManager;

/// Deduplicated content items addressed by natural key.
///
/// Metadata is kept in `contents.json`, vectors in `content_vectors.bin`.
/// Mutations append the touched items to `contents.journal.jsonl` and the
/// touched vectors to the vector log, so a write costs what it changed.
/// Every mutation is keyed, so overlapping writers cannot create duplicates.
pub struct ContentStore {
    storage: Arc<dyn StorageManager>,
    vector_storage: VectorStorage,
    model_id: [u8; 32],
    state: RwLock<ContentState>,
    compact_min: usize,
}

#[derive(Default)]
struct ContentState {
    items: BTreeMap<u64, ContentItem>,
    by_key: HashMap<String, u64>,
    vectors: VectorIndex,
    next_id: u64,
    journal_entries: usize,
}

impl ContentState {
    fn status(&self, item: &ContentItem) -> EmbeddingStatus {
        let has_vector = self
            .vectors
            .get(item.id)
            .is_some_and(|v| v.text_hash == item.embedding.text_hash);
        item.embedding.status(has_vector)
    }

    fn needs_embedding(&self, item: &ContentItem) -> bool {
        self.status(item) != EmbeddingStatus::Current
    }
}

impl ContentStore {
    pub fn open(storage: Arc<dyn StorageManager>, model_id: [u8; 32]) -> Result<Self, StoreError> {
        let snapshot: Vec<ContentItem> = if storage.exists(CONTENTS_FILE) {
            serde_json::from_slice(&storage.read(CONTENTS_FILE)?)?
        } else {
            vec![]
        };
        let mut by_id: BTreeMap<u64, ContentItem> = snapshot.into_iter().map(|i| (i.id, i)).collect();

        let mut journal_entries = 0;
        if storage.exists(CONTENTS_JOURNAL_FILE) {
            let data = storage.read(CONTENTS_JOURNAL_FILE)?;
            for line in data.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                match serde_json::from_slice::<ContentItem>(line) {
                    Ok(item) => {
                        by_id.insert(item.id, item);
                        journal_entries += 1;
                    }
                    Err(e) => log::warn!("{CONTENTS_JOURNAL_FILE}: dropping unreadable entry: {e}"),
                }
            }
        }
        let mut items: Vec<ContentItem> = by_id.into_values().collect();

        let vector_storage = VectorStorage::new(storage.path_of(CONTENT_VECTORS_FILE));
        let mut vectors = vector_storage.load_or_empty(&model_id)?;

        let mut state = ContentState::default();
        for item in items.iter_mut() {
            item.embedding.text_hash = item.compute_text_hash();
            if vectors
                .get(item.id)
                .is_some_and(|v| v.text_hash != item.embedding.text_hash)
            {
                vectors.remove(item.id);
            }
        }
        for item in items {
            state.next_id = state.next_id.max(item.id + 1);
            state.by_key.insert(item.natural_key.clone(), item.id);
            state.items.insert(item.id, item);
        }
        state.vectors = vectors;
        state.journal_entries = journal_entries;

        log::debug!(
            "opened content store: {} items ({} journaled), {} embedded",
            state.items.len(),
            journal_entries,
            state.vectors.len()
        );

        Ok(Self {
            storage,
            vector_storage,
            model_id,
            state: RwLock::new(state),
            compact_min: COMPACT_MIN_ENTRIES,
        })
    }

    /// Journal the items in `ids`, folding the journal into the snapshot
    /// once it outgrows it.
    fn save_items(&self, state: &mut ContentState, ids: &[u64]) -> Result<(), StoreError> {
        let mut data = Vec::new();
        for item in ids.iter().filter_map(|id| state.items.get(id)) {
            serde_json::to_writer(&mut data, item)?;
            data.push(b'\n');
        }
        if data.is_empty() {
            return Ok(());
        }
        self.storage.append(CONTENTS_JOURNAL_FILE, &data)?;
        state.journal_entries += ids.len();

        if state.journal_entries > self.compact_min.max(state.items.len()) {
            let items: Vec<&ContentItem> = state.items.values().collect();
            self.storage.write(CONTENTS_FILE, &serde_json::to_vec(&items)?)?;
            self.storage.delete(CONTENTS_JOURNAL_FILE)?;
            log::debug!("compacted content journal ({} entries)", state.journal_entries);
            state.journal_entries = 0;
        }
        Ok(())
    }

    fn save_vectors(&self, state: &ContentState, ids: &[u64]) -> Result<(), StoreError> {
        self.vector_storage.append(&state.vectors, ids, &self.model_id)?;
        Ok(())
    }

    pub fn upsert(&self, new: NewContent, now: DateTime<Utc>) -> Result<UpsertOutcome, StoreError> {
        let mut outcomes = self.upsert_many(vec![new], now)?;
        outcomes
            .pop()
            .ok_or_else(|| StoreError::NotFound("upsert outcome".to_string()))
    }

    /// Insert new items and merge-update existing ones by natural key.
    ///
    /// An existing vector survives unless the embedded text actually changed.
    pub fn upsert_many(
        &self,
        batch: Vec<NewContent>,
        now: DateTime<Utc>,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        let mut outcomes = Vec::with_capacity(batch.len());

        for new in batch {
            match state.by_key.get(&new.natural_key).copied() {
                Some(id) => {
                    let Some(item) = state.items.get_mut(&id) else {
                        continue;
                    };
                    merge_into(item, new, now);

                    let hash = item.compute_text_hash();
                    let text_changed = hash != item.embedding.text_hash;
                    item.embedding.text_hash = hash;

                    // the vector log is not rewritten; a stale entry fails
                    // the hash check on the next open
                    if text_changed {
                        state.vectors.remove(id);
                    }
                    outcomes.push(UpsertOutcome {
                        id,
                        created: false,
                        text_changed,
                    });
                }
                None => {
                    let id = state.next_id;
                    state.next_id += 1;

                    let mut item = ContentItem {
                        id,
                        natural_key: new.natural_key,
                        title: new.title.trim().to_string(),
                        description: new.description.trim().to_string(),
                        body_excerpt: new.body_excerpt.trim().to_string(),
                        url: new.url,
                        source_name: new.source_name,
                        source_type: new.source_type,
                        categories: new.categories,
                        authors: new.authors,
                        published_at: new.published_at,
                        created_at: now,
                        updated_at: now,
                        embedding: EmbeddingState::default(),
                    };
                    item.embedding.text_hash = item.compute_text_hash();

                    state.by_key.insert(item.natural_key.clone(), id);
                    state.items.insert(id, item);
                    outcomes.push(UpsertOutcome {
                        id,
                        created: true,
                        text_changed: true,
                    });
                }
            }
        }

        let ids: Vec<u64> = outcomes.iter().map(|o| o.id).collect();
        self.save_items(state, &ids)?;

        Ok(outcomes)
    }

    pub fn get(&self, id: u64) -> Option<ContentItem> {
        self.state.read().unwrap().items.get(&id).cloned()
    }

    /// Items for `ids` in the given order, unknown ids skipped.
    pub fn get_many(&self, ids: &[u64]) -> Vec<ContentItem> {
        let state = self.state.read().unwrap();
        ids.iter().filter_map(|id| state.items.get(id).cloned()).collect()
    }

    pub fn find_by_natural_key(&self, natural_key: &str) -> Option<ContentItem> {
        let state = self.state.read().unwrap();
        state
            .by_key
            .get(natural_key)
            .and_then(|id| state.items.get(id))
            .cloned()
    }

    #[cfg(test)]
    pub fn count_by_natural_key(&self, natural_key: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .items
            .values()
            .filter(|item| item.natural_key == natural_key)
            .count()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().items.len()
    }

    pub fn embedded_count(&self) -> usize {
        self.state.read().unwrap().vectors.len()
    }

    pub fn embedding_status(&self, id: u64) -> Option<EmbeddingStatus> {
        let state = self.state.read().unwrap();
        state.items.get(&id).map(|item| state.status(item))
    }

    pub fn embedding(&self, id: u64) -> Option<Vec<f32>> {
        let state = self.state.read().unwrap();
        let item = state.items.get(&id)?;
        state
            .vectors
            .get(id)
            .filter(|v| v.text_hash == item.embedding.text_hash)
            .map(|v| v.embedding.to_vec())
    }

    /// Items that were never embedded, oldest first.
    pub fn find_missing_embeddings(&self, limit: usize) -> Vec<ContentItem> {
        let state = self.state.read().unwrap();
        let mut missing: Vec<&ContentItem> = state
            .items
            .values()
            .filter(|item| state.status(item) == EmbeddingStatus::Missing)
            .collect();
        missing.sort_by_key(|item| (item.created_at, item.id));
        missing.into_iter().take(limit).cloned().collect()
    }

    /// Items whose vector is stale, plus unembedded items touched within
    /// `window`; most recently updated first.
    pub fn find_stale_or_recent(
        &self,
        window: chrono::Duration,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<ContentItem> {
        let cutoff = now - window;
        let state = self.state.read().unwrap();
        let mut found: Vec<&ContentItem> = state
            .items
            .values()
            .filter(|item| match state.status(item) {
                EmbeddingStatus::Stale => true,
                EmbeddingStatus::Missing => item.updated_at >= cutoff,
                EmbeddingStatus::Current => false,
            })
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        found.into_iter().take(limit).cloned().collect()
    }

    /// Attach vectors. An embedding is dropped when its item's text changed
    /// after the text was read, or when the vector cannot be stored.
    pub fn set_embeddings(&self, batch: Vec<NewEmbedding>, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        let mut applied = Vec::new();

        for emb in batch {
            let current = state.items.get(&emb.id).map(|item| item.embedding.text_hash);
            if current != Some(emb.text_hash) {
                log::debug!("content {} changed while embedding, skipping", emb.id);
                continue;
            }

            if let Err(err) = state.vectors.insert(emb.id, emb.text_hash, &emb.vector) {
                log::warn!("content {}: cannot store embedding: {err}", emb.id);
                continue;
            }

            if let Some(item) = state.items.get_mut(&emb.id) {
                item.embedding.embedded_hash = Some(emb.text_hash);
                item.embedding.embedded_at = Some(now);
                applied.push(emb.id);
            }
        }

        if !applied.is_empty() {
            self.save_vectors(state, &applied)?;
            self.save_items(state, &applied)?;
        }

        Ok(applied.len())
    }

    /// Run `f` against the embedding arena without copying it.
    pub fn with_vectors<R>(&self, f: impl FnOnce(&VectorIndex) -> R) -> R {
        f(&self.state.read().unwrap().vectors)
    }

    /// Ids of embedded items that have not been scored since they were embedded.
    pub fn find_unscored(&self, limit: usize) -> Vec<u64> {
        let state = self.state.read().unwrap();
        let mut ids: Vec<(DateTime<Utc>, u64)> = state
            .items
            .values()
            .filter(|item| item.embedding.needs_scoring() && !state.needs_embedding(item))
            .filter_map(|item| item.embedding.embedded_at.map(|at| (at, item.id)))
            .collect();
        ids.sort();
        ids.into_iter().take(limit).map(|(_, id)| id).collect()
    }

    pub fn mark_scored(&self, ids: &[u64], now: DateTime<Utc>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        for id in ids {
            if let Some(item) = state.items.get_mut(id) {
                item.embedding.scored_at = Some(now);
            }
        }
        self.save_items(state, ids)
    }

    /// Embedded items strictly after `checkpoint` in `(embedded_at, id)` order.
    pub fn embedded_after(
        &self,
        checkpoint: Option<(DateTime<Utc>, u64)>,
        limit: usize,
    ) -> Vec<(DateTime<Utc>, u64)> {
        let state = self.state.read().unwrap();
        let mut frontier: Vec<(DateTime<Utc>, u64)> = state
            .items
            .values()
            .filter(|item| !state.needs_embedding(item))
            .filter_map(|item| item.embedding.embedded_at.map(|at| (at, item.id)))
            .filter(|key| checkpoint.map_or(true, |cp| *key > cp))
            .collect();
        frontier.sort();
        frontier.truncate(limit);
        frontier
    }

    /// Ids of every item that currently has a valid vector.
    pub fn embedded_ids(&self) -> Vec<u64> {
        let state = self.state.read().unwrap();
        state
            .items
            .values()
            .filter(|item| !state.needs_embedding(item))
            .map(|item| item.id)
            .collect()
    }
}

fn merge_into(item: &mut ContentItem, new: NewContent, now: DateTime<Utc>) {
    if !new.title.trim().is_empty() {
        item.title = new.title.trim().to_string();
    }
    if !new.description.trim().is_empty() {
        item.description = new.description.trim().to_string();
    }
    if !new.body_excerpt.trim().is_empty() {
        item.body_excerpt = new.body_excerpt.trim().to_string();
    }
    if !new.url.is_empty() {
        item.url = new.url;
    }
    if new.published_at.is_some() {
        item.published_at = new.published_at;
    }
    if !new.authors.is_empty() {
        item.authors = new.authors;
    }
    item.categories.extend(new.categories);
    item.source_name = new.source_name;
    item.updated_at = now;
}
