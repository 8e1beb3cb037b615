use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::content::types::RelevanceRecord;
use crate::content::{StoreError, COMPACT_MIN_ENTRIES, RELEVANCE_FILE, RELEVANCE_JOURNAL_FILE};
use crate::storage::StorageManager;

const CSV_HEADERS: [&str; 4] = ["module_id", "content_id", "score", "updated_at"];

type ByModule = BTreeMap<u64, HashMap<u64, RelevanceRecord>>;

/// Relevance records unique on `(module_id, content_id)`.
///
/// All scores are kept, not just those above the recommendation threshold,
/// so the threshold can be tuned without rescoring.
///
/// `relevance.csv` is a snapshot; each upsert only appends its rows to
/// `relevance.journal.csv`, and replay keeps the last row per pair.
pub struct RelevanceStore {
    storage: Arc<dyn StorageManager>,
    state: RwLock<RelevanceState>,
    compact_min: usize,
}

#[derive(Default)]
struct RelevanceState {
    /// module_id -> content_id -> record
    records: ByModule,
    journal_rows: usize,
}

impl RelevanceState {
    fn count(&self) -> usize {
        self.records.values().map(|m| m.len()).sum()
    }

    fn insert(&mut self, record: RelevanceRecord) {
        self.records
            .entry(record.module_id)
            .or_default()
            .insert(record.content_id, record);
    }
}

fn record_row(row: &RelevanceRecord) -> [String; 4] {
    [
        row.module_id.to_string(),
        row.content_id.to_string(),
        row.score.to_string(),
        row.updated_at.to_rfc3339(),
    ]
}

impl RelevanceStore {
    pub fn open(storage: Arc<dyn StorageManager>) -> Result<Self, StoreError> {
        let mut state = RelevanceState::default();
        let now = std::time::Instant::now();

        if storage.exists(RELEVANCE_FILE) {
            let data = storage.read(RELEVANCE_FILE)?;
            let mut reader = csv::Reader::from_reader(data.as_slice());
            for record in reader.deserialize::<RelevanceRecord>() {
                state.insert(record?);
            }
        }

        if storage.exists(RELEVANCE_JOURNAL_FILE) {
            let data = storage.read(RELEVANCE_JOURNAL_FILE)?;
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .from_reader(data.as_slice());
            for record in reader.deserialize::<RelevanceRecord>() {
                match record {
                    Ok(record) => {
                        state.insert(record);
                        state.journal_rows += 1;
                    }
                    Err(e) => {
                        log::warn!("{RELEVANCE_JOURNAL_FILE}: dropping torn row: {e}");
                        break;
                    }
                }
            }
        }

        log::debug!(
            "took {}ms to read relevance records ({} journaled)",
            now.elapsed().as_micros() as f64 / 1000.0,
            state.journal_rows
        );

        Ok(Self {
            storage,
            state: RwLock::new(state),
            compact_min: COMPACT_MIN_ENTRIES,
        })
    }

    /// Rewrite the snapshot from memory and drop the journal.
    fn compact(&self, state: &mut RelevanceState) -> Result<(), StoreError> {
        let mut csv_wrt = csv::Writer::from_writer(vec![]);
        csv_wrt.write_record(CSV_HEADERS)?;
        for by_content in state.records.values() {
            let mut rows: Vec<&RelevanceRecord> = by_content.values().collect();
            rows.sort_by_key(|r| r.content_id);
            for row in rows {
                csv_wrt.write_record(record_row(row))?;
            }
        }
        let data = csv_wrt
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        self.storage.write(RELEVANCE_FILE, &data)?;

        if self.storage.exists(RELEVANCE_JOURNAL_FILE) {
            self.storage.delete(RELEVANCE_JOURNAL_FILE)?;
        }
        log::debug!("compacted relevance journal ({} rows)", state.journal_rows);
        state.journal_rows = 0;
        Ok(())
    }

    /// Insert or overwrite records by `(module_id, content_id)`.
    pub fn upsert_many(&self, batch: Vec<RelevanceRecord>) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut csv_wrt = csv::WriterBuilder::new().has_headers(false).from_writer(vec![]);
        for row in &batch {
            csv_wrt.write_record(record_row(row))?;
        }
        let data = csv_wrt
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;

        let mut state = self.state.write().unwrap();
        self.storage.append(RELEVANCE_JOURNAL_FILE, &data)?;

        let count = batch.len();
        state.journal_rows += count;
        for record in batch {
            state.insert(record);
        }

        if state.journal_rows > self.compact_min.max(state.count()) {
            self.compact(&mut state)?;
        }
        Ok(count)
    }

    pub fn get(&self, module_id: u64, content_id: u64) -> Option<RelevanceRecord> {
        self.state
            .read()
            .unwrap()
            .records
            .get(&module_id)
            .and_then(|m| m.get(&content_id))
            .cloned()
    }

    /// Records for one module with `score >= threshold`, highest score first.
    pub fn for_module(&self, module_id: u64, threshold: f32) -> Vec<RelevanceRecord> {
        let state = self.state.read().unwrap();
        let mut rows: Vec<RelevanceRecord> = state
            .records
            .get(&module_id)
            .map(|m| m.values().filter(|r| r.score >= threshold).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.content_id.cmp(&b.content_id))
        });
        rows
    }

    pub fn count(&self) -> usize {
        self.state.read().unwrap().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;
    use chrono::{DateTime, Utc};

    fn open(dir: &std::path::Path) -> RelevanceStore {
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(dir).unwrap());
        RelevanceStore::open(storage).unwrap()
    }

    fn record(module_id: u64, content_id: u64, score: f32) -> RelevanceRecord {
        RelevanceRecord {
            module_id,
            content_id,
            score,
            updated_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn test_upsert_is_unique_per_pair() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());

        store.upsert_many(vec![record(1, 1, 0.2), record(1, 2, 0.9)]).unwrap();
        store.upsert_many(vec![record(1, 1, 0.7)]).unwrap();

        assert_eq!(store.count(), 2);
        assert_eq!(store.get(1, 1).unwrap().score, 0.7);
    }

    #[test]
    fn test_for_module_filters_and_sorts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        store
            .upsert_many(vec![
                record(1, 1, 0.4),
                record(1, 2, 0.9),
                record(1, 3, -0.2),
                record(2, 1, 0.95),
            ])
            .unwrap();

        let ids: Vec<u64> = store.for_module(1, 0.0).iter().map(|r| r.content_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(store.for_module(1, 0.95).is_empty());
        assert!(store.for_module(42, 0.0).is_empty());
    }

    #[test]
    fn test_reopen_reads_csv() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open(tmp.path());
            store.upsert_many(vec![record(3, 4, 0.5), record(5, 6, 0.25)]).unwrap();
        }

        let store = open(tmp.path());
        assert_eq!(store.count(), 2);
        assert_eq!(store.get(5, 6).unwrap().score, 0.25);
    }

    #[test]
    fn test_upsert_appends_only_the_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        store.upsert_many(vec![record(1, 1, 0.2), record(1, 2, 0.9)]).unwrap();
        store.upsert_many(vec![record(1, 1, 0.7)]).unwrap();

        let journal = std::fs::read_to_string(tmp.path().join(RELEVANCE_JOURNAL_FILE)).unwrap();
        assert_eq!(journal.lines().count(), 3);
        assert!(!tmp.path().join(RELEVANCE_FILE).exists());

        let reopened = open(tmp.path());
        assert_eq!(reopened.count(), 2);
        assert_eq!(reopened.get(1, 1).unwrap().score, 0.7);
    }

    #[test]
    fn test_journal_is_compacted_into_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = open(tmp.path());
        store.compact_min = 2;

        store.upsert_many(vec![record(1, 1, 0.1), record(1, 2, 0.2)]).unwrap();
        assert!(tmp.path().join(RELEVANCE_JOURNAL_FILE).exists());

        // five journal rows against two live records
        store.upsert_many(vec![record(1, 1, 0.3), record(1, 2, 0.4), record(1, 1, 0.5)]).unwrap();
        assert!(!tmp.path().join(RELEVANCE_JOURNAL_FILE).exists());

        let reopened = open(tmp.path());
        assert_eq!(reopened.count(), 2);
        assert_eq!(reopened.get(1, 1).unwrap().score, 0.5);
        assert_eq!(reopened.get(1, 2).unwrap().score, 0.4);
    }

    #[test]
    fn test_torn_journal_row_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = open(tmp.path());
            store.upsert_many(vec![record(1, 1, 0.5)]).unwrap();
        }
        let storage = BackendLocal::new(tmp.path()).unwrap();
        storage.append(RELEVANCE_JOURNAL_FILE, b"1,2,0.").unwrap();

        let store = open(tmp.path());
        assert_eq!(store.count(), 1);
        assert_eq!(store.get(1, 1).unwrap().score, 0.5);
    }
}
