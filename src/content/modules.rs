use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::types::{EmbeddingState, EmbeddingStatus, Module, ModuleDefinition};
use crate::content::{NewEmbedding, StoreError, MODULES_FILE, MODULE_MARKS_FILE, MODULE_VECTORS_FILE};
use crate::semantic::{VectorIndex, VectorStorage};
use crate::storage::StorageManager;

/// Curricular modules, keyed by id and by curriculum code.
///
/// `modules.json` belongs to the admin surface and may be edited while the
/// engine runs. The engine only writes it from definition sync; embedding
/// and scoring bookkeeping lives in `module_marks.json`. The file is re-read
/// whenever its mtime moves, including at the start of every mutation, and
/// any module whose text no longer matches its vector loses that vector.
pub struct ModuleStore {
    storage: Arc<dyn StorageManager>,
    vector_storage: VectorStorage,
    model_id: [u8; 32],
    state: RwLock<ModuleState>,
}

/// The admin-owned part of a module, as stored in `modules.json`.
#[derive(Serialize, Deserialize)]
struct ModuleRecord {
    id: u64,
    code: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Module> for ModuleRecord {
    fn from(module: &Module) -> Self {
        ModuleRecord {
            id: module.id,
            code: module.code.clone(),
            name: module.name.clone(),
            description: module.description.clone(),
            keywords: module.keywords.clone(),
            created_at: module.created_at,
            updated_at: module.updated_at,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct EmbeddingMarks {
    embedded_hash: Option<u64>,
    embedded_at: Option<DateTime<Utc>>,
    scored_at: Option<DateTime<Utc>>,
}

impl EmbeddingMarks {
    fn of(state: &EmbeddingState) -> Self {
        EmbeddingMarks {
            embedded_hash: state.embedded_hash,
            embedded_at: state.embedded_at,
            scored_at: state.scored_at,
        }
    }
}

#[derive(Default)]
struct ModuleState {
    modules: BTreeMap<u64, Module>,
    by_code: HashMap<String, u64>,
    vectors: VectorIndex,
    marks: BTreeMap<u64, EmbeddingMarks>,
    next_id: u64,
    mtime: Option<SystemTime>,
}

impl ModuleState {
    fn status(&self, module: &Module) -> EmbeddingStatus {
        let has_vector = self
            .vectors
            .get(module.id)
            .is_some_and(|v| v.text_hash == module.embedding.text_hash);
        module.embedding.status(has_vector)
    }

    /// Replace the module set, dropping vectors that no longer match and
    /// bookkeeping for modules that are gone. Returns whether vectors or
    /// marks need saving.
    fn replace_modules(&mut self, records: Vec<ModuleRecord>) -> (bool, bool) {
        self.modules.clear();
        self.by_code.clear();
        self.next_id = 0;

        let mut vectors_dirty = false;
        for record in records {
            let marks = self.marks.get(&record.id).cloned().unwrap_or_default();
            let mut module = Module {
                id: record.id,
                code: record.code,
                name: record.name,
                description: record.description,
                keywords: record.keywords,
                created_at: record.created_at,
                updated_at: record.updated_at,
                embedding: EmbeddingState {
                    text_hash: 0,
                    embedded_hash: marks.embedded_hash,
                    embedded_at: marks.embedded_at,
                    scored_at: marks.scored_at,
                },
            };
            module.embedding.text_hash = module.compute_text_hash();
            let mismatched = self
                .vectors
                .get(module.id)
                .is_some_and(|v| v.text_hash != module.embedding.text_hash);
            if mismatched {
                log::info!("module {} ({}) text changed, embedding is stale", module.id, module.code);
                self.vectors.remove(module.id);
                vectors_dirty = true;
            }
            self.next_id = self.next_id.max(module.id + 1);
            self.by_code.insert(module.code.clone(), module.id);
            self.modules.insert(module.id, module);
        }

        let orphans: Vec<u64> = self
            .vectors
            .iter()
            .map(|v| v.id)
            .filter(|id| !self.modules.contains_key(id))
            .collect();
        for id in orphans {
            self.vectors.remove(id);
            vectors_dirty = true;
        }

        let before = self.marks.len();
        let modules = &self.modules;
        self.marks.retain(|id, _| modules.contains_key(id));

        (vectors_dirty, self.marks.len() != before)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Modules whose embedding was invalidated by the sync
    pub invalidated: usize,
}

impl ModuleStore {
    pub fn open(storage: Arc<dyn StorageManager>, model_id: [u8; 32]) -> Result<Self, StoreError> {
        let vector_storage = VectorStorage::new(storage.path_of(MODULE_VECTORS_FILE));
        let vectors = vector_storage.load_or_empty(&model_id)?;
        let marks = if storage.exists(MODULE_MARKS_FILE) {
            serde_json::from_slice(&storage.read(MODULE_MARKS_FILE)?)?
        } else {
            BTreeMap::new()
        };

        let store = Self {
            storage,
            vector_storage,
            model_id,
            state: RwLock::new(ModuleState {
                vectors,
                marks,
                ..Default::default()
            }),
        };

        let mut state = store.state.write().unwrap();
        store.reload(&mut state)?;
        drop(state);

        Ok(store)
    }

    fn file_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(self.storage.path_of(MODULES_FILE))
            .and_then(|m| m.modified())
            .ok()
    }

    fn reload(&self, state: &mut ModuleState) -> Result<(), StoreError> {
        let records: Vec<ModuleRecord> = if self.storage.exists(MODULES_FILE) {
            serde_json::from_slice(&self.storage.read(MODULES_FILE)?)?
        } else {
            vec![]
        };

        let (vectors_dirty, marks_dirty) = state.replace_modules(records);
        if vectors_dirty {
            self.vector_storage.save(&state.vectors, &self.model_id)?;
        }
        if marks_dirty {
            self.save_marks(state)?;
        }
        state.mtime = self.file_mtime();
        Ok(())
    }

    /// Reload under an already held write lock if the file moved.
    fn catch_up(&self, state: &mut ModuleState) -> Result<bool, StoreError> {
        if self.file_mtime() == state.mtime {
            return Ok(false);
        }
        log::debug!("{MODULES_FILE} changed on disk, reloading");
        self.reload(state)?;
        Ok(true)
    }

    /// Re-read `modules.json` if it changed on disk since the last read.
    pub fn refresh_if_changed(&self) -> Result<bool, StoreError> {
        if self.file_mtime() == self.state.read().unwrap().mtime {
            return Ok(false);
        }
        let mut state = self.state.write().unwrap();
        self.catch_up(&mut state)
    }

    fn save(&self, state: &mut ModuleState) -> Result<(), StoreError> {
        let records: Vec<ModuleRecord> = state.modules.values().map(ModuleRecord::from).collect();
        self.storage.write(MODULES_FILE, &serde_json::to_vec_pretty(&records)?)?;
        state.mtime = self.file_mtime();
        Ok(())
    }

    fn save_marks(&self, state: &ModuleState) -> Result<(), StoreError> {
        self.storage
            .write(MODULE_MARKS_FILE, &serde_json::to_vec(&state.marks)?)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<Module> {
        self.state.read().unwrap().modules.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.state.read().unwrap().modules.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().modules.len()
    }

    pub fn get(&self, id: u64) -> Option<Module> {
        self.state.read().unwrap().modules.get(&id).cloned()
    }

    pub fn get_by_code(&self, code: &str) -> Option<Module> {
        let state = self.state.read().unwrap();
        state.by_code.get(code).and_then(|id| state.modules.get(id)).cloned()
    }

    /// Upsert definitions by code. Changing description or keywords
    /// invalidates the module's embedding; renaming does not.
    pub fn sync_definitions(
        &self,
        definitions: Vec<ModuleDefinition>,
        now: DateTime<Utc>,
    ) -> Result<SyncReport, StoreError> {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        self.catch_up(state)?;
        let mut report = SyncReport::default();
        let mut vectors_dirty = false;

        for def in definitions {
            let code = def.code.trim().to_string();
            if code.is_empty() {
                log::warn!("skipping module definition without code: {:?}", def.name);
                continue;
            }

            match state.by_code.get(&code).copied() {
                Some(id) => {
                    let Some(module) = state.modules.get_mut(&id) else {
                        continue;
                    };
                    let keywords = clean_keywords(&def.keywords);
                    if module.name == def.name
                        && module.description == def.description.trim()
                        && module.keywords == keywords
                    {
                        report.unchanged += 1;
                        continue;
                    }

                    module.name = def.name;
                    module.description = def.description.trim().to_string();
                    module.keywords = keywords;
                    module.updated_at = now;

                    let hash = module.compute_text_hash();
                    if hash != module.embedding.text_hash {
                        module.embedding.text_hash = hash;
                        if state.vectors.remove(id) {
                            vectors_dirty = true;
                            report.invalidated += 1;
                        }
                    }
                    report.updated += 1;
                }
                None => {
                    let id = state.next_id;
                    state.next_id += 1;

                    let mut module = Module {
                        id,
                        code: code.clone(),
                        name: def.name,
                        description: def.description.trim().to_string(),
                        keywords: clean_keywords(&def.keywords),
                        created_at: now,
                        updated_at: now,
                        embedding: EmbeddingState::default(),
                    };
                    module.embedding.text_hash = module.compute_text_hash();

                    state.by_code.insert(code, id);
                    state.modules.insert(id, module);
                    report.created += 1;
                }
            }
        }

        self.save(state)?;
        if vectors_dirty {
            self.vector_storage.save(&state.vectors, &self.model_id)?;
        }

        Ok(report)
    }

    pub fn embedding_status(&self, id: u64) -> Option<EmbeddingStatus> {
        let state = self.state.read().unwrap();
        state.modules.get(&id).map(|m| state.status(m))
    }

    pub fn embedding(&self, id: u64) -> Option<Vec<f32>> {
        let state = self.state.read().unwrap();
        let module = state.modules.get(&id)?;
        state
            .vectors
            .get(id)
            .filter(|v| v.text_hash == module.embedding.text_hash)
            .map(|v| v.embedding.to_vec())
    }

    /// Modules without a current embedding.
    pub fn needing_embedding(&self) -> Vec<Module> {
        let state = self.state.read().unwrap();
        state
            .modules
            .values()
            .filter(|m| state.status(m) != EmbeddingStatus::Current)
            .cloned()
            .collect()
    }

    pub fn set_embeddings(&self, batch: Vec<NewEmbedding>, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        self.catch_up(state)?;
        let mut applied = 0;

        for emb in batch {
            let Some(module) = state.modules.get_mut(&emb.id) else {
                continue;
            };
            if module.embedding.text_hash != emb.text_hash {
                log::debug!("module {} changed while embedding, skipping", emb.id);
                continue;
            }
            if let Err(err) = state.vectors.insert(emb.id, emb.text_hash, &emb.vector) {
                log::warn!("module {}: cannot store embedding: {err}", emb.id);
                continue;
            }
            module.embedding.embedded_hash = Some(emb.text_hash);
            module.embedding.embedded_at = Some(now);
            state.marks.insert(emb.id, EmbeddingMarks::of(&module.embedding));
            applied += 1;
        }

        if applied > 0 {
            self.vector_storage.save(&state.vectors, &self.model_id)?;
            self.save_marks(state)?;
        }

        Ok(applied)
    }

    pub fn with_vectors<R>(&self, f: impl FnOnce(&VectorIndex) -> R) -> R {
        f(&self.state.read().unwrap().vectors)
    }

    /// Modules with a current embedding that have not been scored since.
    pub fn find_unscored(&self) -> Vec<u64> {
        let state = self.state.read().unwrap();
        state
            .modules
            .values()
            .filter(|m| m.embedding.needs_scoring() && state.status(m) == EmbeddingStatus::Current)
            .map(|m| m.id)
            .collect()
    }

    pub fn mark_scored(&self, ids: &[u64], now: DateTime<Utc>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;
        self.catch_up(state)?;
        for id in ids {
            if let Some(module) = state.modules.get_mut(id) {
                module.embedding.scored_at = Some(now);
                state.marks.insert(*id, EmbeddingMarks::of(&module.embedding));
            }
        }
        self.save_marks(state)
    }
}

fn clean_keywords(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn open(dir: &std::path::Path) -> ModuleStore {
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(dir).unwrap());
        ModuleStore::open(storage, [3u8; 32]).unwrap()
    }

    fn def(code: &str, description: &str) -> ModuleDefinition {
        ModuleDefinition {
            code: code.to_string(),
            name: format!("{code} module"),
            description: description.to_string(),
            keywords: vec!["graphs".to_string(), "trees".to_string()],
        }
    }

    fn embed_current(store: &ModuleStore, id: u64, now: DateTime<Utc>) {
        let text_hash = store.get(id).unwrap().embedding.text_hash;
        store
            .set_embeddings(
                vec![NewEmbedding {
                    id,
                    text_hash,
                    vector: vec![1.0, 0.0],
                }],
                now,
            )
            .unwrap();
    }

    #[test]
    fn test_sync_is_keyed_by_code() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let now = ts("2024-05-01T10:00:00Z");

        let report = store
            .sync_definitions(vec![def("CS101", "Algorithms"), def("CS102", "Databases")], now)
            .unwrap();
        assert_eq!(report.created, 2);

        let report = store
            .sync_definitions(vec![def("CS101", "Algorithms"), def("CS102", "Relational databases")], now)
            .unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get_by_code("CS102").unwrap().description, "Relational databases");
    }

    #[test]
    fn test_description_edit_invalidates_embedding() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let now = ts("2024-05-01T10:00:00Z");

        store.sync_definitions(vec![def("CS101", "Algorithms")], now).unwrap();
        let id = store.get_by_code("CS101").unwrap().id;
        embed_current(&store, id, now);
        assert_eq!(store.embedding_status(id), Some(EmbeddingStatus::Current));

        let report = store
            .sync_definitions(vec![def("CS101", "Advanced algorithms")], now)
            .unwrap();
        assert_eq!(report.invalidated, 1);

        assert_eq!(store.embedding_status(id), Some(EmbeddingStatus::Stale));
        assert!(store.embedding(id).is_none());
        assert!(store.find_unscored().is_empty());
        assert_eq!(store.needing_embedding().len(), 1);
    }

    #[test]
    fn test_rename_keeps_embedding() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let now = ts("2024-05-01T10:00:00Z");

        store.sync_definitions(vec![def("CS101", "Algorithms")], now).unwrap();
        let id = store.get_by_code("CS101").unwrap().id;
        embed_current(&store, id, now);

        let mut renamed = def("CS101", "Algorithms");
        renamed.name = "Algorithms I".to_string();
        let report = store.sync_definitions(vec![renamed], now).unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.invalidated, 0);
        assert_eq!(store.embedding_status(id), Some(EmbeddingStatus::Current));
    }

    /// Rewrite the description the way another process would, with an
    /// mtime far enough ahead that coarse filesystem clocks still see it.
    fn edit_on_disk(dir: &std::path::Path, from: &str, to: &str) {
        let path = dir.join(MODULES_FILE);
        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, raw.replace(&format!("\"{from}\""), &format!("\"{to}\""))).unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();
    }

    #[test]
    fn test_external_edit_is_picked_up() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let now = ts("2024-05-01T10:00:00Z");

        store.sync_definitions(vec![def("CS101", "Algorithms")], now).unwrap();
        let id = store.get_by_code("CS101").unwrap().id;
        embed_current(&store, id, now);
        assert!(!store.refresh_if_changed().unwrap());

        edit_on_disk(tmp.path(), "Algorithms", "Graph theory");

        assert!(store.refresh_if_changed().unwrap());
        assert_eq!(store.get(id).unwrap().description, "Graph theory");
        assert_eq!(store.embedding_status(id), Some(EmbeddingStatus::Stale));
    }

    #[test]
    fn test_scoring_does_not_clobber_admin_edit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let now = ts("2024-05-01T10:00:00Z");

        store.sync_definitions(vec![def("CS101", "Algorithms")], now).unwrap();
        let id = store.get_by_code("CS101").unwrap().id;
        embed_current(&store, id, now);

        // edited between two ticks, before the scorer marks the module
        edit_on_disk(tmp.path(), "Algorithms", "Graph theory");
        store.mark_scored(&[id], now).unwrap();

        let on_disk = std::fs::read_to_string(tmp.path().join(MODULES_FILE)).unwrap();
        assert!(on_disk.contains("Graph theory"));
        assert!(!on_disk.contains("scored_at"));
        assert_eq!(store.get(id).unwrap().description, "Graph theory");
        assert_eq!(store.embedding_status(id), Some(EmbeddingStatus::Stale));
        assert_eq!(store.needing_embedding().len(), 1);
    }

    #[test]
    fn test_embedding_does_not_touch_modules_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path());
        let now = ts("2024-05-01T10:00:00Z");

        store.sync_definitions(vec![def("CS101", "Algorithms")], now).unwrap();
        let before = std::fs::read(tmp.path().join(MODULES_FILE)).unwrap();
        embed_current(&store, 0, now);
        store.mark_scored(&[0], now).unwrap();

        assert_eq!(std::fs::read(tmp.path().join(MODULES_FILE)).unwrap(), before);
        assert!(tmp.path().join(MODULE_MARKS_FILE).exists());
    }

    #[test]
    fn test_reopen_keeps_vectors() {
        let tmp = tempfile::tempdir().unwrap();
        let now = ts("2024-05-01T10:00:00Z");
        {
            let store = open(tmp.path());
            store.sync_definitions(vec![def("CS101", "Algorithms")], now).unwrap();
            embed_current(&store, 0, now);
        }

        let store = open(tmp.path());
        assert_eq!(store.embedding(0), Some(vec![1.0, 0.0]));
        assert_eq!(store.find_unscored(), vec![0]);
    }
}
