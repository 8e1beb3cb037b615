//! Engine state persisted across restarts: task run history, the
//! full-recompute checkpoint and today's quota usage.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::scheduler::{TaskKind, TaskState};
use crate::eid::Eid;
use crate::semantic::Checkpoint;
use crate::sources::QuotaSnapshot;
use crate::storage::StorageManager;

pub const ENGINE_STATE_FILE: &str = "engine-state.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Eid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: TaskState,
    pub summary: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub state: TaskState,
    #[serde(default)]
    pub last_run: Option<RunRecord>,
    #[serde(default)]
    pub runs: u64,
    #[serde(default)]
    pub failures: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(default)]
    pub tasks: BTreeMap<TaskKind, TaskRecord>,
    /// Resume point of the running full-recompute pass
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub last_full_pass: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quota: QuotaSnapshot,
}

/// `engine-state.json`, written through on every update.
pub struct StateStore {
    storage: Arc<dyn StorageManager>,
    state: RwLock<EngineState>,
}

impl StateStore {
    /// An unreadable state file is logged and replaced: everything in it
    /// can be re-derived.
    pub fn load(storage: Arc<dyn StorageManager>) -> Self {
        let state = if storage.exists(ENGINE_STATE_FILE) {
            match storage
                .read(ENGINE_STATE_FILE)
                .map_err(anyhow::Error::from)
                .and_then(|data| serde_json::from_slice(&data).map_err(anyhow::Error::from))
            {
                Ok(state) => state,
                Err(e) => {
                    log::error!("failed to read {ENGINE_STATE_FILE}, starting fresh: {e}");
                    EngineState::default()
                }
            }
        } else {
            EngineState::default()
        };

        Self {
            storage,
            state: RwLock::new(state),
        }
    }

    pub fn get(&self) -> EngineState {
        self.state.read().unwrap().clone()
    }

    /// Apply `f` and write the result. Write failures are logged, not returned.
    pub fn update<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self.state.write().unwrap();
        let result = f(&mut state);

        match serde_json::to_vec_pretty(&*state) {
            Ok(data) => {
                if let Err(e) = self.storage.write(ENGINE_STATE_FILE, &data) {
                    log::error!("failed to write {ENGINE_STATE_FILE}: {e}");
                }
            }
            Err(e) => log::error!("failed to serialize engine state: {e}"),
        }

        result
    }

    pub fn set_running(&self, kind: TaskKind) {
        self.update(|s| s.tasks.entry(kind).or_default().state = TaskState::Running);
    }

    pub fn record_run(&self, kind: TaskKind, run: RunRecord) {
        self.update(|s| {
            let record = s.tasks.entry(kind).or_default();
            record.state = run.outcome;
            record.runs += 1;
            if run.outcome == TaskState::Failed {
                record.failures += 1;
            }
            record.last_run = Some(run);
        });
    }
}
