//! Background driver loop for the engine's periodic tasks.
//!
//! Tasks run sequentially on one thread. A task with no previous run is due
//! at once, so a fresh start populates everything. A failing or panicking
//! task is recorded and retried on its next interval; it never stops the
//! loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::status::{RunRecord, StateStore};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::eid::Eid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    BroadIngestion,
    ModuleIngestion,
    EmbeddingRefresh,
    RelevanceIncremental,
    RelevanceMaintenance,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::BroadIngestion,
        TaskKind::ModuleIngestion,
        TaskKind::EmbeddingRefresh,
        TaskKind::RelevanceIncremental,
        TaskKind::RelevanceMaintenance,
    ];
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::BroadIngestion => "broad_ingestion",
            TaskKind::ModuleIngestion => "module_ingestion",
            TaskKind::EmbeddingRefresh => "embedding_refresh",
            TaskKind::RelevanceIncremental => "relevance_incremental",
            TaskKind::RelevanceMaintenance => "relevance_maintenance",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// What the scheduler drives. Implemented by the engine.
pub trait TaskRunner: Send + Sync {
    /// Run one task to completion, returning a one-line summary.
    fn run_task(&self, kind: TaskKind) -> anyhow::Result<String>;

    /// Called once per tick before any task runs.
    fn on_tick(&self, _now: DateTime<Utc>) {}
}

#[derive(Clone, Debug)]
pub struct ScheduledTask {
    pub kind: TaskKind,
    pub interval: chrono::Duration,
    pub last_run: Option<DateTime<Utc>>,
    pub state: TaskState,
}

impl ScheduledTask {
    pub fn new(kind: TaskKind, interval: chrono::Duration) -> Self {
        Self {
            kind,
            interval,
            last_run: None,
            state: TaskState::Idle,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            Some(last) => now - last >= self.interval,
            None => true,
        }
    }
}

pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
    runner: Arc<dyn TaskRunner>,
    state: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    tick: Duration,
}

fn minutes(m: u64) -> chrono::Duration {
    chrono::Duration::minutes(m as i64)
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        state: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        let tasks = vec![
            ScheduledTask::new(TaskKind::BroadIngestion, minutes(config.broad_ingestion_mins)),
            ScheduledTask::new(TaskKind::ModuleIngestion, minutes(config.module_ingestion_mins)),
            ScheduledTask::new(TaskKind::EmbeddingRefresh, minutes(config.embedding_refresh_mins)),
            ScheduledTask::new(TaskKind::RelevanceIncremental, minutes(config.relevance_mins)),
            ScheduledTask::new(TaskKind::RelevanceMaintenance, minutes(config.maintenance_mins)),
        ];

        Self {
            tasks,
            runner,
            state,
            clock,
            tick: Duration::from_secs(config.tick_secs.max(1)),
        }
    }

    /// Run every due task once, in order. Returns the kinds that ran.
    pub fn tick(&mut self) -> Vec<(TaskKind, TaskState)> {
        let now = self.clock.now();
        self.runner.on_tick(now);

        let mut ran = vec![];
        for i in 0..self.tasks.len() {
            if self.tasks[i].is_due(self.clock.now()) {
                let outcome = self.run_task(i);
                ran.push((self.tasks[i].kind, outcome));
            }
        }
        ran
    }

    fn run_task(&mut self, index: usize) -> TaskState {
        let kind = self.tasks[index].kind;
        let id = Eid::new();
        let started_at = self.clock.now();
        let timer = Instant::now();

        self.tasks[index].state = TaskState::Running;
        self.state.set_running(kind);
        log::info!("task={kind} run={id} started");

        let runner = self.runner.clone();
        let result = catch_unwind(AssertUnwindSafe(|| runner.run_task(kind)));

        let (outcome, summary) = match result {
            Ok(Ok(summary)) => {
                log::info!(
                    "task={kind} run={id} outcome=succeeded elapsed={:?} {summary}",
                    timer.elapsed()
                );
                (TaskState::Succeeded, summary)
            }
            Ok(Err(err)) => {
                log::error!(
                    "task={kind} run={id} outcome=failed elapsed={:?} error={err:#}",
                    timer.elapsed()
                );
                (TaskState::Failed, format!("{err:#}"))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("task={kind} run={id} outcome=panicked error={message}");
                (TaskState::Failed, format!("panicked: {message}"))
            }
        };

        // a failed task waits for its next interval like a successful one
        let task = &mut self.tasks[index];
        task.last_run = Some(started_at);
        task.state = outcome;

        self.state.record_run(
            kind,
            RunRecord {
                id,
                started_at,
                finished_at: self.clock.now(),
                outcome,
                summary,
            },
        );

        outcome
    }

    /// Loop until the shutdown channel fires or is dropped.
    pub fn run(mut self, shutdown: mpsc::Receiver<()>) {
        log::info!("scheduler started with {} tasks, tick {:?}", self.tasks.len(), self.tick);
        loop {
            self.tick();
            match shutdown.recv_timeout(self.tick) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        log::info!("scheduler stopped");
    }

    pub fn spawn(self) -> std::io::Result<SchedulerHandle> {
        let (tx, rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || self.run(rx))?;
        Ok(SchedulerHandle { tx, join })
    }
}

pub struct SchedulerHandle {
    tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop and wait for the task in flight to finish.
    pub fn shutdown(self) {
        let _ = self.tx.send(());
        if let Err(err) = self.join.join() {
            log::error!("scheduler thread panicked: {err:?}");
        }
    }
}
