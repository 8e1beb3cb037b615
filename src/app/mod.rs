mod engine;
mod errors;
mod factory;
pub mod scheduler;
mod selector;
pub mod status;

pub use engine::{Engine, EngineStatus, IngestTarget, ModuleView, TrendingContent};
pub use errors::EngineError;
pub use factory::EngineFactory;
pub use scheduler::{Scheduler, SchedulerHandle, TaskKind, TaskState};
pub use selector::{Recommendation, RecommendationSelector};
