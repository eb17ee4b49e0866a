//! Run orchestration.
//!
//! - [`config`]: the immutable per-run configuration snapshot.
//! - [`model`]: runs, tasks, generated documents and timeline events.
//! - [`planner`]: expansion into generation work, with hash-based skip logic.
//! - [`recorder`]: serialized updates to a run's aggregate state.
//! - [`executor`]: the run state machine.

pub mod config;
pub mod executor;
pub mod model;
pub mod planner;
pub mod recorder;

pub use config::{
    CombineConfig, ConcurrencyConfig, DocumentSource, EvaluationConfig, GenerationSettings,
    GeneratorSelection, PairwiseSettings, RunConfig, ServiceConfig, EVALUATED_BUCKET,
};
pub use executor::RunExecutor;
pub use model::{
    GeneratedDocument, GenerationTask, Phase, RankedDocument, Run, RunStatus, RunSummary,
    TaskStatus, TimelineEvent,
};
pub use planner::{plan_run, resolve_documents, Plan, PlannedItem, SourceDocument};
pub use recorder::{RecorderSnapshot, RunRecorder};
