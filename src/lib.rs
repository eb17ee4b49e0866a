//! docforge: drives candidate-document generation across unreliable model
//! backends, scores and ranks the results, and combines the best of them.
//!
//! The library is organized around a run:
//! - [`run`]: configuration snapshot, planning with skip logic, and the executor.
//! - [`generation`]: backends, generator adapters and content validation.
//! - [`scheduler`]: per-kind concurrency limits and in-flight tracking.
//! - [`evaluation`]: judges, single-document scoring, pairwise comparison and Elo.
//! - [`combine`]: synthesis of top-ranked documents.
//! - [`store`]: persistence of runs, tasks, timelines and evaluations.

pub mod cli;
pub mod combine;
pub mod error;
pub mod evaluation;
pub mod generation;
pub mod llm;
pub mod metrics;
pub mod progress;
pub mod retry;
pub mod run;
pub mod scheduler;
pub mod store;

pub use error::{
    BackendError, ConfigError, EvaluationError, GenerationError, LlmError, RunError, StoreError,
};
