//! Persistence boundary for runs and everything they produce.
//!
//! The executor is the only writer of a run's aggregate fields. Stores are
//! expected to make every write immediately visible to subsequent reads;
//! no read-after-write verification is layered on top.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::evaluation::{PairwiseOutcome, SingleDocScore};
use crate::run::model::{GeneratedDocument, GenerationTask, Run, RunStatus, TimelineEvent};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Atomically moves the run from `from` to `to`.
    ///
    /// Fails with [`StoreError::StatusConflict`] when the stored status is
    /// not `from`.
    async fn transition_run(&self, id: &str, from: RunStatus, to: RunStatus) -> Result<(), StoreError>;

    /// Persists aggregate fields (cost, errors, summary). Status is only
    /// changed through [`transition_run`](Self::transition_run).
    async fn save_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn load_run(&self, id: &str) -> Result<Run, StoreError>;

    /// Inserts or replaces a task by id.
    async fn save_task(&self, task: &GenerationTask) -> Result<(), StoreError>;

    async fn list_tasks(&self, run_id: &str) -> Result<Vec<GenerationTask>, StoreError>;

    /// Appends a timeline event. An existing `(run_id, sequence)` is an error.
    async fn append_event(&self, event: &TimelineEvent) -> Result<(), StoreError>;

    /// Events ordered by sequence.
    async fn list_events(&self, run_id: &str) -> Result<Vec<TimelineEvent>, StoreError>;

    async fn save_document(&self, document: &GeneratedDocument) -> Result<(), StoreError>;

    async fn load_document(&self, id: &str) -> Result<Option<GeneratedDocument>, StoreError>;

    /// Most recent artifact produced for a task key, from any run.
    async fn find_document_by_key(&self, task_key: &str) -> Result<Option<GeneratedDocument>, StoreError>;

    /// Inserts or replaces the score for `(document_id, judge)`.
    async fn save_single_score(&self, score: &SingleDocScore) -> Result<(), StoreError>;

    async fn find_single_score(&self, document_id: &str, judge: &str) -> Result<Option<SingleDocScore>, StoreError>;

    async fn count_single_scores(&self, document_id: &str) -> Result<usize, StoreError>;

    /// Inserts or replaces the outcome for `(document_a, document_b, judge)`.
    async fn save_pairwise(&self, outcome: &PairwiseOutcome) -> Result<(), StoreError>;

    async fn find_pairwise(
        &self,
        document_a: &str,
        document_b: &str,
        judge: &str,
    ) -> Result<Option<PairwiseOutcome>, StoreError>;

    /// Number of outcomes involving `document_id` on either side.
    async fn count_pairwise(&self, document_id: &str) -> Result<usize, StoreError>;
}
