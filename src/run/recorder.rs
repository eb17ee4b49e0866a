//! Serialized writer for a run's aggregate state and timeline.
//!
//! Tasks finish concurrently; every change to the run's cost, error list,
//! counters and timeline sequence goes through one [`RunRecorder`] so no
//! update is lost and sequence numbers match append order.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::progress::{ProgressEvent, ProgressSink, RunStats};
use crate::store::RunStore;

use super::model::{GenerationTask, Phase, TaskStatus, TimelineEvent};

#[derive(Debug, Default)]
struct RecorderState {
    sequence: u64,
    total_cost_usd: f64,
    errors: Vec<String>,
    cost_unknown_tasks: usize,
    /// Set when a timeline write failed; the audit trail is then incomplete.
    audit_gaps: usize,
    stats: RunStats,
}

/// Aggregate values at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecorderSnapshot {
    pub total_cost_usd: f64,
    pub errors: Vec<String>,
    pub cost_unknown_tasks: usize,
    pub audit_gaps: usize,
    pub events: u64,
    pub stats: RunStats,
}

pub struct RunRecorder {
    run_id: String,
    store: Arc<dyn RunStore>,
    sink: Arc<dyn ProgressSink>,
    state: Mutex<RecorderState>,
}

impl RunRecorder {
    pub fn new(run_id: impl Into<String>, store: Arc<dyn RunStore>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            run_id: run_id.into(),
            store,
            sink,
            state: Mutex::new(RecorderState::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn sink(&self) -> &dyn ProgressSink {
        self.sink.as_ref()
    }

    /// Appends one timeline event.
    ///
    /// A failed write is logged and counted as an audit gap, which keeps the
    /// run from reporting `completed`.
    pub async fn event(
        &self,
        phase: Phase,
        description: impl Into<String>,
        success: bool,
        task_id: Option<&str>,
        detail: Value,
    ) {
        let mut state = self.state.lock().await;
        state.sequence += 1;
        let event = TimelineEvent {
            run_id: self.run_id.clone(),
            sequence: state.sequence,
            phase,
            description: description.into(),
            success,
            timestamp: Utc::now(),
            task_id: task_id.map(str::to_string),
            detail,
        };
        if let Err(e) = self.store.append_event(&event).await {
            error!(
                run_id = %self.run_id,
                sequence = event.sequence,
                error = %e,
                "Failed to append timeline event"
            );
            state.audit_gaps += 1;
            state
                .errors
                .push(format!("timeline event {} not recorded: {}", event.sequence, e));
        }
    }

    /// Emits a phase event to both the timeline and the progress sink.
    pub async fn phase(&self, phase: Phase, description: impl Into<String>, success: bool, detail: Value) {
        let description = description.into();
        self.event(phase, description.clone(), success, None, detail).await;
        self.sink
            .publish(ProgressEvent::phase(&self.run_id, phase, description));
    }

    pub async fn add_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(run_id = %self.run_id, error = %message, "Run error recorded");
        self.state.lock().await.errors.push(message);
    }

    /// Adds known cost. Call with `unknown = true` when some of the task's
    /// cost could not be determined.
    pub async fn add_cost(&self, known_usd: f64, unknown: bool) {
        let mut state = self.state.lock().await;
        state.total_cost_usd += known_usd;
        state.stats.total_cost_usd = state.total_cost_usd;
        if unknown {
            state.cost_unknown_tasks += 1;
        }
    }

    pub async fn task_planned(&self, count: usize) {
        self.state.lock().await.stats.tasks_total += count;
    }

    /// Updates counters for a terminal task and publishes it.
    pub async fn task_finished(&self, task: &GenerationTask) {
        let stats = {
            let mut state = self.state.lock().await;
            match task.status {
                TaskStatus::Succeeded => state.stats.tasks_succeeded += 1,
                TaskStatus::Failed => state.stats.tasks_failed += 1,
                _ => {}
            }
            state.stats.clone()
        };
        self.sink.publish(ProgressEvent::task(
            &self.run_id,
            &task.id,
            task.status,
            task.attempt_count(),
        ));
        self.sink.publish(ProgressEvent::stats(&self.run_id, stats));
    }

    /// Counts a reused artifact as a succeeded task.
    pub async fn task_reused(&self) {
        self.state.lock().await.stats.tasks_succeeded += 1;
    }

    pub async fn evaluation_finished(&self, phase: Phase, subject: &str, judge: &str, success: bool) {
        {
            let mut state = self.state.lock().await;
            if success {
                state.stats.evaluations_recorded += 1;
            } else {
                state.stats.evaluations_failed += 1;
            }
        }
        self.sink.publish(ProgressEvent::evaluation(
            &self.run_id,
            phase,
            subject,
            judge,
            success,
        ));
    }

    pub async fn snapshot(&self) -> RecorderSnapshot {
        let state = self.state.lock().await;
        RecorderSnapshot {
            total_cost_usd: state.total_cost_usd,
            errors: state.errors.clone(),
            cost_unknown_tasks: state.cost_unknown_tasks,
            audit_gaps: state.audit_gaps,
            events: state.sequence,
            stats: state.stats.clone(),
        }
    }
}
