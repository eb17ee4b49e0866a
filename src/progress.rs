//! Live progress notifications.
//!
//! Delivery is best-effort: a sink with no subscribers, or a subscriber that
//! falls behind, never affects the run. The timeline in the store remains
//! the authoritative record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::run::model::{Phase, RunStatus, TaskStatus};

/// Default capacity of a [`BroadcastSink`] channel.
pub const DEFAULT_CAPACITY: usize = 256;

/// Counters snapshot published alongside other events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub tasks_total: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub evaluations_recorded: usize,
    pub evaluations_failed: usize,
    pub total_cost_usd: f64,
}

/// Events emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The run or one of its phases changed state.
    PhaseChanged {
        run_id: String,
        phase: Phase,
        description: String,
        timestamp: DateTime<Utc>,
    },
    /// A generation task reached a terminal state.
    TaskFinished {
        run_id: String,
        task_id: String,
        status: TaskStatus,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    /// An evaluation record was stored or failed.
    EvaluationFinished {
        run_id: String,
        phase: Phase,
        subject: String,
        judge: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },
    Stats {
        run_id: String,
        stats: RunStats,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn phase(run_id: &str, phase: Phase, description: impl Into<String>) -> Self {
        ProgressEvent::PhaseChanged {
            run_id: run_id.to_string(),
            phase,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn task(run_id: &str, task_id: &str, status: TaskStatus, attempts: u32) -> Self {
        ProgressEvent::TaskFinished {
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            status,
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn evaluation(run_id: &str, phase: Phase, subject: &str, judge: &str, success: bool) -> Self {
        ProgressEvent::EvaluationFinished {
            run_id: run_id.to_string(),
            phase,
            subject: subject.to_string(),
            judge: judge.to_string(),
            success,
            timestamp: Utc::now(),
        }
    }

    pub fn stats(run_id: &str, stats: RunStats) -> Self {
        ProgressEvent::Stats {
            run_id: run_id.to_string(),
            stats,
            timestamp: Utc::now(),
        }
    }

    pub fn finished(run_id: &str, status: RunStatus) -> Self {
        ProgressEvent::RunFinished {
            run_id: run_id.to_string(),
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            ProgressEvent::PhaseChanged { run_id, .. }
            | ProgressEvent::TaskFinished { run_id, .. }
            | ProgressEvent::EvaluationFinished { run_id, .. }
            | ProgressEvent::Stats { run_id, .. }
            | ProgressEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastSink {
    fn publish(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();

        sink.publish(ProgressEvent::phase("run-1", Phase::Generation, "started"));

        let event = rx.recv().await.expect("event");
        assert_eq!(event.run_id(), "run-1");
        assert!(matches!(event, ProgressEvent::PhaseChanged { phase: Phase::Generation, .. }));
    }

    #[test]
    fn test_publish_without_subscribers_is_ignored() {
        let sink = BroadcastSink::new(1);
        sink.publish(ProgressEvent::finished("run-1", RunStatus::Completed));
        sink.publish(ProgressEvent::finished("run-1", RunStatus::Completed));
        NullSink.publish(ProgressEvent::stats("run-1", RunStats::default()));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let sink = BroadcastSink::new(2);
        let mut rx = sink.subscribe();
        for i in 0..5 {
            sink.publish(ProgressEvent::task("run-1", &format!("t{}", i), TaskStatus::Succeeded, 1));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let json = serde_json::to_value(ProgressEvent::finished("r", RunStatus::Partial)).expect("json");
        assert_eq!(json["type"], "run_finished");
        assert_eq!(json["status"], "partial");
    }
}
