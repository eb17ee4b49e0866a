//! Run, task, artifact and timeline records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::generation::{AttemptRecord, GeneratorKind};

/// Hex SHA-256 of `content`.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

// ============================================================================
// Run
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Partial | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Legal edges of the run state machine.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Failed) => true,
            (RunStatus::Pending, RunStatus::Cancelled) => true,
            (RunStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDocument {
    pub document_id: String,
    pub model: String,
    pub kind: GeneratorKind,
    pub rating: f64,
    pub games: u32,
    pub single_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSummary {
    pub strategy: String,
    pub document_id: String,
    pub inputs: Vec<String>,
    /// Elo rating of the combined artifact after comparison with its inputs.
    pub rating: Option<f64>,
}

/// Results summary written when the run reaches a terminal status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tasks_planned: usize,
    pub tasks_reused: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub tasks_cancelled: usize,
    pub documents: usize,
    pub single_scores_expected: usize,
    pub single_scores_recorded: usize,
    pub pairwise_expected: usize,
    pub pairwise_recorded: usize,
    /// Tasks whose cost could not be determined.
    pub cost_unknown_tasks: usize,
    pub ranking: Vec<RankedDocument>,
    pub combined: Option<CombinedSummary>,
    /// Human-readable list of expected records that do not exist.
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub config_fingerprint: String,
    pub total_cost_usd: f64,
    pub errors: Vec<String>,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: impl Into<String>, config_fingerprint: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: RunStatus::Pending,
            config_fingerprint: config_fingerprint.into(),
            total_cost_usd: 0.0,
            errors: Vec::new(),
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Generation tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    EmptyContent,
    TimedOut,
    Errored,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::EmptyContent => "empty_content",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Errored => "errored",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "empty_content" => Ok(TaskStatus::EmptyContent),
            "timed_out" => Ok(TaskStatus::TimedOut),
            "errored" => Ok(TaskStatus::Errored),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// One (document, model, kind, iteration) unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub id: String,
    pub run_id: String,
    pub document_id: String,
    pub model: String,
    pub kind: GeneratorKind,
    pub iteration: u32,
    /// Hash of every input that affects this task's output.
    pub task_key: String,
    pub status: TaskStatus,
    pub attempts: Vec<AttemptRecord>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// `None` when no attempt reported a cost and none could be estimated.
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
    pub output_document_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationTask {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Short label used in logs and error entries.
    pub fn label(&self) -> String {
        format!(
            "{} / {} [{} #{}]",
            self.model, self.document_id, self.kind, self.iteration
        )
    }
}

/// Content produced by a succeeded task. Never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    pub task_key: String,
    pub source_document_id: String,
    pub model: String,
    pub kind: GeneratorKind,
    pub iteration: u32,
    pub content: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Deterministic artifact id. Regenerated content under the same task key
/// gets a new id, so evaluation records never carry over to it.
pub fn document_id_for(task_key: &str, content_hash: &str) -> String {
    let digest = self::content_hash(&format!("{}:{}", task_key, content_hash));
    format!("gen-{}", &digest[..16])
}

// ============================================================================
// Timeline
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Run,
    Generation,
    SingleEval,
    Pairwise,
    Combine,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Run => "run",
            Phase::Generation => "generation",
            Phase::SingleEval => "single_eval",
            Phase::Pairwise => "pairwise",
            Phase::Combine => "combine",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Phase::Run),
            "generation" => Ok(Phase::Generation),
            "single_eval" => Ok(Phase::SingleEval),
            "pairwise" => Ok(Phase::Pairwise),
            "combine" => Ok(Phase::Combine),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

/// One append-only entry in a run's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub run_id: String,
    pub sequence: u64,
    pub phase: Phase,
    pub description: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub detail: serde_json::Value,
}
