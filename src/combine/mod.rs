//! Synthesis of top-ranked documents into one artifact.
//!
//! Strategies implement [`Combine`]:
//!
//! - [`Concatenate`]: deterministic join with a fixed separator and an
//!   optional table of contents.
//! - [`BestOfN`]: picks one input by metric; ties go to the lowest id.
//! - [`IntelligentMerge`]: asks a generator backend to merge the inputs,
//!   through the same [`AdapterRunner`] contract as candidate generation.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::GenerationError;
use crate::generation::{
    adapter_for, AdapterRunner, AttemptBudget, AttemptRecord, GenerationOutcome, GeneratorKind,
    PromptInput, ResponseMetadata,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CombineStrategy {
    Concatenate,
    BestOfN,
    IntelligentMerge,
}

impl CombineStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CombineStrategy::Concatenate => "concatenate",
            CombineStrategy::BestOfN => "best-of-n",
            CombineStrategy::IntelligentMerge => "intelligent-merge",
        }
    }
}

impl fmt::Display for CombineStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric used to rank combine inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionRule {
    #[default]
    Elo,
    SingleScore,
}

#[derive(Debug, Error)]
pub enum CombineError {
    #[error("No documents available to combine")]
    NoInputs,

    #[error("Merge produced no usable content: {0}")]
    Empty(String),

    #[error("Merge timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Merge failed: {0}")]
    Generation(#[from] GenerationError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CombineInput {
    pub document_id: String,
    pub model: String,
    pub content: String,
    pub rating: Option<f64>,
    pub single_score: Option<f64>,
}

impl CombineInput {
    fn metric(&self, rule: SelectionRule) -> Option<f64> {
        match rule {
            SelectionRule::Elo => self.rating,
            SelectionRule::SingleScore => self.single_score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Combined {
    pub content: String,
    /// Ids of the documents that went into the artifact, in order.
    pub inputs: Vec<String>,
    pub metadata: ResponseMetadata,
    /// Backend attempts, for strategies that call one.
    pub attempts: Vec<AttemptRecord>,
}

/// Orders `candidates` by `rule` (highest first, missing metric last), then
/// by single-doc score, then by lowest id, and keeps the first `top_k`.
pub fn select_inputs(mut candidates: Vec<CombineInput>, rule: SelectionRule, top_k: usize) -> Vec<CombineInput> {
    candidates.sort_by(|a, b| {
        descending(a.metric(rule), b.metric(rule))
            .then_with(|| descending(a.single_score, b.single_score))
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    candidates.truncate(top_k);
    candidates
}

/// Highest first; `None` sorts after every value.
fn descending(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => OrderedFloat(y).cmp(&OrderedFloat(x)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[async_trait]
pub trait Combine: Send + Sync {
    fn strategy(&self) -> CombineStrategy;

    async fn combine(&self, inputs: &[CombineInput]) -> Result<Combined, CombineError>;
}

// ============================================================================
// Concatenate
// ============================================================================

pub struct Concatenate {
    pub separator: String,
    pub table_of_contents: bool,
}

impl Concatenate {
    pub fn join(&self, inputs: &[CombineInput]) -> String {
        let mut out = String::new();
        if self.table_of_contents {
            out.push_str("## Contents\n\n");
            for (i, input) in inputs.iter().enumerate() {
                out.push_str(&format!("{}. {} ({})\n", i + 1, input.document_id, input.model));
            }
            out.push_str(&self.separator);
        }
        let sections: Vec<String> = inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                if self.table_of_contents {
                    format!("## {}. {}\n\n{}", i + 1, input.document_id, input.content.trim())
                } else {
                    input.content.trim().to_string()
                }
            })
            .collect();
        out.push_str(&sections.join(&self.separator));
        out
    }
}

#[async_trait]
impl Combine for Concatenate {
    fn strategy(&self) -> CombineStrategy {
        CombineStrategy::Concatenate
    }

    async fn combine(&self, inputs: &[CombineInput]) -> Result<Combined, CombineError> {
        if inputs.is_empty() {
            return Err(CombineError::NoInputs);
        }
        Ok(Combined {
            content: self.join(inputs),
            inputs: inputs.iter().map(|i| i.document_id.clone()).collect(),
            metadata: ResponseMetadata::default(),
            attempts: Vec::new(),
        })
    }
}

// ============================================================================
// Best-of-N
// ============================================================================

pub struct BestOfN {
    pub rule: SelectionRule,
}

#[async_trait]
impl Combine for BestOfN {
    fn strategy(&self) -> CombineStrategy {
        CombineStrategy::BestOfN
    }

    async fn combine(&self, inputs: &[CombineInput]) -> Result<Combined, CombineError> {
        let best = select_inputs(inputs.to_vec(), self.rule, 1)
            .into_iter()
            .next()
            .ok_or(CombineError::NoInputs)?;
        Ok(Combined {
            content: best.content,
            inputs: vec![best.document_id],
            metadata: ResponseMetadata::default(),
            attempts: Vec::new(),
        })
    }
}

// ============================================================================
// Intelligent merge
// ============================================================================

pub struct IntelligentMerge {
    runner: Arc<AdapterRunner>,
    kind: GeneratorKind,
    model: String,
    instructions: String,
    budget: AttemptBudget,
    extended_timeout: Duration,
}

impl IntelligentMerge {
    pub fn new(
        runner: Arc<AdapterRunner>,
        kind: GeneratorKind,
        model: impl Into<String>,
        instructions: impl Into<String>,
        budget: AttemptBudget,
        extended_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            kind,
            model: model.into(),
            instructions: instructions.into(),
            budget,
            extended_timeout,
        }
    }

    fn merge_input(&self, inputs: &[CombineInput]) -> PromptInput {
        let joined = Concatenate {
            separator: "\n\n=====\n\n".to_string(),
            table_of_contents: true,
        }
        .join(inputs);
        PromptInput {
            document_id: format!("merge:{}", inputs.len()),
            document: joined,
            instructions: format!(
                "Merge the {} candidate documents below into one document that keeps the \
                 strongest material from each. Original instructions: {}",
                inputs.len(),
                self.instructions
            ),
            model: self.model.clone(),
        }
    }
}

#[async_trait]
impl Combine for IntelligentMerge {
    fn strategy(&self) -> CombineStrategy {
        CombineStrategy::IntelligentMerge
    }

    async fn combine(&self, inputs: &[CombineInput]) -> Result<Combined, CombineError> {
        if inputs.is_empty() {
            return Err(CombineError::NoInputs);
        }
        let adapter = adapter_for(self.kind);
        let run = self
            .runner
            .generate_with_recovery(
                adapter.as_ref(),
                &self.merge_input(inputs),
                self.budget,
                self.extended_timeout,
            )
            .await;

        match run.outcome {
            GenerationOutcome::Content(generated) => Ok(Combined {
                content: generated.content,
                inputs: inputs.iter().map(|i| i.document_id.clone()).collect(),
                metadata: generated.metadata,
                attempts: run.attempts,
            }),
            GenerationOutcome::Empty { reason } => Err(CombineError::Empty(reason)),
            GenerationOutcome::TimedOut { after } => Err(CombineError::TimedOut(after)),
            GenerationOutcome::Failed(err) => Err(CombineError::Generation(err)),
        }
    }
}
