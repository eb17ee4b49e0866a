//! Scoring, head-to-head comparison and rating of generated documents.
//!
//! - [`single_doc::SingleDocEvaluator`] scores one document against a fixed
//!   criteria set with every configured judge.
//! - [`pairwise::PairwiseEvaluator`] compares two documents per judge; ties
//!   are kept as ties.
//! - [`elo::EloRanker`] turns pairwise outcomes into ratings.
//!
//! Records are keyed by `(document, judge)` and `(document_a, document_b,
//! judge)` with `document_a < document_b`. An existing record is reused
//! unless the caller explicitly asks to re-evaluate.

pub mod elo;
pub mod judge;
pub mod pairwise;
pub mod single_doc;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use elo::{EloRanker, EloRating, BASE_RATING, K_FACTOR};
pub use judge::{Judge, LlmJudge, PairwiseVerdict};
pub use pairwise::{plan_pairs, select_top_n, PairwiseEvaluator};
pub use single_doc::SingleDocEvaluator;

/// Criteria used when a run does not configure its own.
pub const DEFAULT_CRITERIA: &[&str] = &["accuracy", "completeness", "clarity", "structure"];

pub const MIN_SCORE: f64 = 1.0;
pub const MAX_SCORE: f64 = 10.0;

/// A document as presented to a judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission<'a> {
    pub id: &'a str,
    pub content: &'a str,
}

impl<'a> Submission<'a> {
    pub fn new(id: &'a str, content: &'a str) -> Self {
        Self { id, content }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleDocScore {
    pub document_id: String,
    pub judge: String,
    pub run_id: String,
    /// Criterion name to score, each within 1-10.
    pub scores: BTreeMap<String, f64>,
    pub average: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Winner {
    A,
    B,
    Tie,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::A => "A",
            Winner::B => "B",
            Winner::Tie => "tie",
        }
    }

    /// The same verdict with the two sides exchanged.
    pub fn flipped(self) -> Self {
        match self {
            Winner::A => Winner::B,
            Winner::B => Winner::A,
            Winner::Tie => Winner::Tie,
        }
    }
}

impl fmt::Display for Winner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Winner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "document_a" | "first" => Ok(Winner::A),
            "b" | "document_b" | "second" => Ok(Winner::B),
            "tie" | "draw" | "equal" => Ok(Winner::Tie),
            other => Err(format!("unknown winner '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseOutcome {
    /// Lexicographically smaller document id.
    pub document_a: String,
    pub document_b: String,
    pub judge: String,
    pub run_id: String,
    pub winner: Winner,
    /// Judge confidence in `[0, 1]`.
    pub confidence: f64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of one evaluator call for one judge.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome<T> {
    /// Newly produced and stored.
    Recorded(T),
    /// An existing record was found and the judge was not called.
    Reused(T),
    Failed { judge: String, error: String },
}

impl<T> EvalOutcome<T> {
    pub fn record(&self) -> Option<&T> {
        match self {
            EvalOutcome::Recorded(record) | EvalOutcome::Reused(record) => Some(record),
            EvalOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, EvalOutcome::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_winner_parsing() {
        assert_eq!("A".parse::<Winner>(), Ok(Winner::A));
        assert_eq!(" b ".parse::<Winner>(), Ok(Winner::B));
        assert_eq!("TIE".parse::<Winner>(), Ok(Winner::Tie));
        assert!("both".parse::<Winner>().is_err());
    }

    #[test]
    fn test_winner_flip() {
        assert_eq!(Winner::A.flipped(), Winner::B);
        assert_eq!(Winner::Tie.flipped(), Winner::Tie);
    }
}
