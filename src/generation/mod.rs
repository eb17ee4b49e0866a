//! Candidate-document generation across external backends.
//!
//! Generation is layered:
//!
//! - **Backend** ([`backend::Backend`]): one `invoke` call against a subprocess
//!   or an HTTP API, with transport-level retry (full-jitter backoff) for
//!   transient failures inside the call itself.
//! - **Adapter** ([`adapter::GeneratorAdapter`]): one implementation per
//!   generator kind. Builds the prompt and checks structural requirements.
//! - **Runner** ([`adapter::AdapterRunner`]): drives validation-aware retries.
//!   Every attempt is passed through [`validator::ContentValidator`] so an
//!   attempt can never succeed with empty or too-short content, and reports
//!   timeouts and empty output back to the orchestrator as distinct outcomes.
//!
//! The orchestrator (`run::executor`) owns a third retry layer: an extra
//! attempt with an extended timeout for tasks that came back empty or timed
//! out.

pub mod adapter;
pub mod backend;
pub mod validator;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use adapter::{
    adapter_for, AdapterRun, AttemptBudget, AttemptRecord, AttemptStatus, DeepResearchAdapter,
    GeneratedContent, GenerationOutcome, GeneratorAdapter, MultiAgentAdapter, PromptInput,
    ResearchReportAdapter, TextTransformAdapter, AdapterRunner,
};
pub use backend::{
    Backend, BackendResponse, InvokeRequest, LlmBackend, ResponseMetadata, SubprocessBackend,
    SubprocessConfig,
};
pub use validator::{ContentValidator, EmptyReason, DEFAULT_MIN_CONTENT_LENGTH};

/// A backend family behind the uniform adapter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeneratorKind {
    TextTransform,
    ResearchReport,
    MultiAgent,
    DeepResearch,
}

impl GeneratorKind {
    /// All kinds, in a stable order.
    pub fn all() -> [GeneratorKind; 4] {
        [
            GeneratorKind::TextTransform,
            GeneratorKind::ResearchReport,
            GeneratorKind::MultiAgent,
            GeneratorKind::DeepResearch,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GeneratorKind::TextTransform => "text-transform",
            GeneratorKind::ResearchReport => "research-report",
            GeneratorKind::MultiAgent => "multi-agent",
            GeneratorKind::DeepResearch => "deep-research",
        }
    }
}

impl fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeneratorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GeneratorKind::all()
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown generator kind '{}'", s))
    }
}

/// Why a backend output failed its structural requirements.
///
/// Every code except [`ValidationCode::Other`] selects a prompt augmentation
/// for the next attempt. `Other` is fatal and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    MissingGrounding,
    MissingReasoning,
    BothMissing,
    Unknown,
    Other,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::MissingGrounding => "missing_grounding",
            ValidationCode::MissingReasoning => "missing_reasoning",
            ValidationCode::BothMissing => "both_missing",
            ValidationCode::Unknown => "unknown",
            ValidationCode::Other => "other",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ValidationCode::Other)
    }

    /// Prompt text appended on the next attempt, or `None` for the fatal code.
    pub fn augmentation(&self) -> Option<&'static str> {
        match self {
            ValidationCode::MissingGrounding => Some(
                "Your previous answer was rejected because it cited no sources. \
                 Ground every substantive claim with an inline citation and finish \
                 with a 'Sources' section listing each reference.",
            ),
            ValidationCode::MissingReasoning => Some(
                "Your previous answer was rejected because it did not show its \
                 reasoning. Include a 'Reasoning' section that explains how the \
                 conclusions were reached.",
            ),
            ValidationCode::BothMissing => Some(
                "Your previous answer was rejected because it had neither sources \
                 nor reasoning. Include a 'Reasoning' section and cite every \
                 substantive claim, finishing with a 'Sources' section.",
            ),
            ValidationCode::Unknown => Some(
                "Your previous answer did not meet the output requirements. \
                 Produce the complete document, following every instruction exactly.",
            ),
            ValidationCode::Other => None,
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing_grounding" => Ok(ValidationCode::MissingGrounding),
            "missing_reasoning" => Ok(ValidationCode::MissingReasoning),
            "both_missing" => Ok(ValidationCode::BothMissing),
            "unknown" => Ok(ValidationCode::Unknown),
            "other" => Ok(ValidationCode::Other),
            other => Err(format!("unknown validation code '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in GeneratorKind::all() {
            assert_eq!(kind.as_str().parse::<GeneratorKind>(), Ok(kind));
        }
        assert!("interpretive-dance".parse::<GeneratorKind>().is_err());
    }

    #[test]
    fn test_kind_serde_is_kebab_case() {
        let json = serde_json::to_string(&GeneratorKind::DeepResearch).expect("serialize");
        assert_eq!(json, "\"deep-research\"");
    }

    #[test]
    fn test_only_other_is_fatal() {
        assert!(ValidationCode::MissingGrounding.is_retryable());
        assert!(ValidationCode::MissingReasoning.is_retryable());
        assert!(ValidationCode::BothMissing.is_retryable());
        assert!(ValidationCode::Unknown.is_retryable());
        assert!(!ValidationCode::Other.is_retryable());
        assert!(ValidationCode::Other.augmentation().is_none());
    }

    #[test]
    fn test_augmentations_are_distinct() {
        let texts: std::collections::HashSet<&str> = [
            ValidationCode::MissingGrounding,
            ValidationCode::MissingReasoning,
            ValidationCode::BothMissing,
            ValidationCode::Unknown,
        ]
        .iter()
        .filter_map(|c| c.augmentation())
        .collect();
        assert_eq!(texts.len(), 4);
    }
}
