//! Run configuration snapshot and service settings.
//!
//! A [`RunConfig`] is loaded once per run (YAML), validated, fingerprinted
//! and then treated as immutable for the lifetime of the run.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::combine::{CombineStrategy, SelectionRule};
use crate::error::ConfigError;
use crate::evaluation::DEFAULT_CRITERIA;
use crate::generation::{GeneratorKind, DEFAULT_MIN_CONTENT_LENGTH};
use crate::llm::PricingTable;
use crate::retry::RetryPolicy;

/// Bucket that tracks tasks whose single-doc evaluation has finished.
pub const EVALUATED_BUCKET: &str = "evaluated";

/// One input document, given inline or by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorSelection {
    pub kind: GeneratorKind,
    pub models: Vec<String>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
}

fn default_iterations() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Parallel launches per kind. Missing kinds default to 1.
    pub per_kind: HashMap<GeneratorKind, usize>,
    /// Delay between successive launches of the same kind.
    pub stagger_ms: u64,
    /// Parallel judge calls during the pairwise phase.
    pub evaluation: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            per_kind: HashMap::new(),
            stagger_ms: 0,
            evaluation: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub timeout_secs: u64,
    /// Multiplier applied to the timeout for the orchestrator's extra attempt.
    pub extended_timeout_factor: f64,
    /// Attempts per adapter run, including the first.
    pub validation_retries: u32,
    pub min_content_length: usize,
    /// Transport-level backoff inside backends.
    pub retry: RetryPolicy,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            extended_timeout_factor: 2.0,
            validation_retries: 3,
            min_content_length: DEFAULT_MIN_CONTENT_LENGTH,
            retry: RetryPolicy::default(),
        }
    }
}

impl GenerationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn extended_timeout(&self) -> Duration {
        self.timeout().mul_f64(self.extended_timeout_factor.max(1.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairwiseSettings {
    pub enabled: bool,
    /// Restrict comparisons to the best N documents by single-doc score.
    pub top_n: Option<usize>,
    /// Buckets to wait for before comparing. Empty means every generation
    /// bucket plus the evaluated bucket.
    pub wait_for: Vec<String>,
}

impl Default for PairwiseSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            top_n: None,
            wait_for: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub judges: Vec<String>,
    pub criteria: Vec<String>,
    pub pairwise: PairwiseSettings,
    /// Replace existing evaluation records instead of reusing them.
    pub reevaluate: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            judges: Vec::new(),
            criteria: DEFAULT_CRITERIA.iter().map(|c| c.to_string()).collect(),
            pairwise: PairwiseSettings::default(),
            reevaluate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombineConfig {
    pub strategy: CombineStrategy,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub selection: SelectionRule,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub table_of_contents: bool,
    /// Model used by intelligent merge.
    #[serde(default)]
    pub merge_model: Option<String>,
    #[serde(default = "default_merge_kind")]
    pub merge_kind: GeneratorKind,
    /// Compare the combined artifact against its inputs afterwards.
    #[serde(default)]
    pub evaluate_against_originals: bool,
}

fn default_top_k() -> usize {
    3
}

fn default_separator() -> String {
    "\n\n---\n\n".to_string()
}

fn default_merge_kind() -> GeneratorKind {
    GeneratorKind::TextTransform
}

impl CombineConfig {
    pub fn new(strategy: CombineStrategy) -> Self {
        Self {
            strategy,
            top_k: default_top_k(),
            selection: SelectionRule::default(),
            separator: default_separator(),
            table_of_contents: false,
            merge_model: None,
            merge_kind: default_merge_kind(),
            evaluate_against_originals: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub documents: Vec<DocumentSource>,
    pub instructions: String,
    pub generators: Vec<GeneratorSelection>,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub combine: Option<CombineConfig>,
    #[serde(default)]
    pub pricing: PricingTable,
}

impl RunConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file. Relative document paths are resolved against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&raw)?;
        if let Some(base) = path.parent() {
            for doc in &mut config.documents {
                if let Some(doc_path) = &doc.path {
                    if doc_path.is_relative() {
                        doc.path = Some(base.join(doc_path));
                    }
                }
            }
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.documents.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one document is required".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for doc in &self.documents {
            if doc.id.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "document id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(doc.id.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate document id '{}'",
                    doc.id
                )));
            }
            if doc.content.is_none() && doc.path.is_none() {
                return Err(ConfigError::InvalidValue {
                    key: format!("documents.{}", doc.id),
                    message: "either content or path is required".to_string(),
                });
            }
        }

        if self.generators.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one generator selection is required".to_string(),
            ));
        }
        for selection in &self.generators {
            if selection.models.is_empty() || selection.models.iter().any(|m| m.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("generators.{}.models", selection.kind),
                    message: "models must be non-empty".to_string(),
                });
            }
            if selection.iterations == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("generators.{}.iterations", selection.kind),
                    message: "iterations must be greater than 0".to_string(),
                });
            }
        }

        if self.concurrency.per_kind.values().any(|&limit| limit == 0) {
            return Err(ConfigError::ValidationFailed(
                "per-kind concurrency must be greater than 0".to_string(),
            ));
        }

        let generation = &self.generation;
        if generation.timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "generation.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if !(generation.extended_timeout_factor >= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "generation.extended_timeout_factor must be at least 1.0".to_string(),
            ));
        }
        if generation.validation_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "generation.validation_retries must be greater than 0".to_string(),
            ));
        }
        if generation.min_content_length == 0 {
            return Err(ConfigError::ValidationFailed(
                "generation.min_content_length must be greater than 0".to_string(),
            ));
        }

        if self.evaluation.criteria.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "evaluation.criteria cannot be empty".to_string(),
            ));
        }
        let known: BTreeSet<String> = GeneratorKind::all()
            .iter()
            .map(|k| k.as_str().to_string())
            .chain(std::iter::once(EVALUATED_BUCKET.to_string()))
            .collect();
        if let Some(unknown) = self
            .evaluation
            .pairwise
            .wait_for
            .iter()
            .find(|bucket| !known.contains(*bucket))
        {
            return Err(ConfigError::InvalidValue {
                key: "evaluation.pairwise.wait_for".to_string(),
                message: format!("unknown bucket '{}'", unknown),
            });
        }

        if let Some(combine) = &self.combine {
            if combine.top_k == 0 {
                return Err(ConfigError::ValidationFailed(
                    "combine.top_k must be greater than 0".to_string(),
                ));
            }
            if combine.strategy == CombineStrategy::IntelligentMerge && combine.merge_model.is_none() {
                return Err(ConfigError::InvalidValue {
                    key: "combine.merge_model".to_string(),
                    message: "intelligent-merge requires a merge model".to_string(),
                });
            }
        }

        Ok(())
    }

    /// SHA-256 over the canonical JSON form.
    pub fn fingerprint(&self) -> String {
        // `serde_json::Value` maps are ordered, which makes the encoding
        // independent of `HashMap` iteration order.
        let canonical = serde_json::to_value(self)
            .map(|value| value.to_string())
            .unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Kinds selected by this run, deduplicated and in stable order.
    pub fn kinds(&self) -> Vec<GeneratorKind> {
        let set: BTreeSet<GeneratorKind> = self.generators.iter().map(|g| g.kind).collect();
        set.into_iter().collect()
    }

    /// Buckets the pairwise phase waits on.
    ///
    /// Top-n selection reads single-doc scores, so a `top_n` gate always
    /// includes the evaluated bucket.
    pub fn pairwise_gate(&self) -> Vec<String> {
        let pairwise = &self.evaluation.pairwise;
        if pairwise.wait_for.is_empty() {
            return self
                .kinds()
                .iter()
                .map(|k| k.as_str().to_string())
                .chain(std::iter::once(EVALUATED_BUCKET.to_string()))
                .collect();
        }
        let mut gate = pairwise.wait_for.clone();
        if pairwise.top_n.is_some() && !gate.iter().any(|b| b == EVALUATED_BUCKET) {
            gate.push(EVALUATED_BUCKET.to_string());
        }
        gate
    }
}

// ============================================================================
// Service configuration
// ============================================================================

pub const DB_ENV: &str = "DOCFORGE_DB";
pub const BACKEND_COMMAND_ENV: &str = "DOCFORGE_BACKEND_COMMAND";
pub const DEFAULT_DB_PATH: &str = "docforge.db";

/// Process-wide settings that are not part of a run snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub db_path: String,
    pub openrouter_api_key: Option<String>,
    /// Shell command used as the subprocess backend for every kind.
    pub backend_command: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            openrouter_api_key: None,
            backend_command: None,
        }
    }
}

impl ServiceConfig {
    /// Reads `DOCFORGE_DB`, `OPENROUTER_API_KEY` and `DOCFORGE_BACKEND_COMMAND`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(val) = std::env::var(DB_ENV) {
            config.db_path = non_empty(DB_ENV, val)?;
        }
        config.openrouter_api_key = std::env::var(crate::llm::providers::openrouter::API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty());
        config.backend_command = std::env::var(BACKEND_COMMAND_ENV)
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());
        Ok(config)
    }

    /// Fails when neither a subprocess backend nor an API key is available.
    pub fn require_backend(&self) -> Result<(), ConfigError> {
        if self.backend_command.is_none() && self.openrouter_api_key.is_none() {
            return Err(ConfigError::MissingEnvVar(format!(
                "{} or {}",
                BACKEND_COMMAND_ENV,
                crate::llm::providers::openrouter::API_KEY_ENV
            )));
        }
        Ok(())
    }
}

fn non_empty(key: &str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "cannot be empty".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
documents:
  - id: intro
    content: "Some source text."
instructions: "Rewrite for clarity."
generators:
  - kind: text-transform
    models: [model-a, model-b]
"#;

    #[test]
    fn test_minimal_yaml_defaults() {
        let config = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        assert_eq!(config.generators[0].iterations, 1);
        assert_eq!(config.generation.validation_retries, 3);
        assert_eq!(config.generation.retry, RetryPolicy::default());
        assert_eq!(config.generation.min_content_length, DEFAULT_MIN_CONTENT_LENGTH);
        assert!(config.evaluation.pairwise.enabled);
        assert_eq!(config.evaluation.criteria.len(), DEFAULT_CRITERIA.len());
        assert!(config.combine.is_none());
    }

    #[test]
    fn test_full_yaml() {
        let raw = r#"
documents:
  - id: a
    content: "text"
instructions: "Improve."
generators:
  - kind: deep-research
    models: [m1]
    iterations: 2
concurrency:
  per_kind:
    deep-research: 3
  stagger_ms: 250
generation:
  timeout_secs: 30
  extended_timeout_factor: 1.5
  retry:
    max_attempts: 4
    base_delay: 100
    max_delay: 1000
evaluation:
  judges: [judge-1]
  pairwise:
    top_n: 2
    wait_for: [deep-research]
combine:
  strategy: best-of-n
  selection: single-score
pricing:
  m1:
    input_per_1m: 1.0
    output_per_1m: 2.0
"#;
        let config = RunConfig::from_yaml_str(raw).expect("valid");
        assert_eq!(config.concurrency.per_kind[&GeneratorKind::DeepResearch], 3);
        assert_eq!(config.generation.retry.max_attempts, 4);
        assert_eq!(config.generation.extended_timeout(), Duration::from_secs(45));
        assert_eq!(
            config.pairwise_gate(),
            vec!["deep-research".to_string(), EVALUATED_BUCKET.to_string()]
        );
        let combine = config.combine.expect("combine");
        assert_eq!(combine.strategy, CombineStrategy::BestOfN);
        assert_eq!(combine.selection, SelectionRule::SingleScore);
        assert!(config.pricing.get("m1").is_some());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        config.documents.push(config.documents[0].clone());
        assert!(config.validate().is_err());

        let mut config = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        config.generators[0].models.clear();
        assert!(config.validate().is_err());

        let mut config = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        config.evaluation.pairwise.wait_for = vec!["nope".into()];
        assert!(config.validate().is_err());

        let mut config = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        config.combine = Some(CombineConfig::new(CombineStrategy::IntelligentMerge));
        assert!(config.validate().is_err());

        let mut config = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        config.generation.extended_timeout_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let config = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        let same = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        assert_eq!(config.fingerprint(), same.fingerprint());

        let mut changed = config.clone();
        changed.generators[0].models[1] = "model-c".into();
        assert_ne!(config.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_custom_gate_without_top_n_is_kept() {
        let mut config = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        config.evaluation.pairwise.wait_for = vec!["text-transform".into()];
        assert_eq!(config.pairwise_gate(), vec!["text-transform".to_string()]);
    }

    #[test]
    fn test_default_gate_covers_kinds_and_evaluated() {
        let config = RunConfig::from_yaml_str(MINIMAL).expect("valid");
        assert_eq!(
            config.pairwise_gate(),
            vec!["text-transform".to_string(), EVALUATED_BUCKET.to_string()]
        );
    }
}
