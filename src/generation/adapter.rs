//! Per-kind generator adapters and the validation-aware retry driver.
//!
//! An adapter knows how to phrase the request for its backend family and
//! which structural requirements its output must meet. The
//! [`AdapterRunner`] drives attempts:
//!
//! 1. Build the prompt, with the augmentation selected by the previous
//!    attempt's [`ValidationCode`] if any.
//! 2. Invoke the backend under the attempt timeout (the outer boundary).
//! 3. Classify: backend-reported validation code, then
//!    [`ContentValidator`], then the adapter's structural check.
//!
//! Retryable validation codes and empty content are retried up to the
//! attempt budget. A timeout or a non-retryable error ends the run
//! immediately so the orchestrator can decide on an extended-budget retry.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, GenerationError};

use super::backend::{Backend, BackendResponse, InvokeRequest, ResponseMetadata};
use super::validator::{ContentValidator, EmptyReason};
use super::{GeneratorKind, ValidationCode};

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s)\]]+").expect("valid url regex"));
static CITATION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\d{1,3}\]").expect("valid citation regex"));
static SOURCES_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(#+\s*)?(sources|references|bibliography)\s*:?\s*$")
        .expect("valid sources regex")
});
static REASONING_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(#+\s*)?(reasoning|methodology|analysis)\s*:?\s*$")
        .expect("valid reasoning regex")
});

/// True when content cites sources by URL, numbered marker, or a sources section.
pub fn has_grounding(content: &str) -> bool {
    URL_PATTERN.is_match(content)
        || CITATION_PATTERN.is_match(content)
        || SOURCES_HEADING.is_match(content)
}

/// True when content carries an explicit reasoning section.
pub fn has_reasoning(content: &str) -> bool {
    REASONING_HEADING.is_match(content)
}

/// Everything an adapter needs to phrase one generation request.
#[derive(Debug, Clone)]
pub struct PromptInput {
    pub document_id: String,
    pub document: String,
    pub instructions: String,
    pub model: String,
}

pub trait GeneratorAdapter: Send + Sync {
    fn kind(&self) -> GeneratorKind;

    fn system_prompt(&self) -> Option<&str> {
        None
    }

    fn build_prompt(&self, input: &PromptInput, augmentation: Option<ValidationCode>) -> String;

    /// Structural requirement check on content that already passed the
    /// [`ContentValidator`].
    fn check_structure(&self, _content: &str) -> Option<ValidationCode> {
        None
    }
}

fn compose(instructions: &str, framing: &str, document: &str, augmentation: Option<ValidationCode>) -> String {
    let mut prompt = String::with_capacity(document.len() + instructions.len() + 256);
    prompt.push_str(instructions.trim());
    prompt.push_str("\n\n");
    prompt.push_str(framing);
    prompt.push_str("\n\n--- DOCUMENT ---\n");
    prompt.push_str(document);
    prompt.push_str("\n--- END DOCUMENT ---");
    if let Some(text) = augmentation.and_then(|code| code.augmentation()) {
        prompt.push_str("\n\n");
        prompt.push_str(text);
    }
    prompt
}

/// Rewrites the document according to the instructions. No structural
/// requirements beyond non-empty content.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextTransformAdapter;

impl GeneratorAdapter for TextTransformAdapter {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::TextTransform
    }

    fn build_prompt(&self, input: &PromptInput, augmentation: Option<ValidationCode>) -> String {
        compose(
            &input.instructions,
            "Return only the transformed document.",
            &input.document,
            augmentation,
        )
    }
}

/// Produces a cited report; output without grounding is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResearchReportAdapter;

impl GeneratorAdapter for ResearchReportAdapter {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::ResearchReport
    }

    fn system_prompt(&self) -> Option<&str> {
        Some("You are a careful research analyst. Every factual claim you make is cited.")
    }

    fn build_prompt(&self, input: &PromptInput, augmentation: Option<ValidationCode>) -> String {
        compose(
            &input.instructions,
            "Write a research report based on the document. Cite sources inline and end with a 'Sources' section.",
            &input.document,
            augmentation,
        )
    }

    fn check_structure(&self, content: &str) -> Option<ValidationCode> {
        if has_grounding(content) {
            None
        } else {
            Some(ValidationCode::MissingGrounding)
        }
    }
}

/// Panel-of-agents generation; the consolidated answer must show its reasoning.
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiAgentAdapter;

impl GeneratorAdapter for MultiAgentAdapter {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::MultiAgent
    }

    fn system_prompt(&self) -> Option<&str> {
        Some(
            "You coordinate a panel of specialist agents. Draft, critique and \
             consolidate before answering.",
        )
    }

    fn build_prompt(&self, input: &PromptInput, augmentation: Option<ValidationCode>) -> String {
        compose(
            &input.instructions,
            "Produce the consolidated document followed by a 'Reasoning' section summarising the panel's deliberation.",
            &input.document,
            augmentation,
        )
    }

    fn check_structure(&self, content: &str) -> Option<ValidationCode> {
        if has_reasoning(content) {
            None
        } else {
            Some(ValidationCode::MissingReasoning)
        }
    }
}

/// Long-running research; needs both grounding and reasoning.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeepResearchAdapter;

impl GeneratorAdapter for DeepResearchAdapter {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::DeepResearch
    }

    fn system_prompt(&self) -> Option<&str> {
        Some("You are a deep-research agent. Investigate thoroughly, cite everything, and explain your reasoning.")
    }

    fn build_prompt(&self, input: &PromptInput, augmentation: Option<ValidationCode>) -> String {
        compose(
            &input.instructions,
            "Research the topic of the document in depth. Include a 'Reasoning' section and a 'Sources' section.",
            &input.document,
            augmentation,
        )
    }

    fn check_structure(&self, content: &str) -> Option<ValidationCode> {
        match (has_grounding(content), has_reasoning(content)) {
            (true, true) => None,
            (false, true) => Some(ValidationCode::MissingGrounding),
            (true, false) => Some(ValidationCode::MissingReasoning),
            (false, false) => Some(ValidationCode::BothMissing),
        }
    }
}

/// The stock adapter for a kind.
pub fn adapter_for(kind: GeneratorKind) -> Arc<dyn GeneratorAdapter> {
    match kind {
        GeneratorKind::TextTransform => Arc::new(TextTransformAdapter),
        GeneratorKind::ResearchReport => Arc::new(ResearchReportAdapter),
        GeneratorKind::MultiAgent => Arc::new(MultiAgentAdapter),
        GeneratorKind::DeepResearch => Arc::new(DeepResearchAdapter),
    }
}

// ============================================================================
// Attempt records and outcomes
// ============================================================================

/// Result of a single backend attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    EmptyContent,
    TimedOut,
    Errored,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::EmptyContent => "empty_content",
            AttemptStatus::TimedOut => "timed_out",
            AttemptStatus::Errored => "errored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// One-based attempt number across every retry layer of the task.
    pub attempt: u32,
    pub status: AttemptStatus,
    pub detail: String,
    pub validation: Option<ValidationCode>,
    /// Usage reported for this attempt, successful or not.
    pub metadata: ResponseMetadata,
    #[serde(with = "crate::retry::duration_ms")]
    pub duration: Duration,
    #[serde(with = "crate::retry::duration_ms")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedContent {
    /// Trimmed, validated content.
    pub content: String,
    pub metadata: ResponseMetadata,
}

/// How an adapter run ended. Consumed by exhaustive match; there is no
/// "falsy" success.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Content(GeneratedContent),
    Empty { reason: String },
    TimedOut { after: Duration },
    Failed(GenerationError),
}

impl GenerationOutcome {
    /// Whether the orchestrator may retry with an extended budget.
    pub fn wants_extended_retry(&self) -> bool {
        matches!(
            self,
            GenerationOutcome::Empty { .. } | GenerationOutcome::TimedOut { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct AdapterRun {
    pub attempts: Vec<AttemptRecord>,
    pub outcome: GenerationOutcome,
}

#[derive(Debug, Clone, Copy)]
pub struct AttemptBudget {
    pub max_attempts: u32,
    pub timeout: Duration,
    /// Number assigned to the first attempt of this run.
    pub first_attempt: u32,
}

impl AttemptBudget {
    pub fn new(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            max_attempts,
            timeout,
            first_attempt: 1,
        }
    }

    pub fn starting_at(mut self, first_attempt: u32) -> Self {
        self.first_attempt = first_attempt.max(1);
        self
    }
}

enum Verdict {
    Accepted(String, ResponseMetadata),
    Empty(EmptyReason, ResponseMetadata),
    Invalid(ValidationCode, ResponseMetadata),
    TimedOut,
    Error(BackendError),
}

enum LastFailure {
    Empty(EmptyReason),
    Invalid(ValidationCode),
}

// ============================================================================
// Runner
// ============================================================================

/// Drives validation-aware attempts against one backend.
pub struct AdapterRunner {
    backend: Arc<dyn Backend>,
    validator: ContentValidator,
}

impl AdapterRunner {
    pub fn new(backend: Arc<dyn Backend>, validator: ContentValidator) -> Self {
        Self { backend, validator }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn classify(&self, adapter: &dyn GeneratorAdapter, response: BackendResponse) -> Verdict {
        let BackendResponse { content, metadata } = response;
        if let Some(code) = metadata.validation {
            return Verdict::Invalid(code, metadata);
        }
        match self.validator.validate(content.as_deref()) {
            Err(reason) => Verdict::Empty(reason, metadata),
            Ok(accepted) => match adapter.check_structure(accepted) {
                Some(code) => Verdict::Invalid(code, metadata),
                None => Verdict::Accepted(accepted.to_string(), metadata),
            },
        }
    }

    /// [`generate`](Self::generate), plus at most one extra attempt with
    /// `extended_timeout` when the run ended empty or timed out.
    pub async fn generate_with_recovery(
        &self,
        adapter: &dyn GeneratorAdapter,
        input: &PromptInput,
        budget: AttemptBudget,
        extended_timeout: Duration,
    ) -> AdapterRun {
        let run = self.generate(adapter, input, budget).await;
        self.recover(adapter, input, run, budget, extended_timeout).await
    }

    /// The orchestrator's retry layer: one fresh invocation with
    /// `extended_timeout` after a run that ended empty or timed out. Any
    /// other outcome is returned unchanged.
    pub async fn recover(
        &self,
        adapter: &dyn GeneratorAdapter,
        input: &PromptInput,
        mut run: AdapterRun,
        budget: AttemptBudget,
        extended_timeout: Duration,
    ) -> AdapterRun {
        if !run.outcome.wants_extended_retry() {
            return run;
        }

        let next = budget.first_attempt + run.attempts.len() as u32;
        tracing::warn!(
            kind = %adapter.kind(),
            model = %input.model,
            document = %input.document_id,
            attempt = next,
            timeout_secs = extended_timeout.as_secs_f64(),
            "Retrying with extended timeout"
        );
        let extra = self
            .generate(
                adapter,
                input,
                AttemptBudget::new(1, extended_timeout).starting_at(next),
            )
            .await;
        run.attempts.extend(extra.attempts);
        run.outcome = extra.outcome;
        run
    }

    pub async fn generate(
        &self,
        adapter: &dyn GeneratorAdapter,
        input: &PromptInput,
        budget: AttemptBudget,
    ) -> AdapterRun {
        let mut attempts = Vec::new();
        let mut augmentation: Option<ValidationCode> = None;
        let mut last_failure: Option<LastFailure> = None;

        for offset in 0..budget.max_attempts {
            let attempt = budget.first_attempt + offset;
            let mut request = InvokeRequest::new(
                input.model.clone(),
                adapter.build_prompt(input, augmentation),
                budget.timeout,
            );
            if let Some(system) = adapter.system_prompt() {
                request = request.with_system(system);
            }

            let started = Instant::now();
            let verdict = match tokio::time::timeout(budget.timeout, self.backend.invoke(&request)).await {
                Err(_) | Ok(Err(BackendError::Timeout(_))) => Verdict::TimedOut,
                Ok(Err(BackendError::Validation(code))) => {
                    Verdict::Invalid(code, ResponseMetadata::default())
                }
                Ok(Err(err)) => Verdict::Error(err),
                Ok(Ok(response)) => self.classify(adapter, response),
            };
            let duration = started.elapsed();

            let record = |status, detail: String, validation, metadata| AttemptRecord {
                attempt,
                status,
                detail,
                validation,
                metadata,
                duration,
                timeout: budget.timeout,
            };

            match verdict {
                Verdict::Accepted(content, metadata) => {
                    tracing::info!(
                        kind = %adapter.kind(),
                        model = %input.model,
                        document = %input.document_id,
                        attempt = attempt,
                        chars = content.chars().count(),
                        "Generation attempt accepted"
                    );
                    attempts.push(record(
                        AttemptStatus::Succeeded,
                        "content accepted".to_string(),
                        None,
                        metadata.clone(),
                    ));
                    return AdapterRun {
                        attempts,
                        outcome: GenerationOutcome::Content(GeneratedContent { content, metadata }),
                    };
                }
                Verdict::Empty(reason, metadata) => {
                    tracing::warn!(
                        kind = %adapter.kind(),
                        model = %input.model,
                        document = %input.document_id,
                        attempt = attempt,
                        reason = %reason,
                        "Backend produced no usable content"
                    );
                    attempts.push(record(
                        AttemptStatus::EmptyContent,
                        reason.to_string(),
                        None,
                        metadata,
                    ));
                    last_failure = Some(LastFailure::Empty(reason));
                }
                Verdict::Invalid(code, metadata) => {
                    tracing::warn!(
                        kind = %adapter.kind(),
                        model = %input.model,
                        document = %input.document_id,
                        attempt = attempt,
                        code = %code,
                        "Output failed structural validation"
                    );
                    attempts.push(record(
                        AttemptStatus::Errored,
                        format!("validation failed: {}", code),
                        Some(code),
                        metadata,
                    ));
                    if !code.is_retryable() {
                        return AdapterRun {
                            attempts,
                            outcome: GenerationOutcome::Failed(GenerationError::Fatal(format!(
                                "unrecoverable validation failure ({})",
                                code
                            ))),
                        };
                    }
                    augmentation = Some(code);
                    last_failure = Some(LastFailure::Invalid(code));
                }
                Verdict::TimedOut => {
                    tracing::warn!(
                        kind = %adapter.kind(),
                        model = %input.model,
                        document = %input.document_id,
                        attempt = attempt,
                        timeout_secs = budget.timeout.as_secs_f64(),
                        "Generation attempt timed out"
                    );
                    attempts.push(record(
                        AttemptStatus::TimedOut,
                        format!("timed out after {:?}", budget.timeout),
                        None,
                        ResponseMetadata::default(),
                    ));
                    return AdapterRun {
                        attempts,
                        outcome: GenerationOutcome::TimedOut {
                            after: budget.timeout,
                        },
                    };
                }
                Verdict::Error(err) => {
                    tracing::error!(
                        kind = %adapter.kind(),
                        model = %input.model,
                        document = %input.document_id,
                        attempt = attempt,
                        error = %err,
                        "Backend error"
                    );
                    attempts.push(record(
                        AttemptStatus::Errored,
                        err.to_string(),
                        None,
                        ResponseMetadata::default(),
                    ));
                    let error = if err.is_transient() {
                        GenerationError::TransientExhausted(err.to_string())
                    } else {
                        GenerationError::Fatal(err.to_string())
                    };
                    return AdapterRun {
                        attempts,
                        outcome: GenerationOutcome::Failed(error),
                    };
                }
            }
        }

        let made = attempts.len() as u32;
        let outcome = match last_failure {
            Some(LastFailure::Empty(reason)) => GenerationOutcome::Empty {
                reason: reason.to_string(),
            },
            Some(LastFailure::Invalid(code)) => GenerationOutcome::Failed(GenerationError::Exhausted {
                attempts: made,
                reason: format!("validation failed: {}", code),
            }),
            None => GenerationOutcome::Failed(GenerationError::Fatal(
                "attempt budget was zero".to_string(),
            )),
        };
        AdapterRun { attempts, outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend that replays a fixed script and records every prompt.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<BackendResponse, BackendError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<BackendResponse, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn invoke(&self, request: &InvokeRequest) -> Result<BackendResponse, BackendError> {
            self.prompts
                .lock()
                .expect("lock poisoned")
                .push(request.prompt.clone());
            self.script
                .lock()
                .expect("lock poisoned")
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Fatal("script exhausted".into())))
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl Backend for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }

        async fn invoke(&self, _request: &InvokeRequest) -> Result<BackendResponse, BackendError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(BackendResponse::text("late"))
        }
    }

    fn input() -> PromptInput {
        PromptInput {
            document_id: "doc-1".into(),
            document: "The original document.".into(),
            instructions: "Improve it.".into(),
            model: "model-a".into(),
        }
    }

    const GOOD: &str = "A sufficiently long generated document body.";

    fn runner(backend: Arc<dyn Backend>) -> AdapterRunner {
        AdapterRunner::new(backend, ContentValidator::new(20))
    }

    #[tokio::test]
    async fn test_empty_twice_then_success() {
        let backend = ScriptedBackend::new(vec![
            Ok(BackendResponse::text("")),
            Ok(BackendResponse::empty()),
            Ok(BackendResponse::text(GOOD)),
        ]);
        let run = runner(backend.clone())
            .generate(&TextTransformAdapter, &input(), AttemptBudget::new(3, Duration::from_secs(5)))
            .await;

        assert_eq!(run.attempts.len(), 3);
        assert_eq!(run.attempts[0].status, AttemptStatus::EmptyContent);
        assert_eq!(run.attempts[1].status, AttemptStatus::EmptyContent);
        assert_eq!(run.attempts[2].status, AttemptStatus::Succeeded);
        assert_eq!(
            run.attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        match run.outcome {
            GenerationOutcome::Content(generated) => assert_eq!(generated.content, GOOD),
            other => panic!("expected content, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_content_counts_as_empty() {
        let backend = ScriptedBackend::new(vec![
            Ok(BackendResponse::text("tiny")),
            Ok(BackendResponse::text("   tiny   ")),
        ]);
        let run = runner(backend)
            .generate(&TextTransformAdapter, &input(), AttemptBudget::new(2, Duration::from_secs(5)))
            .await;

        assert!(matches!(run.outcome, GenerationOutcome::Empty { .. }));
        assert!(run.outcome.wants_extended_retry());
        assert!(run
            .attempts
            .iter()
            .all(|a| a.status == AttemptStatus::EmptyContent));
    }

    #[tokio::test]
    async fn test_validation_code_selects_augmentation() {
        let backend = ScriptedBackend::new(vec![
            Err(BackendError::Validation(ValidationCode::MissingReasoning)),
            Ok(BackendResponse::text(format!("{}\n\nSources:\n[1] https://example.org", GOOD))),
        ]);
        let run = runner(backend.clone())
            .generate(&ResearchReportAdapter, &input(), AttemptBudget::new(3, Duration::from_secs(5)))
            .await;

        assert!(matches!(run.outcome, GenerationOutcome::Content(_)));
        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        let augmentation = ValidationCode::MissingReasoning
            .augmentation()
            .expect("retryable");
        assert!(!prompts[0].contains(augmentation));
        assert!(prompts[1].contains(augmentation));
        assert_eq!(run.attempts[0].validation, Some(ValidationCode::MissingReasoning));
    }

    #[tokio::test]
    async fn test_structure_check_drives_retry_and_exhausts() {
        let backend = ScriptedBackend::new(vec![
            Ok(BackendResponse::text(GOOD)),
            Ok(BackendResponse::text(GOOD)),
            Ok(BackendResponse::text(GOOD)),
        ]);
        let run = runner(backend.clone())
            .generate(&ResearchReportAdapter, &input(), AttemptBudget::new(3, Duration::from_secs(5)))
            .await;

        assert_eq!(run.attempts.len(), 3);
        assert!(run
            .attempts
            .iter()
            .all(|a| a.validation == Some(ValidationCode::MissingGrounding)));
        match run.outcome {
            GenerationOutcome::Failed(GenerationError::Exhausted { attempts, .. }) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert!(!backend.prompts()[2].is_empty());
    }

    #[tokio::test]
    async fn test_other_code_is_not_retried() {
        let backend = ScriptedBackend::new(vec![
            Ok(BackendResponse {
                content: Some(GOOD.into()),
                metadata: ResponseMetadata {
                    validation: Some(ValidationCode::Other),
                    ..Default::default()
                },
            }),
            Ok(BackendResponse::text(GOOD)),
        ]);
        let run = runner(backend.clone())
            .generate(&TextTransformAdapter, &input(), AttemptBudget::new(3, Duration::from_secs(5)))
            .await;

        assert_eq!(run.attempts.len(), 1);
        assert!(matches!(
            run.outcome,
            GenerationOutcome::Failed(GenerationError::Fatal(_))
        ));
        assert_eq!(backend.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_returns_immediately() {
        let run = runner(Arc::new(SlowBackend))
            .generate(
                &TextTransformAdapter,
                &input(),
                AttemptBudget::new(3, Duration::from_millis(50)),
            )
            .await;

        assert_eq!(run.attempts.len(), 1);
        assert_eq!(run.attempts[0].status, AttemptStatus::TimedOut);
        assert!(matches!(run.outcome, GenerationOutcome::TimedOut { .. }));
        assert!(run.outcome.wants_extended_retry());
    }

    #[tokio::test]
    async fn test_backend_error_is_terminal() {
        let backend = ScriptedBackend::new(vec![Err(BackendError::Http {
            status: 401,
            message: "unauthorized".into(),
        })]);
        let run = runner(backend)
            .generate(&TextTransformAdapter, &input(), AttemptBudget::new(3, Duration::from_secs(5)))
            .await;

        assert_eq!(run.attempts.len(), 1);
        assert_eq!(run.attempts[0].status, AttemptStatus::Errored);
        assert!(!run.outcome.wants_extended_retry());
        assert!(matches!(
            run.outcome,
            GenerationOutcome::Failed(GenerationError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_transient_error_after_transport_retries() {
        let backend = ScriptedBackend::new(vec![Err(BackendError::Http {
            status: 503,
            message: "service unavailable".into(),
        })]);
        let run = runner(backend)
            .generate(&TextTransformAdapter, &input(), AttemptBudget::new(3, Duration::from_secs(5)))
            .await;

        assert_eq!(run.attempts.len(), 1);
        match run.outcome {
            GenerationOutcome::Failed(GenerationError::TransientExhausted(message)) => {
                assert!(message.contains("503"))
            }
            other => panic!("expected transient exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_numbers_continue_from_budget() {
        let backend = ScriptedBackend::new(vec![Ok(BackendResponse::text(GOOD))]);
        let run = runner(backend)
            .generate(
                &TextTransformAdapter,
                &input(),
                AttemptBudget::new(1, Duration::from_secs(5)).starting_at(4),
            )
            .await;
        assert_eq!(run.attempts[0].attempt, 4);
    }

    #[tokio::test]
    async fn test_recovery_adds_one_extended_attempt() {
        let backend = ScriptedBackend::new(vec![
            Ok(BackendResponse::empty()),
            Ok(BackendResponse::empty()),
            Ok(BackendResponse::empty()),
            Ok(BackendResponse::text(GOOD)),
        ]);
        let run = runner(backend)
            .generate_with_recovery(
                &TextTransformAdapter,
                &input(),
                AttemptBudget::new(3, Duration::from_secs(1)),
                Duration::from_secs(2),
            )
            .await;

        assert_eq!(run.attempts.len(), 4);
        assert_eq!(run.attempts[3].attempt, 4);
        assert_eq!(run.attempts[3].timeout, Duration::from_secs(2));
        assert!(matches!(run.outcome, GenerationOutcome::Content(_)));
    }

    #[tokio::test]
    async fn test_recovery_gives_up_after_extra_attempt() {
        let backend = ScriptedBackend::new(vec![
            Ok(BackendResponse::empty()),
            Ok(BackendResponse::empty()),
        ]);
        let run = runner(backend)
            .generate_with_recovery(
                &TextTransformAdapter,
                &input(),
                AttemptBudget::new(1, Duration::from_secs(1)),
                Duration::from_secs(2),
            )
            .await;

        assert_eq!(run.attempts.len(), 2);
        assert!(matches!(run.outcome, GenerationOutcome::Empty { .. }));
    }

    #[test]
    fn test_deep_research_structure_codes() {
        let adapter = DeepResearchAdapter;
        assert_eq!(
            adapter.check_structure("plain text"),
            Some(ValidationCode::BothMissing)
        );
        assert_eq!(
            adapter.check_structure("See https://example.org for details."),
            Some(ValidationCode::MissingReasoning)
        );
        assert_eq!(
            adapter.check_structure("## Reasoning\nBecause."),
            Some(ValidationCode::MissingGrounding)
        );
        assert_eq!(
            adapter.check_structure("## Reasoning\nBecause [1].\n\n## Sources\n[1] a paper"),
            None
        );
    }

    #[test]
    fn test_adapter_for_matches_kind() {
        for kind in GeneratorKind::all() {
            assert_eq!(adapter_for(kind).kind(), kind);
        }
    }

    #[test]
    fn test_prompt_contains_document_and_instructions() {
        let prompt = TextTransformAdapter.build_prompt(&input(), None);
        assert!(prompt.starts_with("Improve it."));
        assert!(prompt.contains("The original document."));
    }
}
