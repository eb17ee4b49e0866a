//! Top-level run state machine.
//!
//! `PENDING -> RUNNING -> {COMPLETED, PARTIAL, FAILED, CANCELLED}`.
//!
//! One call to [`RunExecutor::execute`] drives a run through its phases:
//!
//! 1. **Generation**: the configuration is expanded into tasks (reusing
//!    intact artifacts), each launched through the [`ConcurrencyController`]
//!    lane of its kind and driven through the full adapter retry loop.
//! 2. **Single-doc evaluation**: starts for a document as soon as its task
//!    succeeds, overlapping with generation.
//! 3. **Pairwise evaluation**: waits on the [`InflightTracker`] gate, then
//!    compares every pair of eligible documents and feeds the Elo ranker.
//! 4. **Combine**: synthesizes the top-ranked documents.
//!
//! Completion is decided by counting expected against stored evaluation
//! records, not by trusting error propagation alone.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::future::join_all;
use ordered_float::OrderedFloat;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::combine::{
    select_inputs, BestOfN, Combine, CombineInput, CombineStrategy, Concatenate, IntelligentMerge,
};
use crate::error::{RunError, StoreError};
use crate::evaluation::single_doc::summary_score;
use crate::evaluation::{
    plan_pairs, select_top_n, EloRanker, EvalOutcome, Judge, PairwiseEvaluator, PairwiseOutcome,
    SingleDocEvaluator, SingleDocScore, Submission, BASE_RATING,
};
use crate::generation::{
    adapter_for, AdapterRunner, AttemptBudget, AttemptRecord, AttemptStatus, Backend,
    ContentValidator, GenerationOutcome, GeneratorKind, PromptInput,
};
use crate::metrics::RunMetrics;
use crate::progress::{NullSink, ProgressEvent, ProgressSink};
use crate::scheduler::{CancelToken, Cancelled, ConcurrencyController, InflightTracker};
use crate::store::RunStore;

use super::config::{CombineConfig, RunConfig, EVALUATED_BUCKET};
use super::model::{
    content_hash, document_id_for, CombinedSummary, GeneratedDocument, GenerationTask, Phase,
    RankedDocument, Run, RunStatus, RunSummary, TaskStatus,
};
use super::planner::{plan_run, resolve_documents, PlannedItem, SourceDocument};
use super::recorder::RunRecorder;

pub struct RunExecutor {
    store: Arc<dyn RunStore>,
    backends: HashMap<GeneratorKind, Arc<dyn Backend>>,
    judges: Vec<Arc<dyn Judge>>,
    sink: Arc<dyn ProgressSink>,
    metrics: Option<RunMetrics>,
    cancel: CancelToken,
}

impl RunExecutor {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            backends: HashMap::new(),
            judges: Vec::new(),
            sink: Arc::new(NullSink),
            metrics: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_backend(mut self, kind: GeneratorKind, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(kind, backend);
        self
    }

    /// Uses `backend` for every kind that has none yet.
    pub fn with_default_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        for kind in GeneratorKind::all() {
            self.backends
                .entry(kind)
                .or_insert_with(|| Arc::clone(&backend));
        }
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judges.push(judge);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: RunMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels runs driven by this executor.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> Option<&RunMetrics> {
        self.metrics.as_ref()
    }

    /// Executes `config` under a fresh run id.
    pub async fn execute(&self, config: &RunConfig) -> Result<Run, RunError> {
        self.execute_with_id(&Uuid::new_v4().to_string(), config)
            .await
    }

    /// Executes `config` as run `run_id` and returns the terminal run.
    ///
    /// Run-level precondition failures yield `Ok` with status `failed`.
    /// `Err` is returned only when the run itself cannot be persisted.
    pub async fn execute_with_id(&self, run_id: &str, config: &RunConfig) -> Result<Run, RunError> {
        let mut run = Run::new(run_id, config.fingerprint());
        self.store.create_run(&run).await?;
        let recorder = RunRecorder::new(run_id, Arc::clone(&self.store), Arc::clone(&self.sink));
        info!(run_id = run_id, fingerprint = %run.config_fingerprint, "Run created");

        let prepared = match self.prepare(config, &recorder).await {
            Ok(prepared) => prepared,
            Err(err) => {
                recorder
                    .phase(
                        Phase::Run,
                        format!("run rejected: {}", err),
                        false,
                        json!({ "error": err.to_string() }),
                    )
                    .await;
                recorder.add_error(err.to_string()).await;
                return self
                    .finish(&mut run, &recorder, RunStatus::Pending, RunStatus::Failed, None)
                    .await;
            }
        };

        self.store
            .transition_run(run_id, RunStatus::Pending, RunStatus::Running)
            .await?;
        run.status = RunStatus::Running;
        recorder
            .phase(
                Phase::Run,
                "run started",
                true,
                json!({
                    "fingerprint": run.config_fingerprint,
                    "documents": prepared.sources.len(),
                    "judges": prepared.judges.iter().map(|j| j.id().to_string()).collect::<Vec<_>>(),
                }),
            )
            .await;

        match self.drive(run_id, config, prepared, &recorder).await {
            Ok((status, summary)) => {
                self.finish(&mut run, &recorder, RunStatus::Running, status, Some(summary))
                    .await
            }
            Err(err) => {
                error!(run_id = run_id, error = %err, "Run aborted");
                recorder.add_error(format!("run aborted: {}", err)).await;
                recorder
                    .phase(Phase::Run, format!("run aborted: {}", err), false, json!({}))
                    .await;
                self.finish(&mut run, &recorder, RunStatus::Running, RunStatus::Failed, None)
                    .await
            }
        }
    }

    async fn prepare(&self, config: &RunConfig, recorder: &RunRecorder) -> Result<Prepared, RunError> {
        config.validate()?;

        let judges: Vec<Arc<dyn Judge>> = if config.evaluation.judges.is_empty() {
            self.judges.clone()
        } else {
            config
                .evaluation
                .judges
                .iter()
                .map(|id| {
                    self.judges
                        .iter()
                        .find(|judge| judge.id() == id)
                        .cloned()
                        .ok_or_else(|| RunError::Precondition(format!("no judge registered as '{}'", id)))
                })
                .collect::<Result<_, _>>()?
        };
        if judges.is_empty() {
            return Err(RunError::Precondition("at least one judge is required".to_string()));
        }

        let mut needed = config.kinds();
        if let Some(combine) = &config.combine {
            if combine.strategy == CombineStrategy::IntelligentMerge {
                needed.push(combine.merge_kind);
            }
        }
        if let Some(kind) = needed.iter().find(|kind| !self.backends.contains_key(kind)) {
            return Err(RunError::Precondition(format!("no backend configured for '{}'", kind)));
        }

        let (sources, rejected) = resolve_documents(config).await;
        for message in rejected {
            recorder.add_error(message).await;
        }
        if sources.is_empty() {
            return Err(RunError::NoDocuments);
        }

        Ok(Prepared { sources, judges })
    }

    async fn drive(
        &self,
        run_id: &str,
        config: &RunConfig,
        prepared: Prepared,
        recorder: &RunRecorder,
    ) -> Result<(RunStatus, RunSummary), StoreError> {
        let plan = plan_run(run_id, config, &prepared.sources, self.store.as_ref()).await?;

        let tracker = InflightTracker::new();
        for kind in GeneratorKind::all() {
            tracker.register(kind.as_str(), plan.count_for(kind));
        }
        tracker.register(EVALUATED_BUCKET, plan.items.len());

        let validator = ContentValidator::new(config.generation.min_content_length);
        let runners = self
            .backends
            .iter()
            .map(|(kind, backend)| (*kind, Arc::new(AdapterRunner::new(Arc::clone(backend), validator))))
            .collect();
        let judge_ids: Vec<String> = prepared.judges.iter().map(|j| j.id().to_string()).collect();

        let ctx = RunContext {
            run_id,
            config,
            recorder,
            store: self.store.as_ref(),
            metrics: self.metrics.as_ref(),
            cancel: &self.cancel,
            controller: ConcurrencyController::new(
                &config.concurrency.per_kind,
                std::time::Duration::from_millis(config.concurrency.stagger_ms),
                self.cancel.clone(),
            ),
            tracker,
            runners,
            single: SingleDocEvaluator::new(
                prepared.judges.clone(),
                config.evaluation.criteria.clone(),
                Arc::clone(&self.store),
            )
            .with_reevaluate(config.evaluation.reevaluate),
            pairwise: PairwiseEvaluator::new(prepared.judges, Arc::clone(&self.store))
                .with_reevaluate(config.evaluation.reevaluate),
            judge_ids,
            catalog: Mutex::new(BTreeMap::new()),
        };

        let planned = plan.items.len();
        let reused = plan.reuse_count();
        recorder.task_planned(planned).await;
        recorder
            .phase(
                Phase::Generation,
                "generation started",
                true,
                json!({ "tasks": plan.generate_count(), "reused": reused }),
            )
            .await;

        let generation = async {
            let outcomes = join_all(plan.items.into_iter().map(|item| ctx.run_item(item))).await;
            let tally = Tally::from_outcomes(&outcomes);
            recorder
                .phase(
                    Phase::Generation,
                    "generation finished",
                    tally.failed == 0 && tally.cancelled == 0,
                    json!({
                        "succeeded": tally.succeeded,
                        "failed": tally.failed,
                        "cancelled": tally.cancelled,
                        "reused": tally.reused,
                    }),
                )
                .await;
            tally
        };
        let (tally, pairwise) = tokio::join!(generation, ctx.pairwise_phase());
        let PairwiseReport {
            mut ranker,
            eligible,
            mut pairs,
            considered,
        } = pairwise;
        let late = ctx.late_documents(considered.as_ref());

        let mut ranking = ctx.ranking(&ranker, &eligible);
        let mut combined = None;
        let mut combine_failed = false;
        if let Some(combine) = &config.combine {
            if self.cancel.is_cancelled() {
                recorder
                    .phase(Phase::Combine, "combine skipped: run cancelled", false, json!({}))
                    .await;
            } else {
                match ctx.combine_phase(combine, &ranking, &eligible, &mut ranker).await {
                    Some((summary, comparisons)) => {
                        pairs.extend(comparisons);
                        ranking = ctx.ranking(&ranker, &eligible);
                        combined = Some(summary);
                    }
                    None => combine_failed = true,
                }
            }
        }

        let completeness = ctx.check_completeness(&pairs).await;
        let documents = ctx.catalog_len();
        let snapshot = recorder.snapshot().await;

        let status = if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if documents == 0 {
            recorder
                .add_error("no generation task produced a usable document")
                .await;
            RunStatus::Failed
        } else if completeness.missing.is_empty()
            && late.is_empty()
            && snapshot.errors.is_empty()
            && tally.failed == 0
            && !combine_failed
        {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };

        let mut missing = completeness.missing;
        missing.extend(late.iter().map(|id| {
            format!("pairwise comparisons for {}: generated after the pairwise gate opened", id)
        }));
        if combine_failed {
            missing.push("combined artifact".to_string());
        }
        let summary = RunSummary {
            tasks_planned: planned,
            tasks_reused: reused,
            tasks_succeeded: tally.succeeded,
            tasks_failed: tally.failed,
            tasks_cancelled: tally.cancelled,
            documents,
            single_scores_expected: completeness.single_expected,
            single_scores_recorded: completeness.single_recorded,
            pairwise_expected: completeness.pairwise_expected,
            pairwise_recorded: completeness.pairwise_recorded,
            cost_unknown_tasks: snapshot.cost_unknown_tasks,
            ranking,
            combined,
            missing,
        };
        Ok((status, summary))
    }

    async fn finish(
        &self,
        run: &mut Run,
        recorder: &RunRecorder,
        from: RunStatus,
        to: RunStatus,
        summary: Option<RunSummary>,
    ) -> Result<Run, RunError> {
        let detail = match &summary {
            Some(summary) => json!({
                "documents": summary.documents,
                "tasks_failed": summary.tasks_failed,
                "missing": summary.missing,
            }),
            None => json!({}),
        };
        recorder
            .phase(Phase::Run, format!("run {}", to), to == RunStatus::Completed, detail)
            .await;

        let snapshot = recorder.snapshot().await;
        run.total_cost_usd = snapshot.total_cost_usd;
        run.errors = snapshot.errors;
        run.summary = summary;
        run.updated_at = Utc::now();
        self.store.save_run(run).await?;
        self.store.transition_run(&run.id, from, to).await?;
        run.status = to;

        recorder.sink().publish(ProgressEvent::finished(&run.id, to));
        info!(
            run_id = %run.id,
            status = %to,
            errors = run.errors.len(),
            cost_usd = run.total_cost_usd,
            "Run finished"
        );
        Ok(run.clone())
    }
}

struct Prepared {
    sources: Vec<Arc<SourceDocument>>,
    judges: Vec<Arc<dyn Judge>>,
}

enum ItemOutcome {
    Reused,
    Finished(TaskStatus),
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    reused: usize,
}

impl Tally {
    fn from_outcomes(outcomes: &[ItemOutcome]) -> Self {
        let mut tally = Tally::default();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Reused => tally.reused += 1,
                ItemOutcome::Finished(TaskStatus::Succeeded) => tally.succeeded += 1,
                ItemOutcome::Finished(TaskStatus::Cancelled) => tally.cancelled += 1,
                ItemOutcome::Finished(_) => tally.failed += 1,
            }
        }
        tally
    }
}

/// A document available for evaluation in this run.
struct Candidate {
    document: Arc<GeneratedDocument>,
    kind: GeneratorKind,
    single_score: Option<f64>,
}

struct PairwiseReport {
    ranker: EloRanker,
    eligible: BTreeSet<String>,
    pairs: Vec<(String, String)>,
    /// Catalog at the moment the gate opened; `None` when pairwise did not run.
    considered: Option<BTreeSet<String>>,
}

impl PairwiseReport {
    fn skipped() -> Self {
        Self {
            ranker: EloRanker::new(),
            eligible: BTreeSet::new(),
            pairs: Vec::new(),
            considered: None,
        }
    }
}

#[derive(Debug, Default)]
struct Completeness {
    single_expected: usize,
    single_recorded: usize,
    pairwise_expected: usize,
    pairwise_recorded: usize,
    missing: Vec<String>,
}

/// Per-run state shared by every task of one execution.
struct RunContext<'a> {
    run_id: &'a str,
    config: &'a RunConfig,
    recorder: &'a RunRecorder,
    store: &'a dyn RunStore,
    metrics: Option<&'a RunMetrics>,
    cancel: &'a CancelToken,
    controller: ConcurrencyController,
    tracker: InflightTracker,
    runners: HashMap<GeneratorKind, Arc<AdapterRunner>>,
    single: SingleDocEvaluator,
    pairwise: PairwiseEvaluator,
    judge_ids: Vec<String>,
    catalog: Mutex<BTreeMap<String, Candidate>>,
}

impl RunContext<'_> {
    fn metric(&self, f: impl FnOnce(&RunMetrics)) {
        if let Some(metrics) = self.metrics {
            f(metrics);
        }
    }

    fn catalog(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Candidate>> {
        self.catalog.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn catalog_len(&self) -> usize {
        self.catalog().len()
    }

    fn complete_bucket(&self, name: &str) {
        if let Err(e) = self.tracker.complete(name) {
            warn!(run_id = self.run_id, bucket = name, error = %e, "Bucket completion not tracked");
        }
    }

    async fn run_item(&self, item: PlannedItem) -> ItemOutcome {
        let kind = item.kind();
        let (outcome, document) = match item {
            PlannedItem::Reuse { document, .. } => (ItemOutcome::Reused, Some(self.reuse(document).await)),
            PlannedItem::Generate { task, source } => {
                let (status, document) = self.generate(task, &source).await;
                (ItemOutcome::Finished(status), document)
            }
        };
        if let Some(document) = &document {
            self.admit(document, kind);
        }
        self.complete_bucket(kind.as_str());

        if let Some(document) = document {
            if self.cancel.is_cancelled() {
                self.evaluation_skipped(&document).await;
            } else {
                self.evaluate_document(document).await;
            }
        }
        self.complete_bucket(EVALUATED_BUCKET);
        outcome
    }

    /// Makes a document visible to the pairwise and combine phases. Its
    /// single-doc score is filled in once evaluation finishes.
    fn admit(&self, document: &Arc<GeneratedDocument>, kind: GeneratorKind) {
        self.catalog().insert(
            document.id.clone(),
            Candidate {
                document: Arc::clone(document),
                kind,
                single_score: None,
            },
        );
    }

    /// Documents admitted after the pairwise gate opened.
    fn late_documents(&self, considered: Option<&BTreeSet<String>>) -> Vec<String> {
        let Some(considered) = considered else {
            return Vec::new();
        };
        let late: Vec<String> = self
            .catalog()
            .keys()
            .filter(|id| !considered.contains(*id))
            .cloned()
            .collect();
        if !late.is_empty() {
            warn!(
                run_id = self.run_id,
                documents = ?late,
                "Documents arrived after the pairwise gate opened"
            );
        }
        late
    }

    async fn reuse(&self, document: GeneratedDocument) -> Arc<GeneratedDocument> {
        self.recorder
            .event(
                Phase::Generation,
                format!(
                    "reused {} for {} / {} [{} #{}]",
                    document.id, document.model, document.source_document_id, document.kind, document.iteration
                ),
                true,
                None,
                json!({
                    "document_id": document.id,
                    "task_key": document.task_key,
                    "origin_run": document.run_id,
                }),
            )
            .await;
        self.recorder.task_reused().await;
        Arc::new(document)
    }

    async fn generate(
        &self,
        mut task: GenerationTask,
        source: &SourceDocument,
    ) -> (TaskStatus, Option<Arc<GeneratedDocument>>) {
        let label = task.label();
        task.status = TaskStatus::Pending;
        task.updated_at = Utc::now();
        self.save_task(&task).await;

        let Some(runner) = self.runners.get(&task.kind).cloned() else {
            task.status = TaskStatus::Failed;
            task.error = Some(format!("{}: no backend for kind", label));
            self.terminal_event(&task, "no backend").await;
            self.finish_task(&task).await;
            return (task.status, None);
        };
        let adapter = adapter_for(task.kind);
        let input = PromptInput {
            document_id: source.id.clone(),
            document: source.content.clone(),
            instructions: self.config.instructions.clone(),
            model: task.model.clone(),
        };
        let settings = &self.config.generation;
        let budget = AttemptBudget::new(settings.validation_retries, settings.timeout());
        let kind = task.kind;

        let launched = self
            .controller
            .run(kind, async {
                self.metric(|m| m.set_in_flight(kind.as_str(), self.controller.in_flight(kind)));
                let mut live = task.clone();
                live.status = TaskStatus::Running;
                self.save_interim(&mut live).await;

                let run = runner.generate(adapter.as_ref(), &input, budget).await;
                if !run.outcome.wants_extended_retry() {
                    return run;
                }
                if let Some(status) = interim_status(&run.outcome) {
                    live.status = status;
                    live.attempts = run.attempts.clone();
                    self.save_interim(&mut live).await;
                    self.recorder
                        .event(
                            Phase::Generation,
                            format!("{} {}; retrying with extended timeout", label, status),
                            false,
                            Some(&live.id),
                            json!({
                                "model": live.model,
                                "kind": live.kind,
                                "document_id": live.document_id,
                                "task_status": status,
                                "attempts": live.attempt_count(),
                                "timeout_ms": settings.extended_timeout().as_millis() as u64,
                            }),
                        )
                        .await;
                }
                live.status = TaskStatus::Running;
                self.save_interim(&mut live).await;
                runner
                    .recover(adapter.as_ref(), &input, run, budget, settings.extended_timeout())
                    .await
            })
            .await;
        self.metric(|m| m.set_in_flight(kind.as_str(), self.controller.in_flight(kind)));

        let run = match launched {
            Ok(run) => run,
            Err(Cancelled) => {
                task.status = TaskStatus::Cancelled;
                task.error = Some(format!("{}: cancelled before launch", label));
                self.terminal_event(&task, "cancelled before launch").await;
                self.finish_task(&task).await;
                return (task.status, None);
            }
        };

        task.attempts = run.attempts;
        task.duration_ms = Some(task.attempts.iter().map(|a| a.duration.as_millis() as u64).sum());
        self.account_cost(&mut task).await;
        let attempts = task.attempt_count();
        let interim = interim_status(&run.outcome);

        let (document, failure) = match run.outcome {
            GenerationOutcome::Content(generated) => {
                let hash = content_hash(&generated.content);
                let document = GeneratedDocument {
                    id: document_id_for(&task.task_key, &hash),
                    run_id: task.run_id.clone(),
                    task_id: task.id.clone(),
                    task_key: task.task_key.clone(),
                    source_document_id: task.document_id.clone(),
                    model: task.model.clone(),
                    kind: task.kind,
                    iteration: task.iteration,
                    content: generated.content,
                    content_hash: hash,
                    created_at: Utc::now(),
                };
                match self.store.save_document(&document).await {
                    Ok(()) => (Some(Arc::new(document)), None),
                    Err(e) => (None, Some(format!("{}: content could not be stored: {}", label, e))),
                }
            }
            GenerationOutcome::Empty { reason } => (
                None,
                Some(format!("{}: no usable content after {} attempts ({})", label, attempts, reason)),
            ),
            GenerationOutcome::TimedOut { after } => (
                None,
                Some(format!(
                    "{}: timed out after {:.0}s on attempt {}",
                    label,
                    after.as_secs_f64(),
                    attempts
                )),
            ),
            GenerationOutcome::Failed(err) => (None, Some(format!("{}: {}", label, err))),
        };

        if document.is_none() {
            task.status = interim.unwrap_or(TaskStatus::Errored);
            self.save_interim(&mut task).await;
        }
        task.status = if document.is_some() {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        task.output_document_id = document.as_ref().map(|d| d.id.clone());
        task.error = failure.clone();

        self.attempt_events(&task).await;
        if let Some(message) = failure {
            self.recorder.add_error(message).await;
        }
        self.finish_task(&task).await;
        (task.status, document)
    }

    /// One event per attempt; the last one also carries the task's terminal
    /// status.
    async fn attempt_events(&self, task: &GenerationTask) {
        if task.attempts.is_empty() {
            self.terminal_event(task, "no attempts made").await;
            return;
        }
        let last = task.attempts.len();
        for (index, attempt) in task.attempts.iter().enumerate() {
            self.metric(|m| m.record_attempt(task.kind.as_str(), attempt.status.as_str()));
            let terminal = index + 1 == last;
            let description = if terminal {
                format!(
                    "{} attempt {} {}; task {}",
                    task.label(),
                    attempt.attempt,
                    attempt.status.as_str(),
                    task.status
                )
            } else {
                format!("{} attempt {} {}", task.label(), attempt.attempt, attempt.status.as_str())
            };
            let success = attempt.status == AttemptStatus::Succeeded
                && (!terminal || task.status == TaskStatus::Succeeded);
            self.recorder
                .event(
                    Phase::Generation,
                    description,
                    success,
                    Some(&task.id),
                    attempt_detail(task, attempt, terminal),
                )
                .await;
        }
    }

    async fn terminal_event(&self, task: &GenerationTask, reason: &str) {
        self.recorder
            .event(
                Phase::Generation,
                format!("{} {}; task {}", task.label(), reason, task.status),
                task.status == TaskStatus::Succeeded,
                Some(&task.id),
                json!({
                    "model": task.model,
                    "kind": task.kind,
                    "document_id": task.document_id,
                    "task_status": task.status,
                    "error": task.error,
                }),
            )
            .await;
    }

    /// Resolves per-attempt cost. Attempts that reported nothing and cannot
    /// be priced leave the task's cost unknown.
    async fn account_cost(&self, task: &mut GenerationTask) {
        let (known, unknown) = attempts_cost(&task.attempts, &task.model, self.config);
        task.input_tokens = task.attempts.iter().filter_map(|a| a.metadata.input_tokens).reduce(|x, y| x + y);
        task.output_tokens = task.attempts.iter().filter_map(|a| a.metadata.output_tokens).reduce(|x, y| x + y);
        task.cost_usd = (!unknown).then_some(known);
        self.recorder.add_cost(known, unknown).await;
        self.metric(|m| m.add_cost(known));
    }

    async fn save_interim(&self, task: &mut GenerationTask) {
        task.updated_at = Utc::now();
        self.save_task(task).await;
    }

    async fn save_task(&self, task: &GenerationTask) {
        if let Err(e) = self.store.save_task(task).await {
            self.recorder
                .add_error(format!("{}: task state not stored: {}", task.label(), e))
                .await;
        }
    }

    async fn finish_task(&self, task: &GenerationTask) {
        let mut task = task.clone();
        task.updated_at = Utc::now();
        self.save_task(&task).await;
        self.recorder.task_finished(&task).await;
        let seconds = task.duration_ms.unwrap_or(0) as f64 / 1000.0;
        self.metric(|m| m.record_task(task.kind.as_str(), task.status.as_str(), seconds));
        info!(
            run_id = self.run_id,
            task_id = %task.id,
            model = %task.model,
            kind = %task.kind,
            status = %task.status,
            attempts = task.attempt_count(),
            "Task finished"
        );
    }

    async fn evaluation_skipped(&self, document: &GeneratedDocument) {
        let task_id = (document.run_id == self.run_id).then_some(document.task_id.as_str());
        self.recorder
            .event(
                Phase::SingleEval,
                format!("{} not evaluated: run cancelled", document.id),
                false,
                task_id,
                json!({ "document_id": document.id, "skipped": true }),
            )
            .await;
    }

    async fn evaluate_document(&self, document: Arc<GeneratedDocument>) {
        let outcomes = self
            .single
            .evaluate(self.run_id, Submission::new(&document.id, &document.content))
            .await;
        let task_id = (document.run_id == self.run_id).then_some(document.task_id.as_str());

        let mut records: Vec<SingleDocScore> = Vec::new();
        for outcome in outcomes {
            let (judge, success) = match &outcome {
                EvalOutcome::Recorded(score) | EvalOutcome::Reused(score) => {
                    let reused = matches!(outcome, EvalOutcome::Reused(_));
                    self.recorder
                        .event(
                            Phase::SingleEval,
                            format!("{} scored {:.2} by {}", document.id, score.average, score.judge),
                            true,
                            task_id,
                            json!({
                                "document_id": document.id,
                                "judge": score.judge,
                                "scores": score.scores,
                                "average": score.average,
                                "reused": reused,
                            }),
                        )
                        .await;
                    self.metric(|m| {
                        m.record_evaluation("single", if reused { "reused" } else { "recorded" })
                    });
                    records.push(score.clone());
                    (score.judge.clone(), true)
                }
                EvalOutcome::Failed { judge, error } => {
                    self.recorder
                        .event(
                            Phase::SingleEval,
                            format!("{} not scored by {}", document.id, judge),
                            false,
                            task_id,
                            json!({ "document_id": document.id, "judge": judge, "error": error }),
                        )
                        .await;
                    self.recorder
                        .add_error(format!(
                            "single-doc evaluation of {} ({} / {}) by {} failed: {}",
                            document.id, document.model, document.source_document_id, judge, error
                        ))
                        .await;
                    self.metric(|m| m.record_evaluation("single", "failed"));
                    (judge.clone(), false)
                }
            };
            self.recorder
                .evaluation_finished(Phase::SingleEval, &document.id, &judge, success)
                .await;
        }

        let single_score = summary_score(&records);
        if let Some(candidate) = self.catalog().get_mut(&document.id) {
            candidate.single_score = single_score;
        }
    }

    async fn pairwise_phase(&self) -> PairwiseReport {
        let gate = self.config.pairwise_gate();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.recorder
                    .phase(Phase::Run, "cancellation observed; no further launches", false, json!({}))
                    .await;
                return PairwiseReport::skipped();
            }
            waited = self.tracker.wait_all(&gate) => {
                if let Err(e) = waited {
                    self.recorder.add_error(format!("pairwise gate failed: {}", e)).await;
                    return PairwiseReport::skipped();
                }
            }
        }

        let settings = &self.config.evaluation.pairwise;
        if !settings.enabled {
            self.recorder
                .phase(Phase::Pairwise, "pairwise evaluation disabled", true, json!({}))
                .await;
            return PairwiseReport::skipped();
        }

        let (scored, documents): (Vec<(String, Option<f64>)>, HashMap<String, Arc<GeneratedDocument>>) = {
            let catalog = self.catalog();
            (
                catalog
                    .values()
                    .map(|c| (c.document.id.clone(), c.single_score))
                    .collect(),
                catalog
                    .values()
                    .map(|c| (c.document.id.clone(), Arc::clone(&c.document)))
                    .collect(),
            )
        };
        let eligible: BTreeSet<String> = select_top_n(&scored, settings.top_n).into_iter().collect();
        let eligible_ids: Vec<String> = eligible.iter().cloned().collect();
        let pairs = plan_pairs(&eligible_ids);

        self.recorder
            .phase(
                Phase::Pairwise,
                format!("pairwise evaluation started over {} documents", eligible.len()),
                true,
                json!({ "gate": gate, "eligible": eligible_ids, "pairs": pairs.len() }),
            )
            .await;

        let outcomes = self.compare_pairs(&pairs, &documents).await;
        let mut ranker = EloRanker::new();
        for id in &eligible {
            ranker.register(id);
        }
        apply_sorted(&mut ranker, outcomes);

        self.recorder
            .phase(
                Phase::Pairwise,
                "pairwise evaluation finished",
                true,
                json!({ "ranking": ranker.ranking().iter().map(|(id, r)| json!({"document_id": id, "rating": r.rating})).collect::<Vec<_>>() }),
            )
            .await;

        PairwiseReport {
            ranker,
            eligible,
            pairs,
            considered: Some(documents.into_keys().collect()),
        }
    }

    /// Runs every pair with every judge, bounded by the evaluation
    /// concurrency, and returns the stored outcomes.
    async fn compare_pairs(
        &self,
        pairs: &[(String, String)],
        documents: &HashMap<String, Arc<GeneratedDocument>>,
    ) -> Vec<PairwiseOutcome> {
        let limit = self.config.concurrency.evaluation.max(1);
        let batches: Vec<Vec<PairwiseOutcome>> = stream::iter(pairs.iter())
            .map(|(a, b)| async move {
                if self.cancel.is_cancelled() {
                    return Vec::new();
                }
                let (Some(doc_a), Some(doc_b)) = (documents.get(a), documents.get(b)) else {
                    self.recorder
                        .add_error(format!("pairwise {} vs {}: document not available", a, b))
                        .await;
                    return Vec::new();
                };
                let outcomes = self
                    .pairwise
                    .compare(
                        self.run_id,
                        Submission::new(&doc_a.id, &doc_a.content),
                        Submission::new(&doc_b.id, &doc_b.content),
                    )
                    .await;
                self.record_pairwise(a, b, outcomes).await
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        batches.into_iter().flatten().collect()
    }

    async fn record_pairwise(
        &self,
        a: &str,
        b: &str,
        outcomes: Vec<EvalOutcome<PairwiseOutcome>>,
    ) -> Vec<PairwiseOutcome> {
        let subject = format!("{} vs {}", a, b);
        let mut recorded = Vec::new();
        for outcome in outcomes {
            let (judge, success) = match outcome {
                EvalOutcome::Recorded(result) | EvalOutcome::Reused(result) => {
                    self.recorder
                        .event(
                            Phase::Pairwise,
                            format!("{}: {} by {}", subject, result.winner, result.judge),
                            true,
                            None,
                            json!({
                                "document_a": result.document_a,
                                "document_b": result.document_b,
                                "judge": result.judge,
                                "winner": result.winner,
                                "confidence": result.confidence,
                            }),
                        )
                        .await;
                    self.metric(|m| m.record_evaluation("pairwise", "recorded"));
                    let judge = result.judge.clone();
                    recorded.push(result);
                    (judge, true)
                }
                EvalOutcome::Failed { judge, error } => {
                    self.recorder
                        .event(
                            Phase::Pairwise,
                            format!("{}: not judged by {}", subject, judge),
                            false,
                            None,
                            json!({ "document_a": a, "document_b": b, "judge": judge, "error": error }),
                        )
                        .await;
                    self.recorder
                        .add_error(format!("pairwise {} by {} failed: {}", subject, judge, error))
                        .await;
                    self.metric(|m| m.record_evaluation("pairwise", "failed"));
                    (judge, false)
                }
            };
            self.recorder
                .evaluation_finished(Phase::Pairwise, &subject, &judge, success)
                .await;
        }
        recorded
    }

    fn ranking(&self, ranker: &EloRanker, eligible: &BTreeSet<String>) -> Vec<RankedDocument> {
        rank_candidates(self.catalog().values(), ranker, eligible)
    }

    /// Returns the combined summary and any comparison pairs that became
    /// expected, or `None` when no combined artifact was produced.
    async fn combine_phase(
        &self,
        combine: &CombineConfig,
        ranking: &[RankedDocument],
        eligible: &BTreeSet<String>,
        ranker: &mut EloRanker,
    ) -> Option<(CombinedSummary, Vec<(String, String)>)> {
        let candidates: Vec<CombineInput> = {
            let catalog = self.catalog();
            ranking
                .iter()
                .filter_map(|ranked| {
                    let candidate = catalog.get(&ranked.document_id)?;
                    Some(CombineInput {
                        document_id: ranked.document_id.clone(),
                        model: ranked.model.clone(),
                        content: candidate.document.content.clone(),
                        rating: eligible.contains(&ranked.document_id).then_some(ranked.rating),
                        single_score: ranked.single_score,
                    })
                })
                .collect()
        };
        let selected = select_inputs(candidates, combine.selection, combine.top_k);
        let selected_ids: Vec<String> = selected.iter().map(|i| i.document_id.clone()).collect();
        self.recorder
            .phase(
                Phase::Combine,
                format!("combine ({}) started", combine.strategy),
                true,
                json!({ "inputs": selected_ids, "selection": combine.selection }),
            )
            .await;

        let combiner: Box<dyn Combine> = match combine.strategy {
            CombineStrategy::Concatenate => Box::new(Concatenate {
                separator: combine.separator.clone(),
                table_of_contents: combine.table_of_contents,
            }),
            CombineStrategy::BestOfN => Box::new(BestOfN {
                rule: combine.selection,
            }),
            CombineStrategy::IntelligentMerge => {
                let settings = &self.config.generation;
                let (Some(runner), Some(model)) =
                    (self.runners.get(&combine.merge_kind), combine.merge_model.as_ref())
                else {
                    self.combine_failed(combine, "merge backend or model not configured").await;
                    return None;
                };
                Box::new(IntelligentMerge::new(
                    Arc::clone(runner),
                    combine.merge_kind,
                    model.clone(),
                    self.config.instructions.clone(),
                    AttemptBudget::new(settings.validation_retries, settings.timeout()),
                    settings.extended_timeout(),
                ))
            }
        };

        let combined = match combiner.combine(&selected).await {
            Ok(combined) => combined,
            Err(e) => {
                self.combine_failed(combine, &e.to_string()).await;
                return None;
            }
        };

        let model = combine
            .merge_model
            .clone()
            .filter(|_| combine.strategy == CombineStrategy::IntelligentMerge)
            .unwrap_or_else(|| combine.strategy.as_str().to_string());
        if !combined.attempts.is_empty() {
            let (known, unknown) = attempts_cost(&combined.attempts, &model, self.config);
            self.recorder.add_cost(known, unknown).await;
            self.metric(|m| m.add_cost(known));
        }

        let hash = content_hash(&combined.content);
        let key = content_hash(
            &json!({ "strategy": combine.strategy, "inputs": combined.inputs, "content": hash }).to_string(),
        );
        let document = GeneratedDocument {
            id: format!("cmb-{}", &key[..16]),
            run_id: self.run_id.to_string(),
            task_id: format!("{}-combine", self.run_id),
            task_key: key,
            source_document_id: combined.inputs.join("+"),
            model,
            kind: combined_kind(combine, &combined.inputs, ranking),
            iteration: 1,
            content: combined.content,
            content_hash: hash,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.save_document(&document).await {
            self.combine_failed(combine, &format!("combined artifact not stored: {}", e))
                .await;
            return None;
        }
        self.recorder
            .phase(
                Phase::Combine,
                format!("combined {} documents into {}", combined.inputs.len(), document.id),
                true,
                json!({
                    "document_id": document.id,
                    "inputs": combined.inputs,
                    "attempts": combined.attempts.len(),
                }),
            )
            .await;

        let mut comparisons = Vec::new();
        let mut rating = None;
        if combine.evaluate_against_originals {
            let mut documents: HashMap<String, Arc<GeneratedDocument>> = {
                let catalog = self.catalog();
                combined
                    .inputs
                    .iter()
                    .filter_map(|id| catalog.get(id).map(|c| (id.clone(), Arc::clone(&c.document))))
                    .collect()
            };
            let combined_id = document.id.clone();
            documents.insert(combined_id.clone(), Arc::new(document.clone()));
            comparisons = combined
                .inputs
                .iter()
                .map(|id| {
                    if *id <= combined_id {
                        (id.clone(), combined_id.clone())
                    } else {
                        (combined_id.clone(), id.clone())
                    }
                })
                .collect();
            let outcomes = self.compare_pairs(&comparisons, &documents).await;
            ranker.register(&combined_id);
            apply_sorted(ranker, outcomes);
            rating = ranker.rating(&combined_id).map(|r| r.rating);
        }

        Some((
            CombinedSummary {
                strategy: combine.strategy.as_str().to_string(),
                document_id: document.id,
                inputs: combined.inputs,
                rating,
            },
            comparisons,
        ))
    }

    async fn combine_failed(&self, combine: &CombineConfig, reason: &str) {
        self.recorder
            .add_error(format!("combine ({}) failed: {}", combine.strategy, reason))
            .await;
        self.recorder
            .phase(
                Phase::Combine,
                format!("combine ({}) failed", combine.strategy),
                false,
                json!({ "error": reason }),
            )
            .await;
    }

    /// Counts stored records against what this run expects.
    async fn check_completeness(&self, pairs: &[(String, String)]) -> Completeness {
        let document_ids: Vec<String> = self.catalog().keys().cloned().collect();
        let mut report = Completeness::default();

        for id in &document_ids {
            for judge in &self.judge_ids {
                report.single_expected += 1;
                match self.store.find_single_score(id, judge).await {
                    Ok(Some(_)) => report.single_recorded += 1,
                    Ok(None) => report.missing.push(format!("single-doc score for {} by {}", id, judge)),
                    Err(e) => report
                        .missing
                        .push(format!("single-doc score for {} by {} (unverifiable: {})", id, judge, e)),
                }
            }
        }

        for (a, b) in pairs {
            for judge in &self.judge_ids {
                report.pairwise_expected += 1;
                match self.store.find_pairwise(a, b, judge).await {
                    Ok(Some(_)) => report.pairwise_recorded += 1,
                    Ok(None) => report
                        .missing
                        .push(format!("pairwise {} vs {} by {}", a, b, judge)),
                    Err(e) => report.missing.push(format!(
                        "pairwise {} vs {} by {} (unverifiable: {})",
                        a, b, judge, e
                    )),
                }
            }
        }

        if !report.missing.is_empty() {
            warn!(
                run_id = self.run_id,
                missing = report.missing.len(),
                "Run is missing expected evaluation records"
            );
        }
        report
    }
}

/// Applies outcomes in `(document_a, document_b, judge)` order so ratings
/// do not depend on completion order.
fn apply_sorted(ranker: &mut EloRanker, mut outcomes: Vec<PairwiseOutcome>) {
    outcomes.sort_by(|x, y| {
        (&x.document_a, &x.document_b, &x.judge).cmp(&(&y.document_a, &y.document_b, &y.judge))
    });
    for outcome in &outcomes {
        ranker.apply(outcome);
    }
}

/// Every candidate, pairwise-rated ones first by rating, then the rest
/// by single-doc score. Ties go to the lower id.
fn rank_candidates<'c>(
    candidates: impl IntoIterator<Item = &'c Candidate>,
    ranker: &EloRanker,
    eligible: &BTreeSet<String>,
) -> Vec<RankedDocument> {
    let mut ranked: Vec<(bool, RankedDocument)> = candidates
        .into_iter()
        .map(|candidate| {
            let id = &candidate.document.id;
            let rating = ranker.rating(id);
            (
                eligible.contains(id),
                RankedDocument {
                    document_id: id.clone(),
                    model: candidate.document.model.clone(),
                    kind: candidate.kind,
                    rating: rating.map(|r| r.rating).unwrap_or(BASE_RATING),
                    games: rating.map(|r| r.games).unwrap_or(0),
                    single_score: candidate.single_score,
                },
            )
        })
        .collect();
    ranked.sort_by(|(rated_a, a), (rated_b, b)| {
        rated_b
            .cmp(rated_a)
            .then_with(|| OrderedFloat(b.rating).cmp(&OrderedFloat(a.rating)))
            .then_with(|| {
                OrderedFloat(b.single_score.unwrap_or(f64::MIN))
                    .cmp(&OrderedFloat(a.single_score.unwrap_or(f64::MIN)))
            })
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    ranked.into_iter().map(|(_, doc)| doc).collect()
}

/// Task status to persist when an adapter run ends without content.
fn interim_status(outcome: &GenerationOutcome) -> Option<TaskStatus> {
    match outcome {
        GenerationOutcome::Content(_) => None,
        GenerationOutcome::Empty { .. } => Some(TaskStatus::EmptyContent),
        GenerationOutcome::TimedOut { .. } => Some(TaskStatus::TimedOut),
        GenerationOutcome::Failed(_) => Some(TaskStatus::Errored),
    }
}

/// A merge is produced by the merge kind; concatenation and best-of-n keep
/// the kind of their leading input.
fn combined_kind(combine: &CombineConfig, inputs: &[String], ranking: &[RankedDocument]) -> GeneratorKind {
    if combine.strategy == CombineStrategy::IntelligentMerge {
        return combine.merge_kind;
    }
    inputs
        .first()
        .and_then(|id| ranking.iter().find(|ranked| &ranked.document_id == id))
        .map(|ranked| ranked.kind)
        .unwrap_or(combine.merge_kind)
}

/// Known cost of `attempts` and whether any part of it is unknown.
fn attempts_cost(attempts: &[AttemptRecord], model: &str, config: &RunConfig) -> (f64, bool) {
    let mut known = 0.0;
    let mut unknown = false;
    for attempt in attempts {
        let meta = &attempt.metadata;
        match config
            .pricing
            .resolve(model, meta.cost_usd, meta.input_tokens, meta.output_tokens)
        {
            Some(cost) => known += cost,
            None => unknown = true,
        }
    }
    (known, unknown)
}

fn attempt_detail(task: &GenerationTask, attempt: &AttemptRecord, terminal: bool) -> serde_json::Value {
    json!({
        "model": task.model,
        "kind": task.kind,
        "document_id": task.document_id,
        "attempt": attempt.attempt,
        "status": attempt.status,
        "detail": attempt.detail,
        "validation": attempt.validation,
        "duration_ms": attempt.duration.as_millis() as u64,
        "timeout_ms": attempt.timeout.as_millis() as u64,
        "task_status": terminal.then_some(task.status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Winner;
    use crate::generation::ResponseMetadata;
    use crate::llm::ModelPricing;
    use std::time::Duration;

    fn config() -> RunConfig {
        RunConfig::from_yaml_str(
            r#"
documents:
  - id: intro
    content: "Some source text."
instructions: "Rewrite."
generators:
  - kind: text-transform
    models: [m]
"#,
        )
        .expect("config")
    }

    fn attempt(cost: Option<f64>, tokens: Option<(u64, u64)>) -> AttemptRecord {
        AttemptRecord {
            attempt: 1,
            status: AttemptStatus::Succeeded,
            detail: String::new(),
            validation: None,
            metadata: ResponseMetadata {
                input_tokens: tokens.map(|t| t.0),
                output_tokens: tokens.map(|t| t.1),
                cost_usd: cost,
                validation: None,
            },
            duration: Duration::from_millis(5),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_cost_known_reported_and_estimated() {
        let mut config = config();
        config.pricing = config.pricing.with_model("m", ModelPricing::new(1.0, 2.0));

        let (known, unknown) = attempts_cost(
            &[attempt(Some(0.5), None), attempt(None, Some((1_000_000, 1_000_000)))],
            "m",
            &config,
        );
        assert!((known - 3.5).abs() < 1e-9);
        assert!(!unknown);
    }

    #[test]
    fn test_cost_unknown_is_flagged() {
        let (known, unknown) = attempts_cost(&[attempt(Some(0.25), None), attempt(None, None)], "m", &config());
        assert!((known - 0.25).abs() < 1e-9);
        assert!(unknown);
    }

    #[test]
    fn test_apply_sorted_is_order_independent() {
        let outcome = |a: &str, b: &str, judge: &str, winner| PairwiseOutcome {
            document_a: a.to_string(),
            document_b: b.to_string(),
            judge: judge.to_string(),
            run_id: "r".to_string(),
            winner,
            confidence: 1.0,
            reason: None,
            created_at: Utc::now(),
        };
        let outcomes = vec![
            outcome("a", "b", "j1", Winner::A),
            outcome("b", "c", "j1", Winner::B),
            outcome("a", "c", "j1", Winner::Tie),
        ];
        let mut reversed = outcomes.clone();
        reversed.reverse();

        let mut first = EloRanker::new();
        apply_sorted(&mut first, outcomes);
        let mut second = EloRanker::new();
        apply_sorted(&mut second, reversed);
        assert_eq!(first.ranking(), second.ranking());
    }

    fn candidate(id: &str, kind: GeneratorKind, single_score: Option<f64>) -> Candidate {
        Candidate {
            document: Arc::new(GeneratedDocument {
                id: id.to_string(),
                run_id: "r".to_string(),
                task_id: format!("task-{}", id),
                task_key: format!("key-{}", id),
                source_document_id: "intro".to_string(),
                model: "m".to_string(),
                kind,
                iteration: 1,
                content: format!("content of {}", id),
                content_hash: content_hash(id),
                created_at: Utc::now(),
            }),
            kind,
            single_score,
        }
    }

    fn win(a: &str, b: &str) -> PairwiseOutcome {
        PairwiseOutcome {
            document_a: a.to_string(),
            document_b: b.to_string(),
            judge: "j1".to_string(),
            run_id: "r".to_string(),
            winner: Winner::A,
            confidence: 1.0,
            reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_ranking_puts_rated_documents_first() {
        let candidates = vec![
            candidate("a", GeneratorKind::TextTransform, Some(9.0)),
            candidate("b", GeneratorKind::TextTransform, Some(5.0)),
            candidate("c", GeneratorKind::TextTransform, Some(4.0)),
            candidate("d", GeneratorKind::TextTransform, None),
            candidate("e", GeneratorKind::TextTransform, Some(6.0)),
        ];
        let eligible: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        let mut ranker = EloRanker::new();
        ranker.register("b");
        ranker.register("c");
        ranker.apply(&win("c", "b"));

        let ranking = rank_candidates(&candidates, &ranker, &eligible);
        let ids: Vec<&str> = ranking.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a", "e", "d"]);
        assert!(ranking[0].rating > BASE_RATING);
        assert_eq!(ranking[0].games, 1);
        assert_eq!(ranking[2].rating, BASE_RATING);
        assert_eq!(ranking[2].games, 0);
    }

    #[test]
    fn test_ranking_ties_go_to_lower_id() {
        let candidates = vec![
            candidate("z", GeneratorKind::TextTransform, Some(7.0)),
            candidate("k", GeneratorKind::TextTransform, Some(7.0)),
        ];
        let ranking = rank_candidates(&candidates, &EloRanker::new(), &BTreeSet::new());
        assert_eq!(ranking[0].document_id, "k");
        assert_eq!(ranking[1].document_id, "z");
    }

    #[test]
    fn test_interim_status_per_outcome() {
        assert_eq!(
            interim_status(&GenerationOutcome::Empty { reason: "blank".into() }),
            Some(TaskStatus::EmptyContent)
        );
        assert_eq!(
            interim_status(&GenerationOutcome::TimedOut { after: Duration::from_secs(1) }),
            Some(TaskStatus::TimedOut)
        );
        assert_eq!(
            interim_status(&GenerationOutcome::Failed(crate::error::GenerationError::Fatal(
                "boom".into()
            ))),
            Some(TaskStatus::Errored)
        );
    }

    #[test]
    fn test_combined_kind_follows_strategy() {
        let ranking = rank_candidates(
            &[
                candidate("a", GeneratorKind::DeepResearch, Some(9.0)),
                candidate("b", GeneratorKind::TextTransform, Some(5.0)),
            ],
            &EloRanker::new(),
            &BTreeSet::new(),
        );
        let inputs = vec!["a".to_string(), "b".to_string()];

        let concatenate = CombineConfig::new(CombineStrategy::Concatenate);
        assert_eq!(combined_kind(&concatenate, &inputs, &ranking), GeneratorKind::DeepResearch);

        let best = CombineConfig::new(CombineStrategy::BestOfN);
        assert_eq!(
            combined_kind(&best, &["b".to_string()], &ranking),
            GeneratorKind::TextTransform
        );

        let mut merge = CombineConfig::new(CombineStrategy::IntelligentMerge);
        merge.merge_kind = GeneratorKind::MultiAgent;
        assert_eq!(combined_kind(&merge, &inputs, &ranking), GeneratorKind::MultiAgent);
    }
}
