//! Per-document multi-criteria scoring.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use crate::error::EvaluationError;
use crate::store::RunStore;

use super::judge::{check_scores, Judge};
use super::{EvalOutcome, SingleDocScore, Submission};

pub struct SingleDocEvaluator {
    judges: Vec<Arc<dyn Judge>>,
    criteria: Vec<String>,
    store: Arc<dyn RunStore>,
    reevaluate: bool,
}

impl SingleDocEvaluator {
    pub fn new(judges: Vec<Arc<dyn Judge>>, criteria: Vec<String>, store: Arc<dyn RunStore>) -> Self {
        Self {
            judges,
            criteria,
            store,
            reevaluate: false,
        }
    }

    /// Replace existing records instead of reusing them.
    pub fn with_reevaluate(mut self, reevaluate: bool) -> Self {
        self.reevaluate = reevaluate;
        self
    }

    pub fn judge_ids(&self) -> Vec<String> {
        self.judges.iter().map(|j| j.id().to_string()).collect()
    }

    pub fn criteria(&self) -> &[String] {
        &self.criteria
    }

    /// Scores `document` with every judge concurrently.
    ///
    /// Returns one outcome per judge, in judge order.
    pub async fn evaluate(&self, run_id: &str, document: Submission<'_>) -> Vec<EvalOutcome<SingleDocScore>> {
        join_all(
            self.judges
                .iter()
                .map(|judge| self.evaluate_with(run_id, document, judge.as_ref())),
        )
        .await
    }

    async fn evaluate_with(
        &self,
        run_id: &str,
        document: Submission<'_>,
        judge: &dyn Judge,
    ) -> EvalOutcome<SingleDocScore> {
        match self.score_once(run_id, document, judge).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    document = document.id,
                    judge = judge.id(),
                    error = %err,
                    "Single-doc evaluation failed"
                );
                EvalOutcome::Failed {
                    judge: judge.id().to_string(),
                    error: err.to_string(),
                }
            }
        }
    }

    async fn score_once(
        &self,
        run_id: &str,
        document: Submission<'_>,
        judge: &dyn Judge,
    ) -> Result<EvalOutcome<SingleDocScore>, EvaluationError> {
        if document.content.trim().is_empty() {
            return Err(EvaluationError::NotEvaluable(document.id.to_string()));
        }
        if !self.reevaluate {
            if let Some(existing) = self.store.find_single_score(document.id, judge.id()).await? {
                return Ok(EvalOutcome::Reused(existing));
            }
        }

        let scores = judge.score(document, &self.criteria).await?;
        check_scores(&scores, &self.criteria)?;
        let average = scores.values().sum::<f64>() / scores.len().max(1) as f64;

        let record = SingleDocScore {
            document_id: document.id.to_string(),
            judge: judge.id().to_string(),
            run_id: run_id.to_string(),
            scores,
            average,
            created_at: Utc::now(),
        };
        self.store.save_single_score(&record).await?;
        info!(
            document = document.id,
            judge = judge.id(),
            average = average,
            "Single-doc score recorded"
        );
        Ok(EvalOutcome::Recorded(record))
    }
}

/// Mean of the per-judge averages, or `None` without any record.
pub fn summary_score<'a, I>(records: I) -> Option<f64>
where
    I: IntoIterator<Item = &'a SingleDocScore>,
{
    let (sum, count) = records
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), r| (sum + r.average, count + 1));
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::judge::PairwiseVerdict;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedJudge {
        id: String,
        score: f64,
        calls: AtomicUsize,
    }

    impl FixedJudge {
        fn new(id: &str, score: f64) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                score,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Judge for FixedJudge {
        fn id(&self) -> &str {
            &self.id
        }

        async fn score(
            &self,
            _document: Submission<'_>,
            criteria: &[String],
        ) -> Result<BTreeMap<String, f64>, EvaluationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(criteria.iter().map(|c| (c.clone(), self.score)).collect())
        }

        async fn compare(
            &self,
            _a: Submission<'_>,
            _b: Submission<'_>,
        ) -> Result<PairwiseVerdict, EvaluationError> {
            Err(EvaluationError::Judge("not used".into()))
        }
    }

    fn criteria() -> Vec<String> {
        vec!["accuracy".into(), "clarity".into()]
    }

    #[tokio::test]
    async fn test_records_per_judge() {
        let store = Arc::new(InMemoryStore::new());
        let evaluator = SingleDocEvaluator::new(
            vec![FixedJudge::new("j1", 8.0) as Arc<dyn Judge>, FixedJudge::new("j2", 6.0)],
            criteria(),
            store.clone(),
        );
        let outcomes = evaluator
            .evaluate("run-1", Submission::new("doc", "content"))
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| matches!(o, EvalOutcome::Recorded(_))));
        assert_eq!(store.count_single_scores("doc").await.expect("count"), 2);
        let summary = summary_score(outcomes.iter().filter_map(|o| o.record()));
        assert_eq!(summary, Some(7.0));
    }

    #[tokio::test]
    async fn test_existing_record_is_reused() {
        let store = Arc::new(InMemoryStore::new());
        let judge = FixedJudge::new("j1", 8.0);
        let evaluator = SingleDocEvaluator::new(vec![judge.clone() as Arc<dyn Judge>], criteria(), store.clone());

        evaluator.evaluate("run-1", Submission::new("doc", "content")).await;
        let second = evaluator.evaluate("run-2", Submission::new("doc", "content")).await;

        assert!(matches!(second[0], EvalOutcome::Reused(_)));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.count_single_scores("doc").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_reevaluate_replaces_record() {
        let store = Arc::new(InMemoryStore::new());
        let judge = FixedJudge::new("j1", 8.0);
        SingleDocEvaluator::new(vec![judge.clone() as Arc<dyn Judge>], criteria(), store.clone())
            .evaluate("run-1", Submission::new("doc", "content"))
            .await;
        let outcomes = SingleDocEvaluator::new(vec![judge.clone() as Arc<dyn Judge>], criteria(), store.clone())
            .with_reevaluate(true)
            .evaluate("run-2", Submission::new("doc", "content"))
            .await;

        assert!(matches!(outcomes[0], EvalOutcome::Recorded(_)));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 2);
        let stored = store
            .find_single_score("doc", "j1")
            .await
            .expect("find")
            .expect("record");
        assert_eq!(stored.run_id, "run-2");
        assert_eq!(store.count_single_scores("doc").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_judge_fails() {
        let store = Arc::new(InMemoryStore::new());
        let evaluator =
            SingleDocEvaluator::new(vec![FixedJudge::new("j1", 0.0) as Arc<dyn Judge>], criteria(), store.clone());
        let outcomes = evaluator.evaluate("run-1", Submission::new("doc", "content")).await;
        assert!(outcomes[0].is_failed());
        assert_eq!(store.count_single_scores("doc").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_empty_document_is_not_evaluated() {
        let store = Arc::new(InMemoryStore::new());
        let judge = FixedJudge::new("j1", 8.0);
        let evaluator = SingleDocEvaluator::new(vec![judge.clone() as Arc<dyn Judge>], criteria(), store);
        let outcomes = evaluator.evaluate("run-1", Submission::new("doc", "   ")).await;
        assert!(outcomes[0].is_failed());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_summary_score_empty() {
        assert_eq!(summary_score(std::iter::empty()), None);
    }
}
