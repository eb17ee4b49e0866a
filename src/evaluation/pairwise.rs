//! Head-to-head comparison of two documents.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use ordered_float::OrderedFloat;
use tracing::{info, warn};

use crate::error::EvaluationError;
use crate::store::RunStore;

use super::judge::Judge;
use super::{EvalOutcome, PairwiseOutcome, Submission};

pub struct PairwiseEvaluator {
    judges: Vec<Arc<dyn Judge>>,
    store: Arc<dyn RunStore>,
    reevaluate: bool,
}

impl PairwiseEvaluator {
    pub fn new(judges: Vec<Arc<dyn Judge>>, store: Arc<dyn RunStore>) -> Self {
        Self {
            judges,
            store,
            reevaluate: false,
        }
    }

    pub fn with_reevaluate(mut self, reevaluate: bool) -> Self {
        self.reevaluate = reevaluate;
        self
    }

    pub fn judge_ids(&self) -> Vec<String> {
        self.judges.iter().map(|j| j.id().to_string()).collect()
    }

    /// Compares two documents with every judge.
    ///
    /// The pair is normalized so the smaller id is always side A, in the
    /// prompt and in the stored key.
    pub async fn compare(
        &self,
        run_id: &str,
        first: Submission<'_>,
        second: Submission<'_>,
    ) -> Vec<EvalOutcome<PairwiseOutcome>> {
        let (a, b) = if first.id <= second.id {
            (first, second)
        } else {
            (second, first)
        };
        join_all(self.judges.iter().map(|judge| async move {
            match self.compare_once(run_id, a, b, judge.as_ref()).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        document_a = a.id,
                        document_b = b.id,
                        judge = judge.id(),
                        error = %err,
                        "Pairwise comparison failed"
                    );
                    EvalOutcome::Failed {
                        judge: judge.id().to_string(),
                        error: err.to_string(),
                    }
                }
            }
        }))
        .await
    }

    async fn compare_once(
        &self,
        run_id: &str,
        a: Submission<'_>,
        b: Submission<'_>,
        judge: &dyn Judge,
    ) -> Result<EvalOutcome<PairwiseOutcome>, EvaluationError> {
        for side in [a, b] {
            if side.content.trim().is_empty() {
                return Err(EvaluationError::NotEvaluable(side.id.to_string()));
            }
        }
        if !self.reevaluate {
            if let Some(existing) = self.store.find_pairwise(a.id, b.id, judge.id()).await? {
                return Ok(EvalOutcome::Reused(existing));
            }
        }

        let verdict = judge.compare(a, b).await?;
        let outcome = PairwiseOutcome {
            document_a: a.id.to_string(),
            document_b: b.id.to_string(),
            judge: judge.id().to_string(),
            run_id: run_id.to_string(),
            winner: verdict.winner,
            confidence: verdict.confidence,
            reason: verdict.reason,
            created_at: Utc::now(),
        };
        self.store.save_pairwise(&outcome).await?;
        info!(
            document_a = a.id,
            document_b = b.id,
            judge = judge.id(),
            winner = %outcome.winner,
            "Pairwise outcome recorded"
        );
        Ok(EvalOutcome::Recorded(outcome))
    }
}

/// Every unordered pair of `ids`, each as `(smaller, larger)`, sorted.
pub fn plan_pairs(ids: &[String]) -> Vec<(String, String)> {
    let mut sorted: Vec<&String> = ids.iter().collect();
    sorted.sort();
    sorted.dedup();
    let mut pairs = Vec::with_capacity(sorted.len() * sorted.len().saturating_sub(1) / 2);
    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            pairs.push(((*a).clone(), (*b).clone()));
        }
    }
    pairs
}

/// Picks up to `n` documents by summary score, highest first.
///
/// Unscored documents rank after every scored one; ties go to the lower
/// id. `None` keeps every document.
pub fn select_top_n(scored: &[(String, Option<f64>)], n: Option<usize>) -> Vec<String> {
    let mut ranked: Vec<&(String, Option<f64>)> = scored.iter().collect();
    ranked.sort_by(|(id_a, score_a), (id_b, score_b)| {
        let key = |s: &Option<f64>| s.map(|v| OrderedFloat(-v));
        match (key(score_a), key(score_b)) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
        .then_with(|| id_a.cmp(id_b))
    });
    let take = n.unwrap_or(ranked.len());
    ranked.into_iter().take(take).map(|(id, _)| id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::judge::PairwiseVerdict;
    use crate::evaluation::Winner;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Prefers the longer document; records the order it was shown.
    struct LengthJudge {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Judge for LengthJudge {
        fn id(&self) -> &str {
            "length"
        }

        async fn score(
            &self,
            _document: Submission<'_>,
            _criteria: &[String],
        ) -> Result<BTreeMap<String, f64>, EvaluationError> {
            Err(EvaluationError::Judge("not used".into()))
        }

        async fn compare(
            &self,
            a: Submission<'_>,
            b: Submission<'_>,
        ) -> Result<PairwiseVerdict, EvaluationError> {
            self.seen
                .lock()
                .expect("lock poisoned")
                .push((a.id.to_string(), b.id.to_string()));
            let winner = match a.content.len().cmp(&b.content.len()) {
                std::cmp::Ordering::Greater => Winner::A,
                std::cmp::Ordering::Less => Winner::B,
                std::cmp::Ordering::Equal => Winner::Tie,
            };
            Ok(PairwiseVerdict {
                winner,
                confidence: 0.9,
                reason: None,
            })
        }
    }

    fn judge() -> Arc<LengthJudge> {
        Arc::new(LengthJudge {
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_pair_is_normalized() {
        let store = Arc::new(InMemoryStore::new());
        let judge = judge();
        let evaluator = PairwiseEvaluator::new(vec![judge.clone() as Arc<dyn Judge>], store.clone());

        let outcomes = evaluator
            .compare("run-1", Submission::new("b", "longer text"), Submission::new("a", "short"))
            .await;

        let outcome = outcomes[0].record().expect("record");
        assert_eq!((outcome.document_a.as_str(), outcome.document_b.as_str()), ("a", "b"));
        assert_eq!(outcome.winner, Winner::B);
        assert_eq!(
            judge.seen.lock().expect("lock").clone(),
            vec![("a".to_string(), "b".to_string())]
        );
    }

    #[tokio::test]
    async fn test_tie_is_preserved_and_reused() {
        let store = Arc::new(InMemoryStore::new());
        let judge = judge();
        let evaluator = PairwiseEvaluator::new(vec![judge.clone() as Arc<dyn Judge>], store.clone());

        let first = evaluator
            .compare("run-1", Submission::new("a", "same"), Submission::new("b", "same"))
            .await;
        assert_eq!(first[0].record().expect("record").winner, Winner::Tie);

        let second = evaluator
            .compare("run-2", Submission::new("a", "same"), Submission::new("b", "same"))
            .await;
        assert!(matches!(second[0], EvalOutcome::Reused(_)));
        assert_eq!(judge.seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_plan_pairs() {
        let ids = vec!["c".to_string(), "a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(
            plan_pairs(&ids),
            vec![
                ("a".to_string(), "b".to_string()),
                ("a".to_string(), "c".to_string()),
                ("b".to_string(), "c".to_string()),
            ]
        );
        assert!(plan_pairs(&["solo".to_string()]).is_empty());
    }

    #[test]
    fn test_select_top_n() {
        let scored = vec![
            ("d".to_string(), None),
            ("c".to_string(), Some(7.0)),
            ("b".to_string(), Some(9.0)),
            ("a".to_string(), Some(7.0)),
        ];
        assert_eq!(select_top_n(&scored, Some(3)), vec!["b", "a", "c"]);
        assert_eq!(select_top_n(&scored, None), vec!["b", "a", "c", "d"]);
        assert!(select_top_n(&scored, Some(0)).is_empty());
    }
}
