//! In-process store used by tests and dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::evaluation::{PairwiseOutcome, SingleDocScore};
use crate::run::model::{GeneratedDocument, GenerationTask, Run, RunStatus, TimelineEvent};

use super::RunStore;

#[derive(Default)]
struct Inner {
    runs: HashMap<String, Run>,
    tasks: BTreeMap<(String, String), GenerationTask>,
    events: HashMap<String, Vec<TimelineEvent>>,
    documents: HashMap<String, GeneratedDocument>,
    single_scores: BTreeMap<(String, String), SingleDocScore>,
    pairwise: BTreeMap<(String, String, String), PairwiseOutcome>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.runs.contains_key(&run.id) {
            return Err(StoreError::Duplicate(format!("run {}", run.id)));
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn transition_run(&self, id: &str, from: RunStatus, to: RunStatus) -> Result<(), StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", id)))?;
        if run.status != from {
            return Err(StoreError::StatusConflict {
                id: id.to_string(),
                expected: from.to_string(),
                actual: run.status.to_string(),
            });
        }
        run.status = to;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run.id)))?;
        let status = stored.status;
        *stored = run.clone();
        stored.status = status;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn load_run(&self, id: &str) -> Result<Run, StoreError> {
        self.inner
            .read()
            .await
            .runs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run {}", id)))
    }

    async fn save_task(&self, task: &GenerationTask) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .tasks
            .insert((task.run_id.clone(), task.id.clone()), task.clone());
        Ok(())
    }

    async fn list_tasks(&self, run_id: &str) -> Result<Vec<GenerationTask>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .iter()
            .filter(|((run, _), _)| run == run_id)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn append_event(&self, event: &TimelineEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let events = inner.events.entry(event.run_id.clone()).or_default();
        if events.iter().any(|e| e.sequence == event.sequence) {
            return Err(StoreError::Duplicate(format!(
                "event {} of run {}",
                event.sequence, event.run_id
            )));
        }
        events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<TimelineEvent>, StoreError> {
        let inner = self.inner.read().await;
        let mut events = inner.events.get(run_id).cloned().unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn save_document(&self, document: &GeneratedDocument) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn load_document(&self, id: &str) -> Result<Option<GeneratedDocument>, StoreError> {
        Ok(self.inner.read().await.documents.get(id).cloned())
    }

    async fn find_document_by_key(&self, task_key: &str) -> Result<Option<GeneratedDocument>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .documents
            .values()
            .filter(|d| d.task_key == task_key)
            .max_by_key(|d| d.created_at)
            .cloned())
    }

    async fn save_single_score(&self, score: &SingleDocScore) -> Result<(), StoreError> {
        self.inner.write().await.single_scores.insert(
            (score.document_id.clone(), score.judge.clone()),
            score.clone(),
        );
        Ok(())
    }

    async fn find_single_score(&self, document_id: &str, judge: &str) -> Result<Option<SingleDocScore>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .single_scores
            .get(&(document_id.to_string(), judge.to_string()))
            .cloned())
    }

    async fn count_single_scores(&self, document_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .single_scores
            .keys()
            .filter(|(doc, _)| doc == document_id)
            .count())
    }

    async fn save_pairwise(&self, outcome: &PairwiseOutcome) -> Result<(), StoreError> {
        self.inner.write().await.pairwise.insert(
            (
                outcome.document_a.clone(),
                outcome.document_b.clone(),
                outcome.judge.clone(),
            ),
            outcome.clone(),
        );
        Ok(())
    }

    async fn find_pairwise(
        &self,
        document_a: &str,
        document_b: &str,
        judge: &str,
    ) -> Result<Option<PairwiseOutcome>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .pairwise
            .get(&(
                document_a.to_string(),
                document_b.to_string(),
                judge.to_string(),
            ))
            .cloned())
    }

    async fn count_pairwise(&self, document_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .pairwise
            .keys()
            .filter(|(a, b, _)| a == document_id || b == document_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Winner;
    use crate::run::model::Phase;

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryStore::new();
        store.create_run(&Run::new("run-1", "fp")).await.expect("create");

        store
            .transition_run("run-1", RunStatus::Pending, RunStatus::Running)
            .await
            .expect("pending -> running");
        let err = store
            .transition_run("run-1", RunStatus::Pending, RunStatus::Running)
            .await
            .expect_err("stale transition");
        assert!(matches!(err, StoreError::StatusConflict { .. }));
        assert_eq!(
            store.load_run("run-1").await.expect("load").status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_terminal_run_cannot_move() {
        let store = InMemoryStore::new();
        store.create_run(&Run::new("run-1", "fp")).await.expect("create");
        store
            .transition_run("run-1", RunStatus::Pending, RunStatus::Failed)
            .await
            .expect("pending -> failed");

        let err = store
            .transition_run("run-1", RunStatus::Failed, RunStatus::Running)
            .await
            .expect_err("terminal");
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_save_run_keeps_status() {
        let store = InMemoryStore::new();
        let mut run = Run::new("run-1", "fp");
        store.create_run(&run).await.expect("create");
        store
            .transition_run("run-1", RunStatus::Pending, RunStatus::Running)
            .await
            .expect("transition");

        run.total_cost_usd = 1.5;
        run.errors.push("boom".into());
        store.save_run(&run).await.expect("save");

        let loaded = store.load_run("run-1").await.expect("load");
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.total_cost_usd, 1.5);
        assert_eq!(loaded.errors, vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn test_events_are_append_only() {
        let store = InMemoryStore::new();
        let event = TimelineEvent {
            run_id: "run-1".into(),
            sequence: 1,
            phase: Phase::Run,
            description: "started".into(),
            success: true,
            timestamp: Utc::now(),
            task_id: None,
            detail: serde_json::Value::Null,
        };
        store.append_event(&event).await.expect("append");
        assert!(matches!(
            store.append_event(&event).await,
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.list_events("run-1").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_pairwise_keyed_per_judge() {
        let store = InMemoryStore::new();
        let outcome = |judge: &str| PairwiseOutcome {
            document_a: "a".into(),
            document_b: "b".into(),
            judge: judge.into(),
            run_id: "run-1".into(),
            winner: Winner::Tie,
            confidence: 0.5,
            reason: None,
            created_at: Utc::now(),
        };
        store.save_pairwise(&outcome("j1")).await.expect("save");
        store.save_pairwise(&outcome("j1")).await.expect("save again");
        store.save_pairwise(&outcome("j2")).await.expect("save");

        assert_eq!(store.count_pairwise("a").await.expect("count"), 2);
        assert_eq!(store.count_pairwise("b").await.expect("count"), 2);
        assert!(store
            .find_pairwise("a", "b", "j2")
            .await
            .expect("find")
            .is_some());
        assert!(store
            .find_pairwise("b", "a", "j2")
            .await
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_run() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.load_run("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
