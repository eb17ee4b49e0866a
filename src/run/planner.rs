//! Expansion of a run configuration into generation work, with skip logic.
//!
//! Every (document, kind, model, iteration) gets a task key: a hash of the
//! inputs that determine its output. A stored artifact under the same key
//! whose content still matches its recorded hash is reused instead of
//! generating again, so changing one model only produces work for that
//! model.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::generation::{ContentValidator, GeneratorKind};
use crate::store::RunStore;

use super::config::RunConfig;
use super::model::{content_hash, GeneratedDocument, GenerationTask, TaskStatus};

/// Input document with its content loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub id: String,
    pub content: String,
    pub content_hash: String,
}

/// Loads every configured document.
///
/// Documents that cannot be read or are blank are returned as rejection
/// messages rather than failing the whole set.
pub async fn resolve_documents(config: &RunConfig) -> (Vec<Arc<SourceDocument>>, Vec<String>) {
    let mut valid = Vec::with_capacity(config.documents.len());
    let mut rejected = Vec::new();

    for source in &config.documents {
        let content = match (&source.content, &source.path) {
            (Some(inline), _) => Ok(inline.clone()),
            (None, Some(path)) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| format!("document '{}': cannot read {}: {}", source.id, path.display(), e)),
            (None, None) => Err(format!("document '{}': no content or path", source.id)),
        };

        match content {
            Ok(content) if content.trim().is_empty() => {
                warn!(document = %source.id, "Skipping blank document");
                rejected.push(format!("document '{}': content is blank", source.id));
            }
            Ok(content) => valid.push(Arc::new(SourceDocument {
                id: source.id.clone(),
                content_hash: content_hash(&content),
                content,
            })),
            Err(message) => {
                warn!(document = %source.id, error = %message, "Skipping unreadable document");
                rejected.push(message);
            }
        }
    }

    (valid, rejected)
}

/// Hash of the inputs that determine one task's output.
pub fn task_key(
    source: &SourceDocument,
    kind: GeneratorKind,
    model: &str,
    iteration: u32,
    config: &RunConfig,
) -> String {
    let canonical = json!({
        "document": source.content_hash,
        "kind": kind,
        "model": model,
        "iteration": iteration,
        "instructions": config.instructions,
        "min_content_length": config.generation.min_content_length,
    });
    content_hash(&canonical.to_string())
}

/// One unit of planned work.
#[derive(Debug, Clone)]
pub enum PlannedItem {
    /// No usable artifact exists for the key; generate it.
    Generate {
        task: GenerationTask,
        source: Arc<SourceDocument>,
    },
    /// A stored artifact for the key is intact and is reused as-is.
    Reuse {
        document: GeneratedDocument,
        kind: GeneratorKind,
    },
}

impl PlannedItem {
    pub fn kind(&self) -> GeneratorKind {
        match self {
            PlannedItem::Generate { task, .. } => task.kind,
            PlannedItem::Reuse { kind, .. } => *kind,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub items: Vec<PlannedItem>,
}

impl Plan {
    pub fn generate_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, PlannedItem::Generate { .. }))
            .count()
    }

    pub fn reuse_count(&self) -> usize {
        self.items.len() - self.generate_count()
    }

    pub fn count_for(&self, kind: GeneratorKind) -> usize {
        self.items.iter().filter(|item| item.kind() == kind).count()
    }
}

/// Builds the task set for `run_id`.
pub async fn plan_run(
    run_id: &str,
    config: &RunConfig,
    sources: &[Arc<SourceDocument>],
    store: &dyn RunStore,
) -> Result<Plan, StoreError> {
    let validator = ContentValidator::new(config.generation.min_content_length);
    let mut plan = Plan::default();

    for source in sources {
        for selection in &config.generators {
            for model in &selection.models {
                for iteration in 1..=selection.iterations {
                    let key = task_key(source, selection.kind, model, iteration, config);

                    if let Some(prior) = store.find_document_by_key(&key).await? {
                        if is_intact(&prior, &validator) {
                            debug!(
                                document = %source.id,
                                model = %model,
                                kind = %selection.kind,
                                artifact = %prior.id,
                                "Reusing stored artifact"
                            );
                            plan.items.push(PlannedItem::Reuse {
                                document: prior,
                                kind: selection.kind,
                            });
                            continue;
                        }
                        warn!(artifact = %prior.id, "Stored artifact failed integrity check, regenerating");
                    }

                    let now = Utc::now();
                    plan.items.push(PlannedItem::Generate {
                        task: GenerationTask {
                            id: format!("{}-{}", run_id, &key[..12]),
                            run_id: run_id.to_string(),
                            document_id: source.id.clone(),
                            model: model.clone(),
                            kind: selection.kind,
                            iteration,
                            task_key: key,
                            status: TaskStatus::Pending,
                            attempts: Vec::new(),
                            duration_ms: None,
                            input_tokens: None,
                            output_tokens: None,
                            cost_usd: None,
                            error: None,
                            output_document_id: None,
                            created_at: now,
                            updated_at: now,
                        },
                        source: Arc::clone(source),
                    });
                }
            }
        }
    }

    info!(
        run_id = run_id,
        generate = plan.generate_count(),
        reuse = plan.reuse_count(),
        "Planned generation work"
    );
    Ok(plan)
}

fn is_intact(document: &GeneratedDocument, validator: &ContentValidator) -> bool {
    content_hash(&document.content) == document.content_hash && validator.is_acceptable(&document.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::model::document_id_for;
    use crate::store::InMemoryStore;

    fn config(models: &[&str]) -> RunConfig {
        let yaml = format!(
            r#"
documents:
  - id: intro
    content: "Some source text."
  - id: outro
    content: "Closing remarks."
instructions: "Rewrite."
generators:
  - kind: text-transform
    models: [{}]
    iterations: 2
generation:
  min_content_length: 5
"#,
            models.join(", ")
        );
        RunConfig::from_yaml_str(&yaml).expect("config")
    }

    fn artifact(run_id: &str, task: &GenerationTask, content: &str) -> GeneratedDocument {
        GeneratedDocument {
            id: document_id_for(&task.task_key, &content_hash(content)),
            run_id: run_id.to_string(),
            task_id: task.id.clone(),
            task_key: task.task_key.clone(),
            source_document_id: task.document_id.clone(),
            model: task.model.clone(),
            kind: task.kind,
            iteration: task.iteration,
            content: content.to_string(),
            content_hash: content_hash(content),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_resolve_rejects_blank_and_missing() {
        let mut config = config(&["m"]);
        config.documents[1].content = Some("   ".to_string());
        config.documents.push(crate::run::config::DocumentSource {
            id: "ghost".to_string(),
            content: None,
            path: Some("/nonexistent/docforge/ghost.md".into()),
        });

        let (valid, rejected) = resolve_documents(&config).await;
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].id, "intro");
        assert_eq!(rejected.len(), 2);
        assert!(rejected[1].contains("ghost"));
    }

    #[tokio::test]
    async fn test_plan_expands_every_combination() {
        let config = config(&["m1", "m2"]);
        let (sources, _) = resolve_documents(&config).await;
        let store = InMemoryStore::new();

        let plan = plan_run("run-1", &config, &sources, &store).await.expect("plan");
        assert_eq!(plan.items.len(), 2 * 2 * 2);
        assert_eq!(plan.generate_count(), 8);
        assert_eq!(plan.count_for(GeneratorKind::TextTransform), 8);

        let mut keys: Vec<String> = plan
            .items
            .iter()
            .filter_map(|item| match item {
                PlannedItem::Generate { task, .. } => Some(task.task_key.clone()),
                PlannedItem::Reuse { .. } => None,
            })
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 8);
    }

    #[tokio::test]
    async fn test_intact_artifacts_are_reused() {
        let config = config(&["m1"]);
        let (sources, _) = resolve_documents(&config).await;
        let store = InMemoryStore::new();

        let first = plan_run("run-1", &config, &sources, &store).await.expect("plan");
        for item in &first.items {
            if let PlannedItem::Generate { task, .. } = item {
                store
                    .save_document(&artifact("run-1", task, "generated body"))
                    .await
                    .expect("save");
            }
        }

        let second = plan_run("run-2", &config, &sources, &store).await.expect("plan");
        assert_eq!(second.generate_count(), 0);
        assert_eq!(second.reuse_count(), first.items.len());
    }

    #[tokio::test]
    async fn test_tampered_artifact_is_regenerated() {
        let config = config(&["m1"]);
        let (sources, _) = resolve_documents(&config).await;
        let store = InMemoryStore::new();

        let first = plan_run("run-1", &config, &sources, &store).await.expect("plan");
        if let PlannedItem::Generate { task, .. } = &first.items[0] {
            let mut doc = artifact("run-1", task, "generated body");
            doc.content = "edited afterwards".to_string();
            store.save_document(&doc).await.expect("save");
        }

        let second = plan_run("run-2", &config, &sources, &store).await.expect("plan");
        assert_eq!(second.generate_count(), first.items.len());
    }

    #[test]
    fn test_key_ignores_unrelated_settings() {
        let base = config(&["m1"]);
        let source = SourceDocument {
            id: "intro".to_string(),
            content: "text".to_string(),
            content_hash: content_hash("text"),
        };
        let key = task_key(&source, GeneratorKind::TextTransform, "m1", 1, &base);

        let mut other = base.clone();
        other.generation.timeout_secs = 5;
        other.evaluation.reevaluate = true;
        assert_eq!(key, task_key(&source, GeneratorKind::TextTransform, "m1", 1, &other));

        other.instructions = "Summarize.".to_string();
        assert_ne!(key, task_key(&source, GeneratorKind::TextTransform, "m1", 1, &other));
        assert_ne!(key, task_key(&source, GeneratorKind::TextTransform, "m2", 1, &base));
    }
}
