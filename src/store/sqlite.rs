//! SQLite-backed run store.
//!
//! Key and status columns are real columns; nested records (attempt logs,
//! criterion scores, summaries, event detail) are stored as JSON text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::evaluation::{PairwiseOutcome, SingleDocScore};
use crate::run::model::{GeneratedDocument, GenerationTask, Run, RunStatus, TimelineEvent};

use super::RunStore;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id                  TEXT PRIMARY KEY,
    status              TEXT NOT NULL,
    config_fingerprint  TEXT NOT NULL,
    total_cost_usd      REAL NOT NULL DEFAULT 0,
    errors              TEXT NOT NULL DEFAULT '[]',
    summary             TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    run_id      TEXT NOT NULL,
    id          TEXT NOT NULL,
    task_key    TEXT NOT NULL,
    status      TEXT NOT NULL,
    body        TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (run_id, id)
);

CREATE TABLE IF NOT EXISTS timeline (
    run_id      TEXT NOT NULL,
    sequence    INTEGER NOT NULL,
    phase       TEXT NOT NULL,
    success     INTEGER NOT NULL,
    task_id     TEXT,
    body        TEXT NOT NULL,
    PRIMARY KEY (run_id, sequence)
);

CREATE TABLE IF NOT EXISTS documents (
    id          TEXT PRIMARY KEY,
    task_key    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    body        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS single_scores (
    document_id TEXT NOT NULL,
    judge       TEXT NOT NULL,
    body        TEXT NOT NULL,
    PRIMARY KEY (document_id, judge)
);

CREATE TABLE IF NOT EXISTS pairwise (
    document_a  TEXT NOT NULL,
    document_b  TEXT NOT NULL,
    judge       TEXT NOT NULL,
    body        TEXT NOT NULL,
    PRIMARY KEY (document_a, document_b, judge)
);

CREATE INDEX IF NOT EXISTS idx_documents_task_key ON documents(task_key);
CREATE INDEX IF NOT EXISTS idx_pairwise_b ON pairwise(document_b);
"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Connection(format!("bad timestamp '{}': {}", raw, e)))
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` in WAL mode.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = path, "Run store opened");
        Ok(Self { pool })
    }

    /// In-memory database on a single connection.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
        let status: String = row.try_get("status")?;
        let summary: Option<String> = row.try_get("summary")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Run {
            id: row.try_get("id")?,
            status: RunStatus::from_str(&status).map_err(StoreError::Connection)?,
            config_fingerprint: row.try_get("config_fingerprint")?,
            total_cost_usd: row.try_get("total_cost_usd")?,
            errors: from_json(row, "errors")?,
            summary: summary.map(|raw| serde_json::from_str(&raw)).transpose()?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    async fn current_status(&self, id: &str) -> Result<RunStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run {}", id)))?;
        let status: String = row.try_get("status")?;
        RunStatus::from_str(&status).map_err(StoreError::Connection)
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO runs (id, status, config_fingerprint, total_cost_usd, errors, summary, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&run.id)
        .bind(run.status.as_str())
        .bind(&run.config_fingerprint)
        .bind(run.total_cost_usd)
        .bind(to_json(&run.errors)?)
        .bind(run.summary.as_ref().map(to_json).transpose()?)
        .bind(run.created_at.to_rfc3339())
        .bind(run.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn transition_run(&self, id: &str, from: RunStatus, to: RunStatus) -> Result<(), StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let result = sqlx::query(
            "UPDATE runs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let actual = self.current_status(id).await?;
        Err(StoreError::StatusConflict {
            id: id.to_string(),
            expected: from.to_string(),
            actual: actual.to_string(),
        })
    }

    async fn save_run(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE runs SET total_cost_usd = ?1, errors = ?2, summary = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(run.total_cost_usd)
        .bind(to_json(&run.errors)?)
        .bind(run.summary.as_ref().map(to_json).transpose()?)
        .bind(Utc::now().to_rfc3339())
        .bind(&run.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn load_run(&self, id: &str) -> Result<Run, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run {}", id)))?;
        Self::run_from_row(&row)
    }

    async fn save_task(&self, task: &GenerationTask) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tasks (run_id, id, task_key, status, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id, id) DO UPDATE SET
                status = excluded.status,
                body = excluded.body,
                updated_at = excluded.updated_at",
        )
        .bind(&task.run_id)
        .bind(&task.id)
        .bind(&task.task_key)
        .bind(task.status.as_str())
        .bind(to_json(task)?)
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_tasks(&self, run_id: &str) -> Result<Vec<GenerationTask>, StoreError> {
        let rows = sqlx::query("SELECT body FROM tasks WHERE run_id = ?1 ORDER BY id")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| from_json(row, "body")).collect()
    }

    async fn append_event(&self, event: &TimelineEvent) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO timeline (run_id, sequence, phase, success, task_id, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id, sequence) DO NOTHING",
        )
        .bind(&event.run_id)
        .bind(event.sequence as i64)
        .bind(event.phase.as_str())
        .bind(event.success as i32)
        .bind(&event.task_id)
        .bind(to_json(event)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!(
                "event {} of run {}",
                event.sequence, event.run_id
            )));
        }
        Ok(())
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<TimelineEvent>, StoreError> {
        let rows = sqlx::query("SELECT body FROM timeline WHERE run_id = ?1 ORDER BY sequence")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| from_json(row, "body")).collect()
    }

    async fn save_document(&self, document: &GeneratedDocument) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO documents (id, task_key, created_at, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                task_key = excluded.task_key,
                created_at = excluded.created_at,
                body = excluded.body",
        )
        .bind(&document.id)
        .bind(&document.task_key)
        .bind(document.created_at.to_rfc3339())
        .bind(to_json(document)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_document(&self, id: &str) -> Result<Option<GeneratedDocument>, StoreError> {
        let row = sqlx::query("SELECT body FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| from_json(&row, "body")).transpose()
    }

    async fn find_document_by_key(&self, task_key: &str) -> Result<Option<GeneratedDocument>, StoreError> {
        let row = sqlx::query(
            "SELECT body FROM documents WHERE task_key = ?1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(task_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| from_json(&row, "body")).transpose()
    }

    async fn save_single_score(&self, score: &SingleDocScore) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO single_scores (document_id, judge, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(document_id, judge) DO UPDATE SET body = excluded.body",
        )
        .bind(&score.document_id)
        .bind(&score.judge)
        .bind(to_json(score)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_single_score(&self, document_id: &str, judge: &str) -> Result<Option<SingleDocScore>, StoreError> {
        let row = sqlx::query("SELECT body FROM single_scores WHERE document_id = ?1 AND judge = ?2")
            .bind(document_id)
            .bind(judge)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| from_json(&row, "body")).transpose()
    }

    async fn count_single_scores(&self, document_id: &str) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM single_scores WHERE document_id = ?1")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as usize)
    }

    async fn save_pairwise(&self, outcome: &PairwiseOutcome) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pairwise (document_a, document_b, judge, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(document_a, document_b, judge) DO UPDATE SET body = excluded.body",
        )
        .bind(&outcome.document_a)
        .bind(&outcome.document_b)
        .bind(&outcome.judge)
        .bind(to_json(outcome)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_pairwise(
        &self,
        document_a: &str,
        document_b: &str,
        judge: &str,
    ) -> Result<Option<PairwiseOutcome>, StoreError> {
        let row = sqlx::query(
            "SELECT body FROM pairwise WHERE document_a = ?1 AND document_b = ?2 AND judge = ?3",
        )
        .bind(document_a)
        .bind(document_b)
        .bind(judge)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| from_json(&row, "body")).transpose()
    }

    async fn count_pairwise(&self, document_id: &str) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM pairwise WHERE document_a = ?1 OR document_b = ?1",
        )
        .bind(document_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")? as usize)
    }
}
