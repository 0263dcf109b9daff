//! Experience store — SQLite persistence of task outcomes.
//!
//! Write-heavy and append-mostly. Every write commits immediately; readers
//! may observe a success rate that lags a just-committed record within the
//! process, which is acceptable.

use chrono::{DateTime, Utc};
use selfforge_core::TaskRecord;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
pub struct Recommendation {
    pub recommended_tools: Vec<String>,
    pub estimated_success: f64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct StoreSummary {
    pub total_tasks: i64,
    pub successes: i64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub avg_quality: f64,
}

#[derive(Clone, Debug)]
pub struct ToolStats {
    pub tool_name: String,
    pub uses: i64,
    pub successes: i64,
    pub avg_duration_ms: f64,
    pub success_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
}

pub struct ExperienceStore {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS experiences (
        task_id     TEXT PRIMARY KEY,
        description TEXT NOT NULL,
        task_type   TEXT NOT NULL,
        tools_used  TEXT NOT NULL,
        success     INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL,
        quality     REAL NOT NULL,
        created_at  TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tool_stats (
        tool_name       TEXT PRIMARY KEY,
        uses            INTEGER NOT NULL DEFAULT 0,
        successes       INTEGER NOT NULL DEFAULT 0,
        avg_duration_ms REAL NOT NULL DEFAULT 0,
        last_used       TEXT,
        success_rate    REAL NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS task_patterns (
        pattern_id        TEXT PRIMARY KEY,
        description       TEXT NOT NULL,
        task_type         TEXT NOT NULL,
        recommended_tools TEXT NOT NULL,
        success_rate      REAL NOT NULL,
        uses              INTEGER NOT NULL DEFAULT 0,
        created_at        TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_experiences_created ON experiences(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_patterns_type ON task_patterns(task_type)",
];

impl ExperienceStore {
    /// Open (creating if missing) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps one database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert an experience, update per-tool stats and upsert the task
    /// pattern. One transaction; commits immediately.
    pub async fn record(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let tools_json = serde_json::to_string(&record.tools_used)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO experiences
             (task_id, description, task_type, tools_used, success, duration_ms, quality, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.task_id)
        .bind(&record.description)
        .bind(&record.task_type)
        .bind(&tools_json)
        .bind(record.success)
        .bind(record.duration_ms as i64)
        .bind(record.quality)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        // Per-tool stats: moving average of duration, running success rate.
        let mut distinct = record.tools_used.clone();
        distinct.sort();
        distinct.dedup();
        for tool in &distinct {
            let row = sqlx::query(
                "SELECT uses, successes, avg_duration_ms FROM tool_stats WHERE tool_name = ?",
            )
            .bind(tool)
            .fetch_optional(&mut *tx)
            .await?;

            match row {
                Some(row) => {
                    let uses: i64 = row.get(0);
                    let successes: i64 = row.get(1);
                    let avg: f64 = row.get(2);
                    let new_uses = uses + 1;
                    let new_successes = successes + i64::from(record.success);
                    let new_avg =
                        (avg * uses as f64 + record.duration_ms as f64) / new_uses as f64;
                    sqlx::query(
                        "UPDATE tool_stats
                         SET uses = ?, successes = ?, avg_duration_ms = ?, last_used = ?, success_rate = ?
                         WHERE tool_name = ?",
                    )
                    .bind(new_uses)
                    .bind(new_successes)
                    .bind(new_avg)
                    .bind(record.created_at)
                    .bind(new_successes as f64 / new_uses as f64)
                    .bind(tool)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    let successes = i64::from(record.success);
                    sqlx::query(
                        "INSERT INTO tool_stats
                         (tool_name, uses, successes, avg_duration_ms, last_used, success_rate)
                         VALUES (?, 1, ?, ?, ?, ?)",
                    )
                    .bind(tool)
                    .bind(successes)
                    .bind(record.duration_ms as f64)
                    .bind(record.created_at)
                    .bind(successes as f64)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        // Task pattern keyed by task_type + sorted tool set.
        let success_value = if record.success { 1.0_f64 } else { 0.0 };
        let pattern_id = pattern_id(&record.task_type, &distinct);
        let row = sqlx::query("SELECT success_rate, uses FROM task_patterns WHERE pattern_id = ?")
            .bind(&pattern_id)
            .fetch_optional(&mut *tx)
            .await?;

        match row {
            Some(row) => {
                let rate: f64 = row.get(0);
                let uses: i64 = row.get(1);
                let new_uses = uses + 1;
                let new_rate = (rate * uses as f64 + success_value) / new_uses as f64;
                sqlx::query(
                    "UPDATE task_patterns SET uses = ?, success_rate = ? WHERE pattern_id = ?",
                )
                .bind(new_uses)
                .bind(new_rate)
                .bind(&pattern_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO task_patterns
                     (pattern_id, description, task_type, recommended_tools, success_rate, uses, created_at)
                     VALUES (?, ?, ?, ?, ?, 1, ?)",
                )
                .bind(&pattern_id)
                .bind(format!("pattern for {} tasks", record.task_type))
                .bind(&record.task_type)
                .bind(serde_json::to_string(&distinct)?)
                .bind(success_value)
                .bind(record.created_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Best pattern for a task type: highest success rate, most uses.
    pub async fn recommend(&self, task_type: &str) -> Result<Option<Recommendation>, StoreError> {
        let row = sqlx::query(
            "SELECT recommended_tools, success_rate FROM task_patterns
             WHERE task_type = ?
             ORDER BY success_rate DESC, uses DESC
             LIMIT 1",
        )
        .bind(task_type)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let tools_json: String = row.get(0);
                let recommended_tools: Vec<String> = serde_json::from_str(&tools_json)?;
                Ok(Some(Recommendation {
                    recommended_tools,
                    estimated_success: row.get(1),
                }))
            }
            None => Ok(None),
        }
    }

    /// Delete experiences older than the cutoff. Stats and patterns are
    /// aggregates and survive.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM experiences WHERE created_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn tool_stats(&self, tool: &str) -> Result<Option<ToolStats>, StoreError> {
        let row = sqlx::query(
            "SELECT tool_name, uses, successes, avg_duration_ms, success_rate, last_used
             FROM tool_stats WHERE tool_name = ?",
        )
        .bind(tool)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ToolStats {
            tool_name: row.get(0),
            uses: row.get(1),
            successes: row.get(2),
            avg_duration_ms: row.get(3),
            success_rate: row.get(4),
            last_used: row.get(5),
        }))
    }

    /// Aggregate view over everything recorded so far.
    pub async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*),
                    COALESCE(SUM(success), 0),
                    COALESCE(AVG(duration_ms), 0.0),
                    COALESCE(AVG(quality), 0.0)
             FROM experiences",
        )
        .fetch_one(&self.pool)
        .await?;

        let total_tasks: i64 = row.get(0);
        let successes: i64 = row.get(1);
        Ok(StoreSummary {
            total_tasks,
            successes,
            success_rate: if total_tasks > 0 {
                successes as f64 / total_tasks as f64
            } else {
                0.0
            },
            avg_duration_ms: row.get(2),
            avg_quality: row.get(3),
        })
    }

    pub async fn experience_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM experiences")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    pub async fn experience(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, description, task_type, tools_used, success, duration_ms, quality, created_at
             FROM experiences WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let tools_json: String = row.get(3);
                Ok(Some(TaskRecord {
                    task_id: row.get(0),
                    description: row.get(1),
                    task_type: row.get(2),
                    tools_used: serde_json::from_str(&tools_json)?,
                    success: row.get(4),
                    duration_ms: row.get::<i64, _>(5) as u64,
                    quality: row.get(6),
                    created_at: row.get(7),
                }))
            }
            None => Ok(None),
        }
    }
}

/// Stable pattern key over task type and the sorted tool set.
fn pattern_id(task_type: &str, sorted_tools: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_type.as_bytes());
    hasher.update(b":");
    hasher.update(sorted_tools.join(",").as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task_id: &str, success: bool, tools: &[&str], duration_ms: u64) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_string(),
            description: "test task".to_string(),
            task_type: "time".to_string(),
            tools_used: tools.iter().map(|s| s.to_string()).collect(),
            success,
            duration_ms,
            quality: 0.8,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn record_and_read_back() {
        let store = ExperienceStore::open_in_memory().await.unwrap();
        store.record(&record("t1", true, &["terminal"], 120)).await.unwrap();

        let loaded = store.experience("t1").await.unwrap().unwrap();
        assert_eq!(loaded.task_type, "time");
        assert_eq!(loaded.tools_used, vec!["terminal"]);
        assert!(loaded.success);
        assert_eq!(loaded.duration_ms, 120);
    }

    #[tokio::test]
    async fn tool_stats_accumulate_moving_average() {
        let store = ExperienceStore::open_in_memory().await.unwrap();
        store.record(&record("t1", true, &["terminal"], 100)).await.unwrap();
        store.record(&record("t2", false, &["terminal"], 300)).await.unwrap();

        let stats = store.tool_stats("terminal").await.unwrap().unwrap();
        assert_eq!(stats.uses, 2);
        assert_eq!(stats.successes, 1);
        assert!((stats.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn duplicate_tools_in_one_task_count_once() {
        let store = ExperienceStore::open_in_memory().await.unwrap();
        store
            .record(&record("t1", true, &["code", "code", "terminal"], 50))
            .await
            .unwrap();
        let stats = store.tool_stats("code").await.unwrap().unwrap();
        assert_eq!(stats.uses, 1);
    }

    #[tokio::test]
    async fn recommend_returns_best_pattern() {
        let store = ExperienceStore::open_in_memory().await.unwrap();
        // terminal-based pattern: 2 successes
        store.record(&record("t1", true, &["terminal"], 100)).await.unwrap();
        store.record(&record("t2", true, &["terminal"], 100)).await.unwrap();
        // code-based pattern: 1 failure
        store.record(&record("t3", false, &["code"], 100)).await.unwrap();

        let rec = store.recommend("time").await.unwrap().unwrap();
        assert_eq!(rec.recommended_tools, vec!["terminal"]);
        assert!((rec.estimated_success - 1.0).abs() < f64::EPSILON);

        assert!(store.recommend("weather").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pattern_success_rate_is_running_mean() {
        let store = ExperienceStore::open_in_memory().await.unwrap();
        store.record(&record("t1", true, &["code"], 100)).await.unwrap();
        store.record(&record("t2", false, &["code"], 100)).await.unwrap();

        let rec = store.recommend("time").await.unwrap().unwrap();
        assert!((rec.estimated_success - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cleanup_removes_old_rows_only() {
        let store = ExperienceStore::open_in_memory().await.unwrap();
        let mut old = record("old", true, &["terminal"], 10);
        old.created_at = Utc::now() - chrono::Duration::days(60);
        store.record(&old).await.unwrap();
        store.record(&record("fresh", true, &["terminal"], 10)).await.unwrap();

        let deleted = store
            .cleanup(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.experience_count().await.unwrap(), 1);
        assert!(store.experience("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn summary_aggregates_over_all_tasks() {
        let store = ExperienceStore::open_in_memory().await.unwrap();
        let empty = store.summary().await.unwrap();
        assert_eq!(empty.total_tasks, 0);
        assert_eq!(empty.success_rate, 0.0);

        store.record(&record("t1", true, &["terminal"], 100)).await.unwrap();
        store.record(&record("t2", false, &["code"], 300)).await.unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.successes, 1);
        assert!((summary.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((summary.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert!((summary.avg_quality - 0.8).abs() < 1e-9);
    }

    #[test]
    fn pattern_id_is_order_insensitive_given_sorted_input() {
        let a = pattern_id("time", &["a".into(), "b".into()]);
        let b = pattern_id("time", &["a".into(), "b".into()]);
        let c = pattern_id("time", &["b".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
