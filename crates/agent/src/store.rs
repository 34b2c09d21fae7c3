use std::sync::Arc;

use proto::{DatabaseError, Error, ToolError};
use sqlx::{Row, sqlite::SqlitePool};
use tracing::{debug, info, warn};

use crate::synth::{Script, ScriptTool};
use crate::tool_registry::{RegisterMode, ToolRegistry};

/// Listing row for a stored script
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSummary {
    pub name: String,
    pub task: String,
    pub steps: usize,
    pub partial: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// SQLite-backed script persistence
pub struct ScriptStore {
    pool: SqlitePool,
}

impl ScriptStore {
    /// Open (or create) the SQLite database and run migrations
    pub async fn open(db_url: &str) -> Result<Self, DatabaseError> {
        // Expand ~ in path
        let url = if db_url.starts_with("~") {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            db_url.replacen("~", &home, 1)
        } else {
            db_url.to_string()
        };

        if let Some(parent) = std::path::Path::new(&url).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{url}?mode=rwc"))
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        let migrations_dir =
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        let migrator = sqlx::migrate::Migrator::new(migrations_dir.as_path())
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        migrator
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("Script store opened: {url}");
        Ok(Self { pool })
    }

    /// Save a script, replacing any stored script with the same name
    pub async fn save(&self, script: &Script) -> Result<(), DatabaseError> {
        let body = script
            .to_json()
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO scripts (name, task, run_id, partial, step_count, body_json, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)"
        )
        .bind(&script.name)
        .bind(&script.task)
        .bind(script.run_id.as_str())
        .bind(script.partial)
        .bind(script.steps.len() as i64)
        .bind(body)
        .bind(script.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        debug!("Saved script: {} ({} steps)", script.name, script.steps.len());
        Ok(())
    }

    /// Load one script by name
    pub async fn load(&self, name: &str) -> Result<Script, DatabaseError> {
        let row = sqlx::query("SELECT body_json FROM scripts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?
            .ok_or_else(|| DatabaseError::NotFound(name.to_string()))?;

        let body: String = row.get("body_json");
        Script::from_json(&body)
            .map_err(|e| DatabaseError::Sqlx(format!("stored script {name} is unreadable: {e}")))
    }

    /// List stored scripts, newest first
    pub async fn list(&self) -> Result<Vec<ScriptSummary>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT name, task, step_count, partial, created_at FROM scripts ORDER BY created_at DESC, name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let created_str: String = row.get("created_at");
                let created_at = chrono::DateTime::parse_from_rfc3339(&created_str)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|_| chrono::Utc::now());
                ScriptSummary {
                    name: row.get("name"),
                    task: row.get("task"),
                    steps: row.get::<i64, _>("step_count").max(0) as usize,
                    partial: row.get("partial"),
                    created_at,
                }
            })
            .collect())
    }

    /// Delete a script; returns whether a row was removed
    pub async fn delete(&self, name: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM scripts WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    /// Register every stored script as a tool. Names already taken in the
    /// registry are skipped. Returns how many were registered.
    pub async fn load_into(&self, registry: &Arc<ToolRegistry>) -> Result<usize, Error> {
        let mut loaded = 0;
        for summary in self.list().await? {
            let script = match self.load(&summary.name).await {
                Ok(script) => script,
                Err(e) => {
                    warn!("Skipping script {}: {e}", summary.name);
                    continue;
                }
            };
            let tool = ScriptTool::new(script, Arc::downgrade(registry));
            match registry.register(tool, RegisterMode::Reject) {
                Ok(()) => loaded += 1,
                Err(ToolError::DuplicateName(name)) => {
                    warn!("Stored script {name} shadows an existing tool; skipped");
                }
                Err(other) => return Err(other.into()),
            }
        }
        info!(loaded, "Stored scripts registered");
        Ok(loaded)
    }
}
