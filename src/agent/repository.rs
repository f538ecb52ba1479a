//! Agent database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::with_write_retry;

use super::models::{Agent, AgentStatus};

const AGENT_COLUMNS: &str = "id, name, base_url, api_path, api_key, status, tunnel_count, \
                             last_check_at, created_at, updated_at";

/// Repository for agent persistence.
#[derive(Debug, Clone)]
pub struct AgentRepository {
    pool: SqlitePool,
}

impl AgentRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a new agent. New agents start OFFLINE until the supervisor
    /// connects them.
    pub async fn create(
        &self,
        name: &str,
        base_url: &str,
        api_path: &str,
        api_key: &str,
    ) -> Result<Agent> {
        let now = Utc::now();
        let id = with_write_retry("create agent", || async {
            sqlx::query(
                r#"
                INSERT INTO agents (name, base_url, api_path, api_key, status, created_at, updated_at)
                VALUES (?, ?, ?, ?, 'OFFLINE', ?, ?)
                "#,
            )
            .bind(name)
            .bind(base_url)
            .bind(api_path)
            .bind(api_key)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .map(|result| result.last_insert_rowid())
        })
        .await
        .context("creating agent")?;

        self.get(id)
            .await?
            .context("agent disappeared after insert")
    }

    /// Get an agent by ID.
    pub async fn get(&self, id: i64) -> Result<Option<Agent>> {
        let agent = sqlx::query_as::<_, Agent>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching agent")?;

        Ok(agent)
    }

    /// List all agents.
    pub async fn list(&self) -> Result<Vec<Agent>> {
        let agents = sqlx::query_as::<_, Agent>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing agents")?;

        Ok(agents)
    }

    /// List agents eligible for reconnection at startup (everything that has
    /// not terminally failed).
    pub async fn list_connectable(&self) -> Result<Vec<Agent>> {
        let agents = sqlx::query_as::<_, Agent>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE status != 'FAIL' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing connectable agents")?;

        Ok(agents)
    }

    /// Remove an agent and its derived state.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let affected = with_write_retry("delete agent", || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM tunnels WHERE agent_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM agents WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(result.rows_affected())
        })
        .await
        .context("deleting agent")?;

        Ok(affected > 0)
    }

    /// Mark an agent ONLINE. Returns false when it already was, in which case
    /// no row is written.
    pub async fn mark_online(&self, id: i64) -> Result<bool> {
        self.set_status(id, AgentStatus::Online).await
    }

    /// Mark an agent OFFLINE (explicit disconnect). Returns false when it
    /// already was.
    pub async fn mark_offline(&self, id: i64) -> Result<bool> {
        self.set_status(id, AgentStatus::Offline).await
    }

    /// Mark an agent FAIL after a terminal subscription error. Returns false
    /// when it already was.
    pub async fn mark_fail(&self, id: i64) -> Result<bool> {
        self.set_status(id, AgentStatus::Fail).await
    }

    /// Conditionally flip an ONLINE agent to OFFLINE. Used by the optional
    /// silence watchdog; never touches FAIL.
    pub async fn mark_offline_if_online(&self, id: i64) -> Result<bool> {
        let now = Utc::now();
        let affected = with_write_retry("mark agent offline", || async {
            sqlx::query(
                "UPDATE agents SET status = 'OFFLINE', last_check_at = ?, updated_at = ? \
                 WHERE id = ? AND status = 'ONLINE'",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
        })
        .await
        .context("marking agent offline")?;

        Ok(affected > 0)
    }

    /// Conditional status write: only touches the row when the status really
    /// changes, so repeated transitions produce no redundant writes.
    async fn set_status(&self, id: i64, status: AgentStatus) -> Result<bool> {
        let status_text = status.to_string();
        let now = Utc::now();
        let affected = with_write_retry("set agent status", || async {
            sqlx::query(
                "UPDATE agents SET status = ?, last_check_at = ?, updated_at = ? \
                 WHERE id = ? AND status != ?",
            )
            .bind(&status_text)
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(&status_text)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
        })
        .await
        .context("updating agent status")?;

        Ok(affected > 0)
    }
}
