//! Raw event repository: append-only writes, bounded retention, log queries.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::with_write_retry;

use super::models::{LogQuery, RawEvent, StoredEvent};

const EVENT_COLUMNS: &str = "id, agent_id, instance_id, event_type, push_type, event_time, \
                             status, url, instance_type, tcp_rx, tcp_tx, udp_rx, udp_tx, \
                             logs, recorded_at";

/// Repository for the raw event audit log.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one raw event. Events are never deduplicated.
    pub async fn append(&self, event: &RawEvent) -> Result<()> {
        let now = Utc::now();
        with_write_retry("append raw event", || async {
            sqlx::query(
                r#"
                INSERT INTO events (
                    agent_id, instance_id, event_type, push_type, event_time,
                    status, url, instance_type,
                    tcp_rx, tcp_tx, udp_rx, udp_tx, logs, recorded_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.agent_id)
            .bind(&event.instance_id)
            .bind(event.event_type.to_string())
            .bind(&event.push_type)
            .bind(event.event_time)
            .bind(&event.status)
            .bind(&event.url)
            .bind(&event.instance_type)
            .bind(event.tcp_rx)
            .bind(event.tcp_tx)
            .bind(event.udp_rx)
            .bind(event.udp_tx)
            .bind(&event.logs)
            .bind(now)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
        .context("appending raw event")?;

        Ok(())
    }

    /// Most recent raw events for an agent, newest first.
    pub async fn recent_for(&self, agent_id: i64, limit: i64) -> Result<Vec<StoredEvent>> {
        let events = sqlx::query_as::<_, StoredEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE agent_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("fetching recent events")?;

        Ok(events)
    }

    /// Paged log events for an agent, optionally restricted to one instance.
    pub async fn logs_for(&self, agent_id: i64, query: &LogQuery) -> Result<Vec<StoredEvent>> {
        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, 1000);
        let offset = (page - 1) * page_size;

        let mut sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE agent_id = ? AND event_type = 'log'"
        );
        if query.instance_id.is_some() {
            sql.push_str(" AND instance_id = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query_as::<_, StoredEvent>(&sql).bind(agent_id);
        if let Some(ref instance_id) = query.instance_id {
            q = q.bind(instance_id.clone());
        }

        let events = q
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("fetching log events")?;

        Ok(events)
    }

    /// Number of stored events for an agent.
    pub async fn count_for(&self, agent_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_one(&self.pool)
            .await
            .context("counting events")?;

        Ok(count)
    }

    /// Trim an agent's event history to at most `keep` rows.
    ///
    /// The newest event per `(agent_id, instance_id)` is always preserved so
    /// the latest sample for every instance stays available for debugging.
    pub async fn prune(&self, agent_id: i64, keep: i64) -> Result<u64> {
        let removed = with_write_retry("prune events", || async {
            sqlx::query(
                r#"
                DELETE FROM events
                WHERE agent_id = ?1
                  AND id NOT IN (
                      SELECT id FROM events WHERE agent_id = ?1 ORDER BY id DESC LIMIT ?2
                  )
                  AND id NOT IN (
                      SELECT MAX(id) FROM events WHERE agent_id = ?1 GROUP BY instance_id
                  )
                "#,
            )
            .bind(agent_id)
            .bind(keep)
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
        })
        .await
        .context("pruning events")?;

        if removed > 0 {
            log::debug!("pruned {removed} events for agent {agent_id}");
        }
        Ok(removed)
    }

    /// Record an operation performed through the REST layer.
    pub async fn log_operation(
        &self,
        tunnel_id: Option<i64>,
        tunnel_name: &str,
        action: &str,
        status: &str,
        message: Option<&str>,
    ) -> Result<()> {
        with_write_retry("log operation", || async {
            sqlx::query(
                "INSERT INTO operation_log (tunnel_id, tunnel_name, action, status, message, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(tunnel_id)
            .bind(tunnel_name)
            .bind(action)
            .bind(status)
            .bind(message)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
        .context("recording operation log")?;

        Ok(())
    }
}
