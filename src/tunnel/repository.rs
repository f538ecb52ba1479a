//! Tunnel database repository.
//!
//! All mutations run inside transactions that also refresh the owning
//! agent's `tunnel_count`, and are retried on lock contention.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;

use crate::db::with_write_retry;
use crate::event::RawEvent;

use super::models::{TunnelFilters, TunnelInstance};
use super::url::ParsedTunnelUrl;

const TUNNEL_COLUMNS: &str = "id, agent_id, instance_id, name, mode, status, \
                              tunnel_address, tunnel_port, target_address, target_port, \
                              tls_mode, cert_path, key_path, log_level, command_line, \
                              min, max, tcp_rx, tcp_tx, udp_rx, udp_tx, \
                              created_at, updated_at, last_event_at";

/// Repository for tunnel persistence.
#[derive(Debug, Clone)]
pub struct TunnelRepository {
    pool: SqlitePool,
}

impl TunnelRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Materialize a tunnel row from an `initial`/`create` event.
    ///
    /// Inserts only when `(agent_id, instance_id)` is absent and the event
    /// carries a non-empty instance type; anything else is a no-op, which
    /// makes replayed `initial` bursts and REST-created instances converge.
    /// Returns true when a row was inserted.
    pub async fn create_from_event(&self, event: &RawEvent, cfg: &ParsedTunnelUrl) -> Result<bool> {
        let instance_type = match event.instance_type.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(false),
        };
        if event.instance_id.is_empty() {
            return Ok(false);
        }

        let inserted = with_write_retry("create tunnel", || async {
            let mut tx = self.pool.begin().await?;

            let exists: i64 = sqlx::query_scalar(
                "SELECT COUNT(1) FROM tunnels WHERE agent_id = ? AND instance_id = ?",
            )
            .bind(event.agent_id)
            .bind(&event.instance_id)
            .fetch_one(&mut *tx)
            .await?;

            if exists > 0 {
                tx.commit().await?;
                return Ok(false);
            }

            let now = Utc::now();
            sqlx::query(
                r#"
                INSERT INTO tunnels (
                    agent_id, instance_id, name, mode, status,
                    tunnel_address, tunnel_port, target_address, target_port,
                    tls_mode, cert_path, key_path, log_level, command_line,
                    min, max, tcp_rx, tcp_tx, udp_rx, udp_tx,
                    created_at, updated_at, last_event_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.agent_id)
            .bind(&event.instance_id)
            .bind(&event.instance_id)
            .bind(instance_type)
            .bind(event.status.as_deref().unwrap_or("stopped"))
            .bind(&cfg.tunnel_address)
            .bind(&cfg.tunnel_port)
            .bind(&cfg.target_address)
            .bind(&cfg.target_port)
            .bind(&cfg.tls_mode)
            .bind(empty_to_none(&cfg.cert_path))
            .bind(empty_to_none(&cfg.key_path))
            .bind(&cfg.log_level)
            .bind(event.url.as_deref().unwrap_or(""))
            .bind(cfg.min)
            .bind(cfg.max)
            .bind(event.tcp_rx)
            .bind(event.tcp_tx)
            .bind(event.udp_rx)
            .bind(event.udp_tx)
            .bind(now)
            .bind(now)
            .bind(event.event_time)
            .execute(&mut *tx)
            .await?;

            refresh_tunnel_count(&mut tx, event.agent_id).await?;
            tx.commit().await?;
            Ok(true)
        })
        .await
        .context("creating tunnel from event")?;

        Ok(inserted)
    }

    /// Apply a single `update` event. Returns true when the row was written.
    pub async fn apply_update(&self, event: &RawEvent) -> Result<bool> {
        let applied = with_write_retry("update tunnel", || async {
            let mut tx = self.pool.begin().await?;
            let applied = update_in_tx(&mut tx, event).await?;
            tx.commit().await?;
            Ok(applied)
        })
        .await
        .context("updating tunnel from event")?;

        Ok(applied)
    }

    /// Apply a batch of coalesced `update` events in one transaction,
    /// continuing past per-row errors. Returns the number of rows written.
    pub async fn apply_update_batch(&self, events: &[RawEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let applied = with_write_retry("apply update batch", || async {
            let mut tx = self.pool.begin().await?;
            let mut applied = 0usize;
            for event in events {
                match update_in_tx(&mut tx, event).await {
                    Ok(true) => applied += 1,
                    Ok(false) => {}
                    Err(err) => {
                        log::warn!(
                            "batch update for agent {} instance {} failed: {err}",
                            event.agent_id,
                            event.instance_id
                        );
                    }
                }
            }
            tx.commit().await?;
            Ok(applied)
        })
        .await
        .context("applying update batch")?;

        Ok(applied)
    }

    /// Remove the tunnel row for a `delete` event. Unknown instances are a
    /// no-op. Returns true when a row was removed.
    pub async fn delete_from_event(&self, agent_id: i64, instance_id: &str) -> Result<bool> {
        let removed = with_write_retry("delete tunnel", || async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query("DELETE FROM tunnels WHERE agent_id = ? AND instance_id = ?")
                .bind(agent_id)
                .bind(instance_id)
                .execute(&mut *tx)
                .await?;

            if result.rows_affected() > 0 {
                refresh_tunnel_count(&mut tx, agent_id).await?;
            }
            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        })
        .await
        .context("deleting tunnel from event")?;

        Ok(removed)
    }

    /// Get a tunnel by its `(agent_id, instance_id)` key.
    pub async fn get(&self, agent_id: i64, instance_id: &str) -> Result<Option<TunnelInstance>> {
        let tunnel = sqlx::query_as::<_, TunnelInstance>(&format!(
            "SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE agent_id = ? AND instance_id = ?"
        ))
        .bind(agent_id)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching tunnel")?;

        Ok(tunnel)
    }

    /// Get a tunnel by instance ID alone (used by per-instance browser
    /// streams, where the agent is not part of the route).
    pub async fn get_by_instance(&self, instance_id: &str) -> Result<Option<TunnelInstance>> {
        let tunnel = sqlx::query_as::<_, TunnelInstance>(&format!(
            "SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE instance_id = ? ORDER BY id LIMIT 1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching tunnel by instance")?;

        Ok(tunnel)
    }

    /// List tunnels matching the given filters.
    pub async fn list(&self, filters: &TunnelFilters) -> Result<Vec<TunnelInstance>> {
        let mut sql = format!("SELECT {TUNNEL_COLUMNS} FROM tunnels WHERE 1 = 1");
        if filters.agent_id.is_some() {
            sql.push_str(" AND agent_id = ?");
        }
        if filters.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filters.search.is_some() {
            sql.push_str(" AND (name LIKE ? OR instance_id LIKE ?)");
        }
        sql.push_str(" ORDER BY agent_id, instance_id");

        let mut query = sqlx::query_as::<_, TunnelInstance>(&sql);
        if let Some(agent_id) = filters.agent_id {
            query = query.bind(agent_id);
        }
        if let Some(ref status) = filters.status {
            query = query.bind(status.clone());
        }
        if let Some(ref search) = filters.search {
            let pattern = format!("%{}%", search);
            query = query.bind(pattern.clone()).bind(pattern);
        }

        let tunnels = query
            .fetch_all(&self.pool)
            .await
            .context("listing tunnels")?;

        Ok(tunnels)
    }
}

/// Update one tunnel row inside an open transaction.
///
/// Drops the event when the row is absent (update-before-create race), when
/// nothing actually changed, or when the event time is not strictly newer
/// than the stored `last_event_at`.
async fn update_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &RawEvent,
) -> sqlx::Result<bool> {
    let conn: &mut SqliteConnection = &mut *tx;

    let current = sqlx::query_as::<_, CurrentRow>(
        "SELECT status, tcp_rx, tcp_tx, udp_rx, udp_tx, last_event_at \
         FROM tunnels WHERE agent_id = ? AND instance_id = ?",
    )
    .bind(event.agent_id)
    .bind(&event.instance_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(current) = current else {
        log::debug!(
            "update for unknown instance {} on agent {}, dropping",
            event.instance_id,
            event.agent_id
        );
        return Ok(false);
    };

    let new_status = match event.status.as_deref() {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => current.status.clone(),
    };

    let status_changed = new_status != current.status;
    let traffic_changed = current.tcp_rx != event.tcp_rx
        || current.tcp_tx != event.tcp_tx
        || current.udp_rx != event.udp_rx
        || current.udp_tx != event.udp_tx;

    if !status_changed && !traffic_changed {
        return Ok(false);
    }

    if let Some(last) = current.last_event_at {
        if event.event_time <= last {
            log::debug!(
                "stale event time for instance {}, dropping",
                event.instance_id
            );
            return Ok(false);
        }
    }

    sqlx::query(
        "UPDATE tunnels SET status = ?, tcp_rx = ?, tcp_tx = ?, udp_rx = ?, udp_tx = ?, \
         last_event_at = ?, updated_at = ? WHERE agent_id = ? AND instance_id = ?",
    )
    .bind(&new_status)
    .bind(event.tcp_rx)
    .bind(event.tcp_tx)
    .bind(event.udp_rx)
    .bind(event.udp_tx)
    .bind(event.event_time)
    .bind(Utc::now())
    .bind(event.agent_id)
    .bind(&event.instance_id)
    .execute(&mut *conn)
    .await?;

    Ok(true)
}

/// Recompute the owning agent's tunnel count within the same transaction.
async fn refresh_tunnel_count(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    agent_id: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE agents SET tunnel_count = \
         (SELECT COUNT(*) FROM tunnels WHERE agent_id = ?) WHERE id = ?",
    )
    .bind(agent_id)
    .bind(agent_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct CurrentRow {
    status: String,
    tcp_rx: i64,
    tcp_tx: i64,
    udp_rx: i64,
    udp_tx: i64,
    last_event_at: Option<chrono::DateTime<Utc>>,
}

fn empty_to_none(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
