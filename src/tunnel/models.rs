//! Tunnel data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A tunnel instance hosted by an agent.
///
/// Rows mirror whatever the agent reports: `mode` and `status` are stored
/// verbatim ("server"/"client", "running"/"stopped"/"error") rather than
/// re-validated, since the agent owns the data plane.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TunnelInstance {
    pub id: i64,
    /// Owning agent.
    pub agent_id: i64,
    /// Opaque short ID assigned by the agent; unique per agent.
    pub instance_id: String,
    /// Display name; defaults to the instance ID.
    pub name: String,
    /// "server" or "client".
    pub mode: String,
    /// "running", "stopped" or "error".
    pub status: String,
    pub tunnel_address: String,
    pub tunnel_port: String,
    pub target_address: String,
    pub target_port: String,
    /// "inherit", "mode0", "mode1" or "mode2".
    pub tls_mode: String,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub log_level: String,
    /// Full command line the instance was created from.
    pub command_line: String,
    /// Connection pool lower bound, when present in the command line.
    pub min: Option<i64>,
    /// Connection pool upper bound, when present in the command line.
    pub max: Option<i64>,
    pub tcp_rx: i64,
    pub tcp_tx: i64,
    pub udp_rx: i64,
    pub udp_tx: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Event time of the most recent accepted update.
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Filters for tunnel listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelFilters {
    pub agent_id: Option<i64>,
    pub status: Option<String>,
    /// Substring match on name or instance ID.
    pub search: Option<String>,
}
