//! Agent data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Connection status of an agent.
///
/// Mutated only by the connection supervisor (ONLINE/FAIL) or an explicit
/// disconnect request (OFFLINE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    /// Upstream SSE subscription is established.
    Online,
    /// Disconnected on request; eligible for reconnection.
    Offline,
    /// Subscription failed terminally; not reconnected until asked.
    Fail,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "ONLINE"),
            AgentStatus::Offline => write!(f, "OFFLINE"),
            AgentStatus::Fail => write!(f, "FAIL"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ONLINE" => Ok(AgentStatus::Online),
            "OFFLINE" => Ok(AgentStatus::Offline),
            "FAIL" => Ok(AgentStatus::Fail),
            _ => Err(format!("unknown agent status: {}", s)),
        }
    }
}

/// A registered NodePass agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    /// Numeric agent ID.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Base URL of the agent's control API (e.g. "http://10.0.0.1:8080").
    pub base_url: String,
    /// API path prefix (e.g. "/api").
    pub api_path: String,
    /// API key sent as `X-API-Key`.
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Current connection status.
    pub status: AgentStatus,
    /// Derived count of tunnel instances hosted by this agent.
    pub tunnel_count: i64,
    /// When the status was last written.
    pub last_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// URL of the agent's SSE event stream.
    pub fn events_url(&self) -> String {
        format!("{}{}/events", self.base_url, self.api_path)
    }
}
