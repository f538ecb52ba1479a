//! Event data models and the upstream wire format.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle event types pushed by agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EventType {
    /// Bulk inventory sync sent right after an SSE subscription opens.
    Initial,
    Create,
    Update,
    Delete,
    Log,
    Shutdown,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Initial => write!(f, "initial"),
            EventType::Create => write!(f, "create"),
            EventType::Update => write!(f, "update"),
            EventType::Delete => write!(f, "delete"),
            EventType::Log => write!(f, "log"),
            EventType::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(EventType::Initial),
            "create" => Ok(EventType::Create),
            "update" => Ok(EventType::Update),
            "delete" => Ok(EventType::Delete),
            "log" => Ok(EventType::Log),
            "shutdown" => Ok(EventType::Shutdown),
            _ => Err(format!("unknown event type: {}", s)),
        }
    }
}

/// A normalized event as produced by the pipeline and published to browsers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub agent_id: i64,
    pub instance_id: String,
    pub event_type: EventType,
    /// The frame's literal `type` string, kept for the audit trail.
    pub push_type: String,
    pub event_time: DateTime<Utc>,
    pub status: Option<String>,
    pub url: Option<String>,
    pub instance_type: Option<String>,
    pub tcp_rx: i64,
    pub tcp_tx: i64,
    pub udp_rx: i64,
    pub udp_tx: i64,
    pub logs: Option<String>,
}

/// A persisted raw event row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub agent_id: i64,
    pub instance_id: String,
    pub event_type: EventType,
    pub push_type: String,
    pub event_time: DateTime<Utc>,
    pub status: Option<String>,
    pub url: Option<String>,
    pub instance_type: Option<String>,
    pub tcp_rx: i64,
    pub tcp_tx: i64,
    pub udp_rx: i64,
    pub udp_tx: i64,
    pub logs: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Pagination and filters for log queries.
#[derive(Debug, Clone, Deserialize)]
pub struct LogQuery {
    pub instance_id: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    100
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            instance_id: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

/// One instance as reported inside an upstream frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstancePayload {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub instance_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub tcprx: i64,
    #[serde(default)]
    pub tcptx: i64,
    #[serde(default)]
    pub udprx: i64,
    #[serde(default)]
    pub udptx: i64,
}

/// The JSON payload of one upstream SSE frame.
#[derive(Debug, Clone, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub kind: String,
    /// String or numeric timestamp; tolerated loosely.
    #[serde(default)]
    pub time: Option<serde_json::Value>,
    #[serde(default)]
    pub logs: Option<serde_json::Value>,
    #[serde(default)]
    pub instance: Option<InstancePayload>,
    /// Only present on `initial` frames.
    #[serde(default)]
    pub instances: Option<Vec<InstancePayload>>,
}

impl EventFrame {
    /// Normalize this frame into one `RawEvent` per instance.
    ///
    /// `initial` frames expand their `instances` array (falling back to the
    /// single `instance` field some agent builds use). Frames without any
    /// instance (a bare `log` or `shutdown`) still yield one event with an
    /// empty instance ID so the audit log captures them.
    pub fn into_raw_events(self, agent_id: i64, received_at: DateTime<Utc>) -> Vec<RawEvent> {
        let Ok(event_type) = self.kind.parse::<EventType>() else {
            return Vec::new();
        };

        let event_time = parse_event_time(self.time.as_ref()).unwrap_or(received_at);
        let logs = self.logs.map(coerce_to_string);

        let instances: Vec<InstancePayload> = if event_type == EventType::Initial {
            match (self.instances, self.instance) {
                (Some(list), _) => list,
                (None, Some(single)) => vec![single],
                (None, None) => Vec::new(),
            }
        } else {
            self.instance.into_iter().collect()
        };

        if instances.is_empty() {
            return vec![RawEvent {
                agent_id,
                instance_id: String::new(),
                event_type,
                push_type: self.kind.clone(),
                event_time,
                status: None,
                url: None,
                instance_type: None,
                tcp_rx: 0,
                tcp_tx: 0,
                udp_rx: 0,
                udp_tx: 0,
                logs,
            }];
        }

        instances
            .into_iter()
            .map(|inst| RawEvent {
                agent_id,
                instance_id: inst.id,
                event_type,
                push_type: self.kind.clone(),
                event_time,
                status: non_empty(inst.status),
                url: non_empty(inst.url),
                instance_type: non_empty(inst.instance_type),
                tcp_rx: inst.tcprx,
                tcp_tx: inst.tcptx,
                udp_rx: inst.udprx,
                udp_tx: inst.udptx,
                logs: logs.clone(),
            })
            .collect()
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn coerce_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Best-effort parse of the frame `time` field: RFC 3339 strings, or unix
/// timestamps in seconds or milliseconds.
fn parse_event_time(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    match value? {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        serde_json::Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > 1_000_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}
