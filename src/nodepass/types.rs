//! NodePass API wire types.

use serde::{Deserialize, Serialize};

/// A tunnel instance as returned by `GET /instances`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSummary {
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

/// Control actions accepted by `PATCH /instances/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAction {
    Start,
    Stop,
    Restart,
}

impl std::fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceAction::Start => write!(f, "start"),
            InstanceAction::Stop => write!(f, "stop"),
            InstanceAction::Restart => write!(f, "restart"),
        }
    }
}

#[derive(Serialize)]
pub(super) struct CommandBody<'a> {
    pub url: &'a str,
}

#[derive(Serialize)]
pub(super) struct ActionBody {
    pub action: String,
}

#[derive(Deserialize)]
pub(super) struct CreateResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Deserialize)]
pub(super) struct StatusResponse {
    #[serde(default)]
    pub status: String,
}
