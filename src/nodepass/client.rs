//! NodePass HTTP client.
//!
//! Thin synchronous-style wrapper over the agent's control API. All calls
//! carry the `X-API-Key` header and a 15 second timeout; TLS verification is
//! disabled because agents commonly run self-signed certificates. Effects of
//! these commands flow back through the SSE pipeline as `create`/`update`/
//! `delete` events.

use std::time::Duration;

use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::agent::Agent;

use super::error::{NodePassError, NodePassResult};
use super::types::*;

/// Request timeout for agent commands.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for one agent's control API.
#[derive(Debug, Clone)]
pub struct NodePassClient {
    client: Client,
    base_url: String,
    api_path: String,
    api_key: String,
}

impl NodePassClient {
    /// Create a client for the given endpoint coordinates.
    pub fn new(
        base_url: impl Into<String>,
        api_path: impl Into<String>,
        api_key: impl Into<String>,
    ) -> NodePassResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_path: api_path.into(),
            api_key: api_key.into(),
        })
    }

    /// Create a client from a stored agent row.
    pub fn for_agent(agent: &Agent) -> NodePassResult<Self> {
        Self::new(&agent.base_url, &agent.api_path, &agent.api_key)
    }

    /// List all instances hosted by the agent.
    pub async fn list_instances(&self) -> NodePassResult<Vec<InstanceSummary>> {
        let url = self.instances_url();
        let response = self.send::<()>(Method::GET, &url, None).await?;
        parse_json(response).await
    }

    /// Create a tunnel instance from a command line. Returns the assigned
    /// instance ID and its initial status.
    pub async fn create_instance(&self, command_line: &str) -> NodePassResult<(String, String)> {
        let url = self.instances_url();
        let body = CommandBody { url: command_line };
        let response = self.send(Method::POST, &url, Some(&body)).await?;
        let created: CreateResponse = parse_json(response).await?;
        Ok((created.id, created.status))
    }

    /// Delete an instance.
    pub async fn delete_instance(&self, instance_id: &str) -> NodePassResult<()> {
        let url = self.instance_url(instance_id);
        self.send::<()>(Method::DELETE, &url, None).await?;
        Ok(())
    }

    /// Start, stop or restart an instance. Returns the resulting status.
    pub async fn control_instance(
        &self,
        instance_id: &str,
        action: InstanceAction,
    ) -> NodePassResult<String> {
        let url = self.instance_url(instance_id);
        let body = ActionBody {
            action: action.to_string(),
        };
        let response = self.send(Method::PATCH, &url, Some(&body)).await?;
        let status: StatusResponse = parse_json(response).await?;
        Ok(status.status)
    }

    /// Replace an instance's command line.
    pub async fn update_instance(
        &self,
        instance_id: &str,
        command_line: &str,
    ) -> NodePassResult<()> {
        let url = self.instance_url(instance_id);
        let body = CommandBody { url: command_line };
        self.send(Method::PUT, &url, Some(&body)).await?;
        Ok(())
    }

    fn instances_url(&self) -> String {
        format!("{}{}/instances", self.base_url, self.api_path)
    }

    fn instance_url(&self, instance_id: &str) -> String {
        format!("{}{}/instances/{}", self.base_url, self.api_path, instance_id)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> NodePassResult<reqwest::Response> {
        let mut request = self
            .client
            .request(method, url)
            .header("X-API-Key", &self.api_key);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodePassError::ApiStatus { status });
        }
        Ok(response)
    }
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> NodePassResult<T> {
    response
        .json()
        .await
        .map_err(|err| NodePassError::ParseError(err.to_string()))
}
