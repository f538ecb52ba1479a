//! Upstream SSE client: one long-lived subscription per agent.
//!
//! Transport failures reconnect forever with exponential backoff; an HTTP
//! error status on subscribe is terminal and bubbles up so the supervisor
//! can mark the agent FAIL. Agents routinely run self-signed certificates,
//! so TLS verification is disabled on purpose.

use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::{header, StatusCode};
use thiserror::Error;
use tokio::sync::watch;

use crate::agent::Agent;

use super::pipeline::IngressSender;

/// Base delay for exponential backoff (milliseconds).
const BASE_BACKOFF_MS: u64 = 500;

/// Maximum backoff delay (milliseconds).
const MAX_BACKOFF_MS: u64 = 30_000;

/// Connect timeout for the subscribe request. The stream itself has no
/// overall timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Terminal subscription failures.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The agent answered the subscribe request with a non-success status.
    #[error("agent returned HTTP {0} for the event stream")]
    Status(StatusCode),

    /// The HTTP client could not be constructed.
    #[error("building HTTP client: {0}")]
    Client(reqwest::Error),
}

enum StreamEnd {
    Cancelled,
    Disconnected,
}

enum Attempt {
    Ended(StreamEnd),
    Transport(String),
}

/// SSE reader for a single agent.
pub struct UpstreamClient {
    agent_id: i64,
    events_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl UpstreamClient {
    /// Build a client for the given agent.
    pub fn new(agent: &Agent) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(UpstreamError::Client)?;

        Ok(Self {
            agent_id: agent.id,
            events_url: agent.events_url(),
            api_key: agent.api_key.clone(),
            client,
        })
    }

    /// Subscribe and pump frames onto the ingress queue until cancelled.
    ///
    /// Returns `Ok(())` on cancellation and `Err` only for terminal
    /// subscription failures.
    pub async fn run(
        &self,
        mut cancel: watch::Receiver<bool>,
        ingress: IngressSender,
    ) -> Result<(), UpstreamError> {
        let mut attempt = 0u32;

        loop {
            if *cancel.borrow() {
                return Ok(());
            }

            if attempt > 0 {
                let delay = backoff_delay(attempt);
                debug!(
                    "agent {}: reconnecting in {:?} (attempt {attempt})",
                    self.agent_id, delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => return Ok(()),
                }
            }

            match self.subscribe_once(&mut cancel, &ingress).await? {
                Attempt::Ended(StreamEnd::Cancelled) => return Ok(()),
                Attempt::Ended(StreamEnd::Disconnected) => {
                    warn!("agent {}: event stream ended, reconnecting", self.agent_id);
                    attempt = 1;
                }
                Attempt::Transport(reason) => {
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "agent {}: connection failed (attempt {attempt}): {reason}",
                        self.agent_id
                    );
                }
            }
        }
    }

    async fn subscribe_once(
        &self,
        cancel: &mut watch::Receiver<bool>,
        ingress: &IngressSender,
    ) -> Result<Attempt, UpstreamError> {
        let request = self
            .client
            .get(&self.events_url)
            .header("X-API-Key", &self.api_key)
            .header(header::ACCEPT, "text/event-stream")
            .send();

        let response = tokio::select! {
            result = request => match result {
                Ok(response) => response,
                Err(err) => return Ok(Attempt::Transport(err.to_string())),
            },
            _ = cancel.changed() => return Ok(Attempt::Ended(StreamEnd::Cancelled)),
        };

        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }

        info!("agent {}: event stream connected", self.agent_id);

        let mut parser = FrameParser::new();
        let mut stream = response.bytes_stream();

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for payload in parser.feed(&bytes) {
                            ingress.push(self.agent_id, payload);
                        }
                    }
                    Some(Err(err)) => return Ok(Attempt::Transport(err.to_string())),
                    None => return Ok(Attempt::Ended(StreamEnd::Disconnected)),
                },
                _ = cancel.changed() => return Ok(Attempt::Ended(StreamEnd::Cancelled)),
            }
        }
    }
}

/// Exponential backoff with up to 20% jitter, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_MS as f64;
    let exp = 2.0_f64.powi(attempt.min(10) as i32);
    let delay = (base * exp) as u64;
    let jitter = (delay as f64 * 0.2 * rand::random::<f64>()) as u64;
    Duration::from_millis((delay + jitter).min(MAX_BACKOFF_MS))
}

/// Incremental SSE frame parser.
///
/// Frames are delimited by a blank line; CRLF is normalized to LF first. A
/// frame's payload is the concatenation of its `data:` line values; other
/// fields are ignored. Buffering is byte-oriented so multi-byte characters
/// split across reads survive intact.
pub struct FrameParser {
    buffer: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk of bytes; returns the payloads of any completed frames.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        // Normalize CRLF to LF. A trailing CR may belong to a CRLF split
        // across chunks, so it stays buffered until the next chunk decides.
        let bytes = &self.buffer;
        let mut normalized = Vec::with_capacity(bytes.len());
        let mut tail_cr = false;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\r' if i + 1 == bytes.len() => {
                    tail_cr = true;
                    i += 1;
                }
                b'\r' if bytes[i + 1] == b'\n' => {
                    normalized.push(b'\n');
                    i += 2;
                }
                b => {
                    normalized.push(b);
                    i += 1;
                }
            }
        }

        // Cut complete frames off the normalized stream.
        let mut payloads = Vec::new();
        let mut start = 0usize;
        let mut pos = 0usize;
        while pos + 1 < normalized.len() {
            if normalized[pos] == b'\n' && normalized[pos + 1] == b'\n' {
                if let Some(payload) = frame_payload(&normalized[start..pos]) {
                    payloads.push(payload);
                }
                pos += 2;
                start = pos;
            } else {
                pos += 1;
            }
        }

        let mut remainder = normalized[start..].to_vec();
        if tail_cr {
            remainder.push(b'\r');
        }
        self.buffer = remainder;
        payloads
    }
}

/// Concatenate the values of a frame's `data:` lines.
fn frame_payload(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let mut payload = String::new();
    for line in text.split('\n') {
        if let Some(value) = line.strip_prefix("data:") {
            payload.push_str(value.trim());
        }
    }
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"data: {\"type\":\"update\"}\n\n");
        assert_eq!(frames, vec!["{\"type\":\"update\"}".to_string()]);
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: {\"a\":").is_empty());
        let frames = parser.feed(b"1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(frames, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[test]
    fn crlf_normalized() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(frames, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn crlf_split_across_chunks() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: one\r").is_empty());
        let frames = parser.feed(b"\n\r\n");
        assert_eq!(frames, vec!["one".to_string()]);
    }

    #[test]
    fn multiple_data_lines_concatenated() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(frames, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn non_data_fields_ignored() {
        let mut parser = FrameParser::new();
        let frames = parser.feed(b"event: update\nid: 42\ndata: payload\nretry: 100\n\n");
        assert_eq!(frames, vec!["payload".to_string()]);
    }

    #[test]
    fn comment_only_frame_skipped() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b": keepalive\n\n").is_empty());
    }

    #[test]
    fn backoff_is_capped() {
        for attempt in 1..=20 {
            let delay = backoff_delay(attempt);
            assert!(delay <= Duration::from_millis(MAX_BACKOFF_MS));
            assert!(delay >= Duration::from_millis(BASE_BACKOFF_MS));
        }
    }
}
