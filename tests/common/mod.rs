//! Test utilities and common setup.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nodepassdash::agent::{Agent, AgentRepository};
use nodepassdash::db::Database;
use nodepassdash::event::EventRepository;
use nodepassdash::sse::{EventPipeline, LivenessClock, PipelineConfig, SseHub};
use nodepassdash::tunnel::TunnelRepository;

/// Everything a test needs to drive the event core against an in-memory
/// database.
pub struct TestCore {
    pub db: Database,
    pub agents: AgentRepository,
    pub tunnels: TunnelRepository,
    pub events: EventRepository,
    pub hub: Arc<SseHub>,
    pub liveness: Arc<LivenessClock>,
    pub pipeline: EventPipeline,
}

/// Build a core with default pipeline tuning (two workers).
pub async fn test_core() -> TestCore {
    test_core_with(PipelineConfig {
        workers: 2,
        ..PipelineConfig::default()
    })
    .await
}

/// Build a core with explicit pipeline tuning.
pub async fn test_core_with(config: PipelineConfig) -> TestCore {
    let db = Database::in_memory().await.unwrap();

    let agents = AgentRepository::new(db.pool().clone());
    let tunnels = TunnelRepository::new(db.pool().clone());
    let events = EventRepository::new(db.pool().clone());
    let hub = Arc::new(SseHub::default());
    let liveness = Arc::new(LivenessClock::new());

    let pipeline = EventPipeline::start(
        tunnels.clone(),
        events.clone(),
        hub.clone(),
        liveness.clone(),
        config,
    );

    TestCore {
        db,
        agents,
        tunnels,
        events,
        hub,
        liveness,
        pipeline,
    }
}

impl TestCore {
    /// Register a test agent pointing at a placeholder address.
    pub async fn seed_agent(&self, name: &str) -> Agent {
        self.agents
            .create(name, "http://127.0.0.1:18080", "/api", "test-key")
            .await
            .unwrap()
    }
}

/// Poll an async condition until it holds, or panic after ~2 seconds.
pub async fn eventually<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline: {what}");
}

/// Build an upstream frame carrying a single instance.
pub fn instance_frame(
    kind: &str,
    time: &str,
    id: &str,
    instance_type: &str,
    status: &str,
    url: &str,
    traffic: (i64, i64, i64, i64),
) -> String {
    serde_json::json!({
        "type": kind,
        "time": time,
        "instance": {
            "id": id,
            "type": instance_type,
            "status": status,
            "url": url,
            "tcprx": traffic.0,
            "tcptx": traffic.1,
            "udprx": traffic.2,
            "udptx": traffic.3,
        }
    })
    .to_string()
}

/// Build an `initial` frame carrying a full inventory.
pub fn initial_frame(instances: &[serde_json::Value]) -> String {
    serde_json::json!({
        "type": "initial",
        "time": "2025-01-01T00:00:00Z",
        "instances": instances,
    })
    .to_string()
}

/// One instance object for `initial_frame`.
pub fn instance_json(
    id: &str,
    instance_type: &str,
    status: &str,
    url: &str,
    traffic: (i64, i64, i64, i64),
) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": instance_type,
        "status": status,
        "url": url,
        "tcprx": traffic.0,
        "tcptx": traffic.1,
        "udprx": traffic.2,
        "udptx": traffic.3,
    })
}
