//! Supervisor lifecycle: status state machine, failure policy, restart replay.

mod common;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, Response, StatusCode},
    routing::get,
    Router,
};
use futures::{stream, StreamExt};
use tokio::net::TcpListener;

use common::{eventually, test_core};
use nodepassdash::agent::AgentStatus;
use nodepassdash::sse::{ConnectionSupervisor, SupervisorConfig};

/// What the stub agent does when the dashboard subscribes.
#[derive(Clone)]
enum StubBehavior {
    /// Reject the subscription outright.
    Unauthorized,
    /// Serve the given SSE frames, then keep the stream open.
    Frames(Arc<Vec<String>>),
}

async fn spawn_stub_agent(behavior: StubBehavior) -> SocketAddr {
    let app = Router::new()
        .route("/api/events", get(stub_events))
        .with_state(behavior);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn stub_events(State(behavior): State<StubBehavior>) -> Response<Body> {
    match behavior {
        StubBehavior::Unauthorized => Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(Body::empty())
            .unwrap(),
        StubBehavior::Frames(frames) => {
            let frames: Vec<Result<Bytes, Infallible>> = frames
                .iter()
                .map(|payload| Ok(Bytes::from(format!("data: {}\n\n", payload))))
                .collect();
            // Serve the script, then hold the connection open forever.
            let body = Body::from_stream(stream::iter(frames).chain(stream::pending()));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(body)
                .unwrap()
        }
    }
}

#[tokio::test]
async fn terminal_subscription_error_marks_agent_fail_once() {
    let core = test_core().await;
    let addr = spawn_stub_agent(StubBehavior::Unauthorized).await;

    let agent = core
        .agents
        .create("bad", &format!("http://{}", addr), "/api", "wrong-key")
        .await
        .unwrap();

    let supervisor = Arc::new(ConnectionSupervisor::new(
        core.agents.clone(),
        core.pipeline.ingress(),
        core.liveness.clone(),
        SupervisorConfig::default(),
    ));

    supervisor.connect(&agent).await.unwrap();

    eventually("agent marked FAIL", || async {
        core.agents.get(agent.id).await.unwrap().unwrap().status == AgentStatus::Fail
    })
    .await;

    // The FAIL write is conditional: repeating it touches nothing.
    assert!(!core.agents.mark_fail(agent.id).await.unwrap());

    // A failed agent is not reconnected by system initialization.
    let reconnectable = core.agents.list_connectable().await.unwrap();
    assert!(reconnectable.iter().all(|a| a.id != agent.id));

    supervisor.close().await;
    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn connect_streams_inventory_and_marks_online() {
    let core = test_core().await;

    let initial = serde_json::json!({
        "type": "initial",
        "instances": [
            {"id": "a", "type": "client", "status": "running",
             "url": "client://:3004/:3008?log=debug", "tcprx": 0, "tcptx": 0, "udprx": 0, "udptx": 0},
            {"id": "b", "type": "server", "status": "stopped",
             "url": "server://:80/127.0.0.1:8080?tls=1", "tcprx": 0, "tcptx": 0, "udprx": 0, "udptx": 0}
        ]
    })
    .to_string();
    let addr = spawn_stub_agent(StubBehavior::Frames(Arc::new(vec![initial]))).await;

    let agent = core
        .agents
        .create("a1", &format!("http://{}", addr), "/api", "k")
        .await
        .unwrap();

    let supervisor = Arc::new(ConnectionSupervisor::new(
        core.agents.clone(),
        core.pipeline.ingress(),
        core.liveness.clone(),
        SupervisorConfig::default(),
    ));

    supervisor.connect(&agent).await.unwrap();
    assert!(supervisor.is_connected(agent.id));

    eventually("inventory mirrored over sse", || async {
        core.agents.get(agent.id).await.unwrap().unwrap().tunnel_count == 2
    })
    .await;

    let stored = core.agents.get(agent.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AgentStatus::Online);
    assert!(core.liveness.last_seen(agent.id).is_some());

    supervisor.close().await;
    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn restart_replay_produces_no_row_mutations() {
    let core = test_core().await;

    let initial = serde_json::json!({
        "type": "initial",
        "instances": [
            {"id": "a", "type": "client", "status": "running",
             "url": "client://:1/:2", "tcprx": 5, "tcptx": 5, "udprx": 0, "udptx": 0}
        ]
    })
    .to_string();
    let addr = spawn_stub_agent(StubBehavior::Frames(Arc::new(vec![initial]))).await;

    let agent = core
        .agents
        .create("a1", &format!("http://{}", addr), "/api", "k")
        .await
        .unwrap();

    let supervisor = Arc::new(ConnectionSupervisor::new(
        core.agents.clone(),
        core.pipeline.ingress(),
        core.liveness.clone(),
        SupervisorConfig::default(),
    ));

    supervisor.connect(&agent).await.unwrap();
    eventually("first contact mirrored", || async {
        core.agents.get(agent.id).await.unwrap().unwrap().tunnel_count == 1
    })
    .await;
    let before = core.tunnels.get(agent.id, "a").await.unwrap().unwrap();

    // Clean shutdown, then a fresh supervisor reconnects every non-FAIL
    // agent; the re-sent initial must change nothing.
    supervisor.close().await;

    let supervisor = Arc::new(ConnectionSupervisor::new(
        core.agents.clone(),
        core.pipeline.ingress(),
        core.liveness.clone(),
        SupervisorConfig::default(),
    ));
    supervisor.initialize_system().await.unwrap();

    eventually("agent reconnected", || async {
        supervisor.is_connected(agent.id)
            && core.liveness.last_seen(agent.id).is_some()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let after = core.tunnels.get(agent.id, "a").await.unwrap().unwrap();
    assert_eq!(before.id, after.id);
    assert_eq!(before.created_at, after.created_at);
    assert_eq!(before.updated_at, after.updated_at);
    assert_eq!(before.tcp_rx, after.tcp_rx);
    assert_eq!(
        core.agents.get(agent.id).await.unwrap().unwrap().tunnel_count,
        1
    );

    supervisor.close().await;
    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn disconnect_leaves_status_to_caller() {
    let core = test_core().await;
    let addr = spawn_stub_agent(StubBehavior::Frames(Arc::new(vec![]))).await;

    let agent = core
        .agents
        .create("a1", &format!("http://{}", addr), "/api", "k")
        .await
        .unwrap();

    let supervisor = Arc::new(ConnectionSupervisor::new(
        core.agents.clone(),
        core.pipeline.ingress(),
        core.liveness.clone(),
        SupervisorConfig::default(),
    ));

    supervisor.connect(&agent).await.unwrap();
    eventually("agent online", || async {
        core.agents.get(agent.id).await.unwrap().unwrap().status == AgentStatus::Online
    })
    .await;

    assert!(supervisor.disconnect(agent.id));
    assert!(!supervisor.is_connected(agent.id));
    // Status is untouched until the caller decides.
    assert_eq!(
        core.agents.get(agent.id).await.unwrap().unwrap().status,
        AgentStatus::Online
    );

    // The REST layer then records the explicit disconnect.
    assert!(core.agents.mark_offline(agent.id).await.unwrap());
    assert_eq!(
        core.agents.get(agent.id).await.unwrap().unwrap().status,
        AgentStatus::Offline
    );

    // ...and a later reconnect flips it back.
    let agent = core.agents.get(agent.id).await.unwrap().unwrap();
    supervisor.connect(&agent).await.unwrap();
    eventually("agent online again", || async {
        core.agents.get(agent.id).await.unwrap().unwrap().status == AgentStatus::Online
    })
    .await;

    supervisor.close().await;
    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn silence_watchdog_marks_quiet_agents_offline() {
    let core = test_core().await;
    let addr = spawn_stub_agent(StubBehavior::Frames(Arc::new(vec![]))).await;

    let agent = core
        .agents
        .create("quiet", &format!("http://{}", addr), "/api", "k")
        .await
        .unwrap();

    let supervisor = Arc::new(ConnectionSupervisor::new(
        core.agents.clone(),
        core.pipeline.ingress(),
        core.liveness.clone(),
        SupervisorConfig {
            offline_after: Some(Duration::from_millis(200)),
        },
    ));

    supervisor.connect(&agent).await.unwrap();
    let watchdog = supervisor.spawn_watchdog().expect("watchdog enabled");

    // The stub never sends events, so the agent goes OFFLINE, not FAIL.
    eventually("quiet agent marked OFFLINE", || async {
        core.agents.get(agent.id).await.unwrap().unwrap().status == AgentStatus::Offline
    })
    .await;
    // The upstream connection itself is left alone.
    assert!(supervisor.is_connected(agent.id));

    watchdog.abort();
    supervisor.close().await;
    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn status_writes_are_conditional() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;

    // new agents start OFFLINE
    assert_eq!(
        core.agents.get(agent.id).await.unwrap().unwrap().status,
        AgentStatus::Offline
    );

    assert!(core.agents.mark_online(agent.id).await.unwrap());
    assert!(!core.agents.mark_online(agent.id).await.unwrap());

    assert!(core.agents.mark_offline(agent.id).await.unwrap());
    assert!(core.agents.mark_online(agent.id).await.unwrap());

    assert!(core.agents.mark_fail(agent.id).await.unwrap());
    assert!(!core.agents.mark_fail(agent.id).await.unwrap());

    // The silence watchdog's write only fires on ONLINE agents.
    assert!(!core.agents.mark_offline_if_online(agent.id).await.unwrap());
    assert!(core.agents.mark_online(agent.id).await.unwrap());
    assert!(core.agents.mark_offline_if_online(agent.id).await.unwrap());

    core.pipeline.shutdown().await;
}
