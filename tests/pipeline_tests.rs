//! Pipeline behavior: ingest semantics, coalescing, idempotence.

mod common;

use std::time::Duration;

use common::{eventually, initial_frame, instance_frame, instance_json, test_core};
use nodepassdash::sse::PipelineConfig;
use nodepassdash::tunnel::TunnelFilters;

#[tokio::test]
async fn initial_sync_materializes_inventory() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;

    // A browser subscribed to one of the instances must NOT see the bulk
    // sync as a per-instance notification.
    let mut rx = core.hub.attach("browser-1");
    core.hub.subscribe("browser-1", "a");

    let ingress = core.pipeline.ingress();
    ingress.push(
        agent.id,
        initial_frame(&[
            instance_json(
                "a",
                "client",
                "running",
                "client://:3004/:3008?log=debug&min=10&max=100",
                (0, 0, 0, 0),
            ),
            instance_json("b", "server", "stopped", "server://:80/127.0.0.1:8080?tls=1", (0, 0, 0, 0)),
        ]),
    );

    eventually("both tunnels materialized", || async {
        core.agents.get(agent.id).await.unwrap().unwrap().tunnel_count == 2
    })
    .await;

    let a = core.tunnels.get(agent.id, "a").await.unwrap().unwrap();
    assert_eq!(a.mode, "client");
    assert_eq!(a.status, "running");
    assert_eq!(a.tunnel_port, "3004");
    assert_eq!(a.target_port, "3008");
    assert_eq!(a.log_level, "debug");
    assert_eq!(a.min, Some(10));
    assert_eq!(a.max, Some(100));
    assert_eq!(a.tls_mode, "inherit");

    let b = core.tunnels.get(agent.id, "b").await.unwrap().unwrap();
    assert_eq!(b.mode, "server");
    assert_eq!(b.tls_mode, "mode1");
    assert_eq!(b.target_address, "127.0.0.1");

    assert!(rx.try_recv().is_err(), "initial must not publish per-instance");

    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn traffic_burst_coalesces_and_publishes_each_event() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;
    let ingress = core.pipeline.ingress();

    ingress.push(
        agent.id,
        instance_frame(
            "create",
            "2025-01-01T00:00:00Z",
            "a",
            "client",
            "running",
            "client://:3004/:3008",
            (0, 0, 0, 0),
        ),
    );
    eventually("tunnel created", || async {
        core.tunnels.get(agent.id, "a").await.unwrap().is_some()
    })
    .await;

    let mut rx = core.hub.attach("browser-1");
    core.hub.subscribe("browser-1", "a");

    for i in 1..=50i64 {
        let time = format!("2025-01-01T00:00:00.{:03}Z", i);
        ingress.push(
            agent.id,
            instance_frame(
                "update",
                &time,
                "a",
                "client",
                "running",
                "",
                (i * 1000, i * 1000, 0, 0),
            ),
        );
    }

    eventually("final counters flushed", || async {
        let row = core.tunnels.get(agent.id, "a").await.unwrap().unwrap();
        row.tcp_rx == 50_000 && row.tcp_tx == 50_000
    })
    .await;

    // Every update is fanned out even though the store writes coalesce.
    let mut published = 0;
    while rx.try_recv().is_ok() {
        published += 1;
    }
    assert_eq!(published, 50);

    let row = core.tunnels.get(agent.id, "a").await.unwrap().unwrap();
    assert_eq!((row.udp_rx, row.udp_tx), (0, 0));

    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn delete_removes_row_and_notifies_subscribers() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;
    let ingress = core.pipeline.ingress();

    ingress.push(
        agent.id,
        initial_frame(&[
            instance_json("a", "client", "running", "client://:1/:2", (0, 0, 0, 0)),
            instance_json("b", "server", "stopped", "server://:3/:4", (0, 0, 0, 0)),
        ]),
    );
    eventually("inventory loaded", || async {
        core.agents.get(agent.id).await.unwrap().unwrap().tunnel_count == 2
    })
    .await;

    let mut rx = core.hub.attach("browser-1");
    core.hub.subscribe("browser-1", "b");

    ingress.push(
        agent.id,
        instance_frame(
            "delete",
            "2025-01-01T00:01:00Z",
            "b",
            "server",
            "stopped",
            "",
            (0, 0, 0, 0),
        ),
    );

    eventually("tunnel b removed", || async {
        core.tunnels.get(agent.id, "b").await.unwrap().is_none()
    })
    .await;

    assert_eq!(
        core.agents.get(agent.id).await.unwrap().unwrap().tunnel_count,
        1
    );

    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("delete publish within deadline")
        .expect("delete publish");
    assert!(frame.contains("\"delete\""));

    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn replaying_a_sequence_is_idempotent() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;
    let ingress = core.pipeline.ingress();

    let sequence = vec![
        instance_frame(
            "create",
            "2025-01-01T00:00:00Z",
            "a",
            "client",
            "running",
            "client://:1/:2",
            (0, 0, 0, 0),
        ),
        instance_frame(
            "update",
            "2025-01-01T00:00:01Z",
            "a",
            "client",
            "running",
            "",
            (100, 200, 0, 0),
        ),
        instance_frame(
            "update",
            "2025-01-01T00:00:02Z",
            "a",
            "client",
            "stopped",
            "",
            (300, 400, 0, 0),
        ),
    ];

    for frame in &sequence {
        ingress.push(agent.id, frame.clone());
    }
    eventually("sequence applied", || async {
        core.tunnels
            .get(agent.id, "a")
            .await
            .unwrap()
            .map(|row| row.tcp_rx == 300 && row.status == "stopped")
            .unwrap_or(false)
    })
    .await;

    let first_pass = core.tunnels.get(agent.id, "a").await.unwrap().unwrap();

    // Replay the whole sequence: the create is absorbed, the updates are
    // stale by event time, and the terminal state is unchanged.
    for frame in &sequence {
        ingress.push(agent.id, frame.clone());
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let second_pass = core.tunnels.get(agent.id, "a").await.unwrap().unwrap();
    assert_eq!(first_pass.status, second_pass.status);
    assert_eq!(first_pass.tcp_rx, second_pass.tcp_rx);
    assert_eq!(first_pass.tcp_tx, second_pass.tcp_tx);
    assert_eq!(first_pass.last_event_at, second_pass.last_event_at);
    assert_eq!(first_pass.updated_at, second_pass.updated_at);
    assert_eq!(first_pass.created_at, second_pass.created_at);
    assert_eq!(
        core.agents.get(agent.id).await.unwrap().unwrap().tunnel_count,
        1
    );

    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn update_before_create_is_dropped() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;
    let ingress = core.pipeline.ingress();

    ingress.push(
        agent.id,
        instance_frame(
            "update",
            "2025-01-01T00:00:00Z",
            "ghost",
            "client",
            "running",
            "",
            (999, 999, 0, 0),
        ),
    );

    // The update lands in the audit log but never creates a row.
    eventually("raw event recorded", || async {
        core.events.count_for(agent.id).await.unwrap() >= 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(core.tunnels.get(agent.id, "ghost").await.unwrap().is_none());

    // The subsequent create still succeeds.
    ingress.push(
        agent.id,
        instance_frame(
            "create",
            "2025-01-01T00:00:01Z",
            "ghost",
            "client",
            "running",
            "client://:1/:2",
            (0, 0, 0, 0),
        ),
    );
    eventually("create succeeds after dropped update", || async {
        core.tunnels.get(agent.id, "ghost").await.unwrap().is_some()
    })
    .await;

    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn reordered_updates_settle_on_newest_event_time() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;
    let ingress = core.pipeline.ingress();

    ingress.push(
        agent.id,
        instance_frame(
            "create",
            "2025-01-01T00:00:00Z",
            "a",
            "client",
            "running",
            "client://:1/:2",
            (0, 0, 0, 0),
        ),
    );
    eventually("tunnel created", || async {
        core.tunnels.get(agent.id, "a").await.unwrap().is_some()
    })
    .await;

    // t2 arrives before t1; the batch buffer keeps the newest sample and
    // the stale one is dropped.
    ingress.push(
        agent.id,
        instance_frame(
            "update",
            "2025-01-01T00:00:02Z",
            "a",
            "client",
            "running",
            "",
            (2000, 2000, 0, 0),
        ),
    );
    ingress.push(
        agent.id,
        instance_frame(
            "update",
            "2025-01-01T00:00:01Z",
            "a",
            "client",
            "running",
            "",
            (1000, 1000, 0, 0),
        ),
    );

    eventually("newest update wins", || async {
        core.tunnels
            .get(agent.id, "a")
            .await
            .unwrap()
            .map(|row| row.tcp_rx == 2000)
            .unwrap_or(false)
    })
    .await;

    // Give a stale straggler another flush window; it must not regress.
    ingress.push(
        agent.id,
        instance_frame(
            "update",
            "2025-01-01T00:00:01.500Z",
            "a",
            "client",
            "running",
            "",
            (1500, 1500, 0, 0),
        ),
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    let row = core.tunnels.get(agent.id, "a").await.unwrap().unwrap();
    assert_eq!(row.tcp_rx, 2000);

    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_are_discarded() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;
    let ingress = core.pipeline.ingress();

    ingress.push(agent.id, "not json at all".to_string());
    ingress.push(agent.id, r#"{"no_type_field": true}"#.to_string());
    ingress.push(agent.id, r#"{"type": "mystery"}"#.to_string());

    // A valid frame after the garbage still flows through.
    ingress.push(
        agent.id,
        instance_frame(
            "create",
            "2025-01-01T00:00:00Z",
            "a",
            "client",
            "running",
            "client://:1/:2",
            (0, 0, 0, 0),
        ),
    );

    eventually("pipeline survives garbage", || async {
        core.tunnels.get(agent.id, "a").await.unwrap().is_some()
    })
    .await;

    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn log_events_are_appended_but_not_materialized() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;
    let ingress = core.pipeline.ingress();

    let frame = serde_json::json!({
        "type": "log",
        "logs": "\u{1b}[32mINFO\u{1b}[0m tunnel ready",
        "instance": {"id": "a"}
    })
    .to_string();
    ingress.push(agent.id, frame);

    eventually("log appended", || async {
        core.events.count_for(agent.id).await.unwrap() == 1
    })
    .await;

    assert!(core.tunnels.get(agent.id, "a").await.unwrap().is_none());

    let logs = core
        .events
        .logs_for(agent.id, &Default::default())
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].logs.as_deref().unwrap().contains("tunnel ready"));

    core.pipeline.shutdown().await;
}

#[tokio::test]
async fn retention_keeps_newest_per_instance() {
    let core = test_core_with_retention().await;
    let agent = core.seed_agent("a1").await;
    let ingress = core.pipeline.ingress();

    // Instance "old" gets one early event, then "hot" floods the log far
    // past the retention limit.
    ingress.push(
        agent.id,
        instance_frame(
            "create",
            "2025-01-01T00:00:00Z",
            "old",
            "client",
            "running",
            "client://:1/:2",
            (0, 0, 0, 0),
        ),
    );
    for i in 1..=40i64 {
        let time = format!("2025-01-01T00:01:{:02}Z", i % 60);
        ingress.push(
            agent.id,
            instance_frame("update", &time, "hot", "client", "running", "", (i, i, 0, 0)),
        );
    }

    eventually("retention pruned the flood", || async {
        let recent = core.events.recent_for(agent.id, 1000).await.unwrap();
        let flood_done = recent.iter().any(|event| event.tcp_rx == 40);
        flood_done && recent.len() <= 12
    })
    .await;

    // The newest event for the quiet instance survived the prune.
    let recent = core.events.recent_for(agent.id, 1000).await.unwrap();
    assert!(recent.iter().any(|event| event.instance_id == "old"));

    core.pipeline.shutdown().await;
}

async fn test_core_with_retention() -> common::TestCore {
    common::test_core_with(PipelineConfig {
        workers: 1,
        retention_per_agent: 10,
        prune_interval: 20,
        ..PipelineConfig::default()
    })
    .await
}

#[tokio::test]
async fn tunnel_listing_filters() {
    let core = test_core().await;
    let agent = core.seed_agent("a1").await;
    let ingress = core.pipeline.ingress();

    ingress.push(
        agent.id,
        initial_frame(&[
            instance_json("alpha", "client", "running", "client://:1/:2", (0, 0, 0, 0)),
            instance_json("beta", "server", "stopped", "server://:3/:4", (0, 0, 0, 0)),
        ]),
    );
    eventually("inventory loaded", || async {
        core.agents.get(agent.id).await.unwrap().unwrap().tunnel_count == 2
    })
    .await;

    let running = core
        .tunnels
        .list(&TunnelFilters {
            status: Some("running".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].instance_id, "alpha");

    let searched = core
        .tunnels
        .list(&TunnelFilters {
            search: Some("bet".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(searched.len(), 1);
    assert_eq!(searched[0].instance_id, "beta");

    core.pipeline.shutdown().await;
}
