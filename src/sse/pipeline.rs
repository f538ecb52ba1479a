//! Event pipeline: bounded queues and worker pools between upstream readers
//! and the store/hub.
//!
//! Shape: upstream readers drop raw frames onto the ingress queue without
//! blocking (a slow pipeline must never stall an SSE read). Ingress workers
//! parse and classify frames, feed the append-only persist queue, coalesce
//! `update` bursts through a batch buffer, and publish parsed events to the
//! hub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::event::{EventFrame, EventRepository, EventType, RawEvent};
use crate::tunnel::{parse_instance_url, ParsedTunnelUrl, TunnelRepository};

use super::hub::SseHub;
use super::supervisor::LivenessClock;

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ingress queue capacity; frames are dropped (with a warning) when full.
    pub ingress_capacity: usize,
    /// Persist queue capacity; overflow spawns one-shot writers instead of
    /// dropping.
    pub persist_capacity: usize,
    /// Ingress worker count; 0 means twice the logical core count.
    pub workers: usize,
    /// Maximum age of the update batch buffer before a flush.
    pub batch_window: Duration,
    /// Pending-entry count that triggers an early flush.
    pub batch_max: usize,
    /// Raw events retained per agent (newest rows win).
    pub retention_per_agent: i64,
    /// Appends between retention prunes for one agent.
    pub prune_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: 1024,
            persist_capacity: 1000,
            workers: 0,
            batch_window: Duration::from_millis(200),
            batch_max: 10,
            retention_per_agent: 10_000,
            prune_interval: 512,
        }
    }
}

impl PipelineConfig {
    fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            2 * std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// A raw frame as received from one agent's SSE stream.
#[derive(Debug)]
pub struct IngressFrame {
    pub agent_id: i64,
    pub payload: String,
}

/// Non-blocking producer handle onto the ingress queue.
#[derive(Clone)]
pub struct IngressSender {
    tx: mpsc::Sender<IngressFrame>,
}

impl IngressSender {
    /// Enqueue a frame. Never blocks: when the queue is full the frame is
    /// dropped and a warning logged.
    pub fn push(&self, agent_id: i64, payload: String) {
        match self.tx.try_send(IngressFrame { agent_id, payload }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("ingress queue full, dropping frame from agent {agent_id}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("ingress queue closed, dropping frame from agent {agent_id}");
            }
        }
    }
}

type BatchBuffer = Arc<Mutex<HashMap<(i64, String), RawEvent>>>;

struct PipelineShared {
    tunnels: TunnelRepository,
    events: EventRepository,
    hub: Arc<SseHub>,
    liveness: Arc<LivenessClock>,
    persist_tx: mpsc::Sender<RawEvent>,
    batch: BatchBuffer,
    flush_notify: Arc<Notify>,
    batch_max: usize,
}

/// The running pipeline: worker pool, persist worker and batch flusher.
pub struct EventPipeline {
    ingress: IngressSender,
    shutdown_tx: watch::Sender<bool>,
    flusher_stop: watch::Sender<bool>,
    worker_handles: Vec<JoinHandle<()>>,
    persist_handle: JoinHandle<()>,
    flusher_handle: JoinHandle<()>,
}

impl EventPipeline {
    /// Spawn the pipeline tasks.
    pub fn start(
        tunnels: TunnelRepository,
        events: EventRepository,
        hub: Arc<SseHub>,
        liveness: Arc<LivenessClock>,
        config: PipelineConfig,
    ) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel(config.ingress_capacity);
        let (persist_tx, persist_rx) = mpsc::channel(config.persist_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (flusher_stop, flusher_stop_rx) = watch::channel(false);

        let shared = Arc::new(PipelineShared {
            tunnels: tunnels.clone(),
            events: events.clone(),
            hub,
            liveness,
            persist_tx,
            batch: Arc::new(Mutex::new(HashMap::new())),
            flush_notify: Arc::new(Notify::new()),
            batch_max: config.batch_max,
        });

        // Ingress worker pool over one shared receiver.
        let ingress_rx = Arc::new(AsyncMutex::new(ingress_rx));
        let workers = config.effective_workers();
        let mut worker_handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            worker_handles.push(tokio::spawn(ingress_worker(
                worker_id,
                shared.clone(),
                ingress_rx.clone(),
                shutdown_rx.clone(),
            )));
        }
        info!("event pipeline started with {workers} ingress workers");

        // Persist worker drains the append queue; it terminates when every
        // ingress worker (each holding a sender clone via `shared`) is gone.
        let persist_handle = tokio::spawn(persist_worker(
            events,
            persist_rx,
            config.retention_per_agent,
            config.prune_interval,
        ));

        // Batch flusher: time- and size-triggered. It is stopped only after
        // the workers have drained, so no pending update is left behind.
        let flusher_handle = tokio::spawn(batch_flusher(
            tunnels,
            shared.batch.clone(),
            shared.flush_notify.clone(),
            config.batch_window,
            flusher_stop_rx,
        ));

        Self {
            ingress: IngressSender { tx: ingress_tx },
            shutdown_tx,
            flusher_stop,
            worker_handles,
            persist_handle,
            flusher_handle,
        }
    }

    /// Producer handle for upstream readers.
    pub fn ingress(&self) -> IngressSender {
        self.ingress.clone()
    }

    /// Stop the pipeline: drain the ingress queue, flush pending updates and
    /// join all tasks, bounded by a 5 second deadline.
    pub async fn shutdown(self) {
        let EventPipeline {
            ingress,
            shutdown_tx,
            flusher_stop,
            worker_handles,
            persist_handle,
            flusher_handle,
        } = self;

        let _ = shutdown_tx.send(true);
        drop(ingress);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        for handle in worker_handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("ingress worker did not stop before the shutdown deadline");
            }
        }

        // Workers are done; a final flush then stops the flusher. The
        // persist worker ends once the last queue sender is gone.
        let _ = flusher_stop.send(true);
        if tokio::time::timeout_at(deadline, flusher_handle).await.is_err() {
            warn!("batch flusher did not stop before the shutdown deadline");
        }
        if tokio::time::timeout_at(deadline, persist_handle).await.is_err() {
            warn!("persist worker did not stop before the shutdown deadline");
        }
    }
}

async fn ingress_worker(
    worker_id: usize,
    shared: Arc<PipelineShared>,
    rx: Arc<AsyncMutex<mpsc::Receiver<IngressFrame>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            // Drain whatever is already queued, then stop.
            let frame = rx.lock().await.try_recv().ok();
            match frame {
                Some(frame) => handle_frame(&shared, frame).await,
                None => break,
            }
            continue;
        }

        enum Next {
            Frame(IngressFrame),
            Closed,
            Shutdown,
        }

        let next = {
            let mut guard = rx.lock().await;
            tokio::select! {
                frame = guard.recv() => match frame {
                    Some(frame) => Next::Frame(frame),
                    None => Next::Closed,
                },
                _ = shutdown.changed() => Next::Shutdown,
            }
        };

        match next {
            Next::Frame(frame) => handle_frame(&shared, frame).await,
            Next::Closed => break,
            Next::Shutdown => {}
        }
    }
    debug!("ingress worker {worker_id} stopped");
}

/// Parse, persist, apply and publish a single upstream frame.
async fn handle_frame(shared: &PipelineShared, frame: IngressFrame) {
    let agent_id = frame.agent_id;

    let parsed: EventFrame = match serde_json::from_str(&frame.payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("discarding malformed frame from agent {agent_id}: {err}");
            return;
        }
    };

    let events = parsed.into_raw_events(agent_id, Utc::now());
    if events.is_empty() {
        warn!("discarding frame with unknown event type from agent {agent_id}");
        return;
    }

    for event in events {
        enqueue_persist(shared, event.clone());
        apply_event(shared, &event).await;
        publish_event(shared, &event);
    }

    shared.liveness.touch(agent_id);
}

/// Push onto the persist queue; a full queue spawns a one-shot writer rather
/// than dropping (raw events are the audit trail).
fn enqueue_persist(shared: &PipelineShared, event: RawEvent) {
    match shared.persist_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event))
        | Err(mpsc::error::TrySendError::Closed(event)) => {
            warn!(
                "persist queue unavailable, spawning one-shot writer for agent {}",
                event.agent_id
            );
            let repo = shared.events.clone();
            tokio::spawn(async move {
                if let Err(err) = repo.append(&event).await {
                    error!("one-shot raw event append failed: {err:#}");
                }
            });
        }
    }
}

async fn apply_event(shared: &PipelineShared, event: &RawEvent) {
    match event.event_type {
        EventType::Initial | EventType::Create => {
            let Some(instance_type) = event.instance_type.as_deref().filter(|t| !t.is_empty())
            else {
                // Echo frames without a type never materialize rows.
                debug!(
                    "skipping {} event without instance type for agent {}",
                    event.event_type, event.agent_id
                );
                return;
            };
            let cfg = event
                .url
                .as_deref()
                .map(|url| parse_instance_url(url, instance_type))
                .unwrap_or_else(ParsedTunnelUrl::default);

            match shared.tunnels.create_from_event(event, &cfg).await {
                Ok(true) => info!(
                    "tunnel {} created for agent {}",
                    event.instance_id, event.agent_id
                ),
                Ok(false) => {}
                Err(err) => error!(
                    "failed to create tunnel {} for agent {}: {err:#}",
                    event.instance_id, event.agent_id
                ),
            }
        }
        EventType::Update => {
            if event.instance_id.is_empty() {
                return;
            }
            let pending = {
                let mut batch = shared.batch.lock().unwrap();
                let key = (event.agent_id, event.instance_id.clone());
                // Last-writer-wins by event time, so a reordered pair still
                // coalesces to the newest sample.
                match batch.get(&key) {
                    Some(existing) if existing.event_time > event.event_time => {}
                    _ => {
                        batch.insert(key, event.clone());
                    }
                }
                batch.len()
            };
            if pending >= shared.batch_max {
                shared.flush_notify.notify_one();
            }
        }
        EventType::Delete => {
            if event.instance_id.is_empty() {
                return;
            }
            // Deletes are not batched; drop any pending update for the same
            // instance so it cannot resurrect counters after the delete.
            shared
                .batch
                .lock()
                .unwrap()
                .remove(&(event.agent_id, event.instance_id.clone()));

            match shared
                .tunnels
                .delete_from_event(event.agent_id, &event.instance_id)
                .await
            {
                Ok(true) => info!(
                    "tunnel {} removed for agent {}",
                    event.instance_id, event.agent_id
                ),
                Ok(false) => {}
                Err(err) => error!(
                    "failed to delete tunnel {} for agent {}: {err:#}",
                    event.instance_id, event.agent_id
                ),
            }
        }
        // Log lines and shutdown notices only feed the audit trail.
        EventType::Log | EventType::Shutdown => {}
    }
}

/// Fan out to subscribed browsers. `initial` is a bulk sync, not a
/// per-instance notification, so it is never pushed.
fn publish_event(shared: &PipelineShared, event: &RawEvent) {
    if event.event_type == EventType::Initial || event.instance_id.is_empty() {
        return;
    }
    shared.hub.publish_instance(&event.instance_id, event);
}

async fn persist_worker(
    events: EventRepository,
    mut rx: mpsc::Receiver<RawEvent>,
    retention: i64,
    prune_interval: u64,
) {
    let mut appended: HashMap<i64, u64> = HashMap::new();

    while let Some(event) = rx.recv().await {
        let agent_id = event.agent_id;
        if let Err(err) = events.append(&event).await {
            error!("raw event append failed for agent {agent_id}: {err:#}");
            continue;
        }

        let counter = appended.entry(agent_id).or_insert(0);
        *counter += 1;
        if *counter >= prune_interval {
            *counter = 0;
            if let Err(err) = events.prune(agent_id, retention).await {
                warn!("event prune failed for agent {agent_id}: {err:#}");
            }
        }
    }
    debug!("persist worker stopped");
}

async fn batch_flusher(
    tunnels: TunnelRepository,
    batch: BatchBuffer,
    notify: Arc<Notify>,
    window: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(window);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = notify.notified() => {}
            _ = shutdown.changed() => {
                flush_batch(&tunnels, &batch).await;
                break;
            }
        }
        flush_batch(&tunnels, &batch).await;
    }
    debug!("batch flusher stopped");
}

/// Apply all pending coalesced updates in one transaction.
async fn flush_batch(tunnels: &TunnelRepository, batch: &BatchBuffer) {
    let pending: Vec<RawEvent> = {
        let mut guard = batch.lock().unwrap();
        if guard.is_empty() {
            return;
        }
        guard.drain().map(|(_, event)| event).collect()
    };

    match tunnels.apply_update_batch(&pending).await {
        Ok(applied) => {
            debug!("flushed {} pending updates, {applied} applied", pending.len());
        }
        Err(err) => {
            error!("update batch flush failed: {err:#}");
        }
    }
}
