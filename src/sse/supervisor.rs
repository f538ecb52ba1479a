//! Connection supervisor: lifecycle of upstream SSE clients and the agent
//! status state machine.
//!
//! Status transitions: a successful connect writes ONLINE, a terminal
//! subscription error writes FAIL (and stops reconnection until a new
//! `connect`), and OFFLINE is written only on an explicit disconnect
//! request. All writes are conditional, so repeated transitions do not touch
//! the database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agent::{Agent, AgentRepository};

use super::pipeline::IngressSender;
use super::upstream::UpstreamClient;

/// Deadline for stopping all upstream clients on close.
const CLOSE_DEADLINE: Duration = Duration::from_secs(5);

/// Last time each agent delivered an event; written by the pipeline, read by
/// the optional silence watchdog.
#[derive(Default)]
pub struct LivenessClock {
    last_event: DashMap<i64, Instant>,
}

impl LivenessClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for an agent.
    pub fn touch(&self, agent_id: i64) {
        self.last_event.insert(agent_id, Instant::now());
    }

    /// When the agent last delivered an event.
    pub fn last_seen(&self, agent_id: i64) -> Option<Instant> {
        self.last_event.get(&agent_id).map(|entry| *entry.value())
    }

    /// Drop tracking for an agent.
    pub fn forget(&self, agent_id: i64) {
        self.last_event.remove(&agent_id);
    }

    fn stale_agents(&self, threshold: Duration) -> Vec<i64> {
        let now = Instant::now();
        self.last_event
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > threshold)
            .map(|entry| *entry.key())
            .collect()
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    /// When set, agents silent for longer than this are conditionally marked
    /// OFFLINE. Silence is never conflated with FAIL and the upstream client
    /// keeps running; ONLINE is restored by the next explicit connect.
    pub offline_after: Option<Duration>,
}

struct ConnectionHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Process-wide owner of upstream SSE connections.
pub struct ConnectionSupervisor {
    connections: Mutex<HashMap<i64, ConnectionHandle>>,
    agents: AgentRepository,
    ingress: IngressSender,
    liveness: Arc<LivenessClock>,
    config: SupervisorConfig,
}

impl ConnectionSupervisor {
    pub fn new(
        agents: AgentRepository,
        ingress: IngressSender,
        liveness: Arc<LivenessClock>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            agents,
            ingress,
            liveness,
            config,
        }
    }

    /// Open (or replace) the upstream subscription for an agent and mark it
    /// ONLINE. An existing connection is cancelled first.
    pub async fn connect(&self, agent: &Agent) -> Result<()> {
        let client = UpstreamClient::new(agent).context("building upstream client")?;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Mark ONLINE before the reader starts, so a terminal failure can
        // only ever overwrite it, never the other way around. The reader
        // owns subsequent status updates.
        if self.agents.mark_online(agent.id).await? {
            info!("agent {} marked ONLINE", agent.id);
        }

        let agents = self.agents.clone();
        let ingress = self.ingress.clone();
        let agent_id = agent.id;
        let task = tokio::spawn(async move {
            match client.run(cancel_rx, ingress).await {
                Ok(()) => info!("agent {agent_id}: sse subscription stopped"),
                Err(err) => {
                    error!("agent {agent_id}: sse subscription failed terminally: {err}");
                    match agents.mark_fail(agent_id).await {
                        Ok(true) => warn!("agent {agent_id} marked FAIL"),
                        Ok(false) => {}
                        Err(err) => {
                            error!("agent {agent_id}: failed to record FAIL status: {err:#}")
                        }
                    }
                }
            }
        });

        {
            let mut connections = self.connections.lock().unwrap();
            if let Some(old) = connections.insert(
                agent.id,
                ConnectionHandle {
                    cancel: cancel_tx,
                    task,
                },
            ) {
                info!("agent {}: replacing existing sse connection", agent.id);
                let _ = old.cancel.send(true);
            }
        }

        // Seed the liveness clock so the watchdog has a baseline before the
        // first event arrives.
        self.liveness.touch(agent.id);

        Ok(())
    }

    /// Cancel and drop an agent's connection. The caller decides the agent's
    /// new status separately. Returns false when no connection existed.
    pub fn disconnect(&self, agent_id: i64) -> bool {
        let handle = self.connections.lock().unwrap().remove(&agent_id);
        match handle {
            Some(handle) => {
                let _ = handle.cancel.send(true);
                self.liveness.forget(agent_id);
                info!("agent {agent_id}: sse connection disconnected");
                true
            }
            None => false,
        }
    }

    /// Connect every agent that has not terminally failed. Individual
    /// connect errors are logged and skipped.
    pub async fn initialize_system(&self) -> Result<()> {
        let agents = self.agents.list_connectable().await?;
        info!("reconnecting {} agent(s)", agents.len());
        for agent in agents {
            if let Err(err) = self.connect(&agent).await {
                error!("agent {}: initial connect failed: {err:#}", agent.id);
            }
        }
        Ok(())
    }

    /// Whether an agent currently holds a connection handle.
    pub fn is_connected(&self, agent_id: i64) -> bool {
        self.connections.lock().unwrap().contains_key(&agent_id)
    }

    /// Number of agents currently holding a connection handle.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Cancel all connections and wait for the readers to stop, bounded by a
    /// 5 second deadline.
    pub async fn close(&self) {
        let handles: Vec<(i64, ConnectionHandle)> = {
            let mut connections = self.connections.lock().unwrap();
            connections.drain().collect()
        };

        for (_, handle) in &handles {
            let _ = handle.cancel.send(true);
        }

        let deadline = tokio::time::Instant::now() + CLOSE_DEADLINE;
        for (agent_id, handle) in handles {
            if tokio::time::timeout_at(deadline, handle.task).await.is_err() {
                warn!("agent {agent_id}: sse reader did not stop before the close deadline");
            }
        }
        info!("connection supervisor closed");
    }

    /// Spawn the optional silence watchdog. Returns None when disabled.
    pub fn spawn_watchdog(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let threshold = self.config.offline_after?;
        let supervisor = Arc::clone(self);
        let interval = (threshold / 2).max(Duration::from_millis(50));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for agent_id in supervisor.liveness.stale_agents(threshold) {
                    match supervisor.agents.mark_offline_if_online(agent_id).await {
                        Ok(true) => warn!("agent {agent_id} silent, marked OFFLINE"),
                        Ok(false) => {}
                        Err(err) => {
                            error!("agent {agent_id}: watchdog status write failed: {err:#}")
                        }
                    }
                }
            }
        }))
    }
}
