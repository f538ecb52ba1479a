//! Application state shared across handlers.

use std::sync::Arc;

use crate::agent::AgentRepository;
use crate::event::EventRepository;
use crate::sse::{ConnectionSupervisor, SseHub};
use crate::tunnel::TunnelRepository;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Agent repository.
    pub agents: AgentRepository,
    /// Derived tunnel table.
    pub tunnels: TunnelRepository,
    /// Raw event log.
    pub events: EventRepository,
    /// Browser subscription hub.
    pub hub: Arc<SseHub>,
    /// Upstream connection supervisor.
    pub supervisor: Arc<ConnectionSupervisor>,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        agents: AgentRepository,
        tunnels: TunnelRepository,
        events: EventRepository,
        hub: Arc<SseHub>,
        supervisor: Arc<ConnectionSupervisor>,
    ) -> Self {
        Self {
            agents,
            tunnels,
            events,
            hub,
            supervisor,
        }
    }
}
