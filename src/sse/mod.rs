//! The event ingestion and fan-out core.
//!
//! One upstream SSE subscription per agent (supervised, auto-reconnecting),
//! a bounded-queue pipeline that parses frames and mirrors them into the
//! store, and a hub that fans parsed events out to browser SSE subscribers.

pub mod hub;
pub mod pipeline;
pub mod supervisor;
pub mod upstream;

pub use hub::{SseHub, CONNECTED_FRAME};
pub use pipeline::{EventPipeline, IngressSender, PipelineConfig};
pub use supervisor::{ConnectionSupervisor, LivenessClock, SupervisorConfig};
pub use upstream::UpstreamClient;
