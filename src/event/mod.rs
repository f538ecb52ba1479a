//! Event domain: the append-only audit log of everything agents push.

mod models;
mod repository;

pub use models::{EventFrame, EventType, InstancePayload, LogQuery, RawEvent, StoredEvent};
pub use repository::EventRepository;
