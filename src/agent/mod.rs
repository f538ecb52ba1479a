//! Agent domain: registered NodePass daemons and their connection status.

mod models;
mod repository;

pub use models::{Agent, AgentStatus};
pub use repository::AgentRepository;
