//! NodePass agent HTTP client for imperative instance commands.

mod client;
mod error;
mod types;

pub use client::NodePassClient;
pub use error::{NodePassError, NodePassResult};
pub use types::{InstanceAction, InstanceSummary};
