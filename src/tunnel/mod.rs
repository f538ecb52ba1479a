//! Tunnel domain: the derived mirror of agent-hosted tunnel instances.

mod models;
mod repository;
pub mod url;

pub use models::{TunnelFilters, TunnelInstance};
pub use repository::TunnelRepository;
pub use url::{build_command_line, parse_instance_url, ParsedTunnelUrl};
