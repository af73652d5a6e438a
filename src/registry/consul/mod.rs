//! Consul-backed service discovery: the HTTP client, the passing-set
//! computation, the tag-to-rule builder, and the watch loop that feeds the
//! routing table.

pub mod client;
pub mod monitor;
pub mod passing;
pub mod routecmd;

pub use client::{CatalogService, ConsulClient, ConsulError, HealthCheck, QueryOptions};
pub use monitor::ServiceMonitor;
