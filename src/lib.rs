//! tagroute
//!
//! An SNI-aware L4 reverse proxy whose routing table is derived from Consul
//! service tags.
//!
//! The pieces:
//! - A service monitor watches registry health state and emits a textual
//!   routing config per observed change.
//! - The rule parser turns that text into an immutable routing table, which
//!   is published with an atomic pointer swap.
//! - The SNI listener peeks each inbound TLS ClientHello, looks the server
//!   name up in the current table, and splices the connection to a weighted
//!   target without decrypting anything.

pub mod config;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod route;

pub use config::{ChecksRequired, Config, ProxyConfig, RegistryConfig};
pub use metrics::{LogSink, NoopSink, Sink};
pub use proxy::{ProxyError, SniError, SniListener};
pub use registry::consul::{ConsulClient, ServiceMonitor};
pub use route::{Table, TableStore, Target};
