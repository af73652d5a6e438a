//! Process configuration.
//!
//! Everything is env-driven; there is no config file. Durations are given in
//! milliseconds, lists are comma-separated.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// A string that never shows up in Debug output or logs.
#[derive(Clone)]
pub struct RedactedString(String);

impl RedactedString {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RedactedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// How many of an instance's health checks must match `service_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksRequired {
    /// At least one check.
    One,
    /// Every check.
    All,
}

/// Listener / forwarding configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the SNI listener binds to.
    pub listen: SocketAddr,

    /// Timeout for establishing the upstream connection.
    pub dial_timeout: Duration,

    /// Deadline for reading the inbound ClientHello.
    pub handshake_timeout: Duration,

    /// How long shutdown waits for in-flight connections.
    pub grace_period: Duration,
}

/// Registry (Consul) configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Consul agent base URL (example: http://127.0.0.1:8500).
    pub addr: String,

    /// Optional ACL token sent as a bearer header.
    pub token: Option<RedactedString>,

    /// Tag prefix that marks a service as routable.
    pub tag_prefix: String,

    /// Zero means blocking queries; anything else is fixed-interval polling.
    pub poll_interval: Duration,

    /// Check statuses that count as passing.
    pub service_status: Vec<String>,

    /// Whether one or all checks must be in `service_status`.
    pub checks_required: ChecksRequired,

    /// Concurrency bound for per-service catalog queries.
    pub service_monitors: usize,

    /// Forwarded verbatim into registry query options.
    pub require_consistent: bool,
    pub allow_stale: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub registry: RegistryConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

fn env_ms(key: &str, default: u64) -> Result<Duration> {
    let ms: u64 = std::env::var(key)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{key} must be an integer (milliseconds)"))?
        .unwrap_or(default);
    Ok(Duration::from_millis(ms))
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen: SocketAddr = std::env::var("TAGROUTE_LISTEN")
            .unwrap_or_else(|_| "0.0.0.0:9443".to_string())
            .parse()
            .context("TAGROUTE_LISTEN must be a socket address")?;

        let dial_timeout = env_ms("TAGROUTE_DIAL_TIMEOUT_MS", 30_000)?;
        let handshake_timeout = env_ms("TAGROUTE_HANDSHAKE_TIMEOUT_MS", 10_000)?;
        let grace_period = env_ms("TAGROUTE_GRACE_PERIOD_MS", 0)?;

        let addr = std::env::var("TAGROUTE_CONSUL_ADDR")
            .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string());

        let token = std::env::var("TAGROUTE_CONSUL_TOKEN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(RedactedString::new);

        let tag_prefix =
            std::env::var("TAGROUTE_TAG_PREFIX").unwrap_or_else(|_| "urlprefix-".to_string());

        let poll_interval = env_ms("TAGROUTE_POLL_INTERVAL_MS", 0)?;

        let service_status: Vec<String> = std::env::var("TAGROUTE_SERVICE_STATUS")
            .unwrap_or_else(|_| "passing".to_string())
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let checks_required = match std::env::var("TAGROUTE_CHECKS_REQUIRED")
            .unwrap_or_else(|_| "one".to_string())
            .as_str()
        {
            "all" => ChecksRequired::All,
            "one" => ChecksRequired::One,
            other => anyhow::bail!("TAGROUTE_CHECKS_REQUIRED must be \"one\" or \"all\", got {other:?}"),
        };

        let service_monitors: usize = std::env::var("TAGROUTE_SERVICE_MONITORS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("TAGROUTE_SERVICE_MONITORS must be an integer")?
            .unwrap_or(1)
            .max(1);

        let log_level = std::env::var("TAGROUTE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            proxy: ProxyConfig {
                listen,
                dial_timeout,
                handshake_timeout,
                grace_period,
            },
            registry: RegistryConfig {
                addr,
                token,
                tag_prefix,
                poll_interval,
                service_status,
                checks_required,
                service_monitors,
                require_consistent: env_bool("TAGROUTE_REQUIRE_CONSISTENT"),
                allow_stale: env_bool("TAGROUTE_ALLOW_STALE"),
            },
            log_level,
        })
    }
}
