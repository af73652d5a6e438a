//! Upstream endpoints.
//!
//! A `Target` is one backend a route can send traffic to. Its routing
//! attributes (url, weight, options) are immutable for its lifetime; the
//! byte and connection counters are the only mutable state and survive
//! routing-table swaps by being shared through an `Arc`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use tracing::warn;
use url::Url;

/// Which PROXY protocol header to prepend on the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProto {
    #[default]
    Off,
    V1,
    V2,
}

/// Per-target options parsed from a rule's `opts "k=v k=v"` clause.
#[derive(Debug, Clone, Default)]
pub struct TargetOpts {
    /// PROXY protocol header for the upstream connection.
    pub proxy_proto: ProxyProto,
    /// Path prefix stripped before forwarding (HTTP modes only).
    pub strip_path: Option<String>,
    /// Skip upstream certificate verification (HTTP modes only).
    pub tls_skip_verify: bool,
    /// When non-empty, only peers inside one of these networks are admitted.
    pub allow: Vec<IpNet>,
    /// Peers inside one of these networks are rejected.
    pub deny: Vec<IpNet>,
}

fn parse_nets(value: &str) -> Vec<IpNet> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.trim().parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(err) => {
                warn!(cidr = s, %err, "ignoring unparsable network in access rule");
                None
            }
        })
        .collect()
}

impl TargetOpts {
    /// Parse an options string of whitespace-separated `key=value` pairs.
    ///
    /// Unknown keys are logged and ignored so newer rule emitters can talk
    /// to older proxies.
    pub fn parse(raw: &str) -> Self {
        let mut opts = Self::default();
        for pair in raw.split_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                warn!(opt = pair, "ignoring malformed option, expected key=value");
                continue;
            };
            match key {
                "pxyproto" => {
                    opts.proxy_proto = match value {
                        "v2" => ProxyProto::V2,
                        "v1" | "true" => ProxyProto::V1,
                        "false" | "off" => ProxyProto::Off,
                        other => {
                            warn!(value = other, "ignoring unknown pxyproto value");
                            ProxyProto::Off
                        }
                    };
                }
                "strip" => opts.strip_path = Some(value.to_string()),
                "tlsskipverify" => opts.tls_skip_verify = value == "true",
                "allow" => opts.allow = parse_nets(value),
                "deny" => opts.deny = parse_nets(value),
                other => warn!(opt = other, "ignoring unknown target option"),
            }
        }
        opts
    }
}

/// Monotonic per-target counters, shared across table generations.
#[derive(Debug, Default)]
pub struct TargetCounters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    conns: AtomicU64,
    conn_fail: AtomicU64,
}

impl TargetCounters {
    pub fn add_rx(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn_fail(&self) {
        self.conn_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn conns(&self) -> u64 {
        self.conns.load(Ordering::Relaxed)
    }

    pub fn conn_fail(&self) -> u64 {
        self.conn_fail.load(Ordering::Relaxed)
    }
}

/// One upstream endpoint of a route.
#[derive(Debug, Clone)]
pub struct Target {
    /// Service that registered this endpoint.
    pub service: String,
    /// Upstream endpoint (scheme + host:port).
    pub url: Url,
    /// Tags attached to the rule that created this target.
    pub tags: Vec<String>,
    pub opts: TargetOpts,
    /// Share of the route's traffic. Zero means never selected.
    pub weight: f64,
    pub counters: Arc<TargetCounters>,
}

impl Target {
    pub fn new(service: &str, url: Url, weight: f64, tags: Vec<String>, opts: TargetOpts) -> Self {
        Self {
            service: service.to_string(),
            url,
            tags,
            opts,
            weight,
            counters: Arc::new(TargetCounters::default()),
        }
    }

    /// Same target with a different weight; counters are carried over.
    pub fn with_weight(&self, weight: f64) -> Self {
        Self {
            weight,
            ..self.clone()
        }
    }

    /// The `host:port` string to dial for this target.
    pub fn dial_addr(&self) -> Option<String> {
        let host = self.url.host_str()?;
        let port = self.url.port_or_known_default()?;
        Some(format!("{host}:{port}"))
    }

    /// Evaluate the access rules against a peer address.
    ///
    /// A non-empty allow list admits only members; otherwise a deny list
    /// rejects members; no rules means everyone is admitted.
    pub fn access_denied_tcp(&self, peer: IpAddr) -> bool {
        if !self.opts.allow.is_empty() {
            return !self.opts.allow.iter().any(|net| net.contains(&peer));
        }
        if !self.opts.deny.is_empty() {
            return self.opts.deny.iter().any(|net| net.contains(&peer));
        }
        false
    }
}
