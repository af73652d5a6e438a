//! Minimal Consul HTTP API client.
//!
//! Covers the three endpoints the monitor needs: the health state of every
//! check (with blocking-query semantics), the catalog entry of one service,
//! and the local agent's datacenter. Responses are decoded into the few
//! fields the routing path consumes.

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::config::RedactedString;

/// How long a blocking query is allowed to hang before the agent answers
/// with an unchanged index.
const BLOCKING_WAIT: &str = "5m";

#[derive(Debug, Error)]
pub enum ConsulError {
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry returned status {0}")]
    Status(StatusCode),

    #[error("registry token is not a valid header value")]
    InvalidToken,
}

/// One health check, as reported by `/v1/health/state/<status>`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,
    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
    #[serde(rename = "ServiceTags", default)]
    pub service_tags: Vec<String>,
}

/// One service instance, as reported by `/v1/catalog/service/<name>`.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogService {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(rename = "ServiceName", default)]
    pub service_name: String,
    #[serde(rename = "ServiceAddress", default)]
    pub service_address: String,
    #[serde(rename = "ServicePort")]
    pub service_port: u16,
    #[serde(rename = "ServiceTags", default)]
    pub service_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AgentSelf {
    #[serde(rename = "Config")]
    config: AgentConfig,
}

#[derive(Debug, Deserialize)]
struct AgentConfig {
    #[serde(rename = "Datacenter")]
    datacenter: String,
}

/// Consistency knobs forwarded verbatim to the agent, plus the blocking
/// wait index.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub require_consistent: bool,
    pub allow_stale: bool,
    pub wait_index: Option<u64>,
}

pub struct ConsulClient {
    http: reqwest::Client,
    base: String,
}

impl ConsulClient {
    pub fn new(addr: &str, token: Option<&RedactedString>) -> Result<Self, ConsulError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(token.expose())
                .map_err(|_| ConsulError::InvalidToken)?;
            headers.insert("X-Consul-Token", value);
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http,
            base: addr.trim_end_matches('/').to_string(),
        })
    }

    fn get(&self, path: &str, q: &QueryOptions) -> reqwest::RequestBuilder {
        let mut req = self.http.get(format!("{}{}", self.base, path));
        if q.require_consistent {
            req = req.query(&[("consistent", "")]);
        }
        if q.allow_stale {
            req = req.query(&[("stale", "")]);
        }
        if let Some(index) = q.wait_index {
            req = req.query(&[("index", index.to_string().as_str()), ("wait", BLOCKING_WAIT)]);
        }
        req
    }

    /// All health checks in the datacenter, with the index to block on next.
    pub async fn health_state(
        &self,
        q: &QueryOptions,
    ) -> Result<(Vec<HealthCheck>, u64), ConsulError> {
        let resp = self.get("/v1/health/state/any", q).send().await?;
        if !resp.status().is_success() {
            return Err(ConsulError::Status(resp.status()));
        }
        let index = consul_index(resp.headers());
        let checks = resp.json::<Vec<HealthCheck>>().await?;
        Ok((checks, index))
    }

    /// The catalog entry of one service.
    pub async fn catalog_service(
        &self,
        name: &str,
        q: &QueryOptions,
    ) -> Result<Vec<CatalogService>, ConsulError> {
        let resp = self
            .get(&format!("/v1/catalog/service/{name}"), q)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ConsulError::Status(resp.status()));
        }
        Ok(resp.json::<Vec<CatalogService>>().await?)
    }

    /// The local agent's datacenter, used for `{DC}` substitution.
    pub async fn agent_datacenter(&self) -> Result<String, ConsulError> {
        let resp = self
            .get("/v1/agent/self", &QueryOptions::default())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ConsulError::Status(resp.status()));
        }
        Ok(resp.json::<AgentSelf>().await?.config.datacenter)
    }
}

fn consul_index(headers: &HeaderMap) -> u64 {
    headers
        .get("X-Consul-Index")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_health_check() {
        let json = r#"[{
            "Node": "node1",
            "CheckID": "service:web-1",
            "Name": "Service 'web' check",
            "Status": "passing",
            "ServiceID": "web-1",
            "ServiceName": "web",
            "ServiceTags": ["urlprefix-www.example.com/"]
        }]"#;
        let checks: Vec<HealthCheck> = serde_json::from_str(json).unwrap();
        assert_eq!(checks[0].node, "node1");
        assert_eq!(checks[0].status, "passing");
        assert_eq!(checks[0].service_tags.len(), 1);
    }

    #[test]
    fn test_decode_node_level_check_without_service_fields() {
        let json = r#"[{"Node": "node1", "CheckID": "serfHealth", "Status": "passing"}]"#;
        let checks: Vec<HealthCheck> = serde_json::from_str(json).unwrap();
        assert!(checks[0].service_id.is_empty());
        assert!(checks[0].service_tags.is_empty());
    }

    #[test]
    fn test_decode_catalog_service() {
        let json = r#"[{
            "Node": "node1",
            "Address": "10.0.0.5",
            "ServiceID": "web-1",
            "ServiceName": "web",
            "ServiceAddress": "",
            "ServicePort": 8080,
            "ServiceTags": ["urlprefix-www.example.com/"]
        }]"#;
        let services: Vec<CatalogService> = serde_json::from_str(json).unwrap();
        assert_eq!(services[0].service_port, 8080);
        assert!(services[0].service_address.is_empty());
        assert_eq!(services[0].address, "10.0.0.5");
    }

    #[test]
    fn test_consul_index_header() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Consul-Index", HeaderValue::from_static("412"));
        assert_eq!(consul_index(&headers), 412);
        assert_eq!(consul_index(&HeaderMap::new()), 0);
    }
}
