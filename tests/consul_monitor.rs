//! Monitor loop against a mock Consul agent.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use tagroute::config::{ChecksRequired, RegistryConfig};
use tagroute::registry::consul::{ConsulClient, ServiceMonitor};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn health_state() -> Value {
    // Three instances of "web": two passing with a routable tag, one
    // critical. Node liveness is healthy everywhere.
    json!([
        {"Node": "n1", "CheckID": "serfHealth", "Status": "passing"},
        {"Node": "n2", "CheckID": "serfHealth", "Status": "passing"},
        {
            "Node": "n1", "CheckID": "service:web-1", "Status": "passing",
            "ServiceID": "web-1", "ServiceName": "web",
            "ServiceTags": ["urlprefix-foo.com/"]
        },
        {
            "Node": "n1", "CheckID": "service:web-2", "Status": "passing",
            "ServiceID": "web-2", "ServiceName": "web",
            "ServiceTags": ["urlprefix-foo.com/"]
        },
        {
            "Node": "n2", "CheckID": "service:web-3", "Status": "critical",
            "ServiceID": "web-3", "ServiceName": "web",
            "ServiceTags": ["urlprefix-foo.com/"]
        }
    ])
}

fn catalog(name: &str) -> Value {
    assert_eq!(name, "web");
    json!([
        {
            "Node": "n1", "Address": "10.0.0.1",
            "ServiceID": "web-1", "ServiceName": "web",
            "ServiceAddress": "", "ServicePort": 8001,
            "ServiceTags": ["urlprefix-foo.com/"]
        },
        {
            "Node": "n1", "Address": "10.0.0.1",
            "ServiceID": "web-2", "ServiceName": "web",
            "ServiceAddress": "10.0.0.2", "ServicePort": 8002,
            "ServiceTags": ["urlprefix-foo.com/"]
        },
        {
            "Node": "n2", "Address": "10.0.0.3",
            "ServiceID": "web-3", "ServiceName": "web",
            "ServiceAddress": "", "ServicePort": 8003,
            "ServiceTags": ["urlprefix-foo.com/"]
        }
    ])
}

async fn spawn_mock_agent() -> String {
    let app = Router::new()
        .route(
            "/v1/agent/self",
            get(|| async { Json(json!({"Config": {"Datacenter": "dc1"}})) }),
        )
        .route("/v1/health/state/any", get(|| async { Json(health_state()) }))
        .route(
            "/v1/catalog/service/{name}",
            get(|Path(name): Path<String>| async move { Json(catalog(&name)) }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn registry_config(addr: String) -> RegistryConfig {
    RegistryConfig {
        addr,
        token: None,
        tag_prefix: "urlprefix-".to_string(),
        poll_interval: Duration::from_millis(10),
        service_status: vec!["passing".to_string()],
        checks_required: ChecksRequired::One,
        service_monitors: 2,
        require_consistent: false,
        allow_stale: false,
    }
}

#[tokio::test]
async fn snapshot_contains_only_passing_instances() {
    let addr = spawn_mock_agent().await;
    let client = Arc::new(ConsulClient::new(&addr, None).unwrap());
    let dc = client.agent_datacenter().await.unwrap();
    assert_eq!(dc, "dc1");

    let monitor = ServiceMonitor::new(client, registry_config(addr), dc);
    let (tx, mut rx) = mpsc::channel(1);
    tokio::spawn(async move { monitor.watch(tx).await });

    let snapshot = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let lines: Vec<&str> = snapshot.lines().collect();

    // Two passing instances, reverse-sorted so the most specific rule is on
    // top; the critical instance emits nothing.
    assert_eq!(
        lines,
        vec![
            "route add web foo.com/ http://10.0.0.2:8002",
            "route add web foo.com/ http://10.0.0.1:8001",
        ]
    );
}

#[tokio::test]
async fn identical_registry_state_yields_identical_rule_text() {
    let addr = spawn_mock_agent().await;
    let client = Arc::new(ConsulClient::new(&addr, None).unwrap());

    let monitor = ServiceMonitor::new(client, registry_config(addr), "dc1".to_string());
    let (tx, mut rx) = mpsc::channel(1);
    tokio::spawn(async move { monitor.watch(tx).await });

    let first = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let second = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, second);
}
