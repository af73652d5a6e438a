//! The service monitor.
//!
//! A long-running loop that watches the registry's health state, with
//! blocking queries or fixed-interval polling, and emits one rule-text
//! snapshot per observed change. Snapshots are pushed in registry order over
//! a bounded channel, so a slow consumer applies back-pressure instead of
//! losing updates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;

use super::client::{ConsulClient, QueryOptions};
use super::passing::{checks_with_tag_prefix, passing_instances};
use super::routecmd;

/// Pause after a failed registry call before retrying.
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ServiceMonitor {
    client: Arc<ConsulClient>,
    cfg: RegistryConfig,
    dc: String,
}

impl ServiceMonitor {
    pub fn new(client: Arc<ConsulClient>, cfg: RegistryConfig, dc: String) -> Self {
        Self { client, cfg, dc }
    }

    fn query_options(&self, wait_index: Option<u64>) -> QueryOptions {
        QueryOptions {
            require_consistent: self.cfg.require_consistent,
            allow_stale: self.cfg.allow_stale,
            wait_index,
        }
    }

    /// Watch the registry and send a rule-text snapshot per change.
    /// Returns when the receiving side is dropped.
    pub async fn watch(&self, updates: mpsc::Sender<String>) {
        let mut last_index = 0u64;
        loop {
            let q = if self.cfg.poll_interval.is_zero() {
                self.query_options(Some(last_index))
            } else {
                tokio::time::sleep(self.cfg.poll_interval).await;
                self.query_options(None)
            };

            let (checks, index) = match self.client.health_state(&q).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(%err, "error fetching health state");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            debug!(index, "health state changed");

            let retained = checks_with_tag_prefix(&self.cfg.tag_prefix, &checks);
            debug!(
                retained = retained.len(),
                total = checks.len(),
                "checks with the configured tag prefix"
            );

            let passing =
                passing_instances(&retained, &self.cfg.service_status, self.cfg.checks_required);
            let snapshot = self.build_snapshot(passing).await;

            if updates.send(snapshot).await.is_err() {
                info!("updates receiver dropped, stopping watch");
                return;
            }

            // Remember the last state and wait for the next change.
            last_index = index;
        }
    }

    /// Query the catalog for every passing service and assemble the
    /// reverse-sorted rule text. The per-service queries run concurrently,
    /// bounded by the configured number of service monitors; all of them are
    /// joined before the snapshot is emitted so it stays atomic.
    async fn build_snapshot(&self, passing: HashMap<String, HashSet<String>>) -> String {
        let sem = Arc::new(Semaphore::new(self.cfg.service_monitors.max(1)));
        let mut workers = JoinSet::new();

        for (name, instances) in passing {
            if name.is_empty() || instances.is_empty() {
                continue;
            }
            let client = Arc::clone(&self.client);
            let sem = Arc::clone(&sem);
            let q = self.query_options(None);
            let tag_prefix = self.cfg.tag_prefix.clone();
            let dc = self.dc.clone();
            workers.spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore closed");
                service_rules(&client, &q, &name, &instances, &tag_prefix, &dc).await
            });
        }

        let mut lines = Vec::new();
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(cmds) => lines.extend(cmds),
                Err(err) => warn!(%err, "catalog worker failed"),
            }
        }

        // Reverse order sorts the most specific rules to the top.
        lines.sort_by(|a, b| b.cmp(a));
        lines.join("\n")
    }
}

/// The rules for all passing instances of a single service.
async fn service_rules(
    client: &ConsulClient,
    q: &QueryOptions,
    name: &str,
    passing: &HashSet<String>,
    tag_prefix: &str,
    dc: &str,
) -> Vec<String> {
    let instances = match client.catalog_service(name, q).await {
        Ok(instances) => instances,
        Err(err) => {
            warn!(service = name, %err, "error getting catalog service");
            return Vec::new();
        }
    };

    let mut cmds = Vec::new();
    for svc in &instances {
        let key = format!("{}.{}", svc.node, svc.service_id);
        if !passing.contains(&key) {
            continue;
        }
        cmds.extend(routecmd::build(svc, tag_prefix, dc));
    }
    cmds
}
