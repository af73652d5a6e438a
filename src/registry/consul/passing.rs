//! Which service instances count as passing.
//!
//! Consul reports every check in the datacenter; the monitor first narrows
//! to checks whose service carries the configured tag prefix (node and
//! maintenance liveness checks are always retained), then computes the set
//! of instances whose retained checks satisfy the configured statuses.

use std::collections::{HashMap, HashSet};

use crate::config::ChecksRequired;

use super::client::HealthCheck;

const CHECK_SERF_HEALTH: &str = "serfHealth";
const CHECK_NODE_MAINTENANCE: &str = "_node_maintenance";
const CHECK_SERVICE_MAINTENANCE_PREFIX: &str = "_service_maintenance";

fn is_liveness_check(check_id: &str) -> bool {
    check_id == CHECK_SERF_HEALTH
        || check_id == CHECK_NODE_MAINTENANCE
        || check_id.starts_with(CHECK_SERVICE_MAINTENANCE_PREFIX)
}

/// Narrow to checks whose service tags carry the prefix. Liveness checks
/// represent node and instance availability rather than user tags and are
/// always retained.
pub fn checks_with_tag_prefix<'a>(prefix: &str, checks: &'a [HealthCheck]) -> Vec<&'a HealthCheck> {
    checks
        .iter()
        .filter(|c| {
            is_liveness_check(&c.check_id) || c.service_tags.iter().any(|t| t.starts_with(prefix))
        })
        .collect()
}

fn status_ok(status: &str, accepted: &[String]) -> bool {
    accepted.iter().any(|s| s == "any" || s == status)
}

/// Instance identity: agent-local service IDs are not unique cluster-wide,
/// so instances are keyed by `node + "." + service_id`.
fn instance_key(check: &HealthCheck) -> String {
    format!("{}.{}", check.node, check.service_id)
}

/// Compute the passing instances per service name.
///
/// A dead node (`serfHealth` critical) excludes every instance on it. An
/// active maintenance check excludes its node or instance unless the
/// accepted statuses explicitly include `maintenance`. The remaining user
/// checks are judged against the accepted statuses: all of them with
/// `ChecksRequired::All`, at least one otherwise.
pub fn passing_instances(
    checks: &[&HealthCheck],
    accepted: &[String],
    required: ChecksRequired,
) -> HashMap<String, HashSet<String>> {
    let mut dead_nodes: HashSet<&str> = HashSet::new();
    let mut maint_nodes: HashSet<&str> = HashSet::new();
    let mut maint_instances: HashSet<String> = HashSet::new();
    let maintenance_accepted = status_ok("maintenance", accepted);

    for check in checks {
        match check.check_id.as_str() {
            CHECK_SERF_HEALTH if check.status == "critical" => {
                dead_nodes.insert(check.node.as_str());
            }
            CHECK_NODE_MAINTENANCE if check.status != "passing" && !maintenance_accepted => {
                maint_nodes.insert(check.node.as_str());
            }
            id if id.starts_with(CHECK_SERVICE_MAINTENANCE_PREFIX)
                && check.status != "passing"
                && !maintenance_accepted =>
            {
                maint_instances.insert(instance_key(check));
            }
            _ => {}
        }
    }

    // Gather user-check statuses per instance.
    let mut instances: HashMap<String, (String, String, Vec<&str>)> = HashMap::new();
    for check in checks {
        if is_liveness_check(&check.check_id) || check.service_name.is_empty() {
            continue;
        }
        let entry = instances
            .entry(instance_key(check))
            .or_insert_with(|| (check.service_name.clone(), check.node.clone(), Vec::new()));
        entry.2.push(check.status.as_str());
    }

    let mut passing: HashMap<String, HashSet<String>> = HashMap::new();
    for (key, (name, node, statuses)) in instances {
        if dead_nodes.contains(node.as_str()) || maint_nodes.contains(node.as_str()) {
            continue;
        }
        if maint_instances.contains(&key) {
            continue;
        }
        let ok = match required {
            ChecksRequired::All => statuses.iter().all(|s| status_ok(s, accepted)),
            ChecksRequired::One => statuses.iter().any(|s| status_ok(s, accepted)),
        };
        if ok {
            passing.entry(name).or_default().insert(key);
        }
    }
    passing
}
