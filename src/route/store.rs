//! Holder of the current routing table.
//!
//! Single writer, many readers: writers build a fresh table off the hot
//! path and publish it with one atomic pointer swap; readers pin a snapshot
//! for the duration of their lookup and may observe a stale but internally
//! consistent table. Old snapshots are reclaimed when the last in-flight
//! reference drops.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::info;

use super::parser::parse_rules;
use super::table::Table;

pub struct TableStore {
    current: ArcSwap<Table>,
    /// Serializes writers; publication itself is the atomic store.
    publish: Mutex<PublishState>,
}

#[derive(Default)]
struct PublishState {
    /// Last rule text received from the registry.
    registry_rules: String,
    /// Manual overlay submitted by the admin collaborator. Applied after
    /// the registry rules, so manual rules win ties.
    manual_rules: String,
}

impl TableStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Table::default()),
            publish: Mutex::new(PublishState::default()),
        }
    }

    /// The current table. The returned snapshot stays valid (and unchanged)
    /// for as long as the caller holds it.
    pub fn snapshot(&self) -> Arc<Table> {
        self.current.load_full()
    }

    /// Apply a registry rule-text snapshot and publish the resulting table.
    pub fn apply_registry_rules(&self, rules: &str) {
        let mut state = self.publish.lock().expect("table store lock poisoned");
        state.registry_rules = rules.to_string();
        self.rebuild(&state);
    }

    /// Replace the manual overlay and republish.
    pub fn set_manual_rules(&self, rules: String) {
        let mut state = self.publish.lock().expect("table store lock poisoned");
        state.manual_rules = rules;
        self.rebuild(&state);
    }

    fn rebuild(&self, state: &PublishState) {
        let mut text = state.registry_rules.clone();
        if !state.manual_rules.is_empty() {
            text.push('\n');
            text.push_str(&state.manual_rules);
        }
        let cmds = parse_rules(&text);
        let prev = self.current.load_full();
        let next = Table::apply(&cmds, Some(&prev));
        let num_routes = next.num_routes();
        self.current.store(Arc::new(next));
        info!(num_routes, "routing table updated");
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_replaces_snapshot() {
        let store = TableStore::new();
        assert!(store.snapshot().is_empty());

        store.apply_registry_rules("route add svc example.com/ http://10.0.0.1:8080\n");
        assert_eq!(store.snapshot().num_routes(), 1);

        store.apply_registry_rules("");
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_pinned_snapshot_survives_swap() {
        let store = TableStore::new();
        store.apply_registry_rules("route add svc example.com/ http://10.0.0.1:8080\n");

        let pinned = store.snapshot();
        store.apply_registry_rules("");

        // The in-flight reader still sees its own consistent table.
        assert!(pinned.lookup_host("example.com").is_some());
        assert!(store.snapshot().lookup_host("example.com").is_none());
    }

    #[test]
    fn test_manual_rules_win_ties() {
        let store = TableStore::new();
        store.apply_registry_rules("route add svc example.com/ http://10.0.0.1:8080 weight 1\n");
        store.set_manual_rules("route add svc example.com/ http://10.0.0.9:8080 weight 1\n".into());

        // Manual overlay applied last: same (service, route, host:port set)
        // resolves to the union, manual-added target present.
        let table = store.snapshot();
        let urls: Vec<String> = table
            .routes()
            .iter()
            .flat_map(|r| r.targets.iter().map(|t| t.url.to_string()))
            .collect();
        assert!(urls.contains(&"http://10.0.0.9:8080/".to_string()));
    }

    #[test]
    fn test_counters_survive_republish() {
        let store = TableStore::new();
        store.apply_registry_rules("route add svc example.com/ http://10.0.0.1:8080\n");
        store
            .snapshot()
            .lookup_host("example.com")
            .unwrap()
            .counters
            .add_rx(7);

        store.apply_registry_rules("route add svc example.com/ http://10.0.0.1:8080\n");
        let counters = &store.snapshot().lookup_host("example.com").unwrap().counters;
        assert_eq!(counters.rx_bytes(), 7);
    }
}
