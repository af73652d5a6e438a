//! Routes and the immutable routing table.
//!
//! A `Table` is built off the hot path and never mutated after publication:
//! every rule operation produces a new table. Lookups walk the host's routes
//! longest-path-first and pick one target with a weighted uniform draw.
//!
//! Counters survive table swaps: when a batch is applied, a target whose
//! `(host, path, url)` existed in the predecessor table adopts the
//! predecessor's counter block.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use tracing::warn;
use url::Url;

use super::parser::RuleCmd;
use super::target::{Target, TargetCounters, TargetOpts};

/// Hostname for routes that match any server name.
pub const WILDCARD_HOST: &str = "*";

/// A (host, path) match rule with an ordered set of weighted targets.
#[derive(Debug, Clone)]
pub struct Route {
    /// Exact lowercase hostname, or `*`.
    pub host: String,
    /// Literal path prefix; `/` matches everything.
    pub path: String,
    /// Targets in rule insertion order.
    pub targets: Vec<Arc<Target>>,
    /// Sum of the target weights.
    pub total_weight: f64,
}

impl Route {
    fn new(host: &str, path: &str) -> Self {
        Self {
            host: host.to_string(),
            path: path.to_string(),
            targets: Vec::new(),
            total_weight: 0.0,
        }
    }

    fn recompute_weight(&mut self) {
        self.total_weight = self.targets.iter().map(|t| t.weight).sum();
    }

    /// Select a target by walking the weight prefix sum.
    ///
    /// `draw` must lie in `[0, total_weight)`. Zero-weight targets are never
    /// selected; if every weight is zero there is nothing to pick.
    pub fn pick(&self, draw: f64) -> Option<Arc<Target>> {
        if self.total_weight <= 0.0 {
            return None;
        }
        let mut sum = 0.0;
        for target in &self.targets {
            sum += target.weight;
            if draw < sum {
                return Some(Arc::clone(target));
            }
        }
        // draw at or beyond the sum (can happen through float rounding):
        // fall back to the last target carrying weight.
        self.targets
            .iter()
            .rev()
            .find(|t| t.weight > 0.0)
            .map(Arc::clone)
    }
}

/// Normalize a hostname for matching: lowercase, trailing dot trimmed.
pub fn normalize_host(host: &str) -> String {
    host.to_lowercase().trim_end_matches('.').to_string()
}

/// An immutable snapshot of all current routes.
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Routes per host, sorted longest path first (ties keep rule order).
    hosts: HashMap<String, Vec<Route>>,
}

impl Table {
    /// Apply a parsed rule batch on an empty table, inheriting counters from
    /// the predecessor snapshot. This is the single entry point of the rule
    /// path; the forwarding path never mutates a table.
    pub fn apply(cmds: &[RuleCmd], prev: Option<&Table>) -> Table {
        let mut table = Table::default();
        for cmd in cmds {
            table = match cmd {
                RuleCmd::Add {
                    service,
                    host,
                    path,
                    url,
                    weight,
                    tags,
                    opts,
                } => table.add_route(
                    service,
                    host,
                    path,
                    url.clone(),
                    weight.unwrap_or(1.0),
                    tags.clone(),
                    opts.clone(),
                ),
                RuleCmd::Del {
                    service,
                    host,
                    path,
                } => table.del_service(service, host.as_deref(), path.as_deref()),
                RuleCmd::Weight {
                    service,
                    host,
                    path,
                    weight,
                    tags,
                } => table.reweight(service, host, path, *weight, tags),
            };
        }
        if let Some(prev) = prev {
            table.inherit_counters(prev);
        }
        table
    }

    /// New table with one target added.
    ///
    /// A target with the same service and url in the same route replaces the
    /// existing entry, so re-applied snapshots stay idempotent.
    pub fn add_route(
        &self,
        service: &str,
        host: &str,
        path: &str,
        url: Url,
        weight: f64,
        tags: Vec<String>,
        opts: TargetOpts,
    ) -> Table {
        let host = normalize_host(host);
        let path = if path.is_empty() { "/" } else { path };
        if weight < 0.0 {
            warn!(service, host, path, weight, "ignoring route with negative weight");
            return self.clone();
        }

        let mut table = self.clone();
        let routes = table.hosts.entry(host.clone()).or_default();

        let target = Arc::new(Target::new(service, url, weight, tags, opts));
        match routes.iter_mut().find(|r| r.path == path) {
            Some(route) => {
                match route
                    .targets
                    .iter_mut()
                    .find(|t| t.service == target.service && t.url == target.url)
                {
                    Some(existing) => *existing = target,
                    None => route.targets.push(target),
                }
                route.recompute_weight();
            }
            None => {
                let mut route = Route::new(&host, path);
                route.targets.push(target);
                route.recompute_weight();
                routes.push(route);
                // Longest prefix wins; stable sort keeps rule order on ties.
                routes.sort_by_key(|r| std::cmp::Reverse(r.path.len()));
            }
        }
        table
    }

    /// New table with a service's targets removed, optionally narrowed to a
    /// single (host, path) route.
    pub fn del_service(&self, service: &str, host: Option<&str>, path: Option<&str>) -> Table {
        let host = host.map(normalize_host);
        let mut table = self.clone();
        table.hosts.retain(|route_host, routes| {
            if let Some(h) = &host {
                if route_host != h {
                    return true;
                }
            }
            routes.retain_mut(|route| {
                if let Some(p) = path {
                    if route.path != p {
                        return true;
                    }
                }
                route.targets.retain(|t| t.service != service);
                route.recompute_weight();
                !route.targets.is_empty()
            });
            !routes.is_empty()
        });
        table
    }

    /// New table with a weight assigned to the matching targets of one route.
    ///
    /// When tags are given, only targets carrying all of them are touched.
    pub fn reweight(
        &self,
        service: &str,
        host: &str,
        path: &str,
        weight: f64,
        tags: &[String],
    ) -> Table {
        let host = normalize_host(host);
        let mut table = self.clone();
        let Some(route) = table
            .hosts
            .get_mut(&host)
            .and_then(|routes| routes.iter_mut().find(|r| r.path == path))
        else {
            warn!(service, host, path, "route weight: no such route");
            return table;
        };

        let mut touched = 0;
        for target in route.targets.iter_mut() {
            if target.service != service {
                continue;
            }
            if !tags.is_empty() && !tags.iter().all(|t| target.tags.contains(t)) {
                continue;
            }
            *target = Arc::new(target.with_weight(weight));
            touched += 1;
        }
        if touched == 0 {
            warn!(service, host, path, "route weight: no matching targets");
        }
        route.recompute_weight();
        table
    }

    /// Find the best route and pick a target, with an injectable draw.
    ///
    /// `draw` receives the route's total weight and must return a value in
    /// `[0, total_weight)`; given the same table and draw the result is
    /// deterministic.
    pub fn lookup_with(
        &self,
        host: &str,
        path: &str,
        draw: impl FnOnce(f64) -> f64,
    ) -> Option<Arc<Target>> {
        let host = normalize_host(host);
        let path = if path.is_empty() { "/" } else { path };

        let route = self
            .match_route(&host, path)
            .or_else(|| self.match_route(WILDCARD_HOST, path))?;
        if route.total_weight <= 0.0 {
            return None;
        }
        route.pick(draw(route.total_weight))
    }

    /// Find the best route and pick a target uniformly by weight.
    pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<Target>> {
        self.lookup_with(host, path, |total| rand::rng().random_range(0.0..total))
    }

    /// Host-only lookup used by the SNI forwarding path.
    pub fn lookup_host(&self, host: &str) -> Option<Arc<Target>> {
        self.lookup(host, "")
    }

    fn match_route(&self, host: &str, path: &str) -> Option<&Route> {
        self.hosts
            .get(host)?
            .iter()
            .find(|route| path.starts_with(&route.path))
    }

    /// Counter block of the target at `(host, path, url)`, if present.
    pub fn find_counters(&self, host: &str, path: &str, url: &Url) -> Option<Arc<TargetCounters>> {
        self.hosts
            .get(host)?
            .iter()
            .find(|r| r.path == path)?
            .targets
            .iter()
            .find(|t| &t.url == url)
            .map(|t| Arc::clone(&t.counters))
    }

    fn inherit_counters(&mut self, prev: &Table) {
        for routes in self.hosts.values_mut() {
            for route in routes.iter_mut() {
                for target in route.targets.iter_mut() {
                    if let Some(counters) = prev.find_counters(&route.host, &route.path, &target.url)
                    {
                        let mut inherited = (**target).clone();
                        inherited.counters = counters;
                        *target = Arc::new(inherited);
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Number of routes across all hosts.
    pub fn num_routes(&self) -> usize {
        self.hosts.values().map(|r| r.len()).sum()
    }

    /// All routes, for admin display. Hosts sorted, paths in match order.
    pub fn routes(&self) -> Vec<&Route> {
        let mut hosts: Vec<_> = self.hosts.keys().collect();
        hosts.sort();
        hosts
            .into_iter()
            .flat_map(|h| self.hosts[h].iter())
            .collect()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for route in self.routes() {
            for target in &route.targets {
                writeln!(
                    f,
                    "route add {} {}{} {} weight {}",
                    target.service, route.host, route.path, target.url, target.weight
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_rules;
    use super::*;

    fn table_from(text: &str) -> Table {
        Table::apply(&parse_rules(text), None)
    }

    fn picked_url(table: &Table, host: &str, path: &str, draw: f64) -> Option<String> {
        table
            .lookup_with(host, path, |_| draw)
            .map(|t| t.url.to_string())
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = table_from(
            "route add svc www.example.com/a http://10.0.0.2:8080 weight 1\n\
             route add svc www.example.com/ http://10.0.0.1:8080 weight 1\n",
        );
        assert_eq!(
            picked_url(&table, "www.example.com", "/a/b", 0.0).unwrap(),
            "http://10.0.0.2:8080/"
        );
        assert_eq!(
            picked_url(&table, "www.example.com", "/", 0.0).unwrap(),
            "http://10.0.0.1:8080/"
        );
    }

    #[test]
    fn test_wildcard_host_tried_last() {
        let table = table_from(
            "route add any */ http://10.0.0.9:8080\n\
             route add svc www.example.com/ http://10.0.0.1:8080\n",
        );
        assert_eq!(
            picked_url(&table, "www.example.com", "/", 0.0).unwrap(),
            "http://10.0.0.1:8080/"
        );
        assert_eq!(
            picked_url(&table, "other.example.com", "/", 0.0).unwrap(),
            "http://10.0.0.9:8080/"
        );
    }

    #[test]
    fn test_host_lookup_is_case_insensitive() {
        let table = table_from("route add svc WWW.Example.COM/ http://10.0.0.1:8080\n");
        assert!(table.lookup_host("www.example.com.").is_some());
        assert!(table.lookup_host("WWW.EXAMPLE.COM").is_some());
    }

    #[test]
    fn test_weighted_pick_prefix_sum() {
        let table = table_from(
            "route add svc www.example.com/ http://a:80 weight 3\n\
             route add svc www.example.com/ http://b:80 weight 1\n",
        );
        // Draws covering [0, 4): 3x a, then b, in prefix-sum order.
        for draw in [0.0, 1.0, 2.0] {
            assert_eq!(
                picked_url(&table, "www.example.com", "/", draw).unwrap(),
                "http://a/"
            );
        }
        assert_eq!(
            picked_url(&table, "www.example.com", "/", 3.0).unwrap(),
            "http://b/"
        );
    }

    #[test]
    fn test_zero_weight_target_never_selected() {
        let table = table_from(
            "route add svc www.example.com/ http://a:80 weight 0\n\
             route add svc www.example.com/ http://b:80 weight 2\n",
        );
        for draw in [0.0, 1.0, 1.9] {
            assert_eq!(
                picked_url(&table, "www.example.com", "/", draw).unwrap(),
                "http://b/"
            );
        }
    }

    #[test]
    fn test_all_zero_weights_yields_no_target() {
        let table = table_from("route add svc www.example.com/ http://a:80 weight 0\n");
        assert!(table.lookup_host("www.example.com").is_none());
    }

    #[test]
    fn test_total_weight_invariant() {
        let table = table_from(
            "route add svc www.example.com/ http://a:80 weight 2.5\n\
             route add svc www.example.com/ http://b:80 weight 1.5\n\
             route add other www.example.com/api http://c:80\n",
        );
        for route in table.routes() {
            let sum: f64 = route.targets.iter().map(|t| t.weight).sum();
            assert!((route.total_weight - sum).abs() < f64::EPSILON);
            assert!(route.total_weight >= 0.0);
        }
    }

    #[test]
    fn test_add_then_del_restores_table() {
        let base = table_from("route add svc www.example.com/ http://a:80\n");
        let grown = base.add_route(
            "extra",
            "www.example.com",
            "/x",
            "http://b:80".parse().unwrap(),
            1.0,
            vec![],
            TargetOpts::default(),
        );
        assert_eq!(grown.num_routes(), 2);
        let restored = grown.del_service("extra", None, None);
        assert_eq!(restored.to_string(), base.to_string());
    }

    #[test]
    fn test_del_service_narrowed_by_route() {
        let table = table_from(
            "route add svc www.example.com/ http://a:80\n\
             route add svc www.example.com/b http://b:80\n",
        );
        let narrowed = table.del_service("svc", Some("www.example.com"), Some("/b"));
        assert_eq!(narrowed.num_routes(), 1);
        assert!(narrowed.lookup_host("www.example.com").is_some());
    }

    #[test]
    fn test_reweight_preserves_counters() {
        let table = table_from("route add svc www.example.com/ http://a:80 weight 1\n");
        table
            .lookup_host("www.example.com")
            .unwrap()
            .counters
            .add_rx(42);

        let reweighted = table.reweight("svc", "www.example.com", "/", 7.0, &[]);
        let target = reweighted
            .lookup_with("www.example.com", "/", |_| 0.0)
            .unwrap();
        assert_eq!(target.weight, 7.0);
        assert_eq!(target.counters.rx_bytes(), 42);
    }

    #[test]
    fn test_counters_inherited_across_apply() {
        let first = table_from("route add svc www.example.com/ http://a:80\n");
        first
            .lookup_host("www.example.com")
            .unwrap()
            .counters
            .add_tx(9);

        // Same route in the next snapshot, plus an unrelated one.
        let next = Table::apply(
            &parse_rules(
                "route add svc www.example.com/ http://a:80\n\
                 route add other other.example.com/ http://b:80\n",
            ),
            Some(&first),
        );
        let carried = next.lookup_host("www.example.com").unwrap();
        assert_eq!(carried.counters.tx_bytes(), 9);
        let fresh = next.lookup_host("other.example.com").unwrap();
        assert_eq!(fresh.counters.tx_bytes(), 0);
    }

    #[test]
    fn test_apply_is_order_invariant_after_reverse_sort() {
        let mut lines = vec![
            "route add svc www.example.com/ http://10.0.0.1:8080 weight 1",
            "route add svc www.example.com/a http://10.0.0.2:8080 weight 1",
            "route add api api.example.com/ http://10.0.0.3:8080 weight 2",
        ];
        lines.sort_by(|a, b| b.cmp(a));
        let sorted = table_from(&lines.join("\n"));

        // A shuffled batch re-sorted the same way yields the same table.
        let mut shuffled = vec![lines[2], lines[0], lines[1]];
        shuffled.sort_by(|a, b| b.cmp(a));
        let resorted = table_from(&shuffled.join("\n"));

        assert_eq!(sorted.to_string(), resorted.to_string());
    }

    #[test]
    fn test_empty_batch_yields_empty_table() {
        let table = table_from("");
        assert!(table.is_empty());
        assert!(table.lookup_host("anything.example.com").is_none());
    }
}
