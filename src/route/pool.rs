//! Endpoint pools: the ordered set of backends behind one route key.
//!
//! A pool owns the load-balancing cursor, the per-backend connection cap,
//! and the failure cooldown bookkeeping. Selection state persists across
//! requests; callers get one endpoint per [`EndpointPool::next_endpoint`]
//! call and report dial failures back through
//! [`EndpointPool::mark_failed`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::endpoint::Endpoint;

/// Classification of a [`EndpointPool::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPutResult {
    Added,
    Updated,
    Unchanged,
}

impl PoolPutResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolPutResult::Added => "ADDED",
            PoolPutResult::Updated => "UPDATED",
            PoolPutResult::Unchanged => "UNCHANGED",
        }
    }
}

/// Result of one selection round.
#[derive(Debug, Clone)]
pub enum Selection {
    Available(Arc<Endpoint>),
    /// Every endpoint is at or over the per-backend connection cap.
    AllBusy,
    /// The pool has no endpoints at all.
    Empty,
}

/// Occupancy of a pool, observed without consuming a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCapacity {
    Available,
    /// Every endpoint is at or over the per-backend connection cap.
    AllBusy,
    /// The pool has no endpoints at all.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
}

impl LoadBalancingAlgorithm {
    /// Parses a config tag; unrecognized tags fall back to round-robin.
    pub fn parse(tag: &str) -> LoadBalancingAlgorithm {
        match tag {
            "least-connection" => LoadBalancingAlgorithm::LeastConnections,
            _ => LoadBalancingAlgorithm::RoundRobin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolOpts {
    pub host: String,
    pub context_path: String,
    pub retry_after_failure: Duration,
    /// 0 means unlimited.
    pub max_conns_per_backend: i64,
    pub load_balancing_algorithm: LoadBalancingAlgorithm,
}

#[derive(Debug)]
struct Member {
    endpoint: Arc<Endpoint>,
    updated_at: Instant,
    last_failed_at: Option<Instant>,
}

#[derive(Debug)]
struct PoolInner {
    members: Vec<Member>,
    cursor: usize,
}

/// Ordered, identity-deduplicated collection of endpoints for one route.
#[derive(Debug)]
pub struct EndpointPool {
    host: String,
    context_path: String,
    retry_after_failure: Duration,
    max_conns_per_backend: i64,
    load_balancing_algorithm: LoadBalancingAlgorithm,
    inner: Mutex<PoolInner>,
    last_updated: Mutex<Instant>,
}

impl EndpointPool {
    pub fn new(opts: PoolOpts) -> EndpointPool {
        EndpointPool {
            host: opts.host,
            context_path: opts.context_path,
            retry_after_failure: opts.retry_after_failure,
            max_conns_per_backend: opts.max_conns_per_backend,
            load_balancing_algorithm: opts.load_balancing_algorithm,
            inner: Mutex::new(PoolInner {
                members: Vec::new(),
                cursor: 0,
            }),
            last_updated: Mutex::new(Instant::now()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn max_conns_per_backend(&self) -> i64 {
        self.max_conns_per_backend
    }

    pub fn load_balancing_algorithm(&self) -> LoadBalancingAlgorithm {
        self.load_balancing_algorithm
    }

    pub fn retry_after_failure(&self) -> Duration {
        self.retry_after_failure
    }

    /// Inserts or refreshes an endpoint by identity. A put always
    /// refreshes the pool's last-updated time; a replacement carries the
    /// previous member's live stats over.
    pub fn put(&self, endpoint: Endpoint) -> PoolPutResult {
        self.put_at(endpoint, Instant::now())
    }

    pub fn put_at(&self, mut endpoint: Endpoint, now: Instant) -> PoolPutResult {
        let mut inner = self.inner.lock().expect("pool lock");
        let identity = endpoint.identity();
        let position = inner
            .members
            .iter()
            .position(|m| m.endpoint.identity() == identity);
        let result = match position {
            Some(idx) => {
                let member = &mut inner.members[idx];
                let result = if member.endpoint.equivalent(&endpoint) {
                    PoolPutResult::Unchanged
                } else {
                    PoolPutResult::Updated
                };
                endpoint.adopt_stats(&member.endpoint);
                member.endpoint = Arc::new(endpoint);
                member.updated_at = now;
                result
            }
            None => {
                inner.members.push(Member {
                    endpoint: Arc::new(endpoint),
                    updated_at: now,
                    last_failed_at: None,
                });
                PoolPutResult::Added
            }
        };
        drop(inner);
        self.mark_last_updated(now);
        result
    }

    /// Removes the endpoint with the same identity. Returns whether a
    /// member was removed.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let mut inner = self.inner.lock().expect("pool lock");
        let before = inner.members.len();
        let identity = endpoint.identity();
        inner.members.retain(|m| m.endpoint.identity() != identity);
        let removed = inner.members.len() != before;
        drop(inner);
        if removed {
            self.mark_last_updated(Instant::now());
        }
        removed
    }

    /// Visits a snapshot of the pool; mutations made while the visitor
    /// runs are not observed by the iteration.
    pub fn each(&self, mut visitor: impl FnMut(&Arc<Endpoint>)) {
        let snapshot: Vec<Arc<Endpoint>> = {
            let inner = self.inner.lock().expect("pool lock");
            inner.members.iter().map(|m| Arc::clone(&m.endpoint)).collect()
        };
        for endpoint in &snapshot {
            visitor(endpoint);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("pool lock").members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool lock").members.len()
    }

    /// Classifies the pool's occupancy without advancing the
    /// load-balancing cursor. The lookup middleware probes with this so
    /// its admission check does not skew the rotation the proxy's real
    /// selection sees.
    pub fn capacity_state(&self) -> PoolCapacity {
        let inner = self.inner.lock().expect("pool lock");
        if inner.members.is_empty() {
            return PoolCapacity::Empty;
        }
        if inner.members.iter().all(|m| self.over_cap(m)) {
            PoolCapacity::AllBusy
        } else {
            PoolCapacity::Available
        }
    }

    /// Selects the next endpoint under the configured algorithm.
    ///
    /// Endpoints at or over the connection cap are never returned; if
    /// every endpoint is capped the result is [`Selection::AllBusy`].
    /// Endpoints inside the failure cooldown are skipped while any other
    /// candidate exists, but a pool where everything is cooling down still
    /// serves (the backend may have recovered; failing the request here
    /// would turn one bad dial into an outage).
    pub fn next_endpoint(&self) -> Selection {
        self.next_endpoint_at(Instant::now())
    }

    pub fn next_endpoint_at(&self, now: Instant) -> Selection {
        let mut inner = self.inner.lock().expect("pool lock");
        if inner.members.is_empty() {
            return Selection::Empty;
        }

        let dialable: Vec<usize> = (0..inner.members.len())
            .filter(|&i| !self.over_cap(&inner.members[i]))
            .collect();
        if dialable.is_empty() {
            return Selection::AllBusy;
        }

        let preferred: Vec<usize> = dialable
            .iter()
            .copied()
            .filter(|&i| !self.in_cooldown(&inner.members[i], now))
            .collect();
        let candidates = if preferred.is_empty() {
            &dialable
        } else {
            &preferred
        };

        let chosen = match self.load_balancing_algorithm {
            LoadBalancingAlgorithm::RoundRobin => self.pick_round_robin(&inner, candidates),
            LoadBalancingAlgorithm::LeastConnections => {
                self.pick_least_connections(&inner, candidates)
            }
        };
        inner.cursor = chosen + 1;
        Selection::Available(Arc::clone(&inner.members[chosen].endpoint))
    }

    fn over_cap(&self, member: &Member) -> bool {
        self.max_conns_per_backend > 0
            && member.endpoint.stats.connections() >= self.max_conns_per_backend
    }

    fn in_cooldown(&self, member: &Member, now: Instant) -> bool {
        if self.retry_after_failure.is_zero() {
            return false;
        }
        match member.last_failed_at {
            Some(failed_at) => now.duration_since(failed_at) < self.retry_after_failure,
            None => false,
        }
    }

    /// First candidate at or after the cursor, wrapping.
    fn pick_round_robin(&self, inner: &PoolInner, candidates: &[usize]) -> usize {
        let len = inner.members.len();
        let start = inner.cursor % len;
        for offset in 0..len {
            let idx = (start + offset) % len;
            if candidates.contains(&idx) {
                return idx;
            }
        }
        candidates[0]
    }

    /// Fewest live connections; ties break by cursor order.
    fn pick_least_connections(&self, inner: &PoolInner, candidates: &[usize]) -> usize {
        let len = inner.members.len();
        let start = inner.cursor % len;
        let mut best: Option<(i64, usize)> = None;
        for offset in 0..len {
            let idx = (start + offset) % len;
            if !candidates.contains(&idx) {
                continue;
            }
            let conns = inner.members[idx].endpoint.stats.connections();
            if best.map_or(true, |(best_conns, _)| conns < best_conns) {
                best = Some((conns, idx));
            }
        }
        best.map(|(_, idx)| idx).unwrap_or(candidates[0])
    }

    /// Records a dial/handshake failure against the member with the same
    /// identity, starting its cooldown.
    pub fn mark_failed(&self, endpoint: &Endpoint) {
        self.mark_failed_at(endpoint, Instant::now());
    }

    pub fn mark_failed_at(&self, endpoint: &Endpoint, now: Instant) {
        let mut inner = self.inner.lock().expect("pool lock");
        let identity = endpoint.identity();
        if let Some(member) = inner
            .members
            .iter_mut()
            .find(|m| m.endpoint.identity() == identity)
        {
            member.last_failed_at = Some(now);
        }
    }

    /// Removes endpoints whose registration has gone stale and returns
    /// them for logging.
    pub fn prune_endpoints(&self, now: Instant) -> Vec<Arc<Endpoint>> {
        let mut inner = self.inner.lock().expect("pool lock");
        let mut removed = Vec::new();
        inner.members.retain(|m| {
            let stale = now.duration_since(m.updated_at) > m.endpoint.stale_threshold;
            if stale {
                removed.push(Arc::clone(&m.endpoint));
            }
            !stale
        });
        removed
    }

    /// Bulk-refreshes every member and the pool itself, granting one full
    /// staleness grace period (used after the registration source
    /// reconnects).
    pub fn mark_updated(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("pool lock");
        for member in &mut inner.members {
            member.updated_at = now;
        }
        drop(inner);
        self.mark_last_updated(now);
    }

    pub fn last_updated(&self) -> Instant {
        *self.last_updated.lock().expect("pool updated lock")
    }

    fn mark_last_updated(&self, now: Instant) {
        *self.last_updated.lock().expect("pool updated lock") = now;
    }

    /// Addresses of all members, in pool order.
    pub fn addresses(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("pool lock");
        inner
            .members
            .iter()
            .map(|m| m.endpoint.canonical_addr())
            .collect()
    }

    /// Identity keys of members already attempted this request are passed
    /// in; returns a fresh selection excluding them, used by the retry
    /// loop so a request never redials an endpoint that just failed it.
    pub fn next_endpoint_excluding(&self, attempted: &HashSet<String>) -> Selection {
        self.next_endpoint_excluding_at(attempted, Instant::now())
    }

    pub fn next_endpoint_excluding_at(
        &self,
        attempted: &HashSet<String>,
        now: Instant,
    ) -> Selection {
        if attempted.is_empty() {
            return self.next_endpoint_at(now);
        }
        let len = self.len();
        for _ in 0..len {
            match self.next_endpoint_at(now) {
                Selection::Available(endpoint) if attempted.contains(&endpoint.identity()) => {
                    continue;
                }
                other => return other,
            }
        }
        Selection::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::endpoint::EndpointOpts;

    fn make_pool(max_conns: i64) -> EndpointPool {
        EndpointPool::new(PoolOpts {
            host: "example.com".to_string(),
            context_path: "/".to_string(),
            retry_after_failure: Duration::from_secs(30),
            max_conns_per_backend: max_conns,
            load_balancing_algorithm: LoadBalancingAlgorithm::RoundRobin,
        })
    }

    fn make_endpoint(host: &str, port: u16) -> Endpoint {
        Endpoint::new(EndpointOpts {
            host: host.to_string(),
            port,
            private_instance_id: format!("{host}:{port}-instance"),
            stale_threshold: Duration::from_secs(120),
            ..Default::default()
        })
    }

    fn selected(selection: Selection) -> Arc<Endpoint> {
        match selection {
            Selection::Available(e) => e,
            other => panic!("expected an endpoint, got {other:?}"),
        }
    }

    // ========== Put / Remove ==========

    #[test]
    fn test_put_classifies_added_updated_unchanged() {
        let pool = make_pool(0);
        let endpoint = make_endpoint("10.0.0.1", 8080);
        assert_eq!(pool.put(endpoint.clone()), PoolPutResult::Added);
        assert_eq!(pool.put(endpoint.clone()), PoolPutResult::Unchanged);

        let mut changed = endpoint.clone();
        changed.application_id = "new-app".to_string();
        assert_eq!(pool.put(changed), PoolPutResult::Updated);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_put_refreshes_last_updated() {
        let pool = make_pool(0);
        let before = pool.last_updated();
        let later = Instant::now() + Duration::from_secs(5);
        pool.put_at(make_endpoint("10.0.0.1", 8080), later);
        assert!(pool.last_updated() > before);
    }

    #[test]
    fn test_put_carries_stats_across_update() {
        let pool = make_pool(0);
        let endpoint = make_endpoint("10.0.0.1", 8080);
        pool.put(endpoint.clone());
        selected(pool.next_endpoint()).stats.increment_connections();

        let mut changed = endpoint;
        changed.application_id = "new-app".to_string();
        pool.put(changed);

        let current = selected(pool.next_endpoint());
        assert_eq!(current.stats.connections(), 1);
    }

    #[test]
    fn test_remove_by_identity() {
        let pool = make_pool(0);
        let a = make_endpoint("10.0.0.1", 8080);
        let b = make_endpoint("10.0.0.2", 8080);
        pool.put(a.clone());
        pool.put(b);
        assert!(pool.remove(&a));
        assert!(!pool.remove(&a));
        assert_eq!(pool.len(), 1);
    }

    // ========== Selection ==========

    #[test]
    fn test_round_robin_cycles() {
        let pool = make_pool(0);
        pool.put(make_endpoint("10.0.0.1", 8080));
        pool.put(make_endpoint("10.0.0.2", 8080));
        pool.put(make_endpoint("10.0.0.3", 8080));

        let picks: Vec<String> = (0..6)
            .map(|_| selected(pool.next_endpoint()).canonical_addr())
            .collect();
        assert_eq!(
            picks,
            vec![
                "10.0.0.1:8080",
                "10.0.0.2:8080",
                "10.0.0.3:8080",
                "10.0.0.1:8080",
                "10.0.0.2:8080",
                "10.0.0.3:8080"
            ]
        );
    }

    #[test]
    fn test_cursor_persists_across_calls() {
        let pool = make_pool(0);
        pool.put(make_endpoint("10.0.0.1", 8080));
        pool.put(make_endpoint("10.0.0.2", 8080));

        let first = selected(pool.next_endpoint()).canonical_addr();
        let second = selected(pool.next_endpoint()).canonical_addr();
        assert_ne!(first, second);
    }

    #[test]
    fn test_empty_pool_selection() {
        let pool = make_pool(0);
        assert!(matches!(pool.next_endpoint(), Selection::Empty));
    }

    #[test]
    fn test_saturated_endpoint_is_never_selected() {
        let pool = make_pool(2);
        let busy = make_endpoint("10.0.0.1", 8080);
        let free = make_endpoint("10.0.0.2", 8080);
        pool.put(busy.clone());
        pool.put(free);
        busy.stats.increment_connections();
        busy.stats.increment_connections();

        for _ in 0..4 {
            let pick = selected(pool.next_endpoint());
            assert_eq!(pick.canonical_addr(), "10.0.0.2:8080");
        }
    }

    #[test]
    fn test_all_over_cap_returns_all_busy() {
        let pool = make_pool(2);
        for port in [8080, 8081] {
            let endpoint = make_endpoint("10.0.0.1", port);
            for _ in 0..3 {
                endpoint.stats.increment_connections();
            }
            pool.put(endpoint);
        }
        assert!(matches!(pool.next_endpoint(), Selection::AllBusy));
    }

    #[test]
    fn test_unlimited_cap_ignores_connection_counts() {
        let pool = make_pool(0);
        let endpoint = make_endpoint("10.0.0.1", 8080);
        for _ in 0..100 {
            endpoint.stats.increment_connections();
        }
        pool.put(endpoint);
        assert!(matches!(pool.next_endpoint(), Selection::Available(_)));
    }

    #[test]
    fn test_failed_endpoint_skipped_during_cooldown() {
        let pool = make_pool(0);
        let bad = make_endpoint("10.0.0.1", 8080);
        pool.put(bad.clone());
        pool.put(make_endpoint("10.0.0.2", 8080));

        let now = Instant::now();
        pool.mark_failed_at(&bad, now);
        for _ in 0..4 {
            let pick = selected(pool.next_endpoint_at(now + Duration::from_secs(1)));
            assert_eq!(pick.canonical_addr(), "10.0.0.2:8080");
        }
    }

    #[test]
    fn test_cooldown_expires() {
        let pool = make_pool(0);
        let bad = make_endpoint("10.0.0.1", 8080);
        pool.put(bad.clone());
        pool.put(make_endpoint("10.0.0.2", 8080));

        let now = Instant::now();
        pool.mark_failed_at(&bad, now);
        let after = now + Duration::from_secs(31);
        let picks: Vec<String> = (0..2)
            .map(|_| selected(pool.next_endpoint_at(after)).canonical_addr())
            .collect();
        assert!(picks.contains(&"10.0.0.1:8080".to_string()));
    }

    #[test]
    fn test_all_cooling_down_still_serves() {
        let pool = make_pool(0);
        let a = make_endpoint("10.0.0.1", 8080);
        let b = make_endpoint("10.0.0.2", 8080);
        pool.put(a.clone());
        pool.put(b.clone());

        let now = Instant::now();
        pool.mark_failed_at(&a, now);
        pool.mark_failed_at(&b, now);
        assert!(matches!(
            pool.next_endpoint_at(now + Duration::from_secs(1)),
            Selection::Available(_)
        ));
    }

    #[test]
    fn test_least_connections_prefers_idle_endpoint() {
        let pool = EndpointPool::new(PoolOpts {
            host: "example.com".to_string(),
            context_path: "/".to_string(),
            retry_after_failure: Duration::from_secs(30),
            max_conns_per_backend: 0,
            load_balancing_algorithm: LoadBalancingAlgorithm::LeastConnections,
        });
        let loaded = make_endpoint("10.0.0.1", 8080);
        pool.put(loaded.clone());
        pool.put(make_endpoint("10.0.0.2", 8080));
        loaded.stats.increment_connections();
        loaded.stats.increment_connections();

        let pick = selected(pool.next_endpoint());
        assert_eq!(pick.canonical_addr(), "10.0.0.2:8080");
    }

    #[test]
    fn test_selection_excluding_attempted() {
        let pool = make_pool(0);
        let a = make_endpoint("10.0.0.1", 8080);
        pool.put(a.clone());
        pool.put(make_endpoint("10.0.0.2", 8080));

        let mut attempted = HashSet::new();
        attempted.insert(a.identity());
        for _ in 0..3 {
            let pick = selected(pool.next_endpoint_excluding(&attempted));
            assert_eq!(pick.canonical_addr(), "10.0.0.2:8080");
        }
    }

    #[test]
    fn test_selection_exhausted_when_everything_attempted() {
        let pool = make_pool(0);
        let a = make_endpoint("10.0.0.1", 8080);
        pool.put(a.clone());

        let mut attempted = HashSet::new();
        attempted.insert(a.identity());
        assert!(matches!(
            pool.next_endpoint_excluding(&attempted),
            Selection::Empty
        ));
    }

    // ========== Capacity probe ==========

    #[test]
    fn test_capacity_state_does_not_advance_cursor() {
        let pool = make_pool(0);
        pool.put(make_endpoint("10.0.0.1", 8080));
        pool.put(make_endpoint("10.0.0.2", 8080));

        assert_eq!(pool.capacity_state(), PoolCapacity::Available);
        assert_eq!(pool.capacity_state(), PoolCapacity::Available);

        // The rotation still starts at the first member.
        let pick = selected(pool.next_endpoint());
        assert_eq!(pick.canonical_addr(), "10.0.0.1:8080");
    }

    #[test]
    fn test_capacity_state_empty_and_all_busy() {
        let pool = make_pool(1);
        assert_eq!(pool.capacity_state(), PoolCapacity::Empty);

        let busy = make_endpoint("10.0.0.1", 8080);
        busy.stats.increment_connections();
        pool.put(busy);
        assert_eq!(pool.capacity_state(), PoolCapacity::AllBusy);

        pool.put(make_endpoint("10.0.0.2", 8080));
        assert_eq!(pool.capacity_state(), PoolCapacity::Available);
    }

    #[test]
    fn test_capacity_state_ignores_cooldowns() {
        let pool = make_pool(0);
        let bad = make_endpoint("10.0.0.1", 8080);
        pool.put(bad.clone());
        pool.mark_failed(&bad);

        // A cooling-down endpoint is still dialable capacity.
        assert_eq!(pool.capacity_state(), PoolCapacity::Available);
    }

    // ========== Pruning ==========

    #[test]
    fn test_prune_removes_stale_endpoints() {
        let pool = make_pool(0);
        pool.put(make_endpoint("10.0.0.1", 8080));
        pool.put(make_endpoint("10.0.0.2", 8080));

        let removed = pool.prune_endpoints(Instant::now() + Duration::from_secs(121));
        assert_eq!(removed.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_prune_keeps_fresh_endpoints() {
        let pool = make_pool(0);
        pool.put(make_endpoint("10.0.0.1", 8080));
        let removed = pool.prune_endpoints(Instant::now() + Duration::from_secs(10));
        assert!(removed.is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_mark_updated_grants_grace_period() {
        let pool = make_pool(0);
        pool.put(make_endpoint("10.0.0.1", 8080));

        let later = Instant::now() + Duration::from_secs(100);
        pool.mark_updated(later);
        let removed = pool.prune_endpoints(later + Duration::from_secs(100));
        assert!(removed.is_empty());
    }

    #[test]
    fn test_each_iterates_snapshot() {
        let pool = make_pool(0);
        pool.put(make_endpoint("10.0.0.1", 8080));
        pool.put(make_endpoint("10.0.0.2", 8080));

        let mut seen = Vec::new();
        pool.each(|endpoint| seen.push(endpoint.canonical_addr()));
        assert_eq!(seen, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
    }
}
