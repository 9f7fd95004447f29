//! The concurrent owner of the route trie.
//!
//! Read-heavy: lookups take the shared lock; registration takes the
//! shared lock to search and a short exclusive lock only when a new pool
//! node must be inserted; unregistration and pruning take the exclusive
//! lock. The time of last update has its own lock so it can be refreshed
//! under the shared registry lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::trie::Trie;
use crate::metrics;
use crate::route::{
    Endpoint, EndpointPool, LoadBalancingAlgorithm, PoolOpts, PoolPutResult, RouteUri,
};

/// Governs which endpoints this router admits into its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardingMode {
    #[default]
    All,
    Segments,
    SharedAndSegments,
}

impl ShardingMode {
    pub fn parse(tag: &str) -> Option<ShardingMode> {
        match tag {
            "all" => Some(ShardingMode::All),
            "segments" => Some(ShardingMode::Segments),
            "shared-and-segments" => Some(ShardingMode::SharedAndSegments),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct RegistryOpts {
    pub prune_stale_droplets_interval: Duration,
    pub droplet_stale_threshold: Duration,
    pub max_conns_per_backend: i64,
    pub load_balancing_algorithm: LoadBalancingAlgorithm,
    pub sharding_mode: ShardingMode,
    pub isolation_segments: Vec<String>,
    pub empty_pool_timeout: Duration,
    pub empty_pool_response_code_503: bool,
}

impl Default for RegistryOpts {
    fn default() -> Self {
        RegistryOpts {
            prune_stale_droplets_interval: Duration::from_secs(30),
            droplet_stale_threshold: Duration::from_secs(120),
            max_conns_per_backend: 0,
            load_balancing_algorithm: LoadBalancingAlgorithm::RoundRobin,
            sharding_mode: ShardingMode::All,
            isolation_segments: Vec::new(),
            empty_pool_timeout: Duration::ZERO,
            empty_pool_response_code_503: false,
        }
    }
}

pub struct RouteRegistry {
    by_uri: RwLock<Trie>,
    opts: RegistryOpts,
    time_of_last_update: Mutex<Option<Instant>>,
    pruning_status: Mutex<PruneStatus>,
    suspend_pruning: AtomicBool,
}

impl RouteRegistry {
    pub fn new(opts: RegistryOpts) -> RouteRegistry {
        RouteRegistry {
            by_uri: RwLock::new(Trie::new()),
            opts,
            time_of_last_update: Mutex::new(None),
            pruning_status: Mutex::new(PruneStatus::Connected),
            suspend_pruning: AtomicBool::new(false),
        }
    }

    pub fn empty_pool_response_code_503(&self) -> bool {
        self.opts.empty_pool_response_code_503
    }

    /// Registers an endpoint under a uri. Idempotent on identity; silently
    /// rejected when the endpoint's isolation segment is outside this
    /// router's shard.
    pub fn register(&self, uri: &RouteUri, endpoint: Endpoint) {
        if !self.endpoint_in_router_shard(&endpoint) {
            return;
        }

        let backend = endpoint.canonical_addr();
        let application_id = endpoint.application_id.clone();
        let instance_id = endpoint.private_instance_id.clone();
        let route_service_url = endpoint.route_service_url.clone();
        let protocol = endpoint.protocol;
        let result = self.register_inner(uri, endpoint);
        metrics::REGISTRY_MESSAGES
            .with_label_values(&[result.as_str()])
            .inc();

        match result {
            PoolPutResult::Added => info!(
                target: "registry",
                uri = %uri,
                backend = %backend,
                application_id = %application_id,
                instance_id = %instance_id,
                route_service_url = %route_service_url,
                protocol = protocol.as_str(),
                "endpoint-registered"
            ),
            PoolPutResult::Updated => debug!(
                target: "registry",
                uri = %uri,
                backend = %backend,
                "endpoint-registered"
            ),
            PoolPutResult::Unchanged => debug!(
                target: "registry",
                uri = %uri,
                backend = %backend,
                "endpoint-not-registered"
            ),
        }
    }

    fn register_inner(&self, uri: &RouteUri, mut endpoint: Endpoint) -> PoolPutResult {
        let key = uri.route_key();
        let pool = {
            let trie = self.by_uri.read().expect("registry lock");
            trie.find(key.as_str())
        };
        let pool = match pool {
            Some(pool) => pool,
            None => self.insert_route_key(&key),
        };

        if endpoint.stale_threshold.is_zero()
            || endpoint.stale_threshold > self.opts.droplet_stale_threshold
        {
            endpoint.stale_threshold = self.opts.droplet_stale_threshold;
        }

        let result = pool.put(endpoint);
        self.set_time_of_last_update(Instant::now());
        result
    }

    /// Takes the exclusive lock, double-checks, and inserts a fresh pool
    /// node for the key.
    fn insert_route_key(&self, key: &RouteUri) -> Arc<EndpointPool> {
        let mut trie = self.by_uri.write().expect("registry lock");
        if let Some(pool) = trie.find(key.as_str()) {
            return pool;
        }
        let (host, context_path) = key.split_host_and_context_path();
        let pool = Arc::new(EndpointPool::new(PoolOpts {
            host,
            context_path,
            retry_after_failure: self.opts.droplet_stale_threshold / 4,
            max_conns_per_backend: self.opts.max_conns_per_backend,
            load_balancing_algorithm: self.opts.load_balancing_algorithm,
        }));
        trie.insert(key.as_str(), Arc::clone(&pool));
        info!(target: "registry", uri = %key, "route-registered");
        pool
    }

    /// Removes an endpoint by identity; deletes the pool when it becomes
    /// empty, unless the empty-pool timeout policy still protects it.
    pub fn unregister(&self, uri: &RouteUri, endpoint: &Endpoint) {
        if !self.endpoint_in_router_shard(endpoint) {
            return;
        }

        let key = uri.route_key();
        let mut trie = self.by_uri.write().expect("registry lock");
        if let Some(pool) = trie.find(key.as_str()) {
            if pool.remove(endpoint) {
                info!(
                    target: "registry",
                    uri = %key,
                    backend = %endpoint.canonical_addr(),
                    "endpoint-unregistered"
                );
            } else {
                info!(
                    target: "registry",
                    uri = %key,
                    backend = %endpoint.canonical_addr(),
                    "endpoint-not-unregistered"
                );
            }

            if pool.is_empty() && self.empty_pool_expired(&pool, Instant::now()) {
                trie.delete(key.as_str());
                info!(target: "registry", uri = %key, "route-unregistered");
            }
        }
        metrics::REGISTRY_MESSAGES
            .with_label_values(&["UNREGISTERED"])
            .inc();
    }

    /// Whether an empty pool may be deleted now. With
    /// `empty_pool_response_code_503` and a configured timeout, empty
    /// pools linger (serving 503) until the timeout elapses since their
    /// last update.
    fn empty_pool_expired(&self, pool: &EndpointPool, now: Instant) -> bool {
        if self.opts.empty_pool_response_code_503 && !self.opts.empty_pool_timeout.is_zero() {
            now.duration_since(pool.last_updated()) > self.opts.empty_pool_timeout
        } else {
            true
        }
    }

    /// Longest-prefix lookup with wildcard fallback.
    pub fn lookup(&self, uri: &RouteUri) -> Option<Arc<EndpointPool>> {
        let started = Instant::now();
        let pool = self.lookup_inner(uri);
        metrics::ROUTE_LOOKUP_TIME.observe(started.elapsed().as_secs_f64());
        pool
    }

    fn lookup_inner(&self, uri: &RouteUri) -> Option<Arc<EndpointPool>> {
        let trie = self.by_uri.read().expect("registry lock");
        let mut key = uri.route_key();
        if key.is_empty() {
            return None;
        }
        loop {
            if let Some(pool) = trie.match_uri(key.as_str()) {
                return Some(pool);
            }
            match key.next_wildcard() {
                Ok(next) => key = next,
                Err(_) => return None,
            }
        }
    }

    /// Narrows a lookup to one application instance. Returns a fresh
    /// single-endpoint pool, or `None` when the instance is not a member.
    pub fn lookup_with_app_instance(
        &self,
        uri: &RouteUri,
        app_id: &str,
        app_index: &str,
    ) -> Option<Arc<EndpointPool>> {
        let pool = self.lookup(uri)?;
        let mut surgical: Option<Arc<EndpointPool>> = None;
        pool.each(|endpoint| {
            if endpoint.application_id == app_id && endpoint.private_instance_index == app_index {
                let target = surgical
                    .get_or_insert_with(|| Arc::new(self.surgical_pool_for(&pool)))
                    .clone();
                target.put(endpoint.as_ref().clone());
            }
        });
        surgical
    }

    /// Narrows a lookup to a process; an empty index accepts any instance
    /// of that process.
    pub fn lookup_with_process_instance(
        &self,
        uri: &RouteUri,
        process_id: &str,
        process_index: &str,
    ) -> Option<Arc<EndpointPool>> {
        let pool = self.lookup(uri)?;
        let mut surgical: Option<Arc<EndpointPool>> = None;
        pool.each(|endpoint| {
            if endpoint.process_id == process_id
                && (endpoint.private_instance_index == process_index || process_index.is_empty())
            {
                let target = surgical
                    .get_or_insert_with(|| Arc::new(self.surgical_pool_for(&pool)))
                    .clone();
                target.put(endpoint.as_ref().clone());
            }
        });
        surgical
    }

    fn surgical_pool_for(&self, pool: &EndpointPool) -> EndpointPool {
        EndpointPool::new(PoolOpts {
            host: pool.host().to_string(),
            context_path: pool.context_path().to_string(),
            retry_after_failure: Duration::ZERO,
            max_conns_per_backend: pool.max_conns_per_backend(),
            load_balancing_algorithm: pool.load_balancing_algorithm(),
        })
    }

    fn endpoint_in_router_shard(&self, endpoint: &Endpoint) -> bool {
        match self.opts.sharding_mode {
            ShardingMode::All => true,
            ShardingMode::SharedAndSegments if endpoint.isolation_segment.is_empty() => true,
            _ => self
                .opts
                .isolation_segments
                .iter()
                .any(|segment| endpoint.isolation_segment == *segment),
        }
    }

    /// Suspend/resume pruning; suspended ticks mark the registry
    /// disconnected from its feed.
    pub fn set_pruning_suspended(&self, suspended: bool) {
        self.suspend_pruning.store(suspended, Ordering::Relaxed);
    }

    pub fn pruning_status(&self) -> PruneStatus {
        *self.pruning_status.lock().expect("pruning status lock")
    }

    pub fn prune_stale(&self) {
        self.prune_stale_at(Instant::now());
    }

    /// One prune tick. Holds the exclusive lock for the walk.
    pub fn prune_stale_at(&self, now: Instant) {
        let mut trie = self.by_uri.write().expect("registry lock");

        if self.suspend_pruning.load(Ordering::Relaxed) {
            info!(target: "registry", "prune-suspended");
            *self.pruning_status.lock().expect("pruning status lock") = PruneStatus::Disconnected;
            return;
        }
        {
            let mut status = self.pruning_status.lock().expect("pruning status lock");
            if *status == PruneStatus::Disconnected {
                // First tick after reconnecting: refresh everything so
                // routes that survived the outage get one grace period.
                debug!(target: "registry", "prune-unsuspended-refresh-routes");
                trie.each_node_with_pool(|_, pool| pool.mark_updated(now));
            }
            *status = PruneStatus::Connected;
        }

        let mut pools = Vec::new();
        trie.each_node_with_pool(|key, pool| pools.push((key.to_string(), Arc::clone(pool))));

        for (key, pool) in pools {
            let removed = pool.prune_endpoints(now);
            if pool.is_empty() && self.empty_pool_expired(&pool, now) {
                trie.delete(&key);
            }
            if !removed.is_empty() {
                let addresses: Vec<String> =
                    removed.iter().map(|e| e.canonical_addr()).collect();
                let isolation_segment = removed[0].isolation_segment.clone();
                info!(
                    target: "registry",
                    uri = %key,
                    endpoints = ?addresses,
                    isolation_segment = %if isolation_segment.is_empty() {
                        "-".to_string()
                    } else {
                        isolation_segment
                    },
                    "pruned-route"
                );
                metrics::ROUTES_PRUNED.inc_by(removed.len() as u64);
            }
        }
    }

    /// Spawns the periodic prune task. A zero interval disables pruning.
    pub fn start_pruning_cycle(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.opts.prune_stale_droplets_interval.is_zero() {
            warn!(target: "registry", "pruning disabled by configuration");
            return None;
        }
        let registry = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.opts.prune_stale_droplets_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!(target: "registry", "start-pruning-routes");
                registry.prune_stale();
                debug!(target: "registry", "finished-pruning-routes");
                metrics::TOTAL_ROUTES.set(registry.num_uris() as i64);
                metrics::MS_SINCE_LAST_UPDATE.set(registry.ms_since_last_update());
            }
        }))
    }

    pub fn num_uris(&self) -> usize {
        self.by_uri.read().expect("registry lock").pool_count()
    }

    pub fn num_endpoints(&self) -> usize {
        self.by_uri.read().expect("registry lock").endpoint_count()
    }

    pub fn time_of_last_update(&self) -> Option<Instant> {
        *self.time_of_last_update.lock().expect("update time lock")
    }

    fn set_time_of_last_update(&self, t: Instant) {
        *self.time_of_last_update.lock().expect("update time lock") = Some(t);
    }

    /// Milliseconds since the registry last changed; -1 before the first
    /// update.
    pub fn ms_since_last_update(&self) -> i64 {
        match self.time_of_last_update() {
            Some(t) => t.elapsed().as_millis() as i64,
            None => -1,
        }
    }

    /// Route table snapshot for the routes endpoint.
    pub fn snapshot(&self) -> serde_json::Value {
        let map = self.by_uri.read().expect("registry lock").to_map();
        serde_json::to_value(map).unwrap_or_default()
    }
}
