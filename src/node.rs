//! A fully wired node: block pool, coordinators, shard registry and the
//! swarm services built on top of it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::block::BlockId;
use crate::cache::coordinator::{CoordinatorError, KvCacheCoordinator};
use crate::cache::hierarchical::HierarchicalCoordinator;
use crate::cache::pool::{new_shared_pool, SharedBlockPool};
use crate::cache::predictive::PredictiveCoordinator;
use crate::cache::prefetch_queue::PrefetchQueueCoordinator;
use crate::config::{AllocationStrategy, Config};
use crate::metrics::SwarmMetrics;
use crate::swarm::balancer::SwarmLoadBalancer;
use crate::swarm::compressor::AdaptiveSwarmCompressor;
use crate::swarm::manager::ContextShardManager;
use crate::swarm::migration::P2PMigrationEngine;
use crate::swarm::prefetcher::ContextPrefetcher;
use crate::swarm::tasks::{BackgroundTasks, CycleReport};
use crate::swarm::telemetry::{ShardLoadTelemetry, TelemetrySource};
use crate::swarm::transport::{PeerTransport, PlaintextSealer, SimulatedTransport};

/// Blocks held by a request after allocation, plus how many of its
/// tokens were served from the prefix cache.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Allocation {
    pub blocks: Vec<Vec<BlockId>>,
    pub cached_tokens: usize,
}

pub struct SwarmNode {
    pub config: Config,
    pub pool: SharedBlockPool,
    /// Serves direct allocations; exact or predictive per config.
    pub allocator: Mutex<PredictiveCoordinator>,
    /// Serves allocations made on behalf of one model layer.
    pub layered: Mutex<HierarchicalCoordinator>,
    /// Allocations announced ahead of time, on the same pool.
    pub prefetch_queue: Arc<Mutex<PrefetchQueueCoordinator>>,
    pub shards: Arc<ContextShardManager>,
    pub compressor: Arc<AdaptiveSwarmCompressor>,
    pub prefetcher: ContextPrefetcher,
    pub engine: Arc<P2PMigrationEngine>,
    pub balancer: Arc<SwarmLoadBalancer>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub metrics: SwarmMetrics,
    pub start_time: Instant,
}

impl SwarmNode {
    /// Build a node with the in-process transport and shard-derived telemetry.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let transport = Arc::new(SimulatedTransport::new(Duration::from_millis(
            config.migration.simulated_latency_ms,
        )));
        Self::with_parts(config, transport, None)
    }

    /// Build a node over an explicit transport and, optionally, telemetry.
    pub fn with_parts(
        config: Config,
        transport: Arc<dyn PeerTransport>,
        telemetry: Option<Arc<dyn TelemetrySource>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let pool = new_shared_pool(&config.pool);
        let groups = config.cache_groups();
        let allocator = PredictiveCoordinator::new(
            KvCacheCoordinator::new(pool.clone(), groups.clone())?,
            &config.allocation,
        );
        let layered = HierarchicalCoordinator::new(
            KvCacheCoordinator::new(pool.clone(), groups.clone())?,
            config.allocation.num_layers,
        );
        let prefetch_queue = PrefetchQueueCoordinator::new(
            KvCacheCoordinator::new(pool.clone(), groups)?,
            config.allocation.prefetch_queue_capacity,
        );

        let shards = Arc::new(ContextShardManager::new(&config.sharding));
        let compressor = Arc::new(AdaptiveSwarmCompressor::new(shards.clone(), &config.compression));
        let prefetcher = ContextPrefetcher::new(compressor.clone(), &config.prefetch);
        let engine = Arc::new(P2PMigrationEngine::new(
            shards.clone(),
            transport,
            Arc::new(PlaintextSealer),
            &config.migration,
        ));
        let telemetry = telemetry.unwrap_or_else(|| {
            Arc::new(ShardLoadTelemetry::new(
                shards.clone(),
                pool.clone(),
                config.sharding.ranks.clone(),
                config.balancer.rank_capacity,
            ))
        });
        let balancer = Arc::new(SwarmLoadBalancer::new(telemetry.clone(), engine.clone(), &config.balancer));
        let metrics = SwarmMetrics::new()?;

        Ok(Self {
            config,
            pool,
            allocator: Mutex::new(allocator),
            layered: Mutex::new(layered),
            prefetch_queue: Arc::new(Mutex::new(prefetch_queue)),
            shards,
            compressor,
            prefetcher,
            engine,
            balancer,
            telemetry,
            metrics,
            start_time: Instant::now(),
        })
    }

    /// Allocate `tokens` for `request`, reusing cached prefix blocks of
    /// `token_ids` first and publishing its full blocks afterwards.
    pub fn allocate(&self, request: &str, tokens: usize, token_ids: &[u32]) -> Result<Allocation, CoordinatorError> {
        let strategy = self.config.allocation.strategy;
        let mut allocator = self.allocator.lock();
        allocate_with_prefix(
            &mut *allocator,
            PredictiveCoordinator::inner_mut,
            request,
            tokens,
            token_ids,
            |allocator, tokens| match strategy {
                AllocationStrategy::Exact => allocator.inner_mut().allocate(request, tokens),
                AllocationStrategy::Predictive => allocator.allocate_predictive(request, tokens),
            },
        )
    }

    /// Like [`SwarmNode::allocate`], on behalf of model layer `layer`.
    /// Always sized exactly.
    pub fn allocate_for_layer(
        &self,
        layer: usize,
        request: &str,
        tokens: usize,
        token_ids: &[u32],
    ) -> Result<Allocation, CoordinatorError> {
        let mut layered = self.layered.lock();
        let num_layers = layered.layer_allocations().len();
        if layer >= num_layers {
            return Err(CoordinatorError::LayerOutOfRange { layer, num_layers });
        }
        allocate_with_prefix(
            &mut *layered,
            HierarchicalCoordinator::inner_mut,
            request,
            tokens,
            token_ids,
            |layered, tokens| layered.allocate_for_layer(layer, request, tokens),
        )
    }

    /// Release `request` wherever it was allocated. A known completion
    /// length feeds the length predictor.
    pub fn release(&self, request: &str, completion_tokens: Option<usize>) -> Result<usize, CoordinatorError> {
        let mut freed = {
            let mut allocator = self.allocator.lock();
            if let Some(n) = completion_tokens {
                allocator.record_completion(n);
            }
            allocator.inner_mut().free(request)?
        };
        freed += self.layered.lock().inner_mut().free(request)?;
        freed += self.prefetch_queue.lock().inner_mut().free(request)?;
        Ok(freed)
    }

    /// Remove a context along with its access history.
    pub fn delete_context(&self, context_id: &str) -> bool {
        self.prefetcher.forget(context_id);
        self.shards.delete_context(context_id)
    }

    /// Refresh gauges and render the metrics registry.
    pub fn render_metrics(&self) -> prometheus::Result<String> {
        self.metrics.update_pool(&self.pool.lock().stats());
        self.metrics.update_shards(&self.shards);
        self.metrics.update_cluster(&self.telemetry.snapshot());
        self.metrics.encode()
    }

    /// Start the compression, balancing and prefetch-drain cycles.
    pub fn spawn_background(&self, reports: mpsc::Sender<CycleReport>) -> BackgroundTasks {
        let mut tasks = BackgroundTasks::new();
        tasks.spawn_compression(
            self.compressor.clone(),
            self.telemetry.clone(),
            Duration::from_secs(self.config.compression.cycle_interval_secs),
            reports.clone(),
        );
        tasks.spawn_balancer(
            self.balancer.clone(),
            Duration::from_secs(self.config.balancer.interval_secs),
            reports.clone(),
        );
        tasks.spawn_prefetch_drain(
            self.prefetch_queue.clone(),
            self.config.allocation.drain_batch,
            Duration::from_millis(self.config.allocation.drain_interval_ms),
            reports,
        );
        tasks
    }
}

/// Prefix lookup, then `grow`, then publish the prompt's full blocks.
///
/// A failed `grow` detaches the prefix hits taken by this call, so the
/// request is left exactly as it was before.
fn allocate_with_prefix<A>(
    allocator: &mut A,
    coordinator: fn(&mut A) -> &mut KvCacheCoordinator,
    request: &str,
    tokens: usize,
    token_ids: &[u32],
    grow: impl FnOnce(&mut A, usize) -> Result<Vec<Vec<BlockId>>, CoordinatorError>,
) -> Result<Allocation, CoordinatorError> {
    let tokens = tokens.max(token_ids.len());
    let snapshot = coordinator(&mut *allocator).held_counts(request);

    let cached_tokens = if token_ids.is_empty() {
        0
    } else {
        coordinator(&mut *allocator).find_longest_cache_hit(request, token_ids)
    };

    if let Err(e) = grow(&mut *allocator, tokens) {
        let released = coordinator(&mut *allocator).rollback(request, &snapshot)?;
        if released > 0 {
            warn!(request, released, error = %e, "Allocation failed, prefix hits released");
        }
        return Err(e);
    }

    let coordinator = coordinator(&mut *allocator);
    if !token_ids.is_empty() {
        coordinator.cache_request_tokens(request, token_ids)?;
    }
    let blocks = coordinator.get_blocks(request).unwrap_or_default();
    Ok(Allocation { blocks, cached_tokens })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn node(strategy: AllocationStrategy) -> SwarmNode {
        sized_node(strategy, 32)
    }

    fn sized_node(strategy: AllocationStrategy, num_blocks: usize) -> SwarmNode {
        let mut config = Config {
            pool: PoolConfig {
                num_blocks,
                block_size: 4,
                ..Default::default()
            },
            ..Default::default()
        };
        config.allocation.strategy = strategy;
        config.allocation.initial_average_length = 8.0;
        SwarmNode::new(config).unwrap()
    }

    #[test]
    fn test_prefix_reuse_across_requests() {
        let n = node(AllocationStrategy::Exact);
        let prompt: Vec<u32> = (0..12).collect();
        let first = n.allocate("a", 0, &prompt).unwrap();
        assert_eq!(first.cached_tokens, 0);
        assert_eq!(first.blocks[0].len(), 3);

        let second = n.allocate("b", 0, &prompt).unwrap();
        assert_eq!(second.cached_tokens, 12);
        assert_eq!(second.blocks[0], first.blocks[0]);
    }

    #[test]
    fn test_out_of_blocks_after_prefix_hit_leaves_no_state() {
        for strategy in [AllocationStrategy::Exact, AllocationStrategy::Predictive] {
            let n = sized_node(strategy, 4);
            let prompt: Vec<u32> = (0..8).collect();
            let first = n.allocate("a", 0, &prompt).unwrap();
            let held = first.blocks[0].len();
            let shared = &first.blocks[0][..2];

            let err = n.allocate("b", 100, &prompt).unwrap_err();
            assert!(err.is_out_of_blocks());
            assert!(n.allocator.lock().inner().get_blocks("b").is_none());
            for &id in shared {
                assert_eq!(n.pool.lock().get_block(id).unwrap().ref_cnt, 1);
            }
            assert_eq!(n.release("b", None).unwrap(), 0);

            assert_eq!(n.release("a", None).unwrap(), held);
            assert_eq!(n.pool.lock().num_free_blocks(), 4);
        }
    }

    #[test]
    fn test_failed_growth_keeps_earlier_blocks() {
        let n = sized_node(AllocationStrategy::Exact, 4);
        n.allocate("a", 4, &[]).unwrap();
        assert!(n.allocate("a", 100, &[]).unwrap_err().is_out_of_blocks());
        assert_eq!(n.allocator.lock().inner().get_blocks("a").unwrap()[0].len(), 1);
    }

    #[test]
    fn test_layer_allocation() {
        let n = node(AllocationStrategy::Exact);
        let alloc = n.allocate_for_layer(3, "l", 8, &[]).unwrap();
        assert_eq!(alloc.blocks[0].len(), 2);
        assert_eq!(n.layered.lock().layer_allocations()[3], 1);

        let err = n.allocate_for_layer(32, "l", 8, &[]).unwrap_err();
        assert_eq!(err, CoordinatorError::LayerOutOfRange { layer: 32, num_layers: 32 });
        assert_eq!(n.release("l", None).unwrap(), 2);
        assert_eq!(n.pool.lock().num_free_blocks(), 32);
    }

    #[test]
    fn test_predictive_allocates_ahead() {
        let n = node(AllocationStrategy::Predictive);
        let alloc = n.allocate("a", 8, &[]).unwrap();
        assert!(alloc.blocks[0].len() > 2);
        assert_eq!(n.release("a", Some(4)).unwrap(), alloc.blocks[0].len());
    }

    #[test]
    fn test_release_covers_prefetched_requests() {
        let n = node(AllocationStrategy::Exact);
        assert!(n.prefetch_queue.lock().enqueue("p", 8, 0));
        n.prefetch_queue.lock().process_prefetch_queue(1).unwrap();
        assert_eq!(n.release("p", None).unwrap(), 2);
        assert_eq!(n.release("missing", None).unwrap(), 0);
    }

    #[test]
    fn test_render_metrics() {
        let n = node(AllocationStrategy::Exact);
        n.shards.shard_context("ctx", 10_000, &[0, 1], "t", 0).unwrap();
        let text = n.render_metrics().unwrap();
        assert!(text.contains("kv_swarm_contexts 1"));
        assert!(text.contains("kv_swarm_pool_free_blocks 32"));
    }
}
