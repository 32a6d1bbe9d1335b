//! Prometheus metrics for the cache and the swarm.
//!
//! - Pool gauges mirror [`PoolStats`] and are refreshed before every scrape
//! - Shard gauges mirror the shard registry
//! - Cycle counters are fed from background [`CycleReport`]s

use prometheus::{Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::pool::PoolStats;
use crate::swarm::balancer::BalanceOutcome;
use crate::swarm::manager::ContextShardManager;
use crate::swarm::tasks::CycleReport;
use crate::swarm::telemetry::ClusterSnapshot;

pub struct SwarmMetrics {
    registry: Registry,

    pool_free_blocks: IntGauge,
    pool_cached_blocks: IntGauge,
    pool_cache_hits: IntGauge,
    pool_cache_misses: IntGauge,
    pool_evictions: IntGauge,
    pool_usage: Gauge,

    contexts: IntGauge,
    shards: IntGauge,
    dead_ranks: IntGauge,
    rank_utilization: GaugeVec,

    migrations: IntCounter,
    migration_failures: IntCounter,
    migration_duration_ms: Histogram,

    shards_scaled: IntCounter,
    shards_evicted: IntCounter,
    shards_pinned: IntCounter,
    prefetch_allocations: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl SwarmMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("kv_swarm".to_string()), None)?;

        let pool_usage = Gauge::new("pool_usage_ratio", "Fraction of blocks held by requests")?;
        registry.register(Box::new(pool_usage.clone()))?;

        let rank_utilization = GaugeVec::new(
            Opts::new("rank_utilization_ratio", "Last observed utilization per rank"),
            &["rank"],
        )?;
        registry.register(Box::new(rank_utilization.clone()))?;

        let migration_duration_ms = Histogram::with_opts(
            HistogramOpts::new("migration_duration_ms", "Shard migration wall time in milliseconds")
                .buckets(prometheus::exponential_buckets(0.5, 2.0, 14)?),
        )?;
        registry.register(Box::new(migration_duration_ms.clone()))?;

        Ok(Self {
            pool_free_blocks: gauge(&registry, "pool_free_blocks", "Blocks on the free list")?,
            pool_cached_blocks: gauge(&registry, "pool_cached_blocks", "Unreferenced blocks kept for prefix reuse")?,
            pool_cache_hits: gauge(&registry, "pool_cache_hits", "Prefix cache hits since startup")?,
            pool_cache_misses: gauge(&registry, "pool_cache_misses", "Prefix cache misses since startup")?,
            pool_evictions: gauge(&registry, "pool_evictions", "Cached blocks evicted since startup")?,
            pool_usage,
            contexts: gauge(&registry, "contexts", "Sharded contexts")?,
            shards: gauge(&registry, "shards", "Shards across all contexts")?,
            dead_ranks: gauge(&registry, "dead_ranks", "Ranks marked dead")?,
            rank_utilization,
            migrations: counter(&registry, "migrations_total", "Completed shard migrations")?,
            migration_failures: counter(&registry, "migration_failures_total", "Failed rebalance migrations")?,
            migration_duration_ms,
            shards_scaled: counter(&registry, "shards_scaled_total", "Precision downgrades under pressure")?,
            shards_evicted: counter(&registry, "shards_evicted_total", "Shards evicted as cold")?,
            shards_pinned: counter(&registry, "shards_pinned_total", "Shards pinned to warm precision")?,
            prefetch_allocations: counter(&registry, "prefetch_allocations_total", "Queued allocations drained")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn update_pool(&self, stats: &PoolStats) {
        self.pool_free_blocks.set(stats.free_blocks as i64);
        self.pool_cached_blocks.set(stats.cached_blocks as i64);
        self.pool_cache_hits.set(stats.cache_hits as i64);
        self.pool_cache_misses.set(stats.cache_misses as i64);
        self.pool_evictions.set(stats.total_evictions as i64);
        self.pool_usage.set(stats.usage_fraction());
    }

    pub fn update_shards(&self, shards: &ContextShardManager) {
        self.contexts.set(shards.num_contexts() as i64);
        self.shards.set(shards.num_shards() as i64);
        self.dead_ranks.set(shards.dead_ranks().len() as i64);
    }

    pub fn update_cluster(&self, snapshot: &ClusterSnapshot) {
        for (rank, utilization) in &snapshot.rank_utilization {
            self.rank_utilization
                .with_label_values(&[rank.to_string().as_str()])
                .set(*utilization);
        }
    }

    pub fn observe_cycle(&self, report: &CycleReport) {
        match report {
            CycleReport::Compression(r) => {
                self.shards_scaled.inc_by(r.scaled as u64);
                self.shards_evicted.inc_by(r.evicted as u64);
                self.shards_pinned.inc_by(r.pinned as u64);
            }
            CycleReport::Balance { outcome } => match outcome {
                BalanceOutcome::Migrated(record) => {
                    self.migrations.inc();
                    self.migration_duration_ms.observe(record.duration_ms);
                }
                BalanceOutcome::Failed(_) => self.migration_failures.inc(),
                BalanceOutcome::Idle(_) => {}
            },
            CycleReport::PrefetchDrain(r) => self.prefetch_allocations.inc_by(r.allocated as u64),
        }
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
