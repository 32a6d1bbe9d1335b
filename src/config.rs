//! Runtime configuration for kv-swarm.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Pool sizing, cache groups, sharding, compression, prefetch, balancing and
//! migration knobs all live here.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::evictor::EvictionPolicy;
use crate::cache::manager::{AttentionTopology, CacheGroupSpec};
use crate::cache::pool::MAX_POOL_BLOCKS;
use crate::swarm::shard::{PrecisionLevel, RankId};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-swarm", about = "KV-cache pool and context-sharding node")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address for the admin API. Overrides the config file.
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin server configuration.
    pub server: ServerConfig,

    /// Block pool sizing and caching.
    pub pool: PoolConfig,

    /// Cache groups served by the coordinator. Empty means one full-attention
    /// group using the pool block size.
    pub groups: Vec<CacheGroupSpec>,

    /// Allocation strategy and advanced coordinator settings.
    pub allocation: AllocationConfig,

    /// Context sharding across ranks.
    pub sharding: ShardingConfig,

    /// Shard precision/eviction policy.
    pub compression: CompressionConfig,

    /// Sequential-access prefetching.
    pub prefetch: PrefetchConfig,

    /// Load balancing between ranks.
    pub balancer: BalancerConfig,

    /// Peer-to-peer shard migration.
    pub migration: MigrationConfig,
}

/// HTTP admin server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8090").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8090".to_string(),
        }
    }
}

/// Block pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of usable blocks (the null block is extra).
    pub num_blocks: usize,

    /// Tokens per block.
    pub block_size: usize,

    /// Keep freed, hashed blocks around for prefix reuse.
    pub enable_prefix_caching: bool,

    /// Which cached block to reuse when the free list is empty.
    pub eviction_policy: EvictionPolicy,

    /// Usage fraction above which the pool reports itself stressed.
    pub stress_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_blocks: 4096,
            block_size: 16,
            enable_prefix_caching: true,
            eviction_policy: EvictionPolicy::Lru,
            stress_threshold: 0.9,
        }
    }
}

/// How requests are sized when allocated through the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Allocate exactly what the request holds now.
    #[default]
    Exact,
    /// Allocate for the predicted final length up front.
    Predictive,
}

/// Allocation strategy and advanced coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub strategy: AllocationStrategy,

    /// Completion-length history cap before trimming.
    pub history_capacity: usize,

    /// History length kept after a trim.
    pub history_trim_to: usize,

    /// Seed value for the prompt-length moving average.
    pub initial_average_length: f64,

    /// Upper bound on any predicted length.
    pub max_predicted_tokens: usize,

    /// Maximum queued prefetch allocations.
    pub prefetch_queue_capacity: usize,

    /// Period of the prefetch-queue drain task in milliseconds.
    pub drain_interval_ms: u64,

    /// Queued allocations attempted per drain cycle.
    pub drain_batch: usize,

    /// Model layers accepted by layer-scoped allocations.
    pub num_layers: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategy::Exact,
            history_capacity: 1000,
            history_trim_to: 500,
            initial_average_length: 512.0,
            max_predicted_tokens: 32768,
            prefetch_queue_capacity: 256,
            drain_interval_ms: 500,
            drain_batch: 16,
            num_layers: 32,
        }
    }
}

/// Context sharding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Tokens per shard.
    pub shard_size: usize,

    /// Copies of each shard (owner included). 1 disables replicas.
    pub redundancy: usize,

    /// Overlap applied when a caller does not pass one.
    pub default_overlap: usize,

    /// Ranks in the cluster.
    pub ranks: Vec<RankId>,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_size: 4096,
            redundancy: 2,
            default_overlap: 128,
            ranks: vec![0, 1, 2, 3],
        }
    }
}

/// Shard precision and eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Idle seconds after which a shard is evicted.
    pub cold_threshold_secs: u64,

    /// Idle seconds after which a shard is pinned to `warm_precision`.
    pub warm_threshold_secs: u64,

    /// Precision for shards idle between the warm and cold thresholds.
    pub warm_precision: PrecisionLevel,

    /// Seconds between compression cycles.
    pub cycle_interval_secs: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            cold_threshold_secs: 60,
            warm_threshold_secs: 10,
            warm_precision: PrecisionLevel::Half,
            cycle_interval_secs: 5,
        }
    }
}

impl CompressionConfig {
    pub fn cold_threshold(&self) -> Duration {
        Duration::from_secs(self.cold_threshold_secs)
    }

    pub fn warm_threshold(&self) -> Duration {
        Duration::from_secs(self.warm_threshold_secs)
    }
}

/// Prefetch strategy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Number of shards to warm ahead of a sequential access.
    pub lookahead: usize,

    /// Accessed token indices remembered per context.
    pub history_len: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            lookahead: 2,
            history_len: 10,
        }
    }
}

/// Load balancer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Ranks above this utilization shed a shard.
    pub hot_threshold: f64,

    /// Ranks below this utilization may receive a shard.
    pub cool_threshold: f64,

    /// Seconds between balancing cycles.
    pub interval_secs: u64,

    /// Shards a rank holds at full utilization (for derived telemetry).
    pub rank_capacity: usize,

    /// Utilization samples kept per rank for trend detection.
    pub trend_window: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            hot_threshold: 0.85,
            cool_threshold: 0.5,
            interval_secs: 10,
            rank_capacity: 64,
            trend_window: 16,
        }
    }
}

/// Peer-to-peer migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Per-transfer timeout in milliseconds.
    pub timeout_ms: u64,

    /// Latency of the simulated transport in milliseconds.
    pub simulated_latency_ms: u64,

    /// zstd level for shard payloads (1-22).
    pub zstd_level: i32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            simulated_latency_ms: 5,
            zstd_level: 3,
        }
    }
}

impl MigrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the components cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pool.block_size == 0 {
            bail!("pool.block_size must be > 0");
        }
        if self.pool.num_blocks == 0 {
            bail!("pool.num_blocks must be > 0");
        }
        if self.pool.num_blocks > MAX_POOL_BLOCKS as usize {
            bail!("pool.num_blocks must not exceed {MAX_POOL_BLOCKS}");
        }
        if !(0.0..=1.0).contains(&self.pool.stress_threshold) {
            bail!("pool.stress_threshold must be within [0, 1]");
        }
        if self.sharding.shard_size == 0 {
            bail!("sharding.shard_size must be > 0");
        }
        if self.sharding.redundancy == 0 {
            bail!("sharding.redundancy must be >= 1");
        }
        if self.compression.warm_threshold_secs > self.compression.cold_threshold_secs {
            bail!("compression.warm_threshold_secs must not exceed cold_threshold_secs");
        }
        if self.balancer.cool_threshold >= self.balancer.hot_threshold {
            bail!("balancer.cool_threshold must be below hot_threshold");
        }
        if self.allocation.num_layers == 0 {
            bail!("allocation.num_layers must be > 0");
        }
        if self.allocation.drain_interval_ms == 0 {
            bail!("allocation.drain_interval_ms must be > 0");
        }
        if self.compression.cycle_interval_secs == 0 || self.balancer.interval_secs == 0 {
            bail!("compression and balancer intervals must be > 0");
        }
        if self.allocation.history_trim_to > self.allocation.history_capacity {
            bail!("allocation.history_trim_to must not exceed history_capacity");
        }
        Ok(())
    }

    /// Cache groups to serve, defaulting to a single full-attention group.
    pub fn cache_groups(&self) -> Vec<CacheGroupSpec> {
        if self.groups.is_empty() {
            vec![CacheGroupSpec {
                group_id: 0,
                topology: AttentionTopology::Full,
                block_size: self.pool.block_size,
                num_heads: 8,
                head_dim: 128,
            }]
        } else {
            self.groups.clone()
        }
    }
}
