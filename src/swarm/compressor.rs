//! Adaptive shard compressor: manages shard "temperature".
//!
//! Two independent policies act on the shard population:
//! - Pressure: under VRAM pressure, force precision down (never up)
//! - Idle: evict cold shards, pin warm ones to a reduced precision
//!
//! Within one cycle the pressure policy runs first, then the idle policy.
//! [`AdaptiveSwarmCompressor::touch_shard`] is the only path back up to
//! full precision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::CompressionConfig;
use crate::swarm::manager::ContextShardManager;
use crate::swarm::shard::{PrecisionLevel, ShardUpdate};

/// What one cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompressionReport {
    /// Shards whose precision the pressure policy lowered.
    pub scaled: usize,
    /// Shards evicted by the idle policy.
    pub evicted: usize,
    /// Shards pinned to the warm precision by the idle policy.
    pub pinned: usize,
}

/// Precision ceiling for a VRAM pressure ratio, if any applies.
pub fn precision_for_pressure(pressure: f64) -> Option<PrecisionLevel> {
    if pressure > 0.9 {
        Some(PrecisionLevel::Eighth)
    } else if pressure > 0.7 {
        Some(PrecisionLevel::Quarter)
    } else if pressure > 0.5 {
        Some(PrecisionLevel::Half)
    } else {
        None
    }
}

pub struct AdaptiveSwarmCompressor {
    shards: Arc<ContextShardManager>,
    cold_threshold: Duration,
    warm_threshold: Duration,
    warm_precision: PrecisionLevel,
}

impl AdaptiveSwarmCompressor {
    pub fn new(shards: Arc<ContextShardManager>, config: &CompressionConfig) -> Self {
        Self {
            shards,
            cold_threshold: config.cold_threshold(),
            warm_threshold: config.warm_threshold(),
            warm_precision: config.warm_precision,
        }
    }

    pub fn shard_manager(&self) -> &Arc<ContextShardManager> {
        &self.shards
    }

    /// Lower every shard finer than the pressure band's ceiling to that
    /// ceiling. Returns how many shards actually changed.
    pub fn apply_pressure_policy(&self, pressure: f64) -> usize {
        let Some(ceiling) = precision_for_pressure(pressure) else {
            return 0;
        };

        let mut scaled = 0;
        for (_, set) in self.shards.contexts() {
            let mut set = set.lock();
            for shard in set.shards.iter_mut().filter(|s| s.precision < ceiling) {
                shard.apply(ShardUpdate::Precision(ceiling));
                scaled += 1;
            }
        }

        if scaled > 0 {
            info!(pressure, precision = %ceiling, scaled, "Pressure downgrade");
        }
        scaled
    }

    /// Evict shards idle past the cold threshold and pin shards idle past
    /// the warm threshold. Pinning only ever lowers precision.
    pub fn apply_idle_policy(&self, now: Instant) -> (usize, usize) {
        let mut evicted = 0;
        let mut pinned = 0;

        for (context_id, set) in self.shards.contexts() {
            let mut set = set.lock();
            for shard in set.shards.iter_mut() {
                let idle = now.saturating_duration_since(shard.last_access);
                if idle > self.cold_threshold {
                    if shard.apply(ShardUpdate::Cached(false)) {
                        evicted += 1;
                        debug!(context_id, shard = shard.index, idle_secs = idle.as_secs(), "Evicted cold shard");
                    }
                } else if idle >= self.warm_threshold && shard.precision < self.warm_precision {
                    shard.apply(ShardUpdate::Precision(self.warm_precision));
                    pinned += 1;
                }
            }
        }

        if evicted > 0 || pinned > 0 {
            info!(evicted, pinned, "Idle policy applied");
        }
        (evicted, pinned)
    }

    /// One optimisation cycle: pressure first, then idle.
    pub fn run_cycle(&self, pressure: f64, now: Instant) -> CompressionReport {
        let scaled = self.apply_pressure_policy(pressure);
        let (evicted, pinned) = self.apply_idle_policy(now);
        CompressionReport {
            scaled,
            evicted,
            pinned,
        }
    }

    /// Bring the shard holding `token_index` back to resident, full
    /// precision. Returns false if no shard holds the token.
    pub fn touch_shard(&self, context_id: &str, token_index: usize) -> bool {
        let Some(set) = self.shards.context(context_id) else {
            return false;
        };
        let mut set = set.lock();
        let Some(index) = set.shard_index_for_token(token_index) else {
            return false;
        };
        let shard = &mut set.shards[index];
        shard.apply(ShardUpdate::Cached(true));
        shard.apply(ShardUpdate::Precision(PrecisionLevel::Full));
        shard.apply(ShardUpdate::Touch(Instant::now()));
        true
    }
}
