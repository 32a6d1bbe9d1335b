//! Cluster telemetry consumed by the load balancer.
//!
//! - [`TelemetrySource`]: point-in-time per-rank utilization and VRAM pressure
//! - [`StaticTelemetry`]: settable source for tests and operator overrides
//! - [`ShardLoadTelemetry`]: derived from shard ownership and pool usage
//! - [`LoadHistory`] + [`mann_kendall`]: utilization trend per rank

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::pool::SharedBlockPool;
use crate::swarm::manager::ContextShardManager;
use crate::swarm::shard::RankId;

/// z-score for a two-sided test at the 5% level.
const MK_CRITICAL_Z: f64 = 1.96;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterSnapshot {
    /// Utilization in [0, 1] per rank.
    pub rank_utilization: BTreeMap<RankId, f64>,
    /// Local VRAM pressure in [0, 1].
    pub vram_pressure: f64,
}

pub trait TelemetrySource: Send + Sync {
    fn snapshot(&self) -> ClusterSnapshot;
}

/// Telemetry that reports whatever was last set.
#[derive(Default)]
pub struct StaticTelemetry {
    inner: RwLock<ClusterSnapshot>,
}

impl StaticTelemetry {
    pub fn new(snapshot: ClusterSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: ClusterSnapshot) {
        *self.inner.write() = snapshot;
    }

    pub fn set_utilization(&self, rank: RankId, utilization: f64) {
        self.inner.write().rank_utilization.insert(rank, utilization.clamp(0.0, 1.0));
    }

    pub fn set_pressure(&self, pressure: f64) {
        self.inner.write().vram_pressure = pressure.clamp(0.0, 1.0);
    }
}

impl TelemetrySource for StaticTelemetry {
    fn snapshot(&self) -> ClusterSnapshot {
        self.inner.read().clone()
    }
}

/// Utilization = owned shards / `rank_capacity`; pressure = pool usage.
pub struct ShardLoadTelemetry {
    shards: Arc<ContextShardManager>,
    pool: SharedBlockPool,
    ranks: Vec<RankId>,
    rank_capacity: usize,
}

impl ShardLoadTelemetry {
    pub fn new(shards: Arc<ContextShardManager>, pool: SharedBlockPool, ranks: Vec<RankId>, rank_capacity: usize) -> Self {
        Self {
            shards,
            pool,
            ranks,
            rank_capacity: rank_capacity.max(1),
        }
    }
}

impl TelemetrySource for ShardLoadTelemetry {
    fn snapshot(&self) -> ClusterSnapshot {
        let counts = self.shards.rank_shard_counts();
        let mut rank_utilization: BTreeMap<RankId, f64> = self.ranks.iter().map(|&r| (r, 0.0)).collect();
        for (rank, count) in counts {
            rank_utilization.insert(rank, (count as f64 / self.rank_capacity as f64).min(1.0));
        }
        ClusterSnapshot {
            rank_utilization,
            vram_pressure: self.pool.lock().stats().usage_fraction(),
        }
    }
}

/// Direction of a monotonic trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

/// Mann-Kendall trend test over `series` (oldest first).
///
/// Ties are not variance-corrected. Fewer than 3 points is always `Stable`.
pub fn mann_kendall(series: &[f64]) -> Trend {
    let n = series.len();
    if n < 3 {
        return Trend::Stable;
    }

    let mut s: i64 = 0;
    for i in 0..n - 1 {
        for j in i + 1..n {
            let diff = series[j] - series[i];
            if diff > 0.0 {
                s += 1;
            } else if diff < 0.0 {
                s -= 1;
            }
        }
    }

    let nf = n as f64;
    let variance = nf * (nf - 1.0) * (2.0 * nf + 5.0) / 18.0;
    let z = match s {
        0 => 0.0,
        s if s > 0 => (s - 1) as f64 / variance.sqrt(),
        s => (s + 1) as f64 / variance.sqrt(),
    };

    if z > MK_CRITICAL_Z {
        Trend::Rising
    } else if z < -MK_CRITICAL_Z {
        Trend::Falling
    } else {
        Trend::Stable
    }
}

/// Bounded per-rank utilization history.
pub struct LoadHistory {
    window: usize,
    samples: HashMap<RankId, VecDeque<f64>>,
}

impl LoadHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: HashMap::new(),
        }
    }

    pub fn record(&mut self, snapshot: &ClusterSnapshot) {
        for (&rank, &utilization) in &snapshot.rank_utilization {
            let series = self.samples.entry(rank).or_default();
            series.push_back(utilization);
            while series.len() > self.window {
                series.pop_front();
            }
        }
    }

    pub fn trend(&self, rank: RankId) -> Trend {
        match self.samples.get(&rank) {
            Some(series) => mann_kendall(&series.iter().copied().collect::<Vec<_>>()),
            None => Trend::Stable,
        }
    }

    pub fn samples(&self, rank: RankId) -> usize {
        self.samples.get(&rank).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::pool::new_shared_pool;
    use crate::config::{PoolConfig, ShardingConfig};

    #[test]
    fn test_mann_kendall() {
        assert_eq!(mann_kendall(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]), Trend::Rising);
        assert_eq!(mann_kendall(&[0.9, 0.8, 0.7, 0.6, 0.5, 0.4]), Trend::Falling);
        assert_eq!(mann_kendall(&[0.5, 0.5, 0.5, 0.5, 0.5]), Trend::Stable);
        assert_eq!(mann_kendall(&[0.5, 0.1, 0.6, 0.2, 0.5, 0.1]), Trend::Stable);
        assert_eq!(mann_kendall(&[0.1, 0.9]), Trend::Stable);
    }

    #[test]
    fn test_history_window() {
        let mut history = LoadHistory::new(4);
        for i in 0..10 {
            let mut snapshot = ClusterSnapshot::default();
            snapshot.rank_utilization.insert(0, i as f64 / 10.0);
            history.record(&snapshot);
        }
        assert_eq!(history.samples(0), 4);
        assert_eq!(history.samples(7), 0);
        assert_eq!(history.trend(7), Trend::Stable);
    }

    #[test]
    fn test_static_telemetry_clamps() {
        let t = StaticTelemetry::default();
        t.set_utilization(1, 1.7);
        t.set_pressure(-0.2);
        let snap = t.snapshot();
        assert_eq!(snap.rank_utilization[&1], 1.0);
        assert_eq!(snap.vram_pressure, 0.0);
    }

    #[test]
    fn test_shard_load_telemetry() {
        let shards = Arc::new(ContextShardManager::new(&ShardingConfig {
            shard_size: 10,
            redundancy: 1,
            ..Default::default()
        }));
        shards.shard_context("a", 30, &[0, 1], "t", 0).unwrap();
        let pool = new_shared_pool(&PoolConfig {
            num_blocks: 10,
            ..Default::default()
        });
        let _held = pool.lock().allocate(5).unwrap();

        let t = ShardLoadTelemetry::new(shards, pool, vec![0, 1, 2], 4);
        let snap = t.snapshot();
        assert_eq!(snap.rank_utilization[&0], 0.5);
        assert_eq!(snap.rank_utilization[&1], 0.25);
        assert_eq!(snap.rank_utilization[&2], 0.0);
        assert!((snap.vram_pressure - 0.5).abs() < 1e-9);
    }
}
