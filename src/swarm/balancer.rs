//! Swarm load balancer: moves one shard per cycle from the hottest rank
//! to the coolest one.
//!
//! Decision per cycle:
//! 1. Read a telemetry snapshot and append it to the per-rank history
//! 2. Hot rank: the live rank with the highest utilization above `hot_threshold`
//! 3. Cool rank: the live rank with the lowest utilization below
//!    `cool_threshold`, skipping ranks whose load is trending up unless
//!    every candidate is
//! 4. Migrate the least recently accessed shard owned by the hot rank
//!
//! A failed migration is reported and simply retried on a later cycle.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BalancerConfig;
use crate::swarm::migration::{MigrationOutcome, MigrationRecord, P2PMigrationEngine};
use crate::swarm::shard::RankId;
use crate::swarm::telemetry::{LoadHistory, TelemetrySource, Trend};

/// Why a cycle did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleReason {
    NoHotRank,
    NoCoolRank,
    NoShardOnHotRank,
    AlreadyOnTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum BalanceOutcome {
    Idle(IdleReason),
    Migrated(MigrationRecord),
    Failed(String),
}

pub struct SwarmLoadBalancer {
    telemetry: Arc<dyn TelemetrySource>,
    engine: Arc<P2PMigrationEngine>,
    hot_threshold: f64,
    cool_threshold: f64,
    history: Mutex<LoadHistory>,
}

/// Higher utilization first; lower rank id breaks ties.
fn by_load(a: &(RankId, f64), b: &(RankId, f64)) -> Ordering {
    a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0))
}

impl SwarmLoadBalancer {
    pub fn new(telemetry: Arc<dyn TelemetrySource>, engine: Arc<P2PMigrationEngine>, config: &BalancerConfig) -> Self {
        Self {
            telemetry,
            engine,
            hot_threshold: config.hot_threshold,
            cool_threshold: config.cool_threshold,
            history: Mutex::new(LoadHistory::new(config.trend_window)),
        }
    }

    pub fn engine(&self) -> &Arc<P2PMigrationEngine> {
        &self.engine
    }

    /// Current utilization trend of `rank`.
    pub fn trend(&self, rank: RankId) -> Trend {
        self.history.lock().trend(rank)
    }

    pub async fn run_cycle(&self) -> BalanceOutcome {
        let snapshot = self.telemetry.snapshot();
        let shards = self.engine.shard_manager();

        let (hot, cool) = {
            let mut history = self.history.lock();
            history.record(&snapshot);

            let live: Vec<(RankId, f64)> = snapshot
                .rank_utilization
                .iter()
                .filter(|(rank, _)| shards.is_rank_alive(**rank))
                .map(|(&rank, &u)| (rank, u))
                .collect();

            let Some(hot) = live
                .iter()
                .filter(|(_, u)| *u > self.hot_threshold)
                .max_by(|a, b| by_load(a, b))
                .map(|(rank, _)| *rank)
            else {
                return BalanceOutcome::Idle(IdleReason::NoHotRank);
            };

            let candidates: Vec<(RankId, f64)> = live
                .iter()
                .copied()
                .filter(|(rank, u)| *rank != hot && *u < self.cool_threshold)
                .collect();
            let steady: Vec<(RankId, f64)> = candidates
                .iter()
                .copied()
                .filter(|(rank, _)| history.trend(*rank) != Trend::Rising)
                .collect();
            let pool = if steady.is_empty() { &candidates } else { &steady };

            let Some(cool) = pool
                .iter()
                .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
                .map(|(rank, _)| *rank)
            else {
                debug!(hot, "No cool rank available");
                return BalanceOutcome::Idle(IdleReason::NoCoolRank);
            };
            (hot, cool)
        };

        let Some(victim) = shards
            .shards_on_rank(hot)
            .into_iter()
            .min_by(|a, b| {
                a.last_access
                    .cmp(&b.last_access)
                    .then_with(|| a.context_id.cmp(&b.context_id))
                    .then_with(|| a.index.cmp(&b.index))
            })
        else {
            return BalanceOutcome::Idle(IdleReason::NoShardOnHotRank);
        };

        info!(
            hot,
            cool,
            context_id = %victim.context_id,
            shard = victim.index,
            "Rebalancing shard"
        );
        match self.engine.migrate_shard(&victim.context_id, victim.index, cool).await {
            Ok(MigrationOutcome::Migrated(record)) => BalanceOutcome::Migrated(record),
            Ok(MigrationOutcome::AlreadyOnTarget) => BalanceOutcome::Idle(IdleReason::AlreadyOnTarget),
            Err(e) => {
                warn!(hot, cool, error = %e, "Rebalance failed, will retry next cycle");
                BalanceOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::config::{MigrationConfig, ShardingConfig};
    use crate::swarm::manager::ContextShardManager;
    use crate::swarm::shard::ShardUpdate;
    use crate::swarm::telemetry::StaticTelemetry;
    use crate::swarm::transport::{PlaintextSealer, SimulatedTransport};

    fn setup(utilization: &[(RankId, f64)]) -> (Arc<StaticTelemetry>, SwarmLoadBalancer) {
        let shards = Arc::new(ContextShardManager::new(&ShardingConfig {
            shard_size: 100,
            redundancy: 1,
            ..Default::default()
        }));
        shards.shard_context("ctx", 400, &[0, 1, 2, 3], "t", 0).unwrap();
        let engine = Arc::new(P2PMigrationEngine::new(
            shards,
            Arc::new(SimulatedTransport::new(Duration::ZERO)),
            Arc::new(PlaintextSealer),
            &MigrationConfig::default(),
        ));
        let telemetry = Arc::new(StaticTelemetry::default());
        for &(rank, u) in utilization {
            telemetry.set_utilization(rank, u);
        }
        let balancer = SwarmLoadBalancer::new(telemetry.clone(), engine, &BalancerConfig::default());
        (telemetry, balancer)
    }

    #[tokio::test]
    async fn test_stable_cluster_is_idle() {
        let (_, b) = setup(&[(0, 0.6), (1, 0.7), (2, 0.55), (3, 0.8)]);
        for _ in 0..5 {
            assert_eq!(b.run_cycle().await, BalanceOutcome::Idle(IdleReason::NoHotRank));
        }
        assert!(b.engine().history().is_empty());
    }

    #[tokio::test]
    async fn test_moves_from_hot_to_cool() {
        let (_, b) = setup(&[(0, 0.95), (1, 0.3), (2, 0.1), (3, 0.6)]);
        let BalanceOutcome::Migrated(record) = b.run_cycle().await else {
            panic!("expected a migration");
        };
        assert_eq!(record.source_rank, 0);
        assert_eq!(record.target_rank, 2);
        assert_eq!(b.engine().shard_manager().shard("ctx", 0).unwrap().rank_id, 2);
    }

    #[tokio::test]
    async fn test_no_cool_rank() {
        let (_, b) = setup(&[(0, 0.95), (1, 0.7)]);
        assert_eq!(b.run_cycle().await, BalanceOutcome::Idle(IdleReason::NoCoolRank));
    }

    #[tokio::test]
    async fn test_dead_ranks_are_ignored() {
        let (_, b) = setup(&[(0, 0.95), (1, 0.3), (2, 0.1)]);
        b.engine().shard_manager().mark_rank_dead(2);
        let BalanceOutcome::Migrated(record) = b.run_cycle().await else {
            panic!("expected a migration");
        };
        assert_eq!(record.target_rank, 1);

        b.engine().shard_manager().mark_rank_dead(0);
        assert_eq!(b.run_cycle().await, BalanceOutcome::Idle(IdleReason::NoHotRank));
    }

    #[tokio::test]
    async fn test_rising_cool_rank_is_skipped() {
        let (telemetry, b) = setup(&[(0, 0.95), (1, 0.2), (2, 0.3)]);
        b.engine().shard_manager().mark_rank_dead(0);
        for step in 0..6 {
            telemetry.set_utilization(1, 0.05 + step as f64 * 0.05);
            b.run_cycle().await;
        }
        assert_eq!(b.trend(1), Trend::Rising);
        b.engine().shard_manager().mark_rank_alive(0);

        // Rank 1 is coolest but climbing; rank 2 is flat.
        telemetry.set_utilization(1, 0.2);
        let BalanceOutcome::Migrated(record) = b.run_cycle().await else {
            panic!("expected a migration");
        };
        assert_eq!(record.target_rank, 2);
    }

    #[tokio::test]
    async fn test_least_recently_used_shard_moves_first() {
        let (_, b) = setup(&[(0, 0.95), (1, 0.1)]);
        let mgr = b.engine().shard_manager().clone();
        mgr.shard_context("ctx", 800, &[0, 1, 2, 3], "t", 0).unwrap();
        // Rank 0 owns shards 0 and 4; shard 0 is the recently used one.
        mgr.update_shard("ctx", 0, ShardUpdate::Touch(Instant::now() + Duration::from_secs(5)))
            .unwrap();
        let BalanceOutcome::Migrated(record) = b.run_cycle().await else {
            panic!("expected a migration");
        };
        assert_eq!(record.shard_index, 4);
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let shards = Arc::new(ContextShardManager::new(&ShardingConfig::default()));
        shards.shard_context("ctx", 100, &[0], "t", 0).unwrap();
        let transport = Arc::new(SimulatedTransport::new(Duration::ZERO));
        transport.set_unreachable(1, true);
        let engine = Arc::new(P2PMigrationEngine::new(
            shards,
            transport,
            Arc::new(PlaintextSealer),
            &MigrationConfig::default(),
        ));
        let telemetry = Arc::new(StaticTelemetry::default());
        telemetry.set_utilization(0, 0.9);
        telemetry.set_utilization(1, 0.1);
        let b = SwarmLoadBalancer::new(telemetry, engine, &BalancerConfig::default());
        assert!(matches!(b.run_cycle().await, BalanceOutcome::Failed(_)));
        assert_eq!(b.engine().shard_manager().shard("ctx", 0).unwrap().rank_id, 0);
    }
}
