//! Peer-to-peer shard migration.
//!
//! A migration snapshots the shard, ships its encoded descriptor to the
//! target rank, and only then commits the ownership change under the
//! context lock. The commit is a compare-and-swap on the source rank, so
//! a concurrent move of the same shard is detected instead of overwritten.
//! Dropping the future before the commit leaves the shard where it was.
//!
//! Payload pipeline: `serde_json` → `zstd` → [`Sealer`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::swarm::manager::{ContextShardManager, ShardError};
use crate::swarm::shard::{RankId, ShardDescriptor, ShardUpdate};
use crate::swarm::transport::{broadcast, PeerTransport, Sealer, TransportError};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("payload encoding failed: {0}")]
    Encode(String),

    #[error("target rank {0} is marked dead")]
    TargetUnavailable(RankId),

    #[error("shard {context_id}[{index}] moved from rank {expected} to {found} during migration")]
    Conflict {
        context_id: String,
        index: usize,
        expected: RankId,
        found: RankId,
    },
}

/// One completed migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationRecord {
    pub id: Uuid,
    pub context_id: String,
    pub shard_id: Uuid,
    pub shard_index: usize,
    pub source_rank: RankId,
    pub target_rank: RankId,
    pub duration_ms: f64,
    pub payload_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationStats {
    pub total_migrations: usize,
    pub mean_duration_ms: f64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    /// The shard was already owned by the target.
    AlreadyOnTarget,
    Migrated(MigrationRecord),
}

pub struct P2PMigrationEngine {
    shards: Arc<ContextShardManager>,
    transport: Arc<dyn PeerTransport>,
    sealer: Arc<dyn Sealer>,
    timeout: Duration,
    zstd_level: i32,
    history: Mutex<Vec<MigrationRecord>>,
}

impl P2PMigrationEngine {
    pub fn new(
        shards: Arc<ContextShardManager>,
        transport: Arc<dyn PeerTransport>,
        sealer: Arc<dyn Sealer>,
        config: &MigrationConfig,
    ) -> Self {
        Self {
            shards,
            transport,
            sealer,
            timeout: config.timeout(),
            zstd_level: config.zstd_level,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn shard_manager(&self) -> &Arc<ContextShardManager> {
        &self.shards
    }

    /// Serialize, compress and seal a shard descriptor.
    pub fn encode_payload(&self, descriptor: &ShardDescriptor) -> Result<Bytes, MigrationError> {
        let json = serde_json::to_vec(descriptor).map_err(|e| MigrationError::Encode(e.to_string()))?;
        let compressed =
            zstd::stream::encode_all(json.as_slice(), self.zstd_level).map_err(|e| MigrationError::Encode(e.to_string()))?;
        Ok(self.sealer.seal(Bytes::from(compressed)))
    }

    /// Inverse of [`encode_payload`](Self::encode_payload), as run on the receiving rank.
    pub fn decode_payload(&self, payload: Bytes) -> Result<ShardDescriptor, MigrationError> {
        let opened = self.sealer.open(payload);
        let json = zstd::stream::decode_all(opened.as_ref()).map_err(|e| MigrationError::Encode(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| MigrationError::Encode(e.to_string()))
    }

    /// Move shard `index` of `context_id` to `target`.
    pub async fn migrate_shard(
        &self,
        context_id: &str,
        index: usize,
        target: RankId,
    ) -> Result<MigrationOutcome, MigrationError> {
        let snapshot = self.shards.shard(context_id, index)?;
        let source = snapshot.rank_id;
        if source == target {
            return Ok(MigrationOutcome::AlreadyOnTarget);
        }
        if !self.shards.is_rank_alive(target) {
            return Err(MigrationError::TargetUnavailable(target));
        }

        let start = Instant::now();
        let payload = self.encode_payload(&snapshot.descriptor())?;
        let payload_bytes = payload.len();

        if let Err(e) = self.transport.send(target, payload, self.timeout).await {
            warn!(context_id, shard = index, source, target, error = %e, "Migration transfer failed");
            return Err(e.into());
        }

        let (replicas, committed) = {
            let set = self
                .shards
                .context(context_id)
                .ok_or_else(|| ShardError::ContextNotFound(context_id.to_string()))?;
            let mut set = set.lock();
            let shard = set.shard_mut(context_id, index)?;
            if shard.rank_id != source || shard.shard_id != snapshot.shard_id {
                return Err(MigrationError::Conflict {
                    context_id: context_id.to_string(),
                    index,
                    expected: source,
                    found: shard.rank_id,
                });
            }
            shard.apply(ShardUpdate::Rank(target));
            if let Some(slot) = shard.replica_ranks.iter_mut().find(|r| **r == target) {
                *slot = source;
            }
            (shard.replica_ranks.clone(), shard.descriptor())
        };

        let record = MigrationRecord {
            id: Uuid::new_v4(),
            context_id: context_id.to_string(),
            shard_id: snapshot.shard_id,
            shard_index: index,
            source_rank: source,
            target_rank: target,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            payload_bytes,
        };
        self.history.lock().push(record.clone());
        info!(
            context_id,
            shard = index,
            source,
            target,
            bytes = payload_bytes,
            duration_ms = record.duration_ms,
            "Shard migrated"
        );

        if !replicas.is_empty() {
            match serde_json::to_vec(&committed) {
                Ok(meta) => {
                    broadcast(self.transport.as_ref(), &replicas, Bytes::from(meta), self.timeout).await;
                }
                Err(e) => warn!(context_id, shard = index, error = %e, "Replica notification skipped"),
            }
        }

        Ok(MigrationOutcome::Migrated(record))
    }

    pub fn migration_stats(&self) -> MigrationStats {
        let history = self.history.lock();
        if history.is_empty() {
            return MigrationStats::default();
        }
        let total_ms: f64 = history.iter().map(|r| r.duration_ms).sum();
        MigrationStats {
            total_migrations: history.len(),
            mean_duration_ms: total_ms / history.len() as f64,
            total_bytes: history.iter().map(|r| r.payload_bytes as u64).sum(),
        }
    }

    /// Completed migrations, oldest first.
    pub fn history(&self) -> Vec<MigrationRecord> {
        self.history.lock().clone()
    }
}
