//! Context shard manager: partitions long contexts across ranks and routes
//! token lookups to a live owner.
//!
//! The manager is the shard registry every other swarm component works
//! against. It:
//! - Splits contexts into fixed-size shards with overlap buffers
//! - Assigns owners and replicas round-robin
//! - Enforces tenant isolation on every lookup
//! - Tracks rank liveness and fails lookups over to replicas

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ShardingConfig;
use crate::swarm::shard::{ContextShard, PrecisionLevel, RankId, ShardDescriptor, ShardUpdate};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("No ranks available to host shards")]
    NoAvailableRanks,

    #[error("Context {0} not found")]
    ContextNotFound(String),

    #[error("Shard index {index} out of range for context {context_id} ({len} shards)")]
    ShardIndexOutOfRange {
        context_id: String,
        index: usize,
        len: usize,
    },

    #[error("Context {0} belongs to another tenant")]
    TenantMismatch(String),
}

/// Where a token lookup resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "rank", rename_all = "snake_case")]
pub enum RankRoute {
    /// The owning rank is alive.
    Primary(RankId),
    /// The owner is dead; this is the first live replica.
    Replica(RankId),
    /// Unknown context, token outside every shard, or tenant mismatch.
    NotFound,
    /// Owner and every replica are dead.
    Unavailable,
}

impl RankRoute {
    /// The rank to contact, if any.
    pub fn rank(&self) -> Option<RankId> {
        match *self {
            RankRoute::Primary(rank) | RankRoute::Replica(rank) => Some(rank),
            RankRoute::NotFound | RankRoute::Unavailable => None,
        }
    }
}

/// All shards of one context.
#[derive(Debug, Clone)]
pub struct ShardSet {
    pub tenant_id: String,
    pub total_tokens: usize,
    pub shards: Vec<ContextShard>,
}

impl ShardSet {
    /// Index of the first shard containing `token`.
    pub fn shard_index_for_token(&self, token: usize) -> Option<usize> {
        self.shards.iter().position(|s| s.contains_token(token))
    }

    pub fn shard_mut(&mut self, context_id: &str, index: usize) -> Result<&mut ContextShard, ShardError> {
        let len = self.shards.len();
        self.shards
            .get_mut(index)
            .ok_or_else(|| ShardError::ShardIndexOutOfRange {
                context_id: context_id.to_string(),
                index,
                len,
            })
    }
}

/// Per-context lock. Operations on different contexts never contend.
pub type SharedShardSet = Arc<Mutex<ShardSet>>;

/// A shard's position in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLocation {
    pub context_id: String,
    pub index: usize,
    pub last_access: Instant,
}

pub struct ContextShardManager {
    /// Tokens per shard.
    shard_size: usize,

    /// Copies per shard, owner included.
    redundancy: usize,

    contexts: RwLock<HashMap<String, SharedShardSet>>,

    dead_ranks: RwLock<HashSet<RankId>>,
}

impl ContextShardManager {
    pub fn new(config: &ShardingConfig) -> Self {
        Self {
            shard_size: config.shard_size.max(1),
            redundancy: config.redundancy.max(1),
            contexts: RwLock::new(HashMap::new()),
            dead_ranks: RwLock::new(HashSet::new()),
        }
    }

    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    /// Split `total_tokens` of `context_id` into shards over `ranks`.
    ///
    /// Shard `i` nominally covers `[i*S, min((i+1)*S, total))`; every shard
    /// after the first starts `overlap` tokens earlier (never below 0).
    /// Re-sharding an existing context replaces it.
    pub fn shard_context(
        &self,
        context_id: &str,
        total_tokens: usize,
        ranks: &[RankId],
        tenant_id: &str,
        overlap: usize,
    ) -> Result<Vec<ShardDescriptor>, ShardError> {
        if ranks.is_empty() {
            return Err(ShardError::NoAvailableRanks);
        }

        let num_shards = total_tokens.div_ceil(self.shard_size);
        let num_replicas = (self.redundancy - 1).min(ranks.len() - 1);
        let now = Instant::now();

        let shards: Vec<ContextShard> = (0..num_shards)
            .map(|i| {
                let nominal_start = i * self.shard_size;
                let end_token = (nominal_start + self.shard_size).min(total_tokens);
                let start_token = if i == 0 {
                    0
                } else {
                    nominal_start.saturating_sub(overlap)
                };
                let owner_slot = i % ranks.len();
                let replica_ranks = (1..=num_replicas)
                    .map(|k| ranks[(owner_slot + k) % ranks.len()])
                    .collect();

                ContextShard {
                    shard_id: Uuid::new_v4(),
                    index: i,
                    tenant_id: tenant_id.to_string(),
                    start_token,
                    end_token,
                    rank_id: ranks[owner_slot],
                    replica_ranks,
                    overlap_size: nominal_start - start_token,
                    is_cached: true,
                    precision: PrecisionLevel::Full,
                    last_access: now,
                }
            })
            .collect();

        let descriptors = shards.iter().map(ContextShard::descriptor).collect();
        let set = ShardSet {
            tenant_id: tenant_id.to_string(),
            total_tokens,
            shards,
        };

        let replaced = self
            .contexts
            .write()
            .insert(context_id.to_string(), Arc::new(Mutex::new(set)))
            .is_some();
        if replaced {
            warn!(context_id, "Re-sharded existing context");
        }

        info!(
            context_id,
            tenant_id,
            total_tokens,
            shards = num_shards,
            replicas = num_replicas,
            overlap,
            "Context sharded"
        );
        Ok(descriptors)
    }

    /// Route `token` of `context_id` to a live rank.
    ///
    /// A tenant mismatch is indistinguishable from an unknown context to
    /// the caller.
    pub fn get_rank_for_token(&self, context_id: &str, token: usize, tenant_id: &str) -> RankRoute {
        let Some(set) = self.context(context_id) else {
            return RankRoute::NotFound;
        };
        let set = set.lock();
        if set.tenant_id != tenant_id {
            warn!(context_id, tenant_id, "Tenant mismatch on shard lookup");
            return RankRoute::NotFound;
        }
        let Some(index) = set.shard_index_for_token(token) else {
            return RankRoute::NotFound;
        };
        let shard = &set.shards[index];

        let dead = self.dead_ranks.read();
        if !dead.contains(&shard.rank_id) {
            return RankRoute::Primary(shard.rank_id);
        }
        match shard.replica_ranks.iter().find(|r| !dead.contains(*r)) {
            Some(&replica) => {
                info!(
                    context_id,
                    shard = index,
                    dead_rank = shard.rank_id,
                    replica,
                    "Failing over to replica"
                );
                RankRoute::Replica(replica)
            }
            None => {
                error!(
                    context_id,
                    shard = index,
                    rank = shard.rank_id,
                    replicas = ?shard.replica_ranks,
                    "All replicas dead, shard unavailable"
                );
                RankRoute::Unavailable
            }
        }
    }

    /// Stop routing to `rank`. Shards are kept.
    pub fn mark_rank_dead(&self, rank: RankId) -> bool {
        let inserted = self.dead_ranks.write().insert(rank);
        if inserted {
            warn!(rank, "Rank marked dead");
        }
        inserted
    }

    pub fn mark_rank_alive(&self, rank: RankId) -> bool {
        let removed = self.dead_ranks.write().remove(&rank);
        if removed {
            info!(rank, "Rank marked alive");
        }
        removed
    }

    pub fn is_rank_alive(&self, rank: RankId) -> bool {
        !self.dead_ranks.read().contains(&rank)
    }

    pub fn dead_ranks(&self) -> Vec<RankId> {
        let mut ranks: Vec<RankId> = self.dead_ranks.read().iter().copied().collect();
        ranks.sort_unstable();
        ranks
    }

    /// Remove all shard metadata for `context_id`.
    pub fn delete_context(&self, context_id: &str) -> bool {
        let removed = self.contexts.write().remove(context_id).is_some();
        if removed {
            info!(context_id, "Context deleted");
        }
        removed
    }

    /// Lock handle for one context.
    pub fn context(&self, context_id: &str) -> Option<SharedShardSet> {
        self.contexts.read().get(context_id).cloned()
    }

    /// Snapshot of every context handle.
    pub fn contexts(&self) -> Vec<(String, SharedShardSet)> {
        self.contexts
            .read()
            .iter()
            .map(|(id, set)| (id.clone(), set.clone()))
            .collect()
    }

    pub fn context_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.contexts.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Copy of the shards of `context_id`.
    pub fn shards(&self, context_id: &str) -> Option<Vec<ContextShard>> {
        self.context(context_id).map(|set| set.lock().shards.clone())
    }

    /// Shards of `context_id` as seen by `tenant_id`.
    pub fn shards_for_tenant(&self, context_id: &str, tenant_id: &str) -> Result<Vec<ShardDescriptor>, ShardError> {
        let set = self
            .context(context_id)
            .ok_or_else(|| ShardError::ContextNotFound(context_id.to_string()))?;
        let set = set.lock();
        if set.tenant_id != tenant_id {
            warn!(context_id, tenant_id, "Tenant mismatch on shard listing");
            return Err(ShardError::TenantMismatch(context_id.to_string()));
        }
        Ok(set.shards.iter().map(ContextShard::descriptor).collect())
    }

    /// Copy of one shard.
    pub fn shard(&self, context_id: &str, index: usize) -> Result<ContextShard, ShardError> {
        let set = self
            .context(context_id)
            .ok_or_else(|| ShardError::ContextNotFound(context_id.to_string()))?;
        let mut set = set.lock();
        Ok(set.shard_mut(context_id, index)?.clone())
    }

    /// Apply `update` to one shard. Returns whether it changed.
    pub fn update_shard(&self, context_id: &str, index: usize, update: ShardUpdate) -> Result<bool, ShardError> {
        let set = self
            .context(context_id)
            .ok_or_else(|| ShardError::ContextNotFound(context_id.to_string()))?;
        let mut set = set.lock();
        Ok(set.shard_mut(context_id, index)?.apply(update))
    }

    /// Every shard currently owned by `rank`.
    pub fn shards_on_rank(&self, rank: RankId) -> Vec<ShardLocation> {
        let mut found = Vec::new();
        for (context_id, set) in self.contexts() {
            let set = set.lock();
            found.extend(
                set.shards
                    .iter()
                    .filter(|s| s.rank_id == rank)
                    .map(|s| ShardLocation {
                        context_id: context_id.clone(),
                        index: s.index,
                        last_access: s.last_access,
                    }),
            );
        }
        found
    }

    /// Owned shard count per rank.
    pub fn rank_shard_counts(&self) -> BTreeMap<RankId, usize> {
        let mut counts = BTreeMap::new();
        for (_, set) in self.contexts() {
            for shard in &set.lock().shards {
                *counts.entry(shard.rank_id).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn num_contexts(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn num_shards(&self) -> usize {
        self.contexts()
            .iter()
            .map(|(_, set)| set.lock().shards.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(shard_size: usize, redundancy: usize) -> ContextShardManager {
        ContextShardManager::new(&ShardingConfig {
            shard_size,
            redundancy,
            ..Default::default()
        })
    }

    #[test]
    fn test_shard_offsets_with_overlap() {
        let mgr = manager(100, 1);
        let shards = mgr.shard_context("ctx", 250, &[0, 1, 2], "t", 20).unwrap();
        assert_eq!(shards.len(), 3);

        assert_eq!((shards[0].start_token, shards[0].end_token), (0, 100));
        assert_eq!(shards[0].overlap_size, 0);
        assert_eq!((shards[1].start_token, shards[1].end_token), (80, 200));
        assert_eq!(shards[1].overlap_size, 20);
        assert_eq!((shards[2].start_token, shards[2].end_token), (180, 250));
        assert_eq!(
            shards.iter().map(|s| s.rank_id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_overlap_clamped_at_zero() {
        let mgr = manager(10, 1);
        let shards = mgr.shard_context("ctx", 25, &[0], "t", 50).unwrap();
        assert_eq!(shards[1].start_token, 0);
        assert_eq!(shards[1].overlap_size, 10);
    }

    #[test]
    fn test_no_ranks() {
        let mgr = manager(100, 1);
        assert_eq!(
            mgr.shard_context("ctx", 10, &[], "t", 0).unwrap_err(),
            ShardError::NoAvailableRanks
        );
        assert_eq!(mgr.num_contexts(), 0);
    }

    #[test]
    fn test_replicas_round_robin() {
        let mgr = manager(10, 3);
        let shards = mgr.shard_context("ctx", 30, &[4, 5, 6, 7], "t", 0).unwrap();
        assert_eq!(shards[0].replica_ranks, vec![5, 6]);
        assert_eq!(shards[2].replica_ranks, vec![7, 4]);

        // Redundancy is capped by the number of other ranks.
        let shards = mgr.shard_context("small", 10, &[1, 2], "t", 0).unwrap();
        assert_eq!(shards[0].replica_ranks, vec![2]);
    }

    #[test]
    fn test_update_and_out_of_range() {
        let mgr = manager(10, 1);
        mgr.shard_context("ctx", 20, &[0, 1], "t", 0).unwrap();
        assert!(mgr.update_shard("ctx", 0, ShardUpdate::Cached(false)).unwrap());
        assert!(!mgr.shard("ctx", 0).unwrap().is_cached);
        assert!(matches!(
            mgr.update_shard("ctx", 9, ShardUpdate::Cached(false)),
            Err(ShardError::ShardIndexOutOfRange { index: 9, len: 2, .. })
        ));
    }

    #[test]
    fn test_rank_accounting() {
        let mgr = manager(10, 1);
        mgr.shard_context("a", 30, &[0, 1], "t", 0).unwrap();
        mgr.shard_context("b", 10, &[1], "t", 0).unwrap();
        let counts = mgr.rank_shard_counts();
        assert_eq!(counts.get(&0), Some(&2));
        assert_eq!(counts.get(&1), Some(&2));
        assert_eq!(mgr.shards_on_rank(1).len(), 2);
        assert_eq!(mgr.num_shards(), 4);
    }
}
