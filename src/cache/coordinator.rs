//! KV cache coordinator: allocates and frees a request's blocks across
//! every configured cache group as one logical unit.

use std::collections::HashSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::block::{hash_request_tokens, BlockHash, BlockId, GroupId};
use crate::cache::manager::{CacheGroupSpec, QuantRecord, SingleTypeManager};
use crate::cache::pool::{PoolError, PoolStats, SharedBlockPool};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Unknown cache group {0}")]
    UnknownGroup(GroupId),

    #[error("Invalid cache group spec: {0}")]
    InvalidGroupSpec(String),

    #[error("Layer {layer} out of range ({num_layers} layers)")]
    LayerOutOfRange { layer: usize, num_layers: usize },
}

impl CoordinatorError {
    /// Whether this is pool exhaustion (retryable after frees/eviction).
    pub fn is_out_of_blocks(&self) -> bool {
        matches!(self, CoordinatorError::Pool(PoolError::OutOfBlocks { .. }))
    }
}

/// Coordinator-level statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub active_requests: usize,
    /// Blocks held per group, in group order.
    pub held_blocks: Vec<(GroupId, usize)>,
    pub pool: PoolStats,
}

/// Fans allocation across one manager per cache group.
pub struct KvCacheCoordinator {
    pool: SharedBlockPool,
    managers: Vec<SingleTypeManager>,
}

impl KvCacheCoordinator {
    /// Build a coordinator over `groups`. Group ids must be unique and
    /// every spec must validate.
    pub fn new(pool: SharedBlockPool, groups: Vec<CacheGroupSpec>) -> Result<Self, CoordinatorError> {
        if groups.is_empty() {
            return Err(CoordinatorError::InvalidGroupSpec(
                "at least one cache group is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for spec in &groups {
            spec.validate().map_err(CoordinatorError::InvalidGroupSpec)?;
            if !seen.insert(spec.group_id) {
                return Err(CoordinatorError::InvalidGroupSpec(format!(
                    "duplicate group id {}",
                    spec.group_id
                )));
            }
        }

        info!(
            groups = groups.len(),
            topologies = ?groups.iter().map(|g| g.topology.name()).collect::<Vec<_>>(),
            "KV cache coordinator ready"
        );

        Ok(Self {
            pool,
            managers: groups.into_iter().map(SingleTypeManager::new).collect(),
        })
    }

    pub fn pool(&self) -> &SharedBlockPool {
        &self.pool
    }

    pub fn group_specs(&self) -> Vec<CacheGroupSpec> {
        self.managers.iter().map(|m| m.spec().clone()).collect()
    }

    fn manager_mut(&mut self, group: GroupId) -> Result<&mut SingleTypeManager, CoordinatorError> {
        self.managers
            .iter_mut()
            .find(|m| m.group_id() == group)
            .ok_or(CoordinatorError::UnknownGroup(group))
    }

    /// Blocks each group needs for `tokens` tokens, from scratch.
    pub fn blocks_needed(&self, tokens: usize) -> Vec<(GroupId, usize)> {
        self.managers
            .iter()
            .map(|m| (m.group_id(), m.blocks_needed(tokens)))
            .collect()
    }

    /// Total blocks `allocate(request, tokens)` would take from the pool.
    pub fn num_blocks_to_allocate(&self, request: &str, tokens: usize) -> usize {
        self.managers
            .iter()
            .map(|m| m.num_new_blocks(request, tokens))
            .sum()
    }

    /// Grow `request` to `tokens` tokens in every group.
    ///
    /// Only the delta beyond already-held blocks is requested, and it is
    /// taken from the pool in one call: on `OutOfBlocks` no group's record
    /// changes. Returns the new blocks per group, in group order.
    pub fn allocate(&mut self, request: &str, tokens: usize) -> Result<Vec<Vec<BlockId>>, CoordinatorError> {
        let deltas: Vec<usize> = self
            .managers
            .iter()
            .map(|m| m.num_new_blocks(request, tokens))
            .collect();
        let total: usize = deltas.iter().sum();

        let mut new_blocks = if total == 0 {
            Vec::new()
        } else {
            self.pool.lock().allocate(total)?
        };

        let mut per_group = Vec::with_capacity(self.managers.len());
        for (manager, delta) in self.managers.iter_mut().zip(&deltas) {
            let rest = new_blocks.split_off(*delta);
            manager.commit_allocated(request, &new_blocks);
            per_group.push(new_blocks);
            new_blocks = rest;
        }

        if total > 0 {
            debug!(request, tokens, new_blocks = total, "Allocated request blocks");
        }
        Ok(per_group)
    }

    /// Release every block held by `request`. Returns how many were held.
    pub fn free(&mut self, request: &str) -> Result<usize, CoordinatorError> {
        let released: Vec<BlockId> = self
            .managers
            .iter_mut()
            .flat_map(|m| m.remove_request(request))
            .collect();
        let count = released.len();
        if count > 0 {
            self.pool.lock().free_blocks(released)?;
            debug!(request, blocks = count, "Freed request blocks");
        }
        Ok(count)
    }

    /// How many blocks `request` holds in each group, `None` where it has
    /// no record. Pair with [`KvCacheCoordinator::rollback`].
    pub fn held_counts(&self, request: &str) -> Vec<Option<usize>> {
        self.managers
            .iter()
            .map(|m| m.blocks(request).map(<[BlockId]>::len))
            .collect()
    }

    /// Restore `request` to a [`KvCacheCoordinator::held_counts`] snapshot,
    /// releasing every block attached since. Returns how many were released.
    pub fn rollback(&mut self, request: &str, snapshot: &[Option<usize>]) -> Result<usize, CoordinatorError> {
        let released: Vec<BlockId> = self
            .managers
            .iter_mut()
            .zip(snapshot)
            .flat_map(|(m, keep)| m.truncate_request(request, *keep))
            .collect();
        let count = released.len();
        if count > 0 {
            self.pool.lock().free_blocks(released)?;
            debug!(request, blocks = count, "Rolled back request blocks");
        }
        Ok(count)
    }

    /// Register content hashes for the request's blocks in `group`.
    pub fn cache_blocks(
        &mut self,
        request: &str,
        group: GroupId,
        hashes: &[BlockHash],
    ) -> Result<usize, CoordinatorError> {
        let pool = self.pool.clone();
        let manager = self.manager_mut(group)?;
        let mut pool = pool.lock();
        Ok(manager.cache_blocks(&mut pool, request, hashes)?)
    }

    /// Hash `tokens` per group and register every full block.
    pub fn cache_request_tokens(&mut self, request: &str, tokens: &[u32]) -> Result<(), CoordinatorError> {
        let pool = self.pool.clone();
        let mut pool = pool.lock();
        for manager in &mut self.managers {
            let hashes = hash_request_tokens(manager.spec().block_size, tokens);
            manager.cache_blocks(&mut pool, request, &hashes)?;
        }
        Ok(())
    }

    /// Attach the longest run of cached blocks matching `hashes` to
    /// `request` in `group`. Returns the hit count.
    pub fn find_cached_blocks(
        &mut self,
        request: &str,
        group: GroupId,
        hashes: &[BlockHash],
    ) -> Result<usize, CoordinatorError> {
        let pool = self.pool.clone();
        let manager = self.manager_mut(group)?;
        let mut pool = pool.lock();
        Ok(manager.find_cached_blocks(&mut pool, request, hashes))
    }

    /// Prefix lookup across all groups. Returns the number of tokens
    /// covered in every group.
    pub fn find_longest_cache_hit(&mut self, request: &str, tokens: &[u32]) -> usize {
        let pool = self.pool.clone();
        let mut pool = pool.lock();
        let mut hit_tokens = usize::MAX;
        for manager in &mut self.managers {
            let block_size = manager.spec().block_size;
            let hashes = hash_request_tokens(block_size, tokens);
            manager.find_cached_blocks(&mut pool, request, &hashes);
            let held = manager.blocks(request).map_or(0, <[BlockId]>::len);
            hit_tokens = hit_tokens.min(held * block_size);
        }
        if hit_tokens == usize::MAX {
            0
        } else {
            hit_tokens.min(tokens.len())
        }
    }

    /// Blocks held by `request`, one list per group.
    pub fn get_blocks(&self, request: &str) -> Option<Vec<Vec<BlockId>>> {
        let lists: Vec<Option<&[BlockId]>> = self.managers.iter().map(|m| m.blocks(request)).collect();
        if lists.iter().all(Option::is_none) {
            return None;
        }
        Some(
            lists
                .into_iter()
                .map(|l| l.map(<[BlockId]>::to_vec).unwrap_or_default())
                .collect(),
        )
    }

    /// Quantization record for a block in a compressed group.
    pub fn quant_record(&self, group: GroupId, block: BlockId) -> Option<QuantRecord> {
        self.managers
            .iter()
            .find(|m| m.group_id() == group)
            .and_then(|m| m.quant_record(block).cloned())
    }

    pub fn stats(&self) -> CoordinatorStats {
        let requests: HashSet<&str> = self
            .managers
            .iter()
            .flat_map(SingleTypeManager::request_ids)
            .collect();
        CoordinatorStats {
            active_requests: requests.len(),
            held_blocks: self
                .managers
                .iter()
                .map(|m| (m.group_id(), m.num_held_blocks()))
                .collect(),
            pool: self.pool.lock().stats(),
        }
    }
}
