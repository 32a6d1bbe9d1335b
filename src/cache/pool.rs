//! Block pool: the single owner of every KV block.
//!
//! The pool is the central allocator for the cache. It:
//! - Hands out blocks from an intrusive free list in O(1)
//! - Keeps freed, hashed blocks as evictable prefix-cache entries
//! - Evicts cached blocks (LRU) when the free list runs dry
//! - Maintains the counters every upstream stress decision is based on

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::block::{
    BlockHashWithGroupId, BlockId, BlockQueue, KvCacheBlock, QueueKind, NULL_BLOCK_ID,
};
use crate::cache::evictor::Evictor;
use crate::config::PoolConfig;

/// Largest pool whose block ids (1-based, 0 is the null block) fit a
/// [`BlockId`].
pub const MAX_POOL_BLOCKS: BlockId = BlockId::MAX;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Out of KV blocks: requested {requested}, {available} available")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("Block {0} does not exist")]
    InvalidBlock(BlockId),

    #[error("Block {0} is not referenced")]
    NotReferenced(BlockId),

    #[error("Block {0} is already tagged with a different hash")]
    AlreadyTagged(BlockId),
}

/// Pool-level counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Usable blocks (the null block is not counted).
    pub num_blocks: usize,
    /// Blocks on the free list.
    pub free_blocks: usize,
    /// Unreferenced blocks retained for prefix reuse.
    pub cached_blocks: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_evictions: u64,
    pub total_allocations: u64,
}

impl PoolStats {
    /// Blocks that can satisfy an allocation right now.
    pub fn allocatable(&self) -> usize {
        self.free_blocks + self.cached_blocks
    }

    /// Fraction of blocks held by requests (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.num_blocks == 0 {
            return 0.0;
        }
        (self.num_blocks - self.allocatable()) as f64 / self.num_blocks as f64
    }

    /// Prefix cache hit rate over all lookups.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / lookups as f64
    }
}

/// The block pool.
pub struct BlockPool {
    /// Arena; index 0 is the null block.
    blocks: Vec<KvCacheBlock>,

    /// Untagged, unreferenced blocks.
    free_queue: BlockQueue,

    /// Tagged, unreferenced blocks in release order (oldest first).
    cached_queue: BlockQueue,

    /// Prefix cache index.
    cached: HashMap<BlockHashWithGroupId, BlockId>,

    enable_caching: bool,
    stress_threshold: f64,
    evictor: Evictor,

    /// Logical clock; one tick per mutating operation.
    clock: u64,

    stats: PoolStats,
}

impl BlockPool {
    /// Create a pool with `config.num_blocks` usable blocks, all free.
    ///
    /// `num_blocks` is capped at [`MAX_POOL_BLOCKS`] so every id fits a
    /// [`BlockId`]; `Config::validate` rejects larger pools up front.
    pub fn new(config: &PoolConfig) -> Self {
        let last_id = BlockId::try_from(config.num_blocks).unwrap_or(MAX_POOL_BLOCKS);
        let num_blocks = last_id as usize;
        let mut blocks = Vec::with_capacity(num_blocks + 1);
        blocks.push(KvCacheBlock::null());
        blocks.extend((1..=last_id).map(KvCacheBlock::new));

        let mut free_queue = BlockQueue::new(QueueKind::Free);
        for id in 1..=last_id {
            free_queue.push_back(&mut blocks, id);
        }

        Self {
            blocks,
            free_queue,
            cached_queue: BlockQueue::new(QueueKind::Cached),
            cached: HashMap::new(),
            enable_caching: config.enable_prefix_caching,
            stress_threshold: config.stress_threshold,
            evictor: Evictor::new(config.eviction_policy),
            clock: 0,
            stats: PoolStats {
                num_blocks,
                free_blocks: num_blocks,
                ..Default::default()
            },
        }
    }

    /// The reserved sentinel block id.
    pub fn null_block(&self) -> BlockId {
        NULL_BLOCK_ID
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn block_mut(&mut self, id: BlockId) -> Result<&mut KvCacheBlock, PoolError> {
        if id == NULL_BLOCK_ID {
            return Err(PoolError::InvalidBlock(id));
        }
        self.blocks
            .get_mut(id as usize)
            .ok_or(PoolError::InvalidBlock(id))
    }

    /// Allocate exactly `n` distinct blocks, or none at all.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockId>, PoolError> {
        let available = self.num_free_blocks();
        if n > available {
            return Err(PoolError::OutOfBlocks {
                requested: n,
                available,
            });
        }

        let tick = self.tick();
        let mut allocated = Vec::with_capacity(n);
        for _ in 0..n {
            let id = match self.free_queue.pop_front(&mut self.blocks) {
                Some(id) => id,
                None => self.evict_one()?,
            };
            let block = &mut self.blocks[id as usize];
            debug_assert_eq!(block.ref_cnt, 0);
            block.ref_cnt = 1;
            block.touch(tick);
            allocated.push(id);
        }

        self.stats.total_allocations += n as u64;
        self.sync_counts();
        trace!(count = n, "Allocated blocks");
        Ok(allocated)
    }

    /// Reclaim one cached block for reuse, dropping its hash mapping.
    fn evict_one(&mut self) -> Result<BlockId, PoolError> {
        let oldest = self
            .cached_queue
            .front()
            .map(|id| self.blocks[id as usize].last_access);

        let victim = oldest.and_then(|oldest| {
            let run = self
                .cached_queue
                .iter(&self.blocks)
                .take_while(|b| b.last_access == oldest);
            self.evictor.select_victim(run)
        });

        let Some(id) = victim else {
            return Err(PoolError::OutOfBlocks {
                requested: 1,
                available: 0,
            });
        };

        self.cached_queue.remove(&mut self.blocks, id);
        if let Some(hash) = self.blocks[id as usize].block_hash.take() {
            if self.cached.get(&hash) == Some(&id) {
                self.cached.remove(&hash);
            }
        }
        self.stats.total_evictions += 1;
        debug!(block_id = id, "Evicted cached block");
        Ok(id)
    }

    /// Release one reference to `id`.
    pub fn free(&mut self, id: BlockId) -> Result<(), PoolError> {
        if id == NULL_BLOCK_ID {
            return Ok(());
        }
        let tick = self.tick();
        self.release(id, tick)?;
        self.sync_counts();
        Ok(())
    }

    /// Release a batch of blocks. All of them share one clock tick, so
    /// eviction among them falls back to access count and then order.
    ///
    /// The batch is checked first: an unknown id, or more releases of a
    /// block than it has references, fails the whole call and releases
    /// nothing.
    pub fn free_blocks(&mut self, ids: impl IntoIterator<Item = BlockId>) -> Result<(), PoolError> {
        let ids: Vec<BlockId> = ids.into_iter().filter(|&id| id != NULL_BLOCK_ID).collect();

        let mut releases: HashMap<BlockId, u32> = HashMap::new();
        for &id in &ids {
            let held = self
                .blocks
                .get(id as usize)
                .ok_or(PoolError::InvalidBlock(id))?
                .ref_cnt;
            let count = releases.entry(id).or_insert(0);
            *count += 1;
            if *count > held {
                return Err(PoolError::NotReferenced(id));
            }
        }

        let tick = self.tick();
        for id in ids {
            self.release(id, tick)?;
        }
        self.sync_counts();
        Ok(())
    }

    fn release(&mut self, id: BlockId, tick: u64) -> Result<(), PoolError> {
        let enable_caching = self.enable_caching;
        let block = self.block_mut(id)?;
        if block.ref_cnt == 0 {
            return Err(PoolError::NotReferenced(id));
        }
        block.ref_cnt -= 1;
        if block.ref_cnt > 0 {
            return Ok(());
        }
        block.last_access = tick;

        if enable_caching && block.block_hash.is_some() {
            self.cached_queue.push_back(&mut self.blocks, id);
        } else {
            if let Some(hash) = block.block_hash.take() {
                if self.cached.get(&hash) == Some(&id) {
                    self.cached.remove(&hash);
                }
            }
            self.free_queue.push_back(&mut self.blocks, id);
        }
        Ok(())
    }

    /// Register `hash` as the content of a referenced block.
    ///
    /// Returns `false` when caching is disabled or another block already
    /// owns the hash; the block then stays untagged.
    pub fn cache_block(&mut self, id: BlockId, hash: BlockHashWithGroupId) -> Result<bool, PoolError> {
        if !self.enable_caching {
            return Ok(false);
        }
        let block = self.block_mut(id)?;
        if block.ref_cnt == 0 {
            return Err(PoolError::NotReferenced(id));
        }
        match block.block_hash {
            Some(existing) if existing == hash => return Ok(true),
            Some(_) => return Err(PoolError::AlreadyTagged(id)),
            None => {}
        }
        if self.cached.contains_key(&hash) {
            return Ok(false);
        }
        self.blocks[id as usize].block_hash = Some(hash);
        self.cached.insert(hash, id);
        Ok(true)
    }

    /// Take a reference to the block registered under `hash`.
    ///
    /// Unlinking from the evictable queue and bumping the reference count
    /// happen under the same `&mut self`, so a hit can never be evicted
    /// and handed to another caller.
    pub fn lookup_cached(&mut self, hash: &BlockHashWithGroupId) -> Option<BlockId> {
        let Some(&id) = self.cached.get(hash) else {
            self.stats.cache_misses += 1;
            return None;
        };

        let tick = self.tick();
        if self.blocks[id as usize].ref_cnt == 0 {
            self.cached_queue.remove(&mut self.blocks, id);
        }
        let block = &mut self.blocks[id as usize];
        block.ref_cnt += 1;
        block.touch(tick);

        self.stats.cache_hits += 1;
        self.sync_counts();
        Some(id)
    }

    /// Drop every hash tag. Only allowed when no block is referenced.
    pub fn reset_prefix_cache(&mut self) -> bool {
        if self.num_free_blocks() != self.stats.num_blocks {
            return false;
        }
        while let Some(id) = self.cached_queue.pop_front(&mut self.blocks) {
            self.blocks[id as usize].block_hash = None;
            self.free_queue.push_back(&mut self.blocks, id);
        }
        self.cached.clear();
        self.sync_counts();
        debug!("Prefix cache reset");
        true
    }

    /// Blocks that can be allocated (free plus evictable).
    pub fn num_free_blocks(&self) -> usize {
        self.free_queue.len() + self.cached_queue.len()
    }

    /// Total usable blocks.
    pub fn num_blocks(&self) -> usize {
        self.stats.num_blocks
    }

    pub fn get_block(&self, id: BlockId) -> Option<&KvCacheBlock> {
        self.blocks.get(id as usize)
    }

    /// Whether usage exceeds the configured stress threshold.
    pub fn is_stressed(&self) -> bool {
        self.stats.usage_fraction() > self.stress_threshold
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.clone()
    }

    fn sync_counts(&mut self) {
        self.stats.free_blocks = self.free_queue.len();
        self.stats.cached_blocks = self.cached_queue.len();
    }
}

/// Thread-safe handle to a pool. One mutex per pool is the only
/// synchronisation domain for allocate/free/cache/lookup.
pub type SharedBlockPool = Arc<Mutex<BlockPool>>;

/// Create a new thread-safe pool.
pub fn new_shared_pool(config: &PoolConfig) -> SharedBlockPool {
    Arc::new(Mutex::new(BlockPool::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::block::BlockHash;

    fn test_pool(num_blocks: usize) -> BlockPool {
        BlockPool::new(&PoolConfig {
            num_blocks,
            ..Default::default()
        })
    }

    fn key(n: u32) -> BlockHashWithGroupId {
        BlockHashWithGroupId::new(BlockHash::of_tokens(None, &[n]), 0)
    }

    #[test]
    fn test_allocate_all_or_nothing() {
        let mut pool = test_pool(4);
        let ids = pool.allocate(3).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&NULL_BLOCK_ID));

        let err = pool.allocate(2).unwrap_err();
        assert_eq!(
            err,
            PoolError::OutOfBlocks {
                requested: 2,
                available: 1
            }
        );
        assert_eq!(pool.num_free_blocks(), 1);
    }

    #[test]
    fn test_free_returns_to_free_list() {
        let mut pool = test_pool(2);
        let ids = pool.allocate(2).unwrap();
        pool.free(ids[0]).unwrap();
        assert_eq!(pool.stats().free_blocks, 1);
        assert_eq!(pool.free(ids[0]), Err(PoolError::NotReferenced(ids[0])));
    }

    #[test]
    fn test_bad_batch_releases_nothing() {
        let mut pool = test_pool(4);
        let ids = pool.allocate(2).unwrap();

        assert_eq!(
            pool.free_blocks([ids[0], 99, ids[1]]),
            Err(PoolError::InvalidBlock(99))
        );
        assert_eq!(
            pool.free_blocks([ids[0], ids[1], ids[0]]),
            Err(PoolError::NotReferenced(ids[0]))
        );
        assert_eq!(pool.num_free_blocks(), 2);
        assert_eq!(pool.get_block(ids[0]).unwrap().ref_cnt, 1);

        pool.free_blocks(ids).unwrap();
        assert_eq!(pool.num_free_blocks(), 4);
    }

    #[test]
    fn test_null_block_is_inert() {
        let mut pool = test_pool(1);
        assert!(pool.get_block(pool.null_block()).unwrap().is_null);
        pool.free(NULL_BLOCK_ID).unwrap();
        assert_eq!(pool.num_free_blocks(), 1);
        assert_eq!(
            pool.cache_block(NULL_BLOCK_ID, key(1)),
            Err(PoolError::InvalidBlock(NULL_BLOCK_ID))
        );
    }

    #[test]
    fn test_cached_block_survives_free() {
        let mut pool = test_pool(2);
        let id = pool.allocate(1).unwrap()[0];
        assert!(pool.cache_block(id, key(7)).unwrap());
        pool.free(id).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.cached_blocks, 1);
        assert_eq!(stats.free_blocks, 1);

        assert_eq!(pool.lookup_cached(&key(7)), Some(id));
        assert_eq!(pool.get_block(id).unwrap().ref_cnt, 1);
        assert_eq!(pool.stats().cache_hits, 1);
    }

    #[test]
    fn test_shared_hit_increments_refcount() {
        let mut pool = test_pool(2);
        let id = pool.allocate(1).unwrap()[0];
        pool.cache_block(id, key(3)).unwrap();
        assert_eq!(pool.lookup_cached(&key(3)), Some(id));
        assert_eq!(pool.get_block(id).unwrap().ref_cnt, 2);

        pool.free(id).unwrap();
        assert_eq!(pool.stats().cached_blocks, 0);
        pool.free(id).unwrap();
        assert_eq!(pool.stats().cached_blocks, 1);
    }

    #[test]
    fn test_eviction_when_free_list_empty() {
        let mut pool = test_pool(2);
        let ids = pool.allocate(2).unwrap();
        pool.cache_block(ids[0], key(1)).unwrap();
        pool.cache_block(ids[1], key(2)).unwrap();
        pool.free(ids[0]).unwrap();
        pool.free(ids[1]).unwrap();

        // ids[0] was released first, so it is the LRU victim.
        let got = pool.allocate(1).unwrap();
        assert_eq!(got, vec![ids[0]]);
        assert_eq!(pool.stats().total_evictions, 1);
        assert_eq!(pool.lookup_cached(&key(1)), None);
        assert_eq!(pool.lookup_cached(&key(2)), Some(ids[1]));
        assert!(pool.get_block(ids[0]).unwrap().block_hash.is_none());
    }

    #[test]
    fn test_batch_free_tie_broken_by_access_count() {
        let mut pool = test_pool(2);
        let ids = pool.allocate(2).unwrap();
        pool.cache_block(ids[0], key(1)).unwrap();
        pool.cache_block(ids[1], key(2)).unwrap();
        // Give ids[0] an extra access.
        pool.lookup_cached(&key(1)).unwrap();
        pool.free(ids[0]).unwrap();

        pool.free_blocks([ids[0], ids[1]]).unwrap();
        assert_eq!(pool.allocate(1).unwrap(), vec![ids[1]]);
    }

    #[test]
    fn test_first_writer_wins() {
        let mut pool = test_pool(2);
        let ids = pool.allocate(2).unwrap();
        assert!(pool.cache_block(ids[0], key(9)).unwrap());
        assert!(!pool.cache_block(ids[1], key(9)).unwrap());
        assert!(pool.get_block(ids[1]).unwrap().block_hash.is_none());
        assert_eq!(
            pool.cache_block(ids[0], key(8)),
            Err(PoolError::AlreadyTagged(ids[0]))
        );
    }

    #[test]
    fn test_caching_disabled() {
        let mut pool = BlockPool::new(&PoolConfig {
            num_blocks: 1,
            enable_prefix_caching: false,
            ..Default::default()
        });
        let id = pool.allocate(1).unwrap()[0];
        assert!(!pool.cache_block(id, key(1)).unwrap());
        pool.free(id).unwrap();
        assert_eq!(pool.stats().free_blocks, 1);
        assert_eq!(pool.lookup_cached(&key(1)), None);
    }

    #[test]
    fn test_reset_prefix_cache() {
        let mut pool = test_pool(2);
        let id = pool.allocate(1).unwrap()[0];
        pool.cache_block(id, key(1)).unwrap();
        assert!(!pool.reset_prefix_cache());
        pool.free(id).unwrap();
        assert!(pool.reset_prefix_cache());
        assert_eq!(pool.stats().free_blocks, 2);
        assert_eq!(pool.lookup_cached(&key(1)), None);
    }

    #[test]
    fn test_stress_threshold() {
        let mut pool = BlockPool::new(&PoolConfig {
            num_blocks: 10,
            stress_threshold: 0.8,
            ..Default::default()
        });
        pool.allocate(8).unwrap();
        assert!(!pool.is_stressed());
        pool.allocate(1).unwrap();
        assert!(pool.is_stressed());
    }
}
