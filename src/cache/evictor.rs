//! Eviction policy: decides which cached, unreferenced block to reuse.
//!
//! Only LRU is implemented. Candidates are ordered by:
//! - Oldest last access first
//! - Lowest access count on ties
//! - Lowest block id as a final, deterministic tie-break

use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::cache::block::{BlockId, KvCacheBlock};

/// Eviction policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    #[default]
    Lru,
}

/// An eviction candidate with its ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub block_id: BlockId,
    pub last_access: u64,
    pub access_count: u64,
}

// Greater = evicted first.
impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .last_access
            .cmp(&self.last_access)
            .then_with(|| other.access_count.cmp(&self.access_count))
            .then_with(|| other.block_id.cmp(&self.block_id))
    }
}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&KvCacheBlock> for EvictionCandidate {
    fn from(block: &KvCacheBlock) -> Self {
        Self {
            block_id: block.id,
            last_access: block.last_access,
            access_count: block.access_count,
        }
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone)]
pub struct Evictor {
    policy: EvictionPolicy,
}

impl Evictor {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Select up to `count` victims, highest eviction priority first.
    ///
    /// Referenced blocks are never candidates.
    pub fn select_victims<'a>(
        &self,
        blocks: impl Iterator<Item = &'a KvCacheBlock>,
        count: usize,
    ) -> Vec<EvictionCandidate> {
        let mut heap: BinaryHeap<EvictionCandidate> = match self.policy {
            EvictionPolicy::Lru => blocks
                .filter(|b| b.ref_cnt == 0 && !b.is_null)
                .map(EvictionCandidate::from)
                .collect(),
        };

        let mut victims = Vec::with_capacity(count.min(heap.len()));
        while victims.len() < count {
            match heap.pop() {
                Some(candidate) => victims.push(candidate),
                None => break,
            }
        }
        victims
    }

    /// Pick a single victim.
    pub fn select_victim<'a>(
        &self,
        blocks: impl Iterator<Item = &'a KvCacheBlock>,
    ) -> Option<BlockId> {
        self.select_victims(blocks, 1)
            .first()
            .map(|candidate| candidate.block_id)
    }
}
