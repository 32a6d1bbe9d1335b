//! Per-topology block accounting.
//!
//! Each cache group has one [`SingleTypeManager`]. The manager knows how
//! many blocks its attention topology needs for a given token count and
//! keeps the request → blocks record for its group. Blocks themselves come
//! from the shared [`BlockPool`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cache::block::{BlockHash, BlockHashWithGroupId, BlockId, GroupId};
use crate::cache::pool::{BlockPool, PoolError};

/// Request identifier.
pub type RequestId = String;

/// Attention topology of a cache group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttentionTopology {
    /// Every token attends to every previous token.
    Full,
    /// Only the last `window` tokens are attended to.
    SlidingWindow { window: usize },
    /// Decoder attends to a fixed-length encoder output.
    CrossAttention,
    /// Full attention over quantized blocks; `chunk_size` tokens share one
    /// scale/min pair.
    Compressed { chunk_size: usize },
}

impl AttentionTopology {
    /// Blocks required to hold `tokens` tokens with `block_size` tokens per block.
    pub fn blocks_needed(&self, tokens: usize, block_size: usize) -> usize {
        match *self {
            AttentionTopology::Full
            | AttentionTopology::CrossAttention
            | AttentionTopology::Compressed { .. } => tokens.div_ceil(block_size),
            AttentionTopology::SlidingWindow { window } => {
                tokens.min(window).div_ceil(block_size)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AttentionTopology::Full => "full",
            AttentionTopology::SlidingWindow { .. } => "sliding_window",
            AttentionTopology::CrossAttention => "cross_attention",
            AttentionTopology::Compressed { .. } => "compressed",
        }
    }
}

/// Static description of one cache group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGroupSpec {
    pub group_id: GroupId,
    pub topology: AttentionTopology,
    /// Tokens per block.
    pub block_size: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl CacheGroupSpec {
    /// Convenience constructor for a full-attention group.
    pub fn full(group_id: GroupId, block_size: usize) -> Self {
        Self {
            group_id,
            topology: AttentionTopology::Full,
            block_size,
            num_heads: 8,
            head_dim: 128,
        }
    }

    pub fn with_topology(mut self, topology: AttentionTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Describe why this spec is unusable, if it is.
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size == 0 {
            return Err(format!("group {}: block_size must be > 0", self.group_id));
        }
        match self.topology {
            AttentionTopology::SlidingWindow { window: 0 } => {
                Err(format!("group {}: sliding window must be > 0", self.group_id))
            }
            AttentionTopology::Compressed { chunk_size: 0 } => {
                Err(format!("group {}: chunk_size must be > 0", self.group_id))
            }
            _ => Ok(()),
        }
    }
}

/// Per-block quantization metadata for compressed groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantRecord {
    /// One scale per token chunk.
    pub scales: Vec<f32>,
    /// One minimum (zero point) per token chunk.
    pub mins: Vec<f32>,
    /// Channel permutation applied before packing.
    pub permutation: Vec<u32>,
}

impl QuantRecord {
    /// Identity record for a freshly allocated block.
    pub fn identity(block_size: usize, chunk_size: usize, head_dim: usize) -> Self {
        let chunks = block_size.div_ceil(chunk_size.max(1));
        Self {
            scales: vec![1.0; chunks],
            mins: vec![0.0; chunks],
            permutation: (0..head_dim as u32).collect(),
        }
    }
}

/// Block accounting for one cache group.
#[derive(Debug)]
pub struct SingleTypeManager {
    spec: CacheGroupSpec,

    /// Ordered blocks held by each request.
    req_to_blocks: HashMap<RequestId, Vec<BlockId>>,

    /// How many leading blocks of each request are already hashed.
    num_cached_blocks: HashMap<RequestId, usize>,

    /// Requests that went through at least one allocation. Prefix hits
    /// alone do not size a request.
    sized: HashSet<RequestId>,

    /// Quantization records; only populated for compressed groups.
    quant_records: HashMap<BlockId, QuantRecord>,
}

impl SingleTypeManager {
    pub fn new(spec: CacheGroupSpec) -> Self {
        Self {
            spec,
            req_to_blocks: HashMap::new(),
            num_cached_blocks: HashMap::new(),
            sized: HashSet::new(),
            quant_records: HashMap::new(),
        }
    }

    pub fn spec(&self) -> &CacheGroupSpec {
        &self.spec
    }

    pub fn group_id(&self) -> GroupId {
        self.spec.group_id
    }

    /// Blocks this topology needs for `tokens` tokens.
    pub fn blocks_needed(&self, tokens: usize) -> usize {
        self.spec.topology.blocks_needed(tokens, self.spec.block_size)
    }

    /// Blocks to add so `request` can hold `tokens` tokens.
    ///
    /// Cross-attention blocks are sized once from the encoder length at the
    /// first allocation; later decoder growth needs nothing new. Prefix
    /// hits held before that first allocation count towards the size.
    pub fn num_new_blocks(&self, request: &str, tokens: usize) -> usize {
        if self.spec.topology == AttentionTopology::CrossAttention && self.sized.contains(request) {
            return 0;
        }
        let held = self.req_to_blocks.get(request).map_or(0, Vec::len);
        self.blocks_needed(tokens).saturating_sub(held)
    }

    /// Attach freshly allocated blocks to `request`.
    pub fn commit(&mut self, request: &str, new_blocks: &[BlockId]) {
        if let AttentionTopology::Compressed { chunk_size } = self.spec.topology {
            for &id in new_blocks {
                self.quant_records.insert(
                    id,
                    QuantRecord::identity(self.spec.block_size, chunk_size, self.spec.head_dim),
                );
            }
        }
        self.req_to_blocks
            .entry(request.to_string())
            .or_default()
            .extend_from_slice(new_blocks);
        trace!(
            group = self.spec.group_id,
            request,
            added = new_blocks.len(),
            "Committed blocks"
        );
    }

    /// Attach the blocks of an allocation to `request` and mark it sized.
    pub fn commit_allocated(&mut self, request: &str, new_blocks: &[BlockId]) {
        self.commit(request, new_blocks);
        if !self.sized.contains(request) {
            self.sized.insert(request.to_string());
        }
    }

    /// Blocks held by `request`, in order.
    pub fn blocks(&self, request: &str) -> Option<&[BlockId]> {
        self.req_to_blocks.get(request).map(Vec::as_slice)
    }

    /// Drop the record for `request` and return its blocks, tail first, so
    /// the pool evicts the tail of a shared prefix before its head.
    pub fn remove_request(&mut self, request: &str) -> Vec<BlockId> {
        self.num_cached_blocks.remove(request);
        self.sized.remove(request);
        let mut blocks = self.req_to_blocks.remove(request).unwrap_or_default();
        for id in &blocks {
            self.quant_records.remove(id);
        }
        blocks.reverse();
        blocks
    }

    /// Cut `request` back to its first `keep` blocks, or drop the record
    /// entirely when `keep` is `None`. Returns the detached blocks, tail
    /// first.
    pub fn truncate_request(&mut self, request: &str, keep: Option<usize>) -> Vec<BlockId> {
        let Some(keep) = keep else {
            return self.remove_request(request);
        };
        let Some(blocks) = self.req_to_blocks.get_mut(request) else {
            return Vec::new();
        };
        let mut detached = blocks.split_off(keep.min(blocks.len()));
        for id in &detached {
            self.quant_records.remove(id);
        }
        if let Some(cached) = self.num_cached_blocks.get_mut(request) {
            *cached = (*cached).min(keep);
        }
        detached.reverse();
        detached
    }

    /// Tag the request's blocks with `hashes`, in order, skipping the ones
    /// already tagged. Returns how many blocks are now registered.
    pub fn cache_blocks(
        &mut self,
        pool: &mut BlockPool,
        request: &str,
        hashes: &[BlockHash],
    ) -> Result<usize, PoolError> {
        let Some(blocks) = self.req_to_blocks.get(request) else {
            return Ok(0);
        };
        let already = self.num_cached_blocks.get(request).copied().unwrap_or(0);
        let upto = hashes.len().min(blocks.len());

        let mut cached = already;
        for idx in already..upto {
            let key = BlockHashWithGroupId::new(hashes[idx], self.spec.group_id);
            pool.cache_block(blocks[idx], key)?;
            cached = idx + 1;
        }
        self.num_cached_blocks.insert(request.to_string(), cached);
        Ok(cached)
    }

    /// Greedy prefix match. Starting after the blocks `request` already
    /// holds, take cached blocks while hashes keep hitting and stop at the
    /// first miss. Hits are referenced and appended to the request.
    pub fn find_cached_blocks(
        &mut self,
        pool: &mut BlockPool,
        request: &str,
        hashes: &[BlockHash],
    ) -> usize {
        let held = self.req_to_blocks.get(request).map_or(0, Vec::len);
        let mut hits = Vec::new();
        for hash in hashes.iter().skip(held) {
            let key = BlockHashWithGroupId::new(*hash, self.spec.group_id);
            match pool.lookup_cached(&key) {
                Some(id) => hits.push(id),
                None => break,
            }
        }
        if !hits.is_empty() {
            let cached = self.num_cached_blocks.get(request).copied().unwrap_or(0);
            if cached == held {
                self.num_cached_blocks
                    .insert(request.to_string(), held + hits.len());
            }
            self.commit(request, &hits);
        }
        hits.len()
    }

    /// Quantization record of a compressed block.
    pub fn quant_record(&self, block: BlockId) -> Option<&QuantRecord> {
        self.quant_records.get(&block)
    }

    /// Replace the quantization record of a block held by this group.
    pub fn set_quant_record(&mut self, block: BlockId, record: QuantRecord) -> bool {
        match self.quant_records.get_mut(&block) {
            Some(slot) => {
                *slot = record;
                true
            }
            None => false,
        }
    }

    /// Requests holding at least one record in this group.
    pub fn request_ids(&self) -> impl Iterator<Item = &str> {
        self.req_to_blocks.keys().map(String::as_str)
    }

    pub fn num_requests(&self) -> usize {
        self.req_to_blocks.len()
    }

    pub fn num_held_blocks(&self) -> usize {
        self.req_to_blocks.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_attention_blocks() {
        let topo = AttentionTopology::Full;
        assert_eq!(topo.blocks_needed(0, 16), 0);
        assert_eq!(topo.blocks_needed(1, 16), 1);
        assert_eq!(topo.blocks_needed(16, 16), 1);
        assert_eq!(topo.blocks_needed(17, 16), 2);
    }

    #[test]
    fn test_sliding_window_is_bounded() {
        let topo = AttentionTopology::SlidingWindow { window: 64 };
        let at_window = topo.blocks_needed(64, 16);
        assert_eq!(at_window, 4);
        for tokens in [64, 65, 100, 1_000, 1_000_000] {
            assert_eq!(topo.blocks_needed(tokens, 16), at_window);
        }
        assert_eq!(topo.blocks_needed(20, 16), 2);
    }

    #[test]
    fn test_cross_attention_ignores_decoder_growth() {
        let spec = CacheGroupSpec::full(0, 16).with_topology(AttentionTopology::CrossAttention);
        let mut manager = SingleTypeManager::new(spec);
        assert_eq!(manager.num_new_blocks("r", 40), 3);
        manager.commit_allocated("r", &[1, 2, 3]);
        assert_eq!(manager.num_new_blocks("r", 4000), 0);
    }

    #[test]
    fn test_cross_attention_prefix_hit_does_not_size() {
        let spec = CacheGroupSpec::full(0, 4).with_topology(AttentionTopology::CrossAttention);
        let mut manager = SingleTypeManager::new(spec);
        manager.commit("r", &[7]);
        assert_eq!(manager.num_new_blocks("r", 12), 2);
        manager.commit_allocated("r", &[8, 9]);
        assert_eq!(manager.num_new_blocks("r", 40), 0);

        manager.remove_request("r");
        assert_eq!(manager.num_new_blocks("r", 12), 3);
    }

    #[test]
    fn test_truncate_request() {
        let spec = CacheGroupSpec::full(0, 16)
            .with_topology(AttentionTopology::Compressed { chunk_size: 8 });
        let mut manager = SingleTypeManager::new(spec);
        manager.commit("r", &[1, 2, 3]);

        assert_eq!(manager.truncate_request("r", Some(1)), vec![3, 2]);
        assert_eq!(manager.blocks("r"), Some(&[1][..]));
        assert!(manager.quant_record(2).is_none());
        assert!(manager.quant_record(1).is_some());

        assert_eq!(manager.truncate_request("r", None), vec![1]);
        assert!(manager.blocks("r").is_none());
    }

    #[test]
    fn test_compressed_quant_records_dropped() {
        let spec = CacheGroupSpec::full(0, 16)
            .with_topology(AttentionTopology::Compressed { chunk_size: 8 });
        let mut manager = SingleTypeManager::new(spec);
        manager.commit("r", &[5, 6]);

        let record = manager.quant_record(5).unwrap();
        assert_eq!(record.scales.len(), 2);
        assert_eq!(record.permutation.len(), 128);

        let removed = manager.remove_request("r");
        assert_eq!(removed, vec![6, 5]);
        assert!(manager.quant_record(5).is_none());
    }

    #[test]
    fn test_invalid_specs() {
        let spec = CacheGroupSpec::full(3, 16)
            .with_topology(AttentionTopology::SlidingWindow { window: 0 });
        assert!(spec.validate().is_err());
        assert!(CacheGroupSpec::full(1, 0).validate().is_err());
    }
}
