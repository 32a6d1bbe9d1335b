//! KV block metadata, content hashes and the intrusive block queue.
//!
//! A block holds a fixed number of tokens' worth of K/V state. Only the
//! metadata lives here: the pool owns every block in a flat arena and all
//! other components refer to blocks by [`BlockId`].

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Index of a block inside the pool arena.
pub type BlockId = u32;

/// Identifies a cache group (one attention topology).
pub type GroupId = u32;

/// The reserved sentinel block. Never handed out by the pool.
pub const NULL_BLOCK_ID: BlockId = 0;

/// SHA-256 digest of a full block of tokens, chained with its parent.
///
/// Because each hash folds in the previous block's hash, equal hashes
/// imply equal prefixes, which is what makes prefix sharing sound.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Hash one block of tokens given the hash of the preceding block.
    pub fn of_tokens(parent: Option<&BlockHash>, tokens: &[u32]) -> Self {
        let mut hasher = Sha256::new();
        match parent {
            Some(p) => hasher.update(p.0),
            None => hasher.update([0u8; 32]),
        }
        for token in tokens {
            hasher.update(token.to_le_bytes());
        }
        BlockHash(hasher.finalize().into())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Cache key: a content hash scoped to the group that produced it.
///
/// Two attention groups may see identical tokens but store different
/// state, so the group id is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHashWithGroupId {
    pub hash: BlockHash,
    pub group_id: GroupId,
}

impl BlockHashWithGroupId {
    pub fn new(hash: BlockHash, group_id: GroupId) -> Self {
        Self { hash, group_id }
    }
}

/// Hash every *full* block of `tokens`. A trailing partial block is not
/// hashed since its content can still change.
pub fn hash_request_tokens(block_size: usize, tokens: &[u32]) -> Vec<BlockHash> {
    if block_size == 0 {
        return Vec::new();
    }
    let mut hashes = Vec::with_capacity(tokens.len() / block_size);
    let mut parent: Option<BlockHash> = None;
    for chunk in tokens.chunks_exact(block_size) {
        let hash = BlockHash::of_tokens(parent.as_ref(), chunk);
        hashes.push(hash);
        parent = Some(hash);
    }
    hashes
}

/// Which intrusive queue a block is currently linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueueKind {
    /// Untagged and unreferenced, ready for immediate reuse.
    Free,
    /// Unreferenced but still carrying a content hash; evictable.
    Cached,
}

/// Metadata for a single KV cache block.
#[derive(Debug, Clone)]
pub struct KvCacheBlock {
    /// Stable arena index.
    pub id: BlockId,

    /// Number of requests currently holding this block.
    pub ref_cnt: u32,

    /// Content hash, set once the block is full and registered.
    pub block_hash: Option<BlockHashWithGroupId>,

    /// Pool clock tick of the last allocation, hit or release.
    pub last_access: u64,

    /// Number of times this block has been handed out.
    pub access_count: u64,

    /// Sentinel flag; only set on [`NULL_BLOCK_ID`].
    pub is_null: bool,

    queue: Option<QueueKind>,
    prev: Option<BlockId>,
    next: Option<BlockId>,
}

impl KvCacheBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            ref_cnt: 0,
            block_hash: None,
            last_access: 0,
            access_count: 0,
            is_null: false,
            queue: None,
            prev: None,
            next: None,
        }
    }

    /// Create the sentinel block.
    pub fn null() -> Self {
        Self {
            is_null: true,
            ..Self::new(NULL_BLOCK_ID)
        }
    }

    /// Record an access at the given pool tick.
    pub fn touch(&mut self, tick: u64) {
        self.last_access = tick;
        self.access_count += 1;
    }

    /// The queue this block is linked into, if any.
    pub fn queue(&self) -> Option<QueueKind> {
        self.queue
    }
}

/// Doubly linked queue threaded through the arena by index.
///
/// Links live on the blocks themselves (`prev`/`next`), so push, pop and
/// unlink are O(1) and never allocate. A block is in at most one queue at
/// a time; the `queue` tag on the block records which.
#[derive(Debug)]
pub struct BlockQueue {
    kind: QueueKind,
    head: Option<BlockId>,
    tail: Option<BlockId>,
    len: usize,
}

impl BlockQueue {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<BlockId> {
        self.head
    }

    /// Link `id` at the tail. The block must not already be queued.
    pub fn push_back(&mut self, blocks: &mut [KvCacheBlock], id: BlockId) {
        let idx = id as usize;
        debug_assert!(blocks[idx].queue.is_none(), "block {id} already queued");

        blocks[idx].queue = Some(self.kind);
        blocks[idx].prev = self.tail;
        blocks[idx].next = None;
        match self.tail {
            Some(tail) => blocks[tail as usize].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Unlink and return the head.
    pub fn pop_front(&mut self, blocks: &mut [KvCacheBlock]) -> Option<BlockId> {
        let head = self.head?;
        self.unlink(blocks, head);
        Some(head)
    }

    /// Unlink `id` from anywhere in the queue. Returns false if it is not
    /// a member of this queue.
    pub fn remove(&mut self, blocks: &mut [KvCacheBlock], id: BlockId) -> bool {
        if blocks.get(id as usize).and_then(|b| b.queue) != Some(self.kind) {
            return false;
        }
        self.unlink(blocks, id);
        true
    }

    fn unlink(&mut self, blocks: &mut [KvCacheBlock], id: BlockId) {
        let idx = id as usize;
        let prev = blocks[idx].prev.take();
        let next = blocks[idx].next.take();
        blocks[idx].queue = None;

        match prev {
            Some(p) => blocks[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => blocks[n as usize].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Iterate from head to tail.
    pub fn iter<'a>(&self, blocks: &'a [KvCacheBlock]) -> BlockQueueIter<'a> {
        BlockQueueIter {
            blocks,
            cursor: self.head,
        }
    }
}

pub struct BlockQueueIter<'a> {
    blocks: &'a [KvCacheBlock],
    cursor: Option<BlockId>,
}

impl<'a> Iterator for BlockQueueIter<'a> {
    type Item = &'a KvCacheBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let blocks = self.blocks;
        let block = &blocks[self.cursor? as usize];
        self.cursor = block.next;
        Some(block)
    }
}
