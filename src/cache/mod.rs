//! Single-node KV cache management.
//!
//! This module contains the block-level data structures and allocators:
//! - [`block`]: block metadata, content hashes, intrusive block queue
//! - [`evictor`]: LRU victim selection for cached blocks
//! - [`pool`]: the block pool (free list, refcounts, prefix cache)
//! - [`manager`]: per-attention-topology block accounting
//! - [`coordinator`]: multi-group allocation as one unit
//! - [`hierarchical`], [`predictive`], [`prefetch_queue`]: coordinator decorators

pub mod block;
pub mod coordinator;
pub mod evictor;
pub mod hierarchical;
pub mod manager;
pub mod pool;
pub mod predictive;
pub mod prefetch_queue;
