//! Context prefetching: detects sequential access direction within a
//! context and warms the shards ahead of it.
//!
//! Strategy:
//! 1. Keep the last `history_len` accessed token indices per context
//! 2. A small positive step (under two shards) means a forward scan,
//!    a small negative step means a reverse scan
//! 3. Touch the next `lookahead` shards in that direction, one shard apart

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::PrefetchConfig;
use crate::swarm::compressor::AdaptiveSwarmCompressor;

/// Scan direction inferred from the last two accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    Forward,
    Reverse,
}

pub struct ContextPrefetcher {
    compressor: Arc<AdaptiveSwarmCompressor>,
    shard_size: usize,
    lookahead: usize,
    history_len: usize,
    history: Mutex<HashMap<String, VecDeque<usize>>>,
    prefetches: AtomicU64,
}

impl ContextPrefetcher {
    pub fn new(compressor: Arc<AdaptiveSwarmCompressor>, config: &PrefetchConfig) -> Self {
        let shard_size = compressor.shard_manager().shard_size();
        Self {
            compressor,
            shard_size,
            lookahead: config.lookahead,
            history_len: config.history_len.max(2),
            history: Mutex::new(HashMap::new()),
            prefetches: AtomicU64::new(0),
        }
    }

    /// Classify the step from `prev` to `current`.
    pub fn direction(&self, prev: usize, current: usize) -> Option<AccessDirection> {
        let window = 2 * self.shard_size;
        if current > prev && current - prev < window {
            Some(AccessDirection::Forward)
        } else if prev > current && prev - current < window {
            Some(AccessDirection::Reverse)
        } else {
            None
        }
    }

    /// Record an access and prefetch along the detected direction.
    ///
    /// Returns the token indices whose shards were warmed.
    pub fn record_access(&self, context_id: &str, token_index: usize) -> Vec<usize> {
        let prev = {
            let mut history = self.history.lock();
            let entries = history.entry(context_id.to_string()).or_default();
            let prev = entries.back().copied();
            entries.push_back(token_index);
            while entries.len() > self.history_len {
                entries.pop_front();
            }
            prev
        };

        let Some(direction) = prev.and_then(|p| self.direction(p, token_index)) else {
            return Vec::new();
        };

        let mut warmed = Vec::new();
        for step in 1..=self.lookahead {
            let offset = step * self.shard_size;
            let target = match direction {
                AccessDirection::Forward => token_index.checked_add(offset),
                AccessDirection::Reverse => token_index.checked_sub(offset),
            };
            let Some(target) = target else {
                break;
            };
            if self.compressor.touch_shard(context_id, target) {
                warmed.push(target);
            }
        }

        if !warmed.is_empty() {
            self.prefetches.fetch_add(warmed.len() as u64, Ordering::Relaxed);
            debug!(context_id, ?direction, count = warmed.len(), "Prefetched shards");
        }
        warmed
    }

    /// Drop the access history of a context.
    pub fn forget(&self, context_id: &str) -> bool {
        self.history.lock().remove(context_id).is_some()
    }

    /// Recent accesses of a context, oldest first.
    pub fn history(&self, context_id: &str) -> Vec<usize> {
        self.history
            .lock()
            .get(context_id)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Shards warmed since startup.
    pub fn total_prefetches(&self) -> u64 {
        self.prefetches.load(Ordering::Relaxed)
    }
}
