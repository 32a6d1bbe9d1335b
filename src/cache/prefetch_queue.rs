//! Prefetch queue coordinator: allocations announced ahead of time and
//! drained in FIFO order when the pool has room.
//!
//! Under memory pressure the head entry is put back at the front and
//! draining stops, so neither ordering nor demand is lost.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use crate::cache::coordinator::{CoordinatorError, KvCacheCoordinator};
use crate::cache::manager::RequestId;

/// A queued allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrefetchEntry {
    pub request_id: RequestId,
    pub expected_tokens: usize,
    pub priority: u32,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries allocated.
    pub allocated: usize,
    /// Whether draining stopped on `OutOfBlocks`.
    pub stalled: bool,
    /// Entries still queued.
    pub remaining: usize,
}

pub struct PrefetchQueueCoordinator {
    inner: KvCacheCoordinator,
    queue: VecDeque<PrefetchEntry>,
    capacity: usize,
}

impl PrefetchQueueCoordinator {
    pub fn new(inner: KvCacheCoordinator, capacity: usize) -> Self {
        Self {
            inner,
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queue an allocation. Returns false when the queue is full.
    pub fn enqueue(&mut self, request_id: impl Into<RequestId>, expected_tokens: usize, priority: u32) -> bool {
        if self.queue.len() >= self.capacity {
            return false;
        }
        self.queue.push_back(PrefetchEntry {
            request_id: request_id.into(),
            expected_tokens,
            priority,
        });
        true
    }

    /// Allocate up to `max` queued entries.
    ///
    /// `OutOfBlocks` puts the failing entry back at the front and stops.
    /// Any other error also re-queues the entry and is returned.
    pub fn process_prefetch_queue(&mut self, max: usize) -> Result<DrainReport, CoordinatorError> {
        let mut report = DrainReport::default();
        while report.allocated < max {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            match self.inner.allocate(&entry.request_id, entry.expected_tokens) {
                Ok(_) => report.allocated += 1,
                Err(e) if e.is_out_of_blocks() => {
                    debug!(
                        request = %entry.request_id,
                        expected_tokens = entry.expected_tokens,
                        "Prefetch stalled on pool exhaustion"
                    );
                    self.queue.push_front(entry);
                    report.stalled = true;
                    break;
                }
                Err(e) => {
                    self.queue.push_front(entry);
                    return Err(e);
                }
            }
        }
        report.remaining = self.queue.len();
        Ok(report)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queued entries, front first.
    pub fn entries(&self) -> impl Iterator<Item = &PrefetchEntry> {
        self.queue.iter()
    }

    pub fn inner(&self) -> &KvCacheCoordinator {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut KvCacheCoordinator {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manager::CacheGroupSpec;
    use crate::cache::pool::new_shared_pool;
    use crate::config::PoolConfig;

    fn queue(num_blocks: usize, capacity: usize) -> PrefetchQueueCoordinator {
        let pool = new_shared_pool(&PoolConfig {
            num_blocks,
            ..Default::default()
        });
        let inner = KvCacheCoordinator::new(pool, vec![CacheGroupSpec::full(0, 4)]).unwrap();
        PrefetchQueueCoordinator::new(inner, capacity)
    }

    #[test]
    fn test_bounded_enqueue() {
        let mut q = queue(8, 2);
        assert!(q.enqueue("a", 4, 0));
        assert!(q.enqueue("b", 4, 0));
        assert!(!q.enqueue("c", 4, 0));
        assert_eq!(q.pending(), 2);
    }

    #[test]
    fn test_drain_respects_max() {
        let mut q = queue(8, 8);
        for name in ["a", "b", "c"] {
            q.enqueue(name, 4, 1);
        }
        let report = q.process_prefetch_queue(2).unwrap();
        assert_eq!(report.allocated, 2);
        assert_eq!(report.remaining, 1);
        assert_eq!(q.entries().next().unwrap().request_id, "c");
    }

    #[test]
    fn test_out_of_blocks_requeues_at_front() {
        let mut q = queue(3, 8);
        q.enqueue("a", 8, 0);
        q.enqueue("b", 8, 0);
        q.enqueue("c", 4, 0);

        let report = q.process_prefetch_queue(10).unwrap();
        assert_eq!(report.allocated, 1);
        assert!(report.stalled);

        let order: Vec<&str> = q.entries().map(|e| e.request_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c"]);

        q.inner_mut().free("a").unwrap();
        let report = q.process_prefetch_queue(10).unwrap();
        assert_eq!(report.allocated, 2);
        assert!(!report.stalled);
        assert_eq!(q.pending(), 0);
        assert!(q.inner().get_blocks("c").is_some());
    }
}
