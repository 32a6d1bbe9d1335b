//! Layer-aware coordinator: counts allocations per model layer and
//! otherwise behaves exactly like the base coordinator.

use crate::cache::block::BlockId;
use crate::cache::coordinator::{CoordinatorError, KvCacheCoordinator};

pub struct HierarchicalCoordinator {
    inner: KvCacheCoordinator,
    layer_allocations: Vec<u64>,
}

impl HierarchicalCoordinator {
    pub fn new(inner: KvCacheCoordinator, num_layers: usize) -> Self {
        Self {
            inner,
            layer_allocations: vec![0; num_layers],
        }
    }

    /// Allocate on behalf of `layer`.
    pub fn allocate_for_layer(
        &mut self,
        layer: usize,
        request: &str,
        tokens: usize,
    ) -> Result<Vec<Vec<BlockId>>, CoordinatorError> {
        let num_layers = self.layer_allocations.len();
        if layer >= num_layers {
            return Err(CoordinatorError::LayerOutOfRange { layer, num_layers });
        }
        let blocks = self.inner.allocate(request, tokens)?;
        self.layer_allocations[layer] += 1;
        Ok(blocks)
    }

    /// Successful allocations per layer.
    pub fn layer_allocations(&self) -> &[u64] {
        &self.layer_allocations
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

    fn hierarchical(num_blocks: usize) -> HierarchicalCoordinator {
        let pool = new_shared_pool(&PoolConfig {
            num_blocks,
            ..Default::default()
        });
        let inner = KvCacheCoordinator::new(pool, vec![CacheGroupSpec::full(0, 4)]).unwrap();
        HierarchicalCoordinator::new(inner, 2)
    }

    #[test]
    fn test_counts_per_layer() {
        let mut coord = hierarchical(8);
        coord.allocate_for_layer(0, "a", 4).unwrap();
        coord.allocate_for_layer(1, "b", 4).unwrap();
        coord.allocate_for_layer(1, "b", 8).unwrap();
        assert_eq!(coord.layer_allocations(), &[1, 2]);
        assert_eq!(coord.inner().get_blocks("b").unwrap()[0].len(), 2);
    }

    #[test]
    fn test_failed_allocation_not_counted() {
        let mut coord = hierarchical(1);
        assert!(coord.allocate_for_layer(0, "a", 8).is_err());
        assert_eq!(coord.layer_allocations(), &[0, 0]);
        assert_eq!(
            coord.allocate_for_layer(5, "a", 1).unwrap_err(),
            CoordinatorError::LayerOutOfRange {
                layer: 5,
                num_layers: 2
            }
        );
    }
}
