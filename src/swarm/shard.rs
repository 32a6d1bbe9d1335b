//! Context shard types.
//!
//! A shard is a token-range slice of a long context, owned by one rank and
//! optionally mirrored on replica ranks. Shards are the unit of migration,
//! precision scaling and eviction.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a compute rank in the cluster.
pub type RankId = u32;

/// The storage precision of a shard's cached representation.
///
/// Variants are declared finest first, so `Full < Half < Quarter < Eighth`
/// in the derived ordering: a *greater* level is a *coarser* one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionLevel {
    /// 16-bit, native format.
    Full,
    /// 8-bit.
    Half,
    /// 4-bit.
    Quarter,
    /// 2-bit.
    Eighth,
}

impl PrecisionLevel {
    /// Bits per element.
    pub fn bits(&self) -> u8 {
        match self {
            PrecisionLevel::Full => 16,
            PrecisionLevel::Half => 8,
            PrecisionLevel::Quarter => 4,
            PrecisionLevel::Eighth => 2,
        }
    }

    /// The next coarser level, or None if already coarsest.
    pub fn coarser(&self) -> Option<PrecisionLevel> {
        match self {
            PrecisionLevel::Full => Some(PrecisionLevel::Half),
            PrecisionLevel::Half => Some(PrecisionLevel::Quarter),
            PrecisionLevel::Quarter => Some(PrecisionLevel::Eighth),
            PrecisionLevel::Eighth => None,
        }
    }

    /// The next finer level, or None if already full precision.
    pub fn finer(&self) -> Option<PrecisionLevel> {
        match self {
            PrecisionLevel::Full => None,
            PrecisionLevel::Half => Some(PrecisionLevel::Full),
            PrecisionLevel::Quarter => Some(PrecisionLevel::Half),
            PrecisionLevel::Eighth => Some(PrecisionLevel::Quarter),
        }
    }
}

impl std::fmt::Display for PrecisionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrecisionLevel::Full => write!(f, "FP16"),
            PrecisionLevel::Half => write!(f, "INT8"),
            PrecisionLevel::Quarter => write!(f, "INT4"),
            PrecisionLevel::Eighth => write!(f, "INT2"),
        }
    }
}

/// A slice of a long context.
#[derive(Debug, Clone)]
pub struct ContextShard {
    pub shard_id: Uuid,

    /// Position of this shard within its context.
    pub index: usize,

    pub tenant_id: String,

    /// First token (inclusive), already backdated by `overlap_size`.
    pub start_token: usize,

    /// One past the last token.
    pub end_token: usize,

    /// Rank that serves this shard.
    pub rank_id: RankId,

    /// Ranks holding mirrored copies, in failover order.
    pub replica_ranks: Vec<RankId>,

    /// Tokens shared with the previous shard.
    pub overlap_size: usize,

    /// Whether the shard's KV state is resident.
    pub is_cached: bool,

    pub precision: PrecisionLevel,

    pub last_access: Instant,
}

/// The field-level mutations a shard accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardUpdate {
    /// Move ownership to another rank.
    Rank(RankId),
    /// Change storage precision.
    Precision(PrecisionLevel),
    /// Mark resident or evicted.
    Cached(bool),
    /// Record an access.
    Touch(Instant),
}

impl ContextShard {
    /// Whether `token` falls in `[start_token, end_token)`.
    pub fn contains_token(&self, token: usize) -> bool {
        (self.start_token..self.end_token).contains(&token)
    }

    pub fn len_tokens(&self) -> usize {
        self.end_token - self.start_token
    }

    /// Apply one update. Returns whether the shard changed.
    pub fn apply(&mut self, update: ShardUpdate) -> bool {
        match update {
            ShardUpdate::Rank(rank) => {
                let changed = self.rank_id != rank;
                self.rank_id = rank;
                changed
            }
            ShardUpdate::Precision(precision) => {
                let changed = self.precision != precision;
                self.precision = precision;
                changed
            }
            ShardUpdate::Cached(cached) => {
                let changed = self.is_cached != cached;
                self.is_cached = cached;
                changed
            }
            ShardUpdate::Touch(at) => {
                self.last_access = at;
                true
            }
        }
    }

    /// Serializable view, without the process-local timestamp.
    pub fn descriptor(&self) -> ShardDescriptor {
        ShardDescriptor {
            shard_id: self.shard_id,
            index: self.index,
            tenant_id: self.tenant_id.clone(),
            start_token: self.start_token,
            end_token: self.end_token,
            rank_id: self.rank_id,
            replica_ranks: self.replica_ranks.clone(),
            overlap_size: self.overlap_size,
            is_cached: self.is_cached,
            precision: self.precision,
        }
    }
}

/// Wire/API form of a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: Uuid,
    pub index: usize,
    pub tenant_id: String,
    pub start_token: usize,
    pub end_token: usize,
    pub rank_id: RankId,
    pub replica_ranks: Vec<RankId>,
    pub overlap_size: usize,
    pub is_cached: bool,
    pub precision: PrecisionLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ContextShard {
        ContextShard {
            shard_id: Uuid::new_v4(),
            index: 1,
            tenant_id: "t".to_string(),
            start_token: 80,
            end_token: 200,
            rank_id: 1,
            replica_ranks: vec![],
            overlap_size: 20,
            is_cached: true,
            precision: PrecisionLevel::Full,
            last_access: Instant::now(),
        }
    }

    #[test]
    fn test_precision_ordering() {
        assert!(PrecisionLevel::Full < PrecisionLevel::Half);
        assert!(PrecisionLevel::Quarter < PrecisionLevel::Eighth);
        assert_eq!(PrecisionLevel::Full.coarser(), Some(PrecisionLevel::Half));
        assert_eq!(PrecisionLevel::Eighth.coarser(), None);
        assert_eq!(PrecisionLevel::Full.finer(), None);
        assert_eq!(PrecisionLevel::Eighth.bits(), 2);
    }

    #[test]
    fn test_half_open_interval() {
        let s = shard();
        assert!(!s.contains_token(79));
        assert!(s.contains_token(80));
        assert!(s.contains_token(199));
        assert!(!s.contains_token(200));
        assert_eq!(s.len_tokens(), 120);
    }

    #[test]
    fn test_apply_reports_change() {
        let mut s = shard();
        assert!(!s.apply(ShardUpdate::Rank(1)));
        assert!(s.apply(ShardUpdate::Rank(2)));
        assert!(s.apply(ShardUpdate::Precision(PrecisionLevel::Quarter)));
        assert!(!s.apply(ShardUpdate::Precision(PrecisionLevel::Quarter)));
        assert!(s.apply(ShardUpdate::Cached(false)));
        assert_eq!(s.rank_id, 2);
        assert!(!s.is_cached);
    }
}
