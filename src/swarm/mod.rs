//! Distributed context sharding across ranks.
//!
//! - [`shard`]: shard records, precision levels, field updates
//! - [`manager`]: the shard registry, routing and failover
//! - [`compressor`]: idle eviction and pressure-driven precision scaling
//! - [`prefetcher`]: sequential-access shard warming
//! - [`transport`]: peer transport, sealing and broadcast
//! - [`migration`]: atomic shard moves between ranks
//! - [`telemetry`], [`balancer`]: load signals and rebalancing
//! - [`tasks`]: periodic background cycles

pub mod balancer;
pub mod compressor;
pub mod manager;
pub mod migration;
pub mod prefetcher;
pub mod shard;
pub mod tasks;
pub mod telemetry;
pub mod transport;
