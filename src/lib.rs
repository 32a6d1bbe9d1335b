//! kv-swarm: KV-cache memory management and context distribution for
//! LLM inference swarms.
//!
//! Two layers:
//!   - [`cache`]: a single node's block pool, prefix cache and
//!     per-attention-topology allocation
//!   - [`swarm`]: long contexts sharded across ranks, with failover,
//!     precision scaling, prefetching, migration and load balancing
//!
//! [`node::SwarmNode`] wires both together; [`server`] exposes it over HTTP.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod node;
pub mod server;
pub mod swarm;
