//! The route registry: a concurrently-accessed longest-prefix table from
//! route keys to endpoint pools.

mod route_registry;
mod trie;

pub use route_registry::{PruneStatus, RegistryOpts, RouteRegistry, ShardingMode};
pub use trie::Trie;
