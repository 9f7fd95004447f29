//! Route primitives: uris, endpoints and endpoint pools.

mod endpoint;
mod pool;
mod uri;

pub use endpoint::{Endpoint, EndpointOpts, Protocol};
pub use pool::{
    EndpointPool, LoadBalancingAlgorithm, PoolCapacity, PoolOpts, PoolPutResult, Selection,
};
pub use uri::RouteUri;
