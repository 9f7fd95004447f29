//! The proxying engine.
//!
//! Translates an incoming request into a pool of candidate endpoints (or
//! a precise error response), selects and dials endpoints with
//! connect-time retry, and assembles the access record.

mod gateway;
mod headers;
mod lookup;

pub use gateway::{RouterCtx, RouterProxy};
pub use lookup::{LookupHandler, LookupOutcome};
