//! Session pooling: bounded [`Pool`]s of reusable sessions and the
//! [`PoolRegistry`] that maps connect options to them.

#[allow(clippy::module_inception)]
mod pool;
mod registry;

pub use pool::{Pool, PooledSession};
pub use registry::PoolRegistry;
