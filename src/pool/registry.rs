//! Pool registry: one pool per distinct set of connect options.
//!
//! The registry is an explicit object owned by the embedding application,
//! so its lifetime (and that of every pool it holds) is the caller's to
//! manage.

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::{ConnectOptions, PoolOptions};

use super::Pool;

/// Maps normalized connect-option keys to their pools.
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, Pool>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    /// Fetch the pool for `connect`, creating it on first use. Two option
    /// sets that normalize to the same key share one pool; `pool_options`
    /// only takes effect for the call that creates the pool.
    pub fn get_or_create(&self, connect: &ConnectOptions, pool_options: &PoolOptions) -> Pool {
        let key = connect.pool_key();
        self.pools
            .entry(key.clone())
            .or_insert_with(|| {
                info!(pool_key = %key, "creating pool");
                Pool::new(connect.clone(), pool_options.clone())
            })
            .clone()
    }

    /// The pool for `connect`, if one exists.
    pub fn get(&self, connect: &ConnectOptions) -> Option<Pool> {
        self.pools.get(&connect.pool_key()).map(|p| p.clone())
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Invalidate every session in every pool. The pools stay usable and
    /// reconnect on demand.
    pub fn clear_all(&self) {
        for entry in self.pools.iter() {
            debug!(pool_key = %entry.key(), "clearing pool");
            entry.value().clear();
        }
    }

    /// Close and drop every pool. Outstanding leases finish but are not
    /// returned anywhere.
    pub fn shutdown(&self) {
        self.pools.retain(|key, pool| {
            debug!(pool_key = %key, "closing pool");
            pool.close();
            false
        });
    }
}
