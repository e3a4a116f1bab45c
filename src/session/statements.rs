//! Prepared statement cache, one per session.
//!
//! Statement ids are assigned by the server per connection, so the cache is
//! scoped to the owning session and flushed whenever the server-side session
//! state is reset (COM_RESET_CONNECTION deallocates prepared statements).

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

/// A statement the server has parsed, keyed by its exact text.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-assigned statement id, valid only on the preparing connection.
    pub statement_id: u32,
    /// The SQL text as sent to the server.
    pub text: String,
    /// Number of parameter placeholders.
    pub num_params: u16,
    /// Number of result columns (0 for statements that return no rows).
    pub num_columns: u16,
}

/// O(1) LRU cache: statement text → prepared statement.
///
/// On insert at capacity the least recently used statement is evicted and
/// its id returned so the caller can close it on the server.
pub struct StatementCache {
    cache: LruCache<String, Arc<PreparedStatement>>,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Change the capacity in place. Shrinking evicts immediately on the
    /// lru side but does not report the evicted ids; only call before the
    /// cache has entries.
    pub fn set_capacity(&mut self, capacity: usize) {
        if let Some(cap) = NonZeroUsize::new(capacity.max(1)) {
            self.cache.resize(cap);
        }
    }

    /// Look up by exact statement text, marking it recently used.
    pub fn get(&mut self, text: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.get(text).map(Arc::clone)
    }

    /// Insert a freshly prepared statement. Returns the id of the statement
    /// evicted to make room, if any.
    pub fn insert(&mut self, statement: PreparedStatement) -> Option<u32> {
        let text = statement.text.clone();
        let will_evict = self.cache.len() >= self.cache.cap().get() && !self.cache.contains(&text);
        let evicted = if will_evict {
            self.cache.peek_lru().map(|(_, stmt)| stmt.statement_id)
        } else {
            None
        };

        self.cache.put(text, Arc::new(statement));
        evicted
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drop everything, returning the ids that were cached. Used when the
    /// server-side session state is reset.
    pub fn clear(&mut self) -> Vec<u32> {
        let ids = self
            .cache
            .iter()
            .map(|(_, stmt)| stmt.statement_id)
            .collect();
        self.cache.clear();
        ids
    }
}
