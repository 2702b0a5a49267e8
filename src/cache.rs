//! Injected key/value cache contract.
//!
//! The compiler stores serialized parse trees in any store meeting this
//! two-method contract. Both methods may fail; the core always swallows
//! the error and proceeds without caching.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::CacheError;

pub trait ShelfCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set(&self, key: &str, value: String) -> Result<(), CacheError>;
}

/// Cache that stores nothing. The whole core works with this installed.
#[derive(Debug, Default)]
pub struct NoopCache;

impl ShelfCache for NoopCache {
    fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: String) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Simple in-process cache, mostly useful in tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ShelfCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self
            .entries
            .lock()
            .map_err(|e| CacheError(e.to_string()))?
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.entries
            .lock()
            .map_err(|e| CacheError(e.to_string()))?
            .insert(key.to_string(), value);
        Ok(())
    }
}
