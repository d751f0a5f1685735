use std::collections::HashMap;
use std::sync::RwLock;

use super::{CacheBackend, CacheError};
use crate::data_source::BoxFuture;

/// Process-local backend; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>> {
        let value = self
            .entries
            .read()
            .expect("memory cache lock poisoned")
            .get(key)
            .cloned();
        Box::pin(async move { Ok(value) })
    }

    fn store<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), CacheError>> {
        self.entries
            .write()
            .expect("memory cache lock poisoned")
            .insert(key.to_owned(), value);
        Box::pin(async { Ok(()) })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        let removed = self
            .entries
            .write()
            .expect("memory cache lock poisoned")
            .remove(key)
            .is_some();
        Box::pin(async move { Ok(removed) })
    }

    fn keys<'a>(&'a self) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
        let keys = self
            .entries
            .read()
            .expect("memory cache lock poisoned")
            .keys()
            .cloned()
            .collect();
        Box::pin(async move { Ok(keys) })
    }

    fn clear<'a>(&'a self) -> BoxFuture<'a, Result<(), CacheError>> {
        self.entries
            .write()
            .expect("memory cache lock poisoned")
            .clear();
        Box::pin(async { Ok(()) })
    }
}
