//! In-memory object cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::error::BoxError;

use super::ObjectCache;

/// A `HashMap` behind a lock plus a synced flag.
#[derive(Debug)]
pub struct MemoryCache<O> {
    objects: RwLock<HashMap<String, O>>,
    synced: AtomicBool,
}

impl<O> Default for MemoryCache<O> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
        }
    }
}

impl<O: Clone> MemoryCache<O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that already reports itself synced.
    pub fn synced() -> Self {
        let cache = Self::default();
        cache.mark_synced();
        cache
    }

    /// Store `object`, returning the previous one.
    pub fn insert(&self, key: impl Into<String>, object: O) -> Option<O> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), object)
    }

    pub fn remove(&self, key: &str) -> Option<O> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn get(&self, key: &str) -> Option<O> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}

impl<O> ObjectCache for MemoryCache<O>
where
    O: Clone + Send + Sync + 'static,
{
    type Object = O;

    fn get_by_key(&self, key: &str) -> Result<Option<O>, BoxError> {
        Ok(self.get(key))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reports_previous_object() {
        let cache = MemoryCache::new();
        assert!(cache.insert("a", 1).is_none());
        assert_eq!(cache.insert("a", 2), Some(1));
        assert_eq!(cache.get_by_key("a").unwrap(), Some(2));
        assert_eq!(cache.remove("a"), Some(2));
        assert!(cache.get_by_key("a").unwrap().is_none());
    }

    #[test]
    fn synced_flag_starts_false() {
        let cache: MemoryCache<u8> = MemoryCache::new();
        assert!(!cache.has_synced());
        cache.mark_synced();
        assert!(cache.has_synced());
        assert!(MemoryCache::<u8>::synced().has_synced());
    }
}
