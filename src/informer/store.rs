//! Typed local cache of one resource kind

use std::sync::Arc;

use dashmap::DashMap;

use crate::ReconcileKey;

/// Eventually consistent mirror of the objects of one kind
///
/// Readers get shared `Arc`s and never block the informer for longer than
/// a shard lock. The cache can lag the API server, so writes based on a
/// cached object must carry its resourceVersion and handle conflicts.
pub struct Store<K> {
    objects: Arc<DashMap<ReconcileKey, Arc<K>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
        }
    }
}

impl<K> Store<K> {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an object by key
    pub fn get(&self, key: &ReconcileKey) -> Option<Arc<K>> {
        self.objects.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a namespaced object
    pub fn get_namespaced(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get(&ReconcileKey::new(namespace, name))
    }

    /// All cached objects, in no particular order
    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// All cached objects in `namespace`
    pub fn list_namespaced(&self, namespace: &str) -> Vec<Arc<K>> {
        self.objects
            .iter()
            .filter(|entry| entry.key().namespace() == Some(namespace))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// All cached keys
    pub fn keys(&self) -> Vec<ReconcileKey> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Insert or replace an object, returning the previous copy
    ///
    /// Only the informer feeding this store should write to it.
    pub fn insert(&self, key: ReconcileKey, obj: Arc<K>) -> Option<Arc<K>> {
        self.objects.insert(key, obj)
    }

    /// Remove an object, returning the cached copy
    ///
    /// Only the informer feeding this store should write to it.
    pub fn remove(&self, key: &ReconcileKey) -> Option<Arc<K>> {
        self.objects.remove(key).map(|(_, obj)| obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let store: Store<&str> = Store::new();
        let key = ReconcileKey::new("default", "app1");

        assert!(store.insert(key.clone(), Arc::new("v1")).is_none());
        let previous = store.insert(key.clone(), Arc::new("v2")).unwrap();
        assert_eq!(*previous, "v1");
        assert_eq!(*store.get_namespaced("default", "app1").unwrap(), "v2");

        assert_eq!(*store.remove(&key).unwrap(), "v2");
        assert!(store.get(&key).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn clones_share_contents() {
        let store: Store<u32> = Store::new();
        let reader = store.clone();
        store.insert(ReconcileKey::new("default", "a"), Arc::new(1));
        store.insert(ReconcileKey::new("other", "b"), Arc::new(2));

        assert_eq!(reader.len(), 2);
        assert_eq!(reader.list_namespaced("other").len(), 1);
        assert_eq!(reader.list().len(), 2);
        assert_eq!(reader.keys().len(), 2);
    }
}
