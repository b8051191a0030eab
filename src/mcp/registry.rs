//! Shared storage for capability registries and their client-side mirrors.

use indexmap::IndexMap;
use parking_lot::RwLock as SyncRwLock;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Entry stored in a catalog, addressed by a unique key (name or URI)
pub trait CatalogEntry: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;
}

struct Registration<E, H: ?Sized> {
    entry: E,
    handler: Arc<H>,
}

/// Server-side catalog: entries plus their handlers behind one lock.
///
/// Reads hand out clones; the live entries never leave the lock. Listing
/// order is first-registration order.
pub struct Catalog<E, H: ?Sized> {
    entries: RwLock<IndexMap<String, Registration<E, H>>>,
}

impl<E: CatalogEntry, H: ?Sized + Send + Sync> Catalog<E, H> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// Insert or overwrite; returns `true` when an existing entry was replaced
    pub async fn insert(&self, entry: E, handler: Arc<H>) -> bool {
        let key = entry.key().to_string();
        let mut entries = self.entries.write().await;
        entries
            .insert(key, Registration { entry, handler })
            .is_some()
    }

    pub async fn remove(&self, key: &str) -> Option<E> {
        let mut entries = self.entries.write().await;
        entries.shift_remove(key).map(|r| r.entry)
    }

    pub async fn get(&self, key: &str) -> Option<E> {
        self.entries.read().await.get(key).map(|r| r.entry.clone())
    }

    pub async fn list(&self) -> Vec<E> {
        self.entries
            .read()
            .await
            .values()
            .map(|r| r.entry.clone())
            .collect()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Fetch entry and handler; the read lock is released before this returns
    pub async fn resolve(&self, key: &str) -> Option<(E, Arc<H>)> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|r| (r.entry.clone(), Arc::clone(&r.handler)))
    }
}

impl<E: CatalogEntry, H: ?Sized + Send + Sync> Default for Catalog<E, H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side snapshot of a peer's catalog.
///
/// Every `replace` swaps the whole map, so readers see one server listing or
/// the next, never a mix.
pub struct CatalogMirror<E> {
    snapshot: SyncRwLock<Option<Arc<IndexMap<String, E>>>>,
}

impl<E: CatalogEntry> CatalogMirror<E> {
    pub fn new() -> Self {
        Self {
            snapshot: SyncRwLock::new(None),
        }
    }

    pub fn replace(&self, entries: Vec<E>) {
        let map: IndexMap<String, E> = entries
            .into_iter()
            .map(|e| (e.key().to_string(), e))
            .collect();
        *self.snapshot.write() = Some(Arc::new(map));
    }

    pub fn clear(&self) {
        *self.snapshot.write() = None;
    }

    /// Whether a listing has been cached since the last clear
    pub fn is_populated(&self) -> bool {
        self.snapshot.read().is_some()
    }

    pub fn get(&self, key: &str) -> Option<E> {
        self.snapshot
            .read()
            .as_ref()
            .and_then(|map| map.get(key).cloned())
    }

    pub fn list(&self) -> Vec<E> {
        self.snapshot
            .read()
            .as_ref()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl<E: CatalogEntry> Default for CatalogMirror<E> {
    fn default() -> Self {
        Self::new()
    }
}
