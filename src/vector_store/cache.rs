use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{StoreSummary, StoredFile, VectorStore, VectorStoreEntry, VectorStoreError};

/// Owners whose listings are kept before the least recently used one is evicted.
pub const DEFAULT_LISTING_CAPACITY: usize = 1_024;

type OwnerKey = (String, String);

struct CachedListing {
    files: Vec<StoredFile>,
    expires_at: Instant,
}

/// Hit and miss counters of a [`FileListingCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingCacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that went to the backend.
    pub misses: u64,
    /// Entries dropped because their TTL had passed.
    pub expirations: u64,
}

/// Bounded LRU cache of per-owner file listings with a write TTL.
pub struct FileListingCache {
    ttl: Duration,
    entries: Mutex<LruCache<OwnerKey, CachedListing>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

impl FileListingCache {
    /// Cache holding up to `capacity` owners, each expiring `ttl` after being written.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn key(agent_id: &str, user_id: &str) -> OwnerKey {
        (agent_id.to_string(), user_id.to_string())
    }

    /// Cached listing, if present and fresh.
    pub async fn get(&self, agent_id: &str, user_id: &str) -> Option<Vec<StoredFile>> {
        let mut entries = self.entries.lock().await;
        let key = Self::key(agent_id, user_id);
        let expired = entries
            .peek(&key)
            .is_some_and(|entry| entry.expires_at <= Instant::now());
        if expired {
            entries.pop(&key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        match entries.get(&key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.files.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remember a listing, evicting the least recently used owner when full.
    pub async fn put(&self, agent_id: &str, user_id: &str, files: Vec<StoredFile>) {
        if self.ttl.is_zero() {
            return;
        }
        let listing = CachedListing {
            files,
            expires_at: Instant::now() + self.ttl,
        };
        let evicted = self
            .entries
            .lock()
            .await
            .push(Self::key(agent_id, user_id), listing);
        if let Some(((agent, user), _)) = evicted
            && (agent != agent_id || user != user_id)
        {
            tracing::trace!(agent_id = %agent, user_id = %user, "Evicted cached listing");
        }
    }

    /// Forget the listing of one owner.
    pub async fn invalidate(&self, agent_id: &str, user_id: &str) {
        self.entries.lock().await.pop(&Self::key(agent_id, user_id));
    }

    /// Owners currently cached, fresh or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Counters since creation.
    pub fn stats(&self) -> ListingCacheStats {
        ListingCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Vector store facade that keeps owner listings cached.
#[derive(Clone)]
pub struct VectorStoreService {
    backend: Arc<dyn VectorStore>,
    cache: Arc<FileListingCache>,
}

impl VectorStoreService {
    /// Wrap `backend` with a listing cache of the given TTL.
    pub fn new(backend: Arc<dyn VectorStore>, listing_ttl: Duration) -> Self {
        Self::with_cache(
            backend,
            FileListingCache::new(listing_ttl, DEFAULT_LISTING_CAPACITY),
        )
    }

    /// Wrap `backend` with an existing listing cache.
    pub fn with_cache(backend: Arc<dyn VectorStore>, cache: FileListingCache) -> Self {
        Self {
            backend,
            cache: Arc::new(cache),
        }
    }

    /// Listing cache counters.
    pub fn cache_stats(&self) -> ListingCacheStats {
        self.cache.stats()
    }

    /// Underlying backend.
    pub fn backend(&self) -> &Arc<dyn VectorStore> {
        &self.backend
    }

    /// List stored files, serving from the cache while fresh.
    pub async fn list_files(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Vec<StoredFile>, VectorStoreError> {
        if let Some(files) = self.cache.get(agent_id, user_id).await {
            tracing::trace!(agent_id, user_id, "File listing served from cache");
            return Ok(files);
        }
        let files = self.backend.list(agent_id, user_id).await?;
        self.cache.put(agent_id, user_id, files.clone()).await;
        Ok(files)
    }

    /// Entries of one document ordered by chunk index.
    pub async fn get_file(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<Vec<VectorStoreEntry>, VectorStoreError> {
        self.backend.get(agent_id, document_id, user_id).await
    }

    /// Delete a document and drop the owner's cached listing.
    pub async fn delete_file(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<usize, VectorStoreError> {
        let result = self.backend.delete(agent_id, document_id, user_id).await;
        self.cache.invalidate(agent_id, user_id).await;
        let removed = result?;
        tracing::info!(agent_id, user_id, document_id, removed, "Document deleted");
        Ok(removed)
    }

    /// Store entries. Listing invalidation is left to the job processor.
    pub async fn store(
        &self,
        agent_id: &str,
        user_id: &str,
        entries: Vec<VectorStoreEntry>,
    ) -> Result<StoreSummary, VectorStoreError> {
        self.backend.store(agent_id, user_id, entries).await
    }

    /// Drop the cached listing of one owner.
    pub async fn invalidate(&self, agent_id: &str, user_id: &str) {
        self.cache.invalidate(agent_id, user_id).await;
    }

    /// Check that the backend is reachable.
    pub async fn health(&self) -> Result<(), VectorStoreError> {
        self.backend.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::InMemoryVectorStore;
    use crate::vector_store::test_support::entries;

    fn service(ttl: Duration) -> VectorStoreService {
        VectorStoreService::new(Arc::new(InMemoryVectorStore::new()), ttl)
    }

    #[tokio::test]
    async fn listing_is_cached_until_invalidated() {
        let service = service(Duration::from_secs(60));
        service.store("a", "u", entries("one", 1, 2)).await.unwrap();
        assert_eq!(service.list_files("a", "u").await.unwrap().len(), 1);

        service.store("a", "u", entries("two", 1, 2)).await.unwrap();
        assert_eq!(service.list_files("a", "u").await.unwrap().len(), 1);

        service.invalidate("a", "u").await;
        assert_eq!(service.list_files("a", "u").await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_listing_expires() {
        let service = service(Duration::from_secs(5));
        service.store("a", "u", entries("one", 1, 2)).await.unwrap();
        service.list_files("a", "u").await.unwrap();
        service.store("a", "u", entries("two", 1, 2)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(service.list_files("a", "u").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn least_recently_used_owner_is_evicted() {
        let service = VectorStoreService::with_cache(
            Arc::new(InMemoryVectorStore::new()),
            FileListingCache::new(Duration::from_secs(60), 2),
        );
        for owner in ["u1", "u2"] {
            service.store("a", owner, entries("one", 1, 2)).await.unwrap();
            service.list_files("a", owner).await.unwrap();
        }
        service.list_files("a", "u1").await.unwrap();
        service.list_files("a", "u3").await.unwrap();
        assert_eq!(service.cache.len().await, 2);

        service.store("a", "u2", entries("two", 1, 2)).await.unwrap();
        assert_eq!(service.list_files("a", "u2").await.unwrap().len(), 2);
        let stats = service.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_listing_is_dropped_from_the_cache() {
        let service = service(Duration::from_secs(5));
        service.list_files("a", "u").await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(service.cache.get("a", "u").await.is_none());
        assert!(service.cache.is_empty().await);
        assert_eq!(service.cache_stats().expirations, 1);
    }

    #[tokio::test]
    async fn delete_invalidates_listing() {
        let service = service(Duration::from_secs(60));
        service.store("a", "u", entries("one", 2, 2)).await.unwrap();
        service.list_files("a", "u").await.unwrap();

        assert_eq!(service.delete_file("a", "one", "u").await.unwrap(), 2);
        assert!(service.list_files("a", "u").await.unwrap().is_empty());
    }
}
