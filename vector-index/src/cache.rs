use std::{
    collections::{HashMap, HashSet},
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, store::StorageManager, types::audit_record::AuditRecord},
};

use crate::{codec, index::VectorIndex};

/// A tenant's resident index plus its persistence bookkeeping.
struct TenantIndexHandle {
    tenant_id: String,
    lock: Arc<RwLock<VectorIndex>>,
    dirty: AtomicBool,
    last_flush: std::sync::Mutex<Instant>,
}

struct CacheEntry {
    handle: Arc<TenantIndexHandle>,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

/// Bounded LRU of loaded tenant indexes.
///
/// Readers share the index through an owned read guard; a writer excludes
/// everyone and marks the index dirty. Dirty indexes are persisted by the
/// background flusher (at most once per flush interval per tenant), on
/// eviction, and on shutdown. A blob that fails its checksum after a retry
/// quarantines the tenant: queries observe `Unavailable` and an
/// operator-visible audit row is written, never a silent rebuild.
pub struct IndexCache {
    storage: StorageManager,
    db: Arc<SurrealDbClient>,
    dimension: usize,
    capacity: usize,
    flush_interval: Duration,
    inner: Mutex<CacheInner>,
    quarantined: std::sync::Mutex<HashSet<String>>,
}

/// Write access to a tenant index. Acquiring it marks the index dirty.
pub struct IndexWriteGuard {
    guard: OwnedRwLockWriteGuard<VectorIndex>,
}

impl Deref for IndexWriteGuard {
    type Target = VectorIndex;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for IndexWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

fn blob_path(tenant_id: &str) -> String {
    format!("indexes/{tenant_id}/index.bin")
}

fn sidecar_path(tenant_id: &str) -> String {
    format!("indexes/{tenant_id}/slots.map")
}

impl IndexCache {
    pub fn new(
        storage: StorageManager,
        db: Arc<SurrealDbClient>,
        dimension: usize,
        capacity: usize,
        flush_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            db,
            dimension,
            capacity: capacity.max(1),
            flush_interval,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            quarantined: std::sync::Mutex::new(HashSet::new()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn resident_count(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub fn is_quarantined(&self, tenant_id: &str) -> bool {
        self.quarantined
            .lock()
            .map(|set| set.contains(tenant_id))
            .unwrap_or(false)
    }

    /// Shared read access for searches.
    pub async fn read(
        &self,
        tenant_id: &str,
    ) -> Result<OwnedRwLockReadGuard<VectorIndex>, AppError> {
        let handle = self.handle_for(tenant_id).await?;
        Ok(Arc::clone(&handle.lock).read_owned().await)
    }

    /// Exclusive write access for ingestion and deletion. Writers always
    /// mark the index dirty.
    pub async fn write(&self, tenant_id: &str) -> Result<IndexWriteGuard, AppError> {
        let handle = self.handle_for(tenant_id).await?;
        let guard = Arc::clone(&handle.lock).write_owned().await;
        handle.dirty.store(true, Ordering::SeqCst);
        Ok(IndexWriteGuard { guard })
    }

    async fn handle_for(&self, tenant_id: &str) -> Result<Arc<TenantIndexHandle>, AppError> {
        if self.is_quarantined(tenant_id) {
            return Err(AppError::Unavailable(format!(
                "index for tenant {tenant_id} is quarantined"
            )));
        }

        {
            let mut inner = self.inner.lock().await;
            inner.tick += 1;
            let tick = inner.tick;
            if let Some(entry) = inner.entries.get_mut(tenant_id) {
                entry.last_used = tick;
                return Ok(Arc::clone(&entry.handle));
            }
        }

        // Load outside the registry lock; a racing loader just wins the insert.
        let index = self.load_index(tenant_id).await?;
        let handle = Arc::new(TenantIndexHandle {
            tenant_id: tenant_id.to_owned(),
            lock: Arc::new(RwLock::new(index)),
            dirty: AtomicBool::new(false),
            last_flush: std::sync::Mutex::new(Instant::now()),
        });

        let mut inner = self.inner.lock().await;
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner
            .entries
            .entry(tenant_id.to_owned())
            .or_insert_with(|| CacheEntry {
                handle: Arc::clone(&handle),
                last_used: tick,
            });
        entry.last_used = tick;
        let resolved = Arc::clone(&entry.handle);

        let mut evicted = Vec::new();
        while inner.entries.len() > self.capacity {
            let victim = inner
                .entries
                .iter()
                .filter(|(id, _)| id.as_str() != tenant_id)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    if let Some(entry) = inner.entries.remove(&id) {
                        evicted.push(entry.handle);
                    }
                }
                None => break,
            }
        }
        drop(inner);

        // Dirty victims persist before their memory is released.
        for victim in &evicted {
            self.persist_handle(victim).await;
        }

        Ok(resolved)
    }

    async fn load_index(&self, tenant_id: &str) -> Result<VectorIndex, AppError> {
        match self.try_load(tenant_id).await {
            Ok(index) => Ok(index),
            Err(AppError::Unavailable(first)) => {
                // A torn pair can be a concurrent publish; one retry settles it.
                warn!(%tenant_id, detail = %first, "index pair inconsistent, retrying load");
                match self.try_load(tenant_id).await {
                    Ok(index) => Ok(index),
                    Err(AppError::Unavailable(detail)) => {
                        self.quarantine(tenant_id, &detail).await;
                        Err(AppError::Unavailable(detail))
                    }
                    Err(other) => Err(other),
                }
            }
            Err(other) => Err(other),
        }
    }

    async fn try_load(&self, tenant_id: &str) -> Result<VectorIndex, AppError> {
        let blob = self.storage.get_opt(&blob_path(tenant_id)).await?;
        let sidecar = self.storage.get_opt(&sidecar_path(tenant_id)).await?;

        match (blob, sidecar) {
            // Created lazily on first write.
            (None, None) => Ok(VectorIndex::new(self.dimension)),
            (Some(blob), Some(sidecar_bytes)) => {
                let sidecar = codec::decode_sidecar(&sidecar_bytes)?;
                codec::assemble(&blob, &sidecar)
            }
            _ => Err(AppError::Unavailable(
                "vector index pair is incomplete".into(),
            )),
        }
    }

    async fn quarantine(&self, tenant_id: &str, detail: &str) {
        error!(%tenant_id, detail, "quarantining vector index");
        if let Ok(mut set) = self.quarantined.lock() {
            set.insert(tenant_id.to_owned());
        }
        let record = AuditRecord::index_quarantined(tenant_id.to_owned(), detail.to_owned());
        if let Err(err) = record.append(&self.db).await {
            error!(%tenant_id, error = %err, "failed to write quarantine audit record");
        }
    }

    /// Persists one tenant's pair now, regardless of the flush interval.
    pub async fn persist_tenant(&self, tenant_id: &str) -> Result<(), AppError> {
        let handle = {
            let inner = self.inner.lock().await;
            inner.entries.get(tenant_id).map(|e| Arc::clone(&e.handle))
        };
        if let Some(handle) = handle {
            self.persist_pair(&handle).await?;
        }
        Ok(())
    }

    /// Best-effort persist used on eviction and by the flusher; failures
    /// leave the index dirty so the next cycle retries.
    async fn persist_handle(&self, handle: &Arc<TenantIndexHandle>) {
        if !handle.dirty.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.persist_pair(handle).await {
            warn!(
                tenant_id = %handle.tenant_id,
                error = %err,
                "index persist failed, keeping dirty"
            );
        }
    }

    async fn persist_pair(&self, handle: &Arc<TenantIndexHandle>) -> Result<(), AppError> {
        let guard = Arc::clone(&handle.lock).read_owned().await;
        let (blob, digest) = codec::encode_blob(&guard);
        let sidecar = codec::encode_sidecar(&guard, &digest)?;
        drop(guard);

        // Blob first, sidecar second; readers verify the digest pair and
        // retry across a torn publish.
        self.storage
            .put_atomic(&blob_path(&handle.tenant_id), blob)
            .await?;
        self.storage
            .put_atomic(&sidecar_path(&handle.tenant_id), sidecar)
            .await?;

        handle.dirty.store(false, Ordering::SeqCst);
        if let Ok(mut last) = handle.last_flush.lock() {
            *last = Instant::now();
        }
        Ok(())
    }

    /// One flusher pass. With `force`, the per-tenant flush interval is
    /// ignored; used on shutdown.
    pub async fn flush_dirty(&self, force: bool) {
        let handles: Vec<Arc<TenantIndexHandle>> = {
            let inner = self.inner.lock().await;
            inner
                .entries
                .values()
                .map(|e| Arc::clone(&e.handle))
                .collect()
        };

        for handle in handles {
            if !handle.dirty.load(Ordering::SeqCst) {
                continue;
            }
            let due = force
                || handle
                    .last_flush
                    .lock()
                    .map(|last| last.elapsed() >= self.flush_interval)
                    .unwrap_or(true);
            if due {
                self.persist_handle(&handle).await;
            }
        }
    }

    /// Periodic persist loop; aborted on shutdown after a final forced flush.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(cache.flush_interval).await;
                cache.flush_dirty(false).await;
            }
        })
    }

    /// Tenant-wide purge: drops the resident index and deletes the
    /// persisted pair. The only way a tenant's vector index is destroyed.
    pub async fn purge(&self, tenant_id: &str) -> Result<(), AppError> {
        {
            let mut inner = self.inner.lock().await;
            inner.entries.remove(tenant_id);
        }
        if let Ok(mut set) = self.quarantined.lock() {
            set.remove(tenant_id);
        }
        self.storage
            .delete_prefix(&format!("indexes/{tenant_id}/"))
            .await?;
        info!(%tenant_id, "purged vector index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::storage::store::testing::memory_storage;
    use uuid::Uuid;

    async fn test_cache(capacity: usize) -> (Arc<IndexCache>, StorageManager) {
        let storage = memory_storage();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        let cache = IndexCache::new(
            storage.clone(),
            db,
            3,
            capacity,
            Duration::from_millis(10),
        );
        (cache, storage)
    }

    async fn insert_vector(cache: &IndexCache, tenant: &str, chunk_id: &str, v: [f32; 3]) -> u64 {
        let mut guard = cache.write(tenant).await.expect("write access");
        guard
            .upsert(&[v.to_vec()], &[chunk_id.to_owned()])
            .expect("upsert")[0]
    }

    #[tokio::test]
    async fn missing_index_loads_as_empty() {
        let (cache, _storage) = test_cache(2).await;
        let guard = cache.read("t1").await.expect("read access");
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn writes_survive_eviction_and_reload() {
        let (cache, _storage) = test_cache(1).await;

        insert_vector(&cache, "t1", "c1", [1.0, 0.0, 0.0]).await;
        // Loading a second tenant evicts t1, persisting the dirty index.
        insert_vector(&cache, "t2", "c2", [0.0, 1.0, 0.0]).await;
        assert_eq!(cache.resident_count().await, 1);

        let guard = cache.read("t1").await.expect("reload t1");
        let hits = guard.search(&[1.0, 0.0, 0.0], 1).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn flush_dirty_persists_pair() {
        let (cache, storage) = test_cache(2).await;
        insert_vector(&cache, "t1", "c1", [1.0, 0.0, 0.0]).await;

        cache.flush_dirty(true).await;

        assert!(storage
            .exists("indexes/t1/index.bin")
            .await
            .expect("exists"));
        assert!(storage
            .exists("indexes/t1/slots.map")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn corrupt_blob_quarantines_tenant_and_audits() {
        let (cache, storage) = test_cache(2).await;
        insert_vector(&cache, "t1", "c1", [1.0, 0.0, 0.0]).await;
        cache.flush_dirty(true).await;

        // Evict the resident copy, then corrupt the persisted blob.
        insert_vector(&cache, "t2", "c2", [0.0, 1.0, 0.0]).await;
        insert_vector(&cache, "t3", "c3", [0.0, 0.0, 1.0]).await;
        storage
            .put("indexes/t1/index.bin", Bytes::from_static(b"garbage"))
            .await
            .expect("overwrite blob");
        {
            let mut inner = cache.inner.lock().await;
            inner.entries.remove("t1");
        }

        let result = cache.read("t1").await;
        assert!(matches!(result, Err(AppError::Unavailable(_))));
        assert!(cache.is_quarantined("t1"));

        let records = AuditRecord::list_for_tenant(&cache.db, "t1")
            .await
            .expect("audit rows");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "index.quarantined");

        // Subsequent access fails fast, still quarantined.
        assert!(matches!(
            cache.read("t1").await,
            Err(AppError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn purge_clears_quarantine_and_persisted_pair() {
        let (cache, storage) = test_cache(2).await;
        insert_vector(&cache, "t1", "c1", [1.0, 0.0, 0.0]).await;
        cache.flush_dirty(true).await;

        cache.purge("t1").await.expect("purge");

        assert!(!storage
            .exists("indexes/t1/index.bin")
            .await
            .expect("exists"));
        let guard = cache.read("t1").await.expect("read after purge");
        assert!(guard.is_empty());
    }

    #[tokio::test]
    async fn concurrent_readers_share_access() {
        let (cache, _storage) = test_cache(2).await;
        insert_vector(&cache, "t1", "c1", [1.0, 0.0, 0.0]).await;

        let first = cache.read("t1").await.expect("first reader");
        let second = cache.read("t1").await.expect("second reader");
        assert_eq!(first.live_count(), 1);
        assert_eq!(second.live_count(), 1);
    }
}
