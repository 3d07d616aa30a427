use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::warn;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::response_cache_entry::ResponseCacheEntry},
};

use crate::{confidence::Confidence, SourceRef, PIPELINE_VERSION};

const SHARD_COUNT: usize = 8;

/// The cacheable part of a query outcome. Latency and hit status are
/// per-request and added by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence: Confidence,
    pub suggestions: Vec<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

struct StoredEntry {
    value: CachedAnswer,
    tenant_id: String,
    epoch: u64,
    created: Instant,
    ttl: Duration,
}

/// Fingerprint-keyed response cache with per-key single-flight builds and
/// O(1) tenant invalidation through a monotonic epoch counter.
///
/// The table is sharded to avoid one global lock; in-flight builds live in
/// a separate keyed-mutex map. Errors are never cached.
pub struct ResponseCache {
    shards: Vec<Mutex<HashMap<String, StoredEntry>>>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    epochs: std::sync::Mutex<HashMap<String, u64>>,
    default_ttl: Duration,
    tenant_ttls: std::sync::Mutex<HashMap<String, Duration>>,
    persist: Option<Arc<SurrealDbClient>>,
}

/// Pure fingerprint over tenant, normalized question, document scope and
/// pipeline version.
pub fn fingerprint(tenant_id: &str, normalized_question: &str, doc_scope: &[String]) -> String {
    let mut sorted_scope: Vec<&str> = doc_scope.iter().map(String::as_str).collect();
    sorted_scope.sort_unstable();
    sorted_scope.dedup();

    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0]);
    hasher.update(normalized_question.as_bytes());
    hasher.update([0]);
    for doc_id in sorted_scope {
        hasher.update(doc_id.as_bytes());
        hasher.update([1]);
    }
    hasher.update(PIPELINE_VERSION.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResponseCache {
    pub fn new(default_ttl: Duration, persist: Option<Arc<SurrealDbClient>>) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            flights: Mutex::new(HashMap::new()),
            epochs: std::sync::Mutex::new(HashMap::new()),
            default_ttl,
            tenant_ttls: std::sync::Mutex::new(HashMap::new()),
            persist,
        }
    }

    /// Overrides the entry TTL for one tenant; entries capture the TTL in
    /// force when they are created.
    pub fn set_tenant_ttl(&self, tenant_id: &str, ttl: Duration) {
        if let Ok(mut ttls) = self.tenant_ttls.lock() {
            ttls.insert(tenant_id.to_owned(), ttl);
        }
    }

    fn ttl_for(&self, tenant_id: &str) -> Duration {
        self.tenant_ttls
            .lock()
            .ok()
            .and_then(|ttls| ttls.get(tenant_id).copied())
            .unwrap_or(self.default_ttl)
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, StoredEntry>> {
        let bucket = key
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        &self.shards[bucket % SHARD_COUNT]
    }

    pub fn tenant_epoch(&self, tenant_id: &str) -> u64 {
        self.epochs
            .lock()
            .map(|epochs| epochs.get(tenant_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// O(1) invalidation of every cached entry for the tenant. Called after
    /// an ingest or delete publishes, so entries served afterwards either
    /// predate the change (and die here) or were built against it.
    pub fn bump_tenant(&self, tenant_id: &str) {
        if let Ok(mut epochs) = self.epochs.lock() {
            *epochs.entry(tenant_id.to_owned()).or_insert(0) += 1;
        }
    }

    /// Returns the entry only while unexpired and current for its tenant
    /// epoch.
    pub async fn get(&self, key: &str) -> Option<CachedAnswer> {
        let mut shard = self.shard_for(key).lock().await;
        let entry = shard.get(key)?;

        let stale = entry.created.elapsed() > entry.ttl
            || entry.epoch != self.tenant_epoch(&entry.tenant_id);
        if stale {
            shard.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn insert(&self, tenant_id: &str, key: &str, value: CachedAnswer) {
        let epoch = self.tenant_epoch(tenant_id);
        let ttl = self.ttl_for(tenant_id);
        {
            let mut shard = self.shard_for(key).lock().await;
            shard.insert(
                key.to_owned(),
                StoredEntry {
                    value: value.clone(),
                    tenant_id: tenant_id.to_owned(),
                    epoch,
                    created: Instant::now(),
                    ttl,
                },
            );
        }

        if let Some(db) = &self.persist {
            let payload = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
            let row = ResponseCacheEntry::new(
                tenant_id.to_owned(),
                key.to_owned(),
                payload,
                epoch,
                ttl.as_secs(),
            );
            if let Err(err) = row.save(db).await {
                warn!(error = %err, "failed to persist response cache entry");
            }
        }
    }

    /// Single-flight build: concurrent callers on the same key await one
    /// execution and share its value. The bool is false for the caller that
    /// built and true for everyone served from the cache.
    pub async fn get_or_build<F, Fut>(
        &self,
        tenant_id: &str,
        key: &str,
        build: F,
    ) -> Result<(CachedAnswer, bool), AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedAnswer, AppError>>,
    {
        if let Some(hit) = self.get(key).await {
            return Ok((hit, true));
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            Arc::clone(flights.entry(key.to_owned()).or_default())
        };
        let _guard = flight.lock().await;

        // The winner may have populated the cache while we waited.
        if let Some(hit) = self.get(key).await {
            return Ok((hit, true));
        }

        let result = build().await;
        match result {
            Ok(value) => {
                self.insert(tenant_id, key, value.clone()).await;
                self.release_flight(key).await;
                Ok((value, false))
            }
            Err(err) => {
                // Errors are not cached; the next waiter retries the build.
                self.release_flight(key).await;
                Err(err)
            }
        }
    }

    async fn release_flight(&self, key: &str) {
        let mut flights = self.flights.lock().await;
        flights.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::ConfidenceLevel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn answer(text: &str) -> CachedAnswer {
        CachedAnswer {
            answer: text.to_owned(),
            sources: Vec::new(),
            confidence: Confidence {
                level: ConfidenceLevel::Medium,
                score: 0.6,
            },
            suggestions: Vec::new(),
            tokens_in: 10,
            tokens_out: 5,
        }
    }

    #[test]
    fn fingerprint_is_scope_order_insensitive() {
        let a = fingerprint("t1", "what is rust", &["d2".into(), "d1".into()]);
        let b = fingerprint("t1", "what is rust", &["d1".into(), "d2".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_separates_tenants_and_questions() {
        let base = fingerprint("t1", "what is rust", &[]);
        assert_ne!(base, fingerprint("t2", "what is rust", &[]));
        assert_ne!(base, fingerprint("t1", "what is go", &[]));
        assert_ne!(base, fingerprint("t1", "what is rust", &["d1".into()]));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_by_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(60), None);
        cache.insert("t1", "k1", answer("a")).await;

        assert!(cache.get("k1").await.is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("k1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn tenant_ttl_override_beats_the_default() {
        let cache = ResponseCache::new(Duration::from_secs(3600), None);
        cache.set_tenant_ttl("t1", Duration::from_secs(10));

        cache.insert("t1", "short", answer("a")).await;
        cache.insert("t2", "long", answer("b")).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("short").await.is_none(), "override ttl expired");
        assert!(cache.get("long").await.is_some(), "default ttl still live");
    }

    #[tokio::test]
    async fn epoch_bump_invalidates_tenant_entries() {
        let cache = ResponseCache::new(Duration::from_secs(3600), None);
        cache.insert("t1", "k1", answer("a")).await;
        cache.insert("t2", "k2", answer("b")).await;

        cache.bump_tenant("t1");

        assert!(cache.get("k1").await.is_none(), "t1 entry must die");
        assert!(cache.get("k2").await.is_some(), "t2 entry must survive");
    }

    #[tokio::test]
    async fn single_flight_builds_once_for_concurrent_callers() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(3600), None));
        let builds = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_build("t1", "hot-key", || {
                        let builds = Arc::clone(&builds);
                        async move {
                            builds.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(answer("shared"))
                        }
                    })
                    .await
            }));
        }

        let mut hit_count = 0;
        let mut miss_count = 0;
        for task in tasks {
            let (value, hit) = task
                .await
                .expect("join")
                .expect("build should not fail");
            assert_eq!(value.answer, "shared");
            if hit {
                hit_count += 1;
            } else {
                miss_count += 1;
            }
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1, "exactly one build");
        assert_eq!(miss_count, 1, "exactly one caller observes the build");
        assert_eq!(hit_count, 49);
    }

    #[tokio::test]
    async fn build_errors_are_not_cached() {
        let cache = ResponseCache::new(Duration::from_secs(3600), None);

        let failed: Result<(CachedAnswer, bool), AppError> = cache
            .get_or_build("t1", "k1", || async {
                Err(AppError::LLMFailure("provider down".into()))
            })
            .await;
        assert!(failed.is_err());

        let (value, hit) = cache
            .get_or_build("t1", "k1", || async { Ok(answer("recovered")) })
            .await
            .expect("second build succeeds");
        assert!(!hit, "error must not have been cached");
        assert_eq!(value.answer, "recovered");
    }

    #[tokio::test]
    async fn persisted_rows_are_written_when_enabled() {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &uuid::Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        let cache = ResponseCache::new(Duration::from_secs(3600), Some(Arc::clone(&db)));

        cache.insert("t1", "k1", answer("persisted")).await;

        let rows: Vec<ResponseCacheEntry> =
            db.get_all_stored_items().await.expect("list rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant_id, "t1");
    }
}
