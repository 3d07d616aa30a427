use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ResponseCacheEntry, "response_cache_entry", {
    tenant_id: String,
    fingerprint: String,
    payload: serde_json::Value,
    tenant_epoch: u64,
    ttl_seconds: u64
});

impl ResponseCacheEntry {
    /// Observability row mirroring an in-memory cache entry. Correctness
    /// never depends on these rows; the in-memory store is authoritative.
    pub fn new(
        tenant_id: String,
        fingerprint: String,
        payload: serde_json::Value,
        tenant_epoch: u64,
        ttl_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: fingerprint.clone(),
            created_at: now,
            updated_at: now,
            tenant_id,
            fingerprint,
            payload,
            tenant_epoch,
            ttl_seconds,
        }
    }

    pub async fn save(self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.upsert_item(self).await?;
        Ok(())
    }
}
