use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(AuditRecord, "audit_record", {
    tenant_id: String,
    user_id: String,
    action: String,
    target: String,
    metadata: serde_json::Value
});

impl AuditRecord {
    pub fn new(
        tenant_id: String,
        user_id: String,
        action: &str,
        target: String,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            user_id,
            action: action.to_owned(),
            target,
            metadata,
        }
    }

    /// The per-query audit row. `target` is the message id so feedback can
    /// be joined back to the query it rates.
    #[allow(clippy::too_many_arguments)]
    pub fn query_completed(
        tenant_id: String,
        user_id: String,
        message_id: String,
        question_hash: String,
        chunk_ids: Vec<String>,
        latency_ms: u64,
        cache_hit: bool,
        confidence: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Self {
        Self::new(
            tenant_id,
            user_id,
            "query.completed",
            message_id,
            serde_json::json!({
                "question_hash": question_hash,
                "chunk_ids": chunk_ids,
                "latency_ms": latency_ms,
                "cache_hit": cache_hit,
                "confidence": confidence,
                "tokens_in": tokens_in,
                "tokens_out": tokens_out,
            }),
        )
    }

    pub fn document_ingested(
        tenant_id: String,
        user_id: String,
        document_id: String,
        chunk_count: u32,
        page_count: u32,
    ) -> Self {
        Self::new(
            tenant_id,
            user_id,
            "document.ingested",
            document_id,
            serde_json::json!({
                "chunk_count": chunk_count,
                "page_count": page_count,
            }),
        )
    }

    pub fn document_failed(
        tenant_id: String,
        user_id: String,
        document_id: String,
        code: &str,
    ) -> Self {
        Self::new(
            tenant_id,
            user_id,
            "document.failed",
            document_id,
            serde_json::json!({ "code": code }),
        )
    }

    pub fn document_deleted(tenant_id: String, user_id: String, document_id: String) -> Self {
        Self::new(
            tenant_id,
            user_id,
            "document.deleted",
            document_id,
            serde_json::Value::Null,
        )
    }

    /// Operator-visible entry for a quarantined index; written once when a
    /// blob fails its checksum.
    pub fn index_quarantined(tenant_id: String, detail: String) -> Self {
        Self::new(
            tenant_id.clone(),
            "system".to_owned(),
            "index.quarantined",
            tenant_id,
            serde_json::json!({ "detail": detail }),
        )
    }

    pub async fn append(self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.store_item(self).await?;
        Ok(())
    }

    pub async fn list_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE tenant_id = $tenant_id ORDER BY created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }
}
