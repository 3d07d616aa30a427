use sha2::{Digest, Sha256};
use surrealdb::opt::PatchOp;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

stored_object!(Document, "document", {
    tenant_id: String,
    name: String,
    byte_size: u64,
    content_digest: String,
    status: DocumentStatus,
    page_count: u32,
    chunk_count: u32,
    error: Option<String>
});

impl Document {
    pub fn new(tenant_id: String, name: String, byte_size: u64, content_digest: String) -> Self {
        let now = Utc::now();
        Self {
            id: Self::digest_id(&tenant_id, &content_digest),
            created_at: now,
            updated_at: now,
            tenant_id,
            name,
            byte_size,
            content_digest,
            status: DocumentStatus::Pending,
            page_count: 0,
            chunk_count: 0,
            error: None,
        }
    }

    /// Deterministic record id for `(tenant, content_digest)`. The record
    /// id doubles as the uniqueness guard: concurrent uploads of identical
    /// content race on one CREATE instead of inserting two rows, so a
    /// tenant can never hold two documents for the same digest.
    pub fn digest_id(tenant_id: &str, content_digest: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update([0]);
        hasher.update(content_digest.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Returns a Failed document to Pending for a retry upload. The update
    /// is conditional on the Failed status so concurrent retries requeue
    /// exactly once; losers read back the row instead.
    pub async fn reclaim_failed(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing($table, $id) SET \
                 status = 'Pending', error = NONE, updated_at = time::now() \
                 WHERE status = 'Failed' \
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", document_id.to_owned()))
            .await?;
        Ok(response.take::<Vec<Self>>(0)?.into_iter().next())
    }

    /// A tenant may hold at most one Ready document per content digest;
    /// this lookup backs the idempotent-upload path.
    pub async fn find_ready_by_digest(
        db: &SurrealDbClient,
        tenant_id: &str,
        digest: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE tenant_id = $tenant_id \
                   AND content_digest = $digest \
                   AND status = 'Ready' \
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("digest", digest.to_owned()))
            .await?;

        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Fetches a document strictly within the tenant boundary. A document
    /// owned by another tenant reads as absent, never as forbidden.
    pub async fn get_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let row: Option<Self> = db.get_item(document_id).await?;
        Ok(row.filter(|doc| doc.tenant_id == tenant_id))
    }

    pub async fn list_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id ORDER BY created_at ASC")
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn set_status(
        db: &SurrealDbClient,
        id: &str,
        status: DocumentStatus,
    ) -> Result<(), AppError> {
        let _doc: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/status", status))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    /// Terminal failure: status and reason land together so no partial
    /// Ready state is observable.
    pub async fn mark_failed(
        db: &SurrealDbClient,
        id: &str,
        reason: &str,
    ) -> Result<(), AppError> {
        let _doc: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/status", DocumentStatus::Failed))
            .patch(PatchOp::replace("/error", Some(reason.to_owned())))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }
}
