use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::document::DocumentStatus;

stored_object!(Chunk, "chunk", {
    document_id: String,
    tenant_id: String,
    ordinal: u32,
    text: String,
    token_count: u32,
    page: u32,
    embedding_slot: Option<u64>
});

impl Chunk {
    pub fn new(
        document_id: String,
        tenant_id: String,
        ordinal: u32,
        text: String,
        token_count: u32,
        page: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            document_id,
            tenant_id,
            ordinal,
            text,
            token_count,
            page,
            embedding_slot: None,
        }
    }

    /// Publishes an ingested document: all chunk rows plus the Ready flip of
    /// the document row commit in one transaction, so readers observe either
    /// none of the chunks or all of them.
    pub async fn commit_ingest(
        db: &SurrealDbClient,
        document_id: &str,
        page_count: u32,
        chunks: Vec<Self>,
    ) -> Result<(), AppError> {
        let chunk_count = u32::try_from(chunks.len())
            .map_err(|_| AppError::Validation("chunk count exceeds u32".into()))?;

        let mut request = db.client.query("BEGIN TRANSACTION;");
        for (i, chunk) in chunks.into_iter().enumerate() {
            request = request
                .query(format!(
                    "CREATE type::thing('{table}', $chunk_id_{i}) CONTENT $chunk_{i};",
                    table = Self::table_name(),
                ))
                .bind((format!("chunk_id_{i}"), chunk.id.clone()))
                .bind((format!("chunk_{i}"), chunk));
        }
        request = request
            .query(
                "UPDATE type::thing('document', $document_id) SET \
                 status = $status, \
                 page_count = $page_count, \
                 chunk_count = $chunk_count, \
                 error = NONE, \
                 updated_at = time::now();",
            )
            .bind(("document_id", document_id.to_owned()))
            .bind(("status", DocumentStatus::Ready))
            .bind(("page_count", page_count))
            .bind(("chunk_count", chunk_count))
            .query("COMMIT TRANSACTION;");

        let response = request.await.map_err(AppError::Database)?;
        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// Rewrites embedding slots after an index compaction. Rows are matched
    /// by chunk id so the rewrite cannot chase its own updates; the whole
    /// remap commits atomically.
    pub async fn rewrite_slots(
        db: &SurrealDbClient,
        remap: &[(String, u64)],
    ) -> Result<(), AppError> {
        if remap.is_empty() {
            return Ok(());
        }

        let mut request = db.client.query("BEGIN TRANSACTION;");
        for (i, (chunk_id, new_slot)) in remap.iter().enumerate() {
            request = request
                .query(format!(
                    "UPDATE type::thing('{table}', $chunk_id_{i}) SET \
                     embedding_slot = $slot_{i}, \
                     updated_at = time::now();",
                    table = Self::table_name(),
                ))
                .bind((format!("chunk_id_{i}"), chunk_id.clone()))
                .bind((format!("slot_{i}"), *new_slot));
        }
        request = request.query("COMMIT TRANSACTION;");

        let response = request.await.map_err(AppError::Database)?;
        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn for_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE document_id = $document_id ORDER BY ordinal ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn all_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id")
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    /// Hydrates chunks by id, strictly tenant-scoped.
    pub async fn by_ids(
        db: &SurrealDbClient,
        tenant_id: &str,
        ids: &[String],
    ) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from((Self::table_name(), id.as_str())))
            .collect();

        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE id IN $things AND tenant_id = $tenant_id",
            )
            .bind(("table", Self::table_name()))
            .bind(("things", things))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn delete_by_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<(), AppError> {
        db.query("DELETE FROM type::table($table) WHERE document_id = $document_id")
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_owned()))
            .await?
            .check()?;
        Ok(())
    }
}
