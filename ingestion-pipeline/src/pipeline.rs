use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use common::{
    error::AppError,
    governors::quota::{QuotaGovernor, QuotaKind},
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            audit_record::AuditRecord,
            chunk::Chunk,
            document::{Document, DocumentStatus},
            ingestion_task::{IngestionTask, DEFAULT_LEASE_SECS, MAX_ATTEMPTS},
        },
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use query_pipeline::{cache::ResponseCache, lexical::LexicalCatalog};
use vector_index::IndexCache;

use crate::{chunker::Chunker, extract::extract};

/// Outcome of an upload: the document id plus its status at return time.
/// Idempotent re-uploads return the existing Ready document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    pub document_id: String,
    pub status: DocumentStatus,
}

/// Orchestrates extract → chunk → embed → index upsert → chunk-row commit,
/// with quota enforcement up front and cache/lexical invalidation after the
/// publish.
pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    embedder: Arc<EmbeddingProvider>,
    index_cache: Arc<IndexCache>,
    quota: Arc<QuotaGovernor>,
    response_cache: Arc<ResponseCache>,
    lexical: Arc<LexicalCatalog>,
    chunker: Chunker,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        config: &AppConfig,
        embedder: Arc<EmbeddingProvider>,
        index_cache: Arc<IndexCache>,
        quota: Arc<QuotaGovernor>,
        response_cache: Arc<ResponseCache>,
        lexical: Arc<LexicalCatalog>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            db,
            storage,
            embedder,
            index_cache,
            quota,
            response_cache,
            lexical,
            chunker: Chunker::from_settings(&config.chunk)?,
        })
    }

    /// The quota governor, shared with the query side.
    pub fn quota(&self) -> Arc<QuotaGovernor> {
        Arc::clone(&self.quota)
    }

    /// Accepts an upload: persists the document row and blob, enforces the
    /// document/storage quota and enqueues the processing task. Idempotent
    /// on `(tenant, content_digest)` — the document record id is derived
    /// from that pair, so concurrent uploads of identical content race on a
    /// single CREATE and the losers return the winner's receipt.
    #[instrument(skip_all, fields(%tenant_id, %user_id, name = %name))]
    pub async fn submit(
        &self,
        tenant_id: &str,
        user_id: &str,
        blob: Bytes,
        name: &str,
        declared_type: &str,
    ) -> Result<IngestReceipt, AppError> {
        let digest = format!("{:x}", Sha256::digest(&blob));
        let byte_size = blob.len() as u64;
        let document_id = Document::digest_id(tenant_id, &digest);

        if let Some(existing) = Document::get_for_tenant(&self.db, tenant_id, &document_id).await? {
            match existing.status {
                DocumentStatus::Ready => {
                    info!(%document_id, "duplicate upload, returning existing document");
                    return Ok(IngestReceipt {
                        document_id,
                        status: DocumentStatus::Ready,
                    });
                }
                status @ (DocumentStatus::Pending | DocumentStatus::Processing) => {
                    // The same content is already being ingested.
                    return Ok(IngestReceipt {
                        document_id,
                        status,
                    });
                }
                DocumentStatus::Failed => {
                    if Document::reclaim_failed(&self.db, &document_id).await?.is_none() {
                        // A concurrent retry won the requeue.
                        return Ok(IngestReceipt {
                            document_id,
                            status: DocumentStatus::Pending,
                        });
                    }
                }
            }
        } else {
            let document = Document::new(
                tenant_id.to_owned(),
                name.to_owned(),
                byte_size,
                digest,
            );
            if let Err(err) = self.db.store_item(document).await {
                // CREATE on the digest-derived id fails only when a
                // concurrent upload of identical content already owns the
                // row; hand back that row's receipt.
                if let Some(existing) =
                    Document::get_for_tenant(&self.db, tenant_id, &document_id).await?
                {
                    return Ok(IngestReceipt {
                        document_id,
                        status: existing.status,
                    });
                }
                return Err(err.into());
            }
        }

        if let Err(denied) = self
            .quota
            .try_consume(tenant_id, QuotaKind::Documents, 1)
            .await
        {
            Document::mark_failed(&self.db, &document_id, &denied.to_string()).await?;
            return Err(denied);
        }
        if let Err(denied) = self
            .quota
            .try_consume(tenant_id, QuotaKind::StorageBytes, byte_size)
            .await
        {
            self.quota.release(tenant_id, QuotaKind::Documents, 1).await;
            Document::mark_failed(&self.db, &document_id, &denied.to_string()).await?;
            return Err(denied);
        }

        let blob_location = format!("uploads/{tenant_id}/{document_id}");
        self.storage.put(&blob_location, blob).await?;

        let task = IngestionTask::new(
            document_id.clone(),
            tenant_id.to_owned(),
            user_id.to_owned(),
            blob_location,
            declared_type.to_owned(),
            name.to_owned(),
        );
        self.db.store_item(task).await?;

        Ok(IngestReceipt {
            document_id,
            status: DocumentStatus::Pending,
        })
    }

    /// Claims and processes at most one queued task. Returns whether a task
    /// was claimed; the worker loop uses this to pace its idle backoff.
    pub async fn process_next(&self, worker_id: &str) -> Result<bool, AppError> {
        let claimed = IngestionTask::claim_next_ready(
            &self.db,
            worker_id,
            Utc::now(),
            chrono::Duration::seconds(DEFAULT_LEASE_SECS),
        )
        .await?;

        match claimed {
            Some(task) => {
                self.process_task(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(
        skip_all,
        fields(
            task_id = %task.id,
            attempt = task.attempts,
            document_id = %task.document_id,
            tenant_id = %task.tenant_id
        )
    )]
    pub async fn process_task(&self, task: IngestionTask) -> Result<(), AppError> {
        match self.drive(&task).await {
            Ok(()) => {
                task.mark_succeeded(&self.db).await?;
                info!("ingestion task succeeded");
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                let retryable = is_retryable(&err);
                if !retryable || task.attempts >= MAX_ATTEMPTS {
                    self.fail_document(&task, &err).await?;
                }
                task.mark_failed(&self.db, &reason, retryable).await?;
                warn!(error = %reason, retryable, "ingestion task failed");
                Err(err)
            }
        }
    }

    /// The processing stages. All failures surface as `Document.error`; no
    /// partial Ready state exists because chunk rows and the Ready flip
    /// commit in one transaction, with assigned slots rolled back when that
    /// transaction fails.
    async fn drive(&self, task: &IngestionTask) -> Result<(), AppError> {
        let document = Document::get_for_tenant(&self.db, &task.tenant_id, &task.document_id)
            .await?
            .ok_or_else(|| AppError::NotFound("document for ingestion task".into()))?;

        if document.status == DocumentStatus::Ready {
            return Ok(());
        }
        Document::set_status(&self.db, &document.id, DocumentStatus::Processing).await?;

        let blob = self.storage.get(&task.blob_location).await?;
        let pages = extract(&blob, &task.declared_type, &task.document_name)?;
        let page_count = pages.iter().map(|p| p.page).max().unwrap_or(1);
        let pieces = self.chunker.chunk_pages(&pages)?;

        let mut chunks: Vec<Chunk> = pieces
            .into_iter()
            .map(|piece| {
                Chunk::new(
                    document.id.clone(),
                    task.tenant_id.clone(),
                    piece.ordinal,
                    piece.text,
                    piece.token_count,
                    piece.page,
                )
            })
            .collect();

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        // A failed batch fails the whole document; nothing is committed.
        let vectors = self.embedder.embed_batch(&texts).await?;
        let chunk_ids: Vec<String> = chunks.iter().map(|chunk| chunk.id.clone()).collect();

        // The write guard serializes this publish against every other
        // ingest and delete for the tenant.
        let mut index = self.index_cache.write(&task.tenant_id).await?;
        let slots = index.upsert(&vectors, &chunk_ids)?;
        for (chunk, slot) in chunks.iter_mut().zip(&slots) {
            chunk.embedding_slot = Some(*slot);
        }

        let chunk_count = chunks.len() as u32;
        if let Err(err) = Chunk::commit_ingest(&self.db, &document.id, page_count, chunks).await {
            index.remove(&slots);
            drop(index);
            return Err(err);
        }
        drop(index);

        // Epoch bump strictly after the publish: cached answers served from
        // now on either predate the ingest (and are invalidated) or were
        // built against it.
        self.response_cache.bump_tenant(&task.tenant_id);
        self.lexical.invalidate(&task.tenant_id);

        AuditRecord::document_ingested(
            task.tenant_id.clone(),
            task.user_id.clone(),
            document.id.clone(),
            chunk_count,
            page_count,
        )
        .append(&self.db)
        .await?;

        info!(chunks = chunk_count, pages = page_count, "document ingested");
        Ok(())
    }

    async fn fail_document(&self, task: &IngestionTask, err: &AppError) -> Result<(), AppError> {
        let document = Document::get_for_tenant(&self.db, &task.tenant_id, &task.document_id)
            .await?;
        let Some(document) = document else {
            return Ok(());
        };
        if document.status == DocumentStatus::Ready || document.status == DocumentStatus::Failed {
            return Ok(());
        }

        Document::mark_failed(&self.db, &document.id, &err.to_string()).await?;
        self.quota
            .release(&task.tenant_id, QuotaKind::Documents, 1)
            .await;
        self.quota
            .release(&task.tenant_id, QuotaKind::StorageBytes, document.byte_size)
            .await;
        AuditRecord::document_failed(
            task.tenant_id.clone(),
            task.user_id.clone(),
            document.id,
            err.code(),
        )
        .append(&self.db)
        .await?;
        Ok(())
    }

    /// Deletes a document: tombstones its vector slots (compacting when a
    /// quarter of the index is dead), removes its rows, refunds quota and
    /// invalidates the tenant's cached responses and lexical index.
    #[instrument(skip_all, fields(%tenant_id, %document_id))]
    pub async fn delete_document(
        &self,
        tenant_id: &str,
        user_id: &str,
        document_id: &str,
    ) -> Result<(), AppError> {
        let document = Document::get_for_tenant(&self.db, tenant_id, document_id)
            .await?
            .ok_or_else(|| AppError::NotFound("document".into()))?;

        let chunks = Chunk::for_document(&self.db, document_id).await?;
        let slots: Vec<u64> = chunks.iter().filter_map(|c| c.embedding_slot).collect();

        let mut index = self.index_cache.write(tenant_id).await?;
        index.remove(&slots);
        if index.needs_compaction() {
            let remap = index.compact();
            let pairs: Vec<(String, u64)> = remap
                .into_iter()
                .map(|(chunk_id, _old, new)| (chunk_id, new))
                .collect();
            // Surviving rows move to their new slots in one transaction
            // before the compacted pair is persisted.
            Chunk::rewrite_slots(&self.db, &pairs).await?;
        }
        drop(index);

        Chunk::delete_by_document(&self.db, document_id).await?;
        self.db.delete_item::<Document>(document_id).await?;
        self.storage
            .delete(&format!("uploads/{tenant_id}/{document_id}"))
            .await?;

        if let Err(err) = self.index_cache.persist_tenant(tenant_id).await {
            // The flusher retries; queries stay correct on the in-memory
            // state meanwhile.
            warn!(error = %err, "index persist after delete failed");
        }

        self.quota.release(tenant_id, QuotaKind::Documents, 1).await;
        self.quota
            .release(tenant_id, QuotaKind::StorageBytes, document.byte_size)
            .await;
        self.response_cache.bump_tenant(tenant_id);
        self.lexical.invalidate(tenant_id);

        AuditRecord::document_deleted(
            tenant_id.to_owned(),
            user_id.to_owned(),
            document_id.to_owned(),
        )
        .append(&self.db)
        .await?;

        info!("document deleted");
        Ok(())
    }

    /// Destroys every trace of a tenant: index pair, rows, uploads, caches.
    #[instrument(skip_all, fields(%tenant_id))]
    pub async fn purge_tenant(&self, tenant_id: &str) -> Result<(), AppError> {
        self.index_cache.purge(tenant_id).await?;
        self.storage
            .delete_prefix(&format!("uploads/{tenant_id}/"))
            .await?;

        self.db
            .query("DELETE FROM chunk WHERE tenant_id = $tenant_id")
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?
            .check()?;
        self.db
            .query("DELETE FROM document WHERE tenant_id = $tenant_id")
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?
            .check()?;

        self.response_cache.bump_tenant(tenant_id);
        self.lexical.invalidate(tenant_id);
        info!("tenant purged");
        Ok(())
    }
}

fn is_retryable(err: &AppError) -> bool {
    matches!(
        err,
        AppError::Database(_) | AppError::ObjectStore(_) | AppError::Io(_)
    )
}
