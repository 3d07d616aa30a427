#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! The engine owns every long-lived part of the service: storage clients,
//! the index cache, governors, providers and both pipelines. Lifecycle is
//! `init(config)` → serve → `shutdown()` (flush dirty indexes).

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tracing::{info, warn};

use common::{
    error::AppError,
    governors::{quota::QuotaGovernor, rate::RateGovernor},
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::feedback_record::{FeedbackRecord, FeedbackStats},
        types::quota_state::QuotaState,
    },
    utils::{
        config::AppConfig,
        embedding::EmbeddingProvider,
        llm::LlmProvider,
    },
};
use ingestion_pipeline::{IngestReceipt, IngestionPipeline};
use query_pipeline::{
    cache::ResponseCache,
    lexical::LexicalCatalog,
    pipeline::QueryPipeline,
    reranking::{Reranker, RerankerPool},
    stream_events, QueryEvent, QueryOptions, QueryResult,
};
use vector_index::IndexCache;

/// Operational snapshot for health endpoints and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub resident_indexes: usize,
}

pub struct Engine {
    db: Arc<SurrealDbClient>,
    config: AppConfig,
    index_cache: Arc<IndexCache>,
    ingestion: Arc<IngestionPipeline>,
    query: Arc<QueryPipeline>,
    flusher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Full startup: connects SurrealDB and the object store from config,
    /// then assembles the engine.
    pub async fn init(config: AppConfig) -> Result<Arc<Self>, AppError> {
        let db = Arc::new(
            SurrealDbClient::new(
                &config.surrealdb_address,
                &config.surrealdb_username,
                &config.surrealdb_password,
                &config.surrealdb_namespace,
                &config.surrealdb_database,
            )
            .await?,
        );
        let storage = StorageManager::new(&config).await?;
        Self::init_with_resources(config, db, storage).await
    }

    /// Assembly from pre-built resources; tests inject in-memory SurrealDB
    /// and object storage here.
    pub async fn init_with_resources(
        config: AppConfig,
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
    ) -> Result<Arc<Self>, AppError> {
        db.ensure_initialized().await?;

        let openai_client = if config.openai_api_key.is_empty() {
            None
        } else {
            Some(Arc::new(async_openai::Client::with_config(
                async_openai::config::OpenAIConfig::new()
                    .with_api_key(&config.openai_api_key)
                    .with_api_base(&config.openai_base_url),
            )))
        };

        let embedder = Arc::new(EmbeddingProvider::from_config(
            &config,
            openai_client.clone(),
        )?);
        let llm = Arc::new(LlmProvider::from_config(&config, openai_client)?);
        info!(
            embedding_backend = embedder.backend_label(),
            embedding_dimension = embedder.dimension(),
            llm_backend = llm.backend_label(),
            "providers initialized"
        );

        let index_cache = IndexCache::new(
            storage.clone(),
            Arc::clone(&db),
            embedder.dimension(),
            config.index_cache.size,
            std::time::Duration::from_secs(config.index_cache.flush_interval_secs.max(1)),
        );
        let lexical = Arc::new(LexicalCatalog::new());
        let response_cache = Arc::new(ResponseCache::new(
            std::time::Duration::from_secs(config.cache.ttl_seconds),
            config.cache.enable_persist.then(|| Arc::clone(&db)),
        ));
        let quota = Arc::new(QuotaGovernor::new(Arc::clone(&db), config.quota.clone()));
        let rate = Arc::new(RateGovernor::new(config.rate.rpm, config.rate.tpm));

        // The cross-encoder is best-effort: when the model cannot be set up
        // the lexical-overlap scorer stands in.
        let reranker = match RerankerPool::maybe_from_config(&config) {
            Ok(Some(pool)) => Reranker::Pool(pool),
            Ok(None) => Reranker::Lexical,
            Err(err) => {
                warn!(error = %err, "cross-encoder unavailable, using lexical overlap");
                Reranker::Lexical
            }
        };

        let ingestion = Arc::new(IngestionPipeline::new(
            Arc::clone(&db),
            storage,
            &config,
            Arc::clone(&embedder),
            Arc::clone(&index_cache),
            Arc::clone(&quota),
            Arc::clone(&response_cache),
            Arc::clone(&lexical),
        )?);

        let query = Arc::new(QueryPipeline::new(
            Arc::clone(&db),
            config.clone(),
            embedder,
            llm,
            Arc::clone(&index_cache),
            lexical,
            response_cache,
            quota,
            rate,
            reranker,
        ));

        let engine = Arc::new(Self {
            db,
            config,
            index_cache: Arc::clone(&index_cache),
            ingestion,
            query,
            flusher: std::sync::Mutex::new(None),
        });

        let handle = index_cache.spawn_flusher();
        if let Ok(mut flusher) = engine.flusher.lock() {
            *flusher = Some(handle);
        }

        Ok(engine)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The ingestion pipeline, for worker loops.
    pub fn ingestion(&self) -> Arc<IngestionPipeline> {
        Arc::clone(&self.ingestion)
    }

    /// Upload entrypoint; idempotent on `(tenant, content_digest)`.
    pub async fn ingest(
        &self,
        tenant_id: &str,
        user_id: &str,
        blob: Bytes,
        name: &str,
        declared_type: &str,
    ) -> Result<IngestReceipt, AppError> {
        self.ingestion
            .submit(tenant_id, user_id, blob, name, declared_type)
            .await
    }

    /// Query entrypoint.
    pub async fn query(
        &self,
        tenant_id: &str,
        user_id: &str,
        question: &str,
        opts: QueryOptions,
    ) -> Result<QueryResult, AppError> {
        self.query.run(tenant_id, user_id, question, &opts).await
    }

    /// Streaming delivery: a lazy finite sequence of answer tokens followed
    /// by the terminal payload. Nothing runs until the stream is polled and
    /// it cannot be restarted.
    pub fn query_stream(
        self: &Arc<Self>,
        tenant_id: String,
        user_id: String,
        question: String,
        opts: QueryOptions,
    ) -> impl Stream<Item = Result<QueryEvent, AppError>> {
        let engine = Arc::clone(self);
        async_stream::try_stream! {
            let result = engine
                .query
                .run(&tenant_id, &user_id, &question, &opts)
                .await?;
            let events = stream_events(result);
            for await event in events {
                yield event;
            }
        }
    }

    /// Feedback capture; always writable.
    pub async fn feedback(
        &self,
        tenant_id: &str,
        user_id: &str,
        message_id: &str,
        rating: i8,
        issue_tag: Option<String>,
        note: Option<String>,
    ) -> Result<(), AppError> {
        FeedbackRecord::new(
            message_id.to_owned(),
            tenant_id.to_owned(),
            user_id.to_owned(),
            rating,
            issue_tag,
            note,
        )?
        .append(&self.db)
        .await
    }

    pub async fn feedback_stats(&self, tenant_id: &str) -> Result<FeedbackStats, AppError> {
        FeedbackRecord::stats_for_tenant(&self.db, tenant_id).await
    }

    pub async fn delete_document(
        &self,
        tenant_id: &str,
        user_id: &str,
        document_id: &str,
    ) -> Result<(), AppError> {
        self.ingestion
            .delete_document(tenant_id, user_id, document_id)
            .await
    }

    pub async fn purge_tenant(&self, tenant_id: &str) -> Result<(), AppError> {
        self.ingestion.purge_tenant(tenant_id).await
    }

    pub async fn quota_snapshot(&self, tenant_id: &str) -> Result<QuotaState, AppError> {
        self.query_quota().snapshot(tenant_id).await
    }

    fn query_quota(&self) -> Arc<QuotaGovernor> {
        self.ingestion.quota()
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            resident_indexes: self.index_cache.resident_count().await,
        }
    }

    /// Stops the flusher and persists every dirty index.
    pub async fn shutdown(&self) {
        let handle = self
            .flusher
            .lock()
            .ok()
            .and_then(|mut flusher| flusher.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        self.index_cache.flush_dirty(true).await;
        info!("engine shut down, dirty indexes flushed");
    }
}
