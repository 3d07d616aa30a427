mod context;
mod stages;

pub use context::{StageContext, GROUNDED_EMPTY_ANSWER};
pub use stages::{BoxedStage, PipelineStage, StageKind};

use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use common::{
    error::AppError,
    governors::{quota::QuotaGovernor, quota::QuotaKind, rate::RateGovernor},
    storage::{db::SurrealDbClient, types::audit_record::AuditRecord},
    utils::{
        config::AppConfig,
        embedding::EmbeddingProvider,
        llm::LlmProvider,
        text::{approx_token_count, normalize_question},
    },
};
use vector_index::IndexCache;

use crate::{
    cache::{fingerprint, CachedAnswer, ResponseCache},
    confidence::Confidence,
    lexical::LexicalCatalog,
    reranking::Reranker,
    QueryOptions, QueryResult,
};

const GREETING_ANSWER: &str =
    "Hello! Ask me anything about your documents and I will answer from them.";

/// The query state machine: governors in front, the single-flight response
/// cache around the build stages, reconciliation and audit behind.
pub struct QueryPipeline {
    db: Arc<SurrealDbClient>,
    config: AppConfig,
    embedder: Arc<EmbeddingProvider>,
    llm: Arc<LlmProvider>,
    index_cache: Arc<IndexCache>,
    lexical: Arc<LexicalCatalog>,
    response_cache: Arc<ResponseCache>,
    quota: Arc<QuotaGovernor>,
    rate: Arc<RateGovernor>,
    reranker: Reranker,
}

impl QueryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: AppConfig,
        embedder: Arc<EmbeddingProvider>,
        llm: Arc<LlmProvider>,
        index_cache: Arc<IndexCache>,
        lexical: Arc<LexicalCatalog>,
        response_cache: Arc<ResponseCache>,
        quota: Arc<QuotaGovernor>,
        rate: Arc<RateGovernor>,
        reranker: Reranker,
    ) -> Self {
        Self {
            db,
            config,
            embedder,
            llm,
            index_cache,
            lexical,
            response_cache,
            quota,
            rate,
            reranker,
        }
    }

    pub fn response_cache(&self) -> &Arc<ResponseCache> {
        &self.response_cache
    }

    pub fn lexical(&self) -> &Arc<LexicalCatalog> {
        &self.lexical
    }

    #[instrument(skip_all, fields(%tenant_id, %user_id))]
    pub async fn run(
        &self,
        tenant_id: &str,
        user_id: &str,
        question: &str,
        opts: &QueryOptions,
    ) -> Result<QueryResult, AppError> {
        let started = Instant::now();
        let message_id = Uuid::new_v4().to_string();
        let normalized = normalize_question(question);

        // Greetings bypass retrieval and the LLM entirely. They count
        // against the request rate but not the tenant quota.
        if self.is_greeting(&normalized) {
            self.rate.try_acquire(tenant_id, 0).await?;
            let result = QueryResult {
                message_id: message_id.clone(),
                answer: GREETING_ANSWER.to_owned(),
                sources: Vec::new(),
                confidence: Confidence::none(),
                suggestions: Vec::new(),
                cache_hit: false,
                tokens_used: 0,
                latency_ms: elapsed_ms(started),
            };
            self.audit(tenant_id, user_id, &normalized, opts, &result, 0, 0)
                .await;
            return Ok(result);
        }

        let estimate = approx_token_count(question)
            + self.config.context.budget_tokens as u64
            + u64::from(self.llm.max_output_tokens());
        let reservation = self.rate.try_acquire(tenant_id, estimate).await?;

        if let Err(denied) = self.quota.try_consume(tenant_id, QuotaKind::Queries, 1).await {
            self.rate.reconcile(tenant_id, reservation, 0).await;
            return Err(denied);
        }

        let scope = opts.doc_scope.clone().unwrap_or_default();
        let key = fingerprint(tenant_id, &normalized, &scope);

        let outcome = if opts.enable_cache {
            self.response_cache
                .get_or_build(tenant_id, &key, || self.build_answer(tenant_id, question, opts))
                .await
        } else {
            self.build_answer(tenant_id, question, opts)
                .await
                .map(|answer| (answer, false))
        };

        let (built, cache_hit) = match outcome {
            Ok(value) => value,
            Err(err) => {
                // Failed builds release their reservation and are not audited
                // as completed queries.
                self.rate.reconcile(tenant_id, reservation, 0).await;
                return Err(err);
            }
        };

        let (tokens_in, tokens_out) = if cache_hit {
            (0, 0)
        } else {
            (built.tokens_in, built.tokens_out)
        };
        let spent = tokens_in + tokens_out;
        self.rate.reconcile(tenant_id, reservation, spent).await;
        if spent > 0 {
            self.quota
                .consume_unchecked(tenant_id, QuotaKind::Tokens, spent)
                .await;
        }

        let result = QueryResult {
            message_id,
            answer: built.answer,
            sources: built.sources,
            confidence: built.confidence,
            suggestions: built.suggestions,
            cache_hit,
            tokens_used: spent,
            latency_ms: elapsed_ms(started),
        };
        self.audit(
            tenant_id,
            user_id,
            &normalized,
            opts,
            &result,
            tokens_in,
            tokens_out,
        )
        .await;
        Ok(result)
    }

    async fn build_answer(
        &self,
        tenant_id: &str,
        question: &str,
        opts: &QueryOptions,
    ) -> Result<CachedAnswer, AppError> {
        let mut ctx = StageContext::new(
            &self.db,
            &self.config,
            &self.embedder,
            &self.llm,
            &self.index_cache,
            &self.lexical,
            &self.reranker,
            tenant_id,
            question,
            opts,
        );

        for stage in stages::build_stages() {
            if ctx.is_finished() {
                break;
            }
            let start = Instant::now();
            stage.execute(&mut ctx).await?;
            ctx.record_stage_duration(stage.kind(), start.elapsed());
        }

        debug!(timings = ?ctx.stage_timings(), "query build finished");
        Ok(ctx.into_answer())
    }

    fn is_greeting(&self, normalized_question: &str) -> bool {
        self.config
            .greetings
            .iter()
            .any(|greeting| greeting == normalized_question)
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit(
        &self,
        tenant_id: &str,
        user_id: &str,
        normalized_question: &str,
        opts: &QueryOptions,
        result: &QueryResult,
        tokens_in: u64,
        tokens_out: u64,
    ) {
        let question_hash = format!("{:x}", Sha256::digest(normalized_question.as_bytes()));
        let chunk_ids = result
            .sources
            .iter()
            .map(|source| source.chunk_id.clone())
            .collect();
        let mut record = AuditRecord::query_completed(
            tenant_id.to_owned(),
            user_id.to_owned(),
            result.message_id.clone(),
            question_hash,
            chunk_ids,
            result.latency_ms,
            result.cache_hit,
            result.confidence.level.as_str(),
            tokens_in,
            tokens_out,
        );
        if let Some(session_id) = opts.session_id.as_deref() {
            record.metadata["session_id"] = serde_json::json!(session_id);
        }
        if let Err(err) = record.append(&self.db).await {
            warn!(error = %err, "failed to append query audit record");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::ConfidenceLevel;
    use common::storage::store::testing::memory_storage;
    use common::storage::types::chunk::Chunk;
    use common::utils::config::{LlmBackend, QuotaSettings};
    use std::time::Duration;
    use uuid::Uuid;

    const DIMENSION: usize = 64;

    struct Harness {
        pipeline: Arc<QueryPipeline>,
        db: Arc<SurrealDbClient>,
        index_cache: Arc<IndexCache>,
        embedder: Arc<EmbeddingProvider>,
    }

    async fn harness(config: AppConfig, llm: LlmProvider) -> Harness {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        let embedder = Arc::new(EmbeddingProvider::new_hashed(DIMENSION));
        let index_cache = IndexCache::new(
            memory_storage(),
            Arc::clone(&db),
            DIMENSION,
            config.index_cache.size,
            Duration::from_secs(60),
        );
        let response_cache = Arc::new(ResponseCache::new(
            Duration::from_secs(config.cache.ttl_seconds),
            None,
        ));
        let quota = Arc::new(QuotaGovernor::new(
            Arc::clone(&db),
            config.quota.clone(),
        ));
        let rate = Arc::new(RateGovernor::new(config.rate.rpm, config.rate.tpm));
        let pipeline = Arc::new(QueryPipeline::new(
            Arc::clone(&db),
            config,
            Arc::clone(&embedder),
            Arc::new(llm),
            Arc::clone(&index_cache),
            Arc::new(LexicalCatalog::new()),
            response_cache,
            quota,
            rate,
            Reranker::Lexical,
        ));

        Harness {
            pipeline,
            db,
            index_cache,
            embedder,
        }
    }

    async fn seed_chunk(h: &Harness, tenant: &str, doc: &str, ordinal: u32, text: &str) -> Chunk {
        let mut chunk = Chunk::new(
            doc.to_owned(),
            tenant.to_owned(),
            ordinal,
            text.to_owned(),
            text.split_whitespace().count() as u32,
            1,
        );
        let vector = h.embedder.embed(text).await.expect("embed chunk");
        let mut index = h.index_cache.write(tenant).await.expect("write index");
        let slots = index
            .upsert(&[vector], &[chunk.id.clone()])
            .expect("upsert vector");
        drop(index);
        chunk.embedding_slot = Some(slots[0]);
        h.db.store_item(chunk.clone()).await.expect("store chunk");
        chunk
    }

    fn static_llm() -> LlmProvider {
        LlmProvider::new_static(
            "The scheduler assigns tasks to worker threads using cooperative scheduling.",
        )
    }

    #[tokio::test]
    async fn answers_with_sources_from_seeded_content() {
        let h = harness(AppConfig::default(), static_llm()).await;
        let chunk = seed_chunk(
            &h,
            "t1",
            "d1",
            0,
            "The scheduler assigns tasks to worker threads using cooperative scheduling.",
        )
        .await;

        let result = h
            .pipeline
            .run("t1", "u1", "How does the scheduler assign tasks?", &QueryOptions::default())
            .await
            .expect("query should succeed");

        assert!(!result.cache_hit);
        assert!(!result.sources.is_empty());
        assert_eq!(result.sources[0].chunk_id, chunk.id);
        assert_eq!(result.suggestions.len(), 3);
        assert!(result.tokens_used > 0);
    }

    #[tokio::test]
    async fn cross_tenant_query_is_grounded_empty() {
        let h = harness(AppConfig::default(), static_llm()).await;
        seed_chunk(&h, "t1", "d1", 0, "tenant one private payroll details").await;

        let result = h
            .pipeline
            .run("t2", "u2", "What are the payroll details?", &QueryOptions::default())
            .await
            .expect("query should succeed");

        assert_eq!(result.answer, GROUNDED_EMPTY_ANSWER);
        assert!(result.sources.is_empty());
        assert_eq!(result.confidence.level, ConfidenceLevel::None);

        // Still audited.
        let records = AuditRecord::list_for_tenant(&h.db, "t2").await.expect("audit");
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn greeting_short_circuits_without_quota() {
        let mut config = AppConfig::default();
        config.quota = QuotaSettings {
            daily_queries: 0, // any real query would be denied
            ..QuotaSettings::default()
        };
        let h = harness(config, static_llm()).await;

        let result = h
            .pipeline
            .run("t1", "u1", "Hello!", &QueryOptions::default())
            .await
            .expect("greeting must bypass quota");

        assert_eq!(result.answer, GREETING_ANSWER);
        assert_eq!(result.tokens_used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_query_within_a_second_is_rate_limited_and_not_audited() {
        let mut config = AppConfig::default();
        config.rate.rpm = 5;
        let h = harness(config, static_llm()).await;
        seed_chunk(&h, "t1", "d1", 0, "The quarterly report covers revenue.").await;

        for i in 0..5 {
            h.pipeline
                .run(
                    "t1",
                    "u1",
                    &format!("What does report section {i} cover?"),
                    &QueryOptions::default(),
                )
                .await
                .unwrap_or_else(|e| panic!("query {i} should pass: {e}"));
        }

        let denied = h
            .pipeline
            .run("t1", "u1", "What about revenue?", &QueryOptions::default())
            .await;
        match denied {
            Err(AppError::RateLimited { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        let records = AuditRecord::list_for_tenant(&h.db, "t1").await.expect("audit");
        assert_eq!(records.len(), 5, "denied request must not be audited");
    }

    #[tokio::test]
    async fn repeated_question_hits_cache() {
        let h = harness(AppConfig::default(), static_llm()).await;
        seed_chunk(&h, "t1", "d1", 0, "Cooperative scheduling shares worker threads.").await;

        let first = h
            .pipeline
            .run("t1", "u1", "How is scheduling done?", &QueryOptions::default())
            .await
            .expect("first query");
        let second = h
            .pipeline
            .run("t1", "u1", "How is scheduling done?", &QueryOptions::default())
            .await
            .expect("second query");

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(second.answer, first.answer);
        assert_eq!(second.tokens_used, 0, "cache hits consume no model tokens");
    }

    #[tokio::test]
    async fn epoch_bump_invalidates_cached_answers() {
        let h = harness(AppConfig::default(), static_llm()).await;
        seed_chunk(&h, "t1", "d1", 0, "Cooperative scheduling shares worker threads.").await;

        let first = h
            .pipeline
            .run("t1", "u1", "How is scheduling done?", &QueryOptions::default())
            .await
            .expect("first query");
        assert!(!first.cache_hit);

        h.pipeline.response_cache().bump_tenant("t1");

        let after_bump = h
            .pipeline
            .run("t1", "u1", "How is scheduling done?", &QueryOptions::default())
            .await
            .expect("query after invalidation");
        assert!(!after_bump.cache_hit, "bumped epoch must force a rebuild");
    }

    #[tokio::test]
    async fn degraded_llm_returns_sources_verbatim_and_audits_zero_tokens_out() {
        let mut config = AppConfig::default();
        config.llm.backend = LlmBackend::Disabled;
        let h = harness(config, LlmProvider::new_disabled()).await;
        let chunk = seed_chunk(&h, "t1", "d1", 0, "Revenue grew by twelve percent.").await;

        let result = h
            .pipeline
            .run("t1", "u1", "How much did revenue grow?", &QueryOptions::default())
            .await
            .expect("degraded query still responds");

        assert!(result.answer.contains("unable to synthesize"));
        assert!(
            result.answer.contains("Revenue grew by twelve percent."),
            "selected sources appear verbatim"
        );
        assert_eq!(result.confidence.level, ConfidenceLevel::None);
        assert_eq!(result.sources[0].chunk_id, chunk.id);

        let records = AuditRecord::list_for_tenant(&h.db, "t1").await.expect("audit");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata["tokens_out"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn doc_scope_restricts_sources() {
        let h = harness(AppConfig::default(), static_llm()).await;
        seed_chunk(&h, "t1", "d1", 0, "Alpha project ships the scheduler feature.").await;
        let beta = seed_chunk(&h, "t1", "d2", 0, "Beta project ships the scheduler too.").await;

        let opts = QueryOptions {
            doc_scope: Some(vec!["d2".to_owned()]),
            ..QueryOptions::default()
        };
        let result = h
            .pipeline
            .run("t1", "u1", "Who ships the scheduler?", &opts)
            .await
            .expect("scoped query");

        assert!(!result.sources.is_empty());
        assert!(
            result.sources.iter().all(|s| s.doc_id == "d2"),
            "sources must stay inside the scope"
        );
        assert!(result.sources.iter().any(|s| s.chunk_id == beta.id));
    }

    #[tokio::test]
    async fn fifty_concurrent_identical_queries_build_once() {
        // Wide rate limits so the burst exercises the cache, not the governor.
        let mut config = AppConfig::default();
        config.rate.rpm = 1000;
        config.rate.tpm = 10_000_000;
        let h = harness(config, static_llm()).await;
        seed_chunk(&h, "t1", "d1", 0, "Cooperative scheduling shares worker threads.").await;

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let pipeline = Arc::clone(&h.pipeline);
            tasks.push(tokio::spawn(async move {
                pipeline
                    .run("t1", "u1", "How is scheduling done?", &QueryOptions::default())
                    .await
            }));
        }

        let mut misses = 0;
        let mut answers = std::collections::HashSet::new();
        for task in tasks {
            let result = task.await.expect("join").expect("query");
            answers.insert(result.answer);
            if !result.cache_hit {
                misses += 1;
            }
        }

        assert_eq!(misses, 1, "exactly one caller builds");
        assert_eq!(answers.len(), 1, "all callers share one answer");
    }
}
