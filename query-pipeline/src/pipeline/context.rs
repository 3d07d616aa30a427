use std::collections::HashSet;
use std::time::Duration;

use common::{
    storage::{db::SurrealDbClient, types::chunk::Chunk},
    utils::{config::AppConfig, embedding::EmbeddingProvider, llm::LlmProvider},
};
use vector_index::IndexCache;

use crate::{
    cache::CachedAnswer,
    compress::SelectedChunk,
    confidence::Confidence,
    lexical::LexicalCatalog,
    reranking::Reranker,
    QueryOptions, SourceRef,
};

use super::stages::StageKind;

/// Message returned when neither retriever produced anything; grounded in
/// the absence of content, never fabricated.
pub const GROUNDED_EMPTY_ANSWER: &str =
    "I could not find any matching content in your documents for this question.";

/// Mutable state threaded through the build stages of one query.
pub struct StageContext<'a> {
    pub db: &'a SurrealDbClient,
    pub config: &'a AppConfig,
    pub embedder: &'a EmbeddingProvider,
    pub llm: &'a LlmProvider,
    pub index_cache: &'a IndexCache,
    pub lexical: &'a LexicalCatalog,
    pub reranker: &'a Reranker,

    pub tenant_id: &'a str,
    pub question: &'a str,
    pub opts: &'a QueryOptions,
    pub scope: Option<HashSet<String>>,

    /// Candidates in current ranking order, paired with their current score
    /// (fused after retrieval, rerank score after reranking).
    pub candidates: Vec<(Chunk, f32)>,
    pub selected: Vec<SelectedChunk>,
    pub answer: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub suggestions: Vec<String>,
    pub confidence: Option<Confidence>,

    pub embedding_degraded: bool,
    pub llm_degraded: bool,

    finished: Option<CachedAnswer>,
    timings: Vec<(StageKind, Duration)>,
}

impl<'a> StageContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: &'a SurrealDbClient,
        config: &'a AppConfig,
        embedder: &'a EmbeddingProvider,
        llm: &'a LlmProvider,
        index_cache: &'a IndexCache,
        lexical: &'a LexicalCatalog,
        reranker: &'a Reranker,
        tenant_id: &'a str,
        question: &'a str,
        opts: &'a QueryOptions,
    ) -> Self {
        let scope = opts
            .doc_scope
            .as_ref()
            .map(|ids| ids.iter().cloned().collect::<HashSet<String>>());

        Self {
            db,
            config,
            embedder,
            llm,
            index_cache,
            lexical,
            reranker,
            tenant_id,
            question,
            opts,
            scope,
            candidates: Vec::new(),
            selected: Vec::new(),
            answer: None,
            tokens_in: 0,
            tokens_out: 0,
            suggestions: Vec::new(),
            confidence: None,
            embedding_degraded: false,
            llm_degraded: false,
            finished: None,
            timings: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Short-circuits the remaining stages with a complete answer.
    pub fn finish(&mut self, answer: CachedAnswer) {
        self.finished = Some(answer);
    }

    pub fn finish_grounded_empty(&mut self) {
        self.finish(CachedAnswer {
            answer: GROUNDED_EMPTY_ANSWER.to_owned(),
            sources: Vec::new(),
            confidence: Confidence::none(),
            suggestions: Vec::new(),
            tokens_in: 0,
            tokens_out: 0,
        });
    }

    pub fn record_stage_duration(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn stage_timings(&self) -> &[(StageKind, Duration)] {
        &self.timings
    }

    pub fn selected_texts(&self) -> Vec<String> {
        self.selected.iter().map(|c| c.text.clone()).collect()
    }

    /// Assembles the cacheable outcome after the last stage.
    pub fn into_answer(self) -> CachedAnswer {
        if let Some(finished) = self.finished {
            return finished;
        }

        let sources = self
            .selected
            .iter()
            .map(|chunk| SourceRef {
                doc_id: chunk.doc_id.clone(),
                chunk_id: chunk.chunk_id.clone(),
                page: chunk.page,
                score: chunk.score,
            })
            .collect();

        CachedAnswer {
            answer: self.answer.unwrap_or_default(),
            sources,
            confidence: self.confidence.unwrap_or_else(Confidence::none),
            suggestions: self.suggestions,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
        }
    }
}
