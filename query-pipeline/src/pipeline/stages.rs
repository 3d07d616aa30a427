use std::collections::HashMap;

use async_trait::async_trait;
use tokio::time::Duration;
use tracing::warn;

use common::{error::AppError, storage::types::chunk::Chunk, utils::text::approx_token_count};

use crate::{
    compress::compress,
    confidence::{
        answer_context_overlap, has_insufficient_phrasing, score_confidence, Confidence,
        ConfidenceLevel, ConfidenceSignals,
    },
    fusion::reciprocal_rank_fusion,
    reranking::lexical_overlap_scores,
    suggest::{fallback_suggestions, generate_suggestions},
};

use super::context::StageContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Retrieve,
    Rerank,
    Compress,
    Generate,
    Score,
    Suggest,
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), AppError>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

/// The build portion of the query state machine, in execution order.
pub fn build_stages() -> Vec<BoxedStage> {
    vec![
        Box::new(RetrieveStage),
        Box::new(RerankStage),
        Box::new(CompressStage),
        Box::new(GenerateStage),
        Box::new(ScoreStage),
        Box::new(SuggestStage),
    ]
}

const GROUNDING_SYSTEM_MESSAGE: &str = "You answer questions strictly from the \
provided context. If the context does not contain the answer, state that you \
have insufficient information. Never invent facts, never cite knowledge \
outside the context.";

struct RetrieveStage;

#[async_trait]
impl PipelineStage for RetrieveStage {
    fn kind(&self) -> StageKind {
        StageKind::Retrieve
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), AppError> {
        let k = ctx
            .opts
            .top_k
            .unwrap_or(ctx.config.retrieval.k_retrieval)
            .clamp(1, 100);

        let mut dense: Vec<(String, f32)> = Vec::new();
        let embed_budget = Duration::from_secs(ctx.config.llm.request_timeout_secs.max(1));
        match tokio::time::timeout(embed_budget, ctx.embedder.embed(ctx.question)).await {
            Ok(Ok(query_vector)) => {
                let index = ctx.index_cache.read(ctx.tenant_id).await?;
                dense = index
                    .search(&query_vector, k)?
                    .into_iter()
                    .map(|hit| (hit.chunk_id, hit.score))
                    .collect();
            }
            Ok(Err(AppError::EmbeddingFailure(detail))) => {
                warn!(%detail, "embedding failed, degrading to lexical-only retrieval");
                ctx.embedding_degraded = true;
            }
            Ok(Err(other)) => return Err(other),
            Err(_) => {
                warn!("embedding timed out, degrading to lexical-only retrieval");
                ctx.embedding_degraded = true;
            }
        }

        let lexical: Vec<(String, f32)> = ctx
            .lexical
            .search(ctx.db, ctx.tenant_id, ctx.question, k, ctx.scope.as_ref())
            .await?
            .into_iter()
            .map(|hit| (hit.chunk_id, hit.score))
            .collect();

        if dense.is_empty() && lexical.is_empty() {
            ctx.finish_grounded_empty();
            return Ok(());
        }

        let fused = reciprocal_rank_fusion(
            &dense,
            &lexical,
            ctx.config.retrieval.k_rrf,
            ctx.config.retrieval.k_fused,
        );

        let ids: Vec<String> = fused.iter().map(|hit| hit.chunk_id.clone()).collect();
        let mut by_id: HashMap<String, Chunk> = Chunk::by_ids(ctx.db, ctx.tenant_id, &ids)
            .await?
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();

        ctx.candidates = fused
            .iter()
            .filter_map(|hit| {
                let chunk = by_id.remove(&hit.chunk_id)?;
                let in_scope = ctx
                    .scope
                    .as_ref()
                    .is_none_or(|scope| scope.contains(&chunk.document_id));
                in_scope.then_some((chunk, hit.score))
            })
            .collect();

        if ctx.candidates.is_empty() {
            ctx.finish_grounded_empty();
        }
        Ok(())
    }
}

struct RerankStage;

#[async_trait]
impl PipelineStage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), AppError> {
        if ctx.is_finished() {
            return Ok(());
        }

        let texts: Vec<String> = ctx
            .candidates
            .iter()
            .map(|(chunk, _)| chunk.text.clone())
            .collect();

        let enabled = ctx.opts.enable_rerank && ctx.config.reranker.enabled;
        let scores = if enabled {
            ctx.reranker.rescore(ctx.question, &texts).await
        } else {
            // Rescoring is skipped but the confidence signals still need
            // stable scores in [0, 1].
            lexical_overlap_scores(ctx.question, &texts)
        };

        let mut rescored: Vec<(Chunk, f32)> = std::mem::take(&mut ctx.candidates)
            .into_iter()
            .zip(scores)
            .map(|((chunk, _fused), score)| (chunk, score))
            .collect();

        if enabled {
            // Stable sort keeps the fused order for equal rerank scores.
            rescored.sort_by(|a, b| {
                b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        ctx.candidates = rescored;
        Ok(())
    }
}

struct CompressStage;

#[async_trait]
impl PipelineStage for CompressStage {
    fn kind(&self) -> StageKind {
        StageKind::Compress
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), AppError> {
        if ctx.is_finished() {
            return Ok(());
        }
        ctx.selected = compress(&ctx.candidates, ctx.config.context.budget_tokens);
        if ctx.selected.is_empty() {
            ctx.finish_grounded_empty();
        }
        Ok(())
    }
}

struct GenerateStage;

#[async_trait]
impl PipelineStage for GenerateStage {
    fn kind(&self) -> StageKind {
        StageKind::Generate
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), AppError> {
        if ctx.is_finished() {
            return Ok(());
        }

        let context_block = ctx
            .selected
            .iter()
            .map(|chunk| format!("[doc {} p.{}]\n{}", chunk.doc_id, chunk.page, chunk.text))
            .collect::<Vec<_>>()
            .join("\n---\n");
        let user_message = format!(
            "Context:\n<<<\n{context_block}\n>>>\n\nQuestion: {}",
            ctx.question
        );

        match ctx.llm.complete(GROUNDING_SYSTEM_MESSAGE, &user_message).await {
            Ok(output) => {
                ctx.tokens_in = output.tokens_in;
                ctx.tokens_out = output.tokens_out;
                ctx.answer = Some(output.text);
            }
            Err(AppError::LLMFailure(detail)) => {
                warn!(%detail, "generation failed, returning degraded response");
                ctx.llm_degraded = true;
                ctx.answer = Some(degraded_answer(ctx));
                ctx.tokens_in = approx_token_count(&user_message);
                ctx.tokens_out = 0;
            }
            Err(AppError::DeadlineExceeded) => {
                warn!("generation deadline exceeded, returning degraded response");
                ctx.llm_degraded = true;
                ctx.answer = Some(degraded_answer(ctx));
                ctx.tokens_in = 0;
                ctx.tokens_out = 0;
            }
            Err(other) => return Err(other),
        }
        Ok(())
    }
}

/// Deterministic response when synthesis is impossible: the selected
/// sources verbatim, with the degradation spelled out.
fn degraded_answer(ctx: &StageContext<'_>) -> String {
    let mut answer =
        String::from("I was unable to synthesize an answer. The most relevant passages are:\n");
    for chunk in &ctx.selected {
        answer.push_str(&format!(
            "- [doc {} p.{}] {}\n",
            chunk.doc_id, chunk.page, chunk.text
        ));
    }
    answer
}

struct ScoreStage;

#[async_trait]
impl PipelineStage for ScoreStage {
    fn kind(&self) -> StageKind {
        StageKind::Score
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), AppError> {
        if ctx.is_finished() {
            return Ok(());
        }

        if ctx.llm_degraded {
            ctx.confidence = Some(Confidence::none());
            return Ok(());
        }

        let answer = ctx.answer.clone().unwrap_or_default();
        let ranked_scores: Vec<f32> = ctx.selected.iter().map(|chunk| chunk.score).collect();
        let top = ranked_scores.first().copied().unwrap_or(0.0);
        let top3 = &ranked_scores[..ranked_scores.len().min(3)];
        let mean_top3 = if top3.is_empty() {
            0.0
        } else {
            top3.iter().sum::<f32>() / top3.len() as f32
        };

        let signals = ConfidenceSignals {
            top_rerank: top,
            mean_top3,
            answer_overlap: answer_context_overlap(&answer, &ctx.selected_texts()),
            insufficient_phrasing: has_insufficient_phrasing(&answer),
        };

        let mut confidence = score_confidence(signals, &ctx.config.confidence);
        if ctx.embedding_degraded {
            confidence = confidence.capped_at(ConfidenceLevel::Low);
        }
        ctx.confidence = Some(confidence);
        Ok(())
    }
}

struct SuggestStage;

#[async_trait]
impl PipelineStage for SuggestStage {
    fn kind(&self) -> StageKind {
        StageKind::Suggest
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), AppError> {
        if ctx.is_finished() {
            return Ok(());
        }

        let answer = ctx.answer.clone().unwrap_or_default();
        let texts = ctx.selected_texts();
        ctx.suggestions = if ctx.llm_degraded {
            fallback_suggestions(ctx.question, &texts)
        } else {
            generate_suggestions(ctx.llm, ctx.question, &answer, &texts).await
        };
        Ok(())
    }
}
