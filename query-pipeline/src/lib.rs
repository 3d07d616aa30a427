#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! The enhanced query pipeline: hybrid retrieval, rerank, compression,
//! grounded generation, confidence scoring and follow-up suggestions, all
//! gated by the per-tenant governors and the single-flight response cache.

pub mod cache;
pub mod compress;
pub mod confidence;
pub mod fusion;
pub mod lexical;
pub mod pipeline;
pub mod reranking;
pub mod suggest;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::confidence::Confidence;

/// Version tag mixed into every cache fingerprint; bump on any change that
/// alters answers for identical inputs.
pub const PIPELINE_VERSION: &str = "rag-pipeline/1";

/// Closed option set accepted by the query entrypoint.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub session_id: Option<String>,
    pub top_k: Option<usize>,
    pub doc_scope: Option<Vec<String>>,
    pub enable_rerank: bool,
    pub enable_cache: bool,
    pub stream: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            top_k: None,
            doc_scope: None,
            enable_rerank: true,
            enable_cache: true,
            stream: false,
        }
    }
}

/// One supporting passage in a query answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub doc_id: String,
    pub chunk_id: String,
    pub page: u32,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub message_id: String,
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence: Confidence,
    pub suggestions: Vec<String>,
    pub cache_hit: bool,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

/// Event in the streaming delivery mode: answer tokens followed by one
/// terminal payload. The sequence is lazy, finite and non-restartable.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    Token(String),
    Final(QueryResult),
}

/// Turns a finished result into the streaming event sequence.
pub fn stream_events(result: QueryResult) -> impl Stream<Item = QueryEvent> {
    async_stream::stream! {
        for token in result.answer.split_inclusive(' ') {
            yield QueryEvent::Token(token.to_owned());
        }
        yield QueryEvent::Final(result);
    }
}
