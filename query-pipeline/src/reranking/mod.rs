use std::{
    collections::HashSet,
    fs,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use common::{error::AppError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

/// Pool of cross-encoder engines guarded by a semaphore. Checkout hands out
/// a lease; dropping the lease releases the slot.
pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
}

impl RerankerPool {
    fn new_with_options(
        pool_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranker pool size must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
        }))
    }

    /// Builds the pool from config; `None` when reranking is disabled.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranker.enabled {
            return Ok(None);
        }

        let pool_size = config.reranker.pool_size.unwrap_or_else(default_pool_size);

        let mut options = RerankInitOptions::default();
        options.cache_dir = Path::new(&config.data_dir).join("fastembed").join("reranker");
        options.show_download_progress = false;
        if let Some(model_id) = &config.reranker.model_id {
            match resolve_model(model_id) {
                Some(model) => options.model_name = model,
                None => {
                    warn!(%model_id, "unknown reranker model id, using default model");
                }
            }
        }

        Self::new_with_options(pool_size, options).map(Some)
    }

    /// Check out capacity + pick an engine; enforces backpressure through
    /// the semaphore.
    pub async fn checkout(self: &Arc<Self>) -> Result<RerankerLease, AppError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Unavailable("reranker pool closed".into()))?;

        let idx = pick_engine_index(self.engines.len());
        let engine = Arc::clone(&self.engines[idx]);

        Ok(RerankerLease {
            _permit: permit,
            engine,
        })
    }
}

fn resolve_model(model_id: &str) -> Option<RerankerModel> {
    match model_id {
        "bge-reranker-base" => Some(RerankerModel::BGERerankerBase),
        _ => None,
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

/// Active lease on a single TextRerank instance.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    /// Scores documents against the query, returned in input order and
    /// squashed into [0, 1].
    pub async fn rerank(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        let count = documents.len();
        let mut guard = self.engine.lock().await;

        let results = guard
            .rerank(query.to_owned(), documents, false, None)
            .map_err(|e| AppError::InternalError(e.to_string()))?;

        let mut scores = vec![0.0f32; count];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = sigmoid(result.score);
            }
        }
        Ok(scores)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Rescoring facade used by the pipeline: a cross-encoder pool when one is
/// available, else the deterministic lexical-overlap scorer.
pub enum Reranker {
    Pool(Arc<RerankerPool>),
    Lexical,
}

impl Reranker {
    /// Stable scores in [0, 1], one per document, in input order. Pool
    /// failures fall back to the lexical scorer rather than failing the
    /// query.
    pub async fn rescore(&self, query: &str, documents: &[String]) -> Vec<f32> {
        match self {
            Self::Pool(pool) => {
                let leased = match pool.checkout().await {
                    Ok(lease) => lease.rerank(query, documents.to_vec()).await,
                    Err(e) => Err(e),
                };
                match leased {
                    Ok(scores) => scores,
                    Err(err) => {
                        warn!(error = %err, "cross-encoder rerank failed, using lexical overlap");
                        lexical_overlap_scores(query, documents)
                    }
                }
            }
            Self::Lexical => lexical_overlap_scores(query, documents),
        }
    }
}

/// Fraction of distinct query terms present in each document. A cheap,
/// deterministic stand-in for the cross-encoder.
pub fn lexical_overlap_scores(query: &str, documents: &[String]) -> Vec<f32> {
    let query_terms: HashSet<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect();

    if query_terms.is_empty() {
        return vec![0.0; documents.len()];
    }

    documents
        .iter()
        .map(|document| {
            let doc_terms: HashSet<String> = document
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(ToString::to_string)
                .collect();
            let overlap = query_terms.intersection(&doc_terms).count() as f32;
            overlap / query_terms.len() as f32
        })
        .collect()
}
