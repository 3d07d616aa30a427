use std::sync::Arc;

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use crate::{
    error::AppError,
    utils::{
        config::{AppConfig, EmbeddingBackend},
        text::approx_token_count,
    },
};

/// Dense-vector encoder shared by ingestion and queries.
///
/// Two backends: the OpenAI embeddings endpoint, and a deterministic
/// feature-hashing encoder used in tests and offline setups. Every vector
/// leaves this type L2-normalized so inner-product search equals cosine.
pub struct EmbeddingProvider {
    backend: Backend,
    dimension: usize,
    max_batch_size: usize,
    max_batch_tokens: u64,
}

enum Backend {
    OpenAi {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
    },
    Hashed,
}

impl EmbeddingProvider {
    pub fn from_config(
        config: &AppConfig,
        client: Option<Arc<Client<OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        let settings = &config.embedding;
        let backend = match settings.backend {
            EmbeddingBackend::OpenAi => {
                let client = client.ok_or_else(|| {
                    AppError::Validation(
                        "openai embedding backend requires a configured client".into(),
                    )
                })?;
                Backend::OpenAi {
                    client,
                    model: settings.model.clone(),
                }
            }
            EmbeddingBackend::Hashed => Backend::Hashed,
        };

        Ok(Self {
            backend,
            dimension: settings.dimensions,
            max_batch_size: settings.max_batch_size.max(1),
            max_batch_tokens: settings.max_batch_tokens.max(1) as u64,
        })
    }

    /// Deterministic offline provider. Used by tests and degraded setups.
    pub fn new_hashed(dimension: usize) -> Self {
        Self {
            backend: Backend::Hashed,
            dimension,
            max_batch_size: 64,
            max_batch_tokens: 16_000,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            Backend::OpenAi { .. } => "openai",
            Backend::Hashed => "hashed",
        }
    }

    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(&[input.to_owned()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::EmbeddingFailure("empty embedding response".into()))
    }

    /// Encodes a batch of texts, splitting into provider calls bounded by
    /// both batch count and total token estimate. Output order matches the
    /// input order.
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(inputs.len());
        for batch in self.split_batches(inputs) {
            let mut encoded = self.encode_with_retries(batch).await?;
            for vector in &mut encoded {
                if vector.len() != self.dimension {
                    return Err(AppError::EmbeddingFailure(format!(
                        "provider returned dimension {} instead of {}",
                        vector.len(),
                        self.dimension
                    )));
                }
                l2_normalize(vector);
            }
            vectors.append(&mut encoded);
        }

        Ok(vectors)
    }

    fn split_batches<'a>(&self, inputs: &'a [String]) -> Vec<&'a [String]> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut tokens: u64 = 0;

        for (i, input) in inputs.iter().enumerate() {
            let cost = approx_token_count(input).max(1);
            let count = i - start;
            if count > 0 && (count >= self.max_batch_size || tokens + cost > self.max_batch_tokens)
            {
                batches.push(&inputs[start..i]);
                start = i;
                tokens = 0;
            }
            tokens += cost;
        }
        batches.push(&inputs[start..]);
        batches
    }

    async fn encode_with_retries(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        match &self.backend {
            Backend::OpenAi { client, model } => {
                let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
                Retry::spawn(retry_strategy, || encode_openai(client, model, batch))
                    .await
                    .map_err(|e| AppError::EmbeddingFailure(e.to_string()))
            }
            Backend::Hashed => Ok(batch
                .iter()
                .map(|text| hashed_embedding(text, self.dimension))
                .collect()),
        }
    }
}

async fn encode_openai(
    client: &Client<OpenAIConfig>,
    model: &str,
    batch: &[String],
) -> Result<Vec<Vec<f32>>, AppError> {
    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .input(batch.to_vec())
        .build()?;

    let response = client.embeddings().create(request).await?;

    let mut data = response.data;
    data.sort_by_key(|e| e.index);

    debug!(batch = batch.len(), returned = data.len(), "embedded batch");

    if data.len() != batch.len() {
        return Err(AppError::EmbeddingFailure(format!(
            "provider returned {} embeddings for {} inputs",
            data.len(),
            batch.len()
        )));
    }

    Ok(data.into_iter().map(|e| e.embedding).collect())
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Deterministic feature-hashing embedding: each lowercased word hashes to
/// a bucket (FNV-1a, stable across runs and platforms), then the vector is
/// L2-normalized. Texts with no words map to a fixed unit vector.
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];
    let mut any = false;

    for word in text.to_lowercase().split_whitespace() {
        let bucket = (fnv1a(word.as_bytes()) as usize) % dimension;
        vector[bucket] += 1.0;
        any = true;
    }

    if !any {
        vector[0] = 1.0;
    }
    l2_normalize(&mut vector);
    vector
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(vector: &[f32]) -> f32 {
        vector.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    #[tokio::test]
    async fn hashed_embeddings_are_unit_length() {
        let provider = EmbeddingProvider::new_hashed(64);
        let vectors = provider
            .embed_batch(&["tokio runtime".into(), "vector search".into()])
            .await
            .expect("hashed embedding should not fail");

        for vector in &vectors {
            assert_eq!(vector.len(), 64);
            assert!((norm(vector) - 1.0).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn hashed_embeddings_are_deterministic() {
        let provider = EmbeddingProvider::new_hashed(32);
        let a = provider.embed("retrieval augmented generation").await.expect("embed");
        let b = provider.embed("retrieval augmented generation").await.expect("embed");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn empty_text_still_produces_a_unit_vector() {
        let provider = EmbeddingProvider::new_hashed(8);
        let vector = provider.embed("").await.expect("embed");
        assert!((norm(&vector) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn batches_respect_count_and_token_bounds() {
        let mut provider = EmbeddingProvider::new_hashed(8);
        provider.max_batch_size = 2;
        provider.max_batch_tokens = 5;

        let inputs: Vec<String> = vec![
            "one two three".into(),
            "four five".into(),
            "six".into(),
            "seven eight nine ten eleven twelve".into(),
        ];
        let batches = provider.split_batches(&inputs);

        assert!(batches.iter().all(|b| b.len() <= 2));
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, inputs.len());
    }
}
