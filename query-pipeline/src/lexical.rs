use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::chunk::Chunk},
};

const K1: f32 = 1.2;
const B: f32 = 0.75;

#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub chunk_id: String,
    pub score: f32,
}

struct IndexedChunk {
    chunk_id: String,
    doc_id: String,
    length: f32,
    term_freq: HashMap<String, f32>,
}

/// In-memory BM25 index over one tenant's chunk set.
pub struct Bm25Index {
    chunks: Vec<IndexedChunk>,
    doc_freq: HashMap<String, f32>,
    avg_length: f32,
}

fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl Bm25Index {
    pub fn build(chunks: &[Chunk]) -> Self {
        let mut indexed = Vec::with_capacity(chunks.len());
        let mut doc_freq: HashMap<String, f32> = HashMap::new();
        let mut total_length = 0.0f32;

        for chunk in chunks {
            let tokens = terms(&chunk.text);
            let length = tokens.len() as f32;
            total_length += length;

            let mut term_freq: HashMap<String, f32> = HashMap::new();
            for token in tokens {
                *term_freq.entry(token).or_insert(0.0) += 1.0;
            }
            for term in term_freq.keys() {
                *doc_freq.entry(term.clone()).or_insert(0.0) += 1.0;
            }
            indexed.push(IndexedChunk {
                chunk_id: chunk.id.clone(),
                doc_id: chunk.document_id.clone(),
                length,
                term_freq,
            });
        }

        let avg_length = if indexed.is_empty() {
            0.0
        } else {
            total_length / indexed.len() as f32
        };

        Self {
            chunks: indexed,
            doc_freq,
            avg_length,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn search(
        &self,
        query: &str,
        k: usize,
        doc_scope: Option<&HashSet<String>>,
    ) -> Vec<LexicalHit> {
        if self.chunks.is_empty() || k == 0 {
            return Vec::new();
        }

        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Vec::new();
        }
        let n = self.chunks.len() as f32;

        let mut hits: Vec<LexicalHit> = self
            .chunks
            .iter()
            .filter(|chunk| doc_scope.is_none_or(|scope| scope.contains(&chunk.doc_id)))
            .filter_map(|chunk| {
                let mut score = 0.0f32;
                for term in &query_terms {
                    let Some(tf) = chunk.term_freq.get(term) else {
                        continue;
                    };
                    let df = self.doc_freq.get(term).copied().unwrap_or(0.0);
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let denom = tf + K1 * (1.0 - B + B * chunk.length / self.avg_length.max(1.0));
                    score += idf * tf * (K1 + 1.0) / denom;
                }
                (score > 0.0).then(|| LexicalHit {
                    chunk_id: chunk.chunk_id.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        hits
    }
}

struct BuiltIndex {
    revision: u64,
    index: Arc<Bm25Index>,
}

/// Per-tenant BM25 indexes, built lazily on the first query after an ingest
/// or delete changed the tenant's chunk set, then memoized until the next
/// revision bump.
#[derive(Default)]
pub struct LexicalCatalog {
    revisions: std::sync::Mutex<HashMap<String, u64>>,
    built: Mutex<HashMap<String, BuiltIndex>>,
}

impl LexicalCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after any successful ingest or delete; the rebuild itself is
    /// deferred to the next query.
    pub fn invalidate(&self, tenant_id: &str) {
        if let Ok(mut revisions) = self.revisions.lock() {
            *revisions.entry(tenant_id.to_owned()).or_insert(0) += 1;
        }
    }

    fn revision(&self, tenant_id: &str) -> u64 {
        self.revisions
            .lock()
            .map(|revisions| revisions.get(tenant_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub async fn search(
        &self,
        db: &SurrealDbClient,
        tenant_id: &str,
        query: &str,
        k: usize,
        doc_scope: Option<&HashSet<String>>,
    ) -> Result<Vec<LexicalHit>, AppError> {
        let index = self.index_for(db, tenant_id).await?;
        Ok(index.search(query, k, doc_scope))
    }

    async fn index_for(
        &self,
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<Arc<Bm25Index>, AppError> {
        let revision = self.revision(tenant_id);

        let mut built = self.built.lock().await;
        if let Some(entry) = built.get(tenant_id) {
            if entry.revision == revision {
                return Ok(Arc::clone(&entry.index));
            }
        }

        let chunks = Chunk::all_for_tenant(db, tenant_id).await?;
        let index = Arc::new(Bm25Index::build(&chunks));
        debug!(%tenant_id, revision, chunks = index.len(), "rebuilt lexical index");
        built.insert(
            tenant_id.to_owned(),
            BuiltIndex {
                revision,
                index: Arc::clone(&index),
            },
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn chunk(tenant: &str, doc: &str, text: &str) -> Chunk {
        Chunk::new(
            doc.to_owned(),
            tenant.to_owned(),
            0,
            text.to_owned(),
            text.split_whitespace().count() as u32,
            1,
        )
    }

    #[test]
    fn bm25_prefers_higher_term_frequency() {
        let chunks = vec![
            chunk("t1", "d1", "apple apple apple pie recipe"),
            chunk("t1", "d2", "apple tart with pears"),
            chunk("t1", "d3", "completely unrelated text"),
        ];
        let index = Bm25Index::build(&chunks);

        let hits = index.search("apple", 3, None);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, chunks[0].id);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn bm25_rewards_rare_terms() {
        let chunks = vec![
            chunk("t1", "d1", "the quick brown fox jumps"),
            chunk("t1", "d2", "the slow brown turtle walks"),
            chunk("t1", "d3", "the quick grey wolf runs"),
        ];
        let index = Bm25Index::build(&chunks);

        // "fox" appears once; "the" appears everywhere.
        let hits = index.search("the fox", 3, None);
        assert_eq!(hits[0].chunk_id, chunks[0].id);
    }

    #[test]
    fn doc_scope_filters_hits() {
        let chunks = vec![
            chunk("t1", "d1", "rust async runtime"),
            chunk("t1", "d2", "rust borrow checker"),
        ];
        let index = Bm25Index::build(&chunks);

        let scope: HashSet<String> = ["d2".to_string()].into();
        let hits = index.search("rust", 5, Some(&scope));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, chunks[1].id);
    }

    #[test]
    fn empty_query_returns_nothing() {
        let index = Bm25Index::build(&[chunk("t1", "d1", "content")]);
        assert!(index.search("  ... ", 5, None).is_empty());
    }

    #[tokio::test]
    async fn catalog_memoizes_until_invalidated() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        let catalog = LexicalCatalog::new();

        let first = chunk("t1", "d1", "tokio cooperative scheduling");
        db.store_item(first.clone()).await.expect("store");

        let hits = catalog
            .search(&db, "t1", "tokio", 5, None)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);

        // New chunk is invisible until a revision bump: build is memoized.
        let second = chunk("t1", "d2", "tokio channels and tasks");
        db.store_item(second.clone()).await.expect("store");
        let hits = catalog
            .search(&db, "t1", "tokio", 5, None)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1, "memoized index must be reused");

        catalog.invalidate("t1");
        let hits = catalog
            .search(&db, "t1", "tokio", 5, None)
            .await
            .expect("search");
        assert_eq!(hits.len(), 2, "bumped revision rebuilds lazily");
    }

    #[tokio::test]
    async fn catalog_is_tenant_scoped() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        let catalog = LexicalCatalog::new();

        db.store_item(chunk("t1", "d1", "shared secret phrase"))
            .await
            .expect("store");

        let hits = catalog
            .search(&db, "t2", "secret", 5, None)
            .await
            .expect("search");
        assert!(hits.is_empty(), "tenant t2 must not see t1 chunks");
    }
}
