use std::cmp::Ordering;
use std::collections::HashMap;

/// A chunk after reciprocal rank fusion, keeping the per-retriever scores
/// for tie-breaking and confidence signals.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub chunk_id: String,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub lexical_score: Option<f32>,
}

/// Fuses dense and lexical rankings: `score(c) = Σ 1/(rank_i(c) + k_rrf)`.
///
/// If either retriever is empty the other's ranking passes through
/// unchanged. Ties break toward the higher original vector score, then the
/// chunk id for reproducibility.
pub fn reciprocal_rank_fusion(
    dense: &[(String, f32)],
    lexical: &[(String, f32)],
    k_rrf: usize,
    k_fused: usize,
) -> Vec<FusedHit> {
    let mut merged: HashMap<&str, FusedHit> = HashMap::new();
    let k = k_rrf as f32;

    for (rank, (chunk_id, score)) in dense.iter().enumerate() {
        let contribution = 1.0 / (rank as f32 + 1.0 + k);
        let hit = merged.entry(chunk_id).or_insert_with(|| FusedHit {
            chunk_id: chunk_id.clone(),
            score: 0.0,
            vector_score: None,
            lexical_score: None,
        });
        hit.score += contribution;
        hit.vector_score = Some(*score);
    }

    for (rank, (chunk_id, score)) in lexical.iter().enumerate() {
        let contribution = 1.0 / (rank as f32 + 1.0 + k);
        let hit = merged.entry(chunk_id).or_insert_with(|| FusedHit {
            chunk_id: chunk_id.clone(),
            score: 0.0,
            vector_score: None,
            lexical_score: None,
        });
        hit.score += contribution;
        hit.lexical_score = Some(*score);
    }

    let mut fused: Vec<FusedHit> = merged.into_values().collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let av = a.vector_score.unwrap_or(f32::NEG_INFINITY);
                let bv = b.vector_score.unwrap_or(f32::NEG_INFINITY);
                bv.partial_cmp(&av).unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused.truncate(k_fused);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking(ids: &[&str]) -> Vec<(String, f32)> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| ((*id).to_owned(), 1.0 - i as f32 * 0.1))
            .collect()
    }

    #[test]
    fn chunk_in_both_rankings_outscores_single_source() {
        let dense = ranking(&["a", "b", "c"]);
        let lexical = ranking(&["b", "d"]);

        let fused = reciprocal_rank_fusion(&dense, &lexical, 60, 10);
        assert_eq!(fused[0].chunk_id, "b");
        assert!(fused[0].vector_score.is_some());
        assert!(fused[0].lexical_score.is_some());
    }

    #[test]
    fn empty_lexical_passes_dense_ranking_through() {
        let dense = ranking(&["a", "b", "c"]);
        let fused = reciprocal_rank_fusion(&dense, &[], 60, 10);

        let order: Vec<&str> = fused.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_dense_passes_lexical_ranking_through() {
        let lexical = ranking(&["x", "y"]);
        let fused = reciprocal_rank_fusion(&[], &lexical, 60, 10);

        let order: Vec<&str> = fused.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["x", "y"]);
    }

    #[test]
    fn both_empty_fuses_to_nothing() {
        assert!(reciprocal_rank_fusion(&[], &[], 60, 10).is_empty());
    }

    #[test]
    fn equal_rrf_scores_break_toward_higher_vector_score() {
        // "a" ranked first in dense, "b" ranked first in lexical: identical
        // RRF mass, so the vector score decides.
        let dense = vec![("a".to_owned(), 0.9)];
        let lexical = vec![("b".to_owned(), 5.0)];

        let fused = reciprocal_rank_fusion(&dense, &lexical, 60, 10);
        assert_eq!(fused[0].chunk_id, "a");
    }

    #[test]
    fn k_fused_truncates() {
        let dense = ranking(&["a", "b", "c", "d", "e"]);
        let fused = reciprocal_rank_fusion(&dense, &[], 60, 2);
        assert_eq!(fused.len(), 2);
    }
}
