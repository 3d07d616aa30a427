use common::storage::types::chunk::Chunk;

/// A chunk chosen for the LLM context window.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub page: u32,
    pub text: String,
    pub score: f32,
    pub token_count: u32,
}

/// Greedy token-budgeted selection in the given (rerank) order.
///
/// A candidate that fits the remaining budget is taken whole. A candidate
/// larger than the entire budget is truncated to the nearest sentence
/// boundary inside the space left. Candidates in between are skipped, so a
/// later smaller chunk can still fill the gap.
pub fn compress(candidates: &[(Chunk, f32)], budget_tokens: usize) -> Vec<SelectedChunk> {
    let mut selected = Vec::new();
    let mut used: usize = 0;

    for (chunk, score) in candidates {
        let token_count = chunk.token_count as usize;
        let remaining = budget_tokens.saturating_sub(used);
        if remaining == 0 {
            break;
        }

        if token_count <= remaining {
            used += token_count;
            selected.push(SelectedChunk {
                chunk_id: chunk.id.clone(),
                doc_id: chunk.document_id.clone(),
                page: chunk.page,
                text: chunk.text.clone(),
                score: *score,
                token_count: chunk.token_count,
            });
            continue;
        }

        if token_count > budget_tokens {
            let (text, kept) = truncate_to_sentence(&chunk.text, remaining);
            if kept > 0 {
                used += kept;
                selected.push(SelectedChunk {
                    chunk_id: chunk.id.clone(),
                    doc_id: chunk.document_id.clone(),
                    page: chunk.page,
                    text,
                    score: *score,
                    token_count: kept as u32,
                });
            }
        }
    }

    selected
}

/// Cuts text to at most `budget` whitespace tokens, preferring the last
/// sentence terminator inside the budget; falls back to a hard cut.
fn truncate_to_sentence(text: &str, budget: usize) -> (String, usize) {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= budget {
        return (tokens.join(" "), tokens.len());
    }

    let window = &tokens[..budget];
    let sentence_end = window
        .iter()
        .rposition(|token| token.ends_with(['.', '!', '?']));

    let keep = match sentence_end {
        Some(i) => i + 1,
        None => budget,
    };
    (tokens[..keep].join(" "), keep)
}
