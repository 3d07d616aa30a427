use common::{error::AppError, utils::config::ChunkSettings};

use crate::extract::ExtractedPage;

/// One deterministic chunk of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub ordinal: u32,
    pub text: String,
    pub token_count: u32,
    pub page: u32,
}

/// Token segmentation backend. The whitespace segmenter is the default and
/// needs no model files; a HuggingFace tokenizer file can be named via
/// `chunk.tokenizer_id` for model-accurate token counts.
enum Segmenter {
    Whitespace,
    HuggingFace(Box<tokenizers::Tokenizer>),
}

impl Segmenter {
    fn from_id(tokenizer_id: &str) -> Result<Self, AppError> {
        if tokenizer_id == "whitespace" {
            return Ok(Self::Whitespace);
        }
        let tokenizer = tokenizers::Tokenizer::from_file(tokenizer_id).map_err(|e| {
            AppError::Validation(format!("cannot load tokenizer '{tokenizer_id}': {e}"))
        })?;
        Ok(Self::HuggingFace(Box::new(tokenizer)))
    }

    /// Byte spans of tokens in the input, in order.
    fn spans(&self, text: &str) -> Result<Vec<(usize, usize)>, AppError> {
        match self {
            Self::Whitespace => {
                let mut spans = Vec::new();
                let mut start: Option<usize> = None;
                for (i, ch) in text.char_indices() {
                    if ch.is_whitespace() {
                        if let Some(s) = start.take() {
                            spans.push((s, i));
                        }
                    } else if start.is_none() {
                        start = Some(i);
                    }
                }
                if let Some(s) = start {
                    spans.push((s, text.len()));
                }
                Ok(spans)
            }
            Self::HuggingFace(tokenizer) => {
                let encoding = tokenizer
                    .encode(text, false)
                    .map_err(|e| AppError::Validation(format!("tokenization failed: {e}")))?;
                Ok(encoding
                    .get_offsets()
                    .iter()
                    .filter(|(start, end)| end > start)
                    .copied()
                    .collect())
            }
        }
    }
}

/// Deterministic token-bounded chunker: fixed-size windows snapped backward
/// to sentence boundaries, with overlap between consecutive windows.
/// Identical input and settings reproduce identical chunks bit-for-bit.
pub struct Chunker {
    segmenter: Segmenter,
    settings: ChunkSettings,
}

impl Chunker {
    pub fn from_settings(settings: &ChunkSettings) -> Result<Self, AppError> {
        if settings.target_tokens == 0 || settings.min_tokens == 0 {
            return Err(AppError::Validation(
                "chunk token bounds must be positive".into(),
            ));
        }
        if settings.min_tokens > settings.target_tokens {
            return Err(AppError::Validation(
                "chunk.min_tokens must not exceed chunk.target_tokens".into(),
            ));
        }
        if settings.overlap_tokens >= settings.min_tokens {
            return Err(AppError::Validation(
                "chunk.overlap_tokens must be smaller than chunk.min_tokens".into(),
            ));
        }

        Ok(Self {
            segmenter: Segmenter::from_id(&settings.tokenizer_id)?,
            settings: settings.clone(),
        })
    }

    pub fn chunk_pages(&self, pages: &[ExtractedPage]) -> Result<Vec<ChunkPiece>, AppError> {
        let (full_text, page_starts) = concatenate(pages);
        let spans = self.segmenter.spans(&full_text)?;
        let n = spans.len();
        if n == 0 {
            return Err(AppError::CorruptInput("document contains no tokens".into()));
        }

        let target = self.settings.target_tokens;
        let min = self.settings.min_tokens;
        let overlap = self.settings.overlap_tokens;

        let mut pieces: Vec<ChunkPiece> = Vec::new();
        let mut start = 0usize;
        let mut prev_window: Option<(usize, usize)> = None;

        loop {
            let hard_end = (start + target).min(n);
            let mut end = hard_end;

            // Snap backward to the nearest sentence terminator, as long as
            // the window keeps at least min tokens.
            if hard_end < n && start + min <= hard_end {
                for candidate in ((start + min)..=hard_end).rev() {
                    if is_sentence_boundary(&full_text, &spans, candidate) {
                        end = candidate;
                        break;
                    }
                }
            }

            // A trailing window below min tokens that starts inside the
            // previous window's overlap band carries nothing new; drop it.
            let is_final = end >= n;
            let covered_by_overlap = prev_window.is_some_and(|(_, prev_end)| {
                start >= prev_end.saturating_sub(overlap) && start < prev_end
            });
            if !(is_final && end - start < min && covered_by_overlap) {
                let byte_start = spans[start].0;
                let byte_end = spans[end - 1].1;
                pieces.push(ChunkPiece {
                    ordinal: pieces.len() as u32,
                    text: slice_safe(&full_text, byte_start, byte_end),
                    token_count: (end - start) as u32,
                    page: page_of(&page_starts, byte_start),
                });
            }

            if is_final {
                break;
            }
            // The next window begins overlap_tokens before this one ended.
            prev_window = Some((start, end));
            start = end.saturating_sub(overlap);
        }

        Ok(pieces)
    }
}

fn concatenate(pages: &[ExtractedPage]) -> (String, Vec<(usize, u32)>) {
    let mut text = String::new();
    let mut page_starts = Vec::with_capacity(pages.len());
    for page in pages {
        if !text.is_empty() {
            text.push('\n');
        }
        page_starts.push((text.len(), page.page));
        text.push_str(&page.text);
    }
    (text, page_starts)
}

/// Page of the token starting at `byte_offset`: the last page whose start
/// is at or before the offset.
fn page_of(page_starts: &[(usize, u32)], byte_offset: usize) -> u32 {
    page_starts
        .iter()
        .take_while(|(start, _)| *start <= byte_offset)
        .last()
        .map(|(_, page)| *page)
        .unwrap_or(1)
}

/// Whether the window may end before token index `end` (exclusive): the
/// previous token closes a sentence, or a newline gap is followed by a
/// capitalized token.
fn is_sentence_boundary(text: &str, spans: &[(usize, usize)], end: usize) -> bool {
    let Some(&(prev_start, prev_end)) = spans.get(end - 1) else {
        return false;
    };
    let prev_token = &text[prev_start..prev_end];
    if prev_token.ends_with(['.', '!', '?']) {
        return true;
    }

    if let Some(&(next_start, _)) = spans.get(end) {
        let gap = &text[prev_end..next_start];
        if gap.contains('\n') {
            let next_starts_upper = text[next_start..]
                .chars()
                .next()
                .is_some_and(char::is_uppercase);
            return next_starts_upper;
        }
    }
    false
}

/// Slices on char boundaries even if a tokenizer reported offsets inside a
/// multi-byte character.
fn slice_safe(text: &str, mut start: usize, mut end: usize) -> String {
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text[start..end].to_string()
}
