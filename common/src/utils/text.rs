use unicode_normalization::UnicodeNormalization;

/// Normalizes extracted text: Unicode NFC, control characters stripped
/// (newline survives), and whitespace runs collapsed. A run containing a
/// newline collapses to a single newline so paragraph boundaries remain
/// visible to the chunker.
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_ws: Option<char> = None;

    for ch in input.nfc() {
        let is_newline = ch == '\n' || ch == '\r';
        if ch.is_whitespace() {
            let collapsed = if is_newline { '\n' } else { ' ' };
            pending_ws = match pending_ws {
                Some('\n') => Some('\n'),
                _ => Some(collapsed),
            };
            continue;
        }
        if ch.is_control() {
            continue;
        }
        if let Some(ws) = pending_ws.take() {
            if !out.is_empty() {
                out.push(ws);
            }
        }
        out.push(ch);
    }

    out
}

/// Whitespace-delimited token count, the estimate used by the rate
/// governor and the static LLM backend.
pub fn approx_token_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Canonical form of a question used for cache fingerprints and greeting
/// detection: lowercased, whitespace collapsed, trailing punctuation
/// stripped.
pub fn normalize_question(question: &str) -> String {
    let lowered = question.to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['?', '!', '.', ','])
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_runs() {
        assert_eq!(normalize_text("a  \t b"), "a b");
    }

    #[test]
    fn normalize_keeps_single_newlines() {
        assert_eq!(normalize_text("line one\n\n  line two"), "line one\nline two");
    }

    #[test]
    fn normalize_strips_control_characters() {
        assert_eq!(normalize_text("a\u{0000}b\u{0007}c"), "abc");
    }

    #[test]
    fn normalize_applies_nfc() {
        // e + combining acute accent composes to é
        assert_eq!(normalize_text("e\u{0301}"), "\u{00e9}");
    }

    #[test]
    fn normalize_trims_leading_whitespace() {
        assert_eq!(normalize_text("   hello"), "hello");
    }

    #[test]
    fn question_normalization_is_stable() {
        assert_eq!(normalize_question("  What   IS rust?? "), "what is rust");
        assert_eq!(
            normalize_question("what is rust"),
            normalize_question("What is Rust?")
        );
    }

    #[test]
    fn token_count_counts_words() {
        assert_eq!(approx_token_count("one two  three"), 3);
        assert_eq!(approx_token_count(""), 0);
    }
}
