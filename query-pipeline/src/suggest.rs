use std::collections::{HashMap, HashSet};

use tracing::debug;

use common::utils::llm::LlmProvider;

const SUGGESTION_COUNT: usize = 3;

const SUGGESTION_SYSTEM_MESSAGE: &str = "You generate follow-up questions for a \
document question-answering assistant. Given an answer and its supporting \
context, reply with a JSON array of exactly 3 short follow-up questions a \
reader might ask next. Reply with the JSON array only.";

/// Produces exactly three follow-up queries. The LLM path parses a JSON
/// array; any failure falls back to the deterministic phrase templates, so
/// this never fails the pipeline.
pub async fn generate_suggestions(
    llm: &LlmProvider,
    question: &str,
    answer: &str,
    context_texts: &[String],
) -> Vec<String> {
    let user_message = format!(
        "Answer:\n{answer}\n\nContext:\n{}",
        context_texts.join("\n---\n")
    );

    match llm.complete(SUGGESTION_SYSTEM_MESSAGE, &user_message).await {
        Ok(output) => match parse_suggestions(&output.text) {
            Some(suggestions) => suggestions,
            None => {
                debug!("suggestion output was not a JSON array, using fallback");
                fallback_suggestions(question, context_texts)
            }
        },
        Err(err) => {
            debug!(error = %err, "suggestion generation degraded to fallback");
            fallback_suggestions(question, context_texts)
        }
    }
}

fn parse_suggestions(text: &str) -> Option<Vec<String>> {
    let parsed: Vec<String> = serde_json::from_str(text.trim()).ok()?;
    let cleaned: Vec<String> = parsed
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(SUGGESTION_COUNT)
        .collect();
    (cleaned.len() == SUGGESTION_COUNT).then_some(cleaned)
}

/// Deterministic fallback: template the most salient context phrases that
/// the question does not already mention.
pub fn fallback_suggestions(question: &str, context_texts: &[String]) -> Vec<String> {
    let phrases = salient_phrases(question, context_texts);
    let mut suggestions = Vec::with_capacity(SUGGESTION_COUNT);

    if let Some(first) = phrases.first() {
        suggestions.push(format!("What about {first}?"));
        match phrases.get(1) {
            Some(second) => {
                suggestions.push(format!("How does {first} relate to {second}?"));
            }
            None => suggestions.push(format!("Can you give more detail on {first}?")),
        }
        if let Some(third) = phrases.get(2) {
            suggestions.push(format!("What role does {third} play?"));
        }
    }

    let generic = [
        "What else do the documents cover?",
        "Can you summarize the key points?",
        "Where does this information come from?",
    ];
    for filler in generic {
        if suggestions.len() >= SUGGESTION_COUNT {
            break;
        }
        suggestions.push(filler.to_string());
    }
    suggestions
}

/// Capitalized phrases and recurring long terms from the context, minus
/// anything already present in the question. Ordered by frequency then
/// alphabetically, so the output is stable.
fn salient_phrases(question: &str, context_texts: &[String]) -> Vec<String> {
    let question_terms: HashSet<String> = question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in context_texts {
        for word in text.split_whitespace() {
            let cleaned: String = word
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '-')
                .collect();
            if cleaned.len() < 4 {
                continue;
            }
            let starts_upper = cleaned.chars().next().is_some_and(char::is_uppercase);
            if !starts_upper && cleaned.len() < 6 {
                continue;
            }
            if question_terms.contains(&cleaned.to_lowercase()) {
                continue;
            }
            *counts.entry(cleaned).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(3).map(|(phrase, _)| phrase).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_always_returns_three() {
        let suggestions = fallback_suggestions("what is this", &[]);
        assert_eq!(suggestions.len(), 3);
    }

    #[test]
    fn fallback_is_deterministic() {
        let context = vec![
            "The Tokio runtime drives asynchronous executors with schedulers.".to_string(),
        ];
        let a = fallback_suggestions("what is rust", &context);
        let b = fallback_suggestions("what is rust", &context);
        assert_eq!(a, b);
    }

    #[test]
    fn fallback_skips_terms_already_in_question() {
        let context = vec!["Tokio schedulers manage concurrency budgets.".to_string()];
        let suggestions = fallback_suggestions("tell me about Tokio", &context);
        assert!(
            suggestions.iter().all(|s| !s.contains("Tokio")),
            "question terms must not be suggested back: {suggestions:?}"
        );
    }

    #[test]
    fn parses_exact_json_arrays_only() {
        assert!(parse_suggestions(r#"["a?", "b?", "c?"]"#).is_some());
        assert!(parse_suggestions(r#"["only one?"]"#).is_none());
        assert!(parse_suggestions("not json").is_none());
    }

    #[tokio::test]
    async fn llm_path_uses_parsed_array() {
        let llm = LlmProvider::new_static(r#"["One?", "Two?", "Three?"]"#);
        let suggestions = generate_suggestions(&llm, "q", "a", &[]).await;
        assert_eq!(suggestions, vec!["One?", "Two?", "Three?"]);
    }

    #[tokio::test]
    async fn disabled_llm_falls_back() {
        let llm = LlmProvider::new_disabled();
        let suggestions = generate_suggestions(&llm, "q", "a", &[]).await;
        assert_eq!(suggestions.len(), 3);
    }
}
