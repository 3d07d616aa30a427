use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use common::utils::config::ConfidenceSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    None,
}

impl ConfidenceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    pub level: ConfidenceLevel,
    pub score: f32,
}

impl Confidence {
    pub fn none() -> Self {
        Self {
            level: ConfidenceLevel::None,
            score: 0.0,
        }
    }

    /// Degradation cap: an answer built from a degraded retrieval path can
    /// never claim more than the given level.
    pub fn capped_at(self, cap: ConfidenceLevel) -> Self {
        let order = |level: ConfidenceLevel| match level {
            ConfidenceLevel::None => 0,
            ConfidenceLevel::Low => 1,
            ConfidenceLevel::Medium => 2,
            ConfidenceLevel::High => 3,
        };
        if order(self.level) > order(cap) {
            Self {
                level: cap,
                score: self.score,
            }
        } else {
            self
        }
    }
}

/// Inputs to the grounding score.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceSignals {
    pub top_rerank: f32,
    pub mean_top3: f32,
    pub answer_overlap: f32,
    pub insufficient_phrasing: bool,
}

/// Weighted multi-signal score: top rerank 0.4, mean of top-3 0.2, answer
/// overlap 0.3. Explicit insufficient-information phrasing forces `none`
/// regardless of the other signals.
pub fn score_confidence(signals: ConfidenceSignals, thresholds: &ConfidenceSettings) -> Confidence {
    if signals.insufficient_phrasing {
        return Confidence::none();
    }

    let score = (0.4 * signals.top_rerank
        + 0.2 * signals.mean_top3
        + 0.3 * signals.answer_overlap)
        .clamp(0.0, 1.0);

    let level = if score >= thresholds.high {
        ConfidenceLevel::High
    } else if score >= thresholds.medium {
        ConfidenceLevel::Medium
    } else if score >= thresholds.low {
        ConfidenceLevel::Low
    } else {
        ConfidenceLevel::None
    };

    Confidence { level, score }
}

/// Token-level overlap: the fraction of distinct answer terms that appear
/// somewhere in the selected context.
pub fn answer_context_overlap(answer: &str, context_texts: &[String]) -> f32 {
    let answer_terms: HashSet<String> = terms(answer).collect();
    if answer_terms.is_empty() {
        return 0.0;
    }

    let context_terms: HashSet<String> = context_texts
        .iter()
        .flat_map(|text| terms(text))
        .collect();

    let grounded = answer_terms
        .iter()
        .filter(|term| context_terms.contains(*term))
        .count() as f32;
    grounded / answer_terms.len() as f32
}

const INSUFFICIENT_MARKERS: [&str; 5] = [
    "insufficient information",
    "do not have information",
    "don't have information",
    "no information available",
    "unable to synthesize",
];

pub fn has_insufficient_phrasing(answer: &str) -> bool {
    let lowered = answer.to_lowercase();
    INSUFFICIENT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .into_iter()
}
