//! Weighted keyword tables for capability tags and score hints.
//!
//! Tag inference sums the weight of every keyword found in the text and takes
//! the top-scoring tag. Keywords match at a word start, so `test` hits
//! "tests" and "testing" but not "latest".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{CapabilityTag, Score};

fn default_weight() -> u32 {
    5
}

/// One `(keyword, tag, weight)` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keyword: String,
    pub tag: CapabilityTag,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl KeywordRule {
    pub fn new(keyword: impl Into<String>, tag: impl Into<CapabilityTag>, weight: u32) -> Self {
        Self {
            keyword: keyword.into().to_lowercase(),
            tag: tag.into(),
            weight,
        }
    }
}

const BUILTIN_TAGS: &[(&str, &str, u32)] = &[
    ("accessibility", "accessibility", 10),
    ("a11y", "accessibility", 10),
    ("contrast", "accessibility", 6),
    ("screen reader", "accessibility", 8),
    ("aria", "accessibility", 6),
    ("build", "build", 8),
    ("compile", "build", 8),
    ("ci", "build", 6),
    ("pipeline", "data-pipeline", 6),
    ("etl", "data-pipeline", 10),
    ("ingest", "data-pipeline", 8),
    ("dataset", "data-pipeline", 6),
    ("test", "testing", 10),
    ("coverage", "testing", 6),
    ("flaky", "testing", 6),
    ("doc", "documentation", 10),
    ("readme", "documentation", 8),
    ("changelog", "documentation", 6),
    ("fix", "bug-fix", 10),
    ("bug", "bug-fix", 10),
    ("crash", "bug-fix", 8),
    ("regression", "bug-fix", 6),
    ("design", "design", 8),
    ("mockup", "design", 8),
    ("layout", "design", 5),
    ("refactor", "refactoring", 10),
    ("clean up", "refactoring", 5),
    ("rename", "refactoring", 4),
    ("ui", "frontend", 6),
    ("page", "frontend", 5),
    ("css", "frontend", 8),
    ("button", "frontend", 5),
    ("api", "backend", 6),
    ("endpoint", "backend", 8),
    ("database", "backend", 6),
    ("server", "backend", 6),
    ("security", "security", 10),
    ("vulnerab", "security", 10),
    ("auth", "security", 5),
    ("xss", "security", 10),
    ("performance", "performance", 10),
    ("slow", "performance", 8),
    ("latency", "performance", 8),
    ("speed up", "performance", 8),
];

const IMPACT_HINTS: &[(&str, u8)] = &[
    ("critical", 5),
    ("outage", 5),
    ("security", 5),
    ("crash", 5),
    ("data loss", 5),
    ("broken", 4),
    ("customer", 4),
    ("blocker", 4),
    ("cosmetic", 2),
    ("typo", 1),
];

const EFFORT_HINTS: &[(&str, u8)] = &[
    ("rewrite", 5),
    ("migrate", 5),
    ("redesign", 5),
    ("overhaul", 5),
    ("refactor", 4),
    ("investigate", 4),
    ("rename", 1),
    ("typo", 1),
    ("quick", 1),
    ("small", 2),
];

const RISK_HINTS: &[(&str, u8)] = &[
    ("migration", 5),
    ("migrate", 5),
    ("production", 5),
    ("schema", 4),
    ("delete", 4),
    ("auth", 4),
    ("experimental", 4),
    ("docs", 1),
    ("readme", 1),
    ("typo", 1),
];

/// `keyword` が `text` のどこかで単語の先頭から始まっているか
fn matches_at_word_start(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(pos, _)| {
        text[..pos]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric())
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordTable {
    rules: Vec<KeywordRule>,
}

impl KeywordTable {
    /// Table without any rules. Every task then needs explicit `#tags`.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn builtin() -> Self {
        Self {
            rules: BUILTIN_TAGS
                .iter()
                .map(|&(keyword, tag, weight)| KeywordRule::new(keyword, tag, weight))
                .collect(),
        }
    }

    pub fn extend(&mut self, rules: impl IntoIterator<Item = KeywordRule>) {
        self.rules.extend(
            rules
                .into_iter()
                .map(|rule| KeywordRule::new(rule.keyword, rule.tag, rule.weight)),
        );
    }

    pub fn rules(&self) -> &[KeywordRule] {
        &self.rules
    }

    /// Top-scoring tag for `text`. Ties go to the smallest tag name.
    pub fn infer_tag(&self, text: &str) -> Option<CapabilityTag> {
        let lower = text.to_lowercase();
        let mut scores: BTreeMap<&CapabilityTag, u32> = BTreeMap::new();
        for rule in &self.rules {
            if !rule.keyword.is_empty() && matches_at_word_start(&lower, &rule.keyword) {
                *scores.entry(&rule.tag).or_insert(0) += rule.weight;
            }
        }

        // BTreeMap はタグ名順なので、同点なら先に来たものを残す
        let mut best: Option<(&CapabilityTag, u32)> = None;
        for (tag, score) in scores {
            if score > 0 && best.is_none_or(|(_, top)| score > top) {
                best = Some((tag, score));
            }
        }
        best.map(|(tag, _)| tag.clone())
    }
}

impl Default for KeywordTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn hinted(table: &[(&str, u8)], text: &str) -> Score {
    let lower = text.to_lowercase();
    table
        .iter()
        .filter(|(keyword, _)| matches_at_word_start(&lower, keyword))
        .map(|&(_, value)| value)
        .max()
        .and_then(|value| Score::try_from(value).ok())
        .unwrap_or(Score::NEUTRAL)
}

pub(crate) fn impact_hint(text: &str) -> Score {
    hinted(IMPACT_HINTS, text)
}

pub(crate) fn effort_hint(text: &str) -> Score {
    hinted(EFFORT_HINTS, text)
}

pub(crate) fn risk_hint(text: &str) -> Score {
    hinted(RISK_HINTS, text)
}
