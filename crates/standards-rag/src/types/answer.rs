//! Answer contract: citations, results, refusal, and marker parsing

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The only refusal text ever emitted.
pub const REFUSAL_TEXT: &str = "not found in provided docs";

/// A single piece of evidence backing a claim in the answer.
///
/// Links a stable key (like `c1`), used for inline markers in the answer
/// text, to a specific chunk within a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub key: String,
    pub doc_id: String,
    pub start_page: u32,
    pub end_page: u32,
    pub chunk_id: String,
}

/// Final output of the question-answering path: either a cited answer or
/// the refusal sentinel with no citations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResult {
    pub answer: String,
    pub citations: Vec<Citation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl AnswerResult {
    pub fn new(answer: String, citations: Vec<Citation>) -> Self {
        Self {
            answer,
            citations,
            notes: None,
        }
    }

    /// The standard refusal result.
    pub fn refusal() -> Self {
        Self::new(REFUSAL_TEXT.to_string(), Vec::new())
    }

    pub fn is_refusal(&self) -> bool {
        self.answer.trim().eq_ignore_ascii_case(REFUSAL_TEXT)
    }
}

static CITE_BRACKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]").expect("bracket regex"));
static CITE_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bc\d+\b").expect("token regex"));

/// Find all unique inline citation markers in the text.
///
/// Accepts `[c1]`, `[c1, c2]`, `[c1 c2]`, and adjacent pairs `[c1][c2]`;
/// matching is case-insensitive and keys normalize to lowercase.
pub fn extract_citation_keys(answer_text: &str) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for bracket in CITE_BRACKET_RE.captures_iter(answer_text) {
        for token in CITE_TOKEN_RE.find_iter(&bracket[1]) {
            keys.insert(token.as_str().to_lowercase());
        }
    }
    keys
}

/// Enforce the answer contract invariants.
///
/// Downstream consumers (CLI, agent loop, eval harness) rely on these holding
/// for every `AnswerResult` that crosses a module boundary.
pub fn validate_answer(
    result: &AnswerResult,
    require_citations: bool,
    require_inline_markers: bool,
) -> Result<()> {
    for c in &result.citations {
        if c.start_page == 0 || c.end_page == 0 {
            return Err(Error::AnswerContract(format!(
                "invalid page numbers in citation {c:?}"
            )));
        }
        if c.start_page > c.end_page {
            return Err(Error::AnswerContract(format!(
                "start_page > end_page in citation {c:?}"
            )));
        }
    }

    if result.is_refusal() {
        if !result.citations.is_empty() {
            return Err(Error::AnswerContract(
                "refusal must return empty citations".to_string(),
            ));
        }
        return Ok(());
    }

    if require_citations && result.citations.is_empty() {
        return Err(Error::AnswerContract(
            "non-refusal answer must include citations".to_string(),
        ));
    }

    if require_inline_markers {
        let used = extract_citation_keys(&result.answer);
        if used.is_empty() {
            return Err(Error::AnswerContract(
                "answer must include inline citation markers like [c1]".to_string(),
            ));
        }
        let known: BTreeSet<String> = result.citations.iter().map(|c| c.key.clone()).collect();
        let unknown: Vec<&String> = used.difference(&known).collect();
        if !unknown.is_empty() {
            return Err(Error::AnswerContract(format!(
                "answer uses unknown citation keys: {unknown:?}"
            )));
        }
    }

    Ok(())
}
