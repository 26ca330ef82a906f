//! Retrieval and answer-compliance metrics
//!
//! Strict relevance: a hit matches a gold span iff the document ids are
//! equal and the inclusive page ranges overlap. Each gold span contributes
//! gain at most once, which keeps Recall@k in [0, 1] and nDCG@k bounded even
//! when several hits cover the same span.

use std::sync::LazyLock;

use regex::Regex;

use crate::eval::dataset::GoldSpan;
use crate::retrieval::fusion::RankedHit;
use crate::types::{AnswerResult, REFUSAL_TEXT};

static INLINE_CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[c\d+\]").expect("citation regex"));

/// True when two inclusive page ranges overlap.
pub fn spans_overlap(start_a: u32, end_a: u32, start_b: u32, end_b: u32) -> bool {
    !(end_a < start_b || end_b < start_a)
}

/// Binary relevance contract for retrieval eval.
pub fn hit_matches_gold(hit: &RankedHit, gold: &GoldSpan) -> bool {
    hit.doc_id == gold.doc_id
        && spans_overlap(hit.start_page, hit.end_page, gold.start_page, gold.end_page)
}

/// Relaxed diagnostic: relevant iff document ids match.
pub fn hit_matches_gold_doc_only(hit: &RankedHit, gold: &GoldSpan) -> bool {
    hit.doc_id == gold.doc_id
}

/// Relaxed diagnostic: doc match plus overlap with ± tolerance page slack.
pub fn hit_matches_gold_with_tolerance(hit: &RankedHit, gold: &GoldSpan, tolerance: u32) -> bool {
    hit.doc_id == gold.doc_id
        && spans_overlap(
            hit.start_page,
            hit.end_page,
            gold.start_page.saturating_sub(tolerance),
            gold.end_page + tolerance,
        )
}

/// Binary gain vector where each gold span counts at most once.
fn unique_gold_gains(hits: &[RankedHit], gold: &[GoldSpan], k: usize) -> Vec<u32> {
    let mut used = vec![false; gold.len()];
    let mut gains = Vec::new();
    for hit in hits.iter().take(k) {
        let mut gain = 0;
        for (i, g) in gold.iter().enumerate() {
            if used[i] {
                continue;
            }
            if hit_matches_gold(hit, g) {
                used[i] = true;
                gain = 1;
                break;
            }
        }
        gains.push(gain);
    }
    gains
}

pub fn recall_at_k(hits: &[RankedHit], gold: &[GoldSpan], k: usize) -> f64 {
    if gold.is_empty() {
        return 0.0;
    }
    let matched: u32 = unique_gold_gains(hits, gold, k).iter().sum();
    f64::from(matched) / gold.len() as f64
}

pub fn mrr_at_k(hits: &[RankedHit], gold: &[GoldSpan], k: usize) -> f64 {
    if gold.is_empty() {
        return 0.0;
    }
    for (rank, hit) in hits.iter().take(k).enumerate() {
        if gold.iter().any(|g| hit_matches_gold(hit, g)) {
            return 1.0 / (rank + 1) as f64;
        }
    }
    0.0
}

pub fn ndcg_at_k(hits: &[RankedHit], gold: &[GoldSpan], k: usize) -> f64 {
    if gold.is_empty() {
        return 0.0;
    }

    let gains = unique_gold_gains(hits, gold, k);
    if gains.is_empty() {
        return 0.0;
    }

    let dcg: f64 = gains
        .iter()
        .enumerate()
        .filter(|(_, &gain)| gain > 0)
        .map(|(i, _)| 1.0 / ((i + 2) as f64).log2())
        .sum();

    let ideal_count = gold.len().min(k);
    let idcg: f64 = (1..=ideal_count).map(|i| 1.0 / ((i + 1) as f64).log2()).sum();
    if idcg == 0.0 {
        0.0
    } else {
        dcg / idcg
    }
}

/// Retrieval metrics at one cutoff.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RetrievalMetrics {
    pub recall: f64,
    pub mrr: f64,
    pub ndcg: f64,
}

pub fn compute_retrieval_metrics(hits: &[RankedHit], gold: &[GoldSpan], k: usize) -> RetrievalMetrics {
    RetrievalMetrics {
        recall: recall_at_k(hits, gold, k),
        mrr: mrr_at_k(hits, gold, k),
        ndcg: ndcg_at_k(hits, gold, k),
    }
}

fn sentences(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'?' | b'!') {
            let mut j = i + 1;
            if j < bytes.len() && bytes[j].is_ascii_whitespace() {
                let sentence = text[start..=i].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Fraction of sentences carrying at least one inline citation marker.
pub fn inline_citation_sentence_rate(answer_text: &str) -> Option<f64> {
    let parts = sentences(answer_text.trim());
    if parts.is_empty() {
        return None;
    }
    let cited = parts
        .iter()
        .filter(|s| INLINE_CITATION_RE.is_match(s))
        .count();
    Some(cited as f64 / parts.len() as f64)
}

/// Per-answer compliance metrics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AnswerMetrics {
    pub is_refusal: bool,
    pub citation_count: usize,
    pub citation_presence_ok: bool,
    pub inline_citation_sentence_rate: Option<f64>,
    pub refusal_accuracy: f64,
}

/// Score one answer payload against the citation/refusal contract.
pub fn evaluate_answer(result: &AnswerResult, answerable: bool) -> AnswerMetrics {
    let answer = result.answer.trim();
    let is_refusal = answer.eq_ignore_ascii_case(REFUSAL_TEXT);
    let citation_presence_ok = if is_refusal {
        result.citations.is_empty()
    } else {
        !result.citations.is_empty()
    };
    let refusal_accuracy = if is_refusal == !answerable { 1.0 } else { 0.0 };
    let inline_rate = if is_refusal {
        None
    } else {
        inline_citation_sentence_rate(answer)
    };

    AnswerMetrics {
        is_refusal,
        citation_count: result.citations.len(),
        citation_presence_ok,
        inline_citation_sentence_rate: inline_rate,
        refusal_accuracy,
    }
}

/// Mean of an iterator, or `None` when empty.
pub fn safe_mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let vals: Vec<f64> = values.into_iter().collect();
    if vals.is_empty() {
        None
    } else {
        Some(vals.iter().sum::<f64>() / vals.len() as f64)
    }
}
