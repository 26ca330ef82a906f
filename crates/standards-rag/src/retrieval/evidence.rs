//! Evidence selection: dedup, stable sort, context budgets, and same-doc
//! neighbor windowing

use std::collections::HashMap;
use std::collections::HashSet;

use crate::config::AnswerConfig;
use crate::index::store::ChunkStore;
use crate::types::Hit;

/// Budget and windowing policy for evidence selection.
#[derive(Debug, Clone)]
pub struct EvidencePolicy {
    pub max_chunks: usize,
    pub max_chars: usize,
    pub min_evidence_hits: usize,
    pub include_neighbors: bool,
    pub neighbor_window: usize,
}

impl From<&AnswerConfig> for EvidencePolicy {
    fn from(config: &AnswerConfig) -> Self {
        Self {
            max_chunks: config.max_context_chunks,
            max_chars: config.max_context_chars,
            min_evidence_hits: config.min_evidence_hits,
            include_neighbors: config.include_neighbor_chunks,
            neighbor_window: config.neighbor_window,
        }
    }
}

/// Outcome of evidence selection.
///
/// Thin evidence is an expected state, not an exception; callers decide
/// whether to refuse or to keep retrieving.
#[derive(Debug)]
pub enum Selection {
    Sufficient(Vec<Hit>),
    Insufficient { unique_hits: usize, required: usize },
}

impl Selection {
    pub fn into_hits(self) -> Option<Vec<Hit>> {
        match self {
            Self::Sufficient(hits) => Some(hits),
            Self::Insufficient { .. } => None,
        }
    }
}

/// Select the evidence set that will be shown to the generator.
///
/// 1. Dedup by `chunk_id`, keeping the best-scoring instance.
/// 2. Sort stably by `(-score, doc_id, start_page, end_page, chunk_id)`.
/// 3. Take primary hits until `max_chunks` or the char budget is reached.
/// 4. Optionally add up to `window` same-document neighbors per side,
///    inserted adjacent to their seed, counted against both budgets.
///
/// Citation keys `c1..cN` are later assigned in exactly this order.
pub fn select_evidence(hits: &[Hit], store: Option<&ChunkStore>, policy: &EvidencePolicy) -> Selection {
    // Dedup by chunk_id, keep best-scoring instance.
    let mut best: HashMap<&str, &Hit> = HashMap::new();
    for h in hits {
        if h.text.trim().is_empty() {
            continue;
        }
        best.entry(h.chunk_id.as_str())
            .and_modify(|prev| {
                if h.score > prev.score {
                    *prev = h;
                }
            })
            .or_insert(h);
    }

    let unique_hits = best.len();
    if unique_hits < policy.min_evidence_hits {
        return Selection::Insufficient {
            unique_hits,
            required: policy.min_evidence_hits,
        };
    }

    let mut ordered: Vec<&Hit> = best.into_values().collect();
    ordered.sort_by(|a, b| a.cmp_by_score_desc(b));

    // Primary selection under both budgets.
    let mut primaries: Vec<Hit> = Vec::new();
    let mut total_chars = 0usize;
    for h in ordered {
        if primaries.len() >= policy.max_chunks {
            break;
        }
        if total_chars + h.text.len() > policy.max_chars && !primaries.is_empty() {
            break;
        }
        total_chars += h.text.len();
        primaries.push(h.clone());
    }

    if !policy.include_neighbors || policy.neighbor_window == 0 {
        return Selection::Sufficient(primaries);
    }
    let Some(store) = store else {
        return Selection::Sufficient(primaries);
    };

    // Neighbor windowing: each seed keeps its neighbors adjacent to it, and
    // expansion never displaces a primary hit.
    let mut seen: HashSet<String> = primaries.iter().map(|h| h.chunk_id.clone()).collect();
    let mut selected: Vec<Hit> = Vec::with_capacity(primaries.len());
    let mut count = primaries.len();

    for seed in &primaries {
        selected.push(seed.clone());
        for (i, rec) in store.neighbors(&seed.chunk_id, policy.neighbor_window).iter().enumerate() {
            if count >= policy.max_chunks {
                break;
            }
            if seen.contains(&rec.chunk_id) {
                continue;
            }
            if total_chars + rec.text.len() > policy.max_chars {
                continue;
            }
            // Nudge the score below the seed so provenance stays readable in
            // traces; ordering is already fixed by insertion position.
            let neighbor = Hit::from_record(rec, seed.score - ((i + 1) as f64) * 1e-6);
            seen.insert(neighbor.chunk_id.clone());
            total_chars += neighbor.text.len();
            count += 1;
            selected.push(neighbor);
        }
    }

    Selection::Sufficient(selected)
}
