//! Chunk records and retrieval hits

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// One row of the chunk store artifact.
///
/// Immutable after build. `chunk_id` is the deterministic composition
/// `{doc_id}::p{page:04}::c{idx:03}` and `vector_id` is the dense row index
/// aligned with the dense vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub vector_id: u32,
    pub chunk_id: String,
    pub doc_id: String,
    pub start_page: u32,
    pub end_page: u32,
    pub text: String,
}

impl ChunkRecord {
    /// Compose the canonical chunk id for a page/index pair.
    pub fn compose_chunk_id(doc_id: &str, page: u32, idx: u32) -> String {
        format!("{doc_id}::p{page:04}::c{idx:03}")
    }
}

/// A scored retrieval hit carrying full citation fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub score: f64,
    pub chunk_id: String,
    pub doc_id: String,
    pub start_page: u32,
    pub end_page: u32,
    pub text: String,
}

impl Hit {
    pub fn from_record(rec: &ChunkRecord, score: f64) -> Self {
        Self {
            score,
            chunk_id: rec.chunk_id.clone(),
            doc_id: rec.doc_id.clone(),
            start_page: rec.start_page,
            end_page: rec.end_page,
            text: rec.text.clone(),
        }
    }

    /// Identity tie-break key: `(doc_id, start_page, chunk_id)`.
    pub fn tie_break_key(&self) -> (&str, u32, &str) {
        (&self.doc_id, self.start_page, &self.chunk_id)
    }

    /// Full stable ordering used when ranking by score: descending score,
    /// then `(doc_id, start_page, end_page, chunk_id)`.
    pub fn cmp_by_score_desc(&self, other: &Self) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.doc_id.cmp(&other.doc_id))
            .then_with(|| self.start_page.cmp(&other.start_page))
            .then_with(|| self.end_page.cmp(&other.end_page))
            .then_with(|| self.chunk_id.cmp(&other.chunk_id))
    }
}
