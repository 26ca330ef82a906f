//! Retrieval tools invoked by the control loop
//!
//! Each tool returns evidence items plus stats for the trace. The compare
//! tool fans out one retrieval per topic and merges with first-seen dedup;
//! summarize pulls chunks straight from the store by page range, so the
//! answer node can ground a summary without a ranked search.

use serde_json::json;

use crate::error::Result;
use crate::retrieval::fusion::{RetrievalOptions, Retriever};
use crate::types::Hit;

pub const RETRIEVE_K: usize = 8;
pub const COMPARE_K: usize = 6;
pub const SUMMARIZE_K: usize = 30;

/// Tool output: evidence plus trace stats.
#[derive(Debug)]
pub struct ToolOutput {
    pub evidence: Vec<Hit>,
    pub stats: serde_json::Value,
}

/// The loop's toolbox over the shared retriever.
pub struct Toolbox<'a> {
    retriever: &'a Retriever,
    options: RetrievalOptions,
}

impl<'a> Toolbox<'a> {
    pub fn new(retriever: &'a Retriever, options: RetrievalOptions) -> Self {
        Self { retriever, options }
    }

    fn with_k(&self, k: usize) -> RetrievalOptions {
        RetrievalOptions {
            k,
            ..self.options.clone()
        }
    }

    /// Hybrid retrieval with fusion (and rerank when enabled).
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<ToolOutput> {
        let evidence = self.retriever.retrieve(query, &self.with_k(k)).await?;
        let stats = json!({ "tool": "retrieve", "query": query, "k": k, "n": evidence.len() });
        Ok(ToolOutput { evidence, stats })
    }

    /// Definitions/notation-oriented retrieval pass for a term or symbol.
    pub async fn resolve_definition(&self, term: &str, k: usize) -> Result<ToolOutput> {
        let query = format!("definition of {term}; notation; definitions");
        let evidence = self.retriever.retrieve(&query, &self.with_k(k)).await?;
        let stats = json!({ "tool": "resolve_definition", "term": term, "query": query, "k": k, "n": evidence.len() });
        Ok(ToolOutput { evidence, stats })
    }

    /// Evidence for two topics, merged and deduped; the answer node does the
    /// actual comparison with citations.
    pub async fn compare(&self, topic_a: &str, topic_b: &str, k: usize) -> Result<ToolOutput> {
        let query_a = format!("{topic_a} intended use-cases; definition; key properties");
        let query_b = format!("{topic_b} intended use-cases; definition; key properties");

        let hits_a = self.retriever.retrieve(&query_a, &self.with_k(k)).await?;
        let hits_b = self.retriever.retrieve(&query_b, &self.with_k(k)).await?;

        let n_a = hits_a.len();
        let n_b = hits_b.len();
        let mut seen = std::collections::HashSet::new();
        let evidence: Vec<Hit> = hits_a
            .into_iter()
            .chain(hits_b)
            .filter(|h| seen.insert(h.chunk_id.clone()))
            .collect();

        let stats = json!({
            "tool": "compare",
            "topic_a": topic_a,
            "topic_b": topic_b,
            "k": k,
            "n_a": n_a,
            "n_b": n_b,
            "n_merged": evidence.len(),
        });
        Ok(ToolOutput { evidence, stats })
    }

    /// Chunks overlapping a document page range, as evidence for a grounded
    /// summary. Deterministic store order, no ranked search.
    pub fn summarize(
        &self,
        doc_id: &str,
        start_page: u32,
        end_page: u32,
        k: usize,
    ) -> Result<ToolOutput> {
        let evidence: Vec<Hit> = self
            .retriever
            .store()
            .chunks_for_doc_pages(doc_id, start_page, end_page)
            .into_iter()
            .take(k)
            .map(|rec| Hit::from_record(rec, 0.0))
            .collect();

        let stats = json!({
            "tool": "summarize",
            "doc_id": doc_id,
            "start_page": start_page,
            "end_page": end_page,
            "k": k,
            "n": evidence.len(),
        });
        Ok(ToolOutput { evidence, stats })
    }
}
