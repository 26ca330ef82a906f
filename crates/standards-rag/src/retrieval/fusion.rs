//! Hybrid retrieval: query-variant fan-out, Reciprocal Rank Fusion, and an
//! optional lexical rerank
//!
//! This is the shared retrieval core for the search CLI, the QA path, and
//! the agent tools. Everything here is deterministic: fused scores depend
//! only on ranks, representatives are chosen by fixed tie-break rules, and
//! the final ordering is total.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::error::{Error, Result};
use crate::index::bm25::Bm25Index;
use crate::index::store::ChunkStore;
use crate::retrieval::dense::DenseRetriever;
use crate::retrieval::variants::{query_variants, technical_tokens};
use crate::types::Hit;

/// Retrieval strategy: a single backend, or dense + BM25 fused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Base,
    Hybrid,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::config(format!("Unknown retrieval mode: {other}"))),
        }
    }
}

/// Backend used in base mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Faiss,
    Bm25,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "faiss" => Ok(Self::Faiss),
            "bm25" => Ok(Self::Bm25),
            other => Err(Error::config(format!("Unknown backend: {other}"))),
        }
    }
}

/// Per-call retrieval knobs, derived from `RetrievalConfig` with optional
/// command-line overrides.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub mode: Mode,
    pub backend: Backend,
    pub k: usize,
    pub k0: usize,
    pub candidate_multiplier: usize,
    pub query_fusion: bool,
    pub enable_rerank: bool,
    pub rerank_pool: usize,
}

impl RetrievalOptions {
    pub fn from_config(config: &RetrievalConfig) -> Result<Self> {
        let opts = Self {
            mode: config.mode.parse()?,
            backend: config.vector_backend.parse()?,
            k: config.top_k,
            k0: config.rrf_k0,
            candidate_multiplier: config.candidate_multiplier,
            query_fusion: config.query_fusion,
            enable_rerank: config.enable_rerank,
            rerank_pool: config.rerank_pool,
        };
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::config("top_k must be > 0"));
        }
        if self.k0 == 0 {
            return Err(Error::config("k0 must be > 0"));
        }
        if self.candidate_multiplier == 0 {
            return Err(Error::config("candidate_multiplier must be > 0"));
        }
        if self.rerank_pool == 0 {
            return Err(Error::config("rerank_pool must be > 0"));
        }
        Ok(())
    }

    fn per_source_k(&self) -> usize {
        (self.k * self.candidate_multiplier).max(self.k)
    }
}

/// Fuse multiple ranked hit lists using Reciprocal Rank Fusion.
///
/// Each list contributes `1/(k0 + rank)` per chunk, rank 1-indexed. One
/// representative hit is kept per `chunk_id`: the highest per-source score,
/// first-seen source winning ties. Output carries the fused score and is
/// ordered by `(-fused, doc_id, start_page, chunk_id)`.
pub fn rrf_fuse(rankings: &[Vec<Hit>], top_k: usize, k0: usize) -> Vec<Hit> {
    if top_k == 0 {
        return Vec::new();
    }

    let mut fused_scores: HashMap<&str, f64> = HashMap::new();
    let mut representative: HashMap<&str, &Hit> = HashMap::new();

    for hits in rankings {
        for (rank, hit) in hits.iter().enumerate() {
            let rrf = 1.0 / (k0 as f64 + (rank + 1) as f64);
            *fused_scores.entry(hit.chunk_id.as_str()).or_default() += rrf;

            representative
                .entry(hit.chunk_id.as_str())
                .and_modify(|prev| {
                    if hit.score > prev.score {
                        *prev = hit;
                    }
                })
                .or_insert(hit);
        }
    }

    let mut fused: Vec<Hit> = fused_scores
        .into_iter()
        .map(|(chunk_id, score)| {
            let mut hit = representative[chunk_id].clone();
            hit.score = score;
            hit
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.tie_break_key().cmp(&b.tie_break_key()))
    });
    fused.truncate(top_k);
    fused
}

/// Scorer seam for the lexical rerank; implemented by `Bm25Index`.
pub trait TextScorer {
    fn score_text(&self, query: &str, text: &str) -> f64;
}

impl TextScorer for Bm25Index {
    fn score_text(&self, query: &str, text: &str) -> f64 {
        Bm25Index::score_text(self, query, text)
    }
}

/// Lexical rerank over the top fused candidates.
///
/// Primary key: exact presence of any lowercased technical token from the
/// original query in the hit's lowercased text. Secondary key: BM25 score of
/// the hit text against the original query. Ties fall back to the identity
/// key so the ordering stays total.
pub fn rerank_fused_hits(
    query: &str,
    hits: &[Hit],
    top_k: usize,
    rerank_pool: usize,
    scorer: &dyn TextScorer,
) -> Vec<Hit> {
    let pool = rerank_pool.max(top_k).min(hits.len());
    let tokens: Vec<String> = technical_tokens(query)
        .into_iter()
        .map(|t| t.to_lowercase())
        .collect();

    let mut scored: Vec<(bool, f64, Hit)> = hits[..pool]
        .iter()
        .map(|hit| {
            let text_lower = hit.text.to_lowercase();
            let has_exact = tokens.iter().any(|t| text_lower.contains(t));
            let bm25_score = scorer.score_text(query, &hit.text);
            (has_exact, bm25_score, hit.clone())
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
            .then_with(|| a.2.tie_break_key().cmp(&b.2.tie_break_key()))
    });

    scored.into_iter().take(top_k).map(|(_, _, hit)| hit).collect()
}

/// Rank-annotated hit row for the evaluation harness.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RankedHit {
    pub rank: usize,
    pub score: f64,
    pub chunk_id: String,
    pub doc_id: String,
    pub start_page: u32,
    pub end_page: u32,
    pub text: String,
    pub mode: String,
}

/// Shared retrieval entrypoint for the search CLI, the QA path, the agent
/// tools, and the eval harness.
pub struct Retriever {
    store: Arc<ChunkStore>,
    bm25: Arc<Bm25Index>,
    dense: Option<DenseRetriever>,
}

impl Retriever {
    pub fn new(store: Arc<ChunkStore>, bm25: Arc<Bm25Index>, dense: Option<DenseRetriever>) -> Self {
        Self { store, bm25, dense }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn bm25(&self) -> &Arc<Bm25Index> {
        &self.bm25
    }

    fn dense(&self) -> Result<&DenseRetriever> {
        self.dense.as_ref().ok_or_else(|| {
            Error::dense("dense backend unavailable; build the dense artifact or use --backend bm25")
        })
    }

    /// Run retrieval for a query under the given options.
    pub async fn retrieve(&self, query: &str, opts: &RetrievalOptions) -> Result<Vec<Hit>> {
        opts.validate()?;
        match opts.mode {
            Mode::Hybrid => self.hybrid_search(query, opts).await,
            Mode::Base => self.base_search(query, opts).await,
        }
    }

    /// Dense + BM25 retrieval per query variant, fused with RRF.
    async fn hybrid_search(&self, query: &str, opts: &RetrievalOptions) -> Result<Vec<Hit>> {
        let dense = self.dense()?;
        let per_source_k = opts.per_source_k();
        let queries = self.expand(query, opts);

        let mut rankings: Vec<Vec<Hit>> = Vec::with_capacity(queries.len() * 2);
        for q in &queries {
            rankings.push(dense.search(q, per_source_k).await?);
            rankings.push(self.bm25.search(q, per_source_k));
        }

        Ok(self.fuse_and_rerank(query, rankings, opts))
    }

    /// Single-backend retrieval per query variant, fused with RRF.
    async fn base_search(&self, query: &str, opts: &RetrievalOptions) -> Result<Vec<Hit>> {
        let per_source_k = opts.per_source_k();
        let queries = self.expand(query, opts);

        let mut rankings: Vec<Vec<Hit>> = Vec::with_capacity(queries.len());
        for q in &queries {
            let hits = match opts.backend {
                Backend::Faiss => self.dense()?.search(q, per_source_k).await?,
                Backend::Bm25 => self.bm25.search(q, per_source_k),
            };
            rankings.push(hits);
        }

        Ok(self.fuse_and_rerank(query, rankings, opts))
    }

    fn expand(&self, query: &str, opts: &RetrievalOptions) -> Vec<String> {
        if opts.query_fusion {
            query_variants(query)
        } else {
            vec![query.trim().to_string()]
        }
    }

    fn fuse_and_rerank(
        &self,
        query: &str,
        rankings: Vec<Vec<Hit>>,
        opts: &RetrievalOptions,
    ) -> Vec<Hit> {
        if opts.enable_rerank {
            let pool = opts.rerank_pool.max(opts.k);
            let fused = rrf_fuse(&rankings, pool, opts.k0);
            rerank_fused_hits(query, &fused, opts.k, opts.rerank_pool, self.bm25.as_ref())
        } else {
            rrf_fuse(&rankings, opts.k, opts.k0)
        }
    }

    /// Retrieval with rank annotations for metric computation.
    pub async fn retrieve_for_eval(
        &self,
        query: &str,
        opts: &RetrievalOptions,
    ) -> Result<Vec<RankedHit>> {
        // `retrieve` already imposes a total order (fusion and rerank both
        // end in the identity tie-break), so ranks are stable across runs.
        let hits = self.retrieve(query, opts).await?;
        let mode = match opts.mode {
            Mode::Base => "base",
            Mode::Hybrid => "hybrid",
        };
        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(i, h)| RankedHit {
                rank: i + 1,
                score: h.score,
                chunk_id: h.chunk_id,
                doc_id: h.doc_id,
                start_page: h.start_page,
                end_page: h.end_page,
                text: h.text,
                mode: mode.to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(score: f64, chunk_id: &str, doc_id: &str, page: u32) -> Hit {
        Hit {
            score,
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            start_page: page,
            end_page: page,
            text: String::new(),
        }
    }

    #[test]
    fn rrf_prefers_chunks_shared_across_rankings() {
        let vector_hits = vec![
            hit(0.9, "x", "NIST.FIPS.203", 35),
            hit(0.8, "y", "NIST.FIPS.203", 9),
            hit(0.7, "z", "NIST.FIPS.204", 12),
        ];
        let bm25_hits = vec![
            hit(10.0, "x", "NIST.FIPS.203", 35),
            hit(9.0, "y", "NIST.FIPS.203", 9),
            hit(8.0, "w", "NIST.FIPS.203", 44),
        ];

        let fused = rrf_fuse(&[vector_hits, bm25_hits], 3, 60);
        let ids: Vec<&str> = fused.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, ["x", "y", "w"]);
    }

    #[test]
    fn rrf_tie_breaks_by_doc_page_chunk() {
        let a = hit(1.0, "chunk-b", "B_DOC", 5);
        let b = hit(1.0, "chunk-a", "A_DOC", 5);

        let fused = rrf_fuse(&[vec![a], vec![b]], 2, 60);
        let ids: Vec<&str> = fused.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, ["chunk-a", "chunk-b"]);
    }

    #[test]
    fn rrf_score_is_sum_of_reciprocal_ranks() {
        let fused = rrf_fuse(
            &[vec![hit(0.9, "x", "D", 1)], vec![hit(5.0, "x", "D", 1)]],
            1,
            60,
        );
        let expected = 2.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
    }

    #[test]
    fn rrf_representative_keeps_best_source_score() {
        let low = Hit {
            text: "from sparse list".to_string(),
            ..hit(1.0, "x", "D", 1)
        };
        let high = Hit {
            text: "from dense list".to_string(),
            ..hit(7.0, "x", "D", 1)
        };
        let fused = rrf_fuse(&[vec![low], vec![high]], 1, 60);
        assert_eq!(fused[0].text, "from dense list");
    }

    struct FakeScorer;

    impl TextScorer for FakeScorer {
        fn score_text(&self, _query: &str, text: &str) -> f64 {
            match text {
                "chunk-a" => 100.0,
                "chunk-c" => 50.0,
                _ => 5.0,
            }
        }
    }

    #[test]
    fn rerank_prefers_exact_technical_token_then_score() {
        let hits = vec![
            Hit { text: "chunk-a".to_string(), ..hit(0.4, "a", "DOC", 1) },
            Hit { text: "chunk-b contains ml-kem.keygen".to_string(), ..hit(0.3, "b", "DOC", 2) },
            Hit { text: "chunk-c".to_string(), ..hit(0.2, "c", "DOC", 3) },
        ];

        let ranked = rerank_fused_hits("Explain ML-KEM.KeyGen", &hits, 3, 40, &FakeScorer);
        let ids: Vec<&str> = ranked.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(&ids[..2], &["b", "a"]);
    }

    #[test]
    fn rerank_truncates_to_final_k() {
        let hits: Vec<Hit> = (0..10u32)
            .map(|i| hit(1.0 - f64::from(i) * 0.01, &format!("c{i}"), "DOC", i + 1))
            .collect();
        let ranked = rerank_fused_hits("plain query", &hits, 3, 40, &FakeScorer);
        assert_eq!(ranked.len(), 3);
    }
}
