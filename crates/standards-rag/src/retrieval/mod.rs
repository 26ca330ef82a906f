//! Retrieval pipeline: dense adapter, query variants, fusion, rerank, and
//! evidence selection

pub mod dense;
pub mod evidence;
pub mod fusion;
pub mod variants;

pub use dense::{DenseHit, DenseIndex, DenseRetriever, Embedder, FlatDenseIndex, HttpEmbedder};
pub use evidence::{select_evidence, EvidencePolicy, Selection};
pub use fusion::{
    rerank_fused_hits, rrf_fuse, Backend, Mode, RankedHit, RetrievalOptions, Retriever, TextScorer,
};
pub use variants::{extract_compare_topics, query_variants, technical_tokens};
