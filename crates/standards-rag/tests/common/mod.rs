//! Shared fixtures: a small standards corpus, a deterministic dense index,
//! and scripted generators.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use standards_rag::error::{Error, Result};
use standards_rag::index::{Bm25Index, ChunkStore};
use standards_rag::retrieval::{
    Backend, DenseHit, DenseIndex, DenseRetriever, Mode, RetrievalOptions, Retriever,
};
use standards_rag::generation::Generator;
use standards_rag::types::{ChunkRecord, REFUSAL_TEXT};

pub fn record(vector_id: u32, doc_id: &str, page: u32, idx: u32, text: &str) -> ChunkRecord {
    ChunkRecord {
        vector_id,
        chunk_id: ChunkRecord::compose_chunk_id(doc_id, page, idx),
        doc_id: doc_id.to_string(),
        start_page: page,
        end_page: page,
        text: text.to_string(),
    }
}

/// Seven chunks across four standards documents.
pub fn corpus() -> Vec<ChunkRecord> {
    vec![
        record(
            0,
            "NIST.FIPS.203",
            8,
            0,
            "ML-KEM is a key-encapsulation mechanism standardized for establishing shared secret keys.",
        ),
        record(
            1,
            "NIST.FIPS.203",
            9,
            0,
            "Algorithm 19 ML-KEM.KeyGen 1: sample seed d 2: expand matrix A 3: output encapsulation key",
        ),
        record(
            2,
            "NIST.FIPS.203",
            20,
            0,
            "ML-KEM.Encaps uses the encapsulation key to produce a ciphertext and shared secret.",
        ),
        record(
            3,
            "NIST.FIPS.202",
            10,
            0,
            "Algorithm 2 SHAKE128 1: Init ctx 2: Absorb str1 3: Squeeze out the requested bytes",
        ),
        record(
            4,
            "NIST.FIPS.204",
            12,
            0,
            "ML-DSA is a digital signature scheme based on module lattices, intended for signing.",
        ),
        record(
            5,
            "NIST.FIPS.204",
            13,
            0,
            "ML-DSA.Sign produces a signature over a message using the private key.",
        ),
        record(
            6,
            "NIST.FIPS.205",
            5,
            0,
            "SLH-DSA is a stateless hash-based digital signature scheme with conservative security.",
        ),
    ]
}

pub fn store() -> Arc<ChunkStore> {
    Arc::new(ChunkStore::from_records(corpus()).unwrap())
}

fn overlap_score(query: &str, text: &str) -> f64 {
    let text_lower = text.to_lowercase();
    let query_lower = query.to_lowercase();
    query_lower
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '.')
        .filter(|t| t.len() > 1)
        .filter(|t| text_lower.contains(t))
        .count() as f64
}

/// Deterministic dense stand-in: token-overlap scores over the fixture
/// corpus, rows in ascending `vector_id` order.
pub struct OverlapDenseIndex {
    records: Vec<ChunkRecord>,
    permute: bool,
}

impl OverlapDenseIndex {
    pub fn new() -> Self {
        Self { records: corpus(), permute: false }
    }

    /// Same scores, different emission order: exercises the adapter's
    /// deterministic re-sort.
    pub fn permuted() -> Self {
        Self { records: corpus(), permute: true }
    }
}

#[async_trait]
impl DenseIndex for OverlapDenseIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<DenseHit>> {
        let mut hits: Vec<DenseHit> = self
            .records
            .iter()
            .map(|rec| DenseHit {
                vector_id: rec.vector_id,
                score: overlap_score(query, &rec.text),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap()
                .then_with(|| a.vector_id.cmp(&b.vector_id))
        });
        hits.truncate(k);
        if self.permute {
            hits.reverse();
        }
        Ok(hits)
    }
}

/// Dense backend that always fails, for retrieval-error paths.
pub struct BrokenDenseIndex;

#[async_trait]
impl DenseIndex for BrokenDenseIndex {
    async fn search(&self, _query: &str, _k: usize) -> Result<Vec<DenseHit>> {
        Err(Error::dense("dense index unavailable"))
    }
}

pub fn retriever_with_dense(dense: Arc<dyn DenseIndex>) -> Retriever {
    let store = store();
    let bm25 = Arc::new(Bm25Index::build(&store, Bm25Index::DEFAULT_K1, Bm25Index::DEFAULT_B).unwrap());
    let adapter = DenseRetriever::new(dense, Arc::clone(&store));
    Retriever::new(store, bm25, Some(adapter))
}

pub fn hybrid_retriever() -> Retriever {
    retriever_with_dense(Arc::new(OverlapDenseIndex::new()))
}

pub fn options(mode: Mode) -> RetrievalOptions {
    RetrievalOptions {
        mode,
        backend: Backend::Bm25,
        k: 8,
        k0: 60,
        candidate_multiplier: 4,
        query_fusion: true,
        enable_rerank: true,
        rerank_pool: 40,
    }
}

/// Generator scripted by prompt content; counts invocations.
pub struct KeyedGenerator {
    calls: AtomicUsize,
}

impl KeyedGenerator {
    pub fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Key of the first evidence block whose header names `doc_id`.
fn key_for_doc(prompt: &str, doc_id: &str) -> Option<String> {
    for line in prompt.lines() {
        if line.starts_with("[c") && line.contains(&format!("| {doc_id} |")) {
            let end = line.find(']')?;
            return Some(line[1..end].to_string());
        }
    }
    None
}

#[async_trait]
impl Generator for KeyedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Behave like a grounded model: cite the evidence keys whose headers
        // carry the documents the answer draws on.
        let kem = key_for_doc(prompt, "NIST.FIPS.203");
        let dsa = key_for_doc(prompt, "NIST.FIPS.204");
        if let (Some(kem), Some(dsa)) = (&kem, &dsa) {
            return Ok(format!(
                "- ML-KEM establishes shared secret keys [{kem}].\n\
                 - ML-DSA signs messages [{dsa}].\n\
                 - One is a KEM while the other is a signature scheme [{kem}][{dsa}]."
            ));
        }
        if let Some(kem) = kem {
            return Ok(format!("- ML-KEM is a key-encapsulation mechanism [{kem}]."));
        }
        Ok(REFUSAL_TEXT.to_string())
    }
}

/// Generator that always refuses.
pub struct RefusingGenerator;

#[async_trait]
impl Generator for RefusingGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        Ok(REFUSAL_TEXT.to_string())
    }
}

/// Generator that always errors.
pub struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(Error::generator("model endpoint unreachable"))
    }
}
