//! Dense retrieval adapter
//!
//! The dense vector index is an external collaborator: anything that can
//! answer `search(query_text, k)` with inner-product scores over
//! L2-normalized vectors satisfies the `DenseIndex` trait. The adapter
//! resolves raw `(vector_id, score)` pairs through the chunk store and
//! re-sorts them deterministically, so a permutation of equal-scored rows
//! from the backend cannot change downstream results.
//!
//! `FlatDenseIndex` is the shipped implementation: an exact inner-product
//! scan over an in-memory vector table, with query embeddings delegated to
//! an `Embedder` endpoint.

use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::index::store::ChunkStore;
use crate::types::Hit;

/// One raw hit from the dense backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenseHit {
    pub vector_id: u32,
    pub score: f64,
}

/// External dense index contract.
#[async_trait]
pub trait DenseIndex: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<DenseHit>>;
}

/// External query-embedding contract.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Query embedder backed by an Ollama-compatible `/api/embeddings` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::dense(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model: config.embed_model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = EmbedRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::dense(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::dense(format!(
                "embedding failed: HTTP {}",
                response.status()
            )));
        }

        let payload: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::dense(format!("failed to parse embedding response: {e}")))?;
        Ok(payload.embedding)
    }
}

/// Persisted dense artifact: row-major vectors aligned to `vector_id`.
#[derive(Debug, Serialize, Deserialize)]
pub struct DenseArtifact {
    pub dim: usize,
    pub vectors: Vec<Vec<f32>>,
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Exact inner-product index over the full vector table.
pub struct FlatDenseIndex {
    vectors: Vec<Vec<f32>>,
    dim: usize,
    embedder: Arc<dyn Embedder>,
}

impl FlatDenseIndex {
    pub fn new(artifact: DenseArtifact, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let DenseArtifact { dim, mut vectors } = artifact;
        if dim == 0 {
            return Err(Error::dense("dense artifact has zero dimensions"));
        }
        for (row, v) in vectors.iter_mut().enumerate() {
            if v.len() != dim {
                return Err(Error::dense(format!(
                    "dense artifact row {row} has {} dims, expected {dim}",
                    v.len()
                )));
            }
            l2_normalize(v);
        }
        Ok(Self {
            vectors,
            dim,
            embedder,
        })
    }

    pub fn load(path: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = path.as_ref();
        let payload = fs::read_to_string(path).map_err(|e| {
            Error::dense(format!("missing dense artifact {}: {e}", path.display()))
        })?;
        let artifact: DenseArtifact = serde_json::from_str(&payload)
            .map_err(|e| Error::dense(format!("corrupt dense artifact {}: {e}", path.display())))?;
        Self::new(artifact, embedder)
    }
}

#[async_trait]
impl DenseIndex for FlatDenseIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<DenseHit>> {
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        let mut q = self.embedder.embed(query).await?;
        if q.len() != self.dim {
            return Err(Error::dense(format!(
                "query embedding has {} dims, index expects {}",
                q.len(),
                self.dim
            )));
        }
        l2_normalize(&mut q);

        let mut scored: Vec<DenseHit> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(row, v)| DenseHit {
                vector_id: row as u32,
                score: v.iter().zip(&q).map(|(a, b)| (*a as f64) * (*b as f64)).sum(),
            })
            .collect();
        // Ties break by ascending vector_id (enumerate order is stable).
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.vector_id.cmp(&b.vector_id))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

/// Adapter from raw dense hits to metadata-complete, deterministically
/// ordered chunk hits.
pub struct DenseRetriever {
    index: Arc<dyn DenseIndex>,
    store: Arc<ChunkStore>,
}

impl DenseRetriever {
    pub fn new(index: Arc<dyn DenseIndex>, store: Arc<ChunkStore>) -> Self {
        Self { index, store }
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<Hit>> {
        let raw = self.index.search(query, k).await?;
        let mut hits: Vec<Hit> = raw
            .into_iter()
            .filter_map(|dh| {
                self.store
                    .get_by_vector_id(dh.vector_id)
                    .map(|rec| Hit::from_record(rec, dh.score))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.tie_break_key().cmp(&b.tie_break_key()))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkRecord;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn record(vector_id: u32, doc_id: &str, page: u32) -> ChunkRecord {
        ChunkRecord {
            vector_id,
            chunk_id: ChunkRecord::compose_chunk_id(doc_id, page, 0),
            doc_id: doc_id.to_string(),
            start_page: page,
            end_page: page,
            text: "text".to_string(),
        }
    }

    #[tokio::test]
    async fn flat_index_ranks_by_inner_product() {
        let artifact = DenseArtifact {
            dim: 2,
            vectors: vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]],
        };
        let index =
            FlatDenseIndex::new(artifact, Arc::new(FixedEmbedder(vec![0.0, 2.0]))).unwrap();
        let hits = index.search("q", 2).await.unwrap();
        assert_eq!(hits[0].vector_id, 1);
        assert_eq!(hits[1].vector_id, 2);
    }

    #[tokio::test]
    async fn equal_scores_tie_break_by_vector_id() {
        let artifact = DenseArtifact {
            dim: 2,
            vectors: vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]],
        };
        let index =
            FlatDenseIndex::new(artifact, Arc::new(FixedEmbedder(vec![1.0, 0.0]))).unwrap();
        let hits = index.search("q", 3).await.unwrap();
        let ids: Vec<u32> = hits.iter().map(|h| h.vector_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn adapter_resolves_and_reorders_permuted_output() {
        struct Permuted;
        #[async_trait]
        impl DenseIndex for Permuted {
            async fn search(&self, _query: &str, _k: usize) -> Result<Vec<DenseHit>> {
                Ok(vec![
                    DenseHit { vector_id: 2, score: 0.5 },
                    DenseHit { vector_id: 0, score: 0.5 },
                    DenseHit { vector_id: 1, score: 0.5 },
                ])
            }
        }

        let store = Arc::new(
            ChunkStore::from_records(vec![
                record(0, "NIST.FIPS.203", 1),
                record(1, "NIST.FIPS.203", 2),
                record(2, "NIST.FIPS.204", 1),
            ])
            .unwrap(),
        );
        let retriever = DenseRetriever::new(Arc::new(Permuted), store);
        let hits = retriever.search("q", 3).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "NIST.FIPS.203::p0001::c000",
                "NIST.FIPS.203::p0002::c000",
                "NIST.FIPS.204::p0001::c000",
            ]
        );
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let artifact = DenseArtifact {
            dim: 3,
            vectors: vec![vec![1.0, 0.0, 0.0]],
        };
        let index =
            FlatDenseIndex::new(artifact, Arc::new(FixedEmbedder(vec![1.0, 0.0]))).unwrap();
        assert!(index.search("q", 1).await.is_err());
    }
}
