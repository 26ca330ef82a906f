//! BM25 lexical index with a technical-compound-aware tokenizer
//!
//! The tokenizer preserves identifiers like `ML-KEM.KeyGen`: a run of
//! alphanumerics joined by `-`, `.`, or `_` is emitted both as the full
//! lowercased compound and as its individual components, so exact-compound
//! and per-component queries both match.
//!
//! The artifact is a single JSON blob (parameters, vocabulary with IDF,
//! postings, document lengths, chunk metadata) built deterministically by
//! iterating chunks in ascending `vector_id`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::store::ChunkStore;
use crate::types::{ChunkRecord, Hit};

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+(?:[-._][a-z0-9]+)+|[a-z0-9]+").expect("token regex"));
static COMPOUND_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-._]").expect("split regex"));

/// Tokenize text, preserving technical compounds.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut expanded = Vec::new();
    for token in TOKEN_RE.find_iter(&lowered) {
        let token = token.as_str();
        expanded.push(token.to_string());
        if token.contains(['-', '.', '_']) {
            for part in COMPOUND_SPLIT_RE.split(token) {
                if !part.is_empty() {
                    expanded.push(part.to_string());
                }
            }
        }
    }
    expanded
}

/// Per-token vocabulary entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TermStats {
    pub df: u32,
    pub idf: f64,
}

/// Persisted BM25 artifact; also the in-memory index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    pub k1: f64,
    pub b: f64,
    pub avgdl: f64,
    pub doc_count: usize,
    pub vocab: BTreeMap<String, TermStats>,
    pub postings: BTreeMap<String, Vec<(u32, u32)>>,
    pub doc_lengths: Vec<u32>,
    pub docs: Vec<ChunkRecord>,
}

impl Bm25Index {
    pub const DEFAULT_K1: f64 = 1.2;
    pub const DEFAULT_B: f64 = 0.75;

    /// Build the index from the chunk store, iterating in ascending
    /// `vector_id` order so two builds of the same corpus are identical.
    pub fn build(store: &ChunkStore, k1: f64, b: f64) -> Result<Self> {
        if store.is_empty() {
            return Err(Error::bm25("cannot build BM25 index from an empty corpus"));
        }

        let mut doc_freq: HashMap<String, u32> = HashMap::new();
        let mut postings: BTreeMap<String, Vec<(u32, u32)>> = BTreeMap::new();
        let mut doc_lengths = Vec::new();
        let mut docs = Vec::new();

        for (doc_idx, rec) in store.iter().enumerate() {
            let tokens = tokenize(&rec.text);
            let mut tf: BTreeMap<String, u32> = BTreeMap::new();
            for token in tokens {
                *tf.entry(token).or_default() += 1;
            }

            doc_lengths.push(tf.values().sum());
            docs.push(rec.clone());

            for (term, freq) in tf {
                *doc_freq.entry(term.clone()).or_default() += 1;
                postings.entry(term).or_default().push((doc_idx as u32, freq));
            }
        }

        let doc_count = docs.len();
        let avgdl = doc_lengths.iter().map(|&l| l as f64).sum::<f64>() / doc_count as f64;

        let mut vocab = BTreeMap::new();
        for (term, df) in doc_freq {
            let idf = (1.0 + (doc_count as f64 - df as f64 + 0.5) / (df as f64 + 0.5)).ln();
            vocab.insert(term, TermStats { df, idf });
        }

        Ok(Self {
            k1,
            b,
            avgdl,
            doc_count,
            vocab,
            postings,
            doc_lengths,
            docs,
        })
    }

    /// Persist the artifact as a single JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string(self)?;
        fs::write(path, payload)?;
        tracing::info!(
            path = %path.display(),
            docs = self.doc_count,
            vocab = self.vocab.len(),
            avgdl = self.avgdl,
            "saved BM25 artifact"
        );
        Ok(())
    }

    /// Load a previously saved artifact.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let payload = fs::read_to_string(path).map_err(|e| {
            Error::bm25(format!(
                "missing BM25 artifact {}: {e}; build it with `standards-rag index-bm25`",
                path.display()
            ))
        })?;
        let index: Self = serde_json::from_str(&payload)
            .map_err(|e| Error::bm25(format!("corrupt BM25 artifact {}: {e}", path.display())))?;
        Ok(index)
    }

    fn term_score(&self, idf: f64, tf: f64, dl: f64) -> f64 {
        let denom = tf + self.k1 * (1.0 - self.b + self.b * (dl / self.avgdl.max(1e-9)));
        idf * ((tf * (self.k1 + 1.0)) / denom.max(1e-9))
    }

    /// Top-k lexical search ordered by `(-score, doc_id, start_page, chunk_id)`.
    ///
    /// Unknown query tokens contribute zero; an empty query yields zero
    /// results rather than an error.
    pub fn search(&self, query: &str, k: usize) -> Vec<Hit> {
        let q_terms = tokenize(query);
        if q_terms.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut qtf: BTreeMap<&str, u32> = BTreeMap::new();
        for term in &q_terms {
            *qtf.entry(term.as_str()).or_default() += 1;
        }

        let mut scores: HashMap<u32, f64> = HashMap::new();
        for (term, q_weight) in qtf {
            let Some(stats) = self.vocab.get(term) else {
                continue;
            };
            for &(doc_idx, tf) in self.postings.get(term).map(Vec::as_slice).unwrap_or(&[]) {
                let dl = self.doc_lengths[doc_idx as usize] as f64;
                let term_score = self.term_score(stats.idf, tf as f64, dl);
                *scores.entry(doc_idx).or_default() += term_score * q_weight as f64;
            }
        }

        let mut hits: Vec<Hit> = scores
            .into_iter()
            .map(|(doc_idx, score)| Hit::from_record(&self.docs[doc_idx as usize], score))
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tie_break_key().cmp(&b.tie_break_key()))
        });
        hits.truncate(k);
        hits
    }

    /// Score a free-standing text against a query using this index's IDF
    /// statistics. Used by the lexical rerank over fused candidates.
    pub fn score_text(&self, query: &str, text: &str) -> f64 {
        let q_terms = tokenize(query);
        if q_terms.is_empty() {
            return 0.0;
        }

        let mut tf: HashMap<String, u32> = HashMap::new();
        for token in tokenize(text) {
            *tf.entry(token).or_default() += 1;
        }
        let dl: f64 = tf.values().map(|&v| v as f64).sum();

        let mut qtf: BTreeMap<&str, u32> = BTreeMap::new();
        for term in &q_terms {
            *qtf.entry(term.as_str()).or_default() += 1;
        }

        let mut score = 0.0;
        for (term, q_weight) in qtf {
            let Some(stats) = self.vocab.get(term) else {
                continue;
            };
            let Some(&freq) = tf.get(term) else { continue };
            score += self.term_score(stats.idf, freq as f64, dl) * q_weight as f64;
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(vector_id: u32, doc_id: &str, page: u32, text: &str) -> ChunkRecord {
        ChunkRecord {
            vector_id,
            chunk_id: ChunkRecord::compose_chunk_id(doc_id, page, 0),
            doc_id: doc_id.to_string(),
            start_page: page,
            end_page: page,
            text: text.to_string(),
        }
    }

    fn index() -> Bm25Index {
        let store = ChunkStore::from_records(vec![
            record(0, "NIST.FIPS.203", 8, "ML-KEM.KeyGen generates an encapsulation key pair"),
            record(1, "NIST.FIPS.203", 20, "the encapsulation key is used by ML-KEM.Encaps"),
            record(2, "NIST.FIPS.204", 15, "ML-DSA.Sign produces a digital signature"),
        ])
        .unwrap();
        Bm25Index::build(&store, Bm25Index::DEFAULT_K1, Bm25Index::DEFAULT_B).unwrap()
    }

    #[test]
    fn tokenizer_emits_compound_and_components() {
        let tokens = tokenize("ML-KEM.KeyGen uses SHAKE128.");
        assert!(tokens.contains(&"ml-kem.keygen".to_string()));
        assert!(tokens.contains(&"ml".to_string()));
        assert!(tokens.contains(&"kem".to_string()));
        assert!(tokens.contains(&"keygen".to_string()));
        assert!(tokens.contains(&"shake128".to_string()));
    }

    #[test]
    fn tokenizer_strips_other_punctuation() {
        let tokens = tokenize("KeyGen(), [seed]; {rho}!");
        assert_eq!(tokens, vec!["keygen", "seed", "rho"]);
    }

    #[test]
    fn idf_matches_formula() {
        let idx = index();
        // "ml" appears in all three documents: df = 3, N = 3.
        let stats = idx.vocab.get("ml").unwrap();
        let expected = (1.0_f64 + (3.0 - 3.0 + 0.5) / (3.0 + 0.5)).ln();
        assert!((stats.idf - expected).abs() < 1e-12);
        assert_eq!(stats.df, 3);
    }

    #[test]
    fn exact_compound_query_prefers_defining_chunk() {
        let idx = index();
        let hits = idx.search("ML-KEM.KeyGen", 3);
        assert_eq!(hits[0].doc_id, "NIST.FIPS.203");
        assert_eq!(hits[0].start_page, 8);
    }

    #[test]
    fn unknown_tokens_score_zero() {
        let idx = index();
        assert!(idx.search("quantum teleportation", 5).is_empty());
    }

    #[test]
    fn empty_query_returns_no_hits() {
        let idx = index();
        assert!(idx.search("", 5).is_empty());
        assert!(idx.search("!!! ???", 5).is_empty());
    }

    #[test]
    fn save_load_round_trip_preserves_idf_and_postings() {
        let idx = index();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bm25.json");
        idx.save(&path).unwrap();
        let loaded = Bm25Index::load(&path).unwrap();
        assert_eq!(loaded.vocab, idx.vocab);
        assert_eq!(loaded.postings, idx.postings);
        assert_eq!(loaded.doc_lengths, idx.doc_lengths);
        assert!((loaded.avgdl - idx.avgdl).abs() < 1e-12);
    }

    #[test]
    fn score_text_rewards_matching_terms() {
        let idx = index();
        let with_term = idx.score_text("ML-KEM.KeyGen", "the ML-KEM.KeyGen routine");
        let without = idx.score_text("ML-KEM.KeyGen", "unrelated prose entirely");
        assert!(with_term > without);
        assert_eq!(without, 0.0);
    }
}
