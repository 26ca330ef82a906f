//! In-memory chunk store keyed by chunk_id and vector_id
//!
//! The store is built once at startup from the chunk store JSONL artifact and
//! read-only thereafter; iteration order is ascending `vector_id`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::ChunkRecord;

/// Immutable chunk corpus with lookup by `chunk_id` and `vector_id`.
#[derive(Debug, Default)]
pub struct ChunkStore {
    by_vector_id: BTreeMap<u32, ChunkRecord>,
    chunk_to_vector: HashMap<String, u32>,
}

impl ChunkStore {
    /// Load the chunk store from a JSONL artifact.
    ///
    /// Each line is one record; blank lines are skipped. Malformed rows are
    /// rejected with a line-aware message rather than silently dropped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::chunk_store(format!("missing chunk store {}: {e}", path.display()))
        })?;
        let reader = BufReader::new(file);

        let mut store = Self::default();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let rec: ChunkRecord = serde_json::from_str(trimmed).map_err(|e| {
                Error::chunk_store(format!("{}:{}: invalid record: {e}", path.display(), lineno + 1))
            })?;
            store.insert(rec, Some(lineno + 1), path)?;
        }

        if store.is_empty() {
            return Err(Error::chunk_store(format!(
                "no rows found in {}",
                path.display()
            )));
        }
        tracing::debug!(chunks = store.len(), "chunk store loaded");
        Ok(store)
    }

    /// Build a store from records already in memory (tests, tooling).
    pub fn from_records(records: Vec<ChunkRecord>) -> Result<Self> {
        let mut store = Self::default();
        for rec in records {
            store.insert(rec, None, Path::new("<memory>"))?;
        }
        Ok(store)
    }

    fn insert(&mut self, rec: ChunkRecord, lineno: Option<usize>, path: &Path) -> Result<()> {
        let at = match lineno {
            Some(n) => format!("{}:{n}", path.display()),
            None => path.display().to_string(),
        };
        if rec.chunk_id.is_empty() || rec.text.is_empty() {
            return Err(Error::chunk_store(format!(
                "{at}: chunk_id and text must be non-empty"
            )));
        }
        if rec.start_page == 0 || rec.end_page < rec.start_page {
            return Err(Error::chunk_store(format!(
                "{at}: invalid page span p{}-p{}",
                rec.start_page, rec.end_page
            )));
        }
        if self.chunk_to_vector.contains_key(&rec.chunk_id) {
            return Err(Error::chunk_store(format!(
                "{at}: duplicate chunk_id {:?}",
                rec.chunk_id
            )));
        }
        if self.by_vector_id.contains_key(&rec.vector_id) {
            return Err(Error::chunk_store(format!(
                "{at}: duplicate vector_id {}",
                rec.vector_id
            )));
        }
        self.chunk_to_vector.insert(rec.chunk_id.clone(), rec.vector_id);
        self.by_vector_id.insert(rec.vector_id, rec);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_vector_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_vector_id.is_empty()
    }

    pub fn get_by_vector_id(&self, vector_id: u32) -> Option<&ChunkRecord> {
        self.by_vector_id.get(&vector_id)
    }

    pub fn get_by_chunk_id(&self, chunk_id: &str) -> Option<&ChunkRecord> {
        self.chunk_to_vector
            .get(chunk_id)
            .and_then(|vid| self.by_vector_id.get(vid))
    }

    /// Iterate records in ascending `vector_id` order.
    pub fn iter(&self) -> impl Iterator<Item = &ChunkRecord> {
        self.by_vector_id.values()
    }

    /// Same-document neighbors of a chunk by `vector_id` adjacency.
    ///
    /// Returns up to `window` records per side, nearest first, skipping
    /// neighbors that cross a document boundary.
    pub fn neighbors(&self, chunk_id: &str, window: usize) -> Vec<&ChunkRecord> {
        let Some(&vector_id) = self.chunk_to_vector.get(chunk_id) else {
            return Vec::new();
        };
        let Some(seed) = self.by_vector_id.get(&vector_id) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for delta in 1..=window as u32 {
            for candidate in [vector_id.checked_sub(delta), vector_id.checked_add(delta)] {
                let Some(vid) = candidate else { continue };
                let Some(rec) = self.by_vector_id.get(&vid) else {
                    continue;
                };
                if rec.doc_id == seed.doc_id {
                    out.push(rec);
                }
            }
        }
        out
    }

    /// Chunks overlapping an inclusive page range of one document, sorted by
    /// `(start_page, chunk_id)`.
    pub fn chunks_for_doc_pages(
        &self,
        doc_id: &str,
        start_page: u32,
        end_page: u32,
    ) -> Vec<&ChunkRecord> {
        let mut out: Vec<&ChunkRecord> = self
            .iter()
            .filter(|rec| {
                rec.doc_id == doc_id && rec.start_page <= end_page && rec.end_page >= start_page
            })
            .collect();
        out.sort_by(|a, b| {
            a.start_page
                .cmp(&b.start_page)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        out
    }
}
