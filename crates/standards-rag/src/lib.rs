//! standards-rag: citation-grounded question answering over a fixed corpus
//! of standards documents
//!
//! Given a natural-language question, the engine retrieves page-addressable
//! evidence with a deterministic hybrid pipeline (BM25 + dense retrieval,
//! query-variant fusion, optional lexical rerank), synthesizes a short
//! answer, and emits machine-checkable citations (document id + page range +
//! chunk id). A bounded controller decides when evidence suffices, refines
//! queries, and refuses rather than emit uncited claims.

pub mod agent;
pub mod config;
pub mod error;
pub mod eval;
pub mod generation;
pub mod index;
pub mod retrieval;
pub mod types;

pub use config::Settings;
pub use error::{Error, Result};
pub use types::{AnswerResult, ChunkRecord, Citation, Hit, REFUSAL_TEXT};
