//! Core data types for chunks, hits, citations, and answers

pub mod answer;
pub mod chunk;

pub use answer::{
    extract_citation_keys, validate_answer, AnswerResult, Citation, REFUSAL_TEXT,
};
pub use chunk::{ChunkRecord, Hit};
