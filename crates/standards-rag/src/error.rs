//! Error types for the QA engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
///
/// The answer layer and the agent loop never surface evidence- or
/// output-quality problems through this type; those always terminate in a
/// validated answer or the refusal sentinel. Only configuration, data, and
/// environment failures propagate as `Error`.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (invalid mode/backend, non-positive budget)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset row failed validation
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Chunk store artifact is missing or malformed
    #[error("Chunk store error: {0}")]
    ChunkStore(String),

    /// BM25 artifact is missing or malformed
    #[error("BM25 index error: {0}")]
    Bm25(String),

    /// Dense index / embedding backend failure
    #[error("Dense retrieval error: {0}")]
    Dense(String),

    /// Generator (LLM) failure after retries
    #[error("Generator error: {0}")]
    Generator(String),

    /// Answer contract violation (programmer error in callers, not model output)
    #[error("Answer contract violation: {0}")]
    AnswerContract(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a dataset error
    pub fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset(message.into())
    }

    /// Create a chunk store error
    pub fn chunk_store(message: impl Into<String>) -> Self {
        Self::ChunkStore(message.into())
    }

    /// Create a BM25 error
    pub fn bm25(message: impl Into<String>) -> Self {
        Self::Bm25(message.into())
    }

    /// Create a dense retrieval error
    pub fn dense(message: impl Into<String>) -> Self {
        Self::Dense(message.into())
    }

    /// Create a generator error
    pub fn generator(message: impl Into<String>) -> Self {
        Self::Generator(message.into())
    }
}
