//! Configuration for the QA engine
//!
//! All knobs load from environment variables with defaults, so the same
//! binary can be pointed at different corpora and budgets without code
//! changes. `Settings::from_env` fails fast on unparseable values and
//! `validate` rejects inconsistent ones before any index is opened.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn env_str(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::config(format!("Invalid integer for {name}={v:?}"))),
        _ => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "t" | "yes" | "y" | "on")
        }
        _ => default,
    }
}

fn env_f32(name: &str, default: f32) -> Result<f32> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<f32>()
            .map_err(|_| Error::config(format!("Invalid float for {name}={v:?}"))),
        _ => Ok(default),
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Base-mode backend: "faiss" (dense) or "bm25"
    pub vector_backend: String,
    /// Final number of hits returned
    pub top_k: usize,
    /// "base" (single backend) or "hybrid" (dense + bm25 + fusion)
    pub mode: String,
    /// Enable deterministic query variants before fusion
    pub query_fusion: bool,
    /// RRF constant in 1/(k0 + rank)
    pub rrf_k0: usize,
    /// Candidate expansion factor before fusion
    pub candidate_multiplier: usize,
    /// Lightweight lexical rerank over fused candidates
    pub enable_rerank: bool,
    /// Fused pool size considered before rerank truncation
    pub rerank_pool: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_backend: "faiss".to_string(),
            top_k: 8,
            mode: "hybrid".to_string(),
            query_fusion: true,
            rrf_k0: 60,
            candidate_multiplier: 4,
            enable_rerank: true,
            rerank_pool: 40,
        }
    }
}

/// Answer / evidence policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerConfig {
    /// Max evidence chunks sent to the generator
    pub max_context_chunks: usize,
    /// Max combined evidence text length; standards chunks can be dense
    /// (algorithms, tables), so this bounds prompt growth
    pub max_context_chars: usize,
    /// Minimum unique hits required before answering
    pub min_evidence_hits: usize,
    /// Enforce the citation-required answer contract
    pub require_citations: bool,
    /// Include adjacent chunks from the same document
    pub include_neighbor_chunks: bool,
    /// Neighbor distance in vector_id space (1 means +/- 1)
    pub neighbor_window: usize,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            max_context_chunks: 6,
            max_context_chars: 12_000,
            min_evidence_hits: 2,
            require_citations: true,
            include_neighbor_chunks: true,
            neighbor_window: 1,
        }
    }
}

/// Agent loop bounds and stop rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Total node transitions allowed per request
    pub max_steps: usize,
    /// Maximum retrieval tool calls per request
    pub max_tool_calls: usize,
    /// Maximum retrieve-assess rounds before forced stop
    pub max_retrieval_rounds: usize,
    /// Minimum unique evidence chunks before answer generation
    pub min_evidence_hits: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 8,
            max_tool_calls: 3,
            max_retrieval_rounds: 2,
            min_evidence_hits: 2,
        }
    }
}

/// Generator (LLM endpoint) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of the generation endpoint
    pub base_url: String,
    /// Generation model name
    pub generate_model: String,
    /// Embedding model name (dense query embedding)
    pub embed_model: String,
    /// Temperature; 0.0 keeps generation deterministic
    pub temperature: f32,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Retry attempts for transient failures
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            generate_model: "llama3.2:3b".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            temperature: 0.0,
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

/// Artifact locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the processed corpus artifacts
    pub processed_dir: PathBuf,
}

impl DataConfig {
    pub fn chunk_store_path(&self) -> PathBuf {
        self.processed_dir.join("chunk_store.jsonl")
    }

    pub fn bm25_path(&self) -> PathBuf {
        self.processed_dir.join("bm25.json")
    }

    pub fn dense_path(&self) -> PathBuf {
        self.processed_dir.join("dense.json")
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            processed_dir: PathBuf::from("data/processed"),
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub retrieval: RetrievalConfig,
    pub answer: AnswerConfig,
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub data: DataConfig,
}

impl Settings {
    /// Load settings from environment variables over the built-in defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let retrieval = RetrievalConfig {
            vector_backend: env_str("VECTOR_BACKEND", &defaults.retrieval.vector_backend),
            top_k: env_usize("TOP_K", defaults.retrieval.top_k)?,
            mode: env_str("RETRIEVAL_MODE", &defaults.retrieval.mode),
            query_fusion: env_bool("RETRIEVAL_QUERY_FUSION", defaults.retrieval.query_fusion),
            rrf_k0: env_usize("RETRIEVAL_RRF_K0", defaults.retrieval.rrf_k0)?,
            candidate_multiplier: env_usize(
                "RETRIEVAL_CANDIDATE_MULTIPLIER",
                defaults.retrieval.candidate_multiplier,
            )?,
            enable_rerank: env_bool("RETRIEVAL_ENABLE_RERANK", defaults.retrieval.enable_rerank),
            rerank_pool: env_usize("RETRIEVAL_RERANK_POOL", defaults.retrieval.rerank_pool)?,
        };

        let answer = AnswerConfig {
            max_context_chunks: env_usize(
                "ASK_MAX_CONTEXT_CHUNKS",
                defaults.answer.max_context_chunks,
            )?,
            max_context_chars: env_usize(
                "ASK_MAX_CONTEXT_CHARS",
                defaults.answer.max_context_chars,
            )?,
            min_evidence_hits: env_usize(
                "ASK_MIN_EVIDENCE_HITS",
                defaults.answer.min_evidence_hits,
            )?,
            require_citations: env_bool("ASK_REQUIRE_CITATIONS", defaults.answer.require_citations),
            include_neighbor_chunks: env_bool(
                "ASK_INCLUDE_NEIGHBOR_CHUNKS",
                defaults.answer.include_neighbor_chunks,
            ),
            neighbor_window: env_usize("ASK_NEIGHBOR_WINDOW", defaults.answer.neighbor_window)?,
        };

        // AGENT_MIN_EVIDENCE_HITS falls back to ASK_MIN_EVIDENCE_HITS so a
        // single override keeps both layers consistent.
        let agent_min = env_usize(
            "AGENT_MIN_EVIDENCE_HITS",
            env_usize("ASK_MIN_EVIDENCE_HITS", defaults.agent.min_evidence_hits)?,
        )?;
        let agent = AgentConfig {
            max_steps: env_usize("AGENT_MAX_STEPS", defaults.agent.max_steps)?,
            max_tool_calls: env_usize("AGENT_MAX_TOOL_CALLS", defaults.agent.max_tool_calls)?,
            max_retrieval_rounds: env_usize(
                "AGENT_MAX_RETRIEVAL_ROUNDS",
                defaults.agent.max_retrieval_rounds,
            )?,
            min_evidence_hits: agent_min,
        };

        let llm = LlmConfig {
            base_url: env_str("LLM_BASE_URL", &defaults.llm.base_url),
            generate_model: env_str("LLM_GENERATE_MODEL", &defaults.llm.generate_model),
            embed_model: env_str("LLM_EMBED_MODEL", &defaults.llm.embed_model),
            temperature: env_f32("LLM_TEMPERATURE", defaults.llm.temperature)?,
            timeout_secs: env_usize("LLM_TIMEOUT_SECS", defaults.llm.timeout_secs as usize)? as u64,
            max_retries: env_usize("LLM_MAX_RETRIES", defaults.llm.max_retries as usize)? as u32,
        };

        let data = DataConfig {
            processed_dir: PathBuf::from(env_str(
                "DATA_PROCESSED_DIR",
                defaults.data.processed_dir.to_str().unwrap_or("data/processed"),
            )),
        };

        let settings = Self {
            retrieval,
            answer,
            agent,
            llm,
            data,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validate consistency; errors here must be raised before any index loads.
    pub fn validate(&self) -> Result<()> {
        const BACKENDS: [&str; 2] = ["faiss", "bm25"];
        if !BACKENDS.contains(&self.retrieval.vector_backend.as_str()) {
            return Err(Error::config(format!(
                "VECTOR_BACKEND must be one of {BACKENDS:?}, got {:?}",
                self.retrieval.vector_backend
            )));
        }
        const MODES: [&str; 2] = ["base", "hybrid"];
        if !MODES.contains(&self.retrieval.mode.as_str()) {
            return Err(Error::config(format!(
                "RETRIEVAL_MODE must be one of {MODES:?}, got {:?}",
                self.retrieval.mode
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(Error::config("TOP_K must be > 0"));
        }
        if self.retrieval.rrf_k0 == 0 {
            return Err(Error::config("RETRIEVAL_RRF_K0 must be > 0"));
        }
        if self.retrieval.candidate_multiplier == 0 {
            return Err(Error::config("RETRIEVAL_CANDIDATE_MULTIPLIER must be > 0"));
        }
        if self.retrieval.rerank_pool == 0 {
            return Err(Error::config("RETRIEVAL_RERANK_POOL must be > 0"));
        }
        if self.answer.max_context_chunks == 0 {
            return Err(Error::config("ASK_MAX_CONTEXT_CHUNKS must be > 0"));
        }
        if self.answer.max_context_chars == 0 {
            return Err(Error::config("ASK_MAX_CONTEXT_CHARS must be > 0"));
        }
        if self.agent.max_steps == 0 {
            return Err(Error::config("AGENT_MAX_STEPS must be > 0"));
        }
        if self.agent.max_tool_calls == 0 {
            return Err(Error::config("AGENT_MAX_TOOL_CALLS must be > 0"));
        }
        if self.agent.max_retrieval_rounds == 0 {
            return Err(Error::config("AGENT_MAX_RETRIEVAL_ROUNDS must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn rejects_unknown_backend() {
        let mut settings = Settings::default();
        settings.retrieval.vector_backend = "pinecone".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_unknown_mode() {
        let mut settings = Settings::default();
        settings.retrieval.mode = "ensemble".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_budgets() {
        let mut settings = Settings::default();
        settings.agent.max_tool_calls = 0;
        assert!(settings.validate().is_err());
    }
}
