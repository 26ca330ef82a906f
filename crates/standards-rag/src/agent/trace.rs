//! Trace artifact writer
//!
//! One JSON file per agent run, named `agent_<YYYYMMDD_HHMMSS>_<slug>.json`.
//! Evidence text is truncated so traces stay readable; everything else is
//! the final state verbatim.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::agent::state::AgentState;
use crate::error::Result;

const TRUNCATE_EVIDENCE_CHARS: usize = 800;

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("ws regex"));
static NON_SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_]+").expect("slug regex"));

fn slugify(text: &str, max_len: usize) -> String {
    let lowered = text.trim().to_lowercase();
    let underscored = WHITESPACE_RE.replace_all(&lowered, "_");
    let slug = NON_SLUG_RE.replace_all(&underscored, "").into_owned();
    let truncated: String = slug.chars().take(max_len).collect();
    if truncated.is_empty() {
        "question".to_string()
    } else {
        truncated
    }
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let head: String = text.chars().take(limit).collect();
    format!("{head}…(truncated)")
}

/// Write the final state to a trace file and return its path.
pub fn write_trace(state: &AgentState, out_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let out_dir = out_dir.as_ref();
    fs::create_dir_all(out_dir)?;

    let slug = slugify(&state.question, 80);
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = out_dir.join(format!("agent_{timestamp}_{slug}.json"));

    let mut payload = serde_json::to_value(state)?;
    if let Some(evidence) = payload.get_mut("evidence").and_then(|v| v.as_array_mut()) {
        for item in evidence {
            if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                let truncated = truncate_text(text, TRUNCATE_EVIDENCE_CHARS);
                item["text"] = serde_json::Value::String(truncated);
            }
        }
    }

    fs::write(&path, serde_json::to_string_pretty(&payload)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hit;

    #[test]
    fn slugify_keeps_alphanumerics_and_underscores() {
        assert_eq!(slugify("What is ML-KEM?", 80), "what_is_mlkem");
        assert_eq!(slugify("  ", 80), "question");
    }

    #[test]
    fn trace_truncates_long_evidence_text() {
        let mut state = AgentState::new("q");
        state.evidence.push(Hit {
            score: 1.0,
            chunk_id: "x".to_string(),
            doc_id: "D".to_string(),
            start_page: 1,
            end_page: 1,
            text: "a".repeat(2_000),
        });

        let dir = tempfile::tempdir().unwrap();
        let path = write_trace(&state, dir.path()).unwrap();
        let payload: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let text = payload["evidence"][0]["text"].as_str().unwrap();
        assert!(text.ends_with("…(truncated)"));
        assert!(text.chars().count() < 900);
    }

    #[test]
    fn trace_filename_has_prefix_and_slug() {
        let state = AgentState::new("ML-KEM key generation");
        let dir = tempfile::tempdir().unwrap();
        let path = write_trace(&state, dir.path()).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("agent_"));
        assert!(name.ends_with("_mlkem_key_generation.json"));
    }
}
