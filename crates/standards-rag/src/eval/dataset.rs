//! Evaluation dataset: line-based JSON questions with gold page spans
//!
//! Expected row shape:
//! `{"qid": "q001", "question": "What is ML-KEM?", "answerable": true,
//!   "gold": [{"doc_id": "NIST.FIPS.203", "start_page": 8, "end_page": 9}]}`

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static QID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<prefix>[A-Za-z_-]*?)(?P<num>\d+)$").expect("qid regex"));

/// Labeled relevant page span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldSpan {
    pub doc_id: String,
    pub start_page: u32,
    pub end_page: u32,
}

/// One evaluation question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRow {
    pub qid: String,
    pub question: String,
    pub answerable: bool,
    #[serde(default)]
    pub gold: Vec<GoldSpan>,
}

/// Deterministic qid ordering with numeric awareness, so `q2 < q10`.
pub fn qid_sort_key(qid: &str) -> (u8, String, u64, String) {
    let s = qid.trim().to_string();
    if let Some(caps) = QID_RE.captures(&s) {
        let num: u64 = caps["num"].parse().unwrap_or(0);
        return (0, caps["prefix"].to_string(), num, s.clone());
    }
    (1, s.clone(), 0, s)
}

fn normalize_gold(mut gold: Vec<GoldSpan>, at: &str) -> Result<Vec<GoldSpan>> {
    for span in &gold {
        if span.doc_id.trim().is_empty() {
            return Err(Error::dataset(format!("{at}: gold.doc_id must be non-empty")));
        }
        if span.start_page == 0 || span.end_page == 0 {
            return Err(Error::dataset(format!("{at}: gold page spans must be positive")));
        }
        if span.start_page > span.end_page {
            return Err(Error::dataset(format!(
                "{at}: gold start_page must be <= end_page"
            )));
        }
    }
    // Stable ordering for deterministic artifacts.
    gold.sort_by(|a, b| {
        a.doc_id
            .cmp(&b.doc_id)
            .then_with(|| a.start_page.cmp(&b.start_page))
            .then_with(|| a.end_page.cmp(&b.end_page))
    });
    Ok(gold)
}

/// Validate rows and enforce the labeling contract.
pub fn validate_questions(rows: &mut [QuestionRow], require_labeled: bool) -> Result<()> {
    let mut seen_qids: HashSet<String> = HashSet::new();
    for (idx, row) in rows.iter_mut().enumerate() {
        let at = format!("row {}", idx + 1);

        row.qid = row.qid.trim().to_string();
        if row.qid.is_empty() {
            return Err(Error::dataset(format!("{at}: qid must be non-empty")));
        }
        if !seen_qids.insert(row.qid.clone()) {
            return Err(Error::dataset(format!("{at}: duplicate qid {:?}", row.qid)));
        }

        row.question = row.question.trim().to_string();
        if row.question.is_empty() {
            return Err(Error::dataset(format!("{at}: question must be non-empty")));
        }

        row.gold = normalize_gold(std::mem::take(&mut row.gold), &at)?;

        if row.answerable && require_labeled && row.gold.is_empty() {
            return Err(Error::dataset(format!(
                "{at} ({}): answerable=true requires at least one gold span",
                row.qid
            )));
        }
        if !row.answerable && !row.gold.is_empty() {
            return Err(Error::dataset(format!(
                "{at} ({}): answerable=false must not include gold spans",
                row.qid
            )));
        }
    }
    Ok(())
}

/// Load, normalize, validate, and sort questions from a JSONL file.
pub fn load_questions(path: impl AsRef<Path>, require_labeled: bool) -> Result<Vec<QuestionRow>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::dataset(format!("question dataset not found: {}: {e}", path.display())))?;
    let reader = BufReader::new(file);

    let mut rows: Vec<QuestionRow> = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let row: QuestionRow = serde_json::from_str(trimmed).map_err(|e| {
            Error::dataset(format!("{}:{}: invalid JSON: {e}", path.display(), lineno + 1))
        })?;
        rows.push(row);
    }

    validate_questions(&mut rows, require_labeled)?;
    rows.sort_by_key(|r| qid_sort_key(&r.qid));
    Ok(rows)
}
