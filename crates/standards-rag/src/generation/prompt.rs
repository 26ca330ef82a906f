//! Prompt assembly for citation-grounded answers
//!
//! Evidence is rendered as numbered blocks with machine-checkable headers;
//! the system contract pins the generator to those blocks and to the exact
//! refusal sentinel.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::{Citation, Hit, REFUSAL_TEXT};

static STEP_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+(\d+:)").expect("step marker regex"));
static FOR_LOOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+(for \()").expect("for loop regex"));

/// Normalize pseudocode layout that PDF extraction flattened onto one line:
/// numbered step markers (`1:`, `2:`) and `for (` headers start a new line.
pub fn prettify_pseudocode(text: &str) -> String {
    let with_steps = STEP_MARKER_RE.replace_all(text, "\n$1");
    FOR_LOOP_RE.replace_all(&with_steps, "\n$1").into_owned()
}

/// Render evidence blocks and assign citation keys `c1..cN` in block order.
///
/// Returns the joined context string and the key → citation map the
/// validator checks generated markers against.
pub fn format_evidence(evidence: &[Hit]) -> (String, BTreeMap<String, Citation>) {
    let mut key_to_citation = BTreeMap::new();
    let mut blocks = Vec::with_capacity(evidence.len());

    for (i, h) in evidence.iter().enumerate() {
        let key = format!("c{}", i + 1);
        key_to_citation.insert(
            key.clone(),
            Citation {
                key: key.clone(),
                doc_id: h.doc_id.clone(),
                start_page: h.start_page,
                end_page: h.end_page,
                chunk_id: h.chunk_id.clone(),
            },
        );
        blocks.push(format!(
            "[{key}] | {} | p{}-p{} | {}\n{}",
            h.doc_id,
            h.start_page,
            h.end_page,
            h.chunk_id,
            prettify_pseudocode(h.text.trim()),
        ));
    }

    (blocks.join("\n\n---\n\n"), key_to_citation)
}

/// Build the full answer prompt: contract rules, question, evidence.
pub fn build_answer_prompt(question: &str, context: &str) -> String {
    format!(
        "You are a citation-grounded assistant. Answer ONLY using the evidence below.\n\
         Rules:\n\
         1) Answer only from the provided context; never use outside knowledge.\n\
         2) Every sentence MUST end with at least one inline citation marker like [c1]; \
         multiple markers are allowed as [c1][c2] or [c1, c2].\n\
         3) If the evidence is insufficient or the answer is unknown, reply exactly: {REFUSAL_TEXT}\n\
         4) Do not introduce numeric, algorithmic, or symbolic specifics that are not in the context.\n\
         5) Prefer short bulleted claims.\n\
         6) Use ONLY citation keys that appear in the evidence headers.\n\n\
         Question:\n{question}\n\n\
         Evidence:\n{context}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: &str, doc_id: &str, page: u32, text: &str) -> Hit {
        Hit {
            score: 1.0,
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            start_page: page,
            end_page: page,
            text: text.to_string(),
        }
    }

    #[test]
    fn prettify_breaks_step_markers_and_for_loops() {
        let flat = "Algorithm 2 SHAKE128 1: Init ctx 2: Absorb str for (i, b) in pairs";
        let pretty = prettify_pseudocode(flat);
        assert!(pretty.contains("\n1: Init ctx"));
        assert!(pretty.contains("\n2: Absorb str"));
        assert!(pretty.contains("\nfor (i, b) in pairs"));
    }

    #[test]
    fn evidence_headers_carry_doc_pages_and_chunk_id() {
        let evidence = vec![
            hit("NIST.FIPS.203::p0008::c000", "NIST.FIPS.203", 8, "first"),
            hit("NIST.FIPS.204::p0015::c001", "NIST.FIPS.204", 15, "second"),
        ];
        let (context, keys) = format_evidence(&evidence);
        assert!(context.contains("[c1] | NIST.FIPS.203 | p8-p8 | NIST.FIPS.203::p0008::c000"));
        assert!(context.contains("[c2] | NIST.FIPS.204 | p15-p15 | NIST.FIPS.204::p0015::c001"));
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["c1"].chunk_id, "NIST.FIPS.203::p0008::c000");
        assert_eq!(keys["c2"].doc_id, "NIST.FIPS.204");
    }

    #[test]
    fn key_assignment_follows_context_order() {
        let evidence: Vec<Hit> = (1..=3u32)
            .map(|i| hit(&format!("D::p000{i}::c000"), "D", i, "text"))
            .collect();
        let (_, keys) = format_evidence(&evidence);
        assert_eq!(keys["c2"].start_page, 2);
        assert_eq!(keys["c3"].start_page, 3);
    }

    #[test]
    fn rendered_context_round_trips_the_key_set() {
        let evidence: Vec<Hit> = (1..=4u32)
            .map(|i| hit(&format!("D::p000{i}::c000"), "D", i, "body text"))
            .collect();
        let (context, keys) = format_evidence(&evidence);
        let parsed = crate::types::extract_citation_keys(&context);
        let assigned: std::collections::BTreeSet<String> = keys.keys().cloned().collect();
        assert_eq!(parsed, assigned);
    }

    #[test]
    fn prompt_embeds_refusal_sentinel_and_question() {
        let prompt = build_answer_prompt("What is ML-KEM?", "[c1] | D | p1-p1 | x\nbody");
        assert!(prompt.contains(REFUSAL_TEXT));
        assert!(prompt.contains("What is ML-KEM?"));
        assert!(prompt.contains("[c1] | D | p1-p1 | x"));
    }
}
