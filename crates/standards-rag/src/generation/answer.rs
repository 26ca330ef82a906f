//! Cited answer synthesis and validation
//!
//! `build_cited_answer` is the single entry point: it budgets evidence,
//! assembles the prompt, calls the generator, and validates the output so
//! that every emitted answer is either fully cited or the exact refusal
//! sentinel. Two deterministic fallbacks recover answers the generator
//! refused but the evidence plainly contains: verbatim numbered algorithm
//! steps, and minimal two-topic comparisons.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::AnswerConfig;
use crate::error::Result;
use crate::generation::generator::Generator;
use crate::generation::prompt::{build_answer_prompt, format_evidence, prettify_pseudocode};
use crate::index::store::ChunkStore;
use crate::retrieval::evidence::{select_evidence, EvidencePolicy, Selection};
use crate::retrieval::variants::extract_compare_topics;
use crate::types::{
    extract_citation_keys, validate_answer, AnswerResult, Citation, Hit, REFUSAL_TEXT,
};

static ALGORITHM_NUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\balgorithm\s+(\d+)\b").expect("algorithm regex"));
static STEP_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\d+):\s*(.+)$").expect("step line regex"));

/// Role phrases recognized for the compare fallback, most specific first.
const ROLE_PHRASES: &[&str] = &[
    "key-encapsulation mechanism",
    "key encapsulation mechanism",
    "digital signature scheme",
    "digital signature algorithm",
];

/// Split text into sentences at `[.?!]` followed by whitespace.
fn sentences(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'?' | b'!') {
            let mut j = i + 1;
            if j < bytes.len() && bytes[j].is_ascii_whitespace() {
                let sentence = text[start..=i].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn key_number(key: &str) -> u32 {
    key[1..].parse().unwrap_or(0)
}

/// Validate raw generator output against the citation contract.
///
/// Refusals normalize to the exact sentinel with no citations. Non-refusal
/// output must use only known keys and carry at least one marker per
/// sentence; anything else collapses to a refusal — there is no repair.
pub fn enforce_inline_citations(
    answer_text: &str,
    key_to_citation: &BTreeMap<String, Citation>,
    require_citations: bool,
) -> AnswerResult {
    let ans = answer_text.trim();

    let refusal = || {
        let result = AnswerResult::refusal();
        debug_assert!(validate_answer(&result, require_citations, true).is_ok());
        result
    };

    if ans.to_lowercase().starts_with(REFUSAL_TEXT) {
        return refusal();
    }

    let used = extract_citation_keys(ans);
    if used.is_empty() {
        return refusal();
    }
    if used.iter().any(|k| !key_to_citation.contains_key(k)) {
        return refusal();
    }
    for sentence in sentences(ans) {
        if extract_citation_keys(sentence).is_empty() {
            return refusal();
        }
    }

    let mut keys: Vec<&String> = used.iter().collect();
    keys.sort_by_key(|k| key_number(k));
    let citations: Vec<Citation> = keys
        .into_iter()
        .map(|k| key_to_citation[k].clone())
        .collect();

    let result = AnswerResult::new(ans.to_string(), citations);
    debug_assert!(validate_answer(&result, require_citations, true).is_ok());
    result
}

/// Deterministic recovery for `Algorithm N` questions the generator refused.
///
/// Finds the evidence block that contains the exact `Algorithm N` phrase and
/// numbered step markers, then emits one bullet per verbatim step, each
/// cited to the source chunk.
pub fn algorithm_fallback(
    question: &str,
    evidence: &[Hit],
    key_to_citation: &BTreeMap<String, Citation>,
) -> Option<AnswerResult> {
    let caps = ALGORITHM_NUM_RE.captures(question)?;
    let phrase = format!("Algorithm {}", &caps[1]);

    for (i, hit) in evidence.iter().enumerate() {
        if !hit.text.contains(&phrase) {
            continue;
        }
        let pretty = prettify_pseudocode(&hit.text);
        let steps: Vec<(String, String)> = STEP_LINE_RE
            .captures_iter(&pretty)
            .map(|c| (c[1].to_string(), c[2].trim().to_string()))
            .collect();
        if steps.is_empty() {
            continue;
        }

        let key = format!("c{}", i + 1);
        let citation = key_to_citation.get(&key)?.clone();
        let bullets: Vec<String> = steps
            .iter()
            .map(|(n, step)| format!("- {n}: {step} [{key}]"))
            .collect();

        let result = AnswerResult::new(bullets.join("\n"), vec![citation]);
        if validate_answer(&result, true, true).is_ok() {
            return Some(result);
        }
    }
    None
}

fn role_in_text(text_lower: &str) -> Option<&'static str> {
    ROLE_PHRASES.iter().find(|p| text_lower.contains(*p)).copied()
}

fn pick_topic_hit<'a>(topic: &str, hits: &'a [Hit]) -> Option<&'a Hit> {
    let topic_lower = topic.to_lowercase();
    let mut first_mention: Option<&Hit> = None;
    for hit in hits {
        let text_lower = hit.text.to_lowercase();
        if !text_lower.contains(&topic_lower) {
            continue;
        }
        if role_in_text(&text_lower).is_some() {
            return Some(hit);
        }
        first_mention.get_or_insert(hit);
    }
    first_mention
}

/// Deterministic recovery for compare questions the generator refused.
///
/// Chooses one hit per topic from the full deduped hit list (not the
/// reduced context), assigns fresh local keys, and emits a minimal
/// three-bullet comparison whose last sentence cites both sources.
pub fn compare_fallback(question: &str, hits: &[Hit]) -> Option<AnswerResult> {
    let (topic_a, topic_b) = extract_compare_topics(question)?;

    // Dedup by chunk_id, first-seen wins; input is already ranked.
    let mut seen = std::collections::HashSet::new();
    let deduped: Vec<Hit> = hits
        .iter()
        .filter(|h| seen.insert(h.chunk_id.clone()))
        .cloned()
        .collect();

    let hit_a = pick_topic_hit(&topic_a, &deduped)?;
    let hit_b = pick_topic_hit(&topic_b, &deduped)?;
    if hit_a.chunk_id == hit_b.chunk_id {
        return None;
    }

    let describe = |topic: &str, hit: &Hit, key: &str| -> String {
        match role_in_text(&hit.text.to_lowercase()) {
            Some(role) => format!("- {topic} is a {role} [{key}]."),
            None => format!("- {topic} is specified in {} [{key}].", hit.doc_id),
        }
    };

    let answer = format!(
        "{}\n{}\n- The two schemes serve different roles and are specified separately [c1][c2].",
        describe(&topic_a, hit_a, "c1"),
        describe(&topic_b, hit_b, "c2"),
    );

    let citation = |key: &str, hit: &Hit| Citation {
        key: key.to_string(),
        doc_id: hit.doc_id.clone(),
        start_page: hit.start_page,
        end_page: hit.end_page,
        chunk_id: hit.chunk_id.clone(),
    };

    let result = AnswerResult::new(answer, vec![citation("c1", hit_a), citation("c2", hit_b)]);
    validate_answer(&result, true, true).ok()?;
    Some(result)
}

/// Generate a citation-grounded answer for a question over retrieved hits.
///
/// Never returns an error for evidence- or output-quality problems; those
/// terminate in the refusal sentinel. Only generator/environment failures
/// propagate.
pub async fn build_cited_answer(
    question: &str,
    hits: &[Hit],
    store: Option<&ChunkStore>,
    generator: &dyn Generator,
    config: &AnswerConfig,
) -> Result<AnswerResult> {
    let policy = EvidencePolicy::from(config);
    let evidence = match select_evidence(hits, store, &policy) {
        Selection::Sufficient(evidence) => evidence,
        Selection::Insufficient { unique_hits, required } => {
            tracing::debug!(unique_hits, required, "refusing: insufficient evidence");
            return Ok(AnswerResult::refusal());
        }
    };

    let (context, key_to_citation) = format_evidence(&evidence);
    let prompt = build_answer_prompt(question, &context);
    let raw_answer = generator.generate(&prompt).await?;

    let result = enforce_inline_citations(&raw_answer, &key_to_citation, config.require_citations);
    if !result.is_refusal() {
        return Ok(result);
    }

    if let Some(recovered) = algorithm_fallback(question, &evidence, &key_to_citation) {
        tracing::debug!("algorithm fallback produced a cited answer after refusal");
        return Ok(recovered);
    }
    if let Some(recovered) = compare_fallback(question, hits) {
        tracing::debug!("compare fallback produced a cited answer after refusal");
        return Ok(recovered);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::generator::test_support::ScriptedGenerator;

    fn hit(score: f64, chunk_id: &str, doc_id: &str, page: u32, text: &str) -> Hit {
        Hit {
            score,
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            start_page: page,
            end_page: page,
            text: text.to_string(),
        }
    }

    fn key_map(hits: &[Hit]) -> BTreeMap<String, Citation> {
        format_evidence(hits).1
    }

    fn config() -> AnswerConfig {
        AnswerConfig {
            include_neighbor_chunks: false,
            ..AnswerConfig::default()
        }
    }

    #[test]
    fn sentences_split_on_terminators() {
        let parts = sentences("First claim [c1]. Second? Third!  Tail [c2]");
        assert_eq!(parts, vec!["First claim [c1].", "Second?", "Third!", "Tail [c2]"]);
    }

    #[test]
    fn enforce_accepts_fully_cited_bullets() {
        let hits = vec![hit(1.0, "A0", "D", 1, "Evidence text"), hit(0.5, "A1", "D", 2, "More")];
        let keys = key_map(&hits);
        let result = enforce_inline_citations(
            "- Statement one [c1].\n- Statement two [c1].\n- Statement three [c2].",
            &keys,
            true,
        );
        assert!(!result.is_refusal());
        assert_eq!(result.citations.len(), 2);
        assert_eq!(result.citations[0].key, "c1");
        assert_eq!(result.citations[1].key, "c2");
    }

    #[test]
    fn enforce_rejects_uncited_sentence() {
        let hits = vec![hit(1.0, "A0", "D", 1, "Evidence text")];
        let keys = key_map(&hits);
        let result =
            enforce_inline_citations("Cited claim [c1]. This one has no marker.", &keys, true);
        assert!(result.is_refusal());
        assert!(result.citations.is_empty());
    }

    #[test]
    fn enforce_rejects_unknown_keys_without_repair() {
        let hits = vec![hit(1.0, "A0", "D", 1, "Evidence text")];
        let keys = key_map(&hits);
        let result = enforce_inline_citations("Claim [c7].", &keys, true);
        assert!(result.is_refusal());
    }

    #[test]
    fn enforce_normalizes_refusal_prefix() {
        let hits = vec![hit(1.0, "A0", "D", 1, "Evidence text")];
        let keys = key_map(&hits);
        let result = enforce_inline_citations(
            "Not found in provided docs. I could not locate this.",
            &keys,
            true,
        );
        assert_eq!(result.answer, REFUSAL_TEXT);
        assert!(result.citations.is_empty());
    }

    #[test]
    fn enforce_orders_used_keys_numerically() {
        let hits: Vec<Hit> = (0..12)
            .map(|i| hit(1.0, &format!("A{i}"), "D", i as u32 + 1, "text"))
            .collect();
        let keys = key_map(&hits);
        let result = enforce_inline_citations("Claim [c10][c2]. More [c1].", &keys, true);
        let order: Vec<&str> = result.citations.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2", "c10"]);
    }

    fn algorithm_hits() -> Vec<Hit> {
        vec![
            hit(
                1.0,
                "NIST.FIPS.202::p0001::c000",
                "NIST.FIPS.202",
                1,
                "Algorithm 2 SHAKE128 1: Init ctx 2: Absorb str1 3: Squeeze out",
            ),
            hit(0.1, "PAD::p0001::c000", "PAD", 1, "Padding evidence"),
        ]
    }

    #[tokio::test]
    async fn algorithm_fallback_recovers_steps_when_model_refuses() {
        let generator = ScriptedGenerator::always(REFUSAL_TEXT);
        let result = build_cited_answer(
            "What are the steps in Algorithm 2 SHAKE128?",
            &algorithm_hits(),
            None,
            &generator,
            &config(),
        )
        .await
        .unwrap();

        assert!(!result.is_refusal());
        assert!(result.answer.contains("[c1]"));
        assert!(result.answer.contains("1: Init ctx"));
        assert!(result.answer.contains("3: Squeeze out"));
        assert_eq!(result.citations.len(), 1);
        assert_eq!(result.citations[0].chunk_id, "NIST.FIPS.202::p0001::c000");
    }

    #[tokio::test]
    async fn compare_fallback_cites_one_chunk_per_topic() {
        let hits = vec![
            hit(
                1.0,
                "NIST.FIPS.203::p0008::c000",
                "NIST.FIPS.203",
                8,
                "ML-KEM is a key-encapsulation mechanism standardized for key establishment.",
            ),
            hit(
                0.9,
                "NIST.FIPS.204::p0012::c000",
                "NIST.FIPS.204",
                12,
                "ML-DSA is a digital signature scheme intended for signing.",
            ),
        ];
        let generator = ScriptedGenerator::always(REFUSAL_TEXT);
        let result = build_cited_answer(
            "What are the differences between ML-KEM and ML-DSA?",
            &hits,
            None,
            &generator,
            &config(),
        )
        .await
        .unwrap();

        assert!(!result.is_refusal());
        assert!(result.answer.contains("[c1][c2]"));
        let docs: Vec<&str> = result.citations.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(docs, vec!["NIST.FIPS.203", "NIST.FIPS.204"]);
    }

    #[tokio::test]
    async fn refusal_stands_when_no_fallback_applies() {
        let hits = vec![
            hit(1.0, "A0", "D", 1, "Evidence text"),
            hit(0.5, "A1", "D", 2, "More evidence"),
        ];
        let generator = ScriptedGenerator::always(REFUSAL_TEXT);
        let result = build_cited_answer("What about wifi 9?", &hits, None, &generator, &config())
            .await
            .unwrap();
        assert_eq!(result.answer, REFUSAL_TEXT);
        assert!(result.citations.is_empty());
    }

    #[tokio::test]
    async fn insufficient_evidence_refuses_without_calling_generator() {
        let hits = vec![hit(1.0, "A0", "D", 1, "Lone hit")];
        let generator = ScriptedGenerator::always("should never run [c1].");
        let result = build_cited_answer("Q", &hits, None, &generator, &config())
            .await
            .unwrap();
        assert!(result.is_refusal());
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn generator_errors_propagate() {
        let hits = vec![
            hit(1.0, "A0", "D", 1, "Evidence text"),
            hit(0.5, "A1", "D", 2, "More evidence"),
        ];
        let generator = ScriptedGenerator::failing("backend down");
        let err = build_cited_answer("Q", &hits, None, &generator, &config()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn valid_generator_output_is_returned_with_citations() {
        let hits = vec![
            hit(1.0, "A0", "D", 1, "Evidence text"),
            hit(0.5, "A1", "D", 2, "More evidence"),
        ];
        let generator = ScriptedGenerator::always("- Grounded claim [c1].\n- Second claim [c2].");
        let result = build_cited_answer("Q", &hits, None, &generator, &config())
            .await
            .unwrap();
        assert!(!result.is_refusal());
        assert_eq!(result.citations.len(), 2);
    }
}
