//! Deterministic query variant generation
//!
//! Standards prose names the same object three ways: the compound identifier
//! (`ML-KEM.KeyGen`), its spelled-out operation ("key generation"), and a
//! numbered anchor ("Algorithm 19"). The expansion below bridges those
//! surface forms without an LLM: it is a pure function of the input string,
//! stable-deduped, and always yields the original query first.

use std::sync::LazyLock;

use regex::Regex;

static TECH_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]+(?:[-._][A-Za-z0-9]+)+").expect("tech token regex"));
static ALGORITHM_NUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\balgorithm\s+(\d+)\b").expect("algorithm regex"));

static COMPARE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)differences?\s+between\s+(?P<a>.+?)\s+and\s+(?P<b>.+)$").unwrap(),
        Regex::new(r"(?i)\bcompare\s+(?P<a>.+?)\s+(?:and|with)\s+(?P<b>.+)$").unwrap(),
        Regex::new(r"(?i)\bcomparison\s+of\s+(?P<a>.+?)\s+and\s+(?P<b>.+)$").unwrap(),
        Regex::new(r"(?i)(?P<a>.+?)\s+(?:vs\.?|versus)\s+(?P<b>.+)$").unwrap(),
    ]
});

/// Scheme families present in the corpus and the operations each defines.
const SCHEME_OPERATIONS: &[(&str, &[(&str, &str)])] = &[
    (
        "ML-KEM",
        &[
            ("key generation", "KeyGen"),
            ("encapsulation", "Encaps"),
            ("decapsulation", "Decaps"),
        ],
    ),
    (
        "ML-DSA",
        &[("key generation", "KeyGen"), ("sign", "Sign"), ("verify", "Verify")],
    ),
    (
        "SLH-DSA",
        &[("key generation", "KeyGen"), ("sign", "Sign"), ("verify", "Verify")],
    ),
];

fn clean_topic_text(text: &str) -> String {
    text.trim()
        .trim_matches(|c: char| " .,:;\"'`[](){}".contains(c))
        .to_string()
}

/// Parse the two topics of a compare-style question.
///
/// Returns `None` when no compare phrasing matches or when both topics
/// normalize to the same string.
pub fn extract_compare_topics(question: &str) -> Option<(String, String)> {
    let q = question.trim().trim_end_matches('?').trim();
    if q.is_empty() {
        return None;
    }

    for pattern in COMPARE_PATTERNS.iter() {
        let Some(caps) = pattern.captures(q) else {
            continue;
        };
        let topic_a = clean_topic_text(&caps["a"]);
        let topic_b = clean_topic_text(&caps["b"]);
        if !topic_a.is_empty()
            && !topic_b.is_empty()
            && topic_a.to_lowercase() != topic_b.to_lowercase()
        {
            return Some((topic_a, topic_b));
        }
    }
    None
}

/// Technical tokens of a query in first-seen order (`ML-KEM.KeyGen`, `FIPS.203`).
pub fn technical_tokens(query: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in TECH_TOKEN_RE.find_iter(query) {
        let token = token.as_str().to_string();
        if !seen.contains(&token) {
            seen.push(token);
        }
    }
    seen
}

/// Alphanumeric components of a technical token (`ML-KEM.KeyGen` → ML KEM KeyGen).
fn token_components(token: &str) -> Vec<&str> {
    token
        .split(['-', '.', '_'])
        .filter(|part| !part.is_empty())
        .collect()
}

fn word_present(haystack_lower: &str, needle: &str) -> bool {
    // Component-level containment with ASCII word boundaries, so "sign" does
    // not fire inside "design" or "signature".
    let bytes = haystack_lower.as_bytes();
    let mut from = 0;
    while let Some(pos) = haystack_lower[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();
        let left_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let right_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if left_ok && right_ok {
            return true;
        }
        from = start + 1;
    }
    false
}

/// Deterministic, stable-deduped, insertion-order-preserving query expansion.
pub fn query_variants(query: &str) -> Vec<String> {
    let original = query.trim();
    if original.is_empty() {
        return Vec::new();
    }

    let mut variants: Vec<String> = vec![original.to_string()];
    let lowered = original.to_lowercase();
    let tokens = technical_tokens(original);

    // Component expansion: the query plus each token's spelled-out parts.
    for token in &tokens {
        let components = token_components(token);
        if components.len() > 1 {
            variants.push(format!("{original} {}", components.join(" ")));
        }
    }

    // Operation phrasings map to the scheme's dot-name when the root is present.
    for (scheme, operations) in SCHEME_OPERATIONS {
        if !lowered.contains(&scheme.to_lowercase()) {
            continue;
        }
        for (phrase, method) in *operations {
            let matched = if phrase.contains(' ') {
                lowered.contains(phrase)
            } else {
                word_present(&lowered, phrase)
            };
            if matched {
                variants.push(format!("{original} {scheme}.{method}"));
            }
        }
    }

    // Numbered algorithm anchors: alone, and joined with each technical token.
    if let Some(caps) = ALGORITHM_NUM_RE.captures(original) {
        let anchor = format!("Algorithm {}", &caps[1]);
        variants.push(anchor.clone());
        for token in &tokens {
            variants.push(format!("{anchor} {token}"));
        }
    }

    // Compare intent: one variant per topic.
    if let Some((topic_a, topic_b)) = extract_compare_topics(original) {
        variants.push(topic_a);
        variants.push(topic_b);
    }

    // Stable de-dup while preserving first-seen order.
    let mut deduped: Vec<String> = Vec::new();
    for item in variants {
        let trimmed = item.trim().to_string();
        if !trimmed.is_empty() && !deduped.contains(&trimmed) {
            deduped.push(trimmed);
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn original_query_is_always_first() {
        let variants = query_variants("  ML-KEM key generation  ");
        assert_eq!(variants[0], "ML-KEM key generation");
    }

    #[test]
    fn empty_query_yields_no_variants() {
        assert!(query_variants("   ").is_empty());
    }

    #[test]
    fn component_variant_expands_compound_tokens() {
        let variants = query_variants("Explain ML-KEM.KeyGen");
        assert!(variants.contains(&"Explain ML-KEM.KeyGen ML KEM KeyGen".to_string()));
    }

    #[test]
    fn operation_phrase_appends_dot_name() {
        let variants = query_variants("ML-KEM key generation");
        assert!(variants.contains(&"ML-KEM key generation ML-KEM.KeyGen".to_string()));
    }

    #[test]
    fn sign_phrase_requires_word_boundary() {
        let variants = query_variants("ML-DSA signature design notes");
        assert!(!variants.iter().any(|v| v.contains("ML-DSA.Sign")));
        let variants = query_variants("how does ML-DSA sign a message");
        assert!(variants.contains(&"how does ML-DSA sign a message ML-DSA.Sign".to_string()));
    }

    #[test]
    fn algorithm_number_emits_anchor_variants() {
        let variants = query_variants("What is Algorithm 19 in FIPS.203?");
        assert!(variants.contains(&"Algorithm 19".to_string()));
        assert!(variants.contains(&"Algorithm 19 FIPS.203".to_string()));
    }

    #[test]
    fn compare_intent_emits_topic_variants() {
        let variants = query_variants("What are the differences between ML-KEM and ML-DSA?");
        assert!(variants.contains(&"ML-KEM".to_string()));
        assert!(variants.contains(&"ML-DSA".to_string()));
    }

    #[test]
    fn compare_topics_parse_all_phrasings() {
        for q in [
            "What are the differences between ML-KEM and ML-DSA?",
            "compare ML-KEM with ML-DSA",
            "comparison of ML-KEM and ML-DSA",
            "ML-KEM vs ML-DSA",
            "ML-KEM versus ML-DSA",
        ] {
            let (a, b) = extract_compare_topics(q).unwrap_or_else(|| panic!("no topics in {q:?}"));
            assert_eq!((a.as_str(), b.as_str()), ("ML-KEM", "ML-DSA"), "query: {q}");
        }
    }

    #[test]
    fn identical_topics_are_rejected() {
        assert!(extract_compare_topics("ML-KEM vs ML-KEM").is_none());
        assert!(extract_compare_topics("compare these schemes").is_none());
    }

    #[test]
    fn output_is_deduped_and_restartable() {
        let first = query_variants("Algorithm 2 Algorithm 2 SHAKE128");
        let second = query_variants("Algorithm 2 Algorithm 2 SHAKE128");
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), first.len());
    }
}
