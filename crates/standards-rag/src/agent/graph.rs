//! Bounded retrieve-assess-refine-answer controller
//!
//! A plain state machine: nodes are functions over `AgentState`, the driver
//! is a loop over a transition table, and a step counter bounds execution.
//! The loop enforces explicit step/tool/round budgets, refines queries
//! deterministically, and refuses instead of emitting uncited claims.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use crate::agent::state::{
    Action, AgentState, LoopFailure, ModeHint, Plan, RefusalReason, StopReason,
};
use crate::agent::tools::{Toolbox, COMPARE_K, RETRIEVE_K, SUMMARIZE_K};
use crate::config::{AgentConfig, AnswerConfig};
use crate::generation::answer::build_cited_answer;
use crate::generation::generator::Generator;
use crate::retrieval::fusion::{RetrievalOptions, Retriever};
use crate::retrieval::variants::extract_compare_topics;
use crate::types::{Hit, REFUSAL_TEXT};

static ANCHOR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\bAlgorithm\s+\d+\b").unwrap(),
        Regex::new(r"(?i)\bTable\s+\d+\b").unwrap(),
        Regex::new(r"(?i)\bSection\s+\d+(?:\.\d+)*\b").unwrap(),
    ]
});
const ANCHOR_KEYWORDS: &[&str] = &["keygen", "encaps", "decaps", "shake128", "shake256", "xof"];

static DEFINITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:what\s+(?:is|are)|what's|define|explain)\s+(?P<term>.+)$").unwrap()
});
static ALGORITHM_HINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\balgorithm\s+\d+\b|shake128|shake256|\bxof\b").unwrap());

/// Regex-based routing, in fixed priority order:
/// compare, then definition, then algorithm, then general retrieval.
pub fn heuristic_route(question: &str) -> Plan {
    let q = question.trim();

    if let Some((topic_a, topic_b)) = extract_compare_topics(q) {
        return Plan {
            action: Action::Compare { topic_a, topic_b },
            reason: "Comparison intent detected with parsed topics.".to_string(),
            mode_hint: ModeHint::Compare,
        };
    }

    if let Some(caps) = DEFINITION_RE.captures(q) {
        let term = caps["term"].trim().trim_matches(|c: char| c == '?' || c == ' ').to_string();
        if !term.is_empty() {
            return Plan {
                action: Action::ResolveDefinition { term },
                reason: "Definition intent detected.".to_string(),
                mode_hint: ModeHint::Definition,
            };
        }
    }

    if ALGORITHM_HINT_RE.is_match(q) {
        return Plan {
            action: Action::Retrieve { query: q.to_string() },
            reason: "Algorithm-like query detected; retrieve evidence.".to_string(),
            mode_hint: ModeHint::Algorithm,
        };
    }

    Plan {
        action: Action::Retrieve { query: q.to_string() },
        reason: "Default to retrieval.".to_string(),
        mode_hint: ModeHint::General,
    }
}

/// Distinctive tokens whose absence from evidence signals a retrieval miss.
pub fn extract_anchor_terms(question: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    for pattern in ANCHOR_PATTERNS.iter() {
        for m in pattern.find_iter(question) {
            let token = m.as_str().trim().to_string();
            let key = token.to_lowercase();
            if !token.is_empty() && !seen.contains(&key) {
                seen.push(key);
                terms.push(token);
            }
        }
    }

    let lowered = question.to_lowercase();
    for keyword in ANCHOR_KEYWORDS {
        if lowered.contains(keyword) && !seen.contains(&keyword.to_string()) {
            seen.push(keyword.to_string());
            terms.push(keyword.to_string());
        }
    }

    terms
}

fn evidence_contains_any_anchor(evidence: &[Hit], anchors: &[String]) -> bool {
    if anchors.is_empty() {
        return true;
    }
    let lowered: Vec<String> = evidence.iter().map(|e| e.text.to_lowercase()).collect();
    anchors
        .iter()
        .any(|anchor| lowered.iter().any(|txt| txt.contains(&anchor.to_lowercase())))
}

fn doc_diversity(evidence: &[Hit]) -> usize {
    evidence
        .iter()
        .map(|e| e.doc_id.as_str())
        .collect::<std::collections::HashSet<_>>()
        .len()
}

fn topic_doc_bias_tokens(topic: &str) -> Vec<&'static str> {
    let tl = topic.to_lowercase();
    if tl.contains("ml-kem") {
        vec!["FIPS 203", "ML-KEM"]
    } else if tl.contains("ml-dsa") {
        vec!["FIPS 204", "ML-DSA"]
    } else if tl.contains("slh-dsa") {
        vec!["FIPS 205", "SLH-DSA"]
    } else {
        Vec::new()
    }
}

fn append_terms(base_query: &str, terms: &[String]) -> String {
    let base = base_query.trim();
    let existing = base.to_lowercase();
    let extras: Vec<&str> = terms
        .iter()
        .filter(|t| !t.is_empty() && !existing.contains(&t.to_lowercase()))
        .map(String::as_str)
        .collect();
    if extras.is_empty() {
        base.to_string()
    } else {
        format!("{base} {}", extras.join(" "))
    }
}

fn plan_query(plan: &Plan, question: &str) -> String {
    match &plan.action {
        Action::Retrieve { query } => query.clone(),
        Action::ResolveDefinition { term } => term.clone(),
        _ => question.to_string(),
    }
}

/// Deterministic query refinement, keyed by the assessment's stop reason.
pub fn build_refined_query(state: &AgentState) -> (String, &'static str) {
    let base_query = state
        .plan
        .as_ref()
        .map(|p| plan_query(p, &state.question))
        .unwrap_or_else(|| state.question.clone());

    let anchors = extract_anchor_terms(&state.question);
    match state.stop_reason {
        Some(StopReason::AnchorMissing) if !anchors.is_empty() => {
            (append_terms(&base_query, &anchors), "anchor_token_bias")
        }
        Some(StopReason::CompareDocDiversityMissing) => {
            if let Some((topic_a, topic_b)) = extract_compare_topics(&state.question) {
                let mut terms = vec![topic_a.clone(), topic_b.clone(), "compare".to_string()];
                for token in topic_doc_bias_tokens(&topic_a)
                    .into_iter()
                    .chain(topic_doc_bias_tokens(&topic_b))
                {
                    terms.push(token.to_string());
                }
                (append_terms(&base_query, &terms), "compare_doc_bias")
            } else {
                (base_query, "no_change")
            }
        }
        Some(StopReason::InsufficientHits) => {
            if let Some(Plan { action: Action::ResolveDefinition { term }, .. }) = &state.plan {
                (format!("definition of {term}; notation; section"), "definition_bias")
            } else {
                let bias = vec!["definition".to_string(), "overview".to_string()];
                (append_terms(&base_query, &bias), "coverage_bias")
            }
        }
        _ => (base_query, "no_change"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Route,
    Retrieve,
    Assess,
    Refine,
    Answer,
    Verify,
    End,
}

/// The bounded controller over one question.
pub struct AgentLoop<'a> {
    config: &'a AgentConfig,
    answer_config: &'a AnswerConfig,
    retriever: &'a Retriever,
    toolbox: Toolbox<'a>,
    generator: &'a dyn Generator,
}

impl<'a> AgentLoop<'a> {
    pub fn new(
        config: &'a AgentConfig,
        answer_config: &'a AnswerConfig,
        retriever: &'a Retriever,
        options: RetrievalOptions,
        generator: &'a dyn Generator,
    ) -> Self {
        Self {
            config,
            answer_config,
            retriever,
            toolbox: Toolbox::new(retriever, options),
            generator,
        }
    }

    pub async fn run(&self, question: &str) -> AgentState {
        self.run_state(AgentState::new(question)).await
    }

    /// Drive the transition table to completion. Accepts a pre-built state
    /// so hosts can set the `cancelled` flag out-of-band.
    pub async fn run_state(&self, mut state: AgentState) -> AgentState {
        let recursion_limit = (self.config.max_steps * 4).max(20);
        let mut node = Node::Route;
        let mut transitions = 0usize;

        while node != Node::End {
            transitions += 1;
            if transitions > recursion_limit {
                state.errors.push(format!(
                    "recursion limit {recursion_limit} reached; forcing verification"
                ));
                node = Node::Verify;
            }
            if state.cancelled && node != Node::Verify {
                state.stop_reason = Some(StopReason::Cancelled);
                state.add_trace(json!({"type": "loop_stop", "reason": "cancelled"}));
                node = Node::Verify;
            }

            node = match node {
                Node::Route => {
                    self.node_route(&mut state);
                    self.route_edge(&state)
                }
                Node::Retrieve => {
                    self.node_retrieve(&mut state).await;
                    if state.failure.is_some() {
                        Node::Verify
                    } else {
                        Node::Assess
                    }
                }
                Node::Assess => {
                    self.node_assess(&mut state);
                    self.assess_edge(&state)
                }
                Node::Refine => {
                    self.node_refine(&mut state);
                    self.refine_edge(&state)
                }
                Node::Answer => {
                    self.node_answer(&mut state).await;
                    Node::Verify
                }
                Node::Verify => {
                    self.node_verify(&mut state);
                    Node::End
                }
                Node::End => Node::End,
            };
        }
        state
    }

    fn bump_step(&self, state: &mut AgentState, node: &str) {
        state.steps += 1;
        state.add_trace(json!({
            "type": "step",
            "node": node,
            "steps": state.steps,
            "tool_calls": state.tool_calls,
            "retrieval_round": state.retrieval_round,
        }));
    }

    fn step_limit_hit(&self, state: &AgentState) -> bool {
        state.steps >= self.config.max_steps
    }

    fn budget_limit_reason(&self, state: &AgentState) -> Option<StopReason> {
        if self.step_limit_hit(state) {
            Some(StopReason::StepBudgetExhausted)
        } else if state.tool_calls >= self.config.max_tool_calls {
            Some(StopReason::ToolBudgetExhausted)
        } else if state.retrieval_round >= self.config.max_retrieval_rounds {
            Some(StopReason::RoundBudgetExhausted)
        } else {
            None
        }
    }

    fn node_route(&self, state: &mut AgentState) {
        self.bump_step(state, "route");

        if self.step_limit_hit(state) {
            state.stop_reason = Some(StopReason::StepBudgetExhausted);
            state.plan = Some(Plan {
                action: Action::Refuse,
                reason: "Step budget exhausted before routing.".to_string(),
                mode_hint: ModeHint::General,
            });
            state.add_trace(json!({"type": "loop_stop", "reason": "step_budget_exhausted"}));
            return;
        }

        let plan = heuristic_route(&state.question);
        state.add_trace(json!({"type": "plan", "plan": &plan}));
        state.plan = Some(plan);
    }

    fn route_edge(&self, state: &AgentState) -> Node {
        match state.plan.as_ref().map(|p| &p.action) {
            Some(Action::Refuse) | None => Node::Verify,
            Some(_) => Node::Retrieve,
        }
    }

    async fn node_retrieve(&self, state: &mut AgentState) {
        self.bump_step(state, "retrieve");

        // Budgets are checked before the tool call; on exhaustion the node
        // writes the reason and control drains through assess to verify.
        if let Some(reason) = self.budget_limit_reason(state) {
            state.stop_reason = Some(reason);
            state.add_trace(json!({"type": "loop_stop", "reason": reason}));
            return;
        }

        let plan = state.plan.clone();
        state.tool_calls += 1;
        state.retrieval_round += 1;
        state.add_trace(json!({
            "type": "retrieval_round_started",
            "round": state.retrieval_round,
            "tool_calls": state.tool_calls,
        }));

        let outcome = match plan.as_ref().map(|p| &p.action) {
            Some(Action::Retrieve { query }) => self.toolbox.retrieve(query, RETRIEVE_K).await,
            Some(Action::ResolveDefinition { term }) => {
                self.toolbox.resolve_definition(term, RETRIEVE_K).await
            }
            Some(Action::Compare { topic_a, topic_b }) => {
                self.toolbox.compare(topic_a, topic_b, COMPARE_K).await
            }
            Some(Action::Summarize { doc_id, start_page, end_page }) => {
                self.toolbox.summarize(doc_id, *start_page, *end_page, SUMMARIZE_K)
            }
            Some(Action::Refuse) | None => {
                self.toolbox.retrieve(&state.question.clone(), RETRIEVE_K).await
            }
        };

        match outcome {
            Ok(out) => {
                let new_hits = out.evidence.len();
                let added = state.merge_evidence(out.evidence);
                state.add_trace(json!({
                    "type": "retrieval_round_result",
                    "round": state.retrieval_round,
                    "new_hits": new_hits,
                    "added": added,
                    "total_hits": state.evidence.len(),
                    "tool_stats": out.stats,
                }));
            }
            Err(e) => {
                tracing::warn!(error = %e, "retrieval tool failed");
                state.errors.push(e.to_string());
                state.failure = Some(LoopFailure::RetrievalFailed);
                state.stop_reason = Some(StopReason::RetrievalFailed);
                state.add_trace(json!({"type": "retrieval_failed", "error": e.to_string()}));
            }
        }
    }

    fn node_assess(&self, state: &mut AgentState) {
        self.bump_step(state, "assess_evidence");

        let anchors = extract_anchor_terms(&state.question);
        let anchor_match = evidence_contains_any_anchor(&state.evidence, &anchors);
        let compare_required = extract_compare_topics(&state.question).is_some();
        let diversity = doc_diversity(&state.evidence);

        // Reasons in fixed order; the first applicable one becomes the stop
        // reason unless a budget reason overrides it.
        let mut reasons: Vec<StopReason> = Vec::new();
        if state.evidence.len() < self.config.min_evidence_hits {
            reasons.push(StopReason::InsufficientHits);
        }
        if !anchors.is_empty() && !anchor_match {
            reasons.push(StopReason::AnchorMissing);
        }
        if compare_required && diversity < 2 {
            reasons.push(StopReason::CompareDocDiversityMissing);
        }

        let sufficient = reasons.is_empty();
        state.evidence_sufficient = sufficient;

        let budget_reason = if sufficient {
            None
        } else {
            self.budget_limit_reason(state)
        };
        state.stop_reason = if sufficient {
            Some(StopReason::SufficientEvidence)
        } else {
            Some(budget_reason.unwrap_or(reasons[0]))
        };

        state.add_trace(json!({
            "type": "assessment_decision",
            "sufficient": sufficient,
            "reasons": reasons,
            "budget_reason": budget_reason,
            "evidence_hits": state.evidence.len(),
            "doc_diversity": diversity,
            "anchors": anchors,
            "anchor_match": anchor_match,
            "steps": state.steps,
            "tool_calls": state.tool_calls,
            "retrieval_round": state.retrieval_round,
        }));
    }

    fn assess_edge(&self, state: &AgentState) -> Node {
        if state.evidence_sufficient {
            Node::Answer
        } else if self.budget_limit_reason(state).is_some() {
            Node::Verify
        } else {
            Node::Refine
        }
    }

    fn node_refine(&self, state: &mut AgentState) {
        self.bump_step(state, "refine_query");

        if self.step_limit_hit(state) {
            state.stop_reason = Some(StopReason::StepBudgetExhausted);
            state.add_trace(json!({"type": "loop_stop", "reason": "step_budget_exhausted"}));
            return;
        }

        let previous_query = state
            .plan
            .as_ref()
            .map(|p| plan_query(p, &state.question))
            .unwrap_or_else(|| state.question.clone());
        let (refined_query, strategy) = build_refined_query(state);
        let mode_hint = state.plan.as_ref().map(|p| p.mode_hint).unwrap_or(ModeHint::General);

        state.plan = Some(Plan {
            action: Action::Retrieve { query: refined_query.clone() },
            reason: format!("Refined retrieval query via {strategy}."),
            mode_hint,
        });
        state.add_trace(json!({
            "type": "query_refined",
            "strategy": strategy,
            "previous_query": previous_query,
            "refined_query": refined_query,
        }));
    }

    fn refine_edge(&self, state: &AgentState) -> Node {
        if self.budget_limit_reason(state).is_some() {
            Node::Verify
        } else {
            Node::Retrieve
        }
    }

    async fn node_answer(&self, state: &mut AgentState) {
        self.bump_step(state, "answer");

        if !state.evidence_sufficient {
            state.add_trace(json!({"type": "answer_skip", "reason": "insufficient_evidence"}));
            return;
        }
        if state.evidence.is_empty() {
            state.add_trace(json!({"type": "answer_skip", "reason": "no_evidence"}));
            return;
        }

        let outcome = build_cited_answer(
            &state.question,
            &state.evidence,
            Some(self.retriever.store()),
            self.generator,
            self.answer_config,
        )
        .await;

        match outcome {
            Ok(result) => {
                state.draft_answer = result.answer;
                state.citations = result.citations;
                state.add_trace(json!({"type": "answer", "citations": state.citations.len()}));
            }
            Err(e) => {
                tracing::warn!(error = %e, "answer generation failed");
                state.errors.push(e.to_string());
                state.failure = Some(LoopFailure::GeneratorFailed);
                state.add_trace(json!({"type": "generation_failed", "error": e.to_string()}));
            }
        }
    }

    fn node_verify(&self, state: &mut AgentState) {
        self.bump_step(state, "verify_or_refuse");

        let draft = state.draft_answer.trim().to_string();
        let should_refuse = state.failure.is_some()
            || !state.evidence_sufficient
            || draft.is_empty()
            || state.evidence.is_empty()
            || state.citations.is_empty();

        if should_refuse {
            let refusal_reason = self.derive_refusal_reason(state, &draft);
            state.refusal_reason = Some(refusal_reason);
            state.citations.clear();
            state.final_answer = REFUSAL_TEXT.to_string();
            state.add_trace(json!({
                "type": "verify",
                "result": "refuse",
                "stop_reason": state.stop_reason,
                "refusal_reason": refusal_reason,
                "citations": 0,
            }));
            return;
        }

        state.refusal_reason = None;
        state.final_answer = draft;
        state.add_trace(json!({
            "type": "verify",
            "result": "ok",
            "stop_reason": state.stop_reason,
            "citations": state.citations.len(),
        }));
    }

    fn derive_refusal_reason(&self, state: &AgentState, draft: &str) -> RefusalReason {
        if let Some(failure) = state.failure {
            return match failure {
                LoopFailure::RetrievalFailed => RefusalReason::RetrievalFailed,
                LoopFailure::GeneratorFailed => RefusalReason::GeneratorFailed,
            };
        }
        if !state.evidence_sufficient {
            return match state.stop_reason {
                Some(reason) if reason.is_budget() => RefusalReason::BudgetExhausted,
                _ => RefusalReason::InsufficientEvidence,
            };
        }
        if draft.is_empty() {
            return RefusalReason::EmptyDraft;
        }
        if state.evidence.is_empty() {
            return RefusalReason::InsufficientEvidence;
        }
        RefusalReason::MissingCitations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: &str, doc_id: &str, text: &str) -> Hit {
        Hit {
            score: 1.0,
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            start_page: 1,
            end_page: 1,
            text: text.to_string(),
        }
    }

    #[test]
    fn route_parses_differences_between() {
        let plan = heuristic_route("What are the differences between ML-KEM and ML-DSA?");
        assert_eq!(
            plan.action,
            Action::Compare {
                topic_a: "ML-KEM".to_string(),
                topic_b: "ML-DSA".to_string(),
            }
        );
    }

    #[test]
    fn route_ambiguous_compare_falls_back_to_retrieve() {
        let plan = heuristic_route("Compare these schemes");
        assert!(matches!(plan.action, Action::Retrieve { .. }));
    }

    #[test]
    fn route_definition_before_algorithm() {
        let plan = heuristic_route("What is Algorithm 19?");
        assert_eq!(
            plan.action,
            Action::ResolveDefinition { term: "Algorithm 19".to_string() }
        );
        assert_eq!(plan.mode_hint, ModeHint::Definition);
    }

    #[test]
    fn route_detects_algorithm_queries() {
        let plan = heuristic_route("Steps of Algorithm 2 please");
        assert!(matches!(plan.action, Action::Retrieve { .. }));
        assert_eq!(plan.mode_hint, ModeHint::Algorithm);

        let plan = heuristic_route("How does SHAKE256 absorb input?");
        assert_eq!(plan.mode_hint, ModeHint::Algorithm);
    }

    #[test]
    fn route_defaults_to_general_retrieve() {
        let plan = heuristic_route("ML-KEM parameter sets");
        assert!(matches!(plan.action, Action::Retrieve { .. }));
        assert_eq!(plan.mode_hint, ModeHint::General);
    }

    #[test]
    fn anchors_extracted_in_order_without_duplicates() {
        let anchors =
            extract_anchor_terms("See Algorithm 7 and Table 2 in Section 4.1; algorithm 7 keygen");
        assert_eq!(anchors, vec!["Algorithm 7", "Table 2", "Section 4.1", "keygen"]);
    }

    #[test]
    fn anchor_match_is_case_insensitive() {
        let anchors = extract_anchor_terms("What is Algorithm 2?");
        let evidence = vec![hit("x", "D", "ALGORITHM 2 SHAKE128 pseudocode")];
        assert!(evidence_contains_any_anchor(&evidence, &anchors));
        let miss = vec![hit("y", "D", "unrelated prose")];
        assert!(!evidence_contains_any_anchor(&miss, &anchors));
    }

    #[test]
    fn refine_appends_anchor_tokens() {
        let mut state = AgentState::new("Explain keygen for this scheme");
        state.plan = Some(Plan {
            action: Action::Retrieve { query: "broad query".to_string() },
            reason: String::new(),
            mode_hint: ModeHint::General,
        });
        state.stop_reason = Some(StopReason::AnchorMissing);
        let (query, strategy) = build_refined_query(&state);
        assert_eq!(strategy, "anchor_token_bias");
        assert_eq!(query, "broad query keygen");
    }

    #[test]
    fn refine_biases_compare_docs() {
        let mut state = AgentState::new("differences between ML-KEM and ML-DSA");
        state.plan = Some(Plan {
            action: Action::Retrieve { query: "base".to_string() },
            reason: String::new(),
            mode_hint: ModeHint::Compare,
        });
        state.stop_reason = Some(StopReason::CompareDocDiversityMissing);
        let (query, strategy) = build_refined_query(&state);
        assert_eq!(strategy, "compare_doc_bias");
        assert!(query.contains("FIPS 203"));
        assert!(query.contains("FIPS 204"));
        assert!(query.contains("compare"));
    }

    #[test]
    fn refine_definition_bias_for_thin_definition_evidence() {
        let mut state = AgentState::new("What is the hint vector?");
        state.plan = Some(Plan {
            action: Action::ResolveDefinition { term: "hint vector".to_string() },
            reason: String::new(),
            mode_hint: ModeHint::Definition,
        });
        state.stop_reason = Some(StopReason::InsufficientHits);
        let (query, strategy) = build_refined_query(&state);
        assert_eq!(strategy, "definition_bias");
        assert_eq!(query, "definition of hint vector; notation; section");
    }

    #[test]
    fn refine_coverage_bias_otherwise() {
        let mut state = AgentState::new("parameter sets");
        state.plan = Some(Plan {
            action: Action::Retrieve { query: "parameter sets".to_string() },
            reason: String::new(),
            mode_hint: ModeHint::General,
        });
        state.stop_reason = Some(StopReason::InsufficientHits);
        let (query, strategy) = build_refined_query(&state);
        assert_eq!(strategy, "coverage_bias");
        assert_eq!(query, "parameter sets definition overview");
    }
}
