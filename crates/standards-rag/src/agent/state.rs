//! Agent state: the single mutable record owned by the control loop

use serde::{Deserialize, Serialize};

use crate::types::{Citation, Hit};

/// Routed action for the next tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Retrieve { query: String },
    ResolveDefinition { term: String },
    Compare { topic_a: String, topic_b: String },
    Summarize { doc_id: String, start_page: u32, end_page: u32 },
    Refuse,
}

/// Hint about the question's shape, used by refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeHint {
    General,
    Definition,
    Algorithm,
    Symbolic,
    Compare,
}

/// Router decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(flatten)]
    pub action: Action,
    pub reason: String,
    pub mode_hint: ModeHint,
}

/// Why the loop stopped iterating. Loop provenance, never overwritten by
/// the verify node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    SufficientEvidence,
    InsufficientHits,
    AnchorMissing,
    CompareDocDiversityMissing,
    StepBudgetExhausted,
    ToolBudgetExhausted,
    RoundBudgetExhausted,
    RetrievalFailed,
    Cancelled,
}

impl StopReason {
    pub fn is_budget(self) -> bool {
        matches!(
            self,
            Self::StepBudgetExhausted | Self::ToolBudgetExhausted | Self::RoundBudgetExhausted
        )
    }
}

/// Why the final output is a refusal. Output provenance, set only by the
/// verify node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    InsufficientEvidence,
    EmptyDraft,
    MissingCitations,
    BudgetExhausted,
    RetrievalFailed,
    GeneratorFailed,
}

/// External collaborator failure observed mid-loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopFailure {
    RetrievalFailed,
    GeneratorFailed,
}

/// Everything the loop reads and writes for one question.
///
/// Owned by exactly one control loop; nodes are the only mutators. `trace`
/// is append-only and becomes the provenance record in the trace file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub question: String,
    pub plan: Option<Plan>,
    pub evidence: Vec<Hit>,
    pub draft_answer: String,
    pub final_answer: String,
    pub citations: Vec<Citation>,
    pub steps: usize,
    pub tool_calls: usize,
    pub retrieval_round: usize,
    pub evidence_sufficient: bool,
    /// Set from outside the loop (host timeout); checked at every node entry.
    pub cancelled: bool,
    pub stop_reason: Option<StopReason>,
    pub refusal_reason: Option<RefusalReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<LoopFailure>,
    pub trace: Vec<serde_json::Value>,
    pub errors: Vec<String>,
}

impl AgentState {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            plan: None,
            evidence: Vec::new(),
            draft_answer: String::new(),
            final_answer: String::new(),
            citations: Vec::new(),
            steps: 0,
            tool_calls: 0,
            retrieval_round: 0,
            evidence_sufficient: false,
            cancelled: false,
            stop_reason: None,
            refusal_reason: None,
            failure: None,
            trace: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn add_trace(&mut self, event: serde_json::Value) {
        self.trace.push(event);
    }

    /// Merge incoming hits into existing evidence by `chunk_id`; first-seen
    /// wins so earlier rounds keep their positions.
    pub fn merge_evidence(&mut self, incoming: Vec<Hit>) -> usize {
        let mut seen: std::collections::HashSet<String> =
            self.evidence.iter().map(|h| h.chunk_id.clone()).collect();
        let before = self.evidence.len();
        for hit in incoming {
            if seen.insert(hit.chunk_id.clone()) {
                self.evidence.push(hit);
            }
        }
        self.evidence.len() - before
    }
}
