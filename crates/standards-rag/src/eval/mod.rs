//! Evaluation harness: dataset contract, metrics, deterministic reports

pub mod dataset;
pub mod metrics;
pub mod run;

pub use dataset::{load_questions, qid_sort_key, GoldSpan, QuestionRow};
pub use metrics::{
    compute_retrieval_metrics, evaluate_answer, hit_matches_gold, hit_matches_gold_doc_only,
    hit_matches_gold_with_tolerance, inline_citation_sentence_rate, safe_mean, AnswerMetrics,
    RetrievalMetrics,
};
pub use run::{run_eval, EvalArtifacts, EvalOptions};
