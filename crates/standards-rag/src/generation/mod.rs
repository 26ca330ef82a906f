//! Answer generation: generator adapter, prompt assembly, and citation
//! enforcement

pub mod answer;
pub mod generator;
pub mod prompt;

pub use answer::{
    algorithm_fallback, build_cited_answer, compare_fallback, enforce_inline_citations,
};
pub use generator::{Generator, HttpGenerator};
pub use prompt::{build_answer_prompt, format_evidence, prettify_pseudocode};
