//! Bounded tool-using controller: route, retrieve, assess, refine, answer,
//! verify or refuse

pub mod graph;
pub mod state;
pub mod tools;
pub mod trace;

pub use graph::{build_refined_query, extract_anchor_terms, heuristic_route, AgentLoop};
pub use state::{
    Action, AgentState, LoopFailure, ModeHint, Plan, RefusalReason, StopReason,
};
pub use tools::{Toolbox, ToolOutput};
pub use trace::write_trace;
