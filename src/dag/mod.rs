//! DAG Module - module node graph and inclusion filter
//!
//! - `graph`: ModuleGraph (cycle detection, ordering, waves)
//! - `filter`: predicate evaluation and reference validation
//!
//! The graph only ever contains active nodes; excluded nodes never become
//! vertices. ModuleGraph is immutable after construction.

mod filter;
mod graph;

pub use filter::{collect_edges, evaluate_predicates, Activation, OutputIndex};
pub use graph::{DepVec, ModuleGraph};
