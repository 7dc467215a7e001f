//! Provplan - provisioning-plan evaluator
//!
//! Turns a declarative template plus parameters into a dependency-ordered
//! plan with deterministic resource names, then applies it against a
//! control plane while keeping secrets out of plaintext outputs.

pub mod ast;
pub mod binding;
pub mod config;
pub mod dag;
pub mod error;
pub mod event;
pub mod plan;
pub mod registry;
pub mod runtime;
pub mod tags;
pub mod token;

pub use ast::{ParameterSet, Template};
pub use config::ProvplanConfig;
pub use dag::ModuleGraph;
pub use error::{FixSuggestion, PlanError, Result};
pub use event::{Event, EventKind, EventLog};
pub use plan::{validate_template, Plan, PlanInputs, ValidationReport};
pub use registry::ModuleRegistry;
pub use runtime::{
    ApplyReport, ControlPlane, InMemoryControlPlane, NodeState, Runner, RunnerSettings,
};
pub use tags::TagSet;
pub use token::{generate_token, ResourceToken};
