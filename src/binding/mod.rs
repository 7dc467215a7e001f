//! Binding Module - data flow between nodes
//!
//! - `reference`: `{{ ... }}` scanning and resolution
//! - `predicate`: `when:` activation predicates
//! - `store`: OutputStore (published node outputs) and resolution scopes
//! - `value`: OutputValue, SecretRef
//! - `validate`: node name rules
//!
//! Data flow:
//! ```text
//! node params (YAML) ──scan──▶ graph edges (plan time)
//!        │
//!        ▼ resolve (apply time, after dependencies resolved)
//! resolved params ──module──▶ resource definition + outputs
//!                                      │
//!                                      ▼
//!                               OutputStore ──▶ later nodes / result set
//! ```

mod predicate;
mod reference;
mod store;
mod validate;
mod value;

pub use predicate::{Operand, Predicate};
pub use reference::{
    interpolate, resolve_str, resolve_value, scan_str, scan_value, whole_reference, RefVec,
    Reference, Scope,
};
pub use store::{EvalScope, OutputStore, StaticScope};
pub use validate::validate_node_name;
pub use value::{value_to_string, NodeOutputs, OutputValue, SecretRef, SECRET_REF_KEY};
