//! AST Module - template document types
//!
//! Contains parsed Rust types from YAML templates:
//! - `template`: Template, NodeDef, OutputDef
//! - `params`: ParamDef, ParamType, ParameterSet
//!
//! These types represent the "what" - static structure parsed from YAML.
//! For plan construction see `plan`, for execution see `runtime`.

mod params;
mod template;

pub use params::{ParamDef, ParamType, ParameterSet};
pub use template::{NodeDef, OutputDef, Template, BUILTIN_TEMPLATE, SCHEMA_V01};
