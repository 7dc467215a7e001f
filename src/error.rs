//! Error types with error codes and fix suggestions
//!
//! Error code ranges:
//! - PLAN-000-009: Template errors
//! - PLAN-010-019: Parameter errors
//! - PLAN-020-029: Graph errors
//! - PLAN-030-039: Activation predicate errors
//! - PLAN-040-049: Provisioning errors
//! - PLAN-050-059: Binding / secret errors
//! - PLAN-090-099: IO / config errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlanError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug)]
pub enum PlanError {
    // ═══════════════════════════════════════════
    // TEMPLATE ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[PLAN-001] Failed to parse template: {details}")]
    ParseError { details: String },

    #[error("[PLAN-002] Node '{node}' uses unknown module '{module}' (available: {available})")]
    UnknownModule {
        node: String,
        module: String,
        available: String,
    },

    #[error("[PLAN-003] Template syntax error in '{expression}': {details}")]
    TemplateSyntax { expression: String, details: String },

    #[error("[PLAN-004] Duplicate node name '{node}'")]
    DuplicateNode { node: String },

    #[error("[PLAN-005] Module '{module}' rejected input for node '{node}': {reason}")]
    ModuleInput {
        node: String,
        module: String,
        reason: String,
    },

    #[error("[PLAN-006] Invalid node name '{name}': {reason}")]
    InvalidNodeName { name: String, reason: String },

    // ═══════════════════════════════════════════
    // PARAMETER ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[PLAN-010] Missing required parameter '{name}'")]
    MissingParameter { name: String },

    #[error("[PLAN-011] Invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    // ═══════════════════════════════════════════
    // GRAPH ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[PLAN-020] Cyclic dependency between nodes: {cycle}")]
    CyclicDependency { cycle: String },

    #[error("[PLAN-021] Node '{node}' references '{reference}' which is unavailable: {reason}")]
    MissingOutput {
        node: String,
        reference: String,
        reason: String,
    },

    #[error("[PLAN-022] Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    // ═══════════════════════════════════════════
    // PREDICATE ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[PLAN-030] Cannot evaluate activation predicate of node '{node}': {details}")]
    ActivationPredicate { node: String, details: String },

    // ═══════════════════════════════════════════
    // PROVISIONING ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[PLAN-040] Provisioning of node '{node}' failed: {message}")]
    Provisioning { node: String, message: String },

    #[error("[PLAN-042] Execution error: {0}")]
    Execution(String),

    // ═══════════════════════════════════════════
    // BINDING / SECRET ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[PLAN-050] Secret reference '{reference}' cannot be interpolated into a string in '{context}'")]
    SecretInterpolation { reference: String, context: String },

    #[error("[PLAN-051] Output '{output}' would expose secret '{reference}' as plaintext")]
    PlaintextSecretOutput { output: String, reference: String },

    #[error("[PLAN-052] Secret '{vault}/{secret}' not found")]
    SecretNotFound { vault: String, secret: String },

    // ═══════════════════════════════════════════
    // IO / CONFIG ERRORS (090-099)
    // ═══════════════════════════════════════════
    #[error("[PLAN-090] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[PLAN-091] Configuration error: {reason}")]
    ConfigError { reason: String },
}

impl PlanError {
    /// Stable error code, e.g. "PLAN-020"
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseError { .. } => "PLAN-001",
            Self::UnknownModule { .. } => "PLAN-002",
            Self::TemplateSyntax { .. } => "PLAN-003",
            Self::DuplicateNode { .. } => "PLAN-004",
            Self::ModuleInput { .. } => "PLAN-005",
            Self::InvalidNodeName { .. } => "PLAN-006",
            Self::MissingParameter { .. } => "PLAN-010",
            Self::InvalidParameter { .. } => "PLAN-011",
            Self::CyclicDependency { .. } => "PLAN-020",
            Self::MissingOutput { .. } => "PLAN-021",
            Self::UnknownDependency { .. } => "PLAN-022",
            Self::ActivationPredicate { .. } => "PLAN-030",
            Self::Provisioning { .. } => "PLAN-040",
            Self::Execution(_) => "PLAN-042",
            Self::SecretInterpolation { .. } => "PLAN-050",
            Self::PlaintextSecretOutput { .. } => "PLAN-051",
            Self::SecretNotFound { .. } => "PLAN-052",
            Self::Io(_) => "PLAN-090",
            Self::ConfigError { .. } => "PLAN-091",
        }
    }
}

impl From<serde_yaml::Error> for PlanError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::ParseError {
            details: e.to_string(),
        }
    }
}

impl FixSuggestion for PlanError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            Self::ParseError { .. } => Some("Check YAML syntax: indentation and quoting"),
            Self::UnknownModule { .. } => Some("Use one of the available module ids"),
            Self::TemplateSyntax { .. } => Some(
                "Use {{ param.name }}, {{ token }} or {{ node.outputs.key }} inside expressions",
            ),
            Self::DuplicateNode { .. } => Some("Give every node a unique name"),
            Self::ModuleInput { .. } => Some("Check the parameters passed to the module"),
            Self::InvalidNodeName { .. } => {
                Some("Use letters, digits, underscores or dashes, starting with a letter")
            }
            Self::MissingParameter { .. } => {
                Some("Pass the parameter with --param name=value or give it a default")
            }
            Self::InvalidParameter { .. } => {
                Some("Check the parameter against its declared type and length constraints")
            }
            Self::CyclicDependency { .. } => {
                Some("Remove one of the references or depends_on entries forming the cycle")
            }
            Self::MissingOutput { .. } => Some(
                "Guard the referencing node with the same 'when' predicate, or reference a declared output",
            ),
            Self::UnknownDependency { .. } => Some("Fix the node name listed in depends_on"),
            Self::ActivationPredicate { .. } => {
                Some("Predicates support param.<name>, 'literals', ==, !=, empty() and !empty()")
            }
            Self::Provisioning { .. } => Some("Inspect the control plane error and re-apply"),
            Self::Execution(_) => None,
            Self::SecretInterpolation { .. } => {
                Some("Pass the secret as the whole parameter value so it stays a vault reference")
            }
            Self::PlaintextSecretOutput { .. } => Some(
                "Mark the output with allow_plaintext_secret: true if exposing it is intended",
            ),
            Self::SecretNotFound { .. } => Some("Check that the secret was exported to the vault"),
            Self::Io(_) => Some("Check file path and permissions"),
            Self::ConfigError { .. } => Some("Check ~/.config/provplan/config.toml"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_codes() {
        let err = PlanError::CyclicDependency {
            cycle: "a → b → a".to_string(),
        };
        assert!(err.to_string().contains("PLAN-020"));
        assert_eq!(err.code(), "PLAN-020");
    }

    #[test]
    fn missing_output_names_node_and_reference() {
        let err = PlanError::MissingOutput {
            node: "app".to_string(),
            reference: "grant.outputs.id".to_string(),
            reason: "node 'grant' is excluded".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("app"));
        assert!(msg.contains("grant.outputs.id"));
        assert!(err.fix_suggestion().is_some());
    }

    #[test]
    fn yaml_errors_convert_to_parse_error() {
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>("a: [").unwrap_err();
        let err: PlanError = yaml_err.into();
        assert_eq!(err.code(), "PLAN-001");
    }
}
