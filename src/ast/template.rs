//! Template Types - root template document
//!
//! - `Template`: parameters, base tags, nodes, outputs
//! - `NodeDef`: one module invocation
//! - `OutputDef`: top-level result entry (short string or full form)

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::binding::validate_node_name;
use crate::error::PlanError;

use super::params::ParamDef;

/// Expected schema version for templates
pub const SCHEMA_V01: &str = "provplan/template@0.1";

/// Built-in template: vault + table database + registry + container app
pub const BUILTIN_TEMPLATE: &str = include_str!("../../templates/cosmos-table-app.yaml");

/// Template parsed from YAML (raw)
#[derive(Debug, Deserialize)]
struct TemplateRaw {
    schema: String,
    name: String,
    #[serde(default)]
    parameters: BTreeMap<String, ParamDef>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    nodes: Vec<NodeDef>,
    #[serde(default)]
    outputs: BTreeMap<String, OutputDef>,
}

/// Template with Arc-wrapped nodes for sharing across worker tasks
#[derive(Debug)]
pub struct Template {
    pub schema: String,
    pub name: String,
    pub parameters: BTreeMap<String, ParamDef>,
    /// Base tag set; values may reference parameters and the token
    pub tags: BTreeMap<String, String>,
    /// Nodes in declaration order
    pub nodes: Vec<Arc<NodeDef>>,
    pub outputs: BTreeMap<String, OutputDef>,
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = TemplateRaw::deserialize(deserializer)?;
        Ok(Template {
            schema: raw.schema,
            name: raw.name,
            parameters: raw.parameters,
            tags: raw.tags,
            nodes: raw.nodes.into_iter().map(Arc::new).collect(),
            outputs: raw.outputs,
        })
    }
}

impl Template {
    /// Parse and validate a template document
    pub fn from_yaml(yaml: &str) -> Result<Self, PlanError> {
        let template: Template = serde_yaml::from_str(yaml)?;
        template.validate_schema()?;
        Ok(template)
    }

    /// The template embedded in the binary
    pub fn builtin() -> Result<Self, PlanError> {
        Self::from_yaml(BUILTIN_TEMPLATE)
    }

    /// Check schema version and node name uniqueness
    pub fn validate_schema(&self) -> Result<(), PlanError> {
        if self.schema != SCHEMA_V01 {
            return Err(PlanError::ParseError {
                details: format!(
                    "invalid schema version: expected '{}', got '{}'",
                    SCHEMA_V01, self.schema
                ),
            });
        }

        let mut seen = std::collections::HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            validate_node_name(&node.name)?;
            if !seen.insert(node.name.as_str()) {
                return Err(PlanError::DuplicateNode {
                    node: node.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Find a node by name
    pub fn node(&self, name: &str) -> Option<&Arc<NodeDef>> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// One module invocation in the template
#[derive(Debug, Clone, Deserialize)]
pub struct NodeDef {
    pub name: String,
    /// Registry id, e.g. `security/keyvault`
    pub module: String,
    /// Parameter expressions; strings may contain `{{ ... }}` references
    #[serde(default = "empty_object")]
    pub params: Value,
    /// Explicit ordering hints (no data flows along these edges)
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Activation predicate, e.g. `param.principalId != ''`
    #[serde(default)]
    pub when: Option<String>,
    /// Extra tags merged over the base tag set for this node only
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Top-level output: `KEY: "{{ expr }}"` or the full form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutputDef {
    Short(String),
    Full {
        value: String,
        /// Named exception to the "no plaintext secrets in outputs" rule
        #[serde(default)]
        allow_plaintext_secret: bool,
    },
}

impl OutputDef {
    pub fn expression(&self) -> &str {
        match self {
            OutputDef::Short(s) => s,
            OutputDef::Full { value, .. } => value,
        }
    }

    pub fn allows_plaintext_secret(&self) -> bool {
        matches!(
            self,
            OutputDef::Full {
                allow_plaintext_secret: true,
                ..
            }
        )
    }
}
