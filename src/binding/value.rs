//! Output values: plain JSON or vault secret references

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Key under which a secret reference is encoded inside resolved params
pub const SECRET_REF_KEY: &str = "secretRef";

/// Pointer to a value held in a vault, resolved only at apply time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub vault: String,
    pub secret: String,
}

impl SecretRef {
    pub fn new(vault: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            vault: vault.into(),
            secret: secret.into(),
        }
    }

    /// `{"secretRef": {"vault": .., "secret": ..}}`
    pub fn to_value(&self) -> Value {
        json!({ SECRET_REF_KEY: { "vault": self.vault, "secret": self.secret } })
    }

    /// Decode the form produced by [`SecretRef::to_value`]
    pub fn from_value(value: &Value) -> Option<Self> {
        let inner = value.as_object()?.get(SECRET_REF_KEY)?;
        serde_json::from_value(inner.clone()).ok()
    }

    /// Vault URI of the secret (no version)
    pub fn uri(&self) -> String {
        format!("https://{}.vault.azure.net/secrets/{}", self.vault, self.secret)
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vault, self.secret)
    }
}

/// A named output produced by a resolved node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputValue {
    Plain(Value),
    Secret(SecretRef),
}

impl OutputValue {
    pub fn plain(value: impl Into<Value>) -> Self {
        OutputValue::Plain(value.into())
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, OutputValue::Secret(_))
    }

    /// Representation inside resolved parameters; secrets stay references
    pub fn to_param_value(&self) -> Value {
        match self {
            OutputValue::Plain(v) => v.clone(),
            OutputValue::Secret(s) => s.to_value(),
        }
    }
}

/// Outputs of one node, keyed by output name
pub type NodeOutputs = BTreeMap<String, OutputValue>;

/// Render a plain value for string interpolation
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
