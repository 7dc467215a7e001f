//! Template parameters: declarations and the resolved, immutable set

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::PlanError;

/// Semantic type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Int,
    Bool,
    Array,
    Object,
}

impl ParamType {
    fn name(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Int => "int",
            ParamType::Bool => "bool",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// Parameter declaration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ParamDef {
    #[serde(default, rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub default: Option<Value>,
    /// Applies to strings (chars) and arrays (items)
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Regex the whole string value must match
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ParamDef {
    /// Coerce a raw CLI string into this parameter's type
    fn coerce(&self, name: &str, raw: &str) -> Result<Value, PlanError> {
        let invalid = |reason: String| PlanError::InvalidParameter {
            name: name.to_string(),
            reason,
        };
        match self.param_type {
            ParamType::String => Ok(Value::String(raw.to_string())),
            ParamType::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| invalid(format!("expected int: {}", e))),
            ParamType::Bool => match raw.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(invalid(format!("expected true/false, got '{}'", other))),
            },
            ParamType::Array | ParamType::Object => serde_json::from_str(raw)
                .map_err(|e| invalid(format!("expected JSON {}: {}", self.param_type.name(), e))),
        }
    }

    /// Check type and constraints of a resolved value
    fn check(&self, name: &str, value: &Value) -> Result<(), PlanError> {
        let invalid = |reason: String| PlanError::InvalidParameter {
            name: name.to_string(),
            reason,
        };

        if !self.param_type.matches(value) {
            return Err(invalid(format!(
                "expected {}, got {}",
                self.param_type.name(),
                value
            )));
        }

        let len = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(a) => Some(a.len()),
            _ => None,
        };
        if let Some(len) = len {
            if let Some(min) = self.min_length {
                if len < min {
                    return Err(invalid(format!("length {} is below minimum {}", len, min)));
                }
            }
            if let Some(max) = self.max_length {
                if len > max {
                    return Err(invalid(format!("length {} exceeds maximum {}", len, max)));
                }
            }
        }

        if let (Some(pattern), Value::String(s)) = (&self.pattern, value) {
            let re = Regex::new(&format!("^(?:{})$", pattern))
                .map_err(|e| invalid(format!("bad pattern '{}': {}", pattern, e)))?;
            if !re.is_match(s) {
                return Err(invalid(format!("'{}' does not match pattern '{}'", s, pattern)));
            }
        }

        Ok(())
    }
}

/// Resolved parameters; created once per evaluation and never mutated
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    values: Arc<BTreeMap<String, Value>>,
}

impl ParameterSet {
    /// Resolve supplied raw values against the declarations.
    ///
    /// Supplied names must be declared; declared names without a value and
    /// without a default are an error.
    pub fn resolve(
        defs: &BTreeMap<String, ParamDef>,
        supplied: &HashMap<String, String>,
    ) -> Result<Self, PlanError> {
        if let Some(unknown) = supplied.keys().find(|k| !defs.contains_key(*k)) {
            return Err(PlanError::InvalidParameter {
                name: unknown.clone(),
                reason: "not declared by the template".to_string(),
            });
        }

        let mut values = BTreeMap::new();
        for (name, def) in defs {
            let value = match supplied.get(name) {
                Some(raw) => def.coerce(name, raw)?,
                None => def
                    .default
                    .clone()
                    .ok_or_else(|| PlanError::MissingParameter { name: name.clone() })?,
            };
            def.check(name, &value)?;
            values.insert(name.clone(), value);
        }

        Ok(Self {
            values: Arc::new(values),
        })
    }

    /// Build directly from values (tests, embedding)
    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self {
            values: Arc::new(values),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// String form used by predicates and string interpolation
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defs() -> BTreeMap<String, ParamDef> {
        let yaml = r#"
environmentName:
  type: string
  min_length: 1
  max_length: 64
location:
  type: string
  min_length: 1
principalId:
  type: string
  default: ""
serviceName:
  default: web
replicas:
  type: int
  default: 1
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    fn supplied(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_fill_missing_values() {
        let set = ParameterSet::resolve(
            &defs(),
            &supplied(&[("environmentName", "dev"), ("location", "eastus")]),
        )
        .unwrap();
        assert_eq!(set.get("principalId"), Some(&json!("")));
        assert_eq!(set.get("serviceName"), Some(&json!("web")));
        assert_eq!(set.get("replicas"), Some(&json!(1)));
    }

    #[test]
    fn missing_required_parameter() {
        let err = ParameterSet::resolve(&defs(), &supplied(&[("environmentName", "dev")]))
            .unwrap_err();
        assert!(matches!(err, PlanError::MissingParameter { ref name } if name == "location"));
    }

    #[test]
    fn environment_name_length_bounds() {
        let too_long = "x".repeat(65);
        let err = ParameterSet::resolve(
            &defs(),
            &supplied(&[("environmentName", &too_long), ("location", "eastus")]),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidParameter { .. }));

        let err = ParameterSet::resolve(
            &defs(),
            &supplied(&[("environmentName", ""), ("location", "eastus")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("below minimum"));

        let max = "x".repeat(64);
        assert!(ParameterSet::resolve(
            &defs(),
            &supplied(&[("environmentName", &max), ("location", "eastus")]),
        )
        .is_ok());
    }

    #[test]
    fn int_coercion() {
        let set = ParameterSet::resolve(
            &defs(),
            &supplied(&[
                ("environmentName", "dev"),
                ("location", "eastus"),
                ("replicas", "3"),
            ]),
        )
        .unwrap();
        assert_eq!(set.get("replicas"), Some(&json!(3)));

        let err = ParameterSet::resolve(
            &defs(),
            &supplied(&[
                ("environmentName", "dev"),
                ("location", "eastus"),
                ("replicas", "three"),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected int"));
    }

    #[test]
    fn undeclared_parameter_rejected() {
        let err = ParameterSet::resolve(
            &defs(),
            &supplied(&[
                ("environmentName", "dev"),
                ("location", "eastus"),
                ("bogus", "1"),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not declared"));
    }

    #[test]
    fn pattern_constraint() {
        let mut defs = BTreeMap::new();
        defs.insert(
            "location".to_string(),
            ParamDef {
                pattern: Some("[a-z0-9]+".to_string()),
                ..Default::default()
            },
        );
        assert!(ParameterSet::resolve(&defs, &supplied(&[("location", "eastus2")])).is_ok());
        assert!(ParameterSet::resolve(&defs, &supplied(&[("location", "East US")])).is_err());
    }
}
