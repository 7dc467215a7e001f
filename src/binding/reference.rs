//! Expression references - `{{ token }}`, `{{ param.x }}`, `{{ node.outputs.key }}`
//!
//! Scanning is static (used to build graph edges before anything runs).
//! Resolution is single-pass, copying literal segments between matches.

use std::borrow::Cow;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use smallvec::SmallVec;

use crate::error::PlanError;

use super::value::{value_to_string, OutputValue};

/// Any `{{ ... }}` block
static EXPR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap());

/// `param.<name>`
static PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^param\.([A-Za-z_][A-Za-z0-9_]*)$").unwrap());

/// `<node>.outputs.<key>`
static OUTPUT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_-]*)\.outputs\.([A-Za-z_][A-Za-z0-9_]*)$").unwrap()
});

/// Most strings carry 0-2 references
pub type RefVec = SmallVec<[Reference; 2]>;

/// One reference inside an expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Token,
    Param(String),
    Output { node: String, key: String },
}

impl Reference {
    fn parse(inner: &str, expression: &str) -> Result<Self, PlanError> {
        if inner == "token" {
            return Ok(Reference::Token);
        }
        if let Some(cap) = PARAM_RE.captures(inner) {
            return Ok(Reference::Param(cap[1].to_string()));
        }
        if let Some(cap) = OUTPUT_RE.captures(inner) {
            return Ok(Reference::Output {
                node: cap[1].to_string(),
                key: cap[2].to_string(),
            });
        }
        Err(PlanError::TemplateSyntax {
            expression: expression.to_string(),
            details: format!("unrecognised reference '{}'", inner),
        })
    }

    /// Node name for output references
    pub fn node(&self) -> Option<&str> {
        match self {
            Reference::Output { node, .. } => Some(node),
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Token => f.write_str("token"),
            Reference::Param(name) => write!(f, "param.{}", name),
            Reference::Output { node, key } => write!(f, "{}.outputs.{}", node, key),
        }
    }
}

/// Lookup seam used by resolution
pub trait Scope {
    fn lookup(&self, reference: &Reference) -> Option<OutputValue>;
}

/// Parse all references in one string
pub fn scan_str(expression: &str) -> Result<RefVec, PlanError> {
    let mut refs = RefVec::new();
    if !expression.contains("{{") {
        return Ok(refs);
    }
    for cap in EXPR_RE.captures_iter(expression) {
        refs.push(Reference::parse(&cap[1], expression)?);
    }
    Ok(refs)
}

/// Parse all references in a JSON tree (string leaves only)
pub fn scan_value(value: &Value) -> Result<Vec<Reference>, PlanError> {
    let mut refs = Vec::new();
    collect(value, &mut refs)?;
    Ok(refs)
}

fn collect(value: &Value, refs: &mut Vec<Reference>) -> Result<(), PlanError> {
    match value {
        Value::String(s) => refs.extend(scan_str(s)?),
        Value::Array(items) => {
            for item in items {
                collect(item, refs)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, refs)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Inner text when the string is exactly one `{{ ... }}` block, no padding
pub fn whole_reference(expression: &str) -> Option<&str> {
    let cap = EXPR_RE.captures(expression)?;
    let m = cap.get(0)?;
    if m.start() != 0 || m.end() != expression.len() {
        return None;
    }
    cap.get(1).map(|inner| inner.as_str())
}

/// Resolve one string.
///
/// A string that is exactly one reference takes the bound value as-is, so
/// numbers stay numbers and secrets stay references. Otherwise references
/// are interpolated, and a secret inside a larger string is an error.
pub fn resolve_str(expression: &str, scope: &dyn Scope) -> Result<Value, PlanError> {
    if !expression.contains("{{") {
        return Ok(Value::String(expression.to_string()));
    }

    if let Some(inner) = whole_reference(expression) {
        let reference = Reference::parse(inner, expression)?;
        return lookup(&reference, scope).map(|v| v.to_param_value());
    }

    interpolate(expression, scope).map(|s| Value::String(s.into_owned()))
}

/// Resolve a string to text; secrets are never allowed here
pub fn interpolate<'a>(expression: &'a str, scope: &dyn Scope) -> Result<Cow<'a, str>, PlanError> {
    if !expression.contains("{{") {
        return Ok(Cow::Borrowed(expression));
    }

    let mut result = String::with_capacity(expression.len() + 32);
    let mut last_end = 0;

    for cap in EXPR_RE.captures_iter(expression) {
        let Some(m) = cap.get(0) else { continue };
        result.push_str(&expression[last_end..m.start()]);

        let reference = Reference::parse(&cap[1], expression)?;
        match lookup(&reference, scope)? {
            OutputValue::Plain(v) => result.push_str(&value_to_string(&v)),
            OutputValue::Secret(_) => {
                return Err(PlanError::SecretInterpolation {
                    reference: reference.to_string(),
                    context: expression.to_string(),
                })
            }
        }

        last_end = m.end();
    }

    result.push_str(&expression[last_end..]);
    Ok(Cow::Owned(result))
}

/// Resolve every string leaf of a JSON tree
pub fn resolve_value(value: &Value, scope: &dyn Scope) -> Result<Value, PlanError> {
    match value {
        Value::String(s) => resolve_str(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn lookup(reference: &Reference, scope: &dyn Scope) -> Result<OutputValue, PlanError> {
    scope.lookup(reference).ok_or_else(|| match reference {
        Reference::Param(name) => PlanError::MissingParameter { name: name.clone() },
        other => PlanError::MissingOutput {
            node: String::new(),
            reference: other.to_string(),
            reason: "no value bound at resolution time".to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::SecretRef;
    use serde_json::json;
    use std::collections::HashMap;

    struct MapScope(HashMap<String, OutputValue>);

    impl Scope for MapScope {
        fn lookup(&self, reference: &Reference) -> Option<OutputValue> {
            self.0.get(&reference.to_string()).cloned()
        }
    }

    fn scope() -> MapScope {
        let mut map = HashMap::new();
        map.insert("token".to_string(), OutputValue::plain("abc123"));
        map.insert("param.env".to_string(), OutputValue::plain("dev"));
        map.insert("param.port".to_string(), OutputValue::plain(8000));
        map.insert(
            "db.outputs.key".to_string(),
            OutputValue::Secret(SecretRef::new("kv", "db-key")),
        );
        map.insert("db.outputs.name".to_string(), OutputValue::plain("cosmos-abc"));
        MapScope(map)
    }

    #[test]
    fn scan_finds_all_reference_kinds() {
        let refs = scan_str("{{ token }}-{{param.env}}-{{ db.outputs.name }}").unwrap();
        assert_eq!(
            refs.as_slice(),
            &[
                Reference::Token,
                Reference::Param("env".to_string()),
                Reference::Output {
                    node: "db".to_string(),
                    key: "name".to_string()
                },
            ]
        );
    }

    #[test]
    fn scan_nested_value() {
        let value = json!({
            "a": ["{{ x.outputs.id }}", 1],
            "b": {"c": "{{ y.outputs.name }}"}
        });
        let refs = scan_value(&value).unwrap();
        let nodes: Vec<_> = refs.iter().filter_map(Reference::node).collect();
        assert_eq!(nodes, vec!["x", "y"]);
    }

    #[test]
    fn scan_rejects_unknown_syntax() {
        let err = scan_str("{{ env.HOME }}").unwrap_err();
        assert!(matches!(err, PlanError::TemplateSyntax { .. }));
        assert!(scan_str("{{ db.outputs }}").is_err());
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(resolve_str("hello", &scope()).unwrap(), json!("hello"));
    }

    #[test]
    fn interpolation() {
        let v = resolve_str("kv-{{ token }}-{{ param.env }}", &scope()).unwrap();
        assert_eq!(v, json!("kv-abc123-dev"));
    }

    #[test]
    fn whole_reference_keeps_type() {
        assert_eq!(resolve_str("{{ param.port }}", &scope()).unwrap(), json!(8000));
    }

    #[test]
    fn whole_secret_reference_stays_reference() {
        let v = resolve_str("{{ db.outputs.key }}", &scope()).unwrap();
        assert_eq!(
            SecretRef::from_value(&v),
            Some(SecretRef::new("kv", "db-key"))
        );
    }

    #[test]
    fn secret_inside_string_is_rejected() {
        let err = resolve_str("key={{ db.outputs.key }}", &scope()).unwrap_err();
        assert!(matches!(err, PlanError::SecretInterpolation { .. }));
    }

    #[test]
    fn padded_reference_is_not_whole() {
        assert_eq!(whole_reference("{{ db.outputs.key }}"), Some("db.outputs.key"));
        assert_eq!(whole_reference(" {{ db.outputs.key }} "), None);
        assert_eq!(whole_reference("{{ token }}-{{ token }}"), None);

        let err = resolve_str(" {{ db.outputs.key }}", &scope()).unwrap_err();
        assert!(matches!(err, PlanError::SecretInterpolation { .. }));
    }

    #[test]
    fn missing_binding_is_an_error_not_a_default() {
        let err = resolve_str("{{ other.outputs.id }}", &scope()).unwrap_err();
        assert!(matches!(err, PlanError::MissingOutput { .. }));
    }

    #[test]
    fn resolve_value_walks_tree() {
        let v = resolve_value(
            &json!({"name": "cosmos-{{ token }}", "ports": ["{{ param.port }}"], "n": 1}),
            &scope(),
        )
        .unwrap();
        assert_eq!(v, json!({"name": "cosmos-abc123", "ports": [8000], "n": 1}));
    }
}
