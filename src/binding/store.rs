//! OutputStore - resolved node outputs with DashMap
//!
//! Lock-free concurrent access; nodes write once when they resolve and
//! any number of worker tasks read.

use std::sync::Arc;

use dashmap::DashMap;

use crate::ast::ParameterSet;
use crate::token::ResourceToken;

use super::reference::{Reference, Scope};
use super::value::{NodeOutputs, OutputValue};

/// Thread-safe storage for node outputs
#[derive(Clone, Default)]
pub struct OutputStore {
    outputs: Arc<DashMap<Arc<str>, Arc<NodeOutputs>>>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a node's outputs (read-only from here on)
    pub fn insert(&self, node: Arc<str>, outputs: NodeOutputs) {
        self.outputs.insert(node, Arc::new(outputs));
    }

    pub fn get(&self, node: &str) -> Option<Arc<NodeOutputs>> {
        self.outputs.get(node).map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, node: &str) -> bool {
        self.outputs.contains_key(node)
    }

    /// Resolve `<node>.outputs.<key>`
    pub fn output(&self, node: &str, key: &str) -> Option<OutputValue> {
        self.outputs.get(node)?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

impl std::fmt::Debug for OutputStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStore")
            .field("nodes", &self.len())
            .finish()
    }
}

/// Resolution scope: parameters, token and published outputs
pub struct EvalScope<'a> {
    pub params: &'a ParameterSet,
    pub token: &'a ResourceToken,
    pub store: &'a OutputStore,
}

impl Scope for EvalScope<'_> {
    fn lookup(&self, reference: &Reference) -> Option<OutputValue> {
        match reference {
            Reference::Token => Some(OutputValue::plain(self.token.as_str())),
            Reference::Param(name) => self.params.get(name).cloned().map(OutputValue::Plain),
            Reference::Output { node, key } => self.store.output(node, key),
        }
    }
}

/// Scope with parameters and token only (tags, predicates)
pub struct StaticScope<'a> {
    pub params: &'a ParameterSet,
    pub token: &'a ResourceToken,
}

impl Scope for StaticScope<'_> {
    fn lookup(&self, reference: &Reference) -> Option<OutputValue> {
        match reference {
            Reference::Token => Some(OutputValue::plain(self.token.as_str())),
            Reference::Param(name) => self.params.get(name).cloned().map(OutputValue::Plain),
            Reference::Output { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{resolve_str, SecretRef};
    use crate::token::generate_token;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn insert_and_read_outputs() {
        let store = OutputStore::new();
        let mut outputs = NodeOutputs::new();
        outputs.insert("name".to_string(), OutputValue::plain("kv-abc"));
        outputs.insert(
            "key".to_string(),
            OutputValue::Secret(SecretRef::new("kv-abc", "k")),
        );
        store.insert(Arc::from("keyvault"), outputs);

        assert!(store.contains("keyvault"));
        assert_eq!(store.output("keyvault", "name"), Some(OutputValue::plain("kv-abc")));
        assert!(store.output("keyvault", "key").unwrap().is_secret());
        assert_eq!(store.output("keyvault", "missing"), None);
        assert_eq!(store.output("other", "name"), None);
    }

    #[test]
    fn eval_scope_resolves_all_roots() {
        let store = OutputStore::new();
        let mut outputs = NodeOutputs::new();
        outputs.insert("name".to_string(), OutputValue::plain("rg-dev"));
        store.insert(Arc::from("rg"), outputs);

        let mut values = BTreeMap::new();
        values.insert("location".to_string(), json!("eastus"));
        let params = ParameterSet::from_values(values);
        let token = generate_token("s", "dev", "eastus");

        let scope = EvalScope {
            params: &params,
            token: &token,
            store: &store,
        };
        let v = resolve_str("{{ rg.outputs.name }}/{{ param.location }}/{{ token }}", &scope)
            .unwrap();
        assert_eq!(v, json!(format!("rg-dev/eastus/{}", token)));
    }

    #[test]
    fn static_scope_has_no_outputs() {
        let params = ParameterSet::default();
        let token = generate_token("s", "dev", "eastus");
        let scope = StaticScope {
            params: &params,
            token: &token,
        };
        assert!(resolve_str("{{ rg.outputs.name }}", &scope).is_err());
        assert!(resolve_str("x-{{ token }}", &scope).is_ok());
    }
}
