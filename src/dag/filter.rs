//! Conditional inclusion and reference validation
//!
//! Validates:
//! - `when:` predicates evaluate over the parameter set
//! - `{{ node.outputs.key }}` references point at an active node
//!   whose module declares the key
//! - a conditional node is only referenced by nodes carrying the same
//!   predicate, whatever the parameters
//! - `depends_on` names a node of the template
//!
//! Error codes:
//! - PLAN-021: reference to an unknown, excluded or undeclared output
//! - PLAN-022: depends_on names an unknown node
//! - PLAN-030: predicate cannot be parsed or evaluated

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::ast::{NodeDef, ParameterSet, Template};
use crate::binding::{scan_value, Predicate, Reference};
use crate::error::PlanError;
use crate::registry::{ModuleRegistry, OutputDecl};

/// Result of predicate evaluation, both lists in declaration order
#[derive(Debug, Clone, Default)]
pub struct Activation {
    pub active: Vec<Arc<NodeDef>>,
    pub excluded: Vec<Arc<NodeDef>>,
}

impl Activation {
    pub fn is_active(&self, name: &str) -> bool {
        self.active.iter().any(|n| n.name == name)
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.iter().any(|n| n.name == name)
    }
}

/// Evaluate every node's predicate; nodes without one are active
pub fn evaluate_predicates(
    template: &Template,
    params: &ParameterSet,
) -> Result<Activation, PlanError> {
    let mut activation = Activation::default();

    for node in &template.nodes {
        let included = match node.when.as_deref() {
            None => true,
            Some(source) => Predicate::parse(source)
                .and_then(|p| p.eval(params))
                .map_err(|details| PlanError::ActivationPredicate {
                    node: node.name.clone(),
                    details,
                })?,
        };

        if included {
            activation.active.push(Arc::clone(node));
        } else {
            debug!(node = %node.name, "predicate false, node excluded");
            activation.excluded.push(Arc::clone(node));
        }
    }

    Ok(activation)
}

/// Index of declared outputs for every node of the template
pub struct OutputIndex<'a> {
    modules: FxHashMap<&'a str, &'static [OutputDecl]>,
    guards: FxHashMap<&'a str, &'a str>,
    activation: &'a Activation,
}

impl<'a> OutputIndex<'a> {
    pub fn new(
        template: &'a Template,
        activation: &'a Activation,
        registry: &ModuleRegistry,
    ) -> Result<Self, PlanError> {
        let mut modules = FxHashMap::default();
        let mut guards = FxHashMap::default();
        for node in &template.nodes {
            let spec = registry.require(&node.name, &node.module)?;
            modules.insert(node.name.as_str(), spec.outputs);
            if let Some(when) = node.when.as_deref() {
                guards.insert(node.name.as_str(), when.trim());
            }
        }
        Ok(Self {
            modules,
            guards,
            activation,
        })
    }

    /// Check one `<node>.outputs.<key>` reference made by `from`.
    ///
    /// Returns the declaration so callers can tell secret outputs apart.
    pub fn check(
        &self,
        from: &str,
        node: &str,
        key: &str,
    ) -> Result<&'static OutputDecl, PlanError> {
        let missing = |reason: String| PlanError::MissingOutput {
            node: from.to_string(),
            reference: format!("{}.outputs.{}", node, key),
            reason,
        };

        let Some(&outputs) = self.modules.get(node) else {
            return Err(missing(format!("unknown node '{}'", node)));
        };
        if let Some(&guard) = self.guards.get(node) {
            if self.guards.get(from).copied() != Some(guard) {
                return Err(missing(format!(
                    "node '{}' only exists when \"{}\"; the referencing node must carry the same predicate",
                    node, guard
                )));
            }
        }
        if self.activation.is_excluded(node) {
            return Err(missing(format!(
                "node '{}' is excluded by its activation predicate",
                node
            )));
        }
        outputs
            .iter()
            .find(|o| o.name == key)
            .ok_or_else(|| missing(format!("node '{}' does not declare output '{}'", node, key)))
    }
}

/// Build `(dependency, dependent)` edges over the active nodes.
///
/// Implicit edges come from output references in params; explicit edges
/// from `depends_on`. Explicit hints naming an excluded node are dropped.
pub fn collect_edges(
    template: &Template,
    activation: &Activation,
    index: &OutputIndex<'_>,
) -> Result<Vec<(Arc<str>, Arc<str>)>, PlanError> {
    let names: FxHashMap<&str, Arc<str>> = template
        .nodes
        .iter()
        .map(|n| (n.name.as_str(), Arc::from(n.name.as_str())))
        .collect();

    let mut edges = Vec::new();
    let mut seen: FxHashSet<(&str, &str)> = FxHashSet::default();

    for node in &activation.active {
        let Some(dependent) = names.get(node.name.as_str()) else {
            continue;
        };

        for reference in scan_value(&node.params)? {
            if let Reference::Output { node: dep, key } = &reference {
                index.check(&node.name, dep, key)?;
                if let Some((dep_name, dep_arc)) = names.get_key_value(dep.as_str()) {
                    if seen.insert((*dep_name, node.name.as_str())) {
                        edges.push((Arc::clone(dep_arc), Arc::clone(dependent)));
                    }
                }
            }
        }

        for dep in &node.depends_on {
            let Some((dep_name, dep_arc)) = names.get_key_value(dep.as_str()) else {
                return Err(PlanError::UnknownDependency {
                    node: node.name.clone(),
                    dependency: dep.clone(),
                });
            };
            if activation.is_excluded(dep) {
                debug!(node = %node.name, dependency = %dep, "ordering hint on excluded node dropped");
                continue;
            }
            if seen.insert((*dep_name, node.name.as_str())) {
                edges.push((Arc::clone(dep_arc), Arc::clone(dependent)));
            }
        }
    }

    Ok(edges)
}
