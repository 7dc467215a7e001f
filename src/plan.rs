//! Plan construction - everything that can be decided before any call
//!
//! Pipeline:
//! ```text
//! template + supplied params
//!   → ParameterSet (types, defaults, constraints)
//!   → ResourceToken (scope, environmentName, location)
//!   → base TagSet
//!   → predicate filter (active / excluded)
//!   → reference checks + edges
//!   → ModuleGraph (cycle check, order, waves)
//!   → output checks (secret hygiene)
//! ```
//!
//! A Plan is immutable; the runner only reads it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::ast::{NodeDef, ParameterSet, Template};
use crate::binding::{
    interpolate, scan_str, scan_value, whole_reference, Reference, StaticScope,
};
use crate::dag::{collect_edges, evaluate_predicates, ModuleGraph, OutputIndex};
use crate::error::PlanError;
use crate::registry::ModuleRegistry;
use crate::tags::TagSet;
use crate::token::{generate_token, ResourceToken};

/// Parameter feeding the token's environment component
pub const ENV_PARAM: &str = "environmentName";
/// Parameter feeding the token's region component
pub const LOCATION_PARAM: &str = "location";

/// Caller-supplied inputs for one evaluation
#[derive(Debug, Clone, Default)]
pub struct PlanInputs {
    pub scope_id: String,
    /// Raw parameter values, coerced against the template declarations
    pub params: HashMap<String, String>,
}

impl PlanInputs {
    pub fn new(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// One active node, ready to schedule
#[derive(Debug, Clone)]
pub struct PlannedNode {
    pub name: Arc<str>,
    pub def: Arc<NodeDef>,
    pub grants_permission: bool,
    /// Direct dependencies (implicit and explicit), active nodes only
    pub dependencies: Vec<Arc<str>>,
    /// Base tags extended with the node's own tags
    pub tags: TagSet,
}

/// A node removed by its activation predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedNode {
    pub name: String,
    pub predicate: String,
}

/// One top-level output
#[derive(Debug, Clone)]
pub struct PlannedOutput {
    pub name: String,
    pub expression: String,
    /// References a secret output through the named exception
    pub exposes_secret: bool,
}

/// Immutable evaluation plan
#[derive(Debug, Clone)]
pub struct Plan {
    pub template_name: String,
    pub scope_id: String,
    pub token: ResourceToken,
    pub params: ParameterSet,
    pub tags: TagSet,
    pub registry: Arc<ModuleRegistry>,
    pub graph: ModuleGraph,
    /// Topological order over active nodes
    pub order: Vec<Arc<str>>,
    pub waves: Vec<Vec<Arc<str>>>,
    /// Active nodes keyed by name
    pub nodes: BTreeMap<Arc<str>, PlannedNode>,
    /// Excluded nodes, declaration order
    pub excluded: Vec<ExcludedNode>,
    pub outputs: Vec<PlannedOutput>,
}

impl Plan {
    /// Build a plan, failing before any provisioning call is made
    pub fn build(
        template: &Template,
        registry: Arc<ModuleRegistry>,
        inputs: &PlanInputs,
    ) -> Result<Self, PlanError> {
        let params = ParameterSet::resolve(&template.parameters, &inputs.params)?;
        let token = token_for(&inputs.scope_id, &params)?;
        debug!(token = %token, "resource token derived");

        let tags = TagSet::new(resolve_tags("tags", &template.tags, &params, &token)?);

        let activation = evaluate_predicates(template, &params)?;
        let index = OutputIndex::new(template, &activation, &registry)?;

        for node in &activation.active {
            check_param_refs(&node.name, &scan_value(&node.params)?, &params)?;
            check_secret_placement(&node.name, &node.params, &index)?;
        }

        let edges = collect_edges(template, &activation, &index)?;
        let names: Vec<Arc<str>> = activation
            .active
            .iter()
            .map(|n| Arc::from(n.name.as_str()))
            .collect();
        let graph = ModuleGraph::new(&names, &edges);
        let order = graph.topological_order()?;
        let waves = graph.waves()?;

        let mut nodes = BTreeMap::new();
        for (name, def) in names.iter().zip(&activation.active) {
            let spec = registry.require(&def.name, &def.module)?;
            let node_tags = if def.tags.is_empty() {
                tags.clone()
            } else {
                tags.extend(resolve_tags(&def.name, &def.tags, &params, &token)?)
            };
            nodes.insert(
                Arc::clone(name),
                PlannedNode {
                    name: Arc::clone(name),
                    def: Arc::clone(def),
                    grants_permission: spec.grants_permission,
                    dependencies: graph.get_dependencies(name).to_vec(),
                    tags: node_tags,
                },
            );
        }

        let outputs = plan_outputs(template, &index, &params)?;

        let excluded: Vec<ExcludedNode> = activation
            .excluded
            .iter()
            .map(|n| ExcludedNode {
                name: n.name.clone(),
                predicate: n.when.clone().unwrap_or_default(),
            })
            .collect();
        info!(
            template = %template.name,
            active = nodes.len(),
            excluded = excluded.len(),
            waves = waves.len(),
            "plan built"
        );

        Ok(Self {
            template_name: template.name.clone(),
            scope_id: inputs.scope_id.clone(),
            token,
            params,
            tags,
            registry,
            graph,
            order,
            waves,
            nodes,
            excluded,
            outputs,
        })
    }

    pub fn node(&self, name: &str) -> Option<&PlannedNode> {
        self.nodes.get(name)
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.iter().any(|n| n.name == name)
    }

    /// Active nodes in evaluation order
    pub fn ordered_nodes(&self) -> impl Iterator<Item = &PlannedNode> {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    /// Position of a node in the evaluation order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n.as_ref() == name)
    }

    pub fn to_json(&self) -> Value {
        let waves: Vec<Vec<&str>> = self
            .waves
            .iter()
            .map(|w| w.iter().map(|n| n.as_ref()).collect())
            .collect();
        let nodes: Vec<Value> = self
            .ordered_nodes()
            .map(|n| {
                json!({
                    "name": n.name.as_ref(),
                    "module": n.def.module,
                    "dependsOn": n.dependencies.iter().map(|d| d.as_ref()).collect::<Vec<_>>(),
                    "grantsPermission": n.grants_permission,
                })
            })
            .collect();
        json!({
            "template": self.template_name,
            "token": self.token.as_str(),
            "order": self.order.iter().map(|n| n.as_ref()).collect::<Vec<_>>(),
            "waves": waves,
            "excluded": self.excluded.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            "nodes": nodes,
            "outputs": self.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
        })
    }
}

/// Derive the token from the scope and the environment/location parameters
fn token_for(scope_id: &str, params: &ParameterSet) -> Result<ResourceToken, PlanError> {
    let env = params
        .get_str(ENV_PARAM)
        .ok_or_else(|| PlanError::MissingParameter {
            name: ENV_PARAM.to_string(),
        })?;
    let location = params
        .get_str(LOCATION_PARAM)
        .ok_or_else(|| PlanError::MissingParameter {
            name: LOCATION_PARAM.to_string(),
        })?;
    Ok(generate_token(scope_id, &env, &location))
}

/// Resolve tag values; only parameters and the token are in scope
fn resolve_tags(
    owner: &str,
    raw: &BTreeMap<String, String>,
    params: &ParameterSet,
    token: &ResourceToken,
) -> Result<BTreeMap<String, String>, PlanError> {
    let scope = StaticScope { params, token };
    let mut resolved = BTreeMap::new();
    for (key, expression) in raw {
        for reference in scan_str(expression)? {
            if let Reference::Output { .. } = reference {
                return Err(PlanError::TemplateSyntax {
                    expression: expression.clone(),
                    details: format!(
                        "tag '{}' of '{}' references a node output; tags may only use params and the token",
                        key, owner
                    ),
                });
            }
        }
        resolved.insert(key.clone(), interpolate(expression, &scope)?.into_owned());
    }
    Ok(resolved)
}

fn check_param_refs(
    node: &str,
    refs: &[Reference],
    params: &ParameterSet,
) -> Result<(), PlanError> {
    for reference in refs {
        if let Reference::Param(name) = reference {
            if params.get(name).is_none() {
                debug!(node, param = %name, "reference to undeclared parameter");
                return Err(PlanError::MissingParameter { name: name.clone() });
            }
        }
    }
    Ok(())
}

/// Secret outputs may only be the whole value of a string leaf, so they
/// reach the module as vault references
fn check_secret_placement(
    owner: &str,
    value: &Value,
    index: &OutputIndex<'_>,
) -> Result<(), PlanError> {
    match value {
        Value::String(expression) => {
            for reference in scan_str(expression)? {
                let Reference::Output { node, key } = &reference else {
                    continue;
                };
                if index.check(owner, node, key)?.secret && whole_reference(expression).is_none() {
                    return Err(PlanError::SecretInterpolation {
                        reference: reference.to_string(),
                        context: expression.clone(),
                    });
                }
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_secret_placement(owner, item, index)),
        Value::Object(map) => map
            .values()
            .try_for_each(|item| check_secret_placement(owner, item, index)),
        _ => Ok(()),
    }
}

/// Check top-level outputs: references valid, secrets only via the exception
fn plan_outputs(
    template: &Template,
    index: &OutputIndex<'_>,
    params: &ParameterSet,
) -> Result<Vec<PlannedOutput>, PlanError> {
    let mut outputs = Vec::with_capacity(template.outputs.len());

    for (name, def) in &template.outputs {
        let expression = def.expression();
        let refs = scan_str(expression)?;
        let owner = format!("outputs.{}", name);
        check_param_refs(&owner, &refs, params)?;

        let mut exposes_secret = false;
        for reference in &refs {
            let Reference::Output { node, key } = reference else {
                continue;
            };
            if !index.check(&owner, node, key)?.secret {
                continue;
            }
            if !def.allows_plaintext_secret() {
                return Err(PlanError::PlaintextSecretOutput {
                    output: name.clone(),
                    reference: reference.to_string(),
                });
            }
            if whole_reference(expression).is_none() {
                return Err(PlanError::SecretInterpolation {
                    reference: reference.to_string(),
                    context: expression.to_string(),
                });
            }
            exposes_secret = true;
        }

        outputs.push(PlannedOutput {
            name: name.clone(),
            expression: expression.to_string(),
            exposes_secret,
        });
    }

    Ok(outputs)
}

/// Static report produced by [`validate_template`]
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub nodes: usize,
    pub references: usize,
    pub outputs: usize,
    pub predicates: usize,
}

/// Parameter-independent checks: modules known, expressions and
/// predicates well-formed, references point at declared outputs,
/// depends_on names known nodes. Cycles are checked over all nodes.
pub fn validate_template(
    template: &Template,
    registry: &ModuleRegistry,
) -> Result<ValidationReport, PlanError> {
    let mut report = ValidationReport {
        nodes: template.nodes.len(),
        outputs: template.outputs.len(),
        ..Default::default()
    };

    let everything = crate::dag::Activation {
        active: template.nodes.clone(),
        excluded: Vec::new(),
    };
    let index = OutputIndex::new(template, &everything, registry)?;

    for (key, expression) in &template.tags {
        for reference in scan_str(expression)? {
            if reference.node().is_some() {
                return Err(PlanError::TemplateSyntax {
                    expression: expression.clone(),
                    details: format!("tag '{}' references a node output", key),
                });
            }
        }
    }

    for node in &template.nodes {
        if let Some(source) = node.when.as_deref() {
            crate::binding::Predicate::parse(source).map_err(|details| {
                PlanError::ActivationPredicate {
                    node: node.name.clone(),
                    details,
                }
            })?;
            report.predicates += 1;
        }
        for tag in node.tags.values() {
            scan_str(tag)?;
        }
        report.references += scan_value(&node.params)?
            .iter()
            .filter(|r| r.node().is_some())
            .count();
        check_secret_placement(&node.name, &node.params, &index)?;
    }

    let edges = collect_edges(template, &everything, &index)?;
    let names: Vec<Arc<str>> = template
        .nodes
        .iter()
        .map(|n| Arc::from(n.name.as_str()))
        .collect();
    ModuleGraph::new(&names, &edges).topological_order()?;

    for (name, def) in &template.outputs {
        for reference in scan_str(def.expression())? {
            if let Reference::Output { node, key } = &reference {
                let decl = index.check(&format!("outputs.{}", name), node, key)?;
                if !decl.secret {
                    continue;
                }
                if !def.allows_plaintext_secret() {
                    return Err(PlanError::PlaintextSecretOutput {
                        output: name.clone(),
                        reference: reference.to_string(),
                    });
                }
                if whole_reference(def.expression()).is_none() {
                    return Err(PlanError::SecretInterpolation {
                        reference: reference.to_string(),
                        context: def.expression().to_string(),
                    });
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SCOPE: &str = "00000000-0000-0000-0000-000000000000";

    fn registry() -> Arc<ModuleRegistry> {
        Arc::new(ModuleRegistry::builtin())
    }

    fn inputs(principal: &str) -> PlanInputs {
        PlanInputs::new(SCOPE)
            .with_param("environmentName", "dev")
            .with_param("location", "eastus")
            .with_param("principalId", principal)
    }

    fn builtin_plan(principal: &str) -> Plan {
        let template = Template::builtin().unwrap();
        Plan::build(&template, registry(), &inputs(principal)).unwrap()
    }

    #[test]
    fn builtin_plan_without_principal_excludes_push_grant() {
        let plan = builtin_plan("");
        assert_eq!(
            plan.excluded,
            vec![ExcludedNode {
                name: "registryPushUser".to_string(),
                predicate: "param.principalId != ''".to_string(),
            }]
        );
        assert!(plan.is_excluded("registryPushUser"));
        assert!(plan.node("vaultSecretsReadApp").is_some());
        assert!(plan.node("registryPushUser").is_none());
        assert_eq!(plan.order.len(), 9);
    }

    #[test]
    fn every_node_after_its_dependencies() {
        let plan = builtin_plan("11111111-1111-1111-1111-111111111111");
        for node in plan.ordered_nodes() {
            let pos = plan.position(&node.name).unwrap();
            for dep in &node.dependencies {
                assert!(plan.position(dep).unwrap() < pos, "{} before {}", dep, node.name);
            }
        }
    }

    #[test]
    fn app_waits_for_vault_grant() {
        let plan = builtin_plan("");
        let app = plan.node("app").unwrap();
        assert!(app.dependencies.iter().any(|d| d.as_ref() == "vaultSecretsReadApp"));
        assert!(plan.graph.has_path("keyvault", "app"));
    }

    #[test]
    fn push_grant_independent_of_vault_grant() {
        let plan = builtin_plan("11111111-1111-1111-1111-111111111111");
        assert!(plan.node("registryPushUser").is_some());
        assert!(plan.excluded.is_empty());
        assert!(!plan.graph.has_path("registryPushUser", "vaultSecretsReadApp"));
        assert!(!plan.graph.has_path("vaultSecretsReadApp", "registryPushUser"));
    }

    #[test]
    fn identical_inputs_identical_plan() {
        let a = builtin_plan("");
        let b = builtin_plan("");
        assert_eq!(a.token, b.token);
        assert_eq!(a.order, b.order);
        assert_eq!(a.to_json(), b.to_json());
    }

    #[test]
    fn tags_resolved_and_extended() {
        let plan = builtin_plan("");
        assert_eq!(plan.tags.get("azd-env-name"), Some("dev"));
        let app = plan.node("app").unwrap();
        assert_eq!(app.tags.get("azd-service-name"), Some("web"));
        assert_eq!(plan.tags.get("azd-service-name"), None);
        assert!(app.tags.shares_base_with(&plan.tags));
    }

    #[test]
    fn key_output_uses_named_exception() {
        let plan = builtin_plan("");
        let exposed: Vec<_> = plan
            .outputs
            .iter()
            .filter(|o| o.exposes_secret)
            .map(|o| o.name.as_str())
            .collect();
        assert_eq!(exposed, vec!["AZURE_COSMOS_DB_TABLE_KEY"]);
    }

    fn custom(yaml_tail: &str) -> Result<Plan, PlanError> {
        let yaml = format!(
            r#"
schema: provplan/template@0.1
name: custom
parameters:
  environmentName: {{ type: string }}
  location: {{ type: string }}
{}"#,
            yaml_tail
        );
        let template = Template::from_yaml(&yaml)?;
        Plan::build(
            &template,
            registry(),
            &PlanInputs::new(SCOPE)
                .with_param("environmentName", "dev")
                .with_param("location", "eastus"),
        )
    }

    #[test]
    fn secret_output_without_exception_rejected() {
        let err = custom(
            r#"
nodes:
  - name: db
    module: database/cosmos-table-account
    params:
      name: "cosmos-{{ token }}"
      location: eastus
      resourceGroup: rg
      keyVaultName: kv
      keySecretName: key
outputs:
  KEY: "{{ db.outputs.key }}"
"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "PLAN-051");
    }

    #[test]
    fn cycle_rejected_before_any_call() {
        let err = custom(
            r#"
nodes:
  - name: a
    module: resources/resource-group
    params: { name: "{{ b.outputs.name }}", location: eastus }
  - name: b
    module: resources/resource-group
    params: { name: "{{ a.outputs.name }}", location: eastus }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::CyclicDependency { .. }));
    }

    #[test]
    fn self_reference_is_cycle() {
        let err = custom(
            r#"
nodes:
  - name: a
    module: resources/resource-group
    params: { name: "x", location: "{{ a.outputs.location }}" }
"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "PLAN-020");
    }

    #[test]
    fn tags_may_not_reference_outputs() {
        let err = custom(
            r#"
tags:
  owner: "{{ a.outputs.name }}"
nodes:
  - name: a
    module: resources/resource-group
    params: { name: "x", location: eastus }
"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "PLAN-003");
    }

    #[test]
    fn undeclared_param_reference_rejected() {
        let err = custom(
            r#"
nodes:
  - name: a
    module: resources/resource-group
    params: { name: "{{ param.nope }}", location: eastus }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::MissingParameter { ref name } if name == "nope"));
    }

    #[test]
    fn validate_builtin_template() {
        let template = Template::builtin().unwrap();
        let report = validate_template(&template, &registry()).unwrap();
        assert_eq!(report.nodes, 10);
        assert_eq!(report.predicates, 1);
        assert_eq!(report.outputs, 5);
        assert!(report.references > 0);
    }
}
