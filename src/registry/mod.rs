//! Module Registry - local replacement for remote module references
//!
//! A module is a pure function from resolved parameters to a resource
//! definition plus the outputs known before creation. Outputs only the
//! control plane can produce (principal ids, default domains, ...) are
//! declared here and filled in from the provisioning receipt.

mod builtin;

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::binding::NodeOutputs;
use crate::error::PlanError;
use crate::tags::TagSet;
use crate::token::ResourceToken;

pub use builtin::{role_definition_guid, BUILT_IN_ROLES};

/// One output key a module publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDecl {
    pub name: &'static str,
    /// Value is a vault reference, never plaintext
    pub secret: bool,
}

impl OutputDecl {
    pub const fn plain(name: &'static str) -> Self {
        Self {
            name,
            secret: false,
        }
    }

    pub const fn secret(name: &'static str) -> Self {
        Self { name, secret: true }
    }
}

/// Build function: resolved params -> definition + static outputs
pub type BuildFn = fn(&ModuleContext<'_>, &Value) -> Result<ModuleOutput, String>;

/// Registry entry
#[derive(Clone, Copy)]
pub struct ModuleSpec {
    pub id: &'static str,
    pub description: &'static str,
    pub outputs: &'static [OutputDecl],
    /// Permission grants are polled for consistency before dependents start
    pub grants_permission: bool,
    pub build: BuildFn,
}

impl ModuleSpec {
    pub fn output(&self, key: &str) -> Option<&OutputDecl> {
        self.outputs.iter().find(|o| o.name == key)
    }

    pub fn declares(&self, key: &str) -> bool {
        self.output(key).is_some()
    }
}

impl fmt::Debug for ModuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSpec")
            .field("id", &self.id)
            .field("outputs", &self.outputs.len())
            .field("grants_permission", &self.grants_permission)
            .finish()
    }
}

/// Evaluation context handed to every build function
#[derive(Debug, Clone, Copy)]
pub struct ModuleContext<'a> {
    pub node: &'a str,
    pub scope_id: &'a str,
    pub token: &'a ResourceToken,
    pub tags: &'a TagSet,
}

impl ModuleContext<'_> {
    pub fn resource_group_id(&self, resource_group: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}",
            self.scope_id, resource_group
        )
    }

    /// `/subscriptions/<scope>/resourceGroups/<rg>/providers/<kind>/<name>`
    pub fn resource_id(&self, resource_group: &str, kind: &str, name: &str) -> String {
        format!(
            "{}/providers/{}/{}",
            self.resource_group_id(resource_group),
            kind,
            name
        )
    }
}

/// Concrete resource handed to the control plane
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDefinition {
    /// Resource type, e.g. `Microsoft.KeyVault/vaults`
    pub kind: String,
    pub name: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Resource group the resource lives in (none for groups and grants)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    #[serde(skip_serializing_if = "TagSet::is_empty")]
    pub tags: TagSet,
    pub properties: Value,
}

/// Result of a build function
#[derive(Debug, Clone)]
pub struct ModuleOutput {
    pub resource: ResourceDefinition,
    pub outputs: NodeOutputs,
}

/// Module id -> spec
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<&'static str, ModuleSpec>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in module
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for spec in builtin::MODULES {
            registry.register(*spec);
        }
        registry
    }

    /// Register (or replace) a module
    pub fn register(&mut self, spec: ModuleSpec) {
        self.modules.insert(spec.id, spec);
    }

    pub fn get(&self, id: &str) -> Option<&ModuleSpec> {
        self.modules.get(id)
    }

    /// Like `get`, failing with `UnknownModule` for the given node
    pub fn require(&self, node: &str, id: &str) -> Result<&ModuleSpec, PlanError> {
        self.get(id).ok_or_else(|| PlanError::UnknownModule {
            node: node.to_string(),
            module: id.to_string(),
            available: self.ids().collect::<Vec<_>>().join(", "),
        })
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleSpec> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Run a module's build function, mapping failures to `ModuleInput`
    pub fn build(
        &self,
        module: &str,
        ctx: &ModuleContext<'_>,
        params: &Value,
    ) -> Result<ModuleOutput, PlanError> {
        let spec = self.require(ctx.node, module)?;
        (spec.build)(ctx, params).map_err(|reason| PlanError::ModuleInput {
            node: ctx.node.to_string(),
            module: module.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::generate_token;

    #[test]
    fn builtin_registry_has_all_modules() {
        let registry = ModuleRegistry::builtin();
        for id in [
            "resources/resource-group",
            "identity/user-assigned",
            "security/keyvault",
            "database/cosmos-table-account",
            "containers/registry",
            "monitor/log-analytics",
            "containers/managed-environment",
            "authorization/role-assignment",
            "containers/app",
        ] {
            assert!(registry.get(id).is_some(), "missing module {}", id);
        }
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn only_role_assignment_grants_permission() {
        let registry = ModuleRegistry::builtin();
        let grants: Vec<_> = registry
            .iter()
            .filter(|m| m.grants_permission)
            .map(|m| m.id)
            .collect();
        assert_eq!(grants, vec!["authorization/role-assignment"]);
    }

    #[test]
    fn cosmos_declares_secret_key() {
        let registry = ModuleRegistry::builtin();
        let cosmos = registry.get("database/cosmos-table-account").unwrap();
        assert!(cosmos.output("key").unwrap().secret);
        assert!(!cosmos.output("endpoint").unwrap().secret);
        assert!(!cosmos.declares("password"));
    }

    #[test]
    fn unknown_module_error() {
        let registry = ModuleRegistry::builtin();
        let err = registry.require("x", "nope/nothing").unwrap_err();
        assert_eq!(err.code(), "PLAN-002");
        assert!(err.to_string().contains("resources/resource-group"));
    }

    #[test]
    fn build_failure_maps_to_module_input() {
        let registry = ModuleRegistry::builtin();
        let token = generate_token("s", "dev", "eastus");
        let tags = TagSet::default();
        let ctx = ModuleContext {
            node: "rg",
            scope_id: "s",
            token: &token,
            tags: &tags,
        };
        let err = registry
            .build("resources/resource-group", &ctx, &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, PlanError::ModuleInput { .. }));
        assert!(err.to_string().contains("rg"));
    }
}
