//! Built-in modules
//!
//! SKUs, ports and property shapes are opaque configuration passed through
//! to the control plane; the interesting parts are naming, ids and which
//! outputs each module publishes.

use serde_json::{json, Map, Value};
use url::Url;
use uuid::Uuid;

use crate::binding::{NodeOutputs, OutputValue, SecretRef};

use super::{ModuleContext, ModuleOutput, ModuleSpec, OutputDecl, ResourceDefinition};

const RESOURCE_GROUP: &str = "Microsoft.Resources/resourceGroups";
const IDENTITY: &str = "Microsoft.ManagedIdentity/userAssignedIdentities";
const KEY_VAULT: &str = "Microsoft.KeyVault/vaults";
const COSMOS: &str = "Microsoft.DocumentDB/databaseAccounts";
const REGISTRY: &str = "Microsoft.ContainerRegistry/registries";
const LOG_ANALYTICS: &str = "Microsoft.OperationalInsights/workspaces";
const MANAGED_ENV: &str = "Microsoft.App/managedEnvironments";
const ROLE_ASSIGNMENT: &str = "Microsoft.Authorization/roleAssignments";
const CONTAINER_APP: &str = "Microsoft.App/containerApps";

/// Namespace for deterministic role assignment names
const ROLE_ASSIGNMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_83b1_4d0c_9a57_0e2f_b3c4_d5e6);

/// Built-in role name -> role definition guid
pub const BUILT_IN_ROLES: &[(&str, &str)] = &[
    ("AcrPush", "8311e382-0749-4cb8-b61a-304f252e45ec"),
    ("AcrPull", "7f951dda-4ed3-4680-a7ca-43fe172d538d"),
    ("KeyVaultSecretsUser", "4633458b-17de-408a-b874-0445c86b69e6"),
];

const PRINCIPAL_TYPES: &[&str] = &["User", "ServicePrincipal", "Group"];
const TRANSPORTS: &[&str] = &["auto", "http", "http2", "tcp"];

pub(super) const MODULES: &[ModuleSpec] = &[
    ModuleSpec {
        id: "resources/resource-group",
        description: "Resource group holding every other resource",
        outputs: &[
            OutputDecl::plain("name"),
            OutputDecl::plain("id"),
            OutputDecl::plain("location"),
        ],
        grants_permission: false,
        build: resource_group,
    },
    ModuleSpec {
        id: "identity/user-assigned",
        description: "User-assigned managed identity",
        outputs: &[
            OutputDecl::plain("name"),
            OutputDecl::plain("id"),
            OutputDecl::plain("principalId"),
            OutputDecl::plain("clientId"),
        ],
        grants_permission: false,
        build: identity,
    },
    ModuleSpec {
        id: "security/keyvault",
        description: "Secrets vault with RBAC authorization",
        outputs: &[
            OutputDecl::plain("name"),
            OutputDecl::plain("id"),
            OutputDecl::plain("endpoint"),
        ],
        grants_permission: false,
        build: keyvault,
    },
    ModuleSpec {
        id: "database/cosmos-table-account",
        description: "Serverless table database account; key exported to a vault",
        outputs: &[
            OutputDecl::plain("name"),
            OutputDecl::plain("id"),
            OutputDecl::plain("endpoint"),
            OutputDecl::secret("key"),
        ],
        grants_permission: false,
        build: cosmos_table_account,
    },
    ModuleSpec {
        id: "containers/registry",
        description: "Container registry",
        outputs: &[
            OutputDecl::plain("name"),
            OutputDecl::plain("id"),
            OutputDecl::plain("loginServer"),
        ],
        grants_permission: false,
        build: container_registry,
    },
    ModuleSpec {
        id: "monitor/log-analytics",
        description: "Log analytics workspace",
        outputs: &[
            OutputDecl::plain("name"),
            OutputDecl::plain("id"),
            OutputDecl::plain("customerId"),
        ],
        grants_permission: false,
        build: log_analytics,
    },
    ModuleSpec {
        id: "containers/managed-environment",
        description: "Managed container apps environment",
        outputs: &[
            OutputDecl::plain("name"),
            OutputDecl::plain("id"),
            OutputDecl::plain("defaultDomain"),
        ],
        grants_permission: false,
        build: managed_environment,
    },
    ModuleSpec {
        id: "authorization/role-assignment",
        description: "Role assignment of a built-in role to a principal",
        outputs: &[
            OutputDecl::plain("name"),
            OutputDecl::plain("id"),
            OutputDecl::plain("roleDefinitionId"),
        ],
        grants_permission: true,
        build: role_assignment,
    },
    ModuleSpec {
        id: "containers/app",
        description: "Containerized web application",
        outputs: &[
            OutputDecl::plain("name"),
            OutputDecl::plain("id"),
            OutputDecl::plain("fqdn"),
            OutputDecl::plain("uri"),
        ],
        grants_permission: false,
        build: container_app,
    },
];

/// Guid of a built-in role, by name or as a literal guid
pub fn role_definition_guid(role: &str) -> Option<String> {
    BUILT_IN_ROLES
        .iter()
        .find(|(name, _)| *name == role)
        .map(|(_, guid)| (*guid).to_string())
        .or_else(|| Uuid::parse_str(role).ok().map(|u| u.to_string()))
}

// ═══════════════════════════════════════════
// PARAM HELPERS
// ═══════════════════════════════════════════

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    match params.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(format!("'{}' must not be empty", key)),
        Some(other) => Err(format!("'{}' must be a string, got {}", key, other)),
        None => Err(format!("missing '{}'", key)),
    }
}

fn opt_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn int_param(params: &Value, key: &str, default: i64) -> Result<i64, String> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| format!("'{}' must be an integer, got {}", key, v)),
    }
}

fn bool_param(params: &Value, key: &str, default: bool) -> Result<bool, String> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| format!("'{}' must be a boolean, got {}", key, v)),
    }
}

/// Length and charset check for resource names
fn check_name(kind: &str, name: &str, min: usize, max: usize, hyphens: bool) -> Result<(), String> {
    let len = name.chars().count();
    if len < min || len > max {
        return Err(format!(
            "{} name '{}' must be {}-{} characters, got {}",
            kind, name, min, max, len
        ));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || (hyphens && c == '-'));
    if !ok {
        let allowed = if hyphens {
            "letters, digits and hyphens"
        } else {
            "letters and digits"
        };
        return Err(format!("{} name '{}' may only contain {}", kind, name, allowed));
    }
    Ok(())
}

struct Common<'a> {
    name: &'a str,
    location: &'a str,
    resource_group: &'a str,
}

fn common(params: &Value) -> Result<Common<'_>, String> {
    Ok(Common {
        name: str_param(params, "name")?,
        location: str_param(params, "location")?,
        resource_group: str_param(params, "resourceGroup")?,
    })
}

fn outputs<const N: usize>(entries: [(&str, OutputValue); N]) -> NodeOutputs {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn grouped(
    ctx: &ModuleContext<'_>,
    kind: &str,
    c: &Common<'_>,
    properties: Value,
) -> ResourceDefinition {
    ResourceDefinition {
        kind: kind.to_string(),
        name: c.name.to_string(),
        id: ctx.resource_id(c.resource_group, kind, c.name),
        location: Some(c.location.to_string()),
        resource_group: Some(c.resource_group.to_string()),
        tags: ctx.tags.clone(),
        properties,
    }
}

// ═══════════════════════════════════════════
// MODULES
// ═══════════════════════════════════════════

fn resource_group(ctx: &ModuleContext<'_>, params: &Value) -> Result<ModuleOutput, String> {
    let name = str_param(params, "name")?;
    let location = str_param(params, "location")?;
    check_name("resource group", name, 1, 90, true)?;

    let id = ctx.resource_group_id(name);
    Ok(ModuleOutput {
        outputs: outputs([
            ("name", OutputValue::plain(name)),
            ("id", OutputValue::plain(id.as_str())),
            ("location", OutputValue::plain(location)),
        ]),
        resource: ResourceDefinition {
            kind: RESOURCE_GROUP.to_string(),
            name: name.to_string(),
            id,
            location: Some(location.to_string()),
            resource_group: None,
            tags: ctx.tags.clone(),
            properties: json!({}),
        },
    })
}

fn identity(ctx: &ModuleContext<'_>, params: &Value) -> Result<ModuleOutput, String> {
    let c = common(params)?;
    check_name("identity", c.name, 3, 128, true)?;
    let resource = grouped(ctx, IDENTITY, &c, json!({}));
    Ok(ModuleOutput {
        outputs: outputs([
            ("name", OutputValue::plain(c.name)),
            ("id", OutputValue::plain(resource.id.as_str())),
        ]),
        resource,
    })
}

fn keyvault(ctx: &ModuleContext<'_>, params: &Value) -> Result<ModuleOutput, String> {
    let c = common(params)?;
    check_name("key vault", c.name, 3, 24, true)?;
    let resource = grouped(
        ctx,
        KEY_VAULT,
        &c,
        json!({
            "sku": { "family": "A", "name": "standard" },
            "enableRbacAuthorization": true,
        }),
    );
    let endpoint = format!("https://{}.vault.azure.net/", c.name);
    Ok(ModuleOutput {
        outputs: outputs([
            ("name", OutputValue::plain(c.name)),
            ("id", OutputValue::plain(resource.id.as_str())),
            ("endpoint", OutputValue::plain(endpoint)),
        ]),
        resource,
    })
}

fn cosmos_table_account(ctx: &ModuleContext<'_>, params: &Value) -> Result<ModuleOutput, String> {
    let c = common(params)?;
    check_name("database account", c.name, 3, 44, true)?;
    if c.name.chars().any(|ch| ch.is_ascii_uppercase()) {
        return Err(format!("database account name '{}' must be lowercase", c.name));
    }
    let vault = str_param(params, "keyVaultName")?;
    let secret_name = str_param(params, "keySecretName")?;

    let tables: Vec<&str> = match params.get("tables") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|t| t.as_str().ok_or_else(|| format!("table names must be strings, got {}", t)))
            .collect::<Result<_, _>>()?,
        Some(other) => return Err(format!("'tables' must be an array, got {}", other)),
    };

    let endpoint = format!("https://{}.table.cosmos.azure.com:443/", c.name);
    Url::parse(&endpoint).map_err(|e| format!("invalid endpoint '{}': {}", endpoint, e))?;

    let key = SecretRef::new(vault, secret_name);
    let resource = grouped(
        ctx,
        COSMOS,
        &c,
        json!({
            "kind": "GlobalDocumentDB",
            "databaseAccountOfferType": "Standard",
            "capabilities": [
                { "name": "EnableServerless" },
                { "name": "EnableTable" },
            ],
            "disableLocalAuth": false,
            "tables": tables,
            "secretsExport": { "vault": key.vault, "primaryWriteKey": key.secret },
        }),
    );

    Ok(ModuleOutput {
        outputs: outputs([
            ("name", OutputValue::plain(c.name)),
            ("id", OutputValue::plain(resource.id.as_str())),
            ("endpoint", OutputValue::plain(endpoint)),
            ("key", OutputValue::Secret(key)),
        ]),
        resource,
    })
}

fn container_registry(ctx: &ModuleContext<'_>, params: &Value) -> Result<ModuleOutput, String> {
    let c = common(params)?;
    check_name("registry", c.name, 5, 50, false)?;
    let resource = grouped(
        ctx,
        REGISTRY,
        &c,
        json!({
            "sku": { "name": opt_str(params, "sku").unwrap_or("Basic") },
            "adminUserEnabled": false,
        }),
    );
    let login_server = format!("{}.azurecr.io", c.name.to_ascii_lowercase());
    Ok(ModuleOutput {
        outputs: outputs([
            ("name", OutputValue::plain(c.name)),
            ("id", OutputValue::plain(resource.id.as_str())),
            ("loginServer", OutputValue::plain(login_server)),
        ]),
        resource,
    })
}

fn log_analytics(ctx: &ModuleContext<'_>, params: &Value) -> Result<ModuleOutput, String> {
    let c = common(params)?;
    check_name("workspace", c.name, 4, 63, true)?;
    let resource = grouped(
        ctx,
        LOG_ANALYTICS,
        &c,
        json!({
            "sku": { "name": "PerGB2018" },
            "retentionInDays": int_param(params, "retentionInDays", 30)?,
        }),
    );
    Ok(ModuleOutput {
        outputs: outputs([
            ("name", OutputValue::plain(c.name)),
            ("id", OutputValue::plain(resource.id.as_str())),
        ]),
        resource,
    })
}

fn managed_environment(ctx: &ModuleContext<'_>, params: &Value) -> Result<ModuleOutput, String> {
    let c = common(params)?;
    check_name("environment", c.name, 2, 60, true)?;
    let workspace = str_param(params, "logAnalyticsWorkspaceId")?;
    let resource = grouped(
        ctx,
        MANAGED_ENV,
        &c,
        json!({
            "appLogsConfiguration": {
                "destination": "log-analytics",
                "logAnalyticsWorkspaceId": workspace,
            },
        }),
    );
    Ok(ModuleOutput {
        outputs: outputs([
            ("name", OutputValue::plain(c.name)),
            ("id", OutputValue::plain(resource.id.as_str())),
        ]),
        resource,
    })
}

fn role_assignment(ctx: &ModuleContext<'_>, params: &Value) -> Result<ModuleOutput, String> {
    let principal = str_param(params, "principalId")?;
    let scope = str_param(params, "scope")?;
    let role = str_param(params, "role")?;
    let principal_type = opt_str(params, "principalType").unwrap_or("ServicePrincipal");

    if !PRINCIPAL_TYPES.contains(&principal_type) {
        return Err(format!(
            "principalType '{}' must be one of {}",
            principal_type,
            PRINCIPAL_TYPES.join(", ")
        ));
    }
    let guid = role_definition_guid(role).ok_or_else(|| {
        let known: Vec<&str> = BUILT_IN_ROLES.iter().map(|(n, _)| *n).collect();
        format!("unknown role '{}' (known: {})", role, known.join(", "))
    })?;
    let role_definition_id = format!(
        "/subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions/{}",
        ctx.scope_id, guid
    );

    let seed = format!("{}\u{1f}{}\u{1f}{}", scope, principal, role_definition_id);
    let name = Uuid::new_v5(&ROLE_ASSIGNMENT_NAMESPACE, seed.as_bytes()).to_string();
    let id = format!("{}/providers/{}/{}", scope, ROLE_ASSIGNMENT, name);

    Ok(ModuleOutput {
        outputs: outputs([
            ("name", OutputValue::plain(name.as_str())),
            ("id", OutputValue::plain(id.as_str())),
            ("roleDefinitionId", OutputValue::plain(role_definition_id.as_str())),
        ]),
        resource: ResourceDefinition {
            kind: ROLE_ASSIGNMENT.to_string(),
            name,
            id,
            location: None,
            resource_group: None,
            tags: Default::default(),
            properties: json!({
                "scope": scope,
                "principalId": principal,
                "principalType": principal_type,
                "roleDefinitionId": role_definition_id,
            }),
        },
    })
}

/// Secret name used inside the app for an env var, e.g. `MY_KEY` -> `my-key`
fn app_secret_name(env_name: &str) -> String {
    env_name.to_ascii_lowercase().replace('_', "-")
}

fn container_app(ctx: &ModuleContext<'_>, params: &Value) -> Result<ModuleOutput, String> {
    let c = common(params)?;
    check_name("container app", c.name, 2, 32, true)?;
    let environment_id = str_param(params, "environmentId")?;
    let domain = str_param(params, "environmentDomain")?;
    let identity_id = str_param(params, "identityId")?;
    let image = str_param(params, "image")?;
    let target_port = int_param(params, "targetPort", 80)?;
    let external = bool_param(params, "external", true)?;
    let sticky = bool_param(params, "stickySessions", false)?;
    let min_replicas = int_param(params, "minReplicas", 1)?;
    let max_replicas = int_param(params, "maxReplicas", 1)?;
    let transport = opt_str(params, "transport").unwrap_or("auto");

    if !(1..=65535).contains(&target_port) {
        return Err(format!("targetPort {} is out of range", target_port));
    }
    if min_replicas < 0 || min_replicas > max_replicas {
        return Err(format!(
            "replica bounds invalid: min {} max {}",
            min_replicas, max_replicas
        ));
    }
    if !TRANSPORTS.contains(&transport) {
        return Err(format!(
            "transport '{}' must be one of {}",
            transport,
            TRANSPORTS.join(", ")
        ));
    }

    // Secret env vars become vault-backed app secrets
    let mut env = Vec::new();
    let mut secrets = Vec::new();
    if let Some(vars) = params.get("env") {
        let vars = vars
            .as_object()
            .ok_or_else(|| format!("'env' must be a mapping, got {}", vars))?;
        for (name, value) in vars {
            if let Some(secret) = SecretRef::from_value(value) {
                let secret_name = app_secret_name(name);
                secrets.push(json!({
                    "name": secret_name,
                    "keyVaultUrl": secret.uri(),
                    "identity": identity_id,
                }));
                env.push(json!({ "name": name, "secretRef": secret_name }));
            } else {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Object(_) | Value::Array(_) => {
                        return Err(format!("env var '{}' must be a scalar", name))
                    }
                    other => other.to_string(),
                };
                env.push(json!({ "name": name, "value": text }));
            }
        }
    }

    let mut registries = Vec::new();
    if let Some(server) = opt_str(params, "registryServer") {
        registries.push(json!({ "server": server, "identity": identity_id }));
    }

    let mut identities = Map::new();
    identities.insert(identity_id.to_string(), json!({}));

    let affinity = if sticky { "sticky" } else { "none" };
    let fqdn = format!("{}.{}", c.name, domain);
    let uri = format!("https://{}", fqdn);
    Url::parse(&uri).map_err(|e| format!("invalid app uri '{}': {}", uri, e))?;

    let resource = grouped(
        ctx,
        CONTAINER_APP,
        &c,
        json!({
            "identity": { "type": "UserAssigned", "userAssignedIdentities": identities },
            "managedEnvironmentId": environment_id,
            "configuration": {
                "ingress": {
                    "external": external,
                    "targetPort": target_port,
                    "transport": transport,
                    "stickySessions": { "affinity": affinity },
                },
                "registries": registries,
                "secrets": secrets,
            },
            "template": {
                "containers": [{ "name": "app", "image": image, "env": env }],
                "scale": { "minReplicas": min_replicas, "maxReplicas": max_replicas },
            },
        }),
    );

    Ok(ModuleOutput {
        outputs: outputs([
            ("name", OutputValue::plain(c.name)),
            ("id", OutputValue::plain(resource.id.as_str())),
            ("fqdn", OutputValue::plain(fqdn.as_str())),
            ("uri", OutputValue::plain(uri)),
        ]),
        resource,
    })
}
