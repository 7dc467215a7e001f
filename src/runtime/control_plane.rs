//! Control plane abstraction
//!
//! - [`ControlPlane`]: async seam the runner provisions through
//! - [`InMemoryControlPlane`]: local implementation used by the CLI and tests
//!
//! The in-memory plane keeps resources keyed by id, so applying the same
//! plan twice updates in place instead of creating duplicates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::binding::SecretRef;
use crate::registry::ResourceDefinition;

const RESOURCE_GROUP_KIND: &str = "Microsoft.Resources/resourceGroups";
const KEY_VAULT_KIND: &str = "Microsoft.KeyVault/vaults";
const IDENTITY_KIND: &str = "Microsoft.ManagedIdentity/userAssignedIdentities";
const LOG_ANALYTICS_KIND: &str = "Microsoft.OperationalInsights/workspaces";
const MANAGED_ENV_KIND: &str = "Microsoft.App/managedEnvironments";
const ROLE_ASSIGNMENT_KIND: &str = "Microsoft.Authorization/roleAssignments";

/// One provisioning call
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionRequest {
    pub node: Arc<str>,
    pub resource: ResourceDefinition,
}

/// What the control plane reports back after a create/update
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReceipt {
    pub resource_id: String,
    /// Attributes only known after creation (principal ids, domains, ...)
    pub attributes: BTreeMap<String, Value>,
    /// False when an existing resource was updated in place
    pub created: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ControlPlaneError {
    pub message: String,
}

impl ControlPlaneError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Cloud control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create or update a resource
    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionReceipt, ControlPlaneError>;

    /// True once a (permission) resource is visible to every reader
    async fn is_consistent(&self, resource_id: &str) -> Result<bool, ControlPlaneError>;

    /// Read a secret value from a vault; `None` when it does not exist
    async fn read_secret(&self, secret: &SecretRef) -> Result<Option<String>, ControlPlaneError>;
}

/// A call recorded by the in-memory plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedCall {
    pub sequence: u64,
    pub node: String,
    pub kind: String,
    pub resource_id: String,
}

#[derive(Debug, Clone)]
struct StoredResource {
    definition: ResourceDefinition,
    attributes: BTreeMap<String, Value>,
}

#[derive(Default)]
struct Inner {
    resources: DashMap<String, StoredResource>,
    groups: DashSet<String>,
    vaults: DashSet<String>,
    secrets: DashMap<(String, String), String>,
    failures: DashMap<String, String>,
    polls: DashMap<String, u32>,
    calls: Mutex<Vec<RecordedCall>>,
    sequence: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// In-memory control plane
#[derive(Clone, Default)]
pub struct InMemoryControlPlane {
    inner: Arc<Inner>,
    latency: Duration,
    consistency_delay: u32,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated duration of every provisioning call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `is_consistent` polls answered `false` per resource
    pub fn with_consistency_delay(mut self, polls: u32) -> Self {
        self.consistency_delay = polls;
        self
    }

    /// Make every provisioning call for `node` fail with `message`
    pub fn fail_node(&self, node: impl Into<String>, message: impl Into<String>) {
        self.inner.failures.insert(node.into(), message.into());
    }

    pub fn clear_failures(&self) {
        self.inner.failures.clear();
    }

    /// All calls made, in call order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.calls.lock().clone()
    }

    /// Node names in call order
    pub fn call_order(&self) -> Vec<String> {
        self.inner
            .calls
            .lock()
            .iter()
            .map(|c| c.node.clone())
            .collect()
    }

    /// Peak number of concurrent provisioning calls
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn resource_count(&self) -> usize {
        self.inner.resources.len()
    }

    pub fn resource(&self, id: &str) -> Option<ResourceDefinition> {
        self.inner.resources.get(id).map(|r| r.definition.clone())
    }

    /// Attributes reported for a resource when it was last provisioned
    pub fn attributes(&self, id: &str) -> Option<BTreeMap<String, Value>> {
        self.inner.resources.get(id).map(|r| r.attributes.clone())
    }

    pub fn resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.resources.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    fn check_parents(&self, resource: &ResourceDefinition) -> Result<(), ControlPlaneError> {
        if let Some(group) = &resource.resource_group {
            if !self.inner.groups.contains(group) {
                return Err(ControlPlaneError::new(format!(
                    "resource group '{}' not found",
                    group
                )));
            }
        }
        if resource.kind == ROLE_ASSIGNMENT_KIND {
            let scope = resource
                .properties
                .get("scope")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !self.inner.resources.contains_key(scope) {
                return Err(ControlPlaneError::new(format!(
                    "role assignment scope '{}' not found",
                    scope
                )));
            }
        }
        Ok(())
    }

    /// Export a generated key into the vault named by `secretsExport`
    fn export_secrets(&self, resource: &ResourceDefinition) -> Result<(), ControlPlaneError> {
        let Some(export) = resource.properties.get("secretsExport") else {
            return Ok(());
        };
        let vault = export.get("vault").and_then(Value::as_str).unwrap_or_default();
        let secret = export
            .get("primaryWriteKey")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !self.inner.vaults.contains(vault) {
            return Err(ControlPlaneError::new(format!(
                "vault '{}' not found for secret export",
                vault
            )));
        }
        // Existing keys survive re-apply
        self.inner
            .secrets
            .entry((vault.to_string(), secret.to_string()))
            .or_insert_with(generate_key);
        Ok(())
    }
}

/// 64 hex chars of fresh randomness
fn generate_key() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Stable per-resource uuid for derived attributes
fn derived_uuid(resource_id: &str, purpose: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{}#{}", resource_id, purpose).as_bytes(),
    )
}

fn attributes_for(resource: &ResourceDefinition) -> BTreeMap<String, Value> {
    let mut attributes = BTreeMap::new();
    let id = resource.id.as_str();
    match resource.kind.as_str() {
        IDENTITY_KIND => {
            attributes.insert(
                "principalId".to_string(),
                Value::from(derived_uuid(id, "principal").to_string()),
            );
            attributes.insert(
                "clientId".to_string(),
                Value::from(derived_uuid(id, "client").to_string()),
            );
        }
        LOG_ANALYTICS_KIND => {
            attributes.insert(
                "customerId".to_string(),
                Value::from(derived_uuid(id, "customer").to_string()),
            );
        }
        MANAGED_ENV_KIND => {
            let label = derived_uuid(id, "domain").simple().to_string();
            let location = resource.location.as_deref().unwrap_or("local");
            attributes.insert(
                "defaultDomain".to_string(),
                Value::from(format!(
                    "{}.{}.azurecontainerapps.io",
                    &label[..12],
                    location
                )),
            );
        }
        _ => {}
    }
    attributes
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionReceipt, ControlPlaneError> {
        let resource = &request.resource;
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        self.inner.calls.lock().push(RecordedCall {
            sequence,
            node: request.node.to_string(),
            kind: resource.kind.clone(),
            resource_id: resource.id.clone(),
        });

        let current = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.inner.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(message) = self.inner.failures.get(request.node.as_ref()) {
            return Err(ControlPlaneError::new(message.value().clone()));
        }

        self.check_parents(resource)?;
        self.export_secrets(resource)?;

        match resource.kind.as_str() {
            RESOURCE_GROUP_KIND => {
                self.inner.groups.insert(resource.name.clone());
            }
            KEY_VAULT_KIND => {
                self.inner.vaults.insert(resource.name.clone());
            }
            _ => {}
        }

        let attributes = attributes_for(resource);
        let created = self
            .inner
            .resources
            .insert(
                resource.id.clone(),
                StoredResource {
                    definition: resource.clone(),
                    attributes: attributes.clone(),
                },
            )
            .is_none();

        debug!(node = %request.node, id = %resource.id, created, "resource provisioned");

        Ok(ProvisionReceipt {
            resource_id: resource.id.clone(),
            attributes,
            created,
        })
    }

    async fn is_consistent(&self, resource_id: &str) -> Result<bool, ControlPlaneError> {
        if !self.inner.resources.contains_key(resource_id) {
            return Err(ControlPlaneError::new(format!(
                "resource '{}' not found",
                resource_id
            )));
        }
        let mut polls = self.inner.polls.entry(resource_id.to_string()).or_insert(0);
        *polls += 1;
        Ok(*polls > self.consistency_delay)
    }

    async fn read_secret(&self, secret: &SecretRef) -> Result<Option<String>, ControlPlaneError> {
        if !self.inner.vaults.contains(&secret.vault) {
            return Err(ControlPlaneError::new(format!(
                "vault '{}' not found",
                secret.vault
            )));
        }
        Ok(self
            .inner
            .secrets
            .get(&(secret.vault.clone(), secret.secret.clone()))
            .map(|v| v.value().clone()))
    }
}

impl std::fmt::Debug for InMemoryControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryControlPlane")
            .field("resources", &self.resource_count())
            .field("latency", &self.latency)
            .field("consistency_delay", &self.consistency_delay)
            .finish()
    }
}
