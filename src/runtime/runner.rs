//! Plan Runner - applies a plan against a control plane
//!
//! - JoinSet with continuous refill: a node is spawned as soon as its last
//!   dependency resolves, not when its whole wave finishes
//! - Semaphore caps concurrent provisioning calls
//! - CancellationToken stops scheduling after a failure (fail-fast)
//! - Permission grants are polled until consistent before they resolve

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::binding::{resolve_str, resolve_value, EvalScope, OutputStore, OutputValue, SecretRef};
use crate::error::PlanError;
use crate::event::{calculate_template_hash, generate_generation_id, EventKind, EventLog};
use crate::plan::{Plan, PlannedNode};
use crate::registry::{ModuleContext, ResourceDefinition};

use super::control_plane::{ControlPlane, ProvisionRequest};

/// Node lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Excluded,
    Resolving,
    Resolved,
    Failed,
    Abandoned,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeState::Pending | NodeState::Resolving)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Excluded => "excluded",
            NodeState::Resolving => "resolving",
            NodeState::Resolved => "resolved",
            NodeState::Failed => "failed",
            NodeState::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling knobs
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_parallel: usize,
    /// Stop scheduling after the first failure
    pub fail_fast: bool,
    pub consistency_poll: Duration,
    pub consistency_max_attempts: u32,
    /// Print colored progress lines to stdout
    pub progress: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            fail_fast: true,
            consistency_poll: Duration::from_millis(500),
            consistency_max_attempts: 60,
            progress: false,
        }
    }
}

/// Outcome of a successful apply
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub generation_id: String,
    pub token: String,
    pub states: BTreeMap<String, NodeState>,
    /// Resource definitions sent to the control plane, by node
    pub resources: BTreeMap<String, ResourceDefinition>,
    /// Nodes whose resource did not exist before this apply
    pub created: Vec<String>,
    /// Top-level outputs
    pub outputs: BTreeMap<String, Value>,
    pub duration_ms: u64,
}

/// What a node task hands back to the scheduling loop
enum NodeOutcome {
    Resolved { created: bool },
    Failed(PlanError),
    /// Cancelled before it started
    NotStarted,
}

/// Everything a node task needs, cheap to clone
#[derive(Clone)]
struct NodeEnv {
    plan: Arc<Plan>,
    control_plane: Arc<dyn ControlPlane>,
    store: OutputStore,
    resources: Arc<DashMap<Arc<str>, ResourceDefinition>>,
    states: Arc<DashMap<Arc<str>, NodeState>>,
    event_log: EventLog,
    settings: RunnerSettings,
}

/// Plan runner with event sourcing
pub struct Runner {
    env: NodeEnv,
    template_source: Option<String>,
}

impl Runner {
    pub fn new(plan: Plan, control_plane: Arc<dyn ControlPlane>, settings: RunnerSettings) -> Self {
        let states: DashMap<Arc<str>, NodeState> = plan
            .order
            .iter()
            .map(|n| (Arc::clone(n), NodeState::Pending))
            .collect();
        for excluded in &plan.excluded {
            states.insert(Arc::from(excluded.name.as_str()), NodeState::Excluded);
        }

        Self {
            env: NodeEnv {
                plan: Arc::new(plan),
                control_plane,
                store: OutputStore::new(),
                resources: Arc::new(DashMap::new()),
                states: Arc::new(states),
                event_log: EventLog::new(),
                settings,
            },
            template_source: None,
        }
    }

    /// Template text, hashed into the ApplyStarted event
    pub fn with_template_source(mut self, source: impl Into<String>) -> Self {
        self.template_source = Some(source.into());
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.env.plan
    }

    pub fn event_log(&self) -> &EventLog {
        &self.env.event_log
    }

    pub fn store(&self) -> &OutputStore {
        &self.env.store
    }

    pub fn node_state(&self, node: &str) -> Option<NodeState> {
        self.env.states.get(node).map(|s| *s)
    }

    /// Snapshot of every node's state
    pub fn states(&self) -> BTreeMap<String, NodeState> {
        self.env
            .states
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect()
    }

    fn set_state(&self, node: &Arc<str>, state: NodeState) {
        self.env.states.insert(Arc::clone(node), state);
    }

    fn is_resolved(&self, node: &str) -> bool {
        self.node_state(node) == Some(NodeState::Resolved)
    }

    fn abandon(&self, node: &Arc<str>, cause: &str) {
        self.set_state(node, NodeState::Abandoned);
        self.env.event_log.emit(EventKind::NodeAbandoned {
            node: Arc::clone(node),
            cause: cause.to_string(),
        });
        if self.env.settings.progress {
            println!("  {} {} {}", "[-]".dimmed(), node, cause.dimmed());
        }
        debug!(node = %node, cause, "node abandoned");
    }

    /// Main apply loop
    #[instrument(skip(self), fields(template = %self.env.plan.template_name, nodes = self.env.plan.order.len()))]
    pub async fn run(&self) -> Result<ApplyReport, PlanError> {
        let start = Instant::now();
        let plan = Arc::clone(&self.env.plan);
        let settings = &self.env.settings;
        let generation_id = generate_generation_id();
        info!(generation_id = %generation_id, token = %plan.token, "Starting apply");

        self.env.event_log.emit(EventKind::ApplyStarted {
            node_count: plan.order.len(),
            generation_id: generation_id.clone(),
            template_hash: self
                .template_source
                .as_deref()
                .map(calculate_template_hash)
                .unwrap_or_default(),
            token: plan.token.to_string(),
        });

        for excluded in &plan.excluded {
            self.env.event_log.emit(EventKind::NodeExcluded {
                node: Arc::from(excluded.name.as_str()),
                predicate: excluded.predicate.clone(),
            });
        }

        if settings.progress {
            println!(
                "{} Applying {} nodes ({} excluded), token {}\n",
                "→".cyan(),
                plan.order.len(),
                plan.excluded.len(),
                plan.token.as_str().bold()
            );
        }

        let semaphore = Arc::new(Semaphore::new(settings.max_parallel.max(1)));
        let cancel = CancellationToken::new();
        let mut join_set: JoinSet<(Arc<str>, NodeOutcome)> = JoinSet::new();
        let mut pending: Vec<Arc<str>> = plan.order.clone();
        let mut created = Vec::new();
        let mut first_error: Option<PlanError> = None;
        let mut failed_node: Option<Arc<str>> = None;
        let total = plan.order.len();
        let mut done = 0usize;

        loop {
            if !cancel.is_cancelled() {
                let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|name| {
                    plan.graph
                        .get_dependencies(name)
                        .iter()
                        .all(|dep| self.is_resolved(dep))
                });
                pending = waiting;

                for name in ready {
                    let Some(node) = plan.node(&name).cloned() else {
                        continue;
                    };
                    self.env.event_log.emit(EventKind::NodeScheduled {
                        node: Arc::clone(&name),
                        dependencies: node.dependencies.clone(),
                    });

                    let env = self.env.clone();
                    let semaphore = Arc::clone(&semaphore);
                    let cancel = cancel.clone();
                    join_set.spawn(async move {
                        let permit = tokio::select! {
                            _ = cancel.cancelled() => None,
                            permit = semaphore.acquire_owned() => permit.ok(),
                        };
                        let outcome = match permit {
                            Some(_permit) if !cancel.is_cancelled() => {
                                match provision_node(&env, &node).await {
                                    Ok(created) => NodeOutcome::Resolved { created },
                                    Err(e) => NodeOutcome::Failed(e),
                                }
                            }
                            _ => NodeOutcome::NotStarted,
                        };
                        (Arc::clone(&node.name), outcome)
                    });
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok((name, NodeOutcome::Resolved { created: was_created })) => {
                    done += 1;
                    self.set_state(&name, NodeState::Resolved);
                    if was_created {
                        created.push(name.to_string());
                    }
                    if settings.progress {
                        println!("  {} [{}/{}] {}", "✓".green(), done, total, name);
                    }
                }
                Ok((name, NodeOutcome::Failed(err))) => {
                    done += 1;
                    self.set_state(&name, NodeState::Failed);
                    warn!(node = %name, error = %err, "node failed");
                    if settings.progress {
                        println!("  {} [{}/{}] {} {}", "✗".red(), done, total, name, err);
                    }

                    if settings.fail_fast {
                        cancel.cancel();
                    } else {
                        let dependents = plan.graph.transitive_dependents(&name);
                        pending.retain(|p| !dependents.contains(p));
                        for dependent in &dependents {
                            if self.node_state(dependent) == Some(NodeState::Pending) {
                                self.abandon(dependent, &format!("dependency '{}' failed", name));
                            }
                        }
                    }

                    if first_error.is_none() {
                        first_error = Some(err);
                        failed_node = Some(name);
                    }
                }
                Ok((name, NodeOutcome::NotStarted)) => {
                    self.abandon(&name, "apply cancelled after a failure");
                }
                Err(join_err) => {
                    cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(PlanError::Execution(join_err.to_string()));
                    }
                }
            }
        }

        if first_error.is_none() && !pending.is_empty() {
            first_error = Some(PlanError::Execution(
                "no node ready but plan not complete".to_string(),
            ));
        }

        // Anything never scheduled, or stuck mid-flight after a task panic
        let cause = match &failed_node {
            Some(node) => format!("dependency '{}' failed", node),
            None => "apply cancelled".to_string(),
        };
        for name in pending {
            self.abandon(&name, &cause);
        }
        for name in &plan.order {
            if self.node_state(name) == Some(NodeState::Resolving) {
                self.set_state(name, NodeState::Failed);
            }
        }

        if let Some(err) = first_error {
            self.env.event_log.emit(EventKind::ApplyFailed {
                error: err.to_string(),
                failed_node,
            });
            return Err(err);
        }

        let scope = EvalScope {
            params: &plan.params,
            token: &plan.token,
            store: &self.env.store,
        };
        let mut outputs = BTreeMap::new();
        for output in &plan.outputs {
            let mut value = resolve_str(&output.expression, &scope)
                .map_err(|e| attach_node(e, &format!("outputs.{}", output.name)))?;
            if output.exposes_secret {
                if let Some(secret) = SecretRef::from_value(&value) {
                    value = Value::String(self.read_secret(&secret).await?);
                }
            }
            outputs.insert(output.name.clone(), value);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        self.env.event_log.emit(EventKind::ApplyCompleted {
            outputs: Arc::new(redacted(&outputs, &plan)),
            total_duration_ms: duration_ms,
        });
        info!(duration_ms, created = created.len(), "Apply completed");

        let resources = self
            .env
            .resources
            .iter()
            .map(|e| (e.key().to_string(), e.value().clone()))
            .collect();

        Ok(ApplyReport {
            generation_id,
            token: plan.token.to_string(),
            states: self.states(),
            resources,
            created,
            outputs,
            duration_ms,
        })
    }

    /// Materialize a secret through the named plaintext exception
    async fn read_secret(&self, secret: &SecretRef) -> Result<String, PlanError> {
        self.env
            .control_plane
            .read_secret(secret)
            .await
            .map_err(|e| PlanError::Provisioning {
                node: secret.vault.clone(),
                message: e.message,
            })?
            .ok_or_else(|| PlanError::SecretNotFound {
                vault: secret.vault.clone(),
                secret: secret.secret.clone(),
            })
    }
}

/// Outputs for the event log: exposed secrets are never recorded
fn redacted(outputs: &BTreeMap<String, Value>, plan: &Plan) -> Value {
    let map = outputs
        .iter()
        .map(|(k, v)| {
            let exposed = plan.outputs.iter().any(|o| &o.name == k && o.exposes_secret);
            let v = if exposed {
                Value::String("<redacted>".to_string())
            } else {
                v.clone()
            };
            (k.clone(), v)
        })
        .collect();
    Value::Object(map)
}

/// Fill in the referencing node on errors raised by the binder
fn attach_node(err: PlanError, node: &str) -> PlanError {
    match err {
        PlanError::MissingOutput {
            node: n,
            reference,
            reason,
        } if n.is_empty() => PlanError::MissingOutput {
            node: node.to_string(),
            reference,
            reason,
        },
        other => other,
    }
}

/// Resolve, build, provision, publish one node. Returns whether the
/// resource was created (as opposed to updated in place).
async fn provision_node(env: &NodeEnv, node: &PlannedNode) -> Result<bool, PlanError> {
    let start = Instant::now();
    let name = &node.name;
    let plan = &env.plan;
    env.states.insert(Arc::clone(name), NodeState::Resolving);

    let result = async {
        let scope = EvalScope {
            params: &plan.params,
            token: &plan.token,
            store: &env.store,
        };
        let params = resolve_value(&node.def.params, &scope).map_err(|e| attach_node(e, name))?;

        let ctx = ModuleContext {
            node: name,
            scope_id: &plan.scope_id,
            token: &plan.token,
            tags: &node.tags,
        };
        let built = plan.registry.build(&node.def.module, &ctx, &params)?;

        env.event_log.emit(EventKind::NodeStarted {
            node: Arc::clone(name),
            resource_id: built.resource.id.clone(),
        });
        if env.settings.progress {
            println!("  {} {} {}", "[⟳]".yellow(), name, built.resource.kind.dimmed());
        }

        let request = ProvisionRequest {
            node: Arc::clone(name),
            resource: built.resource,
        };
        let receipt = env
            .control_plane
            .provision(&request)
            .await
            .map_err(|e| PlanError::Provisioning {
                node: name.to_string(),
                message: e.message,
            })?;

        let mut outputs = built.outputs;
        for (key, value) in receipt.attributes {
            outputs.entry(key).or_insert(OutputValue::Plain(value));
        }

        let spec = plan.registry.require(name, &node.def.module)?;
        if let Some(missing) = spec.outputs.iter().find(|o| !outputs.contains_key(o.name)) {
            return Err(PlanError::Provisioning {
                node: name.to_string(),
                message: format!("control plane did not report output '{}'", missing.name),
            });
        }

        if node.grants_permission {
            wait_consistent(env, name, &receipt.resource_id).await?;
        }

        let outputs_json = serde_json::to_value(&outputs).unwrap_or(Value::Null);
        env.store.insert(Arc::clone(name), outputs);
        env.resources.insert(Arc::clone(name), request.resource);

        env.event_log.emit(EventKind::NodeResolved {
            node: Arc::clone(name),
            outputs: Arc::new(outputs_json),
            duration_ms: start.elapsed().as_millis() as u64,
        });
        Ok(receipt.created)
    }
    .await;

    if let Err(e) = &result {
        env.event_log.emit(EventKind::NodeFailed {
            node: Arc::clone(name),
            error: e.to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        });
    }
    result
}

/// Poll until the grant is visible; only this wait repeats
async fn wait_consistent(env: &NodeEnv, name: &Arc<str>, resource_id: &str) -> Result<(), PlanError> {
    let max_attempts = env.settings.consistency_max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let consistent = env
            .control_plane
            .is_consistent(resource_id)
            .await
            .map_err(|e| PlanError::Provisioning {
                node: name.to_string(),
                message: e.message,
            })?;
        env.event_log.emit(EventKind::ConsistencyPolled {
            node: Arc::clone(name),
            attempt,
            consistent,
        });
        if consistent {
            debug!(node = %name, attempt, "grant consistent");
            return Ok(());
        }
        if attempt < max_attempts {
            tokio::time::sleep(env.settings.consistency_poll).await;
        }
    }
    Err(PlanError::Provisioning {
        node: name.to_string(),
        message: format!("permission grant not consistent after {} polls", max_attempts),
    })
}
