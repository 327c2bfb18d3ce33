//! Lifecycle orchestration.
//!
//! Each request moves through `Validating -> Dispatched -> Polling -> Resolved`.
//! Validation reads the guest's observed state and applies the
//! [`PreconditionPolicy`]; dispatch sends exactly one mutating call; polling hands
//! the returned UPID to the [`TaskTracker`] together with the operation's
//! post-condition.

pub mod agent;
pub mod create;
pub mod policy;
pub mod selector;
pub mod template;
pub mod types;

pub use policy::{PreconditionPolicy, RunningDelete, Verdict};
pub use types::{LifecycleOptions, LifecycleRequest, LifecycleResult, Operation, Outcome};

use crate::error::{LifecycleError, Result};
use crate::proxmox::{ProxmoxClient, ProxmoxError, ResourceKind, ResourceRef};
use crate::task::{PollBudget, Reconcile, TaskHandle, TaskState, TaskStatus, TaskTracker, TrackerError};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Clone)]
pub struct Orchestrator {
    client: ProxmoxClient,
    tracker: TaskTracker,
    policy: PreconditionPolicy,
    budget: PollBudget,
}

impl Orchestrator {
    pub fn new(
        client: ProxmoxClient,
        policy: PreconditionPolicy,
        budget: PollBudget,
        backoff_cap: u32,
    ) -> Self {
        let tracker = TaskTracker::new(client.clone(), backoff_cap);
        Self {
            client,
            tracker,
            policy,
            budget,
        }
    }

    pub fn client(&self) -> &ProxmoxClient {
        &self.client
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Default budget with per-request overrides applied.
    pub fn budget_for(&self, options: &LifecycleOptions) -> PollBudget {
        PollBudget {
            timeout: options.timeout.unwrap_or(self.budget.timeout),
            poll_interval: options.poll_interval.unwrap_or(self.budget.poll_interval),
        }
    }

    pub async fn next_vmid(&self) -> Result<i64> {
        self.client
            .next_vmid()
            .await
            .map_err(|e| LifecycleError::from(e).with_context("allocating a guest id"))
    }

    #[instrument(skip_all, fields(op = %req.operation, guest = %req.target))]
    pub async fn execute(&self, req: LifecycleRequest) -> Result<LifecycleResult> {
        let started = Instant::now();
        let budget = self.budget_for(&req.options);
        let op = req.operation;
        let target = &req.target;

        let observed = self
            .client
            .observe(target)
            .await
            .map_err(|e| LifecycleError::from(e).with_context("reading guest state").during(op, target))?;
        debug!(observed = ?observed, "Validating");

        match self.policy.evaluate(op, &observed, req.options.force) {
            Verdict::Proceed => {}
            Verdict::Missing => {
                return Err(LifecycleError::NotFound("guest does not exist".into()).during(op, target));
            }
            Verdict::Reject(message) => {
                return Err(LifecycleError::Precondition {
                    target: target.clone(),
                    operation: op,
                    message,
                });
            }
            Verdict::AlreadyDone(why) => {
                info!(reason = %why, "Nothing to do");
                return Ok(resolved(op, target, Outcome::Completed, None, why));
            }
            Verdict::Resume => {
                info!("Guest is paused, resuming");
                return self
                    .send_action(op, target, "resume", None, budget.remaining(started))
                    .await;
            }
            Verdict::StopFirst => {
                info!("Stopping guest before delete");
                let stop = self
                    .drive(Operation::Stop, target, None, budget.remaining(started))
                    .await?;
                if !stop.is_completed() {
                    return Ok(LifecycleResult {
                        operation: op,
                        detail: format!("stop before delete did not complete: {}", stop.detail),
                        ..stop
                    });
                }
            }
        }

        // One deadline per request, however many tasks it takes.
        let budget = budget.remaining(started);
        match op {
            Operation::Create => self.create(&req, budget).await,
            Operation::UpdateResources => self.update_resources(&req, budget).await,
            Operation::Delete => {
                let purge = req
                    .parameters
                    .get("purge")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let upid = self
                    .client
                    .delete_guest(target, purge)
                    .await
                    .map_err(|e| dispatch_error(e, op, target))?;
                self.resolve(op, target, upid, budget).await
            }
            _ => {
                let params = (!req.parameters.is_empty()).then(|| Value::Object(req.parameters.clone()));
                self.drive(op, target, params, budget).await
            }
        }
    }

    /// Run one request per target concurrently.
    pub async fn execute_many(
        &self,
        operation: Operation,
        targets: Vec<ResourceRef>,
        parameters: Map<String, Value>,
        options: LifecycleOptions,
    ) -> Vec<(ResourceRef, Result<LifecycleResult>)> {
        let runs = targets.into_iter().map(|target| {
            let req = LifecycleRequest::new(operation, target.clone())
                .with_parameters(parameters.clone())
                .with_options(options.clone());
            async move { (target, self.execute(req).await) }
        });
        join_all(runs).await
    }

    /// Poll an arbitrary task; there is no guest to reconcile against.
    pub async fn wait_for_task(&self, handle: &TaskHandle, budget: PollBudget) -> Result<TaskStatus> {
        self.tracker
            .await_completion(handle, budget, None)
            .await
            .map_err(|e| match e {
                TrackerError::PollTimeout { upid, .. } => LifecycleError::PollTimeout { upid },
                TrackerError::PollTransport { upid, source } => {
                    LifecycleError::from(source).with_context(&format!("while polling task {}", upid))
                }
            })
    }

    /// Dispatch a power action and follow its task.
    async fn drive(
        &self,
        op: Operation,
        target: &ResourceRef,
        params: Option<Value>,
        budget: PollBudget,
    ) -> Result<LifecycleResult> {
        let action = op.status_action(target.kind).ok_or_else(|| {
            LifecycleError::validation("operation", format!("'{}' is not a power action", op))
        })?;
        self.send_action(op, target, action, params, budget).await
    }

    async fn send_action(
        &self,
        op: Operation,
        target: &ResourceRef,
        action: &str,
        params: Option<Value>,
        budget: PollBudget,
    ) -> Result<LifecycleResult> {
        info!(action, "Dispatching");
        let upid = self
            .client
            .guest_action(target, action, params.as_ref())
            .await
            .map_err(|e| dispatch_error(e, op, target))?;
        self.resolve(op, target, upid, budget).await
    }

    async fn create(&self, req: &LifecycleRequest, budget: PollBudget) -> Result<LifecycleResult> {
        let target = &req.target;
        let params = &req.parameters;
        let requested = params.get("storage").and_then(Value::as_str);
        let storage = create::resolve_storage(&self.client, target, requested)
            .await
            .map_err(|e| e.during(Operation::Create, target))?;

        let config = match target.kind {
            ResourceKind::Vm => create::vm_config(target.vmid, &storage, params),
            ResourceKind::Container => create::container_config(target.vmid, &storage, params),
        };
        info!(storage = %storage, "Dispatching create");
        let upid = self
            .client
            .create_guest(&target.node, target.kind, &config)
            .await
            .map_err(|e| dispatch_error(e, Operation::Create, target))?;
        self.resolve(Operation::Create, target, upid, budget).await
    }

    async fn update_resources(
        &self,
        req: &LifecycleRequest,
        budget: PollBudget,
    ) -> Result<LifecycleResult> {
        let op = Operation::UpdateResources;
        let started = Instant::now();
        let target = &req.target;
        let params = &req.parameters;

        let mut config = Map::new();
        for key in ["cores", "memory", "swap"] {
            if let Some(v) = params.get(key).and_then(Value::as_i64) {
                config.insert(key.to_string(), json!(v));
            }
        }
        let grow = params
            .get("disk_gb")
            .and_then(Value::as_i64)
            .filter(|gb| *gb > 0);

        if config.is_empty() && grow.is_none() {
            return Ok(resolved(op, target, Outcome::Completed, None, "no changes requested".into()));
        }

        let mut changes: Vec<String> = config.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        if !config.is_empty() {
            info!(changes = ?changes, "Updating config");
            self.client
                .update_config(target, &Value::Object(config))
                .await
                .map_err(|e| dispatch_error(e, op, target))?;
        }

        let Some(gb) = grow else {
            return Ok(resolved(op, target, Outcome::Completed, None, changes.join(", ")));
        };

        let disk = params.get("disk").and_then(Value::as_str).unwrap_or(match target.kind {
            ResourceKind::Vm => "scsi0",
            ResourceKind::Container => "rootfs",
        });
        let size = format!("+{}G", gb);
        info!(disk, size = %size, "Resizing disk");
        let upid = self
            .client
            .resize_disk(target, disk, &size)
            .await
            .map_err(|e| {
                let err = dispatch_error(e, op, target);
                if changes.is_empty() {
                    err
                } else {
                    err.with_context(&format!("{} already applied, resizing {} failed", changes.join(", "), disk))
                }
            })?;
        changes.push(format!("{} {}", disk, size));

        let mut result = self
            .resolve(op, target, upid, budget.remaining(started))
            .await?;
        if result.is_completed() {
            result.detail = changes.join(", ");
        }
        Ok(result)
    }

    /// Resolve a dispatched call: synchronous calls complete at once, tasks are tracked.
    async fn resolve(
        &self,
        op: Operation,
        target: &ResourceRef,
        upid: Option<String>,
        budget: PollBudget,
    ) -> Result<LifecycleResult> {
        let Some(upid) = upid else {
            return Ok(resolved(op, target, Outcome::Completed, None, "completed synchronously".into()));
        };

        let handle = TaskHandle::new(upid, &target.node);
        let reconcile = op.post_condition().map(|expect| Reconcile {
            target: target.clone(),
            expect,
        });
        debug!(upid = %handle, "Polling");

        match self
            .tracker
            .await_completion(&handle, budget, reconcile.as_ref())
            .await
        {
            Ok(status) => {
                let detail = status.exit_message.clone().unwrap_or_else(|| "OK".into());
                let outcome = match status.state {
                    TaskState::Success => Outcome::Completed,
                    _ => Outcome::Failed,
                };
                if outcome == Outcome::Failed {
                    warn!(upid = %handle, detail = %detail, "Task failed");
                }
                Ok(resolved(op, target, outcome, Some(handle), detail))
            }
            Err(e @ TrackerError::PollTimeout { .. }) => {
                warn!(upid = %handle, "Gave up waiting for task");
                Ok(resolved(op, target, Outcome::TimedOut, Some(handle), e.to_string()))
            }
            Err(TrackerError::PollTransport { upid, source }) => Err(LifecycleError::from(source)
                .with_context(&format!("while polling task {}", upid))
                .during(op, target)),
        }
    }
}

fn resolved(
    operation: Operation,
    target: &ResourceRef,
    outcome: Outcome,
    task: Option<TaskHandle>,
    detail: String,
) -> LifecycleResult {
    LifecycleResult {
        outcome,
        operation,
        target: target.clone(),
        task,
        detail,
    }
}

/// The cluster holds a per-guest lock; a rejected mutating call is a conflict.
fn dispatch_error(err: ProxmoxError, operation: Operation, target: &ResourceRef) -> LifecycleError {
    if err.is_conflict() {
        let message = match err {
            ProxmoxError::Remote { message, .. } => message,
            other => other.to_string(),
        };
        LifecycleError::Conflict {
            target: target.clone(),
            operation,
            message,
        }
    } else {
        LifecycleError::from(err).during(operation, target)
    }
}
