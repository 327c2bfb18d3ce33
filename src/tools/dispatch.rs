use super::{find, schema, Action, Handler, Query};
use crate::error::{LifecycleError, Result};
use crate::lifecycle::{
    selector, LifecycleOptions, LifecycleRequest, LifecycleResult, Operation, Orchestrator, Outcome,
};
use crate::proxmox::{ObservedState, ResourceKind, ResourceRef};
use crate::task::{TaskHandle, TaskState, TaskStatus, MAX_POLL_INTERVAL, MAX_TIMEOUT};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Arguments that address or bound a call and are never forwarded to the API.
const CONTROL_ARGS: &[&str] = &[
    "node",
    "vmid",
    "selector",
    "timeout",
    "poll_interval_ms",
    "force",
    "graceful",
    "shutdown_timeout",
];

const DEFAULT_SHUTDOWN_TIMEOUT: i64 = 10;

#[derive(Serialize, Debug, Clone)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    /// The lifecycle result or task status behind a failed or timed-out call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// `{ok, payload | error}` as returned to tool callers.
#[derive(Serialize, Debug, Clone)]
pub struct ToolOutput {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ToolOutput {
    pub fn success(payload: Value) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(err: &LifecycleError) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
                field: err.field().map(str::to_string),
                resource: err.target().cloned(),
                operation: err.operation(),
                result: None,
            }),
        }
    }

    pub fn from_result(res: &LifecycleResult) -> Self {
        let kind = match res.outcome {
            Outcome::Completed => return Self::success(json!(res)),
            Outcome::Failed => "RemoteError",
            Outcome::TimedOut => "PollTimeout",
        };
        let message = match res.outcome {
            Outcome::TimedOut => format!("Gave up waiting to {} {}: {}", res.operation, res.target, res.detail),
            _ => format!("Failed to {} {}: {}", res.operation, res.target, res.detail),
        };
        Self {
            ok: false,
            payload: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message,
                field: None,
                resource: Some(res.target.clone()),
                operation: Some(res.operation),
                result: Some(json!(res)),
            }),
        }
    }

    /// A tracked task that ran to completion but reported failure.
    fn task_failed(handle: &TaskHandle, status: &TaskStatus, result: Value) -> Self {
        Self {
            ok: false,
            payload: None,
            error: Some(ErrorBody {
                kind: "RemoteError".into(),
                message: format!(
                    "Task {} failed: {}",
                    handle,
                    status.exit_message.as_deref().unwrap_or("unknown error")
                ),
                field: None,
                resource: None,
                operation: None,
                result: Some(result),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        json!(self)
    }
}

fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    str_arg(args, key).ok_or_else(|| LifecycleError::validation(key, "missing required argument"))
}

fn bool_arg(args: &Map<String, Value>, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// An optional count in `1..=max`.
fn bounded(args: &Map<String, Value>, key: &str, max: u64) -> Result<Option<u64>> {
    match args.get(key).and_then(Value::as_i64) {
        None => Ok(None),
        Some(n) if n > 0 && n as u64 <= max => Ok(Some(n as u64)),
        Some(_) => Err(LifecycleError::validation(
            key,
            format!("must be between 1 and {}", max),
        )),
    }
}

fn options(args: &Map<String, Value>) -> Result<LifecycleOptions> {
    Ok(LifecycleOptions {
        force: bool_arg(args, "force", false),
        timeout: bounded(args, "timeout", MAX_TIMEOUT.as_secs())?.map(Duration::from_secs),
        poll_interval: bounded(args, "poll_interval_ms", MAX_POLL_INTERVAL.as_millis() as u64)?
            .map(Duration::from_millis),
    })
}

fn vmid_arg(args: &Map<String, Value>) -> Result<Option<i64>> {
    match args.get("vmid").and_then(Value::as_i64) {
        Some(id) if id < 100 => Err(LifecycleError::validation("vmid", "guest IDs start at 100")),
        other => Ok(other),
    }
}

/// Drop addressing and budget arguments; what is left shapes the API call.
fn api_parameters(mut args: Map<String, Value>) -> Map<String, Value> {
    for key in CONTROL_ARGS {
        args.remove(*key);
    }
    args
}

fn task_handle(args: &Map<String, Value>) -> Result<TaskHandle> {
    let upid = required_str(args, "upid")?;
    let handle = TaskHandle::new(upid, str_arg(args, "node").unwrap_or_default());
    if handle.node().is_empty() {
        return Err(LifecycleError::validation(
            "node",
            "the UPID does not name a node; pass node explicitly",
        ));
    }
    Ok(handle)
}

#[derive(Clone)]
pub struct Dispatcher {
    orchestrator: Orchestrator,
}

impl Dispatcher {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Validate, run and serialize one tool call. Never fails; errors become `ok: false`.
    pub async fn call(&self, name: &str, args: &Value) -> ToolOutput {
        let call_id = Uuid::new_v4();
        let span = info_span!("tool", tool = name, %call_id);
        async {
            let output = match self.run(name, args).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(kind = e.kind(), error = %e, "Tool call failed");
                    ToolOutput::failure(&e)
                }
            };
            info!(ok = output.ok, "Tool call finished");
            output
        }
        .instrument(span)
        .await
    }

    async fn run(&self, name: &str, args: &Value) -> Result<ToolOutput> {
        let spec = find(name)
            .ok_or_else(|| LifecycleError::validation("name", format!("unknown tool '{}'", name)))?;
        let args = schema::validate(spec.args, args)?;

        match spec.handler {
            Handler::Lifecycle(kind, op) => self.lifecycle(kind, op, args).await,
            Handler::Selector(op) => self.containers(op, args).await,
            Handler::Query(q) => self.query(q, args).await,
            Handler::Action(a) => self.action(a, args).await,
        }
    }

    async fn lifecycle(
        &self,
        kind: ResourceKind,
        op: Operation,
        args: Map<String, Value>,
    ) -> Result<ToolOutput> {
        let node = required_str(&args, "node")?.to_string();
        let options = options(&args)?;
        let vmid = match vmid_arg(&args)? {
            Some(id) => id,
            None if op == Operation::Create => self.orchestrator.next_vmid().await?,
            None => return Err(LifecycleError::validation("vmid", "missing required argument")),
        };

        let req = LifecycleRequest::new(op, ResourceRef::new(node, kind, vmid))
            .with_parameters(api_parameters(args))
            .with_options(options);
        let res = self.orchestrator.execute(req).await?;
        Ok(ToolOutput::from_result(&res))
    }

    /// Container control by `node`+`vmid` or by selector.
    async fn containers(&self, op: Operation, args: Map<String, Value>) -> Result<ToolOutput> {
        let options = options(&args)?;
        let (op, parameters) = if op == Operation::Stop && bool_arg(&args, "graceful", true) {
            let wait = bounded(&args, "shutdown_timeout", MAX_TIMEOUT.as_secs())?
                .map(|s| s as i64)
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
            let mut p = Map::new();
            p.insert("timeout".into(), json!(wait));
            (Operation::Shutdown, p)
        } else {
            (op, api_parameters(args.clone()))
        };

        let targets = match (str_arg(&args, "selector"), str_arg(&args, "node"), vmid_arg(&args)?) {
            (Some(sel), _, _) => selector::resolve(self.orchestrator.client(), sel).await?,
            (None, Some(node), Some(vmid)) => {
                let req = LifecycleRequest::new(op, ResourceRef::new(node, ResourceKind::Container, vmid))
                    .with_parameters(parameters)
                    .with_options(options);
                let res = self.orchestrator.execute(req).await?;
                return Ok(ToolOutput::from_result(&res));
            }
            _ => {
                return Err(LifecycleError::validation(
                    "selector",
                    "provide a selector, or both node and vmid",
                ))
            }
        };

        info!(op = %op, targets = targets.len(), "Running on selected containers");
        let results = self
            .orchestrator
            .execute_many(op, targets, parameters, options)
            .await;

        let total = results.len();
        let mut first_failure: Option<String> = None;
        let entries: Vec<Value> = results
            .iter()
            .map(|(target, r)| {
                let out = match r {
                    Ok(res) => ToolOutput::from_result(res),
                    Err(e) => ToolOutput::failure(e),
                };
                if first_failure.is_none() {
                    first_failure = out.error.as_ref().map(|err| err.kind.clone());
                }
                let mut entry = out.to_value();
                entry["target"] = json!(target);
                entry
            })
            .collect();
        let failed = entries.iter().filter(|e| e["ok"] != json!(true)).count();
        let payload = json!({ "results": entries });

        match first_failure {
            None => Ok(ToolOutput::success(payload)),
            Some(kind) => Ok(ToolOutput {
                ok: false,
                payload: Some(payload),
                error: Some(ErrorBody {
                    kind,
                    message: format!("{} of {} targets did not complete", failed, total),
                    field: None,
                    resource: None,
                    operation: Some(op),
                    result: None,
                }),
            }),
        }
    }

    async fn query(&self, query: Query, args: Map<String, Value>) -> Result<ToolOutput> {
        let client = self.orchestrator.client();
        let payload = match query {
            Query::ListVms => json!(client.get_guests(ResourceKind::Vm, str_arg(&args, "node")).await?),
            Query::ListContainers => json!(
                client
                    .get_guests(ResourceKind::Container, str_arg(&args, "node"))
                    .await?
            ),
            Query::GetVm => {
                let vmid = vmid_arg(&args)?
                    .ok_or_else(|| LifecycleError::validation("vmid", "missing required argument"))?;
                let target = ResourceRef::new(required_str(&args, "node")?, ResourceKind::Vm, vmid);
                let state = client.observe(&target).await?;
                if state == ObservedState::Absent {
                    return Err(LifecycleError::NotFound(format!("{} does not exist", target)));
                }
                let config = client.guest_config(&target).await?;
                json!({ "target": target, "state": state, "config": config })
            }
            Query::ListNodes => json!(client.get_nodes().await?),
            Query::NodeStatus => json!(client.get_node_status(required_str(&args, "node")?).await?),
            Query::ListStorage => match str_arg(&args, "node") {
                Some(node) => json!(client.get_storage_list(node).await?),
                None => json!(client.get_cluster_storage().await?),
            },
            Query::ClusterStatus => json!(client.get_cluster_status().await?),
            Query::ListTemplates => {
                let node = required_str(&args, "node")?;
                let storage = str_arg(&args, "storage").unwrap_or("local");
                let content = str_arg(&args, "content").unwrap_or("vztmpl");
                json!(client.get_storage_content(node, storage, Some(content)).await?)
            }
            Query::TaskStatus => {
                let handle = task_handle(&args)?;
                let status = self.orchestrator.tracker().status(&handle).await?;
                json!({ "upid": handle, "node": handle.node(), "status": status })
            }
            Query::WaitForTask => {
                let handle = task_handle(&args)?;
                let budget = self.orchestrator.budget_for(&options(&args)?);
                let status = self.orchestrator.wait_for_task(&handle, budget).await?;
                let payload = json!({ "upid": handle, "node": handle.node(), "status": status });
                if status.state == TaskState::Failure {
                    return Ok(ToolOutput::task_failed(&handle, &status, payload));
                }
                payload
            }
            Query::AvailableTemplates => json!(client.available_templates(required_str(&args, "node")?).await?),
        };
        Ok(ToolOutput::success(payload))
    }

    /// Tools that act on a node or guest outside the power lifecycle.
    async fn action(&self, action: Action, args: Map<String, Value>) -> Result<ToolOutput> {
        let node = required_str(&args, "node")?;
        let budget = self.orchestrator.budget_for(&options(&args)?);
        match action {
            Action::DownloadTemplate => {
                let storage = str_arg(&args, "storage").unwrap_or("local");
                let template = required_str(&args, "template")?;
                let download = self
                    .orchestrator
                    .download_template(node, storage, template, budget)
                    .await?;
                if let (Some(handle), Some(status)) = (&download.task, &download.status) {
                    if status.state == TaskState::Failure {
                        return Ok(ToolOutput::task_failed(handle, status, json!(download)));
                    }
                }
                Ok(ToolOutput::success(json!(download)))
            }
            Action::ExecCommand => {
                let vmid = vmid_arg(&args)?
                    .ok_or_else(|| LifecycleError::validation("vmid", "missing required argument"))?;
                let target = ResourceRef::new(node, ResourceKind::Vm, vmid);
                let output = self
                    .orchestrator
                    .run_command(
                        &target,
                        required_str(&args, "command")?,
                        str_arg(&args, "input_data"),
                        budget,
                    )
                    .await?;
                Ok(ToolOutput::success(json!(output)))
            }
        }
    }
}
