//! Commands run inside a VM through the QEMU guest agent.
//!
//! The agent answers `exec` with a pid rather than a UPID, so the orchestrator
//! polls `exec-status` itself under the same budget rules as the task tracker.

use super::{dispatch_error, Operation, Orchestrator, Verdict};
use crate::error::{LifecycleError, Result};
use crate::proxmox::agent::ExecStatus;
use crate::proxmox::ResourceRef;
use crate::task::{PollBudget, MAX_POLL_INTERVAL, MAX_TIMEOUT};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i64>,
    pub output: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl From<ExecStatus> for CommandOutput {
    fn from(status: ExecStatus) -> Self {
        Self {
            success: status.exitcode == Some(0),
            exit_code: status.exitcode,
            output: status.out_data.unwrap_or_default(),
            stderr: status.err_data.unwrap_or_default(),
            truncated: status.out_truncated,
        }
    }
}

impl Orchestrator {
    /// Run `command` (split on whitespace, no shell) and wait for it to exit.
    #[instrument(skip_all, fields(guest = %target))]
    pub async fn run_command(
        &self,
        target: &ResourceRef,
        command: &str,
        input_data: Option<&str>,
        budget: PollBudget,
    ) -> Result<CommandOutput> {
        let op = Operation::Exec;
        let started = Instant::now();
        let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            return Err(LifecycleError::validation("command", "must not be empty"));
        }

        let observed = self
            .client
            .observe(target)
            .await
            .map_err(|e| LifecycleError::from(e).with_context("reading guest state").during(op, target))?;
        match self.policy.evaluate(op, &observed, false) {
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
            _ => {}
        }

        let pid = self
            .client
            .agent_exec(target, &argv, input_data)
            .await
            .map_err(|e| dispatch_error(e, op, target))?;
        info!(pid, program = %argv[0], "Command started");

        let deadline = started + budget.timeout.min(MAX_TIMEOUT);
        let interval = budget.poll_interval.min(MAX_POLL_INTERVAL);
        loop {
            let status = self
                .client
                .agent_exec_status(target, pid)
                .await
                .map_err(|e| {
                    LifecycleError::from(e)
                        .with_context(&format!("reading status of pid {}", pid))
                        .during(op, target)
                })?;
            if status.exited {
                debug!(pid, exit_code = ?status.exitcode, "Command exited");
                return Ok(status.into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::PollTimeout {
                    upid: format!("agent pid {} in {}", pid, target),
                });
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PreconditionPolicy;
    use crate::proxmox::mock::{MockTransport, Reply};
    use crate::proxmox::{ProxmoxClient, ResourceKind};
    use reqwest::Method;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const VM: &str = "nodes/node1/qemu/101";

    fn orchestrator(mock: Arc<MockTransport>) -> Orchestrator {
        let budget = PollBudget {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        };
        Orchestrator::new(ProxmoxClient::new(mock), PreconditionPolicy::default(), budget, 4)
    }

    fn vm101() -> ResourceRef {
        ResourceRef::new("node1", ResourceKind::Vm, 101)
    }

    fn budget(timeout: u64) -> PollBudget {
        PollBudget {
            timeout: Duration::from_secs(timeout),
            poll_interval: Duration::from_secs(1),
        }
    }

    fn guest(status: &str) -> Reply {
        Reply::Data(json!({ "status": status, "qmpstatus": status }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_output_is_collected() {
        let mock = Arc::new(
            MockTransport::new()
                .on(Method::GET, &format!("{}/status/current", VM), vec![guest("running")])
                .on(Method::POST, &format!("{}/agent/exec", VM), vec![Reply::Data(json!({ "pid": 42 }))])
                .on(
                    Method::GET,
                    &format!("{}/agent/exec-status", VM),
                    vec![
                        Reply::Data(json!({ "exited": 0 })),
                        Reply::Data(json!({ "exited": 1, "exitcode": 0, "out-data": "up 3 days\n" })),
                    ],
                ),
        );
        let o = orchestrator(mock.clone());

        let out = o.run_command(&vm101(), "uptime -p", None, budget(30)).await.unwrap();

        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.output, "up 3 days\n");
        assert_eq!(mock.count(Method::GET, &format!("{}/agent/exec-status", VM)), 2);
        assert_eq!(mock.mutating_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_is_not_success() {
        let mock = Arc::new(
            MockTransport::new()
                .on(Method::GET, &format!("{}/status/current", VM), vec![guest("running")])
                .on(Method::POST, &format!("{}/agent/exec", VM), vec![Reply::Data(json!({ "pid": 7 }))])
                .on(
                    Method::GET,
                    &format!("{}/agent/exec-status", VM),
                    vec![Reply::Data(json!({ "exited": true, "exitcode": 2, "err-data": "no such file\n" }))],
                ),
        );
        let o = orchestrator(mock);

        let out = o.run_command(&vm101(), "cat /missing", None, budget(30)).await.unwrap();

        assert!(!out.success);
        assert_eq!(out.exit_code, Some(2));
        assert_eq!(out.stderr, "no such file\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_vm_is_rejected_without_exec() {
        let mock = Arc::new(MockTransport::new().on(
            Method::GET,
            &format!("{}/status/current", VM),
            vec![guest("stopped")],
        ));
        let o = orchestrator(mock.clone());

        let err = o.run_command(&vm101(), "hostname", None, budget(30)).await.unwrap_err();

        assert_eq!(err.kind(), "PreconditionError");
        assert_eq!(mock.mutating_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_command_is_invalid() {
        let mock = Arc::new(MockTransport::new());
        let o = orchestrator(mock.clone());

        let err = o.run_command(&vm101(), "   ", None, budget(30)).await.unwrap_err();

        assert_eq!(err.kind(), "ValidationError");
        assert_eq!(err.field(), Some("command"));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_that_never_exits_times_out() {
        let mock = Arc::new(
            MockTransport::new()
                .on(Method::GET, &format!("{}/status/current", VM), vec![guest("running")])
                .on(Method::POST, &format!("{}/agent/exec", VM), vec![Reply::Data(json!({ "pid": 9 }))])
                .on(Method::GET, &format!("{}/agent/exec-status", VM), vec![Reply::Data(json!({ "exited": 0 }))]),
        );
        let o = orchestrator(mock);
        let started = Instant::now();

        let err = o.run_command(&vm101(), "sleep 600", None, budget(5)).await.unwrap_err();

        assert_eq!(err.kind(), "PollTimeout");
        assert!(started.elapsed() <= Duration::from_secs(5));
    }
}
