//! Task tracking for asynchronous cluster operations.
//!
//! Mutating calls return a UPID immediately and finish later on the target node.
//! [`TaskTracker::await_completion`] polls the task until it reaches a terminal state,
//! backs off on transient transport failures, and gives up with
//! [`TrackerError::PollTimeout`] once the caller's budget is spent. When the node
//! forgets the task before we saw it finish, the tracker checks the guest itself
//! against the operation's expected post-condition.

use crate::proxmox::cluster::RawTaskStatus;
use crate::proxmox::{ObservedState, PowerState, ProxmoxClient, ProxmoxError, ResourceRef};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Time a single status request is allowed even when the budget is nearly spent.
/// The request issued at the deadline may therefore finish up to this much later.
const REQUEST_FLOOR: Duration = Duration::from_secs(2);

/// Longest wait a caller may ask for.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest pause between two status checks.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// A cluster task id (`UPID:<node>:<pid>:<pstart>:<starttime>:<type>:<id>:<user>:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    upid: String,
    node: String,
}

impl TaskHandle {
    /// The node is taken from the UPID when present; `fallback_node` covers
    /// handles that do not follow the UPID layout.
    pub fn new(upid: impl Into<String>, fallback_node: &str) -> Self {
        let upid = upid.into();
        let node = Self::node_of(&upid).unwrap_or(fallback_node).to_string();
        Self { upid, node }
    }

    fn node_of(upid: &str) -> Option<&str> {
        let mut parts = upid.split(':');
        match (parts.next(), parts.next()) {
            (Some("UPID"), Some(node)) if !node.is_empty() => Some(node),
            _ => None,
        }
    }

    pub fn upid(&self) -> &str {
        &self.upid
    }

    pub fn node(&self) -> &str {
        &self.node
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.upid)
    }
}

impl Serialize for TaskHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.upid)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Success,
    Failure,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub exit_message: Option<String>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl TaskStatus {
    pub fn from_raw(raw: &RawTaskStatus) -> Self {
        let state = match raw.status.as_str() {
            "stopped" => match raw.exitstatus.as_deref() {
                Some("OK") => TaskState::Success,
                Some(s) if s.starts_with("WARNINGS") => TaskState::Success,
                _ => TaskState::Failure,
            },
            _ => TaskState::Running,
        };
        let finished_at = (state != TaskState::Running).then(epoch_secs);
        Self {
            state,
            exit_message: raw.exitstatus.clone(),
            started_at: raw.starttime,
            finished_at,
        }
    }

    fn lost(state: TaskState, detail: impl Into<String>) -> Self {
        Self {
            state,
            exit_message: Some(detail.into()),
            started_at: None,
            finished_at: Some(epoch_secs()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state != TaskState::Running
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// The state a guest is in once an operation has taken effect.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostCondition {
    Running,
    Stopped,
    Present,
    Absent,
}

impl PostCondition {
    pub fn holds(self, observed: &ObservedState) -> bool {
        match (self, observed) {
            (PostCondition::Absent, ObservedState::Absent) => true,
            (PostCondition::Present, ObservedState::Present { .. }) => true,
            (PostCondition::Running, ObservedState::Present { status, .. }) => {
                *status == PowerState::Running
            }
            (PostCondition::Stopped, ObservedState::Present { status, .. }) => {
                *status == PowerState::Stopped
            }
            _ => false,
        }
    }
}

/// Guest to re-check if the task disappears mid-poll.
#[derive(Debug, Clone)]
pub struct Reconcile {
    pub target: ResourceRef,
    pub expect: PostCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl PollBudget {
    /// What is left of this budget for work that began at `started`.
    pub fn remaining(self, started: Instant) -> Self {
        Self {
            timeout: self.timeout.saturating_sub(started.elapsed()),
            ..self
        }
    }
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Timed out after {}s waiting for task {upid}; final state unknown", .elapsed.as_secs())]
    PollTimeout { upid: String, elapsed: Duration },

    #[error("Polling task {upid} failed: {source}")]
    PollTransport {
        upid: String,
        #[source]
        source: ProxmoxError,
    },
}

#[derive(Clone)]
pub struct TaskTracker {
    client: ProxmoxClient,
    backoff_cap: u32,
}

impl TaskTracker {
    /// `backoff_cap` bounds the retry delay at that multiple of the poll interval.
    pub fn new(client: ProxmoxClient, backoff_cap: u32) -> Self {
        Self {
            client,
            backoff_cap: backoff_cap.max(1),
        }
    }

    /// One status snapshot, without waiting.
    pub async fn status(&self, handle: &TaskHandle) -> Result<TaskStatus, ProxmoxError> {
        let raw = self
            .client
            .get_task_status(handle.node(), handle.upid())
            .await?;
        Ok(TaskStatus::from_raw(&raw))
    }

    pub async fn await_completion(
        &self,
        handle: &TaskHandle,
        budget: PollBudget,
        reconcile: Option<&Reconcile>,
    ) -> Result<TaskStatus, TrackerError> {
        let started = Instant::now();
        let deadline = started + budget.timeout.min(MAX_TIMEOUT);
        let interval = budget.poll_interval.min(MAX_POLL_INTERVAL);
        let cap = interval.saturating_mul(self.backoff_cap);
        let mut delay = interval;
        let mut polls = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let bound = remaining.max(REQUEST_FLOOR);
            polls += 1;

            let poll = tokio::time::timeout(
                bound,
                self.client.get_task_status(handle.node(), handle.upid()),
            )
            .await;

            match poll {
                Ok(Ok(raw)) => {
                    let status = TaskStatus::from_raw(&raw);
                    if status.is_terminal() {
                        info!(
                            upid = %handle,
                            state = ?status.state,
                            exit = status.exit_message.as_deref().unwrap_or(""),
                            polls,
                            "Task finished"
                        );
                        return Ok(status);
                    }
                    debug!(upid = %handle, polls, "Task still running");
                    delay = interval;
                }
                Ok(Err(e)) if e.is_not_found() => {
                    warn!(upid = %handle, error = %e, "Task handle no longer known to the node");
                    return Ok(self.reconcile(reconcile).await);
                }
                Ok(Err(e)) if e.is_transient() => {
                    delay = delay.saturating_mul(2).min(cap);
                    warn!(
                        upid = %handle,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Task status poll failed, backing off"
                    );
                }
                Ok(Err(e)) => {
                    return Err(TrackerError::PollTransport {
                        upid: handle.upid().to_string(),
                        source: e,
                    });
                }
                Err(_) => {
                    warn!(upid = %handle, "Task status request outlived the poll budget");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TrackerError::PollTimeout {
                    upid: handle.upid().to_string(),
                    elapsed: now - started,
                });
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }

    /// The node forgot the task; decide from the guest itself.
    async fn reconcile(&self, reconcile: Option<&Reconcile>) -> TaskStatus {
        let Some(rec) = reconcile else {
            return TaskStatus::lost(TaskState::Failure, "task lost");
        };

        match self.client.observe(&rec.target).await {
            Ok(observed) if rec.expect.holds(&observed) => {
                info!(guest = %rec.target, expect = ?rec.expect, "Lost task confirmed by guest state");
                TaskStatus::lost(TaskState::Success, "task lost; post-condition confirmed")
            }
            Ok(observed) => {
                warn!(
                    guest = %rec.target,
                    expect = ?rec.expect,
                    observed = ?observed,
                    "Lost task not confirmed by guest state"
                );
                TaskStatus::lost(TaskState::Failure, "task lost")
            }
            Err(e) => {
                warn!(guest = %rec.target, error = %e, "State check after lost task failed");
                TaskStatus::lost(TaskState::Failure, format!("task lost; state check failed: {}", e))
            }
        }
    }
}
