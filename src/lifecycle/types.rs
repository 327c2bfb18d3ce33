use crate::proxmox::{ResourceKind, ResourceRef};
use crate::task::{PostCondition, TaskHandle};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Start,
    Stop,
    Shutdown,
    Reset,
    Restart,
    Delete,
    UpdateResources,
    /// Run a command through the guest agent.
    Exec,
}

impl Operation {
    /// Path segment under `.../status/` for power operations.
    pub fn status_action(self, kind: ResourceKind) -> Option<&'static str> {
        match (self, kind) {
            (Operation::Start, _) => Some("start"),
            (Operation::Stop, _) => Some("stop"),
            (Operation::Shutdown, _) => Some("shutdown"),
            (Operation::Reset, ResourceKind::Vm) => Some("reset"),
            (Operation::Reset, ResourceKind::Container) | (Operation::Restart, _) => Some("reboot"),
            _ => None,
        }
    }

    pub fn post_condition(self) -> Option<PostCondition> {
        match self {
            Operation::Create => Some(PostCondition::Present),
            Operation::Start | Operation::Reset | Operation::Restart => Some(PostCondition::Running),
            Operation::Stop | Operation::Shutdown => Some(PostCondition::Stopped),
            Operation::Delete => Some(PostCondition::Absent),
            Operation::UpdateResources | Operation::Exec => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Shutdown => "shutdown",
            Operation::Reset => "reset",
            Operation::Restart => "restart",
            Operation::Delete => "delete",
            Operation::UpdateResources => "update resources of",
            Operation::Exec => "run a command in",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleOptions {
    pub force: bool,
    pub timeout: Option<Duration>,
    pub poll_interval: Option<Duration>,
}

/// One requested transition; built per tool call and consumed by the orchestrator.
#[derive(Debug, Clone)]
pub struct LifecycleRequest {
    pub operation: Operation,
    pub target: ResourceRef,
    /// Option name to value, forwarded to the API after operation-specific shaping.
    pub parameters: Map<String, Value>,
    pub options: LifecycleOptions,
}

impl LifecycleRequest {
    pub fn new(operation: Operation, target: ResourceRef) -> Self {
        Self {
            operation,
            target,
            parameters: Map::new(),
            options: LifecycleOptions::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_options(mut self, options: LifecycleOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Serialize, Debug, Clone)]
pub struct LifecycleResult {
    pub outcome: Outcome,
    pub operation: Operation,
    pub target: ResourceRef,
    pub task: Option<TaskHandle>,
    pub detail: String,
}

impl LifecycleResult {
    pub fn is_completed(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}
