use crate::proxmox::error::{ProxmoxError, Result};
use crate::proxmox::transport::Transport;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Guest flavour; selects the `qemu` or `lxc` branch of the API.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Vm,
    Container,
}

impl ResourceKind {
    pub fn api_segment(self) -> &'static str {
        match self {
            ResourceKind::Vm => "qemu",
            ResourceKind::Container => "lxc",
        }
    }

    pub fn from_api_segment(segment: &str) -> Option<Self> {
        match segment {
            "qemu" => Some(ResourceKind::Vm),
            "lxc" => Some(ResourceKind::Container),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Vm => "VM",
            ResourceKind::Container => "CT",
        }
    }
}

/// Identifies one guest on one node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub node: String,
    pub kind: ResourceKind,
    pub vmid: i64,
}

impl ResourceRef {
    pub fn new(node: impl Into<String>, kind: ResourceKind, vmid: i64) -> Self {
        Self {
            node: node.into(),
            kind,
            vmid,
        }
    }

    pub(crate) fn path(&self) -> String {
        format!("nodes/{}/{}/{}", self.node, self.kind.api_segment(), self.vmid)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} on {}", self.kind.label(), self.vmid, self.node)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl PowerState {
    fn parse(status: &str, qmpstatus: Option<&str>) -> Self {
        match (status, qmpstatus) {
            (_, Some("paused")) | (_, Some("suspended")) => PowerState::Paused,
            ("running", _) => PowerState::Running,
            ("stopped", _) => PowerState::Stopped,
            _ => PowerState::Unknown,
        }
    }
}

/// What the cluster currently reports for a guest.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "presence", rename_all = "lowercase")]
pub enum ObservedState {
    Absent,
    Present {
        status: PowerState,
        name: Option<String>,
    },
}

#[derive(Deserialize, Debug)]
struct GuestCurrent {
    status: String,
    name: Option<String>,
    qmpstatus: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterResource {
    pub id: Option<String>,
    #[serde(default)]
    pub vmid: Option<i64>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(rename = "type")]
    pub res_type: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClusterResource {
    pub fn kind(&self) -> Option<ResourceKind> {
        ResourceKind::from_api_segment(&self.res_type)
    }

    /// Guest entries only; nodes and storages yield `None`.
    pub fn resource_ref(&self) -> Option<ResourceRef> {
        match (self.kind(), &self.node, self.vmid) {
            (Some(kind), Some(node), Some(vmid)) => Some(ResourceRef::new(node.clone(), kind, vmid)),
            _ => None,
        }
    }
}

/// Typed endpoint helpers over a shared [`Transport`].
#[derive(Clone)]
pub struct ProxmoxClient {
    transport: Arc<dyn Transport>,
}

impl ProxmoxClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub(crate) async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let v = self.transport.invoke(method, path, body).await?;
        serde_json::from_value(v).map_err(ProxmoxError::Json)
    }

    /// Current observed state of a guest; a missing guest is `Absent`, not an error.
    pub async fn observe(&self, target: &ResourceRef) -> Result<ObservedState> {
        let path = format!("{}/status/current", target.path());
        match self.request::<GuestCurrent>(Method::GET, &path, None).await {
            Ok(current) => Ok(ObservedState::Present {
                status: PowerState::parse(&current.status, current.qmpstatus.as_deref()),
                name: current.name,
            }),
            Err(e) if e.is_not_found() => Ok(ObservedState::Absent),
            Err(e) => Err(e),
        }
    }
}

/// Mutating endpoints answer with a UPID string, or `null` when they ran synchronously.
pub(crate) fn task_id(v: Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_ref_path_and_display() {
        let r = ResourceRef::new("pve1", ResourceKind::Container, 200);
        assert_eq!(r.path(), "nodes/pve1/lxc/200");
        assert_eq!(r.to_string(), "CT 200 on pve1");
    }

    #[test]
    fn test_power_state_parse() {
        assert_eq!(PowerState::parse("running", None), PowerState::Running);
        assert_eq!(PowerState::parse("running", Some("paused")), PowerState::Paused);
        assert_eq!(PowerState::parse("stopped", None), PowerState::Stopped);
        assert_eq!(PowerState::parse("weird", None), PowerState::Unknown);
    }

    #[test]
    fn test_cluster_resource_ref() {
        let guest: ClusterResource = serde_json::from_value(json!({
            "id": "lxc/200", "vmid": 200, "node": "pve1", "type": "lxc",
            "status": "running", "name": "web", "maxmem": 536870912
        }))
        .unwrap();
        assert_eq!(
            guest.resource_ref(),
            Some(ResourceRef::new("pve1", ResourceKind::Container, 200))
        );
        assert_eq!(guest.extra["maxmem"], 536870912);

        let storage: ClusterResource = serde_json::from_value(json!({
            "id": "storage/pve1/local", "node": "pve1", "type": "storage", "status": "available"
        }))
        .unwrap();
        assert_eq!(storage.resource_ref(), None);
    }

    #[test]
    fn test_task_id() {
        assert_eq!(task_id(json!("UPID:pve1:1")), Some("UPID:pve1:1".to_string()));
        assert_eq!(task_id(Value::Null), None);
    }
}
