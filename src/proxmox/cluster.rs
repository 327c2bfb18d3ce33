use super::client::{ClusterResource, ProxmoxClient, ResourceKind};
use super::error::{ProxmoxError, Result};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

/// Raw `nodes/{node}/tasks/{upid}/status` payload.
#[derive(Deserialize, Debug, Clone)]
pub struct RawTaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
    #[serde(default)]
    pub starttime: Option<u64>,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
}

impl ProxmoxClient {
    pub async fn get_nodes(&self) -> Result<Vec<Value>> {
        self.request(Method::GET, "nodes", None).await
    }

    pub async fn get_node_status(&self, node: &str) -> Result<Value> {
        let path = format!("nodes/{}/status", node);
        self.request(Method::GET, &path, None).await
    }

    pub async fn get_cluster_status(&self) -> Result<Vec<Value>> {
        self.request(Method::GET, "cluster/status", None).await
    }

    /// Guests of one kind, optionally restricted to a node.
    pub async fn get_guests(
        &self,
        kind: ResourceKind,
        node: Option<&str>,
    ) -> Result<Vec<ClusterResource>> {
        let resources: Vec<ClusterResource> = self
            .request(Method::GET, "cluster/resources?type=vm", None)
            .await?;
        Ok(resources
            .into_iter()
            .filter(|r| r.kind() == Some(kind) && r.vmid.is_some())
            .filter(|r| node.is_none() || r.node.as_deref() == node)
            .collect())
    }

    /// The API returns the id as a string on most releases and as a number on some.
    pub async fn next_vmid(&self) -> Result<i64> {
        let v: Value = self.request(Method::GET, "cluster/nextid", None).await?;
        let parsed = match &v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| ProxmoxError::Remote {
            code: 200,
            message: format!("unexpected nextid payload: {}", v),
        })
    }

    pub async fn get_task_status(&self, node: &str, upid: &str) -> Result<RawTaskStatus> {
        let path = format!("nodes/{}/tasks/{}/status", node, upid);
        self.request(Method::GET, &path, None).await
    }
}
