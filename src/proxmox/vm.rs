use super::client::{task_id, ProxmoxClient, ResourceKind, ResourceRef};
use super::error::Result;
use reqwest::Method;
use serde_json::{json, Value};

impl ProxmoxClient {
    /// POST `.../status/{action}`; actions are start, stop, shutdown, reset, reboot.
    pub async fn guest_action(
        &self,
        target: &ResourceRef,
        action: &str,
        params: Option<&Value>,
    ) -> Result<Option<String>> {
        let path = format!("{}/status/{}", target.path(), action);
        let res: Value = self.request(Method::POST, &path, params).await?;
        Ok(task_id(res))
    }

    pub async fn create_guest(
        &self,
        node: &str,
        kind: ResourceKind,
        params: &Value,
    ) -> Result<Option<String>> {
        let path = format!("nodes/{}/{}", node, kind.api_segment());
        let res: Value = self.request(Method::POST, &path, Some(params)).await?;
        Ok(task_id(res))
    }

    pub async fn delete_guest(&self, target: &ResourceRef, purge: bool) -> Result<Option<String>> {
        let mut path = target.path();
        if purge {
            path.push_str("?purge=1&destroy-unreferenced-disks=1");
        }
        let res: Value = self.request(Method::DELETE, &path, None).await?;
        Ok(task_id(res))
    }

    pub async fn guest_config(&self, target: &ResourceRef) -> Result<Value> {
        let path = format!("{}/config", target.path());
        self.request(Method::GET, &path, None).await
    }

    pub async fn update_config(&self, target: &ResourceRef, params: &Value) -> Result<()> {
        let path = format!("{}/config", target.path());
        let _: Value = self.request(Method::PUT, &path, Some(params)).await?;
        Ok(())
    }

    /// Newer releases run the resize as a task and return its UPID.
    pub async fn resize_disk(
        &self,
        target: &ResourceRef,
        disk: &str,
        size: &str,
    ) -> Result<Option<String>> {
        let path = format!("{}/resize", target.path());
        let params = json!({ "disk": disk, "size": size });
        let res: Value = self.request(Method::PUT, &path, Some(&params)).await?;
        Ok(task_id(res))
    }
}
