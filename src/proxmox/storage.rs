use super::client::{task_id, ProxmoxClient};
use super::error::Result;
use reqwest::Method;
use serde_json::{json, Value};

impl ProxmoxClient {
    pub async fn get_storage_list(&self, node: &str) -> Result<Vec<Value>> {
        let path = format!("nodes/{}/storage", node);
        self.request(Method::GET, &path, None).await
    }

    pub async fn get_cluster_storage(&self) -> Result<Vec<Value>> {
        self.request(Method::GET, "storage", None).await
    }

    pub async fn get_storage_content(
        &self,
        node: &str,
        storage: &str,
        content_type: Option<&str>,
    ) -> Result<Vec<Value>> {
        let mut path = format!("nodes/{}/storage/{}/content", node, storage);
        if let Some(ct) = content_type {
            path.push_str(&format!("?content={}", ct));
        }
        self.request(Method::GET, &path, None).await
    }

    /// Appliance index the node can download from (`pveam available`).
    pub async fn available_templates(&self, node: &str) -> Result<Vec<Value>> {
        let path = format!("nodes/{}/aplinfo", node);
        self.request(Method::GET, &path, None).await
    }

    /// `pveam download`; answers with the UPID of the download task.
    pub async fn download_template(
        &self,
        node: &str,
        storage: &str,
        template: &str,
    ) -> Result<Option<String>> {
        let path = format!("nodes/{}/aplinfo", node);
        let params = json!({ "storage": storage, "template": template });
        let res: Value = self.request(Method::POST, &path, Some(&params)).await?;
        Ok(task_id(res))
    }
}
