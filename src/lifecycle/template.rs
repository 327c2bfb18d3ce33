//! Container template downloads.

use super::Orchestrator;
use crate::error::{LifecycleError, Result};
use crate::task::{PollBudget, TaskHandle, TaskStatus};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

#[derive(Serialize, Debug, Clone)]
pub struct TemplateDownload {
    pub node: String,
    pub storage: String,
    pub template: String,
    pub volid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    pub detail: String,
}

impl Orchestrator {
    /// Fetch `template` from the appliance index into `storage` and follow the task.
    /// A template already on the storage is not downloaded again.
    #[instrument(skip(self, budget))]
    pub async fn download_template(
        &self,
        node: &str,
        storage: &str,
        template: &str,
        budget: PollBudget,
    ) -> Result<TemplateDownload> {
        if template.is_empty() || template.contains('/') {
            return Err(LifecycleError::validation("template", "expected a package name from the appliance index"));
        }
        let mut download = TemplateDownload {
            node: node.to_string(),
            storage: storage.to_string(),
            template: template.to_string(),
            volid: format!("{}:vztmpl/{}", storage, template),
            task: None,
            status: None,
            detail: String::new(),
        };

        let present = self
            .client
            .get_storage_content(node, storage, Some("vztmpl"))
            .await
            .map_err(|e| LifecycleError::from(e).with_context(&format!("listing templates on {}:{}", node, storage)))?;
        if present
            .iter()
            .any(|item| item.get("volid").and_then(Value::as_str) == Some(download.volid.as_str()))
        {
            info!(volid = %download.volid, "Template already present");
            download.detail = "already present".into();
            return Ok(download);
        }

        let upid = self
            .client
            .download_template(node, storage, template)
            .await
            .map_err(|e| LifecycleError::from(e).with_context(&format!("downloading {}", template)))?;
        let Some(upid) = upid else {
            download.detail = "completed synchronously".into();
            return Ok(download);
        };

        let handle = TaskHandle::new(upid, node);
        info!(upid = %handle, "Download started");
        let status = self.wait_for_task(&handle, budget).await?;
        download.detail = status.exit_message.clone().unwrap_or_else(|| "OK".into());
        download.task = Some(handle);
        download.status = Some(status);
        Ok(download)
    }
}
