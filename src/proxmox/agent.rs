use super::client::{ProxmoxClient, ResourceRef};
use super::error::Result;
use reqwest::Method;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

#[derive(Deserialize, Debug)]
struct ExecStarted {
    pid: i64,
}

/// `agent/exec-status` for one pid. Output fields appear once the command exited.
#[derive(Deserialize, Debug, Default)]
pub struct ExecStatus {
    #[serde(default, deserialize_with = "flag")]
    pub exited: bool,
    pub exitcode: Option<i64>,
    #[serde(rename = "out-data")]
    pub out_data: Option<String>,
    #[serde(rename = "err-data")]
    pub err_data: Option<String>,
    #[serde(rename = "out-truncated", default, deserialize_with = "flag")]
    pub out_truncated: bool,
}

/// The agent reports booleans as `0`/`1` on some releases.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

impl ProxmoxClient {
    /// Start `command` in the guest and return the agent's pid for it.
    pub async fn agent_exec(
        &self,
        target: &ResourceRef,
        command: &[String],
        input_data: Option<&str>,
    ) -> Result<i64> {
        let path = format!("{}/agent/exec", target.path());
        let mut params = json!({ "command": command });
        if let Some(data) = input_data {
            params["input-data"] = json!(data);
        }
        let started: ExecStarted = self.request(Method::POST, &path, Some(&params)).await?;
        Ok(started.pid)
    }

    pub async fn agent_exec_status(&self, target: &ResourceRef, pid: i64) -> Result<ExecStatus> {
        let path = format!("{}/agent/exec-status?pid={}", target.path(), pid);
        self.request(Method::GET, &path, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_status_flags() {
        let done: ExecStatus = serde_json::from_value(json!({
            "exited": 1,
            "exitcode": 0,
            "out-data": "Linux vm1 6.1.0\n"
        }))
        .unwrap();
        assert!(done.exited);
        assert!(!done.out_truncated);
        assert_eq!(done.out_data.as_deref(), Some("Linux vm1 6.1.0\n"));

        let running: ExecStatus = serde_json::from_value(json!({ "exited": false })).unwrap();
        assert!(!running.exited);
        assert_eq!(running.exitcode, None);
    }
}
