use crate::lifecycle::PreconditionPolicy;
use crate::task::{PollBudget, MAX_POLL_INTERVAL, MAX_TIMEOUT};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    #[default]
    Stdio,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TaskSettings {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub backoff_cap: u32,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_ms: 1000,
            backoff_cap: 4,
        }
    }
}

impl TaskSettings {
    pub fn budget(&self) -> PollBudget {
        PollBudget {
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token_name: Option<String>,
    pub token_value: Option<String>,
    pub no_verify_ssl: Option<bool>,
    pub server_type: Option<ServerType>,
    pub http_host: Option<String>,
    pub http_port: Option<u16>,
    pub http_auth_token: Option<String>,
    #[serde(default)]
    pub task: TaskSettings,
    #[serde(default)]
    pub policy: PreconditionPolicy,
}

pub enum Auth<'a> {
    Token { name: &'a str, value: &'a str },
    Password(&'a str),
}

fn present(v: &Option<String>) -> bool {
    v.as_deref().is_some_and(|s| !s.is_empty())
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut s = Config::builder();

        // An explicit path must exist; the default `config.*` is optional.
        if let Some(path) = config_path {
            s = s.add_source(File::with_name(path).required(true));
        } else {
            s = s.add_source(File::with_name("config").required(false));
        }

        // PROXMOX_HOST -> host, PROXMOX_TASK__TIMEOUT_SECS -> task.timeout_secs
        s = s.add_source(
            Environment::with_prefix("PROXMOX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        s.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !present(&self.host) {
            return Err("Host is required".to_string());
        }
        if !present(&self.user) {
            return Err("User is required".to_string());
        }
        let token = present(&self.token_name) || present(&self.token_value);
        match (token, present(&self.password)) {
            (true, true) => {
                return Err("Configure either a password or an API token, not both".to_string())
            }
            (false, false) => return Err("A password or an API token is required".to_string()),
            (true, false) if !(present(&self.token_name) && present(&self.token_value)) => {
                return Err("API token authentication needs both token_name and token_value".to_string())
            }
            _ => {}
        }
        if self.task.poll_interval_ms == 0 || self.task.timeout_secs == 0 {
            return Err("task.timeout_secs and task.poll_interval_ms must be positive".to_string());
        }
        if self.task.timeout_secs > MAX_TIMEOUT.as_secs()
            || u128::from(self.task.poll_interval_ms) > MAX_POLL_INTERVAL.as_millis()
        {
            return Err(format!(
                "task.timeout_secs is capped at {} and task.poll_interval_ms at {}",
                MAX_TIMEOUT.as_secs(),
                MAX_POLL_INTERVAL.as_millis()
            ));
        }
        Ok(())
    }

    /// Only meaningful after [`Settings::validate`] succeeded.
    pub fn auth(&self) -> Option<Auth<'_>> {
        match (&self.token_name, &self.token_value, &self.password) {
            (Some(name), Some(value), _) => Some(Auth::Token { name, value }),
            (_, _, Some(pw)) => Some(Auth::Password(pw)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RunningDelete;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_load_from_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
host = '1.2.3.4'
user = 'testuser'
password = 'pw'
no_verify_ssl = true
server_type = 'http'

[task]
timeout_secs = 30

[policy]
running_delete = 'allow'
idempotent_noop = false
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let settings = Settings::new(Some(path)).unwrap();

        assert_eq!(settings.host, Some("1.2.3.4".to_string()));
        assert_eq!(settings.user, Some("testuser".to_string()));
        assert_eq!(settings.password, Some("pw".to_string()));
        assert_eq!(settings.no_verify_ssl, Some(true));
        assert_eq!(settings.server_type, Some(ServerType::Http));
        assert_eq!(settings.task.timeout_secs, 30);
        assert_eq!(settings.task.poll_interval_ms, 1000);
        assert_eq!(settings.policy.running_delete, RunningDelete::Allow);
        assert!(!settings.policy.idempotent_noop);
        assert!(settings.policy.restart_requires_running);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        assert!(Settings::new(Some("/nonexistent/proxmox-lifecycle.toml")).is_err());
    }

    #[test]
    fn test_validation() {
        let base = Settings {
            host: Some("pve".into()),
            user: Some("root@pam".into()),
            ..Default::default()
        };
        assert!(base.validate().is_err());

        let pw = Settings {
            password: Some("p".into()),
            ..base.clone()
        };
        assert!(pw.validate().is_ok());
        assert!(matches!(pw.auth(), Some(Auth::Password("p"))));

        let both = Settings {
            token_name: Some("t".into()),
            token_value: Some("v".into()),
            ..pw.clone()
        };
        assert!(both.validate().is_err());

        let half_token = Settings {
            token_name: Some("t".into()),
            ..base.clone()
        };
        assert!(half_token.validate().is_err());

        let endless = Settings {
            task: TaskSettings {
                timeout_secs: u64::MAX,
                ..TaskSettings::default()
            },
            ..pw.clone()
        };
        assert!(endless.validate().is_err());

        let no_host = Settings {
            host: None,
            ..pw
        };
        assert!(no_host.validate().is_err());
    }
}
