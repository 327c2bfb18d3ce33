use thiserror::Error;

/// Messages the cluster uses when a guest's config lock is held by another task.
const CONFLICT_MARKERS: &[&str] = &[
    "can't lock file",
    "is locked",
    "already in progress",
];

const NOT_FOUND_MARKERS: &[&str] = &["does not exist", "no such task", "not found", "unknown upid"];

#[derive(Error, Debug)]
pub enum ProxmoxError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("API request failed: {code} - {message}")]
    Remote { code: u16, message: String },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for ProxmoxError {
    fn from(err: reqwest::Error) -> Self {
        ProxmoxError::Transport(err.to_string())
    }
}

impl ProxmoxError {
    /// Classify a non-2xx response into the adapter taxonomy.
    pub fn from_status(code: u16, message: String) -> Self {
        let lower = message.to_lowercase();
        match code {
            401 => ProxmoxError::Auth(message),
            403 if lower.contains("permission") || lower.contains("authentication") => {
                ProxmoxError::Auth(message)
            }
            404 => ProxmoxError::NotFound(message),
            502..=504 => ProxmoxError::Transport(format!("{} - {}", code, message)),
            _ if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) => {
                ProxmoxError::NotFound(message)
            }
            _ => ProxmoxError::Remote { code, message },
        }
    }

    /// Worth retrying while polling: the request never reached a healthy API.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProxmoxError::Transport(_))
    }

    /// The cluster refused a mutating call because another operation holds the guest.
    pub fn is_conflict(&self) -> bool {
        match self {
            ProxmoxError::Remote { message, .. } => {
                let lower = message.to_lowercase();
                CONFLICT_MARKERS.iter().any(|m| lower.contains(m))
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProxmoxError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProxmoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ProxmoxError::from_status(401, "no ticket".into()),
            ProxmoxError::Auth(_)
        ));
        assert!(matches!(
            ProxmoxError::from_status(403, "Permission check failed".into()),
            ProxmoxError::Auth(_)
        ));
        assert!(matches!(
            ProxmoxError::from_status(500, "Configuration file 'nodes/pve1/qemu-server/999.conf' does not exist".into()),
            ProxmoxError::NotFound(_)
        ));
        assert!(matches!(
            ProxmoxError::from_status(503, "service unavailable".into()),
            ProxmoxError::Transport(_)
        ));
        assert!(matches!(
            ProxmoxError::from_status(500, "VM 101 qmp command failed".into()),
            ProxmoxError::Remote { code: 500, .. }
        ));
    }

    #[test]
    fn test_conflict_detection() {
        let locked = ProxmoxError::from_status(
            500,
            "can't lock file '/var/lock/qemu-server/lock-101.conf' - got timeout".into(),
        );
        assert!(locked.is_conflict());
        assert!(!locked.is_transient());

        let plain = ProxmoxError::from_status(400, "parameter verification failed".into());
        assert!(!plain.is_conflict());
        assert!(!ProxmoxError::Transport("reset".into()).is_conflict());
    }
}
