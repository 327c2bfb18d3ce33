use crate::lifecycle::Operation;
use crate::proxmox::{ProxmoxError, ResourceRef};
use thiserror::Error;

/// Errors surfaced to tool callers.
///
/// Every variant carries enough context (guest, operation, remote message) to
/// diagnose the failure without re-running the call.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Invalid argument '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Cannot {operation} {target}: {message}")]
    Precondition {
        target: ResourceRef,
        operation: Operation,
        message: String,
    },

    #[error("Cannot {operation} {target}: cluster reports another operation in progress ({message})")]
    Conflict {
        target: ResourceRef,
        operation: Operation,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("Timed out waiting for task {upid}; final state unknown")]
    PollTimeout { upid: String },

    /// An adapter failure tied to the guest and operation it interrupted.
    #[error("Cannot {operation} {target}: {source}")]
    Guest {
        target: ResourceRef,
        operation: Operation,
        source: Box<LifecycleError>,
    },
}

impl LifecycleError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        LifecycleError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable tag callers can branch on.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::Validation { .. } => "ValidationError",
            LifecycleError::Precondition { .. } => "PreconditionError",
            LifecycleError::Conflict { .. } => "ConflictError",
            LifecycleError::NotFound(_) => "NotFoundError",
            LifecycleError::Transport(_) => "TransportError",
            LifecycleError::Auth(_) => "AuthError",
            LifecycleError::Remote { .. } => "RemoteError",
            LifecycleError::PollTimeout { .. } => "PollTimeout",
            LifecycleError::Guest { source, .. } => source.kind(),
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            LifecycleError::Validation { field, .. } => Some(field),
            LifecycleError::Guest { source, .. } => source.field(),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<&ResourceRef> {
        match self {
            LifecycleError::Precondition { target, .. }
            | LifecycleError::Conflict { target, .. }
            | LifecycleError::Guest { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        match self {
            LifecycleError::Precondition { operation, .. }
            | LifecycleError::Conflict { operation, .. }
            | LifecycleError::Guest { operation, .. } => Some(*operation),
            _ => None,
        }
    }

    /// Attach the guest and operation, unless the error already names them.
    pub(crate) fn during(self, operation: Operation, target: &ResourceRef) -> Self {
        if self.target().is_some() {
            return self;
        }
        LifecycleError::Guest {
            target: target.clone(),
            operation,
            source: Box::new(self),
        }
    }

    /// Prefix adapter messages with what we were doing when they happened.
    pub(crate) fn with_context(self, context: &str) -> Self {
        match self {
            LifecycleError::Guest {
                target,
                operation,
                source,
            } => LifecycleError::Guest {
                target,
                operation,
                source: Box::new(source.with_context(context)),
            },
            LifecycleError::Transport(m) => LifecycleError::Transport(format!("{}: {}", context, m)),
            LifecycleError::Auth(m) => LifecycleError::Auth(format!("{}: {}", context, m)),
            LifecycleError::NotFound(m) => LifecycleError::NotFound(format!("{}: {}", context, m)),
            LifecycleError::Remote { code, message } => LifecycleError::Remote {
                code,
                message: format!("{}: {}", context, message),
            },
            LifecycleError::Conflict {
                target,
                operation,
                message,
            } => LifecycleError::Conflict {
                target,
                operation,
                message: format!("{}: {}", context, message),
            },
            other => other,
        }
    }
}

impl From<ProxmoxError> for LifecycleError {
    fn from(err: ProxmoxError) -> Self {
        match err {
            ProxmoxError::Transport(m) => LifecycleError::Transport(m),
            ProxmoxError::Auth(m) => LifecycleError::Auth(m),
            ProxmoxError::NotFound(m) => LifecycleError::NotFound(m),
            ProxmoxError::Remote { code, message } => LifecycleError::Remote { code, message },
            ProxmoxError::Json(e) => LifecycleError::Transport(format!("malformed response: {}", e)),
            ProxmoxError::Url(e) => LifecycleError::Transport(format!("invalid request URL: {}", e)),
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
