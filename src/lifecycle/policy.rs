use super::types::Operation;
use crate::proxmox::{ObservedState, PowerState};
use serde::Deserialize;

/// What to do with a delete request against a running guest.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunningDelete {
    /// Refuse unless the caller passes `force`, which stops the guest first.
    #[default]
    RequireForce,
    /// Refuse even with `force`.
    Reject,
    /// Send the delete straight away and let the cluster decide.
    Allow,
}

/// Precondition matrix applied before any mutating call.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PreconditionPolicy {
    pub running_delete: RunningDelete,
    /// Report success without a call when the guest is already in the target state.
    pub idempotent_noop: bool,
    /// Reset and restart need a running guest.
    pub restart_requires_running: bool,
}

impl Default for PreconditionPolicy {
    fn default() -> Self {
        Self {
            running_delete: RunningDelete::RequireForce,
            idempotent_noop: true,
            restart_requires_running: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    /// Already in the target state; nothing to send.
    AlreadyDone(String),
    /// Stop the guest, then proceed.
    StopFirst,
    /// The guest is paused; `start` means resume.
    Resume,
    Reject(String),
    Missing,
}

impl PreconditionPolicy {
    pub fn evaluate(&self, operation: Operation, observed: &ObservedState, force: bool) -> Verdict {
        let power = match (operation, observed) {
            (Operation::Create, ObservedState::Absent) => return Verdict::Proceed,
            (Operation::Create, ObservedState::Present { .. }) => {
                return Verdict::Reject("a guest with this id already exists".into())
            }
            (_, ObservedState::Absent) => return Verdict::Missing,
            (_, ObservedState::Present { status, .. }) => *status,
        };

        match operation {
            Operation::Start if power == PowerState::Running => self.noop("already running"),
            Operation::Start if power == PowerState::Paused => Verdict::Resume,
            Operation::Exec if power != PowerState::Running => {
                Verdict::Reject("guest is not running; the guest agent needs a running VM".into())
            }
            Operation::Stop | Operation::Shutdown if power == PowerState::Stopped => {
                self.noop("already stopped")
            }
            Operation::Reset | Operation::Restart
                if power == PowerState::Stopped && self.restart_requires_running =>
            {
                Verdict::Reject("guest is not running; start it instead".into())
            }
            Operation::Delete if matches!(power, PowerState::Running | PowerState::Paused) => {
                match (self.running_delete, force) {
                    (RunningDelete::Reject, _) => {
                        Verdict::Reject("guest is running and deleting running guests is disabled".into())
                    }
                    (_, true) => Verdict::StopFirst,
                    (RunningDelete::RequireForce, false) => Verdict::Reject(
                        "guest is running; stop it first or pass force=true".into(),
                    ),
                    (RunningDelete::Allow, false) => Verdict::Proceed,
                }
            }
            _ => Verdict::Proceed,
        }
    }

    fn noop(&self, why: &str) -> Verdict {
        if self.idempotent_noop {
            Verdict::AlreadyDone(why.to_string())
        } else {
            Verdict::Proceed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(status: PowerState) -> ObservedState {
        ObservedState::Present { status, name: None }
    }

    #[test]
    fn test_default_matrix() {
        let p = PreconditionPolicy::default();
        let running = present(PowerState::Running);
        let stopped = present(PowerState::Stopped);

        assert!(matches!(p.evaluate(Operation::Start, &running, false), Verdict::AlreadyDone(_)));
        assert_eq!(p.evaluate(Operation::Start, &stopped, false), Verdict::Proceed);
        assert!(matches!(p.evaluate(Operation::Stop, &stopped, false), Verdict::AlreadyDone(_)));
        assert!(matches!(p.evaluate(Operation::Shutdown, &stopped, false), Verdict::AlreadyDone(_)));
        assert!(matches!(p.evaluate(Operation::Reset, &stopped, false), Verdict::Reject(_)));
        assert_eq!(p.evaluate(Operation::Restart, &running, false), Verdict::Proceed);
        assert!(matches!(p.evaluate(Operation::Delete, &running, false), Verdict::Reject(_)));
        assert_eq!(p.evaluate(Operation::Delete, &running, true), Verdict::StopFirst);
        assert_eq!(p.evaluate(Operation::Delete, &stopped, false), Verdict::Proceed);
        assert_eq!(p.evaluate(Operation::Stop, &ObservedState::Absent, false), Verdict::Missing);
        assert_eq!(p.evaluate(Operation::Create, &ObservedState::Absent, false), Verdict::Proceed);
        assert!(matches!(p.evaluate(Operation::Create, &stopped, false), Verdict::Reject(_)));
        assert_eq!(p.evaluate(Operation::UpdateResources, &running, false), Verdict::Proceed);
    }

    #[test]
    fn test_paused_guest() {
        let p = PreconditionPolicy::default();
        let paused = present(PowerState::Paused);
        assert_eq!(p.evaluate(Operation::Start, &paused, false), Verdict::Resume);
        assert_eq!(p.evaluate(Operation::Stop, &paused, false), Verdict::Proceed);
        assert!(matches!(p.evaluate(Operation::Exec, &paused, false), Verdict::Reject(_)));
        assert_eq!(
            p.evaluate(Operation::Exec, &present(PowerState::Running), false),
            Verdict::Proceed
        );
    }

    #[test]
    fn test_configured_matrix() {
        let p = PreconditionPolicy {
            running_delete: RunningDelete::Allow,
            idempotent_noop: false,
            restart_requires_running: false,
        };
        let running = present(PowerState::Running);
        let stopped = present(PowerState::Stopped);
        assert_eq!(p.evaluate(Operation::Delete, &running, false), Verdict::Proceed);
        assert_eq!(p.evaluate(Operation::Start, &running, false), Verdict::Proceed);
        assert_eq!(p.evaluate(Operation::Reset, &stopped, false), Verdict::Proceed);

        let strict = PreconditionPolicy {
            running_delete: RunningDelete::Reject,
            ..Default::default()
        };
        assert!(matches!(strict.evaluate(Operation::Delete, &running, true), Verdict::Reject(_)));
    }
}
