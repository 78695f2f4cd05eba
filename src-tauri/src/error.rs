use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Failed to start backend '{program}': {reason}")]
    Start { program: String, reason: String },

    #[error("Backend did not become healthy after {attempts} attempt(s)")]
    HealthCheckTimeout { attempts: u32 },

    #[error("Required browser engine is missing from {path:?}: {details}")]
    AssetMissing { path: PathBuf, details: String },

    #[error("Login QR code expired after {refreshes} refresh(es); retry to get a new one")]
    LoginExpired { refreshes: u32 },

    #[error("Backend request {endpoint} failed: {reason}")]
    PollTransport { endpoint: String, reason: String },

    #[error("Backend rejected {endpoint} ({status}): {detail}")]
    BackendRejected {
        endpoint: String,
        status: u16,
        detail: String,
    },

    #[error("Target count must be between {min} and {max}, got {value}")]
    InvalidTargetCount { value: i64, min: u32, max: u32 },

    #[error("Forced reset must be explicitly confirmed")]
    ConfirmationRequired,

    #[error("Cannot {action} while {subject} is {state}")]
    InvalidTransition {
        action: String,
        subject: &'static str,
        state: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShellError {
    /// True for the errors that abort startup and are shown in a blocking dialog.
    pub fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            ShellError::Start { .. }
                | ShellError::HealthCheckTimeout { .. }
                | ShellError::AssetMissing { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_startup_errors_are_fatal() {
        assert!(ShellError::HealthCheckTimeout { attempts: 10 }.is_fatal_startup());
        assert!(ShellError::Start {
            program: "uv".into(),
            reason: "not found".into()
        }
        .is_fatal_startup());
        assert!(!ShellError::LoginExpired { refreshes: 5 }.is_fatal_startup());
        assert!(!ShellError::PollTransport {
            endpoint: "/api/health".into(),
            reason: "refused".into()
        }
        .is_fatal_startup());
    }

    #[test]
    fn messages_carry_the_cause() {
        let err = ShellError::InvalidTargetCount {
            value: 301,
            min: 1,
            max: 300,
        };
        assert_eq!(err.to_string(), "Target count must be between 1 and 300, got 301");

        let err = ShellError::InvalidTransition {
            action: "reset".into(),
            subject: "the task",
            state: "running".into(),
        };
        assert_eq!(err.to_string(), "Cannot reset while the task is running");
    }
}
