//! Shared error and value types

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, DroverError>;

#[derive(Debug, Error)]
pub enum DroverError {
    /// The browser or its control channel failed
    #[error("driver error: {0}")]
    Driver(String),

    #[error("proxy configuration error: {0}")]
    ProxyConfig(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The user-supplied processor reported a failure
    #[error("task failed: {0}")]
    Task(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message fragments that mark a failure as a connection-level problem.
///
/// Connection errors are logged at warning level and retried quietly;
/// anything else is logged as a driver error.
const CONNECTION_ERROR_KEYWORDS: [&str; 5] = [
    "connection refused",
    "connection error",
    "max retries exceeded",
    "newconnectionerror",
    "httpconnectionpool",
];

/// Classify an error message as connection-level
pub fn is_connection_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONNECTION_ERROR_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// One memory/CPU observation, in percent of system capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct ResourceSample {
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

impl ResourceSample {
    pub fn new(memory_percent: f64, cpu_percent: f64) -> Self {
        Self {
            memory_percent,
            cpu_percent,
        }
    }
}

/// Why a worker's task loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Still running, or exited at the end of its loop
    Normal,
    /// Received the poison envelope
    Stopped,
    /// Could not obtain a driver from the pool
    DriverAcquisitionFailed,
    /// The task panicked and took the worker with it
    Crashed,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::Normal => "normal",
            ExitReason::Stopped => "stopped",
            ExitReason::DriverAcquisitionFailed => "driver_acquisition_failed",
            ExitReason::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_classified() {
        assert!(is_connection_error("Connection refused by host"));
        assert!(is_connection_error("HTTPConnectionPool: max retries exceeded"));
        assert!(!is_connection_error("element not found"));
    }

    #[test]
    fn exit_reason_display() {
        assert_eq!(
            ExitReason::DriverAcquisitionFailed.to_string(),
            "driver_acquisition_failed"
        );
        assert_eq!(ExitReason::Stopped.to_string(), "stopped");
    }
}
