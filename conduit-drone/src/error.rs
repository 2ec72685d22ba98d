use std::time::Duration;

use conduit::{ConfigError, OrchestratorError, PoolError, SpecError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures talking to the vehicle over a [`Connection`](crate::connection::Connection).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkError {
    #[error("Link is closed")]
    Closed,
    #[error("Link I/O failed: {0}")]
    Io(String),
    #[error("Vehicle rejected command: {0}")]
    Rejected(String),
}

/// Errors assembling or running the drone pipeline.
#[derive(Error, Debug)]
pub enum DroneError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Worker spec error: {0}")]
    Spec(#[from] SpecError),
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
    #[error("No heartbeat from the vehicle within {0:?}")]
    NoHeartbeat(Duration),
    #[error("Vehicle server failed: {0}")]
    Server(#[from] std::io::Error),
    #[error("Failed to install Ctrl+C handler: {0}")]
    Interrupt(#[from] ctrlc::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_messages() {
        assert_eq!(LinkError::Closed.to_string(), "Link is closed");
        assert_eq!(LinkError::Io("reset by peer".into()).to_string(), "Link I/O failed: reset by peer");
    }

    #[test]
    fn test_spec_error_converts() {
        let err: DroneError = SpecError::ZeroCount(0).into();
        assert!(matches!(err, DroneError::Spec(SpecError::ZeroCount(0))));
        assert!(err.to_string().starts_with("Worker spec error"));
    }
}
