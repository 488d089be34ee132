//! Error types for fnbox operations.
//!
//! A single closed set of failures covers the whole execution layer:
//! - NotFound: an image or container lookup came back empty
//! - ExecutionFailed: the container ran but exited with a non-zero code
//! - Engine errors: anything the container engine (or the registry) rejected
//!
//! Callers branch on the variant instead of comparing against sentinels.

use thiserror::Error;

/// Errors that can occur while resolving images or running containers.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Image '{0}' not found")]
    ImageNotFound(String),

    #[error("Container '{0}' not found")]
    ContainerNotFound(String),

    #[error("Container exited with failure (exit code {exit_code})")]
    ExecutionFailed { exit_code: i64 },

    #[error("Container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("Image build failed: {0}")]
    BuildFailed(String),

    #[error("Registry authentication failed: {0}")]
    Registry(String),

    #[error("Background task ended before reporting an outcome")]
    Interrupted,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Returns true for failed image or container lookups.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProvisionError::ImageNotFound(_) | ProvisionError::ContainerNotFound(_)
        )
    }

    /// Returns true when the container ran to completion but failed.
    pub fn is_execution_failure(&self) -> bool {
        matches!(self, ProvisionError::ExecutionFailed { .. })
    }

    /// Returns true when the engine, the registry, or the connection to them failed.
    pub fn is_engine_error(&self) -> bool {
        matches!(
            self,
            ProvisionError::Engine(_)
                | ProvisionError::BuildFailed(_)
                | ProvisionError::Registry(_)
                | ProvisionError::Interrupted
        )
    }

    /// Exit code of a failed execution, if this error carries one.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            ProvisionError::ExecutionFailed { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}
