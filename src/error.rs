// src/error.rs

//! Crate-wide error types.
//!
//! Errors are split along the failure-handling boundaries of the
//! reconciliation pipeline:
//!
//! - `Ostree`: versioned-store operation failed, fatal to the whole pipeline
//! - `PackageNotFound` / `PermissionDenied`: pre-flight only, block apply
//! - `RollbackFailed`: the system may be on an uncertain deployment,
//!   operator intervention required
//! - `CommandFailed`: one external command exited non-zero (or timed out);
//!   carries the captured output for the operator report

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by the reconciliation core
#[derive(Debug, Error)]
pub enum Error {
    #[error("ostree operation failed: {0}")]
    Ostree(String),

    #[error("package not found: {0}")]
    PackageNotFound(String),

    #[error("insufficient permissions: {0}")]
    PermissionDenied(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("command `{command}` failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("state error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Build a `CommandFailed` from a program, its arguments, and captured output
    pub fn command_failed(program: &str, args: &[&str], output: impl Into<String>) -> Self {
        let mut command = program.to_string();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        Error::CommandFailed {
            command,
            output: output.into(),
        }
    }
}
