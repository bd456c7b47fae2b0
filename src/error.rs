//! Custom error types for mend.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the kernel.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for kernel operations
#[derive(Error, Debug)]
pub enum KernelError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load or validate configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Missing required tool binary
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    // =========================================================================
    // Lock / State Errors
    // =========================================================================
    /// Another kernel process holds the workspace lock
    #[error("Workspace lock is held by another process: {path}")]
    LockBusy { path: PathBuf },

    /// State file carries a schema version newer than this binary understands
    #[error("Unsupported state schema version {found} (this binary supports up to {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// State persistence failed
    #[error("State error: {message}")]
    State { message: String },

    // =========================================================================
    // Phase Errors
    // =========================================================================
    /// Scanner invocation failed
    #[error("Scan error: {message}")]
    Scan { message: String },

    /// Environmental blocker detected (broken tooling, not a task failure)
    #[error("Environment blocker: {detail}")]
    Environment { detail: String },

    /// Policy violation (destructive operation, escape attempt)
    #[error("Policy violation: {detail}")]
    Policy { detail: String },

    /// Patch generation or application failed
    #[error("Execute error: {message}")]
    Execute { message: String },

    /// Generated patch failed validation
    #[error("Patch validation failed: {reason}")]
    PatchValidation { reason: String },

    /// Verification command failed to run
    #[error("Verify error: {message}")]
    Verify { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KernelError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a state error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a scan error
    pub fn scan(message: impl Into<String>) -> Self {
        Self::Scan {
            message: message.into(),
        }
    }

    /// Create an environment blocker error
    pub fn environment(detail: impl Into<String>) -> Self {
        Self::Environment {
            detail: detail.into(),
        }
    }

    /// Create an execute error
    pub fn execute(message: impl Into<String>) -> Self {
        Self::Execute {
            message: message.into(),
        }
    }

    /// Check if this error is an environmental blocker.
    ///
    /// Environmental blockers pause the cycle without charging any task's
    /// failure count.
    #[must_use]
    pub fn is_environment(&self) -> bool {
        matches!(self, Self::Environment { .. } | Self::MissingTool { .. })
    }

    /// Check if this error is a policy violation (immediate pause, no retry).
    #[must_use]
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::Policy { .. })
    }

    /// Get the process exit code for this error.
    ///
    /// `2` is reserved for lock contention at BOOT; every other terminal
    /// error surfaces as `1` (PAUSED/FAILED).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::LockBusy { .. } => 2,
            _ => 1,
        }
    }
}

/// Type alias for kernel results
pub type Result<T> = std::result::Result<T, KernelError>;
