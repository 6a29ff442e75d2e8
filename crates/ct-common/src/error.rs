//! Error types for claude-top.
//!
//! This module provides structured error handling with:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for callers
//!
//! The propagation policy is: anything scoped to one process never aborts a
//! sampling cycle; a failed enumeration is fatal at startup but degrades to
//! an empty cycle once the monitor is running.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for claude-top operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file and CLI argument errors.
    Config,
    /// Process enumeration and per-process detail errors.
    Collection,
    /// Process control (pause/resume/terminate) errors.
    Control,
    /// Historical store errors.
    Store,
    /// File I/O and serialization errors.
    Io,
    /// Platform compatibility errors.
    Platform,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Collection => write!(f, "collection"),
            ErrorCategory::Control => write!(f, "control"),
            ErrorCategory::Store => write!(f, "store"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Platform => write!(f, "platform"),
        }
    }
}

/// Unified error type for claude-top.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    // Collection errors (20-29)
    #[error("process enumeration failed: {0}")]
    Enumeration(String),

    #[error("could not read details for process {pid}")]
    DetailRead { pid: u32 },

    #[error("io counters unavailable for process {pid}")]
    CounterUnsupported { pid: u32 },

    // Control errors (40-49)
    #[error("control operation failed: {0}")]
    ControlFailed(String),

    #[error("process {pid} not found")]
    ProcessNotFound { pid: u32 },

    #[error("permission denied signalling process {pid}")]
    PermissionDenied { pid: u32 },

    #[error("control operation timed out after {millis}ms")]
    ControlTimeout { millis: u64 },

    #[error("refusing to target the monitor's own process {pid}")]
    SelfTarget { pid: u32 },

    // Store errors (50-59)
    #[error("history store failure: {0}")]
    Persistence(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Platform errors (70-79)
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

impl Error {
    /// Returns the stable error code for this error type.
    ///
    /// Codes are grouped by category:
    /// - 10-19: Configuration
    /// - 20-29: Collection
    /// - 40-49: Control
    /// - 50-59: Store
    /// - 60-69: I/O
    /// - 70-79: Platform
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::Enumeration(_) => 20,
            Error::DetailRead { .. } => 21,
            Error::CounterUnsupported { .. } => 22,
            Error::ControlFailed(_) => 40,
            Error::ProcessNotFound { .. } => 41,
            Error::PermissionDenied { .. } => 42,
            Error::ControlTimeout { .. } => 43,
            Error::SelfTarget { .. } => 44,
            Error::Persistence(_) => 50,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::UnsupportedPlatform(_) => 70,
        }
    }

    /// Returns the category for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) => ErrorCategory::Config,
            Error::Enumeration(_) | Error::DetailRead { .. } | Error::CounterUnsupported { .. } => {
                ErrorCategory::Collection
            }
            Error::ControlFailed(_)
            | Error::ProcessNotFound { .. }
            | Error::PermissionDenied { .. }
            | Error::ControlTimeout { .. }
            | Error::SelfTarget { .. } => ErrorCategory::Control,
            Error::Persistence(_) => ErrorCategory::Store,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
            Error::UnsupportedPlatform(_) => ErrorCategory::Platform,
        }
    }

    /// Whether the monitor can keep running after this error.
    ///
    /// Only a failed enumeration at startup and unusable platforms are
    /// unrecoverable; everything else is scoped to one process, one cycle,
    /// or one subsystem.
    pub fn recoverable(&self) -> bool {
        !matches!(self, Error::UnsupportedPlatform(_))
    }

    /// Serialize to the structured JSON form used for agent-facing output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "category": self.category(),
            "message": self.to_string(),
            "recoverable": self.recoverable(),
        })
    }
}
