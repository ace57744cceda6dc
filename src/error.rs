//! Error handling module for the provisioner
//!
//! Every fatal condition a run can hit is a [`ProvisionError`] variant. Each
//! variant maps to a stable process exit code so callers can tell failures
//! apart without parsing messages. Per-branch filesystem problems are not
//! fatal and are carried as [`BranchError`] values inside the reconstruction
//! report instead.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::platform::PlatformKey;
use crate::provision_state::ProvisionTransitionError;
use crate::substitution::Token;

/// Exit code for command-line usage and settings errors.
pub const EXIT_USAGE: u8 = 2;

/// Why a platform has no runnable script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingScriptReason {
    /// The platform has no entry in the platform index
    NoEntry,
    /// The index points past the end of the script sequence
    RowOutOfRange { row: usize, available: usize },
    /// The row exists but holds no script
    EmptyCell { row: usize },
}

impl std::fmt::Display for MissingScriptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoEntry => write!(f, "no entry in the platform index"),
            Self::RowOutOfRange { row, available } => {
                write!(f, "row {} is out of range ({} script cells)", row, available)
            }
            Self::EmptyCell { row } => write!(f, "script cell at row {} is empty", row),
        }
    }
}

/// Main error type for a provisioning run
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The container is missing fields, malformed, or structurally invalid
    #[error("Corrupt container: {0}")]
    CorruptContainer(String),

    /// The host identity does not map to a supported platform key
    #[error("Unsupported platform: {identity:?} (expected Windows, Darwin or Linux)")]
    UnsupportedPlatform { identity: String },

    /// No script can be materialized for the resolved platform
    #[error("Missing script for platform {platform}: {reason}")]
    MissingScript {
        platform: PlatformKey,
        reason: MissingScriptReason,
    },

    /// The template still references tokens that have no value
    #[error("Unresolved placeholder(s) in script: {}", join_tokens(.unresolved))]
    Template { unresolved: Vec<Token> },

    /// The script ran and exited unsuccessfully
    #[error("Script exited unsuccessfully ({}): {}", describe_exit(.exit_code), .stderr.trim())]
    ScriptExecution {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The script exceeded its time limit and was terminated
    #[error("Script timed out after {}s and was terminated", .timeout.as_secs())]
    ScriptTimeout {
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    /// Run-level filesystem failure (root, temp file, nothing reconstructed)
    #[error("Filesystem error at {path:?}: {reason}")]
    Filesystem { path: PathBuf, reason: String },

    /// The run was cancelled by a signal or the caller
    #[error("Provisioning cancelled")]
    Cancelled,

    /// Internal state machine violation
    #[error("State transition error: {0}")]
    Transition(#[from] ProvisionTransitionError),
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create a corrupt container error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptContainer(msg.into())
    }

    /// Create a run-level filesystem error
    pub fn filesystem(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Filesystem {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable process exit code for this error kind.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::CorruptContainer(_) => 10,
            Self::UnsupportedPlatform { .. } => 11,
            Self::MissingScript { .. } => 12,
            Self::Template { .. } => 13,
            Self::ScriptExecution { .. } => 14,
            Self::ScriptTimeout { .. } => 15,
            Self::Filesystem { .. } => 16,
            Self::Transition(_) => 70,
            Self::Cancelled => 130,
        }
    }

    /// Short machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CorruptContainer(_) => "corrupt_container",
            Self::UnsupportedPlatform { .. } => "unsupported_platform",
            Self::MissingScript { .. } => "missing_script",
            Self::Template { .. } => "template",
            Self::ScriptExecution { .. } => "script_execution",
            Self::ScriptTimeout { .. } => "script_timeout",
            Self::Filesystem { .. } => "filesystem",
            Self::Transition(_) => "transition",
            Self::Cancelled => "cancelled",
        }
    }

    /// Captured process output, for the kinds that carry it.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            Self::ScriptExecution { stdout, stderr, .. }
            | Self::ScriptTimeout { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}

/// A non-fatal failure confined to one branch of the directory tree.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchError {
    #[error("invalid directory name {name:?} for node {id}: {reason}")]
    InvalidName {
        id: String,
        name: String,
        reason: &'static str,
    },

    #[error("cannot create {path:?}: {reason}")]
    CreateDir { path: PathBuf, reason: String },

    #[error("skipped {path:?}: parent directory was not created")]
    ParentFailed { path: PathBuf },

    #[error("cannot create symlink {path:?}: {reason}")]
    Symlink { path: PathBuf, reason: String },
}

fn join_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}
