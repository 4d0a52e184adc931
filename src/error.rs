//! Crate-wide error taxonomy.
//!
//! Mirrors the shape of the distinctions drawn in the design: a `UserError`
//! never retried, a `ToolError`/`SandboxError` that downgrade to a verdict
//! for a single evaluation rather than aborting a run, and a `CacheError`
//! that the cache layer evicts and rebuilds from.

use std::path::{Path, PathBuf};

pub type Result<T, E = RbxError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum RbxError {
    #[error("IO error at {path:?}: {source}")]
    Io { source: std::io::Error, path: PathBuf },

    #[error("non-UTF8 sentinel field in input expected to be text: {0}")]
    Encoding(String),

    #[error("{0}")]
    UserError(String),

    #[error("tool `{tool}` exited unexpectedly: {message}")]
    ToolError { tool: String, message: String },

    #[error("sandbox infrastructure failure: {0}")]
    SandboxError(String),

    #[error("cache corruption detected for fingerprint {fingerprint}: {reason}")]
    CacheError { fingerprint: String, reason: String },

    #[error("run was cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl RbxError {
    pub fn io(source: std::io::Error, path: impl AsRef<Path>) -> Self {
        Self::Io { source, path: path.as_ref().to_path_buf() }
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn user(msg: impl Into<String>) -> Self {
        Self::UserError(msg.into())
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolError { tool: tool.into(), message: message.into() }
    }

    pub fn cache(fingerprint: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::CacheError { fingerprint: fingerprint.to_string(), reason: reason.into() }
    }

    pub fn sandbox(reason: impl Into<String>) -> Self {
        Self::SandboxError(reason.into())
    }

    /// True if a caller may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SandboxError(_))
    }
}

impl From<serde_json::Error> for RbxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}
