//! Error types for repository acquisition, publishing and CI reporting.

use lockstep_core::LockstepError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error(transparent)]
    Core(#[from] LockstepError),

    /// A repository URL does not end in `owner/name`.
    #[error("cannot derive owner/name from repository url '{0}'")]
    InvalidRepoUrl(String),

    /// A git command exited non-zero.
    #[error("git command `{command}` failed: {detail}")]
    Git { command: String, detail: String },

    /// A publish step command exited non-zero.
    #[error("command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The GitHub API answered with an unexpected status.
    #[error("GitHub API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The Buildkite API rejected a request or answered with errors.
    #[error("Buildkite API error: {0}")]
    Buildkite(String),

    /// A poll gave up before its condition held.
    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ReleaseError {
    fn from(err: reqwest::Error) -> Self {
        ReleaseError::Http(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReleaseError>;
