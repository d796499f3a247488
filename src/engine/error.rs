use std::path::PathBuf;

use thiserror::Error;

use crate::engine::sanitize::sanitize;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload could not be decoded but still names the job it belongs to.
    #[error("Invalid job payload: {reason}")]
    Identified { job_id: String, reason: String },
    #[error("unreadable job payload: {0}")]
    Anonymous(String),
}

/// Every way a single job can end in the `error` state.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Language '{0}' is not supported.")]
    UnsupportedLanguage(String),
    #[error("workspace I/O failed at {}: {source}", .path.display())]
    WorkspaceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch sandbox: {0}")]
    ContainerLaunch(String),
    #[error("sandbox output stream failed: {message}")]
    Stream {
        message: String,
        partial_output: Vec<u8>,
    },
    #[error("Execution timed out after {timeout_ms} ms.")]
    TimeoutExceeded {
        timeout_ms: u64,
        partial_output: Vec<u8>,
    },
    #[error("process exited with code {exit_code}")]
    NonZeroExit { exit_code: i64, output: Vec<u8> },
}

impl ExecutionError {
    pub fn workspace_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WorkspaceIo {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage(_) => "unsupported_language",
            Self::WorkspaceIo { .. } => "workspace_io",
            Self::ContainerLaunch(_) => "container_launch",
            Self::Stream { .. } => "stream",
            Self::TimeoutExceeded { .. } => "timeout",
            Self::NonZeroExit { .. } => "non_zero_exit",
        }
    }

    /// Exit code of the sandboxed program, when it ran to completion.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            Self::NonZeroExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Text written to the `output` field of the job's status entry.
    pub fn status_message(&self) -> String {
        match self {
            Self::NonZeroExit { output, .. } => sanitize(&String::from_utf8_lossy(output)),
            Self::TimeoutExceeded { partial_output, .. }
            | Self::Stream { partial_output, .. } => {
                with_partial_output(partial_output, &self.to_string())
            }
            _ => self.to_string(),
        }
    }
}

fn with_partial_output(partial: &[u8], message: &str) -> String {
    let partial = sanitize(&String::from_utf8_lossy(partial));
    if partial.is_empty() {
        message.to_string()
    } else {
        format!("{partial}\n{message}")
    }
}
