//! Error taxonomy for an orchestration run.

use std::path::PathBuf;

use shared::ParamError;
use thiserror::Error;

/// Errors that can abort a run or fail an individual job.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A required instance catalog key is absent.
    #[error("Missing required field '{0}' in instance catalog")]
    MissingField(String),

    /// A field is present but its value cannot be used.
    #[error("Invalid value '{value}' for field '{key}': {reason}")]
    InvalidField {
        key: String,
        value: String,
        reason: String,
    },

    /// An external program exited with a non-zero status.
    ///
    /// `code` is `None` when the process was terminated by a signal.
    #[error("Error running {command}: {}", describe_exit(.code))]
    ExternalToolFailure { command: String, code: Option<i32> },

    /// An external program could not be started at all.
    #[error("Failed to launch {command}: {source}")]
    ToolSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A required installation or instrument directory does not exist.
    #[error("{} does not exist", .0.display())]
    MissingDirectory(PathBuf),

    /// A job worker panicked while running the job.
    #[error("Job worker panicked while running {0}")]
    WorkerPanic(String),

    /// The selected execution backend is not usable as configured.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The focal plane geometry or segmentation table is malformed.
    #[error("Layout error in {}: {message}", .path.display())]
    Layout { path: PathBuf, message: String },

    #[error(transparent)]
    Params(#[from] ParamError),

    /// Reading or writing a specific file failed.
    #[error("IO error on {}: {source}", .path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl OrchestratorError {
    /// Attach a path to an IO error.
    pub fn file(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| OrchestratorError::FileAccess { path, source }
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
