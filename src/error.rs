use thiserror::Error;

use crate::process::LimitReport;

/// Failures of a single external tool invocation.
///
/// `Timeout`, `OutOfMemory` and `Failed` keep whatever stdout/stderr the
/// tool produced before it died.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("The commandline \"{command}\" exceeded its time limit")]
    Timeout {
        command: String,
        stdout: String,
        stderr: String,
        report: LimitReport,
    },

    #[error("The commandline \"{command}\" failed with an out of memory error")]
    OutOfMemory {
        command: String,
        stdout: String,
        stderr: String,
        report: LimitReport,
    },

    #[error("The commandline \"{command}\" failed with exit code {}.\nStandard error:\n{stderr}", exit_label(.exit_code))]
    Failed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Failed to start \"{command}\": {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error while running \"{command}\": {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "<signal>".to_string())
}

impl ToolError {
    /// Standard output captured before the failure, if any.
    pub fn stdout(&self) -> &str {
        match self {
            ToolError::Timeout { stdout, .. }
            | ToolError::OutOfMemory { stdout, .. }
            | ToolError::Failed { stdout, .. } => stdout,
            ToolError::Spawn { .. } | ToolError::Io { .. } => "",
        }
    }

    /// Standard error captured before the failure, if any.
    pub fn stderr(&self) -> &str {
        match self {
            ToolError::Timeout { stderr, .. }
            | ToolError::OutOfMemory { stderr, .. }
            | ToolError::Failed { stderr, .. } => stderr,
            ToolError::Spawn { .. } | ToolError::Io { .. } => "",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout { .. })
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ToolError::OutOfMemory { .. })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("Scheduler contract violation: {0}")]
    ContractViolation(String),

    #[error("Phase {phase} of {task} failed: {message}")]
    PhaseFailed {
        task: String,
        phase: usize,
        message: String,
    },

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Scheduler was shut down")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
