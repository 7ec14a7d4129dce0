use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("external tool is missing: {tool}")]
    ToolMissing { tool: String },

    #[error("{tool} download failed: {reason}")]
    DownloadFailed { tool: String, reason: String },

    #[error("tool install failed: {0}")]
    InstallFailed(String),

    #[error("failed to launch {tool}: {source}")]
    ProcessLaunchFailed {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("external tool failed: {tool} (code={code:?}) {detail}")]
    ProcessExitedNonZero {
        tool: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("failed to parse track catalog: {0}")]
    ProbeParseFailed(String),

    #[error("failed to extract {entry} from {archive}: {reason}")]
    ArchiveExtractFailed {
        archive: PathBuf,
        entry: String,
        reason: String,
    },

    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for {path}: expected at least {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("busy: another operation is active ({state})")]
    Busy { state: String },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("operation canceled")]
    Canceled,

    #[error("process timed out after {0}s")]
    TimedOut(u64),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable identifier for scripting; never changes with message wording.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ToolMissing { .. } => "tool_missing",
            EngineError::DownloadFailed { .. } => "download_failed",
            EngineError::InstallFailed(_) => "install_failed",
            EngineError::ProcessLaunchFailed { .. } => "process_launch_failed",
            EngineError::ProcessExitedNonZero { .. } => "process_exited_non_zero",
            EngineError::ProbeParseFailed(_) => "probe_parse_failed",
            EngineError::ArchiveExtractFailed { .. } => "archive_extract_failed",
            EngineError::HashMismatch { .. } => "hash_mismatch",
            EngineError::SizeMismatch { .. } => "size_mismatch",
            EngineError::Busy { .. } => "busy",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidUrl { .. } => "invalid_url",
            EngineError::Canceled => "canceled",
            EngineError::TimedOut(_) => "timed_out",
            EngineError::Config(_) => "config",
            EngineError::Json(_) => "json",
            EngineError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
