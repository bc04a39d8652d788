use thiserror::Error;

pub type AgentResult<T> = Result<T, AgentError>;

/// Errors surfaced by the agent.
///
/// Dispatcher-level variants render to the exact `message` text sent back to
/// the control plane in a failed `RES` payload.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("bad payload")]
    BadPayload,

    #[error("action not allowed")]
    ActionNotAllowed,

    #[error("command not allowed")]
    CommandNotAllowed,

    #[error("unknown action")]
    UnknownAction,

    #[error("container not found")]
    ContainerNotFound,

    #[error("fileRoot not configured")]
    NotConfigured,

    #[error("path is outside base")]
    OutOfSandbox,

    #[error("upload not found")]
    UploadNotFound,

    #[error("download not found")]
    DownloadNotFound,

    #[error("unexpected chunk index")]
    UnexpectedChunkIndex { expected: u64, got: u64 },

    #[error("invalid base64")]
    InvalidBase64,

    #[error("unsupported archive type")]
    UnsupportedArchive,

    #[error("no files")]
    NoFiles,

    #[error("invalid mode: {0}")]
    InvalidMode(String),

    #[error("{0}")]
    ContainerError(String),

    #[error("rcon: {0}")]
    RconError(String),

    #[error("{0}")]
    FileSystemError(String),

    #[error("{0}")]
    ArchiveError(String),

    #[error("{0}")]
    IoError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::IoError(err.to_string())
    }
}

impl From<zip::result::ZipError> for AgentError {
    fn from(err: zip::result::ZipError) -> Self {
        AgentError::ArchiveError(err.to_string())
    }
}

impl From<walkdir::Error> for AgentError {
    fn from(err: walkdir::Error) -> Self {
        AgentError::FileSystemError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AgentError {
    fn from(err: tokio::task::JoinError) -> Self {
        AgentError::IoError(format!("blocking task failed: {}", err))
    }
}
