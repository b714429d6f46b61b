use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Startup configuration failures. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Control channel failures. These end the current connection and trigger a redial.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed by controller")]
    Closed,

    #[error("Outbound writer stopped")]
    WriterGone,

    #[error("File transfer failed: {0}")]
    Transfer(#[from] TransferError),
}

/// Shared data file transfer failures.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive extraction failed: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Per-request failures, captured into the RunResult error message.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("invalid method {0:?}")]
    InvalidMethod(String),

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid request: {0}")]
    Build(#[from] http::Error),

    #[error("{0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// Assertion script failures. Never fail a request; they become a single failing test.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("{0}")]
    Evaluation(String),

    #[error("sandbox setup failed: {0}")]
    Setup(String),

    #[error("malformed script output: {0}")]
    Output(String),
}

impl From<rquickjs::Error> for ScriptError {
    fn from(e: rquickjs::Error) -> Self {
        ScriptError::Setup(e.to_string())
    }
}
