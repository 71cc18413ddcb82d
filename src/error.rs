use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AqError {
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("invalid collection id: {0}")]
    InvalidCollection(String),

    #[error("invalid station: {0}")]
    InvalidStation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("region backend could not be initialized: {0}")]
    #[diagnostic(help("check the backend endpoint, project id and AQSAT_BACKEND_TOKEN"))]
    BackendInit(String),

    #[error("region backend request failed: {0}")]
    BackendHttp(String),

    #[error("region backend returned status {status}: {message}")]
    BackendStatus { status: u16, message: String },

    #[error("malformed region response: {0}")]
    MalformedResponse(String),

    #[error("Overpass request failed: {0}")]
    OverpassHttp(String),

    #[error("Overpass returned status {status}: {message}")]
    OverpassStatus { status: u16, message: String },

    #[error("checkpoint store {path} is corrupt: {reason}")]
    CorruptCheckpoint { path: String, reason: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("extraction cancelled")]
    Cancelled,
}

impl AqError {
    /// Errors that stop a run before any store mutation.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AqError::InvalidLocation(_)
                | AqError::InvalidSignal(_)
                | AqError::InvalidCollection(_)
                | AqError::InvalidStation(_)
                | AqError::InvalidConfig(_)
                | AqError::ConfigRead(_)
                | AqError::ConfigParse(_)
        )
    }
}
