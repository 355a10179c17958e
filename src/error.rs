use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serial connection failed [{device}]: {reason} (code: {error_code})")]
    Connection {
        device: String,
        reason: String,
        error_code: String,
    },

    #[error("Serial read failed: {0}")]
    Read(String),

    #[error("Serial link failed after {attempts} consecutive read errors (limit {limit})")]
    ReadThresholdExceeded { attempts: u32, limit: u32 },

    #[error("Audio endpoint error [{endpoint}]: {reason}")]
    Endpoint { endpoint: String, reason: String },

    #[error("Invalid endpoint selection: index {index} out of range (catalog has {count})")]
    InvalidSelection { index: usize, count: usize },

    #[error("Audio subsystem error: {0}")]
    Alsa(#[from] alsa::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Process exit code for a terminal error.
    ///
    /// 2 = serial device unavailable, 3 = invalid endpoint selection,
    /// 4 = read-failure threshold exceeded, 1 = anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Connection { .. } => 2,
            AppError::InvalidSelection { .. } => 3,
            AppError::ReadThresholdExceeded { .. } => 4,
            _ => 1,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
