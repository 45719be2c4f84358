use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors raised by device accessors and the acquisition controller.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to open path [{}]: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to lock path [{}], held by another process", path.display())]
    Lock { path: PathBuf },

    #[error("device [{name}] is not open")]
    NotOpen { name: String },

    #[error("I/O error on device [{name}]: {message}")]
    Io { name: String, message: String },

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

impl DeviceError {
    pub fn io(name: &str, message: impl Into<String>) -> Self {
        DeviceError::Io {
            name: name.to_string(),
            message: message.into(),
        }
    }
}
