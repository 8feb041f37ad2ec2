use thiserror::Error;

/// Errors raised by the concrete adapters. Crosses the trait seams boxed and
/// is recovered by `weigh_core::io_error::map_io_error`.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("serial: {0}")]
    Serial(String),
    #[error("mqtt: {0}")]
    Mqtt(String),
    #[error("http: {0}")]
    Http(String),
    #[error("http status: {0}")]
    Status(String),
    #[error("print command: {0}")]
    PrintCommand(String),
    #[error("operation timed out")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for IoError {
    fn from(e: serialport::Error) -> Self {
        Self::Serial(e.to_string())
    }
}

impl From<reqwest::Error> for IoError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Status(status.to_string()),
            None => Self::Http(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, IoError>;
