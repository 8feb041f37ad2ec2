use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("print error: {0}")]
    Print(String),
    #[error("invalid state: {0}")]
    State(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing sample source")]
    MissingSource,
    #[error("missing broker connector")]
    MissingBroker,
    #[error("missing event transport")]
    MissingEvents,
    #[error("missing printer")]
    MissingPrinter,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
