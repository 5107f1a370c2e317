use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("invalid instance data: {0}")]
    InvalidInstance(String),

    #[error("registry log no longer covers version {since} (current {current})")]
    TooStale { since: u64, current: u64 },

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("configuration unavailable: {0}")]
    ConfigUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
