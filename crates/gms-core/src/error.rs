use thiserror::Error;

/// Errors produced by the game manager protocol layer.
#[derive(Debug, Error)]
pub enum GmsError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("disposed")]
    Disposed,

    #[error("relay timed out waiting for the authentication server")]
    RelayTimeout,

    #[error("construction error: {0}")]
    Construction(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ciborium::de::Error<std::io::Error>> for GmsError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        GmsError::Decode(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for GmsError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        GmsError::Encode(e.to_string())
    }
}

pub type GmsResult<T> = Result<T, GmsError>;
