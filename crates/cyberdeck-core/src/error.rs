use thiserror::Error;

/// Errors produced by the cyberdeck protocol and session layers.
#[derive(Debug, Error)]
pub enum DeckError {
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("Another user is already connected")]
    SessionConflict,

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl DeckError {
    /// Numeric code carried in `error` frames sent to the client.
    pub fn code(&self) -> u16 {
        match self {
            DeckError::AccessDenied(_) => 403,
            DeckError::SessionConflict => 423,
            DeckError::InvalidMessage(_) | DeckError::Codec(_) => 400,
            DeckError::Spawn(_)
            | DeckError::Transport(_)
            | DeckError::Config(_)
            | DeckError::Io(_)
            | DeckError::Other(_) => 500,
        }
    }
}

impl From<serde_json::Error> for DeckError {
    fn from(e: serde_json::Error) -> Self {
        DeckError::Codec(e.to_string())
    }
}

pub type DeckResult<T> = Result<T, DeckError>;
