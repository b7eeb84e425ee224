use thiserror::Error;

#[derive(Debug, Error)]
pub enum MockingbirdError {
    #[error("Malformed instruction: {0}")]
    MalformedInstruction(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// The wire stream closed before the end-of-stream sentinel was seen.
    #[error("Stream ended without end-of-stream sentinel")]
    StreamTruncated,

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MockingbirdError {
    /// Short machine-readable name, used in error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedInstruction(_) => "malformed_instruction",
            Self::Config(_) => "config",
            Self::Transport(_) => "transport",
            Self::StreamTruncated => "stream_truncated",
            Self::Cancelled => "cancelled",
            Self::Tool(_) => "tool",
            Self::Session(_) => "session",
            Self::Io(_) | Self::Json(_) | Self::Other(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, MockingbirdError>;
