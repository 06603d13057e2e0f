use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    #[error("microphone permission denied: {0}")]
    Permission(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("session error: {0}")]
    Runtime(String),

    #[error("audio error: {0}")]
    Audio(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ParleyError {
    /// Short message suitable for showing next to the call button.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Permission(_) => "Microphone access was denied.".to_string(),
            Self::Config(msg) => msg.clone(),
            Self::Connect(_) | Self::Audio(_) | Self::Resample(_) => {
                "Failed to access microphone or connect.".to_string()
            }
            Self::Runtime(_) => "Connection lost. Please try again.".to_string(),
            Self::Codec(_) | Self::Io(_) => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
