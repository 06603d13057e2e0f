use std::fmt;

/// Connection state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// A session is pending or running.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Everything the presentation layer observes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Microphone loudness in [0, 1]; zero whenever no session is connected.
    pub volume: f32,
    /// User-facing message of the last failure.
    pub error: Option<String>,
    /// Persona the next `start` will use.
    pub persona: String,
}
