pub mod gemini;
pub mod protocol;

use std::fmt;
use std::future::Future;

use crate::codec::EncodedFrame;
use crate::error::{ParleyError, Result};
use crate::persona::Persona;

/// Output modality requested from the remote model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Audio,
}

impl Modality {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
        }
    }
}

/// Everything the remote side needs to open a session. Fixed for the
/// session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub modalities: Vec<Modality>,
    pub instructions: String,
    pub voice: String,
}

impl SessionSetup {
    #[must_use]
    pub fn for_persona(model: &str, persona: &Persona) -> Self {
        Self {
            model: model.to_string(),
            modalities: vec![Modality::Audio],
            instructions: persona.instructions.clone(),
            voice: persona.voice.clone(),
        }
    }
}

/// Bearer secret for the remote service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Where the session manager finds its credential on each start.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Read the named environment variable at call time.
    Env(String),
    /// A secret supplied by the embedding program.
    Inline(Credential),
}

impl CredentialSource {
    /// Resolve the credential. A missing or blank variable is a config error.
    pub fn resolve(&self) -> Result<Credential> {
        match self {
            Self::Env(var) => match std::env::var(var) {
                Ok(value) if !value.trim().is_empty() => Ok(Credential::new(value.trim())),
                _ => Err(ParleyError::Config(format!(
                    "API key not found in environment variable {var}"
                ))),
            },
            Self::Inline(credential) => Ok(credential.clone()),
        }
    }
}

/// A notification from the remote agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The user started talking over the agent; queued playback must stop.
    Interrupted,
    /// Base64 PCM audio.
    Audio {
        data: String,
        mime_type: Option<String>,
    },
    TurnComplete,
    /// The server will close the connection soon.
    GoAway { time_left: Option<String> },
    Other,
}

/// What the receive half of a link can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message(ServerEvent),
    Closed(Option<String>),
    Failed(String),
}

/// Send half of a connected session.
pub trait FrameSink: Send + 'static {
    fn send(&mut self, frame: EncodedFrame) -> impl Future<Output = Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Receive half of a connected session. `None` once the link is finished.
pub trait EventStream: Send + 'static {
    fn next_event(&mut self) -> impl Future<Output = Option<LinkEvent>> + Send;
}

/// A remote real-time speech service.
pub trait Transport: Send + Sync + 'static {
    type Sink: FrameSink;
    type Events: EventStream;

    /// Open a session and complete its setup handshake.
    fn connect(
        &self,
        setup: SessionSetup,
        credential: Credential,
    ) -> impl Future<Output = Result<(Self::Sink, Self::Events)>> + Send;
}
