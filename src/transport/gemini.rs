use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::codec::EncodedFrame;
use crate::config::RemoteConfig;
use crate::error::{ParleyError, Result};

use super::protocol::{RealtimeInputMessage, ServerMessage, SetupMessage};
use super::{Credential, EventStream, FrameSink, LinkEvent, SessionSetup, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Gemini Live over a WebSocket.
#[derive(Debug, Clone)]
pub struct GeminiTransport {
    url: String,
    connect_timeout: Duration,
}

impl GeminiTransport {
    #[must_use]
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

impl Transport for GeminiTransport {
    type Sink = GeminiSink;
    type Events = GeminiEvents;

    fn connect(
        &self,
        setup: SessionSetup,
        credential: Credential,
    ) -> impl Future<Output = Result<(GeminiSink, GeminiEvents)>> + Send {
        let url = self.url.clone();
        let timeout = self.connect_timeout;
        async move {
            tokio::time::timeout(timeout, handshake(&url, &setup, &credential))
                .await
                .map_err(|_| {
                    ParleyError::Connect(format!("setup not completed within {}s", timeout.as_secs()))
                })?
        }
    }
}

async fn handshake(
    url: &str,
    setup: &SessionSetup,
    credential: &Credential,
) -> Result<(GeminiSink, GeminiEvents)> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ParleyError::Connect(format!("invalid service URL '{url}': {e}")))?;
    let key = HeaderValue::from_str(credential.secret())
        .map_err(|_| ParleyError::Config("API key contains invalid characters".to_string()))?;
    request.headers_mut().insert(API_KEY_HEADER, key);

    tracing::info!("connecting to {url} (model {})", setup.model);
    let (ws, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(describe_connect_error)?;
    tracing::debug!("websocket upgraded: {}", response.status());

    let (mut write, mut read) = ws.split();

    let setup_json = serde_json::to_string(&SetupMessage::from(setup))
        .map_err(|e| ParleyError::Connect(format!("failed to encode setup: {e}")))?;
    write
        .send(Message::Text(setup_json.into()))
        .await
        .map_err(|e| ParleyError::Connect(format!("failed to send setup: {e}")))?;

    loop {
        let message = match read.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(ParleyError::Connect(format!("setup failed: {e}"))),
            None => {
                return Err(ParleyError::Connect(
                    "connection ended before setup completed".to_string(),
                ));
            }
        };

        match message {
            Message::Text(_) | Message::Binary(_) => {
                let Some(payload) = payload(&message) else {
                    continue;
                };
                if ServerMessage::parse(payload)?.is_setup_complete() {
                    break;
                }
            }
            Message::Close(frame) => {
                let reason = frame.map_or_else(String::new, |f| f.reason.as_str().to_string());
                return Err(ParleyError::Connect(format!(
                    "server closed the connection during setup: {reason}"
                )));
            }
            _ => {}
        }
    }

    tracing::info!("session setup complete (voice {})", setup.voice);
    Ok((
        GeminiSink { write },
        GeminiEvents {
            read,
            pending: VecDeque::new(),
            finished: false,
        },
    ))
}

fn describe_connect_error(err: tungstenite::Error) -> ParleyError {
    match err {
        tungstenite::Error::Http(response) => {
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            ParleyError::Connect(format!("service rejected the connection ({}): {body}", response.status()))
        }
        other => ParleyError::Connect(format!("failed to connect: {other}")),
    }
}

fn payload(message: &Message) -> Option<&[u8]> {
    match message {
        Message::Text(text) => Some(text.as_str().as_bytes()),
        Message::Binary(bytes) => Some(&bytes[..]),
        _ => None,
    }
}

pub struct GeminiSink {
    write: SplitSink<WsStream, Message>,
}

impl FrameSink for GeminiSink {
    async fn send(&mut self, frame: EncodedFrame) -> Result<()> {
        let json = serde_json::to_string(&RealtimeInputMessage::from(&frame))
            .map_err(|e| ParleyError::Runtime(format!("failed to encode audio frame: {e}")))?;
        self.write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ParleyError::Runtime(format!("failed to send audio frame: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        self.write
            .close()
            .await
            .map_err(|e| ParleyError::Runtime(format!("failed to close connection: {e}")))
    }
}

pub struct GeminiEvents {
    read: SplitStream<WsStream>,
    pending: VecDeque<LinkEvent>,
    finished: bool,
}

impl EventStream for GeminiEvents {
    async fn next_event(&mut self) -> Option<LinkEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }

            let message = match self.read.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(LinkEvent::Failed(e.to_string()));
                }
                None => {
                    self.finished = true;
                    return Some(LinkEvent::Closed(None));
                }
            };

            if let Message::Close(frame) = &message {
                self.finished = true;
                let reason = frame
                    .as_ref()
                    .map(|f| f.reason.as_str().to_string())
                    .filter(|r| !r.is_empty());
                return Some(LinkEvent::Closed(reason));
            }

            let Some(bytes) = payload(&message) else {
                continue;
            };

            match ServerMessage::parse(bytes) {
                Ok(parsed) => self
                    .pending
                    .extend(parsed.into_events().into_iter().map(LinkEvent::Message)),
                Err(e) => tracing::warn!("{e}"),
            }
        }
    }
}
