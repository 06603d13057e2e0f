//! Lifecycle of one real-time voice session.
//!
//! [`SessionManager`] is an actor: commands, handshake results, link events,
//! capture volume and playback completions all arrive as messages on the
//! task running [`SessionManager::run`]. Every message produced on behalf of
//! a session carries that session's generation, so anything arriving after
//! a teardown is recognized as stale and dropped.

#[cfg(test)]
mod fakes;
pub mod link;
pub mod state;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::capture::{CaptureGraph, CaptureSettings};
use crate::audio::{AudioBackend, InputContext, Microphone};
use crate::codec::{self, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::config::Config;
use crate::error::{ParleyError, Result};
use crate::persona::{Persona, PersonaRegistry};
use crate::playback::{HandleId, OutputContext, PlaybackScheduler};
use crate::transport::{
    Credential, CredentialSource, LinkEvent, ServerEvent, SessionSetup, Transport,
};

use self::link::LinkHandle;
pub use self::state::{ConnectionState, SessionStatus};

/// Requests accepted by [`SessionManager::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    /// Start when idle, stop when connecting or connected.
    Toggle,
    SwitchPersona(String),
    Shutdown,
}

/// Session parameters that do not change between calls.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub credentials: CredentialSource,
    pub capture: CaptureSettings,
    pub outbound_queue: usize,
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.remote.model.clone(),
            credentials: CredentialSource::Env(config.remote.api_key_env.clone()),
            capture: CaptureSettings {
                target_rate: CAPTURE_SAMPLE_RATE,
                block_size: config.audio.block_size,
                volume_gain: config.audio.volume_gain,
                drop_policy: config.session.drop_policy,
            },
            outbound_queue: config.session.outbound_queue,
        }
    }

    /// Reject settings the capture graph or the outbound queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue == 0 {
            return Err(ParleyError::Config(
                "outbound queue must hold at least one frame".to_string(),
            ));
        }
        if self.capture.block_size == 0 {
            return Err(ParleyError::Config("capture block size must be greater than zero".to_string()));
        }
        let gain = self.capture.volume_gain;
        if !gain.is_finite() || gain < 0.0 {
            return Err(ParleyError::Config(format!(
                "volume gain must be a non-negative number, got {gain}"
            )));
        }
        Ok(())
    }
}

enum SessionEvent<T: Transport> {
    Ready(T::Sink, T::Events),
    ConnectFailed(ParleyError),
    Link(LinkEvent),
    Volume(f32),
}

struct Tagged<T: Transport> {
    generation: u64,
    event: SessionEvent<T>,
}

/// Resources of the pending or running session. Each one is released in
/// exactly one place, [`SessionManager::teardown`].
struct LiveSession<B: AudioBackend> {
    generation: u64,
    persona: Persona,
    pending: Option<JoinHandle<()>>,
    link: Option<LinkHandle>,
    microphone: Option<B::Microphone>,
    input: Option<B::Input>,
    capture: Option<CaptureGraph>,
}

impl<B: AudioBackend> LiveSession<B> {
    const fn new(generation: u64, persona: Persona) -> Self {
        Self {
            generation,
            persona,
            pending: None,
            link: None,
            microphone: None,
            input: None,
            capture: None,
        }
    }
}

pub struct SessionManager<T: Transport, B: AudioBackend> {
    transport: Arc<T>,
    backend: B,
    personas: PersonaRegistry,
    selected: String,
    settings: SessionSettings,
    status: watch::Sender<SessionStatus>,
    generation: u64,
    session: Option<LiveSession<B>>,
    scheduler: PlaybackScheduler<B::Output>,
    events_tx: mpsc::UnboundedSender<Tagged<T>>,
    events_rx: mpsc::UnboundedReceiver<Tagged<T>>,
    ended_tx: mpsc::UnboundedSender<HandleId>,
    ended_rx: mpsc::UnboundedReceiver<HandleId>,
    teardowns: u64,
}

impl<T: Transport, B: AudioBackend> SessionManager<T, B> {
    pub fn new(
        transport: T,
        backend: B,
        personas: PersonaRegistry,
        persona: &str,
        settings: SessionSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let selected = personas.require(persona)?.id.clone();
        let (status, _) = watch::channel(SessionStatus {
            persona: selected.clone(),
            ..SessionStatus::default()
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();

        Ok(Self {
            transport: Arc::new(transport),
            backend,
            personas,
            selected,
            settings,
            status,
            generation: 0,
            session: None,
            scheduler: PlaybackScheduler::new(),
            events_tx,
            events_rx,
            ended_tx,
            ended_rx,
            teardowns: 0,
        })
    }

    /// Receive every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    #[must_use]
    pub fn personas(&self) -> &PersonaRegistry {
        &self.personas
    }

    /// Sessions torn down so far.
    #[must_use]
    pub const fn teardowns(&self) -> u64 {
        self.teardowns
    }

    #[must_use]
    pub const fn scheduler(&self) -> &PlaybackScheduler<B::Output> {
        &self.scheduler
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| {
            s.state = state;
            if state != ConnectionState::Connected {
                s.volume = 0.0;
            }
        });
    }

    /// Start a session with the selected persona.
    ///
    /// Ignored while a session is pending or running. Failures are reported
    /// through the status, never returned.
    pub async fn start(&mut self) {
        let state = self.state();
        if state.is_live() {
            tracing::warn!("start ignored, session already {state}");
            return;
        }

        self.status.send_modify(|s| s.error = None);

        let persona = match self.personas.require(&self.selected) {
            Ok(persona) => persona.clone(),
            Err(e) => return self.reject(&e),
        };
        let credential = match self.settings.credentials.resolve() {
            Ok(credential) => credential,
            Err(e) => return self.reject(&e),
        };

        self.generation += 1;
        let generation = self.generation;
        tracing::info!("starting session {generation} as {} ({})", persona.name, persona.id);

        self.set_state(ConnectionState::Connecting);
        self.session = Some(LiveSession::new(generation, persona.clone()));

        if let Err(e) = self.acquire(generation, &persona, credential).await {
            self.fail(&e).await;
        }
    }

    /// A start that never got going: nothing was acquired.
    fn reject(&self, err: &ParleyError) {
        tracing::error!("cannot start session: {err}");
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.volume = 0.0;
            s.error = Some(err.user_message());
        });
    }

    async fn acquire(&mut self, generation: u64, persona: &Persona, credential: Credential) -> Result<()> {
        let input = self.backend.open_input(CAPTURE_SAMPLE_RATE)?;
        let session = self.live_mut(generation)?;
        session.input = Some(input);

        let output = self
            .backend
            .open_output(PLAYBACK_SAMPLE_RATE, self.ended_tx.clone())?;
        self.scheduler.attach(output);

        let microphone = {
            let input = self
                .session
                .as_ref()
                .and_then(|s| s.input.as_ref())
                .ok_or_else(|| ParleyError::Runtime("input context released during start".to_string()))?;
            self.backend.request_microphone(input).await?
        };
        self.live_mut(generation)?.microphone = Some(microphone);

        let setup = SessionSetup::for_persona(&self.settings.model, persona);
        let transport = Arc::clone(&self.transport);
        let events = self.events_tx.clone();
        let pending = tokio::spawn(async move {
            let event = match transport.connect(setup, credential).await {
                Ok((sink, stream)) => SessionEvent::Ready(sink, stream),
                Err(e) => SessionEvent::ConnectFailed(e),
            };
            let _ = events.send(Tagged { generation, event });
        });
        self.live_mut(generation)?.pending = Some(pending);

        Ok(())
    }

    fn live_mut(&mut self, generation: u64) -> Result<&mut LiveSession<B>> {
        self.session
            .as_mut()
            .filter(|s| s.generation == generation)
            .ok_or_else(|| ParleyError::Runtime(format!("session {generation} is gone")))
    }

    /// The handshake finished: start the link and wire the capture graph.
    async fn on_ready(&mut self, generation: u64, sink: T::Sink, stream: T::Events) -> Result<()> {
        let (frames_tx, frames_rx) = mpsc::channel(self.settings.outbound_queue);
        let events = self.events_tx.clone();
        let link = LinkHandle::spawn(sink, stream, frames_rx, move |event| {
            let _ = events.send(Tagged {
                generation,
                event: SessionEvent::Link(event),
            });
        });

        let capture = self.settings.capture;
        let volume_events = self.events_tx.clone();
        let session = self.live_mut(generation)?;
        session.pending = None;
        session.link = Some(link);

        let (Some(microphone), Some(input)) = (session.microphone.as_ref(), session.input.as_ref()) else {
            return Err(ParleyError::Runtime("audio released before connect completed".to_string()));
        };
        let settings = CaptureSettings {
            target_rate: input.sample_rate(),
            ..capture
        };
        let graph = CaptureGraph::spawn(
            microphone.receiver(),
            microphone.format(),
            settings,
            frames_tx,
            move |volume| {
                let _ = volume_events.send(Tagged {
                    generation,
                    event: SessionEvent::Volume(volume),
                });
            },
        )?;
        microphone.resume()?;
        session.capture = Some(graph);

        self.set_state(ConnectionState::Connected);
        tracing::info!("session {generation} connected");
        Ok(())
    }

    /// Release everything and end in `Disconnected`. Safe in any state.
    pub async fn stop(&mut self) {
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Release everything and end in `Error` with a user-facing message.
    async fn fail(&mut self, err: &ParleyError) {
        tracing::error!("session failed: {err}");
        self.teardown().await;
        self.status.send_modify(|s| {
            s.state = ConnectionState::Error;
            s.volume = 0.0;
            s.error = Some(err.user_message());
        });
    }

    async fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            self.scheduler.flush();
            return;
        };
        self.teardowns += 1;
        tracing::info!("tearing down session {} ({})", session.generation, session.persona.id);

        if let Some(pending) = session.pending.take() {
            pending.abort();
        }
        if let Some(link) = session.link.take() {
            link.close();
        }
        if let Some(microphone) = session.microphone.take() {
            microphone.stop();
        }
        if let Some(input) = session.input.take()
            && let Err(e) = input.close().await
        {
            tracing::warn!("failed to close input: {e}");
        }
        if let Some(output) = self.scheduler.detach()
            && let Err(e) = output.close().await
        {
            tracing::warn!("failed to close output: {e}");
        }
        if let Some(capture) = session.capture.take() {
            capture.disconnect();
        }
        self.scheduler.flush();
    }

    /// Select the persona for the next start. A pending or running session
    /// is torn down first, since its configuration cannot change in place.
    pub async fn switch_persona(&mut self, id: &str) -> Result<()> {
        let id = self.personas.require(id)?.id.clone();
        if self.state().is_live() {
            tracing::info!("switching persona to {id}, ending current session");
            self.stop().await;
        }
        self.status.send_modify(|s| s.persona.clone_from(&id));
        self.selected = id;
        Ok(())
    }

    pub async fn toggle(&mut self) {
        if self.state().is_live() {
            self.stop().await;
        } else {
            self.start().await;
        }
    }

    async fn handle(&mut self, tagged: Tagged<T>) {
        let Tagged { generation, event } = tagged;
        if self.session.as_ref().is_none_or(|s| s.generation != generation) {
            tracing::trace!("dropping event of stale session {generation}");
            return;
        }

        match event {
            SessionEvent::Ready(sink, stream) => {
                if let Err(e) = self.on_ready(generation, sink, stream).await {
                    self.fail(&e).await;
                }
            }
            SessionEvent::ConnectFailed(e) => self.fail(&e).await,
            SessionEvent::Volume(volume) => {
                if self.state() == ConnectionState::Connected {
                    self.status.send_if_modified(|s| {
                        let changed = (s.volume - volume).abs() > f32::EPSILON;
                        s.volume = volume;
                        changed
                    });
                }
            }
            SessionEvent::Link(LinkEvent::Message(event)) => self.on_server_event(generation, event),
            SessionEvent::Link(LinkEvent::Closed(reason)) => {
                tracing::info!(
                    "remote closed session {generation}{}",
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                );
                self.stop().await;
            }
            SessionEvent::Link(LinkEvent::Failed(message)) => {
                self.fail(&ParleyError::Runtime(message)).await;
            }
        }
    }

    fn on_server_event(&mut self, generation: u64, event: ServerEvent) {
        match event {
            ServerEvent::Interrupted => {
                tracing::debug!("interrupted, flushing {} buffer(s)", self.scheduler.scheduled_len());
                self.scheduler.flush();
            }
            ServerEvent::Audio { data, mime_type } => {
                match codec::decode(&data, mime_type.as_deref()) {
                    Ok(buffer) => {
                        if let Err(e) = self.scheduler.enqueue(generation, buffer) {
                            tracing::warn!("failed to schedule audio: {e}");
                        }
                    }
                    Err(e) => tracing::warn!("skipping audio chunk: {e}"),
                }
            }
            ServerEvent::TurnComplete => tracing::debug!("turn complete"),
            ServerEvent::GoAway { time_left } => {
                tracing::warn!(
                    "server is ending the session soon (time left: {})",
                    time_left.as_deref().unwrap_or("unknown")
                );
            }
            ServerEvent::Other => {}
        }
    }

    /// Returns false once the loop should exit.
    async fn execute(&mut self, command: Command) -> bool {
        tracing::debug!("command: {command:?}");
        match command {
            Command::Start => self.start().await,
            Command::Stop => self.stop().await,
            Command::Toggle => self.toggle().await,
            Command::SwitchPersona(id) => {
                if let Err(e) = self.switch_persona(&id).await {
                    tracing::warn!("{e}");
                    self.status.send_modify(|s| s.error = Some(e.user_message()));
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// Drive the manager until `Shutdown` or until every command sender is
    /// gone. Any live session is stopped on the way out.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.execute(command).await {
                        break;
                    }
                }
                Some(tagged) = self.events_rx.recv() => self.handle(tagged).await,
                Some(id) = self.ended_rx.recv() => self.scheduler.complete(id),
            }
        }

        self.stop().await;
        tracing::debug!("session manager stopped");
    }

    /// Handle the next queued session event, waiting up to a second for it.
    #[cfg(test)]
    async fn settle(&mut self) -> bool {
        let next = tokio::time::timeout(std::time::Duration::from_secs(1), self.events_rx.recv()).await;
        match next {
            Ok(Some(tagged)) => {
                self.handle(tagged).await;
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    const fn has_session(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::fakes::{FakeBackend, FakeTransport};
    use super::*;
    use crate::codec::PlaybackBuffer;
    use crate::config::DropPolicy;
    use crate::playback::testing::ManualOutput;

    type Manager = SessionManager<FakeTransport, FakeBackend>;

    fn settings(credentials: CredentialSource) -> SessionSettings {
        SessionSettings {
            model: "test-model".to_string(),
            credentials,
            capture: CaptureSettings {
                target_rate: CAPTURE_SAMPLE_RATE,
                block_size: 4,
                volume_gain: 5.0,
                drop_policy: DropPolicy::Drop,
            },
            outbound_queue: 4,
        }
    }

    fn manager_with(backend: &FakeBackend, transport: &FakeTransport) -> Manager {
        let personas = PersonaRegistry::new(&[]).unwrap_or_else(|e| panic!("{e}"));
        SessionManager::new(
            transport.clone(),
            backend.clone(),
            personas,
            "intake",
            settings(CredentialSource::Inline(Credential::new("test-key"))),
        )
        .unwrap_or_else(|e| panic!("{e}"))
    }

    async fn connected() -> (Manager, FakeBackend, FakeTransport) {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let mut manager = manager_with(&backend, &transport);
        manager.start().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(manager.settle().await);
        assert_eq!(manager.state(), ConnectionState::Connected);
        (manager, backend, transport)
    }

    fn output(backend: &FakeBackend) -> ManualOutput {
        backend
            .log()
            .outputs
            .last()
            .cloned()
            .unwrap_or_else(|| panic!("no output opened"))
    }

    fn audio_event(samples: usize) -> LinkEvent {
        let frame = codec::encode(&vec![0.1; samples]);
        LinkEvent::Message(ServerEvent::Audio {
            data: frame.data,
            mime_type: Some("audio/pcm;rate=24000".to_string()),
        })
    }

    fn released(manager: &Manager, backend: &FakeBackend) -> bool {
        !manager.has_session()
            && !manager.scheduler().is_attached()
            && manager.scheduler().scheduled_len() == 0
            && backend.all_released()
    }

    #[tokio::test]
    async fn start_then_stop_while_connecting_releases_everything() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let mut manager = manager_with(&backend, &transport);

        manager.start().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.stop().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(released(&manager, &backend));

        // A handshake finishing after the stop is stale.
        tokio::time::sleep(Duration::from_millis(20)).await;
        while manager.settle_now().await {}
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(released(&manager, &backend));
    }

    #[tokio::test]
    async fn start_then_stop_while_connected_releases_everything() {
        let (mut manager, backend, transport) = connected().await;
        manager.stop().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!((manager.status().volume).abs() < f32::EPSILON);
        assert!(released(&manager, &backend));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.log().sinks_closed, 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let mut manager = manager_with(&backend, &transport);

        manager.stop().await;
        manager.stop().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.teardowns(), 0);
    }

    #[tokio::test]
    async fn setup_carries_persona_and_credential() {
        let (_manager, _backend, transport) = connected().await;
        let log = transport.log();
        assert_eq!(log.setups[0].voice, "Kore");
        assert_eq!(log.setups[0].model, "test-model");
        assert!(log.setups[0].instructions.starts_with("You are Sarah"));
        assert_eq!(log.credentials[0].secret(), "test-key");
    }

    #[tokio::test]
    async fn interruption_flushes_playback_and_stays_connected() {
        let (mut manager, backend, transport) = connected().await;
        let out = output(&backend);
        out.set_time(1.0);

        for _ in 0..3 {
            transport.push(audio_event(2400));
            assert!(manager.settle().await);
        }
        assert_eq!(manager.scheduler().scheduled_len(), 3);
        assert!((manager.scheduler().cursor() - 1.3).abs() < 1e-6);

        transport.push(LinkEvent::Message(ServerEvent::Interrupted));
        assert!(manager.settle().await);

        assert_eq!(manager.scheduler().scheduled_len(), 0);
        assert!(manager.scheduler().cursor().abs() < f64::EPSILON);
        assert_eq!(out.lock().stopped.len(), 3);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn inbound_chunks_play_back_to_back() {
        let (mut manager, backend, transport) = connected().await;
        transport.push(audio_event(4800));
        transport.push(audio_event(2400));
        assert!(manager.settle().await);
        assert!(manager.settle().await);

        let log = output(&backend);
        let log = log.lock();
        let (_, a_start, a_len) = log.started[0];
        let (_, b_start, _) = log.started[1];
        assert!(b_start >= a_start + a_len - 1e-9);
    }

    #[tokio::test]
    async fn malformed_audio_is_skipped() {
        let (mut manager, backend, transport) = connected().await;
        transport.push(LinkEvent::Message(ServerEvent::Audio {
            data: "!!not base64!!".to_string(),
            mime_type: None,
        }));
        transport.push(LinkEvent::Message(ServerEvent::Audio {
            data: "AA==".to_string(),
            mime_type: None,
        }));
        transport.push(audio_event(240));
        for _ in 0..3 {
            assert!(manager.settle().await);
        }

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(output(&backend).lock().started.len(), 1);
    }

    #[tokio::test]
    async fn remote_close_disconnects() {
        let (mut manager, backend, transport) = connected().await;
        transport.push(LinkEvent::Closed(Some("session over".to_string())));
        assert!(manager.settle().await);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.status().error.is_none());
        assert!(released(&manager, &backend));
    }

    #[tokio::test]
    async fn remote_failure_is_an_error_with_cleanup() {
        let (mut manager, backend, transport) = connected().await;
        transport.push(LinkEvent::Failed("reset by peer".to_string()));
        assert!(manager.settle().await);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.error.as_deref(), Some("Connection lost. Please try again."));
        assert!(released(&manager, &backend));
    }

    #[tokio::test]
    async fn missing_credential_never_touches_the_microphone() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let personas = PersonaRegistry::new(&[]).unwrap_or_else(|e| panic!("{e}"));
        let mut manager = SessionManager::new(
            transport.clone(),
            backend.clone(),
            personas,
            "intake",
            settings(CredentialSource::Env("PARLEY_TEST_KEY_THAT_IS_NEVER_SET".to_string())),
        )
        .unwrap_or_else(|e| panic!("{e}"));

        manager.start().await;

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.error.is_some_and(|e| e.contains("PARLEY_TEST_KEY_THAT_IS_NEVER_SET")));
        assert_eq!(backend.log().microphone_requests, 0);
        assert_eq!(transport.log().connects, 0);
        assert!(released(&manager, &backend));
    }

    #[tokio::test]
    async fn denied_microphone_rolls_back() {
        let backend = FakeBackend {
            deny_microphone: true,
            ..FakeBackend::default()
        };
        let transport = FakeTransport::default();
        let mut manager = manager_with(&backend, &transport);

        manager.start().await;

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.error.as_deref(), Some("Microphone access was denied."));
        assert_eq!(transport.log().connects, 0);
        assert!(released(&manager, &backend));
    }

    #[tokio::test]
    async fn refused_handshake_rolls_back() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        transport.log().refuse = true;
        let mut manager = manager_with(&backend, &transport);

        manager.start().await;
        assert!(manager.settle().await);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert_eq!(status.error.as_deref(), Some("Failed to access microphone or connect."));
        assert!(released(&manager, &backend));

        // The next start resets the error.
        transport.log().refuse = false;
        manager.start().await;
        assert!(manager.status().error.is_none());
        assert!(manager.settle().await);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn double_start_keeps_one_session() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let mut manager = manager_with(&backend, &transport);

        manager.start().await;
        manager.start().await;
        assert!(manager.settle().await);
        manager.start().await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.log().connects, 1);
        assert_eq!(backend.log().inputs_open, 1);
        assert_eq!(backend.log().microphones_live, 1);
    }

    #[tokio::test]
    async fn switch_while_connected_tears_down_once() {
        let (mut manager, backend, _transport) = connected().await;

        manager.switch_persona("evaluator").await.unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(manager.teardowns(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.status().persona, "evaluator");
        assert!(released(&manager, &backend));
    }

    #[tokio::test]
    async fn switch_while_connecting_tears_down_once() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let mut manager = manager_with(&backend, &transport);

        manager.start().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        let abandoned = manager.generation;

        manager.switch_persona("evaluator").await.unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(manager.teardowns(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.status().persona, "evaluator");
        assert!(released(&manager, &backend));

        // A handshake of the abandoned session completing now changes nothing.
        let persona = manager.personas().require("intake").unwrap_or_else(|e| panic!("{e}")).clone();
        let (sink, events) = transport
            .connect(SessionSetup::for_persona("test-model", &persona), Credential::new("test-key"))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        let _ = manager.events_tx.send(Tagged {
            generation: abandoned,
            event: SessionEvent::Ready(sink, events),
        });
        assert!(manager.settle().await);
        while manager.settle_now().await {}

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.teardowns(), 1);
        assert!(released(&manager, &backend));
    }

    #[test]
    fn unusable_settings_are_rejected() {
        let mut empty_queue = settings(CredentialSource::Inline(Credential::new("test-key")));
        empty_queue.outbound_queue = 0;
        let mut nan_gain = settings(CredentialSource::Inline(Credential::new("test-key")));
        nan_gain.capture.volume_gain = f32::NAN;

        for bad in [empty_queue, nan_gain] {
            let personas = PersonaRegistry::new(&[]).unwrap_or_else(|e| panic!("{e}"));
            let result = SessionManager::new(
                FakeTransport::default(),
                FakeBackend::default(),
                personas,
                "intake",
                bad,
            );
            assert!(matches!(result.map(|_| ()), Err(ParleyError::Config(_))));
        }
    }

    #[tokio::test]
    async fn switch_while_disconnected_does_not_tear_down() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let mut manager = manager_with(&backend, &transport);

        manager.switch_persona("evaluator").await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(manager.teardowns(), 0);

        manager.start().await;
        assert!(manager.settle().await);
        assert_eq!(transport.log().setups[0].voice, "Fenrir");
    }

    #[tokio::test]
    async fn unknown_persona_is_rejected_without_teardown() {
        let (mut manager, _backend, _transport) = connected().await;
        assert!(manager.switch_persona("paralegal").await.is_err());
        assert_eq!(manager.teardowns(), 0);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.status().persona, "intake");
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let (mut manager, backend, transport) = connected().await;
        let old_server = transport.log().server.clone();
        manager.stop().await;

        manager.start().await;
        assert!(manager.settle().await);
        assert_eq!(manager.state(), ConnectionState::Connected);

        // The first session's link was closed; events pushed on its channel
        // after the teardown never reach the new session.
        if let Some(server) = old_server {
            let _ = server.send(LinkEvent::Failed("late".to_string()));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        while manager.settle_now().await {}
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(backend.log().inputs_open, 1);
    }

    #[tokio::test]
    async fn captured_audio_reaches_the_link_and_updates_volume() {
        let (mut manager, backend, transport) = connected().await;

        let raw = backend.log().raw.clone().unwrap_or_else(|| panic!("no microphone"));
        raw.send(vec![0.1; 4]).unwrap_or_else(|e| panic!("{e}"));

        assert!(manager.settle().await);
        assert!((manager.status().volume - 0.5).abs() < 1e-3);

        for _ in 0..200 {
            if !transport.log().sent.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let log = transport.log();
        assert_eq!(log.sent.len(), 1);
        let decoded: PlaybackBuffer =
            codec::decode(&log.sent[0].data, Some(log.sent[0].mime_type)).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(decoded.samples.len(), 4);
    }

    #[tokio::test]
    async fn toggle_starts_and_stops() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let mut manager = manager_with(&backend, &transport);

        manager.toggle().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);
        manager.toggle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(released(&manager, &backend));
    }

    #[tokio::test]
    async fn run_loop_processes_commands_until_shutdown() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let manager = manager_with(&backend, &transport);
        let mut status = manager.subscribe();
        let (tx, rx) = mpsc::channel(8);

        let driver = async {
            tx.send(Command::Start).await.unwrap_or_else(|e| panic!("{e}"));
            let connected = tokio::time::timeout(
                Duration::from_secs(1),
                status.wait_for(|s| s.state == ConnectionState::Connected),
            )
            .await
            .map(|r| r.is_ok());
            assert_eq!(connected, Ok(true));
            tx.send(Command::Shutdown).await.unwrap_or_else(|e| panic!("{e}"));
        };
        tokio::join!(manager.run(rx), driver);

        assert_eq!(status.borrow().state, ConnectionState::Disconnected);
        assert!(backend.all_released());
    }

    #[tokio::test]
    async fn buffers_that_play_out_leave_the_schedule() {
        let backend = FakeBackend::default();
        let transport = FakeTransport::default();
        let manager = manager_with(&backend, &transport);
        let mut status = manager.subscribe();
        let (tx, rx) = mpsc::channel(8);

        let driver = async {
            tx.send(Command::Start).await.unwrap_or_else(|e| panic!("{e}"));
            let connected = tokio::time::timeout(
                Duration::from_secs(1),
                status.wait_for(|s| s.state == ConnectionState::Connected),
            )
            .await
            .map(|r| r.is_ok());
            assert_eq!(connected, Ok(true));

            transport.push(audio_event(2400));
            transport.push(audio_event(2400));
            let out = output(&backend);
            for _ in 0..200 {
                if out.lock().started.len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let started: Vec<HandleId> = out.lock().started.iter().map(|(id, _, _)| *id).collect();
            assert_eq!(started.len(), 2);

            out.finish(started[0]);
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(Command::Shutdown).await.unwrap_or_else(|e| panic!("{e}"));
            (out, started)
        };
        let ((), (out, started)) = tokio::join!(manager.run(rx), driver);

        // Only the buffer still playing is stopped by the final teardown.
        assert_eq!(out.lock().stopped, vec![started[1]]);
        assert!(backend.all_released());
    }

    impl Manager {
        /// Handle whatever is already queued without waiting.
        async fn settle_now(&mut self) -> bool {
            match self.events_rx.try_recv() {
                Ok(tagged) => {
                    self.handle(tagged).await;
                    true
                }
                Err(_) => false,
            }
        }
    }
}
