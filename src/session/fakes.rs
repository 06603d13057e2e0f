//! In-memory audio devices and remote service for driving the session
//! manager in tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tokio::sync::mpsc;

use crate::audio::{AudioBackend, InputContext, Microphone};
use crate::codec::EncodedFrame;
use crate::error::{ParleyError, Result};
use crate::playback::HandleId;
use crate::playback::testing::ManualOutput;
use crate::transport::{Credential, EventStream, FrameSink, LinkEvent, SessionSetup, Transport};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct DeviceLog {
    pub inputs_open: usize,
    pub microphones_live: usize,
    pub microphone_requests: usize,
    pub outputs: Vec<ManualOutput>,
    /// Raw sample feed of the most recent microphone.
    pub raw: Option<Sender<Vec<f32>>>,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    pub log: Arc<Mutex<DeviceLog>>,
    pub deny_microphone: bool,
}

impl FakeBackend {
    pub fn log(&self) -> MutexGuard<'_, DeviceLog> {
        lock(&self.log)
    }

    /// Every resource ever opened has been released.
    pub fn all_released(&self) -> bool {
        let log = self.log();
        log.inputs_open == 0
            && log.microphones_live == 0
            && log.outputs.iter().all(|o| o.lock().closed)
    }
}

pub struct FakeInput {
    rate: u32,
    log: Arc<Mutex<DeviceLog>>,
}

impl InputContext for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    async fn close(self) -> Result<()> {
        lock(&self.log).inputs_open -= 1;
        Ok(())
    }
}

pub struct FakeMicrophone {
    rx: Receiver<Vec<f32>>,
    log: Arc<Mutex<DeviceLog>>,
}

impl Microphone for FakeMicrophone {
    fn format(&self) -> (u32, u16) {
        (16_000, 1)
    }

    fn receiver(&self) -> Receiver<Vec<f32>> {
        self.rx.clone()
    }

    fn resume(&self) -> Result<()> {
        Ok(())
    }

    fn stop(self) {
        let mut log = lock(&self.log);
        log.microphones_live -= 1;
        log.raw = None;
    }
}

impl AudioBackend for FakeBackend {
    type Input = FakeInput;
    type Microphone = FakeMicrophone;
    type Output = ManualOutput;

    fn open_input(&self, sample_rate: u32) -> Result<FakeInput> {
        self.log().inputs_open += 1;
        Ok(FakeInput {
            rate: sample_rate,
            log: Arc::clone(&self.log),
        })
    }

    fn open_output(&self, _sample_rate: u32, ended: mpsc::UnboundedSender<HandleId>) -> Result<ManualOutput> {
        let output = ManualOutput::reporting_to(ended);
        self.log().outputs.push(output.clone());
        Ok(output)
    }

    async fn request_microphone(&self, _input: &FakeInput) -> Result<FakeMicrophone> {
        let mut log = self.log();
        log.microphone_requests += 1;
        if self.deny_microphone {
            return Err(ParleyError::Permission("denied by user".to_string()));
        }
        let (tx, rx) = unbounded();
        log.microphones_live += 1;
        log.raw = Some(tx);
        Ok(FakeMicrophone {
            rx,
            log: Arc::clone(&self.log),
        })
    }
}

#[derive(Default)]
pub struct RemoteLog {
    pub connects: usize,
    pub setups: Vec<SessionSetup>,
    pub credentials: Vec<Credential>,
    pub refuse: bool,
    pub sent: Vec<EncodedFrame>,
    pub sinks_closed: usize,
    /// Inbound side of the most recent connection.
    pub server: Option<mpsc::UnboundedSender<LinkEvent>>,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    pub log: Arc<Mutex<RemoteLog>>,
}

impl FakeTransport {
    pub fn log(&self) -> MutexGuard<'_, RemoteLog> {
        lock(&self.log)
    }

    /// Push an event from the remote side of the latest connection.
    pub fn push(&self, event: LinkEvent) {
        if let Some(server) = self.log().server.as_ref() {
            let _ = server.send(event);
        }
    }
}

pub struct FakeSink {
    log: Arc<Mutex<RemoteLog>>,
}

impl FrameSink for FakeSink {
    async fn send(&mut self, frame: EncodedFrame) -> Result<()> {
        lock(&self.log).sent.push(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        lock(&self.log).sinks_closed += 1;
        Ok(())
    }
}

pub struct FakeEvents {
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl EventStream for FakeEvents {
    async fn next_event(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }
}

impl Transport for FakeTransport {
    type Sink = FakeSink;
    type Events = FakeEvents;

    fn connect(
        &self,
        setup: SessionSetup,
        credential: Credential,
    ) -> impl Future<Output = Result<(FakeSink, FakeEvents)>> + Send {
        let shared = Arc::clone(&self.log);
        async move {
            let mut log = lock(&shared);
            log.connects += 1;
            log.setups.push(setup);
            log.credentials.push(credential);
            if log.refuse {
                return Err(ParleyError::Connect("handshake refused".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            log.server = Some(tx);
            drop(log);
            Ok((FakeSink { log: shared }, FakeEvents { rx }))
        }
    }
}
