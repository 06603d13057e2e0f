use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BuildStreamError, Stream, StreamConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::codec::{self, EncodedFrame};
use crate::config::DropPolicy;
use crate::error::{ParleyError, Result};

use super::Microphone;
use super::block::BlockAccumulator;
use super::resample::Resampler;

/// How often the capture graph re-checks its stop flag while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Microphone capture via cpal.
pub struct CpalMicrophone {
    stream: Stream,
    receiver: Receiver<Vec<f32>>,
    sample_rate: u32,
    channels: u16,
}

impl CpalMicrophone {
    pub fn open(device: &cpal::Device, queue: usize) -> Result<Self> {
        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::Audio(format!("failed to get default input config: {e}")))?;

        let sample_rate = supported.sample_rate();
        let channels = supported.channels();

        let stream_config = StreamConfig {
            channels,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        // The audio callback only ever try_sends.
        let (tx, rx) = bounded::<Vec<f32>>(queue);

        let err_fn = |err: cpal::StreamError| {
            tracing::error!("microphone stream error: {err}");
        };

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let _ = tx.try_send(data.to_vec());
                },
                err_fn,
                None,
            )
            .map_err(classify_build_error)?;

        tracing::debug!("microphone opened: {sample_rate}Hz, {channels} channel(s)");

        Ok(Self {
            stream,
            receiver: rx,
            sample_rate,
            channels,
        })
    }
}

/// Platforms report refused microphone access as a backend error or as an
/// unavailable device; everything else is a plain audio failure.
fn classify_build_error(err: BuildStreamError) -> ParleyError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            ParleyError::Permission("input device not available".to_string())
        }
        other => {
            let msg = other.to_string();
            let lower = msg.to_lowercase();
            if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
                ParleyError::Permission(msg)
            } else {
                ParleyError::Audio(format!("failed to build input stream: {msg}"))
            }
        }
    }
}

impl Microphone for CpalMicrophone {
    fn format(&self) -> (u32, u16) {
        (self.sample_rate, self.channels)
    }

    fn receiver(&self) -> Receiver<Vec<f32>> {
        self.receiver.clone()
    }

    fn resume(&self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| ParleyError::Audio(format!("failed to start microphone stream: {e}")))
    }

    fn stop(self) {
        if let Err(e) = self.stream.pause() {
            tracing::debug!("failed to pause microphone stream: {e}");
        }
        tracing::debug!("microphone released");
    }
}

/// Parameters for the capture graph.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub target_rate: u32,
    pub block_size: usize,
    pub volume_gain: f32,
    pub drop_policy: DropPolicy,
}

/// The thread turning raw microphone callbacks into encoded frames:
/// resample → block → volume → encode → outbound queue.
pub struct CaptureGraph {
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureGraph {
    /// Start the graph. `on_volume` receives the volume of every block.
    pub fn spawn<F>(
        raw_rx: Receiver<Vec<f32>>,
        (source_rate, channels): (u32, u16),
        settings: CaptureSettings,
        frames: mpsc::Sender<EncodedFrame>,
        on_volume: F,
    ) -> Result<Self>
    where
        F: Fn(f32) + Send + 'static,
    {
        let mut resampler = Resampler::new(source_rate, settings.target_rate, channels)?;
        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_running = Arc::clone(&running);
        let thread_dropped = Arc::clone(&dropped);

        tracing::debug!(
            "capture graph: source_rate={source_rate}, channels={channels}, block={}, policy={:?}",
            settings.block_size,
            settings.drop_policy
        );

        let thread = std::thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                let mut accumulator =
                    BlockAccumulator::new(settings.block_size, settings.volume_gain);

                while thread_running.load(Ordering::Acquire) {
                    let raw = match raw_rx.recv_timeout(POLL_INTERVAL) {
                        Ok(raw) => raw,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => {
                            tracing::debug!("microphone closed, capture graph exiting");
                            break;
                        }
                    };

                    let mono = match resampler.process(&raw) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("resample error: {e}");
                            continue;
                        }
                    };

                    for frame in accumulator.feed(&mono) {
                        if !thread_running.load(Ordering::Acquire) {
                            break;
                        }
                        on_volume(frame.volume);
                        let encoded = codec::encode(&frame.samples);
                        if !hand_off(&frames, encoded, settings.drop_policy, &thread_dropped) {
                            tracing::debug!("outbound queue closed, capture graph exiting");
                            return;
                        }
                    }
                }

                tracing::debug!("capture graph thread exiting");
            })?;

        Ok(Self {
            running,
            dropped,
            thread: Some(thread),
        })
    }

    /// Frames discarded because the outbound queue was full.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the graph. The thread exits on its next wake-up; it is not joined
    /// because it may be parked on a queue only the async side drains.
    pub fn disconnect(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.running.store(false, Ordering::Release);
        if self.thread.take().is_some() {
            let dropped = self.dropped_frames();
            if dropped > 0 {
                tracing::info!("capture graph stopped ({dropped} frame(s) dropped under backpressure)");
            } else {
                tracing::debug!("capture graph stopped");
            }
        }
    }
}

impl Drop for CaptureGraph {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Push one frame towards the link. Returns false once the queue is closed.
fn hand_off(
    frames: &mpsc::Sender<EncodedFrame>,
    frame: EncodedFrame,
    policy: DropPolicy,
    dropped: &AtomicU64,
) -> bool {
    match policy {
        DropPolicy::Drop => match frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    tracing::debug!("outbound queue full, {n} frame(s) dropped so far");
                }
                true
            }
            Err(TrySendError::Closed(_)) => false,
        },
        DropPolicy::Block => frames.blocking_send(frame).is_ok(),
    }
}
