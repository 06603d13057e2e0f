use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tokio::sync::mpsc;

use crate::codec::PlaybackBuffer;
use crate::error::{ParleyError, Result};
use crate::playback::{HandleId, OutputContext};

use super::resample;

struct Voice {
    id: HandleId,
    samples: Vec<f32>,
    start_frame: u64,
    pos: usize,
}

/// Sums scheduled voices into the device buffer and keeps the sample clock.
struct Mixer {
    voices: Vec<Voice>,
    /// Device frames rendered so far; this is the output clock.
    frame: u64,
    rate: u32,
    channels: usize,
    ended: mpsc::UnboundedSender<HandleId>,
}

impl Mixer {
    fn new(rate: u32, channels: usize, ended: mpsc::UnboundedSender<HandleId>) -> Self {
        Self {
            voices: Vec::new(),
            frame: 0,
            rate,
            channels: channels.max(1),
            ended,
        }
    }

    fn render(&mut self, data: &mut [f32]) {
        let frames = data.len() / self.channels;
        for (i, out) in data.chunks_exact_mut(self.channels).enumerate() {
            let now = self.frame + i as u64;
            let mut mixed = 0.0f32;
            for voice in &mut self.voices {
                if voice.start_frame <= now && voice.pos < voice.samples.len() {
                    mixed += voice.samples[voice.pos];
                    voice.pos += 1;
                }
            }
            out.fill(mixed.clamp(-1.0, 1.0));
        }
        self.frame += frames as u64;

        let ended = &self.ended;
        self.voices.retain(|voice| {
            let done = voice.pos >= voice.samples.len();
            if done {
                let _ = ended.send(voice.id);
            }
            !done
        });
    }

    fn current_time(&self) -> f64 {
        self.frame as f64 / f64::from(self.rate)
    }
}

fn lock(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Playback through a cpal output stream.
///
/// Buffers arrive at the context rate; when the device runs at a different
/// rate each buffer is converted as a whole before it is handed to the mixer.
pub struct CpalOutput {
    stream: Stream,
    mixer: Arc<Mutex<Mixer>>,
    context_rate: u32,
    device_rate: u32,
}

impl CpalOutput {
    pub fn open(
        device: &cpal::Device,
        context_rate: u32,
        ended: mpsc::UnboundedSender<HandleId>,
    ) -> Result<Self> {
        let stream_config = pick_output_config(device, context_rate)?;
        let device_rate = stream_config.sample_rate;
        let channels = stream_config.channels as usize;

        let mixer = Arc::new(Mutex::new(Mixer::new(device_rate, channels, ended)));
        let callback_mixer = Arc::clone(&mixer);

        let err_fn = |err: cpal::StreamError| {
            tracing::error!("output stream error: {err}");
        };

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    lock(&callback_mixer).render(data);
                },
                err_fn,
                None,
            )
            .map_err(|e| ParleyError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| ParleyError::Audio(format!("failed to start output stream: {e}")))?;

        tracing::debug!(
            "output opened: context {context_rate}Hz, device {device_rate}Hz, {channels} channel(s)"
        );

        Ok(Self {
            stream,
            mixer,
            context_rate,
            device_rate,
        })
    }
}

/// Prefer a config running at the context rate; otherwise the device default.
fn pick_output_config(device: &cpal::Device, rate: u32) -> Result<StreamConfig> {
    let native = device.supported_output_configs().ok().and_then(|mut configs| {
        configs.find(|c| {
            c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= rate
                && rate <= c.max_sample_rate()
        })
    });

    if let Some(range) = native {
        return Ok(StreamConfig {
            channels: range.channels(),
            sample_rate: rate,
            buffer_size: cpal::BufferSize::Default,
        });
    }

    let supported = device
        .default_output_config()
        .map_err(|e| ParleyError::Audio(format!("failed to get default output config: {e}")))?;

    Ok(StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    })
}

impl OutputContext for CpalOutput {
    fn current_time(&self) -> f64 {
        lock(&self.mixer).current_time()
    }

    fn start(&mut self, id: HandleId, buffer: PlaybackBuffer, at: f64) -> Result<()> {
        let samples = if buffer.sample_rate == self.device_rate {
            buffer.samples
        } else {
            if buffer.sample_rate != self.context_rate {
                tracing::debug!(
                    "buffer at {}Hz on a {}Hz context",
                    buffer.sample_rate,
                    self.context_rate
                );
            }
            resample::convert_buffer(&buffer.samples, buffer.sample_rate, self.device_rate)?
        };

        let start_frame = (at * f64::from(self.device_rate)).round().max(0.0) as u64;
        lock(&self.mixer).voices.push(Voice {
            id,
            samples,
            start_frame,
            pos: 0,
        });
        Ok(())
    }

    fn stop(&mut self, id: HandleId) {
        lock(&self.mixer).voices.retain(|voice| voice.id != id);
    }

    async fn close(self) -> Result<()> {
        lock(&self.mixer).voices.clear();
        self.stream
            .pause()
            .map_err(|e| ParleyError::Audio(format!("failed to stop output stream: {e}")))?;
        tracing::debug!("output context closed");
        Ok(())
    }
}
