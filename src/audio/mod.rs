pub mod block;
pub mod capture;
pub mod output;
pub mod resample;

use std::future::Future;

use cpal::traits::{DeviceTrait, HostTrait};
use crossbeam_channel::Receiver;
use tokio::sync::mpsc;

use crate::config::AudioConfig;
use crate::error::{ParleyError, Result};
use crate::playback::{HandleId, OutputContext};

use self::capture::CpalMicrophone;
use self::output::CpalOutput;

/// The capture side of a session, fixed at one sample rate.
pub trait InputContext {
    /// Rate the capture graph converts microphone audio to.
    fn sample_rate(&self) -> u32;

    fn close(self) -> impl Future<Output = Result<()>>;
}

/// A live microphone stream.
pub trait Microphone {
    /// Native `(sample_rate, channels)` of the raw interleaved samples.
    fn format(&self) -> (u32, u16);

    /// Raw interleaved samples as delivered by the device.
    fn receiver(&self) -> Receiver<Vec<f32>>;

    /// Begin delivering samples.
    fn resume(&self) -> Result<()>;

    /// Release the device. No samples are delivered afterwards.
    fn stop(self);
}

/// Source of the audio resources a session needs.
pub trait AudioBackend {
    type Input: InputContext;
    type Microphone: Microphone;
    type Output: OutputContext;

    fn open_input(&self, sample_rate: u32) -> Result<Self::Input>;

    /// Open playback at `sample_rate`. Buffers that finish on their own are
    /// reported on `ended`.
    fn open_output(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<HandleId>,
    ) -> Result<Self::Output>;

    /// Acquire the microphone. Denied access is a `Permission` error.
    fn request_microphone(
        &self,
        input: &Self::Input,
    ) -> impl Future<Output = Result<Self::Microphone>>;
}

/// Device selection for the cpal host.
pub struct CpalInput {
    device: cpal::Device,
    sample_rate: u32,
    queue: usize,
}

impl InputContext for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Only forgets the device selection. The microphone stream is owned and
    /// released by [`CpalMicrophone`], so no device is closed here.
    async fn close(self) -> Result<()> {
        tracing::debug!("input context closed");
        Ok(())
    }
}

/// Audio backend on the system's default cpal host.
pub struct CpalBackend {
    config: AudioConfig,
}

impl CpalBackend {
    #[must_use]
    pub const fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

impl AudioBackend for CpalBackend {
    type Input = CpalInput;
    type Microphone = CpalMicrophone;
    type Output = CpalOutput;

    fn open_input(&self, sample_rate: u32) -> Result<CpalInput> {
        let device = find_input_device(self.config.input_device.as_deref())?;
        Ok(CpalInput {
            device,
            sample_rate,
            queue: self.config.input_queue,
        })
    }

    fn open_output(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<HandleId>,
    ) -> Result<CpalOutput> {
        let device = find_output_device(self.config.output_device.as_deref())?;
        CpalOutput::open(&device, sample_rate, ended)
    }

    async fn request_microphone(&self, input: &CpalInput) -> Result<CpalMicrophone> {
        CpalMicrophone::open(&input.device, input.queue)
    }
}

fn device_name(device: &cpal::Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

fn find_input_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        host.input_devices()
            .map_err(|e| ParleyError::Audio(format!("failed to enumerate input devices: {e}")))?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| ParleyError::Audio(format!("input device not found: {name}")))
    } else {
        host.default_input_device()
            .ok_or_else(|| ParleyError::Audio("no default input device available".to_string()))
    }
}

fn find_output_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        host.output_devices()
            .map_err(|e| ParleyError::Audio(format!("failed to enumerate output devices: {e}")))?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| ParleyError::Audio(format!("output device not found: {name}")))
    } else {
        host.default_output_device()
            .ok_or_else(|| ParleyError::Audio("no default output device available".to_string()))
    }
}

/// Names of all input devices on the default host.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| ParleyError::Audio(format!("failed to enumerate input devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

/// Names of all output devices on the default host.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| ParleyError::Audio(format!("failed to enumerate output devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_input_device_name() -> Option<String> {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| device_name(&d))
}

#[must_use]
pub fn default_output_device_name() -> Option<String> {
    cpal::default_host()
        .default_output_device()
        .and_then(|d| device_name(&d))
}
