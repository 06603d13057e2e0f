use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler as RubatoResampler};

use crate::error::{ParleyError, Result};

const CHUNK_SIZE: usize = 1024;

/// Resamples interleaved multi-channel audio to mono f32 at a target rate.
pub struct Resampler {
    inner: Option<Fft<f32>>,
    channels: u16,
    input_buf: Vec<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: u16) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 || channels == 0 {
            return Err(ParleyError::Resample(format!(
                "invalid conversion {source_rate}Hz x{channels} -> {target_rate}Hz"
            )));
        }

        let inner = if source_rate == target_rate {
            None
        } else {
            Some(
                Fft::new(
                    source_rate as usize,
                    target_rate as usize,
                    CHUNK_SIZE,
                    2, // sub_chunks
                    1, // output is always mono
                    FixedSync::Input,
                )
                .map_err(|e| ParleyError::Resample(format!("failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            channels,
            input_buf: Vec::new(),
        })
    }

    /// Process interleaved samples into mono at the target rate.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let mono = self.downmix(interleaved);

        if self.inner.is_none() {
            return Ok(mono);
        }

        self.input_buf.extend_from_slice(&mono);
        self.drain_full_chunks()
    }

    /// Output frames by which the converted signal lags its input.
    #[must_use]
    pub fn output_delay(&self) -> usize {
        self.inner.as_ref().map_or(0, |r| r.output_delay())
    }

    fn downmix(&self, interleaved: &[f32]) -> Vec<f32> {
        if self.channels == 1 {
            return interleaved.to_vec();
        }
        let ch = self.channels as usize;
        interleaved
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect()
    }

    fn drain_full_chunks(&mut self) -> Result<Vec<f32>> {
        let Some(ref mut resampler) = self.inner else {
            return Ok(Vec::new());
        };

        let mut output = Vec::new();
        let frames_needed = resampler.input_frames_next();

        while self.input_buf.len() >= frames_needed {
            let chunk: Vec<f32> = self.input_buf.drain(..frames_needed).collect();
            let input_data = vec![chunk];
            let input_buf = SequentialSliceOfVecs::new(&input_data, 1, frames_needed)
                .map_err(|e| ParleyError::Resample(format!("buffer error: {e}")))?;
            let result = resampler
                .process(&input_buf, 0, None)
                .map_err(|e| ParleyError::Resample(format!("resample error: {e}")))?;
            let out_frames = result.frames();
            for frame in 0..out_frames {
                output.push(result.read_sample(0, frame).unwrap_or(0.0));
            }
        }

        Ok(output)
    }
}

/// Convert one complete mono buffer between rates.
///
/// The result has exactly the rate-converted length of the input and is
/// aligned with it: the filter delay is cut from the front and the tail is
/// flushed out with silence.
pub fn convert_buffer(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate {
        return Ok(samples.to_vec());
    }
    let expected = (samples.len() as f64 * f64::from(target_rate) / f64::from(source_rate)).round() as usize;

    let mut resampler = Resampler::new(source_rate, target_rate, 1)?;
    let delay = resampler.output_delay();
    let mut output = resampler.process(samples)?;

    let silence = vec![0.0f32; CHUNK_SIZE];
    while output.len() < delay + expected {
        let tail = resampler.process(&silence)?;
        if tail.is_empty() {
            return Err(ParleyError::Resample(format!(
                "no output while flushing {source_rate}Hz -> {target_rate}Hz"
            )));
        }
        output.extend(tail);
    }

    output.drain(..delay);
    output.truncate(expected);
    Ok(output)
}
