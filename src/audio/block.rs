/// A fixed-size block of 16kHz mono capture audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    /// Scaled loudness in [0,1] for the volume meter.
    pub volume: f32,
}

impl AudioFrame {
    fn from_samples(samples: Vec<f32>, gain: f32) -> Self {
        let volume = volume(&samples, gain);
        Self { samples, volume }
    }
}

/// Root-mean-square amplitude of a block.
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// RMS amplified by `gain` and clamped to [0,1].
#[must_use]
pub fn volume(samples: &[f32], gain: f32) -> f32 {
    (rms(samples) * gain).clamp(0.0, 1.0)
}

/// Regroups arbitrarily sized capture callbacks into fixed blocks.
pub struct BlockAccumulator {
    buffer: Vec<f32>,
    block_size: usize,
    gain: f32,
}

impl BlockAccumulator {
    #[must_use]
    pub fn new(block_size: usize, gain: f32) -> Self {
        Self {
            buffer: Vec::with_capacity(block_size),
            block_size: block_size.max(1),
            gain,
        }
    }

    /// Feed samples and return any complete blocks.
    pub fn feed(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.buffer.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.block_size {
            let block: Vec<f32> = self.buffer.drain(..self.block_size).collect();
            frames.push(AudioFrame::from_samples(block, self.gain));
        }

        frames
    }
}
