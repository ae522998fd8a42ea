//! Sample rate conversion for captured voice
//!
//! The record path calls a [`Resampler`] with whatever it captured this tick
//! and an output slice sized for the expected result. Rate conversion itself
//! is delegated to rubato.

use rubato::{FftFixedIn, Resampler as _};
use std::collections::VecDeque;

use crate::error::AudioError;

/// Rate converter for mono 16-bit PCM
pub trait Resampler: Send {
    /// Convert `input` into `output`.
    ///
    /// Returns `(consumed, produced)`: how many input samples were taken and
    /// how many output samples were written.
    fn process(&mut self, input: &[i16], output: &mut [i16]) -> Result<(usize, usize), AudioError>;

    /// Output rate divided by input rate
    fn ratio(&self) -> f64;

    /// Delay introduced by the converter, in output samples
    fn latency(&self) -> usize;

    /// Drop any buffered state
    fn reset(&mut self);
}

/// Upper bound on the output of resampling `count` samples between two rates
pub fn expected_output_len(count: usize, input_rate: u32, output_rate: u32) -> usize {
    let numerator = count as u64 * output_rate as u64;
    numerator.div_ceil(input_rate as u64) as usize
}

/// FFT resampler that accepts arbitrary input lengths.
///
/// Input is accumulated until rubato has a full chunk. Output that does not
/// fit the caller's slice is held back for the next call.
pub struct RubatoResampler {
    inner: FftFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    pending_input: Vec<f32>,
    pending_output: VecDeque<i16>,
}

impl RubatoResampler {
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self, AudioError> {
        let inner = FftFixedIn::<f32>::new(input_rate as usize, output_rate as usize, chunk_size, 2, 1)
            .map_err(|e| AudioError::Resample(format!("Failed to create resampler: {e}")))?;

        tracing::debug!("Created resampler: {} Hz -> {} Hz", input_rate, output_rate);

        Ok(Self {
            inner,
            input_rate,
            output_rate,
            pending_input: Vec::with_capacity(chunk_size * 2),
            pending_output: VecDeque::with_capacity(chunk_size * 2),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

impl Resampler for RubatoResampler {
    fn process(&mut self, input: &[i16], output: &mut [i16]) -> Result<(usize, usize), AudioError> {
        self.pending_input
            .extend(input.iter().map(|&s| s as f32 / 32768.0));

        loop {
            let needed = self.inner.input_frames_next();
            if self.pending_input.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending_input.drain(..needed).collect();
            let converted = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            if let Some(channel) = converted.into_iter().next() {
                self.pending_output.extend(
                    channel
                        .iter()
                        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16),
                );
            }
        }

        let produced = self.pending_output.len().min(output.len());
        for (slot, sample) in output.iter_mut().zip(self.pending_output.drain(..produced)) {
            *slot = sample;
        }
        Ok((input.len(), produced))
    }

    fn ratio(&self) -> f64 {
        self.output_rate as f64 / self.input_rate as f64
    }

    fn latency(&self) -> usize {
        self.inner.output_delay()
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.pending_input.clear();
        self.pending_output.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_output_len() {
        assert_eq!(expected_output_len(500, 44100, 48000), 545);
        assert_eq!(expected_output_len(480, 48000, 48000), 480);
        assert_eq!(expected_output_len(441, 44100, 48000), 480);
        assert_eq!(expected_output_len(0, 44100, 48000), 0);
    }

    #[test]
    fn test_rubato_produces_output() {
        let mut resampler = RubatoResampler::new(44100, 48000, 512).unwrap();
        assert!((resampler.ratio() - 48000.0 / 44100.0).abs() < 1e-9);

        let input: Vec<i16> = (0..441)
            .map(|i| ((i as f32 / 44100.0 * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16)
            .collect();
        let mut output = vec![0i16; expected_output_len(input.len(), 44100, 48000)];

        let mut total = 0;
        for _ in 0..20 {
            let (consumed, produced) = resampler.process(&input, &mut output).unwrap();
            assert_eq!(consumed, input.len());
            assert!(produced <= output.len());
            total += produced;
        }
        assert!(total > 0);
        assert!(total <= 20 * output.len());
    }

    #[test]
    fn test_reset_clears_pending() {
        let mut resampler = RubatoResampler::new(16000, 48000, 256).unwrap();
        let mut output = vec![0i16; 16];
        resampler.process(&[100; 1024], &mut output).unwrap();
        resampler.reset();

        let (_, produced) = resampler.process(&[], &mut output).unwrap();
        assert_eq!(produced, 0);
    }
}
