use crate::config::EngineParams;
use crate::source::SourceError;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("corrupt input: {bad} of {total} samples non-finite")]
    CorruptInput { bad: u64, total: u64 },
    #[error("source error: {0}")]
    Source(#[from] SourceError),
}

/// Fraction of non-finite samples tolerated before the whole input is
/// declared corrupt.
const MAX_BAD_SAMPLE_RATIO: f64 = 0.01;

fn hann_window(window_size: usize) -> Vec<f32> {
    let denom = (window_size - 1) as f32;
    (0..window_size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / denom).cos()))
        .collect()
}

/// Streaming short-time Fourier transform.
///
/// Samples arrive in arbitrary chunks via `push`; complete frames are
/// emitted as log-compressed magnitude rows of `window_size / 2 + 1` bins.
/// A carry buffer holds the tail that has not yet filled a full window, so
/// chunk boundaries never affect the output. Inputs shorter than one
/// window produce no frames.
pub struct Stft {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    window_size: usize,
    hop_size: usize,
    carry: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    total_samples: u64,
    bad_samples: u64,
}

impl Stft {
    pub fn new(params: &EngineParams) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(params.window_size);
        Self {
            fft,
            window: hann_window(params.window_size),
            window_size: params.window_size,
            hop_size: params.hop_size,
            carry: Vec::with_capacity(params.window_size * 2),
            buffer: vec![Complex::new(0.0, 0.0); params.window_size],
            total_samples: 0,
            bad_samples: 0,
        }
    }

    /// Feed a chunk of mono samples, appending any completed frames to `out`.
    ///
    /// Non-finite samples are zeroed and counted; `finish` reports
    /// `CorruptInput` if too many were seen overall.
    pub fn push(&mut self, chunk: &[f32], out: &mut Vec<Vec<f32>>) {
        self.total_samples += chunk.len() as u64;
        self.carry.reserve(chunk.len());
        for &s in chunk {
            if s.is_finite() {
                self.carry.push(s);
            } else {
                self.bad_samples += 1;
                self.carry.push(0.0);
            }
        }

        let mut start = 0;
        while start + self.window_size <= self.carry.len() {
            out.push(self.frame_at(start));
            start += self.hop_size;
        }
        // Keep only the samples still needed for future windows
        if start > 0 {
            self.carry.drain(..start);
        }
    }

    /// Consume the transform, validating the non-finite sample budget.
    /// The trailing partial window is dropped, matching whole-buffer
    /// framing where the last frame must be fully covered.
    pub fn finish(self) -> Result<(), ExtractError> {
        if self.total_samples > 0 {
            let ratio = self.bad_samples as f64 / self.total_samples as f64;
            if ratio > MAX_BAD_SAMPLE_RATIO {
                return Err(ExtractError::CorruptInput {
                    bad: self.bad_samples,
                    total: self.total_samples,
                });
            }
        }
        Ok(())
    }

    fn frame_at(&mut self, start: usize) -> Vec<f32> {
        for (j, w) in self.window.iter().enumerate() {
            self.buffer[j] = Complex::new(self.carry[start + j] * w, 0.0);
        }
        self.fft.process(&mut self.buffer);

        // Real input: keep the non-redundant half, magnitude + log compression
        let bins = self.window_size / 2 + 1;
        self.buffer[..bins]
            .iter()
            .map(|c| (1.0 + c.norm()).ln())
            .collect()
    }
}

/// Compute the full log-magnitude spectrogram of a buffer in one call.
pub fn spectrogram(samples: &[f32], params: &EngineParams) -> Result<Vec<Vec<f32>>, ExtractError> {
    let mut stft = Stft::new(params);
    let mut frames = Vec::new();
    stft.push(samples, &mut frames);
    stft.finish()?;
    Ok(frames)
}
