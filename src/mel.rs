//! Log-mel spectrogram extraction.
//!
//! Converts raw PCM samples into the frame-major mel features the encoder
//! consumes: linear resampling to 16kHz, Hann-windowed 400-point FFT with a
//! 160-sample hop, triangular mel filterbank, `log10(power + epsilon)`.

use std::{borrow::Cow, f64::consts::PI, sync::Arc};

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Window length in samples.
pub const N_FFT: usize = 400;
/// Hop between adjacent frames in samples.
pub const HOP_LENGTH: usize = 160;
/// Sample rate the model expects.
pub const SAMPLE_RATE: f64 = 16000.0;
/// Floor added to filterbank power before the log.
pub const LOG_EPSILON: f32 = 1e-10;

const N_FREQS: usize = N_FFT / 2 + 1;

/// Frame-major log-mel spectrogram, `(n_frames, n_mels)`.
#[derive(Debug, Clone)]
pub struct MelSpectrogram {
    data: Vec<f32>,
    n_frames: usize,
    n_mels: usize,
}

impl MelSpectrogram {
    /// Spectrogram with no frames, produced for inputs shorter than a window.
    pub fn empty(n_mels: usize) -> Self {
        Self {
            data: Vec::new(),
            n_frames: 0,
            n_mels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_frames == 0
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Row-major backing buffer, one mel vector per frame.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// One frame's mel vector.
    pub fn frame(&self, i: usize) -> &[f32] {
        &self.data[i * self.n_mels..(i + 1) * self.n_mels]
    }
}

/// Linearly resample audio to `target_rate`.
///
/// Output index `i` reads source position `i / ratio` and interpolates between
/// the two adjacent input samples, clamping to the last sample at the tail.
/// Returns the input unchanged when the rates already agree.
pub fn resample(samples: &[f32], source_rate: f64, target_rate: f64) -> Vec<f32> {
    if source_rate == target_rate {
        return samples.to_vec();
    }
    let ratio = target_rate / source_rate;
    let out_len = (samples.len() as f64 * ratio) as usize;
    let mut out = vec![0.0f32; out_len];
    for (i, o) in out.iter_mut().enumerate() {
        let pos = i as f64 / ratio;
        let i0 = pos as usize;
        let frac = (pos - i0 as f64) as f32;
        *o = if i0 + 1 < samples.len() {
            samples[i0] * (1.0 - frac) + samples[i0 + 1] * frac
        } else {
            samples.last().copied().unwrap_or(0.0)
        };
    }
    out
}

/// Convert frequency to mel scale.
fn hz_to_mel(freq: f64) -> f64 {
    2595.0 * (1.0 + freq / 700.0).log10()
}

/// Convert mel scale to frequency.
fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10.0_f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular, slaney-normalized mel filterbank as a flat
/// `(n_mels, N_FREQS)` matrix.
fn build_mel_filterbank(n_mels: usize) -> Vec<f32> {
    let mut filters = vec![0.0f32; n_mels * N_FREQS];

    let mel_max = hz_to_mel(SAMPLE_RATE / 2.0);
    let mel_points: Vec<f64> = (0..=n_mels + 1)
        .map(|i| mel_max * i as f64 / (n_mels + 1) as f64)
        .collect();
    let bin_points: Vec<usize> = mel_points
        .iter()
        .map(|&m| ((N_FFT as f64 + 1.0) * mel_to_hz(m) / SAMPLE_RATE).floor() as usize)
        .collect();

    for m in 0..n_mels {
        let (left, center, right) = (bin_points[m], bin_points[m + 1], bin_points[m + 2]);
        let row = &mut filters[m * N_FREQS..(m + 1) * N_FREQS];
        for k in left..center.min(N_FREQS) {
            if center > left {
                row[k] = (k - left) as f32 / (center - left) as f32;
            }
        }
        for k in center..=right.min(N_FREQS - 1) {
            if right > center {
                row[k] = (right - k) as f32 / (right - center) as f32;
            }
        }
        // Slaney area normalization
        let enorm = 2.0 / (mel_to_hz(mel_points[m + 2]) - mel_to_hz(mel_points[m])) as f32;
        for v in row.iter_mut() {
            *v *= enorm;
        }
    }

    filters
}

/// Mel spectrogram extractor with precomputed window, filterbank, and FFT plan.
pub struct MelExtractor {
    filters: Vec<f32>,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    n_mels: usize,
    max_frames: usize,
}

impl MelExtractor {
    pub fn new(n_mels: usize, max_frames: usize) -> Self {
        let window: Vec<f32> = (0..N_FFT)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / N_FFT as f64).cos()) as f32)
            .collect();
        let fft = FftPlanner::<f32>::new().plan_fft_forward(N_FFT);
        Self {
            filters: build_mel_filterbank(n_mels),
            window,
            fft,
            n_mels,
            max_frames,
        }
    }

    /// Compute the log-mel spectrogram of `samples` recorded at `source_rate`.
    ///
    /// Frames past `max_frames` are never computed. Inputs shorter than one
    /// window yield an empty spectrogram; the encoder handles that case by
    /// producing a zero hidden state instead of failing.
    pub fn extract(&self, samples: &[f32], source_rate: f64) -> MelSpectrogram {
        let samples: Cow<'_, [f32]> = if source_rate == SAMPLE_RATE {
            Cow::Borrowed(samples)
        } else {
            Cow::Owned(resample(samples, source_rate, SAMPLE_RATE))
        };

        if samples.len() < N_FFT {
            return MelSpectrogram::empty(self.n_mels);
        }
        let n_frames = ((samples.len() - N_FFT) / HOP_LENGTH + 1).min(self.max_frames);

        let mut data = vec![0.0f32; n_frames * self.n_mels];
        let mut buf = vec![Complex::new(0.0f32, 0.0f32); N_FFT];
        let mut power = vec![0.0f32; N_FREQS];

        for frame in 0..n_frames {
            let start = frame * HOP_LENGTH;
            for (i, c) in buf.iter_mut().enumerate() {
                *c = Complex::new(samples[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buf);
            for (p, c) in power.iter_mut().zip(buf.iter()) {
                *p = c.norm_sqr();
            }

            let row = &mut data[frame * self.n_mels..(frame + 1) * self.n_mels];
            for (m, out) in row.iter_mut().enumerate() {
                let filter = &self.filters[m * N_FREQS..(m + 1) * N_FREQS];
                let sum: f32 = filter.iter().zip(power.iter()).map(|(f, p)| f * p).sum();
                *out = (sum + LOG_EPSILON).log10();
            }
        }

        MelSpectrogram {
            data,
            n_frames,
            n_mels: self.n_mels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_window_shape() {
        let extractor = MelExtractor::new(80, 1500);
        assert_eq!(extractor.window.len(), N_FFT);
        assert!(extractor.window[0].abs() < 0.01);
        assert!((extractor.window[N_FFT / 2] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_resample_identity() {
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample(&samples, SAMPLE_RATE, SAMPLE_RATE);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples = vec![0.5f32; 8000];
        let out = resample(&samples, 32000.0, 16000.0);
        assert_eq!(out.len(), 4000);
        for v in &out {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_input_hits_log_floor() {
        let extractor = MelExtractor::new(80, 1500);
        let mel = extractor.extract(&vec![0.0f32; N_FFT], SAMPLE_RATE);
        assert_eq!(mel.n_frames(), 1);
        let floor = LOG_EPSILON.log10();
        for v in mel.data() {
            assert_eq!(*v, floor);
        }
    }

    #[test]
    fn test_short_input_is_empty() {
        let extractor = MelExtractor::new(80, 1500);
        let mel = extractor.extract(&vec![0.1f32; N_FFT - 1], SAMPLE_RATE);
        assert!(mel.is_empty());
        assert_eq!(mel.n_mels(), 80);
    }

    #[test]
    fn test_max_frames_truncation() {
        let extractor = MelExtractor::new(80, 3);
        // Ten frames' worth of audio, capped at three.
        let mel = extractor.extract(&vec![0.1f32; N_FFT + 9 * HOP_LENGTH], SAMPLE_RATE);
        assert_eq!(mel.n_frames(), 3);
    }

    #[test]
    fn test_sine_wave_produces_finite_values() {
        let extractor = MelExtractor::new(80, 1500);
        let samples: Vec<f32> = (0..16000)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        let mel = extractor.extract(&samples, SAMPLE_RATE);
        assert!(mel.n_frames() > 0);
        assert!(mel.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_filterbank_is_nonnegative_with_mass() {
        let filters = build_mel_filterbank(80);
        assert!(filters.iter().all(|v| *v >= 0.0));
        // Mid-frequency filters span several bins and must carry weight.
        let row = &filters[40 * N_FREQS..41 * N_FREQS];
        assert!(row.iter().any(|v| *v > 0.0));
    }
}
