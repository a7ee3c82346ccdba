// ABOUTME: Audio samples, quality checks, and the spectral-band voice embedding.
// ABOUTME: Band energies from windowed Goertzel bins, L2-normalized, compared by cosine similarity.

use std::f64::consts::PI;

use thiserror::Error;

use crate::config::VoiceConfig;

/// Number of spectral bands in an embedding.
pub const EMBEDDING_DIM: usize = 16;

const BAND_LOW_HZ: f64 = 80.0;
const BAND_HIGH_HZ: f64 = 4000.0;
/// Analysis frame length in milliseconds (about 31 Hz bin spacing).
const FRAME_MS: usize = 32;
/// Frames quieter than this fraction of the sample's RMS are treated as silence.
const VOICED_FRACTION: f64 = 0.1;

/// Why a sample was not usable.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SampleRejected {
    #[error("sample is empty")]
    Empty,
    #[error("sample rate must be positive")]
    BadSampleRate,
    #[error("sample contains non-finite values")]
    NonFinite,
    #[error("sample is {got_ms}ms, need at least {min_ms}ms")]
    TooShort { got_ms: u64, min_ms: u64 },
    #[error("sample energy {rms:.4} is below {min:.4}")]
    TooQuiet { rms: f32, min: f32 },
    #[error("no voiced energy in the analysis band")]
    NoVoicedEnergy,
}

/// Mono PCM audio captured from the microphone pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSample {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl AudioSample {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    /// Decode little-endian f32 PCM.
    pub fn from_f32_le_bytes(sample_rate: u32, bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let samples = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self::new(sample_rate, samples))
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / u64::from(self.sample_rate)
    }

    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }
}

/// Minimum duration and energy heuristic applied to every enrollment and verification sample.
pub fn check_quality(sample: &AudioSample, config: &VoiceConfig) -> Result<(), SampleRejected> {
    if sample.samples.is_empty() {
        return Err(SampleRejected::Empty);
    }
    if sample.sample_rate == 0 {
        return Err(SampleRejected::BadSampleRate);
    }
    if sample.samples.iter().any(|s| !s.is_finite()) {
        return Err(SampleRejected::NonFinite);
    }
    let got_ms = sample.duration_ms();
    if got_ms < config.min_sample_ms {
        return Err(SampleRejected::TooShort {
            got_ms,
            min_ms: config.min_sample_ms,
        });
    }
    let rms = sample.rms();
    if rms < config.min_rms {
        return Err(SampleRejected::TooQuiet {
            rms,
            min: config.min_rms,
        });
    }
    Ok(())
}

/// Bin ranges `[start, end)` for each band at this frame length and rate.
fn band_bins(sample_rate: f64, frame_len: usize) -> Vec<(usize, usize)> {
    let high = BAND_HIGH_HZ.min(sample_rate * 0.45);
    let ratio = (high / BAND_LOW_HZ).powf(1.0 / EMBEDDING_DIM as f64);
    let bin_hz = sample_rate / frame_len as f64;
    (0..EMBEDDING_DIM)
        .map(|b| {
            let lo = BAND_LOW_HZ * ratio.powi(b as i32);
            let hi = lo * ratio;
            let start = (lo / bin_hz).ceil() as usize;
            let end = ((hi / bin_hz).ceil() as usize).max(start + 1);
            (start, end)
        })
        .collect()
}

/// Power of bin `k` in a windowed frame (Goertzel).
fn goertzel_power(frame: &[f64], k: usize) -> f64 {
    let n = frame.len() as f64;
    let coeff = 2.0 * (2.0 * PI * k as f64 / n).cos();
    let (mut s1, mut s2) = (0.0, 0.0);
    for &x in frame {
        let s = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s;
    }
    (s1 * s1 + s2 * s2 - coeff * s1 * s2).max(0.0)
}

/// Compute the unit-length band-energy embedding of a sample.
///
/// Callers are expected to have run [`check_quality`] first.
pub fn extract_embedding(sample: &AudioSample) -> Result<Vec<f32>, SampleRejected> {
    if sample.sample_rate == 0 {
        return Err(SampleRejected::BadSampleRate);
    }
    if sample.samples.is_empty() {
        return Err(SampleRejected::Empty);
    }
    let rate = f64::from(sample.sample_rate);
    let frame_len = (sample.sample_rate as usize * FRAME_MS / 1000).max(64);
    let hop = frame_len / 2;
    let window: Vec<f64> = (0..frame_len)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / (frame_len - 1) as f64).cos())
        .collect();
    let bands = band_bins(rate, frame_len);

    let mut signal: Vec<f64> = sample.samples.iter().map(|&s| f64::from(s)).collect();
    if signal.len() < frame_len {
        signal.resize(frame_len, 0.0);
    }
    let overall_rms = f64::from(sample.rms());

    let mut energy = [0.0f64; EMBEDDING_DIM];
    let mut frame = vec![0.0f64; frame_len];
    let mut start = 0;
    while start + frame_len <= signal.len() {
        let raw = &signal[start..start + frame_len];
        start += hop;

        let frame_rms = (raw.iter().map(|x| x * x).sum::<f64>() / frame_len as f64).sqrt();
        if frame_rms < overall_rms * VOICED_FRACTION {
            continue;
        }
        for ((dst, x), w) in frame.iter_mut().zip(raw).zip(&window) {
            *dst = x * w;
        }
        for (band, &(lo, hi)) in energy.iter_mut().zip(&bands) {
            *band += (lo..hi).map(|k| goertzel_power(&frame, k)).sum::<f64>();
        }
    }

    let norm = energy.iter().map(|e| e * e).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return Err(SampleRejected::NoVoicedEnergy);
    }
    Ok(energy.iter().map(|e| (e / norm) as f32).collect())
}

/// Cosine similarity in [-1, 1]; zero when either vector has no length or dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let na: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na * nb)) as f32
}

/// Average embeddings and renormalize to unit length.
pub fn centroid(embeddings: &[Vec<f32>]) -> Vec<f32> {
    let mut sum = vec![0.0f64; EMBEDDING_DIM];
    for emb in embeddings {
        for (acc, v) in sum.iter_mut().zip(emb) {
            *acc += f64::from(*v);
        }
    }
    let norm = sum.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm == 0.0 {
        return sum.iter().map(|_| 0.0).collect();
    }
    sum.iter().map(|x| (x / norm) as f32).collect()
}

/// Synthetic voiced audio used by tests: a harmonic stack with a little deterministic noise.
#[cfg(test)]
pub(crate) fn synth_voice(fundamental_hz: f32, gain: f32, seed: u32) -> AudioSample {
    let rate = 16_000u32;
    let len = rate as usize;
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(1);
    let samples = (0..len)
        .map(|n| {
            let t = n as f32 / rate as f32;
            let tone: f32 = [1.0f32, 0.5, 0.25]
                .iter()
                .enumerate()
                .map(|(h, amp)| {
                    amp * (2.0 * std::f32::consts::PI * fundamental_hz * (h as f32 + 1.0) * t).sin()
                })
                .sum();
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let noise = (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5;
            gain * (0.5 * tone + 0.01 * noise)
        })
        .collect();
    AudioSample::new(rate, samples)
}
