//! WAV decoding and log-mel spectrogram rendering for the audio service.

use std::f32::consts::PI;
use std::path::Path;

use image::{Rgb, RgbImage};
use ndarray::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::errors::{Result, XaiError};

#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramConfig {
    /// Audio is resampled to this rate before analysis.
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    /// Dynamic range kept below the loudest bin, in decibels.
    pub top_db: f32,
}

impl Default for SpectrogramConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22_050,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
            top_db: 80.0,
        }
    }
}

/// Mono samples in `[-1, 1]` and their sample rate.
pub fn load_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let decoding = |source: hound::Error| XaiError::AudioDecoding {
        path: path.display().to_string(),
        operation: "WAV decoding".to_string(),
        source: Box::new(source),
    };
    let mut reader = hound::WavReader::open(path).map_err(decoding)?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(decoding)?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(decoding)?
        }
    };

    let channels = usize::from(spec.channels.max(1));
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

/// Linear-interpolation resampling.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() || from == 0 {
        return samples.to_vec();
    }
    let ratio = f64::from(from) / f64::from(to);
    let len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    (0..len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let i0 = (pos.floor() as usize).min(samples.len() - 1);
            let i1 = (i0 + 1).min(samples.len() - 1);
            let t = (pos - i0 as f64) as f32;
            samples[i0] * (1.0 - t) + samples[i1] * t
        })
        .collect()
}

const F_SP: f32 = 200.0 / 3.0;
const MIN_LOG_HZ: f32 = 1000.0;
const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;

fn log_step() -> f32 {
    6.4f32.ln() / 27.0
}

/// Slaney mel scale: linear below 1 kHz, logarithmic above.
pub fn hz_to_mel(hz: f32) -> f32 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

pub fn mel_to_hz(mel: f32) -> f32 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Triangular filters `(n_mels, n_fft / 2 + 1)` with unit area, spanning `0..sr/2`.
pub fn mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Array2<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * sample_rate as f32 / n_fft as f32)
        .collect();
    let mel_max = hz_to_mel(sample_rate as f32 / 2.0);
    let hz_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = Array2::<f32>::zeros((n_mels, n_freqs));
    for (m, mut row) in filters.outer_iter_mut().enumerate() {
        let (lower, center, upper) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let norm = 2.0 / (upper - lower).max(f32::EPSILON);
        for (k, &f) in fft_freqs.iter().enumerate() {
            let rising = (f - lower) / (center - lower).max(f32::EPSILON);
            let falling = (upper - f) / (upper - center).max(f32::EPSILON);
            row[k] = rising.min(falling).max(0.0) * norm;
        }
    }
    filters
}

/// Power spectrogram `(n_fft / 2 + 1, frames)` of zero-padded, centred Hann frames.
pub fn power_spectrogram(samples: &[f32], n_fft: usize, hop_length: usize) -> Result<Array2<f32>> {
    if n_fft == 0 || hop_length == 0 {
        return Err(XaiError::Configuration {
            message: "n_fft and hop_length must be positive".to_string(),
        });
    }
    let pad = n_fft / 2;
    let mut padded = vec![0.0f32; samples.len() + 2 * pad];
    padded[pad..pad + samples.len()].copy_from_slice(samples);

    let n_freqs = n_fft / 2 + 1;
    let frames = 1 + samples.len() / hop_length;
    let window: Vec<f32> = (0..n_fft)
        .map(|n| 0.5 * (1.0 - (2.0 * PI * n as f32 / n_fft as f32).cos()))
        .collect();
    let fft = FftPlanner::<f32>::new().plan_fft_forward(n_fft);

    let mut power = Array2::<f32>::zeros((n_freqs, frames));
    let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];
    for (t, mut column) in power.axis_iter_mut(Axis(1)).enumerate() {
        let start = t * hop_length;
        for (i, slot) in buffer.iter_mut().enumerate() {
            let sample = padded.get(start + i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * window[i], 0.0);
        }
        fft.process(&mut buffer);
        for (k, value) in column.iter_mut().enumerate() {
            *value = buffer[k].norm_sqr();
        }
    }
    Ok(power)
}

/// Decibels relative to the maximum, floored `top_db` below it.
pub fn power_to_db(power: ArrayView2<'_, f32>, top_db: f32) -> Array2<f32> {
    let amin = 1e-10f32;
    let reference = power.fold(amin, |m, &v| m.max(v));
    let db = power.mapv(|p| 10.0 * p.max(amin).log10() - 10.0 * reference.log10());
    let peak = db.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    db.mapv(|v| v.max(peak - top_db))
}

/// Log-mel spectrogram `(n_mels, frames)` in decibels.
pub fn mel_spectrogram_db(samples: &[f32], sample_rate: u32, config: &SpectrogramConfig) -> Result<Array2<f32>> {
    if samples.is_empty() {
        return Err(XaiError::invalid_input("audio", "contains no samples"));
    }
    let samples = resample(samples, sample_rate, config.sample_rate);
    let power = power_spectrogram(&samples, config.n_fft, config.hop_length)?;
    let filters = mel_filterbank(config.sample_rate, config.n_fft, config.n_mels);
    Ok(power_to_db(filters.dot(&power).view(), config.top_db))
}

const MAGMA: [(f32, [f32; 3]); 5] = [
    (0.0, [0.001, 0.000, 0.014]),
    (0.25, [0.317, 0.072, 0.485]),
    (0.5, [0.716, 0.215, 0.475]),
    (0.75, [0.987, 0.535, 0.383]),
    (1.0, [0.987, 0.991, 0.750]),
];

/// Piecewise-linear approximation of the magma colormap.
pub fn magma(value: f32) -> [f32; 3] {
    let v = value.clamp(0.0, 1.0);
    for pair in MAGMA.windows(2) {
        let (lo, lo_rgb) = pair[0];
        let (hi, hi_rgb) = pair[1];
        if v <= hi {
            let t = (v - lo) / (hi - lo);
            return [0, 1, 2].map(|c| lo_rgb[c] + (hi_rgb[c] - lo_rgb[c]) * t);
        }
    }
    MAGMA[MAGMA.len() - 1].1
}

/// Colour image of a decibel spectrogram, low frequencies at the bottom.
pub fn render_spectrogram(db: ArrayView2<'_, f32>) -> RgbImage {
    let (n_mels, frames) = db.dim();
    let lo = db.fold(f32::INFINITY, |m, &v| m.min(v));
    let hi = db.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let range = (hi - lo).max(f32::EPSILON);
    RgbImage::from_fn(frames as u32, n_mels as u32, |x, y| {
        let value = db[[n_mels - 1 - y as usize, x as usize]];
        let rgb = magma((value - lo) / range);
        Rgb(rgb.map(|c| (c * 255.0).round() as u8))
    })
}
