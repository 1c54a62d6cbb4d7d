//! Windowed real-input FFT with magnitude output.
//!
//! The window table and the frequency-bin table are memoized: they are
//! recomputed only when `(size, type, kaiser_beta, gaussian_sigma)` or
//! `(size, sample_rate)` change, which in practice means once per session
//! unless the user reconfigures mid-flight.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{samples_to_ns, window};
use crate::error::{Result, WavescopeError};

/// Largest FFT the analyzer will plan. Anything bigger is treated as an
/// allocation failure rather than an attempt to grab gigabytes of scratch.
const MAX_FFT_SIZE: usize = 1 << 22;

/// Fallback values applied when the configured triple is unusable.
const DEFAULT_FFT_SIZE: usize = 1024;
const DEFAULT_HOP_SIZE: usize = 512;
const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Spectrum stage configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpectrumConfig {
    /// Transform length N; output has N/2+1 bins.
    pub fft_size: usize,
    /// Stride between successive windows in `process_overlapped`.
    pub hop_size: usize,
    /// Sample rate used for the frequency-bin table (Hz).
    pub sample_rate: u32,
    pub window: window::WindowType,
    /// Kaiser β shape parameter (read only for the Kaiser window).
    pub kaiser_beta: f32,
    /// Gaussian σ as a fraction of the half-width (read only for Gaussian).
    pub gaussian_sigma: f32,
    /// Emit magnitudes in dB instead of linear.
    pub log_scale: bool,
    /// dB value substituted for zero magnitude when `log_scale` is on.
    pub noise_floor_db: f32,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
            hop_size: DEFAULT_HOP_SIZE,
            sample_rate: DEFAULT_SAMPLE_RATE,
            window: window::WindowType::Hann,
            kaiser_beta: 9.0,
            gaussian_sigma: 0.4,
            log_scale: true,
            noise_floor_db: -120.0,
        }
    }
}

impl SpectrumConfig {
    /// Replace unusable `(fft_size, hop_size, sample_rate)` values with the
    /// safe defaults. Returns whether anything was corrected.
    fn sanitized(mut self) -> (Self, bool) {
        let mut adjusted = false;
        if self.fft_size == 0 {
            self.fft_size = DEFAULT_FFT_SIZE;
            adjusted = true;
        }
        if self.hop_size == 0 || self.hop_size > self.fft_size {
            self.hop_size = DEFAULT_HOP_SIZE.min(self.fft_size);
            adjusted = true;
        }
        if self.sample_rate == 0 {
            self.sample_rate = DEFAULT_SAMPLE_RATE;
            adjusted = true;
        }
        (self, adjusted)
    }
}

/// One spectrum result for a single window position.
#[derive(Debug, Clone)]
pub struct SpectrogramFrame {
    pub timestamp_ns: u64,
    pub sample_offset: u64,
    /// N/2+1 magnitudes, linear or dB depending on configuration.
    pub magnitudes: Vec<f32>,
    /// Bin center frequencies in Hz: `frequencies[i] = i · rate / N`.
    pub frequencies: Vec<f32>,
    /// Mean of the analysis window, already divided out of `magnitudes`.
    pub window_gain: f32,
}

type WindowKey = (usize, window::WindowType, u32, u32);

/// Real-to-complex FFT analyzer with memoized window/frequency tables.
pub struct SpectrumAnalyzer {
    config: SpectrumConfig,
    planner: RealFftPlanner<f32>,
    fft: Option<Arc<dyn RealToComplex<f32>>>,
    fft_len: usize,
    input: Vec<f32>,
    output: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    window: Vec<f32>,
    window_gain: f32,
    window_key: Option<WindowKey>,
    frequencies: Vec<f32>,
    freq_key: Option<(usize, u32)>,
    warned_invalid: bool,
}

impl SpectrumAnalyzer {
    pub fn new(config: SpectrumConfig) -> Self {
        let (config, adjusted) = config.sanitized();
        let mut analyzer = Self {
            config,
            planner: RealFftPlanner::new(),
            fft: None,
            fft_len: 0,
            input: Vec::new(),
            output: Vec::new(),
            scratch: Vec::new(),
            window: Vec::new(),
            window_gain: 1.0,
            window_key: None,
            frequencies: Vec::new(),
            freq_key: None,
            warned_invalid: false,
        };
        if adjusted {
            analyzer.warn_adjusted();
        }
        analyzer
    }

    pub fn config(&self) -> &SpectrumConfig {
        &self.config
    }

    /// Swap in a new configuration. Caches are refreshed lazily on the next
    /// `process` call, keyed on the fields that actually changed.
    pub fn set_config(&mut self, config: SpectrumConfig) {
        let (config, adjusted) = config.sanitized();
        if adjusted {
            self.warn_adjusted();
        }
        self.config = config;
    }

    /// Analyze one block. Input shorter than the FFT size is zero-padded.
    pub fn process(
        &mut self,
        block: &[f32],
        timestamp_ns: u64,
        sample_offset: u64,
    ) -> Result<SpectrogramFrame> {
        let fft = self.ensure_plan()?;
        self.ensure_window()?;
        self.ensure_frequencies();

        let n = self.fft_len;
        let copy = block.len().min(n);
        self.input[..copy].copy_from_slice(&block[..copy]);
        self.input[copy..].fill(0.0);
        for (s, w) in self.input.iter_mut().zip(self.window.iter()) {
            *s *= w;
        }

        fft.process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)
            .map_err(|e| WavescopeError::Resource(format!("FFT execution failed: {e}")))?;

        let norm = 1.0 / (n as f32 * self.window_gain);
        let magnitudes = self
            .output
            .iter()
            .map(|c| {
                let m = (c.re * c.re + c.im * c.im).sqrt() * norm;
                if self.config.log_scale {
                    if m > 0.0 {
                        20.0 * m.log10()
                    } else {
                        self.config.noise_floor_db
                    }
                } else {
                    m
                }
            })
            .collect();

        Ok(SpectrogramFrame {
            timestamp_ns,
            sample_offset,
            magnitudes,
            frequencies: self.frequencies.clone(),
            window_gain: self.window_gain,
        })
    }

    /// Slide a window of `fft_size` over `samples` in steps of `hop_size`,
    /// producing one frame per position that fits entirely in the input.
    pub fn process_overlapped(
        &mut self,
        samples: &[f32],
        start_timestamp_ns: u64,
        start_offset: u64,
    ) -> Result<Vec<SpectrogramFrame>> {
        let n = self.config.fft_size;
        let hop = self.config.hop_size;
        let rate = self.config.sample_rate;

        let mut frames = Vec::new();
        let mut start_idx = 0usize;
        while start_idx + n <= samples.len() {
            let ts = start_timestamp_ns + samples_to_ns(start_idx as u64, rate);
            let offset = start_offset + start_idx as u64;
            frames.push(self.process(&samples[start_idx..start_idx + n], ts, offset)?);
            start_idx += hop;
        }
        Ok(frames)
    }

    fn ensure_plan(&mut self) -> Result<Arc<dyn RealToComplex<f32>>> {
        let n = self.config.fft_size;
        if let Some(fft) = &self.fft {
            if self.fft_len == n {
                return Ok(Arc::clone(fft));
            }
        }
        if n > MAX_FFT_SIZE {
            return Err(WavescopeError::Resource(format!(
                "FFT size {n} exceeds maximum {MAX_FFT_SIZE}"
            )));
        }
        let fft = self.planner.plan_fft_forward(n);
        self.input = fft.make_input_vec();
        self.output = fft.make_output_vec();
        self.scratch = fft.make_scratch_vec();
        self.fft = Some(Arc::clone(&fft));
        self.fft_len = n;
        Ok(fft)
    }

    fn ensure_window(&mut self) -> Result<()> {
        let key: WindowKey = (
            self.config.fft_size,
            self.config.window,
            self.config.kaiser_beta.to_bits(),
            self.config.gaussian_sigma.to_bits(),
        );
        if self.window_key == Some(key) {
            return Ok(());
        }
        self.window = window::generate(
            self.config.window,
            self.config.fft_size,
            self.config.kaiser_beta,
            self.config.gaussian_sigma,
        )?;
        self.window_gain = window::gain(&self.window);
        self.window_key = Some(key);
        Ok(())
    }

    fn ensure_frequencies(&mut self) {
        let key = (self.config.fft_size, self.config.sample_rate);
        if self.freq_key == Some(key) {
            return;
        }
        let n = self.config.fft_size;
        let rate = self.config.sample_rate as f32;
        self.frequencies = (0..=n / 2).map(|i| i as f32 * rate / n as f32).collect();
        self.freq_key = Some(key);
    }

    fn warn_adjusted(&mut self) {
        if !self.warned_invalid {
            warn!(
                fft_size = DEFAULT_FFT_SIZE,
                hop_size = DEFAULT_HOP_SIZE,
                sample_rate = DEFAULT_SAMPLE_RATE,
                "invalid spectrum parameters — corrected to safe defaults"
            );
            self.warned_invalid = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sine(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (std::f32::consts::TAU * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn zeros_block_hits_noise_floor_in_every_bin() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            log_scale: true,
            noise_floor_db: -120.0,
            ..SpectrumConfig::default()
        });
        let frame = analyzer.process(&vec![0.0; 1024], 0, 0).unwrap();
        assert_eq!(frame.magnitudes.len(), 513);
        assert!(frame.magnitudes.iter().all(|&m| m == -120.0));
    }

    #[test]
    fn sine_1khz_peaks_at_bin_23() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            log_scale: false,
            ..SpectrumConfig::default()
        });
        let samples = sine(1000.0, 44_100, 1024);
        let frame = analyzer.process(&samples, 0, 0).unwrap();
        let argmax = frame
            .magnitudes
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(argmax, 23);
    }

    #[test]
    fn exact_bin_sine_with_rectangular_window_has_half_magnitude() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            window: window::WindowType::Rectangular,
            log_scale: false,
            ..SpectrumConfig::default()
        });
        // Bin 32 exactly: f = 32 · 44100 / 1024
        let f = 32.0 * 44_100.0 / 1024.0;
        let frame = analyzer.process(&sine(f, 44_100, 1024), 0, 0).unwrap();
        assert_relative_eq!(frame.window_gain, 1.0);
        assert_relative_eq!(frame.magnitudes[32], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn frequency_table_matches_bin_formula() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig::default());
        let frame = analyzer.process(&vec![0.0; 1024], 0, 0).unwrap();
        assert_eq!(frame.frequencies.len(), 513);
        for (i, &f) in frame.frequencies.iter().enumerate() {
            assert_relative_eq!(f, i as f32 * 44_100.0 / 1024.0, epsilon = 1e-3);
        }
        assert_relative_eq!(frame.frequencies[512], 22_050.0, epsilon = 1e-2);
    }

    #[test]
    fn overlapped_hops_cover_input_with_correct_offsets() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig::default());
        let samples = vec![0.0f32; 4096];
        let frames = analyzer.process_overlapped(&samples, 1_000, 50).unwrap();
        // Window fits at 0, 512, …, 3072 → 7 positions.
        assert_eq!(frames.len(), 7);
        for (k, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sample_offset, 50 + (k * 512) as u64);
            let expected_ts = 1_000 + samples_to_ns((k * 512) as u64, 44_100);
            assert_eq!(frame.timestamp_ns, expected_ts);
        }
    }

    #[test]
    fn short_input_is_zero_padded() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            log_scale: false,
            ..SpectrumConfig::default()
        });
        let frame = analyzer.process(&[0.5; 16], 0, 0).unwrap();
        assert_eq!(frame.magnitudes.len(), 513);
        // Energy present but far below a full-length signal.
        assert!(frame.magnitudes[0] > 0.0);
    }

    #[test]
    fn invalid_parameters_fall_back_to_defaults() {
        let analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            fft_size: 0,
            hop_size: 0,
            sample_rate: 0,
            ..SpectrumConfig::default()
        });
        assert_eq!(analyzer.config().fft_size, 1024);
        assert_eq!(analyzer.config().hop_size, 512);
        assert_eq!(analyzer.config().sample_rate, 44_100);
    }

    #[test]
    fn hop_larger_than_fft_is_corrected() {
        let analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            fft_size: 256,
            hop_size: 4096,
            ..SpectrumConfig::default()
        });
        assert_eq!(analyzer.config().hop_size, 256);
    }

    #[test]
    fn oversized_fft_is_a_resource_error() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            fft_size: MAX_FFT_SIZE * 2,
            ..SpectrumConfig::default()
        });
        let err = analyzer.process(&[0.0; 16], 0, 0).unwrap_err();
        assert!(matches!(err, WavescopeError::Resource(_)));
    }

    #[test]
    fn window_change_invalidates_cache() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            window: window::WindowType::Rectangular,
            log_scale: false,
            ..SpectrumConfig::default()
        });
        let a = analyzer.process(&vec![1.0; 1024], 0, 0).unwrap();
        assert_relative_eq!(a.window_gain, 1.0);

        let mut cfg = *analyzer.config();
        cfg.window = window::WindowType::Hann;
        analyzer.set_config(cfg);
        let b = analyzer.process(&vec![1.0; 1024], 0, 0).unwrap();
        assert!(b.window_gain < 0.6, "Hann gain ≈ 0.5, got {}", b.window_gain);
    }
}
