//! Analysis window generators.
//!
//! Pure functions: given a type, a size and the Kaiser/Gaussian shape
//! parameters they return the window coefficients in [0, 1]. The mean of
//! the window (its gain) is what the spectrum stage divides magnitudes by,
//! so a cached window always travels together with its gain.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WavescopeError};

/// Supported tapering functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowType {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
    Bartlett,
    Kaiser,
    BlackmanHarris,
    Gaussian,
}

/// Generate `size` window coefficients.
///
/// `kaiser_beta` and `gaussian_sigma` are only read by their respective
/// window types.
///
/// # Errors
/// `WavescopeError::Config` when `size` is zero.
pub fn generate(
    window: WindowType,
    size: usize,
    kaiser_beta: f32,
    gaussian_sigma: f32,
) -> Result<Vec<f32>> {
    if size == 0 {
        return Err(WavescopeError::Config(
            "window size must be positive".into(),
        ));
    }
    if size == 1 {
        return Ok(vec![1.0]);
    }

    let n1 = (size - 1) as f64;
    let coeffs = match window {
        WindowType::Rectangular => vec![1.0; size],
        WindowType::Hann => cosine_sum(size, &[0.5, -0.5]),
        WindowType::Hamming => cosine_sum(size, &[0.54, -0.46]),
        WindowType::Blackman => cosine_sum(size, &[0.42, -0.5, 0.08]),
        WindowType::BlackmanHarris => cosine_sum(size, &[0.35875, -0.48829, 0.14128, -0.01168]),
        WindowType::Bartlett => (0..size)
            .map(|i| {
                let v = 1.0 - 2.0 * (i as f64 - n1 / 2.0).abs() / n1;
                v as f32
            })
            .collect(),
        WindowType::Kaiser => {
            let denom = bessel_i0(kaiser_beta as f64);
            (0..size)
                .map(|i| {
                    let x = 2.0 * i as f64 / n1 - 1.0;
                    let arg = kaiser_beta as f64 * (1.0 - x * x).max(0.0).sqrt();
                    (bessel_i0(arg) / denom) as f32
                })
                .collect()
        }
        WindowType::Gaussian => {
            let spread = gaussian_sigma as f64 * n1 / 2.0;
            (0..size)
                .map(|i| {
                    let d = i as f64 - n1 / 2.0;
                    (-0.5 * (d / spread) * (d / spread)).exp() as f32
                })
                .collect()
        }
    };

    Ok(coeffs)
}

/// Mean of the window coefficients.
pub fn gain(window: &[f32]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(|&w| w as f64).sum::<f64>() as f32 / window.len() as f32
}

fn cosine_sum(size: usize, terms: &[f64]) -> Vec<f32> {
    let n1 = (size - 1) as f64;
    (0..size)
        .map(|i| {
            let t = std::f64::consts::TAU * i as f64 / n1;
            let mut acc = 0.0;
            for (k, a) in terms.iter().enumerate() {
                acc += a * (k as f64 * t).cos();
            }
            acc as f32
        })
        .collect()
}

/// Modified Bessel function of the first kind, order 0.
///
/// Series sum, truncated when the next term drops below 1e-10.
fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut sum = 1.0;
    let mut term = 1.0;
    let mut k = 1.0;
    loop {
        term *= (half / k) * (half / k);
        if term < 1e-10 {
            break;
        }
        sum += term;
        k += 1.0;
    }
    sum
}
