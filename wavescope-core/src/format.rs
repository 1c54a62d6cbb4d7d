//! Audio format descriptors shared by both source kinds.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WavescopeError};

/// Encoding of one PCM sample as delivered by a device or decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Format not yet known / not forced.
    Unknown,
    Int16,
    Int32,
    Float32,
}

impl SampleFormat {
    /// Bytes per sample, 0 for `Unknown`.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::Unknown => 0,
            SampleFormat::Int16 => 2,
            SampleFormat::Int32 | SampleFormat::Float32 => 4,
        }
    }
}

/// Negotiated stream format. Immutable for the lifetime of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    /// Check the triple against the ranges every source must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(WavescopeError::Config("sample rate must be positive".into()));
        }
        if self.channels == 0 || self.channels > 32 {
            return Err(WavescopeError::Config(format!(
                "channel count {} outside 1..=32",
                self.channels
            )));
        }
        if self.sample_format == SampleFormat::Unknown {
            return Err(WavescopeError::Config("sample format is unknown".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_triple_passes() {
        assert!(AudioFormat::new(44_100, 2, SampleFormat::Float32)
            .validate()
            .is_ok());
    }

    #[test]
    fn zero_rate_and_bad_channels_fail() {
        assert!(AudioFormat::new(0, 2, SampleFormat::Int16).validate().is_err());
        assert!(AudioFormat::new(44_100, 0, SampleFormat::Int16)
            .validate()
            .is_err());
        assert!(AudioFormat::new(44_100, 33, SampleFormat::Int16)
            .validate()
            .is_err());
    }

    #[test]
    fn unknown_format_fails_validation() {
        assert!(AudioFormat::new(44_100, 1, SampleFormat::Unknown)
            .validate()
            .is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_value(SampleFormat::Float32).unwrap();
        assert_eq!(json, "float32");
        let fmt = AudioFormat::new(48_000, 1, SampleFormat::Int16);
        let json = serde_json::to_value(fmt).unwrap();
        assert_eq!(json["sampleRate"], 48_000);
        assert_eq!(json["sampleFormat"], "int16");
    }
}
