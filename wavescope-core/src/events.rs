//! Event payloads broadcast from the session to subscribers.
//!
//! | Event | Channel |
//! |-------|---------|
//! | [`FrameBatch`] | frames — one batch per processed chunk |
//! | [`StatsUpdate`] | stats — every 100 blocks and at flush |
//! | [`SessionNotice`] | notices — format detection, errors, end of stream |
//!
//! Subscribers receive value copies over `tokio::sync::broadcast`; nothing
//! they hold aliases analyzer-owned memory.

use serde::{Deserialize, Serialize};

use crate::format::AudioFormat;

// ---------------------------------------------------------------------------
// Analysis frames
// ---------------------------------------------------------------------------

/// One analysis result covering exactly one block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameData {
    /// Session-monotonic block counter.
    pub block_index: u64,
    /// Mono samples preceding this block within the session.
    pub sample_offset: u64,
    /// `session_start_ns + round(sample_offset · 1e9 / sample_rate)`.
    pub timestamp_ns: u64,
    /// Index-downsampled copy of the block for rendering (W points), or a
    /// single sample when peak tracking is disabled.
    pub waveform: Vec<f32>,
    /// Magnitudes for N/2+1 bins; empty when the spectrum stage is disabled.
    pub spectrum: Vec<f32>,
    /// Center frequency of each spectrum bin in Hz.
    pub frequencies: Vec<f32>,
    /// Mean of the analysis window used to normalize `spectrum`.
    pub window_gain: f32,
}

/// All frames produced by a single `process_chunk` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameBatch {
    /// Monotonically increasing batch sequence number (per session).
    pub seq: u64,
    pub frames: Vec<FrameData>,
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Periodic analyzer telemetry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpdate {
    pub blocks_processed: u64,
    pub samples_processed: u64,
    /// Samples currently waiting in the accumulator (< block size).
    pub accum_len: usize,
}

// ---------------------------------------------------------------------------
// Session notices
// ---------------------------------------------------------------------------

/// Out-of-band session events: format discovery, failures, natural end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SessionNotice {
    /// Emitted once per session when the active source learns its format.
    FormatDetected { format: AudioFormat },
    /// Recoverable or terminal failure, human-readable.
    Error { message: String },
    /// The source's underlying stream ended naturally.
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    #[test]
    fn frame_batch_serializes_with_camel_case() {
        let batch = FrameBatch {
            seq: 4,
            frames: vec![FrameData {
                block_index: 2,
                sample_offset: 2048,
                timestamp_ns: 1_000_000,
                waveform: vec![0.0, 0.5],
                spectrum: vec![-120.0],
                frequencies: vec![0.0],
                window_gain: 0.5,
            }],
        };

        let json = serde_json::to_value(&batch).expect("serialize frame batch");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["frames"][0]["blockIndex"], 2);
        assert_eq!(json["frames"][0]["sampleOffset"], 2048);
        assert_eq!(json["frames"][0]["windowGain"], 0.5);

        let round_trip: FrameBatch = serde_json::from_value(json).expect("deserialize");
        assert_eq!(round_trip.frames.len(), 1);
        assert_eq!(round_trip.frames[0].block_index, 2);
    }

    #[test]
    fn notice_tags_by_kind() {
        let notice = SessionNotice::FormatDetected {
            format: AudioFormat::new(48_000, 2, SampleFormat::Float32),
        };
        let json = serde_json::to_value(&notice).expect("serialize notice");
        assert_eq!(json["kind"], "formatDetected");
        assert_eq!(json["format"]["sampleRate"], 48_000);

        let err = SessionNotice::Error {
            message: "device lost".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["message"], "device lost");
    }
}
