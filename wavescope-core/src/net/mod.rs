//! Networked encoded-stream source.
//!
//! The stream itself is decoded by an external streaming decoder behind the
//! [`StreamDecoder`] trait; this module owns everything around it: config
//! validation, pipeline composition, dynamic format discovery, timestamping
//! and the reconnect policy.

pub mod decoder;
pub mod source;

pub use decoder::{
    CapsFilter, DecodedPacket, DecoderFactory, PacketPayload, PacketStatus, PipelineSpec,
    SinkSettings, SourceElement, StreamCaps, StreamDecoder,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, WavescopeError};
use crate::format::SampleFormat;

/// URL schemes the pipeline composer knows how to source.
pub const RECOGNIZED_SCHEMES: &[&str] = &["http", "https", "file", "udp", "rtp", "rtsp"];

const MAX_BUFFERS_RANGE: std::ops::RangeInclusive<u32> = 1..=500;
const BUS_TIMER_RANGE: std::ops::RangeInclusive<u64> = 5..=1000;
const RECOMMENDED_MIN_RECONNECT_DELAY_MS: u64 = 200;

/// Network stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInputConfig {
    pub url: String,
    /// Decoded buffers queued at the sink before the oldest is dropped.
    pub max_buffers: u32,
    pub drop_buffers: bool,
    /// Synchronize sink delivery to the pipeline clock.
    pub sync_audio: bool,
    pub async_sink: bool,
    /// Poll interval for pipeline bus messages / packet waits, ms.
    pub bus_timer_interval_ms: u64,
    pub connection_timeout_ms: u64,
    pub auto_reconnect: bool,
    /// Reconnect attempt cap; -1 means unlimited.
    pub max_reconnect_attempts: i32,
    pub reconnect_delay_ms: u64,
    /// Pin decoded audio to this rate; 0 leaves the stream rate alone.
    pub target_sample_rate: u32,
    /// Pin decoded audio to this channel count; 0 leaves it alone.
    pub target_channels: u16,
    /// Pin decoded audio to this sample format; `Unknown` leaves it alone.
    pub target_format: SampleFormat,
    /// Fail the session if the decoded caps do not match the targets.
    pub enforce_format: bool,
    pub user_agent: String,
    pub extra_headers: Vec<(String, String)>,
    pub allow_insecure_tls: bool,
}

impl Default for NetworkInputConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_buffers: 100,
            drop_buffers: true,
            sync_audio: false,
            async_sink: true,
            bus_timer_interval_ms: 100,
            connection_timeout_ms: 5_000,
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 1_000,
            target_sample_rate: 0,
            target_channels: 0,
            target_format: SampleFormat::Unknown,
            enforce_format: false,
            user_agent: concat!("wavescope/", env!("CARGO_PKG_VERSION")).to_string(),
            extra_headers: Vec::new(),
            allow_insecure_tls: false,
        }
    }
}

impl NetworkInputConfig {
    /// URL scheme, lowercased, when one is present.
    pub fn scheme(&self) -> Option<String> {
        let (scheme, rest) = self.url.split_once("://")?;
        if scheme.is_empty() || rest.is_empty() {
            return None;
        }
        Some(scheme.to_ascii_lowercase())
    }

    /// Strict validation: rejects anything out of range.
    pub fn validate(&self) -> Result<()> {
        let scheme = self
            .scheme()
            .ok_or_else(|| WavescopeError::Config(format!("unparsable stream URL '{}'", self.url)))?;
        if !RECOGNIZED_SCHEMES.contains(&scheme.as_str()) {
            return Err(WavescopeError::Config(format!(
                "unrecognized URL scheme '{scheme}'"
            )));
        }
        if !MAX_BUFFERS_RANGE.contains(&self.max_buffers) {
            return Err(WavescopeError::Config(format!(
                "maxBuffers {} outside 1..=500",
                self.max_buffers
            )));
        }
        if !BUS_TIMER_RANGE.contains(&self.bus_timer_interval_ms) {
            return Err(WavescopeError::Config(format!(
                "busTimerInterval {} ms outside 5..=1000",
                self.bus_timer_interval_ms
            )));
        }
        if self.max_reconnect_attempts < -1 {
            return Err(WavescopeError::Config(
                "maxReconnectAttempts must be >= -1".into(),
            ));
        }
        if self.enforce_format && self.target_format == SampleFormat::Unknown {
            return Err(WavescopeError::Config(
                "enforceFormat requires a concrete targetFormat".into(),
            ));
        }
        if self.reconnect_delay_ms < RECOMMENDED_MIN_RECONNECT_DELAY_MS {
            warn!(
                delay_ms = self.reconnect_delay_ms,
                "reconnect delay below recommended {RECOMMENDED_MIN_RECONNECT_DELAY_MS} ms"
            );
        }
        Ok(())
    }

    /// Clamping variant: out-of-range numerics are pulled into range with a
    /// warning instead of rejected. Returns the corrected config and
    /// whether anything was adjusted. URL and format-coherence problems are
    /// still hard errors.
    pub fn normalized(&self) -> Result<(Self, bool)> {
        let mut cfg = self.clone();
        let mut adjusted = false;

        let scheme = cfg
            .scheme()
            .ok_or_else(|| WavescopeError::Config(format!("unparsable stream URL '{}'", cfg.url)))?;
        if !RECOGNIZED_SCHEMES.contains(&scheme.as_str()) {
            return Err(WavescopeError::Config(format!(
                "unrecognized URL scheme '{scheme}'"
            )));
        }
        if cfg.enforce_format && cfg.target_format == SampleFormat::Unknown {
            return Err(WavescopeError::Config(
                "enforceFormat requires a concrete targetFormat".into(),
            ));
        }

        if !MAX_BUFFERS_RANGE.contains(&cfg.max_buffers) {
            let clamped = cfg
                .max_buffers
                .clamp(*MAX_BUFFERS_RANGE.start(), *MAX_BUFFERS_RANGE.end());
            warn!(from = cfg.max_buffers, to = clamped, "clamped maxBuffers");
            cfg.max_buffers = clamped;
            adjusted = true;
        }
        if !BUS_TIMER_RANGE.contains(&cfg.bus_timer_interval_ms) {
            let clamped = cfg
                .bus_timer_interval_ms
                .clamp(*BUS_TIMER_RANGE.start(), *BUS_TIMER_RANGE.end());
            warn!(
                from = cfg.bus_timer_interval_ms,
                to = clamped,
                "clamped busTimerInterval"
            );
            cfg.bus_timer_interval_ms = clamped;
            adjusted = true;
        }
        if cfg.max_reconnect_attempts < -1 {
            warn!(
                from = cfg.max_reconnect_attempts,
                "clamped maxReconnectAttempts to -1 (unlimited)"
            );
            cfg.max_reconnect_attempts = -1;
            adjusted = true;
        }
        if cfg.reconnect_delay_ms < RECOMMENDED_MIN_RECONNECT_DELAY_MS {
            warn!(
                delay_ms = cfg.reconnect_delay_ms,
                "reconnect delay below recommended {RECOMMENDED_MIN_RECONNECT_DELAY_MS} ms"
            );
        }

        Ok((cfg, adjusted))
    }
}
