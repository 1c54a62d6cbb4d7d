//! Local device capture via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (beyond the reused scratch buffer)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by writing channel-0 samples into an
//! SPSC ring buffer producer whose `push_slice` is lock-free. A capture
//! worker thread drains the consumer half, stamps the monotonic clock and
//! sends [`FloatChunk`]s to the analyzer thread.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio
//! on macOS). `CaptureSource` therefore must be created and dropped on the
//! same thread — the capture worker opens it inside its own thread body.

pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tracing::info;
#[cfg(feature = "audio-cpal")]
use tracing::{error, warn};

use crate::{
    buffering::chunk::FloatChunk,
    buffering::{AudioConsumer, AudioProducer, Consumer},
    clock,
    error::{Result, WavescopeError},
    events::SessionNotice,
    format::{AudioFormat, SampleFormat},
};

#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;

/// Samples drained from the ring per worker iteration.
const DRAIN_CHUNK: usize = 1024;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const SLEEP_EMPTY_MS: u64 = 5;

/// Local capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhysicalInputConfig {
    /// Desired capture rate in Hz, 8000..=384000.
    pub sample_rate: u32,
    /// Desired channel count, 1..=32. Only channel 0 reaches the analyzer.
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// Device name or description fragment; empty selects the default input.
    pub device_id: String,
    /// Ignore the desired triple and open the device's preferred format.
    pub use_preferred: bool,
    /// Retry with the device's preferred format when the desired one is
    /// rejected; otherwise surface `FormatUnsupported`.
    pub fallback_to_preferred: bool,
    /// Requested hardware buffer size in frames; 0 leaves it to the driver.
    pub buffer_size: u32,
}

impl Default for PhysicalInputConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            sample_format: SampleFormat::Float32,
            device_id: String::new(),
            use_preferred: false,
            fallback_to_preferred: true,
            buffer_size: 0,
        }
    }
}

impl PhysicalInputConfig {
    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return Err(WavescopeError::Config(format!(
                "sample rate {} outside 8000..=384000",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > 32 {
            return Err(WavescopeError::Config(format!(
                "channel count {} outside 1..=32",
                self.channels
            )));
        }
        if !self.use_preferred && self.sample_format == SampleFormat::Unknown {
            return Err(WavescopeError::Config(
                "sample format must be set unless the preferred format is used".into(),
            ));
        }
        Ok(())
    }
}

/// Handle to an active capture stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct CaptureSource {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Format the device actually opened with.
    pub format: AudioFormat,
}

#[cfg(feature = "audio-cpal")]
impl CaptureSource {
    /// Resolve the device, negotiate a format and begin capturing into
    /// `producer`.
    ///
    /// # Errors
    /// - `WavescopeError::NoDefaultInputDevice` when no input exists.
    /// - `WavescopeError::FormatUnsupported` when neither the desired nor
    ///   (under the fallback policy) the preferred format can be opened.
    /// - `WavescopeError::Stream` for cpal stream construction failures.
    pub fn open(
        config: &PhysicalInputConfig,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        config.validate()?;

        let host = cpal::default_host();
        let mut selected_device = None;

        if !config.device_id.is_empty() {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices.find(|d| {
                        d.name()
                            .map(|name| device::matches_identifier(&name, &config.device_id))
                            .unwrap_or(false)
                    });
                    if selected_device.is_none() {
                        warn!(
                            "input device '{}' not found, falling back to default",
                            config.device_id
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "failed to list input devices while resolving '{}': {e}",
                        config.device_id
                    );
                }
            }
        }

        let device = match selected_device.or_else(|| host.default_input_device()) {
            Some(d) => d,
            None => return Err(WavescopeError::NoDefaultInputDevice),
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let preferred = device
            .default_input_config()
            .map_err(|e| WavescopeError::Device(e.to_string()))?;

        let negotiated = if config.use_preferred {
            preferred.clone()
        } else {
            match find_supported(&device, config) {
                Some(found) => found,
                None if config.fallback_to_preferred => {
                    warn!(
                        rate = config.sample_rate,
                        channels = config.channels,
                        "desired format rejected by device, using preferred format"
                    );
                    preferred.clone()
                }
                None => {
                    return Err(WavescopeError::FormatUnsupported(format!(
                        "device does not accept {} Hz / {} ch / {:?}",
                        config.sample_rate, config.channels, config.sample_format
                    )))
                }
            }
        };

        let sample_rate = negotiated.sample_rate().0;
        let channels = negotiated.channels();
        let cpal_format = negotiated.sample_format();

        info!(sample_rate, channels, format = ?cpal_format, "audio format negotiated");

        let buffer_size = if config.buffer_size > 0 {
            cpal::BufferSize::Fixed(config.buffer_size)
        } else {
            cpal::BufferSize::Default
        };
        let stream_config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size,
        };

        // Pre-clone one Arc per sample format branch so each closure owns its flag.
        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);
        let running_i32 = Arc::clone(&running);

        let (stream, format) = match cpal_format {
            cpal::SampleFormat::F32 => {
                let ch = channels as usize;
                let mut producer = producer;
                let mut mono_buf: Vec<f32> = Vec::new();
                let stream = device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[f32], _info| {
                            if !running_f32.load(Ordering::Relaxed) {
                                return;
                            }
                            let frames = data.len() / ch;
                            mono_buf.resize(frames, 0.0);
                            for f in 0..frames {
                                mono_buf[f] = data[f * ch];
                            }
                            let written = producer.push_slice(&mono_buf);
                            if written < mono_buf.len() {
                                warn!(
                                    "ring buffer full: dropped {} f32 frames",
                                    mono_buf.len() - written
                                );
                            }
                        },
                        |err| error!("audio stream error: {err}"),
                        None,
                    )
                    .map_err(|e| WavescopeError::Stream(e.to_string()))?;
                (
                    stream,
                    AudioFormat::new(sample_rate, channels, SampleFormat::Float32),
                )
            }

            cpal::SampleFormat::I16 => {
                let ch = channels as usize;
                let mut producer = producer;
                let mut mono_buf: Vec<f32> = Vec::new();
                let stream = device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[i16], _info| {
                            if !running_i16.load(Ordering::Relaxed) {
                                return;
                            }
                            let frames = data.len() / ch;
                            mono_buf.resize(frames, 0.0);
                            for f in 0..frames {
                                mono_buf[f] = data[f * ch] as f32 / 32_768.0;
                            }
                            let written = producer.push_slice(&mono_buf);
                            if written < mono_buf.len() {
                                warn!(
                                    "ring buffer full: dropped {} i16 frames",
                                    mono_buf.len() - written
                                );
                            }
                        },
                        |err| error!("audio stream error: {err}"),
                        None,
                    )
                    .map_err(|e| WavescopeError::Stream(e.to_string()))?;
                (
                    stream,
                    AudioFormat::new(sample_rate, channels, SampleFormat::Int16),
                )
            }

            cpal::SampleFormat::I32 => {
                // Opened for fallback compatibility; payloads are dropped.
                let mut warned = false;
                let stream = device
                    .build_input_stream(
                        &stream_config,
                        move |data: &[i32], _info| {
                            if !running_i32.load(Ordering::Relaxed) {
                                return;
                            }
                            if !warned {
                                warn!(frames = data.len(), "int32 capture buffers are dropped");
                                warned = true;
                            }
                        },
                        |err| error!("audio stream error: {err}"),
                        None,
                    )
                    .map_err(|e| WavescopeError::Stream(e.to_string()))?;
                (
                    stream,
                    AudioFormat::new(sample_rate, channels, SampleFormat::Int32),
                )
            }

            fmt => {
                return Err(WavescopeError::FormatUnsupported(format!(
                    "unsupported device sample format: {fmt:?}"
                )))
            }
        };

        stream
            .play()
            .map_err(|e| WavescopeError::Stream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            format,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Whether the device advertises a config range covering the desired triple.
#[cfg(feature = "audio-cpal")]
fn find_supported(
    device: &cpal::Device,
    config: &PhysicalInputConfig,
) -> Option<cpal::SupportedStreamConfig> {
    let wanted_format = match config.sample_format {
        SampleFormat::Float32 => cpal::SampleFormat::F32,
        SampleFormat::Int16 => cpal::SampleFormat::I16,
        SampleFormat::Int32 => cpal::SampleFormat::I32,
        SampleFormat::Unknown => return None,
    };
    let ranges = device.supported_input_configs().ok()?;
    for range in ranges {
        if range.channels() != config.channels || range.sample_format() != wanted_format {
            continue;
        }
        if config.sample_rate >= range.min_sample_rate().0
            && config.sample_rate <= range.max_sample_rate().0
        {
            return Some(range.with_sample_rate(SampleRate(config.sample_rate)));
        }
    }
    None
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl CaptureSource {
    pub fn open(
        _config: &PhysicalInputConfig,
        _producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let _ = running;
        Err(WavescopeError::Stream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Worker body for the capture thread: opens the device, acknowledges the
/// negotiated format over `open_tx`, then drains the ring into timestamped
/// chunks until `running` clears or the analyzer side hangs up.
pub(crate) fn run_capture_worker(
    config: PhysicalInputConfig,
    chunk_tx: crossbeam_channel::Sender<FloatChunk>,
    notice_tx: tokio::sync::broadcast::Sender<SessionNotice>,
    running: Arc<AtomicBool>,
    open_tx: std::sync::mpsc::Sender<Result<AudioFormat>>,
) {
    let (producer, consumer) = crate::buffering::create_audio_ring();

    // Open on THIS thread — cpal::Stream is !Send.
    let capture = match CaptureSource::open(&config, producer, Arc::clone(&running)) {
        Ok(c) => {
            let _ = open_tx.send(Ok(c.format));
            c
        }
        Err(e) => {
            let _ = open_tx.send(Err(e));
            running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let _ = notice_tx.send(SessionNotice::FormatDetected {
        format: capture.format,
    });

    drain_ring(consumer, &chunk_tx, &running);

    // Stream drops here, releasing the audio device on this thread.
    capture.stop();
    drop(capture);
    info!("capture worker stopped");
}

/// Drain loop: pops up to [`DRAIN_CHUNK`] samples, stamps the read time and
/// hands the chunk downstream with back-pressure (a full analyzer queue
/// blocks this thread, never the RT callback).
fn drain_ring(
    mut consumer: AudioConsumer,
    chunk_tx: &crossbeam_channel::Sender<FloatChunk>,
    running: &AtomicBool,
) {
    let mut scratch = vec![0f32; DRAIN_CHUNK];
    loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        let n = consumer.pop_slice(&mut scratch);
        if n == 0 {
            std::thread::sleep(std::time::Duration::from_millis(SLEEP_EMPTY_MS));
            continue;
        }
        let chunk = FloatChunk::new(scratch[..n].to_vec(), clock::now_ns());
        if chunk_tx.send(chunk).is_err() {
            // Analyzer side is gone; nothing left to feed.
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PhysicalInputConfig::default().validate().is_ok());
    }

    #[test]
    fn sample_rate_bounds_are_enforced() {
        let mut cfg = PhysicalInputConfig::default();
        cfg.sample_rate = 7_999;
        assert!(cfg.validate().is_err());
        cfg.sample_rate = 8_000;
        assert!(cfg.validate().is_ok());
        cfg.sample_rate = 384_000;
        assert!(cfg.validate().is_ok());
        cfg.sample_rate = 384_001;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn channel_bounds_are_enforced() {
        let mut cfg = PhysicalInputConfig::default();
        cfg.channels = 0;
        assert!(cfg.validate().is_err());
        cfg.channels = 32;
        assert!(cfg.validate().is_ok());
        cfg.channels = 33;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_format_requires_use_preferred() {
        let mut cfg = PhysicalInputConfig::default();
        cfg.sample_format = SampleFormat::Unknown;
        assert!(cfg.validate().is_err());
        cfg.use_preferred = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = PhysicalInputConfig {
            device_id: "usb mic".into(),
            buffer_size: 512,
            ..PhysicalInputConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"deviceId\":\"usb mic\""));
        let back: PhysicalInputConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.buffer_size, 512);
        assert_eq!(back.sample_format, SampleFormat::Float32);
    }

    #[test]
    fn drain_ring_forwards_samples_with_timestamps() {
        use crate::buffering::{create_audio_ring, Producer};

        let (mut producer, consumer) = create_audio_ring();
        producer.push_slice(&[0.25f32; 100]);

        let (tx, rx) = crossbeam_channel::bounded(16);
        let running = Arc::new(AtomicBool::new(true));
        let running_worker = Arc::clone(&running);

        let handle = std::thread::spawn(move || drain_ring(consumer, &tx, &running_worker));

        let chunk = rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .expect("chunk forwarded");
        assert_eq!(chunk.samples.len(), 100);
        assert!(chunk.samples.iter().all(|&s| s == 0.25));

        running.store(false, Ordering::SeqCst);
        handle.join().expect("drain thread");
    }
}
