//! Network source worker.
//!
//! One thread per session: composes the pipeline, runs a decoder created by
//! the factory, latches the stream format off the first packet, converts
//! payloads to mono f32 and forwards timestamped chunks downstream. EOS and
//! pipeline failures go through the reconnect policy; a stream that stays
//! silent for [`STREAM_TIMEOUT`] is treated as failed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::audio::resample::RateConverter;
use crate::buffering::chunk::FloatChunk;
use crate::clock;
use crate::error::Result;
use crate::events::SessionNotice;
use crate::format::{AudioFormat, SampleFormat};
use crate::net::decoder::{
    DecodedPacket, DecoderFactory, PacketPayload, PacketStatus, PipelineSpec, StreamCaps,
};
use crate::net::NetworkInputConfig;

/// No decoded data for this long counts as a stream failure.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Input chunk size fed to the fallback resampler.
const RESAMPLE_CHUNK: usize = 1024;

/// Granularity of the interruptible reconnect sleep.
const SLEEP_SLICE_MS: u64 = 25;

/// Worker body for the network source thread.
///
/// `open_tx` is acknowledged after config validation and pipeline
/// composition: connection failures past that point belong to the
/// reconnect policy, not to `start_capture`.
pub(crate) fn run_network_worker(
    config: NetworkInputConfig,
    factory: Arc<Mutex<Box<dyn DecoderFactory>>>,
    chunk_tx: crossbeam_channel::Sender<FloatChunk>,
    notice_tx: tokio::sync::broadcast::Sender<SessionNotice>,
    running: Arc<AtomicBool>,
    open_tx: std::sync::mpsc::Sender<Result<()>>,
) {
    let spec = match PipelineSpec::from_config(&config) {
        Ok(spec) => {
            let _ = open_tx.send(Ok(()));
            spec
        }
        Err(e) => {
            let _ = open_tx.send(Err(e));
            running.store(false, Ordering::SeqCst);
            return;
        }
    };

    info!(pipeline = %spec.launch_description(), "network pipeline composed");

    let poll = Duration::from_millis(config.bus_timer_interval_ms);
    let mut reconnects_used: u32 = 0;
    let mut announced_caps: Option<StreamCaps> = None;
    let mut resampler: Option<RateConverter> = None;

    'session: while running.load(Ordering::Relaxed) {
        let mut decoder = factory.lock().create();

        if let Err(e) = decoder.start(&spec) {
            warn!(error = %e, "pipeline start failed");
            if !schedule_reconnect(&config, &mut reconnects_used, &notice_tx, &running, &e.to_string())
            {
                break 'session;
            }
            continue 'session;
        }

        let mut last_data = Instant::now();

        loop {
            if !running.load(Ordering::Relaxed) {
                decoder.stop();
                break 'session;
            }

            match decoder.poll_packet(poll) {
                Ok(PacketStatus::Packet(packet)) => {
                    last_data = Instant::now();

                    if announced_caps.is_none() {
                        if config.enforce_format && !caps_satisfy(&packet.caps, &config) {
                            let message = format!(
                                "decoded caps {:?} do not satisfy enforced targets",
                                packet.caps
                            );
                            warn!("{message}");
                            decoder.stop();
                            let _ = notice_tx.send(SessionNotice::Error { message });
                            break 'session;
                        }
                        let format = AudioFormat::new(
                            packet.caps.sample_rate,
                            packet.caps.channels,
                            packet.caps.sample_format,
                        );
                        info!(?format, "stream format detected");
                        announced_caps = Some(packet.caps);
                        let _ = notice_tx.send(SessionNotice::FormatDetected { format });

                        // Fallback resample for decoders that ignored the
                        // pipeline's resample request.
                        if config.target_sample_rate != 0
                            && config.target_sample_rate != packet.caps.sample_rate
                        {
                            match RateConverter::new(
                                packet.caps.sample_rate,
                                config.target_sample_rate,
                                RESAMPLE_CHUNK,
                            ) {
                                Ok(rc) => resampler = Some(rc),
                                Err(e) => {
                                    decoder.stop();
                                    let _ = notice_tx.send(SessionNotice::Error {
                                        message: e.to_string(),
                                    });
                                    break 'session;
                                }
                            }
                        }
                    } else if Some(packet.caps) != announced_caps {
                        warn!(caps = ?packet.caps, "stream caps changed mid-session; keeping first format");
                    }

                    let mono = packet_to_mono(&packet);
                    if mono.is_empty() {
                        continue;
                    }
                    let samples = match resampler.as_mut() {
                        Some(rc) => rc.process(&mono),
                        None => mono,
                    };
                    if samples.is_empty() {
                        continue;
                    }

                    let timestamp_ns = packet.pts_ns.unwrap_or_else(clock::now_ns);
                    if chunk_tx.send(FloatChunk::new(samples, timestamp_ns)).is_err() {
                        decoder.stop();
                        break 'session;
                    }
                }

                Ok(PacketStatus::Idle) => {
                    if last_data.elapsed() >= STREAM_TIMEOUT {
                        warn!(timeout = ?STREAM_TIMEOUT, "no stream data within timeout");
                        decoder.stop();
                        if !schedule_reconnect(
                            &config,
                            &mut reconnects_used,
                            &notice_tx,
                            &running,
                            "stream stalled",
                        ) {
                            break 'session;
                        }
                        continue 'session;
                    }
                }

                Ok(PacketStatus::Eos) => {
                    info!("stream reached end");
                    decoder.stop();
                    if config.auto_reconnect {
                        if !schedule_reconnect(
                            &config,
                            &mut reconnects_used,
                            &notice_tx,
                            &running,
                            "end of stream",
                        ) {
                            break 'session;
                        }
                        continue 'session;
                    }
                    let _ = notice_tx.send(SessionNotice::Finished);
                    break 'session;
                }

                Err(e) => {
                    warn!(error = %e, "pipeline error");
                    decoder.stop();
                    if !schedule_reconnect(
                        &config,
                        &mut reconnects_used,
                        &notice_tx,
                        &running,
                        &e.to_string(),
                    ) {
                        break 'session;
                    }
                    continue 'session;
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    info!("network worker stopped");
}

/// Apply the reconnect policy after a failure. Returns `true` when the
/// caller should rebuild and retry, `false` when the session is over (an
/// `Error` notice has been sent in that case unless we were asked to stop).
fn schedule_reconnect(
    config: &NetworkInputConfig,
    reconnects_used: &mut u32,
    notice_tx: &tokio::sync::broadcast::Sender<SessionNotice>,
    running: &AtomicBool,
    reason: &str,
) -> bool {
    if !running.load(Ordering::Relaxed) {
        return false;
    }
    if !config.auto_reconnect {
        let _ = notice_tx.send(SessionNotice::Error {
            message: format!("stream failed: {reason}"),
        });
        return false;
    }
    if config.max_reconnect_attempts >= 0
        && *reconnects_used >= config.max_reconnect_attempts as u32
    {
        let _ = notice_tx.send(SessionNotice::Error {
            message: format!(
                "stream failed after {} reconnect attempts: {reason}",
                *reconnects_used
            ),
        });
        return false;
    }

    *reconnects_used += 1;
    warn!(
        attempt = *reconnects_used,
        delay_ms = config.reconnect_delay_ms,
        reason,
        "reconnecting"
    );

    // Interruptible delay so stop_capture is not held hostage by backoff.
    let deadline = Instant::now() + Duration::from_millis(config.reconnect_delay_ms);
    while Instant::now() < deadline {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(remaining.min(Duration::from_millis(SLEEP_SLICE_MS)));
    }
    running.load(Ordering::Relaxed)
}

fn caps_satisfy(caps: &StreamCaps, config: &NetworkInputConfig) -> bool {
    (config.target_format == SampleFormat::Unknown || caps.sample_format == config.target_format)
        && (config.target_sample_rate == 0 || caps.sample_rate == config.target_sample_rate)
        && (config.target_channels == 0 || caps.channels == config.target_channels)
}

/// Channel-0 extraction + float conversion. Int32 payloads are dropped.
fn packet_to_mono(packet: &DecodedPacket) -> Vec<f32> {
    let ch = packet.caps.channels.max(1) as usize;
    match &packet.payload {
        PacketPayload::Float32(data) => {
            let frames = data.len() / ch;
            (0..frames).map(|f| data[f * ch]).collect()
        }
        PacketPayload::Int16(data) => {
            let frames = data.len() / ch;
            (0..frames).map(|f| data[f * ch] as f32 / 32_768.0).collect()
        }
        PacketPayload::Int32(data) => {
            warn!(samples = data.len(), "int32 stream payload dropped");
            Vec::new()
        }
    }
}
