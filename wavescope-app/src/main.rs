//! Wavescope CLI host.
//!
//! Wires a `SessionController` to stdout: frames and stats from the
//! broadcast channels are printed while the session runs, and the store
//! totals are reported at the end. The `demo` source drives the network
//! path with a built-in tone decoder so the full pipeline can be exercised
//! without a sound device or a real stream.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wavescope_core::analysis::spectrum::SpectrumConfig;
use wavescope_core::analysis::AnalyzerConfig;
use wavescope_core::audio::device::list_input_devices;
use wavescope_core::engine::{ControllerConfig, SessionController, SourceKind};
use wavescope_core::net::{
    DecodedPacket, NetworkInputConfig, PacketPayload, PacketStatus, PipelineSpec, StreamCaps,
    StreamDecoder,
};
use wavescope_core::store::BlockStore;
use wavescope_core::{PhysicalInputConfig, SampleFormat, SessionNotice, WindowType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceArg {
    /// Local input device via cpal.
    Capture,
    /// Built-in 440 Hz tone through the network-source path.
    Demo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WindowArg {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
    Bartlett,
    Kaiser,
    BlackmanHarris,
    Gaussian,
}

impl From<WindowArg> for WindowType {
    fn from(arg: WindowArg) -> Self {
        match arg {
            WindowArg::Rectangular => WindowType::Rectangular,
            WindowArg::Hann => WindowType::Hann,
            WindowArg::Hamming => WindowType::Hamming,
            WindowArg::Blackman => WindowType::Blackman,
            WindowArg::Bartlett => WindowType::Bartlett,
            WindowArg::Kaiser => WindowType::Kaiser,
            WindowArg::BlackmanHarris => WindowType::BlackmanHarris,
            WindowArg::Gaussian => WindowType::Gaussian,
        }
    }
}

/// Real-time audio capture, analysis and persistence.
#[derive(Debug, Parser)]
#[command(name = "wavescope", version, about)]
struct Cli {
    /// Audio source for the session.
    #[arg(long, value_enum, default_value_t = SourceArg::Demo)]
    source: SourceArg,

    /// Session length in seconds.
    #[arg(long, default_value_t = 5)]
    duration_secs: u64,

    /// Capture device name or description fragment (capture source).
    #[arg(long, default_value = "")]
    device: String,

    /// Desired capture sample rate in Hz.
    #[arg(long, default_value_t = 44_100)]
    sample_rate: u32,

    /// Analysis block size in samples.
    #[arg(long, default_value_t = 1024)]
    block_size: usize,

    /// FFT size (defaults to the block size).
    #[arg(long)]
    fft_size: Option<usize>,

    /// Analysis window.
    #[arg(long, value_enum, default_value_t = WindowArg::Hann)]
    window: WindowArg,

    /// Keep one persistent database instead of a per-session file.
    #[arg(long)]
    persistent: bool,

    /// Application data directory (stores live beneath it).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// List input devices and exit.
    #[arg(long)]
    list_devices: bool,
}

/// Demo decoder: a paced 440 Hz sine as mono i16 at 44.1 kHz, with
/// sample-accurate PTS. Runs until stopped.
struct ToneDecoder {
    started_at: Instant,
    samples_sent: u64,
}

const TONE_RATE: u32 = 44_100;
const TONE_HZ: f32 = 440.0;
const TONE_PACKET_MAX: u64 = 4_410;

impl ToneDecoder {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            samples_sent: 0,
        }
    }
}

impl StreamDecoder for ToneDecoder {
    fn start(&mut self, spec: &PipelineSpec) -> wavescope_core::error::Result<()> {
        info!(pipeline = %spec.launch_description(), "tone decoder started");
        self.started_at = Instant::now();
        self.samples_sent = 0;
        Ok(())
    }

    fn poll_packet(&mut self, timeout: Duration) -> wavescope_core::error::Result<PacketStatus> {
        // Wall-clock pacing: only emit samples that are "due".
        let due = (self.started_at.elapsed().as_secs_f64() * TONE_RATE as f64) as u64;
        let pending = due.saturating_sub(self.samples_sent).min(TONE_PACKET_MAX);
        if pending == 0 {
            std::thread::sleep(timeout);
            return Ok(PacketStatus::Idle);
        }

        let payload: Vec<i16> = (0..pending)
            .map(|k| {
                let i = self.samples_sent + k;
                let phase = std::f32::consts::TAU * TONE_HZ * i as f32 / TONE_RATE as f32;
                (phase.sin() * 0.6 * 32_767.0) as i16
            })
            .collect();
        let pts_ns = self.samples_sent * 1_000_000_000 / TONE_RATE as u64;
        self.samples_sent += pending;

        Ok(PacketStatus::Packet(DecodedPacket {
            caps: StreamCaps {
                sample_format: SampleFormat::Int16,
                sample_rate: TONE_RATE,
                channels: 1,
            },
            payload: PacketPayload::Int16(payload),
            pts_ns: Some(pts_ns),
        }))
    }

    fn stop(&mut self) {}
}

fn controller_config(cli: &Cli) -> ControllerConfig {
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("wavescope"));

    let fft_size = cli.fft_size.unwrap_or(cli.block_size);
    ControllerConfig {
        analyzer: AnalyzerConfig {
            block_size: cli.block_size,
            sample_rate: cli.sample_rate,
            spectrum: SpectrumConfig {
                fft_size,
                hop_size: (fft_size / 2).max(1),
                sample_rate: cli.sample_rate,
                window: cli.window.into(),
                ..SpectrumConfig::default()
            },
            ..AnalyzerConfig::default()
        },
        physical: PhysicalInputConfig {
            sample_rate: cli.sample_rate,
            device_id: cli.device.clone(),
            ..PhysicalInputConfig::default()
        },
        network: NetworkInputConfig {
            // The demo tone rides the network path; the URL only picks the
            // source element of the composed pipeline.
            url: "file://demo-tone".into(),
            bus_timer_interval_ms: 20,
            auto_reconnect: false,
            ..NetworkInputConfig::default()
        },
        rotate_db_per_session: !cli.persistent,
        data_dir,
        ..ControllerConfig::default()
    }
}

fn print_devices() {
    let devices = list_input_devices();
    if devices.is_empty() {
        println!("no input devices found");
        return;
    }
    for device in devices {
        let marker = if device.is_default { "*" } else { " " };
        println!("{marker} {}", device.name);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        print_devices();
        return Ok(());
    }

    let controller = SessionController::new(controller_config(&cli));
    match cli.source {
        SourceArg::Capture => {
            controller
                .set_audio_source(SourceKind::Capture)
                .context("select capture source")?;
        }
        SourceArg::Demo => {
            controller
                .set_audio_source(SourceKind::Network)
                .context("select network source")?;
            controller.install_decoder_factory(|| Box::new(ToneDecoder::new()) as Box<dyn StreamDecoder>);
        }
    }

    let mut frames_rx = controller.subscribe_frames();
    let mut stats_rx = controller.subscribe_stats();
    let mut notice_rx = controller.subscribe_notices();

    let frames_task = tokio::spawn(async move {
        let mut batches: u64 = 0;
        while let Ok(batch) = frames_rx.recv().await {
            batches += 1;
            if batches % 50 == 0 {
                if let Some(frame) = batch.frames.last() {
                    let peak = frame
                        .waveform
                        .iter()
                        .fold(0f32, |acc, &s| acc.max(s.abs()));
                    println!(
                        "frames: block={} offset={} peak={:.3}",
                        frame.block_index, frame.sample_offset, peak
                    );
                }
            }
        }
    });

    let stats_task = tokio::spawn(async move {
        while let Ok(stats) = stats_rx.recv().await {
            println!(
                "stats: blocks={} samples={} buffered={}",
                stats.blocks_processed, stats.samples_processed, stats.accum_len
            );
        }
    });

    let notices_task = tokio::spawn(async move {
        while let Ok(notice) = notice_rx.recv().await {
            match notice {
                SessionNotice::FormatDetected { format } => {
                    println!(
                        "format: {} Hz, {} ch, {:?}",
                        format.sample_rate, format.channels, format.sample_format
                    );
                }
                SessionNotice::Error { message } => warn!(%message, "session error"),
                SessionNotice::Finished => println!("stream finished"),
            }
        }
    });

    controller.start_capture().context("start capture")?;
    info!(duration_secs = cli.duration_secs, "capturing");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.duration_secs)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted — stopping");
        }
    }

    controller.stop_capture().context("stop capture")?;

    let snapshot = controller.diagnostics_snapshot();
    println!(
        "session: chunks={} samples={} blocks={} input_errors={} store_errors={}",
        snapshot.chunks_in,
        snapshot.samples_in,
        snapshot.blocks_emitted,
        snapshot.input_errors,
        snapshot.store_errors
    );

    if cli.persistent {
        if let Some(path) = controller.database_path() {
            let mut store = BlockStore::new(&path, false);
            store.initialize().context("reopen store")?;
            println!(
                "store: {} blocks, {} bytes at {}",
                store.get_total_blocks().unwrap_or(0),
                store.get_total_audio_size().unwrap_or(0),
                path.display()
            );
            store.shutdown();
        }
    }

    frames_task.abort();
    stats_task.abort();
    notices_task.abort();
    Ok(())
}
