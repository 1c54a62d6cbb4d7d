//! End-to-end session over the network path with a scripted decoder:
//! capture → analysis → persistence, then the stored rows are checked
//! against the timestamp formula and the raw-byte round trip.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wavescope_core::analysis::AnalyzerConfig;
use wavescope_core::engine::{ControllerConfig, SessionController, SourceKind};
use wavescope_core::error::Result;
use wavescope_core::net::{
    DecodedPacket, NetworkInputConfig, PacketPayload, PacketStatus, PipelineSpec, StreamCaps,
    StreamDecoder,
};
use wavescope_core::store::BlockStore;
use wavescope_core::{Analyzer, FrameBatch, SampleFormat, SessionNotice};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

const RATE: u32 = 44_100;
const T0: u64 = 1_000_000_000;

fn expected_ts(sample_offset: u64) -> u64 {
    let rate = RATE as u128;
    T0 + ((sample_offset as u128 * 1_000_000_000 + rate / 2) / rate) as u64
}

/// Streams a fixed sample sequence as i16 packets with sample-accurate PTS,
/// then idles until stopped.
struct SampleStream {
    samples: Vec<i16>,
    packet_frames: usize,
    cursor: usize,
}

impl StreamDecoder for SampleStream {
    fn start(&mut self, _spec: &PipelineSpec) -> Result<()> {
        Ok(())
    }

    fn poll_packet(&mut self, timeout: Duration) -> Result<PacketStatus> {
        if self.cursor >= self.samples.len() {
            std::thread::sleep(timeout);
            return Ok(PacketStatus::Idle);
        }
        let end = (self.cursor + self.packet_frames).min(self.samples.len());
        let payload = self.samples[self.cursor..end].to_vec();
        let pts = {
            let rate = RATE as u128;
            T0 + ((self.cursor as u128 * 1_000_000_000 + rate / 2) / rate) as u64
        };
        self.cursor = end;
        Ok(PacketStatus::Packet(DecodedPacket {
            caps: StreamCaps {
                sample_format: SampleFormat::Int16,
                sample_rate: RATE,
                channels: 1,
            },
            payload: PacketPayload::Int16(payload),
            pts_ns: Some(pts),
        }))
    }

    fn stop(&mut self) {}
}

fn temp_dir() -> PathBuf {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    std::env::temp_dir().join(format!(
        "wavescope-roundtrip-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

fn controller_for(samples: Vec<i16>, data_dir: PathBuf) -> SessionController {
    let controller = SessionController::new(ControllerConfig {
        analyzer: AnalyzerConfig {
            spectrum_enabled: false,
            ..AnalyzerConfig::default()
        },
        network: NetworkInputConfig {
            url: "http://radio.example/live".into(),
            bus_timer_interval_ms: 5,
            auto_reconnect: false,
            ..NetworkInputConfig::default()
        },
        rotate_db_per_session: false,
        data_dir,
        ..ControllerConfig::default()
    });
    controller.set_audio_source(SourceKind::Network).unwrap();
    let shared = Arc::new(Mutex::new(Some(samples)));
    controller.install_decoder_factory(move || {
        let samples = shared
            .lock()
            .unwrap()
            .take()
            .expect("single connection per test");
        Box::new(SampleStream {
            samples,
            packet_frames: 4_410,
            cursor: 0,
        }) as Box<dyn StreamDecoder>
    });
    controller
}

fn drain_frames(rx: &mut broadcast::Receiver<FrameBatch>) -> Vec<wavescope_core::FrameData> {
    let mut frames = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(batch) => frames.extend(batch.frames),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    frames
}

fn wait_for_frames(
    rx: &mut broadcast::Receiver<FrameBatch>,
    at_least: usize,
    timeout: Duration,
) -> Vec<wavescope_core::FrameData> {
    let deadline = Instant::now() + timeout;
    let mut frames = Vec::new();
    while frames.len() < at_least && Instant::now() < deadline {
        frames.extend(drain_frames(rx));
        std::thread::sleep(Duration::from_millis(10));
    }
    frames
}

#[test]
fn silent_second_session_persists_44_blocks_with_exact_timestamps() {
    let dir = temp_dir();
    let controller = controller_for(vec![0i16; RATE as usize], dir.clone());
    let mut frames_rx = controller.subscribe_frames();
    let mut notice_rx = controller.subscribe_notices();

    controller.start_capture().unwrap();

    // 44100 samples at blockSize 1024 → 43 complete frames while running.
    let mut frames = wait_for_frames(&mut frames_rx, 43, Duration::from_secs(10));
    assert_eq!(frames.len(), 43);

    controller.stop_capture().unwrap();
    frames.extend(drain_frames(&mut frames_rx));
    assert_eq!(frames.len(), 44, "residual flushed at stop");

    // Format was announced exactly once.
    let mut format_notices = 0;
    loop {
        match notice_rx.try_recv() {
            Ok(SessionNotice::FormatDetected { format }) => {
                format_notices += 1;
                assert_eq!(format.sample_rate, RATE);
                assert_eq!(format.channels, 1);
            }
            Ok(_) => {}
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(format_notices, 1);

    // Ordering invariants + the timestamp formula against the first PTS.
    for (k, frame) in frames.iter().enumerate() {
        assert_eq!(frame.block_index, k as u64);
        assert_eq!(frame.sample_offset, (k * 1024) as u64);
        assert_eq!(frame.timestamp_ns, expected_ts(frame.sample_offset));
    }
    assert_eq!(frames[0].timestamp_ns, T0);
    assert_eq!(frames[43].timestamp_ns, expected_ts(43 * 1024));

    // Stored rows agree with the emitted frames.
    let db_path = controller.database_path().expect("session path");
    let mut store = BlockStore::new(&db_path, false);
    store.initialize().unwrap();

    assert_eq!(store.get_total_blocks().unwrap(), 44);
    assert_eq!(store.get_total_audio_size().unwrap(), (RATE as u64) * 4);

    let blocks = store.get_all_blocks().unwrap();
    let indices: Vec<u64> = blocks.iter().map(|b| b.block_index).collect();
    let mut deduped = indices.clone();
    deduped.dedup();
    assert_eq!(indices, deduped, "no duplicate block indices");

    for block in &blocks[..43] {
        assert_eq!(block.data_size, 1024 * 4);
    }
    let residual = store.get_block(43).unwrap().expect("residual row");
    assert_eq!(residual.len(), (RATE as usize - 43 * 1024) * 4); // 908 samples

    // A silent capture has all-zero peaks.
    let peaks = store.get_all_peaks().unwrap();
    assert_eq!(peaks.len(), 44);
    for peak in &peaks {
        assert_eq!(peak.min_value, 0.0);
        assert_eq!(peak.max_value, 0.0);
        assert_eq!(peak.timestamp_ns, expected_ts(peak.sample_offset));
    }

    // Time-range retrieval honors timestamps: first ~0.5 s of peaks.
    let half = store
        .get_peaks_by_time(T0, T0 + 500_000_000)
        .unwrap();
    assert!(!half.is_empty() && half.len() < 44);
    for pair in half.windows(2) {
        assert!(pair[0].timestamp_ns <= pair[1].timestamp_ns);
    }

    store.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stored_bytes_decode_back_to_the_analyzed_samples() {
    let dir = temp_dir();
    let db_path = dir.join("roundtrip.db");

    let samples: Vec<f32> = (0..2048)
        .map(|i| (std::f32::consts::TAU * 997.0 * i as f32 / RATE as f32).sin())
        .collect();

    let mut analyzer = Analyzer::new(
        AnalyzerConfig {
            spectrum_enabled: false,
            ..AnalyzerConfig::default()
        },
        Some(BlockStore::new(&db_path, false)),
        false,
    );
    analyzer.initialize_store().unwrap();
    let frames = analyzer.process_chunk(&samples, T0).unwrap();
    assert_eq!(frames.len(), 2);

    let store = analyzer.store().expect("store attached");
    for (k, chunk) in samples.chunks(1024).enumerate() {
        let bytes = store.get_block(k as u64).unwrap().expect("block present");
        assert_eq!(bytes.len(), 1024 * 4);
        let decoded: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(decoded, chunk);
    }

    // Peak rows carry the true extrema of each block.
    let peaks = store.get_all_peaks().unwrap();
    assert_eq!(peaks.len(), 2);
    for (k, peak) in peaks.iter().enumerate() {
        let block = &samples[k * 1024..(k + 1) * 1024];
        let min = block.iter().cloned().fold(f32::MAX, f32::min);
        let max = block.iter().cloned().fold(f32::MIN, f32::max);
        assert_eq!(peak.min_value, min);
        assert_eq!(peak.max_value, max);
    }

    analyzer.shutdown_store();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn back_to_back_identical_chunks_advance_without_duplicates() {
    let dir = temp_dir();
    let db_path = dir.join("duplicates.db");

    let chunk = vec![0.25f32; 1024];
    let mut analyzer = Analyzer::new(
        AnalyzerConfig {
            spectrum_enabled: false,
            ..AnalyzerConfig::default()
        },
        Some(BlockStore::new(&db_path, false)),
        false,
    );
    analyzer.initialize_store().unwrap();

    analyzer.process_chunk(&chunk, T0).unwrap();
    analyzer.process_chunk(&chunk, T0 + 1).unwrap();

    let store = analyzer.store().unwrap();
    let blocks = store.get_all_blocks().unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].block_index, 0);
    assert_eq!(blocks[1].block_index, 1);
    assert_eq!(blocks[1].sample_offset, 1024);

    analyzer.shutdown_store();
    let _ = std::fs::remove_dir_all(&dir);
}
