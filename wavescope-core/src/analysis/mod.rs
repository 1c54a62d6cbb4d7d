//! Block accumulation and per-block analysis.
//!
//! The [`Analyzer`] accepts arbitrarily sized sample chunks, slices them
//! into fixed blocks, and produces one [`FrameData`] per block: a peak
//! summary, a render-friendly waveform downsample and (optionally) the
//! magnitude spectrum. Blocks and their peak records are appended to the
//! session [`BlockStore`] as they are produced.
//!
//! ## Timestamping
//!
//! The first chunk's timestamp becomes `session_start_ns`. Every block
//! timestamp after that is *derived*:
//!
//! ```text
//! block_ts = session_start_ns + round(sample_offset · 1e9 / sample_rate)
//! ```
//!
//! System time is never consulted again inside a session, which keeps
//! intra-session timestamps strictly monotonic and sample-accurate no
//! matter how the input was chunked.

pub mod spectrum;
pub mod window;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, WavescopeError};
use crate::events::{FrameData, StatsUpdate};
use crate::store::BlockStore;
use spectrum::{SpectrumAnalyzer, SpectrumConfig};

/// Stats tick cadence, in completed blocks.
const STATS_INTERVAL: u64 = 100;

/// Nanoseconds covered by `sample_offset` samples at `sample_rate`,
/// rounded to nearest.
pub(crate) fn samples_to_ns(sample_offset: u64, sample_rate: u32) -> u64 {
    let rate = sample_rate as u128;
    ((sample_offset as u128 * 1_000_000_000 + rate / 2) / rate) as u64
}

/// Analyzer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzerConfig {
    /// Samples per analysis block.
    pub block_size: usize,
    /// Session sample rate in Hz (drives the timestamp formula).
    pub sample_rate: u32,
    /// Points in the waveform downsample handed to renderers.
    pub waveform_points: usize,
    /// Track block min/max and write peak records.
    pub peaks_enabled: bool,
    /// Run the FFT stage and fill `FrameData::spectrum`.
    pub spectrum_enabled: bool,
    pub spectrum: SpectrumConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            sample_rate: 44_100,
            waveform_points: 512,
            peaks_enabled: true,
            spectrum_enabled: true,
            spectrum: SpectrumConfig::default(),
        }
    }
}

/// Block accumulator + per-block summarizer. Thread-affine: owned and
/// driven exclusively by the analyzer thread.
pub struct Analyzer {
    config: AnalyzerConfig,
    spectrum: SpectrumAnalyzer,
    store: Option<BlockStore>,
    /// Continue `block_index` from the store's max+1 (persistent mode).
    continue_block_index: bool,
    accum: Vec<f32>,
    session_start_ns: Option<u64>,
    total_samples: u64,
    block_index: u64,
    stats_due: bool,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig, store: Option<BlockStore>, continue_block_index: bool) -> Self {
        Self {
            spectrum: SpectrumAnalyzer::new(config.spectrum),
            config,
            store,
            continue_block_index,
            accum: Vec::new(),
            session_start_ns: None,
            total_samples: 0,
            block_index: 0,
            stats_due: false,
        }
    }

    /// Open the store and, in persistent mode, pick up the block counter
    /// where the store left off. Must run on the thread that owns this
    /// analyzer, before the first chunk.
    pub fn initialize_store(&mut self) -> Result<u64> {
        if let Some(store) = self.store.as_mut() {
            store.initialize()?;
            if self.continue_block_index {
                self.block_index = store.next_block_index()?;
            }
        }
        Ok(self.block_index)
    }

    /// Close the store connection; deletes the database file when this
    /// session owns it. Must run on the owning thread.
    pub fn shutdown_store(&mut self) {
        if let Some(store) = self.store.as_mut() {
            store.shutdown();
        }
    }

    pub fn store(&self) -> Option<&BlockStore> {
        self.store.as_ref()
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Samples currently buffered below one block.
    pub fn accum_len(&self) -> usize {
        self.accum.len()
    }

    /// Feed one chunk. Returns the frames for every block completed by it.
    ///
    /// # Errors
    /// - `WavescopeError::Config` when block size or sample rate is zero.
    /// - `WavescopeError::Input` when `samples` is empty.
    /// - Store failures other than duplicate indices (those are logged and
    ///   the write skipped).
    pub fn process_chunk(&mut self, samples: &[f32], timestamp_ns: u64) -> Result<Vec<FrameData>> {
        if self.config.block_size == 0 {
            return Err(WavescopeError::Config("block size must be positive".into()));
        }
        if self.config.sample_rate == 0 {
            return Err(WavescopeError::Config("sample rate must be positive".into()));
        }
        if samples.is_empty() {
            return Err(WavescopeError::Input("empty sample chunk".into()));
        }

        let session_start = *self.session_start_ns.get_or_insert(timestamp_ns);
        self.accum.extend_from_slice(samples);

        let mut batch = Vec::new();
        while self.accum.len() >= self.config.block_size {
            let block: Vec<f32> = self.accum.drain(..self.config.block_size).collect();
            let ts = session_start + samples_to_ns(self.total_samples, self.config.sample_rate);
            let frame = self.process_block(&block, ts)?;
            self.persist(&block, &frame)?;
            self.total_samples += block.len() as u64;
            self.block_index += 1;
            if self.block_index % STATS_INTERVAL == 0 {
                self.stats_due = true;
            }
            batch.push(frame);
        }
        Ok(batch)
    }

    /// Process whatever remains in the accumulator as one final (possibly
    /// shorter) block. Idempotent on an empty accumulator.
    pub fn flush_residual(&mut self) -> Result<Option<FrameData>> {
        self.stats_due = true;
        if self.accum.is_empty() {
            return Ok(None);
        }
        if self.config.sample_rate == 0 {
            return Err(WavescopeError::Config("sample rate must be positive".into()));
        }
        // Non-empty accumulator implies the session has started.
        let Some(session_start) = self.session_start_ns else {
            return Ok(None);
        };

        let block = std::mem::take(&mut self.accum);
        let ts = session_start + samples_to_ns(self.total_samples, self.config.sample_rate);
        let frame = self.process_block(&block, ts)?;
        self.persist(&block, &frame)?;
        self.total_samples += block.len() as u64;
        self.block_index += 1;
        Ok(Some(frame))
    }

    /// Erase session identity: accumulator, counters, session start. The
    /// spectrum stage is rebuilt from the current configuration.
    pub fn reset(&mut self) {
        self.accum.clear();
        self.session_start_ns = None;
        self.total_samples = 0;
        self.block_index = 0;
        self.stats_due = false;
        self.spectrum = SpectrumAnalyzer::new(self.config.spectrum);
    }

    /// Atomically swap configuration; spectrum caches are invalidated when
    /// any spectrum-relevant field changed.
    pub fn set_config(&mut self, config: AnalyzerConfig) {
        let spectrum_changed = config.spectrum != self.config.spectrum;
        self.config = config;
        if spectrum_changed {
            self.spectrum.set_config(self.config.spectrum);
        }
    }

    /// Pending stats tick, if one is due. Cleared on read.
    pub fn take_stats(&mut self) -> Option<StatsUpdate> {
        if !self.stats_due {
            return None;
        }
        self.stats_due = false;
        Some(StatsUpdate {
            blocks_processed: self.block_index,
            samples_processed: self.total_samples,
            accum_len: self.accum.len(),
        })
    }

    fn process_block(&mut self, block: &[f32], timestamp_ns: u64) -> Result<FrameData> {
        let n = block.len();
        let waveform = if self.config.peaks_enabled {
            let w = self.config.waveform_points.max(1);
            (0..w).map(|i| block[(i * n / w).min(n - 1)]).collect()
        } else {
            vec![block[0]]
        };

        let (magnitudes, frequencies, window_gain) = if self.config.spectrum_enabled {
            let frame = self.spectrum.process(block, timestamp_ns, self.total_samples)?;
            (frame.magnitudes, frame.frequencies, frame.window_gain)
        } else {
            (Vec::new(), Vec::new(), 1.0)
        };

        Ok(FrameData {
            block_index: self.block_index,
            sample_offset: self.total_samples,
            timestamp_ns,
            waveform,
            spectrum: magnitudes,
            frequencies,
            window_gain,
        })
    }

    fn persist(&mut self, block: &[f32], frame: &FrameData) -> Result<()> {
        let peaks_enabled = self.config.peaks_enabled;
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };

        let bytes = raw_bytes(block);
        match store.insert_block(frame.block_index, frame.sample_offset, &bytes, frame.timestamp_ns)
        {
            Ok(()) => {}
            Err(WavescopeError::DuplicateBlock(idx)) => {
                // Counter desync — should not happen in a correct session.
                warn!(block_index = idx, "duplicate block index, skipping store write");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if peaks_enabled && frame.waveform.len() >= 2 {
            let (min_value, max_value) = extrema(block);
            match store.insert_peak(
                frame.block_index,
                frame.sample_offset,
                min_value,
                max_value,
                frame.timestamp_ns,
            ) {
                Ok(()) => {}
                Err(WavescopeError::DuplicateBlock(idx)) => {
                    warn!(block_index = idx, "duplicate peak index, skipping store write");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Little-endian f32 encoding of a block.
fn raw_bytes(block: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.len() * 4);
    for s in block {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Signed extrema over the entire block.
fn extrema(block: &[f32]) -> (f32, f32) {
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for &s in block {
        if s < min {
            min = s;
        }
        if s > max {
            max = s;
        }
    }
    (min, max)
}
