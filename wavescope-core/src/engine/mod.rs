//! `SessionController` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! SessionController::new()
//!     └─► start_capture()   → store opened on analyzer thread (blocking),
//!                             source thread spawned, open acknowledged,
//!                             state = Capturing
//!         └─► stop_capture() → source stopped and joined, analyzer drains,
//!                              flushes residual, closes store (blocking),
//!                              state = Idle
//! ```
//!
//! `start_capture`/`stop_capture` return a `State` error rather than
//! panicking when called in the wrong state. Teardown order is load-bearing:
//! the source must stop producing before the analyzer flushes, and the
//! flush must finish before the store closes.
//!
//! ## Threading
//!
//! The controller owns no hot-path data. Each session spawns one source
//! thread (sole producer of chunks) and one analyzer thread (sole owner of
//! Analyzer + BlockStore). Chunks travel over a bounded crossbeam queue —
//! a slow analyzer blocks the source worker, never the RT callback.

pub mod pipeline;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    analysis::{Analyzer, AnalyzerConfig},
    audio::{self, PhysicalInputConfig},
    clock,
    error::{Result, WavescopeError},
    events::{FrameBatch, SessionNotice, StatsUpdate},
    net::{self, DecoderFactory, NetworkInputConfig},
    store::BlockStore,
};

use pipeline::{AnalyzerCmd, PipelineContext, PipelineDiagnostics};

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Which source the next session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Local device via cpal.
    Capture,
    /// Networked encoded stream via the external decoder.
    Network,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub analyzer: AnalyzerConfig,
    pub physical: PhysicalInputConfig,
    pub network: NetworkInputConfig,
    /// Fresh randomly-named store per session (deleted on teardown), or a
    /// single persistent store that accumulates across sessions.
    pub rotate_db_per_session: bool,
    /// Application data directory. Session stores live under
    /// `<data_dir>/tmp/<id>.db`, the persistent one at
    /// `<data_dir>/audio_capture.db`.
    pub data_dir: PathBuf,
    /// Bounded chunk queue depth between source and analyzer.
    pub chunk_queue_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            analyzer: AnalyzerConfig::default(),
            physical: PhysicalInputConfig::default(),
            network: NetworkInputConfig::default(),
            rotate_db_per_session: true,
            data_dir: std::env::temp_dir().join("wavescope"),
            chunk_queue_depth: 256,
        }
    }
}

struct SessionHandles {
    running: Arc<AtomicBool>,
    source_join: JoinHandle<()>,
    analyzer_join: JoinHandle<()>,
    cmd_tx: crossbeam_channel::Sender<AnalyzerCmd>,
}

enum SessionState {
    Idle,
    Capturing(SessionHandles),
}

/// The top-level controller handle.
///
/// `SessionController` is `Send + Sync` — all fields use interior
/// mutability. Wrap in `Arc` to share with event-forwarding tasks.
pub struct SessionController {
    config: Mutex<ControllerConfig>,
    source_kind: Mutex<SourceKind>,
    state: Mutex<SessionState>,
    frames_tx: broadcast::Sender<FrameBatch>,
    stats_tx: broadcast::Sender<StatsUpdate>,
    notice_tx: broadcast::Sender<SessionNotice>,
    /// Frame batch sequence counter, reset per session.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<PipelineDiagnostics>,
    decoder_factory: Mutex<Option<Arc<Mutex<Box<dyn DecoderFactory>>>>>,
    last_db_path: Mutex<Option<PathBuf>>,
}

impl SessionController {
    pub fn new(config: ControllerConfig) -> Self {
        let (frames_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (stats_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (notice_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config: Mutex::new(config),
            source_kind: Mutex::new(SourceKind::Capture),
            state: Mutex::new(SessionState::Idle),
            frames_tx,
            stats_tx,
            notice_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
            decoder_factory: Mutex::new(None),
            last_db_path: Mutex::new(None),
        }
    }

    /// Install the external decoder factory the network source will use.
    pub fn install_decoder_factory(&self, factory: impl DecoderFactory + 'static) {
        *self.decoder_factory.lock() = Some(Arc::new(Mutex::new(Box::new(factory))));
    }

    /// Select the source for the next session. An active capture is
    /// stopped first.
    pub fn set_audio_source(&self, kind: SourceKind) -> Result<()> {
        if self.is_capturing() {
            self.stop_capture()?;
        }
        *self.source_kind.lock() = kind;
        Ok(())
    }

    pub fn source_kind(&self) -> SourceKind {
        *self.source_kind.lock()
    }

    /// Validate and stage the local capture configuration for the next
    /// session. Rejected with a `State` error while capturing.
    pub fn set_physical_config(&self, config: PhysicalInputConfig) -> Result<()> {
        if self.is_capturing() {
            return Err(WavescopeError::State(
                "cannot change capture configuration while capturing".into(),
            ));
        }
        config.validate()?;
        self.config.lock().physical = config;
        Ok(())
    }

    /// Validate (clamping out-of-range numerics) and stage the network
    /// configuration. Rejected with a `State` error while capturing.
    pub fn set_network_config(&self, config: NetworkInputConfig) -> Result<()> {
        if self.is_capturing() {
            return Err(WavescopeError::State(
                "cannot change network configuration while capturing".into(),
            ));
        }
        let (normalized, adjusted) = config.normalized()?;
        if adjusted {
            debug!("network configuration adjusted during normalization");
        }
        self.config.lock().network = normalized;
        Ok(())
    }

    /// Stage a new analyzer configuration. Applied live to a running
    /// session via the analyzer command channel.
    pub fn set_analyzer_config(&self, config: AnalyzerConfig) -> Result<()> {
        self.config.lock().analyzer = config;
        let state = self.state.lock();
        if let SessionState::Capturing(handles) = &*state {
            let (ack_tx, ack_rx) = std::sync::mpsc::channel();
            handles
                .cmd_tx
                .send(AnalyzerCmd::Reconfigure { config, ack: ack_tx })
                .map_err(|_| WavescopeError::State("analyzer thread is gone".into()))?;
            ack_rx
                .recv()
                .map_err(|_| WavescopeError::State("analyzer thread is gone".into()))?;
        }
        Ok(())
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameBatch> {
        self.frames_tx.subscribe()
    }

    pub fn subscribe_stats(&self) -> broadcast::Receiver<StatsUpdate> {
        self.stats_tx.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notice_tx.subscribe()
    }

    pub fn is_capturing(&self) -> bool {
        matches!(*self.state.lock(), SessionState::Capturing(_))
    }

    /// Path of the current (or most recent) session database.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.last_db_path.lock().clone()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Start a session: rotate/open the store on the analyzer thread,
    /// spawn the source worker, wire chunks to the analyzer.
    ///
    /// Blocks until the store is open and the source acknowledged its
    /// start (device negotiated, or network pipeline composed), then
    /// returns while the session runs in the background.
    pub fn start_capture(&self) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(*state, SessionState::Capturing(_)) {
            return Err(WavescopeError::State("capture already running".into()));
        }

        let config = self.config.lock().clone();
        let kind = *self.source_kind.lock();

        self.diagnostics.reset();
        self.seq.store(0, Ordering::SeqCst);

        // ── Store path: rotated per session, or persistent ────────────────
        let (db_path, owns_file) = if config.rotate_db_per_session {
            let name = format!(
                "{:016x}-{:08x}.db",
                clock::now_ns(),
                rand::random::<u32>()
            );
            (config.data_dir.join("tmp").join(name), true)
        } else {
            (config.data_dir.join("audio_capture.db"), false)
        };

        let store = BlockStore::new(&db_path, owns_file);
        let analyzer = Analyzer::new(config.analyzer, Some(store), !owns_file);

        // ── Analyzer thread: owns Analyzer + Store ────────────────────────
        let (chunk_tx, chunk_rx) = crossbeam_channel::bounded(config.chunk_queue_depth.max(1));
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (init_tx, init_rx) = std::sync::mpsc::channel();

        let ctx = PipelineContext {
            analyzer,
            chunk_rx,
            cmd_rx,
            frames_tx: self.frames_tx.clone(),
            stats_tx: self.stats_tx.clone(),
            notice_tx: self.notice_tx.clone(),
            seq: Arc::clone(&self.seq),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        let analyzer_join = std::thread::Builder::new()
            .name("wavescope-analyzer".into())
            .spawn(move || pipeline::run(ctx, init_tx))?;

        // Block until the store is open on its owning thread.
        match init_rx.recv() {
            Ok(Ok(start_index)) => {
                debug!(start_index, path = %db_path.display(), "session store initialized");
            }
            Ok(Err(e)) => {
                let _ = analyzer_join.join();
                return Err(e);
            }
            Err(_) => {
                let _ = analyzer_join.join();
                return Err(WavescopeError::Other(anyhow::anyhow!(
                    "analyzer thread died during startup"
                )));
            }
        }

        // ── Source thread: sole producer of chunks ────────────────────────
        let running = Arc::new(AtomicBool::new(true));
        let notice_tx = self.notice_tx.clone();

        let spawn_result: Result<JoinHandle<()>> = match kind {
            SourceKind::Capture => {
                let physical = config.physical.clone();
                let worker_running = Arc::clone(&running);
                let (open_tx, open_rx) = std::sync::mpsc::channel();
                let join = std::thread::Builder::new()
                    .name("wavescope-capture".into())
                    .spawn(move || {
                        audio::run_capture_worker(
                            physical,
                            chunk_tx,
                            notice_tx,
                            worker_running,
                            open_tx,
                        )
                    })?;
                match open_rx.recv() {
                    Ok(Ok(format)) => {
                        info!(?format, "capture source started");
                        Ok(join)
                    }
                    Ok(Err(e)) => {
                        let _ = join.join();
                        Err(e)
                    }
                    Err(_) => {
                        let _ = join.join();
                        Err(WavescopeError::Other(anyhow::anyhow!(
                            "capture thread died during startup"
                        )))
                    }
                }
            }
            SourceKind::Network => {
                let factory = self
                    .decoder_factory
                    .lock()
                    .clone()
                    .ok_or_else(|| {
                        WavescopeError::State(
                            "no decoder factory installed for the network source".into(),
                        )
                    })?;
                let network = config.network.clone();
                let worker_running = Arc::clone(&running);
                let (open_tx, open_rx) = std::sync::mpsc::channel();
                let join = std::thread::Builder::new()
                    .name("wavescope-network".into())
                    .spawn(move || {
                        net::source::run_network_worker(
                            network,
                            factory,
                            chunk_tx,
                            notice_tx,
                            worker_running,
                            open_tx,
                        )
                    })?;
                match open_rx.recv() {
                    Ok(Ok(())) => {
                        info!("network source started");
                        Ok(join)
                    }
                    Ok(Err(e)) => {
                        let _ = join.join();
                        Err(e)
                    }
                    Err(_) => {
                        let _ = join.join();
                        Err(WavescopeError::Other(anyhow::anyhow!(
                            "network thread died during startup"
                        )))
                    }
                }
            }
        };

        let source_join = match spawn_result {
            Ok(join) => join,
            Err(e) => {
                // Source never came up: unwind the analyzer thread too.
                shutdown_analyzer(&cmd_tx, analyzer_join);
                return Err(e);
            }
        };

        *self.last_db_path.lock() = Some(db_path);
        *state = SessionState::Capturing(SessionHandles {
            running,
            source_join,
            analyzer_join,
            cmd_tx,
        });
        info!(?kind, "capture started");
        Ok(())
    }

    /// Stop the session. Synchronous: does not return until the source has
    /// stopped producing, the residual block is flushed, and the store is
    /// closed.
    pub fn stop_capture(&self) -> Result<()> {
        let mut state = self.state.lock();
        let handles = match std::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::Capturing(handles) => handles,
            SessionState::Idle => {
                return Err(WavescopeError::State("no capture in progress".into()))
            }
        };
        drop(state);

        // 1. Source ceases producing; its chunk sender drops with it.
        handles.running.store(false, Ordering::SeqCst);
        if handles.source_join.join().is_err() {
            warn!("source thread panicked during stop");
        }

        // 2. Analyzer drains queued chunks, flushes the residual, closes
        //    the store, then acknowledges.
        shutdown_analyzer(&handles.cmd_tx, handles.analyzer_join);

        info!("capture stopped");
        Ok(())
    }

    /// Force the residual block out without ending the session.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        let SessionState::Capturing(handles) = &*state else {
            return Err(WavescopeError::State("no capture in progress".into()));
        };
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        handles
            .cmd_tx
            .send(AnalyzerCmd::Flush { ack: ack_tx })
            .map_err(|_| WavescopeError::State("analyzer thread is gone".into()))?;
        ack_rx
            .recv()
            .map_err(|_| WavescopeError::State("analyzer thread is gone".into()))?
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.is_capturing() {
            let _ = self.stop_capture();
        }
    }
}

/// Blocking analyzer teardown: Shutdown command, ack, join.
fn shutdown_analyzer(cmd_tx: &crossbeam_channel::Sender<AnalyzerCmd>, join: JoinHandle<()>) {
    let (ack_tx, ack_rx) = std::sync::mpsc::channel();
    if cmd_tx.send(AnalyzerCmd::Shutdown { ack: ack_tx }).is_ok() {
        let _ = ack_rx.recv();
    }
    if join.join().is_err() {
        warn!("analyzer thread panicked during shutdown");
    }
}
