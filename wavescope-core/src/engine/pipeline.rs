//! Analyzer-thread loop.
//!
//! ## Per-iteration stages
//!
//! ```text
//! 1. select! over the chunk queue and the command queue
//! 2. Chunk  → Analyzer.process_chunk → FrameBatch broadcast (+ stats tick)
//! 3. Flush  → drain pending chunks, flush residual, reply
//! 4. Shutdown → drain, flush residual, Store.shutdown, reply, exit
//! ```
//!
//! The loop is the *only* code that touches the `Analyzer` and its
//! `BlockStore`; lifecycle calls from the controller are synchronous
//! request/reply over the command channel. Flush always completes before
//! store shutdown — the "no gaps in sample_offset" invariant depends on
//! that ordering.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use crossbeam_channel::{select, Receiver};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    analysis::{Analyzer, AnalyzerConfig},
    buffering::chunk::FloatChunk,
    error::{Result, WavescopeError},
    events::{FrameBatch, SessionNotice, StatsUpdate},
};

/// Counters shared with the controller for observability.
#[derive(Default)]
pub struct PipelineDiagnostics {
    pub chunks_in: AtomicUsize,
    pub samples_in: AtomicUsize,
    pub blocks_emitted: AtomicUsize,
    pub batches_emitted: AtomicUsize,
    pub input_errors: AtomicUsize,
    pub store_errors: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.chunks_in.store(0, Ordering::Relaxed);
        self.samples_in.store(0, Ordering::Relaxed);
        self.blocks_emitted.store(0, Ordering::Relaxed);
        self.batches_emitted.store(0, Ordering::Relaxed);
        self.input_errors.store(0, Ordering::Relaxed);
        self.store_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            samples_in: self.samples_in.load(Ordering::Relaxed),
            blocks_emitted: self.blocks_emitted.load(Ordering::Relaxed),
            batches_emitted: self.batches_emitted.load(Ordering::Relaxed),
            input_errors: self.input_errors.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub chunks_in: usize,
    pub samples_in: usize,
    pub blocks_emitted: usize,
    pub batches_emitted: usize,
    pub input_errors: usize,
    pub store_errors: usize,
}

/// Synchronous lifecycle commands from the controller. Every command that
/// changes durable state carries a reply channel the controller blocks on.
pub enum AnalyzerCmd {
    /// Drain pending chunks, then flush the residual block.
    Flush {
        ack: std::sync::mpsc::Sender<Result<()>>,
    },
    /// Swap the analyzer configuration.
    Reconfigure {
        config: AnalyzerConfig,
        ack: std::sync::mpsc::Sender<()>,
    },
    /// Drain, flush, close the store, then exit the loop.
    Shutdown {
        ack: std::sync::mpsc::Sender<()>,
    },
}

/// All context the analyzer thread needs, passed as one struct so the
/// spawn closure stays tidy.
pub struct PipelineContext {
    pub analyzer: Analyzer,
    pub chunk_rx: Receiver<FloatChunk>,
    pub cmd_rx: Receiver<AnalyzerCmd>,
    pub frames_tx: broadcast::Sender<FrameBatch>,
    pub stats_tx: broadcast::Sender<StatsUpdate>,
    pub notice_tx: broadcast::Sender<SessionNotice>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Run the analyzer loop until a `Shutdown` command (or controller hangup).
///
/// The store is opened here, on the owning thread; `init_tx` carries the
/// result (and the session's starting block index) back to `start_capture`.
pub fn run(mut ctx: PipelineContext, init_tx: std::sync::mpsc::Sender<Result<u64>>) {
    match ctx.analyzer.initialize_store() {
        Ok(start_index) => {
            let _ = init_tx.send(Ok(start_index));
        }
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    }

    info!("analyzer pipeline started");

    loop {
        select! {
            recv(ctx.chunk_rx) -> msg => match msg {
                Ok(chunk) => handle_chunk(&mut ctx, chunk),
                Err(_) => {
                    // All chunk senders dropped; commands are the only
                    // remaining work.
                    ctx.chunk_rx = crossbeam_channel::never();
                }
            },
            recv(ctx.cmd_rx) -> msg => match msg {
                Ok(cmd) => {
                    if handle_cmd(&mut ctx, cmd) {
                        break;
                    }
                }
                Err(_) => {
                    // Controller gone without a Shutdown — close out anyway.
                    warn!("command channel closed without shutdown");
                    drain_pending(&mut ctx);
                    let _ = flush_residual(&mut ctx);
                    ctx.analyzer.reset();
                    ctx.analyzer.shutdown_store();
                    break;
                }
            },
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        chunks_in = snap.chunks_in,
        samples_in = snap.samples_in,
        blocks_emitted = snap.blocks_emitted,
        batches_emitted = snap.batches_emitted,
        input_errors = snap.input_errors,
        store_errors = snap.store_errors,
        "analyzer pipeline stopped — diagnostics"
    );
}

/// Returns `true` when the loop must exit.
fn handle_cmd(ctx: &mut PipelineContext, cmd: AnalyzerCmd) -> bool {
    match cmd {
        AnalyzerCmd::Flush { ack } => {
            drain_pending(ctx);
            let result = flush_residual(ctx);
            let _ = ack.send(result);
            false
        }
        AnalyzerCmd::Reconfigure { config, ack } => {
            ctx.analyzer.set_config(config);
            let _ = ack.send(());
            false
        }
        AnalyzerCmd::Shutdown { ack } => {
            drain_pending(ctx);
            if let Err(e) = flush_residual(ctx) {
                // The residual is lost but teardown must still complete.
                error!(error = %e, "residual flush failed during shutdown");
            }
            ctx.analyzer.reset();
            ctx.analyzer.shutdown_store();
            let _ = ack.send(());
            true
        }
    }
}

/// Process every chunk already queued, preserving arrival order.
fn drain_pending(ctx: &mut PipelineContext) {
    while let Ok(chunk) = ctx.chunk_rx.try_recv() {
        handle_chunk(ctx, chunk);
    }
}

fn handle_chunk(ctx: &mut PipelineContext, chunk: FloatChunk) {
    ctx.diagnostics.chunks_in.fetch_add(1, Ordering::Relaxed);
    ctx.diagnostics
        .samples_in
        .fetch_add(chunk.len(), Ordering::Relaxed);

    match ctx.analyzer.process_chunk(&chunk.samples, chunk.timestamp_ns) {
        Ok(frames) if !frames.is_empty() => emit_batch(ctx, frames),
        Ok(_) => {}
        Err(WavescopeError::Input(message)) => {
            ctx.diagnostics.input_errors.fetch_add(1, Ordering::Relaxed);
            warn!(%message, "chunk dropped");
        }
        Err(e) => {
            ctx.diagnostics.store_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "chunk processing failed");
            let _ = ctx.notice_tx.send(SessionNotice::Error {
                message: e.to_string(),
            });
        }
    }

    if let Some(stats) = ctx.analyzer.take_stats() {
        let _ = ctx.stats_tx.send(stats);
    }
}

fn flush_residual(ctx: &mut PipelineContext) -> Result<()> {
    let outcome = match ctx.analyzer.flush_residual() {
        Ok(Some(frame)) => {
            emit_batch(ctx, vec![frame]);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => {
            let _ = ctx.notice_tx.send(SessionNotice::Error {
                message: e.to_string(),
            });
            Err(e)
        }
    };
    if let Some(stats) = ctx.analyzer.take_stats() {
        let _ = ctx.stats_tx.send(stats);
    }
    outcome
}

fn emit_batch(ctx: &mut PipelineContext, frames: Vec<crate::events::FrameData>) {
    ctx.diagnostics
        .blocks_emitted
        .fetch_add(frames.len(), Ordering::Relaxed);
    ctx.diagnostics
        .batches_emitted
        .fetch_add(1, Ordering::Relaxed);
    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    let _ = ctx.frames_tx.send(FrameBatch { seq, frames });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlockStore;
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::error::TryRecvError;

    fn recv_batch_with_timeout(
        rx: &mut broadcast::Receiver<FrameBatch>,
        timeout: Duration,
    ) -> FrameBatch {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(batch) => return batch,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for frame batch");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("frames channel closed unexpectedly"),
            }
        }
    }

    struct Session {
        chunk_tx: crossbeam_channel::Sender<FloatChunk>,
        cmd_tx: crossbeam_channel::Sender<AnalyzerCmd>,
        frames_rx: broadcast::Receiver<FrameBatch>,
        stats_rx: broadcast::Receiver<StatsUpdate>,
        diagnostics: Arc<PipelineDiagnostics>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn_session(analyzer: Analyzer) -> Session {
        let (chunk_tx, chunk_rx) = crossbeam_channel::bounded(64);
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (frames_tx, frames_rx) = broadcast::channel(64);
        let (stats_tx, stats_rx) = broadcast::channel(16);
        let (notice_tx, _) = broadcast::channel(16);
        let (init_tx, init_rx) = std::sync::mpsc::channel();
        let diagnostics = Arc::new(PipelineDiagnostics::default());

        let ctx = PipelineContext {
            analyzer,
            chunk_rx,
            cmd_rx,
            frames_tx,
            stats_tx,
            notice_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::clone(&diagnostics),
        };

        let handle = thread::spawn(move || run(ctx, init_tx));
        init_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("init ack")
            .expect("store init");

        Session {
            chunk_tx,
            cmd_tx,
            frames_rx,
            stats_rx,
            diagnostics,
            handle,
        }
    }

    fn shutdown(session: Session) {
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        session
            .cmd_tx
            .send(AnalyzerCmd::Shutdown { ack: ack_tx })
            .unwrap();
        ack_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("shutdown ack");
        session.handle.join().expect("analyzer thread");
    }

    fn no_spectrum_analyzer() -> Analyzer {
        Analyzer::new(
            AnalyzerConfig {
                spectrum_enabled: false,
                ..AnalyzerConfig::default()
            },
            None,
            false,
        )
    }

    #[test]
    fn chunks_become_batches_with_increasing_seq() {
        let mut session = spawn_session(no_spectrum_analyzer());

        session
            .chunk_tx
            .send(FloatChunk::new(vec![0.1; 2048], 1_000))
            .unwrap();
        session
            .chunk_tx
            .send(FloatChunk::new(vec![0.1; 1024], 2_000))
            .unwrap();

        let first = recv_batch_with_timeout(&mut session.frames_rx, Duration::from_secs(1));
        let second = recv_batch_with_timeout(&mut session.frames_rx, Duration::from_secs(1));

        assert_eq!(first.seq, 0);
        assert_eq!(first.frames.len(), 2);
        assert_eq!(second.seq, 1);
        assert_eq!(second.frames.len(), 1);
        assert_eq!(second.frames[0].block_index, 2);

        shutdown(session);
    }

    #[test]
    fn shutdown_drains_and_flushes_residual_into_store() {
        let db_path = std::env::temp_dir().join(format!(
            "wavescope-pipeline-test-{:08x}.db",
            rand::random::<u32>()
        ));
        let analyzer = Analyzer::new(
            AnalyzerConfig {
                spectrum_enabled: false,
                ..AnalyzerConfig::default()
            },
            Some(BlockStore::new(&db_path, false)),
            false,
        );
        let mut session = spawn_session(analyzer);

        // 2 full blocks + 452 residual samples, still queued at shutdown.
        session
            .chunk_tx
            .send(FloatChunk::new(vec![0.5; 2500], 9_000))
            .unwrap();

        let frames_rx = &mut session.frames_rx;
        let _ = recv_batch_with_timeout(frames_rx, Duration::from_secs(1));
        shutdown(session);

        let mut store = BlockStore::new(&db_path, false);
        store.initialize().unwrap();
        assert_eq!(store.get_total_blocks().unwrap(), 3);
        let residual = store.get_block(2).unwrap().expect("residual block");
        assert_eq!(residual.len(), 452 * 4);
        assert_eq!(store.get_total_audio_size().unwrap(), 2500 * 4);
        store.shutdown();
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn empty_chunk_is_counted_and_survived() {
        let mut session = spawn_session(no_spectrum_analyzer());

        session
            .chunk_tx
            .send(FloatChunk::new(vec![], 1_000))
            .unwrap();
        session
            .chunk_tx
            .send(FloatChunk::new(vec![0.2; 1024], 2_000))
            .unwrap();

        let batch = recv_batch_with_timeout(&mut session.frames_rx, Duration::from_secs(1));
        assert_eq!(batch.frames.len(), 1);
        assert_eq!(session.diagnostics.input_errors.load(Ordering::Relaxed), 1);

        shutdown(session);
    }

    #[test]
    fn stats_tick_reaches_subscribers() {
        let mut session = spawn_session(no_spectrum_analyzer());

        session
            .chunk_tx
            .send(FloatChunk::new(vec![0.0; 100 * 1024], 0))
            .unwrap();

        let start = Instant::now();
        let stats = loop {
            match session.stats_rx.try_recv() {
                Ok(stats) => break stats,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= Duration::from_secs(1) {
                        panic!("no stats tick");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("stats channel: {e}"),
            }
        };
        assert_eq!(stats.blocks_processed, 100);
        assert_eq!(stats.samples_processed, 100 * 1024);

        shutdown(session);
    }

    #[test]
    fn reconfigure_applies_before_later_chunks() {
        let mut session = spawn_session(no_spectrum_analyzer());

        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        session
            .cmd_tx
            .send(AnalyzerCmd::Reconfigure {
                config: AnalyzerConfig {
                    block_size: 512,
                    spectrum_enabled: false,
                    ..AnalyzerConfig::default()
                },
                ack: ack_tx,
            })
            .unwrap();
        ack_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        session
            .chunk_tx
            .send(FloatChunk::new(vec![0.0; 512], 0))
            .unwrap();
        let batch = recv_batch_with_timeout(&mut session.frames_rx, Duration::from_secs(1));
        assert_eq!(batch.frames.len(), 1);

        shutdown(session);
    }
}
