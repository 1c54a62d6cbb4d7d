//! # wavescope-core
//!
//! Real-time audio capture, analysis and persistence engine.
//!
//! ## Architecture
//!
//! ```text
//! Device (cpal) ──► SPSC RingBuffer ──► capture worker ─┐
//!                                                       ├─► FloatChunk queue ─► analyzer thread
//! Stream decoder ──► NetworkSource worker ──────────────┘         │
//!                                                                 ├─ Analyzer: blocks → peaks + FFT
//!                                                                 ├─ BlockStore: append-only sqlite
//!                                                                 └─ broadcast: frames / stats / notices
//! ```
//!
//! Each source runs on its own worker thread and is the only producer of
//! `FloatChunk`s for the session. The analyzer thread owns the `Analyzer`
//! and the `BlockStore`; no other thread touches their state. The
//! `SessionController` wires the two together and tears them down in order
//! (stop source → drain → flush residual → store shutdown).

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod analysis;
pub mod audio;
pub mod buffering;
pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod format;
pub mod net;
pub mod store;

// Convenience re-exports for downstream crates
pub use analysis::{Analyzer, AnalyzerConfig};
pub use analysis::spectrum::{SpectrogramFrame, SpectrumAnalyzer, SpectrumConfig};
pub use analysis::window::WindowType;
pub use audio::PhysicalInputConfig;
pub use engine::{ControllerConfig, SessionController, SourceKind};
pub use error::WavescopeError;
pub use events::{FrameBatch, FrameData, SessionNotice, StatsUpdate};
pub use format::{AudioFormat, SampleFormat};
pub use net::{DecoderFactory, NetworkInputConfig, StreamDecoder};
pub use store::BlockStore;
