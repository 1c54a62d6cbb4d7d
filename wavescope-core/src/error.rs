use thiserror::Error;

/// All errors produced by wavescope-core.
#[derive(Debug, Error)]
pub enum WavescopeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no acceptable audio format: {0}")]
    FormatUnsupported(String),

    #[error("duplicate block index {0} in store")]
    DuplicateBlock(u64),

    #[error("resource allocation failed: {0}")]
    Resource(String),

    #[error("invalid operation for current state: {0}")]
    State(String),

    #[error("rejected input: {0}")]
    Input(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("network stream error: {0}")]
    Network(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WavescopeError>;
