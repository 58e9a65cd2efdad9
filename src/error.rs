use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the persistent key/value layer.
///
/// The locking engine never propagates these; it logs them and degrades to
/// "not locked".
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Corrupt lock record under key {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Key of {len} bytes exceeds backend limit of {max} bytes")]
    KeyTooLong { len: usize, max: usize },
}

impl From<fjall::Error> for StoreError {
    fn from(err: fjall::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Failures reported by a delta job iteration.
#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("Bad magic number {found:#010x}, expected {expected:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("Unknown delta command {0:#04x}")]
    UnknownCommand(u8),

    #[error("Input ended inside a {0}")]
    Truncated(&'static str),

    #[error("Invalid signature parameters: block length {block_len}, strong length {strong_len}")]
    InvalidParams { block_len: u32, strong_len: u32 },

    #[error("Copy of {len} bytes at offset {offset} lies outside the basis file")]
    CopyOutOfRange { offset: u64, len: u64 },

    #[error("Failed to read basis file: {0}")]
    Basis(#[source] io::Error),

    #[error("Output buffer has no capacity")]
    NoOutputSpace,
}

/// Failures of a file stream transfer.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Transport I/O error: {0}")]
    Transport(#[source] io::Error),

    #[error("Short {what} during file stream: expected {expected} bytes, got {actual}")]
    Short {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Frame of {len} bytes exceeds message size {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Remote file stream error: {0}")]
    Remote(String),

    #[error("Insufficient buffer capacity: {available} of {capacity} bytes available, {required} required")]
    Capacity {
        available: usize,
        capacity: usize,
        required: usize,
    },

    #[error("Failed to {action} '{path}': {source}")]
    File {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Delta job failed: {0}")]
    Delta(#[from] DeltaError),
}

impl StreamError {
    pub(crate) fn file(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StreamError::File {
            action,
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
