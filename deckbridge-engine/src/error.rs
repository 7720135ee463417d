//! Error types for deckbridge-engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot read source collection: {0}")]
    SourceUnreadable(String),

    #[error("source collection unparseable: {0}")]
    SourceUnparseable(String),

    #[error("filename index unusable: {0}")]
    IndexUnusable(String),

    #[error("audio copy failed for {path}: {reason}")]
    AudioCopyFailed { path: String, reason: String },

    #[error("copy verification mismatch for {0}")]
    VerifyMismatch(String),

    #[error("output not writable: {0}")]
    OutputNotWritable(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("collection too large for hardware: {0} tracks")]
    CollectionTooLarge(usize),

    #[error("conversion cancelled")]
    Cancelled,

    #[error("unsupported target: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Core(#[from] deckbridge_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
