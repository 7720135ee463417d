//! Error types for deckbridge-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key index {0} out of range 0..=23")]
    InvalidKeyIndex(u32),

    #[error("path not representable on target filesystem: {0}")]
    PathUnrepresentable(String),

    #[error("string not representable after sanitization: {0}")]
    StringUnrepresentable(String),

    #[error("collection too large for hardware: {0} tracks (limit {1})")]
    CollectionTooLarge(usize, usize),

    #[error("page overflow: {0}")]
    PageOverflow(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
