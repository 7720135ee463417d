//! deckbridge-core: Pioneer DJ format structures with write support
//!
//! This crate provides binary serialization for:
//! - export.pdb (DeviceSQL database) - little-endian
//! - ANLZ files (.DAT, .EXT, .2EX) - big-endian
//!
//! plus the key translator and the FAT32 path sanitizer shared by every
//! export target.

pub mod error;
pub mod sanitize;
pub mod keys;
pub mod string;
pub mod page;
pub mod track;
pub mod pdb;
pub mod anlz;
pub mod waveform;
pub mod validate;

// Re-exports for convenience
pub use error::{Error, Result};
pub use sanitize::{sanitize_basename, sanitize_component, fit_path};
pub use keys::{KeyTranslator, KeyFormat, HarmonicNeighbours, ProgressionDirection};
pub use string::{encode_string, encoded_len, decode_string};
pub use track::{TrackRecord, CueRecord, CueKind, Tier};
pub use pdb::{DatabaseBuilder, PlaylistNode, MAX_TRACKS};
pub use anlz::{write_dat_file, write_ext_file, write_2ex_file, analysis_dir_for};
pub use validate::{validate_database, validate_analysis, ValidationReport, DatabaseStats};
