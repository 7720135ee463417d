//! deckbridge-engine: collection parsing and export dispatch
//!
//! The engine reads a Traktor NML collection into an in-memory model,
//! optionally repairs relocated file paths through a filename index, and
//! converts selected playlists into one of the supported targets: the CDJ
//! hardware layout (DeviceSQL database + ANLZ analysis files), rekordbox
//! interchange XML, or M3U playlists. Long-running work reports progress
//! over a bounded channel and polls a cancellation flag.

pub mod error;
pub mod model;
pub mod index;
pub mod progress;
pub mod nml;
pub mod xml;
pub mod m3u;
pub mod usb;
pub mod convert;

pub use error::{Error, Result};
pub use model::{Collection, CuePoint, Node, NodeId, NodeKind, Track, Tree};
pub use index::FilenameIndex;
pub use progress::{CancelFlag, ProgressEvent, ProgressSink, ProgressStream, Terminal, progress_channel};
pub use nml::{parse_collection, ParseOptions};
pub use xml::KeyNotation;
pub use convert::{convert, ConversionOptions, ConversionReport, ExportFormat, ExportPlan};
