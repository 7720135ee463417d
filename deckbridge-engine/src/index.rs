//! Filename index for relocated audio files
//!
//! Libraries drift: the collection file remembers paths that no longer
//! exist. The index maps lowercase basenames to absolute paths under a
//! music root so the parser can repair them. First-seen wins on basename
//! collisions (lookups must stay deterministic across runs), the walk is
//! name-sorted for the same reason, and the map is size-bounded with
//! lowest-access-count eviction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::progress::ProgressSink;

/// Default entry cap.
pub const DEFAULT_CAPACITY: usize = 30_000;

/// Extensions recognised as audio when building the index.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "aiff", "aif", "m4a", "ogg", "aac"];

#[derive(Debug, Clone)]
struct IndexEntry {
    path: PathBuf,
    access_count: u64,
    inserted: u64,
}

/// Bounded basename-to-path map.
#[derive(Debug, Default)]
pub struct FilenameIndex {
    entries: HashMap<String, IndexEntry>,
    capacity: usize,
    insert_seq: u64,
}

impl FilenameIndex {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            insert_seq: 0,
        }
    }

    /// Build the index by walking `root`. Fails with
    /// [`Error::IndexUnusable`] when the root is not a directory.
    pub fn build(root: &Path, progress: Option<&ProgressSink>) -> Result<Self> {
        Self::build_with_capacity(root, DEFAULT_CAPACITY, progress)
    }

    pub fn build_with_capacity(
        root: &Path,
        capacity: usize,
        progress: Option<&ProgressSink>,
    ) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::IndexUnusable(format!(
                "music root is not a directory: {}",
                root.display()
            )));
        }

        let mut index = Self::with_capacity(capacity);
        let mut scanned = 0usize;

        // Sorted traversal keeps first-seen-wins deterministic regardless
        // of filesystem enumeration order.
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            scanned += 1;
            if scanned % 1000 == 0 {
                if let Some(sink) = progress {
                    sink.send(0, format!("Scanning music root: {} files", scanned));
                }
            }

            let is_audio = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if !is_audio {
                continue;
            }

            if let Some(name) = entry.file_name().to_str() {
                index.insert(name, entry.path().to_path_buf());
            }
        }

        info!(
            entries = index.len(),
            scanned, "filename index built from {}", root.display()
        );
        Ok(index)
    }

    /// Insert a file, keeping the first-seen path for duplicate basenames.
    pub fn insert(&mut self, basename: &str, path: PathBuf) {
        let key = basename.to_lowercase();
        if self.entries.contains_key(&key) {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.insert_seq += 1;
        self.entries.insert(
            key,
            IndexEntry {
                path,
                access_count: 0,
                inserted: self.insert_seq,
            },
        );
    }

    /// Look up a basename (case-insensitive), counting the access.
    pub fn get(&mut self, basename: &str) -> Option<PathBuf> {
        let key = basename.to_lowercase();
        let entry = self.entries.get_mut(&key)?;
        entry.access_count += 1;
        Some(entry.path.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict the entry with the lowest access count; insertion order
    /// breaks ties (oldest goes first).
    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.access_count, e.inserted))
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            debug!(basename = %key, "evicting filename-index entry");
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_build_and_lookup() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "Track One.mp3");
        touch(tmp.path(), "notes.txt");
        fs::create_dir(tmp.path().join("sub")).unwrap();
        touch(&tmp.path().join("sub"), "deep.flac");

        let mut index = FilenameIndex::build(tmp.path(), None).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.get("track one.mp3").is_some());
        assert!(index.get("TRACK ONE.MP3").is_some());
        assert!(index.get("deep.flac").is_some());
        assert!(index.get("notes.txt").is_none());
    }

    #[test]
    fn test_missing_root() {
        let result = FilenameIndex::build(Path::new("/definitely/not/here"), None);
        assert!(matches!(result, Err(Error::IndexUnusable(_))));
    }

    #[test]
    fn test_first_seen_wins() {
        let mut index = FilenameIndex::new();
        index.insert("a.mp3", PathBuf::from("/first/a.mp3"));
        index.insert("A.MP3", PathBuf::from("/second/a.mp3"));
        assert_eq!(index.get("a.mp3").unwrap(), PathBuf::from("/first/a.mp3"));
    }

    #[test]
    fn test_deterministic_builds() {
        let tmp = TempDir::new().unwrap();
        for i in 0..20 {
            touch(tmp.path(), &format!("t{i}.mp3"));
        }
        let a = FilenameIndex::build(tmp.path(), None).unwrap();
        let b = FilenameIndex::build(tmp.path(), None).unwrap();
        let mut keys_a: Vec<_> = a.entries.keys().cloned().collect();
        let mut keys_b: Vec<_> = b.entries.keys().cloned().collect();
        keys_a.sort();
        keys_b.sort();
        assert_eq!(keys_a, keys_b);
        for k in keys_a {
            assert_eq!(a.entries[&k].path, b.entries[&k].path);
        }
    }

    #[test]
    fn test_eviction_prefers_unused() {
        let mut index = FilenameIndex::with_capacity(2);
        index.insert("a.mp3", PathBuf::from("/a"));
        index.insert("b.mp3", PathBuf::from("/b"));
        // Touch a so b becomes the eviction candidate.
        index.get("a.mp3");
        index.insert("c.mp3", PathBuf::from("/c"));

        assert!(index.get("a.mp3").is_some());
        assert!(index.get("b.mp3").is_none());
        assert!(index.get("c.mp3").is_some());
    }

    #[test]
    fn test_eviction_ties_break_by_insertion() {
        let mut index = FilenameIndex::with_capacity(2);
        index.insert("a.mp3", PathBuf::from("/a"));
        index.insert("b.mp3", PathBuf::from("/b"));
        index.insert("c.mp3", PathBuf::from("/c"));

        // Neither a nor b was accessed; the older insertion goes.
        assert!(index.get("a.mp3").is_none());
        assert!(index.get("b.mp3").is_some());
    }
}
