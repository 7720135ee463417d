//! Collection data model
//!
//! Tracks are identified by a stable fingerprint: the source library's
//! audio id when present, otherwise a hash of the canonicalised absolute
//! path. The playlist tree is an arena of indexed nodes with child-id
//! lists, which keeps the database writer's pre-order traversal a straight
//! loop and rules out reference cycles.

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

pub use deckbridge_core::track::CueKind;

/// A cue point as parsed from the source, positions in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CuePoint {
    pub name: String,
    pub kind: CueKind,
    pub start_ms: u32,
    /// 0 for point cues, loop length for loops.
    pub length_ms: u32,
    /// -1 for memory cues, 0..7 for hot slots.
    pub hot_slot: i8,
    pub colour: Option<(u8, u8, u8)>,
    /// Position in source order.
    pub display_order: u32,
}

/// One track of the collection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Track {
    pub fingerprint: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub label: String,
    pub comment: String,
    pub remixer: String,
    /// Absolute path to the audio file (post-repair when repair ran).
    pub file_path: String,
    pub volume: String,
    pub file_size: u64,
    pub sample_rate: u32,
    pub sample_depth: u16,
    /// kbps
    pub bitrate: u32,
    pub duration_secs: u32,
    pub duration_float: f64,
    pub bpm: f64,
    /// Source key index 0..=23, when the dedicated key element was present.
    pub key_index: Option<u32>,
    /// Free-text key attribute, kept as fallback.
    pub key_text: String,
    /// 0..=5, already bucketed from the source's 0-255 scale.
    pub rating: u8,
    pub play_count: u32,
    pub date_added: Option<NaiveDate>,
    pub date_modified: Option<NaiveDate>,
    pub last_played: Option<NaiveDate>,
    /// Colour tag 0..=7.
    pub colour: u8,
    pub cues: Vec<CuePoint>,
    pub grid_anchor_ms: Option<u32>,
}

impl Track {
    /// Issues a careful export would warn about for this track.
    pub fn validation_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.fingerprint.is_empty() {
            issues.push("missing fingerprint".to_string());
        }
        if self.file_path.is_empty() {
            issues.push("missing file path".to_string());
        }
        if self.bpm <= 0.0 {
            issues.push("no BPM".to_string());
        }
        if self.duration_secs == 0 {
            issues.push("no duration".to_string());
        }

        let mut slots: Vec<i8> = self
            .cues
            .iter()
            .filter(|c| c.hot_slot >= 0)
            .map(|c| c.hot_slot)
            .collect();
        let before = slots.len();
        slots.sort_unstable();
        slots.dedup();
        if slots.len() != before {
            issues.push("duplicate hot-cue slots".to_string());
        }
        issues
    }
}

/// Stable fingerprint for a track without a source id: xxh3 of the
/// canonicalised absolute path, in hex.
pub fn fingerprint_for_path(path: &str) -> String {
    let canonical = path.replace('\\', "/");
    format!("{:016x}", xxh3_64(canonical.as_bytes()))
}

/// Source ratings use a 0-255 scale in six buckets.
pub fn rating_from_ranking(ranking: u32) -> u8 {
    ((ranking / 51).min(5)) as u8
}

/// Display kind for a file path, as the interchange format spells them.
pub fn file_kind_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp3") => "MP3 File",
        Some("m4a") | Some("aac") => "M4A File",
        Some("flac") => "FLAC File",
        Some("wav") => "WAV File",
        Some("aiff") | Some("aif") => "AIFF File",
        Some("ogg") => "OGG File",
        _ => "MP3 File",
    }
}

/// Days between a date and 1970-01-01, clamped at zero.
pub fn days_since_epoch(date: NaiveDate) -> u32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch");
    date.signed_duration_since(epoch).num_days().max(0) as u32
}

/// Node index into [`Tree::nodes`].
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Folder,
    Playlist,
    Smartlist,
}

/// One playlist-tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub name: String,
    pub uuid: String,
    /// Child node ids, folders only, in source order.
    pub children: Vec<NodeId>,
    /// Resolved track fingerprints, playlists only, in source order.
    pub tracks: Vec<String>,
    /// Pass-through query, smartlists only.
    pub query: String,
}

impl Node {
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            children: Vec::new(),
            tracks: Vec::new(),
            query: String::new(),
        }
    }
}

/// Arena-allocated playlist tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
    /// Top-level node ids in source order.
    pub roots: Vec<NodeId>,
}

impl Tree {
    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Pre-order walk over the whole tree.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            for &child in self.nodes[id].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Pre-order walk of the subtree rooted at `root`.
    pub fn preorder_from(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            order.push(id);
            for &child in self.nodes[id].children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }
}

/// Collection statistics recorded during a parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    pub version: String,
    pub entry_count: usize,
    pub parse_millis: u64,
}

/// A parsed collection: identity lives in the track map, membership in
/// the tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collection {
    pub tracks: HashMap<String, Track>,
    pub tree: Tree,
    pub stats: CollectionStats,
    /// Warnings collected while parsing (dropped entries, unresolved
    /// playlist references, encoding fallbacks).
    pub issues: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_buckets() {
        assert_eq!(rating_from_ranking(0), 0);
        assert_eq!(rating_from_ranking(51), 1);
        assert_eq!(rating_from_ranking(102), 2);
        assert_eq!(rating_from_ranking(153), 3);
        assert_eq!(rating_from_ranking(204), 4);
        assert_eq!(rating_from_ranking(255), 5);
        assert_eq!(rating_from_ranking(300), 5);
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(
            fingerprint_for_path("/music/a.mp3"),
            fingerprint_for_path("\\music\\a.mp3")
        );
        assert_ne!(
            fingerprint_for_path("/music/a.mp3"),
            fingerprint_for_path("/music/b.mp3")
        );
    }

    #[test]
    fn test_file_kinds() {
        assert_eq!(file_kind_for("/x/a.mp3"), "MP3 File");
        assert_eq!(file_kind_for("/x/a.FLAC"), "FLAC File");
        assert_eq!(file_kind_for("/x/a.aif"), "AIFF File");
        assert_eq!(file_kind_for("/x/noext"), "MP3 File");
    }

    #[test]
    fn test_duplicate_hot_slots_flagged() {
        let track = Track {
            fingerprint: "f".to_string(),
            file_path: "/a.mp3".to_string(),
            bpm: 120.0,
            duration_secs: 60,
            cues: vec![
                CuePoint { hot_slot: 1, ..Default::default() },
                CuePoint { hot_slot: 1, ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(track.validation_issues(), vec!["duplicate hot-cue slots"]);
    }

    #[test]
    fn test_preorder() {
        let mut tree = Tree::default();
        let folder = tree.push(Node::new(NodeKind::Folder, "F"));
        let a = tree.push(Node::new(NodeKind::Playlist, "A"));
        let b = tree.push(Node::new(NodeKind::Playlist, "B"));
        tree.nodes[folder].children = vec![a, b];
        let top = tree.push(Node::new(NodeKind::Playlist, "Top"));
        tree.roots = vec![folder, top];

        let order = tree.preorder();
        let names: Vec<&str> = order.iter().map(|&id| tree.nodes[id].name.as_str()).collect();
        assert_eq!(names, vec!["F", "A", "B", "Top"]);
    }

    #[test]
    fn test_days_since_epoch() {
        let d = NaiveDate::from_ymd_opt(1970, 1, 2).unwrap();
        assert_eq!(days_since_epoch(d), 1);
        let before = NaiveDate::from_ymd_opt(1960, 1, 1).unwrap();
        assert_eq!(days_since_epoch(before), 0);
    }
}
