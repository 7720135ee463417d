//! Hardware-facing track records
//!
//! These are the flattened, export-plan representations the binary writers
//! consume. The conversion engine builds them from its collection model;
//! ids are already assigned and reference strings already sanitized by the
//! time a record reaches this crate.

use serde::{Deserialize, Serialize};

/// Hardware tier selecting the analysis-file variants and cue format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Tier {
    /// Baseline players: .DAT only, 3 hot cues, PCPT cue entries.
    #[default]
    A,
    /// Colour-waveform players: .DAT + .EXT, 8 hot cues, PCP2 entries.
    B,
    /// Top tier: .DAT + .EXT + .2EX with phrase structure.
    C,
}

impl Tier {
    /// Maximum hot-cue slots the tier's players expose.
    pub fn hot_cue_limit(self) -> usize {
        match self {
            Tier::A => 3,
            Tier::B | Tier::C => 8,
        }
    }

    /// Whether the extended cue entry (comment + colour) is written.
    pub fn extended_cues(self) -> bool {
        !matches!(self, Tier::A)
    }
}

/// Cue kinds carried through to the analysis files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CueKind {
    #[default]
    Cue,
    FadeIn,
    FadeOut,
    Memory,
    GridAnchor,
    Loop,
}

/// A cue point in export-plan form. Positions are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CueRecord {
    pub name: String,
    pub kind: CueKind,
    pub start_ms: u32,
    /// 0 for point cues, the loop length for loops.
    pub length_ms: u32,
    /// -1 for memory cues, 0..7 for hot slots.
    pub hot_slot: i8,
    pub colour: Option<(u8, u8, u8)>,
}

impl CueRecord {
    pub fn is_loop(&self) -> bool {
        self.kind == CueKind::Loop && self.length_ms > 0
    }

    pub fn is_hot(&self) -> bool {
        self.hot_slot >= 0
    }
}

/// One track of the export plan.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrackRecord {
    /// Sequential id, 1-based, in export-plan order.
    pub id: u32,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub label: String,
    pub comment: String,
    pub remixer: String,
    /// Path stored in the database, relative to `Contents/`.
    pub file_path: String,
    /// Absolute source path, used for the analysis directory hash.
    pub source_path: String,
    /// Display kind, e.g. "MP3 File".
    pub file_kind: String,
    pub file_size: u64,
    pub sample_rate: u32,
    pub sample_depth: u16,
    pub bitrate: u16,
    pub duration_secs: u32,
    pub bpm: f64,
    /// Source key index 0..=23, if known.
    pub key_index: Option<u32>,
    /// 0..=5.
    pub rating: u8,
    /// Colour tag 0..=7; 0 means untagged.
    pub colour: u8,
    pub play_count: u32,
    pub year: u32,
    /// Date added, as days since 1970-01-01.
    pub date_added_days: u32,
    pub cues: Vec<CueRecord>,
    /// Beat-grid anchor position, if the source carried one.
    pub grid_anchor_ms: Option<u32>,
}

impl TrackRecord {
    /// Memory-bank cues: everything without a hot slot, grid anchors
    /// excluded (they live in the beat grid, not the cue table).
    pub fn memory_cues(&self) -> impl Iterator<Item = &CueRecord> {
        self.cues
            .iter()
            .filter(|c| !c.is_hot() && c.kind != CueKind::GridAnchor)
    }

    /// Hot cues within the tier's slot limit, ordered by slot.
    pub fn hot_cues(&self, tier: Tier) -> Vec<&CueRecord> {
        let limit = tier.hot_cue_limit() as i8;
        let mut hot: Vec<&CueRecord> = self
            .cues
            .iter()
            .filter(|c| c.is_hot() && c.hot_slot < limit)
            .collect();
        hot.sort_by_key(|c| c.hot_slot);
        hot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(slot: i8, kind: CueKind) -> CueRecord {
        CueRecord {
            hot_slot: slot,
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn test_tier_limits() {
        assert_eq!(Tier::A.hot_cue_limit(), 3);
        assert_eq!(Tier::C.hot_cue_limit(), 8);
        assert!(!Tier::A.extended_cues());
        assert!(Tier::B.extended_cues());
    }

    #[test]
    fn test_cue_banks() {
        let track = TrackRecord {
            cues: vec![
                cue(-1, CueKind::Memory),
                cue(-1, CueKind::GridAnchor),
                cue(0, CueKind::Cue),
                cue(5, CueKind::Cue),
                cue(2, CueKind::Loop),
            ],
            ..Default::default()
        };

        assert_eq!(track.memory_cues().count(), 1);
        // Tier A keeps slots 0..3 only.
        let hot_a = track.hot_cues(Tier::A);
        assert_eq!(hot_a.len(), 2);
        assert_eq!(hot_a[0].hot_slot, 0);
        assert_eq!(hot_a[1].hot_slot, 2);
        assert_eq!(track.hot_cues(Tier::B).len(), 3);
    }
}
