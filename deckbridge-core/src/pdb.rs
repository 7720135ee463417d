//! DeviceSQL database generation
//!
//! `export.pdb` is a little-endian paged database. This module lays out
//! the nine mandatory tables (tracks, genres, artists, albums, labels,
//! keys, colors, playlist tree, playlist entries), deduplicates reference
//! names into densely numbered rows, and enforces the hardware's track
//! limit. Rows within a page are written in ascending primary-id order so
//! players can binary-search them.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::keys::KeyTranslator;
use crate::page::{FileHeader, PageBuilder, TableKind, TablePointer};
use crate::string::{encode_string, encoded_len};
use crate::track::TrackRecord;

/// Hardware refuses collections beyond this many tracks.
pub const MAX_TRACKS: usize = 20_000;

/// Track row marker at offset 0x00.
const ROW_MARKER_TRACK: u16 = 0x0024;

/// Fixed track-row slot size.
const TRACK_ROW_LEN: usize = 88;

/// Reference-table row slot size (id + name pointer + padding).
const REF_ROW_LEN: usize = 8;

const TREE_ROW_LEN: usize = 16;
const ENTRY_ROW_LEN: usize = 12;

/// Default colour palette rows, as the desktop software writes them.
const COLOURS: [(u32, &str); 8] = [
    (1, "Pink"),
    (2, "Red"),
    (3, "Orange"),
    (4, "Yellow"),
    (5, "Green"),
    (6, "Aqua"),
    (7, "Blue"),
    (8, "Purple"),
];

/// A playlist-tree node in flattened form.
#[derive(Debug, Clone)]
pub struct PlaylistNode {
    pub id: u32,
    pub parent_id: u32,
    pub seq: u32,
    pub is_folder: bool,
    pub name: String,
    /// Track ids, playlist nodes only.
    pub track_ids: Vec<u32>,
}

struct TrackEntry {
    record: TrackRecord,
    artist_id: u32,
    album_id: u32,
    genre_id: u32,
    label_id: u32,
    key_id: u32,
}

/// High-level database builder.
pub struct DatabaseBuilder {
    tracks: Vec<TrackEntry>,
    artists: HashMap<String, u32>,
    albums: HashMap<String, u32>,
    genres: HashMap<String, u32>,
    labels: HashMap<String, u32>,
    /// vendor database key id -> dense row id
    keys: HashMap<u32, u32>,
    key_names: HashMap<u32, &'static str>,
    playlists: Vec<PlaylistNode>,
    key_translator: KeyTranslator,
    auxiliary_tables: bool,
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            artists: HashMap::new(),
            albums: HashMap::new(),
            genres: HashMap::new(),
            labels: HashMap::new(),
            keys: HashMap::new(),
            key_names: HashMap::new(),
            playlists: Vec::new(),
            key_translator: KeyTranslator::new(),
            auxiliary_tables: false,
        }
    }

    /// Also emit the optional artwork and history tables (empty). Newer
    /// players tolerate their absence; older firmware revisions probe for
    /// them.
    pub fn with_auxiliary_tables(mut self) -> Self {
        self.auxiliary_tables = true;
        self
    }

    /// Add a track. Its id must already be assigned by the export plan.
    pub fn add_track(&mut self, record: &TrackRecord) -> Result<()> {
        if self.tracks.len() >= MAX_TRACKS {
            return Err(Error::CollectionTooLarge(self.tracks.len() + 1, MAX_TRACKS));
        }

        let artist_id = intern(&mut self.artists, &record.artist);
        let album_id = intern(&mut self.albums, &record.album);
        let genre_id = intern(&mut self.genres, &record.genre);
        let label_id = intern(&mut self.labels, &record.label);
        let key_id = match record.key_index {
            Some(idx) => self.intern_key(idx)?,
            None => 0,
        };

        self.tracks.push(TrackEntry {
            record: record.clone(),
            artist_id,
            album_id,
            genre_id,
            label_id,
            key_id,
        });
        Ok(())
    }

    /// Add a flattened playlist-tree node. Nodes must arrive in pre-order
    /// so their ids ascend.
    pub fn add_node(&mut self, node: PlaylistNode) {
        self.playlists.push(node);
    }

    fn intern_key(&mut self, index: u32) -> Result<u32> {
        let vendor_id = self.key_translator.vendor_db_id(index);
        if vendor_id == 0 {
            return Err(Error::InvalidKeyIndex(index));
        }
        if let Some(&id) = self.keys.get(&vendor_id) {
            return Ok(id);
        }
        let id = self.keys.len() as u32 + 1;
        self.keys.insert(vendor_id, id);
        self.key_names.insert(id, self.key_translator.db_name(index)?);
        Ok(id)
    }

    /// Build the complete database image.
    pub fn build(&self) -> Result<Vec<u8>> {
        self.build_with_cancel(|| false)
    }

    /// Build, polling `cancelled` between pages.
    pub fn build_with_cancel(&self, cancelled: impl Fn() -> bool) -> Result<Vec<u8>> {
        if self.tracks.len() > MAX_TRACKS {
            return Err(Error::CollectionTooLarge(self.tracks.len(), MAX_TRACKS));
        }

        let mut header = FileHeader::new();
        let mut pages: Vec<Vec<u8>> = Vec::new();
        let mut next_index = 1u32;
        let mut sequence = 1u32;

        let mut kinds: Vec<TableKind> = TableKind::mandatory().to_vec();
        if self.auxiliary_tables {
            kinds.extend([
                TableKind::Artwork,
                TableKind::HistoryPlaylists,
                TableKind::HistoryEntries,
            ]);
        }

        for kind in kinds {
            if cancelled() {
                return Err(Error::Cancelled);
            }

            let builders = self.build_table(kind, &mut sequence)?;
            let first = next_index;
            let count = builders.len() as u32;
            for (i, builder) in builders.into_iter().enumerate() {
                let next = if (i as u32) < count - 1 {
                    first + i as u32 + 1
                } else {
                    0
                };
                pages.push(builder.seal(next));
            }
            header.add_table(TablePointer {
                kind,
                first_page: first,
                last_page: first + count - 1,
            });
            next_index += count;
            debug!(table = ?kind, pages = count, "table laid out");
        }

        header.next_unused_page = next_index;
        header.sequence = sequence;

        let mut output = header.to_page();
        output.reserve(pages.len() * crate::page::PAGE_LEN);
        for page in pages {
            output.extend_from_slice(&page);
        }

        info!(
            tracks = self.tracks.len(),
            playlists = self.playlists.len(),
            pages = next_index,
            bytes = output.len(),
            "database assembled"
        );
        Ok(output)
    }

    fn build_table(&self, kind: TableKind, sequence: &mut u32) -> Result<Vec<PageBuilder>> {
        match kind {
            TableKind::Tracks => self.build_track_pages(sequence),
            TableKind::Genres => self.build_ref_pages(kind, &self.genres, sequence),
            TableKind::Artists => self.build_ref_pages(kind, &self.artists, sequence),
            TableKind::Albums => self.build_ref_pages(kind, &self.albums, sequence),
            TableKind::Labels => self.build_ref_pages(kind, &self.labels, sequence),
            TableKind::Keys => self.build_key_pages(sequence),
            TableKind::Colors => self.build_colour_pages(sequence),
            TableKind::PlaylistTree => self.build_tree_pages(sequence),
            TableKind::PlaylistEntries => self.build_entry_pages(sequence),
            _ => Ok(vec![self.fresh_page(kind, sequence)]),
        }
    }

    fn fresh_page(&self, kind: TableKind, sequence: &mut u32) -> PageBuilder {
        let builder = PageBuilder::new(kind, *sequence);
        *sequence += 1;
        builder
    }

    fn build_track_pages(&self, sequence: &mut u32) -> Result<Vec<PageBuilder>> {
        let mut pages = Vec::new();
        let mut current = self.fresh_page(TableKind::Tracks, sequence);

        for entry in &self.tracks {
            let strings = track_strings(&entry.record);
            let heap_len: usize = strings.iter().map(|s| encoded_len(s)).sum();

            if !current.fits(TRACK_ROW_LEN, heap_len) {
                pages.push(std::mem::replace(
                    &mut current,
                    self.fresh_page(TableKind::Tracks, sequence),
                ));
            }

            let mut ptrs = [0u16; 5];
            for (i, s) in strings.iter().enumerate() {
                ptrs[i] = current.push_heap(&encode_string(s))?;
            }
            current.push_row(&track_row(entry, &ptrs))?;
        }

        pages.push(current);
        Ok(pages)
    }

    fn build_ref_pages(
        &self,
        kind: TableKind,
        map: &HashMap<String, u32>,
        sequence: &mut u32,
    ) -> Result<Vec<PageBuilder>> {
        let mut rows: Vec<(&String, u32)> = map.iter().map(|(n, &id)| (n, id)).collect();
        rows.sort_by_key(|&(_, id)| id);

        let mut pages = Vec::new();
        let mut current = self.fresh_page(kind, sequence);

        for (name, id) in rows {
            let encoded = encode_string(name);
            if !current.fits(REF_ROW_LEN, encoded.len()) {
                pages.push(std::mem::replace(
                    &mut current,
                    self.fresh_page(kind, sequence),
                ));
            }
            let ptr = current.push_heap(&encoded)?;
            current.push_row(&ref_row(id, ptr))?;
        }

        pages.push(current);
        Ok(pages)
    }

    fn build_key_pages(&self, sequence: &mut u32) -> Result<Vec<PageBuilder>> {
        let mut rows: Vec<(u32, &str)> = self
            .key_names
            .iter()
            .map(|(&id, &name)| (id, name))
            .collect();
        rows.sort_by_key(|&(id, _)| id);

        let mut pages = Vec::new();
        let mut current = self.fresh_page(TableKind::Keys, sequence);

        for (id, name) in rows {
            let encoded = encode_string(name);
            if !current.fits(REF_ROW_LEN, encoded.len()) {
                pages.push(std::mem::replace(
                    &mut current,
                    self.fresh_page(TableKind::Keys, sequence),
                ));
            }
            let ptr = current.push_heap(&encoded)?;
            current.push_row(&ref_row(id, ptr))?;
        }

        pages.push(current);
        Ok(pages)
    }

    /// The colour table always carries the standard eight rows.
    fn build_colour_pages(&self, sequence: &mut u32) -> Result<Vec<PageBuilder>> {
        let mut current = self.fresh_page(TableKind::Colors, sequence);
        for (id, name) in COLOURS {
            let ptr = current.push_heap(&encode_string(name))?;
            current.push_row(&ref_row(id, ptr))?;
        }
        Ok(vec![current])
    }

    fn build_tree_pages(&self, sequence: &mut u32) -> Result<Vec<PageBuilder>> {
        let mut pages = Vec::new();
        let mut current = self.fresh_page(TableKind::PlaylistTree, sequence);

        for node in &self.playlists {
            let encoded = encode_string(&node.name);
            if !current.fits(TREE_ROW_LEN, encoded.len()) {
                pages.push(std::mem::replace(
                    &mut current,
                    self.fresh_page(TableKind::PlaylistTree, sequence),
                ));
            }
            let ptr = current.push_heap(&encoded)?;

            let mut row = [0u8; TREE_ROW_LEN];
            row[0..4].copy_from_slice(&node.id.to_le_bytes());
            row[4..8].copy_from_slice(&node.parent_id.to_le_bytes());
            row[8..12].copy_from_slice(&node.seq.to_le_bytes());
            row[12] = if node.is_folder { 0 } else { 1 };
            row[14..16].copy_from_slice(&ptr.to_le_bytes());
            current.push_row(&row)?;
        }

        pages.push(current);
        Ok(pages)
    }

    fn build_entry_pages(&self, sequence: &mut u32) -> Result<Vec<PageBuilder>> {
        let mut pages = Vec::new();
        let mut current = self.fresh_page(TableKind::PlaylistEntries, sequence);

        // Playlist nodes carry pre-order (ascending) ids, so iterating them
        // in insertion order keeps entry rows sorted by playlist id then
        // position.
        for node in self.playlists.iter().filter(|n| !n.is_folder) {
            for (position, &track_id) in node.track_ids.iter().enumerate() {
                if !current.fits(ENTRY_ROW_LEN, 0) {
                    pages.push(std::mem::replace(
                        &mut current,
                        self.fresh_page(TableKind::PlaylistEntries, sequence),
                    ));
                }
                let mut row = [0u8; ENTRY_ROW_LEN];
                row[0..4].copy_from_slice(&node.id.to_le_bytes());
                row[4..8].copy_from_slice(&track_id.to_le_bytes());
                row[8..12].copy_from_slice(&(position as u32).to_le_bytes());
                current.push_row(&row)?;
            }
        }

        pages.push(current);
        Ok(pages)
    }
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Dense name interning; empty names map to id 0 (no reference).
fn intern(map: &mut HashMap<String, u32>, name: &str) -> u32 {
    if name.is_empty() {
        return 0;
    }
    if let Some(&id) = map.get(name) {
        return id;
    }
    let id = map.len() as u32 + 1;
    map.insert(name.to_string(), id);
    id
}

/// The five heap strings of a track row, in pointer order.
fn track_strings(record: &TrackRecord) -> [&str; 5] {
    [
        &record.title,
        &record.file_path,
        &record.comment,
        &record.remixer,
        &record.file_kind,
    ]
}

/// Fixed 88-byte track row.
///
/// - 0x00 u16 row marker, 0x02 u16 row length
/// - 0x04 track id, 0x08 artist, 0x0C album, 0x10 genre, 0x14 label,
///   0x18 key (all u32)
/// - 0x1C u32 BPM x 100, 0x20 u32 duration s, 0x24 u32 sample rate,
///   0x28 u32 file size
/// - 0x2C u16 bitrate, 0x2E u16 rating
/// - 0x30 u32 colour, 0x34 u32 date added (days), 0x38 u32 play count,
///   0x3C u32 year
/// - 0x40 reserved x8
/// - 0x48 five u16 heap pointers (title, path, comment, remixer, kind)
/// - 0x52 reserved x6
fn track_row(entry: &TrackEntry, ptrs: &[u16; 5]) -> [u8; TRACK_ROW_LEN] {
    let r = &entry.record;
    let mut row = [0u8; TRACK_ROW_LEN];

    row[0x00..0x02].copy_from_slice(&ROW_MARKER_TRACK.to_le_bytes());
    row[0x02..0x04].copy_from_slice(&(TRACK_ROW_LEN as u16).to_le_bytes());
    row[0x04..0x08].copy_from_slice(&r.id.to_le_bytes());
    row[0x08..0x0C].copy_from_slice(&entry.artist_id.to_le_bytes());
    row[0x0C..0x10].copy_from_slice(&entry.album_id.to_le_bytes());
    row[0x10..0x14].copy_from_slice(&entry.genre_id.to_le_bytes());
    row[0x14..0x18].copy_from_slice(&entry.label_id.to_le_bytes());
    row[0x18..0x1C].copy_from_slice(&entry.key_id.to_le_bytes());
    row[0x1C..0x20].copy_from_slice(&((r.bpm * 100.0).round() as u32).to_le_bytes());
    row[0x20..0x24].copy_from_slice(&r.duration_secs.to_le_bytes());
    row[0x24..0x28].copy_from_slice(&r.sample_rate.to_le_bytes());
    row[0x28..0x2C].copy_from_slice(&(r.file_size as u32).to_le_bytes());
    row[0x2C..0x2E].copy_from_slice(&r.bitrate.to_le_bytes());
    row[0x2E..0x30].copy_from_slice(&(r.rating as u16).to_le_bytes());
    row[0x30..0x34].copy_from_slice(&(r.colour as u32).to_le_bytes());
    row[0x34..0x38].copy_from_slice(&r.date_added_days.to_le_bytes());
    row[0x38..0x3C].copy_from_slice(&r.play_count.to_le_bytes());
    row[0x3C..0x40].copy_from_slice(&r.year.to_le_bytes());
    // 0x40..0x48 reserved
    for (i, ptr) in ptrs.iter().enumerate() {
        let at = 0x48 + i * 2;
        row[at..at + 2].copy_from_slice(&ptr.to_le_bytes());
    }
    // 0x52..0x58 reserved
    row
}

fn ref_row(id: u32, name_ptr: u16) -> [u8; REF_ROW_LEN] {
    let mut row = [0u8; REF_ROW_LEN];
    row[0..4].copy_from_slice(&id.to_le_bytes());
    row[4..6].copy_from_slice(&name_ptr.to_le_bytes());
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_LEN;

    fn make_track(id: u32, title: &str, artist: &str) -> TrackRecord {
        TrackRecord {
            id,
            title: title.to_string(),
            artist: artist.to_string(),
            album: "Test Album".to_string(),
            genre: "Electronic".to_string(),
            file_path: format!("Contents/{}.mp3", title),
            file_kind: "MP3 File".to_string(),
            duration_secs: 180,
            sample_rate: 44100,
            sample_depth: 16,
            bitrate: 320,
            bpm: 128.0,
            key_index: Some(5),
            file_size: 5_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_database_shape() {
        let mut builder = DatabaseBuilder::new();
        builder.add_track(&make_track(1, "A", "B")).unwrap();
        let data = builder.build().unwrap();

        assert_eq!(data.len() % PAGE_LEN, 0);
        // header + nine mandatory tables, one page each
        assert_eq!(data.len(), PAGE_LEN * 10);

        let page_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        assert_eq!(page_len, PAGE_LEN as u32);
        let num_tables = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        assert_eq!(num_tables, 9);
        let next_unused = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
        assert_eq!(next_unused, 10);
    }

    #[test]
    fn test_track_row_fields() {
        let mut builder = DatabaseBuilder::new();
        builder.add_track(&make_track(1, "A", "B")).unwrap();
        let data = builder.build().unwrap();

        // Tracks table is the first table; its page is page 1.
        let page = &data[PAGE_LEN..2 * PAGE_LEN];
        let row = &page[28..28 + TRACK_ROW_LEN];

        let track_id = u32::from_le_bytes([row[0x04], row[0x05], row[0x06], row[0x07]]);
        assert_eq!(track_id, 1);
        let bpm = u32::from_le_bytes([row[0x1C], row[0x1D], row[0x1E], row[0x1F]]);
        assert_eq!(bpm, 12800);
        let duration = u32::from_le_bytes([row[0x20], row[0x21], row[0x22], row[0x23]]);
        assert_eq!(duration, 180);
    }

    #[test]
    fn test_reference_dedup() {
        let mut builder = DatabaseBuilder::new();
        builder.add_track(&make_track(1, "A", "Same Artist")).unwrap();
        builder.add_track(&make_track(2, "B", "Same Artist")).unwrap();
        assert_eq!(builder.artists.len(), 1);
        assert_eq!(builder.artists["Same Artist"], 1);
    }

    #[test]
    fn test_track_limit() {
        let mut builder = DatabaseBuilder::new();
        builder.tracks.reserve(MAX_TRACKS);
        for i in 0..MAX_TRACKS as u32 {
            builder
                .add_track(&TrackRecord {
                    id: i + 1,
                    ..Default::default()
                })
                .unwrap();
        }
        assert!(matches!(
            builder.add_track(&TrackRecord::default()),
            Err(Error::CollectionTooLarge(_, _))
        ));
    }

    #[test]
    fn test_auxiliary_tables() {
        let mut builder = DatabaseBuilder::new().with_auxiliary_tables();
        builder.add_track(&make_track(1, "A", "B")).unwrap();
        let data = builder.build().unwrap();

        // Nine mandatory tables plus artwork and the two history tables.
        let num_tables = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        assert_eq!(num_tables, 12);
        assert_eq!(data.len(), PAGE_LEN * 13);
    }

    #[test]
    fn test_playlist_rows() {
        let mut builder = DatabaseBuilder::new();
        builder.add_track(&make_track(1, "A", "B")).unwrap();
        builder.add_node(PlaylistNode {
            id: 1,
            parent_id: 0,
            seq: 0,
            is_folder: false,
            name: "PL".to_string(),
            track_ids: vec![1],
        });
        let data = builder.build().unwrap();

        // Playlist tree is table 8 of 9 -> page 8; entries page 9.
        let tree_page = &data[8 * PAGE_LEN..9 * PAGE_LEN];
        let row_count = u16::from_le_bytes([tree_page[0x0C], tree_page[0x0D]]);
        assert_eq!(row_count, 1);
        let row = &tree_page[28..28 + TREE_ROW_LEN];
        assert_eq!(row[12], 1); // playlist, not folder

        let entry_page = &data[9 * PAGE_LEN..10 * PAGE_LEN];
        let entry = &entry_page[28..28 + ENTRY_ROW_LEN];
        let playlist_id = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let track_id = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
        let position = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
        assert_eq!((playlist_id, track_id, position), (1, 1, 0));
    }

    #[test]
    fn test_page_overflow_chains() {
        let mut builder = DatabaseBuilder::new();
        for i in 0..200u32 {
            builder
                .add_track(&make_track(i + 1, &format!("Track {}", i), "Artist"))
                .unwrap();
        }
        let data = builder.build().unwrap();

        // 200 tracks at 88 bytes + heap will not fit a single 4 KiB page.
        assert!(data.len() > PAGE_LEN * 10);

        // First track page chains onward.
        let page1 = &data[PAGE_LEN..2 * PAGE_LEN];
        let next = u32::from_le_bytes([page1[4], page1[5], page1[6], page1[7]]);
        assert_ne!(next, 0);
    }
}
