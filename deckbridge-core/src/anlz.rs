//! ANLZ analysis file generation (.DAT, .EXT, .2EX)
//!
//! Analysis files are big-endian tagged containers. The file opens with a
//! `PMAI` header whose length field is back-patched once every section is
//! in the buffer; each section is a four-byte tag, a header length, a
//! total length, and its payload. The database writer is little-endian;
//! nothing in this module may share byte helpers with it.

use tracing::debug;

use crate::track::{CueRecord, TrackRecord, Tier};
use crate::waveform;

/// Container header length.
const PMAI_HEADER_LEN: u32 = 28;

/// Section header: tag + header length + total length.
const SECTION_HEADER_LEN: u32 = 12;

/// Beat grid entries are clipped to this many beats.
const MAX_GRID_ENTRIES: usize = 1500;

/// Fixed PCPT cue entry length.
const PCPT_LEN: usize = 38;

fn write_be_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn write_be_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Wrap a payload in the common tag + lengths section header.
fn section(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.extend_from_slice(tag);
    write_be_u32(&mut out, SECTION_HEADER_LEN);
    write_be_u32(&mut out, SECTION_HEADER_LEN + payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

/// Assemble a container from finished sections, back-patching the file
/// length.
fn container(sections: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4096);
    out.extend_from_slice(b"PMAI");
    write_be_u32(&mut out, PMAI_HEADER_LEN);
    write_be_u32(&mut out, 0); // file length, patched below
    out.extend_from_slice(&[0u8; 16]);

    for s in sections {
        out.extend_from_slice(s);
    }

    let total = out.len() as u32;
    out[8..12].copy_from_slice(&total.to_be_bytes());
    out
}

/// `PPTH` path section: length-prefixed UTF-16BE path with trailing NUL.
fn ppth_section(path: &str) -> Vec<u8> {
    let mut body: Vec<u8> = path.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
    body.extend_from_slice(&[0, 0]);

    let mut payload = Vec::with_capacity(4 + body.len());
    write_be_u32(&mut payload, body.len() as u32);
    payload.extend_from_slice(&body);
    section(b"PPTH", &payload)
}

/// One beat of the quantized grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridBeat {
    /// Position within the bar, 1..=4.
    pub beat_number: u16,
    /// BPM x 100.
    pub tempo: u16,
    /// Milliseconds from track start.
    pub position_ms: u32,
}

/// Derive the beat lattice from the anchor: step `60000 / BPM`
/// milliseconds, wrapping the beat number 1-4, clipped to the track
/// duration or [`MAX_GRID_ENTRIES`].
pub fn beat_grid(bpm: f64, anchor_ms: u32, duration_ms: u32) -> Vec<GridBeat> {
    if bpm <= 0.0 {
        return Vec::new();
    }
    let step = 60_000.0 / bpm;
    if (duration_ms as f64) < step {
        // Shorter than one beat: no grid.
        return Vec::new();
    }

    let tempo = (bpm * 100.0).round() as u16;
    let mut beats = Vec::new();
    let mut position = anchor_ms as f64;
    let mut beat_number = 1u16;

    while position <= duration_ms as f64 && beats.len() < MAX_GRID_ENTRIES {
        beats.push(GridBeat {
            beat_number,
            tempo,
            position_ms: position.round() as u32,
        });
        position += step;
        beat_number = if beat_number == 4 { 1 } else { beat_number + 1 };
    }

    beats
}

/// `PQTZ` beat grid section.
fn pqtz_section(beats: &[GridBeat]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + beats.len() * 8);
    write_be_u32(&mut payload, 1);
    write_be_u32(&mut payload, 0x0080_0000);
    for beat in beats {
        write_be_u16(&mut payload, beat.beat_number);
        write_be_u16(&mut payload, beat.tempo);
        write_be_u32(&mut payload, beat.position_ms);
    }
    section(b"PQTZ", &payload)
}

/// `PWAV` preview waveform: flag word plus the fixed 400-byte payload.
fn pwav_section(columns: &[u8; waveform::PREVIEW_COLUMNS]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + columns.len());
    write_be_u32(&mut payload, 0x0010_0000);
    payload.extend_from_slice(columns);
    section(b"PWAV", &payload)
}

/// `PWV5` colour waveform for .EXT files.
fn pwv5_section(entries: &[[u8; 2]]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + entries.len() * 2);
    write_be_u32(&mut payload, entries.len() as u32);
    write_be_u32(&mut payload, 0);
    for entry in entries {
        payload.extend_from_slice(entry);
    }
    section(b"PWV5", &payload)
}

/// Cue bank selector inside `PCOB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CueBank {
    Memory = 0,
    Hot = 1,
}

/// One fixed-size `PCPT` cue entry.
///
/// Offsets within the entry:
/// - 0x0C u8 slot (0 = memory, 1..=8 = hot slot A..H)
/// - 0x0D u8 status (4 for the active loop, otherwise 0)
/// - 0x0E u16 order_first, 0x10 u16 order_last
/// - 0x12 u8 type (1 = point, 2 = loop)
/// - 0x16 u32 time ms, 0x1A u32 loop end ms (0xFFFFFFFF when not a loop)
fn pcpt_entry(cue: &CueRecord, index: usize, count: usize, status: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(PCPT_LEN);
    out.extend_from_slice(b"PCPT");
    write_be_u32(&mut out, SECTION_HEADER_LEN);
    write_be_u32(&mut out, PCPT_LEN as u32);

    out.push(if cue.is_hot() { cue.hot_slot as u8 + 1 } else { 0 });
    out.push(status);
    write_be_u16(&mut out, index as u16);
    write_be_u16(&mut out, count.saturating_sub(1) as u16);
    out.push(if cue.is_loop() { 2 } else { 1 });
    out.extend_from_slice(&[0u8; 3]);
    write_be_u32(&mut out, cue.start_ms);
    let loop_end = if cue.is_loop() {
        cue.start_ms + cue.length_ms
    } else {
        0xFFFF_FFFF
    };
    write_be_u32(&mut out, loop_end);
    out.extend_from_slice(&[0u8; 8]);

    debug_assert_eq!(out.len(), PCPT_LEN);
    out
}

/// Extended `PCP2` entry: the PCPT fields plus a UTF-16BE comment and four
/// colour bytes (palette index + RGB).
fn pcp2_entry(cue: &CueRecord, index: usize, count: usize, status: u8) -> Vec<u8> {
    let comment: Vec<u8> = cue.name.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
    let total = PCPT_LEN + 4 + comment.len() + 4;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(b"PCP2");
    write_be_u32(&mut out, SECTION_HEADER_LEN);
    write_be_u32(&mut out, total as u32);

    out.push(if cue.is_hot() { cue.hot_slot as u8 + 1 } else { 0 });
    out.push(status);
    write_be_u16(&mut out, index as u16);
    write_be_u16(&mut out, count.saturating_sub(1) as u16);
    out.push(if cue.is_loop() { 2 } else { 1 });
    out.extend_from_slice(&[0u8; 3]);
    write_be_u32(&mut out, cue.start_ms);
    let loop_end = if cue.is_loop() {
        cue.start_ms + cue.length_ms
    } else {
        0xFFFF_FFFF
    };
    write_be_u32(&mut out, loop_end);
    out.extend_from_slice(&[0u8; 8]);

    write_be_u32(&mut out, comment.len() as u32);
    out.extend_from_slice(&comment);
    let (r, g, b) = cue.colour.unwrap_or((0, 0, 0));
    out.extend_from_slice(&[0, r, g, b]);

    debug_assert_eq!(out.len(), total);
    out
}

/// `PCOB` cue bank: kind word, flag word, entry count, entries.
///
/// Only the first loop of a bank is flagged active (status 4); further
/// loops and every point cue carry status 0.
fn pcob_section(bank: CueBank, cues: &[&CueRecord], extended: bool) -> Vec<u8> {
    let mut payload = Vec::new();
    write_be_u32(&mut payload, bank as u32);
    write_be_u32(&mut payload, 0x0001_0000);
    write_be_u16(&mut payload, cues.len() as u16);

    let mut active_loop_seen = false;
    for (index, cue) in cues.iter().enumerate() {
        let status = if cue.is_loop() && !active_loop_seen {
            active_loop_seen = true;
            4
        } else {
            0
        };
        let entry = if extended {
            pcp2_entry(cue, index, cues.len(), status)
        } else {
            pcpt_entry(cue, index, cues.len(), status)
        };
        payload.extend_from_slice(&entry);
    }

    section(b"PCOB", &payload)
}

/// `PSSI` phrase-structure entry length.
const PSSI_ENTRY_LEN: usize = 24;

/// `PSSI` musical structure: one 24-byte entry per 32-beat phrase.
fn pssi_section(beats: &[GridBeat], duration_ms: u32) -> Vec<u8> {
    let phrase_starts: Vec<u32> = beats
        .iter()
        .step_by(32)
        .map(|b| b.position_ms)
        .collect();

    let mut payload = Vec::with_capacity(4 + phrase_starts.len() * PSSI_ENTRY_LEN);
    write_be_u32(&mut payload, phrase_starts.len() as u32);

    for (i, &start) in phrase_starts.iter().enumerate() {
        let end = phrase_starts.get(i + 1).copied().unwrap_or(duration_ms);
        let mut entry = Vec::with_capacity(PSSI_ENTRY_LEN);
        write_be_u16(&mut entry, (i + 1) as u16);
        write_be_u16(&mut entry, (i % 8 + 1) as u16); // phrase kind, cycling
        write_be_u32(&mut entry, start);
        write_be_u32(&mut entry, end);
        entry.push(0); // flags
        entry.extend_from_slice(&[0u8; 11]);
        debug_assert_eq!(entry.len(), PSSI_ENTRY_LEN);
        payload.extend_from_slice(&entry);
    }

    section(b"PSSI", &payload)
}

/// The cue banks present for a track: memory always when any memory cues
/// exist, hot when hot cues exist; an empty memory bank when the track
/// has no cues at all.
fn cue_sections(track: &TrackRecord, tier: Tier) -> Vec<Vec<u8>> {
    let extended = tier.extended_cues();
    let memory: Vec<&CueRecord> = track.memory_cues().collect();
    let hot = track.hot_cues(tier);

    let mut sections = Vec::new();
    if !memory.is_empty() || hot.is_empty() {
        sections.push(pcob_section(CueBank::Memory, &memory, extended));
    }
    if !hot.is_empty() {
        sections.push(pcob_section(CueBank::Hot, &hot, extended));
    }
    sections
}

/// Generate the `.DAT` analysis file: path, preview waveform, beat grid
/// and cue banks. A track shorter than one beat still gets a container,
/// just without a `PQTZ` section.
pub fn write_dat_file(track: &TrackRecord, tier: Tier) -> Vec<u8> {
    let duration_ms = track.duration_secs.saturating_mul(1000);
    let anchor = track.grid_anchor_ms.unwrap_or(0);
    let beats = beat_grid(track.bpm, anchor, duration_ms);

    let mut sections = vec![
        ppth_section(&track.file_path),
        pwav_section(&waveform::preview_waveform(&track.source_path)),
    ];
    if beats.is_empty() {
        debug!(track = track.id, "track too short for beat grid, skipping PQTZ");
    } else {
        sections.push(pqtz_section(&beats));
    }
    sections.extend(cue_sections(track, tier));

    container(&sections)
}

/// Generate the `.EXT` file: colour waveform for tier B and up.
pub fn write_ext_file(track: &TrackRecord) -> Vec<u8> {
    let entries = waveform::colour_waveform(&track.source_path);
    container(&[pwv5_section(&entries)])
}

/// Generate the `.2EX` file: phrase structure for the top tier.
pub fn write_2ex_file(track: &TrackRecord) -> Vec<u8> {
    let duration_ms = track.duration_secs.saturating_mul(1000);
    let anchor = track.grid_anchor_ms.unwrap_or(0);
    let beats = beat_grid(track.bpm, anchor, duration_ms);
    container(&[pssi_section(&beats, duration_ms)])
}

/// Analysis directory for a track's source path: the first four MD5 bytes
/// of the lowercased, slash-normalised path, read little-endian, printed
/// as eight upper-hex digits.
///
/// Returns a path of the form `PIONEER/USBANLZ/P<3hex>/<8hex>`.
pub fn analysis_dir_for(source_path: &str) -> String {
    let normalised = source_path.replace('\\', "/").to_lowercase();
    let digest = md5::compute(normalised.as_bytes());
    let hash = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let hex = format!("{:08X}", hash);
    format!("PIONEER/USBANLZ/P{}/{}", &hex[..3], hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::CueKind;

    fn test_track() -> TrackRecord {
        TrackRecord {
            id: 1,
            file_path: "/Contents/Track.mp3".to_string(),
            source_path: "/Music/Track.mp3".to_string(),
            duration_secs: 10,
            bpm: 120.0,
            grid_anchor_ms: Some(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_magic_and_length() {
        let data = write_dat_file(&test_track(), Tier::A);
        assert_eq!(&data[0..4], b"PMAI");
        let header_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        assert_eq!(header_len, 28);
        let file_len = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        assert_eq!(file_len as usize, data.len());
    }

    #[test]
    fn test_beat_grid_s4() {
        // 120 BPM, anchor 100 ms, 10 s duration: 20 entries.
        let beats = beat_grid(120.0, 100, 10_000);
        assert_eq!(beats.len(), 20);
        assert_eq!(beats[0], GridBeat { beat_number: 1, tempo: 12000, position_ms: 100 });
        assert_eq!(beats[4], GridBeat { beat_number: 1, tempo: 12000, position_ms: 2100 });
        assert!(beats.iter().all(|b| b.tempo == 12000));
    }

    #[test]
    fn test_beat_grid_wraps_bar() {
        let beats = beat_grid(120.0, 0, 3000);
        let numbers: Vec<u16> = beats.iter().map(|b| b.beat_number).collect();
        assert_eq!(&numbers[..5], &[1, 2, 3, 4, 1]);
    }

    #[test]
    fn test_beat_grid_clip() {
        let beats = beat_grid(200.0, 0, 10_000_000);
        assert_eq!(beats.len(), 1500);
    }

    #[test]
    fn test_too_short_for_grid() {
        // One beat at 120 BPM is 500 ms; a 300 ms track has no grid.
        assert!(beat_grid(120.0, 0, 300).is_empty());
        let mut track = test_track();
        track.duration_secs = 0;
        let data = write_dat_file(&track, Tier::A);
        assert_eq!(&data[0..4], b"PMAI");
        assert!(!contains_tag(&data, b"PQTZ"));
    }

    #[test]
    fn test_sections_present() {
        let data = write_dat_file(&test_track(), Tier::A);
        assert!(contains_tag(&data, b"PPTH"));
        assert!(contains_tag(&data, b"PWAV"));
        assert!(contains_tag(&data, b"PQTZ"));
        assert!(contains_tag(&data, b"PCOB"));
    }

    #[test]
    fn test_cue_banks_split() {
        let mut track = test_track();
        track.cues = vec![
            CueRecord {
                kind: CueKind::Memory,
                start_ms: 1000,
                hot_slot: -1,
                ..Default::default()
            },
            CueRecord {
                kind: CueKind::Cue,
                start_ms: 2000,
                hot_slot: 0,
                ..Default::default()
            },
        ];
        let data = write_dat_file(&track, Tier::B);
        assert_eq!(count_tag(&data, b"PCOB"), 2);
        // Tier B uses extended entries.
        assert!(contains_tag(&data, b"PCP2"));
        assert!(!contains_tag(&data, b"PCPT"));
    }

    #[test]
    fn test_active_loop_status() {
        let cue_loop = CueRecord {
            kind: CueKind::Loop,
            start_ms: 1000,
            length_ms: 500,
            hot_slot: -1,
            ..Default::default()
        };
        let entry = pcpt_entry(&cue_loop, 0, 1, 4);
        assert_eq!(entry[0x0D], 4);
        assert_eq!(entry[0x12], 2);
        let end = u32::from_be_bytes([entry[0x1A], entry[0x1B], entry[0x1C], entry[0x1D]]);
        assert_eq!(end, 1500);

        let cue_point = CueRecord {
            start_ms: 700,
            hot_slot: 3,
            ..Default::default()
        };
        let entry = pcpt_entry(&cue_point, 0, 1, 0);
        assert_eq!(entry[0x0C], 4); // slot 3 stored as 4
        assert_eq!(entry[0x0D], 0);
        let end = u32::from_be_bytes([entry[0x1A], entry[0x1B], entry[0x1C], entry[0x1D]]);
        assert_eq!(end, 0xFFFF_FFFF);
    }

    #[test]
    fn test_analysis_dir_deterministic() {
        let a = analysis_dir_for("/Music/Track.mp3");
        let b = analysis_dir_for("/music/track.MP3".to_lowercase().as_str());
        assert_eq!(a, b);
        assert!(a.starts_with("PIONEER/USBANLZ/P"));
        // P folder holds the first three digits of the full hash.
        let parts: Vec<&str> = a.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(&parts[2][1..], &parts[3][..3]);
        assert_eq!(parts[3].len(), 8);
    }

    #[test]
    fn test_backslash_normalisation() {
        assert_eq!(
            analysis_dir_for("C:\\Music\\Track.mp3"),
            analysis_dir_for("c:/music/track.mp3")
        );
    }

    #[test]
    fn test_ext_and_2ex() {
        let track = test_track();
        let ext = write_ext_file(&track);
        assert_eq!(&ext[0..4], b"PMAI");
        assert!(contains_tag(&ext, b"PWV5"));

        let two_ex = write_2ex_file(&track);
        assert!(contains_tag(&two_ex, b"PSSI"));
    }

    fn contains_tag(data: &[u8], tag: &[u8; 4]) -> bool {
        count_tag(data, tag) > 0
    }

    fn count_tag(data: &[u8], tag: &[u8; 4]) -> usize {
        data.windows(4).filter(|w| w == tag).count()
    }
}
