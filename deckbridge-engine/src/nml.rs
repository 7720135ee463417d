//! Traktor NML collection parser
//!
//! Streaming and tolerant: the document is pulled through a cleaning
//! reader (encoding detection, control-character stripping, stray-`&`
//! repair) into a pull parser, so the full file is never held in memory.
//! A malformed entry is dropped with a warning; the document survives.
//!
//! Supports NML versions 19 (Traktor Pro 3.x) and 20 (Traktor Pro 4.x).
//! Version 20 adds smartlist query elements, per-cue colour attributes and
//! embedded grid tempos inside beatgrid-anchor cues.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;

use encoding_rs::{Decoder, Encoding, UTF_8};
use percent_encoding::percent_decode_str;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::index::FilenameIndex;
use crate::model::{
    fingerprint_for_path, rating_from_ranking, Collection, CueKind, CuePoint, Node, NodeKind,
    Track, Tree,
};
use crate::progress::ProgressSink;

/// Bytes examined for encoding detection.
const DETECT_WINDOW: usize = 8192;

/// Encoding-detector confidence below this falls back to UTF-8.
const DETECT_CONFIDENCE: f32 = 0.7;

/// Progress event cadence, in collection entries.
const PROGRESS_EVERY: usize = 500;

/// Consecutive reader errors tolerated before the document is declared
/// unparseable.
const MAX_CONSECUTIVE_ERRORS: usize = 64;

/// Parser options.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Music root used to repair relocated file paths.
    pub music_root: Option<PathBuf>,
}

/// Known source format versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceVersion {
    V19,
    V20,
}

/// Parse an NML collection file into the in-memory model.
pub fn parse_collection(
    path: &Path,
    options: &ParseOptions,
    progress: Option<&ProgressSink>,
) -> Result<Collection> {
    let started = Instant::now();

    let file = File::open(path)
        .map_err(|e| Error::SourceUnreadable(format!("{}: {}", path.display(), e)))?;

    let mut head = vec![0u8; DETECT_WINDOW];
    let mut reader = BufReader::new(file);
    let head_len = fill_head(&mut reader, &mut head)
        .map_err(|e| Error::SourceUnreadable(format!("{}: {}", path.display(), e)))?;
    head.truncate(head_len);

    // Re-open so the cleaning reader sees the file from the top.
    let file = File::open(path)
        .map_err(|e| Error::SourceUnreadable(format!("{}: {}", path.display(), e)))?;

    let mut issues = Vec::new();
    let encoding = match detect_encoding(&head) {
        (enc, None) => enc,
        (enc, Some(note)) => {
            issues.push(note);
            enc
        }
    };
    debug!(encoding = encoding.name(), "source encoding selected");

    let clean = CleaningReader::new(BufReader::new(file), encoding);
    let mut collection = parse_stream(BufReader::new(clean), progress)?;
    collection.issues.extend(issues);

    if let Some(root) = &options.music_root {
        repair_paths(&mut collection, root, progress);
    }

    collection.stats.parse_millis = started.elapsed().as_millis() as u64;
    info!(
        tracks = collection.tracks.len(),
        version = %collection.stats.version,
        millis = collection.stats.parse_millis,
        "collection parsed"
    );
    Ok(collection)
}

fn fill_head(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// BOM first, statistical detection second, UTF-8 when unsure.
fn detect_encoding(head: &[u8]) -> (&'static Encoding, Option<String>) {
    if let Some((enc, _)) = Encoding::for_bom(head) {
        return (enc, None);
    }

    let (charset, confidence, _) = chardet::detect(head);
    if confidence >= DETECT_CONFIDENCE {
        if let Some(enc) = Encoding::for_label(chardet::charset2encoding(&charset).as_bytes()) {
            return (enc, None);
        }
    }
    (
        UTF_8,
        Some(format!(
            "encoding undetermined (detector said {:?} at {:.2}), assuming UTF-8",
            charset, confidence
        )),
    )
}

/// Streaming pre-cleaner: decodes the source encoding to UTF-8, strips
/// the control characters XML 1.0 forbids, and escapes `&` where no valid
/// entity follows.
struct CleaningReader<R: Read> {
    inner: R,
    decoder: Decoder,
    /// Decoded but not yet cleaned text (may end in an ambiguous `&`).
    pending: String,
    /// Cleaned bytes ready to serve.
    out: Vec<u8>,
    out_pos: usize,
    inner_done: bool,
}

impl<R: Read> CleaningReader<R> {
    fn new(inner: R, encoding: &'static Encoding) -> Self {
        Self {
            inner,
            decoder: encoding.new_decoder(),
            pending: String::new(),
            out: Vec::new(),
            out_pos: 0,
            inner_done: false,
        }
    }

    fn refill(&mut self) -> std::io::Result<()> {
        let mut raw = [0u8; 4096];
        while self.out_pos >= self.out.len() && !(self.inner_done && self.pending.is_empty()) {
            self.out.clear();
            self.out_pos = 0;

            if !self.inner_done {
                let n = self.inner.read(&mut raw)?;
                if n == 0 {
                    self.inner_done = true;
                }
                // decode_to_string fills only the available capacity, so
                // reserve the worst case up front.
                let capacity = self
                    .decoder
                    .max_utf8_buffer_length(n)
                    .unwrap_or(n * 4 + 16);
                let mut decoded = String::with_capacity(capacity);
                let _ = self
                    .decoder
                    .decode_to_string(&raw[..n], &mut decoded, self.inner_done);
                self.pending.push_str(&decoded);
            }

            let (cleaned, tail) = clean_fragment(&self.pending, self.inner_done);
            self.pending = tail;
            self.out.extend_from_slice(cleaned.as_bytes());
        }
        Ok(())
    }
}

impl<R: Read> Read for CleaningReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.refill()?;
        let available = &self.out[self.out_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.out_pos += n;
        Ok(n)
    }
}

/// Clean as much of `input` as is safe, returning the cleaned text plus a
/// retained tail (an ambiguous trailing `&entity` candidate when more
/// input is coming).
fn clean_fragment(input: &str, is_last: bool) -> (String, String) {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < input.len() {
        let c = bytes[i];
        if c == b'&' {
            // Keep the fragment's tail for the next round: the entity may
            // continue in the next chunk.
            if !is_last && input.len() - i <= 12 {
                return (out, input[i..].to_string());
            }
            if entity_len(&input[i..]).is_some() {
                out.push('&');
            } else {
                out.push_str("&amp;");
            }
            i += 1;
        } else if is_forbidden_control(c) {
            i += 1;
        } else if c < 0x80 {
            out.push(c as char);
            i += 1;
        } else {
            let ch = input[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }

    (out, String::new())
}

fn is_forbidden_control(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F | 0x7F)
}

/// Length of a valid entity starting at `&`, or None.
fn entity_len(s: &str) -> Option<usize> {
    let rest = s.strip_prefix('&')?;
    let semi = rest.find(';').filter(|&p| p <= 10)?;
    let name = &rest[..semi];
    let valid = matches!(name, "amp" | "lt" | "gt" | "quot" | "apos")
        || (name.starts_with("#x") && name.len() > 2
            && name[2..].chars().all(|c| c.is_ascii_hexdigit()))
        || (name.starts_with('#') && !name.starts_with("#x") && name.len() > 1
            && name[1..].chars().all(|c| c.is_ascii_digit()));
    valid.then_some(semi + 2)
}

/// Attribute map of a start tag. Broken attribute syntax degrades to the
/// attributes that did parse.
fn attrs(e: &BytesStart) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for attr in e.attributes().with_checks(false).flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
        map.insert(key, value);
    }
    map
}

fn get<'m>(map: &'m HashMap<String, String>, key: &str) -> &'m str {
    map.get(key).map(String::as_str).unwrap_or("")
}

fn parse_f64(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

fn parse_u32(s: &str) -> u32 {
    s.trim().parse().unwrap_or(0)
}

fn parse_i32(s: &str) -> i32 {
    s.trim().parse().unwrap_or(0)
}

fn parse_date(s: &str) -> Option<chrono::NaiveDate> {
    if s.is_empty() {
        return None;
    }
    chrono::NaiveDate::parse_from_str(s, "%Y/%m/%d")
        .or_else(|_| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}

/// Parse a cue colour attribute: `#RRGGBB` or a packed decimal.
fn parse_colour(s: &str) -> Option<(u8, u8, u8)> {
    if s.is_empty() {
        return None;
    }
    let packed = if let Some(hex) = s.strip_prefix('#') {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        s.parse().ok()?
    };
    Some((
        ((packed >> 16) & 0xFF) as u8,
        ((packed >> 8) & 0xFF) as u8,
        (packed & 0xFF) as u8,
    ))
}

/// A track under construction while its entry subtree streams past.
#[derive(Default)]
struct EntryBuilder {
    track: Track,
    raw_key_index: String,
    location_key: String,
}

/// Where the cursor is while walking the document.
#[derive(Debug, PartialEq)]
enum Scope {
    Prelude,
    Collection,
    Playlists,
    Done,
}

struct TreeFrame {
    node_id: usize,
}

fn parse_stream(reader: impl BufRead, progress: Option<&ProgressSink>) -> Result<Collection> {
    let mut xml = Reader::from_reader(reader);
    let config = xml.config_mut();
    config.check_end_names = false;
    config.trim_text_start = true;
    config.trim_text_end = true;

    let mut collection = Collection::default();
    let mut version = SourceVersion::V19;
    let mut advisory_entries = 0usize;

    let mut scope = Scope::Prelude;
    let mut entry: Option<EntryBuilder> = None;
    let mut in_cue: Option<CuePoint> = None;
    let mut entry_count = 0usize;
    let mut dropped = 0usize;
    let mut consecutive_errors = 0usize;

    // Collection key (volume + dir + file) to fingerprint, for resolving
    // playlist references afterwards.
    let mut key_to_fingerprint: HashMap<String, String> = HashMap::new();

    // Playlist-tree state.
    let mut tree = Tree::default();
    let mut frames: Vec<TreeFrame> = Vec::new();
    let mut pending_raw_keys: HashMap<usize, Vec<String>> = HashMap::new();

    let mut buf = Vec::new();
    loop {
        let event = match xml.read_event_into(&mut buf) {
            Ok(ev) => {
                consecutive_errors = 0;
                ev
            }
            Err(e) => {
                consecutive_errors += 1;
                if let Some(builder) = entry.take() {
                    dropped += 1;
                    collection.issues.push(format!(
                        "dropped malformed entry near {:?}: {}",
                        builder.track.title, e
                    ));
                    in_cue = None;
                }
                if consecutive_errors > MAX_CONSECUTIVE_ERRORS {
                    if collection.tracks.is_empty() {
                        return Err(Error::SourceUnparseable(e.to_string()));
                    }
                    collection
                        .issues
                        .push(format!("parse aborted after repeated errors: {}", e));
                    break;
                }
                buf.clear();
                continue;
            }
        };

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = e.name().as_ref().to_ascii_uppercase();
                let map = attrs(e);

                match name.as_slice() {
                    b"NML" => {
                        let v = get(&map, "VERSION");
                        collection.stats.version = v.to_string();
                        if v == "20" {
                            version = SourceVersion::V20;
                        }
                    }
                    b"HEAD" => {
                        // Newer writers do not always bump the version
                        // attribute; the program name is more reliable.
                        if get(&map, "PROGRAM").contains("Pro 4") {
                            version = SourceVersion::V20;
                        }
                    }
                    b"STEMS" => {
                        // Stems only exist in the newer format.
                        version = SourceVersion::V20;
                    }
                    b"COLLECTION" => {
                        scope = Scope::Collection;
                        // Advisory only; never trusted for allocation.
                        advisory_entries = parse_u32(get(&map, "ENTRIES")) as usize;
                    }
                    b"PLAYLISTS" => scope = Scope::Playlists,
                    b"ENTRY" if scope == Scope::Collection => {
                        let mut builder = EntryBuilder::default();
                        builder.track.title = get(&map, "TITLE").to_string();
                        builder.track.artist = get(&map, "ARTIST").to_string();
                        builder.track.remixer = get(&map, "REMIXER").to_string();
                        builder.track.fingerprint = get(&map, "AUDIO_ID").to_string();
                        builder.track.date_modified =
                            parse_date(get(&map, "MODIFICATION_DATE"));
                        if is_empty {
                            // Attribute-only entry: finish immediately.
                            finish_entry(
                                builder,
                                &mut collection,
                                &mut key_to_fingerprint,
                                &mut dropped,
                            );
                            entry_count += 1;
                            report_entry_progress(progress, entry_count, advisory_entries);
                        } else {
                            entry = Some(builder);
                        }
                    }
                    b"LOCATION" => {
                        if let Some(builder) = entry.as_mut() {
                            let volume = get(&map, "VOLUME");
                            let dir = get(&map, "DIR");
                            let file = get(&map, "FILE");
                            builder.location_key = format!("{volume}{dir}{file}");
                            builder.track.volume = volume.to_string();
                            builder.track.file_path = reconstruct_path(volume, dir, file);
                        }
                    }
                    b"ALBUM" => {
                        if let Some(builder) = entry.as_mut() {
                            builder.track.album = get(&map, "TITLE").to_string();
                        }
                    }
                    b"INFO" => {
                        if let Some(builder) = entry.as_mut() {
                            let t = &mut builder.track;
                            t.bitrate = parse_u32(get(&map, "BITRATE")) / 1000;
                            t.file_size = parse_u32(get(&map, "FILESIZE")) as u64;
                            t.duration_float = parse_f64(get(&map, "PLAYTIME_FLOAT"));
                            t.duration_secs = parse_u32(get(&map, "PLAYTIME"));
                            if t.duration_secs == 0 && t.duration_float > 0.0 {
                                t.duration_secs = t.duration_float.round() as u32;
                            }
                            t.rating = rating_from_ranking(parse_u32(get(&map, "RANKING")));
                            t.genre = get(&map, "GENRE").to_string();
                            t.comment = get(&map, "COMMENT").to_string();
                            t.label = get(&map, "LABEL").to_string();
                            t.colour = parse_u32(get(&map, "COLOR")).min(7) as u8;
                            t.play_count = parse_u32(get(&map, "PLAYCOUNT"));
                            t.date_added = parse_date(get(&map, "IMPORT_DATE"));
                            t.last_played = parse_date(get(&map, "LAST_PLAYED"));
                            t.key_text = get(&map, "KEY").to_string();
                        }
                    }
                    b"TEMPO" => {
                        if let Some(builder) = entry.as_mut() {
                            builder.track.bpm = parse_f64(get(&map, "BPM"));
                        }
                    }
                    b"MUSICAL_KEY" => {
                        if let Some(builder) = entry.as_mut() {
                            builder.raw_key_index = get(&map, "VALUE").to_string();
                        }
                    }
                    b"CUE_V2" => {
                        if let Some(builder) = entry.as_mut() {
                            let start_ms = parse_f64(get(&map, "START")).max(0.0).round() as u32;
                            let cue_type = parse_i32(get(&map, "TYPE"));
                            let hot_slot = parse_i32(get(&map, "HOTCUE")).clamp(-1, 7) as i8;
                            let kind = cue_kind_for(cue_type, hot_slot);

                            if kind == CueKind::GridAnchor
                                && builder.track.grid_anchor_ms.is_none()
                            {
                                builder.track.grid_anchor_ms = Some(start_ms);
                            }

                            let colour = if version == SourceVersion::V20 {
                                parse_colour(get(&map, "COLOR"))
                            } else {
                                None
                            };

                            let cue = CuePoint {
                                name: get(&map, "NAME").to_string(),
                                kind,
                                start_ms,
                                length_ms: parse_f64(get(&map, "LEN")).max(0.0).round() as u32,
                                hot_slot,
                                colour,
                                display_order: builder.track.cues.len() as u32,
                            };
                            if is_empty {
                                builder.track.cues.push(cue);
                            } else {
                                in_cue = Some(cue);
                            }
                        }
                    }
                    b"GRID" => {
                        // Per-segment tempo inside a beatgrid-anchor cue;
                        // promoted when the track itself has no BPM.
                        if version == SourceVersion::V20 {
                            if let Some(builder) = entry.as_mut() {
                                let grid_bpm = parse_f64(get(&map, "BPM"));
                                if builder.track.bpm == 0.0 && grid_bpm > 0.0 {
                                    builder.track.bpm = grid_bpm;
                                }
                            }
                        }
                    }
                    b"NODE" if scope == Scope::Playlists => {
                        let kind = match get(&map, "TYPE") {
                            "FOLDER" => NodeKind::Folder,
                            "PLAYLIST" => NodeKind::Playlist,
                            "SMARTLIST" => {
                                // Smart playlists outrank a stale version
                                // attribute.
                                version = SourceVersion::V20;
                                NodeKind::Smartlist
                            }
                            other => {
                                debug!(node_type = other, "skipping unknown node type");
                                NodeKind::Folder
                            }
                        };
                        let node_id = tree.push(Node::new(kind, get(&map, "NAME")));
                        if let Some(parent) = frames.last() {
                            tree.nodes[parent.node_id].children.push(node_id);
                        } else {
                            tree.roots.push(node_id);
                        }
                        frames.push(TreeFrame { node_id });
                        if is_empty {
                            frames.pop();
                        }
                    }
                    b"PLAYLIST" => {
                        if let Some(frame) = frames.last() {
                            let uuid = get(&map, "UUID");
                            if !uuid.is_empty() {
                                tree.nodes[frame.node_id].uuid = uuid.to_string();
                            }
                        }
                    }
                    b"SMARTLIST" => {
                        if let Some(frame) = frames.last() {
                            let uuid = get(&map, "UUID");
                            if !uuid.is_empty() {
                                tree.nodes[frame.node_id].uuid = uuid.to_string();
                            }
                        }
                    }
                    b"SEARCH_EXPRESSION" => {
                        if version == SourceVersion::V20 {
                            if let Some(frame) = frames.last() {
                                tree.nodes[frame.node_id].query =
                                    get(&map, "QUERY").to_string();
                            }
                        }
                    }
                    b"PRIMARYKEY" => {
                        if let Some(frame) = frames.last() {
                            let key = get(&map, "KEY");
                            if !key.is_empty() {
                                pending_raw_keys
                                    .entry(frame.node_id)
                                    .or_default()
                                    .push(key.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => {
                let name = e.name().as_ref().to_ascii_uppercase();
                match name.as_slice() {
                    b"ENTRY" if scope == Scope::Collection => {
                        if let Some(builder) = entry.take() {
                            finish_entry(
                                builder,
                                &mut collection,
                                &mut key_to_fingerprint,
                                &mut dropped,
                            );
                            entry_count += 1;
                            report_entry_progress(progress, entry_count, advisory_entries);
                        }
                    }
                    b"CUE_V2" => {
                        if let (Some(builder), Some(cue)) = (entry.as_mut(), in_cue.take()) {
                            builder.track.cues.push(cue);
                        }
                    }
                    b"COLLECTION" => scope = Scope::Prelude,
                    b"PLAYLISTS" => scope = Scope::Done,
                    b"NODE" => {
                        frames.pop();
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    // A $ROOT wrapper folder is scaffolding, not content.
    if tree.roots.len() == 1 {
        let root = tree.roots[0];
        if tree.nodes[root].kind == NodeKind::Folder && tree.nodes[root].name == "$ROOT" {
            tree.roots = tree.nodes[root].children.clone();
        }
    }

    resolve_playlists(&mut tree, &pending_raw_keys, &key_to_fingerprint, &mut collection.issues);

    collection.stats.entry_count = collection.tracks.len();
    collection.tree = tree;
    if dropped > 0 {
        warn!(dropped, "entries dropped during parse");
    }
    Ok(collection)
}

fn report_entry_progress(progress: Option<&ProgressSink>, count: usize, advisory: usize) {
    if count % PROGRESS_EVERY != 0 {
        return;
    }
    if let Some(sink) = progress {
        // Indexing occupies the 50-90 band of the overall conversion.
        let percent = if advisory > 0 {
            50 + ((count.min(advisory) * 40) / advisory) as u8
        } else {
            50
        };
        sink.send(percent, format!("Indexing: {} entries", count));
    }
}

fn cue_kind_for(cue_type: i32, hot_slot: i8) -> CueKind {
    match cue_type {
        1 => CueKind::FadeIn,
        2 => CueKind::FadeOut,
        4 => CueKind::GridAnchor,
        5 => CueKind::Loop,
        // Plain cues and load markers; slotless ones are memory cues.
        _ => {
            if hot_slot < 0 {
                CueKind::Memory
            } else {
                CueKind::Cue
            }
        }
    }
}

/// Rebuild an absolute path from the location triple. The source writes
/// directories with `/:` separators and percent-encodes names.
fn reconstruct_path(volume: &str, dir: &str, file: &str) -> String {
    let joined = format!("{}{}{}", volume, dir.replace("/:", "/"), file);
    let mut path = percent_decode_str(&joined)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or(joined);

    for prefix in ["file://localhost/", "file:///", "file://"] {
        if let Some(stripped) = path.strip_prefix(prefix) {
            path = stripped.to_string();
            break;
        }
    }

    // "/C:/..." from URL form becomes "C:/...".
    let bytes = path.as_bytes();
    if bytes.len() > 2 && bytes[0] == b'/' && bytes[2] == b':' {
        path.remove(0);
    }
    path
}

fn finish_entry(
    mut builder: EntryBuilder,
    collection: &mut Collection,
    key_to_fingerprint: &mut HashMap<String, String>,
    dropped: &mut usize,
) {
    let track = &mut builder.track;

    // The dedicated key element wins; the free-text attribute is only a
    // fallback and only when it holds a plain index.
    if !builder.raw_key_index.is_empty() {
        if let Ok(idx) = builder.raw_key_index.parse::<u32>() {
            if idx < 24 {
                track.key_index = Some(idx);
            }
        }
    }
    if track.key_index.is_none() && !track.key_text.is_empty() {
        if let Ok(idx) = track.key_text.parse::<u32>() {
            if idx < 24 {
                track.key_index = Some(idx);
            }
        }
    }

    if track.fingerprint.is_empty() {
        if track.file_path.is_empty() {
            *dropped += 1;
            collection
                .issues
                .push(format!("dropped entry with no id and no location: {:?}", track.title));
            return;
        }
        track.fingerprint = fingerprint_for_path(&track.file_path);
    }

    if !builder.location_key.is_empty() {
        key_to_fingerprint.insert(builder.location_key.clone(), track.fingerprint.clone());
    }

    collection
        .tracks
        .insert(track.fingerprint.clone(), builder.track);
}

/// Resolve playlist raw keys to fingerprints; unresolved references are
/// dropped with a warning and an entry-less playlist is flagged.
fn resolve_playlists(
    tree: &mut Tree,
    pending: &HashMap<usize, Vec<String>>,
    key_to_fingerprint: &HashMap<String, String>,
    issues: &mut Vec<String>,
) {
    for (&node_id, raw_keys) in pending {
        let mut resolved = Vec::with_capacity(raw_keys.len());
        let mut missing = 0usize;
        for key in raw_keys {
            match key_to_fingerprint.get(key) {
                Some(fp) => resolved.push(fp.clone()),
                None => missing += 1,
            }
        }
        if missing > 0 {
            issues.push(format!(
                "playlist {:?}: {} unresolved track reference(s) dropped",
                tree.nodes[node_id].name, missing
            ));
        }
        if resolved.is_empty() && !raw_keys.is_empty() {
            issues.push(format!(
                "playlist {:?} has no resolvable entries",
                tree.nodes[node_id].name
            ));
        }
        tree.nodes[node_id].tracks = resolved;
    }
}

/// Overwrite missing file paths from the filename index. The index is
/// built on the first missing track, not before.
fn repair_paths(collection: &mut Collection, music_root: &Path, progress: Option<&ProgressSink>) {
    let mut index: Option<FilenameIndex> = None;
    let mut repaired = 0usize;

    for track in collection.tracks.values_mut() {
        if track.file_path.is_empty() || Path::new(&track.file_path).exists() {
            continue;
        }

        if index.is_none() {
            match FilenameIndex::build(music_root, progress) {
                Ok(built) => index = Some(built),
                Err(e) => {
                    collection
                        .issues
                        .push(format!("path repair disabled: {}", e));
                    return;
                }
            }
        }
        let Some(index) = index.as_mut() else { return };

        let basename = Path::new(&track.file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");
        if basename.is_empty() {
            continue;
        }

        if let Some(found) = index.get(basename) {
            debug!(from = %track.file_path, to = %found.display(), "path repaired");
            track.file_path = found.to_string_lossy().into_owned();
            repaired += 1;
        }
    }

    if repaired > 0 {
        info!(repaired, "file paths repaired from music root");
    }
}
