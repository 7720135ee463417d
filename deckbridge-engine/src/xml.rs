//! Interchange XML (rekordbox collection format)
//!
//! Writes the DJ_PLAYLISTS document other software imports: full track
//! attribute set, TEMPO child, POSITION_MARK cues with three-decimal
//! second positions, file-URL locations, and the recursive node tree.
//! Also reads the same format back into the collection model, which is
//! how emit-then-reparse fidelity is tested.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::info;

use deckbridge_core::keys::{KeyFormat, KeyTranslator};

use crate::error::{Error, Result};
use crate::model::{
    fingerprint_for_path, file_kind_for, Collection, CueKind, CuePoint, Node, NodeKind, Track,
    Tree,
};

/// Percent-encoding set matching URL path-segment quoting: everything but
/// unreserved characters.
const URL_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Key notation used for the `Tonality` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyNotation {
    #[default]
    OpenKey,
    Classical,
    FlatClassical,
}

impl From<KeyNotation> for KeyFormat {
    fn from(n: KeyNotation) -> Self {
        match n {
            KeyNotation::OpenKey => KeyFormat::OpenKey,
            KeyNotation::Classical => KeyFormat::Classical,
            KeyNotation::FlatClassical => KeyFormat::FlatClassical,
        }
    }
}

/// Write the interchange XML for `tracks` (in export order) and the
/// selected subtree roots.
pub fn write_interchange(
    output: &Path,
    tracks: &[&Track],
    tree: &Tree,
    roots: &[usize],
    notation: KeyNotation,
) -> Result<()> {
    let file = File::create(output).map_err(|e| Error::WriteFailed(e.to_string()))?;
    // UTF-8, no BOM.
    let mut writer = Writer::new_with_indent(BufWriter::new(file), b' ', 2);
    let translator = KeyTranslator::new();

    let ids: HashMap<&str, u32> = tracks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.fingerprint.as_str(), i as u32 + 1))
        .collect();

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(write_err)?;

    let mut root = BytesStart::new("DJ_PLAYLISTS");
    root.push_attribute(("Version", "1.0.0"));
    writer.write_event(Event::Start(root)).map_err(write_err)?;

    let mut product = BytesStart::new("PRODUCT");
    product.push_attribute(("Name", "rekordbox"));
    product.push_attribute(("Version", "6.8.5"));
    product.push_attribute(("Company", "Pioneer DJ"));
    writer.write_event(Event::Empty(product)).map_err(write_err)?;

    let mut coll = BytesStart::new("COLLECTION");
    coll.push_attribute(("Entries", tracks.len().to_string().as_str()));
    writer.write_event(Event::Start(coll)).map_err(write_err)?;

    for track in tracks {
        write_track(&mut writer, track, ids[track.fingerprint.as_str()], notation, &translator)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("COLLECTION")))
        .map_err(write_err)?;

    writer
        .write_event(Event::Start(BytesStart::new("PLAYLISTS")))
        .map_err(write_err)?;

    let mut root_node = BytesStart::new("NODE");
    root_node.push_attribute(("Type", "0"));
    root_node.push_attribute(("Name", "ROOT"));
    root_node.push_attribute(("Count", roots.len().to_string().as_str()));
    writer.write_event(Event::Start(root_node)).map_err(write_err)?;

    for &node_id in roots {
        write_node(&mut writer, tree, node_id, &ids)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("NODE")))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("PLAYLISTS")))
        .map_err(write_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("DJ_PLAYLISTS")))
        .map_err(write_err)?;

    info!(tracks = tracks.len(), "interchange XML written to {}", output.display());
    Ok(())
}

fn write_err(e: impl std::fmt::Display) -> Error {
    Error::WriteFailed(e.to_string())
}

fn write_track<W: std::io::Write>(
    writer: &mut Writer<W>,
    track: &Track,
    id: u32,
    notation: KeyNotation,
    translator: &KeyTranslator,
) -> Result<()> {
    let tonality = track
        .key_index
        .and_then(|idx| translator.to(idx, notation.into()).ok())
        .unwrap_or("");

    let mut e = BytesStart::new("TRACK");
    e.push_attribute(("TrackID", id.to_string().as_str()));
    e.push_attribute(("Name", track.title.as_str()));
    e.push_attribute(("Artist", track.artist.as_str()));
    e.push_attribute(("Composer", ""));
    e.push_attribute(("Album", track.album.as_str()));
    e.push_attribute(("Grouping", ""));
    e.push_attribute(("Genre", track.genre.as_str()));
    e.push_attribute(("Kind", file_kind_for(&track.file_path)));
    e.push_attribute(("Size", track.file_size.to_string().as_str()));
    e.push_attribute(("TotalTime", track.duration_secs.to_string().as_str()));
    e.push_attribute(("DiscNumber", "0"));
    e.push_attribute(("TrackNumber", "1"));
    e.push_attribute(("Year", year_attr(track).as_str()));
    e.push_attribute(("AverageBpm", format!("{:.2}", track.bpm).as_str()));
    e.push_attribute(("DateAdded", date_attr(track).as_str()));
    e.push_attribute(("BitRate", track.bitrate.to_string().as_str()));
    e.push_attribute(("SampleRate", sample_rate_attr(track).as_str()));
    e.push_attribute(("Comments", track.comment.as_str()));
    e.push_attribute(("PlayCount", track.play_count.to_string().as_str()));
    // 0..5 scale on purpose; that is what interoperating software reads.
    e.push_attribute(("Rating", track.rating.to_string().as_str()));
    e.push_attribute(("Location", file_url(&track.file_path).as_str()));
    e.push_attribute(("Remixer", track.remixer.as_str()));
    e.push_attribute(("Tonality", tonality));
    e.push_attribute(("Label", track.label.as_str()));
    e.push_attribute(("Mix", ""));
    writer.write_event(Event::Start(e)).map_err(write_err)?;

    let mut tempo = BytesStart::new("TEMPO");
    tempo.push_attribute(("Inizio", "0.000"));
    tempo.push_attribute(("Bpm", format!("{:.2}", track.bpm).as_str()));
    tempo.push_attribute(("Metro", "4/4"));
    tempo.push_attribute(("Battito", "1"));
    writer.write_event(Event::Empty(tempo)).map_err(write_err)?;

    for cue in &track.cues {
        // Grid anchors are beat-grid data, not cues, in this format.
        if cue.kind == CueKind::GridAnchor {
            continue;
        }
        let mut mark = BytesStart::new("POSITION_MARK");
        mark.push_attribute(("Name", cue.name.as_str()));
        let is_loop = cue.length_ms > 0;
        mark.push_attribute(("Type", if is_loop { "4" } else { "0" }));
        mark.push_attribute(("Start", format!("{:.3}", cue.start_ms as f64 / 1000.0).as_str()));
        if is_loop {
            let end = (cue.start_ms + cue.length_ms) as f64 / 1000.0;
            mark.push_attribute(("End", format!("{:.3}", end).as_str()));
        }
        mark.push_attribute(("Num", cue.hot_slot.to_string().as_str()));
        if let Some((r, g, b)) = cue.colour {
            mark.push_attribute(("Red", r.to_string().as_str()));
            mark.push_attribute(("Green", g.to_string().as_str()));
            mark.push_attribute(("Blue", b.to_string().as_str()));
        }
        writer.write_event(Event::Empty(mark)).map_err(write_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("TRACK")))
        .map_err(write_err)
}

fn year_attr(track: &Track) -> String {
    track
        .date_added
        .map(|d| chrono::Datelike::year(&d).to_string())
        .unwrap_or_default()
}

fn date_attr(track: &Track) -> String {
    track
        .date_added
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn sample_rate_attr(track: &Track) -> String {
    if track.sample_rate == 0 {
        "44100".to_string()
    } else {
        track.sample_rate.to_string()
    }
}

fn write_node<W: std::io::Write>(
    writer: &mut Writer<W>,
    tree: &Tree,
    node_id: usize,
    ids: &HashMap<&str, u32>,
) -> Result<()> {
    let node = &tree.nodes[node_id];
    match node.kind {
        NodeKind::Folder => {
            let mut e = BytesStart::new("NODE");
            e.push_attribute(("Type", "0"));
            e.push_attribute(("Name", node.name.as_str()));
            e.push_attribute(("Count", node.children.len().to_string().as_str()));
            writer.write_event(Event::Start(e)).map_err(write_err)?;
            for &child in &node.children {
                write_node(writer, tree, child, ids)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("NODE")))
                .map_err(write_err)?;
        }
        NodeKind::Playlist | NodeKind::Smartlist => {
            let members: Vec<u32> = node
                .tracks
                .iter()
                .filter_map(|fp| ids.get(fp.as_str()).copied())
                .collect();

            let mut e = BytesStart::new("NODE");
            e.push_attribute(("Type", "1"));
            e.push_attribute(("Name", node.name.as_str()));
            e.push_attribute(("Entries", members.len().to_string().as_str()));
            if node.kind == NodeKind::Smartlist && !node.query.is_empty() {
                // Smartlist queries pass through verbatim.
                e.push_attribute(("Query", node.query.as_str()));
            }
            writer.write_event(Event::Start(e)).map_err(write_err)?;
            for id in members {
                let mut t = BytesStart::new("TRACK");
                t.push_attribute(("Key", id.to_string().as_str()));
                writer.write_event(Event::Empty(t)).map_err(write_err)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("NODE")))
                .map_err(write_err)?;
        }
    }
    Ok(())
}

/// `file://localhost/<encoded path>` with forward slashes.
pub fn file_url(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let mut normalised = path.replace('\\', "/");
    if let Some(stripped) = normalised.strip_prefix("/:") {
        normalised = stripped.to_string();
    }
    if !normalised.starts_with('/') {
        normalised = format!("/{}", normalised);
    }

    let encoded: Vec<String> = normalised
        .split('/')
        .map(|seg| utf8_percent_encode(seg, URL_SEGMENT).to_string())
        .collect();
    format!("file://localhost{}", encoded.join("/"))
}

/// Decode a `file://localhost/...` URL back to a plain path.
pub fn path_from_url(url: &str) -> String {
    let mut rest = url;
    for prefix in ["file://localhost", "file://"] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    percent_decode_str(rest)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| rest.to_string())
}

/// Read an interchange XML document back into the collection model.
pub fn read_interchange(path: &Path) -> Result<Collection> {
    let file = File::open(path)
        .map_err(|e| Error::SourceUnreadable(format!("{}: {}", path.display(), e)))?;
    let mut xml = Reader::from_reader(BufReader::new(file));
    let config = xml.config_mut();
    config.trim_text_start = true;
    config.trim_text_end = true;

    let translator = KeyTranslator::new();
    let mut collection = Collection::default();
    let mut id_to_fingerprint: HashMap<u32, String> = HashMap::new();

    let mut current_track: Option<Track> = None;
    let mut node_stack: Vec<usize> = Vec::new();
    let mut in_playlists = false;

    let mut buf = Vec::new();
    loop {
        let event = xml
            .read_event_into(&mut buf)
            .map_err(|e| Error::SourceUnparseable(e.to_string()))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = e.name().as_ref().to_vec();
                let map = attr_map(e);

                match name.as_slice() {
                    b"PLAYLISTS" => in_playlists = true,
                    b"TRACK" if !in_playlists => {
                        let track = track_from_attrs(&map, &translator);
                        let id: u32 = map.get("TrackID").and_then(|v| v.parse().ok()).unwrap_or(0);
                        id_to_fingerprint.insert(id, track.fingerprint.clone());
                        if is_empty {
                            collection.tracks.insert(track.fingerprint.clone(), track);
                        } else {
                            current_track = Some(track);
                        }
                    }
                    b"TRACK" if in_playlists => {
                        // Membership reference inside a playlist node.
                        if let (Some(&node_id), Some(id)) = (
                            node_stack.last(),
                            map.get("Key").and_then(|v| v.parse::<u32>().ok()),
                        ) {
                            if let Some(fp) = id_to_fingerprint.get(&id) {
                                collection.tree.nodes[node_id].tracks.push(fp.clone());
                            }
                        }
                    }
                    b"POSITION_MARK" => {
                        if let Some(track) = current_track.as_mut() {
                            track.cues.push(cue_from_attrs(&map, track.cues.len() as u32));
                        }
                    }
                    b"NODE" if in_playlists => {
                        let name_attr = map.get("Name").cloned().unwrap_or_default();
                        if name_attr == "ROOT" && node_stack.is_empty() {
                            // The synthetic top node is scaffolding.
                            if !is_empty {
                                node_stack.push(usize::MAX);
                            }
                        } else {
                            let kind = if map.get("Type").map(String::as_str) == Some("0") {
                                NodeKind::Folder
                            } else {
                                NodeKind::Playlist
                            };
                            let node_id = collection.tree.push(Node::new(kind, name_attr));
                            match node_stack.last() {
                                Some(&parent) if parent != usize::MAX => {
                                    collection.tree.nodes[parent].children.push(node_id)
                                }
                                _ => collection.tree.roots.push(node_id),
                            }
                            if !is_empty {
                                node_stack.push(node_id);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"TRACK" => {
                    if let Some(track) = current_track.take() {
                        collection.tracks.insert(track.fingerprint.clone(), track);
                    }
                }
                b"NODE" => {
                    node_stack.pop();
                }
                b"PLAYLISTS" => in_playlists = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    collection.stats.entry_count = collection.tracks.len();
    Ok(collection)
}

fn attr_map(e: &BytesStart) -> HashMap<String, String> {
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

fn track_from_attrs(map: &HashMap<String, String>, translator: &KeyTranslator) -> Track {
    let get = |k: &str| map.get(k).cloned().unwrap_or_default();
    let file_path = path_from_url(&get("Location"));

    let tonality = get("Tonality");
    let key_index = [KeyFormat::OpenKey, KeyFormat::Classical, KeyFormat::FlatClassical]
        .iter()
        .find_map(|&fmt| translator.index_of(&tonality, fmt));

    Track {
        fingerprint: if file_path.is_empty() {
            format!("xml-{}", get("TrackID"))
        } else {
            fingerprint_for_path(&file_path)
        },
        title: get("Name"),
        artist: get("Artist"),
        album: get("Album"),
        genre: get("Genre"),
        label: get("Label"),
        comment: get("Comments"),
        remixer: get("Remixer"),
        file_path,
        file_size: get("Size").parse().unwrap_or(0),
        bitrate: get("BitRate").parse().unwrap_or(0),
        sample_rate: get("SampleRate").parse().unwrap_or(0),
        duration_secs: get("TotalTime").parse().unwrap_or(0),
        bpm: get("AverageBpm").parse().unwrap_or(0.0),
        key_index,
        rating: get("Rating").parse().unwrap_or(0),
        play_count: get("PlayCount").parse().unwrap_or(0),
        date_added: chrono::NaiveDate::parse_from_str(&get("DateAdded"), "%Y-%m-%d").ok(),
        ..Default::default()
    }
}

fn cue_from_attrs(map: &HashMap<String, String>, order: u32) -> CuePoint {
    let get = |k: &str| map.get(k).cloned().unwrap_or_default();
    let start: f64 = get("Start").parse().unwrap_or(0.0);
    let end: f64 = get("End").parse().unwrap_or(0.0);
    let is_loop = get("Type") == "4";
    let hot_slot: i8 = get("Num").parse().unwrap_or(-1);

    let colour = match (
        map.get("Red").and_then(|v| v.parse::<u8>().ok()),
        map.get("Green").and_then(|v| v.parse::<u8>().ok()),
        map.get("Blue").and_then(|v| v.parse::<u8>().ok()),
    ) {
        (Some(r), Some(g), Some(b)) => Some((r, g, b)),
        _ => None,
    };

    CuePoint {
        name: get("Name"),
        kind: if is_loop {
            CueKind::Loop
        } else if hot_slot < 0 {
            CueKind::Memory
        } else {
            CueKind::Cue
        },
        start_ms: (start * 1000.0).round() as u32,
        length_ms: if is_loop && end > start {
            ((end - start) * 1000.0).round() as u32
        } else {
            0
        },
        hot_slot,
        colour,
        display_order: order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;
    use tempfile::TempDir;

    fn sample_track() -> Track {
        Track {
            fingerprint: fingerprint_for_path("/Music/House/one.mp3"),
            title: "One".to_string(),
            artist: "Artist".to_string(),
            album: "Album".to_string(),
            genre: "House".to_string(),
            file_path: "/Music/House/one.mp3".to_string(),
            file_size: 4_000_000,
            bitrate: 320,
            duration_secs: 245,
            bpm: 126.0,
            key_index: Some(20), // 1A
            rating: 4,
            play_count: 7,
            date_added: chrono::NaiveDate::from_ymd_opt(2023, 6, 10),
            cues: vec![
                CuePoint {
                    name: "Intro".to_string(),
                    kind: CueKind::Memory,
                    start_ms: 1500,
                    hot_slot: -1,
                    display_order: 0,
                    ..Default::default()
                },
                CuePoint {
                    name: "Loop 8".to_string(),
                    kind: CueKind::Loop,
                    start_ms: 60_000,
                    length_ms: 4_000,
                    hot_slot: 2,
                    colour: Some((255, 160, 0)),
                    display_order: 1,
                },
            ],
            ..Default::default()
        }
    }

    fn write_sample(dir: &TempDir) -> std::path::PathBuf {
        let track = sample_track();
        let mut tree = Tree::default();
        let mut playlist = Node::new(NodeKind::Playlist, "Set");
        playlist.tracks = vec![track.fingerprint.clone()];
        let pl = tree.push(playlist);
        tree.roots = vec![pl];

        let out = dir.path().join("export.xml");
        write_interchange(&out, &[&track], &tree, &[pl], KeyNotation::OpenKey).unwrap();
        out
    }

    #[test]
    fn test_file_url_encoding() {
        assert_eq!(
            file_url("/Music/Café Del Mar/track 01.mp3"),
            "file://localhost/Music/Caf%C3%A9%20Del%20Mar/track%2001.mp3"
        );
        assert_eq!(
            path_from_url("file://localhost/Music/Caf%C3%A9%20Del%20Mar/track%2001.mp3"),
            "/Music/Café Del Mar/track 01.mp3"
        );
    }

    #[test]
    fn test_windows_url() {
        assert!(file_url("C:\\Music\\a.mp3").starts_with("file://localhost/C%3A/Music/a.mp3"));
    }

    #[test]
    fn test_emit_shape() {
        let tmp = TempDir::new().unwrap();
        let out = write_sample(&tmp);
        let text = std::fs::read_to_string(&out).unwrap();

        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(text.contains("<COLLECTION Entries=\"1\">"));
        assert!(text.contains("AverageBpm=\"126.00\""));
        assert!(text.contains("Tonality=\"1A\""));
        assert!(text.contains("Rating=\"4\""));
        assert!(text.contains("Location=\"file://localhost/Music/House/one.mp3\""));
        assert!(text.contains("<POSITION_MARK"));
        assert!(text.contains("Start=\"1.500\""));
        assert!(text.contains("End=\"64.000\""));
        assert!(text.contains("Num=\"-1\""));
    }

    #[test]
    fn test_round_trip() {
        let tmp = TempDir::new().unwrap();
        let out = write_sample(&tmp);
        let original = sample_track();

        let parsed = read_interchange(&out).unwrap();
        assert_eq!(parsed.tracks.len(), 1);
        let track = parsed.tracks.values().next().unwrap();

        assert_eq!(track.title, original.title);
        assert_eq!(track.artist, original.artist);
        assert_eq!(track.bpm, original.bpm);
        assert_eq!(track.key_index, original.key_index);
        assert_eq!(track.cues.len(), original.cues.len());
        assert_eq!(track.cues[0].start_ms, original.cues[0].start_ms);
        assert_eq!(track.cues[1].start_ms, original.cues[1].start_ms);
        assert_eq!(track.cues[1].length_ms, original.cues[1].length_ms);
        assert_eq!(track.rating, original.rating);
        assert_eq!(track.date_added, original.date_added);

        // Playlist membership survives too.
        assert_eq!(parsed.tree.roots.len(), 1);
        let node = &parsed.tree.nodes[parsed.tree.roots[0]];
        assert_eq!(node.name, "Set");
        assert_eq!(node.tracks.len(), 1);
    }
}
