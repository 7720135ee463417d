//! Full-pipeline conversion tests: parse a source collection, export it,
//! and check what landed on disk.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use deckbridge_core::anlz::analysis_dir_for;
use deckbridge_core::track::Tier;
use deckbridge_core::validate::{validate_analysis, validate_database};
use deckbridge_engine::{
    convert, parse_collection, xml, CancelFlag, ConversionOptions, Error, ExportFormat,
    KeyNotation, ParseOptions,
};

/// Write a two-track NML fixture whose audio files exist under `music`.
fn write_fixture(dir: &Path, music: &Path) -> PathBuf {
    fs::write(music.join("one.mp3"), vec![0u8; 2048]).unwrap();
    fs::write(music.join("two.flac"), vec![0u8; 4096]).unwrap();

    let nml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<NML VERSION="20">
 <COLLECTION ENTRIES="2">
  <ENTRY AUDIO_ID="aid-one" TITLE="One" ARTIST="Alpha">
   <LOCATION VOLUME="{music}" DIR="/:" FILE="one.mp3"/>
   <ALBUM TITLE="First Album"/>
   <INFO BITRATE="320000" FILESIZE="2048" PLAYTIME="240" RANKING="204"
         GENRE="House" IMPORT_DATE="2024/1/15" PLAYCOUNT="3"/>
   <TEMPO BPM="124.00"/>
   <MUSICAL_KEY VALUE="21"/>
   <CUE_V2 NAME="Grid" TYPE="4" START="50.0" LEN="0" HOTCUE="-1"/>
   <CUE_V2 NAME="Drop" TYPE="0" START="32000.0" LEN="0" HOTCUE="0"/>
   <CUE_V2 NAME="Loop" TYPE="5" START="64000.0" LEN="7500.0" HOTCUE="1"/>
  </ENTRY>
  <ENTRY AUDIO_ID="aid-two" TITLE="Two" ARTIST="Beta">
   <LOCATION VOLUME="{music}" DIR="/:" FILE="two.flac"/>
   <INFO PLAYTIME="180" GENRE="Techno"/>
   <TEMPO BPM="130.00"/>
  </ENTRY>
 </COLLECTION>
 <PLAYLISTS>
  <NODE TYPE="FOLDER" NAME="$ROOT">
   <SUBNODES COUNT="1">
    <NODE TYPE="PLAYLIST" NAME="Main Set">
     <PLAYLIST ENTRIES="2" TYPE="LIST" UUID="uuid-1">
      <ENTRY><PRIMARYKEY TYPE="TRACK" KEY="{music}/:one.mp3"/></ENTRY>
      <ENTRY><PRIMARYKEY TYPE="TRACK" KEY="{music}/:two.flac"/></ENTRY>
     </PLAYLIST>
    </NODE>
   </SUBNODES>
  </NODE>
 </PLAYLISTS>
</NML>"#,
        music = music.display()
    );

    let path = dir.join("collection.nml");
    fs::write(&path, nml).unwrap();
    path
}

#[test]
fn hardware_export_end_to_end() {
    let work = TempDir::new().unwrap();
    let music = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let nml = write_fixture(work.path(), music.path());

    let collection = parse_collection(&nml, &ParseOptions::default(), None).unwrap();
    assert_eq!(collection.tracks.len(), 2);

    let options = ConversionOptions {
        format: ExportFormat::CdjHardware,
        tier: Tier::C,
        copy_audio: true,
        verify_copy: true,
        ..Default::default()
    };
    let report = convert(&collection, &options, out.path(), None, &CancelFlag::new()).unwrap();

    assert_eq!(report.tracks_exported, 2);
    assert_eq!(report.playlists_exported, 1);
    assert_eq!(report.audio_copied, 2);
    assert_eq!(report.audio_verified, 2);
    // Tier C: .DAT + .EXT + .2EX per track.
    assert_eq!(report.analysis_files, 6);

    // Database is valid and carries both tracks.
    let pdb = fs::read(out.path().join("PIONEER/rekordbox/export.pdb")).unwrap();
    let db_report = validate_database(&pdb);
    assert!(db_report.is_valid(), "errors: {:?}", db_report.errors);
    assert_eq!(db_report.stats.tracks, 2);
    assert_eq!(db_report.stats.playlists, 1);
    assert_eq!(db_report.stats.playlist_entries, 2);

    // The twin is byte-identical.
    let twin = fs::read(out.path().join("PIONEER/rekordbox/DeviceSQL.edb")).unwrap();
    assert_eq!(pdb, twin);

    // Each analysis file passes container validation.
    let one_src = music.path().join("one.mp3");
    let dir = out
        .path()
        .join(analysis_dir_for(&one_src.to_string_lossy()));
    for name in ["ANLZ0000.DAT", "ANLZ0000.EXT", "ANLZ0000.2EX"] {
        let data = fs::read(dir.join(name)).unwrap();
        let report = validate_analysis(&data);
        assert!(report.is_valid(), "{name} errors: {:?}", report.errors);
    }

    // Audio landed in Contents/ under its sanitized basename.
    assert!(out.path().join("Contents/one.mp3").is_file());
    assert!(out.path().join("Contents/two.flac").is_file());

    assert!(out.path().join("PIONEER/EXPORT.INFO").is_file());
    let info = fs::read_to_string(out.path().join("PIONEER/EXPORT.INFO")).unwrap();
    assert!(info.contains("deckbridge"));
    assert!(info.contains("tier-c"));
}

#[test]
fn analysis_directories_are_stable_across_runs() {
    let work = TempDir::new().unwrap();
    let music = TempDir::new().unwrap();
    let nml = write_fixture(work.path(), music.path());

    let collection = parse_collection(&nml, &ParseOptions::default(), None).unwrap();
    let options = ConversionOptions {
        copy_audio: false,
        ..Default::default()
    };

    let out_a = TempDir::new().unwrap();
    let out_b = TempDir::new().unwrap();
    convert(&collection, &options, out_a.path(), None, &CancelFlag::new()).unwrap();
    convert(&collection, &options, out_b.path(), None, &CancelFlag::new()).unwrap();

    let dirs = |root: &Path| -> Vec<String> {
        let mut found = Vec::new();
        for p_dir in fs::read_dir(root.join("PIONEER/USBANLZ")).unwrap() {
            let p_dir = p_dir.unwrap();
            for hash_dir in fs::read_dir(p_dir.path()).unwrap() {
                found.push(format!(
                    "{}/{}",
                    p_dir.file_name().to_string_lossy(),
                    hash_dir.unwrap().file_name().to_string_lossy()
                ));
            }
        }
        found.sort();
        found
    };
    assert_eq!(dirs(out_a.path()), dirs(out_b.path()));

    // Identical inputs produce identical database bytes too.
    let a = fs::read(out_a.path().join("PIONEER/rekordbox/export.pdb")).unwrap();
    let b = fs::read(out_b.path().join("PIONEER/rekordbox/export.pdb")).unwrap();
    assert_eq!(a, b);
}

#[test]
fn cancelled_conversion_leaves_no_pioneer_tree() {
    let work = TempDir::new().unwrap();
    let music = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let nml = write_fixture(work.path(), music.path());

    let collection = parse_collection(&nml, &ParseOptions::default(), None).unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let options = ConversionOptions {
        format: ExportFormat::CdjHardware,
        copy_audio: true,
        ..Default::default()
    };
    let err = convert(&collection, &options, out.path(), None, &cancel).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(!out.path().join("PIONEER").exists());
}

#[test]
fn interchange_round_trip() {
    let work = TempDir::new().unwrap();
    let music = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let nml = write_fixture(work.path(), music.path());

    let collection = parse_collection(&nml, &ParseOptions::default(), None).unwrap();
    let options = ConversionOptions {
        format: ExportFormat::InterchangeXml,
        key_notation: KeyNotation::OpenKey,
        ..Default::default()
    };
    convert(&collection, &options, out.path(), None, &CancelFlag::new()).unwrap();

    let xml_path = out.path().join("rekordbox_export.xml");
    assert!(xml_path.is_file());

    let reparsed = xml::read_interchange(&xml_path).unwrap();
    assert_eq!(reparsed.tracks.len(), 2);

    let original = &collection.tracks["aid-one"];
    let track = reparsed
        .tracks
        .values()
        .find(|t| t.title == "One")
        .expect("track One present");

    assert_eq!(track.artist, original.artist);
    assert_eq!(track.bpm, original.bpm);
    assert_eq!(track.key_index, original.key_index);
    // Grid anchors are not cues in the interchange format.
    let exported_cues: Vec<_> = original
        .cues
        .iter()
        .filter(|c| c.kind != deckbridge_engine::model::CueKind::GridAnchor)
        .collect();
    assert_eq!(track.cues.len(), exported_cues.len());
    for (got, want) in track.cues.iter().zip(exported_cues) {
        assert_eq!(got.start_ms, want.start_ms);
        assert_eq!(got.length_ms, want.length_ms);
    }
}

#[test]
fn path_repair_points_collection_at_moved_files() {
    let work = TempDir::new().unwrap();
    let old_music = TempDir::new().unwrap();
    let new_music = TempDir::new().unwrap();

    // The fixture references audio under old_music, but the files have
    // moved to new_music.
    let nml = write_fixture(work.path(), old_music.path());
    fs::rename(
        old_music.path().join("one.mp3"),
        new_music.path().join("one.mp3"),
    )
    .unwrap();
    fs::rename(
        old_music.path().join("two.flac"),
        new_music.path().join("two.flac"),
    )
    .unwrap();

    let options = ParseOptions {
        music_root: Some(new_music.path().to_path_buf()),
    };
    let collection = parse_collection(&nml, &options, None).unwrap();

    let one = &collection.tracks["aid-one"];
    assert_eq!(
        one.file_path,
        new_music.path().join("one.mp3").to_string_lossy()
    );
}
