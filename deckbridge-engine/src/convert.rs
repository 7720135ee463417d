//! Conversion driver
//!
//! Walks the selected playlist subtree, deduplicates tracks in first-seen
//! order, assigns export ids, builds the export plan and dispatches to
//! the chosen writer. Progress flows through the sink; the cancellation
//! flag is polled between tracks and a clean `Cancelled` comes back when
//! it trips.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use deckbridge_core::pdb::{PlaylistNode, MAX_TRACKS};
use deckbridge_core::track::{CueRecord, TrackRecord, Tier};

use crate::error::{Error, Result};
use crate::model::{days_since_epoch, file_kind_for, Collection, NodeId, NodeKind, Track};
use crate::progress::{CancelFlag, ProgressSink, Terminal};
use crate::m3u;
use crate::usb::{export_usb, UsbExportOptions, UsbExportStats};
use crate::xml::{write_interchange, KeyNotation};

/// Conversion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// DeviceSQL database + analysis files + Pioneer layout.
    CdjHardware,
    /// rekordbox interchange XML.
    InterchangeXml,
    /// Plain M3U playlists.
    M3u,
    /// The desktop software's SQLite database; provided by an external
    /// backend, not built here.
    DatabaseSoftware,
}

/// Options bundle for a conversion.
#[derive(Debug, Clone)]
pub struct ConversionOptions {
    pub format: ExportFormat,
    pub tier: Tier,
    pub copy_audio: bool,
    pub verify_copy: bool,
    pub key_notation: KeyNotation,
    pub overwrite: bool,
    /// Subtree roots to export; `None` exports the full tree.
    pub selection: Option<Vec<NodeId>>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::CdjHardware,
            tier: Tier::default(),
            copy_audio: true,
            verify_copy: false,
            key_notation: KeyNotation::default(),
            overwrite: false,
            selection: None,
        }
    }
}

/// Aggregate conversion outcome.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConversionReport {
    pub tracks_exported: usize,
    pub playlists_exported: usize,
    pub analysis_files: usize,
    pub audio_copied: usize,
    pub audio_verified: usize,
    pub bytes_copied: u64,
    pub issues: Vec<String>,
}

/// The deduplicated, id-assigned input to the hardware writers.
#[derive(Debug, Default, Clone)]
pub struct ExportPlan {
    pub tracks: Vec<TrackRecord>,
    pub nodes: Vec<PlaylistNode>,
}

/// Run a conversion end to end. Sends a terminal event on every exit
/// path.
pub fn convert(
    collection: &Collection,
    options: &ConversionOptions,
    output: &Path,
    progress: Option<&ProgressSink>,
    cancel: &CancelFlag,
) -> Result<ConversionReport> {
    let outcome = run(collection, options, output, progress, cancel);
    if let Some(sink) = progress {
        match &outcome {
            Ok(_) => sink.finish(Terminal::Done),
            Err(Error::Cancelled) => sink.finish(Terminal::Cancelled),
            Err(e) => sink.finish(Terminal::Error(e.to_string())),
        }
    }
    outcome
}

fn run(
    collection: &Collection,
    options: &ConversionOptions,
    output: &Path,
    progress: Option<&ProgressSink>,
    cancel: &CancelFlag,
) -> Result<ConversionReport> {
    let roots: Vec<NodeId> = match &options.selection {
        Some(ids) => ids.clone(),
        None => collection.tree.roots.clone(),
    };

    let ordered = ordered_fingerprints(collection, &roots);
    info!(
        tracks = ordered.len(),
        format = ?options.format,
        "conversion started"
    );
    if let Some(sink) = progress {
        sink.send(0, format!("Preparing {} tracks", ordered.len()));
    }

    let mut report = ConversionReport {
        issues: collection.issues.clone(),
        ..Default::default()
    };

    match options.format {
        ExportFormat::CdjHardware => {
            if ordered.len() > MAX_TRACKS {
                return Err(Error::CollectionTooLarge(ordered.len()));
            }
            let mut plan = build_plan(collection, &ordered, &roots, cancel, &mut report)?;
            let usb_options = UsbExportOptions {
                tier: options.tier,
                copy_audio: options.copy_audio,
                verify_copy: options.verify_copy,
                overwrite: options.overwrite,
            };
            let stats = export_usb(&mut plan, output, &usb_options, progress, cancel)?;
            merge_usb_stats(&mut report, stats);
        }
        ExportFormat::InterchangeXml => {
            let tracks: Vec<&Track> = ordered
                .iter()
                .filter_map(|fp| collection.tracks.get(fp))
                .collect();
            let target = xml_target(output);
            write_interchange(
                &target,
                &tracks,
                &collection.tree,
                &roots,
                options.key_notation,
            )?;
            report.tracks_exported = tracks.len();
            report.playlists_exported = count_playlists(collection, &roots);
        }
        ExportFormat::M3u => {
            report.playlists_exported =
                m3u::write_m3u_tree(output, &collection.tracks, &collection.tree, &roots)?;
            report.tracks_exported = ordered.len();
        }
        ExportFormat::DatabaseSoftware => {
            return Err(Error::Unsupported(
                "database-software export requires the desktop-database backend".to_string(),
            ));
        }
    }

    info!(
        tracks = report.tracks_exported,
        playlists = report.playlists_exported,
        issues = report.issues.len(),
        "conversion finished"
    );
    Ok(report)
}

fn xml_target(output: &Path) -> PathBuf {
    if output.extension().map(|e| e.eq_ignore_ascii_case("xml")) == Some(true) {
        output.to_path_buf()
    } else {
        output.join("rekordbox_export.xml")
    }
}

fn merge_usb_stats(report: &mut ConversionReport, stats: UsbExportStats) {
    report.tracks_exported = stats.tracks_written;
    report.playlists_exported = stats.playlists_written;
    report.analysis_files = stats.analysis_files;
    report.audio_copied = stats.audio_copied;
    report.audio_verified = stats.audio_verified;
    report.bytes_copied = stats.bytes_copied;
    report.issues.extend(stats.errors);
}

/// First-seen-order deduplicated fingerprints across the selected
/// subtrees.
fn ordered_fingerprints(collection: &Collection, roots: &[NodeId]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for &root in roots {
        for node_id in collection.tree.preorder_from(root) {
            let node = &collection.tree.nodes[node_id];
            if node.kind != NodeKind::Playlist {
                continue;
            }
            for fp in &node.tracks {
                if collection.tracks.contains_key(fp) && seen.insert(fp.clone()) {
                    ordered.push(fp.clone());
                }
            }
        }
    }
    ordered
}

fn count_playlists(collection: &Collection, roots: &[NodeId]) -> usize {
    roots
        .iter()
        .flat_map(|&r| collection.tree.preorder_from(r))
        .filter(|&id| collection.tree.nodes[id].kind != NodeKind::Folder)
        .count()
}

/// Build the hardware export plan: sequential track ids in first-seen
/// order, a flattened pre-order playlist tree, and per-track records.
fn build_plan(
    collection: &Collection,
    ordered: &[String],
    roots: &[NodeId],
    cancel: &CancelFlag,
    report: &mut ConversionReport,
) -> Result<ExportPlan> {
    let mut plan = ExportPlan::default();
    let mut id_of = std::collections::HashMap::new();

    for (i, fp) in ordered.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let track = &collection.tracks[fp];
        let id = i as u32 + 1;
        id_of.insert(fp.clone(), id);

        for issue in track.validation_issues() {
            report.issues.push(format!("{} - {}: {}", track.artist, track.title, issue));
        }
        plan.tracks.push(track_record(track, id, report));
    }

    // Flatten the tree in pre-order; node ids ascend so tree rows land
    // sorted. Smartlists are ignored for hardware export.
    let mut next_node_id = 1u32;
    for &root in roots {
        flatten_node(collection, root, 0, &mut next_node_id, &id_of, &mut plan);
    }

    Ok(plan)
}

fn flatten_node(
    collection: &Collection,
    node_id: NodeId,
    parent: u32,
    next_id: &mut u32,
    id_of: &std::collections::HashMap<String, u32>,
    plan: &mut ExportPlan,
) {
    let node = &collection.tree.nodes[node_id];
    if node.kind == NodeKind::Smartlist {
        return;
    }

    let id = *next_id;
    *next_id += 1;
    let seq = plan
        .nodes
        .iter()
        .filter(|n| n.parent_id == parent)
        .count() as u32;

    plan.nodes.push(PlaylistNode {
        id,
        parent_id: parent,
        seq,
        is_folder: node.kind == NodeKind::Folder,
        name: node.name.clone(),
        track_ids: node
            .tracks
            .iter()
            .filter_map(|fp| id_of.get(fp).copied())
            .collect(),
    });

    for &child in &node.children {
        flatten_node(collection, child, id, next_id, id_of, plan);
    }
}

/// Convert a collection track into its export-plan record.
fn track_record(track: &Track, id: u32, report: &mut ConversionReport) -> TrackRecord {
    let duration_ms = track.duration_secs.saturating_mul(1000);
    let mut seen_slots = HashSet::new();
    let mut cues = Vec::with_capacity(track.cues.len());

    for cue in &track.cues {
        // Tolerate two seconds of drift past the track end; beyond that
        // the cue is noise from a stale source entry.
        if duration_ms > 0 && cue.start_ms + cue.length_ms > duration_ms + 2000 {
            report.issues.push(format!(
                "{} - {}: cue {:?} past track end dropped",
                track.artist, track.title, cue.name
            ));
            continue;
        }
        // Hot-cue slots must be unique per track; first one wins.
        if cue.hot_slot >= 0 && !seen_slots.insert(cue.hot_slot) {
            warn!(track = %track.title, slot = cue.hot_slot, "duplicate hot-cue slot dropped");
            continue;
        }
        cues.push(CueRecord {
            name: cue.name.clone(),
            kind: cue.kind,
            start_ms: cue.start_ms,
            length_ms: cue.length_ms,
            hot_slot: cue.hot_slot,
            colour: cue.colour,
        });
    }

    TrackRecord {
        id,
        title: track.title.clone(),
        artist: track.artist.clone(),
        album: track.album.clone(),
        genre: track.genre.clone(),
        label: track.label.clone(),
        comment: track.comment.clone(),
        remixer: track.remixer.clone(),
        file_path: track.file_path.clone(),
        source_path: track.file_path.clone(),
        file_kind: file_kind_for(&track.file_path).to_string(),
        file_size: track.file_size,
        sample_rate: if track.sample_rate == 0 { 44100 } else { track.sample_rate },
        sample_depth: if track.sample_depth == 0 { 16 } else { track.sample_depth },
        bitrate: track.bitrate.min(u16::MAX as u32) as u16,
        duration_secs: track.duration_secs,
        bpm: track.bpm,
        key_index: track.key_index,
        rating: track.rating,
        colour: track.colour,
        play_count: track.play_count,
        year: track
            .date_added
            .map(|d| chrono::Datelike::year(&d).max(0) as u32)
            .unwrap_or(0),
        date_added_days: track.date_added.map(days_since_epoch).unwrap_or(0),
        cues,
        grid_anchor_ms: track.grid_anchor_ms,
    }
}
