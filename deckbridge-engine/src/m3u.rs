//! M3U playlist export
//!
//! One `.m3u` file per playlist, folders becoming directories. Standard
//! extended format: `#EXTM3U` header, `#EXTINF:<seconds>,<artist> -
//! <title>` per entry, UTF-8 throughout.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use deckbridge_core::sanitize::sanitize_component;

use crate::error::{Error, Result};
use crate::model::{NodeKind, Track, Tree};

/// Write the selected subtree as M3U files under `output`.
pub fn write_m3u_tree(
    output: &Path,
    tracks: &HashMap<String, Track>,
    tree: &Tree,
    roots: &[usize],
) -> Result<usize> {
    fs::create_dir_all(output).map_err(|e| Error::OutputNotWritable(e.to_string()))?;
    let mut written = 0usize;
    for &root in roots {
        written += write_node(output, tracks, tree, root)?;
    }
    info!(playlists = written, "M3U export complete");
    Ok(written)
}

fn write_node(
    dir: &Path,
    tracks: &HashMap<String, Track>,
    tree: &Tree,
    node_id: usize,
) -> Result<usize> {
    let node = &tree.nodes[node_id];
    match node.kind {
        NodeKind::Folder => {
            let sub = dir.join(safe_name(&node.name));
            fs::create_dir_all(&sub).map_err(|e| Error::WriteFailed(e.to_string()))?;
            let mut written = 0;
            for &child in &node.children {
                written += write_node(&sub, tracks, tree, child)?;
            }
            Ok(written)
        }
        NodeKind::Playlist => {
            let path = dir.join(format!("{}.m3u", safe_name(&node.name)));
            let file = File::create(&path).map_err(|e| Error::WriteFailed(e.to_string()))?;
            let mut out = BufWriter::new(file);
            writeln!(out, "#EXTM3U").map_err(|e| Error::WriteFailed(e.to_string()))?;
            for fp in &node.tracks {
                if let Some(track) = tracks.get(fp) {
                    writeln!(
                        out,
                        "#EXTINF:{},{} - {}",
                        track.duration_secs, track.artist, track.title
                    )
                    .map_err(|e| Error::WriteFailed(e.to_string()))?;
                    writeln!(out, "{}", track.file_path)
                        .map_err(|e| Error::WriteFailed(e.to_string()))?;
                }
            }
            Ok(1)
        }
        // Smartlists carry a query, not a track list; nothing to emit.
        NodeKind::Smartlist => Ok(0),
    }
}

fn safe_name(name: &str) -> String {
    sanitize_component(name).unwrap_or_else(|_| "playlist".to_string())
}
