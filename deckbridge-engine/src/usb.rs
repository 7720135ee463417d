//! Hardware (CDJ/USB) export orchestration
//!
//! Builds the Pioneer directory skeleton, optionally copies and verifies
//! audio into `Contents/`, emits per-track analysis files, writes the
//! DeviceSQL database (plus its compatibility twin) and the EXPORT.INFO
//! side file. Cancellation is polled between files and tracks; a
//! cancelled or fatally failed export removes the partial `PIONEER/`
//! tree it created.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use deckbridge_core::anlz::{analysis_dir_for, write_2ex_file, write_dat_file, write_ext_file};
use deckbridge_core::pdb::DatabaseBuilder;
use deckbridge_core::sanitize::{fit_path, sanitize_basename};
use deckbridge_core::track::Tier;

use crate::convert::ExportPlan;
use crate::error::{Error, Result};
use crate::progress::{CancelFlag, ProgressSink};

/// Options for a hardware export.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsbExportOptions {
    pub tier: Tier,
    pub copy_audio: bool,
    pub verify_copy: bool,
    pub overwrite: bool,
}

/// Aggregate result of a hardware export.
#[derive(Debug, Default, Clone)]
pub struct UsbExportStats {
    pub tracks_written: usize,
    pub playlists_written: usize,
    pub analysis_files: usize,
    pub audio_copied: usize,
    pub audio_skipped: usize,
    pub audio_verified: usize,
    pub bytes_copied: u64,
    pub errors: Vec<String>,
}

fn tier_name(tier: Tier) -> &'static str {
    match tier {
        Tier::A => "tier-a",
        Tier::B => "tier-b",
        Tier::C => "tier-c",
    }
}

/// Run the complete hardware export.
pub fn export_usb(
    plan: &mut ExportPlan,
    output: &Path,
    options: &UsbExportOptions,
    progress: Option<&ProgressSink>,
    cancel: &CancelFlag,
) -> Result<UsbExportStats> {
    prepare_output(output, options.overwrite)?;

    let pioneer = output.join("PIONEER");
    let result = run_export(plan, output, options, progress, cancel);
    if result.is_err() {
        cleanup_partial(&pioneer);
    }
    result
}

fn run_export(
    plan: &mut ExportPlan,
    output: &Path,
    options: &UsbExportOptions,
    progress: Option<&ProgressSink>,
    cancel: &CancelFlag,
) -> Result<UsbExportStats> {
    let mut stats = UsbExportStats::default();

    let pioneer = output.join("PIONEER");
    let rekordbox_dir = pioneer.join("rekordbox");
    let anlz_dir = pioneer.join("USBANLZ");
    let contents_dir = output.join("Contents");
    for dir in [&pioneer, &rekordbox_dir, &anlz_dir, &contents_dir] {
        fs::create_dir_all(dir).map_err(|e| Error::OutputNotWritable(e.to_string()))?;
    }

    info!(
        tracks = plan.tracks.len(),
        tier = tier_name(options.tier),
        "starting hardware export to {}",
        output.display()
    );

    if options.copy_audio {
        copy_audio(plan, &contents_dir, options, progress, cancel, &mut stats)?;
    }

    write_analysis_files(plan, output, options.tier, progress, cancel, &mut stats)?;

    if let Some(sink) = progress {
        sink.send(70, "Creating hardware database...");
    }
    let mut builder = DatabaseBuilder::new();
    for track in &plan.tracks {
        builder.add_track(track).map_err(map_core)?;
    }
    for node in &plan.nodes {
        builder.add_node(node.clone());
    }
    let database = builder
        .build_with_cancel(|| cancel.is_cancelled())
        .map_err(map_core)?;

    let pdb_path = rekordbox_dir.join("export.pdb");
    fs::write(&pdb_path, &database).map_err(|e| Error::WriteFailed(e.to_string()))?;
    // Older players look for the alternate filename; ship a byte-identical
    // twin.
    fs::copy(&pdb_path, rekordbox_dir.join("DeviceSQL.edb"))
        .map_err(|e| Error::WriteFailed(e.to_string()))?;

    write_export_info(&pioneer, options.tier)?;

    stats.tracks_written = plan.tracks.len();
    stats.playlists_written = plan.nodes.iter().filter(|n| !n.is_folder).count();

    if let Some(sink) = progress {
        sink.send(100, "Export completed");
    }
    info!(
        tracks = stats.tracks_written,
        analysis = stats.analysis_files,
        copied = stats.audio_copied,
        "hardware export finished"
    );
    Ok(stats)
}

fn map_core(e: deckbridge_core::Error) -> Error {
    match e {
        deckbridge_core::Error::Cancelled => Error::Cancelled,
        deckbridge_core::Error::CollectionTooLarge(n, _) => Error::CollectionTooLarge(n),
        other => Error::Core(other),
    }
}

/// Refuse a non-empty PIONEER tree unless overwrite was requested.
fn prepare_output(output: &Path, overwrite: bool) -> Result<()> {
    if !output.is_dir() {
        return Err(Error::OutputNotWritable(format!(
            "not a directory: {}",
            output.display()
        )));
    }

    // Cheap writability probe, removed immediately.
    let probe = output.join(".deckbridge_probe");
    File::create(&probe)
        .and_then(|_| fs::remove_file(&probe))
        .map_err(|e| Error::OutputNotWritable(e.to_string()))?;

    let pioneer = output.join("PIONEER");
    if pioneer.exists() {
        let occupied = fs::read_dir(&pioneer)
            .map(|mut d| d.next().is_some())
            .unwrap_or(false);
        if occupied && !overwrite {
            return Err(Error::OutputNotWritable(format!(
                "{} is not empty (pass overwrite to clear it)",
                pioneer.display()
            )));
        }
        if occupied {
            fs::remove_dir_all(&pioneer).map_err(|e| Error::OutputNotWritable(e.to_string()))?;
        }
    }
    Ok(())
}

fn copy_audio(
    plan: &mut ExportPlan,
    contents_dir: &Path,
    options: &UsbExportOptions,
    progress: Option<&ProgressSink>,
    cancel: &CancelFlag,
    stats: &mut UsbExportStats,
) -> Result<()> {
    let total = plan.tracks.len();
    let dir_len = contents_dir.as_os_str().len();

    for (i, track) in plan.tracks.iter_mut().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(sink) = progress {
            // Audio copy occupies the 10-40 band.
            let percent = 10 + ((i * 30) / total.max(1)) as u8;
            sink.send(percent, format!("Copying audio {}/{}", i + 1, total));
        }

        let source = Path::new(&track.source_path);
        if !source.is_file() {
            stats.audio_skipped += 1;
            continue;
        }

        let basename = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let clean = match sanitize_basename(basename).and_then(|b| fit_path(dir_len, &b)) {
            Ok(name) => name,
            Err(e) => {
                // Unrepresentable name: the track is skipped for hardware
                // audio but keeps its database row with the source path.
                warn!(track = track.id, "unrepresentable filename: {}", e);
                stats.errors.push(format!("track {}: {}", track.id, e));
                stats.audio_skipped += 1;
                continue;
            }
        };

        let dest = contents_dir.join(&clean);
        if dest.exists() {
            track.file_path = format!("Contents/{}", clean);
            stats.audio_skipped += 1;
            continue;
        }

        match fs::copy(source, &dest) {
            Ok(bytes) => {
                let source_len = source.metadata().map(|m| m.len()).unwrap_or(0);
                if bytes != source_len {
                    let _ = fs::remove_file(&dest);
                    stats.errors.push(format!(
                        "track {}: size mismatch after copy ({} vs {})",
                        track.id, bytes, source_len
                    ));
                    stats.audio_skipped += 1;
                    continue;
                }

                if options.verify_copy {
                    if sha256_of(source)? != sha256_of(&dest)? {
                        let _ = fs::remove_file(&dest);
                        return Err(Error::VerifyMismatch(clean));
                    }
                    stats.audio_verified += 1;
                }

                track.file_path = format!("Contents/{}", clean);
                stats.audio_copied += 1;
                stats.bytes_copied += bytes;
                debug!(track = track.id, dest = %dest.display(), "audio copied");
            }
            Err(e) => {
                // Copy failure is per-track: the row is still written with
                // the best-known path.
                stats
                    .errors
                    .push(format!("track {}: copy failed: {}", track.id, e));
                stats.audio_skipped += 1;
            }
        }
    }
    Ok(())
}

fn sha256_of(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path).map_err(|e| Error::AudioCopyFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::AudioCopyFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn write_analysis_files(
    plan: &ExportPlan,
    output: &Path,
    tier: Tier,
    progress: Option<&ProgressSink>,
    cancel: &CancelFlag,
    stats: &mut UsbExportStats,
) -> Result<()> {
    let total = plan.tracks.len();

    for (i, track) in plan.tracks.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if i % 100 == 0 {
            if let Some(sink) = progress {
                // Analysis generation occupies the 40-70 band.
                let percent = 40 + ((i * 30) / total.max(1)) as u8;
                sink.send(percent, format!("Analysis files {}/{}", i, total));
            }
        }

        let dir = output.join(analysis_dir_for(&track.source_path));
        fs::create_dir_all(&dir).map_err(|e| Error::WriteFailed(e.to_string()))?;

        let dat = write_dat_file(track, tier);
        fs::write(dir.join("ANLZ0000.DAT"), dat)
            .map_err(|e| Error::WriteFailed(e.to_string()))?;
        stats.analysis_files += 1;

        if matches!(tier, Tier::B | Tier::C) {
            let ext = write_ext_file(track);
            fs::write(dir.join("ANLZ0000.EXT"), ext)
                .map_err(|e| Error::WriteFailed(e.to_string()))?;
            stats.analysis_files += 1;
        }
        if tier == Tier::C {
            let two_ex = write_2ex_file(track);
            fs::write(dir.join("ANLZ0000.2EX"), two_ex)
                .map_err(|e| Error::WriteFailed(e.to_string()))?;
            stats.analysis_files += 1;
        }
    }
    Ok(())
}

fn write_export_info(pioneer: &Path, tier: Tier) -> Result<()> {
    let date = chrono::Local::now().date_naive();
    let mut file = File::create(pioneer.join("EXPORT.INFO"))
        .map_err(|e| Error::WriteFailed(e.to_string()))?;
    write!(
        file,
        "Date: {}\r\nConverter: deckbridge {}\r\nTarget: {}\r\n",
        date,
        env!("CARGO_PKG_VERSION"),
        tier_name(tier)
    )
    .map_err(|e| Error::WriteFailed(e.to_string()))
}

/// Best-effort removal of a partial PIONEER tree.
fn cleanup_partial(pioneer: &Path) {
    if pioneer.exists() {
        if let Err(e) = fs::remove_dir_all(pioneer) {
            warn!("failed to clean up partial export at {}: {}", pioneer.display(), e);
        }
    }
}
