//! Export validation
//!
//! Checks emitted databases and analysis files against the invariants the
//! hardware relies on: page accounting, referential integrity of row ids,
//! heap-pointer bounds, ascending row order, minimal string encodings and
//! container length consistency.

use std::collections::HashSet;

use crate::page::{FILE_HEADER_LEN, PAGE_HEADER_LEN, PAGE_LEN};
use crate::string::{decode_string, encoded_len};

/// Row counts per table, extracted while validating.
#[derive(Debug, Default, Clone)]
pub struct DatabaseStats {
    pub total_pages: u32,
    pub tracks: u32,
    pub artists: u32,
    pub albums: u32,
    pub genres: u32,
    pub labels: u32,
    pub keys: u32,
    pub playlists: u32,
    pub playlist_entries: u32,
}

/// Outcome of a validation pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: DatabaseStats,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Fixed row-slot size for a table kind.
fn row_len(kind: u32) -> Option<usize> {
    match kind {
        0 => Some(88),          // tracks
        1..=6 => Some(8),       // reference tables
        7 => Some(16),          // playlist tree
        8 => Some(12),          // playlist entries
        13 => Some(8),          // artwork
        17 | 18 => Some(12),    // history
        _ => None,
    }
}

/// Byte offsets of heap pointers within a row slot, per table kind.
fn heap_ptr_offsets(kind: u32) -> &'static [usize] {
    match kind {
        0 => &[0x48, 0x4A, 0x4C, 0x4E, 0x50],
        1..=6 => &[4],
        7 => &[14],
        13 => &[4],
        _ => &[],
    }
}

/// Byte offset of a row's primary id.
fn primary_id_offset(kind: u32) -> usize {
    match kind {
        0 => 0x04, // tracks store the marker first
        _ => 0,
    }
}

struct TableData {
    kind: u32,
    /// Raw rows across all pages of the chain, in emission order.
    rows: Vec<Vec<u8>>,
}

/// Validate a DeviceSQL database image.
pub fn validate_database(data: &[u8]) -> ValidationReport {
    let mut report = ValidationReport::default();

    if data.len() < PAGE_LEN {
        report.error(format!(
            "file too small: {} bytes (one page is {})",
            data.len(),
            PAGE_LEN
        ));
        return report;
    }
    if data.len() % PAGE_LEN != 0 {
        report.error(format!(
            "file size {} is not a multiple of the page length {}",
            data.len(),
            PAGE_LEN
        ));
        return report;
    }

    let actual_pages = (data.len() / PAGE_LEN) as u32;
    report.stats.total_pages = actual_pages;

    let page_len_field = le_u32(data, 0x04);
    if page_len_field != PAGE_LEN as u32 {
        report.error(format!(
            "header page length {} (expected {})",
            page_len_field, PAGE_LEN
        ));
        return report;
    }

    let num_tables = le_u32(data, 0x08) as usize;
    let next_unused = le_u32(data, 0x0C);
    if next_unused > actual_pages {
        report.error(format!(
            "next_unused_page {} exceeds the {} pages present",
            next_unused, actual_pages
        ));
    }

    let mut tables: Vec<TableData> = Vec::new();

    for i in 0..num_tables {
        let at = FILE_HEADER_LEN + i * 16;
        if at + 16 > PAGE_LEN {
            report.error(format!("table pointer {} overruns the header page", i));
            break;
        }
        let kind = le_u32(data, at);
        let first_page = le_u32(data, at + 4);
        let last_page = le_u32(data, at + 8);

        if first_page == 0 || first_page >= actual_pages || last_page >= actual_pages {
            report.error(format!(
                "table {} (kind {}) points outside the file: first {} last {}",
                i, kind, first_page, last_page
            ));
            continue;
        }
        if first_page >= next_unused || last_page >= next_unused {
            report.error(format!(
                "table {} (kind {}) pages not covered by next_unused_page {}",
                i, kind, next_unused
            ));
        }

        if let Some(rows) = walk_chain(data, kind, first_page, actual_pages, &mut report) {
            tables.push(TableData { kind, rows });
        }
    }

    check_references(&tables, &mut report);

    for table in &tables {
        let count = table.rows.len() as u32;
        match table.kind {
            0 => report.stats.tracks = count,
            1 => report.stats.genres = count,
            2 => report.stats.artists = count,
            3 => report.stats.albums = count,
            4 => report.stats.labels = count,
            5 => report.stats.keys = count,
            7 => report.stats.playlists = count,
            8 => report.stats.playlist_entries = count,
            _ => {}
        }
    }

    report
}

/// Walk one table's page chain, validating each page and collecting rows.
fn walk_chain(
    data: &[u8],
    kind: u32,
    first_page: u32,
    actual_pages: u32,
    report: &mut ValidationReport,
) -> Option<Vec<Vec<u8>>> {
    let slot = match row_len(kind) {
        Some(len) => len,
        None => {
            report.warning(format!("unknown table kind {}, skipping rows", kind));
            return None;
        }
    };

    let mut rows = Vec::new();
    let mut visited = HashSet::new();
    let mut page_idx = first_page;

    while page_idx != 0 {
        if !visited.insert(page_idx) {
            report.error(format!("page chain of table kind {} loops", kind));
            return None;
        }
        if page_idx >= actual_pages {
            report.error(format!(
                "chain of table kind {} leaves the file at page {}",
                kind, page_idx
            ));
            return None;
        }

        let page = &data[page_idx as usize * PAGE_LEN..(page_idx as usize + 1) * PAGE_LEN];
        let page_kind = le_u32(page, 0x00);
        if page_kind != kind {
            report.error(format!(
                "page {} carries kind {} inside a kind-{} chain",
                page_idx, page_kind, kind
            ));
        }

        let row_count = le_u16(page, 0x0C) as usize;
        let heap_offset = le_u16(page, 0x0E) as usize;
        let free = le_u32(page, 0x10) as usize;

        let rows_bytes = row_count * slot;
        let heap_bytes = PAGE_LEN.saturating_sub(heap_offset);
        if PAGE_HEADER_LEN + rows_bytes + free + heap_bytes != PAGE_LEN {
            report.error(format!(
                "page {} regions do not sum to the page length \
                 (header {} + rows {} + free {} + heap {})",
                page_idx, PAGE_HEADER_LEN, rows_bytes, free, heap_bytes
            ));
        }

        let mut previous_id: Option<u32> = None;
        for r in 0..row_count {
            let at = PAGE_HEADER_LEN + r * slot;
            if at + slot > heap_offset {
                report.error(format!("page {} row {} crosses into the heap", page_idx, r));
                break;
            }
            let row = &page[at..at + slot];

            // Primary ids must ascend within a page.
            let id = le_u32(row, primary_id_offset(kind));
            if let Some(prev) = previous_id {
                if id < prev {
                    report.error(format!(
                        "page {} rows out of order: id {} after {}",
                        page_idx, id, prev
                    ));
                }
            }
            previous_id = Some(id);

            // Heap pointers stay inside the heap region and reference
            // minimally encoded strings.
            for &ptr_at in heap_ptr_offsets(kind) {
                let ptr = le_u16(row, ptr_at) as usize;
                if ptr >= heap_bytes {
                    report.error(format!(
                        "page {} row {} heap pointer {} outside heap of {} bytes",
                        page_idx, r, ptr, heap_bytes
                    ));
                    continue;
                }
                match decode_string(&page[heap_offset + ptr..]) {
                    Some((text, consumed)) => {
                        if encoded_len(&text) != consumed {
                            report.error(format!(
                                "page {} row {} string {:?} not minimally encoded",
                                page_idx, r, text
                            ));
                        }
                    }
                    None => report.error(format!(
                        "page {} row {} heap pointer {} does not decode",
                        page_idx, r, ptr
                    )),
                }
            }

            rows.push(row.to_vec());
        }

        page_idx = le_u32(page, 0x04);
    }

    Some(rows)
}

/// Cross-table referential integrity.
fn check_references(tables: &[TableData], report: &mut ValidationReport) {
    let ids_of = |kind: u32| -> HashSet<u32> {
        tables
            .iter()
            .filter(|t| t.kind == kind)
            .flat_map(|t| t.rows.iter().map(|r| le_u32(r, primary_id_offset(kind))))
            .collect()
    };

    let genres = ids_of(1);
    let artists = ids_of(2);
    let albums = ids_of(3);
    let labels = ids_of(4);
    let keys = ids_of(5);
    let colours = ids_of(6);
    let tracks = ids_of(0);
    let playlists = ids_of(7);

    let refs: [(&str, usize, &HashSet<u32>); 6] = [
        ("artist", 0x08, &artists),
        ("album", 0x0C, &albums),
        ("genre", 0x10, &genres),
        ("label", 0x14, &labels),
        ("key", 0x18, &keys),
        ("colour", 0x30, &colours),
    ];

    for table in tables.iter().filter(|t| t.kind == 0) {
        for row in &table.rows {
            let track_id = le_u32(row, 0x04);
            for (name, offset, pool) in &refs {
                let id = le_u32(row, *offset);
                if id != 0 && !pool.contains(&id) {
                    report.error(format!(
                        "track {} references missing {} id {}",
                        track_id, name, id
                    ));
                }
            }
        }
    }

    for table in tables.iter().filter(|t| t.kind == 7) {
        for row in &table.rows {
            let node_id = le_u32(row, 0);
            let parent = le_u32(row, 4);
            if parent != 0 && !playlists.contains(&parent) {
                report.error(format!(
                    "tree node {} references missing parent {}",
                    node_id, parent
                ));
            }
        }
    }

    for table in tables.iter().filter(|t| t.kind == 8) {
        for row in &table.rows {
            let playlist_id = le_u32(row, 0);
            let track_id = le_u32(row, 4);
            if !playlists.contains(&playlist_id) {
                report.error(format!(
                    "playlist entry references missing playlist id {}",
                    playlist_id
                ));
            }
            if !tracks.contains(&track_id) {
                report.error(format!(
                    "playlist entry references missing track id {}",
                    track_id
                ));
            }
        }
    }
}

/// Validate an ANLZ container: magic, declared lengths, section bounds.
pub fn validate_analysis(data: &[u8]) -> ValidationReport {
    let mut report = ValidationReport::default();

    if data.len() < 28 {
        report.error(format!("container truncated at {} bytes", data.len()));
        return report;
    }
    if &data[0..4] != b"PMAI" {
        report.error("missing PMAI magic".to_string());
        return report;
    }

    let header_len = be_u32(data, 4) as usize;
    if header_len != 28 {
        report.error(format!("container header length {} (expected 28)", header_len));
    }
    let file_len = be_u32(data, 8) as usize;
    if file_len != data.len() {
        report.error(format!(
            "declared file length {} but {} bytes present",
            file_len,
            data.len()
        ));
    }

    let mut offset = header_len.min(data.len());
    while offset < data.len() {
        if offset + 12 > data.len() {
            report.error(format!("trailing {} bytes are not a section", data.len() - offset));
            break;
        }
        let tag = &data[offset..offset + 4];
        if !tag.iter().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            report.error(format!("section tag {:?} at {} is not ASCII", tag, offset));
            break;
        }
        let total = be_u32(data, offset + 8) as usize;
        if total < 12 || offset + total > data.len() {
            report.error(format!(
                "section {} at {} declares {} bytes, exceeding the file",
                String::from_utf8_lossy(tag),
                offset,
                total
            ));
            break;
        }
        offset += total;
    }

    if offset != data.len() && report.errors.is_empty() {
        report.error("sections do not tile the container exactly".to_string());
    }

    report
}

/// Human-readable summary used by the CLI's validate subcommand.
pub fn summarize(report: &ValidationReport) -> String {
    let mut out = String::new();
    out.push_str(if report.is_valid() { "VALID\n" } else { "INVALID\n" });
    let s = &report.stats;
    if s.total_pages > 0 {
        out.push_str(&format!(
            "pages {} tracks {} artists {} albums {} genres {} labels {} keys {} \
             playlists {} entries {}\n",
            s.total_pages, s.tracks, s.artists, s.albums, s.genres, s.labels, s.keys,
            s.playlists, s.playlist_entries
        ));
    }
    for e in &report.errors {
        out.push_str(&format!("error: {}\n", e));
    }
    for w in &report.warnings {
        out.push_str(&format!("warning: {}\n", w));
    }
    out
}
