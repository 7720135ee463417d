//! Path and filename sanitization for FAT32 / CDJ targets
//!
//! CDJ hardware reads FAT32 volumes and only displays ASCII, so every name
//! written to the export tree is reduced to that envelope first:
//! NFKD-decompose, drop the non-ASCII remainder, replace reserved
//! characters, dodge DOS device names, and keep basenames under 200 bytes
//! (full paths under 256).

use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, Result};

/// Maximum basename length in bytes after sanitization.
pub const MAX_BASENAME_BYTES: usize = 200;

/// Maximum full-path length in bytes on the target filesystem.
pub const MAX_PATH_BYTES: usize = 256;

/// Characters FAT32 refuses inside a name.
const RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Bare names DOS reserves for devices, case-insensitive.
const DOS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5",
    "COM6", "COM7", "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5",
    "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Sanitize a file basename, preserving its extension where possible.
///
/// Applies, in order: NFKD transliteration to ASCII, reserved-character
/// replacement, underscore-run collapsing, DOS reserved-name suffixing and
/// truncation to [`MAX_BASENAME_BYTES`]. Fails with
/// [`Error::PathUnrepresentable`] only when nothing printable survives.
pub fn sanitize_basename(name: &str) -> Result<String> {
    let cleaned = sanitize_component(name)?;
    Ok(truncate_keeping_extension(&cleaned, MAX_BASENAME_BYTES))
}

/// Sanitize a single path component (directory or file name) without
/// length truncation.
pub fn sanitize_component(name: &str) -> Result<String> {
    // NFKD splits accented characters into base + combining marks; keeping
    // only the ASCII subset afterwards is the best-effort transliteration.
    let ascii: String = name
        .nfkd()
        .filter(|c| c.is_ascii())
        .map(|c| {
            if RESERVED_CHARS.contains(&c) || c.is_ascii_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let collapsed = collapse_underscores(&ascii);
    let trimmed = collapsed.trim_matches(|c| c == ' ' || c == '.').to_string();

    if trimmed.is_empty() {
        return Err(Error::PathUnrepresentable(name.to_string()));
    }

    // A bare reserved name (optionally with an extension) confuses DOS-era
    // firmware; suffix the stem instead of renaming outright.
    let (stem, ext) = split_extension(&trimmed);
    if DOS_RESERVED.iter().any(|r| stem.eq_ignore_ascii_case(r)) {
        let mut fixed = format!("{}_", stem);
        if !ext.is_empty() {
            fixed.push('.');
            fixed.push_str(ext);
        }
        return Ok(fixed);
    }

    Ok(trimmed)
}

/// Shorten `basename` until `dir_len + 1 + basename` fits in
/// [`MAX_PATH_BYTES`]. `dir_len` is the byte length of the directory
/// portion, without a trailing separator.
pub fn fit_path(dir_len: usize, basename: &str) -> Result<String> {
    let budget = MAX_PATH_BYTES
        .checked_sub(dir_len + 1)
        .ok_or_else(|| Error::PathUnrepresentable(basename.to_string()))?;

    if basename.len() <= budget {
        return Ok(basename.to_string());
    }

    let shortened = truncate_keeping_extension(basename, budget);
    if shortened.is_empty() || shortened.starts_with('.') && split_extension(&shortened).0.is_empty()
    {
        return Err(Error::PathUnrepresentable(basename.to_string()));
    }
    Ok(shortened)
}

fn collapse_underscores(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_underscore = false;
    for c in s.chars() {
        if c == '_' {
            if !last_was_underscore {
                out.push('_');
            }
            last_was_underscore = true;
        } else {
            out.push(c);
            last_was_underscore = false;
        }
    }
    out
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos + 1..]),
        _ => (name, ""),
    }
}

fn truncate_keeping_extension(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }

    let (stem, ext) = split_extension(name);
    if ext.is_empty() || ext.len() + 1 >= max_bytes {
        return take_bytes(name, max_bytes);
    }

    let stem_budget = max_bytes - ext.len() - 1;
    format!("{}.{}", take_bytes(stem, stem_budget), ext)
}

/// Take at most `max` bytes without splitting a character. Input is ASCII
/// by the time this runs, so the boundary check is belt-and-braces.
fn take_bytes(s: &str, max: usize) -> String {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        assert_eq!(sanitize_basename("track01.mp3").unwrap(), "track01.mp3");
    }

    #[test]
    fn test_accent_transliteration() {
        assert_eq!(sanitize_basename("Café Del Mar.mp3").unwrap(), "Cafe Del Mar.mp3");
        assert_eq!(sanitize_basename("Über.flac").unwrap(), "Uber.flac");
    }

    #[test]
    fn test_reserved_chars_replaced_and_collapsed() {
        assert_eq!(sanitize_basename("a<b>c?.mp3").unwrap(), "a_b_c_.mp3");
        assert_eq!(sanitize_basename("a???b.mp3").unwrap(), "a_b.mp3");
    }

    #[test]
    fn test_control_chars() {
        assert_eq!(sanitize_basename("a\x01\x02b.mp3").unwrap(), "a_b.mp3");
    }

    #[test]
    fn test_dos_reserved() {
        assert_eq!(sanitize_basename("CON.mp3").unwrap(), "CON_.mp3");
        assert_eq!(sanitize_basename("aux").unwrap(), "aux_");
        assert_eq!(sanitize_basename("console.mp3").unwrap(), "console.mp3");
    }

    #[test]
    fn test_truncation_preserves_extension() {
        let long = format!("{}.mp3", "x".repeat(300));
        let out = sanitize_basename(&long).unwrap();
        assert!(out.len() <= MAX_BASENAME_BYTES);
        assert!(out.ends_with(".mp3"));
    }

    #[test]
    fn test_unrepresentable() {
        assert!(matches!(
            sanitize_basename("日本語"),
            Err(Error::PathUnrepresentable(_))
        ));
    }

    #[test]
    fn test_fit_path_shortens_basename() {
        let base = format!("{}.mp3", "y".repeat(100));
        let fitted = fit_path(200, &base).unwrap();
        assert!(200 + 1 + fitted.len() <= MAX_PATH_BYTES);
        assert!(fitted.ends_with(".mp3"));
    }

    #[test]
    fn test_fit_path_impossible() {
        assert!(fit_path(MAX_PATH_BYTES, "a.mp3").is_err());
    }
}
