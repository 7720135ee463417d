//! Musical key translation
//!
//! The canonical key form is the source library's 24-value index
//! (0-11 major, 12-23 minor). The static tables below map each index to
//! Open-Key wheel notation, classical and flat-classical spellings, the
//! hardware vendor's wheel position and its database key id. Harmonic
//! relationships run on the wheel's numeric axis: neighbours are one step
//! apart, dominants two, and the relative key flips the A/B letter.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// Number of distinct key indices.
pub const KEY_COUNT: usize = 24;

/// Key notation formats understood by the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFormat {
    OpenKey,
    Classical,
    FlatClassical,
    VendorWheel,
}

/// Open-Key tokens by source key index.
const OPEN_KEY: [&str; KEY_COUNT] = [
    "8B", "3B", "10B", "5B", "12B", "7B", "2B", "9B", "4B", "11B", "6B", "1B",
    "5A", "12A", "7A", "2A", "9A", "4A", "11A", "6A", "1A", "8A", "3A", "10A",
];

/// Classical (sharp) spellings by source key index.
const CLASSICAL: [&str; KEY_COUNT] = [
    "F#", "A#", "D#", "G#", "C#", "F", "A", "D", "G", "C", "E", "B",
    "D#m", "Bbm", "Fm", "Cm", "Gm", "Dm", "Am", "Em", "Bm", "F#m", "C#m", "G#m",
];

/// Flat spellings by source key index.
const FLAT_CLASSICAL: [&str; KEY_COUNT] = [
    "Gb", "Bb", "Eb", "Ab", "Db", "F", "A", "D", "G", "C", "E", "B",
    "Ebm", "Bbm", "Fm", "Cm", "Gm", "Dm", "Am", "Em", "Bm", "Gbm", "Dbm", "Abm",
];

/// The hardware vendor numbers its wheel differently from Open-Key.
const VENDOR_WHEEL: [&str; KEY_COUNT] = [
    "7A", "2A", "9A", "4A", "11A", "6A", "1A", "8A", "3A", "10A", "5A", "12A",
    "4B", "11B", "6B", "1B", "8B", "3B", "10B", "5B", "12B", "7B", "2B", "9B",
];

/// Open-Key token to the vendor database key id (1-24; 0 means unknown).
const VENDOR_DB_IDS: [(&str, u32); KEY_COUNT] = [
    ("1A", 21), ("1B", 12), ("2A", 16), ("2B", 7), ("3A", 23), ("3B", 2),
    ("4A", 18), ("4B", 9), ("5A", 13), ("5B", 4), ("6A", 20), ("6B", 11),
    ("7A", 15), ("7B", 6), ("8A", 22), ("8B", 1), ("9A", 17), ("9B", 8),
    ("10A", 24), ("10B", 3), ("11A", 19), ("11B", 10), ("12A", 14), ("12B", 5),
];

/// Camelot wheel display colours, keyed by Open-Key token.
const WHEEL_COLOURS: [(&str, (u8, u8, u8)); KEY_COUNT] = [
    ("1A", (0xFF, 0x00, 0x00)), ("1B", (0xFF, 0x44, 0x44)),
    ("2A", (0xFF, 0x80, 0x00)), ("2B", (0xFF, 0x99, 0x44)),
    ("3A", (0xFF, 0xFF, 0x00)), ("3B", (0xFF, 0xFF, 0x44)),
    ("4A", (0x80, 0xFF, 0x00)), ("4B", (0x99, 0xFF, 0x44)),
    ("5A", (0x00, 0xFF, 0x00)), ("5B", (0x44, 0xFF, 0x44)),
    ("6A", (0x00, 0xFF, 0x80)), ("6B", (0x44, 0xFF, 0x99)),
    ("7A", (0x00, 0xFF, 0xFF)), ("7B", (0x44, 0xFF, 0xFF)),
    ("8A", (0x00, 0x80, 0xFF)), ("8B", (0x44, 0x99, 0xFF)),
    ("9A", (0x00, 0x00, 0xFF)), ("9B", (0x44, 0x44, 0xFF)),
    ("10A", (0x80, 0x00, 0xFF)), ("10B", (0x99, 0x44, 0xFF)),
    ("11A", (0xFF, 0x00, 0xFF)), ("11B", (0xFF, 0x44, 0xFF)),
    ("12A", (0xFF, 0x00, 0x80)), ("12B", (0xFF, 0x44, 0x99)),
];

static REVERSE_MAPS: Lazy<HashMap<KeyFormat, HashMap<&'static str, u32>>> = Lazy::new(|| {
    let mut maps = HashMap::new();
    for (format, table) in [
        (KeyFormat::OpenKey, &OPEN_KEY),
        (KeyFormat::Classical, &CLASSICAL),
        (KeyFormat::FlatClassical, &FLAT_CLASSICAL),
        (KeyFormat::VendorWheel, &VENDOR_WHEEL),
    ] {
        let mut rev = HashMap::new();
        for (idx, token) in table.iter().enumerate() {
            // Flat and classical tables share natural-key spellings; the
            // first (major) index wins, as in reverse lookups generally.
            rev.entry(*token).or_insert(idx as u32);
        }
        maps.insert(format, rev);
    }
    maps
});

static VENDOR_DB_MAP: Lazy<HashMap<&'static str, u32>> =
    Lazy::new(|| VENDOR_DB_IDS.iter().copied().collect());

static COLOUR_MAP: Lazy<HashMap<&'static str, (u8, u8, u8)>> =
    Lazy::new(|| WHEEL_COLOURS.iter().copied().collect());

/// Direction for [`KeyTranslator::progression`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressionDirection {
    Up,
    Down,
    Harmonic,
}

/// Harmonically related keys for a given Open-Key token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarmonicNeighbours {
    /// Tokens that mix seamlessly: the key itself and its relative.
    pub perfect_matches: Vec<String>,
    /// One wheel step up, same mode.
    pub energy_up: Vec<String>,
    /// One wheel step down, same mode.
    pub energy_down: Vec<String>,
    /// Adjacent wheel positions, same mode.
    pub harmonic_matches: Vec<String>,
    /// Two wheel steps either way, same mode.
    pub dominant_matches: Vec<String>,
    /// The relative major/minor (A and B swapped).
    pub relative_key: String,
}

/// Stateless key translator over the static tables above.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyTranslator;

impl KeyTranslator {
    pub fn new() -> Self {
        Self
    }

    /// Translate a key index into the requested notation.
    pub fn to(&self, index: u32, format: KeyFormat) -> Result<&'static str> {
        let table = match format {
            KeyFormat::OpenKey => &OPEN_KEY,
            KeyFormat::Classical => &CLASSICAL,
            KeyFormat::FlatClassical => &FLAT_CLASSICAL,
            KeyFormat::VendorWheel => &VENDOR_WHEEL,
        };
        table
            .get(index as usize)
            .copied()
            .ok_or(Error::InvalidKeyIndex(index))
    }

    /// Translate a raw source key value (decimal index as text) into a
    /// notation token. Empty or non-numeric input yields an empty string.
    pub fn translate_raw(&self, raw: &str, format: KeyFormat) -> String {
        if raw.is_empty() {
            return String::new();
        }
        match raw.parse::<u32>() {
            Ok(idx) => self.to(idx, format).unwrap_or("").to_string(),
            Err(_) => String::new(),
        }
    }

    /// Recover the key index from a notation token.
    pub fn index_of(&self, token: &str, format: KeyFormat) -> Option<u32> {
        REVERSE_MAPS.get(&format)?.get(token).copied()
    }

    /// The vendor database key id for an index (0 when out of range).
    pub fn vendor_db_id(&self, index: u32) -> u32 {
        match self.to(index, KeyFormat::OpenKey) {
            Ok(token) => VENDOR_DB_MAP.get(token).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// The display name stored alongside the vendor database id.
    pub fn db_name(&self, index: u32) -> Result<&'static str> {
        self.to(index, KeyFormat::Classical)
    }

    /// Harmonic-mixing relationships for an Open-Key token.
    pub fn harmonic_neighbours(&self, open_key: &str) -> Result<HarmonicNeighbours> {
        let (number, letter) = parse_open_key(open_key)?;
        let relative = format!("{}{}", number, flip(letter));

        Ok(HarmonicNeighbours {
            perfect_matches: vec![format!("{}{}", number, letter), relative.clone()],
            energy_up: vec![format!("{}{}", step(number, 1), letter)],
            energy_down: vec![format!("{}{}", step(number, -1), letter)],
            harmonic_matches: vec![
                format!("{}{}", step(number, 1), letter),
                format!("{}{}", step(number, -1), letter),
            ],
            dominant_matches: vec![
                format!("{}{}", step(number, 2), letter),
                format!("{}{}", step(number, -2), letter),
            ],
            relative_key: relative,
        })
    }

    /// Suggested key sequence for a set, starting from `open_key`.
    pub fn progression(
        &self,
        open_key: &str,
        direction: ProgressionDirection,
    ) -> Result<Vec<String>> {
        let (number, letter) = parse_open_key(open_key)?;
        let flipped = flip(letter);

        let seq = match direction {
            ProgressionDirection::Up => vec![
                format!("{}{}", number, letter),
                format!("{}{}", number, flipped),
                format!("{}{}", step(number, 1), flipped),
                format!("{}{}", step(number, 1), letter),
                format!("{}{}", step(number, 2), letter),
            ],
            ProgressionDirection::Down => vec![
                format!("{}{}", number, letter),
                format!("{}{}", number, flipped),
                format!("{}{}", step(number, -1), flipped),
                format!("{}{}", step(number, -1), letter),
                format!("{}{}", step(number, -2), letter),
            ],
            ProgressionDirection::Harmonic => vec![
                format!("{}{}", number, letter),
                format!("{}{}", number, flipped),
                format!("{}{}", step(number, 1), letter),
                format!("{}{}", step(number, -1), letter),
            ],
        };
        Ok(seq)
    }

    /// Camelot wheel display colour for an Open-Key token.
    pub fn wheel_colour(&self, open_key: &str) -> Option<(u8, u8, u8)> {
        COLOUR_MAP.get(open_key).copied()
    }
}

fn parse_open_key(token: &str) -> Result<(u32, char)> {
    let letter = token
        .chars()
        .last()
        .filter(|c| *c == 'A' || *c == 'B')
        .ok_or_else(|| Error::Validation(format!("not an Open-Key token: {token:?}")))?;
    let number: u32 = token[..token.len() - 1]
        .parse()
        .map_err(|_| Error::Validation(format!("not an Open-Key token: {token:?}")))?;
    if !(1..=12).contains(&number) {
        return Err(Error::Validation(format!("wheel position out of range: {token:?}")));
    }
    Ok((number, letter))
}

fn flip(letter: char) -> char {
    if letter == 'A' {
        'B'
    } else {
        'A'
    }
}

/// Wheel arithmetic on the 1..=12 axis.
fn step(number: u32, delta: i32) -> u32 {
    ((number as i32 - 1 + delta).rem_euclid(12) + 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_round_trip_all_formats() {
        let t = KeyTranslator::new();
        for idx in 0..KEY_COUNT as u32 {
            let open = t.to(idx, KeyFormat::OpenKey).unwrap();
            assert_eq!(t.index_of(open, KeyFormat::OpenKey), Some(idx));
        }
    }

    #[test]
    fn test_out_of_range() {
        let t = KeyTranslator::new();
        assert!(matches!(
            t.to(24, KeyFormat::OpenKey),
            Err(Error::InvalidKeyIndex(24))
        ));
    }

    #[test]
    fn test_empty_raw_is_empty() {
        let t = KeyTranslator::new();
        assert_eq!(t.translate_raw("", KeyFormat::OpenKey), "");
        assert_eq!(t.translate_raw("abc", KeyFormat::OpenKey), "");
    }

    #[test]
    fn test_known_translations() {
        let t = KeyTranslator::new();
        assert_eq!(t.to(0, KeyFormat::OpenKey).unwrap(), "8B");
        assert_eq!(t.to(0, KeyFormat::Classical).unwrap(), "F#");
        assert_eq!(t.to(0, KeyFormat::FlatClassical).unwrap(), "Gb");
        assert_eq!(t.to(15, KeyFormat::Classical).unwrap(), "Cm");
        assert_eq!(t.to(15, KeyFormat::OpenKey).unwrap(), "2A");
    }

    #[test]
    fn test_vendor_db_ids() {
        let t = KeyTranslator::new();
        // 8B (index 0) is the vendor's id 1; 5A (index 12) is id 13.
        assert_eq!(t.vendor_db_id(0), 1);
        assert_eq!(t.vendor_db_id(12), 13);
        assert_eq!(t.vendor_db_id(99), 0);
    }

    #[test]
    fn test_relative_is_symmetric() {
        let t = KeyTranslator::new();
        for n in 1..=12 {
            let a = format!("{}A", n);
            let b = format!("{}B", n);
            let na = t.harmonic_neighbours(&a).unwrap();
            let nb = t.harmonic_neighbours(&b).unwrap();
            assert_eq!(na.relative_key, b);
            assert_eq!(nb.relative_key, a);
            assert!(na.perfect_matches.contains(&b));
            assert!(nb.perfect_matches.contains(&a));
        }
    }

    #[test]
    fn test_wheel_wraps() {
        let t = KeyTranslator::new();
        let n = t.harmonic_neighbours("12A").unwrap();
        assert_eq!(n.energy_up, vec!["1A".to_string()]);
        let n = t.harmonic_neighbours("1B").unwrap();
        assert_eq!(n.energy_down, vec!["12B".to_string()]);
        assert_eq!(n.dominant_matches, vec!["3B".to_string(), "11B".to_string()]);
    }

    #[test]
    fn test_progression_up() {
        let t = KeyTranslator::new();
        let p = t.progression("8A", ProgressionDirection::Up).unwrap();
        assert_eq!(p[0], "8A");
        assert_eq!(p[1], "8B");
        assert_eq!(p.len(), 5);
    }

    #[test]
    fn test_wheel_colour_known() {
        let t = KeyTranslator::new();
        assert_eq!(t.wheel_colour("1A"), Some((0xFF, 0x00, 0x00)));
        assert_eq!(t.wheel_colour("0X"), None);
    }
}
