//! Preview waveform synthesis
//!
//! The hardware expects every track to carry waveform payloads, but signal
//! analysis is out of scope here: BPM and key come from source metadata
//! and nothing decodes audio. Instead the columns are synthesised from an
//! xxh3 stream seeded by the track's source path, shaped by an attack /
//! sustain / fade envelope, so repeated exports of the same track are
//! byte-identical.

use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Preview column count (400 bytes in the PWAV payload).
pub const PREVIEW_COLUMNS: usize = 400;

/// Colour waveform entry count emitted into .EXT files.
pub const COLOUR_COLUMNS: usize = 400;

/// Monochrome preview: each byte packs amplitude in bits 0-4 and a
/// spectral colour class in bits 5-7.
pub fn preview_waveform(seed_key: &str) -> [u8; PREVIEW_COLUMNS] {
    let seed = xxh3_64_with_seed(seed_key.as_bytes(), 0);
    let mut columns = [0u8; PREVIEW_COLUMNS];

    for (i, column) in columns.iter_mut().enumerate() {
        let h = xxh3_64_with_seed(&(i as u64).to_le_bytes(), seed);
        let noise = (h & 0x0F) as u32;
        let amplitude = (envelope(i, PREVIEW_COLUMNS) * (16 + noise)) / 16;
        let colour = ((h >> 8) & 0x07) as u8;
        *column = (colour << 5) | (amplitude.min(31) as u8);
    }

    columns
}

/// Colour waveform entries, two big-endian bytes each:
/// red 15-13, green 12-10, blue 9-7, height 6-2.
pub fn colour_waveform(seed_key: &str) -> Vec<[u8; 2]> {
    let seed = xxh3_64_with_seed(seed_key.as_bytes(), 1);
    let mut entries = Vec::with_capacity(COLOUR_COLUMNS);

    for i in 0..COLOUR_COLUMNS {
        let h = xxh3_64_with_seed(&(i as u64).to_le_bytes(), seed);
        let noise = (h & 0x0F) as u32;
        let height = ((envelope(i, COLOUR_COLUMNS) * (16 + noise)) / 16).min(31) as u16;
        let red = ((h >> 4) & 0x07) as u16;
        let green = ((h >> 7) & 0x07) as u16;
        let blue = ((h >> 10) & 0x07) as u16;

        let value: u16 = (red << 13) | (green << 10) | (blue << 7) | (height << 2);
        entries.push(value.to_be_bytes());
    }

    entries
}

/// Peak amplitude (0..=31) at column `i` of `total`: quick attack over the
/// first 5%, sustain, fade over the last 10%.
fn envelope(i: usize, total: usize) -> u32 {
    let attack = total / 20;
    let fade = total / 10;
    let sustain_end = total - fade;

    if i < attack {
        (31 * (i + 1) / attack.max(1)) as u32
    } else if i >= sustain_end {
        (31 * (total - i) / fade.max(1)) as u32
    } else {
        31
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = preview_waveform("/music/track.mp3");
        let b = preview_waveform("/music/track.mp3");
        assert_eq!(a, b);

        let c = preview_waveform("/music/other.mp3");
        assert_ne!(a.to_vec(), c.to_vec());
    }

    #[test]
    fn test_amplitude_in_range() {
        for byte in preview_waveform("/x.mp3") {
            assert!(byte & 0x1F <= 31);
        }
    }

    #[test]
    fn test_envelope_shape() {
        // Fade region tapers to silence at the end.
        let wave = preview_waveform("/x.mp3");
        assert_eq!(wave[PREVIEW_COLUMNS - 1] & 0x1F, 0);
    }

    #[test]
    fn test_colour_entry_count() {
        assert_eq!(colour_waveform("/x.mp3").len(), COLOUR_COLUMNS);
    }
}
