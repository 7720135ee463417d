//! DeviceSQL string encoding
//!
//! Database strings come in three shapes, selected by content:
//!
//! - short ASCII (body up to 126 bytes): one prefix byte
//!   `(body_len + 1) * 2 + 1`, then the ASCII bytes. The low bit of the
//!   prefix flags the short form.
//! - long ASCII: `0x40`, a little-endian u16 covering everything after the
//!   prefix byte, the ASCII bytes, one reserved zero byte.
//! - wide: `0x90`, the same u16 length field, UTF-16BE bytes.
//!
//! The writer always picks the smallest shape that fits.

/// Maximum body length expressible in the short ASCII form.
const MAX_SHORT_ASCII: usize = 126;

const FLAG_LONG_ASCII: u8 = 0x40;
const FLAG_WIDE: u8 = 0x90;

/// Encode a string in DeviceSQL format, choosing the minimal shape.
pub fn encode_string(s: &str) -> Vec<u8> {
    let is_ascii = s.is_ascii();

    if is_ascii && s.len() <= MAX_SHORT_ASCII {
        let mut out = Vec::with_capacity(1 + s.len());
        out.push(((s.len() as u8 + 1) << 1) | 1);
        out.extend_from_slice(s.as_bytes());
        out
    } else if is_ascii {
        // Length field spans itself, the body and the reserved zero byte.
        let field_len = (2 + s.len() + 1) as u16;
        let mut out = Vec::with_capacity(1 + field_len as usize);
        out.push(FLAG_LONG_ASCII);
        out.extend_from_slice(&field_len.to_le_bytes());
        out.extend_from_slice(s.as_bytes());
        out.push(0x00);
        out
    } else {
        let body: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        let field_len = (2 + body.len()) as u16;
        let mut out = Vec::with_capacity(1 + field_len as usize);
        out.push(FLAG_WIDE);
        out.extend_from_slice(&field_len.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }
}

/// Byte length `encode_string` would produce, without allocating.
pub fn encoded_len(s: &str) -> usize {
    if s.is_ascii() && s.len() <= MAX_SHORT_ASCII {
        1 + s.len()
    } else if s.is_ascii() {
        1 + 2 + s.len() + 1
    } else {
        1 + 2 + s.encode_utf16().count() * 2
    }
}

/// Decode a DeviceSQL string starting at `bytes[0]`.
///
/// Returns the decoded text and the number of bytes consumed, or `None`
/// when the buffer is truncated or the prefix is unrecognised.
pub fn decode_string(bytes: &[u8]) -> Option<(String, usize)> {
    let prefix = *bytes.first()?;

    if prefix & 1 == 1 {
        let body_len = (prefix as usize - 1) / 2;
        let body_len = body_len.checked_sub(1)?;
        let body = bytes.get(1..1 + body_len)?;
        return Some((String::from_utf8_lossy(body).into_owned(), 1 + body_len));
    }

    let field_len = u16::from_le_bytes([*bytes.get(1)?, *bytes.get(2)?]) as usize;
    match prefix {
        FLAG_LONG_ASCII => {
            // Field covers the u16, the body and the trailing zero.
            let body_len = field_len.checked_sub(3)?;
            let body = bytes.get(3..3 + body_len)?;
            Some((String::from_utf8_lossy(body).into_owned(), 1 + field_len))
        }
        FLAG_WIDE => {
            let body_len = field_len.checked_sub(2)?;
            let body = bytes.get(3..3 + body_len)?;
            let units: Vec<u16> = body
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Some((String::from_utf16_lossy(&units), 1 + field_len))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string() {
        let encoded = encode_string("");
        assert_eq!(encoded, vec![0x03]);
    }

    #[test]
    fn test_short_ascii() {
        let encoded = encode_string("foo");
        // (3 + 1) * 2 + 1 = 9
        assert_eq!(encoded[0], 0x09);
        assert_eq!(&encoded[1..], b"foo");
    }

    #[test]
    fn test_short_boundary() {
        let s = "a".repeat(MAX_SHORT_ASCII);
        let encoded = encode_string(&s);
        assert_eq!(encoded.len(), 1 + MAX_SHORT_ASCII);
        assert_eq!(encoded[0] & 1, 1);

        let s = "a".repeat(MAX_SHORT_ASCII + 1);
        let encoded = encode_string(&s);
        assert_eq!(encoded[0], 0x40);
    }

    #[test]
    fn test_long_ascii() {
        let s = "b".repeat(200);
        let encoded = encode_string(&s);
        assert_eq!(encoded[0], 0x40);
        let field = u16::from_le_bytes([encoded[1], encoded[2]]) as usize;
        assert_eq!(field, 2 + 200 + 1);
        assert_eq!(&encoded[3..203], s.as_bytes());
        assert_eq!(encoded[203], 0x00);
    }

    #[test]
    fn test_wide_cafe() {
        let encoded = encode_string("Café");
        assert_eq!(encoded[0], 0x90);
        let field = u16::from_le_bytes([encoded[1], encoded[2]]);
        assert_eq!(field, 10);
        // UTF-16BE: 'C' = 00 43
        assert_eq!(&encoded[3..5], &[0x00, 0x43]);
        assert_eq!(encoded.len(), 11);
    }

    #[test]
    fn test_round_trip() {
        for s in ["", "A", "hello world", &"x".repeat(300), "Café", "日本語"] {
            let encoded = encode_string(s);
            let (decoded, used) = decode_string(&encoded).unwrap();
            assert_eq!(decoded, *s);
            assert_eq!(used, encoded.len());
            assert_eq!(encoded.len(), encoded_len(s));
        }
    }

    #[test]
    fn test_truncated_decode() {
        assert!(decode_string(&[]).is_none());
        assert!(decode_string(&[0x90, 0x0A]).is_none());
        assert!(decode_string(&[0x09, b'f']).is_none());
    }
}
