//! Path codec: arbitrary Unicode path segments to filesystem-legal names.
//!
//! The scheme is part of the wire format and is locked: each segment's UTF-8
//! bytes are encoded as lowercase hex, and segments are joined with `-`.
//! Hex never contains `-`, so decoding splits unambiguously. The encoding is
//! total, reversible, safe on case-insensitive filesystems (no uppercase is
//! ever produced, and distinct inputs never differ only by case), and grows
//! by at most 2x plus one separator per segment.

/// Encode one path segment as lowercase hex of its UTF-8 bytes.
pub fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() * 2);
    for b in segment.as_bytes() {
        out.push(hex_digit(b >> 4));
        out.push(hex_digit(b & 0x0f));
    }
    out
}

/// Decode a segment produced by [`encode_segment`].
///
/// Returns `None` for odd-length input, non-hex characters, uppercase hex
/// (never produced by the encoder), or bytes that are not valid UTF-8.
pub fn decode_segment(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(name.len() / 2);
    let raw = name.as_bytes();
    for pair in raw.chunks(2) {
        bytes.push(hex_value(pair[0])? << 4 | hex_value(pair[1])?);
    }
    String::from_utf8(bytes).ok()
}

/// Encode a whole path as a single filename component.
///
/// The empty path encodes as the empty string, which is not a legal file
/// name; callers never materialize a file for it.
pub fn encode_path(path: &[String]) -> String {
    path.iter()
        .map(|s| encode_segment(s))
        .collect::<Vec<_>>()
        .join("-")
}

/// Decode a filename produced by [`encode_path`].
pub fn decode_path(name: &str) -> Option<Vec<String>> {
    if name.is_empty() {
        return Some(Vec::new());
    }
    name.split('-').map(decode_segment).collect()
}

fn hex_digit(nibble: u8) -> char {
    char::from_digit(nibble as u32, 16).expect("nibble is < 16")
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn roundtrips_ascii_and_unicode() {
        for p in [
            path(&["info"]),
            path(&["cats", "persian"]),
            path(&["ümläut", "犬", ""]),
            path(&["with-dash", "with/slash", ".."]),
        ] {
            let name = encode_path(&p);
            assert_eq!(decode_path(&name).as_ref(), Some(&p), "{name}");
        }
    }

    #[test]
    fn encoding_is_case_stable() {
        let name = encode_path(&path(&["Name", "name"]));
        assert_eq!(name, name.to_lowercase());
        assert_ne!(
            encode_segment("Name"),
            encode_segment("name"),
            "case must not collapse"
        );
    }

    #[test]
    fn rejects_foreign_names() {
        assert_eq!(decode_segment("xyz"), None);
        assert_eq!(decode_segment("6E"), None);
        assert_eq!(decode_segment("f"), None);
        assert_eq!(decode_path("696e666f-zz"), None);
    }

    #[test]
    fn empty_path_is_empty_string() {
        assert_eq!(encode_path(&[]), "");
        assert_eq!(decode_path(""), Some(Vec::new()));
    }
}
