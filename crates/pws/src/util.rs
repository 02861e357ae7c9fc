//! Small shared helpers: chunk dump formatting and conversation IDs.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng as _;

/// Render bytes for trace logs: runs of 4 or more printable ASCII bytes
/// (excluding `'`) become a `'quoted'` substring, everything else is
/// upper-case two-digit hex, tokens separated by spaces.
///
/// ```
/// assert_eq!(pws::printable_hex(b"\x80\x10abcde"), "80 10 'abcde'");
/// ```
pub fn printable_hex(data: &[u8]) -> String {
    fn quotable(b: u8) -> bool {
        (0x20..=0x7E).contains(&b) && b != b'\''
    }

    let mut tokens: Vec<String> = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let run = data[i..].iter().take_while(|&&b| quotable(b)).count();
        if run >= 4 {
            // the run is ASCII by construction
            let text = std::str::from_utf8(&data[i..i + run]).expect("ASCII run");
            tokens.push(format!("'{text}'"));
            i += run;
        } else {
            tokens.push(format!("{:02X}", data[i]));
            i += 1;
        }
    }
    tokens.join(" ")
}

/// Generate a 9-character URL-safe conversation ID.
///
/// Three 3-character base64url slices: one drawn from the current time in
/// milliseconds (41 bits of it), one from each of two random 32-bit words.
/// Short enough for a URL path segment, unique enough for concurrent
/// conversations against the same hub.
pub fn conversation_id() -> String {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
        & ((1 << 41) - 1);
    let mut rng = rand::thread_rng();
    let r1: u32 = rng.r#gen();
    let r2: u32 = rng.r#gen();
    format!(
        "{}{}{}",
        slice3(ms),
        slice3(u64::from(r1)),
        slice3(u64::from(r2))
    )
}

/// First 3 base64url characters (18 bits) of the low 24 bits of `v`.
fn slice3(v: u64) -> String {
    let bytes = [(v >> 16) as u8, (v >> 8) as u8, v as u8];
    let mut encoded = URL_SAFE_NO_PAD.encode(bytes);
    encoded.truncate(3);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_hex_quotes_runs_of_four_or_more() {
        assert_eq!(printable_hex(b"abc"), "61 62 63");
        assert_eq!(printable_hex(b"abcd"), "'abcd'");
        assert_eq!(printable_hex(b"\x01\x02abcde\x03"), "01 02 'abcde' 03");
    }

    #[test]
    fn printable_hex_excludes_quotes_and_non_printables() {
        // the apostrophe breaks the run: ab'cd is two 2-byte runs
        assert_eq!(printable_hex(b"ab'cd"), "61 62 27 63 64");
        assert_eq!(printable_hex(b"ab\ncdef"), "61 62 0A 'cdef'");
        assert_eq!(printable_hex(&[0x7F, 0xFF]), "7F FF");
        assert_eq!(printable_hex(b""), "");
    }

    #[test]
    fn printable_hex_keeps_spaces_inside_runs() {
        assert_eq!(printable_hex(b"hi there"), "'hi there'");
    }

    #[test]
    fn conversation_ids_are_nine_urlsafe_chars() {
        for _ in 0..50 {
            let id = conversation_id();
            assert_eq!(id.len(), 9, "{id:?}");
            assert!(
                id.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'),
                "{id:?}"
            );
        }
    }

    #[test]
    fn conversation_ids_do_not_collide_casually() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            assert!(seen.insert(conversation_id()));
        }
    }
}
