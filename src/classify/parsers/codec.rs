// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Slice-consuming decoders shared by the SMTP and HTTP parsers (§9 design
//! note: never mutate the input, return `(decoded, remainder)`).

use base64::Engine;

/// Decode a base64 blob, tolerant of missing padding and trailing
/// whitespace (RFC-2047 encoded words and MIME base64 parts both omit
/// padding in the wild).
pub fn decode_base64(input: &[u8]) -> Option<Vec<u8>> {
    let trimmed: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(&trimmed)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(&trimmed))
        .ok()
}

/// Decode a quoted-printable byte string (RFC 2045 §6.7): `=XX` escapes a
/// byte, `=\r\n`/`=\n` is a soft line break that is dropped entirely.
pub fn decode_quoted_printable(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'=' {
            if input.get(i + 1) == Some(&b'\r') && input.get(i + 2) == Some(&b'\n') {
                i += 3;
                continue;
            }
            if input.get(i + 1) == Some(&b'\n') {
                i += 2;
                continue;
            }
            if let (Some(&h), Some(&l)) = (input.get(i + 1), input.get(i + 2)) {
                if let (Some(hv), Some(lv)) = (hex_val(h), hex_val(l)) {
                    out.push((hv << 4) | lv);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode RFC-2047 encoded words (`=?charset?B?...?=` / `=?charset?Q?...?=`)
/// appearing in a header value such as `Subject`. Unrecognized or malformed
/// encoded words are passed through verbatim.
pub fn decode_rfc2047(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' && bytes.get(i + 1) == Some(&b'?') {
            if let Some(end) = find_encoded_word_end(bytes, i) {
                let word = &input[i..end];
                if let Some(decoded) = decode_one_encoded_word(word) {
                    out.push_str(&decoded);
                    i = end;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn find_encoded_word_end(bytes: &[u8], start: usize) -> Option<usize> {
    let rest = &bytes[start..];
    let tail = rest.windows(2).position(|w| w == b"?=")?;
    Some(start + tail + 2)
}

fn decode_one_encoded_word(word: &str) -> Option<String> {
    let inner = word.strip_prefix("=?")?.strip_suffix("?=")?;
    let mut parts = inner.splitn(3, '?');
    let _charset = parts.next()?;
    let encoding = parts.next()?;
    let text = parts.next()?;
    let decoded_bytes = match encoding.to_ascii_uppercase().as_str() {
        "B" => decode_base64(text.as_bytes())?,
        "Q" => decode_quoted_printable(text.replace('_', " ").as_bytes()),
        _ => return None,
    };
    Some(String::from_utf8_lossy(&decoded_bytes).into_owned())
}

/// Split `Basic <base64>` credentials into `(user, pass)` at the first
/// `:`, per §4.6.
pub fn decode_basic_auth(value: &str) -> Option<String> {
    let b64 = value.strip_prefix("Basic ")?.trim();
    let decoded = decode_base64(b64.as_bytes())?;
    let text = String::from_utf8_lossy(&decoded);
    text.split_once(':').map(|(user, _)| user.to_string())
}

/// Extract the `username=` value from a `Digest ...` Authorization header,
/// handling both quoted and bare forms.
pub fn decode_digest_username(value: &str) -> Option<String> {
    let rest = value.strip_prefix("Digest ")?;
    let idx = rest.find("username=")?;
    let after = &rest[idx + "username=".len()..];
    if let Some(stripped) = after.strip_prefix('"') {
        stripped.split('"').next().map(|s| s.to_string())
    } else {
        after.split(',').next().map(|s| s.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_printable_decodes_soft_breaks_and_escapes() {
        let input = b"Hello=20World=\r\n=21";
        assert_eq!(decode_quoted_printable(input), b"Hello World!");
    }

    #[test]
    fn rfc2047_b_encoded_word_round_trips() {
        let encoded = "=?UTF-8?B?aGVsbG8=?=";
        assert_eq!(decode_rfc2047(encoded), "hello");
    }

    #[test]
    fn basic_auth_splits_at_first_colon() {
        // "alice:pa:ss" base64-encoded.
        let b64 = base64::engine::general_purpose::STANDARD.encode("alice:pa:ss");
        let header = format!("Basic {b64}");
        assert_eq!(decode_basic_auth(&header), Some("alice".to_string()));
    }

    #[test]
    fn digest_username_handles_quoted_form() {
        let header = r#"Digest username="bob", realm="x""#;
        assert_eq!(decode_digest_username(header), Some("bob".to_string()));
    }
}
