// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HTTP/2 parser (§4.6): enough of RFC 7540/7541 to pull `:method`,
//! `:authority`, `:path` and `:status` pseudo-headers out of HEADERS
//! frames on up to 16 concurrently tracked streams. Frame payloads are
//! not reassembled across TCP segments beyond an 8KB unparsed-bytes
//! buffer per direction; once that's exceeded the remainder of the
//! connection is left unparsed rather than buffered without bound.

use std::sync::Arc;

use crate::{
    classify::parser::{Parser, ParserAction},
    schema::SchemaRef,
    session::{Direction, Session},
};

const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const FRAME_HEADER_LEN: usize = 9;
const MAX_STREAMS: usize = 16;
const MAX_UNPARSED_BYTES: usize = 8192;

const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_HEADERS: u8 = 0x4;

#[derive(Default)]
struct Side {
    buf: Vec<u8>,
    skipped_preface: bool,
    /// Accumulated HEADERS+CONTINUATION payload, keyed by stream id, while
    /// `END_HEADERS` has not yet been seen.
    pending_headers: Vec<(u32, Vec<u8>)>,
    streams_seen: Vec<u32>,
    detached: bool,
}

impl Side {
    fn pending_for(&mut self, stream_id: u32) -> &mut Vec<u8> {
        if let Some(pos) = self.pending_headers.iter().position(|(id, _)| *id == stream_id) {
            &mut self.pending_headers[pos].1
        } else {
            self.pending_headers.push((stream_id, Vec::new()));
            let last = self.pending_headers.len() - 1;
            &mut self.pending_headers[last].1
        }
    }

    fn take_pending(&mut self, stream_id: u32) -> Vec<u8> {
        if let Some(pos) = self.pending_headers.iter().position(|(id, _)| *id == stream_id) {
            self.pending_headers.remove(pos).1
        } else {
            Vec::new()
        }
    }
}

/// Per-session HTTP/2 parser state.
pub struct Http2Parser {
    schema: Arc<SchemaRef>,
    sides: [Side; 2],
}

impl Http2Parser {
    pub fn new(schema: Arc<SchemaRef>) -> Self {
        Http2Parser {
            schema,
            sides: [Side::default(), Side::default()],
        }
    }

    fn emit_array(&self, session: &mut Session, id: crate::fields::FieldId, value: String) {
        let def = self.schema.def(id).clone();
        session.fields.add_to_array(id, &def, value);
    }

    fn emit_str_hash(&self, session: &mut Session, id: crate::fields::FieldId, value: String) {
        let def = self.schema.def(id).clone();
        session.fields.add_to_str_hash(id, &def, value);
    }

    /// Decode a minimal subset of HPACK (RFC 7541) sufficient for the
    /// literal-with-incremental-indexing and never-indexed representations
    /// curl/nginx/h2 commonly emit for pseudo-headers, plus the static
    /// table's fully-indexed `:method: GET` (idx 2) and `:method: POST`
    /// (idx 3) entries. Anything else is skipped byte-by-byte rather than
    /// tracked in a dynamic table, since field extraction (not a faithful
    /// decompressor) is the goal here.
    fn decode_pseudo_headers(block: &[u8]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < block.len() {
            let b = block[i];
            if b & 0x80 != 0 {
                // Indexed header field. Only the two static-table method
                // entries are resolved; others are skipped.
                let idx = b & 0x7f;
                match idx {
                    2 => out.push((":method".to_string(), "GET".to_string())),
                    3 => out.push((":method".to_string(), "POST".to_string())),
                    _ => {}
                }
                i += 1;
                continue;
            }
            if b & 0xc0 == 0x40 || b & 0xf0 == 0x00 {
                // Literal with (incremental indexing | without indexing):
                // name may be indexed (high bit set on the low nibble's
                // prefix) or a literal string; we only handle the literal
                // name case since pseudo-header names are always literal
                // on the wire from these encoders.
                i += 1;
                let Some((name, next)) = read_hpack_string(block, i) else {
                    break;
                };
                i = next;
                let Some((value, next)) = read_hpack_string(block, i) else {
                    break;
                };
                i = next;
                if name.starts_with(':') {
                    out.push((name, value));
                }
                continue;
            }
            // Unrecognized representation; bail rather than misparse.
            break;
        }
        out
    }

    fn handle_headers_frame(&mut self, session: &mut Session, dir_idx: usize, stream_id: u32, block: &[u8]) {
        if !self.sides[dir_idx].streams_seen.contains(&stream_id) {
            if self.sides[dir_idx].streams_seen.len() >= MAX_STREAMS {
                return;
            }
            self.sides[dir_idx].streams_seen.push(stream_id);
        }

        for (name, value) in Self::decode_pseudo_headers(block) {
            match name.as_str() {
                ":method" => self.emit_array(session, self.schema.ids.http_method, value),
                ":authority" => self.emit_str_hash(session, self.schema.ids.http_host, strip_authority_port(&value)),
                ":path" => {
                    let url = format!("//stream-{stream_id}{value}");
                    self.emit_str_hash(session, self.schema.ids.http_uri, url);
                }
                ":status" => self.emit_array(session, self.schema.ids.http_statuscode, value),
                _ => {}
            }
        }

        self.emit_str_hash(session, self.schema.ids.tags, "protocol:http".to_string());
    }
}

/// `:authority` carries `host:port` (or `[v6-literal]:port`); only the
/// host half is emitted into `http.host`, matching the §4.6 note that
/// "`:authority` (colon splits off port)" feeds the same field as the
/// HTTP/1 `Host` header (which spec scenario 1 expects bare).
fn strip_authority_port(authority: &str) -> String {
    if let Some(bracket_end) = authority.strip_prefix('[').and_then(|rest| rest.find(']')) {
        return authority[..bracket_end + 2].to_string();
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host.to_string(),
        _ => authority.to_string(),
    }
}

/// Read one HPACK string literal (a length byte, optionally Huffman-coded
/// per its high bit, followed by that many raw bytes). Huffman-coded
/// strings are not decoded, only skipped, since method/path/status values
/// from common encoders are frequently sent as raw literals for short
/// ASCII values.
fn read_hpack_string(buf: &[u8], pos: usize) -> Option<(String, usize)> {
    let len_byte = *buf.get(pos)?;
    let huffman = len_byte & 0x80 != 0;
    let len = (len_byte & 0x7f) as usize;
    let start = pos + 1;
    let end = start.checked_add(len)?;
    let raw = buf.get(start..end)?;
    if huffman {
        Some((String::new(), end))
    } else {
        Some((String::from_utf8_lossy(raw).into_owned(), end))
    }
}

impl Parser for Http2Parser {
    fn name(&self) -> &'static str {
        "http2"
    }

    fn parse(&mut self, session: &mut Session, dir: Direction, bytes: &[u8]) -> ParserAction {
        let dir_idx = match dir {
            Direction::Src => 0,
            Direction::Dst => 1,
        };

        if self.sides[dir_idx].detached {
            return ParserAction::Continue;
        }

        self.sides[dir_idx].buf.extend_from_slice(bytes);

        if !self.sides[dir_idx].skipped_preface
            && self.sides[dir_idx].buf.starts_with(CONNECTION_PREFACE)
        {
            self.sides[dir_idx].buf.drain(..CONNECTION_PREFACE.len());
            self.sides[dir_idx].skipped_preface = true;
        }

        loop {
            if self.sides[dir_idx].buf.len() < FRAME_HEADER_LEN {
                break;
            }
            let header = &self.sides[dir_idx].buf[..FRAME_HEADER_LEN];
            let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
            let frame_type = header[3];
            let flags = header[4];
            let stream_id = u32::from_be_bytes([header[5] & 0x7f, header[6], header[7], header[8]]);

            if self.sides[dir_idx].buf.len() < FRAME_HEADER_LEN + length {
                if self.sides[dir_idx].buf.len() > MAX_UNPARSED_BYTES {
                    self.sides[dir_idx].buf.clear();
                    self.sides[dir_idx].detached = true;
                    return ParserAction::Continue;
                }
                break;
            }

            let payload = self.sides[dir_idx].buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length].to_vec();

            if frame_type == FRAME_HEADERS || frame_type == FRAME_CONTINUATION {
                let fragment = if frame_type == FRAME_HEADERS && length > 0 {
                    let pad_len = if flags & 0x8 != 0 { payload[0] as usize } else { 0 };
                    let has_priority = flags & 0x20 != 0;
                    let skip = usize::from(flags & 0x8 != 0) + if has_priority { 5 } else { 0 };
                    payload.get(skip..payload.len().saturating_sub(pad_len)).unwrap_or(&[]).to_vec()
                } else {
                    payload.clone()
                };
                self.sides[dir_idx].pending_for(stream_id).extend_from_slice(&fragment);

                if flags & FLAG_END_HEADERS != 0 {
                    let block = self.sides[dir_idx].take_pending(stream_id);
                    self.handle_headers_frame(session, dir_idx, stream_id, &block);
                }
            }

            self.sides[dir_idx].buf.drain(..FRAME_HEADER_LEN + length);
        }

        ParserAction::Continue
    }

    fn save(&mut self, _session: &mut Session, _final_save: bool) {}

    fn free(&mut self, _session: &mut Session) {}
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::{
        fields::FieldValue,
        session::{Protocol, SessionId},
    };

    fn session() -> Session {
        let id = SessionId::new(6, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 80);
        Session::new(id, Protocol::Tcp, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 80, 0)
    }

    fn headers_frame(stream_id: u32, block: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        let len = block.len() as u32;
        frame.extend_from_slice(&len.to_be_bytes()[1..]);
        frame.push(FRAME_HEADERS);
        frame.push(FLAG_END_HEADERS);
        frame.extend_from_slice(&stream_id.to_be_bytes());
        frame.extend_from_slice(block);
        frame
    }

    fn literal_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = vec![0x00];
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(value.len() as u8);
        out.extend_from_slice(value.as_bytes());
        out
    }

    #[test]
    fn headers_frame_populates_path_and_authority() {
        let schema = Arc::new(SchemaRef::build());
        let mut parser = Http2Parser::new(schema.clone());
        let mut s = session();

        let mut block = literal_header(":method", "GET");
        block.extend(literal_header(":authority", "example.com"));
        block.extend(literal_header(":path", "/index"));
        let frame = headers_frame(1, &block);

        parser.parse(&mut s, Direction::Src, &frame);

        match s.fields.get(schema.ids.http_method) {
            Some(FieldValue::StrArray(v)) => assert_eq!(v, &["GET".to_string()]),
            other => panic!("unexpected: {other:?}"),
        }
        match s.fields.get(schema.ids.http_host) {
            Some(FieldValue::StrHash(v)) => assert_eq!(v, &["example.com".to_string()]),
            other => panic!("unexpected: {other:?}"),
        }
        match s.fields.get(schema.ids.http_uri) {
            Some(FieldValue::StrHash(v)) => assert!(v[0].contains("/index")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn authority_with_port_is_split_to_bare_host() {
        let schema = Arc::new(SchemaRef::build());
        let mut parser = Http2Parser::new(schema.clone());
        let mut s = session();

        let mut block = literal_header(":method", "GET");
        block.extend(literal_header(":authority", "example.com:8443"));
        block.extend(literal_header(":path", "/index"));
        let frame = headers_frame(1, &block);

        parser.parse(&mut s, Direction::Src, &frame);

        match s.fields.get(schema.ids.http_host) {
            Some(FieldValue::StrHash(v)) => assert_eq!(v, &["example.com".to_string()]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn split_frame_header_waits_for_more_bytes() {
        let schema = Arc::new(SchemaRef::build());
        let mut parser = Http2Parser::new(schema);
        let mut s = session();
        let action = parser.parse(&mut s, Direction::Src, &[0, 0]);
        assert_eq!(action, ParserAction::Continue);
        assert!(s.fields.get(0).is_none());
    }

    #[test]
    fn strip_authority_port_handles_plain_ipv6_and_portless_forms() {
        assert_eq!(strip_authority_port("example.com:443"), "example.com");
        assert_eq!(strip_authority_port("example.com"), "example.com");
        assert_eq!(strip_authority_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_authority_port("[::1]"), "[::1]");
    }
}
