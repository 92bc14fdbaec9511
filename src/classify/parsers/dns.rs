// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! DNS classifier (§4.6): UDP port 53 queries, parsed just far enough to
//! pull question names into the session's `host` set. Grounded in the
//! spec's literal field-by-field description rather than a full RFC 1035
//! message parse — no response/answer-section handling, matching
//! `nids.c`'s direct `moloch_parser_dns` dispatch from ingress rather than
//! a registered classifier pattern.

use crate::{schema::SchemaRef, session::Session};

const HEADER_LEN: usize = 12;

/// Parse a DNS message's header + question section and, if it looks like a
/// query (high bit of the flags byte clear), push every qname into the
/// session's host set and tag the session `protocol:dns`.
pub fn classify(session: &mut Session, schema: &SchemaRef, payload: &[u8]) {
    if payload.len() < HEADER_LEN {
        return;
    }
    let flags_hi = payload[2];
    if flags_hi & 0x80 != 0 {
        // Not a query.
        return;
    }
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    if qdcount == 0 || qdcount > 10 {
        return;
    }

    let mut offset = HEADER_LEN;
    let mut any = false;
    for _ in 0..qdcount {
        match read_qname(payload, offset) {
            Some((name, next)) => {
                let host_def = schema.def(schema.ids.host).clone();
                session
                    .fields
                    .add_to_str_hash(schema.ids.host, &host_def, name);
                // Skip QTYPE(2) + QCLASS(2); stop if truncated.
                offset = next + 4;
                any = true;
                if offset > payload.len() {
                    break;
                }
            }
            None => break,
        }
    }

    if any {
        session.classified = true;
        let tags_def = schema.def(schema.ids.tags).clone();
        session
            .fields
            .add_to_str_hash(schema.ids.tags, &tags_def, "protocol:dns".to_string());
    }
}

/// Read one length-prefixed DNS name starting at `offset`, escaping
/// non-printable bytes (`\M-` for the high bit set, `^` + XOR'd byte for
/// control characters) per §4.6. Returns the decoded name and the offset
/// just past it.
fn read_qname(buf: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    loop {
        let len = *buf.get(offset)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        // Compression pointers are not expected in the question section of
        // a well-formed query; bail rather than loop forever.
        if len & 0xc0 == 0xc0 {
            return None;
        }
        offset += 1;
        let label = buf.get(offset..offset + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        for &b in label {
            escape_byte(&mut name, b);
        }
        offset += len;
    }
    Some((name, offset))
}

fn escape_byte(out: &mut String, b: u8) {
    if b & 0x80 != 0 {
        out.push_str("\\M-");
        out.push((b & 0x7f) as char);
    } else if b.is_ascii_control() {
        out.push('^');
        out.push((b ^ 0x40) as char);
    } else {
        out.push(b as char);
    }
}
