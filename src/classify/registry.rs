// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Classifier registration (§4.6): parsers register `(protocol_name,
//! offset, match_bytes)` patterns keyed by transport. On each new
//! side-of-stream buffer every pattern whose `offset + len ≤ available`
//! is tested; the first match wins (earliest-evidence-wins, at-most-once
//! per session per §4.5).

/// The concrete protocols the classifier can recognize. HTTP method
/// tokens and the bare "HTTP" token both resolve to `Http1`; the TLS
/// record pattern resolves to `Tls`, etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Ssh,
    Smtp,
    Lmtp,
    Ftp,
    Pop3,
    BitTorrent,
    Tls,
    Http1,
    Http2,
    Dns,
    Isis,
}

impl ProtocolKind {
    pub fn tag(self) -> &'static str {
        match self {
            ProtocolKind::Ssh => "protocol:ssh",
            ProtocolKind::Smtp => "protocol:smtp",
            ProtocolKind::Lmtp => "protocol:lmtp",
            ProtocolKind::Ftp => "protocol:ftp",
            ProtocolKind::Pop3 => "protocol:pop3",
            ProtocolKind::BitTorrent => "protocol:bittorrent",
            ProtocolKind::Tls => "protocol:tls",
            ProtocolKind::Http1 => "protocol:http",
            ProtocolKind::Http2 => "protocol:http",
            ProtocolKind::Dns => "protocol:dns",
            ProtocolKind::Isis => "protocol:isis",
        }
    }
}

struct Pattern {
    offset: usize,
    bytes: &'static [u8],
    protocol: ProtocolKind,
}

/// The pattern table a TCP byte buffer is classified against, in
/// evidence-priority order. `HTTP method tokens` are listed individually
/// since the original matches each literally rather than via a generic
/// token scanner.
pub fn tcp_patterns() -> &'static [Pattern] {
    const PATTERNS: &[Pattern] = &[
        Pattern { offset: 0, bytes: b"SSH\0", protocol: ProtocolKind::Ssh },
        Pattern { offset: 0, bytes: b"HELO ", protocol: ProtocolKind::Smtp },
        Pattern { offset: 0, bytes: b"EHLO ", protocol: ProtocolKind::Smtp },
        Pattern { offset: 0, bytes: b"220 ", protocol: ProtocolKind::Smtp },
        Pattern { offset: 0, bytes: b"+OK POP3 ", protocol: ProtocolKind::Pop3 },
        Pattern { offset: 0, bytes: b"BitTorrent protocol", protocol: ProtocolKind::BitTorrent },
        Pattern { offset: 0, bytes: b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n", protocol: ProtocolKind::Http2 },
        Pattern { offset: 0, bytes: b"GET ", protocol: ProtocolKind::Http1 },
        Pattern { offset: 0, bytes: b"POST ", protocol: ProtocolKind::Http1 },
        Pattern { offset: 0, bytes: b"PUT ", protocol: ProtocolKind::Http1 },
        Pattern { offset: 0, bytes: b"HEAD ", protocol: ProtocolKind::Http1 },
        Pattern { offset: 0, bytes: b"DELETE ", protocol: ProtocolKind::Http1 },
        Pattern { offset: 0, bytes: b"CONNECT ", protocol: ProtocolKind::Http1 },
        Pattern { offset: 0, bytes: b"OPTIONS ", protocol: ProtocolKind::Http1 },
        Pattern { offset: 0, bytes: b"HTTP/1.", protocol: ProtocolKind::Http1 },
    ];
    PATTERNS
}

/// `Classifier::classify_tcp` in `super` also special-cases the TLS
/// record header (`{0x16, 0x03, 0x00..=0x03, ?, ?, 0x02}`) because the
/// fifth/sixth bytes are wildcards a literal byte pattern can't express.
pub fn is_tls_client_or_server_hello(buf: &[u8]) -> bool {
    buf.len() >= 6
        && buf[0] == 0x16
        && buf[1] == 0x03
        && (0x00..=0x03).contains(&buf[2])
        && buf[5] == 0x02
}

/// Classify a newly-seen side-of-stream buffer against the TCP pattern
/// table, returning the first match.
pub fn classify_tcp_buffer(buf: &[u8]) -> Option<ProtocolKind> {
    if is_tls_client_or_server_hello(buf) {
        return Some(ProtocolKind::Tls);
    }
    for pattern in tcp_patterns() {
        let end = pattern.offset + pattern.bytes.len();
        if end <= buf.len() && &buf[pattern.offset..end] == pattern.bytes {
            return Some(pattern.protocol);
        }
    }
    if buf.len() >= 4 && &buf[..4] == b"HTTP" {
        return Some(ProtocolKind::Http1);
    }
    None
}
