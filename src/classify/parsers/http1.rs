// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HTTP/1.1 parser (§4.6): the same state machine runs on both
//! directions of the session. Request lines populate `method`/`uri`,
//! status lines populate `statuscode`; selected headers populate
//! `host`/`user-agent`/`cookie`/`user` (from `Authorization`)/`xff`. URL
//! assembly, `CONNECT` handoff and `Upgrade: h2c` handoff follow the
//! literal rules in §4.6.

use std::sync::Arc;

use md5::{Digest as _, Md5};

use crate::{
    classify::parser::{Parser, ParserAction},
    classify::parsers::codec::{decode_basic_auth, decode_digest_username},
    schema::SchemaRef,
    session::{Direction, Session},
};

const MAX_URL_LENGTH: usize = 4096;

#[derive(Default)]
struct HttpSide {
    buf: Vec<u8>,
    headers_done: bool,
    is_request: bool,
    method: Option<String>,
    request_uri: Option<String>,
    status_code: Option<u16>,
    host: Option<String>,
    is_connect: bool,
    upgrade_h2c: bool,
    body_md5: Option<Md5>,
    body_seen: bool,
}

/// Per-session HTTP/1.1 parser state, one [`HttpSide`] per direction.
pub struct Http1Parser {
    schema: Arc<SchemaRef>,
    sides: [HttpSide; 2],
}

impl Http1Parser {
    pub fn new(schema: Arc<SchemaRef>) -> Self {
        Http1Parser {
            schema,
            sides: [HttpSide::default(), HttpSide::default()],
        }
    }

    fn emit_str_hash(&self, session: &mut Session, id: crate::fields::FieldId, value: String) {
        let def = self.schema.def(id).clone();
        session.fields.add_to_str_hash(id, &def, value);
    }

    fn emit_array(&self, session: &mut Session, id: crate::fields::FieldId, value: String) {
        let def = self.schema.def(id).clone();
        session.fields.add_to_array(id, &def, value);
    }

    fn emit_tag(&self, session: &mut Session, tag: &str) {
        self.emit_str_hash(session, self.schema.ids.tags, tag.to_string());
    }

    /// Parse `raw` as a request line, tolerating trailing query strings and
    /// missing trailing CRLF (caller has already split the line off).
    fn parse_request_line(line: &str) -> Option<(String, String)> {
        let mut parts = line.splitn(3, ' ');
        let method = parts.next()?.to_string();
        let uri = parts.next()?.to_string();
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        Some((method, uri))
    }

    fn parse_status_line(line: &str) -> Option<u16> {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        parts.next()?.parse::<u16>().ok()
    }

    /// URL assembly per §4.6/§8: if the request-line URI is absolute and
    /// its ≤8-byte prefix matches the `Host` header value, emit as-is;
    /// otherwise join `host;path`. In both this implementation treats a
    /// path-only URI (the common case) as `//host/path`, matching the §8
    /// worked example `GET /a HTTP/1.1` + `Host: h` → `//h/a`.
    fn assemble_url(uri: &str, host: Option<&str>) -> String {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let host_prefix_matches = host.is_some_and(|h| {
                let prefix_len = h.len().min(8);
                uri.len() >= prefix_len && uri.contains(&h[..prefix_len])
            });
            if host_prefix_matches {
                return uri.to_string();
            }
            return format!("{};{}", host.unwrap_or(""), uri);
        }
        match host {
            Some(h) => format!("//{h}{uri}"),
            None => uri.to_string(),
        }
    }

    fn handle_headers_complete(
        &mut self,
        session: &mut Session,
        dir_idx: usize,
        headers: &[httparse::Header<'_>],
    ) {
        let mut host_value: Option<String> = None;
        let mut upgrade_h2c = false;
        for h in headers {
            let name = h.name.to_ascii_lowercase();
            let value = String::from_utf8_lossy(h.value).to_string();
            match name.as_str() {
                "host" => host_value = Some(value.clone()),
                "user-agent" => self.emit_str_hash(session, self.schema.ids.http_user_agent, value.clone()),
                "cookie" => self.emit_str_hash(session, self.schema.ids.http_cookie, value.clone()),
                "x-forwarded-for" => self.emit_str_hash(session, self.schema.ids.http_xff, value.clone()),
                "authorization" => {
                    let user = decode_basic_auth(&value).or_else(|| decode_digest_username(&value));
                    if let Some(user) = user {
                        self.emit_str_hash(session, self.schema.ids.http_authorization, user);
                    }
                }
                "upgrade" => {
                    if value.eq_ignore_ascii_case("h2c") {
                        upgrade_h2c = true;
                    }
                }
                _ => {}
            }
        }

        let side = &mut self.sides[dir_idx];
        side.host = host_value.clone();
        side.upgrade_h2c = upgrade_h2c;

        if let Some(host) = &host_value {
            let mut h = host.clone();
            if h.len() > MAX_URL_LENGTH {
                h.truncate(MAX_URL_LENGTH);
                self.emit_tag(session, "http:url-truncated");
            }
            self.emit_str_hash(session, self.schema.ids.http_host, h);
        }

        if side.is_request {
            if let (Some(method), Some(uri)) = (side.method.clone(), side.request_uri.clone()) {
                self.emit_array(session, self.schema.ids.http_method, method.clone());
                let mut url = Self::assemble_url(&uri, host_value.as_deref());
                if url.len() > MAX_URL_LENGTH {
                    url.truncate(MAX_URL_LENGTH);
                    self.emit_tag(session, "http:url-truncated");
                }
                self.emit_str_hash(session, self.schema.ids.http_uri, url);
                if method.eq_ignore_ascii_case("CONNECT") {
                    side.is_connect = true;
                }
            }
        } else if let Some(code) = side.status_code {
            self.emit_array(session, self.schema.ids.http_statuscode, code.to_string());
        }

        self.emit_tag(session, "protocol:http");
    }
}

impl Parser for Http1Parser {
    fn name(&self) -> &'static str {
        "http1"
    }

    fn parse(&mut self, session: &mut Session, dir: Direction, bytes: &[u8]) -> ParserAction {
        let dir_idx = match dir {
            Direction::Src => 0,
            Direction::Dst => 1,
        };

        self.sides[dir_idx].buf.extend_from_slice(bytes);

        if !self.sides[dir_idx].headers_done {
            let pos = self.sides[dir_idx]
                .buf
                .windows(4)
                .position(|w| w == b"\r\n\r\n");
            if let Some(pos) = pos {
                let head = self.sides[dir_idx].buf[..pos].to_vec();
                let body_start = pos + 4;
                let remainder = self.sides[dir_idx].buf[body_start..].to_vec();

                let first_line_end = head.iter().position(|&b| b == b'\n').unwrap_or(head.len());
                let first_line = String::from_utf8_lossy(&head[..first_line_end])
                    .trim_end_matches('\r')
                    .to_string();

                let mut header_storage = [httparse::EMPTY_HEADER; 64];
                let mut req = httparse::Request::new(&mut header_storage);
                let mut full = head.clone();
                full.extend_from_slice(b"\r\n\r\n");

                if let Some((method, uri)) = Self::parse_request_line(&first_line) {
                    self.sides[dir_idx].is_request = true;
                    self.sides[dir_idx].method = Some(method);
                    self.sides[dir_idx].request_uri = Some(uri);
                    let _ = req.parse(&full);
                    let headers: Vec<httparse::Header<'_>> =
                        req.headers.iter().filter(|h| !h.name.is_empty()).cloned().collect();
                    self.handle_headers_complete(session, dir_idx, &headers);
                } else if let Some(code) = Self::parse_status_line(&first_line) {
                    self.sides[dir_idx].is_request = false;
                    self.sides[dir_idx].status_code = Some(code);
                    let mut resp_storage = [httparse::EMPTY_HEADER; 64];
                    let mut resp = httparse::Response::new(&mut resp_storage);
                    let _ = resp.parse(&full);
                    let headers: Vec<httparse::Header<'_>> =
                        resp.headers.iter().filter(|h| !h.name.is_empty()).cloned().collect();
                    self.handle_headers_complete(session, dir_idx, &headers);
                } else {
                    // Not recognizable as either a request or status line;
                    // give up on this side without aborting the session.
                    self.sides[dir_idx].buf.clear();
                    return ParserAction::Continue;
                }

                self.sides[dir_idx].headers_done = true;
                self.sides[dir_idx].buf = remainder;

                if self.sides[dir_idx].is_connect || self.sides[dir_idx].upgrade_h2c {
                    session.needs_reclassify = true;
                    return ParserAction::Unregister;
                }
            } else {
                // Headers not complete yet; wait for more bytes.
                return ParserAction::Continue;
            }
        }

        // Body: fingerprint with MD5 on the first chunk seen.
        let body = std::mem::take(&mut self.sides[dir_idx].buf);
        if !body.is_empty() {
            let side = &mut self.sides[dir_idx];
            if !side.body_seen {
                side.body_md5 = Some(Md5::new());
                side.body_seen = true;
            }
            if let Some(ctx) = side.body_md5.as_mut() {
                ctx.update(&body);
                let digest = format!("{:x}", ctx.clone().finalize());
                self.emit_str_hash(session, self.schema.ids.http_md5, digest);
            }
        }

        ParserAction::Continue
    }

    fn save(&mut self, _session: &mut Session, _final_save: bool) {}

    fn free(&mut self, _session: &mut Session) {}
}
