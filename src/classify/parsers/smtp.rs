// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SMTP parser (§4.6): a line-oriented command state machine tracking
//! `HELO`/`EHLO`, `MAIL FROM`, `RCPT TO`, `AUTH`, `STARTTLS`, and the
//! `Subject`/`Content-Type`/`Content-Disposition`/
//! `Content-Transfer-Encoding` headers of a `DATA` body, with a rolling
//! per-direction MD5 over base64 MIME parts.

use std::sync::Arc;

use md5::{Digest as _, Md5};

use crate::{
    classify::parser::{Parser, ParserAction},
    classify::parsers::codec::{decode_base64, decode_rfc2047},
    schema::SchemaRef,
    session::{Direction, Session},
};

#[derive(Default, PartialEq, Eq, Clone, Copy)]
enum DataState {
    #[default]
    Commands,
    Headers,
    Base64Body,
    PlainBody,
}

#[derive(Default)]
struct Side {
    line_buf: Vec<u8>,
    state: DataState,
    base64_md5: Option<Md5>,
}

/// Per-session SMTP parser state, one [`Side`] per direction (client
/// commands vs server replies share the same line-splitting logic; only
/// the client side carries command/body semantics).
pub struct SmtpParser {
    schema: Arc<SchemaRef>,
    sides: [Side; 2],
    starttls_seen: bool,
}

impl SmtpParser {
    pub fn new(schema: Arc<SchemaRef>) -> Self {
        SmtpParser {
            schema,
            sides: [Side::default(), Side::default()],
            starttls_seen: false,
        }
    }

    fn emit_str_hash(&self, session: &mut Session, id: crate::fields::FieldId, value: String) {
        let def = self.schema.def(id).clone();
        session.fields.add_to_str_hash(id, &def, value);
    }

    fn emit_tag(&self, session: &mut Session, tag: &str) {
        self.emit_str_hash(session, self.schema.ids.tags, tag.to_string());
    }

    fn handle_command_line(&mut self, session: &mut Session, dir_idx: usize, line: &str) {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let upper = trimmed.to_ascii_uppercase();

        if let Some(host) = upper.strip_prefix("HELO ").or_else(|| upper.strip_prefix("EHLO ")) {
            let host = trimmed[trimmed.len() - host.len()..].to_string();
            self.emit_str_hash(session, self.schema.ids.smtp_host, host);
        } else if let Some(rest) = upper.strip_prefix("MAIL FROM:") {
            let addr = extract_angle_addr(&trimmed[trimmed.len() - rest.len()..]);
            if let Some(addr) = addr {
                self.emit_str_hash(session, self.schema.ids.smtp_user, addr);
            }
        } else if let Some(rest) = upper.strip_prefix("RCPT TO:") {
            let addr = extract_angle_addr(&trimmed[trimmed.len() - rest.len()..]);
            if let Some(addr) = addr {
                self.emit_str_hash(session, self.schema.ids.smtp_user, addr);
            }
        } else if upper.starts_with("AUTH ") {
            self.emit_tag(session, "smtp:auth");
        } else if upper.starts_with("STARTTLS") {
            self.starttls_seen = true;
        } else if upper == "DATA" {
            self.sides[dir_idx].state = DataState::Headers;
        } else if trimmed == "." && self.sides[dir_idx].state != DataState::Commands {
            self.sides[dir_idx].state = DataState::Commands;
            self.sides[dir_idx].base64_md5 = None;
        }

        // A `2xx` reply to STARTTLS (on the server's direction) is the
        // actual handoff point; both directions are re-classified from the
        // byte immediately after.
        if self.starttls_seen && trimmed.starts_with("220") {
            session.needs_reclassify = true;
        }

        self.emit_tag(session, "protocol:smtp");
    }

    fn handle_header_line(&mut self, session: &mut Session, dir_idx: usize, line: &str) {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            self.sides[dir_idx].state = DataState::PlainBody;
            return;
        }
        let lower = trimmed.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("subject:") {
            let raw = trimmed[trimmed.len() - value.len()..].trim();
            let decoded = decode_rfc2047(raw);
            self.emit_str_hash(session, self.schema.ids.tags, format!("smtp:subject:{decoded}"));
        } else if lower.starts_with("content-type:") && lower.contains("boundary=") {
            self.emit_tag(session, "smtp:multipart");
        } else if lower.starts_with("content-disposition:") {
            if let Some(idx) = lower.find("filename=") {
                let rest = &trimmed[idx + "filename=".len()..];
                let filename = rest.trim_matches('"').split(|c| c == ';' || c == '\r').next().unwrap_or("");
                if !filename.is_empty() {
                    self.emit_str_hash(session, self.schema.ids.tags, format!("smtp:filename:{filename}"));
                }
            }
        } else if lower.starts_with("content-transfer-encoding:") && lower.contains("base64") {
            self.sides[dir_idx].state = DataState::Base64Body;
            self.sides[dir_idx].base64_md5 = Some(Md5::new());
        }
    }

    fn handle_body_line(&mut self, session: &mut Session, dir_idx: usize, line: &str) {
        if self.sides[dir_idx].state == DataState::Base64Body {
            if let Some(decoded) = decode_base64(line.trim_end().as_bytes()) {
                if let Some(ctx) = self.sides[dir_idx].base64_md5.as_mut() {
                    ctx.update(&decoded);
                    let digest = format!("{:x}", ctx.clone().finalize());
                    self.emit_str_hash(session, self.schema.ids.http_md5, digest);
                }
            }
        }
    }
}

/// Pull the address out of `MAIL FROM:<a@b>` / `RCPT TO:<a@b>`, tolerating
/// a missing closing bracket.
fn extract_angle_addr(rest: &str) -> Option<String> {
    let rest = rest.trim();
    let inner = rest.strip_prefix('<')?;
    let end = inner.find('>').unwrap_or(inner.len());
    let addr = &inner[..end];
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_string())
    }
}

impl Parser for SmtpParser {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn parse(&mut self, session: &mut Session, dir: Direction, bytes: &[u8]) -> ParserAction {
        let dir_idx = match dir {
            Direction::Src => 0,
            Direction::Dst => 1,
        };

        self.sides[dir_idx].line_buf.extend_from_slice(bytes);

        loop {
            let newline_pos = self.sides[dir_idx].line_buf.iter().position(|&b| b == b'\n');
            let Some(pos) = newline_pos else { break };
            let line_bytes = self.sides[dir_idx].line_buf[..=pos].to_vec();
            self.sides[dir_idx].line_buf.drain(..=pos);
            let line = String::from_utf8_lossy(&line_bytes).into_owned();

            match self.sides[dir_idx].state {
                DataState::Commands => self.handle_command_line(session, dir_idx, &line),
                DataState::Headers => self.handle_header_line(session, dir_idx, &line),
                DataState::Base64Body | DataState::PlainBody => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if trimmed == "." {
                        self.sides[dir_idx].state = DataState::Commands;
                        self.sides[dir_idx].base64_md5 = None;
                    } else {
                        self.handle_body_line(session, dir_idx, &line);
                    }
                }
            }

            if session.needs_reclassify {
                return ParserAction::Unregister;
            }
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
        let id = SessionId::new(6, IpAddr::from([10, 0, 0, 1]), 25000, IpAddr::from([10, 0, 0, 2]), 25);
        Session::new(id, Protocol::Tcp, IpAddr::from([10, 0, 0, 1]), 25000, IpAddr::from([10, 0, 0, 2]), 25, 0)
    }

    #[test]
    fn helo_and_mail_from_populate_fields() {
        let schema = Arc::new(SchemaRef::build());
        let mut parser = SmtpParser::new(schema.clone());
        let mut s = session();
        parser.parse(&mut s, Direction::Src, b"EHLO mail.example.com\r\n");
        parser.parse(&mut s, Direction::Src, b"MAIL FROM:<alice@example.com>\r\n");
        parser.parse(&mut s, Direction::Src, b"RCPT TO:<bob@example.com>\r\n");

        match s.fields.get(schema.ids.smtp_host) {
            Some(FieldValue::StrHash(v)) => assert_eq!(v, &["mail.example.com".to_string()]),
            other => panic!("unexpected: {other:?}"),
        }
        match s.fields.get(schema.ids.smtp_user) {
            Some(FieldValue::StrHash(v)) => {
                assert!(v.contains(&"alice@example.com".to_string()));
                assert!(v.contains(&"bob@example.com".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn starttls_followed_by_220_triggers_reclassify() {
        let schema = Arc::new(SchemaRef::build());
        let mut parser = SmtpParser::new(schema);
        let mut s = session();
        parser.parse(&mut s, Direction::Src, b"STARTTLS\r\n");
        let action = parser.parse(&mut s, Direction::Dst, b"220 2.0.0 Ready to start TLS\r\n");
        assert_eq!(action, ParserAction::Unregister);
        assert!(s.needs_reclassify);
    }

    #[test]
    fn subject_header_is_rfc2047_decoded() {
        let schema = Arc::new(SchemaRef::build());
        let mut parser = SmtpParser::new(schema.clone());
        let mut s = session();
        parser.parse(&mut s, Direction::Src, b"DATA\r\n");
        parser.parse(&mut s, Direction::Src, b"Subject: =?UTF-8?B?aGVsbG8=?=\r\n");
        match s.fields.get(schema.ids.tags) {
            Some(FieldValue::StrHash(v)) => assert!(v.iter().any(|t| t == "smtp:subject:hello")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
