// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Classifier and parser framework (C7, §4.6): the dispatcher that binds a
//! session to one or more parsers on first evidence, plus the bundled
//! concrete parsers (HTTP/1, HTTP/2, SMTP, TLS certificate sweep, DNS,
//! ISIS).

pub mod parser;
pub mod parsers;
pub mod registry;

use std::sync::Arc;

use crate::{
    classify::{
        parser::Parser,
        parsers::{dns, http1::Http1Parser, http2::Http2Parser, isis, smtp::SmtpParser, tls::TlsSweep},
        registry::{classify_tcp_buffer, ProtocolKind},
    },
    schema::SchemaRef,
    session::Session,
};

/// Stateless pattern matcher plus the bundled parser factory (§4.6). Holds
/// only the shared, read-only `SchemaRef` every parser needs to look up
/// field-ids; all per-session state lives in the attached `Parser`
/// instances themselves.
pub struct Classifier {
    schema: Arc<SchemaRef>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Classifier {
            schema: Arc::new(SchemaRef::build()),
        }
    }

    pub fn with_schema(schema: Arc<SchemaRef>) -> Self {
        Classifier { schema }
    }

    pub fn schema(&self) -> &Arc<SchemaRef> {
        &self.schema
    }

    /// Classify a newly-seen side-of-stream buffer, at most once per
    /// session (earliest-evidence-wins, §4.5). Returns the attached parser
    /// on a match so the reassembly adapter can register it.
    pub fn classify_tcp(&self, session: &mut Session, buf: &[u8]) -> Option<Box<dyn Parser>> {
        if session.classified {
            return None;
        }
        let kind = classify_tcp_buffer(buf)?;
        session.classified = true;
        session.attached_parsers.push(kind.tag().to_string());
        match kind {
            ProtocolKind::Http1 => Some(Box::new(Http1Parser::new(self.schema.clone()))),
            ProtocolKind::Http2 => Some(Box::new(Http2Parser::new(self.schema.clone()))),
            ProtocolKind::Smtp | ProtocolKind::Lmtp | ProtocolKind::Ftp => {
                Some(Box::new(SmtpParser::new(self.schema.clone())))
            }
            ProtocolKind::Tls => Some(Box::new(TlsSweep::new(self.schema.clone()))),
            // Ssh, Pop3, BitTorrent are tagged but have no bundled field
            // extractor in this implementation.
            _ => None,
        }
    }

    /// UDP content classification run directly from ingress (§4.4 step 5);
    /// currently only DNS on port 53.
    pub fn classify_udp(&self, session: &mut Session, dst_port: u16, payload: &[u8]) {
        if dst_port == 53 {
            dns::classify(session, &self.schema, payload);
        }
    }

    /// ISIS frames never carry an IP 5-tuple; byte 21 of the frame carries
    /// the PDU type (§4.6).
    pub fn classify_isis(&self, session: &mut Session, frame: &[u8]) {
        isis::classify(session, &self.schema, frame);
    }

    /// Re-classify a session after an HTTP `CONNECT`/`Upgrade: h2c`
    /// handoff (§4.6): forget the prior verdict so the next buffer can be
    /// matched against the full pattern table again.
    pub fn reclassify(&self, session: &mut Session) {
        session.classified = false;
    }
}

pub use parser::ParserAction;

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::session::{Protocol, SessionId};

    fn session() -> Session {
        let id = SessionId::new(6, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 80);
        Session::new(id, Protocol::Tcp, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 80, 0)
    }

    #[test]
    fn classify_tcp_attaches_http1_and_sets_tag_once() {
        let classifier = Classifier::new();
        let mut s = session();
        let parser = classifier.classify_tcp(&mut s, b"GET / HTTP/1.1\r\n");
        assert!(parser.is_some());
        assert!(s.classified);
        assert_eq!(s.attached_parsers, vec!["protocol:http".to_string()]);

        // Second call is a no-op: earliest-evidence-wins.
        let again = classifier.classify_tcp(&mut s, b"POST / HTTP/1.1\r\n");
        assert!(again.is_none());
        assert_eq!(s.attached_parsers.len(), 1);
    }
}
