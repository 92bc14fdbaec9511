// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP reassembly adapter (C6, §4.5): for each TCP session, attaches as
//! the consumer of ordered half-stream buffers and drives the classifier
//! and attached parsers on every data event.
//!
//! A parser cannot live inside `Session` itself — a parser holding `&mut
//! Session` while itself owned by that session isn't expressible under
//! Rust's ownership rules — so attached parser trait objects live in this
//! adapter's own side-table, keyed by `SessionId`, exactly the
//! responsibility §4.5 assigns to "the adapter" rather than the session
//! record.

use std::collections::HashMap;

use crate::{
    classify::{Classifier, ParserAction},
    classify::parser::Parser,
    session::{Direction, Session, SessionId},
};

/// Per-session attached-parser side-table plus the drive logic §4.5
/// describes: classify at most once, hand ordered bytes to every attached
/// parser, detach on `Unregister`, and restart classification from
/// scratch after a parser-triggered protocol handoff (`CONNECT`,
/// `Upgrade: h2c`, `STARTTLS`).
#[derive(Default)]
pub struct ReassemblyAdapter {
    parsers: HashMap<SessionId, Vec<Box<dyn Parser>>>,
}

impl ReassemblyAdapter {
    pub fn new() -> Self {
        ReassemblyAdapter {
            parsers: HashMap::new(),
        }
    }

    /// Feed the bytes newly available on `dir` for `session` since the
    /// adapter last saw this session (§4.5's "`(data, count_new)` for the
    /// side that changed").
    pub fn on_data(&mut self, session: &mut Session, classifier: &Classifier, dir: Direction, new_bytes: &[u8]) {
        if new_bytes.is_empty() {
            return;
        }

        if session.needs_reclassify {
            self.parsers.remove(&session.id);
            session.needs_reclassify = false;
            session.classified = false;
            session.attached_parsers.clear();
        }

        if !session.classified {
            if let Some(parser) = classifier.classify_tcp(session, new_bytes) {
                self.parsers.entry(session.id).or_default().push(parser);
            }
        }

        let Some(mut attached) = self.parsers.remove(&session.id) else {
            return;
        };

        let mut still_attached = Vec::with_capacity(attached.len());
        for mut parser in attached.drain(..) {
            match parser.parse(session, dir, new_bytes) {
                ParserAction::Continue => still_attached.push(parser),
                ParserAction::Unregister => parser.free(session),
            }
        }

        if !still_attached.is_empty() {
            self.parsers.insert(session.id, still_attached);
        }
    }

    /// Drive `save(final_save)` on every parser attached to `session`,
    /// ahead of the mid-save/final-save orchestration step (§4.10).
    pub fn save(&mut self, session: &mut Session, final_save: bool) {
        if let Some(parsers) = self.parsers.get_mut(&session.id) {
            for parser in parsers.iter_mut() {
                parser.save(session, final_save);
            }
        }
    }

    /// Final "flush" call on teardown (§4.5): every attached parser gets
    /// exactly one `free` call before the session is saved and unlinked.
    pub fn teardown(&mut self, session: &mut Session) {
        if let Some(mut parsers) = self.parsers.remove(&session.id) {
            for parser in parsers.iter_mut() {
                parser.free(session);
            }
        }
    }

    /// Number of sessions currently carrying attached parser state, for
    /// diagnostics/tests.
    pub fn attached_session_count(&self) -> usize {
        self.parsers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::{
        fields::FieldValue,
        schema::SchemaRef,
        session::{Protocol, SessionId},
    };

    fn session() -> Session {
        let id = SessionId::new(6, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 80);
        Session::new(id, Protocol::Tcp, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 80, 0)
    }

    #[test]
    fn attaches_http1_and_populates_fields_across_both_directions() {
        let schema = std::sync::Arc::new(SchemaRef::build());
        let classifier = Classifier::with_schema(schema.clone());
        let mut adapter = ReassemblyAdapter::new();
        let mut s = session();

        adapter.on_data(&mut s, &classifier, Direction::Src, b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
        adapter.on_data(&mut s, &classifier, Direction::Dst, b"HTTP/1.1 200 OK\r\n\r\n");

        assert_eq!(adapter.attached_session_count(), 1);
        match s.fields.get(schema.ids.http_uri) {
            Some(FieldValue::StrHash(v)) => assert_eq!(v, &["//h/a".to_string()]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn connect_handoff_detaches_http1_and_reclassifies() {
        let schema = std::sync::Arc::new(SchemaRef::build());
        let classifier = Classifier::with_schema(schema);
        let mut adapter = ReassemblyAdapter::new();
        let mut s = session();

        adapter.on_data(&mut s, &classifier, Direction::Src, b"CONNECT host:443 HTTP/1.1\r\n\r\n");
        assert_eq!(adapter.attached_session_count(), 0);
        assert!(!s.classified);

        // A TLS client hello right after the handoff gets classified fresh.
        let hello = [0x16, 0x03, 0x03, 0x00, 0x10, 0x02, 0x00];
        adapter.on_data(&mut s, &classifier, Direction::Src, &hello);
        assert!(s.classified);
    }

    #[test]
    fn teardown_frees_every_attached_parser() {
        let schema = std::sync::Arc::new(SchemaRef::build());
        let classifier = Classifier::with_schema(schema);
        let mut adapter = ReassemblyAdapter::new();
        let mut s = session();
        adapter.on_data(&mut s, &classifier, Direction::Src, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(adapter.attached_session_count(), 1);
        adapter.teardown(&mut s);
        assert_eq!(adapter.attached_session_count(), 0);
    }
}
