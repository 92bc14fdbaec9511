// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! ISIS classifier (§4.6): ethertype `0x83` frames all share the
//! aggregate session-id `{1, 0x83}` (§4.4 step 1) since ISIS has no IP
//! addressing to key on. Byte 21 of the frame carries the PDU type;
//! grounded in `parsers/isis.c`'s `pduType` switch.

use crate::{schema::SchemaRef, session::Session};

const PDU_TYPE_OFFSET: usize = 21;

/// PDU-type byte → human tag, per `isis.c`.
pub fn pdu_type_tag(pdu_type: u8) -> Option<&'static str> {
    match pdu_type {
        15 => Some("lan-l1-hello"),
        16 => Some("lan-l2-hello"),
        17 => Some("p2p-hello"),
        18 => Some("l1-lsp"),
        20 => Some("l2-lsp"),
        24 => Some("l1-csnp"),
        25 => Some("l2-csnp"),
        26 => Some("l1-psnp"),
        27 => Some("l2-psnp"),
        _ => None,
    }
}

/// Record the PDU type of one ISIS frame against the shared aggregate
/// session, tagging `protocol:isis`.
pub fn classify(session: &mut Session, schema: &SchemaRef, frame: &[u8]) {
    let Some(&pdu_type_byte) = frame.get(PDU_TYPE_OFFSET) else {
        return;
    };
    let Some(tag) = pdu_type_tag(pdu_type_byte) else {
        return;
    };
    let isis_def = schema.def(schema.ids.isis_type).clone();
    session
        .fields
        .add_to_array(schema.ids.isis_type, &isis_def, tag.to_string());

    let tags_def = schema.def(schema.ids.tags).clone();
    session
        .fields
        .add_to_str_hash(schema.ids.tags, &tags_def, "protocol:isis".to_string());
    session.classified = true;
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::{
        fields::FieldValue,
        session::{Protocol, SessionId},
    };

    fn aggregate_session() -> Session {
        let id = SessionId::isis_aggregate();
        Session::new(id, Protocol::Other(0x83), IpAddr::from([0, 0, 0, 0]), 0, IpAddr::from([0, 0, 0, 0]), 0, 0)
    }

    #[test]
    fn recognized_pdu_type_sets_tag() {
        let schema = SchemaRef::build();
        let mut s = aggregate_session();
        let mut frame = vec![0u8; 22];
        frame[PDU_TYPE_OFFSET] = 18;
        classify(&mut s, &schema, &frame);
        match s.fields.get(schema.ids.isis_type) {
            Some(FieldValue::StrArray(v)) => assert_eq!(v, &["l1-lsp".to_string()]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_pdu_type_is_ignored() {
        let schema = SchemaRef::build();
        let mut s = aggregate_session();
        let mut frame = vec![0u8; 22];
        frame[PDU_TYPE_OFFSET] = 99;
        classify(&mut s, &schema, &frame);
        assert!(s.fields.get(schema.ids.isis_type).is_none());
    }
}
