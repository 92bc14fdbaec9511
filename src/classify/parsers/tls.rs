// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TLS certificate sweep (§4.6): walk SSL/TLS records looking for
//! handshake `Certificate` messages, then ASN.1-DER parse each
//! certificate for issuer/subject common names, organization, subject
//! alternative names and the serial number.
//!
//! The ASN.1 walk follows §9's design note: a TLV iterator returning
//! `(tag, payload)` pairs and leaving the remainder on the cursor, rather
//! than mutating pointers in place as the C original does.

use std::sync::Arc;

use crate::{
    classify::parser::{Parser, ParserAction},
    fields::{CertName, CertificateRecord},
    schema::SchemaRef,
    session::{Direction, Session},
};

const OID_COMMON_NAME: [u8; 3] = [0x55, 0x04, 0x03];
const OID_ORGANIZATION: [u8; 3] = [0x55, 0x04, 0x0A];
const OID_SUBJECT_ALT_NAME: [u8; 3] = [0x55, 0x1D, 0x11];
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_OID: u8 = 0x06;
const TAG_INTEGER: u8 = 0x02;
const TAG_DNS_NAME: u8 = 0x82; // context-specific primitive [2]

/// Parse one DER TLV at the front of `buf`, returning `(tag, content,
/// remainder)`.
fn parse_tlv(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let tag = *buf.first()?;
    let len_byte = *buf.get(1)? as usize;
    let (len, header_len) = if len_byte & 0x80 == 0 {
        (len_byte, 2)
    } else {
        let n = len_byte & 0x7f;
        if n == 0 || n > 4 {
            return None;
        }
        let bytes = buf.get(2..2 + n)?;
        let mut len = 0usize;
        for &b in bytes {
            len = (len << 8) | b as usize;
        }
        (len, 2 + n)
    };
    let content = buf.get(header_len..header_len + len)?;
    let rest = &buf[header_len + len..];
    Some((tag, content, rest))
}

/// Iterate sibling TLVs packed back-to-back inside `buf` (a SEQUENCE or
/// SET's content).
fn iter_tlvs(buf: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut cur = buf;
    std::iter::from_fn(move || {
        if cur.is_empty() {
            return None;
        }
        let (tag, content, rest) = parse_tlv(cur)?;
        cur = rest;
        Some((tag, content))
    })
}

/// Walk an RDNSequence (`Name ::= SEQUENCE OF RelativeDistinguishedName`,
/// a SEQUENCE of SETs) collecting commonName/organizationName attribute
/// values, lower-cased per §4.6.
fn parse_name(content: &[u8]) -> CertName {
    let mut name = CertName::default();
    for (set_tag, set_content) in iter_tlvs(content) {
        if set_tag != TAG_SET {
            continue;
        }
        for (seq_tag, seq_content) in iter_tlvs(set_content) {
            if seq_tag != TAG_SEQUENCE {
                continue;
            }
            let mut parts = iter_tlvs(seq_content);
            let Some((oid_tag, oid)) = parts.next() else {
                continue;
            };
            if oid_tag != TAG_OID {
                continue;
            }
            let Some((_, value)) = parts.next() else {
                continue;
            };
            let text = String::from_utf8_lossy(value).to_lowercase();
            if oid == OID_COMMON_NAME {
                name.common_names.push(text);
            } else if oid == OID_ORGANIZATION {
                name.organization = Some(text);
            }
        }
    }
    name
}

/// Walk the `extensions` SEQUENCE OF Extension for `subjectAltName`
/// `dNSName` entries.
fn parse_extensions(content: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    for (ext_tag, ext_content) in iter_tlvs(content) {
        if ext_tag != TAG_SEQUENCE {
            continue;
        }
        let mut parts = iter_tlvs(ext_content);
        let Some((oid_tag, oid)) = parts.next() else {
            continue;
        };
        if oid_tag != TAG_OID || oid != OID_SUBJECT_ALT_NAME {
            continue;
        }
        // Optional `critical BOOLEAN`, then `extnValue OCTET STRING`.
        let mut value = None;
        for (tag, payload) in parts {
            if tag == 0x04 {
                value = Some(payload);
            }
        }
        let Some(octet_string) = value else { continue };
        for (gn_tag, gn_value) in iter_tlvs(octet_string) {
            if gn_tag == TAG_DNS_NAME {
                names.push(String::from_utf8_lossy(gn_value).to_lowercase());
            }
        }
    }
    names
}

/// Parse one DER-encoded `Certificate` into the spec's §3 certificate
/// record shape.
pub fn parse_certificate(der: &[u8]) -> Option<CertificateRecord> {
    let (tag, cert_content, _) = parse_tlv(der)?;
    if tag != TAG_SEQUENCE {
        return None;
    }
    let (tbs_tag, tbs_content, _) = parse_tlv(cert_content)?;
    if tbs_tag != TAG_SEQUENCE {
        return None;
    }

    let mut cursor = tbs_content;
    // Optional explicit `version [0]` tag.
    let (first_tag, _, rest) = parse_tlv(cursor)?;
    if first_tag == 0xA0 {
        cursor = rest;
    }

    let (serial_tag, serial_raw, rest) = parse_tlv(cursor)?;
    if serial_tag != TAG_INTEGER {
        return None;
    }
    let serial_number = strip_der_integer_padding(serial_raw);
    cursor = rest;

    // signature AlgorithmIdentifier — skip.
    let (_, _, rest) = parse_tlv(cursor)?;
    cursor = rest;

    let (issuer_tag, issuer_content, rest) = parse_tlv(cursor)?;
    if issuer_tag != TAG_SEQUENCE {
        return None;
    }
    let issuer = parse_name(issuer_content);
    cursor = rest;

    // validity — skip.
    let (_, _, rest) = parse_tlv(cursor)?;
    cursor = rest;

    let (subject_tag, subject_content, rest) = parse_tlv(cursor)?;
    if subject_tag != TAG_SEQUENCE {
        return None;
    }
    let subject = parse_name(subject_content);
    cursor = rest;

    // subjectPublicKeyInfo — skip.
    let (_, _, rest) = parse_tlv(cursor)?;
    cursor = rest;

    let mut subject_alt_names = Vec::new();
    if let Some((ext_wrapper_tag, ext_wrapper_content, _)) = parse_tlv(cursor) {
        if ext_wrapper_tag == 0xA3 {
            if let Some((seq_tag, seq_content)) = iter_tlvs(ext_wrapper_content).next() {
                if seq_tag == TAG_SEQUENCE {
                    subject_alt_names = parse_extensions(seq_content);
                }
            }
        }
    }

    Some(CertificateRecord {
        issuer,
        subject,
        subject_alt_names,
        serial_number,
    })
}

fn strip_der_integer_padding(raw: &[u8]) -> Vec<u8> {
    if raw.len() > 1 && raw[0] == 0x00 && raw[1] & 0x80 != 0 {
        raw[1..].to_vec()
    } else {
        raw.to_vec()
    }
}

/// Does `buf` start with the TLS record header pattern the classifier
/// matches on (`{0x16, 0x03, 0x00..=0x03, ?, ?, 0x02}`)?
fn looks_like_handshake_record(buf: &[u8]) -> bool {
    buf.len() >= 6 && buf[0] == 0x16 && buf[1] == 0x03 && (0x00..=0x03).contains(&buf[2])
}

/// Walk one TLS record's handshake messages for a `Certificate` (0x0b)
/// message, extracting every DER certificate it carries.
fn extract_certificates_from_handshake(mut body: &[u8]) -> Vec<CertificateRecord> {
    let mut out = Vec::new();
    while body.len() >= 4 {
        let msg_type = body[0];
        let len = u32::from_be_bytes([0, body[1], body[2], body[3]]) as usize;
        let Some(msg_body) = body.get(4..4 + len) else {
            break;
        };
        if msg_type == 0x0b {
            out.extend(parse_certificate_list(msg_body));
        }
        body = &body[4 + len..];
    }
    out
}

fn parse_certificate_list(body: &[u8]) -> Vec<CertificateRecord> {
    let mut out = Vec::new();
    if body.len() < 3 {
        return out;
    }
    let total_len = u32::from_be_bytes([0, body[0], body[1], body[2]]) as usize;
    let mut cursor = body.get(3..3 + total_len).unwrap_or(&[]);
    while cursor.len() >= 3 {
        let cert_len = u32::from_be_bytes([0, cursor[0], cursor[1], cursor[2]]) as usize;
        let Some(der) = cursor.get(3..3 + cert_len) else {
            break;
        };
        if let Some(cert) = parse_certificate(der) {
            out.push(cert);
        }
        cursor = &cursor[3 + cert_len..];
    }
    out
}

/// Per-session TLS sweep state: buffers bytes per direction until a full
/// TLS record header + body is available, then extracts certificates
/// from `Certificate` handshake messages.
pub struct TlsSweep {
    schema: Arc<SchemaRef>,
    buffers: [Vec<u8>; 2],
    tagged: bool,
}

impl TlsSweep {
    pub fn new(schema: Arc<SchemaRef>) -> Self {
        TlsSweep {
            schema,
            buffers: [Vec::new(), Vec::new()],
            tagged: false,
        }
    }

    fn drain_records(&mut self, dir_idx: usize, session: &mut Session) {
        loop {
            let buf = &self.buffers[dir_idx];
            if buf.len() < 5 || !looks_like_handshake_record(buf) {
                return;
            }
            let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            if buf.len() < 5 + record_len {
                return;
            }
            let body = buf[5..5 + record_len].to_vec();
            let certs = extract_certificates_from_handshake(&body);
            if !certs.is_empty() {
                let def = self.schema.def(self.schema.ids.certs).clone();
                for cert in certs {
                    session.fields.add_certificate(self.schema.ids.certs, &def, cert);
                }
            }
            if !self.tagged {
                let tags_def = self.schema.def(self.schema.ids.tags).clone();
                session
                    .fields
                    .add_to_str_hash(self.schema.ids.tags, &tags_def, "protocol:tls".to_string());
                self.tagged = true;
            }
            self.buffers[dir_idx].drain(..5 + record_len);
        }
    }
}

impl Parser for TlsSweep {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn parse(&mut self, session: &mut Session, dir: Direction, bytes: &[u8]) -> ParserAction {
        let idx = match dir {
            Direction::Src => 0,
            Direction::Dst => 1,
        };
        self.buffers[idx].extend_from_slice(bytes);
        self.drain_records(idx, session);
        ParserAction::Continue
    }
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
        let id = SessionId::new(6, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 443);
        Session::new(id, Protocol::Tcp, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 443, 0)
    }

    fn der_len(len: usize) -> Vec<u8> {
        assert!(len < 128);
        vec![len as u8]
    }

    fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend(der_len(content.len()));
        out.extend_from_slice(content);
        out
    }

    fn build_test_certificate(subject_cn: &str, issuer_cn: &str, serial: u8) -> Vec<u8> {
        let serial_tlv = der_tlv(TAG_INTEGER, &[serial]);
        let sig_alg = der_tlv(TAG_SEQUENCE, &[]);
        let issuer_rdn = der_tlv(
            TAG_SET,
            &der_tlv(TAG_SEQUENCE, &{
                let mut a = der_tlv(TAG_OID, &OID_COMMON_NAME);
                a.extend(der_tlv(0x0c, issuer_cn.as_bytes()));
                a
            }),
        );
        let issuer = der_tlv(TAG_SEQUENCE, &issuer_rdn);
        let validity = der_tlv(TAG_SEQUENCE, &[]);
        let subject_rdn = der_tlv(
            TAG_SET,
            &der_tlv(TAG_SEQUENCE, &{
                let mut a = der_tlv(TAG_OID, &OID_COMMON_NAME);
                a.extend(der_tlv(0x0c, subject_cn.as_bytes()));
                a
            }),
        );
        let subject = der_tlv(TAG_SEQUENCE, &subject_rdn);
        let spki = der_tlv(TAG_SEQUENCE, &[]);

        let mut tbs_content = serial_tlv;
        tbs_content.extend(sig_alg.clone());
        tbs_content.extend(issuer);
        tbs_content.extend(validity);
        tbs_content.extend(subject);
        tbs_content.extend(spki);
        let tbs = der_tlv(TAG_SEQUENCE, &tbs_content);

        let mut cert_content = tbs;
        cert_content.extend(sig_alg.clone());
        cert_content.extend(der_tlv(0x03, &[0])); // signatureValue BIT STRING (empty-ish)
        der_tlv(TAG_SEQUENCE, &cert_content)
    }

    fn build_handshake_record(cert_der: &[u8]) -> Vec<u8> {
        let mut cert_list_entry = Vec::new();
        cert_list_entry.extend_from_slice(&(cert_der.len() as u32).to_be_bytes()[1..]);
        cert_list_entry.extend_from_slice(cert_der);

        let mut cert_list = Vec::new();
        cert_list.extend_from_slice(&(cert_list_entry.len() as u32).to_be_bytes()[1..]);
        cert_list.extend_from_slice(&cert_list_entry);

        let mut handshake_msg = vec![0x0b];
        handshake_msg.extend_from_slice(&(cert_list.len() as u32).to_be_bytes()[1..]);
        handshake_msg.extend_from_slice(&cert_list);

        let mut record = vec![0x16, 0x03, 0x03];
        record.extend_from_slice(&(handshake_msg.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake_msg);
        record
    }

    #[test]
    fn parses_single_certificate_subject_and_issuer_cn() {
        let der = build_test_certificate("a.test", "CA", 0x01);
        let cert = parse_certificate(&der).expect("parses");
        assert_eq!(cert.subject.common_names, vec!["a.test".to_string()]);
        assert_eq!(cert.issuer.common_names, vec!["ca".to_string()]);
        assert_eq!(cert.serial_number, vec![0x01]);
    }

    #[test]
    fn tls_sweep_extracts_cert_from_handshake_record_and_tags_session() {
        let schema = Arc::new(SchemaRef::build());
        let der = build_test_certificate("a.test", "CA", 0x01);
        let record = build_handshake_record(&der);

        let mut sweep = TlsSweep::new(schema.clone());
        let mut s = session();
        sweep.parse(&mut s, Direction::Dst, &record);

        match s.fields.get(schema.ids.certs) {
            Some(FieldValue::CertsInfo(v)) => {
                assert_eq!(v.len(), 1);
                assert_eq!(v[0].subject.common_names, vec!["a.test".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        match s.fields.get(schema.ids.tags) {
            Some(FieldValue::StrHash(v)) => assert!(v.contains(&"protocol:tls".to_string())),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
