// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Field store (C8): typed, multi-valued per-session attributes.
//!
//! Field-ids are assigned once at startup from a declarative registry
//! (`FieldRegistry`) and the store itself is just an array indexed by that
//! id, matching §4.7's "compact array indexed by field-id" design instead
//! of a name-keyed map on the hot path.

use std::{collections::HashSet, net::IpAddr};

/// A single field's value representation. Certificates get their own
/// dedicated type (`CertsInfo`) rather than folding into `StrHash` because
/// their equality/hash is a structural comparison over several sub-fields.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    IntArray(Vec<i64>),
    IntSet(HashSet<i64>),
    Float(f64),
    FloatArray(Vec<f64>),
    Str(String),
    StrArray(Vec<String>),
    /// Ordered-unique set: insertion order preserved, duplicates rejected.
    StrHash(Vec<String>),
    /// Unordered unique set.
    StrSet(HashSet<String>),
    Ip(IpAddr),
    IpSet(HashSet<IpAddr>),
    CertsInfo(Vec<CertificateRecord>),
}

bitflags::bitflags! {
    /// Field definition flags (§4.7).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u8 {
        /// Track cardinality alongside the value.
        const CNT        = 0b0000_0001;
        /// Coerce to UTF-8 on insert.
        const FORCE_UTF8 = 0b0000_0010;
        /// Transient: never emitted to the indexer.
        const NODB       = 0b0000_0100;
        /// Synthetic field populated by a regex match, not a parser.
        const FAKE       = 0b0000_1000;
        /// Store as a prefix index (CIDR-style) rather than an exact value.
        const IPPRE      = 0b0001_0000;
    }
}

/// A declarative field definition, registered once at process start.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: &'static str,
    pub flags: FieldFlags,
    /// Maximum number of values this field will retain; further `add`
    /// calls are silently dropped once reached (§4.7).
    pub cap: usize,
}

/// Issuer/subject each carry a set of common names plus an optional
/// organization, per §3's certificate record shape.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertName {
    pub common_names: Vec<String>,
    pub organization: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertificateRecord {
    pub issuer: CertName,
    pub subject: CertName,
    pub subject_alt_names: Vec<String>,
    pub serial_number: Vec<u8>,
}

impl CertificateRecord {
    /// Dedup key per §4.6: `(serialLen, issuer-CN-count, orgName-first-byte,
    /// subject-CN-count, …)` — cheap structural fingerprint rather than a
    /// full byte-for-byte hash of the DER, since Arkime's own dedup is
    /// intentionally approximate.
    pub fn dedup_key(&self) -> (usize, usize, u8, usize) {
        let org_first_byte = self
            .issuer
            .organization
            .as_ref()
            .and_then(|s| s.bytes().next())
            .unwrap_or(0);
        (
            self.serial_number.len(),
            self.issuer.common_names.len(),
            org_first_byte,
            self.subject.common_names.len(),
        )
    }
}

/// Registry of field definitions, indexed by field-id assigned in
/// registration order.
#[derive(Debug, Default)]
pub struct FieldRegistry {
    defs: Vec<FieldDef>,
}

pub type FieldId = usize;

impl FieldRegistry {
    pub fn new() -> Self {
        FieldRegistry { defs: Vec::new() }
    }

    pub fn register(&mut self, def: FieldDef) -> FieldId {
        self.defs.push(def);
        self.defs.len() - 1
    }

    pub fn get(&self, id: FieldId) -> Option<&FieldDef> {
        self.defs.get(id)
    }
}

/// Per-session typed field container, a sparse array over `FieldId`.
#[derive(Debug, Default)]
pub struct FieldStore {
    values: Vec<Option<FieldValue>>,
}

impl FieldStore {
    pub fn new() -> Self {
        FieldStore { values: Vec::new() }
    }

    fn ensure_capacity(&mut self, id: FieldId) {
        if self.values.len() <= id {
            self.values.resize(id + 1, None);
        }
    }

    pub fn get(&self, id: FieldId) -> Option<&FieldValue> {
        self.values.get(id).and_then(|v| v.as_ref())
    }

    pub fn set_scalar(&mut self, id: FieldId, value: FieldValue) {
        self.ensure_capacity(id);
        self.values[id] = Some(value);
    }

    /// Append to a list-typed field, enforcing `def.cap` by silently
    /// dropping once the cap is reached (§4.7).
    pub fn add_to_array(&mut self, id: FieldId, def: &FieldDef, item: String) {
        self.ensure_capacity(id);
        match &mut self.values[id] {
            Some(FieldValue::StrArray(v)) => {
                if v.len() < def.cap {
                    v.push(item);
                }
            }
            None => {
                self.values[id] = Some(FieldValue::StrArray(vec![item]));
            }
            _ => {}
        }
    }

    /// Append to an `INT_ARRAY` field, enforcing `def.cap`.
    pub fn add_to_int_array(&mut self, id: FieldId, def: &FieldDef, item: i64) {
        self.ensure_capacity(id);
        match &mut self.values[id] {
            Some(FieldValue::IntArray(v)) => {
                if v.len() < def.cap {
                    v.push(item);
                }
            }
            None => {
                self.values[id] = Some(FieldValue::IntArray(vec![item]));
            }
            _ => {}
        }
    }

    /// Insert into an ordered-unique set (`STR_HASH`), rejecting
    /// duplicates after normalization and respecting the field's cap.
    pub fn add_to_str_hash(&mut self, id: FieldId, def: &FieldDef, item: String) {
        let normalized = if def.flags.contains(FieldFlags::FORCE_UTF8) {
            String::from_utf8_lossy(item.as_bytes()).into_owned()
        } else {
            item
        };
        self.ensure_capacity(id);
        match &mut self.values[id] {
            Some(FieldValue::StrHash(v)) => {
                if v.len() < def.cap && !v.contains(&normalized) {
                    v.push(normalized);
                }
            }
            None => {
                self.values[id] = Some(FieldValue::StrHash(vec![normalized]));
            }
            _ => {}
        }
    }

    pub fn add_to_int_set(&mut self, id: FieldId, def: &FieldDef, item: i64) {
        self.ensure_capacity(id);
        match &mut self.values[id] {
            Some(FieldValue::IntSet(v)) => {
                if v.len() < def.cap {
                    v.insert(item);
                }
            }
            None => {
                self.values[id] = Some(FieldValue::IntSet(HashSet::from([item])));
            }
            _ => {}
        }
    }

    pub fn add_to_ip_set(&mut self, id: FieldId, def: &FieldDef, item: IpAddr) {
        self.ensure_capacity(id);
        match &mut self.values[id] {
            Some(FieldValue::IpSet(v)) => {
                if v.len() < def.cap {
                    v.insert(item);
                }
            }
            None => {
                self.values[id] = Some(FieldValue::IpSet(HashSet::from([item])));
            }
            _ => {}
        }
    }

    /// Insert a certificate record, de-duplicating by structural
    /// fingerprint (§4.6) and respecting the field's cap.
    pub fn add_certificate(&mut self, id: FieldId, def: &FieldDef, cert: CertificateRecord) {
        self.ensure_capacity(id);
        match &mut self.values[id] {
            Some(FieldValue::CertsInfo(v)) => {
                let key = cert.dedup_key();
                if v.len() < def.cap && !v.iter().any(|c| c.dedup_key() == key) {
                    v.push(cert);
                }
            }
            None => {
                self.values[id] = Some(FieldValue::CertsInfo(vec![cert]));
            }
            _ => {}
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_hash_def(cap: usize) -> FieldDef {
        FieldDef {
            name: "host",
            flags: FieldFlags::CNT,
            cap,
        }
    }

    #[test]
    fn str_hash_rejects_duplicates_after_first_insert() {
        let def = str_hash_def(10);
        let mut store = FieldStore::new();
        store.add_to_str_hash(0, &def, "example.com".into());
        store.add_to_str_hash(0, &def, "example.com".into());
        store.add_to_str_hash(0, &def, "other.com".into());
        match store.get(0) {
            Some(FieldValue::StrHash(v)) => assert_eq!(v, &["example.com", "other.com"]),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn str_hash_respects_cap() {
        let def = str_hash_def(1);
        let mut store = FieldStore::new();
        store.add_to_str_hash(0, &def, "a".into());
        store.add_to_str_hash(0, &def, "b".into());
        match store.get(0) {
            Some(FieldValue::StrHash(v)) => assert_eq!(v.len(), 1),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn certificate_dedup_by_structural_fingerprint() {
        let def = FieldDef {
            name: "certs",
            flags: FieldFlags::empty(),
            cap: 100,
        };
        let mut store = FieldStore::new();
        let cert = CertificateRecord {
            issuer: CertName {
                common_names: vec!["CA".into()],
                organization: None,
            },
            subject: CertName {
                common_names: vec!["a.test".into()],
                organization: None,
            },
            subject_alt_names: vec![],
            serial_number: vec![0x01],
        };
        store.add_certificate(0, &def, cert.clone());
        store.add_certificate(0, &def, cert);
        match store.get(0) {
            Some(FieldValue::CertsInfo(v)) => assert_eq!(v.len(), 1),
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
