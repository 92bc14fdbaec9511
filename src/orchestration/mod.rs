// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Orchestration: the save pipeline (C11, §4.10) that turns a session's
//! accumulated fields and file positions into a bulk-index record, resets
//! the per-save accumulators, and drives final teardown.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::{
    indexer::Server,
    reassembly::ReassemblyAdapter,
    session::{Session, SessionFlags, SessionTable},
};

/// Serialize a session's current accumulated state into the bulk-insert
/// record shape the indexer expects: the file positions the session spans
/// plus every populated field, keyed by the field's declarative name.
fn session_to_bulk_record(session: &Session, registry: &crate::fields::FieldRegistry) -> Value {
    let mut fields = serde_json::Map::new();
    for (id, def) in registry_iter(registry) {
        if let Some(value) = session.fields.get(id) {
            fields.insert(def.name.to_string(), field_value_to_json(value));
        }
    }

    json!({
        "firstPacket": session.first_packet,
        "lastPacket": session.last_packet,
        "packetCount": session.packet_count,
        "byteCount": session.byte_count,
        "fileIds": session.file_num_array,
        "filePositions": session.file_pos_array.iter().map(|(id, off)| json!({"file": id, "pos": off})).collect::<Vec<_>>(),
        "fields": fields,
    })
}

fn registry_iter(registry: &crate::fields::FieldRegistry) -> Vec<(crate::fields::FieldId, crate::fields::FieldDef)> {
    let mut out = Vec::new();
    let mut id = 0;
    while let Some(def) = registry.get(id) {
        out.push((id, def.clone()));
        id += 1;
    }
    out
}

fn field_value_to_json(value: &crate::fields::FieldValue) -> Value {
    use crate::fields::FieldValue as V;
    match value {
        V::Int(i) => json!(i),
        V::IntArray(v) => json!(v),
        V::IntSet(v) => json!(v.iter().copied().collect::<Vec<_>>()),
        V::Float(f) => json!(f),
        V::FloatArray(v) => json!(v),
        V::Str(s) => json!(s),
        V::StrArray(v) => json!(v),
        V::StrHash(v) => json!(v),
        V::StrSet(v) => json!(v.iter().cloned().collect::<Vec<_>>()),
        V::Ip(ip) => json!(ip.to_string()),
        V::IpSet(v) => json!(v.iter().map(|ip| ip.to_string()).collect::<Vec<_>>()),
        V::CertsInfo(certs) => json!(certs
            .iter()
            .map(|c| json!({
                "issuerCN": c.issuer.common_names,
                "issuerON": c.issuer.organization,
                "subjectCN": c.subject.common_names,
                "subjectON": c.subject.organization,
                "altNames": c.subject_alt_names,
                "serial": hex::encode(&c.serial_number),
            }))
            .collect::<Vec<_>>()),
    }
}

/// Mid-save (§4.10): emit the current accumulated state, then reset the
/// per-save accumulators (`filePosArray`/`fileNumArray`/initial tags) so
/// the session keeps accruing fresh state, and move it to the tail of its
/// save-order queue via `SessionTable::touch`.
pub async fn mid_save(
    session: &mut Session,
    registry: &crate::fields::FieldRegistry,
    indexer: &Server,
    now: u32,
) -> anyhow::Result<()> {
    let record = session_to_bulk_record(session, registry);
    let body = serde_json::to_vec(&record)?;
    debug!(session_hash = session.id.hash(), bytes = body.len(), "mid-save");
    let (status, _body) = indexer.send_sync("POST", "/sessions/_bulk", &body).await?;
    if !(200..300).contains(&status) {
        anyhow::bail!("indexer rejected mid-save record: status {status}");
    }
    session.reset_after_save(now);
    Ok(())
}

/// Final save (§4.10): as `mid_save`, plus removal from the table's hash
/// and LRU queues (the caller has already called `SessionTable::remove`
/// and hands the owned `Session` here), and teardown of any attached
/// parser state. If `outstanding_tags > 0` the caller must not call this
/// yet — §4.10 detaches the session and marks `NEED_SAVE` until the
/// tag-resolution callback's counter reaches zero instead.
pub async fn final_save(
    mut session: Session,
    registry: &crate::fields::FieldRegistry,
    indexer: &Server,
    reassembly: &mut ReassemblyAdapter,
    now: u32,
) -> anyhow::Result<()> {
    reassembly.teardown(&mut session);
    let record = session_to_bulk_record(&session, registry);
    let body = serde_json::to_vec(&record)?;
    debug!(session_hash = session.id.hash(), bytes = body.len(), "final-save");
    let (status, _body) = indexer.send_sync("POST", "/sessions/_bulk", &body).await?;
    if !(200..300).contains(&status) {
        anyhow::bail!("indexer rejected final-save record: status {status}");
    }
    session.reset_after_save(now);
    Ok(())
}

/// If a session has outstanding tag-resolution callbacks pending, §4.10
/// says to detach it from the LRU and mark it `NEED_SAVE` rather than emit
/// immediately; the actual final-save runs later once the tag-resolution
/// callback's counter reaches zero.
pub fn defer_final_save_for_outstanding_tags(session: &mut Session) -> bool {
    if session.outstanding_tags > 0 {
        session.flags.insert(SessionFlags::NEED_SAVE);
        true
    } else {
        false
    }
}

/// `can_quit`: true only when every packet thread's writer queue is empty,
/// every indexer's queue is empty, and the session table is empty (§4.10).
pub fn can_quit(table: &SessionTable, writer_queue_lengths: &[usize], indexer_servers: &[Arc<Server>]) -> bool {
    table.is_empty()
        && writer_queue_lengths.iter().all(|&n| n == 0)
        && indexer_servers.iter().all(|s| s.queue_length() == 0)
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::{
        fields::{FieldDef, FieldFlags, FieldRegistry},
        session::{Protocol, SessionId},
    };

    fn session() -> Session {
        let id = SessionId::new(6, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 80);
        Session::new(id, Protocol::Tcp, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 80, 0)
    }

    #[test]
    fn bulk_record_includes_populated_fields_only() {
        let mut registry = FieldRegistry::new();
        let host_id = registry.register(FieldDef {
            name: "host",
            flags: FieldFlags::CNT,
            cap: 10,
        });
        let mut s = session();
        let def = registry.get(host_id).cloned().expect("def");
        s.fields.add_to_str_hash(host_id, &def, "example.com".to_string());

        let record = session_to_bulk_record(&s, &registry);
        assert_eq!(record["fields"]["host"][0], "example.com");
    }

    #[test]
    fn mid_save_resets_file_position_accumulators() {
        let mut s = session();
        s.record_file_position(1, 0);
        s.record_file_position(1, 100);
        assert_eq!(s.file_pos_array.len(), 2);
        s.reset_after_save(10);
        assert!(s.file_pos_array.is_empty());
        assert!(s.file_num_array.is_empty());
        assert_eq!(s.last_save, 10);
    }

    #[test]
    fn outstanding_tags_defer_final_save() {
        let mut s = session();
        s.outstanding_tags = 2;
        assert!(defer_final_save_for_outstanding_tags(&mut s));
        assert!(s.flags.contains(SessionFlags::NEED_SAVE));
    }

    #[test]
    fn can_quit_requires_every_queue_empty() {
        let table = SessionTable::new();
        assert!(can_quit(&table, &[0, 0], &[]));
        assert!(!can_quit(&table, &[1, 0], &[]));
    }
}
