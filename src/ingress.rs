// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Packet ingress (C5): turns raw frames into `Packet` records, computes
//! session identity, locates or creates the owning session, and dispatches
//! drop-hash/classification/writer work, per §4.4.

use std::net::IpAddr;

use tracing::info;

use crate::{
    classify::Classifier,
    drophash::DropHashGroup,
    session::{Protocol, Session, SessionId, SessionTable},
};

/// Per-protocol idle timeouts, defaults from §4.4.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub icmp_secs: Option<u32>,
    pub udp_secs: u32,
    pub tcp_secs: u32,
    pub tcp_save_secs: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            icmp_secs: None,
            udp_secs: 60,
            tcp_secs: 480,
            tcp_save_secs: 480,
        }
    }
}

/// A minimally parsed IPv4/IPv6 5-tuple, the input to session-id
/// construction. Full link/network-layer parsing is a capture-source
/// concern upstream of ingress; this struct is what survives it.
#[derive(Debug, Clone)]
pub struct FiveTuple {
    pub ip_protocol: u8,
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
}

pub struct IngressStats {
    pub packets_seen: u64,
    pub dropped_by_drophash: u64,
    pub log_every: u64,
}

impl IngressStats {
    pub fn new(log_every: u64) -> Self {
        IngressStats {
            packets_seen: 0,
            dropped_by_drophash: 0,
            log_every,
        }
    }

    fn note_packet(&mut self, queue_depth: usize) {
        self.packets_seen += 1;
        if self.log_every != 0 && self.packets_seen % self.log_every == 0 {
            info!(
                packets_seen = self.packets_seen,
                dropped_by_drophash = self.dropped_by_drophash,
                queue_depth,
                "ingress status"
            );
        }
    }
}

/// Outcome of routing one frame through ingress.
#[derive(Debug, PartialEq, Eq)]
pub enum IngressOutcome {
    Dropped,
    Processed,
}

/// One packet thread's ingress pipeline over its exclusive session-table
/// shard. ISIS frames are handled by the caller before reaching here,
/// since they never carry an IP 5-tuple (§4.4 step 1).
pub struct Ingress {
    pub table: SessionTable,
    pub timeouts: Timeouts,
    pub max_packets: usize,
    pub stats: IngressStats,
}

impl Ingress {
    pub fn new(timeouts: Timeouts, max_packets: usize, log_every: u64) -> Self {
        Ingress {
            table: SessionTable::new(),
            timeouts,
            max_packets,
            stats: IngressStats::new(log_every),
        }
    }

    /// Drive one packet through §4.4 steps 3-8 for a session-id this
    /// shard owns. `file_position` is the position the writer already
    /// assigned before this call, since the writer runs synchronously
    /// ahead of session bookkeeping in the "simple" writer strategy.
    /// `frame_len` is the on-wire frame length, accumulated into the
    /// session's byte counter (§3) the way `nids.c:551` does.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        tuple: &FiveTuple,
        payload: &[u8],
        now: u32,
        drophash: &DropHashGroup,
        classifier: &Classifier,
        file_id: u32,
        file_offset: u64,
        frame_len: u64,
    ) -> (IngressOutcome, Vec<Session>) {
        let protocol = Protocol::from_ip_protocol_number(tuple.ip_protocol);

        if protocol != Protocol::Icmp {
            let src_key = endpoint_key(tuple.src_addr);
            if drophash.should_drop(tuple.src_port, &src_key, now) {
                self.stats.dropped_by_drophash += 1;
                self.stats.note_packet(self.table.len());
                return (IngressOutcome::Dropped, Vec::new());
            }
            let dst_key = endpoint_key(tuple.dst_addr);
            if drophash.should_drop(tuple.dst_port, &dst_key, now) {
                self.stats.dropped_by_drophash += 1;
                self.stats.note_packet(self.table.len());
                return (IngressOutcome::Dropped, Vec::new());
            }
        }

        let id = SessionId::new(
            tuple.ip_protocol,
            tuple.src_addr,
            tuple.src_port,
            tuple.dst_addr,
            tuple.dst_port,
        );

        if self.table.find(&id).is_none() {
            let session = Session::new(
                id,
                protocol,
                tuple.src_addr,
                tuple.src_port,
                tuple.dst_addr,
                tuple.dst_port,
                now,
            );
            self.table.insert(session);
        }

        self.table.touch(&id, now);
        if let Some(session) = self.table.find_mut(&id) {
            session.byte_count += frame_len;
            session.packet_count += 1;
            session.record_file_position(file_id, file_offset);

            if protocol == Protocol::Udp && !session.classified {
                classifier.classify_udp(session, tuple.dst_port, payload);
            }
        }

        let evicted = self.drain_timeouts(now);
        self.stats.note_packet(self.table.len());
        (IngressOutcome::Processed, evicted)
    }

    /// Drain every protocol's LRU queue of sessions past their idle
    /// timeout (§4.4 step 8), returning the evicted sessions (already
    /// removed from the table) so the caller can run final-save and
    /// parser teardown on each.
    fn drain_timeouts(&mut self, now: u32) -> Vec<Session> {
        let mut evicted = Vec::new();
        if let Some(icmp_timeout) = self.timeouts.icmp_secs {
            evicted.extend(self.table.drain_stale(Protocol::Icmp, now, icmp_timeout));
        }
        evicted.extend(self.table.drain_stale(Protocol::Udp, now, self.timeouts.udp_secs));
        evicted.extend(self.table.drain_stale(Protocol::Tcp, now, self.timeouts.tcp_secs));
        evicted
    }
}

fn endpoint_key(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
