// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The session-id key and the `Session` record itself (§3).

use std::{
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::fields::FieldStore;

/// IP protocol carried by a session, independent of the L4 framing detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
    Other(u8),
}

impl Protocol {
    pub fn ip_protocol_number(self) -> u8 {
        match self {
            Protocol::Icmp => 1,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Other(n) => n,
        }
    }

    pub fn from_ip_protocol_number(n: u8) -> Self {
        match n {
            1 | 58 => Protocol::Icmp,
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }

    /// Short tag string used as the session's initial protocol tag,
    /// e.g. `"tcp"`/`"udp"`/`"icmp"`.
    pub fn tag(self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Other(_) => "other",
        }
    }
}

/// 13-byte canonical flow key: IP protocol byte, then the ordered
/// endpoint pair with direction collapsed out. Two packets of the same
/// flow in either direction produce the identical `SessionId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub ip_protocol: u8,
    pub addr_lo: IpAddr,
    pub port_lo: u16,
    pub addr_hi: IpAddr,
    pub port_hi: u16,
}

impl SessionId {
    /// Build the canonical key from a single packet's (possibly
    /// direction-dependent) endpoint observation. For ICMP, ports are
    /// zero per §3.
    pub fn new(ip_protocol: u8, a: IpAddr, pa: u16, b: IpAddr, pb: u16) -> Self {
        let (addr_lo, port_lo, addr_hi, port_hi) = if (a, pa) <= (b, pb) {
            (a, pa, b, pb)
        } else {
            (b, pb, a, pa)
        };
        SessionId {
            ip_protocol,
            addr_lo,
            port_lo,
            addr_hi,
            port_hi,
        }
    }

    /// The constant session-id all ISIS frames share (§4.4 step 1):
    /// `{1, 0x83}` collapsed onto a zero endpoint pair, since ISIS has no
    /// IP-layer addressing to key on.
    pub fn isis_aggregate() -> Self {
        SessionId {
            ip_protocol: 0x83,
            addr_lo: IpAddr::from([0, 0, 0, 0]),
            port_lo: 0,
            addr_hi: IpAddr::from([0, 0, 0, 0]),
            port_hi: 0,
        }
    }

    /// XOR-folds four bytes of the session-id (one byte from each
    /// address, one from each port) into a 32-bit hash, per §4.1.
    pub fn hash(&self) -> u32 {
        let a_lo = addr_bytes(self.addr_lo);
        let a_hi = addr_bytes(self.addr_hi);
        let b0 = a_lo[a_lo.len() - 1];
        let b1 = (self.port_lo & 0xff) as u8;
        let b2 = a_hi[a_hi.len() - 1];
        let b3 = (self.port_hi & 0xff) as u8;
        u32::from(b0) ^ (u32::from(b1) << 8) ^ (u32::from(b2) << 16) ^ (u32::from(b3) << 24)
    }
}

fn addr_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Direction of a half-stream relative to the session's stable `which`
/// assignment (§3: "direction bit assignment is stable for the session's
/// lifetime").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Src,
    Dst,
}

/// One captured frame, on its way from ingress to the writer.
#[derive(Debug, Clone)]
pub struct Packet {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub caplen: u32,
    pub origlen: u32,
    pub payload_offset: usize,
    pub data: Vec<u8>,
    /// Filled in once the writer has persisted the packet.
    pub file_position: Option<(u32, u64)>,
    pub session_hash: u32,
}

impl Packet {
    pub fn now_timestamps() -> (u32, u32) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (now.as_secs() as u32, now.subsec_micros())
    }
}

bitflags::bitflags! {
    /// Lifecycle flags from §3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: u16 {
        const NEED_SAVE        = 0b0000_0001;
        const DONT_SAVE        = 0b0000_0010;
        const MID_SAVE         = 0b0000_0100;
        const STOP_SAVING      = 0b0000_1000;
    }
}

/// The central per-flow entity (§3). Owned exclusively by the packet
/// thread whose shard it lives in; cross-thread access goes through a
/// command queue instead of shared mutation.
pub struct Session {
    pub id: SessionId,
    pub protocol: Protocol,
    pub addr1: IpAddr,
    pub port1: u16,
    pub addr2: IpAddr,
    pub port2: u16,

    pub byte_count: u64,
    pub packet_count: u64,
    pub first_packet: u32,
    pub last_packet: u32,
    pub last_save: u32,

    /// Ordered (file-id, byte-offset) per saved packet.
    pub file_pos_array: Vec<(u32, u64)>,
    /// Ordered set of distinct file-ids the session's packets span.
    pub file_num_array: Vec<u32>,

    pub fields: FieldStore,

    pub flags: SessionFlags,
    pub outstanding_tags: u32,

    /// `which[0]`/`which[1]` stable direction assignment for TCP: the
    /// address/port pair first seen as "src" keeps that role regardless
    /// of which side sends the next packet.
    pub which_src: (IpAddr, u16),

    /// Names of parsers currently attached, in attach order, so
    /// `save`/`free` can be driven deterministically.
    pub attached_parsers: Vec<String>,

    /// True once at least one side has matched a classifier pattern.
    pub classified: bool,

    /// Set by a parser that has just handed the stream off to a different
    /// protocol (`CONNECT`, `Upgrade: h2c`, `STARTTLS`): the reassembly
    /// adapter must detach all attached parsers and reclassify subsequent
    /// bytes from scratch.
    pub needs_reclassify: bool,
}

impl Session {
    pub fn new(id: SessionId, protocol: Protocol, addr1: IpAddr, port1: u16, addr2: IpAddr, port2: u16, now: u32) -> Self {
        Session {
            id,
            protocol,
            addr1,
            port1,
            addr2,
            port2,
            byte_count: 0,
            packet_count: 0,
            first_packet: now,
            last_packet: now,
            last_save: now,
            file_pos_array: Vec::new(),
            file_num_array: Vec::new(),
            fields: FieldStore::new(),
            flags: SessionFlags::empty(),
            outstanding_tags: 0,
            which_src: (addr1, port1),
            attached_parsers: Vec::new(),
            classified: false,
            needs_reclassify: false,
        }
    }

    /// Append a saved packet's position, maintaining `fileNumArray` as an
    /// ordered set of distinct ids (§4.4 step 6).
    pub fn record_file_position(&mut self, file_id: u32, offset: u64) {
        self.file_pos_array.push((file_id, offset));
        if self.file_num_array.last() != Some(&file_id) {
            self.file_num_array.push(file_id);
        }
    }

    pub fn needs_mid_save(&self, max_packets: usize) -> bool {
        self.file_pos_array.len() >= max_packets
    }

    /// Reset the per-save accumulators, the mid-save half of §4.10.
    pub fn reset_after_save(&mut self, now: u32) {
        self.file_pos_array.clear();
        self.file_num_array.clear();
        self.last_save = now;
        self.flags.remove(SessionFlags::MID_SAVE);
        self.flags.remove(SessionFlags::NEED_SAVE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_collapses_direction() {
        let a = IpAddr::from([10, 0, 0, 1]);
        let b = IpAddr::from([10, 0, 0, 2]);
        let forward = SessionId::new(6, a, 5000, b, 80);
        let reverse = SessionId::new(6, b, 80, a, 5000);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn icmp_ports_are_irrelevant_to_identity_when_zero() {
        let a = IpAddr::from([10, 0, 0, 1]);
        let b = IpAddr::from([10, 0, 0, 2]);
        let id = SessionId::new(1, a, 0, b, 0);
        assert_eq!(id.ip_protocol, 1);
        assert_eq!(id.port_lo, 0);
        assert_eq!(id.port_hi, 0);
    }

    #[test]
    fn record_file_position_dedups_consecutive_file_ids() {
        let id = SessionId::new(6, IpAddr::from([1, 1, 1, 1]), 1, IpAddr::from([2, 2, 2, 2]), 2);
        let mut s = Session::new(id, Protocol::Tcp, IpAddr::from([1, 1, 1, 1]), 1, IpAddr::from([2, 2, 2, 2]), 2, 0);
        s.record_file_position(1, 0);
        s.record_file_position(1, 100);
        s.record_file_position(2, 0);
        assert_eq!(s.file_num_array, vec![1, 2]);
        assert_eq!(s.file_pos_array.len(), 3);
    }
}
