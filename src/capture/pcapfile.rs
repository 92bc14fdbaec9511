// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The pcap wire format shared by every capture source and by the capture
//! writer (§6, §4.8): a 24-byte global header followed by `(ts_sec,
//! ts_usec, caplen, origlen, bytes)` records.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Magic bytes for a host-endian-matching file (`0xa1b2c3d4` read
/// native-endian).
pub const PCAP_MAGIC_BE: u32 = 0xa1b2_c3d4;
/// The same file read on the opposite-endian host sees this value instead;
/// readers swap every subsequent field when they observe it.
pub const PCAP_MAGIC_LE: u32 = 0xd4c3_b2a1;

/// 24-byte global pcap file header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FileHeader {
    pub magic: u32,
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone: i32,
    pub sigfigs: u32,
    pub snaplen: u32,
    pub linktype: u32,
}

pub const FILE_HEADER_LEN: usize = 24;

impl FileHeader {
    /// Build a host-endian header for `linktype` (1 = Ethernet, the only
    /// link type the engine's parsers assume).
    pub fn new(linktype: u32, snaplen: u32) -> Self {
        FileHeader {
            magic: PCAP_MAGIC_BE,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            linktype,
        }
    }

    pub fn is_byte_swapped(&self) -> bool {
        self.magic == PCAP_MAGIC_LE
    }

    pub fn parse(bytes: &[u8]) -> Option<FileHeader> {
        if bytes.len() < FILE_HEADER_LEN {
            return None;
        }
        let hdr = FileHeader::read_from_bytes(&bytes[..FILE_HEADER_LEN]).ok()?;
        if hdr.magic != PCAP_MAGIC_BE && hdr.magic != PCAP_MAGIC_LE {
            return None;
        }
        Some(hdr)
    }
}

/// Per-record header, `pcap_sf_pkthdr` in the original.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RecordHeader {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub caplen: u32,
    pub origlen: u32,
}

pub const RECORD_HEADER_LEN: usize = 16;

impl RecordHeader {
    pub fn new(ts_sec: u32, ts_usec: u32, caplen: u32, origlen: u32) -> Self {
        RecordHeader {
            ts_sec,
            ts_usec,
            caplen,
            origlen,
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<RecordHeader> {
        RecordHeader::read_from_bytes(bytes.get(..RECORD_HEADER_LEN)?).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_round_trips_through_bytes() {
        let hdr = FileHeader::new(1, 262_144);
        let bytes = hdr.as_bytes();
        let parsed = FileHeader::parse(bytes).expect("parses");
        assert_eq!(parsed.magic, PCAP_MAGIC_BE);
        assert_eq!(parsed.linktype, 1);
        assert!(!parsed.is_byte_swapped());
    }

    #[test]
    fn record_header_round_trips() {
        let hdr = RecordHeader::new(1, 2, 60, 60);
        let bytes = hdr.as_bytes();
        let parsed = RecordHeader::parse(bytes).expect("parses");
        assert_eq!(parsed.caplen, 60);
        assert_eq!(parsed.ts_usec, 2);
    }

    #[test]
    fn swapped_magic_is_detected() {
        let mut hdr = FileHeader::new(1, 1024);
        hdr.magic = PCAP_MAGIC_LE;
        assert!(hdr.is_byte_swapped());
    }
}
