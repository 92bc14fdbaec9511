// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Capture sources: the pcap file format (§6) and the `CaptureSource`
//! trait live-capture/offline-file/pcap-over-IP implementations share.

pub mod pcapfile;
pub mod source;
pub mod writer;

pub use pcapfile::{FileHeader, RecordHeader, PCAP_MAGIC_BE, PCAP_MAGIC_LE};
pub use source::{CaptureSource, CaptureStats, RawFrame};
pub use writer::SimpleWriter;
