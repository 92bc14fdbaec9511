// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `CaptureSource` (§6): the abstract packet-feed interface. Live libpcap
//! and DPDK sources are out of scope (§1) and are represented only by
//! this trait; the offline pcap-file reader below is the concrete
//! implementation tests actually exercise, plus the pcap-over-IP framing
//! both client and server modes share.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    capture::pcapfile::{FileHeader, RecordHeader, FILE_HEADER_LEN, RECORD_HEADER_LEN},
    error::CaptureSourceError,
};

/// A single frame as delivered by a capture source, before session
/// identity has been computed.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub caplen: u32,
    pub origlen: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub total_packets: u64,
    pub dropped_packets: u64,
}

/// Common interface every packet source implements, per §6.
#[async_trait::async_trait]
pub trait CaptureSource: Send {
    async fn start(&mut self) -> Result<(), CaptureSourceError>;
    async fn stop(&mut self) -> Result<(), CaptureSourceError>;
    fn stats(&self) -> CaptureStats;
    /// Pull the next frame, or `None` at end of stream (offline sources
    /// only; live sources run until `stop`).
    async fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureSourceError>;
}

/// Reads an offline pcap file, bit-exact with the format in §6.
pub struct PcapFileSource<R> {
    reader: R,
    header: FileHeader,
    stats: CaptureStats,
}

impl<R: AsyncRead + Unpin + Send> PcapFileSource<R> {
    pub async fn open(mut reader: R) -> Result<Self, CaptureSourceError> {
        let mut buf = [0u8; FILE_HEADER_LEN];
        reader.read_exact(&mut buf).await?;
        let header = FileHeader::parse(&buf).ok_or(CaptureSourceError::BadFileHeader)?;
        Ok(PcapFileSource {
            reader,
            header,
            stats: CaptureStats::default(),
        })
    }

    pub fn link_type(&self) -> u32 {
        self.header.linktype
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> CaptureSource for PcapFileSource<R> {
    async fn start(&mut self) -> Result<(), CaptureSourceError> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CaptureSourceError> {
        Ok(())
    }

    fn stats(&self) -> CaptureStats {
        self.stats
    }

    async fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureSourceError> {
        let mut hdr_buf = [0u8; RECORD_HEADER_LEN];
        match self.reader.read_exact(&mut hdr_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(CaptureSourceError::Io(e)),
        }
        let rec = RecordHeader::parse(&hdr_buf).ok_or(CaptureSourceError::BadFileHeader)?;
        let mut bytes = vec![0u8; rec.caplen as usize];
        self.reader.read_exact(&mut bytes).await?;
        self.stats.total_packets += 1;
        Ok(Some(RawFrame {
            ts_sec: rec.ts_sec,
            ts_usec: rec.ts_usec,
            caplen: rec.caplen,
            origlen: rec.origlen,
            bytes,
        }))
    }
}
