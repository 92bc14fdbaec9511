// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Capture writer (C9, §4.8): the "simple" writer (one file per packet
//! thread, mmap'd scratch buffer, blocking flush, page-aligned rotation)
//! plus a reduced model of the legacy disk writer's size-class/buffer-pool
//! contract.
//!
//! Grounded in `writer-simple.c`: the scratch buffer is sized
//! `pcapWriteSize + maxPacketLen` so a single packet can never overflow it
//! between flushes; flush writes exactly the `pcapWriteSize`-aligned
//! prefix via a blocking retry loop that treats short writes as partial
//! progress, never an error; rotation rounds the tail up to the page size
//! before `ftruncate` trims the file back to its true length.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    thread::ThreadId,
    time::{Duration, Instant},
};

use memmap2::MmapMut;
use zerocopy::IntoBytes;

use crate::capture::pcapfile::{FileHeader, RecordHeader, FILE_HEADER_LEN, RECORD_HEADER_LEN};

fn page_size() -> usize {
    4096
}

/// One packet thread's open capture file and its mmap'd scratch buffer.
/// The owning thread is whichever thread calls [`SimpleWriter::append`]
/// first; a write from any other thread is a fatal programming error
/// (§4.8), matching the original's single-owner assumption.
pub struct SimpleWriter {
    file: File,
    scratch: MmapMut,
    scratch_len: usize,
    pcap_write_size: usize,
    file_id: u32,
    /// Absolute byte offset the *next* record will be written at, i.e.
    /// what gets stamped onto the packet that triggers this write.
    next_offset: u64,
    bytes_since_open: u64,
    opened_at: Instant,
    owner_thread: Option<ThreadId>,
}

impl SimpleWriter {
    /// Open a new capture file at `path`, write its 24-byte pcap header,
    /// and allocate the `pcapWriteSize + maxPacketLen` scratch buffer.
    pub fn create(
        path: &Path,
        file_id: u32,
        linktype: u32,
        snaplen: u32,
        pcap_write_size: usize,
        max_packet_len: usize,
    ) -> io::Result<Self> {
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        let hdr = FileHeader::new(linktype, snaplen);
        file.write_all(hdr.as_bytes())?;

        let scratch = MmapMut::map_anon(pcap_write_size + max_packet_len)?;

        Ok(SimpleWriter {
            file,
            scratch,
            scratch_len: 0,
            pcap_write_size,
            file_id,
            next_offset: FILE_HEADER_LEN as u64,
            bytes_since_open: 0,
            opened_at: Instant::now(),
            owner_thread: None,
        })
    }

    fn assert_owning_thread(&mut self) {
        let current = std::thread::current().id();
        match self.owner_thread {
            None => self.owner_thread = Some(current),
            Some(owner) => assert_eq!(owner, current, "capture writer written from a non-owning thread"),
        }
    }

    /// Append one packet, stamping it with `(file_id, offset)` the caller
    /// records into the session's `filePosArray` (§4.4 step 6).
    pub fn append(&mut self, ts_sec: u32, ts_usec: u32, caplen: u32, origlen: u32, bytes: &[u8]) -> io::Result<(u32, u64)> {
        self.assert_owning_thread();

        let record_len = RECORD_HEADER_LEN + bytes.len();
        if self.scratch_len + record_len > self.scratch.len() {
            self.flush_blocking()?;
        }
        if self.scratch_len + record_len > self.scratch.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "packet exceeds scratch capacity"));
        }

        let stamp = (self.file_id, self.next_offset);
        let hdr = RecordHeader::new(ts_sec, ts_usec, caplen, origlen);
        let hdr_bytes = hdr.as_bytes();
        self.scratch[self.scratch_len..self.scratch_len + hdr_bytes.len()].copy_from_slice(hdr_bytes);
        self.scratch_len += hdr_bytes.len();
        self.scratch[self.scratch_len..self.scratch_len + bytes.len()].copy_from_slice(bytes);
        self.scratch_len += bytes.len();

        self.next_offset += record_len as u64;
        self.bytes_since_open += record_len as u64;

        if self.scratch_len >= self.pcap_write_size {
            self.flush_blocking()?;
        }

        Ok(stamp)
    }

    /// Write out the current `pcapWriteSize`-aligned prefix of the scratch
    /// buffer via a blocking retry loop; a short `write(2)` is partial
    /// progress, not an error, only real I/O errors propagate.
    fn flush_blocking(&mut self) -> io::Result<()> {
        let to_write = if self.scratch_len >= self.pcap_write_size {
            (self.scratch_len / self.pcap_write_size) * self.pcap_write_size
        } else {
            self.scratch_len
        };
        if to_write == 0 {
            return Ok(());
        }

        let mut written = 0;
        while written < to_write {
            match self.file.write(&self.scratch[written..to_write]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0 bytes")),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.scratch.copy_within(to_write..self.scratch_len, 0);
        self.scratch_len -= to_write;
        Ok(())
    }

    /// `queue_length()`: the simple writer has no async queue, so the
    /// unflushed scratch bytes are the only outstanding work.
    pub fn queue_length(&self) -> usize {
        self.scratch_len
    }

    /// Size/time rotation predicate (§4.8).
    pub fn should_rotate(&self, max_file_size_bytes: u64, max_file_time: Duration) -> bool {
        self.bytes_since_open >= max_file_size_bytes || self.opened_at.elapsed() >= max_file_time
    }

    /// `exit()`: flush, pad the tail to a page boundary (for direct-I/O
    /// compatible layout), write it, then truncate the file back to its
    /// true length.
    pub fn close(mut self) -> io::Result<()> {
        self.flush_blocking()?;

        let page = page_size();
        let padded_len = self.scratch_len.div_ceil(page) * page;
        for byte in &mut self.scratch[self.scratch_len..padded_len] {
            *byte = 0;
        }

        let mut written = 0;
        while written < padded_len {
            match self.file.write(&self.scratch[written..padded_len]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.file.set_len(self.next_offset)?;
        self.file.flush()
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }
}

/// Size classes the legacy disk writer picks thread use and O_DIRECT
/// alignment from (§4.8). Only the classification contract is modeled
/// here; the actual O_DIRECT syscalls are platform-specific and explicitly
/// legacy per the design notes, so no disk I/O is implemented for this
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskWriterMode {
    Normal,
    Direct,
    Thread,
    ThreadDirect,
}

impl DiskWriterMode {
    pub fn uses_dedicated_thread(self) -> bool {
        matches!(self, DiskWriterMode::Thread | DiskWriterMode::ThreadDirect)
    }

    pub fn uses_direct_io(self) -> bool {
        matches!(self, DiskWriterMode::Direct | DiskWriterMode::ThreadDirect)
    }
}

/// A capped free-list of reusable output buffers, modeling
/// `maxFreeOutputBuffers` from the legacy disk writer without the
/// `MolochMem_t` sentinel-header/pointer-arithmetic reclamation the
/// original uses to avoid a second allocator call.
pub struct BufferPool {
    buffer_size: usize,
    max_free: usize,
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_free: usize) -> Self {
        BufferPool {
            buffer_size,
            max_free,
            free: Vec::new(),
        }
    }

    pub fn acquire(&mut self) -> Vec<u8> {
        self.free.pop().unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    /// Return a buffer to the pool, clearing it first; dropped instead of
    /// pooled once `max_free` is reached.
    pub fn release(&mut self, mut buffer: Vec<u8>) {
        if self.free.len() < self.max_free {
            buffer.clear();
            self.free.push(buffer);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn append_stamps_sequential_offsets_and_flushes_past_write_size() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("test.pcap");
        let mut writer = SimpleWriter::create(&path, 1, 1, 262_144, 64, 32).expect("create");

        let (file_id, off1) = writer.append(1, 0, 10, 10, &[0u8; 10]).expect("append1");
        assert_eq!(file_id, 1);
        assert_eq!(off1, FILE_HEADER_LEN as u64);

        let (_, off2) = writer.append(2, 0, 10, 10, &[0u8; 10]).expect("append2");
        assert!(off2 > off1);

        writer.close().expect("close");
        let metadata = std::fs::metadata(&path).expect("metadata");
        assert!(metadata.len() >= FILE_HEADER_LEN as u64);
    }

    #[test]
    fn should_rotate_on_size_threshold() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("rotate.pcap");
        let mut writer = SimpleWriter::create(&path, 1, 1, 262_144, 4096, 128).expect("create");
        writer.append(1, 0, 100, 100, &[0u8; 100]).expect("append");
        assert!(writer.should_rotate(50, Duration::from_secs(3600)));
        assert!(!writer.should_rotate(10_000, Duration::from_secs(3600)));
    }

    #[test]
    fn buffer_pool_caps_free_list_size() {
        let mut pool = BufferPool::new(16, 1);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), 1);
    }
}
