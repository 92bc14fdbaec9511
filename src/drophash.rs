// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pre-copy packet suppression by address/port.
//!
//! A drop-hash group remembers "don't bother copying packets from this
//! key for `good_for` more seconds" decisions, checked before a packet is
//! even handed to reassembly. Grounded in `drophash.c`: per-port bucket
//! tables (7919 buckets for the well-known ports that see the most noise,
//! 409 otherwise), a rolling multiply-xor-shift hash for multi-byte keys
//! and the raw 32-bit value for 4-byte (IPv4) keys, and a binary save file
//! whose `keyLen` byte uses the legacy `0`/`1` encoding for 16/4 in
//! addition to the literal byte value.
//!
//! The original locks only around mutation and reads without a lock at
//! all; a single `RwLock` per port is the safe Rust equivalent — reads
//! that don't need to refresh an entry's timestamp take a read guard,
//! anything that inserts, refreshes or deletes takes a write guard.

use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{
        RwLock,
        atomic::{AtomicU32, Ordering},
    },
};

use dashmap::DashMap;

use crate::containers::hash::OpenHash;

#[derive(Debug, Clone)]
struct DropHashItem {
    key: Vec<u8>,
    port: u16,
    last: u32,
    good_for: u32,
    flags: u16,
}

fn bucket_count_for_port(port: u16) -> usize {
    match port {
        25 | 80 | 443 => 7919,
        _ => 409,
    }
}

/// `arkime_drophash_hash`: folds 32-bit words of a multi-byte key through
/// a multiply-xor-shift. IPv4 (4-byte) keys bypass this and use the raw
/// value directly, handled by the caller.
fn hash_multi_byte(key: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for word in key.chunks_exact(4) {
        let w = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]);
        h = h.wrapping_add(w).wrapping_mul(0xc6a4_a793);
        h ^= h >> 16;
    }
    h
}

fn hash_key(key_len: usize, key: &[u8]) -> u32 {
    if key_len == 4 {
        u32::from_ne_bytes([key[0], key[1], key[2], key[3]])
    } else {
        hash_multi_byte(key)
    }
}

struct PortTable {
    table: OpenHash<Vec<u8>, DropHashItem>,
}

impl PortTable {
    fn new(port: u16) -> Self {
        PortTable {
            table: OpenHash::with_buckets(bucket_count_for_port(port)),
        }
    }
}

/// A family of drop-hash tables, one lazily-created bucket array per port
/// actually seen, sharing a single on-disk save file and key length.
pub struct DropHashGroup {
    key_len: usize,
    file: Option<PathBuf>,
    ports: DashMap<u16, RwLock<PortTable>>,
    changed: AtomicU32,
}

impl DropHashGroup {
    /// `arkime_drophash_init`: build an empty group, loading `file` if it
    /// already exists on disk. `key_len` is 4 for IPv4 keys or 16 for the
    /// canonical session-id-minus-protocol key used for IPv6.
    pub fn init(key_len: usize, file: Option<PathBuf>) -> io::Result<Self> {
        let group = DropHashGroup {
            key_len,
            file: file.clone(),
            ports: DashMap::new(),
            changed: AtomicU32::new(0),
        };
        if let Some(path) = file {
            if path.exists() {
                group.load(&path)?;
            }
        }
        group.changed.store(0, Ordering::SeqCst);
        Ok(group)
    }

    fn hash_for(&self, key: &[u8]) -> u32 {
        hash_key(self.key_len, key)
    }

    /// `arkime_drophash_add`: record that `key` on `port` should be
    /// dropped until `current + good_for`. Returns `false` if the key was
    /// already present (matching the original's "already there" no-op).
    pub fn add(&self, port: u16, key: &[u8], current: u32, good_for: u32) -> bool {
        let entry = self
            .ports
            .entry(port)
            .or_insert_with(|| RwLock::new(PortTable::new(port)));
        let mut table = entry.write().expect("drophash port lock poisoned");
        let h = self.hash_for(key);
        if table.table.find(h, &key.to_vec()).is_some() {
            return false;
        }
        table.table.add(
            h,
            key.to_vec(),
            DropHashItem {
                key: key.to_vec(),
                port,
                last: current,
                good_for,
                flags: 0,
            },
        );
        self.changed.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// `arkime_drophash_should_drop`: decide whether a packet matching
    /// `key` on `port` at time `current` should be suppressed, refreshing
    /// or evicting the entry's window as a side effect just like the C
    /// version does.
    pub fn should_drop(&self, port: u16, key: &[u8], current: u32) -> bool {
        let Some(entry) = self.ports.get(&port) else {
            return false;
        };
        let h = self.hash_for(key);
        let key_vec = key.to_vec();
        {
            let table = entry.read().expect("drophash port lock poisoned");
            match table.table.find(h, &key_vec) {
                None => return false,
                Some(item) if item.last == current => return true,
                Some(item) if item.last + item.good_for >= current => {}
                Some(_) => {
                    drop(table);
                    self.delete(port, key);
                    return false;
                }
            }
        }
        let mut table = entry.write().expect("drophash port lock poisoned");
        if let Some((bucket, handle)) = table.table.find_handle(h, &key_vec) {
            if let Some(item) = table.table.get_mut(bucket, handle) {
                item.last = current;
            }
        }
        true
    }

    /// `arkime_drophash_delete`: remove the entry for `key` on `port`, if
    /// one exists.
    pub fn delete(&self, port: u16, key: &[u8]) {
        let Some(entry) = self.ports.get(&port) else {
            return;
        };
        let mut table = entry.write().expect("drophash port lock poisoned");
        let h = self.hash_for(key);
        let key_vec = key.to_vec();
        if let Some((bucket, handle)) = table.table.find_handle(h, &key_vec) {
            table.table.remove(bucket, handle);
            self.changed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn load(&self, path: &Path) -> io::Result<()> {
        let mut fp = std::fs::File::open(path)?;
        let mut hdr = [0u8; 4];
        fp.read_exact(&mut hdr)?;
        let version = u32::from_ne_bytes(hdr);
        if version != 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown drophash save file version {version}"),
            ));
        }
        let mut fkey_len_byte = [0u8; 1];
        fp.read_exact(&mut fkey_len_byte)?;
        let fkey_len = match fkey_len_byte[0] {
            0 => 16,
            1 => 4,
            n => n as usize,
        };
        if fkey_len != self.key_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "drophash keyLen mismatch: file has {fkey_len}, group expects {}",
                    self.key_len
                ),
            ));
        }
        let mut cnt_buf = [0u8; 4];
        fp.read_exact(&mut cnt_buf)?;
        let cnt = u32::from_ne_bytes(cnt_buf);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        for _ in 0..cnt {
            let mut port_buf = [0u8; 2];
            fp.read_exact(&mut port_buf)?;
            let port = u16::from_ne_bytes(port_buf);
            let mut key = vec![0u8; self.key_len];
            fp.read_exact(&mut key)?;
            let mut last_buf = [0u8; 4];
            fp.read_exact(&mut last_buf)?;
            let last = u32::from_ne_bytes(last_buf);
            let mut good_for_buf = [0u8; 4];
            fp.read_exact(&mut good_for_buf)?;
            let good_for = u32::from_ne_bytes(good_for_buf);
            let mut flags_buf = [0u8; 2];
            fp.read_exact(&mut flags_buf)?;
            let _flags = u16::from_ne_bytes(flags_buf);

            if last + good_for >= now {
                self.add(port, &key, last, good_for);
            }
        }
        self.changed.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// `arkime_drophash_save`: flush every live entry to the group's file.
    pub fn save(&self) -> io::Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let mut fp = std::fs::File::create(path)?;
        self.changed.store(0, Ordering::SeqCst);

        let items: Vec<DropHashItem> = self
            .ports
            .iter()
            .flat_map(|entry| {
                let table = entry.value().read().expect("drophash port lock poisoned");
                table.table.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>()
            })
            .collect();

        fp.write_all(&2u32.to_ne_bytes())?;
        fp.write_all(&(self.key_len as u8).to_ne_bytes())?;
        fp.write_all(&(items.len() as u32).to_ne_bytes())?;
        for item in &items {
            fp.write_all(&item.port.to_ne_bytes())?;
            fp.write_all(&item.key)?;
            fp.write_all(&item.last.to_ne_bytes())?;
            fp.write_all(&item.good_for.to_ne_bytes())?;
            fp.write_all(&item.flags.to_ne_bytes())?;
        }
        Ok(())
    }

    pub fn changed(&self) -> u32 {
        self.changed.load(Ordering::SeqCst)
    }
}
