// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fixed-bucket-count open hash table over [`DList`] chains.
//!
//! Grounded in `hash.h`'s `HASH_VAR`/`HASH_ADD`/`HASH_FIND`/`HASH_REMOVE`
//! macros: a hash table is just an array of DLL buckets plus a hash
//! function, with no resizing. [`DropHashGroup`](crate::drophash) and the
//! per-port drop-hash maps use this directly instead of `DashMap` because
//! they need the exact fixed bucket count the original sizes for (7919 vs
//! 409) and because lookups there are single-threaded behind a
//! reader/writer split rather than lock-free concurrent.

use crate::containers::dll::{DList, Handle};

/// An open hash table with a caller-supplied hash function and a fixed
/// bucket count, mirroring `HASH_VAR(name, var, Type, num)`.
pub struct OpenHash<K, V> {
    buckets: Vec<DList<(K, V)>>,
    count: usize,
}

impl<K: PartialEq, V> OpenHash<K, V> {
    /// Build a table with exactly `num_buckets` chains, the `HASH_INIT` case.
    pub fn with_buckets(num_buckets: usize) -> Self {
        let mut buckets = Vec::with_capacity(num_buckets);
        for _ in 0..num_buckets {
            buckets.push(DList::new());
        }
        OpenHash { buckets, count: 0 }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn bucket_for(&self, hash: u32) -> usize {
        (hash as usize) % self.buckets.len()
    }

    /// Insert a key/value pair into the bucket `hash % bucket_count`,
    /// the `HASH_ADD` case. Returns a handle valid within that bucket.
    pub fn add(&mut self, hash: u32, key: K, value: V) -> (usize, Handle<(K, V)>) {
        let b = self.bucket_for(hash);
        let handle = self.buckets[b].push_tail((key, value));
        self.count += 1;
        (b, handle)
    }

    /// Find the first element in `hash`'s bucket whose key matches,
    /// the `HASH_FIND` case.
    pub fn find(&self, hash: u32, key: &K) -> Option<&V> {
        let b = self.bucket_for(hash);
        self.buckets[b]
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Like [`find`](Self::find) but returns a handle the caller can pass
    /// to [`remove`](Self::remove) or use to update the element in place.
    pub fn find_handle(&self, hash: u32, key: &K) -> Option<(usize, Handle<(K, V)>)> {
        let b = self.bucket_for(hash);
        self.buckets[b]
            .find_handle(|(k, _)| k == key)
            .map(|h| (b, h))
    }

    /// Borrow the element behind a bucket/handle pair mutably, for
    /// in-place refresh without a remove+reinsert round trip.
    pub fn get_mut(&mut self, bucket: usize, handle: Handle<(K, V)>) -> Option<&mut V> {
        self.buckets[bucket].get_mut(handle).map(|(_, v)| v)
    }

    /// Remove a previously located element given its bucket index and
    /// handle, the `HASH_REMOVE` case.
    pub fn remove(&mut self, bucket: usize, handle: Handle<(K, V)>) -> Option<(K, V)> {
        let removed = self.buckets[bucket].remove(handle);
        if removed.is_some() {
            self.count -= 1;
        }
        removed
    }

    /// Iterate every live element across all buckets, the `HASH_FORALL`
    /// case.
    pub fn iter(&self) -> impl Iterator<Item = &(K, V)> {
        self.buckets.iter().flat_map(|b| b.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_find_round_trip() {
        let mut table: OpenHash<u32, &str> = OpenHash::with_buckets(7);
        let (bucket, handle) = table.add(42, 42, "answer");
        assert_eq!(table.find(42, &42), Some(&"answer"));
        assert_eq!(table.count(), 1);
        table.remove(bucket, handle);
        assert_eq!(table.find(42, &42), None);
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn distinct_hashes_sharing_a_bucket_coexist() {
        let mut table: OpenHash<u32, u32> = OpenHash::with_buckets(4);
        table.add(0, 0, 100);
        table.add(4, 4, 400);
        assert_eq!(table.find(0, &0), Some(&100));
        assert_eq!(table.find(4, &4), Some(&400));
        assert_eq!(table.count(), 2);
    }
}
