// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session table (C4): a hash of active sessions keyed by session-id,
//! sharded across packet threads, with a per-protocol LRU queue driving
//! timeout-based expiry.
//!
//! §4.1 picks a chained hash over open addressing and routes each
//! session-id to its owning shard by `hash(session_id) % num_threads`; only
//! that shard's owning task ever touches the session afterwards. Here a
//! `SessionTable` is the single-shard table (owned exclusively by one
//! packet-processing task, so it needs no internal locking) and
//! `ShardedSessionTable` is the `num_threads`-wide routing layer ingress
//! uses to find the right shard.

use std::collections::HashMap;

use crate::{
    containers::dll::{DList, Handle},
    session::types::{Protocol, Session, SessionId},
};

struct Entry {
    session: Session,
    lru_handle: Option<Handle<SessionId>>,
}

/// One packet thread's exclusive shard of the session table.
pub struct SessionTable {
    sessions: HashMap<SessionId, Entry>,
    lru: HashMap<&'static str, DList<SessionId>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            sessions: HashMap::new(),
            lru: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn find(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id).map(|e| &e.session)
    }

    pub fn find_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id).map(|e| &mut e.session)
    }

    /// Insert a newly created session and push it to its protocol's LRU
    /// tail. Panics on collision with an existing live session-id, per
    /// §4.1 — the caller is expected to have already called `find`.
    pub fn insert(&mut self, session: Session) {
        let id = session.id;
        let protocol_tag = session.protocol.tag();
        if self.sessions.contains_key(&id) {
            panic!("session table collision: session-id {id:?} already present");
        }
        let queue = self.lru.entry(protocol_tag).or_default();
        let handle = queue.push_tail(id);
        self.sessions.insert(
            id,
            Entry {
                session,
                lru_handle: Some(handle),
            },
        );
    }

    /// Remove and return ownership of a session, unlinking it from its
    /// LRU queue. The caller is responsible for any remaining save work.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let entry = self.sessions.remove(id)?;
        if let Some(handle) = entry.lru_handle {
            if let Some(queue) = self.lru.get_mut(entry.session.protocol.tag()) {
                queue.remove(handle);
            }
        }
        Some(entry.session)
    }

    /// Mark `id` as recently active at time `now`, updating its last-seen
    /// timestamp and moving it to the tail of its protocol's LRU queue.
    pub fn touch(&mut self, id: &SessionId, now: u32) {
        let tag = match self.sessions.get_mut(id) {
            Some(entry) => {
                entry.session.last_packet = now;
                entry.session.protocol.tag()
            }
            None => return,
        };
        if let Some(handle) = self.sessions.get(id).and_then(|e| e.lru_handle) {
            if let Some(queue) = self.lru.get_mut(tag) {
                queue.move_to_tail(handle);
            }
        }
    }

    /// Drain the head of `protocol`'s LRU queue while its oldest entry's
    /// `last_packet + timeout < now`, per §4.4 step 8. Fully removes each
    /// evicted session from the table (not just its LRU handle) and
    /// returns ownership so the caller can run final-save on each.
    pub fn drain_stale(&mut self, protocol: Protocol, now: u32, timeout: u32) -> Vec<Session> {
        let tag = protocol.tag();
        let mut evicted = Vec::new();
        loop {
            let Some(queue) = self.lru.get(tag) else {
                break;
            };
            let Some(&head_id) = queue.peek_head() else {
                break;
            };
            let Some(entry) = self.sessions.get(&head_id) else {
                // queue and table diverged; drop the stale handle defensively
                self.lru.get_mut(tag).expect("checked above").pop_head();
                continue;
            };
            if entry.session.last_packet + timeout >= now {
                break;
            }
            self.lru.get_mut(tag).expect("checked above").pop_head();
            if let Some(session) = self.sessions.remove(&head_id).map(|e| e.session) {
                evicted.push(session);
            }
        }
        evicted
    }

    /// Stable-order iteration for shutdown drain, the `forall` operation
    /// of §4.1.
    pub fn forall(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().map(|e| &e.session)
    }
}

/// Routes session-ids to their owning shard by `hash(session_id) %
/// num_threads`, matching §4.1's placement rule. Each shard is meant to be
/// driven exclusively by one packet-processing task; this type only
/// implements the routing arithmetic; ownership/locking is up to the
/// caller (see `ingress`).
pub struct ShardRouter {
    num_threads: usize,
}

impl ShardRouter {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "packetThreads must be at least 1");
        ShardRouter { num_threads }
    }

    pub fn shard_for(&self, id: &SessionId) -> usize {
        (id.hash() as usize) % self.num_threads
    }
}
