// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Index of chunks with free slots, ordered by how many slots are free.
//!
//! Allocation prefers the fullest chunk that still fits (best-fit), which
//! keeps chunks dense and lets mostly empty chunks drain so they can be
//! handed back to the host.

use alloc::collections::BTreeSet;

use hashbrown::HashMap;
use log::trace;

use gmm_abi::ChunkId;

#[derive(Debug, Default)]
pub struct FreeChunkIndex {
    by_free: BTreeSet<(u16, ChunkId)>,
    free_of: HashMap<ChunkId, u16>,
}

impl FreeChunkIndex {
    pub fn new() -> FreeChunkIndex {
        Default::default()
    }

    /// Start tracking a chunk that has `free` free slots.
    pub fn insert(&mut self, id: ChunkId, free: u16) {
        self.remove(id);
        if free > 0 {
            self.by_free.insert((free, id));
            self.free_of.insert(id, free);
        }
    }

    /// Stop tracking a chunk (it is full or about to be destroyed).
    pub fn remove(&mut self, id: ChunkId) -> bool {
        match self.free_of.remove(&id) {
            Some(free) => self.by_free.remove(&(free, id)),
            None => false,
        }
    }

    /// The chunk with the fewest free slots that still has at least
    /// `min_free` of them.
    pub fn find_chunk_with_free_slot(&self, min_free: u16) -> Option<ChunkId> {
        self.candidates(min_free).next()
    }

    /// All chunks with at least `min_free` free slots, best fit first.
    pub fn candidates(&self, min_free: u16) -> impl Iterator<Item = ChunkId> + '_ {
        self.by_free
            .range((min_free.max(1), 0)..)
            .map(|(_free, id)| *id)
    }

    pub fn on_slot_allocated(&mut self, id: ChunkId) {
        match self.free_of.get(&id).copied() {
            Some(1) => self.on_chunk_full(id),
            Some(free) => self.insert(id, free - 1),
            None => debug_assert!(false, "allocated from untracked chunk {:#x}", id),
        }
    }

    pub fn on_slot_freed(&mut self, id: ChunkId) {
        let free = self.free_of.get(&id).copied().unwrap_or(0);
        self.insert(id, free + 1);
    }

    pub fn on_chunk_full(&mut self, id: ChunkId) {
        trace!("chunk {:#x} is full", id);
        self.remove(id);
    }

    /// Free slots we think chunk `id` has.
    pub fn free_count(&self, id: ChunkId) -> u16 {
        self.free_of.get(&id).copied().unwrap_or(0)
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.free_of.contains_key(&id)
    }

    /// Number of chunks with free slots.
    pub fn len(&self) -> usize {
        self.free_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free_of.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, u16)> + '_ {
        self.free_of.iter().map(|(id, free)| (*id, *free))
    }

    /// Move every chunk of `other` into `self`.
    pub fn absorb(&mut self, other: FreeChunkIndex) {
        for (id, free) in other.free_of {
            self.insert(id, free);
        }
    }
}
