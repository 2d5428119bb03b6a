// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Owns every chunk and maps chunk and page ids to them.
//!
//! Chunks live in an arena indexed by their id. Ids come from a bitmap,
//! lowest free id first; whenever a chunk goes away the free generation is
//! bumped so cached `chunk id -> address` translations can tell that the id
//! may have been recycled.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bit_field::BitField;
use log::{info, trace};

use gmm_abi::{
    page_id_to_chunk_id, page_id_to_slot, ChunkId, PageId, GMM_CHUNKID_LAST, GMM_CHUNK_NUM_PAGES,
    GMM_PAGEID_LAST, NIL_GMM_CHUNKID,
};

use crate::chunk::Chunk;
use crate::error::{GmmError, GmmResult};
use crate::memory::backends::AllocatorStatistics;
use crate::memory::{BASE_PAGE_SIZE, LARGE_PAGE_SIZE};

pub struct ChunkRegistry {
    chunks: Vec<Option<Box<Chunk>>>,
    /// One bit per chunk id, set while the id is handed out.
    ids: Vec<u64>,
    ids_in_use: usize,
    /// No free id below this one.
    id_hint: usize,
    /// Highest id we hand out.
    id_limit: ChunkId,
    live: usize,
    free_generation: u64,
    freed: u64,
}

impl ChunkRegistry {
    pub fn new() -> ChunkRegistry {
        ChunkRegistry::with_id_limit(GMM_CHUNKID_LAST)
    }

    /// A registry that hands out ids `1..=id_limit` only.
    pub fn with_id_limit(id_limit: ChunkId) -> ChunkRegistry {
        debug_assert!(id_limit <= GMM_CHUNKID_LAST);
        let mut ids = Vec::new();
        ids.push(0u64);
        // NIL is never handed out.
        ids[0].set_bit(NIL_GMM_CHUNKID as usize, true);

        ChunkRegistry {
            chunks: Vec::new(),
            ids,
            ids_in_use: 0,
            id_hint: 1,
            id_limit,
            live: 0,
            free_generation: 0,
            freed: 0,
        }
    }

    fn id_in_use(&self, id: usize) -> bool {
        self.ids.get(id / 64).map_or(false, |w| w.get_bit(id % 64))
    }

    fn mark_id(&mut self, id: usize, used: bool) {
        let word = id / 64;
        if word >= self.ids.len() {
            self.ids.resize(word + 1, 0);
        }
        self.ids[word].set_bit(id % 64, used);
    }

    /// Get an unused (possibly recycled) chunk id.
    pub fn allocate_id(&mut self) -> GmmResult<ChunkId> {
        if self.ids_in_use >= self.id_limit as usize {
            return Err(GmmError::OutOfIds);
        }

        let limit = self.id_limit as usize;
        let mut id = self.id_hint.max(1);
        while id <= limit {
            let word = self.ids.get(id / 64).copied().unwrap_or(0);
            if word == u64::MAX {
                id = (id / 64 + 1) * 64;
                continue;
            }
            if !word.get_bit(id % 64) {
                self.mark_id(id, true);
                self.ids_in_use += 1;
                self.id_hint = id + 1;
                trace!("allocate_id {:#x}", id);
                return Ok(id as ChunkId);
            }
            id += 1;
        }

        Err(GmmError::OutOfIds)
    }

    /// Give an id back that never got a chunk inserted.
    pub fn release_id(&mut self, id: ChunkId) {
        debug_assert!(self.lookup(id).is_none());
        if id != NIL_GMM_CHUNKID && self.id_in_use(id as usize) {
            self.mark_id(id as usize, false);
            self.ids_in_use -= 1;
            self.id_hint = self.id_hint.min(id as usize);
        }
    }

    pub fn insert(&mut self, chunk: Chunk) {
        let id = chunk.id() as usize;
        debug_assert!(self.id_in_use(id), "chunk id was not allocated");
        if id >= self.chunks.len() {
            self.chunks.resize_with(id + 1, || None);
        }
        debug_assert!(self.chunks[id].is_none());
        self.chunks[id] = Some(Box::new(chunk));
        self.live += 1;
    }

    pub fn lookup(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id as usize)?.as_deref()
    }

    pub fn lookup_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(id as usize)?.as_deref_mut()
    }

    /// Resolve a page id to its chunk and slot index.
    pub fn lookup_by_page_id(&self, page: PageId) -> Option<(&Chunk, usize)> {
        if page > GMM_PAGEID_LAST {
            return None;
        }
        let chunk = self.lookup(page_id_to_chunk_id(page))?;
        Some((chunk, page_id_to_slot(page)))
    }

    pub fn lookup_by_page_id_mut(&mut self, page: PageId) -> Option<(&mut Chunk, usize)> {
        if page > GMM_PAGEID_LAST {
            return None;
        }
        let chunk = self.lookup_mut(page_id_to_chunk_id(page))?;
        Some((chunk, page_id_to_slot(page)))
    }

    /// Take an unused chunk out of the registry and recycle its id.
    pub fn remove(&mut self, id: ChunkId) -> GmmResult<Box<Chunk>> {
        match self.lookup(id) {
            None => return Err(GmmError::UnknownChunk { chunk: id }),
            Some(chunk) if !chunk.is_unused() => {
                return Err(GmmError::Inconsistent {
                    what: "removing a chunk that is still in use",
                })
            }
            Some(_) => {}
        }

        let chunk = self.chunks[id as usize]
            .take()
            .ok_or(GmmError::UnknownChunk { chunk: id })?;
        self.live -= 1;
        self.mark_id(id as usize, false);
        self.ids_in_use -= 1;
        self.id_hint = self.id_hint.min(id as usize);
        self.free_generation += 1;
        self.freed += 1;
        while matches!(self.chunks.last(), Some(None)) {
            self.chunks.pop();
        }

        info!(
            "chunk {:#x} destroyed, free generation {}",
            id, self.free_generation
        );
        Ok(chunk)
    }

    /// Number of chunks currently registered.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn free_generation(&self) -> u64 {
        self.free_generation
    }

    /// Chunks destroyed since the counter was last reset.
    pub fn freed(&self) -> u64 {
        self.freed
    }

    pub fn reset_freed(&mut self) {
        self.freed = 0;
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Chunk> {
        self.chunks.iter().filter_map(|c| c.as_deref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Chunk> {
        self.chunks.iter_mut().filter_map(|c| c.as_deref_mut())
    }

    /// Ids of all registered chunks, ascending.
    pub fn ids(&self) -> Vec<ChunkId> {
        self.iter().map(|c| c.id()).collect()
    }
}

impl Default for ChunkRegistry {
    fn default() -> Self {
        ChunkRegistry::new()
    }
}

impl AllocatorStatistics for ChunkRegistry {
    fn allocated(&self) -> usize {
        self.iter()
            .map(|c| GMM_CHUNK_NUM_PAGES - c.free_pages() as usize)
            .sum::<usize>()
            * BASE_PAGE_SIZE
    }

    fn size(&self) -> usize {
        self.live * LARGE_PAGE_SIZE
    }

    fn capacity(&self) -> usize {
        (self.id_limit as usize).saturating_mul(LARGE_PAGE_SIZE)
    }
}
