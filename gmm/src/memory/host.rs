// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A page allocator that backs chunks with heap memory of the current
//! process.
//!
//! Physical and mapping addresses are synthetic: blocks are handed out at
//! `LARGE_PAGE_SIZE` aligned addresses starting at `HOST_PHYS_BASE`, and
//! every `map_for_access` call gets a fresh address window.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use log::{debug, trace};

use super::backends::{AllocatorStatistics, PageAllocator};
use super::frame::Frame;
use super::{AllocationError, PAddr, VAddr, BASE_PAGE_SIZE, LARGE_PAGE_SIZE};

/// Where the first synthetic host physical block lives.
pub const HOST_PHYS_BASE: PAddr = 0x1_0000_0000;

/// Where the first synthetic mapping lives.
pub const HOST_MAP_BASE: VAddr = 0x7f00_0000_0000;

pub struct HostMemory {
    blocks: HashMap<PAddr, Box<[u8]>>,
    /// Physical addresses of released blocks, reused first.
    recycled: Vec<PAddr>,
    next_base: PAddr,
    mappings: HashMap<VAddr, PAddr>,
    next_map: VAddr,
    /// How many blocks we may hand out at most.
    limit: Option<usize>,
}

impl HostMemory {
    pub fn new() -> HostMemory {
        HostMemory {
            blocks: HashMap::new(),
            recycled: Vec::new(),
            next_base: HOST_PHYS_BASE,
            mappings: HashMap::new(),
            next_map: HOST_MAP_BASE,
            limit: None,
        }
    }

    /// A host that fails `allocate_chunk` once `chunks` blocks are in use.
    pub fn with_chunk_limit(chunks: usize) -> HostMemory {
        let mut host = HostMemory::new();
        host.limit = Some(chunks);
        host
    }

    pub fn set_chunk_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Number of blocks currently handed out.
    pub fn chunks_in_use(&self) -> usize {
        self.blocks.len()
    }

    /// Number of live mappings.
    pub fn mappings(&self) -> usize {
        self.mappings.len()
    }

}

impl Default for HostMemory {
    fn default() -> Self {
        HostMemory::new()
    }
}

impl PageAllocator for HostMemory {
    fn allocate_chunk(&mut self) -> Result<Frame, AllocationError> {
        if let Some(limit) = self.limit {
            if self.blocks.len() >= limit {
                debug!("host refuses chunk, {} of {} in use", self.blocks.len(), limit);
                return Err(AllocationError::LimitReached { count: limit });
            }
        }

        let mut backing: Vec<u8> = Vec::new();
        backing
            .try_reserve_exact(LARGE_PAGE_SIZE)
            .map_err(|_e| AllocationError::OutOfMemory {
                size: LARGE_PAGE_SIZE,
            })?;
        backing.resize(LARGE_PAGE_SIZE, 0);

        let base = match self.recycled.pop() {
            Some(base) => base,
            None => {
                let base = self.next_base;
                self.next_base += LARGE_PAGE_SIZE as u64;
                base
            }
        };
        self.blocks.insert(base, backing.into_boxed_slice());

        let frame = Frame::new(base, LARGE_PAGE_SIZE);
        trace!("allocate_chunk {:?}", frame);
        Ok(frame)
    }

    fn release_chunk(&mut self, f: Frame) -> Result<(), AllocationError> {
        trace!("release_chunk {:?}", f);
        self.blocks
            .remove(&f.base)
            .ok_or(AllocationError::UnknownFrame { base: f.base })?;
        self.mappings.retain(|_addr, base| *base != f.base);
        self.recycled.push(f.base);
        Ok(())
    }

    fn map_for_access(&mut self, f: Frame) -> Result<VAddr, AllocationError> {
        if !self.blocks.contains_key(&f.base) {
            return Err(AllocationError::UnknownFrame { base: f.base });
        }

        let addr = self.next_map;
        self.next_map += LARGE_PAGE_SIZE as u64;
        self.mappings.insert(addr, f.base);
        trace!("map_for_access {:?} at {:#x}", f, addr);
        Ok(addr)
    }

    fn unmap(&mut self, addr: VAddr) -> Result<(), AllocationError> {
        self.mappings
            .remove(&addr)
            .map(|_base| ())
            .ok_or(AllocationError::UnknownMapping { addr })
    }

    fn page(&self, f: Frame, idx: usize) -> Option<&[u8]> {
        let off = idx.checked_mul(BASE_PAGE_SIZE)?;
        self.blocks
            .get(&f.base)
            .and_then(|b| b.get(off..off.checked_add(BASE_PAGE_SIZE)?))
    }

    fn page_mut(&mut self, f: Frame, idx: usize) -> Option<&mut [u8]> {
        let off = idx.checked_mul(BASE_PAGE_SIZE)?;
        self.blocks
            .get_mut(&f.base)
            .and_then(|b| b.get_mut(off..off.checked_add(BASE_PAGE_SIZE)?))
    }
}

impl AllocatorStatistics for HostMemory {
    fn allocated(&self) -> usize {
        self.blocks.len() * LARGE_PAGE_SIZE
    }

    fn size(&self) -> usize {
        self.capacity()
    }

    fn capacity(&self) -> usize {
        self.limit
            .map_or(usize::MAX, |limit| limit.saturating_mul(LARGE_PAGE_SIZE))
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("chunks", &self.blocks.len())
            .field("mappings", &self.mappings.len())
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_release() {
        let mut host = HostMemory::new();
        let f1 = host.allocate_chunk().expect("chunk");
        let f2 = host.allocate_chunk().expect("chunk");
        assert_ne!(f1.base, f2.base);
        assert_eq!(f1.base % LARGE_PAGE_SIZE as u64, 0);
        assert_eq!(f1.size(), LARGE_PAGE_SIZE);
        assert_eq!(host.allocated(), 2 * LARGE_PAGE_SIZE);

        assert!(host.page(f1, 0).expect("page").iter().all(|b| *b == 0));
        host.page_mut(f1, 3).expect("page")[17] = 0xaa;
        assert_eq!(host.page(f1, 3).expect("page")[17], 0xaa);
        assert!(host.page(f1, 512).is_none());

        host.release_chunk(f1).expect("release");
        host.release_chunk(f1)
            .expect_err("Can't release the same block twice");
        assert_eq!(host.chunks_in_use(), 1);

        // Recycled blocks are zeroed again.
        let f3 = host.allocate_chunk().expect("chunk");
        assert_eq!(f3.base, f1.base);
        assert_eq!(host.page(f3, 3).expect("page")[17], 0);
    }

    #[test]
    fn chunk_limit() {
        let mut host = HostMemory::with_chunk_limit(1);
        let f = host.allocate_chunk().expect("first chunk fits");
        assert_eq!(
            host.allocate_chunk(),
            Err(AllocationError::LimitReached { count: 1 })
        );
        assert_eq!(host.free(), 0);

        host.set_chunk_limit(None);
        host.allocate_chunk().expect("no limit");
        host.release_chunk(f).expect("release");
    }

    #[test]
    fn mappings() {
        let mut host = HostMemory::new();
        let f = host.allocate_chunk().expect("chunk");
        let a = host.map_for_access(f).expect("map");
        let b = host.map_for_access(f).expect("map");
        assert_ne!(a, b);
        assert_eq!(host.mappings(), 2);

        host.unmap(a).expect("unmap");
        host.unmap(a).expect_err("already unmapped");
        host.release_chunk(f).expect("release");
        assert_eq!(host.mappings(), 0);
        host.map_for_access(f).expect_err("block is gone");
    }
}
