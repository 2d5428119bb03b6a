// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interface definitions for the host capability that provides the memory
//! behind chunks, and for querying allocator info.

use super::frame::Frame;
use super::{AllocationError, VAddr};

/// A trait to allocate, release and access chunk-sized blocks of pinned host
/// memory.
pub trait PageAllocator {
    /// Allocate and pin a zeroed, `LARGE_PAGE_SIZE` aligned block of
    /// `LARGE_PAGE_SIZE` bytes.
    fn allocate_chunk(&mut self) -> Result<Frame, AllocationError>;

    /// Give a block obtained from `allocate_chunk` back to the host.
    fn release_chunk(&mut self, f: Frame) -> Result<(), AllocationError>;

    /// Establish a mapping of `f` and return the address it is visible at.
    fn map_for_access(&mut self, f: Frame) -> Result<VAddr, AllocationError>;

    /// Tear down a mapping established by `map_for_access`.
    fn unmap(&mut self, addr: VAddr) -> Result<(), AllocationError>;

    /// Content of base page `idx` of `f`.
    fn page(&self, f: Frame, idx: usize) -> Option<&[u8]>;

    /// Mutable content of base page `idx` of `f`.
    fn page_mut(&mut self, f: Frame, idx: usize) -> Option<&mut [u8]>;
}

/// Provides information about an allocator.
pub trait AllocatorStatistics {
    /// Current free memory (in bytes) this allocator has.
    fn free(&self) -> usize {
        self.size() - self.allocated()
    }

    /// Memory (in bytes) that was handed out by this allocator
    /// and has not yet been reclaimed (memory currently in use).
    fn allocated(&self) -> usize;

    /// Total memory (in bytes) that is maintained by this allocator.
    fn size(&self) -> usize;

    /// Potential capacity (in bytes) that the allocator can maintain.
    ///
    /// Some allocator may have unlimited capacity, in that case
    /// they can return usize::max.
    ///
    /// e.g. this should hold `capacity() >= free() + allocated()`
    fn capacity(&self) -> usize;
}
