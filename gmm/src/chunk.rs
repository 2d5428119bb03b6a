// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The allocation unit: a chunk of host memory split into page slots.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use log::trace;

use gmm_abi::{make_page_id, Account, ChunkId, PageId, VmId, GMM_CHUNK_NUM_PAGES};

use crate::memory::frame::Frame;
use crate::memory::{PAddr, VAddr};

// Slot counters are kept as u16.
static_assertions::const_assert!(GMM_CHUNK_NUM_PAGES <= u16::MAX as usize);

/// Position of a private slot within an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Run {
    /// A regular page.
    Single,
    /// First slot of a large page spanning this many slots.
    Head(u16),
    /// Any other slot of a large page.
    Tail,
}

/// The state of one page slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Free {
        /// The page is known to contain only zeroes.
        zeroed: bool,
    },
    Private {
        vm: VmId,
        /// Guest frame number tag, `GMM_PAGE_PFN_UNSHAREABLE` if none.
        pfn: u32,
        account: Account,
        run: Run,
    },
    Shared {
        /// Number of page references held by VMs.
        refs: u32,
        /// CRC-32 of the content at the time it became shared (strict mode).
        checksum: u32,
    },
    Ballooned {
        vm: VmId,
        pfn: u32,
    },
}

impl Slot {
    pub fn is_free(&self) -> bool {
        matches!(self, Slot::Free { .. })
    }

    /// Is this slot private to `vm` (ballooned slots included)?
    pub fn is_owned_by(&self, vm: VmId) -> bool {
        match self {
            Slot::Private { vm: owner, .. } | Slot::Ballooned { vm: owner, .. } => *owner == vm,
            _ => false,
        }
    }
}

/// A VM's view of the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMapping {
    pub vm: VmId,
    pub addr: VAddr,
}

/// A chunk of `GMM_CHUNK_NUM_PAGES` page slots.
pub struct Chunk {
    id: ChunkId,
    frame: Frame,
    slots: Box<[Slot]>,
    free: u16,
    private: u16,
    shared: u16,
    ballooned: u16,
    /// The VM this chunk is bound to (bound memory mode only).
    owner: Option<VmId>,
    mappings: Vec<ChunkMapping>,
    /// No free slot lives below this index.
    free_hint: usize,
}

impl Chunk {
    /// A chunk with all slots free, backed by the freshly allocated
    /// (zeroed) `frame`.
    pub fn new(id: ChunkId, frame: Frame, owner: Option<VmId>) -> Chunk {
        debug_assert_eq!(frame.base_pages(), GMM_CHUNK_NUM_PAGES);
        Chunk {
            id,
            frame,
            slots: alloc::vec![Slot::Free { zeroed: true }; GMM_CHUNK_NUM_PAGES].into_boxed_slice(),
            free: GMM_CHUNK_NUM_PAGES as u16,
            private: 0,
            shared: 0,
            ballooned: 0,
            owner,
            mappings: Vec::new(),
            free_hint: 0,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn owner(&self) -> Option<VmId> {
        self.owner
    }

    pub fn set_owner(&mut self, owner: Option<VmId>) {
        self.owner = owner;
    }

    pub fn free_pages(&self) -> u16 {
        self.free
    }

    pub fn private_pages(&self) -> u16 {
        self.private
    }

    pub fn shared_pages(&self) -> u16 {
        self.shared
    }

    pub fn ballooned_pages(&self) -> u16 {
        self.ballooned
    }

    pub fn slot(&self, idx: usize) -> Option<&Slot> {
        self.slots.get(idx)
    }

    pub fn slots(&self) -> impl DoubleEndedIterator<Item = (usize, &Slot)> {
        self.slots.iter().enumerate()
    }

    pub fn page_id(&self, idx: usize) -> PageId {
        make_page_id(self.id, idx)
    }

    pub fn host_phys(&self, idx: usize) -> PAddr {
        self.frame.base + (idx as u64) * crate::memory::BASE_PAGE_SIZE as u64
    }

    /// All slots free and no mappings left.
    pub fn is_unused(&self) -> bool {
        self.free as usize == GMM_CHUNK_NUM_PAGES && self.mappings.is_empty()
    }

    fn account_slot(&mut self, slot: Slot, add: bool) {
        let counter = match slot {
            Slot::Free { .. } => &mut self.free,
            Slot::Private { .. } => &mut self.private,
            Slot::Shared { .. } => &mut self.shared,
            Slot::Ballooned { .. } => &mut self.ballooned,
        };
        if add {
            *counter += 1;
        } else {
            *counter -= 1;
        }
    }

    /// Replace the state of slot `idx`, keeping the per-state counters
    /// current. Returns the previous state.
    fn set(&mut self, idx: usize, new: Slot) -> Slot {
        let old = core::mem::replace(&mut self.slots[idx], new);
        self.account_slot(old, false);
        self.account_slot(new, true);
        if new.is_free() && idx < self.free_hint {
            self.free_hint = idx;
        }
        old
    }

    /// Hand out the lowest free slot as a private page.
    ///
    /// Returns the slot index and whether the page is known to be zeroed.
    pub fn allocate(&mut self, vm: VmId, account: Account, pfn: u32) -> Option<(usize, bool)> {
        let idx = (self.free_hint..GMM_CHUNK_NUM_PAGES).find(|i| self.slots[*i].is_free())?;
        let zeroed = matches!(self.slots[idx], Slot::Free { zeroed: true });
        self.set(
            idx,
            Slot::Private {
                vm,
                pfn,
                account,
                run: Run::Single,
            },
        );
        self.free_hint = idx + 1;
        trace!("chunk {:#x} slot {} -> vm {}", self.id, idx, vm);
        Some((idx, zeroed))
    }

    /// Find a naturally aligned run of `pages` free slots.
    pub fn find_free_run(&self, pages: usize) -> Option<usize> {
        if pages == 0 || pages > GMM_CHUNK_NUM_PAGES || (self.free as usize) < pages {
            return None;
        }
        (0..GMM_CHUNK_NUM_PAGES)
            .step_by(pages)
            .find(|start| self.slots[*start..*start + pages].iter().all(Slot::is_free))
    }

    /// Turn `pages` free slots starting at `start` into one large page of
    /// `vm`, charged to the base account.
    pub fn allocate_run(&mut self, start: usize, pages: usize, vm: VmId, pfn: u32) {
        for idx in start..start + pages {
            debug_assert!(self.slots[idx].is_free());
            let run = if idx == start {
                Run::Head(pages as u16)
            } else {
                Run::Tail
            };
            self.set(
                idx,
                Slot::Private {
                    vm,
                    pfn,
                    account: Account::Base,
                    run,
                },
            );
        }
    }

    /// Free slot `idx` (private, ballooned or the last shared reference).
    pub fn release(&mut self, idx: usize) -> Slot {
        trace!("chunk {:#x} slot {} freed", self.id, idx);
        self.set(idx, Slot::Free { zeroed: false })
    }

    /// Convert the private slot `idx` into a shared page with one reference.
    pub fn make_shared(&mut self, idx: usize, checksum: u32) -> Slot {
        self.set(idx, Slot::Shared { refs: 1, checksum })
    }

    /// Add a reference to the shared slot `idx`, returns the new count.
    pub fn add_shared_ref(&mut self, idx: usize) -> Option<u32> {
        match &mut self.slots[idx] {
            Slot::Shared { refs, .. } => {
                *refs += 1;
                Some(*refs)
            }
            _ => None,
        }
    }

    /// Drop a reference of the shared slot `idx`, returns the remaining
    /// count. The slot stays shared at zero, the caller frees it.
    pub fn drop_shared_ref(&mut self, idx: usize) -> Option<u32> {
        match &mut self.slots[idx] {
            Slot::Shared { refs, .. } if *refs > 0 => {
                *refs -= 1;
                Some(*refs)
            }
            _ => None,
        }
    }

    pub fn balloon(&mut self, idx: usize) -> bool {
        match self.slots[idx] {
            Slot::Private {
                vm,
                pfn,
                run: Run::Single,
                ..
            } => {
                self.set(idx, Slot::Ballooned { vm, pfn });
                true
            }
            _ => false,
        }
    }

    pub fn deflate(&mut self, idx: usize) -> bool {
        match self.slots[idx] {
            Slot::Ballooned { vm, pfn } => {
                self.set(
                    idx,
                    Slot::Private {
                        vm,
                        pfn,
                        account: Account::Base,
                        run: Run::Single,
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// Update the guest tag of the private slot `idx`.
    pub fn set_pfn(&mut self, idx: usize, new_pfn: u32) -> bool {
        match &mut self.slots[idx] {
            Slot::Private { pfn, .. } => {
                *pfn = new_pfn;
                true
            }
            _ => false,
        }
    }

    pub fn mark_zeroed(&mut self, idx: usize) {
        if let Slot::Free { zeroed } = &mut self.slots[idx] {
            *zeroed = true;
        }
    }

    pub fn mapping(&self, vm: VmId) -> Option<VAddr> {
        self.mappings.iter().find(|m| m.vm == vm).map(|m| m.addr)
    }

    pub fn mappings(&self) -> &[ChunkMapping] {
        &self.mappings
    }

    pub fn add_mapping(&mut self, vm: VmId, addr: VAddr) {
        debug_assert!(self.mapping(vm).is_none());
        self.mappings.push(ChunkMapping { vm, addr });
    }

    pub fn remove_mapping(&mut self, vm: VmId) -> Option<VAddr> {
        let pos = self.mappings.iter().position(|m| m.vm == vm)?;
        Some(self.mappings.swap_remove(pos).addr)
    }

    /// Recount the slot states and compare with the cached counters.
    ///
    /// Returns the number of mismatches found.
    pub fn verify(&self) -> usize {
        let (mut free, mut private, mut shared, mut ballooned) = (0u16, 0u16, 0u16, 0u16);
        let mut errors = 0;
        for (idx, slot) in self.slots() {
            match slot {
                Slot::Free { .. } => free += 1,
                Slot::Private { .. } => private += 1,
                Slot::Shared { refs, .. } => {
                    shared += 1;
                    if *refs == 0 {
                        errors += 1;
                    }
                }
                Slot::Ballooned { .. } => ballooned += 1,
            }
            if let Slot::Private {
                run: Run::Head(pages),
                vm,
                ..
            } = slot
            {
                let tail_ok = (idx + 1..idx + *pages as usize).all(|t| {
                    matches!(self.slots.get(t), Some(Slot::Private { run: Run::Tail, vm: v, .. }) if v == vm)
                });
                if !tail_ok {
                    errors += 1;
                }
            }
        }
        errors += (free != self.free) as usize;
        errors += (private != self.private) as usize;
        errors += (shared != self.shared) as usize;
        errors += (ballooned != self.ballooned) as usize;
        errors
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &format_args!("{:#x}", self.id))
            .field("frame", &self.frame)
            .field("free", &self.free)
            .field("private", &self.private)
            .field("shared", &self.shared)
            .field("ballooned", &self.ballooned)
            .field("owner", &self.owner)
            .field("mappings", &self.mappings.len())
            .finish()
    }
}
