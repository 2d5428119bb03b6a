// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-VM reservation and usage accounting.

use alloc::collections::BTreeMap;

use arrayvec::ArrayVec;
use hashbrown::HashMap;

use gmm_abi::stats::{AccountStats, VmStats};
use gmm_abi::{
    Account, ChunkId, OcPolicy, PageId, Priority, VmId, GMM_SHARED_MODULE_MAX_REGIONS,
    NIL_GMM_CHUNKID,
};

use crate::error::{GmmError, GmmResult};
use crate::free_set::FreeChunkIndex;
use crate::memory::VAddr;
use crate::shared::ModuleId;

/// Number of entries in the per-VM chunk TLB.
pub const GMM_CHUNK_TLB_ENTRIES: usize = 32;

/// Pages per quota bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountPages {
    pub base: u64,
    pub shadow: u64,
    pub fixed: u64,
}

impl AccountPages {
    pub fn new(base: u64, shadow: u64, fixed: u64) -> AccountPages {
        AccountPages {
            base,
            shadow,
            fixed,
        }
    }

    pub fn get(&self, account: Account) -> GmmResult<u64> {
        match account {
            Account::Base => Ok(self.base),
            Account::Shadow => Ok(self.shadow),
            Account::Fixed => Ok(self.fixed),
            Account::Invalid | Account::End => Err(GmmError::InvalidAccount),
        }
    }

    pub fn get_mut(&mut self, account: Account) -> GmmResult<&mut u64> {
        match account {
            Account::Base => Ok(&mut self.base),
            Account::Shadow => Ok(&mut self.shadow),
            Account::Fixed => Ok(&mut self.fixed),
            Account::Invalid | Account::End => Err(GmmError::InvalidAccount),
        }
    }

    /// Pages in all three buckets, `None` if that does not fit a `u64`.
    pub fn total(&self) -> Option<u64> {
        self.base.checked_add(self.shadow)?.checked_add(self.fixed)
    }

    fn stats(&self) -> AccountStats {
        AccountStats {
            base_pages: self.base,
            shadow_pages: u32::try_from(self.shadow).unwrap_or(u32::MAX),
            fixed_pages: u32::try_from(self.fixed).unwrap_or(u32::MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TlbEntry {
    chunk: ChunkId,
    generation: u64,
    addr: VAddr,
}

/// Direct-mapped cache of `chunk id -> mapping address`.
///
/// Entries carry the free generation they were filled in, an entry from an
/// older generation may describe a chunk that is gone (and whose id has been
/// recycled) and is treated as a miss.
#[derive(Debug, Clone)]
pub struct ChunkTlb {
    entries: [Option<TlbEntry>; GMM_CHUNK_TLB_ENTRIES],
}

impl ChunkTlb {
    pub fn new() -> ChunkTlb {
        ChunkTlb {
            entries: [None; GMM_CHUNK_TLB_ENTRIES],
        }
    }

    fn slot(chunk: ChunkId) -> usize {
        chunk as usize % GMM_CHUNK_TLB_ENTRIES
    }

    pub fn lookup(&self, chunk: ChunkId, generation: u64) -> Option<VAddr> {
        match self.entries[ChunkTlb::slot(chunk)] {
            Some(e) if e.chunk == chunk && e.generation == generation => Some(e.addr),
            _ => None,
        }
    }

    pub fn fill(&mut self, chunk: ChunkId, generation: u64, addr: VAddr) {
        debug_assert_ne!(chunk, NIL_GMM_CHUNKID);
        self.entries[ChunkTlb::slot(chunk)] = Some(TlbEntry {
            chunk,
            generation,
            addr,
        });
    }

    pub fn invalidate(&mut self, chunk: ChunkId) {
        let slot = ChunkTlb::slot(chunk);
        if matches!(self.entries[slot], Some(e) if e.chunk == chunk) {
            self.entries[slot] = None;
        }
    }

    pub fn flush(&mut self) {
        self.entries = [None; GMM_CHUNK_TLB_ENTRIES];
    }
}

impl Default for ChunkTlb {
    fn default() -> Self {
        ChunkTlb::new()
    }
}

/// A shared module as one VM registered it.
#[derive(Debug, Clone)]
pub struct VmModule {
    pub module: ModuleId,
    pub size: u32,
    /// Guest physical address of every region in this VM.
    pub region_addrs: ArrayVec<u64, GMM_SHARED_MODULE_MAX_REGIONS>,
}

/// Everything the allocator knows about one VM.
#[derive(Debug)]
pub struct VmAccount {
    pub vm: VmId,
    pub reserved: AccountPages,
    pub allocated: AccountPages,
    /// Slots private to this VM (ballooned ones included).
    pub private_pages: u64,
    /// References to shared pages this VM holds.
    pub shared_pages: u64,
    pub ballooned_pages: u64,
    pub max_ballooned_pages: u64,
    pub req_ballooned_pages: u64,
    pub req_actually_ballooned_pages: u64,
    pub req_deflate_pages: u64,
    pub oc_policy: OcPolicy,
    pub priority: Priority,
    pub ballooning_enabled: bool,
    pub shared_paging_enabled: bool,
    pub may_allocate: bool,
    /// Shared page -> number of references this VM holds on it.
    pub shared_refs: HashMap<PageId, u32>,
    /// Guest frame -> page backing it, for pages that can be shared.
    pub guest_pages: HashMap<u32, PageId>,
    /// Registered shared modules, by guest base address.
    pub modules: BTreeMap<u64, VmModule>,
    /// Chunks bound to this VM that have free slots (bound memory mode).
    pub free_set: FreeChunkIndex,
    pub tlb: ChunkTlb,
}

impl VmAccount {
    pub fn new(vm: VmId, sharing: bool, ballooning: bool) -> VmAccount {
        VmAccount {
            vm,
            reserved: AccountPages::default(),
            allocated: AccountPages::default(),
            private_pages: 0,
            shared_pages: 0,
            ballooned_pages: 0,
            max_ballooned_pages: 0,
            req_ballooned_pages: 0,
            req_actually_ballooned_pages: 0,
            req_deflate_pages: 0,
            oc_policy: OcPolicy::Invalid,
            priority: Priority::Invalid,
            ballooning_enabled: ballooning,
            shared_paging_enabled: sharing,
            may_allocate: false,
            shared_refs: HashMap::new(),
            guest_pages: HashMap::new(),
            modules: BTreeMap::new(),
            free_set: FreeChunkIndex::new(),
            tlb: ChunkTlb::new(),
        }
    }

    /// Did the VM make its initial reservation?
    pub fn is_reserved(&self) -> bool {
        self.oc_policy != OcPolicy::Invalid
    }

    /// Can `pages` more pages be charged to `account`?
    ///
    /// Only the VM's own reservation is looked at here, the global budget is
    /// up to the caller.
    pub fn check_quota(&self, account: Account, pages: u64) -> GmmResult<()> {
        if !self.is_reserved() {
            return Err(GmmError::VmNotReserved);
        }
        if !self.may_allocate {
            return Err(GmmError::MayNotAllocate);
        }

        let allocated = self.allocated.get(account)?;
        let reserved = self.reserved.get(account)?;
        if allocated.saturating_add(pages) <= reserved {
            return Ok(());
        }

        match self.oc_policy {
            OcPolicy::ToBeDetermined => Ok(()),
            _ => Err(GmmError::QuotaExceeded {
                needed: pages,
                available: reserved.saturating_sub(allocated),
            }),
        }
    }

    /// Take a reference on the shared page `page`.
    pub fn add_shared_ref(&mut self, page: PageId) -> GmmResult<()> {
        self.shared_refs.try_reserve(1)?;
        *self.shared_refs.entry(page).or_insert(0) += 1;
        self.shared_pages += 1;
        Ok(())
    }

    /// Drop one of our references on `page`. Returns false if we had none.
    pub fn drop_shared_ref(&mut self, page: PageId) -> bool {
        match self.shared_refs.get_mut(&page) {
            Some(refs) if *refs > 1 => *refs -= 1,
            Some(_) => {
                self.shared_refs.remove(&page);
                self.guest_pages.retain(|_pfn, p| *p != page);
            }
            None => return false,
        }
        self.shared_pages -= 1;
        true
    }

    pub fn shared_refs_on(&self, page: PageId) -> u32 {
        self.shared_refs.get(&page).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            reserved: self.reserved.stats(),
            allocated: self.allocated.stats(),
            private_pages: self.private_pages,
            shared_pages: self.shared_pages,
            ballooned_pages: self.ballooned_pages,
            max_ballooned_pages: self.max_ballooned_pages,
            req_ballooned_pages: self.req_ballooned_pages,
            req_actually_ballooned_pages: self.req_actually_ballooned_pages,
            req_deflate_pages: self.req_deflate_pages,
            shareable_modules: self.modules.len() as u32,
            oc_policy: self.oc_policy,
            priority: self.priority,
            ballooning_enabled: self.ballooning_enabled,
            shared_paging_enabled: self.shared_paging_enabled,
            may_allocate: self.may_allocate,
        }
    }
}
