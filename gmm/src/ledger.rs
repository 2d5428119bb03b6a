// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process wide page totals and the audit that reconciles them with the
//! chunks and VM accounts.

use hashbrown::HashMap;
use log::error;

use gmm_abi::{Account, PageId, VmId};

use crate::account::VmAccount;
use crate::chunk::Slot;
use crate::error::{GmmError, GmmResult};
use crate::free_set::FreeChunkIndex;
use crate::registry::ChunkRegistry;

/// Global page counters.
///
/// Every counter is the sum of per-VM or per-chunk quantities, see
/// [`GlobalLedger::audit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalLedger {
    pub max_pages: u64,
    pub reserved_pages: u64,
    /// Reserved pages in excess of `max_pages`.
    pub over_committed_pages: u64,
    /// Page references charged to VM accounts (ballooned pages included).
    pub allocated_pages: u64,
    /// Number of shared slots.
    pub shared_pages: u64,
    /// References to shared slots beyond the first one.
    pub duplicate_pages: u64,
    /// Shared references dropped by VM cleanup whose page stayed alive.
    pub left_behind_shared_pages: u64,
    pub ballooned_pages: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct SlotCounts {
    base: u64,
    shadow: u64,
    fixed: u64,
    ballooned: u64,
}

impl GlobalLedger {
    pub fn new(max_pages: u64) -> GlobalLedger {
        GlobalLedger {
            max_pages,
            ..Default::default()
        }
    }

    pub fn update_over_commit(&mut self) {
        self.over_committed_pages = self.reserved_pages.saturating_sub(self.max_pages);
    }

    /// Can another `pages` references be charged without crossing the
    /// global budget?
    pub fn check_global(&self, pages: u64) -> GmmResult<()> {
        match self.allocated_pages.checked_add(pages) {
            Some(total) if total <= self.max_pages => Ok(()),
            _ => Err(GmmError::OutOfHostMemory),
        }
    }

    /// Host pages backing guest memory right now.
    pub fn physical_pages(&self) -> u64 {
        self.allocated_pages.saturating_sub(self.duplicate_pages)
    }

    /// Recompute every counter from the chunks and VM accounts.
    ///
    /// Logs and returns the number of mismatches found.
    pub fn audit(
        &self,
        chunks: &ChunkRegistry,
        vms: &HashMap<VmId, VmAccount>,
        free_set: &FreeChunkIndex,
    ) -> usize {
        let mut errors = 0;
        let mut check = |what: &str, expected: u64, actual: u64| {
            if expected != actual {
                error!("audit: {} is {} but should be {}", what, actual, expected);
                errors += 1;
            }
        };

        let mut per_vm: HashMap<VmId, SlotCounts> = HashMap::new();
        let mut refs: HashMap<PageId, u32> = HashMap::new();
        let mut shared_slots = 0u64;
        let mut shared_refs = 0u64;
        let mut chunk_errors = 0;

        for chunk in chunks.iter() {
            chunk_errors += chunk.verify();
            for (idx, slot) in chunk.slots() {
                match slot {
                    Slot::Free { .. } => {}
                    Slot::Private { vm, account, .. } => {
                        let counts = per_vm.entry(*vm).or_default();
                        match account {
                            Account::Base => counts.base += 1,
                            Account::Shadow => counts.shadow += 1,
                            Account::Fixed => counts.fixed += 1,
                            _ => chunk_errors += 1,
                        }
                    }
                    Slot::Ballooned { vm, .. } => {
                        let counts = per_vm.entry(*vm).or_default();
                        counts.base += 1;
                        counts.ballooned += 1;
                    }
                    Slot::Shared { refs: n, .. } => {
                        shared_slots += 1;
                        shared_refs += *n as u64;
                        refs.insert(chunk.page_id(idx), *n);
                    }
                }
            }

            let index = match chunk.owner() {
                Some(owner) => vms.get(&owner).map_or(free_set, |vm| &vm.free_set),
                None => free_set,
            };
            if index.free_count(chunk.id()) != chunk.free_pages() {
                error!(
                    "audit: free index has {} free slots for chunk {:#x}, chunk says {}",
                    index.free_count(chunk.id()),
                    chunk.id(),
                    chunk.free_pages()
                );
                chunk_errors += 1;
            }
        }

        let mut allocated = 0u64;
        let mut reserved = 0u64;
        let mut ballooned = 0u64;
        let mut held: HashMap<PageId, u32> = HashMap::new();
        for (id, vm) in vms.iter() {
            let counts = per_vm.remove(id).unwrap_or_default();
            let vm_refs: u64 = vm.shared_refs.values().map(|n| *n as u64).sum();
            for (page, n) in vm.shared_refs.iter() {
                *held.entry(*page).or_default() += *n;
            }

            check("vm base pages", counts.base + vm_refs, vm.allocated.base);
            check("vm shadow pages", counts.shadow, vm.allocated.shadow);
            check("vm fixed pages", counts.fixed, vm.allocated.fixed);
            check(
                "vm private pages",
                counts.base + counts.shadow + counts.fixed,
                vm.private_pages,
            );
            check("vm shared pages", vm_refs, vm.shared_pages);
            check("vm ballooned pages", counts.ballooned, vm.ballooned_pages);

            allocated = allocated.saturating_add(vm.allocated.total().unwrap_or(u64::MAX));
            reserved = reserved.saturating_add(vm.reserved.total().unwrap_or(u64::MAX));
            ballooned += vm.ballooned_pages;
        }
        // Slots of VMs that no longer exist.
        check("orphaned private pages", 0, per_vm.len() as u64);

        for (page, n) in refs.iter() {
            check("shared page references", *n as u64, held.get(page).copied().unwrap_or(0) as u64);
        }
        check(
            "dangling shared references",
            0,
            held.keys().filter(|p| !refs.contains_key(*p)).count() as u64,
        );

        check("allocated pages", allocated, self.allocated_pages);
        check("reserved pages", reserved, self.reserved_pages);
        check("ballooned pages", ballooned, self.ballooned_pages);
        check("shared pages", shared_slots, self.shared_pages);
        check("duplicate pages", shared_refs - shared_slots, self.duplicate_pages);
        check(
            "over-committed pages",
            self.reserved_pages.saturating_sub(self.max_pages),
            self.over_committed_pages,
        );

        errors + chunk_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountPages;
    use crate::chunk::Chunk;
    use crate::memory::frame::Frame;
    use crate::memory::LARGE_PAGE_SIZE;

    #[test]
    fn global_budget() {
        let mut ledger = GlobalLedger::new(10);
        ledger.check_global(10).expect("fits");
        ledger.allocated_pages = 8;
        assert_eq!(ledger.check_global(3), Err(GmmError::OutOfHostMemory));
        assert_eq!(ledger.check_global(u64::MAX), Err(GmmError::OutOfHostMemory));

        ledger.duplicate_pages = 3;
        assert_eq!(ledger.physical_pages(), 5);

        ledger.reserved_pages = 14;
        ledger.update_over_commit();
        assert_eq!(ledger.over_committed_pages, 4);
    }

    #[test]
    fn audit_empty() {
        let ledger = GlobalLedger::new(100);
        let errors = ledger.audit(&ChunkRegistry::new(), &HashMap::new(), &FreeChunkIndex::new());
        assert_eq!(errors, 0);
    }

    #[test]
    fn audit_finds_mismatches() {
        let _r = env_logger::try_init();
        let mut chunks = ChunkRegistry::new();
        let id = chunks.allocate_id().expect("id");
        let mut chunk = Chunk::new(id, Frame::new(0x1_0000_0000, LARGE_PAGE_SIZE), None);
        chunk.allocate(1, Account::Base, 0).expect("slot");
        chunks.insert(chunk);

        let mut free_set = FreeChunkIndex::new();
        free_set.insert(id, 511);

        let mut vm = VmAccount::new(1, true, true);
        vm.reserved = AccountPages::new(4, 1, 1);
        vm.allocated.base = 1;
        vm.private_pages = 1;
        let mut vms = HashMap::new();
        vms.insert(1, vm);

        let mut ledger = GlobalLedger::new(100);
        ledger.reserved_pages = 6;
        ledger.allocated_pages = 1;
        assert_eq!(ledger.audit(&chunks, &vms, &free_set), 0);

        ledger.allocated_pages = 2;
        assert_eq!(ledger.audit(&chunks, &vms, &free_set), 1);

        free_set.insert(id, 512);
        assert_eq!(ledger.audit(&chunks, &vms, &free_set), 2);
    }
}
