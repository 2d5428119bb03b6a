// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Page allocation: batches, handy page top-ups and large pages.

use alloc::vec::Vec;

use hashbrown::HashMap;
use log::{debug, trace};

use gmm_abi::req::GMM_MAX_HANDY_PAGES;
use gmm_abi::{
    guest_phys_to_pfn, is_valid_guest_phys, Account, GmmPageDesc, PageId, VmId, GMM_CHUNK_SIZE,
    GMM_GCPHYS_LAST, GMM_GCPHYS_UNSHAREABLE, GMM_PAGEID_LAST, GMM_PAGE_PFN_LAST,
    GMM_PAGE_PFN_UNSHAREABLE, GUEST_PAGE_SIZE, NIL_GMM_PAGEID,
};

use crate::chunk::Slot;
use crate::error::{GmmError, GmmResult};
use crate::memory::backends::PageAllocator;
use crate::memory::PAddr;

use super::{free_set_of, free_set_ref, Gmm, GmmState};

impl<A: PageAllocator> Gmm<A> {
    /// Allocate one page per descriptor in `pages`, all or nothing.
    ///
    /// Descriptors come in with a guest address (or NIL / unshareable) and
    /// NIL page ids, and go out with page id, host address and the zeroed
    /// flag filled in.
    pub fn allocate_pages(
        &self,
        vm: VmId,
        account: Account,
        pages: &mut [GmmPageDesc],
        zero: bool,
    ) -> GmmResult<()> {
        self.write(|st| st.allocate_pages(vm, account, pages, zero))
    }

    /// Update the guest tags of the first `to_update` descriptors, then
    /// allocate zeroed base pages into the first `to_alloc` descriptors.
    pub fn allocate_handy_pages(
        &self,
        vm: VmId,
        to_update: usize,
        to_alloc: usize,
        pages: &mut [GmmPageDesc],
    ) -> GmmResult<()> {
        self.write(|st| st.allocate_handy_pages(vm, to_update, to_alloc, pages))
    }

    /// Allocate a naturally aligned run of `size` bytes inside one chunk.
    ///
    /// Returns the page id of the first page and its host address.
    pub fn allocate_large_page(&self, vm: VmId, size: u64) -> GmmResult<(PageId, PAddr)> {
        self.write(|st| st.allocate_large_page(vm, size))
    }
}

impl<A: PageAllocator> GmmState<A> {
    fn allocate_pages(
        &mut self,
        vm: VmId,
        account: Account,
        pages: &mut [GmmPageDesc],
        zero: bool,
    ) -> GmmResult<()> {
        if !account.is_valid() {
            return Err(GmmError::InvalidAccount);
        }
        if pages.is_empty() {
            return Err(GmmError::InvalidParameter);
        }
        self.vm(vm)?;
        for desc in pages.iter() {
            if !is_valid_guest_phys(desc.phys())
                || desc.id_page != NIL_GMM_PAGEID
                || desc.id_shared_page != NIL_GMM_PAGEID
            {
                return Err(GmmError::InvalidParameter);
            }
        }

        debug!("vm {} allocates {} {:?} pages", vm, pages.len(), account);
        self.allocate_batch(vm, account, pages, zero)
    }

    /// Allocate and charge one private page per descriptor.
    ///
    /// Either every page is allocated and charged or nothing changed.
    fn allocate_batch(
        &mut self,
        vm: VmId,
        account: Account,
        pages: &mut [GmmPageDesc],
        zero: bool,
    ) -> GmmResult<()> {
        let n = pages.len() as u64;
        self.vm(vm)?.check_quota(account, n)?;
        self.ledger.check_global(n)?;
        self.vm_mut(vm)?.guest_pages.try_reserve(pages.len())?;

        let mut done: Vec<(PageId, PAddr, bool)> = Vec::new();
        done.try_reserve_exact(pages.len())
            .map_err(|_e| GmmError::OutOfHostMemory)?;

        for desc in pages.iter() {
            let pfn = guest_phys_to_pfn(desc.phys());
            match self.allocate_one(vm, account, pfn, zero) {
                Ok(page) => done.push(page),
                Err(e) => {
                    debug!(
                        "allocation of page {} of {} failed: {}",
                        done.len() + 1,
                        pages.len(),
                        e
                    );
                    self.rollback_pages(&done);
                    return Err(e);
                }
            }
        }

        let acct = self.vm_mut(vm)?;
        for (desc, (page, phys, zeroed)) in pages.iter_mut().zip(done) {
            let pfn = guest_phys_to_pfn(desc.phys());
            if pfn <= GMM_PAGE_PFN_LAST {
                acct.guest_pages.insert(pfn, page);
            }
            *desc = GmmPageDesc::new(phys, page, NIL_GMM_PAGEID);
            desc.set_zeroed(zeroed);
        }
        *acct.allocated.get_mut(account)? += n;
        acct.private_pages += n;
        self.ledger.allocated_pages += n;
        Ok(())
    }

    fn allocate_handy_pages(
        &mut self,
        vm: VmId,
        to_update: usize,
        to_alloc: usize,
        pages: &mut [GmmPageDesc],
    ) -> GmmResult<()> {
        if to_update > GMM_MAX_HANDY_PAGES
            || to_alloc > GMM_MAX_HANDY_PAGES
            || (to_update == 0 && to_alloc == 0)
            || pages.len() < to_update.max(to_alloc)
        {
            return Err(GmmError::InvalidParameter);
        }

        let account = self.vm(vm)?;
        if !account.is_reserved() {
            return Err(GmmError::VmNotReserved);
        }

        // Validate everything before touching anything.
        let mut releasing: HashMap<PageId, u32> = HashMap::new();
        for desc in pages[..to_update].iter() {
            if !is_valid_guest_phys(desc.phys())
                || desc.id_page > GMM_PAGEID_LAST
                || desc.id_shared_page > GMM_PAGEID_LAST
            {
                return Err(GmmError::InvalidParameter);
            }

            if desc.id_page != NIL_GMM_PAGEID {
                let page = desc.id_page;
                let (chunk, idx) = self.lookup_page(page)?;
                match chunk.slot(idx) {
                    Some(Slot::Private { vm: owner, .. }) if *owner == vm => {}
                    Some(Slot::Free { .. }) => return Err(GmmError::DoubleFree { page }),
                    Some(slot) if slot.is_owned_by(vm) => {
                        return Err(GmmError::InvalidPageState { page })
                    }
                    _ => return Err(GmmError::NotOwner { page }),
                }
            }

            if desc.id_shared_page != NIL_GMM_PAGEID {
                let page = desc.id_shared_page;
                let wanted = releasing.entry(page).or_default();
                *wanted += 1;
                if account.shared_refs_on(page) < *wanted {
                    return Err(GmmError::NotOwner { page });
                }
            }
        }
        for desc in pages[to_update..to_alloc.max(to_update)].iter() {
            if !desc.is_nil() {
                return Err(GmmError::InvalidParameter);
            }
        }

        for desc in pages[..to_update].iter_mut() {
            if desc.id_page != NIL_GMM_PAGEID {
                self.update_guest_tag(vm, desc.id_page, desc.phys());
            }
            if desc.id_shared_page != NIL_GMM_PAGEID {
                let (alive, chunk) = self.release_shared_ref(vm, desc.id_shared_page)?;
                if !alive {
                    self.destroy_chunk_if_unused(chunk);
                }
            }
            *desc = GmmPageDesc::nil();
        }

        if to_alloc > 0 {
            self.allocate_batch(vm, Account::Base, &mut pages[..to_alloc], true)?;
        }
        trace!("vm {} handy pages: {} updated, {} allocated", vm, to_update, to_alloc);
        Ok(())
    }

    /// Record the guest address `gcphys` for the private page `page`.
    ///
    /// NIL leaves the current tag alone.
    fn update_guest_tag(&mut self, vm: VmId, page: PageId, gcphys: u64) {
        let new_pfn = if gcphys <= GMM_GCPHYS_LAST {
            guest_phys_to_pfn(gcphys)
        } else if gcphys == GMM_GCPHYS_UNSHAREABLE {
            GMM_PAGE_PFN_UNSHAREABLE
        } else {
            return;
        };

        let old_pfn = match self.chunks.lookup_by_page_id_mut(page) {
            Some((chunk, idx)) => match chunk.slot(idx) {
                Some(Slot::Private { pfn, .. }) => {
                    let old = *pfn;
                    chunk.set_pfn(idx, new_pfn);
                    old
                }
                _ => return,
            },
            None => return,
        };

        if let Some(account) = self.vms.get_mut(&vm) {
            if account.guest_pages.get(&old_pfn) == Some(&page) {
                account.guest_pages.remove(&old_pfn);
            }
            if new_pfn <= GMM_PAGE_PFN_LAST {
                account.guest_pages.insert(new_pfn, page);
            }
        }
    }

    fn allocate_large_page(&mut self, vm: VmId, size: u64) -> GmmResult<(PageId, PAddr)> {
        if !size.is_power_of_two()
            || size < GUEST_PAGE_SIZE as u64
            || size > GMM_CHUNK_SIZE as u64
        {
            return Err(GmmError::InvalidLargePageSize { size });
        }
        let pages = (size / GUEST_PAGE_SIZE as u64) as usize;
        self.vm(vm)?.check_quota(Account::Base, pages as u64)?;
        self.ledger.check_global(pages as u64)?;

        let owner = self.owner_for(vm);
        let mut found = None;
        let mut had_candidates = false;
        for id in free_set_ref(&self.free_set, &self.vms, owner).candidates(pages as u16) {
            had_candidates = true;
            if let Some(start) = self.chunks.lookup(id).and_then(|c| c.find_free_run(pages)) {
                found = Some((id, start));
                break;
            }
        }

        let (id, start) = match found {
            Some(hit) => hit,
            None => match self.create_chunk(owner) {
                Ok(id) => (id, 0),
                Err(e) if had_candidates => {
                    debug!("no room for a {} page run and no new chunk: {}", pages, e);
                    return Err(GmmError::NoContiguousSpace { pages });
                }
                Err(e) => return Err(e),
            },
        };

        let chunk = self.chunks.lookup_mut(id).ok_or(GmmError::Inconsistent {
            what: "free chunk index points at a missing chunk",
        })?;
        let dirty: Vec<usize> = (start..start + pages)
            .filter(|idx| matches!(chunk.slot(*idx), Some(Slot::Free { zeroed: false })))
            .collect();
        chunk.allocate_run(start, pages, vm, GMM_PAGE_PFN_UNSHAREABLE);
        let frame = chunk.frame();
        let (page, phys, free) = (chunk.page_id(start), chunk.host_phys(start), chunk.free_pages());
        for idx in dirty {
            if let Some(data) = self.host.page_mut(frame, idx) {
                data.fill(0);
            }
        }
        free_set_of(&mut self.free_set, &mut self.vms, owner).insert(id, free);

        let account = self.vm_mut(vm)?;
        account.allocated.base += pages as u64;
        account.private_pages += pages as u64;
        self.ledger.allocated_pages += pages as u64;
        debug!("vm {} got a {} byte page {:#x} at {:#x}", vm, size, page, phys);
        Ok((page, phys))
    }
}
