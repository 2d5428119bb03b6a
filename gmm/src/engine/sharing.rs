// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared modules and page deduplication.
//!
//! A VM registers the modules (OS libraries and the like) it has loaded.
//! `check_shared_modules` then walks the guest pages of every registered
//! region: a private page whose content matches an existing shared page is
//! merged into it, otherwise the page itself becomes the shared copy other
//! VMs can merge into.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use log::{debug, error, info, trace, warn};

use gmm_abi::req::{RegisterSharedModuleReq, SharedPageRedirect, UnregisterSharedModuleReq};
use gmm_abi::{
    Account, PageId, VmId, GMM_PAGE_PFN_LAST, GMM_SHARED_MODULE_MAX_REGIONS, GUEST_PAGE_SHIFT,
    NIL_GMM_PAGEID,
};

use crate::account::VmModule;
use crate::chunk::{Run, Slot};
use crate::error::{sub_or_clamp, GmmError, GmmResult};
use crate::memory::backends::PageAllocator;
use crate::shared::{crc32, validate_module, ModuleId, GMM_MAX_SHARED_PER_VM_MODULES};

use super::{Gmm, GmmState};

/// Outcome of a successful module registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRegistration {
    Registered,
    /// The VM already had this very module at this address.
    AlreadyRegistered,
}

/// What a deduplication pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharingReport {
    /// Private pages that became the shared copy of their content.
    pub converted: u32,
    /// Private pages that were replaced by an existing shared page.
    pub merged: u32,
    /// Pages whose content differed from the region's canonical page.
    pub mismatched: u32,
    /// Region pages that were not backed by a shareable private page.
    pub skipped: u32,
    /// Guest pages that now point at a different page.
    pub redirects: Vec<SharedPageRedirect>,
}

/// One guest page of a registered region.
#[derive(Debug, Clone, Copy)]
struct RegionPage {
    module: ModuleId,
    region: usize,
    idx: usize,
    pfn: u32,
}

impl<A: PageAllocator> Gmm<A> {
    pub fn register_shared_module(
        &self,
        vm: VmId,
        req: &RegisterSharedModuleReq,
    ) -> GmmResult<ModuleRegistration> {
        self.write(|st| st.register_shared_module(vm, req))
    }

    pub fn unregister_shared_module(
        &self,
        vm: VmId,
        req: &UnregisterSharedModuleReq,
    ) -> GmmResult<()> {
        self.write(|st| st.unregister_shared_module(vm, req))
    }

    /// Drop every module registration of `vm` (VM reset).
    pub fn reset_shared_modules(&self, vm: VmId) -> GmmResult<()> {
        self.write(|st| st.release_vm_modules(vm).map(|_n| ()))
    }

    /// Deduplicate the pages of all modules `vm` registered.
    pub fn check_shared_modules(&self, vm: VmId) -> GmmResult<SharingReport> {
        self.write(|st| st.check_shared_modules(vm))
    }

    /// Does any other live page have the same content as `page`?
    pub fn find_duplicate_page(&self, vm: VmId, page: PageId) -> GmmResult<bool> {
        self.read(|st| st.find_duplicate_page(vm, page))
    }
}

impl<A: PageAllocator> GmmState<A> {
    fn register_shared_module(
        &mut self,
        vm: VmId,
        req: &RegisterSharedModuleReq,
    ) -> GmmResult<ModuleRegistration> {
        let account = self.vm(vm)?;
        if !account.shared_paging_enabled {
            return Err(GmmError::FeatureDisabled);
        }
        validate_module(&req.name, &req.version, req.module_size, &req.regions)?;

        if let Some(existing) = account.modules.get(&req.base_addr) {
            let same = self.modules.get(existing.module).map_or(false, |m| {
                m.matches(
                    &req.name,
                    &req.version,
                    req.module_size,
                    req.guest_os,
                    &req.regions,
                )
            });
            return if same {
                debug!("vm {} re-registered {} at {:#x}", vm, req.name, req.base_addr);
                Ok(ModuleRegistration::AlreadyRegistered)
            } else {
                warn!(
                    "vm {} registers {} at {:#x} where another module lives",
                    vm, req.name, req.base_addr
                );
                Err(GmmError::ModuleAddressClash)
            };
        }
        if account.modules.len() >= GMM_MAX_SHARED_PER_VM_MODULES {
            return Err(GmmError::TooManyModules);
        }

        let region_addrs: ArrayVec<u64, GMM_SHARED_MODULE_MAX_REGIONS> = req
            .regions
            .iter()
            .map(|r| r.gc_phys)
            .collect();
        let module = match self.modules.find(
            &req.name,
            &req.version,
            req.module_size,
            req.guest_os,
            &req.regions,
        ) {
            Some(id) => {
                self.modules.retain(id);
                id
            }
            None => self.modules.create(
                &req.name,
                &req.version,
                req.module_size,
                req.guest_os,
                &req.regions,
            )?,
        };

        self.vm_mut(vm)?.modules.insert(
            req.base_addr,
            VmModule {
                module,
                size: req.module_size,
                region_addrs,
            },
        );
        info!(
            "vm {} registered {} {} at {:#x}",
            vm, req.name, req.version, req.base_addr
        );
        Ok(ModuleRegistration::Registered)
    }

    fn unregister_shared_module(
        &mut self,
        vm: VmId,
        req: &UnregisterSharedModuleReq,
    ) -> GmmResult<()> {
        let account = self.vm(vm)?;
        let registered = account
            .modules
            .get(&req.base_addr)
            .ok_or(GmmError::ModuleNotFound)?;
        let module = self
            .modules
            .get(registered.module)
            .ok_or(GmmError::Inconsistent {
                what: "vm references a module that does not exist",
            })?;
        if module.name != req.name
            || module.version != req.version
            || registered.size != req.module_size
        {
            return Err(GmmError::ModuleNotFound);
        }

        let id = registered.module;
        self.vm_mut(vm)?.modules.remove(&req.base_addr);
        self.modules.release(id);
        info!("vm {} unregistered {} at {:#x}", vm, req.name, req.base_addr);
        Ok(())
    }

    /// Let go of every module `vm` registered, returns how many there were.
    ///
    /// The shared pages themselves stay, they belong to the VMs referencing
    /// them.
    pub(super) fn release_vm_modules(&mut self, vm: VmId) -> GmmResult<usize> {
        let account = self.vm_mut(vm)?;
        let modules = core::mem::take(&mut account.modules);
        let n = modules.len();
        for (_base, registered) in modules {
            self.modules.release(registered.module);
        }
        debug!("vm {} dropped {} shared modules", vm, n);
        Ok(n)
    }

    fn check_shared_modules(&mut self, vm: VmId) -> GmmResult<SharingReport> {
        let account = self.vm(vm)?;
        if !account.shared_paging_enabled {
            return Err(GmmError::FeatureDisabled);
        }

        let mut work: Vec<RegionPage> = Vec::new();
        for registered in account.modules.values() {
            let module = match self.modules.get(registered.module) {
                Some(module) => module,
                None => {
                    error!("vm {} references a missing module", vm);
                    continue;
                }
            };
            for (region, (desc, addr)) in module
                .regions
                .iter()
                .zip(registered.region_addrs.iter())
                .enumerate()
            {
                let first = (*addr >> GUEST_PAGE_SHIFT) as u32;
                work.try_reserve(desc.num_pages())
                    .map_err(|_e| GmmError::OutOfHostMemory)?;
                for idx in 0..desc.num_pages() {
                    work.push(RegionPage {
                        module: registered.module,
                        region,
                        idx,
                        pfn: first.saturating_add(idx as u32),
                    });
                }
            }
        }

        let mut report = SharingReport::default();
        for page in work {
            self.share_region_page(vm, page, &mut report)?;
        }
        debug!(
            "vm {} sharing pass: {} converted, {} merged, {} mismatched, {} skipped",
            vm, report.converted, report.merged, report.mismatched, report.skipped
        );
        Ok(report)
    }

    fn share_region_page(
        &mut self,
        vm: VmId,
        rp: RegionPage,
        report: &mut SharingReport,
    ) -> GmmResult<()> {
        let page = match self.vm(vm)?.guest_pages.get(&rp.pfn) {
            Some(page) => *page,
            None => {
                report.skipped += 1;
                return Ok(());
            }
        };
        let canonical = self
            .modules
            .get(rp.module)
            .and_then(|m| m.regions.get(rp.region))
            .map_or(NIL_GMM_PAGEID, |r| r.canonical(rp.idx));

        // Look for a shared page with the same content, canonical first.
        let (hash, checksum, found, canonical_differs) = {
            let (chunk, idx) = match self.chunks.lookup_by_page_id(page) {
                Some(found) => found,
                None => {
                    report.skipped += 1;
                    return Ok(());
                }
            };
            match chunk.slot(idx) {
                Some(Slot::Private {
                    vm: owner,
                    pfn,
                    account: Account::Base,
                    run: Run::Single,
                }) if *owner == vm && *pfn == rp.pfn && *pfn <= GMM_PAGE_PFN_LAST => {}
                _ => {
                    report.skipped += 1;
                    return Ok(());
                }
            }
            let data = self
                .host
                .page(chunk.frame(), idx)
                .ok_or(GmmError::Inconsistent {
                    what: "chunk without backing memory",
                })?;
            let hash = self.page_index.content_hash(data);
            let checksum = if self.config.strict { crc32(data) } else { 0 };

            let mut candidates: Vec<PageId> = Vec::new();
            if canonical != NIL_GMM_PAGEID && canonical != page {
                candidates.push(canonical);
            }
            for cand in self.page_index.find_candidates(hash) {
                if cand != page && !candidates.contains(&cand) {
                    candidates.push(cand);
                }
            }

            let mut found = None;
            let mut canonical_differs = false;
            for cand in candidates {
                if self.same_content(cand, data) {
                    found = Some(cand);
                    break;
                }
                if cand == canonical {
                    canonical_differs = true;
                }
            }
            (hash, checksum, found, canonical_differs)
        };
        if canonical_differs {
            report.mismatched += 1;
        }

        match found {
            Some(shared) => {
                let redirect = self.merge_page(vm, page, shared, rp.pfn)?;
                report.redirects.push(redirect);
                report.merged += 1;
            }
            None => {
                self.convert_page(vm, page, hash, checksum)?;
                report.converted += 1;
            }
        }

        if canonical == NIL_GMM_PAGEID {
            let new_canonical = found.unwrap_or(page);
            if let Some(region) = self
                .modules
                .get_mut(rp.module)
                .and_then(|m| m.regions.get_mut(rp.region))
            {
                region.set_canonical(rp.idx, new_canonical);
            }
        }
        Ok(())
    }

    /// Is `cand` a shared page whose content is `data`?
    ///
    /// In strict mode the shared page must also still match the checksum
    /// it was shared with.
    fn same_content(&self, cand: PageId, data: &[u8]) -> bool {
        let (chunk, idx) = match self.chunks.lookup_by_page_id(cand) {
            Some(found) => found,
            None => return false,
        };
        let checksum = match chunk.slot(idx) {
            Some(Slot::Shared { checksum, .. }) => *checksum,
            _ => return false,
        };
        let content = match self.host.page(chunk.frame(), idx) {
            Some(content) => content,
            None => return false,
        };
        if content != data {
            return false;
        }
        if self.config.strict && crc32(content) != checksum {
            error!(
                "shared page {:#x} no longer matches its checksum {:#x}",
                cand, checksum
            );
            return false;
        }
        true
    }

    /// Replace the private page `page` of `vm` by a reference to `shared`.
    fn merge_page(
        &mut self,
        vm: VmId,
        page: PageId,
        shared: PageId,
        pfn: u32,
    ) -> GmmResult<SharedPageRedirect> {
        self.vm_mut(vm)?.add_shared_ref(shared)?;
        let host_phys = match self.chunks.lookup_by_page_id_mut(shared) {
            Some((chunk, idx)) => {
                chunk.add_shared_ref(idx);
                chunk.host_phys(idx)
            }
            None => {
                return Err(GmmError::Inconsistent {
                    what: "merge candidate vanished",
                })
            }
        };
        let account = self.vm_mut(vm)?;
        account.allocated.base += 1;
        self.ledger.allocated_pages += 1;
        self.ledger.duplicate_pages += 1;

        let chunk = self.release_private_slot(vm, page)?;
        self.vm_mut(vm)?.guest_pages.insert(pfn, shared);
        self.destroy_chunk_if_unused(chunk);

        trace!("vm {} page {:#x} merged into {:#x}", vm, page, shared);
        Ok(SharedPageRedirect {
            gc_phys: (pfn as u64) << GUEST_PAGE_SHIFT,
            old_page: page,
            new_page: shared,
            host_phys,
        })
    }

    /// Turn the private page `page` of `vm` into a shared page with one
    /// reference.
    fn convert_page(&mut self, vm: VmId, page: PageId, hash: u64, checksum: u32) -> GmmResult<()> {
        let account = self.vms.get_mut(&vm).ok_or(GmmError::UnknownVm { vm })?;
        account.add_shared_ref(page)?;
        sub_or_clamp(&mut account.private_pages, 1, "vm private pages");
        match self.chunks.lookup_by_page_id_mut(page) {
            Some((chunk, idx)) => {
                chunk.make_shared(idx, checksum);
            }
            None => {
                return Err(GmmError::Inconsistent {
                    what: "converted page vanished",
                })
            }
        }
        self.ledger.shared_pages += 1;

        if let Err(e) = self.page_index.index_page(hash, page, vm) {
            warn!("shared page {:#x} not indexed: {}", page, e);
        }
        trace!("vm {} page {:#x} is now shared", vm, page);
        Ok(())
    }

    fn find_duplicate_page(&self, vm: VmId, page: PageId) -> GmmResult<bool> {
        self.vm(vm)?;
        let (chunk, idx) = self.lookup_page(page)?;
        match chunk.slot(idx) {
            Some(Slot::Private { vm: owner, .. }) if *owner == vm => {}
            Some(slot) if slot.is_owned_by(vm) || slot.is_free() => {
                return Err(GmmError::InvalidPageState { page })
            }
            _ => return Err(GmmError::NotOwner { page }),
        }
        let data = self
            .host
            .page(chunk.frame(), idx)
            .ok_or(GmmError::Inconsistent {
                what: "chunk without backing memory",
            })?;

        let duplicate = self.chunks.iter().any(|other| {
            other.slots().any(|(i, slot)| {
                matches!(slot, Slot::Private { .. } | Slot::Shared { .. })
                    && !(other.id() == chunk.id() && i == idx)
                    && self.host.page(other.frame(), i) == Some(data)
            })
        });
        Ok(duplicate)
    }
}
