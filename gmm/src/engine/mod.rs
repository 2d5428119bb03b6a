// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The allocator proper.
//!
//! [`Gmm`] owns the chunk registry, the free chunk index, the VM accounts,
//! the shared page structures and the global ledger. One reader-writer lock
//! serializes every operation, so the effect of a call is atomic with
//! respect to all other calls. Each operation lives in its own submodule as
//! a method on [`GmmState`] plus the locked wrapper on [`Gmm`].

use alloc::vec::Vec;

use hashbrown::HashMap;
use log::{debug, error, info, trace, warn};
use spin::RwLock;

use gmm_abi::{
    Account, ChunkId, PageId, VmId, GMM_CHUNK_NUM_PAGES, GMM_PAGE_PFN_LAST, NIL_GMM_PAGEID,
};

use crate::account::VmAccount;
use crate::chunk::{Chunk, Slot};
use crate::config::GmmConfig;
use crate::error::{sub_or_clamp, GmmError, GmmResult};
use crate::free_set::FreeChunkIndex;
use crate::ledger::GlobalLedger;
use crate::memory::backends::PageAllocator;
use crate::memory::host::HostMemory;
use crate::memory::PAddr;
use crate::registry::ChunkRegistry;
use crate::shared::{crc32, ModuleRegistry, SharedPageIndex};

mod allocate;
mod balloon;
mod cleanup;
mod dispatch;
mod free;
mod mapping;
mod reservation;
mod sharing;
mod stats;

#[cfg(test)]
mod test;

pub use sharing::{ModuleRegistration, SharingReport};

/// Everything the lock protects.
pub struct GmmState<A: PageAllocator> {
    config: GmmConfig,
    host: A,
    chunks: ChunkRegistry,
    /// Chunks with free slots that are not bound to a VM.
    free_set: FreeChunkIndex,
    ledger: GlobalLedger,
    vms: HashMap<VmId, VmAccount>,
    modules: ModuleRegistry,
    page_index: SharedPageIndex,
}

/// The global memory manager.
pub struct Gmm<A: PageAllocator = HostMemory> {
    state: RwLock<GmmState<A>>,
}

/// The free chunk index responsible for chunks owned by `owner`.
///
/// Chunks bound to a live VM are tracked by that VM's index, all others by
/// the global one.
fn free_set_of<'a>(
    global: &'a mut FreeChunkIndex,
    vms: &'a mut HashMap<VmId, VmAccount>,
    owner: Option<VmId>,
) -> &'a mut FreeChunkIndex {
    match owner.and_then(move |vm| vms.get_mut(&vm)) {
        Some(account) => &mut account.free_set,
        None => global,
    }
}

fn free_set_ref<'a>(
    global: &'a FreeChunkIndex,
    vms: &'a HashMap<VmId, VmAccount>,
    owner: Option<VmId>,
) -> &'a FreeChunkIndex {
    match owner.and_then(|vm| vms.get(&vm)) {
        Some(account) => &account.free_set,
        None => global,
    }
}

impl Gmm<HostMemory> {
    /// A manager backed by heap allocated host memory.
    pub fn new(config: GmmConfig) -> Gmm<HostMemory> {
        Gmm::with_allocator(config, HostMemory::new())
    }
}

impl<A: PageAllocator> Gmm<A> {
    pub fn with_allocator(config: GmmConfig, host: A) -> Gmm<A> {
        Gmm::with_registry(config, host, ChunkRegistry::new())
    }

    pub(crate) fn with_registry(config: GmmConfig, host: A, chunks: ChunkRegistry) -> Gmm<A> {
        info!(
            "GMM up: max_pages={} bound={} strict={} sanity={}",
            config.max_pages, config.bound, config.strict, config.sanity
        );
        Gmm {
            state: RwLock::new(GmmState {
                ledger: GlobalLedger::new(config.max_pages),
                config,
                host,
                chunks,
                free_set: FreeChunkIndex::new(),
                vms: HashMap::new(),
                modules: ModuleRegistry::new(),
                page_index: SharedPageIndex::new(),
            }),
        }
    }

    /// Run `f` with exclusive access to the state.
    ///
    /// With `sanity` configured the books are audited before and after.
    fn write<R>(&self, f: impl FnOnce(&mut GmmState<A>) -> GmmResult<R>) -> GmmResult<R> {
        let mut state = self.state.write();
        if state.config.sanity {
            state.check_consistency("entry");
        }
        let r = f(&mut *state);
        if state.config.sanity {
            state.check_consistency("exit");
        }
        r
    }

    fn read<R>(&self, f: impl FnOnce(&GmmState<A>) -> R) -> R {
        f(&*self.state.read())
    }

    pub fn config(&self) -> GmmConfig {
        self.read(|st| st.config.clone())
    }

    /// Audit every counter, returns the number of mismatches.
    pub fn sanity_check(&self) -> usize {
        self.read(|st| st.audit())
    }

    /// Register a VM. Must happen before any other call naming it.
    pub fn init_vm(&self, vm: VmId) -> GmmResult<()> {
        self.write(|st| st.init_vm(vm))
    }

    /// Access the page allocator (e.g. for its statistics).
    pub fn with_host<R>(&self, f: impl FnOnce(&A) -> R) -> R {
        self.read(|st| f(&st.host))
    }

    /// Read the content of any allocated page.
    pub fn with_page<R>(&self, page: PageId, f: impl FnOnce(&[u8]) -> R) -> GmmResult<R> {
        self.read(|st| {
            let (chunk, idx) = st.lookup_page(page)?;
            if chunk.slot(idx).map_or(true, Slot::is_free) {
                return Err(GmmError::InvalidPageState { page });
            }
            let data = st
                .host
                .page(chunk.frame(), idx)
                .ok_or(GmmError::Inconsistent {
                    what: "chunk without backing memory",
                })?;
            Ok(f(data))
        })
    }

    /// Modify the content of a private page of `vm`, the way the guest
    /// writes to its memory.
    pub fn with_page_mut<R>(
        &self,
        vm: VmId,
        page: PageId,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> GmmResult<R> {
        self.write(|st| {
            st.vm(vm)?;
            let (chunk, idx) = st.lookup_page(page)?;
            match chunk.slot(idx) {
                Some(Slot::Private { vm: owner, .. }) if *owner == vm => {}
                Some(slot) if slot.is_owned_by(vm) => {
                    return Err(GmmError::InvalidPageState { page })
                }
                Some(Slot::Free { .. }) => return Err(GmmError::InvalidPageState { page }),
                _ => return Err(GmmError::NotOwner { page }),
            }
            let frame = chunk.frame();
            let data = st.host.page_mut(frame, idx).ok_or(GmmError::Inconsistent {
                what: "chunk without backing memory",
            })?;
            Ok(f(data))
        })
    }
}

impl<A: PageAllocator> GmmState<A> {
    fn init_vm(&mut self, vm: VmId) -> GmmResult<()> {
        if self.vms.contains_key(&vm) {
            return Err(GmmError::VmAlreadyRegistered { vm });
        }
        self.vms.try_reserve(1)?;
        self.vms.insert(
            vm,
            VmAccount::new(vm, self.config.sharing, self.config.ballooning),
        );
        info!("vm {} registered", vm);
        Ok(())
    }

    fn vm(&self, vm: VmId) -> GmmResult<&VmAccount> {
        self.vms.get(&vm).ok_or(GmmError::UnknownVm { vm })
    }

    fn vm_mut(&mut self, vm: VmId) -> GmmResult<&mut VmAccount> {
        self.vms.get_mut(&vm).ok_or(GmmError::UnknownVm { vm })
    }

    /// Resolve a page id, `UnknownPage` for NIL, reserved or unbacked ids.
    fn lookup_page(&self, page: PageId) -> GmmResult<(&Chunk, usize)> {
        if page == NIL_GMM_PAGEID {
            return Err(GmmError::UnknownPage { page });
        }
        self.chunks
            .lookup_by_page_id(page)
            .ok_or(GmmError::UnknownPage { page })
    }

    fn audit(&self) -> usize {
        self.ledger.audit(&self.chunks, &self.vms, &self.free_set)
    }

    fn check_consistency(&self, when: &str) {
        let errors = self.audit();
        if errors > 0 {
            error!("{} inconsistencies found on {}", errors, when);
            debug_assert_eq!(errors, 0, "ledger audit failed on {}", when);
        }
    }

    /// Which free chunk index new pages of `vm` come from.
    fn owner_for(&self, vm: VmId) -> Option<VmId> {
        if self.config.bound {
            Some(vm)
        } else {
            None
        }
    }

    /// Get a fresh chunk from the host and make it available for
    /// allocations of `owner`.
    fn create_chunk(&mut self, owner: Option<VmId>) -> GmmResult<ChunkId> {
        if self.ledger.physical_pages() >= self.ledger.max_pages {
            debug!(
                "refusing new chunk, {} pages in use of {}",
                self.ledger.physical_pages(),
                self.ledger.max_pages
            );
            return Err(GmmError::OutOfHostMemory);
        }

        let id = self.chunks.allocate_id()?;
        let frame = match self.host.allocate_chunk() {
            Ok(frame) => frame,
            Err(e) => {
                self.chunks.release_id(id);
                warn!("host page allocator failed: {}", e);
                return Err(GmmError::OutOfHostMemory);
            }
        };

        self.chunks.insert(Chunk::new(id, frame, owner));
        free_set_of(&mut self.free_set, &mut self.vms, owner)
            .insert(id, GMM_CHUNK_NUM_PAGES as u16);
        info!("chunk {:#x} created {:?} owner={:?}", id, frame, owner);
        Ok(id)
    }

    /// Destroy chunk `id` if it has no live slots and no mappings left.
    fn destroy_chunk_if_unused(&mut self, id: ChunkId) {
        let owner = match self.chunks.lookup(id) {
            Some(chunk) if chunk.is_unused() => chunk.owner(),
            _ => return,
        };

        free_set_of(&mut self.free_set, &mut self.vms, owner).remove(id);
        match self.chunks.remove(id) {
            Ok(chunk) => {
                if let Err(e) = self.host.release_chunk(chunk.frame()) {
                    error!("can't give chunk {:#x} back to the host: {}", id, e);
                }
            }
            Err(e) => error!("can't destroy chunk {:#x}: {}", id, e),
        }
    }

    fn destroy_unused_chunks(&mut self, mut ids: Vec<ChunkId>) {
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            self.destroy_chunk_if_unused(id);
        }
    }

    /// Hand out one private page of `vm` without charging it.
    ///
    /// Returns the page id, its host address and whether the page is known
    /// to be zero.
    fn allocate_one(
        &mut self,
        vm: VmId,
        account: Account,
        pfn: u32,
        zero: bool,
    ) -> GmmResult<(PageId, PAddr, bool)> {
        let owner = self.owner_for(vm);
        let id = match free_set_ref(&self.free_set, &self.vms, owner).find_chunk_with_free_slot(1) {
            Some(id) => id,
            None => self.create_chunk(owner)?,
        };

        let chunk = self.chunks.lookup_mut(id).ok_or(GmmError::Inconsistent {
            what: "free chunk index points at a missing chunk",
        })?;
        let (idx, mut zeroed) = chunk.allocate(vm, account, pfn).ok_or(GmmError::Inconsistent {
            what: "free chunk index points at a full chunk",
        })?;

        if zero && !zeroed {
            match self.host.page_mut(chunk.frame(), idx) {
                Some(data) => {
                    data.fill(0);
                    zeroed = true;
                }
                None => {
                    chunk.release(idx);
                    return Err(GmmError::Inconsistent {
                        what: "chunk without backing memory",
                    });
                }
            }
        }

        let page = chunk.page_id(idx);
        let phys = chunk.host_phys(idx);
        free_set_of(&mut self.free_set, &mut self.vms, owner).on_slot_allocated(id);
        trace!("vm {} got page {:#x} at {:#x}", vm, page, phys);
        Ok((page, phys, zeroed))
    }

    /// Undo `allocate_one` for pages nobody has seen yet.
    fn rollback_pages(&mut self, pages: &[(PageId, PAddr, bool)]) {
        let mut touched = Vec::with_capacity(pages.len());
        for (page, _phys, zeroed) in pages.iter().rev() {
            if let Some((chunk, idx)) = self.chunks.lookup_by_page_id_mut(*page) {
                chunk.release(idx);
                if *zeroed {
                    chunk.mark_zeroed(idx);
                }
                let (id, owner) = (chunk.id(), chunk.owner());
                free_set_of(&mut self.free_set, &mut self.vms, owner).on_slot_freed(id);
                touched.push(id);
            }
        }
        debug!("rolled back {} pages", pages.len());
        self.destroy_unused_chunks(touched);
    }

    /// Free a private or ballooned slot of `vm` and uncharge it.
    ///
    /// Returns the chunk the page lived in, which may now be unused.
    fn release_private_slot(&mut self, vm: VmId, page: PageId) -> GmmResult<ChunkId> {
        let account = self.vms.get_mut(&vm).ok_or(GmmError::UnknownVm { vm })?;
        let (chunk, idx) = self
            .chunks
            .lookup_by_page_id_mut(page)
            .ok_or(GmmError::UnknownPage { page })?;
        if !chunk.slot(idx).map_or(false, |s| s.is_owned_by(vm)) {
            return Err(GmmError::NotOwner { page });
        }

        let (id, owner) = (chunk.id(), chunk.owner());
        match chunk.release(idx) {
            Slot::Private {
                account: acct, pfn, ..
            } => {
                match account.allocated.get_mut(acct) {
                    Ok(counter) => sub_or_clamp(counter, 1, "vm allocated pages"),
                    Err(_e) => error!("private page {:#x} has no account", page),
                }
                if pfn <= GMM_PAGE_PFN_LAST && account.guest_pages.get(&pfn) == Some(&page) {
                    account.guest_pages.remove(&pfn);
                }
            }
            Slot::Ballooned { .. } => {
                sub_or_clamp(&mut account.allocated.base, 1, "vm allocated pages");
                sub_or_clamp(&mut account.ballooned_pages, 1, "vm ballooned pages");
                sub_or_clamp(&mut self.ledger.ballooned_pages, 1, "ballooned pages");
            }
            _ => {}
        }
        sub_or_clamp(&mut account.private_pages, 1, "vm private pages");
        sub_or_clamp(&mut self.ledger.allocated_pages, 1, "allocated pages");

        free_set_of(&mut self.free_set, &mut self.vms, owner).on_slot_freed(id);
        Ok(id)
    }

    /// Drop one reference `vm` holds on the shared page `page`.
    ///
    /// Returns whether the page is still alive and the chunk it lives in.
    fn release_shared_ref(&mut self, vm: VmId, page: PageId) -> GmmResult<(bool, ChunkId)> {
        let account = self.vms.get_mut(&vm).ok_or(GmmError::UnknownVm { vm })?;
        if !account.drop_shared_ref(page) {
            return Err(GmmError::NotOwner { page });
        }
        sub_or_clamp(&mut account.allocated.base, 1, "vm allocated pages");
        sub_or_clamp(&mut self.ledger.allocated_pages, 1, "allocated pages");

        let (chunk, idx) = self
            .chunks
            .lookup_by_page_id_mut(page)
            .ok_or(GmmError::Inconsistent {
                what: "shared reference to a missing page",
            })?;
        let remaining = chunk.drop_shared_ref(idx).ok_or(GmmError::Inconsistent {
            what: "shared reference to a page that is not shared",
        })?;
        let (id, owner) = (chunk.id(), chunk.owner());
        if remaining > 0 {
            sub_or_clamp(&mut self.ledger.duplicate_pages, 1, "duplicate pages");
            return Ok((true, id));
        }

        if self.config.strict {
            if let (Some(Slot::Shared { checksum, .. }), Some(data)) =
                (chunk.slot(idx), self.host.page(chunk.frame(), idx))
            {
                let actual = crc32(data);
                if actual != *checksum {
                    error!(
                        "shared page {:#x} was modified: crc {:#x}, expected {:#x}",
                        page, actual, checksum
                    );
                }
            }
        }

        chunk.release(idx);
        sub_or_clamp(&mut self.ledger.shared_pages, 1, "shared pages");
        self.page_index.remove_page(page);
        free_set_of(&mut self.free_set, &mut self.vms, owner).on_slot_freed(id);
        debug!("last reference to shared page {:#x} gone", page);
        Ok((false, id))
    }
}
