// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Chunk mappings and page id to address translation.

use log::{debug, warn};

use gmm_abi::{page_id_to_chunk_id, page_id_to_slot, ChunkId, PageId, VmId, NIL_GMM_CHUNKID};

use crate::chunk::Slot;
use crate::error::{GmmError, GmmResult};
use crate::memory::backends::PageAllocator;
use crate::memory::{VAddr, BASE_PAGE_SIZE};

use super::{Gmm, GmmState};

impl<A: PageAllocator> Gmm<A> {
    /// Map chunk `map` into `vm` and/or unmap chunk `unmap` from it.
    ///
    /// Either id may be NIL, not both. Returns the address of `map`.
    pub fn map_unmap_chunk(
        &self,
        vm: VmId,
        map: ChunkId,
        unmap: ChunkId,
    ) -> GmmResult<Option<VAddr>> {
        self.write(|st| st.map_unmap_chunk(vm, map, unmap))
    }

    /// Address of `page` inside the chunk mapping of `vm`.
    pub fn page_id_to_virt(&self, vm: VmId, page: PageId) -> GmmResult<VAddr> {
        self.write(|st| st.page_id_to_virt(vm, page))
    }
}

impl<A: PageAllocator> GmmState<A> {
    fn map_unmap_chunk(
        &mut self,
        vm: VmId,
        map: ChunkId,
        unmap: ChunkId,
    ) -> GmmResult<Option<VAddr>> {
        if map == unmap {
            // Both NIL, or mapping and unmapping the same chunk.
            return Err(GmmError::InvalidParameter);
        }
        self.vm(vm)?;
        if map != NIL_GMM_CHUNKID && self.chunks.lookup(map).is_none() {
            return Err(GmmError::UnknownChunk { chunk: map });
        }
        if unmap != NIL_GMM_CHUNKID {
            let chunk = self
                .chunks
                .lookup(unmap)
                .ok_or(GmmError::UnknownChunk { chunk: unmap })?;
            if chunk.mapping(vm).is_none() {
                return Err(GmmError::NotMapped { chunk: unmap });
            }
        }

        let mut mapped = None;
        if map != NIL_GMM_CHUNKID {
            mapped = Some(self.map_chunk(vm, map)?);
        }
        if unmap != NIL_GMM_CHUNKID {
            if let Err(e) = self.unmap_chunk(vm, unmap) {
                if let Some((addr, true)) = mapped {
                    // Undo the half that worked.
                    self.drop_mapping(vm, map, addr);
                }
                return Err(e);
            }
        }
        Ok(mapped.map(|(addr, _new)| addr))
    }

    /// Returns the mapping address and whether the mapping is new.
    fn map_chunk(&mut self, vm: VmId, id: ChunkId) -> GmmResult<(VAddr, bool)> {
        let generation = self.chunks.free_generation();
        let chunk = self
            .chunks
            .lookup_mut(id)
            .ok_or(GmmError::UnknownChunk { chunk: id })?;
        if let Some(addr) = chunk.mapping(vm) {
            return Ok((addr, false));
        }

        let addr = self
            .host
            .map_for_access(chunk.frame())
            .map_err(|source| GmmError::HostMemory { source })?;
        chunk.add_mapping(vm, addr);
        let account = self.vm_mut(vm)?;
        account.tlb.fill(id, generation, addr);
        debug!("vm {} mapped chunk {:#x} at {:#x}", vm, id, addr);
        Ok((addr, true))
    }

    fn unmap_chunk(&mut self, vm: VmId, id: ChunkId) -> GmmResult<()> {
        let chunk = self
            .chunks
            .lookup_mut(id)
            .ok_or(GmmError::UnknownChunk { chunk: id })?;
        let addr = chunk.remove_mapping(vm).ok_or(GmmError::NotMapped { chunk: id })?;
        if let Err(source) = self.host.unmap(addr) {
            chunk.add_mapping(vm, addr);
            warn!("can't unmap chunk {:#x} from vm {}: {}", id, vm, source);
            return Err(GmmError::HostMemory { source });
        }

        self.vm_mut(vm)?.tlb.invalidate(id);
        debug!("vm {} unmapped chunk {:#x}", vm, id);
        self.destroy_chunk_if_unused(id);
        Ok(())
    }

    /// Forget a mapping without destroying the chunk.
    fn drop_mapping(&mut self, vm: VmId, id: ChunkId, addr: VAddr) {
        if let Some(chunk) = self.chunks.lookup_mut(id) {
            chunk.remove_mapping(vm);
        }
        if let Err(e) = self.host.unmap(addr) {
            warn!("can't undo mapping of chunk {:#x}: {}", id, e);
        }
        if let Some(account) = self.vms.get_mut(&vm) {
            account.tlb.invalidate(id);
        }
    }

    /// Unmap every chunk `vm` still has mapped.
    pub(super) fn unmap_all(&mut self, vm: VmId) -> usize {
        let ids: alloc::vec::Vec<ChunkId> = self
            .chunks
            .iter()
            .filter(|c| c.mapping(vm).is_some())
            .map(|c| c.id())
            .collect();
        let mut unmapped = 0;
        for id in ids {
            match self.unmap_chunk(vm, id) {
                Ok(()) => unmapped += 1,
                Err(e) => {
                    // Keep the books straight even if the host refuses.
                    warn!("dropping mapping of chunk {:#x} anyway: {}", id, e);
                    if let Some(chunk) = self.chunks.lookup_mut(id) {
                        chunk.remove_mapping(vm);
                    }
                    self.destroy_chunk_if_unused(id);
                }
            }
        }
        unmapped
    }

    fn page_id_to_virt(&mut self, vm: VmId, page: PageId) -> GmmResult<VAddr> {
        self.vm(vm)?;
        let (chunk, idx) = self.lookup_page(page)?;
        match chunk.slot(idx) {
            Some(Slot::Private { vm: owner, .. }) if *owner == vm => {}
            Some(Slot::Shared { .. }) => {}
            _ => return Err(GmmError::NotOwner { page }),
        }
        let id = page_id_to_chunk_id(page);
        debug_assert_eq!(id, chunk.id());
        let mapping = chunk.mapping(vm);

        let generation = self.chunks.free_generation();
        let account = self.vm_mut(vm)?;
        let base = match account.tlb.lookup(id, generation) {
            Some(addr) => addr,
            None => {
                let addr = mapping.ok_or(GmmError::NotMapped { chunk: id })?;
                account.tlb.fill(id, generation, addr);
                addr
            }
        };
        Ok(base + (page_id_to_slot(page) * BASE_PAGE_SIZE) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountPages;
    use crate::memory::host::HostMemory;
    use gmm_abi::{Account, GmmFreePageDesc, GmmPageDesc, OcPolicy, Priority};

    fn gmm_with_page() -> (Gmm, PageId) {
        let _r = env_logger::try_init();
        let gmm = Gmm::new(Default::default());
        for vm in 1..=2 {
            gmm.init_vm(vm).expect("init vm");
            gmm.initial_reservation(
                vm,
                AccountPages::new(16, 1, 1),
                OcPolicy::NoOverCommit,
                Priority::Normal,
            )
            .expect("reserve");
        }
        let mut pages = alloc::vec![GmmPageDesc::nil(); 2];
        gmm.allocate_pages(1, Account::Base, &mut pages, false)
            .expect("allocate");
        (gmm, pages[1].id_page)
    }

    #[test]
    fn map_and_translate() {
        let (gmm, page) = gmm_with_page();
        let chunk = page_id_to_chunk_id(page);
        assert_eq!(
            gmm.page_id_to_virt(1, page),
            Err(GmmError::NotMapped { chunk })
        );

        let addr = gmm
            .map_unmap_chunk(1, chunk, NIL_GMM_CHUNKID)
            .expect("map")
            .expect("address");
        assert_eq!(
            gmm.page_id_to_virt(1, page),
            Ok(addr + (page_id_to_slot(page) * BASE_PAGE_SIZE) as u64)
        );
        // Mapping twice hands back the same address.
        assert_eq!(
            gmm.map_unmap_chunk(1, chunk, NIL_GMM_CHUNKID),
            Ok(Some(addr))
        );
        assert_eq!(gmm.with_host(|h| h.mappings()), 1);

        // Another VM can map the chunk but not look at our page.
        gmm.map_unmap_chunk(2, chunk, NIL_GMM_CHUNKID)
            .expect("map");
        assert_eq!(
            gmm.page_id_to_virt(2, page),
            Err(GmmError::NotOwner { page })
        );

        gmm.map_unmap_chunk(1, NIL_GMM_CHUNKID, chunk)
            .expect("unmap");
        assert_eq!(
            gmm.page_id_to_virt(1, page),
            Err(GmmError::NotMapped { chunk })
        );
        assert_eq!(gmm.with_host(|h| h.mappings()), 1);
    }

    #[test]
    fn map_unmap_errors() {
        let (gmm, page) = gmm_with_page();
        let chunk = page_id_to_chunk_id(page);
        assert_eq!(
            gmm.map_unmap_chunk(1, NIL_GMM_CHUNKID, NIL_GMM_CHUNKID),
            Err(GmmError::InvalidParameter)
        );
        assert_eq!(
            gmm.map_unmap_chunk(1, chunk, chunk),
            Err(GmmError::InvalidParameter)
        );
        assert_eq!(
            gmm.map_unmap_chunk(1, chunk + 1, NIL_GMM_CHUNKID),
            Err(GmmError::UnknownChunk { chunk: chunk + 1 })
        );
        assert_eq!(
            gmm.map_unmap_chunk(1, NIL_GMM_CHUNKID, chunk),
            Err(GmmError::NotMapped { chunk })
        );
        assert_eq!(
            gmm.map_unmap_chunk(3, chunk, NIL_GMM_CHUNKID),
            Err(GmmError::UnknownVm { vm: 3 })
        );
    }

    #[test]
    fn mapping_keeps_empty_chunk_alive() {
        let (gmm, page) = gmm_with_page();
        let chunk = page_id_to_chunk_id(page);
        gmm.map_unmap_chunk(1, chunk, NIL_GMM_CHUNKID)
            .expect("map");

        let pages: alloc::vec::Vec<GmmFreePageDesc> = (page - 1..=page)
            .map(GmmFreePageDesc::from)
            .collect();
        gmm.free_pages(1, Account::Base, &pages).expect("free");
        let (stats, _vm) = gmm.query_statistics(None).expect("stats");
        assert_eq!(stats.chunks, 1);

        gmm.map_unmap_chunk(1, NIL_GMM_CHUNKID, chunk)
            .expect("unmap");
        let (stats, _vm) = gmm.query_statistics(None).expect("stats");
        assert_eq!(stats.chunks, 0);
        assert_eq!(stats.free_generation, 1);
        assert_eq!(gmm.with_host(|h: &HostMemory| h.chunks_in_use()), 0);
    }

    #[test]
    fn recycled_chunk_gets_new_mapping() {
        let (gmm, page) = gmm_with_page();
        let chunk = page_id_to_chunk_id(page);
        let addr = gmm
            .map_unmap_chunk(1, chunk, NIL_GMM_CHUNKID)
            .expect("map")
            .expect("address");
        gmm.map_unmap_chunk(1, NIL_GMM_CHUNKID, chunk)
            .expect("unmap");

        // Drop everything so the chunk id gets recycled.
        let pages: alloc::vec::Vec<GmmFreePageDesc> = (page - 1..=page)
            .map(GmmFreePageDesc::from)
            .collect();
        gmm.free_pages(1, Account::Base, &pages).expect("free");
        let mut fresh = alloc::vec![GmmPageDesc::nil(); 1];
        gmm.allocate_pages(1, Account::Base, &mut fresh, false)
            .expect("allocate");
        assert_eq!(page_id_to_chunk_id(fresh[0].id_page), chunk);

        let again = gmm
            .map_unmap_chunk(1, chunk, NIL_GMM_CHUNKID)
            .expect("map")
            .expect("address");
        assert_ne!(again, addr);
        assert_eq!(gmm.page_id_to_virt(1, fresh[0].id_page), Ok(again));
    }
}
