// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tearing down a VM.

use alloc::vec::Vec;

use log::{debug, info};

use gmm_abi::{ChunkId, PageId, VmId};

use crate::error::{sub_or_clamp, GmmError, GmmResult};
use crate::memory::backends::PageAllocator;

use super::{Gmm, GmmState};

impl<A: PageAllocator> Gmm<A> {
    /// Give back everything `vm` holds and forget about it.
    pub fn cleanup_vm(&self, vm: VmId) -> GmmResult<()> {
        self.write(|st| st.cleanup_vm(vm))
    }
}

impl<A: PageAllocator> GmmState<A> {
    fn cleanup_vm(&mut self, vm: VmId) -> GmmResult<()> {
        self.vm(vm)?;
        let modules = self.release_vm_modules(vm)?;

        let owned: Vec<PageId> = self
            .chunks
            .iter()
            .flat_map(|chunk| {
                chunk
                    .slots()
                    .filter(move |(_idx, slot)| slot.is_owned_by(vm))
                    .map(move |(idx, _slot)| chunk.page_id(idx))
            })
            .collect();
        let mut touched: Vec<ChunkId> = Vec::with_capacity(owned.len());
        for page in owned.iter() {
            touched.push(self.release_private_slot(vm, *page)?);
        }

        let refs: Vec<(PageId, u32)> = self
            .vm(vm)?
            .shared_refs
            .iter()
            .map(|(page, n)| (*page, *n))
            .collect();
        let mut left_behind = 0u64;
        for (page, n) in refs.iter() {
            for _ref in 0..*n {
                let (alive, chunk) = self.release_shared_ref(vm, *page)?;
                if alive {
                    left_behind += 1;
                } else {
                    touched.push(chunk);
                }
            }
        }
        self.ledger.left_behind_shared_pages += left_behind;

        let unmapped = self.unmap_all(vm);

        let reserved = self.vm(vm)?.reserved.total().unwrap_or(u64::MAX);
        sub_or_clamp(&mut self.ledger.reserved_pages, reserved, "reserved pages");
        self.ledger.update_over_commit();

        self.destroy_unused_chunks(touched);

        // What is left of the VM's chunks are shared pages other VMs still
        // reference.
        let mut rehomed = 0;
        for chunk in self.chunks.iter_mut() {
            if chunk.owner() == Some(vm) {
                chunk.set_owner(None);
                rehomed += 1;
            }
        }
        let account = self.vms.remove(&vm).ok_or(GmmError::UnknownVm { vm })?;
        self.free_set.absorb(account.free_set);
        if rehomed > 0 {
            debug!("vm {} left {} chunks behind", vm, rehomed);
        }

        info!(
            "vm {} cleaned up: {} private pages, {} shared references ({} left behind), {} modules, {} mappings",
            vm,
            owned.len(),
            refs.iter().map(|(_page, n)| *n as u64).sum::<u64>(),
            left_behind,
            modules,
            unmapped
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountPages;
    use crate::config::GmmConfig;
    use gmm_abi::req::{RegisterSharedModuleReq, SharedRegionDesc};
    use gmm_abi::{
        page_id_to_chunk_id, Account, BalloonAction, GmmPageDesc, GuestOsFamily, OcPolicy,
        Priority, NIL_GMM_CHUNKID,
    };

    fn gmm(config: GmmConfig) -> Gmm {
        let _r = env_logger::try_init();
        let gmm = Gmm::new(config);
        for vm in 1..=2 {
            gmm.init_vm(vm).expect("init vm");
            gmm.initial_reservation(
                vm,
                AccountPages::new(600, 8, 8),
                OcPolicy::NoOverCommit,
                Priority::Normal,
            )
            .expect("reserve");
        }
        gmm
    }

    fn allocate(gmm: &Gmm, vm: VmId, n: usize, gcphys: u64) -> Vec<PageId> {
        let mut pages = alloc::vec![GmmPageDesc::nil(); n];
        for (i, desc) in pages.iter_mut().enumerate() {
            desc.set_phys(gcphys + (i as u64) * 0x1000);
        }
        gmm.allocate_pages(vm, Account::Base, &mut pages, true)
            .expect("allocate");
        let ids: Vec<PageId> = pages.iter().map(|d| d.id_page).collect();
        // Same address, same content.
        for (i, page) in ids.iter().enumerate() {
            gmm.with_page_mut(vm, *page, |data| data[0] = i as u8 + 1)
                .expect("write");
        }
        ids
    }

    fn share(gmm: &Gmm, vm: VmId, gcphys: u64, pages: usize) {
        let module = RegisterSharedModuleReq {
            guest_os: GuestOsFamily::Linux64,
            name: "vmlinux".into(),
            version: "5.10".into(),
            base_addr: 0xffff_8000_0000,
            module_size: (pages * 0x1000) as u32,
            regions: alloc::vec![SharedRegionDesc {
                gc_phys: gcphys,
                size: (pages * 0x1000) as u32,
            }],
        };
        gmm.register_shared_module(vm, &module).expect("register");
        gmm.check_shared_modules(vm).expect("check");
    }

    #[test]
    fn cleanup_releases_everything() {
        let gmm = gmm(Default::default());
        allocate(&gmm, 1, 20, 0x10_0000);
        gmm.ballooned_pages(1, BalloonAction::Inflate, 5)
            .expect("inflate");
        let page = allocate(&gmm, 1, 1, 0x80_0000)[0];
        gmm.map_unmap_chunk(1, page_id_to_chunk_id(page), NIL_GMM_CHUNKID)
            .expect("map");

        gmm.cleanup_vm(1).expect("cleanup");
        let (stats, _vm) = gmm.query_statistics(None).expect("stats");
        assert_eq!(stats.allocated_pages, 0);
        assert_eq!(stats.ballooned_pages, 0);
        assert_eq!(stats.reserved_pages, 616);
        assert_eq!(stats.registered_vms, 1);
        assert_eq!(stats.chunks, 0);
        assert_eq!(gmm.with_host(|h| h.mappings()), 0);
        assert_eq!(
            gmm.query_statistics(Some(1)),
            Err(GmmError::UnknownVm { vm: 1 })
        );

        // The id can be registered again.
        gmm.init_vm(1).expect("init vm");
    }

    #[test]
    fn cleanup_leaves_shared_pages_behind() {
        let gmm = gmm(Default::default());
        allocate(&gmm, 1, 30, 0x10_0000);
        allocate(&gmm, 1, 5, 0x20_0000);
        let theirs = allocate(&gmm, 2, 5, 0x20_0000);
        share(&gmm, 1, 0x20_0000, 5);
        share(&gmm, 2, 0x20_0000, 5);
        let (before, _vm) = gmm.query_statistics(None).expect("stats");
        assert_eq!(before.shared_pages, 5);
        assert_eq!(before.duplicate_pages, 5);

        gmm.cleanup_vm(1).expect("cleanup");
        let (after, vm) = gmm.query_statistics(Some(2)).expect("stats");
        assert_eq!(after.allocated_pages, before.allocated_pages - 35);
        assert_eq!(after.left_behind_shared_pages, 5);
        assert_eq!(after.shared_pages, 5);
        assert_eq!(after.duplicate_pages, 0);
        assert_eq!(vm.expect("vm").shared_pages, 5);
        assert_eq!(gmm.sanity_check(), 0);

        // VM 2 merged into VM 1's copies, its own pages are gone.
        for page in theirs {
            assert_eq!(
                gmm.with_page(page, |_data| ()),
                Err(GmmError::InvalidPageState { page })
            );
        }

        gmm.cleanup_vm(2).expect("cleanup");
        let (stats, _vm) = gmm.query_statistics(None).expect("stats");
        assert_eq!(stats.shared_pages, 0);
        assert_eq!(stats.allocated_pages, 0);
        assert_eq!(stats.chunks, 0);
        assert_eq!(stats.shareable_modules, 0);
    }

    #[test]
    fn bound_chunks_are_rehomed() {
        let gmm = gmm(GmmConfig {
            bound: true,
            ..Default::default()
        });
        allocate(&gmm, 1, 3, 0x20_0000);
        allocate(&gmm, 2, 3, 0x20_0000);
        share(&gmm, 1, 0x20_0000, 3);
        share(&gmm, 2, 0x20_0000, 3);
        let (stats, _vm) = gmm.query_statistics(None).expect("stats");
        assert_eq!(stats.chunks, 1);

        gmm.cleanup_vm(1).expect("cleanup");
        assert_eq!(gmm.sanity_check(), 0);
        let (stats, _vm) = gmm.query_statistics(None).expect("stats");
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.shared_pages, 3);

        gmm.cleanup_vm(2).expect("cleanup");
        let (stats, _vm) = gmm.query_statistics(None).expect("stats");
        assert_eq!(stats.chunks, 0);
    }

    #[test]
    fn cleanup_unknown_vm() {
        let gmm = gmm(Default::default());
        assert_eq!(gmm.cleanup_vm(7), Err(GmmError::UnknownVm { vm: 7 }));
    }
}
