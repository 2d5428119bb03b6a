// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Giving pages back.

use alloc::vec::Vec;

use hashbrown::HashMap;
use log::debug;

use gmm_abi::{Account, GmmFreePageDesc, PageId, VmId, GMM_PAGEID_LAST, NIL_GMM_PAGEID};

use crate::chunk::{Run, Slot};
use crate::error::{GmmError, GmmResult};
use crate::memory::backends::PageAllocator;

use super::{Gmm, GmmState};

/// What releasing one page of a free request involves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Private(PageId),
    Shared(PageId),
}

impl<A: PageAllocator> Gmm<A> {
    /// Free private pages of `vm` charged to `account`, or drop references
    /// to shared pages (base account only).
    ///
    /// The whole request is validated first, a bad entry fails the call
    /// without freeing anything.
    pub fn free_pages(
        &self,
        vm: VmId,
        account: Account,
        pages: &[GmmFreePageDesc],
    ) -> GmmResult<()> {
        self.write(|st| st.free_pages(vm, account, pages))
    }

    /// Free the large page starting at `page`.
    pub fn free_large_page(&self, vm: VmId, page: PageId) -> GmmResult<()> {
        self.write(|st| st.free_large_page(vm, page))
    }
}

impl<A: PageAllocator> GmmState<A> {
    /// Check that `vm` may free `page` from `account`.
    fn check_free(&self, vm: VmId, account: Account, page: PageId) -> GmmResult<Release> {
        if page == NIL_GMM_PAGEID || page > GMM_PAGEID_LAST {
            return Err(GmmError::UnknownPage { page });
        }
        // A well formed id without a chunk was freed along with its chunk.
        let (chunk, idx) = self
            .chunks
            .lookup_by_page_id(page)
            .ok_or(GmmError::DoubleFree { page })?;

        match chunk.slot(idx) {
            Some(Slot::Free { .. }) | None => Err(GmmError::DoubleFree { page }),
            Some(Slot::Private { vm: owner, .. }) | Some(Slot::Ballooned { vm: owner, .. })
                if *owner != vm =>
            {
                Err(GmmError::NotOwner { page })
            }
            Some(Slot::Private {
                account: charged,
                run: Run::Single,
                ..
            }) => {
                if *charged == account {
                    Ok(Release::Private(page))
                } else {
                    Err(GmmError::InvalidAccount)
                }
            }
            Some(Slot::Private { .. }) | Some(Slot::Ballooned { .. }) => {
                Err(GmmError::InvalidPageState { page })
            }
            Some(Slot::Shared { .. }) => {
                if account == Account::Base {
                    Ok(Release::Shared(page))
                } else {
                    Err(GmmError::InvalidAccount)
                }
            }
        }
    }

    fn free_pages(
        &mut self,
        vm: VmId,
        account: Account,
        pages: &[GmmFreePageDesc],
    ) -> GmmResult<()> {
        let vm_account = self.vm(vm)?;
        if !account.is_valid() {
            return Err(GmmError::InvalidAccount);
        }
        if pages.is_empty() {
            return Err(GmmError::InvalidParameter);
        }

        let mut plan = Vec::new();
        plan.try_reserve_exact(pages.len())
            .map_err(|_e| GmmError::OutOfHostMemory)?;
        let mut seen: HashMap<PageId, u32> = HashMap::new();
        seen.try_reserve(pages.len())?;

        for desc in pages.iter() {
            let page = desc.id_page;
            let release = self.check_free(vm, account, page)?;
            let count = seen.entry(page).or_default();
            *count += 1;
            match release {
                Release::Private(_) if *count > 1 => return Err(GmmError::DoubleFree { page }),
                Release::Shared(_) if vm_account.shared_refs_on(page) < *count => {
                    return Err(GmmError::NotOwner { page })
                }
                _ => plan.push(release),
            }
        }

        let mut touched = Vec::with_capacity(plan.len());
        for release in plan {
            match release {
                Release::Private(page) => touched.push(self.release_private_slot(vm, page)?),
                Release::Shared(page) => {
                    let (_alive, chunk) = self.release_shared_ref(vm, page)?;
                    touched.push(chunk);
                }
            }
        }
        debug!("vm {} freed {} pages", vm, pages.len());
        self.destroy_unused_chunks(touched);
        Ok(())
    }

    fn free_large_page(&mut self, vm: VmId, page: PageId) -> GmmResult<()> {
        self.vm(vm)?;
        if page == NIL_GMM_PAGEID || page > GMM_PAGEID_LAST {
            return Err(GmmError::UnknownPage { page });
        }
        let (chunk, idx) = self
            .chunks
            .lookup_by_page_id(page)
            .ok_or(GmmError::DoubleFree { page })?;

        let pages = match chunk.slot(idx) {
            Some(Slot::Free { .. }) | None => return Err(GmmError::DoubleFree { page }),
            Some(Slot::Private {
                vm: owner,
                run: Run::Head(pages),
                ..
            }) if *owner == vm => *pages as PageId,
            Some(slot) if slot.is_owned_by(vm) => {
                return Err(GmmError::InvalidPageState { page })
            }
            Some(Slot::Shared { .. }) => return Err(GmmError::InvalidPageState { page }),
            Some(_) => return Err(GmmError::NotOwner { page }),
        };

        let mut chunk_id = None;
        for p in page..page + pages {
            chunk_id = Some(self.release_private_slot(vm, p)?);
        }
        if let Some(id) = chunk_id {
            self.destroy_chunk_if_unused(id);
        }
        debug!("vm {} freed large page {:#x} ({} pages)", vm, page, pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountPages;
    use crate::config::GmmConfig;
    use gmm_abi::{GmmPageDesc, OcPolicy, Priority, GMM_CHUNK_SIZE};

    fn gmm() -> Gmm {
        let _r = env_logger::try_init();
        let gmm = Gmm::new(GmmConfig::default());
        for vm in 1..=2 {
            gmm.init_vm(vm).expect("init vm");
            gmm.initial_reservation(
                vm,
                AccountPages::new(1024, 16, 16),
                OcPolicy::NoOverCommit,
                Priority::Normal,
            )
            .expect("reserve");
        }
        gmm
    }

    fn allocate(gmm: &Gmm, vm: VmId, account: Account, n: usize) -> Vec<GmmFreePageDesc> {
        let mut pages = alloc::vec![GmmPageDesc::nil(); n];
        gmm.allocate_pages(vm, account, &mut pages, false)
            .expect("allocate");
        pages.iter().map(|d| GmmFreePageDesc::from(d.id_page)).collect()
    }

    #[test]
    fn free_destroys_empty_chunks() {
        let gmm = gmm();
        let pages = allocate(&gmm, 1, Account::Base, 10);
        let (before, _vm) = gmm.query_statistics(None).expect("stats");
        assert_eq!(before.chunks, 1);

        gmm.free_pages(1, Account::Base, &pages).expect("free");
        let (after, vm) = gmm.query_statistics(Some(1)).expect("stats");
        assert_eq!(after.allocated_pages, 0);
        assert_eq!(after.chunks, 0);
        assert_eq!(after.freed_chunks, 1);
        assert_eq!(after.free_generation, before.free_generation + 1);
        assert_eq!(vm.expect("vm").private_pages, 0);
        assert_eq!(gmm.with_host(|h| h.chunks_in_use()), 0);
    }

    #[test]
    fn free_validates_first() {
        let gmm = gmm();
        let mine = allocate(&gmm, 1, Account::Base, 2);
        let theirs = allocate(&gmm, 2, Account::Base, 1);
        let shadow = allocate(&gmm, 1, Account::Shadow, 1);

        let batch = [mine[0], theirs[0]];
        assert_eq!(
            gmm.free_pages(1, Account::Base, &batch),
            Err(GmmError::NotOwner {
                page: theirs[0].id_page
            })
        );
        assert_eq!(
            gmm.free_pages(1, Account::Base, &[mine[0], mine[0]]),
            Err(GmmError::DoubleFree {
                page: mine[0].id_page
            })
        );
        assert_eq!(
            gmm.free_pages(1, Account::Base, &shadow),
            Err(GmmError::InvalidAccount)
        );
        assert_eq!(
            gmm.free_pages(1, Account::Base, &[GmmFreePageDesc::from(NIL_GMM_PAGEID)]),
            Err(GmmError::UnknownPage { page: NIL_GMM_PAGEID })
        );
        assert_eq!(
            gmm.free_pages(1, Account::Base, &[GmmFreePageDesc::from(0xFFFF_FFF5)]),
            Err(GmmError::UnknownPage { page: 0xFFFF_FFF5 })
        );
        assert_eq!(
            gmm.free_pages(1, Account::Base, &[]),
            Err(GmmError::InvalidParameter)
        );

        let (stats, vm) = gmm.query_statistics(Some(1)).expect("stats");
        assert_eq!(stats.allocated_pages, 4);
        assert_eq!(vm.expect("vm").private_pages, 3);

        gmm.free_pages(1, Account::Shadow, &shadow).expect("free shadow");
        gmm.free_pages(1, Account::Base, &mine).expect("free base");
        assert_eq!(
            gmm.free_pages(1, Account::Base, &mine),
            Err(GmmError::DoubleFree {
                page: mine[0].id_page
            })
        );
    }

    #[test]
    fn free_large_page() {
        let gmm = gmm();
        let (page, _phys) = gmm
            .allocate_large_page(1, GMM_CHUNK_SIZE as u64 / 8)
            .expect("large page");
        let keep = allocate(&gmm, 1, Account::Base, 1);

        assert_eq!(
            gmm.free_pages(1, Account::Base, &[GmmFreePageDesc::from(page)]),
            Err(GmmError::InvalidPageState { page })
        );
        assert_eq!(
            gmm.free_large_page(1, page + 1),
            Err(GmmError::InvalidPageState { page: page + 1 })
        );
        assert_eq!(
            gmm.free_large_page(2, page),
            Err(GmmError::NotOwner { page })
        );
        assert_eq!(
            gmm.free_large_page(1, keep[0].id_page),
            Err(GmmError::InvalidPageState {
                page: keep[0].id_page
            })
        );

        gmm.free_large_page(1, page).expect("free large page");
        assert_eq!(gmm.free_large_page(1, page), Err(GmmError::DoubleFree { page }));
        let (stats, vm) = gmm.query_statistics(Some(1)).expect("stats");
        assert_eq!(stats.allocated_pages, 1);
        assert_eq!(vm.expect("vm").allocated.base_pages, 1);
    }
}
