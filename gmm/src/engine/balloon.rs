// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Ballooning: the guest hands pages back without freeing them.
//!
//! Ballooned slots stay charged to the VM's base account, they are just no
//! longer backing guest memory. Inflation picks the VM's plain private base
//! pages from the highest page id down.

use alloc::vec::Vec;

use log::{debug, info};

use gmm_abi::{Account, BalloonAction, PageId, VmId, GMM_PAGE_PFN_LAST};

use crate::chunk::{Run, Slot};
use crate::error::{sub_or_clamp, GmmError, GmmResult};
use crate::memory::backends::PageAllocator;

use super::{Gmm, GmmState};

impl<A: PageAllocator> Gmm<A> {
    /// Inflate, deflate or reset the balloon of `vm` by `pages`.
    pub fn ballooned_pages(&self, vm: VmId, action: BalloonAction, pages: u64) -> GmmResult<()> {
        self.write(|st| st.ballooned_pages(vm, action, pages))
    }

    /// Record how far the host wants the balloon of `vm` inflated or
    /// deflated.
    pub fn set_balloon_request(&self, vm: VmId, inflate: u64, deflate: u64) -> GmmResult<()> {
        self.write(|st| {
            let account = st.vm_mut(vm)?;
            if !account.ballooning_enabled {
                return Err(GmmError::FeatureDisabled);
            }
            account.req_ballooned_pages = inflate;
            account.req_deflate_pages = deflate;
            account.req_actually_ballooned_pages = 0;
            debug!("vm {} balloon request +{} -{}", vm, inflate, deflate);
            Ok(())
        })
    }
}

impl<A: PageAllocator> GmmState<A> {
    fn ballooned_pages(&mut self, vm: VmId, action: BalloonAction, pages: u64) -> GmmResult<()> {
        let account = self.vm(vm)?;
        if !account.is_reserved() {
            return Err(GmmError::VmNotReserved);
        }
        if !account.ballooning_enabled {
            return Err(GmmError::FeatureDisabled);
        }

        match action {
            BalloonAction::Inflate => self.inflate(vm, pages),
            BalloonAction::Deflate => self.deflate(vm, pages),
            BalloonAction::Reset => {
                let all = self.vm(vm)?.ballooned_pages;
                self.deflate(vm, all)?;
                let account = self.vm_mut(vm)?;
                account.req_ballooned_pages = 0;
                account.req_actually_ballooned_pages = 0;
                account.req_deflate_pages = 0;
                info!("vm {} balloon reset, {} pages returned", vm, all);
                Ok(())
            }
            BalloonAction::Invalid | BalloonAction::End => Err(GmmError::InvalidParameter),
        }
    }

    fn inflate(&mut self, vm: VmId, pages: u64) -> GmmResult<()> {
        let account = self.vm(vm)?;
        let room = account
            .max_ballooned_pages
            .saturating_sub(account.ballooned_pages);
        if pages > room {
            return Err(GmmError::InsufficientPages { available: room });
        }

        let victims: Vec<PageId> = self
            .chunks
            .iter()
            .rev()
            .flat_map(|chunk| {
                chunk.slots().rev().filter_map(move |(idx, slot)| match slot {
                    Slot::Private {
                        vm: owner,
                        account: Account::Base,
                        run: Run::Single,
                        ..
                    } if *owner == vm => Some(chunk.page_id(idx)),
                    _ => None,
                })
            })
            .take(pages as usize)
            .collect();
        if (victims.len() as u64) < pages {
            return Err(GmmError::InsufficientPages {
                available: victims.len() as u64,
            });
        }

        let account = self.vms.get_mut(&vm).ok_or(GmmError::UnknownVm { vm })?;
        for page in victims.iter() {
            if let Some((chunk, idx)) = self.chunks.lookup_by_page_id_mut(*page) {
                if let Some(Slot::Private { pfn, .. }) = chunk.slot(idx).copied() {
                    chunk.balloon(idx);
                    if account.guest_pages.get(&pfn) == Some(page) {
                        account.guest_pages.remove(&pfn);
                    }
                }
            }
        }

        account.ballooned_pages += pages;
        if account.req_ballooned_pages > 0 {
            account.req_actually_ballooned_pages += pages;
        }
        self.ledger.ballooned_pages += pages;
        debug!("vm {} inflated by {} pages", vm, pages);
        Ok(())
    }

    fn deflate(&mut self, vm: VmId, pages: u64) -> GmmResult<()> {
        let account = self.vm(vm)?;
        if pages > account.ballooned_pages {
            return Err(GmmError::InsufficientPages {
                available: account.ballooned_pages,
            });
        }

        let returning: Vec<PageId> = self
            .chunks
            .iter()
            .flat_map(|chunk| {
                chunk.slots().filter_map(move |(idx, slot)| match slot {
                    Slot::Ballooned { vm: owner, .. } if *owner == vm => Some(chunk.page_id(idx)),
                    _ => None,
                })
            })
            .take(pages as usize)
            .collect();
        if (returning.len() as u64) < pages {
            return Err(GmmError::Inconsistent {
                what: "fewer ballooned slots than ballooned pages",
            });
        }

        let account = self.vms.get_mut(&vm).ok_or(GmmError::UnknownVm { vm })?;
        for page in returning.iter() {
            if let Some((chunk, idx)) = self.chunks.lookup_by_page_id_mut(*page) {
                if let Some(Slot::Ballooned { pfn, .. }) = chunk.slot(idx).copied() {
                    chunk.deflate(idx);
                    // The guest may have put another page at `pfn` meanwhile.
                    if pfn <= GMM_PAGE_PFN_LAST {
                        account.guest_pages.entry(pfn).or_insert(*page);
                    }
                }
            }
        }

        sub_or_clamp(&mut account.ballooned_pages, pages, "vm ballooned pages");
        sub_or_clamp(&mut self.ledger.ballooned_pages, pages, "ballooned pages");
        account.req_deflate_pages = 0;
        debug!("vm {} deflated by {} pages", vm, pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountPages;
    use crate::config::GmmConfig;
    use gmm_abi::{GmmFreePageDesc, GmmPageDesc, OcPolicy, Priority, NIL_GMM_PAGEID};

    fn gmm_with_pages(config: GmmConfig, n: usize) -> (Gmm, Vec<PageId>) {
        let _r = env_logger::try_init();
        let gmm = Gmm::new(config);
        gmm.init_vm(1).expect("init vm");
        gmm.initial_reservation(
            1,
            AccountPages::new(100, 4, 4),
            OcPolicy::NoOverCommit,
            Priority::Normal,
        )
        .expect("reserve");
        let mut pages = alloc::vec![GmmPageDesc::nil(); n];
        gmm.allocate_pages(1, Account::Base, &mut pages, false)
            .expect("allocate");
        let ids = pages.iter().map(|d| d.id_page).collect();
        (gmm, ids)
    }

    #[test]
    fn inflate_and_reset() {
        let (gmm, pages) = gmm_with_pages(Default::default(), 50);
        gmm.ballooned_pages(1, BalloonAction::Inflate, 10)
            .expect("inflate");

        let (stats, vm) = gmm.query_statistics(Some(1)).expect("stats");
        let vm = vm.expect("vm");
        assert_eq!(vm.allocated.base_pages, 50);
        assert_eq!(vm.ballooned_pages, 10);
        assert_eq!(stats.ballooned_pages, 10);

        // The highest ten pages went into the balloon.
        let ballooned = &pages[40..];
        assert_eq!(
            gmm.free_pages(1, Account::Base, &[GmmFreePageDesc::from(ballooned[0])]),
            Err(GmmError::InvalidPageState { page: ballooned[0] })
        );

        gmm.ballooned_pages(1, BalloonAction::Reset, 0)
            .expect("reset");
        let (stats, vm) = gmm.query_statistics(Some(1)).expect("stats");
        assert_eq!(vm.expect("vm").ballooned_pages, 0);
        assert_eq!(stats.ballooned_pages, 0);
        gmm.free_pages(1, Account::Base, &[GmmFreePageDesc::from(ballooned[0])])
            .expect("private again");
    }

    #[test]
    fn inflate_limits() {
        let (gmm, _pages) = gmm_with_pages(Default::default(), 5);
        assert_eq!(
            gmm.ballooned_pages(1, BalloonAction::Inflate, 6),
            Err(GmmError::InsufficientPages { available: 5 })
        );
        assert_eq!(
            gmm.ballooned_pages(1, BalloonAction::Inflate, 101),
            Err(GmmError::InsufficientPages { available: 100 })
        );
        assert_eq!(
            gmm.ballooned_pages(1, BalloonAction::Deflate, 1),
            Err(GmmError::InsufficientPages { available: 0 })
        );
        assert_eq!(
            gmm.ballooned_pages(1, BalloonAction::Invalid, 1),
            Err(GmmError::InvalidParameter)
        );

        gmm.ballooned_pages(1, BalloonAction::Inflate, 5)
            .expect("all of them");
        gmm.ballooned_pages(1, BalloonAction::Deflate, 2)
            .expect("some back");
        let (_stats, vm) = gmm.query_statistics(Some(1)).expect("stats");
        assert_eq!(vm.expect("vm").ballooned_pages, 3);
    }

    #[test]
    fn deflate_keeps_newer_guest_mapping() {
        let (gmm, pages) = gmm_with_pages(Default::default(), 5);
        let guest = |gmm: &Gmm| {
            gmm.read(|st| st.vm(1).map(|vm| vm.guest_pages.get(&0x100).copied()))
        };

        let mut tag = [GmmPageDesc::new(0x10_0000, pages[4], NIL_GMM_PAGEID)];
        gmm.allocate_handy_pages(1, 1, 0, &mut tag)
            .expect("tag highest page");
        assert_eq!(guest(&gmm), Ok(Some(pages[4])));

        gmm.ballooned_pages(1, BalloonAction::Inflate, 1)
            .expect("inflate");
        assert_eq!(guest(&gmm), Ok(None));

        // The guest reuses the frame for another page while the first one
        // sits in the balloon.
        let mut tag = [GmmPageDesc::new(0x10_0000, pages[0], NIL_GMM_PAGEID)];
        gmm.allocate_handy_pages(1, 1, 0, &mut tag)
            .expect("retag");

        gmm.ballooned_pages(1, BalloonAction::Deflate, 1)
            .expect("deflate");
        assert_eq!(guest(&gmm), Ok(Some(pages[0])));
        assert_eq!(gmm.sanity_check(), 0);
    }

    #[test]
    fn balloon_requests() {
        let (gmm, _pages) = gmm_with_pages(Default::default(), 8);
        gmm.set_balloon_request(1, 6, 0).expect("request");
        gmm.ballooned_pages(1, BalloonAction::Inflate, 4)
            .expect("inflate");
        let (_stats, vm) = gmm.query_statistics(Some(1)).expect("stats");
        let vm = vm.expect("vm");
        assert_eq!(vm.req_ballooned_pages, 6);
        assert_eq!(vm.req_actually_ballooned_pages, 4);

        gmm.set_balloon_request(1, 0, 4).expect("request");
        gmm.ballooned_pages(1, BalloonAction::Deflate, 4)
            .expect("deflate");
        let (_stats, vm) = gmm.query_statistics(Some(1)).expect("stats");
        assert_eq!(vm.expect("vm").req_deflate_pages, 0);
    }

    #[test]
    fn ballooning_disabled() {
        let config = GmmConfig {
            ballooning: false,
            ..Default::default()
        };
        let (gmm, _pages) = gmm_with_pages(config, 8);
        assert_eq!(
            gmm.ballooned_pages(1, BalloonAction::Inflate, 1),
            Err(GmmError::FeatureDisabled)
        );
        assert_eq!(
            gmm.set_balloon_request(1, 1, 0),
            Err(GmmError::FeatureDisabled)
        );
    }
}
