// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Entry point for requests that arrive over the request boundary.
//!
//! The transport hands us a decoded [`GmmRequest`] and the VM it came from
//! (`None` for the host itself). Output fields are written back into the
//! request, the precise error is logged and reduced to a [`GmmStatus`].

use log::{debug, error, trace, warn};

use gmm_abi::req::{GmmRequest, GMM_MAX_HANDY_PAGES};
use gmm_abi::{BalloonAction, GmmStatus, VmId};

use crate::account::AccountPages;
use crate::error::{ErrorKind, GmmError, GmmResult};
use crate::memory::backends::PageAllocator;

use super::{Gmm, ModuleRegistration};

impl<A: PageAllocator> Gmm<A> {
    /// Serve one request on behalf of `caller`.
    pub fn dispatch(&self, caller: Option<VmId>, req: &mut GmmRequest) -> GmmStatus {
        let name = req.name();
        trace!("{} from {:?}", name, caller);
        match self.handle(caller, req) {
            Ok(status) => status,
            Err(e) => {
                match e.kind() {
                    ErrorKind::ProtocolViolation => {
                        warn!("{} from {:?} rejected: {}", name, caller, e)
                    }
                    ErrorKind::ResourceExhaustion | ErrorKind::PolicyDenial => {
                        debug!("{} from {:?} failed: {}", name, caller, e)
                    }
                    ErrorKind::Internal => error!("{} from {:?} failed: {}", name, caller, e),
                }
                GmmStatus::from(e)
            }
        }
    }

    fn handle(&self, caller: Option<VmId>, req: &mut GmmRequest) -> GmmResult<GmmStatus> {
        let vm = || caller.ok_or(GmmError::InvalidParameter);

        match req {
            GmmRequest::InitialReservation(r) => self.initial_reservation(
                vm()?,
                AccountPages::new(r.base_pages, r.shadow_pages as u64, r.fixed_pages as u64),
                r.oc_policy,
                r.priority,
            )?,
            GmmRequest::UpdateReservation(r) => self.update_reservation(
                vm()?,
                AccountPages::new(r.base_pages, r.shadow_pages as u64, r.fixed_pages as u64),
            )?,
            GmmRequest::AllocatePages(r) => {
                self.allocate_pages(vm()?, r.account, &mut r.pages, r.zero)?
            }
            GmmRequest::AllocateHandyPages(r) => {
                let to_update = r.pages_to_update as usize;
                let to_alloc = r.pages_to_alloc as usize;
                if to_update > GMM_MAX_HANDY_PAGES || to_alloc > GMM_MAX_HANDY_PAGES {
                    return Err(GmmError::InvalidParameter);
                }
                self.allocate_handy_pages(vm()?, to_update, to_alloc, &mut r.pages)?
            }
            GmmRequest::AllocateLargePage(r) => {
                let (page, phys) = self.allocate_large_page(vm()?, r.size)?;
                r.id_page = page;
                r.host_phys = phys;
            }
            GmmRequest::FreePages(r) => self.free_pages(vm()?, r.account, &r.pages)?,
            GmmRequest::FreeLargePage(r) => self.free_large_page(vm()?, r.id_page)?,
            GmmRequest::BalloonedPages(r) => {
                if !r.action.is_valid() {
                    return Err(GmmError::InvalidParameter);
                }
                let pages = match r.action {
                    BalloonAction::Reset => 0,
                    _ => r.pages as u64,
                };
                self.ballooned_pages(vm()?, r.action, pages)?
            }
            GmmRequest::MapUnmapChunk(r) => {
                let addr = self.map_unmap_chunk(vm()?, r.id_chunk_map, r.id_chunk_unmap)?;
                r.address = addr.unwrap_or(0);
            }
            GmmRequest::RegisterSharedModule(r) => {
                if self.register_shared_module(vm()?, r)? == ModuleRegistration::AlreadyRegistered
                {
                    return Ok(GmmStatus::AlreadyRegistered);
                }
            }
            GmmRequest::UnregisterSharedModule(r) => self.unregister_shared_module(vm()?, r)?,
            GmmRequest::ResetSharedModules => self.reset_shared_modules(vm()?)?,
            GmmRequest::CheckSharedModules(r) => {
                let report = self.check_shared_modules(vm()?)?;
                r.redirects = report.redirects;
            }
            GmmRequest::FindDuplicatePage(r) => {
                r.duplicate = self.find_duplicate_page(vm()?, r.id_page)?;
            }
            GmmRequest::QueryStatistics(r) => {
                let target = if r.with_vm { Some(vm()?) } else { None };
                let (stats, vm_stats) = self.query_statistics(target)?;
                r.stats = stats;
                r.vm_stats = vm_stats;
            }
            GmmRequest::ResetStatistics(_r) => self.reset_statistics(caller.is_none())?,
            GmmRequest::QueryMemoryStats(r) => {
                if caller.is_some() {
                    return Err(GmmError::AccessDenied);
                }
                r.stats = self.query_memory_stats();
            }
            GmmRequest::QueryVmMemoryStats(r) => {
                r.stats = self.query_vm_memory_stats(vm()?)?;
            }
        }
        Ok(GmmStatus::Ok)
    }
}
