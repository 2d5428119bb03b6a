// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Statistics snapshots.

use log::{debug, info};

use gmm_abi::stats::{GmmStats, MemoryStats, VmStats};
use gmm_abi::{VmId, GMM_CHUNK_NUM_PAGES};

use crate::error::{GmmError, GmmResult};
use crate::memory::backends::{AllocatorStatistics, PageAllocator};
use crate::memory::utils::DataSize;

use super::{Gmm, GmmState};

impl<A: PageAllocator> Gmm<A> {
    /// The global counters and, if `vm` is given, that VM's.
    pub fn query_statistics(&self, vm: Option<VmId>) -> GmmResult<(GmmStats, Option<VmStats>)> {
        self.read(|st| {
            let vm_stats = match vm {
                Some(vm) => Some(st.vm(vm)?.stats()),
                None => None,
            };
            Ok((st.global_stats(), vm_stats))
        })
    }

    /// Host wide memory usage as the hypervisor sees it.
    pub fn query_memory_stats(&self) -> MemoryStats {
        self.read(|st| {
            let chunk_pages = (st.chunks.len() * GMM_CHUNK_NUM_PAGES) as u64;
            debug!(
                "{} chunks, {} in use, {} free",
                st.chunks.len(),
                DataSize::from_bytes(st.chunks.allocated()),
                DataSize::from_bytes(st.chunks.free())
            );
            MemoryStats {
                allocated_pages: st.ledger.allocated_pages,
                free_pages: chunk_pages.saturating_sub(st.ledger.physical_pages()),
                ballooned_pages: st.ledger.ballooned_pages,
                max_pages: st.ledger.max_pages,
                shared_pages: st.ledger.duplicate_pages,
            }
        })
    }

    /// Memory usage of `vm` as the guest sees it.
    pub fn query_vm_memory_stats(&self, vm: VmId) -> GmmResult<MemoryStats> {
        self.read(|st| {
            let account = st.vm(vm)?;
            Ok(MemoryStats {
                allocated_pages: account.allocated.base,
                free_pages: account.reserved.base.saturating_sub(account.allocated.base),
                ballooned_pages: account.ballooned_pages,
                max_pages: account.reserved.base,
                shared_pages: account.shared_pages,
            })
        })
    }

    /// Zero the cumulative counters. Only the host may do this.
    pub fn reset_statistics(&self, privileged: bool) -> GmmResult<()> {
        if !privileged {
            return Err(GmmError::AccessDenied);
        }
        self.write(|st| {
            st.ledger.left_behind_shared_pages = 0;
            st.chunks.reset_freed();
            info!("statistics reset");
            Ok(())
        })
    }
}

impl<A: PageAllocator> GmmState<A> {
    fn global_stats(&self) -> GmmStats {
        GmmStats {
            max_pages: self.ledger.max_pages,
            reserved_pages: self.ledger.reserved_pages,
            over_committed_pages: self.ledger.over_committed_pages,
            allocated_pages: self.ledger.allocated_pages,
            shared_pages: self.ledger.shared_pages,
            duplicate_pages: self.ledger.duplicate_pages,
            left_behind_shared_pages: self.ledger.left_behind_shared_pages,
            ballooned_pages: self.ledger.ballooned_pages,
            chunks: self.chunks.len() as u32,
            freed_chunks: self.chunks.freed(),
            shareable_modules: self.modules.len() as u32,
            free_generation: self.chunks.free_generation(),
            registered_vms: self.vms.len() as u32,
            bound_mode: self.config.bound,
        }
    }
}
