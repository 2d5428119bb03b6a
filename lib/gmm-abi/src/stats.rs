// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Statistics snapshots handed out by the allocator.

use serde::{Deserialize, Serialize};

use crate::{OcPolicy, Priority};

/// Global counters of the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GmmStats {
    /// The page budget of the whole host.
    pub max_pages: u64,
    /// Pages reserved by all VMs.
    pub reserved_pages: u64,
    /// Reserved pages beyond `max_pages`.
    pub over_committed_pages: u64,
    /// Page references charged to VM accounts.
    pub allocated_pages: u64,
    /// Physical pages in the shared state.
    pub shared_pages: u64,
    /// References to shared pages beyond the first one.
    pub duplicate_pages: u64,
    /// Shared references dropped by VM cleanup while the page stayed alive.
    pub left_behind_shared_pages: u64,
    pub ballooned_pages: u64,
    pub chunks: u32,
    pub freed_chunks: u64,
    pub shareable_modules: u32,
    pub free_generation: u64,
    pub registered_vms: u32,
    pub bound_mode: bool,
}

/// The three quota buckets of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountStats {
    pub base_pages: u64,
    pub shadow_pages: u32,
    pub fixed_pages: u32,
}

impl AccountStats {
    pub fn total(&self) -> u64 {
        self.base_pages
            .saturating_add(self.shadow_pages as u64)
            .saturating_add(self.fixed_pages as u64)
    }
}

/// Counters of a single VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStats {
    pub reserved: AccountStats,
    pub allocated: AccountStats,
    pub private_pages: u64,
    pub shared_pages: u64,
    pub ballooned_pages: u64,
    pub max_ballooned_pages: u64,
    pub req_ballooned_pages: u64,
    pub req_actually_ballooned_pages: u64,
    pub req_deflate_pages: u64,
    pub shareable_modules: u32,
    pub oc_policy: OcPolicy,
    pub priority: Priority,
    pub ballooning_enabled: bool,
    pub shared_paging_enabled: bool,
    pub may_allocate: bool,
}

/// Coarse memory view, either of the whole host or of a single VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub allocated_pages: u64,
    pub free_pages: u64,
    pub ballooned_pages: u64,
    pub max_pages: u64,
    pub shared_pages: u64,
}
