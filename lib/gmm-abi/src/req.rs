// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request bodies for every call the allocator serves.
//!
//! The generic request header belongs to the transport; these structs only
//! carry the operation specific fields. Fields documented as "out" are filled
//! in by the allocator before the request is handed back.

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::stats::{GmmStats, MemoryStats, VmStats};
use crate::{
    Account, BalloonAction, ChunkId, GmmFreePageDesc, GmmPageDesc, GuestOsFamily, OcPolicy, PageId,
    Priority, NIL_GMM_CHUNKID, NIL_GMM_PAGEID,
};

/// Max. number of pages a single handy-page request may allocate.
pub const GMM_MAX_HANDY_PAGES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialReservationReq {
    pub base_pages: u64,
    pub shadow_pages: u32,
    pub fixed_pages: u32,
    pub oc_policy: OcPolicy,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReservationReq {
    pub base_pages: u64,
    pub shadow_pages: u32,
    pub fixed_pages: u32,
}

/// Allocate `pages.len()` pages (all descriptors in/out).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatePagesReq {
    pub account: Account,
    /// Does the caller need the pages zeroed?
    pub zero: bool,
    pub pages: Vec<GmmPageDesc>,
}

/// Update the first `pages_to_update` descriptors, then allocate
/// `pages_to_alloc` fresh pages into the first `pages_to_alloc` slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateHandyPagesReq {
    pub pages_to_update: u32,
    pub pages_to_alloc: u32,
    pub pages: Vec<GmmPageDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateLargePageReq {
    pub size: u64,
    /// out: first page id of the run.
    pub id_page: PageId,
    /// out: host physical address of the run.
    pub host_phys: u64,
}

impl AllocateLargePageReq {
    pub fn new(size: u64) -> Self {
        AllocateLargePageReq {
            size,
            id_page: NIL_GMM_PAGEID,
            host_phys: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreePagesReq {
    pub account: Account,
    pub pages: Vec<GmmFreePageDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeLargePageReq {
    pub id_page: PageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalloonedPagesReq {
    pub action: BalloonAction,
    pub pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapUnmapChunkReq {
    pub id_chunk_map: ChunkId,
    pub id_chunk_unmap: ChunkId,
    /// out: address the mapped chunk is accessible at.
    pub address: u64,
}

impl MapUnmapChunkReq {
    pub fn new(id_chunk_map: ChunkId, id_chunk_unmap: ChunkId) -> Self {
        MapUnmapChunkReq {
            id_chunk_map,
            id_chunk_unmap,
            address: 0,
        }
    }

    pub fn map(id_chunk: ChunkId) -> Self {
        MapUnmapChunkReq::new(id_chunk, NIL_GMM_CHUNKID)
    }

    pub fn unmap(id_chunk: ChunkId) -> Self {
        MapUnmapChunkReq::new(NIL_GMM_CHUNKID, id_chunk)
    }
}

/// One guest physical range of a shared module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRegionDesc {
    pub gc_phys: u64,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSharedModuleReq {
    pub guest_os: GuestOsFamily,
    pub name: String,
    pub version: String,
    pub base_addr: u64,
    pub module_size: u32,
    pub regions: Vec<SharedRegionDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterSharedModuleReq {
    pub name: String,
    pub version: String,
    pub base_addr: u64,
    pub module_size: u32,
}

/// A guest page whose backing changed during a sharing pass.
///
/// The caller must point `gc_phys` at `new_page` and forget `old_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedPageRedirect {
    pub gc_phys: u64,
    pub old_page: PageId,
    pub new_page: PageId,
    pub host_phys: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckSharedModulesReq {
    /// out: pages that were remapped to a shared page.
    pub redirects: Vec<SharedPageRedirect>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindDuplicatePageReq {
    pub id_page: PageId,
    /// out
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryStatisticsReq {
    /// Also report the calling VM's counters.
    pub with_vm: bool,
    /// out
    pub stats: GmmStats,
    /// out
    pub vm_stats: Option<VmStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResetStatisticsReq {}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryMemoryStatsReq {
    /// out
    pub stats: MemoryStats,
}

/// Every request the allocator understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GmmRequest {
    InitialReservation(InitialReservationReq),
    UpdateReservation(UpdateReservationReq),
    AllocatePages(AllocatePagesReq),
    AllocateHandyPages(AllocateHandyPagesReq),
    AllocateLargePage(AllocateLargePageReq),
    FreePages(FreePagesReq),
    FreeLargePage(FreeLargePageReq),
    BalloonedPages(BalloonedPagesReq),
    MapUnmapChunk(MapUnmapChunkReq),
    RegisterSharedModule(RegisterSharedModuleReq),
    UnregisterSharedModule(UnregisterSharedModuleReq),
    ResetSharedModules,
    CheckSharedModules(CheckSharedModulesReq),
    FindDuplicatePage(FindDuplicatePageReq),
    QueryStatistics(QueryStatisticsReq),
    ResetStatistics(ResetStatisticsReq),
    /// Hypervisor wide memory view (privileged callers only).
    QueryMemoryStats(QueryMemoryStatsReq),
    /// Memory view of the calling VM.
    QueryVmMemoryStats(QueryMemoryStatsReq),
}

impl GmmRequest {
    /// Name of the operation, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            GmmRequest::InitialReservation(_) => "InitialReservation",
            GmmRequest::UpdateReservation(_) => "UpdateReservation",
            GmmRequest::AllocatePages(_) => "AllocatePages",
            GmmRequest::AllocateHandyPages(_) => "AllocateHandyPages",
            GmmRequest::AllocateLargePage(_) => "AllocateLargePage",
            GmmRequest::FreePages(_) => "FreePages",
            GmmRequest::FreeLargePage(_) => "FreeLargePage",
            GmmRequest::BalloonedPages(_) => "BalloonedPages",
            GmmRequest::MapUnmapChunk(_) => "MapUnmapChunk",
            GmmRequest::RegisterSharedModule(_) => "RegisterSharedModule",
            GmmRequest::UnregisterSharedModule(_) => "UnregisterSharedModule",
            GmmRequest::ResetSharedModules => "ResetSharedModules",
            GmmRequest::CheckSharedModules(_) => "CheckSharedModules",
            GmmRequest::FindDuplicatePage(_) => "FindDuplicatePage",
            GmmRequest::QueryStatistics(_) => "QueryStatistics",
            GmmRequest::ResetStatistics(_) => "ResetStatistics",
            GmmRequest::QueryMemoryStats(_) => "QueryMemoryStats",
            GmmRequest::QueryVmMemoryStats(_) => "QueryVmMemoryStats",
        }
    }
}
