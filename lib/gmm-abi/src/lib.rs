// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Defines the interface of the global memory manager (i.e., the requests a
//! guest context sends to the host allocator) and associated data-types.
//!
//! Everything in here crosses a privilege boundary, so layouts are fixed and
//! checked at compile time.
#![no_std]

extern crate alloc;

pub mod desc;
pub mod req;
pub mod stats;

pub use desc::{GmmFreePageDesc, GmmPageDesc};

/// Handle of a page slot: `(chunk id << GMM_CHUNKID_SHIFT) | slot`.
pub type PageId = u32;

/// Handle of an allocation chunk.
pub type ChunkId = u32;

/// Handle of a VM as assigned by the layer that calls into the allocator.
pub type VmId = u32;

/// Size of a guest page.
pub const GUEST_PAGE_SIZE: usize = 4096;
/// log2 of `GUEST_PAGE_SIZE`.
pub const GUEST_PAGE_SHIFT: usize = 12;
/// Mask for the offset inside a guest page.
pub const GUEST_PAGE_OFFSET_MASK: u64 = (GUEST_PAGE_SIZE - 1) as u64;

/// log2 of `GMM_CHUNK_SIZE`.
pub const GMM_CHUNK_SHIFT: usize = 21;
/// Size of an allocation chunk (2 MiB).
pub const GMM_CHUNK_SIZE: usize = 1 << GMM_CHUNK_SHIFT;
/// Number of page slots in a chunk.
pub const GMM_CHUNK_NUM_PAGES: usize = GMM_CHUNK_SIZE / GUEST_PAGE_SIZE;

/// How far a chunk id is shifted inside a page id.
pub const GMM_CHUNKID_SHIFT: u32 = (GMM_CHUNK_SHIFT - GUEST_PAGE_SHIFT) as u32;
/// Mask for the slot index inside a page id.
pub const GMM_PAGEID_IDX_MASK: u32 = (1 << GMM_CHUNKID_SHIFT) - 1;

/// The NIL page id.
pub const NIL_GMM_PAGEID: PageId = 0;
/// The NIL chunk id.
pub const NIL_GMM_CHUNKID: ChunkId = 0;
/// The last valid page id, everything from here upwards is reserved for
/// special markers.
pub const GMM_PAGEID_LAST: PageId = 0xFFFF_FFF0;
/// The last chunk id whose page ids all stay below `GMM_PAGEID_LAST`.
pub const GMM_CHUNKID_LAST: ChunkId = (GMM_PAGEID_LAST >> GMM_CHUNKID_SHIFT) - 1;

/// The last guest page frame number we can store in a slot.
pub const GMM_PAGE_PFN_LAST: u32 = 0xFFFF_FFF0;
/// Guest frame number of pages that must never be content-shared (also used
/// for pages that have no guest address yet).
pub const GMM_PAGE_PFN_UNSHAREABLE: u32 = 0xFFFF_FFF1;

/// The last guest physical address a page descriptor may carry.
pub const GMM_GCPHYS_LAST: u64 = (GMM_PAGE_PFN_LAST as u64) << GUEST_PAGE_SHIFT;
/// Guest physical address marking a page as unshareable.
pub const GMM_GCPHYS_UNSHAREABLE: u64 = (GMM_PAGE_PFN_UNSHAREABLE as u64) << GUEST_PAGE_SHIFT;
/// The "no address" value of a page descriptor (all 63 address bits set).
pub const NIL_GMMPAGEDESC_PHYS: u64 = 0x7fff_ffff_ffff_ffff;

/// Max. length (including terminator) of a shared module name.
pub const GMM_SHARED_MODULE_MAX_NAME_STRING: usize = 128;
/// Max. length (including terminator) of a shared module version.
pub const GMM_SHARED_MODULE_MAX_VERSION_STRING: usize = 16;
/// Max. number of regions a shared module may declare.
pub const GMM_SHARED_MODULE_MAX_REGIONS: usize = 32;

static_assertions::const_assert_eq!(GMM_CHUNK_NUM_PAGES, 512);
static_assertions::const_assert_eq!(GMM_CHUNKID_SHIFT, 9);
static_assertions::const_assert!(GMM_GCPHYS_UNSHAREABLE > GMM_GCPHYS_LAST);
static_assertions::const_assert!(NIL_GMMPAGEDESC_PHYS > GMM_GCPHYS_UNSHAREABLE);
static_assertions::const_assert!(
    ((GMM_CHUNKID_LAST << GMM_CHUNKID_SHIFT) | GMM_PAGEID_IDX_MASK) < GMM_PAGEID_LAST
);

/// Chunk id a page id belongs to.
#[inline]
pub const fn page_id_to_chunk_id(id: PageId) -> ChunkId {
    id >> GMM_CHUNKID_SHIFT
}

/// Slot index of a page id inside its chunk.
#[inline]
pub const fn page_id_to_slot(id: PageId) -> usize {
    (id & GMM_PAGEID_IDX_MASK) as usize
}

/// Compose a page id from a chunk id and a slot index.
#[inline]
pub const fn make_page_id(chunk: ChunkId, slot: usize) -> PageId {
    (chunk << GMM_CHUNKID_SHIFT) | (slot as u32 & GMM_PAGEID_IDX_MASK)
}

/// Is `gcphys` acceptable as the guest address input of a page descriptor?
pub fn is_valid_guest_phys(gcphys: u64) -> bool {
    (gcphys <= GMM_GCPHYS_LAST && gcphys & GUEST_PAGE_OFFSET_MASK == 0)
        || gcphys == NIL_GMMPAGEDESC_PHYS
        || gcphys == GMM_GCPHYS_UNSHAREABLE
}

/// Guest frame number we record for the guest address input `gcphys`.
///
/// NIL and the unshareable marker both end up as `GMM_PAGE_PFN_UNSHAREABLE`.
pub fn guest_phys_to_pfn(gcphys: u64) -> u32 {
    if gcphys <= GMM_GCPHYS_LAST {
        (gcphys >> GUEST_PAGE_SHIFT) as u32
    } else {
        GMM_PAGE_PFN_UNSHAREABLE
    }
}

/// Status codes returned to the caller of the allocator.
#[derive(Debug, Eq, PartialEq, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[repr(u64)]
pub enum GmmStatus {
    /// The request completed.
    Ok = 0,
    /// The module was already registered at this address (informational).
    AlreadyRegistered = 1,
    /// The host is out of memory, page ids or the global page budget.
    OutOfMemory = 2,
    /// The VM ran out of its reservation.
    QuotaExceeded = 3,
    /// No contiguous run of slots was available.
    NoContiguousSpace = 4,
    /// Page belongs to somebody else.
    NotOwner = 5,
    /// Page or chunk id does not resolve to anything (or is already free).
    NotFound = 6,
    /// Call made in the wrong order (e.g. allocating before reserving).
    WrongOrder = 7,
    /// Malformed request.
    InvalidParameter = 8,
    /// Chunk is not mapped into the caller.
    NotMapped = 9,
    /// The request was refused by policy, try again later or pause the VM.
    Denied = 10,
    /// Shared module bookkeeping refused the request.
    SharedModule = 11,
    /// The allocator detected an internal inconsistency.
    InternalError = 12,
    /// Placeholder for an invalid, unknown status code.
    Unknown,
}

impl From<u64> for GmmStatus {
    /// Construct a `GmmStatus` enum based on a 64-bit value.
    fn from(e: u64) -> GmmStatus {
        match e {
            0 => GmmStatus::Ok,
            1 => GmmStatus::AlreadyRegistered,
            2 => GmmStatus::OutOfMemory,
            3 => GmmStatus::QuotaExceeded,
            4 => GmmStatus::NoContiguousSpace,
            5 => GmmStatus::NotOwner,
            6 => GmmStatus::NotFound,
            7 => GmmStatus::WrongOrder,
            8 => GmmStatus::InvalidParameter,
            9 => GmmStatus::NotMapped,
            10 => GmmStatus::Denied,
            11 => GmmStatus::SharedModule,
            12 => GmmStatus::InternalError,
            _ => GmmStatus::Unknown,
        }
    }
}

impl GmmStatus {
    /// Does the status code indicate success (including informational codes)?
    pub fn is_success(&self) -> bool {
        matches!(self, GmmStatus::Ok | GmmStatus::AlreadyRegistered)
    }
}

/// The over-commit policy of a VM.
#[derive(Debug, Eq, PartialEq, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum OcPolicy {
    /// The usual invalid value.
    Invalid = 0,
    /// No over-commitment, the reservation is a hard limit.
    NoOverCommit = 1,
    /// The reservation may be exceeded while there is spare global capacity.
    ToBeDetermined = 2,
    /// End of the valid values.
    End = 3,
}

impl From<u32> for OcPolicy {
    fn from(v: u32) -> OcPolicy {
        match v {
            1 => OcPolicy::NoOverCommit,
            2 => OcPolicy::ToBeDetermined,
            _ => OcPolicy::Invalid,
        }
    }
}

impl OcPolicy {
    pub fn is_valid(&self) -> bool {
        *self != OcPolicy::Invalid && *self != OcPolicy::End
    }
}

/// VM priority for arbitrating between VMs in low and out of memory
/// situations.
#[derive(Debug, Eq, PartialEq, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum Priority {
    /// The usual invalid value.
    Invalid = 0,
    /// Should be the last one to be asked to give up memory.
    High = 1,
    /// Normal VM priority.
    Normal = 2,
    /// Should be the first one to be asked to give up memory.
    Low = 3,
    /// End of the valid values.
    End = 4,
}

impl From<u32> for Priority {
    fn from(v: u32) -> Priority {
        match v {
            1 => Priority::High,
            2 => Priority::Normal,
            3 => Priority::Low,
            _ => Priority::Invalid,
        }
    }
}

impl Priority {
    pub fn is_valid(&self) -> bool {
        *self != Priority::Invalid && *self != Priority::End
    }
}

/// Independent quota buckets inside a VM reservation.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum Account {
    /// The usual invalid value.
    Invalid = 0,
    /// Guest RAM, ROM and the like.
    Base = 1,
    /// Shadow/nested page tables.
    Shadow = 2,
    /// Fixed allocations (MMIO2, hypervisor heap).
    Fixed = 3,
    /// End of the valid values.
    End = 4,
}

impl From<u32> for Account {
    fn from(v: u32) -> Account {
        match v {
            1 => Account::Base,
            2 => Account::Shadow,
            3 => Account::Fixed,
            _ => Account::Invalid,
        }
    }
}

impl From<&str> for Account {
    /// Construct an Account enum based on a str.
    fn from(op: &str) -> Account {
        match op {
            "Base" => Account::Base,
            "Shadow" => Account::Shadow,
            "Fixed" => Account::Fixed,
            _ => Account::Invalid,
        }
    }
}

impl Account {
    pub fn is_valid(&self) -> bool {
        *self != Account::Invalid && *self != Account::End
    }
}

/// What a balloon request does.
#[derive(Debug, Eq, PartialEq, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum BalloonAction {
    /// The usual invalid value.
    Invalid = 0,
    /// The guest hands pages to the balloon.
    Inflate = 1,
    /// The guest takes pages back from the balloon.
    Deflate = 2,
    /// Empty the balloon (VM reset).
    Reset = 3,
    /// End of the valid values.
    End = 4,
}

impl From<u32> for BalloonAction {
    fn from(v: u32) -> BalloonAction {
        match v {
            1 => BalloonAction::Inflate,
            2 => BalloonAction::Deflate,
            3 => BalloonAction::Reset,
            _ => BalloonAction::Invalid,
        }
    }
}

impl BalloonAction {
    pub fn is_valid(&self) -> bool {
        *self != BalloonAction::Invalid && *self != BalloonAction::End
    }
}

/// Guest OS family of a shared module.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum GuestOsFamily {
    Unknown = 0,
    Windows32 = 1,
    Windows64 = 2,
    Linux32 = 3,
    Linux64 = 4,
    Other = 5,
}

impl From<u32> for GuestOsFamily {
    fn from(v: u32) -> GuestOsFamily {
        match v {
            1 => GuestOsFamily::Windows32,
            2 => GuestOsFamily::Windows64,
            3 => GuestOsFamily::Linux32,
            4 => GuestOsFamily::Linux64,
            5 => GuestOsFamily::Other,
            _ => GuestOsFamily::Unknown,
        }
    }
}

static_assertions::assert_eq_size!(OcPolicy, u32);
static_assertions::assert_eq_size!(Priority, u32);
static_assertions::assert_eq_size!(Account, u32);
static_assertions::assert_eq_size!(BalloonAction, u32);
static_assertions::assert_eq_size!(GmmStatus, u64);
