// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The host side of the allocator: physical blocks that back chunks and the
//! capability to get and release them.

use custom_error::custom_error;

pub mod backends;
pub mod frame;
pub mod host;
pub mod utils;

pub use gmm_abi::{GMM_CHUNK_SIZE, GUEST_PAGE_SIZE};

/// A host physical address.
pub type PAddr = u64;

/// A host virtual address.
pub type VAddr = u64;

/// Size of a base page on the host (same as the guest page size).
pub const BASE_PAGE_SIZE: usize = GUEST_PAGE_SIZE;

/// Size of a large page on the host (same as a chunk).
pub const LARGE_PAGE_SIZE: usize = GMM_CHUNK_SIZE;

custom_error! {
    #[derive(PartialEq, Clone)]
    pub AllocationError
    OutOfMemory{size: usize} = "Couldn't allocate {size}.",
    LimitReached{count: usize} = "Host budget of {count} chunks is used up.",
    UnknownFrame{base: PAddr} = "No block at {base} was handed out by this allocator.",
    UnknownMapping{addr: VAddr} = "Nothing is mapped at {addr}.",
}
