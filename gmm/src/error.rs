// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::convert::From;

use custom_error::custom_error;
use log::error;

use gmm_abi::{ChunkId, GmmStatus, PageId, VmId};

custom_error! {
    #[derive(PartialEq, Clone)]
    pub GmmError
    // Resource exhaustion
    OutOfHostMemory = "The host can't provide any more pages.",
    QuotaExceeded{needed: u64, available: u64} = "Reservation exhausted: need {needed} pages, {available} left.",
    ReservationTooLarge{requested: u64, available: u64} = "Reservation of {requested} pages exceeds the {available} pages still available.",
    NoContiguousSpace{pages: usize} = "Can't find {pages} contiguous free pages.",
    OutOfIds = "All chunk ids are in use.",
    // Protocol/ownership violations
    NotOwner{page: PageId} = "Page {page} is owned by another VM.",
    DoubleFree{page: PageId} = "Page {page} is already free.",
    UnknownChunk{chunk: ChunkId} = "Chunk {chunk} does not exist.",
    UnknownPage{page: PageId} = "Page {page} does not exist.",
    UnknownVm{vm: VmId} = "VM {vm} is not registered with the allocator.",
    VmAlreadyRegistered{vm: VmId} = "VM {vm} is already registered with the allocator.",
    VmNotReserved = "The VM has not made an initial reservation yet.",
    AlreadyReserved = "The VM already made its initial reservation.",
    InvalidAccount = "Invalid account.",
    InvalidPolicy = "Invalid over-commit policy.",
    InvalidPriority = "Invalid VM priority.",
    InvalidParameter = "Malformed request.",
    InvalidPageState{page: PageId} = "Page {page} can't be used that way in its current state.",
    InvalidLargePageSize{size: u64} = "Unsupported large page size {size}.",
    NotMapped{chunk: ChunkId} = "Chunk {chunk} is not mapped into the VM.",
    AccessDenied = "Operation requires a privileged caller.",
    // Shared modules
    TooManyModules = "Shared module limit reached.",
    TooManyRegions = "Too many regions in shared module.",
    BadModuleSize = "Shared module or region size out of range.",
    ModuleNameTooLong = "Shared module name or version too long.",
    ModuleAddressClash = "A different module is registered at this address.",
    ModuleNotFound = "No such shared module registered at this address.",
    // Policy denial
    BelowCurrentUsage{allocated: u64} = "Can't shrink the reservation below the {allocated} pages in use.",
    InsufficientPages{available: u64} = "Only {available} pages are eligible.",
    MayNotAllocate = "The VM was told to stop allocating.",
    FeatureDisabled = "The feature is disabled for this VM.",
    // Host allocator failures
    HostMemory{source: crate::memory::AllocationError} = "Host page allocator failed",
    // Engine bugs
    Inconsistent{what: &'static str} = "Internal inconsistency detected: {what}",
}

/// Coarse classification of a `GmmError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Out of something, the caller may retry after freeing.
    ResourceExhaustion,
    /// A caller bug, nothing was changed.
    ProtocolViolation,
    /// Expected refusal, e.g. pause the VM.
    PolicyDenial,
    /// A bug in the allocator itself.
    Internal,
}

impl GmmError {
    pub fn kind(&self) -> ErrorKind {
        use GmmError::*;
        match self {
            OutOfHostMemory
            | QuotaExceeded { .. }
            | ReservationTooLarge { .. }
            | NoContiguousSpace { .. }
            | OutOfIds
            | TooManyModules
            | HostMemory { .. } => ErrorKind::ResourceExhaustion,
            BelowCurrentUsage { .. } | InsufficientPages { .. } | MayNotAllocate | FeatureDisabled => {
                ErrorKind::PolicyDenial
            }
            Inconsistent { .. } => ErrorKind::Internal,
            _ => ErrorKind::ProtocolViolation,
        }
    }
}

impl From<hashbrown::TryReserveError> for GmmError {
    fn from(_e: hashbrown::TryReserveError) -> Self {
        GmmError::OutOfHostMemory
    }
}

impl From<GmmError> for GmmStatus {
    /// Translate GmmErrors to GmmStatus codes.
    ///
    /// The idea is to reduce a big set of events into a smaller set of less
    /// precise errors. We log the precise error in the dispatcher before the
    /// conversion happens.
    fn from(e: GmmError) -> GmmStatus {
        use GmmError::*;
        match e {
            OutOfHostMemory | OutOfIds | HostMemory { .. } => GmmStatus::OutOfMemory,
            QuotaExceeded { .. } | ReservationTooLarge { .. } => GmmStatus::QuotaExceeded,
            NoContiguousSpace { .. } => GmmStatus::NoContiguousSpace,
            NotOwner { .. } => GmmStatus::NotOwner,
            DoubleFree { .. } | UnknownPage { .. } => GmmStatus::NotFound,
            UnknownChunk { .. } | UnknownVm { .. } | ModuleNotFound => GmmStatus::NotFound,
            VmNotReserved | AlreadyReserved | VmAlreadyRegistered { .. } => GmmStatus::WrongOrder,
            NotMapped { .. } => GmmStatus::NotMapped,
            BelowCurrentUsage { .. }
            | InsufficientPages { .. }
            | MayNotAllocate
            | FeatureDisabled
            | AccessDenied => GmmStatus::Denied,
            TooManyModules
            | TooManyRegions
            | BadModuleSize
            | ModuleNameTooLong
            | ModuleAddressClash => GmmStatus::SharedModule,
            Inconsistent { .. } => GmmStatus::InternalError,
            InvalidAccount
            | InvalidPolicy
            | InvalidPriority
            | InvalidParameter
            | InvalidPageState { .. }
            | InvalidLargePageSize { .. } => GmmStatus::InvalidParameter,
        }
    }
}

pub type GmmResult<T> = Result<T, GmmError>;

/// Subtract `n` from a counter that must never underflow.
///
/// An underflow means the books are wrong: debug builds stop right here,
/// release builds clamp to zero and shout.
pub(crate) fn sub_or_clamp<T>(counter: &mut T, n: T, what: &'static str)
where
    T: Copy + PartialOrd + core::ops::Sub<Output = T> + Default + core::fmt::Display,
{
    if *counter >= n {
        *counter = *counter - n;
    } else {
        debug_assert!(false, "counter underflow: {} ({} - {})", what, *counter, n);
        error!("{} underflow ({} - {}), clamping to 0", what, *counter, n);
        *counter = T::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(GmmError::OutOfIds.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(
            GmmError::NotOwner { page: 0x201 }.kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(GmmError::MayNotAllocate.kind(), ErrorKind::PolicyDenial);
        assert_eq!(
            GmmError::Inconsistent { what: "chunk free count" }.kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn status_reduction() {
        assert_eq!(
            GmmStatus::from(GmmError::QuotaExceeded {
                needed: 1,
                available: 0
            }),
            GmmStatus::QuotaExceeded
        );
        assert_eq!(
            GmmStatus::from(GmmError::DoubleFree { page: 0x200 }),
            GmmStatus::NotFound
        );
        assert_eq!(
            GmmStatus::from(GmmError::ModuleAddressClash),
            GmmStatus::SharedModule
        );
    }

    #[test]
    fn messages() {
        let e = GmmError::NotOwner { page: 0x201 };
        assert_eq!(e.to_string(), "Page 513 is owned by another VM.");
    }

    #[test]
    fn clamp_in_range() {
        let mut c: u64 = 5;
        sub_or_clamp(&mut c, 3, "test");
        assert_eq!(c, 2);
    }
}
