// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Page descriptors exchanged with the allocator.
//!
//! The address and the zeroed flag share one 64-bit word: bits 0..63 hold
//! the address, bit 63 the flag. We pack and unpack it by hand so the wire
//! format does not depend on any compiler's bit-field layout.

use bit_field::BitField;
use serde::{Deserialize, Serialize};

use crate::{PageId, NIL_GMMPAGEDESC_PHYS, NIL_GMM_PAGEID};

const PHYS_BITS: core::ops::Range<usize> = 0..63;
const ZEROED_BIT: usize = 63;

/// Descriptor for one page in an allocation or handy-page request.
///
/// On input `phys` is a guest physical address (or one of the NIL /
/// unshareable markers), on output it is the host physical address.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct GmmPageDesc {
    phys_and_zeroed: u64,
    /// The page id, NIL if not yet allocated.
    pub id_page: PageId,
    /// A shared page this VM should let go of, NIL if none.
    pub id_shared_page: PageId,
}

static_assertions::assert_eq_size!(GmmPageDesc, [u8; 16]);

impl GmmPageDesc {
    pub const SIZE: usize = 16;

    /// A descriptor asking for a fresh page without any guest address.
    pub const fn nil() -> GmmPageDesc {
        GmmPageDesc {
            phys_and_zeroed: NIL_GMMPAGEDESC_PHYS,
            id_page: NIL_GMM_PAGEID,
            id_shared_page: NIL_GMM_PAGEID,
        }
    }

    pub fn new(phys: u64, id_page: PageId, id_shared_page: PageId) -> GmmPageDesc {
        let mut desc = GmmPageDesc::nil();
        desc.set_phys(phys);
        desc.id_page = id_page;
        desc.id_shared_page = id_shared_page;
        desc
    }

    /// The 63-bit address part.
    pub fn phys(&self) -> u64 {
        self.phys_and_zeroed.get_bits(PHYS_BITS)
    }

    /// Set the address part.
    ///
    /// # Panics
    /// If `phys` does not fit in 63 bits.
    pub fn set_phys(&mut self, phys: u64) {
        self.phys_and_zeroed.set_bits(PHYS_BITS, phys);
    }

    /// Is the page known to contain only zeroes?
    pub fn zeroed(&self) -> bool {
        self.phys_and_zeroed.get_bit(ZEROED_BIT)
    }

    pub fn set_zeroed(&mut self, zeroed: bool) {
        self.phys_and_zeroed.set_bit(ZEROED_BIT, zeroed);
    }

    /// Does this descriptor hold nothing at all (the form expected for
    /// entries that should receive a newly allocated page)?
    pub fn is_nil(&self) -> bool {
        self.phys_and_zeroed == NIL_GMMPAGEDESC_PHYS
            && self.id_page == NIL_GMM_PAGEID
            && self.id_shared_page == NIL_GMM_PAGEID
    }

    /// Serialize to the little-endian wire format.
    pub fn to_bytes(&self) -> [u8; GmmPageDesc::SIZE] {
        let mut buf = [0u8; GmmPageDesc::SIZE];
        buf[0..8].copy_from_slice(&self.phys_and_zeroed.to_le_bytes());
        buf[8..12].copy_from_slice(&self.id_page.to_le_bytes());
        buf[12..16].copy_from_slice(&self.id_shared_page.to_le_bytes());
        buf
    }

    /// Deserialize from the little-endian wire format.
    pub fn from_bytes(buf: &[u8; GmmPageDesc::SIZE]) -> GmmPageDesc {
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[0..8]);
        let mut page = [0u8; 4];
        page.copy_from_slice(&buf[8..12]);
        let mut shared = [0u8; 4];
        shared.copy_from_slice(&buf[12..16]);

        GmmPageDesc {
            phys_and_zeroed: u64::from_le_bytes(word),
            id_page: u32::from_le_bytes(page),
            id_shared_page: u32::from_le_bytes(shared),
        }
    }
}

impl Default for GmmPageDesc {
    fn default() -> Self {
        GmmPageDesc::nil()
    }
}

impl core::fmt::Debug for GmmPageDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("GmmPageDesc")
            .field("phys", &format_args!("{:#x}", self.phys()))
            .field("zeroed", &self.zeroed())
            .field("id_page", &format_args!("{:#x}", self.id_page))
            .field("id_shared_page", &format_args!("{:#x}", self.id_shared_page))
            .finish()
    }
}

/// Descriptor for one page in a free request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct GmmFreePageDesc {
    pub id_page: PageId,
}

static_assertions::assert_eq_size!(GmmFreePageDesc, u32);

impl From<PageId> for GmmFreePageDesc {
    fn from(id_page: PageId) -> Self {
        GmmFreePageDesc { id_page }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GMM_GCPHYS_UNSHAREABLE;

    #[test]
    fn field_layout() {
        assert_eq!(memoffset::offset_of!(GmmPageDesc, phys_and_zeroed), 0);
        assert_eq!(memoffset::offset_of!(GmmPageDesc, id_page), 8);
        assert_eq!(memoffset::offset_of!(GmmPageDesc, id_shared_page), 12);
        assert_eq!(memoffset::offset_of!(GmmFreePageDesc, id_page), 0);
    }

    #[test]
    fn nil_descriptor() {
        let d = GmmPageDesc::nil();
        assert!(d.is_nil());
        assert!(!d.zeroed());
        assert_eq!(d.phys(), NIL_GMMPAGEDESC_PHYS);
        assert_eq!(GmmPageDesc::default(), d);

        let mut z = d;
        z.set_zeroed(true);
        assert!(!z.is_nil());
    }

    #[test]
    fn zeroed_flag_is_bit_63() {
        let mut d = GmmPageDesc::new(0x1234_5000, 7, 0);
        d.set_zeroed(true);
        assert_eq!(d.phys(), 0x1234_5000);

        let bytes = d.to_bytes();
        assert_eq!(bytes[7], 0x80);
        assert_eq!(&bytes[0..4], &[0x00, 0x50, 0x34, 0x12]);
        assert_eq!(&bytes[8..12], &[7, 0, 0, 0]);

        d.set_zeroed(false);
        assert_eq!(d.to_bytes()[7], 0x00);
    }

    #[test]
    fn wire_format() {
        let mut d = GmmPageDesc::new(GMM_GCPHYS_UNSHAREABLE, 0xabcd, 0x1ff);
        d.set_zeroed(true);
        let back = GmmPageDesc::from_bytes(&d.to_bytes());
        assert_eq!(back, d);
        assert_eq!(back.phys(), GMM_GCPHYS_UNSHAREABLE);
        assert!(back.zeroed());
    }

    #[test]
    #[should_panic]
    /// Addresses are limited to 63 bits.
    fn phys_too_wide() {
        let mut d = GmmPageDesc::nil();
        d.set_phys(1 << 63);
    }
}
