// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Frames -- physical regions of host memory.

use core::fmt;

use super::utils::DataSize;
use super::{PAddr, BASE_PAGE_SIZE};

/// Physical region of host memory.
///
/// A frame is always aligned to a page-size.
/// A frame's size is a multiple of `BASE_PAGE_SIZE`.
///
/// The backing of every chunk is one frame of `LARGE_PAGE_SIZE`.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Frame {
    pub base: PAddr,
    pub size: usize,
}

impl Frame {
    /// Make a new Frame at `base` with `size`.
    pub fn new(base: PAddr, size: usize) -> Frame {
        assert_eq!(base % BASE_PAGE_SIZE as u64, 0);
        assert_eq!(size % BASE_PAGE_SIZE, 0);

        Frame { base, size }
    }

    /// Size of the region (in 4K pages).
    pub fn base_pages(&self) -> usize {
        self.size / BASE_PAGE_SIZE
    }

    /// Size of the region (in bytes).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> PAddr {
        self.base + self.size as u64
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Frame {{ 0x{:x} -- 0x{:x} (size = {}, pages = {}) }}",
            self.base,
            self.end(),
            DataSize::from_bytes(self.size),
            self.base_pages(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LARGE_PAGE_SIZE;

    #[test]
    fn chunk_frame() {
        let f = Frame::new(0x20_0000, LARGE_PAGE_SIZE);
        assert_eq!(f.base_pages(), 512);
        assert_eq!(f.size(), LARGE_PAGE_SIZE);
        assert_eq!(f.end(), 0x40_0000);
    }

    #[test]
    fn frame_debug() {
        let f = Frame::new(0x1000, 4096 * 2);
        assert_eq!(
            format!("{:?}", f),
            "Frame { 0x1000 -- 0x3000 (size = 8.00 KiB, pages = 2) }"
        );
    }

    #[test]
    #[should_panic]
    /// Frames should be aligned to BASE_PAGE_SIZE.
    fn frame_bad_alignment() {
        let _f = Frame::new(u64::MAX, BASE_PAGE_SIZE);
    }

    #[test]
    #[should_panic]
    /// Frames size should be multiple of BASE_PAGE_SIZE.
    fn frame_bad_size() {
        let _f = Frame::new(0x1000, 0x13);
    }
}
