// Copyright (C) 2021-2024 The Aero Project Developers.
//
// This file is part of The Aero Project.
//
// Aero is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Aero is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Aero. If not, see <https://www.gnu.org/licenses/>.

//! Abstractions for virtual pages and physical frames.
//!
//! Only the default page size is supported: every table and every leaf
//! mapping describes exactly [`PAGE_SIZE`] bytes.

use core::fmt;
use core::ops::{Add, AddAssign};

use super::addr::{PhysAddr, VirtAddr};

/// The page size in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// The given address was not sufficiently aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressNotAligned;

impl fmt::Display for AddressNotAligned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the given address was not sufficiently aligned")
    }
}

/// A virtual memory page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct Page {
    start_address: VirtAddr,
}

impl Page {
    /// Returns the page that starts at the given virtual address.
    ///
    /// Returns an error if the address is not correctly aligned (i.e. is not a valid page start).
    #[inline]
    pub fn from_start_address(address: VirtAddr) -> Result<Self, AddressNotAligned> {
        if !address.is_aligned(PAGE_SIZE) {
            return Err(AddressNotAligned);
        }

        Ok(Page::containing_address(address))
    }

    /// Returns the page that contains the given virtual address.
    #[inline]
    pub fn containing_address(address: VirtAddr) -> Self {
        Page {
            start_address: address.align_down(PAGE_SIZE),
        }
    }

    /// Returns the start address of the page.
    #[inline]
    pub const fn start_address(self) -> VirtAddr {
        self.start_address
    }

    /// Returns a range of pages, exclusive `end`.
    #[inline]
    pub const fn range(start: Self, end: Self) -> PageRange {
        PageRange { start, end }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("Page({:#x})", self.start_address().as_u64()))
    }
}

impl Add<u64> for Page {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Page::containing_address(self.start_address() + rhs * PAGE_SIZE)
    }
}

impl AddAssign<u64> for Page {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

/// A range of pages with exclusive upper bound.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PageRange {
    /// The start of the range, inclusive.
    pub start: Page,
    /// The end of the range, exclusive.
    pub end: Page,
}

impl PageRange {
    /// Returns the number of pages in the range.
    #[inline]
    pub fn len(&self) -> usize {
        if self.start < self.end {
            ((self.end.start_address() - self.start.start_address()) / PAGE_SIZE) as usize
        } else {
            0
        }
    }

    /// Returns whether the range contains no pages.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl Iterator for PageRange {
    type Item = Page;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.start < self.end {
            let page = self.start;
            self.start += 1;
            Some(page)
        } else {
            None
        }
    }
}

impl fmt::Debug for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageRange")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

/// A physical memory frame.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct PhysFrame {
    start_address: PhysAddr,
}

impl PhysFrame {
    /// Returns the frame that starts at the given physical address.
    ///
    /// Returns an error if the address is not correctly aligned (i.e. is not a valid frame start).
    #[inline]
    pub fn from_start_address(address: PhysAddr) -> Result<Self, AddressNotAligned> {
        if !address.is_aligned(PAGE_SIZE) {
            return Err(AddressNotAligned);
        }

        Ok(PhysFrame::containing_address(address))
    }

    /// Returns the frame that contains the given physical address.
    #[inline]
    pub fn containing_address(address: PhysAddr) -> Self {
        PhysFrame {
            start_address: address.align_down(PAGE_SIZE),
        }
    }

    /// Returns the start address of the frame.
    #[inline]
    pub const fn start_address(self) -> PhysAddr {
        self.start_address
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!(
            "PhysFrame({:#x})",
            self.start_address().as_u64()
        ))
    }
}

/// The physical frame allocator the page-table code draws table pages from and
/// returns reclaimed pages to.
///
/// Implementations are expected to carry their own lock (like the kernel's
/// global locked frame allocator), so both methods take `&self`.
///
/// ## Safety
///
/// This trait is unsafe to implement because the implementer must guarantee that
/// the `allocate_frame` method returns only unique unused frames.
pub unsafe trait FrameAllocator: Sync {
    /// Allocate a frame and return it if possible.
    fn allocate_frame(&self) -> Option<PhysFrame>;

    /// Deallocate the given unused frame.
    fn deallocate_frame(&self, frame: PhysFrame);
}

/// What `unmap` does with the data frame that backed the removed translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreePolicy {
    /// The frame stays allocated; the caller owns it.
    Keep,
    /// The frame is returned to the frame allocator after the translation
    /// has been invalidated.
    Free,
}
