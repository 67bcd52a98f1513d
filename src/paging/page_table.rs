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

use core::fmt;

use static_assertions::const_assert_eq;

use super::addr::PhysAddr;
use super::frame::{PhysFrame, PAGE_SIZE};

bitflags::bitflags! {
    /// Possible flags for a page table entry.
    ///
    /// Bits 9 to 11 are ignored by the hardware and carry the software markers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct PageTableFlags: u64 {
        /// Specifies whether the mapped frame or page table is loaded in memory.
        const PRESENT =         1;
        /// Controls whether writes to the mapped frames are allowed.
        const WRITABLE =        1 << 1;
        /// Controls whether accesses from userspace (i.e. ring 3) are permitted.
        const USER_ACCESSIBLE = 1 << 2;
        /// Set by the CPU when the mapped frame or page table is accessed.
        const ACCESSED =        1 << 5;
        /// Set by the CPU on a write to the mapped frame.
        const DIRTY =           1 << 6;
        /// Indicates that the mapping is present in all address spaces, so it isn't flushed from
        /// the TLB on an address space switch.
        const GLOBAL =          1 << 8;
        /// The page is shared copy-on-write; the first write fault duplicates it.
        const COPY_ON_WRITE =   1 << 9;
        /// The page is shared between address spaces and must never be made copy-on-write.
        const SHARED =          1 << 10;
        /// The page is reserved (e.g. a guard page); any access is a fault.
        const NO_ACCESS =       1 << 11;
        /// Forbid code execution from the mapped frames.
        ///
        /// Only expressible by the four-level scheme.
        const NO_EXECUTE =      1 << 63;
    }
}

/// The error returned by the `PageTableEntry::frame` method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The entry does not have the `PRESENT` flag set, so it isn't currently mapped to a frame.
    FrameNotPresent,
}

/// A page table entry, widened to 64 bits regardless of the paging mode.
///
/// The paging mode decides how an entry is loaded from and stored into the
/// table page, see [`PagingMode::load`](super::PagingMode::load).
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// Creates an unused page table entry.
    #[inline]
    pub const fn new() -> Self {
        PageTableEntry { entry: 0 }
    }

    /// Creates an entry pointing at `frame` with the given flags.
    #[inline]
    pub fn with_frame(frame: PhysFrame, flags: PageTableFlags) -> Self {
        let mut entry = Self::new();
        entry.set_frame(frame, flags);
        entry
    }

    /// Wraps a raw entry value.
    #[inline]
    pub const fn from_raw(entry: u64) -> Self {
        PageTableEntry { entry }
    }

    /// Returns the raw entry value.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.entry
    }

    /// Returns whether this entry is zero.
    #[inline]
    pub const fn is_unused(&self) -> bool {
        self.entry == 0
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    /// Sets this entry to zero.
    #[inline]
    pub fn set_unused(&mut self) {
        self.entry = 0;
    }

    /// Returns the flags of this entry.
    #[inline]
    pub const fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.entry)
    }

    /// Returns the physical address mapped by this entry, might be zero.
    #[inline]
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.entry & Self::ADDRESS_MASK)
    }

    /// Returns the physical frame mapped by this entry.
    ///
    /// Returns the following errors:
    ///
    /// - `FrameError::FrameNotPresent` if the entry doesn't have the `PRESENT` flag set.
    #[inline]
    pub fn frame(&self) -> Result<PhysFrame, FrameError> {
        if !self.is_present() {
            Err(FrameError::FrameNotPresent)
        } else {
            Ok(PhysFrame::containing_address(self.addr()))
        }
    }

    /// Map the entry to the specified physical frame with the specified flags.
    #[inline]
    pub fn set_frame(&mut self, frame: PhysFrame, flags: PageTableFlags) {
        debug_assert!(frame.start_address().is_aligned(PAGE_SIZE));
        self.entry = frame.start_address().as_u64() | flags.bits();
    }

    /// Sets the flags of this entry, keeping the address.
    #[inline]
    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.entry = (self.entry & Self::ADDRESS_MASK) | flags.bits();
    }
}

impl Default for PageTableEntry {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut f = f.debug_struct("PageTableEntry");
        f.field("addr", &self.addr());
        f.field("flags", &self.flags());
        f.finish()
    }
}

/// One physical page of page-table memory, viewed as raw 64-bit words.
///
/// Both paging modes share this storage; the two-level mode reinterprets it as
/// 1024 32-bit entries.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct RawTable(pub(crate) [u64; 512]);

const_assert_eq!(core::mem::size_of::<RawTable>(), PAGE_SIZE as usize);
const_assert_eq!(core::mem::align_of::<RawTable>(), PAGE_SIZE as usize);

impl RawTable {
    /// Clears every word of the table page.
    #[inline]
    pub fn zero(&mut self) {
        self.0.fill(0);
    }
}
