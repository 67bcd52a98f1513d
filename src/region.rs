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

use crate::paging::{fatal, InvariantViolation, Page, PageRange, PageTableFlags, VirtAddr, PAGE_SIZE};

/// A half-open range of virtual memory and the flags its pages are mapped
/// with, as handed down by the region layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub flags: PageTableFlags,
}

impl Region {
    /// ## Panics
    /// Panics if the bounds are not page aligned or `end < start`.
    pub fn new(start: VirtAddr, end: VirtAddr, flags: PageTableFlags) -> Self {
        assert!(start <= end);

        let region = Self { start, end, flags };
        region.check_aligned();
        region
    }

    /// Regions reach the table layer page aligned; anything else is fatal.
    pub(crate) fn check_aligned(&self) {
        for addr in [self.start, self.end] {
            if !addr.is_aligned(PAGE_SIZE) {
                fatal(InvariantViolation::MisalignedAddress(addr));
            }
        }
    }

    /// Returns every page of the region.
    #[inline]
    pub fn pages(&self) -> PageRange {
        Page::range(
            Page::containing_address(self.start),
            Page::containing_address(self.end),
        )
    }

    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Shared regions stay mapped in every address space that inherited them
    /// and are never made copy-on-write.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.flags.contains(PageTableFlags::SHARED)
    }
}
