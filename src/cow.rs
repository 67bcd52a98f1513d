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

//! Copy-on-write marking.
//!
//! A copy-on-write page is mapped read-only with [`PageTableFlags::COPY_ON_WRITE`]
//! set. The first write to it faults, and the fault handler gives the writer
//! its own copy.

use crate::address_space::{AddressSpace, Vmm};
use crate::paging::*;
use crate::region::Region;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowError {
    /// The region is shared between address spaces and must stay writable in
    /// all of them.
    SharedRegion,
}

impl<'a, M: PagingMode, A: PhysicalAccess<M>> Vmm<'a, M, A> {
    /// Makes every mapped page of `region` copy-on-write and returns how many
    /// pages are copy-on-write afterwards. Pages that are not mapped are
    /// skipped.
    pub fn mark_region_cow(
        &self,
        space: &AddressSpace<M>,
        region: &Region,
    ) -> Result<usize, CowError> {
        region.check_aligned();

        if region.is_shared() {
            return Err(CowError::SharedRegion);
        }

        self.mutate(space, |mapper| {
            let mut marked = 0;

            for page in region.pages() {
                let addr = page.start_address();

                let TranslateResult::Mapped { flags, .. } = mapper.translate(addr) else {
                    continue;
                };

                let cow = (flags | PageTableFlags::COPY_ON_WRITE) - PageTableFlags::WRITABLE;
                marked += 1;

                if cow == flags {
                    continue;
                }

                if let Ok(flush) = mapper.update_flags(page, cow) {
                    flush.flush(self.tlb(), self.scope(space, addr));
                }
            }

            log::trace!(
                "vmm: {} pages of {:#x}..{:#x} are copy-on-write",
                marked,
                region.start,
                region.end
            );

            Ok(marked)
        })
    }

    /// Returns whether `addr` is mapped copy-on-write in `space`.
    pub fn is_cow(&self, space: &AddressSpace<M>, addr: VirtAddr) -> bool {
        matches!(
            self.translate(space, addr),
            TranslateResult::Mapped { flags, .. } if flags.contains(PageTableFlags::COPY_ON_WRITE)
        )
    }
}
