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

use super::access::PhysicalAccess;
use super::addr::{PhysAddr, VirtAddr};
use super::frame::{FrameAllocator, FreePolicy, Page, PhysFrame};
use super::mode::PagingMode;
use super::page_table::{PageTableEntry, PageTableFlags};
use super::walker::{DeadTables, PageTableWalker};

use crate::tlb::TlbInvalidator;

/// Provides methods for translating virtual addresses.
pub trait Translate {
    /// Return the frame that the given virtual address is mapped to and the offset within that
    /// frame.
    fn translate(&self, addr: VirtAddr) -> TranslateResult;

    /// Translates the given virtual address to the physical address that it maps to.
    ///
    /// Returns `None` if there is no valid mapping for the given address.
    #[inline]
    fn translate_addr(&self, addr: VirtAddr) -> Option<PhysAddr> {
        match self.translate(addr) {
            TranslateResult::NotMapped => None,
            TranslateResult::Mapped { frame, offset, .. } => Some(frame.start_address() + offset),
        }
    }
}

/// The return value of the [`Translate::translate`] function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateResult {
    /// The virtual address is mapped to a physical frame.
    Mapped {
        /// The mapped frame.
        frame: PhysFrame,
        /// The offset whithin the mapped frame.
        offset: u64,
        /// The entry flags in the lowest-level page table.
        flags: PageTableFlags,
    },
    /// The given virtual address is not mapped to a physical frame.
    NotMapped,
}

/// Which processors must drop a stale translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// The hierarchy is not active on any other processor.
    Local,
    /// The hierarchy might be cached by other processors.
    Broadcast,
}

/// This type represents a page whose mapping has changed in the page table.
///
/// The old mapping might be still cached in the translation lookaside buffer (TLB), so it needs
/// to be flushed from the TLB before it's accessed. This type is returned from function that
/// change the mapping of a page to ensure that the TLB flush is not forgotten.
#[derive(Debug)]
#[must_use = "Page Table changes must be flushed or ignored."]
pub struct MapperFlush {
    page: Page,
    stale: bool,
}

impl MapperFlush {
    /// Create a new flush promise
    #[inline]
    fn new(page: Page, stale: bool) -> Self {
        MapperFlush { page, stale }
    }

    #[inline]
    pub fn page(&self) -> Page {
        self.page
    }

    /// Returns whether a translation of the page could have been cached.
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Flush the page from the TLB to ensure that the newest mapping is used.
    #[inline]
    pub fn flush(self, tlb: &dyn TlbInvalidator, scope: FlushScope) {
        if !self.stale {
            return;
        }

        let addr = self.page.start_address();

        match scope {
            FlushScope::Local => tlb.invalidate_local(addr),
            FlushScope::Broadcast => tlb.invalidate_broadcast(addr, 1),
        }
    }

    /// Don't flush the TLB and silence the “must be used” warning.
    #[inline]
    pub fn ignore(self) {}
}

/// A translation removed by [`MappedPageTable::unmap`].
///
/// The frames it references are still owned by the caller until
/// [`Unmapped::finish`] has invalidated the translation and returned them.
#[derive(Debug)]
#[must_use = "unmapped pages must be flushed before their frames are reused"]
pub struct Unmapped {
    /// The frame that used to back the page.
    pub frame: PhysFrame,
    /// The flags the leaf entry had.
    pub flags: PageTableFlags,
    flush: MapperFlush,
    dead_tables: DeadTables,
}

impl Unmapped {
    /// Returns the tables that were unlinked because they became empty.
    #[inline]
    pub fn dead_tables(&self) -> &DeadTables {
        &self.dead_tables
    }

    /// Invalidates the removed translation and every view of the unlinked
    /// tables, then frees those tables and, if `policy` says so, the data frame.
    pub fn finish(
        self,
        tlb: &dyn TlbInvalidator,
        scope: FlushScope,
        frames: &dyn FrameAllocator,
        policy: FreePolicy,
    ) -> PhysFrame {
        self.flush.flush(tlb, scope);

        for table in self.dead_tables.iter() {
            if let Some(view) = table.view {
                match scope {
                    FlushScope::Local => tlb.invalidate_local(view),
                    FlushScope::Broadcast => tlb.invalidate_broadcast(view, 1),
                }
            }

            frames.deallocate_frame(table.frame);
        }

        if policy == FreePolicy::Free {
            frames.deallocate_frame(self.frame);
        }

        self.frame
    }
}

/// Flags every intermediate entry above a leaf with `leaf_flags` needs.
fn parent_flags(leaf_flags: PageTableFlags) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

    if leaf_flags.contains(PageTableFlags::USER_ACCESSIBLE) {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }

    flags
}

/// This error is returned from `map_to` and similar methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapToError {
    /// An additional frame was needed for the mapping process, but the frame allocator
    /// returned `None`.
    FrameAllocationFailed,
    /// The virtual address cannot be translated by the paging mode.
    InvalidAddress(VirtAddr),
    /// The frame cannot be referenced by an entry of the paging mode.
    InvalidFrameAddress(PhysAddr),
}

/// An error indicating that an `update_flags` call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagUpdateError {
    /// The given page is not mapped to a physical frame.
    PageNotMapped,
}

/// Installs and removes translations in one hierarchy.
pub struct MappedPageTable<'a, M: PagingMode, A: PhysicalAccess<M>> {
    page_table_walker: PageTableWalker<'a, M, A>,
}

impl<'a, M: PagingMode, A: PhysicalAccess<M>> MappedPageTable<'a, M, A> {
    /// ## Safety
    /// `root` must be the root of a valid hierarchy, and if `access` requires
    /// it, that hierarchy must be the active one for as long as the returned
    /// value is used.
    #[inline]
    pub unsafe fn new(access: &'a A, frames: &'a dyn FrameAllocator, root: PhysFrame) -> Self {
        Self {
            page_table_walker: PageTableWalker::new(access, frames, root),
        }
    }

    #[inline]
    pub fn walker(&self) -> &PageTableWalker<'a, M, A> {
        &self.page_table_walker
    }

    /// Creates a new mapping in the page table.
    ///
    /// `flags` are reduced to the subset a leaf may carry under `M` and
    /// `PRESENT` is forced. Missing intermediate tables are created with
    /// `PRESENT | WRITABLE`, plus `USER_ACCESSIBLE` for user mappings.
    ///
    /// The returned flush only has an effect if the page was already mapped.
    pub fn map_to(
        &self,
        page: Page,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<MapperFlush, MapToError> {
        let addr = page.start_address();

        if !M::is_valid(addr) {
            return Err(MapToError::InvalidAddress(addr));
        }

        if frame.start_address().as_u64() > M::PHYS_ADDR_LIMIT {
            return Err(MapToError::InvalidFrameAddress(frame.start_address()));
        }

        let flags = (flags & M::LEAF_FLAGS) | PageTableFlags::PRESENT;

        let slot = self
            .page_table_walker
            .resolve_or_create(addr, parent_flags(flags))?;

        let old = self.page_table_walker.load(slot);
        self.page_table_walker
            .store(slot, PageTableEntry::with_frame(frame, flags));

        Ok(MapperFlush::new(page, old.is_present()))
    }

    /// Removes a mapping from the page table.
    ///
    /// Returns `None` if the page was not mapped, in which case nothing was
    /// changed. Tables left without a present entry are unlinked and handed to
    /// the caller through [`Unmapped`]; they are not freed here.
    pub fn unmap(&self, page: Page) -> Option<Unmapped> {
        let addr = page.start_address();

        if !M::is_valid(addr) {
            return None;
        }

        let path = self.page_table_walker.resolve(addr);
        let leaf = path.leaf()?;
        let entry = self.page_table_walker.load(leaf);

        let frame = entry.frame().ok()?;

        self.page_table_walker.store(leaf, PageTableEntry::new());
        let dead_tables = self.page_table_walker.reclaim(&path);

        Some(Unmapped {
            frame,
            flags: entry.flags(),
            flush: MapperFlush::new(page, true),
            dead_tables,
        })
    }

    /// Updates the flags of an existing mapping, keeping its frame.
    pub fn update_flags(
        &self,
        page: Page,
        flags: PageTableFlags,
    ) -> Result<MapperFlush, FlagUpdateError> {
        let addr = page.start_address();

        if !M::is_valid(addr) {
            return Err(FlagUpdateError::PageNotMapped);
        }

        let path = self.page_table_walker.resolve(addr);
        let leaf = path.leaf().ok_or(FlagUpdateError::PageNotMapped)?;

        let mut entry = self.page_table_walker.load(leaf);

        if !entry.is_present() {
            return Err(FlagUpdateError::PageNotMapped);
        }

        let flags = (flags & M::LEAF_FLAGS) | PageTableFlags::PRESENT;

        self.page_table_walker.widen(&path, parent_flags(flags));

        entry.set_flags(flags);
        self.page_table_walker.store(leaf, entry);

        Ok(MapperFlush::new(page, true))
    }
}

impl<'a, M: PagingMode, A: PhysicalAccess<M>> Translate for MappedPageTable<'a, M, A> {
    fn translate(&self, addr: VirtAddr) -> TranslateResult {
        if !M::is_valid(addr) {
            return TranslateResult::NotMapped;
        }

        let Some(leaf) = self.page_table_walker.resolve(addr).leaf() else {
            return TranslateResult::NotMapped;
        };

        let entry = self.page_table_walker.load(leaf);

        match entry.frame() {
            Ok(frame) => TranslateResult::Mapped {
                frame,
                offset: addr.page_offset(),
                flags: entry.flags(),
            },

            Err(_) => TranslateResult::NotMapped,
        }
    }
}
