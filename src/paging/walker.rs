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

use core::marker::PhantomData;

use alloc::vec::Vec;

use super::access::{PhysicalAccess, TableRef};
use super::addr::VirtAddr;
use super::frame::{FrameAllocator, PhysFrame};
use super::mode::PagingMode;
use super::page_table::{PageTableEntry, PageTableFlags};
use super::MAX_LEVELS;

/// One entry of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub table: TableRef,
    pub index: usize,
}

/// The slots visited by a walk, from the root downwards.
///
/// The walk stops at the first entry that is not present, so the path reaches
/// the leaf entry only if every intermediate table exists.
#[derive(Debug, Clone, Copy)]
pub struct Path {
    slots: [Option<Slot>; MAX_LEVELS],
    len: usize,
    levels: usize,
}

impl Path {
    fn push(&mut self, slot: Slot) {
        self.slots[self.len] = Some(slot);
        self.len += 1;
    }

    /// Returns the slot of the given level, if the walk got that far.
    #[inline]
    pub fn at_level(&self, level: usize) -> Option<Slot> {
        let depth = self.levels.checked_sub(level + 1)?;

        if depth < self.len {
            self.slots[depth]
        } else {
            None
        }
    }

    /// Returns the leaf slot if every intermediate table is present.
    #[inline]
    pub fn leaf(&self) -> Option<Slot> {
        self.at_level(0)
    }
}

/// A table that was unlinked from its parent and must be freed once every
/// processor has dropped translations through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadTable {
    pub frame: PhysFrame,
    /// Virtual address the accessor viewed the table through, if it has one.
    pub view: Option<VirtAddr>,
}

/// The tables emptied by one unmap, leaf table first.
#[derive(Debug, Clone, Copy)]
pub struct DeadTables {
    tables: [Option<DeadTable>; MAX_LEVELS],
    len: usize,
}

impl DeadTables {
    pub const fn new() -> Self {
        Self {
            tables: [None; MAX_LEVELS],
            len: 0,
        }
    }

    fn push(&mut self, table: DeadTable) {
        self.tables[self.len] = Some(table);
        self.len += 1;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = DeadTable> + '_ {
        self.tables[..self.len].iter().flatten().copied()
    }
}

impl Default for DeadTables {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum PageTableCreateError {
    FrameAllocationFailed,
}

/// Walks the hierarchy rooted at `root`, one level at a time.
pub struct PageTableWalker<'a, M: PagingMode, A: PhysicalAccess<M>> {
    access: &'a A,
    frames: &'a dyn FrameAllocator,
    root: PhysFrame,
    _mode: PhantomData<M>,
}

impl<'a, M: PagingMode, A: PhysicalAccess<M>> PageTableWalker<'a, M, A> {
    pub fn new(access: &'a A, frames: &'a dyn FrameAllocator, root: PhysFrame) -> Self {
        Self {
            access,
            frames,
            root,
            _mode: PhantomData,
        }
    }

    #[inline]
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    #[inline]
    pub fn access(&self) -> &'a A {
        self.access
    }

    #[inline]
    pub fn root_table(&self, addr: VirtAddr) -> TableRef {
        TableRef {
            root: self.root,
            frame: self.root,
            level: M::LEVELS - 1,
            addr,
        }
    }

    #[inline]
    pub fn load(&self, slot: Slot) -> PageTableEntry {
        self.access
            .with_table(slot.table, |table| M::load(table, slot.index))
    }

    #[inline]
    pub fn store(&self, slot: Slot, entry: PageTableEntry) {
        self.access
            .with_table(slot.table, |table| M::store(table, slot.index, entry))
    }

    /// Returns whether `table` has no present entry left.
    pub fn is_empty(&self, table: TableRef) -> bool {
        self.access.with_table(table, |table| {
            (0..M::ENTRIES).all(|index| !M::load(table, index).is_present())
        })
    }

    /// Returns the present entries of `table` with their indices.
    pub fn present_entries(&self, table: TableRef) -> Vec<(usize, PageTableEntry)> {
        self.access.with_table(table, |table| {
            (0..M::ENTRIES)
                .map(|index| (index, M::load(table, index)))
                .filter(|(_, entry)| entry.is_present())
                .collect()
        })
    }

    /// Returns the table referenced by the entry at `index` of `parent`.
    #[inline]
    pub fn child(&self, parent: TableRef, index: usize, entry: PageTableEntry) -> Option<TableRef> {
        let addr = VirtAddr::new(M::with_index(parent.addr.as_u64(), parent.level, index));

        self.next_table(Slot { table: parent, index }, entry)
            .map(|table| TableRef { addr, ..table })
    }

    /// Internal helper function to get the table an intermediate entry points to.
    #[inline]
    fn next_table(&self, slot: Slot, entry: PageTableEntry) -> Option<TableRef> {
        debug_assert!(slot.table.level > 0);

        let frame = entry.frame().ok()?;

        Some(TableRef {
            root: self.root,
            frame,
            level: slot.table.level - 1,
            addr: slot.table.addr,
        })
    }

    /// Looks up `addr` without modifying anything.
    pub fn resolve(&self, addr: VirtAddr) -> Path {
        let mut path = Path {
            slots: [None; MAX_LEVELS],
            len: 0,
            levels: M::LEVELS,
        };

        let mut table = self.root_table(addr);

        loop {
            let slot = Slot {
                table,
                index: M::index(addr, table.level),
            };

            path.push(slot);

            if table.level == 0 {
                break;
            }

            match self.next_table(slot, self.load(slot)) {
                Some(next) => table = next,
                None => break,
            }
        }

        path
    }

    /// Returns the leaf slot of `addr`, creating every missing intermediate
    /// table.
    ///
    /// All missing tables are allocated and zeroed before the first one is
    /// linked, so a failed allocation leaves the hierarchy untouched. Existing
    /// intermediate entries gain `parent_flags` if they lack any of them.
    pub fn resolve_or_create(
        &self,
        addr: VirtAddr,
        parent_flags: PageTableFlags,
    ) -> Result<Slot, PageTableCreateError> {
        let path = self.resolve(addr);

        if let Some(leaf) = path.leaf() {
            self.widen(&path, parent_flags);
            return Ok(leaf);
        }

        // The deepest slot reached holds a non-present entry; every level
        // below it needs a new table.
        let (last, missing) = match path.len.checked_sub(1).and_then(|i| path.slots[i]) {
            Some(slot) => (slot, slot.table.level),
            None => unreachable!("a walk always visits the root"),
        };

        // `fresh[k]` becomes the table of level `k`.
        let mut fresh = [self.root; MAX_LEVELS];

        for level in 0..missing {
            match self.frames.allocate_frame() {
                Some(frame) => {
                    self.access.with_frame(frame, |table| table.zero());
                    fresh[level] = frame;
                }

                None => {
                    for frame in &fresh[..level] {
                        self.frames.deallocate_frame(*frame);
                    }

                    log::debug!(
                        "vmm: out of frames creating tables for {:#x}",
                        addr.as_u64()
                    );

                    return Err(PageTableCreateError::FrameAllocationFailed);
                }
            }
        }

        // Link bottom-up; the parent living in the hierarchy is written last.
        for level in 1..missing {
            let entry = PageTableEntry::with_frame(fresh[level - 1], parent_flags);

            self.access.with_frame(fresh[level], |table| {
                M::store(table, M::index(addr, level), entry)
            });
        }

        self.widen(&path, parent_flags);
        self.store(last, PageTableEntry::with_frame(fresh[missing - 1], parent_flags));

        Ok(Slot {
            table: TableRef {
                root: self.root,
                frame: fresh[0],
                level: 0,
                addr,
            },
            index: M::index(addr, 0),
        })
    }

    /// Adds `flags` to the present intermediate entries of `path`.
    pub(crate) fn widen(&self, path: &Path, flags: PageTableFlags) {
        for level in 1..M::LEVELS {
            let Some(slot) = path.at_level(level) else {
                break;
            };

            let entry = self.load(slot);

            if entry.is_present() && !entry.flags().contains(flags) {
                let mut entry = entry;
                entry.set_flags(entry.flags() | flags);
                self.store(slot, entry);
            }
        }
    }

    /// Unlinks the tables of `path` that no longer have any present entry,
    /// starting at the leaf table and moving up.
    ///
    /// The root is never unlinked, and neither is any table referenced from a
    /// kernel slot of the root: those are shared with every other hierarchy.
    pub fn reclaim(&self, path: &Path) -> DeadTables {
        let mut dead = DeadTables::new();

        for level in 0..M::LEVELS - 1 {
            let (Some(slot), Some(parent)) = (path.at_level(level), path.at_level(level + 1))
            else {
                break;
            };

            if parent.table.level == M::LEVELS - 1 && M::is_kernel_slot(parent.index) {
                break;
            }

            if !self.is_empty(slot.table) {
                break;
            }

            let view = self.access.view_address(slot.table);

            self.store(parent, PageTableEntry::new());
            dead.push(DeadTable {
                frame: slot.table.frame,
                view,
            });
        }

        dead
    }
}

impl From<PageTableCreateError> for super::MapToError {
    #[inline]
    fn from(err: PageTableCreateError) -> Self {
        match err {
            PageTableCreateError::FrameAllocationFailed => super::MapToError::FrameAllocationFailed,
        }
    }
}
