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

//! Strategies for reading and writing page-table pages by their physical
//! address.
//!
//! A table page is ordinary physical memory, so the mapper needs *some*
//! virtual address for it before it can touch its entries. Three ways of
//! getting one are provided:
//!
//! * [`DirectMap`]: all of physical memory is mapped at a fixed offset.
//! * [`TemporaryWindow`]: the frame is mapped into one of a few scratch pages
//!   for the duration of the access.
//! * [`RecursiveMap`]: one root slot points back at the root, which gives every
//!   table of the *active* hierarchy a fixed virtual address.

use core::marker::PhantomData;

use bit_field::BitField;
use spin::Mutex;

use super::addr::VirtAddr;
use super::frame::{PhysFrame, PAGE_SIZE};
use super::mode::PagingMode;
use super::page_table::{PageTableEntry, PageTableFlags, RawTable};

use crate::arch::Processor;
use crate::cmdline::AccessStrategy;
use crate::utils::sync::IrqGuard;

/// Identifies one table of a hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    /// Root of the hierarchy the table belongs to.
    pub root: PhysFrame,
    /// The table page itself.
    pub frame: PhysFrame,
    /// Level of the table, `0` being the leaf table.
    pub level: usize,
    /// Any virtual address translated through this table.
    pub addr: VirtAddr,
}

/// A way to reach page-table pages by their physical address.
///
/// ## Safety
/// Implementations must hand out a view of exactly the requested frame, and
/// the view must not outlive the closure it is passed to.
pub unsafe trait PhysicalAccess<M: PagingMode>: Sync {
    /// Runs `f` with a view of an arbitrary physical frame, whether or not it
    /// is part of any hierarchy.
    fn with_frame<R>(&self, frame: PhysFrame, f: impl FnOnce(&mut RawTable) -> R) -> R;

    /// Runs `f` with a view of a table that is linked into the hierarchy
    /// rooted at `table.root`.
    ///
    /// If [`requires_active_root`](Self::requires_active_root) returns `true`,
    /// that root must be the one loaded on the executing processor.
    #[inline]
    fn with_table<R>(&self, table: TableRef, f: impl FnOnce(&mut RawTable) -> R) -> R {
        self.with_frame(table.frame, f)
    }

    /// Returns whether [`with_table`](Self::with_table) only works on the
    /// active hierarchy.
    #[inline]
    fn requires_active_root(&self) -> bool {
        false
    }

    /// Returns the virtual address through which `table` is viewed, if that
    /// address is cached by the TLB and must be invalidated once the table is
    /// unlinked.
    #[inline]
    fn view_address(&self, _table: TableRef) -> Option<VirtAddr> {
        None
    }

    /// Returns the root slot this strategy reserves for itself, if any. The
    /// slot is never copied between hierarchies nor torn down with them.
    #[inline]
    fn reserved_slot(&self) -> Option<usize> {
        None
    }

    /// Prepares a freshly zeroed root before it is used for the first time.
    #[inline]
    fn prepare_root(&self, _root: PhysFrame) {}
}

/// All of physical memory is mapped, starting at `offset`.
///
/// This is how the kernel reaches page tables through its higher half direct
/// map.
#[derive(Debug, Clone, Copy)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    /// ## Safety
    /// Every physical frame handed to the memory manager must be mapped
    /// writable at `offset + frame.start_address()`.
    pub const unsafe fn new(offset: VirtAddr) -> Self {
        Self {
            offset: offset.as_u64(),
        }
    }

    #[inline]
    fn frame_to_pointer(&self, frame: PhysFrame) -> *mut RawTable {
        frame.start_address().as_u64().wrapping_add(self.offset) as usize as *mut RawTable
    }
}

unsafe impl<M: PagingMode> PhysicalAccess<M> for DirectMap {
    #[inline]
    fn with_frame<R>(&self, frame: PhysFrame, f: impl FnOnce(&mut RawTable) -> R) -> R {
        f(unsafe { &mut *self.frame_to_pointer(frame) })
    }
}

/// Allocation bitmap for the scratch pages of a [`TemporaryWindow`].
pub struct WindowSlots {
    map: Mutex<u64>,
    count: usize,
}

impl WindowSlots {
    pub const MAX: usize = 64;

    pub const fn new(count: usize) -> Self {
        assert!(count > 0 && count <= Self::MAX);

        Self {
            map: Mutex::new(0),
            count,
        }
    }

    /// Claims a free slot.
    pub fn try_acquire(&self) -> Option<usize> {
        let mut map = self.map.lock();

        let slot = (0..self.count).find(|slot| !map.get_bit(*slot))?;
        map.set_bit(slot, true);

        Some(slot)
    }

    pub fn release(&self, slot: usize) {
        let mut map = self.map.lock();

        debug_assert!(map.get_bit(slot), "window slot {} released twice", slot);
        map.set_bit(slot, false);
    }

    /// Returns the number of slots currently claimed.
    pub fn in_use(&self) -> usize {
        self.map.lock().count_ones() as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.count
    }
}

/// Maps frames into a small set of reserved kernel pages on demand.
///
/// The window pages are consecutive and translated by a single leaf table that
/// the kernel keeps mapped at a fixed address (`entries`).
pub struct TemporaryWindow<M: PagingMode> {
    base: VirtAddr,
    entries: *mut RawTable,
    first_index: usize,
    slots: WindowSlots,
    cpu: &'static dyn Processor,
    _mode: PhantomData<M>,
}

unsafe impl<M: PagingMode> Send for TemporaryWindow<M> {}
unsafe impl<M: PagingMode> Sync for TemporaryWindow<M> {}

impl<M: PagingMode> TemporaryWindow<M> {
    /// Creates a window of `slots` pages starting at `base`.
    ///
    /// ## Safety
    /// `entries` must point to the leaf table translating `base`, that table
    /// must stay mapped for the lifetime of the window, and the window pages
    /// must not be used by anything else.
    pub unsafe fn new(
        base: VirtAddr,
        entries: *mut RawTable,
        slots: usize,
        cpu: &'static dyn Processor,
    ) -> Self {
        let first_index = M::index(base, 0);

        assert!(base.is_aligned(PAGE_SIZE));
        assert!(first_index + slots <= M::ENTRIES);

        Self {
            base,
            entries,
            first_index,
            slots: WindowSlots::new(slots),
            cpu,
            _mode: PhantomData,
        }
    }

    #[inline]
    pub fn slot_address(&self, slot: usize) -> VirtAddr {
        self.base + slot as u64 * PAGE_SIZE
    }

    #[inline]
    pub fn slots(&self) -> &WindowSlots {
        &self.slots
    }

    /// Claims a slot. Must be called with interrupts disabled, and the slot
    /// must be released before they are enabled again.
    fn acquire(&self) -> usize {
        loop {
            match self.slots.try_acquire() {
                Some(slot) => return slot,
                None => core::hint::spin_loop(),
            }
        }
    }

    /// Points window page `slot` at `frame`.
    pub(crate) fn install(&self, slot: usize, frame: PhysFrame) {
        let entry = PageTableEntry::with_frame(
            frame,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );

        // SAFETY: `entries` is valid per the contract of `new`.
        unsafe { M::store(&mut *self.entries, self.first_index + slot, entry) }

        // The slot may last have been used on another processor.
        self.cpu.flush_page(self.slot_address(slot));
    }

    /// Unmaps window page `slot` and drops its stale translation.
    pub(crate) fn remove(&self, slot: usize) {
        unsafe {
            M::store(
                &mut *self.entries,
                self.first_index + slot,
                PageTableEntry::new(),
            )
        }

        self.cpu.flush_page(self.slot_address(slot));
    }
}

unsafe impl<M: PagingMode> PhysicalAccess<M> for TemporaryWindow<M> {
    fn with_frame<R>(&self, frame: PhysFrame, f: impl FnOnce(&mut RawTable) -> R) -> R {
        // The slot translation is only ever flushed locally, so the access
        // must not migrate.
        let _guard = IrqGuard::new(self.cpu);

        let slot = self.acquire();
        self.install(slot, frame);

        let ptr = self.slot_address(slot).as_u64() as usize as *mut RawTable;
        let result = f(unsafe { &mut *ptr });

        self.remove(slot);
        self.slots.release(slot);

        result
    }
}

/// Returns the virtual address at which the recursive self-map in root slot
/// `slot` exposes the level `level` table that translates `addr`.
///
/// The address repeats `slot` `level + 1` times at the top and then continues
/// with the upper indices of `addr`, so the hardware walk stops one step early
/// for every repetition.
pub fn recursive_table_address<M: PagingMode>(slot: usize, level: usize, addr: VirtAddr) -> VirtAddr {
    debug_assert!(level < M::LEVELS);

    let mut raw = 0u64;

    for position in (M::LEVELS - 1 - level..M::LEVELS).rev() {
        raw = M::with_index(raw, position, slot);
    }

    for (position, source) in (0..M::LEVELS - 1 - level).rev().zip((level + 1..M::LEVELS).rev()) {
        raw = M::with_index(raw, position, M::index(addr, source));
    }

    M::canonicalize(raw)
}

/// Reaches the tables of the active hierarchy through a recursive self-map.
///
/// Frames that are not linked into the active hierarchy yet (fresh tables,
/// tables of a clone under construction) go through a scratch window instead.
pub struct RecursiveMap<M: PagingMode> {
    slot: usize,
    scratch: TemporaryWindow<M>,
}

impl<M: PagingMode> RecursiveMap<M> {
    /// ## Safety
    /// Root slot `slot` of every hierarchy this accessor is used with must be
    /// reserved for the self-map, see [`PhysicalAccess::prepare_root`].
    pub unsafe fn new(slot: usize, scratch: TemporaryWindow<M>) -> Self {
        assert!(slot < M::ENTRIES);
        Self { slot, scratch }
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

unsafe impl<M: PagingMode> PhysicalAccess<M> for RecursiveMap<M> {
    #[inline]
    fn with_frame<R>(&self, frame: PhysFrame, f: impl FnOnce(&mut RawTable) -> R) -> R {
        self.scratch.with_frame(frame, f)
    }

    fn with_table<R>(&self, table: TableRef, f: impl FnOnce(&mut RawTable) -> R) -> R {
        let view = recursive_table_address::<M>(self.slot, table.level, table.addr);
        let ptr = view.as_u64() as usize as *mut RawTable;

        f(unsafe { &mut *ptr })
    }

    #[inline]
    fn requires_active_root(&self) -> bool {
        true
    }

    #[inline]
    fn view_address(&self, table: TableRef) -> Option<VirtAddr> {
        Some(recursive_table_address::<M>(
            self.slot, table.level, table.addr,
        ))
    }

    #[inline]
    fn reserved_slot(&self) -> Option<usize> {
        Some(self.slot)
    }

    fn prepare_root(&self, root: PhysFrame) {
        let entry = PageTableEntry::with_frame(
            root,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );

        self.with_frame(root, |table| M::store(table, self.slot, entry));
    }
}

/// Addresses the kernel set aside for the access strategies.
#[derive(Debug, Clone, Copy)]
pub struct AccessLayout {
    /// Start of the mapping of all physical memory.
    pub direct_map: VirtAddr,
    /// First page of the temporary window.
    pub window_base: VirtAddr,
    /// The leaf table translating the window pages.
    pub window_table: *mut RawTable,
}

/// The access strategy picked on the kernel command line.
pub enum Accessor<M: PagingMode> {
    Direct(DirectMap),
    Window(TemporaryWindow<M>),
    Recursive(RecursiveMap<M>),
}

impl<M: PagingMode> Accessor<M> {
    /// ## Safety
    /// `layout` must describe mappings that satisfy the contract of the
    /// constructor of the chosen strategy.
    pub unsafe fn new(
        strategy: AccessStrategy,
        window_slots: usize,
        layout: &AccessLayout,
        cpu: &'static dyn Processor,
    ) -> Self {
        log::debug!("vmm: {:?} access to page tables", strategy);

        let window = || TemporaryWindow::new(layout.window_base, layout.window_table, window_slots, cpu);

        match strategy {
            AccessStrategy::Direct => Self::Direct(DirectMap::new(layout.direct_map)),
            AccessStrategy::Window => Self::Window(window()),
            AccessStrategy::Recursive => Self::Recursive(RecursiveMap::new(M::RECURSIVE_SLOT, window())),
        }
    }
}

unsafe impl<M: PagingMode> PhysicalAccess<M> for Accessor<M> {
    fn with_frame<R>(&self, frame: PhysFrame, f: impl FnOnce(&mut RawTable) -> R) -> R {
        match self {
            Self::Direct(access) => PhysicalAccess::<M>::with_frame(access, frame, f),
            Self::Window(access) => access.with_frame(frame, f),
            Self::Recursive(access) => access.with_frame(frame, f),
        }
    }

    fn with_table<R>(&self, table: TableRef, f: impl FnOnce(&mut RawTable) -> R) -> R {
        match self {
            Self::Direct(access) => PhysicalAccess::<M>::with_table(access, table, f),
            Self::Window(access) => access.with_table(table, f),
            Self::Recursive(access) => access.with_table(table, f),
        }
    }

    fn requires_active_root(&self) -> bool {
        matches!(self, Self::Recursive(_))
    }

    fn view_address(&self, table: TableRef) -> Option<VirtAddr> {
        match self {
            Self::Recursive(access) => access.view_address(table),
            _ => None,
        }
    }

    fn reserved_slot(&self) -> Option<usize> {
        match self {
            Self::Recursive(access) => access.reserved_slot(),
            _ => None,
        }
    }

    fn prepare_root(&self, root: PhysFrame) {
        if let Self::Recursive(access) = self {
            access.prepare_root(root);
        }
    }
}
