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

//! The two supported paging schemes.
//!
//! Levels are numbered from the leaf upwards: level `0` is the table holding the
//! leaf entries and level `LEVELS - 1` is the root. Index `i` at level `l` selects
//! bits `12 + INDEX_BITS * l ..` of the virtual address.

use bit_field::BitField;

use super::addr::VirtAddr;
use super::page_table::{PageTableEntry, PageTableFlags, RawTable};

/// Describes the shape of a page-table hierarchy and how its entries are
/// encoded in a table page.
pub trait PagingMode: Sized + Send + Sync + 'static {
    /// Human readable name, used in log messages.
    const NAME: &'static str;
    /// Number of table levels, the root included.
    const LEVELS: usize;
    /// Number of entries in every table.
    const ENTRIES: usize;
    /// Number of virtual address bits consumed per level.
    const INDEX_BITS: usize;
    /// Flags a leaf entry may carry. Everything else is masked off by `map`.
    const LEAF_FLAGS: PageTableFlags;
    /// First root slot of the kernel half. Root slots at or above this index
    /// are shared by reference between every address space.
    const KERNEL_SLOT_START: usize;
    /// Root slot conventionally used for the recursive self-map.
    const RECURSIVE_SLOT: usize;
    /// Highest physical address an entry can reference.
    const PHYS_ADDR_LIMIT: u64;

    /// Reads entry `index` out of a table page.
    fn load(table: &RawTable, index: usize) -> PageTableEntry;

    /// Writes entry `index` of a table page. Flags the scheme cannot express
    /// are dropped.
    fn store(table: &mut RawTable, index: usize, entry: PageTableEntry);

    /// Returns whether `addr` can be translated by this scheme at all.
    fn is_valid(addr: VirtAddr) -> bool;

    /// Turns a raw composed address into the form the hardware expects.
    fn canonicalize(raw: u64) -> VirtAddr;

    /// Returns the table index of `addr` at the given level.
    #[inline]
    fn index(addr: VirtAddr, level: usize) -> usize {
        debug_assert!(level < Self::LEVELS);

        let shift = 12 + Self::INDEX_BITS * level;
        addr.as_u64().get_bits(shift..shift + Self::INDEX_BITS) as usize
    }

    /// Returns the number of bytes of address space covered by one entry at
    /// the given level.
    #[inline]
    fn entry_span(level: usize) -> u64 {
        1u64 << (12 + Self::INDEX_BITS * level)
    }

    /// Returns the (canonical) virtual address whose indices are `base`'s with
    /// the one at `level` replaced by `index`.
    #[inline]
    fn with_index(base: u64, level: usize, index: usize) -> u64 {
        let shift = 12 + Self::INDEX_BITS * level;
        let mut raw = base;
        raw.set_bits(shift..shift + Self::INDEX_BITS, index as u64);
        Self::canonicalize(raw).as_u64()
    }

    /// Returns whether the root slot `index` belongs to the kernel half.
    #[inline]
    fn is_kernel_slot(index: usize) -> bool {
        index >= Self::KERNEL_SLOT_START
    }

    /// Returns whether `addr` is translated through the kernel half.
    #[inline]
    fn is_kernel_address(addr: VirtAddr) -> bool {
        Self::is_kernel_slot(Self::index(addr, Self::LEVELS - 1))
    }
}

/// 32-bit paging: two levels of 1024 four-byte entries.
#[derive(Debug, Clone, Copy)]
pub enum TwoLevel {}

impl PagingMode for TwoLevel {
    const NAME: &'static str = "two-level";
    const LEVELS: usize = 2;
    const ENTRIES: usize = 1024;
    const INDEX_BITS: usize = 10;
    const LEAF_FLAGS: PageTableFlags = PageTableFlags::PRESENT
        .union(PageTableFlags::WRITABLE)
        .union(PageTableFlags::USER_ACCESSIBLE)
        .union(PageTableFlags::GLOBAL)
        .union(PageTableFlags::COPY_ON_WRITE)
        .union(PageTableFlags::SHARED)
        .union(PageTableFlags::NO_ACCESS);
    const KERNEL_SLOT_START: usize = 768;
    const RECURSIVE_SLOT: usize = 1023;
    const PHYS_ADDR_LIMIT: u64 = u32::MAX as u64;

    #[inline]
    fn load(table: &RawTable, index: usize) -> PageTableEntry {
        let words: &[u32] = bytemuck::cast_slice(&table.0);
        PageTableEntry::from_raw(words[index] as u64)
    }

    #[inline]
    fn store(table: &mut RawTable, index: usize, entry: PageTableEntry) {
        debug_assert!(entry.addr().as_u64() <= u32::MAX as u64);

        let words: &mut [u32] = bytemuck::cast_slice_mut(&mut table.0);
        let raw = entry.raw() & !PageTableFlags::NO_EXECUTE.bits();
        words[index] = raw as u32;
    }

    #[inline]
    fn is_valid(addr: VirtAddr) -> bool {
        addr.as_u64() <= u32::MAX as u64
    }

    #[inline]
    fn canonicalize(raw: u64) -> VirtAddr {
        VirtAddr::new(raw & u32::MAX as u64)
    }
}

/// 64-bit long mode paging: four levels of 512 eight-byte entries.
#[derive(Debug, Clone, Copy)]
pub enum FourLevel {}

impl PagingMode for FourLevel {
    const NAME: &'static str = "four-level";
    const LEVELS: usize = 4;
    const ENTRIES: usize = 512;
    const INDEX_BITS: usize = 9;
    const LEAF_FLAGS: PageTableFlags =
        TwoLevel::LEAF_FLAGS.union(PageTableFlags::NO_EXECUTE);
    const KERNEL_SLOT_START: usize = 256;
    const RECURSIVE_SLOT: usize = 510;
    const PHYS_ADDR_LIMIT: u64 = (1 << 52) - 1;

    #[inline]
    fn load(table: &RawTable, index: usize) -> PageTableEntry {
        PageTableEntry::from_raw(table.0[index])
    }

    #[inline]
    fn store(table: &mut RawTable, index: usize, entry: PageTableEntry) {
        table.0[index] = entry.raw();
    }

    /// Bits 48 to 64 must be copies of bit 47.
    #[inline]
    fn is_valid(addr: VirtAddr) -> bool {
        matches!(addr.as_u64().get_bits(47..64), 0 | 0x1ffff)
    }

    #[inline]
    fn canonicalize(raw: u64) -> VirtAddr {
        VirtAddr::new(((raw << 16) as i64 >> 16) as u64)
    }
}
