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

//! Structural checks over a whole hierarchy.

use core::fmt;

use super::access::{PhysicalAccess, TableRef};
use super::addr::VirtAddr;
use super::frame::PhysFrame;
use super::mode::PagingMode;
use super::page_table::PageTableFlags;
use super::walker::PageTableWalker;

/// A broken structural invariant of the page tables.
///
/// These are never recoverable: reporting one goes through [`fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A table that had to exist below a present entry was not there.
    MissingTable { addr: VirtAddr, level: usize },
    /// A non-root table has no present entry but is still linked.
    EmptyTable { frame: PhysFrame, level: usize },
    /// A table was about to be freed while entries in it were present.
    FreeingLiveTable { frame: PhysFrame },
    /// The hierarchy to be destroyed is loaded on some processor.
    DestroyingActive { root: PhysFrame, active_on: u64 },
    /// An address that must be page aligned reached the table layer.
    MisalignedAddress(VirtAddr),
    /// A leaf is marked copy-on-write but still writable.
    WritableCopyOnWrite(VirtAddr),
    /// A leaf carries flags its paging mode does not allow.
    IllegalLeafFlags {
        addr: VirtAddr,
        flags: PageTableFlags,
    },
    /// A processor reported an identifier that does not fit the activity
    /// masks.
    ProcessorIdOutOfRange(usize),
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTable { addr, level } => {
                write!(f, "missing level {} table for {:#x}", level, addr)
            }

            Self::EmptyTable { frame, level } => {
                write!(f, "empty level {} table {:?} is still linked", level, frame)
            }

            Self::FreeingLiveTable { frame } => {
                write!(f, "freeing table {:?} with present entries", frame)
            }

            Self::DestroyingActive { root, active_on } => write!(
                f,
                "destroying hierarchy {:?} active on cpus {:#b}",
                root, active_on
            ),

            Self::MisalignedAddress(addr) => write!(f, "misaligned address {:#x}", addr),
            Self::WritableCopyOnWrite(addr) => write!(f, "writable copy-on-write page {:#x}", addr),

            Self::IllegalLeafFlags { addr, flags } => {
                write!(f, "illegal flags {:?} on page {:#x}", flags, addr)
            }

            Self::ProcessorIdOutOfRange(id) => write!(f, "processor id {} out of range", id),
        }
    }
}

/// Reports an invariant violation and halts the kernel.
#[cold]
#[track_caller]
pub fn fatal(violation: InvariantViolation) -> ! {
    log::error!("vmm: invariant violation: {}", violation);
    panic!("vmm: {}", violation)
}

/// Counts of what a hierarchy holds in its user half.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HierarchyStats {
    /// Table pages, the root included.
    pub tables: usize,
    /// Present leaf entries.
    pub pages: usize,
}

fn verify_table<M: PagingMode, A: PhysicalAccess<M>>(
    walker: &PageTableWalker<'_, M, A>,
    table: TableRef,
    reserved: Option<usize>,
    stats: &mut HierarchyStats,
) -> Result<(), InvariantViolation> {
    let is_root = table.level == M::LEVELS - 1;
    let entries = walker.present_entries(table);

    stats.tables += 1;

    if !is_root && entries.is_empty() {
        return Err(InvariantViolation::EmptyTable {
            frame: table.frame,
            level: table.level,
        });
    }

    for (index, entry) in entries {
        if is_root && (M::is_kernel_slot(index) || Some(index) == reserved) {
            continue;
        }

        if table.level == 0 {
            let addr = VirtAddr::new(M::with_index(table.addr.as_u64(), 0, index));
            let flags = entry.flags();
            let allowed = M::LEAF_FLAGS | PageTableFlags::ACCESSED | PageTableFlags::DIRTY;

            if !allowed.contains(flags) {
                return Err(InvariantViolation::IllegalLeafFlags { addr, flags });
            }

            if flags.contains(PageTableFlags::COPY_ON_WRITE | PageTableFlags::WRITABLE) {
                return Err(InvariantViolation::WritableCopyOnWrite(addr));
            }

            stats.pages += 1;
            continue;
        }

        let child = walker
            .child(table, index, entry)
            .ok_or(InvariantViolation::MissingTable {
                addr: table.addr,
                level: table.level - 1,
            })?;

        verify_table(walker, child, reserved, stats)?;
    }

    Ok(())
}

/// Walks the user half of the hierarchy `walker` operates on and returns the
/// first structural violation found.
///
/// Root slots of the kernel half, and the slot `reserved` for the accessor,
/// are shared between hierarchies and are not descended into.
pub fn verify<M: PagingMode, A: PhysicalAccess<M>>(
    walker: &PageTableWalker<'_, M, A>,
    reserved: Option<usize>,
) -> Result<HierarchyStats, InvariantViolation> {
    let mut stats = HierarchyStats::default();

    verify_table(walker, walker.root_table(VirtAddr::zero()), reserved, &mut stats)?;
    Ok(stats)
}
