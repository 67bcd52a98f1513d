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

//! The bare-metal [`Processor`] for x86 in long mode.

use core::arch::asm;
use core::sync::atomic::{AtomicU32, Ordering};

use raw_cpuid::CpuId;
use spin::Mutex;

use super::{Processor, MAX_CPUS};
use crate::paging::{PhysAddr, PhysFrame, VirtAddr};

const CR3_ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;
const RFLAGS_INTERRUPT_FLAG: u64 = 1 << 9;

#[inline]
fn read_cr3_raw() -> u64 {
    let value: u64;

    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }

    value
}

#[inline]
fn read_rflags() -> u64 {
    let value: u64;

    unsafe {
        asm!("pushf; pop {}", out(reg) value, options(nomem, preserves_flags));
    }

    value
}

/// Drives the processor that is executing the call.
///
/// Local APIC IDs are neither dense nor bounded, so every processor registers
/// itself once during bring-up with [`register`](Self::register) and is known
/// by its registration index from then on.
pub struct X86Processor {
    apic_ids: [AtomicU32; MAX_CPUS],
    count: Mutex<usize>,
}

impl X86Processor {
    #[allow(clippy::declare_interior_mutable_const)]
    const UNREGISTERED: AtomicU32 = AtomicU32::new(u32::MAX);

    pub const fn new() -> Self {
        Self {
            apic_ids: [Self::UNREGISTERED; MAX_CPUS],
            count: Mutex::new(0),
        }
    }

    fn apic_id() -> u32 {
        CpuId::new()
            .get_feature_info()
            .map(|info| info.initial_local_apic_id() as u32)
            .unwrap_or(0)
    }

    fn index_of(&self, apic_id: u32) -> Option<usize> {
        self.apic_ids
            .iter()
            .position(|id| id.load(Ordering::Acquire) == apic_id)
    }

    fn register_apic_id(&self, apic_id: u32) -> Option<usize> {
        let mut count = self.count.lock();

        if let Some(index) = self.index_of(apic_id) {
            return Some(index);
        }

        if *count == MAX_CPUS {
            return None;
        }

        let index = *count;

        self.apic_ids[index].store(apic_id, Ordering::Release);
        *count += 1;

        Some(index)
    }

    /// Assigns the executing processor the next free identifier and returns
    /// it. Registering a processor again returns its existing identifier.
    pub fn register(&self) -> Option<usize> {
        let apic_id = Self::apic_id();
        let index = self.register_apic_id(apic_id);

        match index {
            Some(index) => log::debug!("x86: apic {} is cpu {}", apic_id, index),
            None => log::warn!("x86: no room for apic {}", apic_id),
        }

        index
    }
}

impl Default for X86Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for X86Processor {
    /// Returns the registration index of the executing processor, or
    /// `usize::MAX` if it never registered.
    fn id(&self) -> usize {
        self.index_of(Self::apic_id()).unwrap_or(usize::MAX)
    }

    #[inline]
    fn read_root(&self) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(read_cr3_raw() & CR3_ADDRESS_MASK))
    }

    #[inline]
    unsafe fn write_root(&self, root: PhysFrame) {
        // Keep the PCID and cache control bits of the old value.
        let flags = read_cr3_raw() & !CR3_ADDRESS_MASK;
        let value = root.start_address().as_u64() | flags;

        asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
    }

    #[inline]
    fn interrupts_enabled(&self) -> bool {
        read_rflags() & RFLAGS_INTERRUPT_FLAG != 0
    }

    #[inline]
    unsafe fn disable_interrupts(&self) {
        asm!("cli", options(nomem, nostack));
    }

    #[inline]
    unsafe fn enable_interrupts(&self) {
        asm!("sti", options(nomem, nostack));
    }

    #[inline]
    fn flush_page(&self, addr: VirtAddr) {
        unsafe {
            asm!("invlpg [{}]", in(reg) addr.as_u64(), options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn flush_all(&self) {
        let value = read_cr3_raw();

        unsafe {
            asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apic_ids_get_dense_indices() {
        let cpu = X86Processor::new();

        assert_eq!(cpu.register_apic_id(200), Some(0));
        assert_eq!(cpu.register_apic_id(7), Some(1));
        assert_eq!(cpu.register_apic_id(200), Some(0));

        assert_eq!(cpu.index_of(7), Some(1));
        assert_eq!(cpu.index_of(8), None);
    }

    #[test]
    fn registry_is_bounded() {
        let cpu = X86Processor::new();

        for apic_id in 0..MAX_CPUS as u32 {
            assert_eq!(cpu.register_apic_id(apic_id * 2), Some(apic_id as usize));
        }

        assert_eq!(cpu.register_apic_id(1), None);
    }
}
