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

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::X86Processor;
    }
}

use crate::paging::{fatal, InvariantViolation, PhysFrame, VirtAddr};

/// Maximum number of processors the memory manager keeps track of.
pub const MAX_CPUS: usize = 64;

/// The per-processor operations the memory manager needs from the
/// architecture: the root register, the interrupt flag and the TLB.
///
/// Every method acts on the processor executing the call.
pub trait Processor: Sync {
    /// Returns the identifier of the executing processor. Identifiers are
    /// dense and smaller than 64.
    fn id(&self) -> usize;

    /// Returns the root table currently loaded in the translation root
    /// register (`CR3` on x86).
    fn read_root(&self) -> PhysFrame;

    /// Loads a new translation root. This flushes every non-global TLB entry.
    ///
    /// ## Safety
    /// The caller must guarantee that the new hierarchy maps the code and the
    /// stack that are executing.
    unsafe fn write_root(&self, root: PhysFrame);

    /// Returns whether maskable interrupts are enabled.
    fn interrupts_enabled(&self) -> bool;

    /// ## Safety
    /// Interrupts must be enabled again by the same code path.
    unsafe fn disable_interrupts(&self);

    /// ## Safety
    /// Enabling interrupts may run interrupt handlers on the current stack.
    unsafe fn enable_interrupts(&self);

    /// Invalidates the TLB entry of the page containing `addr`.
    fn flush_page(&self, addr: VirtAddr);

    /// Invalidates every non-global TLB entry.
    fn flush_all(&self);
}

/// Returns the identifier of the processor executing the call, which is
/// fatal if it does not fit below [`MAX_CPUS`].
#[inline]
pub(crate) fn current_cpu(cpu: &dyn Processor) -> usize {
    let id = cpu.id();

    if id >= MAX_CPUS {
        fatal(InvariantViolation::ProcessorIdOutOfRange(id));
    }

    id
}
