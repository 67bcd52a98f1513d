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

use crate::arch::Processor;
use crate::paging::PhysFrame;

/// Helper guard structure used to lock interrupts. When dropped, interrupts
/// are enabled again if they were enabled when the guard was created.
pub struct IrqGuard<'a> {
    cpu: &'a dyn Processor,
    locked: bool,
}

impl<'a> IrqGuard<'a> {
    /// Creates a new IRQ guard. See the [`IrqGuard`] documentation for more.
    pub fn new(cpu: &'a dyn Processor) -> Self {
        let locked = cpu.interrupts_enabled();

        unsafe {
            cpu.disable_interrupts();
        }

        Self { cpu, locked }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        if self.locked {
            unsafe { self.cpu.enable_interrupts() }
        }
    }
}

/// Temporarily loads another hierarchy into the root register of the
/// executing processor.
///
/// Interrupts stay disabled for the whole lifetime of the guard, and the
/// previous root is loaded again before they are re-enabled.
pub struct RootSwitch<'a> {
    cpu: &'a dyn Processor,
    previous: PhysFrame,
    // Dropped after `Drop::drop` has restored the previous root.
    _irq: IrqGuard<'a>,
}

impl<'a> RootSwitch<'a> {
    /// ## Safety
    /// `root` must map the kernel half exactly like the active hierarchy does.
    pub unsafe fn enter(cpu: &'a dyn Processor, root: PhysFrame) -> Self {
        let irq = IrqGuard::new(cpu);
        let previous = cpu.read_root();

        if previous != root {
            log::trace!("vmm: switching root {:?} -> {:?}", previous, root);
            cpu.write_root(root);
        }

        Self {
            cpu,
            previous,
            _irq: irq,
        }
    }
}

impl Drop for RootSwitch<'_> {
    fn drop(&mut self) {
        if self.cpu.read_root() != self.previous {
            unsafe { self.cpu.write_root(self.previous) }
        }
    }
}
