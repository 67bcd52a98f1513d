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

//! Translation cache maintenance.
//!
//! Every change to a translation that might be cached must be followed by an
//! invalidation. [`LocalInvalidator`] only ever touches the executing processor
//! and is enough on a uniprocessor system. [`ShootdownInvalidator`] additionally
//! queues the pages for every other online processor and kicks them with an
//! inter-processor interrupt; the receivers drain their queue from
//! [`ShootdownInvalidator::handle_ipi`].
//!
//! The strategy is chosen once at boot with [`select_strategy`] and published
//! through [`install`].

use core::sync::atomic::{AtomicU64, Ordering};

use bit_field::BitField;
use spin::{Mutex, Once};

use crate::arch::{current_cpu, Processor};
use crate::cmdline::TlbPolicy;
use crate::paging::{VirtAddr, PAGE_SIZE};

pub use crate::arch::MAX_CPUS;

/// Ranges longer than this are invalidated with a full flush instead of page
/// by page.
pub const FLUSH_ALL_THRESHOLD: usize = 32;

/// Number of pages a processor can have queued before the queue collapses
/// into a full flush.
const PENDING_CAPACITY: usize = 16;

pub trait TlbInvalidator: Sync {
    /// Drops the translation of the page containing `addr` on the executing
    /// processor.
    fn invalidate_local(&self, addr: VirtAddr);

    /// Drops the translations of `count` pages starting at `addr` on every
    /// online processor, the executing one included.
    fn invalidate_broadcast(&self, addr: VirtAddr, count: usize);
}

/// Sends the TLB shootdown interrupt.
pub trait IpiSender: Sync {
    /// Interrupts every processor whose bit is set in `targets`.
    fn send_tlb_shootdown(&self, targets: u64);
}

fn flush_range(cpu: &dyn Processor, addr: VirtAddr, count: usize) {
    if count > FLUSH_ALL_THRESHOLD {
        cpu.flush_all();
        return;
    }

    for page in 0..count as u64 {
        cpu.flush_page(addr + page * PAGE_SIZE);
    }
}

/// Invalidates on the executing processor only.
pub struct LocalInvalidator<'a> {
    cpu: &'a dyn Processor,
}

impl<'a> LocalInvalidator<'a> {
    pub const fn new(cpu: &'a dyn Processor) -> Self {
        Self { cpu }
    }
}

impl TlbInvalidator for LocalInvalidator<'_> {
    #[inline]
    fn invalidate_local(&self, addr: VirtAddr) {
        self.cpu.flush_page(addr);
    }

    #[inline]
    fn invalidate_broadcast(&self, addr: VirtAddr, count: usize) {
        flush_range(self.cpu, addr, count);
    }
}

struct Pending {
    pages: [VirtAddr; PENDING_CAPACITY],
    len: usize,
    flush_all: bool,
}

impl Pending {
    const EMPTY: Self = Self {
        pages: [VirtAddr::zero(); PENDING_CAPACITY],
        len: 0,
        flush_all: false,
    };

    fn push(&mut self, addr: VirtAddr, count: usize) {
        if self.flush_all {
            return;
        }

        if count > FLUSH_ALL_THRESHOLD || self.len + count > PENDING_CAPACITY {
            self.flush_all = true;
            self.len = 0;
            return;
        }

        for page in 0..count {
            self.pages[self.len] = addr + page as u64 * PAGE_SIZE;
            self.len += 1;
        }
    }
}

/// Invalidates locally and then on every other online processor.
pub struct ShootdownInvalidator<'a> {
    cpu: &'a dyn Processor,
    ipi: &'a dyn IpiSender,
    online: AtomicU64,
    pending: [Mutex<Pending>; MAX_CPUS],
}

impl<'a> ShootdownInvalidator<'a> {
    pub const fn new(cpu: &'a dyn Processor, ipi: &'a dyn IpiSender) -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: Mutex<Pending> = Mutex::new(Pending::EMPTY);

        Self {
            cpu,
            ipi,
            online: AtomicU64::new(0),
            pending: [EMPTY; MAX_CPUS],
        }
    }

    /// Marks processor `id` as taking part (or not) in shootdowns.
    pub fn set_online(&self, id: usize, online: bool) {
        assert!(id < MAX_CPUS);

        let mask = 1u64 << id;

        if online {
            self.online.fetch_or(mask, Ordering::SeqCst);
        } else {
            self.online.fetch_and(!mask, Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn online_mask(&self) -> u64 {
        self.online.load(Ordering::SeqCst)
    }

    /// Drains the queue of the executing processor. Called from the TLB
    /// shootdown interrupt handler.
    ///
    /// Returns the number of pages that were invalidated one by one, or
    /// `None` if the whole TLB was flushed.
    pub fn handle_ipi(&self) -> Option<usize> {
        let id = current_cpu(self.cpu);

        let (pages, len, flush_all) = {
            let mut pending = self.pending[id].lock();
            let taken = (pending.pages, pending.len, pending.flush_all);

            *pending = Pending::EMPTY;
            taken
        };

        if flush_all {
            self.cpu.flush_all();
            return None;
        }

        for page in &pages[..len] {
            self.cpu.flush_page(*page);
        }

        Some(len)
    }
}

impl TlbInvalidator for ShootdownInvalidator<'_> {
    #[inline]
    fn invalidate_local(&self, addr: VirtAddr) {
        self.cpu.flush_page(addr);
    }

    fn invalidate_broadcast(&self, addr: VirtAddr, count: usize) {
        if count == 0 {
            return;
        }

        flush_range(self.cpu, addr, count);

        let mut targets = self.online_mask();
        targets.set_bit(current_cpu(self.cpu), false);

        if targets == 0 {
            return;
        }

        for id in (0..MAX_CPUS).filter(|id| targets.get_bit(*id)) {
            self.pending[id].lock().push(addr, count);
        }

        log::trace!(
            "tlb: shootdown of {} page(s) at {:#x} (targets={:#b})",
            count,
            addr.as_u64(),
            targets
        );

        self.ipi.send_tlb_shootdown(targets);
    }
}

/// The invalidation strategy picked at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbStrategy {
    Local,
    Shootdown,
}

/// Picks the invalidation strategy for a machine with `cpus` processors.
pub fn select_strategy(cpus: usize, policy: TlbPolicy) -> TlbStrategy {
    match policy {
        TlbPolicy::Auto if cpus > 1 => TlbStrategy::Shootdown,
        TlbPolicy::Auto => TlbStrategy::Local,
        TlbPolicy::Shootdown => TlbStrategy::Shootdown,

        TlbPolicy::Local if cpus > 1 => {
            log::warn!(
                "tlb: local invalidation requested on {} processors, using shootdowns",
                cpus
            );

            TlbStrategy::Shootdown
        }

        TlbPolicy::Local => TlbStrategy::Local,
    }
}

static INVALIDATOR: Once<&'static dyn TlbInvalidator> = Once::new();

/// Publishes the invalidator selected at boot. Only the first call has an
/// effect; the installed invalidator is returned.
pub fn install(invalidator: &'static dyn TlbInvalidator) -> &'static dyn TlbInvalidator {
    *INVALIDATOR.call_once(|| invalidator)
}

/// Returns the invalidator installed at boot, if any.
pub fn get() -> Option<&'static dyn TlbInvalidator> {
    INVALIDATOR.get().copied()
}
