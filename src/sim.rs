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

//! A simulated machine for the unit tests: a pool of physical frames backed
//! by host memory, a processor that records what is done to it and an IPI bus.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::address_space::{AddressSpace, Vmm};
use crate::arch::Processor;
use crate::cmdline::VmmConfig;
use crate::paging::*;
use crate::tlb::{IpiSender, LocalInvalidator};

/// Physical address of the first frame of the pool. Frames below it can be
/// mapped as data but never dereferenced.
const POOL_BASE: u64 = 0x8000_0000;

struct Pool {
    free: Vec<PhysFrame>,
    outstanding: usize,
    budget: usize,
    freed: Vec<PhysFrame>,
}

pub struct SimMemory {
    pages: *mut RawTable,
    count: usize,
    pool: Mutex<Pool>,
}

// The pages are only ever touched through the memory manager, which
// serializes access to every table.
unsafe impl Send for SimMemory {}
unsafe impl Sync for SimMemory {}

impl SimMemory {
    pub fn new(count: usize) -> Self {
        let pages = alloc::vec![RawTable([0; 512]); count].into_boxed_slice();
        let pages = Box::into_raw(pages) as *mut RawTable;

        let free = (0..count as u64)
            .rev()
            .map(|i| PhysFrame::containing_address(PhysAddr::new(POOL_BASE + i * PAGE_SIZE)))
            .collect();

        Self {
            pages,
            count,
            pool: Mutex::new(Pool {
                free,
                outstanding: 0,
                budget: usize::MAX,
                freed: Vec::new(),
            }),
        }
    }

    fn pool_index(&self, frame: PhysFrame) -> Option<usize> {
        let index = frame.start_address().as_u64().checked_sub(POOL_BASE)? / PAGE_SIZE;
        (index < self.count as u64).then_some(index as usize)
    }

    fn page(&self, frame: PhysFrame) -> &mut RawTable {
        let index = self
            .pool_index(frame)
            .unwrap_or_else(|| panic!("{:?} is not backed by the pool", frame));

        unsafe { &mut *self.pages.add(index) }
    }

    /// An accessor that reaches every pool frame.
    pub fn direct_map(&self) -> DirectMap {
        let offset = (self.pages as u64).wrapping_sub(POOL_BASE);
        unsafe { DirectMap::new(VirtAddr::new(offset)) }
    }

    /// Allocates a frame from the pool and clears it.
    pub fn zeroed_frame(&self) -> PhysFrame {
        let frame = self.allocate_frame().expect("frame pool exhausted");
        self.page(frame).zero();
        frame
    }

    /// Number of pool frames currently handed out.
    pub fn allocated(&self) -> usize {
        self.pool.lock().outstanding
    }

    /// Lets `count` more allocations succeed; every one after that fails.
    pub fn fail_after(&self, count: usize) {
        self.pool.lock().budget = count;
    }

    /// Every frame returned so far, pool or not, in order.
    pub fn freed(&self) -> Vec<PhysFrame> {
        self.pool.lock().freed.clone()
    }

    pub fn entry<M: PagingMode>(&self, frame: PhysFrame, index: usize) -> PageTableEntry {
        M::load(self.page(frame), index)
    }
}

unsafe impl FrameAllocator for SimMemory {
    fn allocate_frame(&self) -> Option<PhysFrame> {
        let mut pool = self.pool.lock();

        if pool.budget == 0 {
            return None;
        }

        let frame = pool.free.pop()?;

        pool.budget = pool.budget.saturating_sub(1);
        pool.outstanding += 1;

        // Stale contents, so that a missing clear shows up.
        self.page(frame).0 = [u64::MAX; 512];
        Some(frame)
    }

    fn deallocate_frame(&self, frame: PhysFrame) {
        let mut pool = self.pool.lock();
        pool.freed.push(frame);

        if self.pool_index(frame).is_some() {
            assert!(!pool.free.contains(&frame), "double free of {:?}", frame);

            pool.free.push(frame);
            pool.outstanding -= 1;
        }
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        let pages = core::ptr::slice_from_raw_parts_mut(self.pages, self.count);
        drop(unsafe { Box::from_raw(pages) });
    }
}

struct CpuState {
    id: usize,
    root: PhysFrame,
    interrupts: bool,
    flushed: Vec<VirtAddr>,
    full_flushes: usize,
    root_writes: usize,
    root_writes_with_interrupts: usize,
}

pub struct SimProcessor {
    state: Mutex<CpuState>,
}

impl SimProcessor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CpuState {
                id: 0,
                root: PhysFrame::containing_address(PhysAddr::new(0)),
                interrupts: false,
                flushed: Vec::new(),
                full_flushes: 0,
                root_writes: 0,
                root_writes_with_interrupts: 0,
            }),
        }
    }

    /// Pretends to be processor `id` from now on.
    pub fn set_id(&self, id: usize) {
        self.state.lock().id = id;
    }

    /// Loads `root` without counting it as a root write.
    pub fn set_root(&self, root: PhysFrame) {
        self.state.lock().root = root;
    }

    pub fn set_interrupts(&self, enabled: bool) {
        self.state.lock().interrupts = enabled;
    }

    pub fn flushed_pages(&self) -> Vec<VirtAddr> {
        self.state.lock().flushed.clone()
    }

    pub fn clear_flushes(&self) {
        let mut state = self.state.lock();

        state.flushed.clear();
        state.full_flushes = 0;
    }

    pub fn full_flushes(&self) -> usize {
        self.state.lock().full_flushes
    }

    pub fn root_writes(&self) -> usize {
        self.state.lock().root_writes
    }

    pub fn root_writes_with_interrupts(&self) -> usize {
        self.state.lock().root_writes_with_interrupts
    }
}

impl Default for SimProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for SimProcessor {
    fn id(&self) -> usize {
        self.state.lock().id
    }

    fn read_root(&self) -> PhysFrame {
        self.state.lock().root
    }

    unsafe fn write_root(&self, root: PhysFrame) {
        let mut state = self.state.lock();

        state.root = root;
        state.root_writes += 1;

        if state.interrupts {
            state.root_writes_with_interrupts += 1;
        }
    }

    fn interrupts_enabled(&self) -> bool {
        self.state.lock().interrupts
    }

    unsafe fn disable_interrupts(&self) {
        self.state.lock().interrupts = false;
    }

    unsafe fn enable_interrupts(&self) {
        self.state.lock().interrupts = true;
    }

    fn flush_page(&self, addr: VirtAddr) {
        self.state.lock().flushed.push(addr);
    }

    fn flush_all(&self) {
        self.state.lock().full_flushes += 1;
    }
}

#[derive(Default)]
pub struct SimIpi {
    sent: Mutex<Vec<u64>>,
}

impl SimIpi {
    /// The target masks of every shootdown sent so far.
    pub fn sent(&self) -> Vec<u64> {
        self.sent.lock().clone()
    }
}

impl IpiSender for SimIpi {
    fn send_tlb_shootdown(&self, targets: u64) {
        self.sent.lock().push(targets);
    }
}

/// A direct map that, like the recursive mapping, refuses to touch a table
/// of a hierarchy that is not loaded.
///
/// Built with [`self_mapped`](Self::self_mapped) it also reserves a root slot
/// and points it back at the root, the way the recursive mapping does.
pub struct ActiveOnly<'a> {
    inner: DirectMap,
    cpu: &'a SimProcessor,
    reserved: Option<usize>,
    touched_with_interrupts: Mutex<Vec<PhysFrame>>,
}

impl<'a> ActiveOnly<'a> {
    pub fn new(inner: DirectMap, cpu: &'a SimProcessor) -> Self {
        Self {
            inner,
            cpu,
            reserved: None,
            touched_with_interrupts: Mutex::new(Vec::new()),
        }
    }

    pub fn self_mapped(inner: DirectMap, cpu: &'a SimProcessor, slot: usize) -> Self {
        Self {
            reserved: Some(slot),
            ..Self::new(inner, cpu)
        }
    }

    /// Every frame that was reached while interrupts were enabled.
    pub fn touched_with_interrupts(&self) -> Vec<PhysFrame> {
        self.touched_with_interrupts.lock().clone()
    }
}

unsafe impl<M: PagingMode> PhysicalAccess<M> for ActiveOnly<'_> {
    fn with_frame<R>(&self, frame: PhysFrame, f: impl FnOnce(&mut RawTable) -> R) -> R {
        if self.cpu.interrupts_enabled() {
            self.touched_with_interrupts.lock().push(frame);
        }

        <DirectMap as PhysicalAccess<M>>::with_frame(&self.inner, frame, f)
    }

    fn with_table<R>(&self, table: TableRef, f: impl FnOnce(&mut RawTable) -> R) -> R {
        assert_eq!(
            self.cpu.read_root(),
            table.root,
            "table of an inactive hierarchy"
        );

        <DirectMap as PhysicalAccess<M>>::with_frame(&self.inner, table.frame, f)
    }

    fn requires_active_root(&self) -> bool {
        true
    }

    fn view_address(&self, table: TableRef) -> Option<VirtAddr> {
        Some(recursive_table_address::<M>(
            self.reserved.unwrap_or(M::RECURSIVE_SLOT),
            table.level,
            table.addr,
        ))
    }

    fn reserved_slot(&self) -> Option<usize> {
        self.reserved
    }

    fn prepare_root(&self, root: PhysFrame) {
        let Some(slot) = self.reserved else {
            return;
        };

        let entry = PageTableEntry::with_frame(
            root,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );

        <Self as PhysicalAccess<M>>::with_frame(self, root, |table| M::store(table, slot, entry));
    }
}

/// The pieces of a simulated machine, wired up with a kernel address space
/// whose root is loaded.
pub struct Env<'a, M: PagingMode> {
    pub memory: &'a SimMemory,
    pub cpu: &'a SimProcessor,
    pub access: &'a DirectMap,
    pub tlb: &'a LocalInvalidator<'a>,
    pub kernel: &'a AddressSpace<M>,
}

impl<'a, M: PagingMode> Env<'a, M> {
    /// A memory manager that verifies every hierarchy after each change.
    pub fn vmm(&self) -> Vmm<'a, M, DirectMap> {
        self.vmm_with(VmmConfig {
            verify: true,
            ..VmmConfig::new()
        })
    }

    pub fn vmm_with(&self, config: VmmConfig) -> Vmm<'a, M, DirectMap> {
        Vmm::new(self.access, self.memory, self.cpu, self.tlb, self.kernel, config)
    }
}

/// Runs `f` on a fresh machine with `frames` physical frames.
pub fn run<M: PagingMode>(frames: usize, f: impl FnOnce(&Env<'_, M>)) {
    let memory = SimMemory::new(frames);
    let cpu = SimProcessor::new();
    let tlb = LocalInvalidator::new(&cpu);
    let access = memory.direct_map();

    let root = memory.zeroed_frame();
    let kernel = unsafe { AddressSpace::<M>::adopt(root) };
    cpu.set_root(root);

    f(&Env {
        memory: &memory,
        cpu: &cpu,
        access: &access,
        tlb: &tlb,
        kernel: &kernel,
    });
}
