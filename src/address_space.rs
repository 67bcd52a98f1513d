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

//! Address spaces and the operations on their hierarchies.
//!
//! Every [`AddressSpace`] owns the root of one hierarchy behind its own lock;
//! there is no global page-table lock. The [`Vmm`] bundles the collaborators
//! selected at boot (physical access strategy, frame allocator, processor and
//! TLB invalidator) and performs every operation under the lock of the space
//! it operates on.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::{current_cpu, Processor};
use crate::cmdline::{self, VmmConfig};
use crate::paging::*;
use crate::region::Region;
use crate::tlb::{self, TlbInvalidator};
use crate::utils::sync::{IrqGuard, RootSwitch};

/// This error is returned from [`Vmm::create_hierarchy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneError {
    /// A table page was needed but the frame allocator returned `None`.
    FrameAllocationFailed,
}

impl From<PageTableCreateError> for CloneError {
    #[inline]
    fn from(err: PageTableCreateError) -> Self {
        match err {
            PageTableCreateError::FrameAllocationFailed => CloneError::FrameAllocationFailed,
        }
    }
}

/// How [`Vmm::create_hierarchy`] populates the new hierarchy.
#[derive(Debug, Clone, Copy)]
pub enum CloneMode<'s, M: PagingMode> {
    /// Only the kernel half, shared by reference with the kernel space.
    Shallow,
    /// The kernel half plus a private copy of every user table of `source`.
    /// Leaves are copied as they are (data pages are shared) and then given
    /// the flags of the region they belong to.
    Deep {
        source: &'s AddressSpace<M>,
        regions: &'s [Region],
    },
}

struct Hierarchy {
    root: PhysFrame,
}

/// One page-table hierarchy.
pub struct AddressSpace<M: PagingMode> {
    hierarchy: Mutex<Hierarchy>,
    /// Bit `n` is set while the hierarchy is loaded on processor `n`.
    active_on: AtomicU64,
    _mode: PhantomData<M>,
}

impl<M: PagingMode> AddressSpace<M> {
    fn new(root: PhysFrame) -> Self {
        Self {
            hierarchy: Mutex::new(Hierarchy { root }),
            active_on: AtomicU64::new(0),
            _mode: PhantomData,
        }
    }

    /// Takes ownership of an existing hierarchy, typically the one built by
    /// the bootloader for the kernel.
    ///
    /// ## Safety
    /// `root` must be the root of a valid hierarchy that nothing else owns.
    pub unsafe fn adopt(root: PhysFrame) -> Self {
        Self::new(root)
    }

    #[inline]
    pub fn root(&self) -> PhysFrame {
        self.hierarchy.lock().root
    }

    /// Returns the set of processors the hierarchy is loaded on.
    #[inline]
    pub fn active_mask(&self) -> u64 {
        self.active_on.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active_mask() != 0
    }
}

impl<M: PagingMode> core::fmt::Debug for AddressSpace<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("mode", &M::NAME)
            .field("root", &self.root())
            .field("active_on", &format_args!("{:#b}", self.active_mask()))
            .finish()
    }
}

/// The virtual memory manager.
pub struct Vmm<'a, M: PagingMode, A: PhysicalAccess<M>> {
    access: &'a A,
    frames: &'a dyn FrameAllocator,
    cpu: &'a dyn Processor,
    tlb: &'a dyn TlbInvalidator,
    kernel: &'a AddressSpace<M>,
    config: VmmConfig,
}

impl<'a, M: PagingMode, A: PhysicalAccess<M>> Vmm<'a, M, A> {
    pub fn new(
        access: &'a A,
        frames: &'a dyn FrameAllocator,
        cpu: &'a dyn Processor,
        tlb: &'a dyn TlbInvalidator,
        kernel: &'a AddressSpace<M>,
        config: VmmConfig,
    ) -> Self {
        log::debug!(
            "vmm: {} paging, kernel root {:?}, verify={}",
            M::NAME,
            kernel.root(),
            config.verify
        );

        Self {
            access,
            frames,
            cpu,
            tlb,
            kernel,
            config,
        }
    }

    #[inline]
    pub fn kernel(&self) -> &'a AddressSpace<M> {
        self.kernel
    }

    #[inline]
    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    /// Makes `root` reachable through the accessor, switching the active root
    /// if the accessor can only reach the active hierarchy.
    fn enter(&self, root: PhysFrame) -> Option<RootSwitch<'a>> {
        if self.access.requires_active_root() && self.cpu.read_root() != root {
            // SAFETY: every hierarchy shares the kernel half with the kernel space.
            Some(unsafe { RootSwitch::enter(self.cpu, root) })
        } else {
            None
        }
    }

    fn with_root<R>(
        &self,
        root: PhysFrame,
        f: impl FnOnce(&MappedPageTable<'a, M, A>) -> R,
    ) -> R {
        let _switch = self.enter(root);

        // SAFETY: `root` is owned by an address space and, if the accessor
        // requires it, active for the lifetime of `_switch`.
        let mapper = unsafe { MappedPageTable::new(self.access, self.frames, root) };
        f(&mapper)
    }

    /// Runs `f` on the hierarchy of `space` with its lock held and interrupts
    /// disabled.
    pub(crate) fn with_mapper<R>(
        &self,
        space: &AddressSpace<M>,
        f: impl FnOnce(&MappedPageTable<'a, M, A>) -> R,
    ) -> R {
        let _irq = IrqGuard::new(self.cpu);
        let hierarchy = space.hierarchy.lock();

        self.with_root(hierarchy.root, f)
    }

    /// Like [`with_mapper`](Self::with_mapper), for operations that modify
    /// the hierarchy. Verifies the result if verification is enabled.
    pub(crate) fn mutate<R>(
        &self,
        space: &AddressSpace<M>,
        f: impl FnOnce(&MappedPageTable<'a, M, A>) -> R,
    ) -> R {
        self.with_mapper(space, |mapper| {
            let result = f(mapper);
            self.check(mapper);
            result
        })
    }

    fn check(&self, mapper: &MappedPageTable<'a, M, A>) {
        if !self.config.verify {
            return;
        }

        if let Err(violation) = verify(mapper.walker(), self.access.reserved_slot()) {
            fatal(violation);
        }
    }

    /// Returns which processors may hold a stale translation of `addr` in
    /// `space`.
    pub(crate) fn scope(&self, space: &AddressSpace<M>, addr: VirtAddr) -> FlushScope {
        let others = space.active_mask() & !(1u64 << current_cpu(self.cpu));

        if M::is_kernel_address(addr) || others != 0 {
            FlushScope::Broadcast
        } else {
            FlushScope::Local
        }
    }

    #[inline]
    pub(crate) fn tlb(&self) -> &'a dyn TlbInvalidator {
        self.tlb
    }

    /// Maps `page` to `frame` in `space`.
    pub fn map(
        &self,
        space: &AddressSpace<M>,
        page: Page,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapToError> {
        log::trace!("vmm: map {:?} -> {:?} ({:?})", page, frame, flags);

        self.mutate(space, |mapper| {
            let flush = mapper.map_to(page, frame, flags)?;
            flush.flush(self.tlb, self.scope(space, page.start_address()));

            Ok(())
        })
    }

    /// Removes the translation of `page` and returns the frame that backed it.
    ///
    /// Unmapping a page that is not mapped does nothing and returns `None`.
    pub fn unmap(
        &self,
        space: &AddressSpace<M>,
        page: Page,
        policy: FreePolicy,
    ) -> Option<PhysFrame> {
        log::trace!("vmm: unmap {:?} ({:?})", page, policy);

        self.mutate(space, |mapper| {
            let unmapped = mapper.unmap(page)?;
            let scope = self.scope(space, page.start_address());

            Some(unmapped.finish(self.tlb, scope, self.frames, policy))
        })
    }

    /// Replaces the flags of the mapping of `page`, keeping its frame.
    pub fn change_flags(
        &self,
        space: &AddressSpace<M>,
        page: Page,
        flags: PageTableFlags,
    ) -> Result<(), FlagUpdateError> {
        self.mutate(space, |mapper| {
            let flush = mapper.update_flags(page, flags)?;
            flush.flush(self.tlb, self.scope(space, page.start_address()));

            Ok(())
        })
    }

    pub fn translate(&self, space: &AddressSpace<M>, addr: VirtAddr) -> TranslateResult {
        self.with_mapper(space, |mapper| mapper.translate(addr))
    }

    pub fn translate_addr(&self, space: &AddressSpace<M>, addr: VirtAddr) -> Option<PhysAddr> {
        self.with_mapper(space, |mapper| mapper.translate_addr(addr))
    }

    /// Maps `pages` to consecutive frames starting at `first`.
    ///
    /// Either every page is mapped or, on failure, the pages mapped by this
    /// call are unmapped again before the error is returned.
    pub fn map_range(
        &self,
        space: &AddressSpace<M>,
        pages: PageRange,
        first: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapToError> {
        self.mutate(space, |mapper| {
            for (i, page) in pages.enumerate() {
                let frame = PhysFrame::containing_address(
                    first.start_address() + i as u64 * PAGE_SIZE,
                );

                match mapper.map_to(page, frame, flags) {
                    Ok(flush) => flush.flush(self.tlb, self.scope(space, page.start_address())),

                    Err(err) => {
                        for mapped in Page::range(pages.start, page) {
                            if let Some(unmapped) = mapper.unmap(mapped) {
                                let scope = self.scope(space, mapped.start_address());
                                unmapped.finish(self.tlb, scope, self.frames, FreePolicy::Keep);
                            }
                        }

                        return Err(err);
                    }
                }
            }

            Ok(())
        })
    }

    /// Unmaps every page of `pages`; pages that are not mapped are skipped.
    /// Returns the number of pages that were unmapped.
    pub fn unmap_range(
        &self,
        space: &AddressSpace<M>,
        pages: PageRange,
        policy: FreePolicy,
    ) -> usize {
        self.mutate(space, |mapper| {
            let mut count = 0;

            for page in pages {
                if let Some(unmapped) = mapper.unmap(page) {
                    let scope = self.scope(space, page.start_address());

                    unmapped.finish(self.tlb, scope, self.frames, policy);
                    count += 1;
                }
            }

            count
        })
    }

    /// Walks the user half of `space` and reports the first structural
    /// violation.
    pub fn verify(&self, space: &AddressSpace<M>) -> Result<HierarchyStats, InvariantViolation> {
        self.with_mapper(space, |mapper| {
            verify(mapper.walker(), self.access.reserved_slot())
        })
    }

    /// Loads `space` on the executing processor.
    ///
    /// ## Safety
    /// The kernel half of `space` must map the code and the stack that are
    /// executing. The space that was active before must be passed to
    /// [`deactivate`](Self::deactivate) afterwards.
    pub unsafe fn activate(&self, space: &AddressSpace<M>) {
        let id = current_cpu(self.cpu);
        let root = space.root();

        space.active_on.fetch_or(1u64 << id, Ordering::SeqCst);

        if self.cpu.read_root() != root {
            self.cpu.write_root(root);
        }
    }

    /// Records that `space` is no longer loaded on the executing processor.
    pub fn deactivate(&self, space: &AddressSpace<M>) {
        let id = current_cpu(self.cpu);
        space.active_on.fetch_and(!(1u64 << id), Ordering::SeqCst);
    }

    /// Links an empty table into every kernel slot of the kernel root that
    /// has none yet, so that kernel mappings created later show up in every
    /// address space. Returns the number of tables created.
    pub fn populate_kernel_slots(&self) -> Result<usize, MapToError> {
        let reserved = self.access.reserved_slot();

        self.mutate(self.kernel, |mapper| {
            let walker = mapper.walker();
            let root = walker.root_table(VirtAddr::zero());
            let mut created = 0;

            for index in M::KERNEL_SLOT_START..M::ENTRIES {
                let slot = Slot { table: root, index };

                if Some(index) == reserved || walker.load(slot).is_present() {
                    continue;
                }

                let frame = self
                    .frames
                    .allocate_frame()
                    .ok_or(MapToError::FrameAllocationFailed)?;

                self.access.with_frame(frame, |table| table.zero());
                walker.store(
                    slot,
                    PageTableEntry::with_frame(
                        frame,
                        PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
                    ),
                );

                created += 1;
            }

            Ok(created)
        })
    }

    fn allocate_root(&self) -> Result<PhysFrame, CloneError> {
        let root = self
            .frames
            .allocate_frame()
            .ok_or(CloneError::FrameAllocationFailed)?;

        self.access.with_frame(root, |table| table.zero());
        Ok(root)
    }

    /// Copies the kernel slots of the kernel root into `root`.
    fn share_kernel_slots(&self, root: PhysFrame) {
        let reserved = self.access.reserved_slot();

        let _irq = IrqGuard::new(self.cpu);
        let kernel = self.kernel.hierarchy.lock();

        let slots: Vec<(usize, PageTableEntry)> = self.access.with_frame(kernel.root, |table| {
            (M::KERNEL_SLOT_START..M::ENTRIES)
                .filter(|index| Some(*index) != reserved)
                .map(|index| (index, M::load(table, index)))
                .filter(|(_, entry)| entry.is_present())
                .collect()
        });

        self.access.with_frame(root, |table| {
            for (index, entry) in slots {
                M::store(table, index, entry);
            }
        });
    }

    /// Duplicates the user tables below `src` into the zeroed table `dst`.
    fn clone_table(
        &self,
        walker: &PageTableWalker<'a, M, A>,
        src: TableRef,
        dst: PhysFrame,
    ) -> Result<(), CloneError> {
        let reserved = self.access.reserved_slot();
        let entries = walker.present_entries(src);

        if let Some(view) = self.access.view_address(src) {
            self.tlb.invalidate_local(view);
        }

        for (index, entry) in entries {
            if src.level == M::LEVELS - 1 && (M::is_kernel_slot(index) || Some(index) == reserved)
            {
                continue;
            }

            if src.level == 0 {
                self.access.with_frame(dst, |table| M::store(table, index, entry));
                continue;
            }

            let Some(child_src) = walker.child(src, index, entry) else {
                fatal(InvariantViolation::MissingTable {
                    addr: src.addr,
                    level: src.level - 1,
                });
            };

            let child = self
                .frames
                .allocate_frame()
                .ok_or(CloneError::FrameAllocationFailed)?;

            self.access.with_frame(child, |table| table.zero());

            let link = PageTableEntry::with_frame(child, entry.flags());
            self.access.with_frame(dst, |table| M::store(table, index, link));

            self.clone_table(walker, child_src, child)?;
        }

        Ok(())
    }

    /// Gives every present page of `regions` the flags of its region in the
    /// hierarchy rooted at `root`. Copy-on-write pages stay read-only.
    fn reinstall_regions(&self, root: PhysFrame, regions: &[Region]) {
        self.with_root(root, |mapper| {
            for region in regions {
                region.check_aligned();

                for page in region.pages() {
                    let TranslateResult::Mapped { flags, .. } =
                        mapper.translate(page.start_address())
                    else {
                        continue;
                    };

                    let mut new_flags = region.flags;

                    if flags.contains(PageTableFlags::COPY_ON_WRITE) {
                        new_flags.insert(PageTableFlags::COPY_ON_WRITE);
                        new_flags.remove(PageTableFlags::WRITABLE);
                    }

                    // Not loaded anywhere yet, nothing to invalidate.
                    if let Ok(flush) = mapper.update_flags(page, new_flags) {
                        flush.ignore();
                    }
                }
            }

            self.check(mapper);
        });
    }

    /// Creates a new hierarchy.
    ///
    /// On failure everything allocated for the new hierarchy has been freed
    /// again and the source is unchanged.
    pub fn create_hierarchy(&self, mode: CloneMode<'_, M>) -> Result<AddressSpace<M>, CloneError> {
        let root = self.allocate_root()?;

        self.share_kernel_slots(root);
        self.access.prepare_root(root);

        let CloneMode::Deep { source, regions } = mode else {
            log::debug!("vmm: created hierarchy {:?}", root);
            return Ok(AddressSpace::new(root));
        };

        let cloned = self.with_mapper(source, |mapper| {
            let walker = mapper.walker();
            self.clone_table(walker, walker.root_table(VirtAddr::zero()), root)
        });

        if let Err(err) = cloned {
            log::debug!("vmm: cloning into {:?} failed: {:?}", root, err);

            self.release_table(root, M::LEVELS - 1, 0, &|_| false);
            self.frames.deallocate_frame(root);

            return Err(err);
        }

        self.reinstall_regions(root, regions);

        log::debug!("vmm: cloned {:?} into {:?}", source.root(), root);
        Ok(AddressSpace::new(root))
    }

    /// Clears every user entry of the table `frame` at `level`, freeing every
    /// table below it and the data frames for which `private` returns `true`.
    ///
    /// Works on frames directly, so the hierarchy does not have to be loaded.
    fn release_table(
        &self,
        frame: PhysFrame,
        level: usize,
        base: u64,
        private: &dyn Fn(VirtAddr) -> bool,
    ) {
        let reserved = self.access.reserved_slot();
        let is_root = level == M::LEVELS - 1;

        let entries: Vec<(usize, PageTableEntry)> = self.access.with_frame(frame, |table| {
            (0..M::ENTRIES)
                .filter(|index| !is_root || !(M::is_kernel_slot(*index) || Some(*index) == reserved))
                .map(|index| (index, M::load(table, index)))
                .filter(|(_, entry)| entry.is_present())
                .collect()
        });

        for (index, entry) in entries.iter().copied() {
            let Ok(child) = entry.frame() else {
                continue;
            };

            let addr = M::with_index(base, level, index);

            if level == 0 {
                if private(VirtAddr::new(addr)) {
                    self.frames.deallocate_frame(child);
                }
            } else {
                self.release_table(child, level - 1, addr, private);
                self.free_table(child);
            }
        }

        self.access.with_frame(frame, |table| {
            for (index, _) in entries {
                M::store(table, index, PageTableEntry::new());
            }
        });
    }

    /// Returns an unlinked table to the frame allocator.
    fn free_table(&self, frame: PhysFrame) {
        let empty = self.access.with_frame(frame, |table| {
            (0..M::ENTRIES).all(|index| !M::load(table, index).is_present())
        });

        if !empty {
            fatal(InvariantViolation::FreeingLiveTable { frame });
        }

        self.frames.deallocate_frame(frame);
    }

    /// Tears down `space`: frees every page of its non-shared regions, every
    /// user table and the root.
    ///
    /// Destroying a hierarchy that is loaded on any processor is fatal.
    pub fn destroy_hierarchy(&self, space: AddressSpace<M>, regions: &[Region]) {
        let active_on = space.active_mask();
        let root = space.hierarchy.into_inner().root;

        if active_on != 0 {
            fatal(InvariantViolation::DestroyingActive { root, active_on });
        }

        for region in regions {
            region.check_aligned();
        }

        let private = |addr: VirtAddr| {
            regions
                .iter()
                .any(|region| region.contains(addr) && !region.is_shared())
        };

        self.release_table(root, M::LEVELS - 1, 0, &private);
        self.frames.deallocate_frame(root);

        log::debug!("vmm: destroyed hierarchy {:?}", root);
    }
}


impl<M: PagingMode, A: PhysicalAccess<M>> Vmm<'static, M, A> {
    /// Builds the memory manager from what was selected at boot: the
    /// invalidator published with [`tlb::install`] and the options parsed by
    /// [`cmdline::init`].
    ///
    /// Returns `None` if no invalidator was installed yet.
    pub fn from_boot(
        access: &'static A,
        frames: &'static dyn FrameAllocator,
        cpu: &'static dyn Processor,
        kernel: &'static AddressSpace<M>,
    ) -> Option<Self> {
        let Some(invalidator) = tlb::get() else {
            log::warn!("vmm: no tlb invalidator installed");
            return None;
        };

        Some(Self::new(access, frames, cpu, invalidator, kernel, cmdline::get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, ActiveOnly, SimMemory, SimProcessor};
    use crate::tlb::LocalInvalidator;

    use alloc::vec::Vec;
    use proptest::prelude::*;

    fn page(addr: u64) -> Page {
        Page::containing_address(VirtAddr::new(addr))
    }

    fn user_rw() -> PageTableFlags {
        PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
    }

    const KERNEL_ADDR: u64 = 0xffff_8000_0010_0000;

    #[test]
    fn map_unmap_translate() {
        sim::run::<FourLevel>(64, |env| {
            let vmm = env.vmm();
            let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
            let baseline = vmm.verify(&space).unwrap();
            let data = env.memory.zeroed_frame();

            vmm.map(&space, page(0x40_0000), data, user_rw()).unwrap();

            assert_eq!(
                vmm.translate_addr(&space, VirtAddr::new(0x40_0123)),
                Some(data.start_address() + 0x123)
            );

            assert_eq!(vmm.unmap(&space, page(0x40_0000), FreePolicy::Keep), Some(data));
            assert_eq!(
                vmm.translate(&space, VirtAddr::new(0x40_0000)),
                TranslateResult::NotMapped
            );
            assert_eq!(vmm.verify(&space).unwrap(), baseline);

            // Unmapping again is a no-op.
            assert_eq!(vmm.unmap(&space, page(0x40_0000), FreePolicy::Free), None);

            vmm.destroy_hierarchy(space, &[]);
        });
    }

    #[test]
    fn change_flags_keeps_frame() {
        sim::run::<TwoLevel>(16, |env| {
            let vmm = env.vmm();
            let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
            let data = env.memory.zeroed_frame();

            vmm.map(&space, page(0x1000), data, user_rw()).unwrap();
            vmm.change_flags(&space, page(0x1000), PageTableFlags::USER_ACCESSIBLE)
                .unwrap();

            assert_eq!(
                vmm.translate(&space, VirtAddr::new(0x1000)),
                TranslateResult::Mapped {
                    frame: data,
                    offset: 0,
                    flags: PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE,
                }
            );

            assert_eq!(
                vmm.change_flags(&space, page(0x2000), PageTableFlags::WRITABLE),
                Err(FlagUpdateError::PageNotMapped)
            );
        });
    }

    #[test]
    fn user_flags_reach_the_parent_entries() {
        sim::run::<TwoLevel>(32, |env| {
            let vmm = env.vmm();
            let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
            let user = |root: PhysFrame| {
                env.memory
                    .entry::<TwoLevel>(root, 0)
                    .flags()
                    .contains(PageTableFlags::USER_ACCESSIBLE)
            };

            vmm.map(&space, page(0x1000), env.memory.zeroed_frame(), PageTableFlags::WRITABLE)
                .unwrap();
            assert!(!user(space.root()));

            // A clone whose region grants user access.
            let regions = [Region::new(VirtAddr::new(0x1000), VirtAddr::new(0x2000), user_rw())];
            let clone = vmm
                .create_hierarchy(CloneMode::Deep {
                    source: &space,
                    regions: &regions,
                })
                .unwrap();

            assert!(user(clone.root()));
            assert!(!user(space.root()));

            vmm.change_flags(&space, page(0x1000), user_rw()).unwrap();
            assert!(user(space.root()));
        });
    }

    #[test]
    fn shallow_hierarchies_share_kernel_tables() {
        sim::run::<FourLevel>(64, |env| {
            let vmm = env.vmm();
            let data = env.memory.zeroed_frame();

            vmm.map(vmm.kernel(), page(KERNEL_ADDR), data, PageTableFlags::WRITABLE)
                .unwrap();

            let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();

            assert_eq!(
                vmm.translate_addr(&space, VirtAddr::new(KERNEL_ADDR)),
                Some(data.start_address())
            );

            // Kernel tables are linked by reference, so later kernel mappings
            // below an existing kernel slot show up as well.
            let other = env.memory.zeroed_frame();
            vmm.map(vmm.kernel(), page(KERNEL_ADDR + 0x1000), other, PageTableFlags::WRITABLE)
                .unwrap();

            assert_eq!(
                vmm.translate_addr(&space, VirtAddr::new(KERNEL_ADDR + 0x1000)),
                Some(other.start_address())
            );
        });
    }

    #[test]
    fn kernel_mappings_are_broadcast() {
        sim::run::<FourLevel>(64, |env| {
            let vmm = env.vmm();
            let data = env.memory.zeroed_frame();

            vmm.map(vmm.kernel(), page(KERNEL_ADDR), data, PageTableFlags::WRITABLE)
                .unwrap();
            assert_eq!(
                vmm.scope(vmm.kernel(), VirtAddr::new(KERNEL_ADDR)),
                FlushScope::Broadcast
            );

            let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
            assert_eq!(vmm.scope(&space, VirtAddr::new(0x1000)), FlushScope::Local);

            env.cpu.set_id(1);
            unsafe { vmm.activate(&space) };
            env.cpu.set_id(0);

            assert_eq!(vmm.scope(&space, VirtAddr::new(0x1000)), FlushScope::Broadcast);
        });
    }

    #[test]
    fn deep_clone_is_independent() {
        sim::run::<FourLevel>(128, |env| {
            let vmm = env.vmm();
            let kernel_data = env.memory.zeroed_frame();

            vmm.map(vmm.kernel(), page(KERNEL_ADDR), kernel_data, PageTableFlags::WRITABLE)
                .unwrap();

            let source = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
            let a = env.memory.zeroed_frame();
            let b = env.memory.zeroed_frame();

            vmm.map(&source, page(0x1000), a, user_rw()).unwrap();
            vmm.map(&source, page(0x7fff_0000_0000), b, user_rw()).unwrap();

            let regions = [
                Region::new(
                    VirtAddr::new(0x1000),
                    VirtAddr::new(0x2000),
                    PageTableFlags::USER_ACCESSIBLE,
                ),
                Region::new(
                    VirtAddr::new(0x7fff_0000_0000),
                    VirtAddr::new(0x7fff_0000_1000),
                    user_rw(),
                ),
            ];

            let clone = vmm
                .create_hierarchy(CloneMode::Deep {
                    source: &source,
                    regions: &regions,
                })
                .unwrap();

            // Data pages are shared, permissions follow the regions.
            assert_eq!(
                vmm.translate(&clone, VirtAddr::new(0x1000)),
                TranslateResult::Mapped {
                    frame: a,
                    offset: 0,
                    flags: PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE,
                }
            );
            assert_eq!(
                vmm.translate_addr(&clone, VirtAddr::new(0x7fff_0000_0000)),
                Some(b.start_address())
            );

            // Kernel addresses resolve identically.
            assert_eq!(
                vmm.translate_addr(&clone, VirtAddr::new(KERNEL_ADDR)),
                vmm.translate_addr(&source, VirtAddr::new(KERNEL_ADDR))
            );

            // User tables are private.
            let c = env.memory.zeroed_frame();
            vmm.map(&clone, page(0x1000), c, user_rw()).unwrap();
            vmm.unmap(&source, page(0x7fff_0000_0000), FreePolicy::Keep);

            assert_eq!(
                vmm.translate_addr(&source, VirtAddr::new(0x1000)),
                Some(a.start_address())
            );
            assert_eq!(
                vmm.translate_addr(&clone, VirtAddr::new(0x7fff_0000_0000)),
                Some(b.start_address())
            );

            assert_eq!(vmm.verify(&source).unwrap().tables, 4);
            assert_eq!(vmm.verify(&clone).unwrap().tables, 7);
        });
    }

    #[test]
    fn failed_clone_frees_everything() {
        sim::run::<FourLevel>(64, |env| {
            let vmm = env.vmm();
            let source = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
            let data = env.memory.zeroed_frame();

            vmm.map(&source, page(0x1000), data, user_rw()).unwrap();
            vmm.map(&source, page(0x4000_0000_0000), data, user_rw()).unwrap();

            let before = env.memory.allocated();

            // The root and four tables can be allocated, the next one cannot.
            env.memory.fail_after(5);

            let result = vmm.create_hierarchy(CloneMode::Deep {
                source: &source,
                regions: &[],
            });

            assert!(matches!(result, Err(CloneError::FrameAllocationFailed)));
            assert_eq!(env.memory.allocated(), before);
            assert_eq!(
                vmm.translate_addr(&source, VirtAddr::new(0x4000_0000_0000)),
                Some(data.start_address())
            );
        });
    }

    #[test]
    fn destroy_returns_private_pages_and_tables() {
        sim::run::<TwoLevel>(32, |env| {
            let vmm = env.vmm();
            let baseline = env.memory.allocated();
            let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();

            let private = env.memory.zeroed_frame();
            let shared = env.memory.zeroed_frame();

            vmm.map(&space, page(0x1000), private, user_rw()).unwrap();
            vmm.map(
                &space,
                page(0x80_0000),
                shared,
                user_rw() | PageTableFlags::SHARED,
            )
            .unwrap();

            let regions = [
                Region::new(VirtAddr::new(0x1000), VirtAddr::new(0x2000), user_rw()),
                Region::new(
                    VirtAddr::new(0x80_0000),
                    VirtAddr::new(0x80_1000),
                    user_rw() | PageTableFlags::SHARED,
                ),
            ];

            vmm.destroy_hierarchy(space, &regions);

            // Only the shared page survives.
            assert_eq!(env.memory.allocated(), baseline + 1);
            assert!(env.memory.freed().contains(&private));
            assert!(!env.memory.freed().contains(&shared));
        });
    }

    #[test]
    #[should_panic(expected = "destroying hierarchy")]
    fn destroying_active_hierarchy_is_fatal() {
        sim::run::<TwoLevel>(16, |env| {
            let vmm = env.vmm();
            let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();

            unsafe { vmm.activate(&space) };
            vmm.destroy_hierarchy(space, &[]);
        });
    }

    #[test]
    fn map_range_rolls_back_on_failure() {
        sim::run::<FourLevel>(64, |env| {
            let vmm = env.vmm();
            let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
            let before = env.memory.allocated();
            let first = PhysFrame::containing_address(PhysAddr::new(0x4000_0000));

            // The range crosses into a second leaf table, which cannot be
            // allocated.
            let pages = Page::range(page(0x1f_e000), page(0x20_2000));
            env.memory.fail_after(3);

            assert_eq!(
                vmm.map_range(&space, pages, first, user_rw()),
                Err(MapToError::FrameAllocationFailed)
            );
            assert_eq!(env.memory.allocated(), before);
            assert_eq!(
                vmm.translate(&space, VirtAddr::new(0x1f_e000)),
                TranslateResult::NotMapped
            );

            env.memory.fail_after(usize::MAX);

            vmm.map_range(&space, pages, first, user_rw()).unwrap();
            assert_eq!(
                vmm.translate_addr(&space, VirtAddr::new(0x20_1000)),
                Some(PhysAddr::new(0x4000_3000))
            );
            assert_eq!(vmm.unmap_range(&space, pages, FreePolicy::Keep), 4);
            assert_eq!(env.memory.allocated(), before);
        });
    }

    #[test]
    fn populated_kernel_slots_reach_new_spaces() {
        sim::run::<TwoLevel>(512, |env| {
            let vmm = env.vmm();
            let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();

            assert_eq!(
                vmm.populate_kernel_slots().unwrap(),
                TwoLevel::ENTRIES - TwoLevel::KERNEL_SLOT_START
            );

            let late = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
            let data = env.memory.zeroed_frame();

            vmm.map(vmm.kernel(), page(0xd000_0000), data, PageTableFlags::WRITABLE)
                .unwrap();

            assert_eq!(
                vmm.translate_addr(&late, VirtAddr::new(0xd000_0000)),
                Some(data.start_address())
            );

            // Spaces created before the kernel slots were populated do not
            // see the new kernel table.
            assert_eq!(vmm.translate_addr(&space, VirtAddr::new(0xd000_0000)), None);
        });
    }

    #[test]
    fn recursive_style_access_switches_roots_safely() {
        let memory = SimMemory::new(32);
        let cpu = SimProcessor::new();
        let tlb = LocalInvalidator::new(&cpu);
        let access = ActiveOnly::new(memory.direct_map(), &cpu);

        let kernel_root = memory.zeroed_frame();
        let kernel = unsafe { AddressSpace::<TwoLevel>::adopt(kernel_root) };
        cpu.set_root(kernel_root);
        cpu.set_interrupts(true);

        let vmm = Vmm::new(&access, &memory, &cpu, &tlb, &kernel, VmmConfig::new());

        let source = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
        let data = memory.zeroed_frame();

        vmm.map(&source, page(0x1000), data, user_rw()).unwrap();

        let regions = [Region::new(VirtAddr::new(0x1000), VirtAddr::new(0x2000), user_rw())];
        let clone = vmm
            .create_hierarchy(CloneMode::Deep {
                source: &source,
                regions: &regions,
            })
            .unwrap();

        assert_eq!(
            vmm.translate_addr(&clone, VirtAddr::new(0x1000)),
            Some(data.start_address())
        );

        // Every temporary switch happened with interrupts off, and the kernel
        // root is active again afterwards.
        assert!(cpu.root_writes() > 0);
        assert_eq!(cpu.root_writes_with_interrupts(), 0);
        assert_eq!(cpu.read_root(), kernel_root);
        assert!(cpu.interrupts_enabled());
    }

    #[test]
    fn self_mapped_slot_is_left_alone() {
        // A user slot, so that only the reservation keeps it out of clones.
        const SLOT: usize = 700;

        let memory = SimMemory::new(64);
        let cpu = SimProcessor::new();
        let tlb = LocalInvalidator::new(&cpu);
        let access = ActiveOnly::self_mapped(memory.direct_map(), &cpu, SLOT);

        let kernel_root = memory.zeroed_frame();
        PhysicalAccess::<TwoLevel>::prepare_root(&access, kernel_root);

        let kernel = unsafe { AddressSpace::<TwoLevel>::adopt(kernel_root) };
        cpu.set_root(kernel_root);
        cpu.set_interrupts(true);

        let config = VmmConfig {
            verify: true,
            ..VmmConfig::new()
        };
        let vmm = Vmm::new(&access, &memory, &cpu, &tlb, &kernel, config);
        let self_map = |root: PhysFrame| memory.entry::<TwoLevel>(root, SLOT).frame();

        let source = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
        assert_eq!(self_map(source.root()), Ok(source.root()));

        vmm.map(&source, page(0x1000), memory.zeroed_frame(), user_rw()).unwrap();
        vmm.map(&source, page(0x40_0000), memory.zeroed_frame(), user_rw()).unwrap();

        let clone = vmm
            .create_hierarchy(CloneMode::Deep {
                source: &source,
                regions: &[],
            })
            .unwrap();
        let clone_root = clone.root();

        // The clone maps itself rather than its source.
        assert_eq!(self_map(clone_root), Ok(clone_root));
        assert_eq!(vmm.verify(&clone), vmm.verify(&source));
        assert_eq!(vmm.verify(&clone).unwrap().tables, 3);

        // The kernel lock is only taken with interrupts off.
        assert!(!access.touched_with_interrupts().contains(&kernel_root));

        // Reclaiming a leaf table drops the translation of its view.
        cpu.clear_flushes();
        vmm.unmap(&clone, page(0x40_0000), FreePolicy::Keep).unwrap();

        let view = recursive_table_address::<TwoLevel>(SLOT, 0, VirtAddr::new(0x40_0000));
        assert!(cpu.flushed_pages().contains(&view));

        // The remaining leaf table and the root, nothing through the self-map.
        let before = memory.allocated();
        vmm.destroy_hierarchy(clone, &[]);

        assert_eq!(memory.allocated(), before - 2);
        assert_eq!(memory.freed().iter().filter(|frame| **frame == clone_root).count(), 1);
        assert_eq!(self_map(clone_root), Ok(clone_root));
        assert_eq!(cpu.read_root(), kernel_root);
    }

    #[test]
    fn boot_selection_builds_the_manager() {
        use alloc::boxed::Box;

        let memory: &'static SimMemory = Box::leak(Box::new(SimMemory::new(16)));
        let cpu: &'static SimProcessor = Box::leak(Box::new(SimProcessor::new()));
        let access: &'static DirectMap = Box::leak(Box::new(memory.direct_map()));

        let root = memory.zeroed_frame();
        let kernel: &'static AddressSpace<FourLevel> =
            Box::leak(Box::new(unsafe { AddressSpace::adopt(root) }));
        cpu.set_root(root);

        assert!(Vmm::from_boot(access, memory, cpu, kernel).is_none());

        let invalidator: &'static LocalInvalidator<'static> =
            Box::leak(Box::new(LocalInvalidator::new(cpu)));
        tlb::install(invalidator);
        cmdline::init("tlb=local vmm-verify");

        let vmm = Vmm::from_boot(access, memory, cpu, kernel).unwrap();
        assert!(vmm.config().verify);

        let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
        vmm.map(&space, page(0x1000), memory.zeroed_frame(), user_rw()).unwrap();

        vmm.unmap(&space, page(0x1000), FreePolicy::Free).unwrap();
        assert_eq!(cpu.flushed_pages(), [VirtAddr::new(0x1000)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn filling_and_draining_a_leaf_table_reclaims_it(
            order in Just((0..FourLevel::ENTRIES as u64).collect::<Vec<_>>()).prop_shuffle()
        ) {
            const BASE: u64 = 0x7f00_0000_0000;

            sim::run::<FourLevel>(16, |env| {
                let vmm = env.vmm_with(VmmConfig::new());
                let space = vmm.create_hierarchy(CloneMode::Shallow).unwrap();
                let baseline = vmm.verify(&space).unwrap();
                let before = env.memory.allocated();

                for i in 0..FourLevel::ENTRIES as u64 {
                    let frame = PhysFrame::containing_address(PhysAddr::new((i + 1) * PAGE_SIZE));
                    vmm.map(&space, page(BASE + i * PAGE_SIZE), frame, user_rw()).unwrap();
                }

                assert_eq!(env.memory.allocated(), before + 3);

                for i in order.iter() {
                    assert!(vmm.unmap(&space, page(BASE + i * PAGE_SIZE), FreePolicy::Keep).is_some());
                }

                assert_eq!(vmm.verify(&space).unwrap(), baseline);
                assert_eq!(env.memory.allocated(), before);
            });
        }
    }
}
