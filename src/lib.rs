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

//! # Aero VMM
//!
//! The page-table half of the Aero memory manager. It builds and tears down
//! translation hierarchies under either the two-level 32-bit scheme or the
//! four-level 64-bit scheme, keeps every processor's TLB consistent with them
//! and implements copy-on-write marking for `fork`.
//!
//! The pieces that depend on the machine (how page-table pages are reached,
//! where frames come from, how processors are interrupted) are traits chosen
//! once at boot:
//!
//! * [`paging::PhysicalAccess`]: [`paging::DirectMap`], [`paging::TemporaryWindow`]
//!   or [`paging::RecursiveMap`].
//! * [`paging::FrameAllocator`]: the physical frame allocator.
//! * [`arch::Processor`] and [`tlb::IpiSender`]: the executing processor and the
//!   inter-processor interrupt controller.
//!
//! The region layer above drives everything through [`Vmm`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod arch;
pub mod cmdline;
pub mod cow;
pub mod paging;
pub mod region;
pub mod tlb;
pub mod utils;

#[cfg(test)]
mod sim;

pub use self::address_space::{AddressSpace, CloneError, CloneMode, Vmm};
pub use self::cow::CowError;
pub use self::region::Region;
