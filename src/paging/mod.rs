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

mod access;
mod addr;
mod frame;
mod mapper;
mod mode;
mod page_table;
mod verify;
mod walker;

pub use self::access::*;
pub use self::addr::*;
pub use self::frame::*;
pub use self::mapper::*;
pub use self::mode::*;
pub use self::page_table::*;
pub use self::verify::*;
pub use self::walker::*;

/// Deepest hierarchy any supported paging mode builds.
pub const MAX_LEVELS: usize = 4;

static_assertions::const_assert!(TwoLevel::LEVELS <= MAX_LEVELS);
static_assertions::const_assert!(FourLevel::LEVELS <= MAX_LEVELS);
