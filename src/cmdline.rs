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

//! Memory manager options from the kernel command line.

use core::num::ParseIntError;

use spin::Once;

use crate::paging::WindowSlots;

static CONFIG: Once<VmmConfig> = Once::new();

/// How cached translations are invalidated, see `tlb=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbPolicy {
    /// Local invalidation on uniprocessor machines, shootdowns otherwise.
    Auto,
    Local,
    Shootdown,
}

/// How page-table pages are reached, see `vmm-access=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStrategy {
    Direct,
    Window,
    Recursive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmmConfig {
    pub tlb: TlbPolicy,
    pub access: AccessStrategy,
    /// If set, every hierarchy is verified after each mutation and the first
    /// violation is fatal.
    ///
    /// Defaults to on when the `verify-tables` feature is enabled.
    pub verify: bool,
    /// Number of scratch pages of the temporary window.
    pub window_slots: usize,
}

impl VmmConfig {
    pub const DEFAULT_WINDOW_SLOTS: usize = 16;

    pub const fn new() -> Self {
        Self {
            tlb: TlbPolicy::Auto,
            access: AccessStrategy::Direct,
            verify: cfg!(feature = "verify-tables"),
            window_slots: Self::DEFAULT_WINDOW_SLOTS,
        }
    }
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number(mut string: &str) -> Result<usize, ParseIntError> {
    let is_hex = string.starts_with("0x");
    let is_octal = string.starts_with("0o");

    if is_hex {
        string = string.trim_start_matches("0x");
        usize::from_str_radix(string, 16)
    } else if is_octal {
        string = string.trim_start_matches("0o");
        usize::from_str_radix(string, 8)
    } else {
        string.parse::<usize>()
    }
}

/// Parses the options the memory manager understands out of the kernel
/// command line. Options belonging to other subsystems are ignored; malformed
/// values are logged and replaced by their default.
pub fn parse(cmdline: &str) -> VmmConfig {
    let mut result = VmmConfig::new();

    let bail = |argument| log::warn!("vmm: invalid kernel command line option: '{}'", argument);

    for argument in cmdline.trim().split_whitespace() {
        match argument {
            "vmm-verify" => result.verify = true,

            _ => {
                let Some((name, value)) = argument.split_once('=') else {
                    continue;
                };

                match name {
                    "tlb" => match value {
                        "auto" => result.tlb = TlbPolicy::Auto,
                        "local" => result.tlb = TlbPolicy::Local,
                        "shootdown" => result.tlb = TlbPolicy::Shootdown,
                        _ => bail(argument),
                    },

                    "vmm-access" => match value {
                        "direct" => result.access = AccessStrategy::Direct,
                        "window" => result.access = AccessStrategy::Window,
                        "recursive" => result.access = AccessStrategy::Recursive,
                        _ => bail(argument),
                    },

                    "vmm-window-slots" => match parse_number(value) {
                        Ok(slots) if (1..=WindowSlots::MAX).contains(&slots) => {
                            result.window_slots = slots
                        }

                        Ok(_) => bail(argument),

                        Err(e) => log::warn!(
                            "parse_number: invalid operand {}, defaulting to {}",
                            e,
                            VmmConfig::DEFAULT_WINDOW_SLOTS
                        ),
                    },

                    _ => {}
                }
            }
        }
    }

    result
}

/// Parses `cmdline` and publishes the result. Only the first call parses.
pub fn init(cmdline: &str) -> &'static VmmConfig {
    CONFIG.call_once(|| parse(cmdline))
}

/// Returns the configuration published by [`init`], or the defaults if the
/// command line was not parsed yet.
pub fn get() -> VmmConfig {
    CONFIG.get().copied().unwrap_or_default()
}
