// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register layouts for the W77Q secure flash.
//!
//! Status words that the device reports after every command are plain
//! `bitfield` newtypes over the raw integer. Configuration words and the
//! 160-bit configuration records are `packed_struct` types so they can be
//! built field by field and packed into the exact byte layout the device
//! expects on the wire.

extern crate packed_struct;

pub mod config;
pub mod status;

/// Number of main (non vault) sections.
pub const NUM_MAIN_SECTIONS: usize = 8;

/// Section id reserved for the vault (RPMC) area.
pub const SECTION_VAULT: u8 = 8;

/// Number of sections that can hold keys, including the vault.
pub const NUM_SECTIONS: usize = NUM_MAIN_SECTIONS + 1;

pub const KB_64: u32 = 0x1_0000;
pub const MB_1: u32 = 0x10_0000;
