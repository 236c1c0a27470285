// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side mirror of device state.
//!
//! Nothing in here is durable: every field is rebuilt from device queries
//! by `sync_state` and kept current by the command processor as commands
//! complete.

use w77q_regs::config::Sspr;
use w77q_regs::status::Ssr;
use w77q_regs::NUM_SECTIONS;

use crate::key_mngr::KeyManager;

/// Index of the transaction counter in a monotonic counter pair.
pub const TC: usize = 0;
/// Index of the device monotonic counter.
pub const DMC: usize = 1;

/// Cached view of one section.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionState {
    /// Absolute flash address of the section start.
    pub base: u32,
    /// Size in bytes; zero while the section is disabled.
    pub size: u32,
    pub enabled: bool,
    /// Length tag from the GMT, the unit the size rules work in.
    pub size_tag: u16,
    pub plain_rd: bool,
    pub plain_wr: bool,
    /// Policy last read from, or written to, the section's SCR.
    pub policy: Option<Sspr>,
}

impl SectionState {
    pub fn effective_size(&self) -> u32 {
        if self.enabled {
            self.size
        } else {
            0
        }
    }
}

#[derive(Debug)]
pub struct DieState<'k> {
    /// `[TC, DMC]` as last reported by the device and advanced locally.
    pub mc: [u32; 2],
    pub mc_in_sync: bool,
    pub powered_down: bool,
    pub key_mngr: KeyManager<'k>,
    /// SSR of the most recent secure command on this die.
    pub ssr: Ssr,
    pub vault_size: u32,
    pub sections: [SectionState; NUM_SECTIONS],
}

impl<'k> DieState<'k> {
    pub fn new() -> DieState<'k> {
        let mut ssr = Ssr::default();
        // busy marks the cached value as stale
        ssr.set_busy(true);
        DieState {
            mc: [0; 2],
            mc_in_sync: false,
            powered_down: false,
            key_mngr: KeyManager::new(),
            ssr,
            vault_size: 0,
            sections: [SectionState::default(); NUM_SECTIONS],
        }
    }

    pub fn section(&self, section: u8) -> Option<&SectionState> {
        self.sections.get(usize::from(section))
    }

    pub fn section_mut(&mut self, section: u8) -> Option<&mut SectionState> {
        self.sections.get_mut(usize::from(section))
    }
}

impl Default for DieState<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the device last came out of reset, as seen by `sync_after_flash_reset`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResetStatus {
    pub power_on: bool,
    pub fallback_remap: bool,
    pub watchdog: bool,
}

#[derive(Debug)]
pub struct Context<'k> {
    pub dies: Vec<DieState<'k>>,
    pub active_die: usize,
    /// True when the watchdog configuration requires authenticated touches.
    pub watchdog_secure: bool,
    /// Section whose full key authenticates watchdog commands.
    pub watchdog_section: Option<u8>,
    pub reset_status: ResetStatus,
    pub suspended: bool,
    pub wid: u64,
    /// Mirror of the standard extended address register.
    pub ext_addr: u8,
    /// Set while a multi-page read or write is in progress, so the error
    /// path knows a pipelined exchange must be abandoned.
    pub multi_transaction: bool,
}

impl<'k> Context<'k> {
    pub fn new(num_dies: usize) -> Context<'k> {
        Context {
            dies: (0..num_dies.max(1)).map(|_| DieState::new()).collect(),
            active_die: 0,
            watchdog_secure: false,
            watchdog_section: None,
            reset_status: ResetStatus::default(),
            suspended: false,
            wid: 0,
            ext_addr: 0,
            multi_transaction: false,
        }
    }

    // `active_die` is only ever set through `select_die`, which bounds it.
    pub fn die(&self) -> &DieState<'k> {
        &self.dies[self.active_die]
    }

    pub fn die_mut(&mut self) -> &mut DieState<'k> {
        &mut self.dies[self.active_die]
    }

    pub fn key_mngr(&self) -> &KeyManager<'k> {
        &self.die().key_mngr
    }

    pub fn key_mngr_mut(&mut self) -> &mut KeyManager<'k> {
        &mut self.die_mut().key_mngr
    }
}
