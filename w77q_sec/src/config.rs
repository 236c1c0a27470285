// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cmd::BusMode;
use crate::error::Result;

/// Library settings. Every field has a default, so an empty TOML document
/// is a valid configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct QlibConfig {
    pub timeouts: Timeouts,
    pub errata: ErrataPolicy,
    pub bus: BusConfig,
}

impl QlibConfig {
    pub fn from_toml(s: &str) -> Result<QlibConfig> {
        Ok(toml::from_str(s)?)
    }
}

/// Busy polling bounds per command class, in microseconds.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Timeouts {
    pub secure_cmd_us: u64,
    pub write_us: u64,
    pub sector_erase_us: u64,
    pub block_erase_us: u64,
    pub chip_erase_us: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            secure_cmd_us: 20_000,
            write_us: 3_000,
            sector_erase_us: 400_000,
            block_erase_us: 2_000_000,
            chip_erase_us: 200_000_000,
        }
    }
}

/// Which bound a command polls against.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeoutClass {
    SecureCmd,
    Write,
    SectorErase,
    BlockErase,
    ChipErase,
}

impl Timeouts {
    pub fn get(&self, class: TimeoutClass) -> Duration {
        let us = match class {
            TimeoutClass::SecureCmd => self.secure_cmd_us,
            TimeoutClass::Write => self.write_us,
            TimeoutClass::SectorErase => self.sector_erase_us,
            TimeoutClass::BlockErase => self.block_erase_us,
            TimeoutClass::ChipErase => self.chip_erase_us,
        };
        Duration::from_micros(us)
    }
}

/// Workarounds for transient errors some parts report. They only take
/// effect on parts whose capabilities name the matching erratum.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ErrataPolicy {
    /// Drop a SYS_ERR reported by SESSION_OPEN.
    pub ignore_open_session_sys_err: bool,
    /// Extra attempts for SET_SCR, SET_SCR_SWAP, SET_GMC and SET_GMT after
    /// SYS_ERR.
    pub set_cmd_retries: u32,
    /// After a session error on SET_SCR, accept the command if reading the
    /// SCR back shows it was applied.
    pub set_scr_verify_readback: bool,
    /// Issue GET_MC to clear sticky error bits once they are observed.
    pub clear_errors_with_get_mc: bool,
}

impl Default for ErrataPolicy {
    fn default() -> Self {
        ErrataPolicy {
            ignore_open_session_sys_err: true,
            set_cmd_retries: 3,
            set_scr_verify_readback: true,
            clear_errors_with_get_mc: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BusConfig {
    pub secure_format: BusMode,
    pub dtr: bool,
    /// Largest data phase the adapter takes in one write, opcode excluded.
    pub max_write: usize,
    pub max_read: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            secure_format: BusMode::Single,
            dtr: false,
            max_write: 4 + 256,
            max_read: 256,
        }
    }
}
