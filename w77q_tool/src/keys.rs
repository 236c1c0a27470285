// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_hex::{SerHex, Strict};
use std::path::Path;
use w77q_sec::sim::SimDevice;
use w77q_sec::{Key, Kid};

/// A 128 bit key written as 32 hex digits.
#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(transparent)]
pub struct HexKey(#[serde(with = "SerHex::<Strict>")] pub Key);

/// Keys for one section, either of which may be absent.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SectionKeys {
    pub index: u8,
    pub full: Option<HexKey>,
    pub restricted: Option<HexKey>,
}

/// Struct defining the TOML format for `--keys`:
///
/// ```toml
/// master = "000102030405060708090a0b0c0d0e0f"
///
/// [[section]]
/// index = 0
/// full = "f0e1d2c3b4a5968778695a4b3c2d1e0f"
/// restricted = "11223344556677889900aabbccddeeff"
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct KeyFile {
    /// Device master key, also the root of every provisioning key.
    pub master: Option<HexKey>,
    #[serde(default, rename = "section")]
    pub sections: Vec<SectionKeys>,
}

impl KeyFile {
    pub fn load(path: &Path) -> Result<KeyFile> {
        let text = std::fs::read_to_string(path).with_context(|| format!("could not read {path:?}"))?;
        toml::from_str(&text).with_context(|| format!("could not parse {path:?}"))
    }

    /// Well known keys for trying the tool out. Never put these on a part.
    pub fn demo() -> KeyFile {
        let key = |b: u8| HexKey([b; 16]);
        KeyFile {
            master: Some(key(0x4d)),
            sections: (0..w77q_regs::NUM_MAIN_SECTIONS as u8)
                .map(|index| SectionKeys {
                    index,
                    full: Some(key(0xf0 | index)),
                    restricted: Some(key(0x10 | index)),
                })
                .collect(),
        }
    }

    pub fn section(&self, index: u8) -> Option<&SectionKeys> {
        self.sections.iter().find(|s| s.index == index)
    }

    pub fn key(&self, index: u8, full: bool) -> Option<&Key> {
        let s = self.section(index)?;
        let k = if full { s.full.as_ref() } else { s.restricted.as_ref() };
        k.map(|k| &k.0)
    }

    /// Put the keys on a simulated part, as a factory would. With
    /// `master_only`, section keys are left for provisioning.
    pub fn install(&self, sim: &mut SimDevice, master_only: bool) {
        if let Some(m) = self.master {
            sim.set_master_key(m.0);
        }
        if master_only {
            return;
        }
        for s in &self.sections {
            if let Some(k) = s.full {
                sim.set_key(Kid::full(s.index), k.0);
            }
            if let Some(k) = s.restricted {
                sim.set_key(Kid::restricted(s.index), k.0);
            }
        }
    }
}
