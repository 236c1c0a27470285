// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use w77q_regs::status::HwVer;
use w77q_regs::NUM_MAIN_SECTIONS;

use crate::error::{QlibError, Result};

/// Device behaviours that vary between parts. Errata workarounds are
/// features too, so they are selected the same way.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Feature {
    Essr,
    EssrKidMsb,
    Rng,
    Tc30Bit,
    SecSizeScale,
    ExtendSecLenBits,
    GetKeysStatus,
    SessionCloseNotSupported,
    /// SESSION_OPEN occasionally reports SYS_ERR although it succeeded.
    OpenSessSysErr,
    /// SET_SCR/SET_GMC/SET_GMT occasionally fail with SYS_ERR.
    SetCmdFail,
    /// False error after SET_SCR sent as split OP1 at low VCC.
    SetScrErrata289,
    SplitIbuf,
    SplitIbufCtagOnlyFirst,
    CalcCdi,
    MemCrc,
    MemCopy,
    PlainErase,
    Sleep,
    Ecc,
    PaGrantRevoke,
    VerIntgDigest,
    AwdtValSecFract,
    AwdtOscRateFrac,
    SecureLog,
    Vault,
    RstResp,
}

impl Feature {
    fn bit(self) -> u64 {
        1 << (self as u8)
    }
}

#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Features(u64);

impl Features {
    pub fn has(&self, f: Feature) -> bool {
        self.0 & f.bit() != 0
    }

    pub fn add(&mut self, f: Feature) {
        self.0 |= f.bit();
    }

    pub fn remove(&mut self, f: Feature) {
        self.0 &= !f.bit();
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        Feature::iter().filter(move |f| self.has(*f))
    }
}

impl std::fmt::Debug for Features {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Feature> for Features {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        let mut fs = Features::default();
        for f in iter {
            fs.add(f);
        }
        fs
    }
}

/// Known parts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display, Deserialize, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    /// 32Mb, 1.8V
    W77q32jwRevB,
    W77q64jwRevA,
    W77q128jwRevA,
    /// 3.3V parts
    W77q64jvRevA,
    W77q128jvRevA,
    W77q25nwxxiRevA,
    /// Automotive, with ECC
    W77q25nwxxaRevA,
    /// Octal bus
    W77t25nwxxiRevA,
    W77t25nwxxaRevA,
}

impl Target {
    const SIZE_32MB: u8 = 0x15;
    const SIZE_64MB: u8 = 0x16;
    const SIZE_128MB: u8 = 0x17;

    /// Identify the part from the secure version, flash size and flash
    /// variant fields of HW_VER.
    pub fn from_hw_ver(hw: HwVer) -> Result<Target> {
        let t = match (hw.sec_ver(), hw.flash_size(), hw.flash_ver()) {
            (2, Self::SIZE_32MB, _) => Target::W77q32jwRevB,
            (2, Self::SIZE_64MB, 0) => Target::W77q64jwRevA,
            (2, Self::SIZE_128MB, 0) => Target::W77q128jwRevA,
            (2, Self::SIZE_64MB, 1) => Target::W77q64jvRevA,
            (2, Self::SIZE_128MB, 1) => Target::W77q128jvRevA,
            (3, _, 0) => Target::W77q25nwxxiRevA,
            (3, _, 1) => Target::W77q25nwxxaRevA,
            (3, _, 2) => Target::W77t25nwxxiRevA,
            (3, _, 3) => Target::W77t25nwxxaRevA,
            _ => return Err(QlibError::NotSupported("unrecognised HW_VER")),
        };
        Ok(t)
    }

    pub fn is_q2(&self) -> bool {
        matches!(
            self,
            Target::W77q32jwRevB
                | Target::W77q64jwRevA
                | Target::W77q128jwRevA
                | Target::W77q64jvRevA
                | Target::W77q128jvRevA
        )
    }

    pub fn features(&self) -> Features {
        use Feature::*;
        let mut f = Features::default();
        if self.is_q2() {
            f.add(RstResp);
            f.add(AwdtOscRateFrac);
            match self {
                Target::W77q32jwRevB => f.add(SessionCloseNotSupported),
                _ => {
                    for x in [
                        ExtendSecLenBits,
                        Tc30Bit,
                        Essr,
                        SplitIbuf,
                        SplitIbufCtagOnlyFirst,
                        Rng,
                    ] {
                        f.add(x);
                    }
                    if matches!(self, Target::W77q64jwRevA | Target::W77q128jwRevA) {
                        f.add(SetScrErrata289);
                    }
                }
            }
        } else {
            for x in [
                ExtendSecLenBits,
                Tc30Bit,
                Essr,
                EssrKidMsb,
                SplitIbuf,
                Rng,
                SecSizeScale,
                GetKeysStatus,
                PaGrantRevoke,
                VerIntgDigest,
                AwdtValSecFract,
                SecureLog,
                MemCrc,
                MemCopy,
                CalcCdi,
                PlainErase,
                Sleep,
                Vault,
                OpenSessSysErr,
                SetCmdFail,
            ] {
                f.add(x);
            }
            if matches!(self, Target::W77q25nwxxaRevA | Target::W77t25nwxxaRevA) {
                f.add(Ecc);
            }
        }
        f
    }
}

/// Everything the library needs to know about the attached part, resolved
/// once by `cfg_init`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub target: Target,
    pub features: Features,
    pub hw_ver: HwVer,
    pub num_dies: usize,
    /// Standard device id, which picks the OP0 dummy cycles.
    pub device_id: u8,
}

impl Capabilities {
    pub fn from_target(target: Target) -> Capabilities {
        Capabilities {
            target,
            features: target.features(),
            hw_ver: HwVer::default(),
            num_dies: 1,
            device_id: 0x18,
        }
    }

    pub fn from_hw_ver(hw: HwVer) -> Result<Capabilities> {
        let target = Target::from_hw_ver(hw)?;
        Ok(Capabilities {
            hw_ver: hw,
            device_id: hw.flash_size(),
            ..Capabilities::from_target(target)
        })
    }

    pub fn has(&self, f: Feature) -> bool {
        self.features.has(f)
    }

    /// Fail before any bus activity if the part lacks `f`.
    pub fn require(&self, f: Feature, what: &'static str) -> Result<()> {
        if self.has(f) {
            Ok(())
        } else {
            Err(QlibError::NotSupported(what))
        }
    }

    pub fn num_sections(&self) -> usize {
        NUM_MAIN_SECTIONS + usize::from(self.has(Feature::Vault))
    }

    /// Extra section length bits in the SMR.
    pub fn sec_len_ext(&self) -> u8 {
        u8::from(self.has(Feature::ExtendSecLenBits))
    }
}
