// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{KB_64, MB_1};
use byteorder::{ByteOrder, LittleEndian};
use packed_struct::prelude::*;
use serde::{Deserialize, Serialize};

// The single-word registers below are declared lsb0 so the bit numbers match
// the datasheet. packed_struct emits such a word most significant byte first,
// so the register value is always recovered with from_be_bytes/to_be_bytes;
// the little endian wire order is applied later, when the word is serialized.

/// Watchdog timeout, as a power of two number of seconds.
#[derive(PrimitiveEnum, Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AwdtThreshold {
    Sec1 = 0,
    Sec2 = 1,
    Sec4 = 2,
    Sec8 = 3,
    Sec16 = 4,
    Sec32 = 5,
    Min1 = 6,
    Min2 = 7,
    Min4 = 8,
    Min8 = 9,
    Min17 = 10,
    Min34 = 11,
    Hour1 = 12,
    Hour2 = 13,
    Hour4 = 14,
    Hour9 = 15,
    Hour18 = 16,
    Hour36 = 17,
    Hour72 = 18,
    Day6 = 19,
    Day12 = 20,
}

impl AwdtThreshold {
    pub fn seconds(self) -> u64 {
        1u64 << (self as u8)
    }
}

/// Authenticated watchdog configuration (AWDTCFG).
#[derive(Debug, Clone, PartialEq, PackedStruct)]
#[packed_struct(size_bytes = "4", endian = "lsb", bit_numbering = "lsb0")]
pub struct Awdtcfg {
    #[packed_field(bits = "0")]
    pub enable: bool,
    /// Run the watchdog from the low frequency oscillator
    #[packed_field(bits = "1")]
    pub lf_osc_en: bool,
    /// Reset the flash on expiry
    #[packed_field(bits = "2")]
    pub sw_reset_en: bool,
    /// Touching the watchdog requires a session
    #[packed_field(bits = "3")]
    pub authenticated: bool,
    #[packed_field(bits = "4")]
    pub rsto_en: bool,
    #[packed_field(bits = "5")]
    pub rsti_ovrd: bool,
    #[packed_field(bits = "6")]
    pub rsti_en: bool,
    #[packed_field(bits = "7")]
    pub rst_in_en: bool,
    /// Section whose keys may touch an authenticated watchdog
    #[packed_field(bits = "8..=11")]
    pub kid: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(ty = "enum", bits = "12..=16")]
    pub threshold: EnumCatchAll<AwdtThreshold>,
    #[packed_field(bits = "17")]
    pub fallback_en: bool,
    #[packed_field(bits = "20..=23")]
    pub osc_rate_frac: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "24..=30")]
    pub osc_rate_khz: Integer<u8, packed_bits::Bits<7>>,
    #[packed_field(bits = "31")]
    pub lock: bool,
}

impl Awdtcfg {
    pub const OSC_RATE_KHZ_DEFAULT: u8 = 65;

    pub fn new(threshold: AwdtThreshold) -> Awdtcfg {
        Awdtcfg {
            enable: false,
            lf_osc_en: false,
            sw_reset_en: false,
            authenticated: false,
            rsto_en: false,
            rsti_ovrd: false,
            rsti_en: false,
            rst_in_en: false,
            kid: 0.into(),
            threshold: threshold.into(),
            fallback_en: false,
            osc_rate_frac: 0.into(),
            osc_rate_khz: Self::OSC_RATE_KHZ_DEFAULT.into(),
            lock: false,
        }
    }

    pub fn from_u32(v: u32) -> Result<Awdtcfg, PackingError> {
        Awdtcfg::unpack(&v.to_be_bytes())
    }

    pub fn to_u32(&self) -> Result<u32, PackingError> {
        Ok(u32::from_be_bytes(self.pack()?))
    }

    /// Oscillator rate in Hz. The fractional field is only meaningful on
    /// devices that implement it.
    pub fn osc_rate_hz(&self, with_frac: bool) -> u32 {
        let mut hz = u32::from(*self.osc_rate_khz) << 10;
        if with_frac {
            hz += u32::from(*self.osc_rate_frac) << 6;
        }
        hz
    }

    pub fn set_osc_rate_hz(&mut self, hz: u32) {
        self.osc_rate_khz = (((hz >> 10) & 0x7f) as u8).into();
        self.osc_rate_frac = (((hz >> 6) & 0xf) as u8).into();
    }

    /// Threshold as a number of seconds, if the field holds a known value.
    pub fn threshold_seconds(&self) -> Option<u64> {
        match self.threshold {
            EnumCatchAll::Enum(t) => Some(t.seconds()),
            EnumCatchAll::CatchAll(_) => None,
        }
    }
}

#[derive(PrimitiveEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum VaultConfig {
    DisabledRpmc8 = 0,
    Vault64KbRpmc4 = 2,
    Vault128KbRpmcDisabled = 3,
}

impl VaultConfig {
    pub fn size(self) -> u32 {
        match self {
            VaultConfig::DisabledRpmc8 => 0,
            VaultConfig::Vault64KbRpmc4 => KB_64,
            VaultConfig::Vault128KbRpmcDisabled => 2 * KB_64,
        }
    }
}

/// Device configuration word, the second word of GMC.
#[derive(Debug, Clone, PartialEq, PackedStruct)]
#[packed_struct(size_bytes = "4", endian = "lsb", bit_numbering = "lsb0")]
pub struct Devcfg {
    /// log2(section size) - log2(512KiB)
    #[packed_field(bits = "0..=2")]
    pub sect_sel: Integer<u8, packed_bits::Bits<3>>,
    #[packed_field(bits = "4")]
    pub rst_resp_en: bool,
    #[packed_field(bits = "5")]
    pub fb_en: bool,
    #[packed_field(bits = "6")]
    pub ck_specul: bool,
    #[packed_field(bits = "8")]
    pub format_en: bool,
    #[packed_field(bits = "9")]
    pub stm_en: bool,
    #[packed_field(bits = "10")]
    pub boot_fail_rst: bool,
    #[packed_field(bits = "13")]
    pub ctag_mode: bool,
    #[packed_field(ty = "enum", bits = "14..=15")]
    pub vault: EnumCatchAll<VaultConfig>,
    #[packed_field(bits = "16")]
    pub rng_pa_en: bool,
    /// Reserved, must be written as one
    #[packed_field(bits = "17..=19")]
    pub reserved_ones: Integer<u8, packed_bits::Bits<3>>,
    /// Sections that get plain access after reset
    #[packed_field(bits = "20..=27")]
    pub rst_pa: u8,
    #[packed_field(bits = "31")]
    pub cfg_lock: bool,
}

impl Devcfg {
    pub fn new() -> Devcfg {
        Devcfg {
            sect_sel: 0.into(),
            rst_resp_en: false,
            fb_en: false,
            ck_specul: false,
            format_en: false,
            stm_en: false,
            boot_fail_rst: false,
            ctag_mode: false,
            vault: VaultConfig::DisabledRpmc8.into(),
            rng_pa_en: false,
            reserved_ones: 0x7.into(),
            rst_pa: 0,
            cfg_lock: false,
        }
    }

    pub fn from_u32(v: u32) -> Result<Devcfg, PackingError> {
        Devcfg::unpack(&v.to_be_bytes())
    }

    pub fn to_u32(&self) -> Result<u32, PackingError> {
        Ok(u32::from_be_bytes(self.pack()?))
    }

    pub fn vault_size(&self) -> u32 {
        match self.vault {
            EnumCatchAll::Enum(v) => v.size(),
            EnumCatchAll::CatchAll(_) => 0,
        }
    }
}

impl Default for Devcfg {
    fn default() -> Self {
        Self::new()
    }
}

/// Access control lock register. A set bit locks the section until reset.
#[derive(Debug, Clone, Default, PartialEq, PackedStruct)]
#[packed_struct(size_bytes = "4", endian = "lsb", bit_numbering = "lsb0")]
pub struct Aclr {
    #[packed_field(bits = "0..=7")]
    pub wr_lock: u8,
    #[packed_field(bits = "8")]
    pub wr_lock_vault: bool,
    #[packed_field(bits = "16..=23")]
    pub rd_lock: u8,
    #[packed_field(bits = "24")]
    pub rd_lock_vault: bool,
}

impl Aclr {
    pub fn from_u32(v: u32) -> Result<Aclr, PackingError> {
        Aclr::unpack(&v.to_be_bytes())
    }

    pub fn to_u32(&self) -> Result<u32, PackingError> {
        Ok(u32::from_be_bytes(self.pack()?))
    }
}

/// Section security policy, the first word of each SCR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PackedStruct, Deserialize, Serialize)]
#[packed_struct(size_bytes = "4", endian = "lsb", bit_numbering = "lsb0")]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Sspr {
    /// Configuration changes need the full access key
    #[packed_field(bits = "0")]
    pub auth_cfg: bool,
    /// Integrity check happens on access rather than at boot
    #[packed_field(bits = "1")]
    pub integrity_ac: bool,
    /// Write protect
    #[packed_field(bits = "2")]
    pub wp_en: bool,
    #[packed_field(bits = "3")]
    pub rollback_en: bool,
    /// Plain reads allowed
    #[packed_field(bits = "4")]
    pub pa_rd_en: bool,
    /// Plain writes allowed
    #[packed_field(bits = "5")]
    pub pa_wr_en: bool,
    /// Plain access must first be granted by an authenticated command
    #[packed_field(bits = "6")]
    pub auth_pa: bool,
    #[packed_field(bits = "7")]
    pub auth_ac: bool,
    /// Section is a secure log
    #[packed_field(bits = "8")]
    pub slog: bool,
}

impl Sspr {
    pub fn from_u32(v: u32) -> Result<Sspr, PackingError> {
        Sspr::unpack(&v.to_be_bytes())
    }

    pub fn to_u32(&self) -> Result<u32, PackingError> {
        Ok(u32::from_be_bytes(self.pack()?))
    }
}

/// Section configuration register, 160 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PackedStruct)]
#[packed_struct(size_bytes = "20", bit_numbering = "msb0", endian = "msb")]
pub struct Scr {
    #[packed_field(bytes = "0..=3", endian = "lsb")]
    pub sspr: u32,
    #[packed_field(bytes = "4..=7", endian = "lsb")]
    pub checksum: u32,
    #[packed_field(bytes = "8..=15", endian = "lsb")]
    pub digest: u64,
    #[packed_field(bytes = "16..=19", endian = "lsb")]
    pub version: u32,
}

impl Scr {
    pub fn policy(&self) -> Result<Sspr, PackingError> {
        Sspr::from_u32(self.sspr)
    }
}

/// Global memory configuration, 160 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PackedStruct)]
#[packed_struct(size_bytes = "20", bit_numbering = "msb0", endian = "msb")]
pub struct Gmc {
    /// Watchdog configuration applied after reset
    #[packed_field(bytes = "0..=3", endian = "lsb")]
    pub awdt_dflt: u32,
    #[packed_field(bytes = "4..=7", endian = "lsb")]
    pub devcfg: u32,
    #[packed_field(bytes = "8..=15")]
    _reserved: [u8; 8],
    #[packed_field(bytes = "16..=19", endian = "lsb")]
    pub version: u32,
}

impl Gmc {
    pub fn new(awdt_dflt: u32, devcfg: u32, version: u32) -> Gmc {
        Gmc {
            awdt_dflt,
            devcfg,
            _reserved: [0; 8],
            version,
        }
    }

    pub fn devcfg(&self) -> Result<Devcfg, PackingError> {
        Devcfg::from_u32(self.devcfg)
    }
}

/// Global mapping table: one section mapping register per main section,
/// then a version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PackedStruct)]
#[packed_struct(size_bytes = "20", bit_numbering = "msb0", endian = "msb")]
pub struct Gmt {
    #[packed_field(bytes = "0..=15")]
    section_map: [u8; 16],
    #[packed_field(bytes = "16..=19", endian = "lsb")]
    pub version: u32,
}

impl Default for Gmt {
    /// The erased state, which reads as "not configured".
    fn default() -> Self {
        Gmt {
            section_map: [0xff; 16],
            version: 0,
        }
    }
}

impl Gmt {
    pub fn smr(&self, section: usize) -> Smr {
        Smr(LittleEndian::read_u16(&self.section_map[section * 2..]))
    }

    pub fn set_smr(&mut self, section: usize, smr: Smr) {
        LittleEndian::write_u16(&mut self.section_map[section * 2..], smr.0);
    }

    pub fn is_configured(&self) -> bool {
        self.smr(0).0 != 0xffff
    }
}

/// Section mapping register. The split between base and length fields
/// moves by `ext` bits on parts with a larger length field.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Smr(pub u16);

impl Smr {
    const TOP: u16 = 1 << 15;

    fn base_bits(ext: u8) -> u32 {
        12 - u32::from(ext)
    }

    fn len_bits(ext: u8) -> u32 {
        3 + u32::from(ext)
    }

    pub fn new(base_tag: u16, len_tag: u16, top: bool, ext: u8) -> Smr {
        let bb = Self::base_bits(ext);
        let lb = Self::len_bits(ext);
        let mut v = base_tag & ((1 << bb) - 1);
        v |= (len_tag & ((1 << lb) - 1)) << bb;
        if top {
            v |= Self::TOP;
        }
        Smr(v)
    }

    pub fn base_tag(&self, ext: u8) -> u16 {
        self.0 & ((1 << Self::base_bits(ext)) - 1)
    }

    pub fn len_tag(&self, ext: u8) -> u16 {
        (self.0 >> Self::base_bits(ext)) & ((1 << Self::len_bits(ext)) - 1)
    }

    /// Bit 15: "enable" on older parts, "scale" on parts with size scaling.
    pub fn top(&self) -> bool {
        self.0 & Self::TOP != 0
    }

    pub fn base_bytes(&self, ext: u8) -> u32 {
        u32::from(self.base_tag(ext)) << 16
    }
}

/// Section length in bytes for a length tag.
pub fn len_tag_to_bytes(len_tag: u16, scale: bool, size_scale: bool) -> u32 {
    let len_tag = u32::from(len_tag);
    if size_scale {
        if len_tag == 0 && !scale {
            0
        } else {
            (if scale { KB_64 } else { MB_1 }) * (1 + len_tag)
        }
    } else {
        KB_64 << len_tag
    }
}

/// Inverse of [`len_tag_to_bytes`], returning the tag and scale bit.
pub fn len_bytes_to_tag(len: u32, size_scale: bool) -> (u16, bool) {
    if size_scale {
        if len == 0 {
            (0, false)
        } else if len > MB_1 {
            (((len >> 20) - 1) as u16, false)
        } else {
            (((len >> 16) - 1) as u16, true)
        }
    } else {
        ((len >> 16).max(1).trailing_zeros() as u16, false)
    }
}
