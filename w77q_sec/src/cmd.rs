// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Secure command opcodes, carried in the low byte of the CTAG.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum SecCmd {
    None = 0x00,
    GetEssr = 0x11,
    GetWid = 0x14,
    GetSuid = 0x15,
    GetAwdtsr = 0x18,
    Sformat = 0x20,
    SetKey = 0x21,
    SetSuid = 0x22,
    SetGmc = 0x24,
    SetGmt = 0x25,
    SetAwdt = 0x26,
    AwdtTouch = 0x27,
    SetScr = 0x28,
    SetScrSwap = 0x29,
    SetRstResp = 0x2B,
    SetAclr = 0x2C,
    SetAwdtPlain = 0x2D,
    AwdtTouchPlain = 0x2E,
    Format = 0x30,
    GetKeysStatus = 0x31,
    GetGmc = 0x34,
    GetGmt = 0x35,
    GetAwdt = 0x36,
    GetScr = 0x38,
    GetRstResp = 0x3B,
    GetAclr = 0x3C,
    GetMc = 0x40,
    McMaint = 0x41,
    SessionOpen = 0x44,
    SessionClose = 0x45,
    InitSectionPa = 0x47,
    CalcCdi = 0x48,
    VerIntg = 0x49,
    PaGrant = 0x4C,
    PaGrantPlain = 0x4D,
    PaRevoke = 0x4E,
    GetTc = 0x50,
    CalcSig = 0x52,
    MemCrc = 0x54,
    GetRngr = 0x58,
    RngrPlain = 0x59,
    RngrCounter = 0x5A,
    Srd = 0x60,
    Sard = 0x61,
    LogSrd = 0x62,
    LogPrd = 0x63,
    Sawr = 0x64,
    MemCopy = 0x65,
    LogSawr = 0x66,
    LogPwr = 0x67,
    Serase4 = 0x68,
    Serase32 = 0x69,
    Serase64 = 0x6A,
    EraseSect = 0x6B,
    EraseAll = 0x6C,
    EraseSectPlain = 0x6F,
    GetVersion = 0xF0,
    Sleep = 0xF8,
    AwdtExpire = 0xFE,
}

/// Secure instruction opcodes. The line count of the bus occupies the high
/// nibble, so these are combined with a [`BusMode`] before use.
pub mod inst {
    pub const OP0: u8 = 0x0;
    pub const OP1: u8 = 0x1;
    pub const OP2: u8 = 0x2;
    /// Standard-format prefixes that bracket a split input buffer write.
    pub const WR_IBUF_START: u8 = 0x80;
    pub const WR_IBUF_END: u8 = 0x91;
    pub const DUMMY_CYCLES_OP2: u8 = 8;

    /// Early parts need a longer gap before the status comes out.
    pub fn dummy_cycles_op0(device_id: u8) -> u8 {
        if device_id <= 0x15 {
            32
        } else {
            8
        }
    }
}

/// Standard SPI flash instructions used for plain access.
pub mod std_cmd {
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const READ_STATUS: u8 = 0x05;
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const FAST_READ: u8 = 0x0B;
    pub const FAST_READ_DUMMY: u8 = 8;
    pub const SECTOR_ERASE: u8 = 0x20;
    pub const SUSPEND: u8 = 0x75;
    pub const RESUME: u8 = 0x7A;
    pub const POWER_DOWN: u8 = 0xB9;
    pub const RELEASE_POWER_DOWN: u8 = 0xAB;
    pub const DIE_SELECT: u8 = 0xC2;
    pub const WRITE_EXT_ADDR: u8 = 0xC5;
    /// Arms `RESET_DEVICE`; any other instruction in between disarms it.
    pub const RESET_ENABLE: u8 = 0x66;
    pub const RESET_DEVICE: u8 = 0x99;
    pub const SECTOR_SIZE: u32 = 0x1000;
    /// Write in progress, in status register 1.
    pub const STATUS_BUSY: u8 = 0x01;
    pub const PAGE_SIZE: u32 = 256;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusMode {
    Single,
    Dual,
    Quad,
    Octal,
}

impl BusMode {
    pub fn inst_lines(self) -> u8 {
        match self {
            BusMode::Single => 0xA0,
            BusMode::Dual => 0xB0,
            BusMode::Quad => 0xD0,
            BusMode::Octal => 0xF0,
        }
    }

    pub fn make_inst(self, op: u8, dtr: bool) -> u8 {
        let dtr = if dtr && self != BusMode::Octal { 1 << 2 } else { 0 };
        op | self.inst_lines() | dtr
    }
}

/// Command tag: opcode in the low byte, three parameter bytes above it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Ctag(pub u32);

impl Ctag {
    /// Set on SET_SCR when the new configuration is applied after a reset.
    pub const SCR_NEED_RESET: u32 = 0x0100_0000;

    pub fn plain(cmd: SecCmd) -> Ctag {
        Ctag(cmd as u32)
    }

    pub fn params(cmd: SecCmd, b1: u8, b2: u8, b3: u8) -> Ctag {
        Ctag(u32::from_le_bytes([cmd as u8, b1, b2, b3]))
    }

    pub fn mode(cmd: SecCmd, mode: u8) -> Ctag {
        Ctag::params(cmd, mode, 0, 0)
    }

    /// The 24 bit address goes in little endian byte order.
    pub fn addr(cmd: SecCmd, addr: u32) -> Ctag {
        let a = addr.to_le_bytes();
        Ctag::params(cmd, a[0], a[1], a[2])
    }

    /// Same opcode, with the three parameter bytes replaced by `addr`.
    pub fn with_addr(&self, addr: u32) -> Ctag {
        Ctag((self.0 & 0xff) | ((addr & 0xff_ffff) << 8))
    }

    pub fn opcode(&self) -> u8 {
        self.0 as u8
    }

    pub fn param(&self, i: usize) -> u8 {
        self.0.to_le_bytes()[i]
    }

    pub fn addr24(&self) -> u32 {
        self.0 >> 8
    }

    pub fn bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

/// Swap the byte order of a 24 bit value.
pub fn swap24(a: u32) -> u32 {
    ((a >> 16) & 0xff) | (a & 0xff00) | ((a & 0xff) << 16)
}

/// Key id: key type in the high nibble, section in the low nibble.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Kid(pub u8);

impl Kid {
    pub const RESTRICTED_ACCESS_SECTION: u8 = 0x00;
    pub const FULL_ACCESS_SECTION: u8 = 0x10;
    pub const SECTION_PROVISIONING: u8 = 0x20;
    pub const DEVICE_SECRET: Kid = Kid(0x8F);
    pub const DEVICE_MASTER: Kid = Kid(0x9F);
    pub const DEVICE_KEY_PROVISIONING: Kid = Kid(0xAF);
    pub const INVALID: Kid = Kid(0xFF);

    pub fn restricted(section: u8) -> Kid {
        Kid(Self::RESTRICTED_ACCESS_SECTION | (section & 0xf))
    }

    pub fn full(section: u8) -> Kid {
        Kid(Self::FULL_ACCESS_SECTION | (section & 0xf))
    }

    pub fn provisioning(section: u8) -> Kid {
        Kid(Self::SECTION_PROVISIONING | (section & 0xf))
    }

    pub fn key_type(&self) -> u8 {
        self.0 & 0xf0
    }

    pub fn section(&self) -> u8 {
        self.0 & 0x0f
    }

    pub fn is_full(&self) -> bool {
        self.key_type() == Self::FULL_ACCESS_SECTION
    }

    pub fn is_restricted(&self) -> bool {
        self.key_type() == Self::RESTRICTED_ACCESS_SECTION
    }

    /// Restricted or full key bound to a section.
    pub fn is_section_key(&self) -> bool {
        self.is_full() || self.is_restricted()
    }

    pub fn is_valid(&self) -> bool {
        *self != Kid::INVALID
    }
}

impl std::fmt::Debug for Kid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Kid({:#04x})", self.0)
    }
}

/// Data that can be read through CALC_SIG, with its id and size in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignedData {
    SectionDigest(u8),
    Wid,
    Suid,
    HwVer,
    MemoryRange,
    Ssr,
    Essr,
    Awdtcfg,
    Awdtsr,
    Mc,
    Gmc,
    Gmt,
    SectionConfig(u8),
}

impl SignedData {
    pub fn id(&self) -> u8 {
        match *self {
            SignedData::SectionDigest(s) => s & 0xf,
            SignedData::Wid => 0x10,
            SignedData::Suid => 0x14,
            SignedData::HwVer => 0x18,
            SignedData::MemoryRange => 0x1C,
            SignedData::Ssr => 0x20,
            SignedData::Essr => 0x21,
            SignedData::Awdtcfg => 0x24,
            SignedData::Awdtsr => 0x25,
            SignedData::Mc => 0x28,
            SignedData::Gmc => 0x30,
            SignedData::Gmt => 0x32,
            SignedData::SectionConfig(s) => 0x40 | (s & 0xf),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            SignedData::HwVer | SignedData::Ssr | SignedData::Awdtcfg | SignedData::Awdtsr => 4,
            SignedData::SectionDigest(_)
            | SignedData::Wid
            | SignedData::MemoryRange
            | SignedData::Essr
            | SignedData::Mc => 8,
            SignedData::Suid => 16,
            SignedData::Gmc | SignedData::Gmt | SignedData::SectionConfig(_) => 20,
        }
    }

    pub fn from_id(id: u8) -> Option<SignedData> {
        Some(match id {
            0x00..=0x0f => SignedData::SectionDigest(id),
            0x10 => SignedData::Wid,
            0x14 => SignedData::Suid,
            0x18 => SignedData::HwVer,
            0x1C => SignedData::MemoryRange,
            0x20 => SignedData::Ssr,
            0x21 => SignedData::Essr,
            0x24 => SignedData::Awdtcfg,
            0x25 => SignedData::Awdtsr,
            0x28 => SignedData::Mc,
            0x30 => SignedData::Gmc,
            0x32 => SignedData::Gmt,
            0x40..=0x4f => SignedData::SectionConfig(id & 0xf),
            _ => return None,
        })
    }
}

/// Mode byte builders, one per command family.
pub mod mode {
    pub fn session_open(include_wid: bool, ignore_scr_validity: bool) -> u8 {
        u8::from(include_wid) | (u8::from(ignore_scr_validity) << 1)
    }

    pub fn session_close(revoke_pa: bool) -> u8 {
        u8::from(revoke_pa)
    }

    pub fn set_scr(reset: bool, reload: bool) -> u8 {
        u8::from(reset) | (u8::from(reload) << 1)
    }

    pub fn format(reset: bool, default: bool, init: bool) -> u8 {
        u8::from(reset) | (u8::from(default) << 1) | (u8::from(init) << 2)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display)]
pub enum EraseType {
    #[strum(serialize = "4k")]
    Sector4K,
    #[strum(serialize = "32k")]
    Block32K,
    #[strum(serialize = "64k")]
    Block64K,
    #[strum(serialize = "section")]
    Section,
    #[strum(serialize = "chip")]
    Chip,
}

impl EraseType {
    pub fn cmd(self) -> SecCmd {
        match self {
            EraseType::Sector4K => SecCmd::Serase4,
            EraseType::Block32K => SecCmd::Serase32,
            EraseType::Block64K => SecCmd::Serase64,
            EraseType::Section => SecCmd::EraseSect,
            EraseType::Chip => SecCmd::EraseAll,
        }
    }

    /// Bytes covered by one erase, for the address-based types.
    pub fn size(self) -> Option<u32> {
        match self {
            EraseType::Sector4K => Some(0x1000),
            EraseType::Block32K => Some(0x8000),
            EraseType::Block64K => Some(0x1_0000),
            EraseType::Section | EraseType::Chip => None,
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display, FromPrimitive)]
#[strum(serialize_all = "kebab-case")]
pub enum PaRevokeType {
    Read = 1,
    Write = 2,
    All = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display, Deserialize, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SessionAccess {
    Restricted,
    /// Full key, opened even if the section configuration is invalid.
    ConfigOnly,
    Full,
}

/// What the device does once a new section configuration is written.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display, Deserialize, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ConfigAction {
    /// Stored only; the open session ends and plain access is withdrawn.
    None,
    /// Take effect at once, keeping the session.
    Reload,
    /// Reset the part, which applies it.
    Reset,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display, FromPrimitive)]
#[strum(serialize_all = "kebab-case")]
pub enum IntegrityType {
    Crc = 0,
    Digest = 1,
}
