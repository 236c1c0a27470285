// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitfield::bitfield;

bitfield! {
    /// Secure Status Register, returned by OP0 after every secure command.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Ssr(u32);
    impl Debug;
    pub busy, set_busy: 0;
    pub err, set_err: 2;
    pub ses_ready, set_ses_ready: 4;
    pub resp_ready, set_resp_ready: 5;
    pub por, set_por: 6;
    pub fb_remap, set_fb_remap: 7;
    pub awdt_exp, set_awdt_exp: 8;
    pub ses_err, set_ses_err: 10;
    pub intg_err, set_intg_err: 12;
    pub auth_err, set_auth_err: 13;
    pub priv_err, set_priv_err: 14;
    pub ignore_err, set_ignore_err: 15;
    pub sys_err, set_sys_err: 16;
    pub flash_err, set_flash_err: 17;
    pub mc_err, set_mc_err: 19;
    pub u8, mc_maint, set_mc_maint: 21, 20;
    pub suspend_e, set_suspend_e: 22;
    pub suspend_w, set_suspend_w: 23;
    pub u8, state, set_state: 26, 24;
    pub full_priv, set_full_priv: 27;
    pub u8, kid, set_kid: 31, 28;
}

impl Ssr {
    pub const BUSY: u32 = 1 << 0;
    pub const ERR: u32 = 1 << 2;
    pub const SES_ERR: u32 = 1 << 10;
    pub const INTG_ERR: u32 = 1 << 12;
    pub const AUTH_ERR: u32 = 1 << 13;
    pub const PRIV_ERR: u32 = 1 << 14;
    pub const IGNORE_ERR: u32 = 1 << 15;
    pub const SYS_ERR: u32 = 1 << 16;
    pub const FLASH_ERR: u32 = 1 << 17;
    pub const MC_ERR: u32 = 1 << 19;

    /// Every sticky error bit, plus busy.
    pub const ALL_ERRORS: u32 = Self::SES_ERR
        | Self::INTG_ERR
        | Self::AUTH_ERR
        | Self::PRIV_ERR
        | Self::IGNORE_ERR
        | Self::SYS_ERR
        | Self::FLASH_ERR
        | Self::MC_ERR
        | Self::ERR
        | Self::BUSY;

    /// Used after commands that may legitimately leave the integrity bit set.
    pub const IGNORE_INTEG_ERR: u32 = Self::AUTH_ERR
        | Self::PRIV_ERR
        | Self::IGNORE_ERR
        | Self::SYS_ERR
        | Self::FLASH_ERR
        | Self::MC_ERR
        | Self::BUSY;

    /// Used after commands whose "ignored" indication is not an error.
    pub const IGNORE_IGNORE_ERR: u32 = Self::INTG_ERR
        | Self::AUTH_ERR
        | Self::PRIV_ERR
        | Self::SYS_ERR
        | Self::FLASH_ERR
        | Self::MC_ERR
        | Self::BUSY;

    pub const STATE_IN_RESET: u8 = 0;
    pub const STATE_WORKING: u8 = 2;
    pub const STATE_LOCKED: u8 = 4;
    const STATE_WORKING_MASK: u8 = 6;

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn errors(&self) -> u32 {
        self.0 & Self::ALL_ERRORS
    }

    pub fn clear(&mut self, mask: u32) {
        self.0 &= !mask;
    }

    pub fn raise(&mut self, mask: u32) {
        self.0 |= mask;
    }

    pub fn is_working(&self) -> bool {
        self.state() & Self::STATE_WORKING_MASK != 0
    }
}

impl From<u32> for Ssr {
    fn from(v: u32) -> Self {
        Ssr(v)
    }
}

impl From<Ssr> for u32 {
    fn from(v: Ssr) -> Self {
        v.0
    }
}

bitfield! {
    /// Extended status: the SSR in the low word, die and ECC details above.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Essr(u64);
    impl Debug;
    pub u32, ssr_bits, set_ssr_bits: 31, 0;
    pub u8, die_id, set_die_id: 33, 32;
    pub rng_rdy, set_rng_rdy: 36;
    pub awdt_75, set_awdt_75: 37;
    pub cmvp_done, set_cmvp_done: 38;
    pub cmvp_pass, set_cmvp_pass: 39;
    pub ecc_sec, set_ecc_sec: 40;
    pub ecc_ded, set_ecc_ded: 41;
    pub ecc_dis, set_ecc_dis: 42;
    pub u8, kid_msb, set_kid_msb: 63, 60;
}

impl Essr {
    pub fn ssr(&self) -> Ssr {
        Ssr(self.ssr_bits())
    }

    pub fn bits(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Essr {
    fn from(v: u64) -> Self {
        Essr(v)
    }
}

bitfield! {
    /// Transaction counter as reported by GET_TC and CALC_SIG.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct Tc(u32);
    impl Debug;
    pub u32, cntr, set_cntr: 29, 0;
    pub u8, die, set_die: 31, 30;
}

impl Tc {
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl From<u32> for Tc {
    fn from(v: u32) -> Self {
        Tc(v)
    }
}

bitfield! {
    /// Secure part of the hardware version. `flash_size` holds the standard
    /// device id (0x15 for 32Mb, one more per doubling).
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct HwVer(u32);
    impl Debug;
    pub u8, revision, set_revision: 3, 0;
    pub u8, hash_ver, set_hash_ver: 7, 4;
    pub u8, sec_ver, set_sec_ver: 15, 8;
    pub u8, flash_size, set_flash_size: 23, 16;
    pub u8, flash_ver, set_flash_ver: 30, 24;
    pub db, set_db: 31;
}

impl HwVer {
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl From<u32> for HwVer {
    fn from(v: u32) -> Self {
        HwVer(v)
    }
}

bitfield! {
    /// Which key slots hold a provisioned key.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct KeysStatus(u64);
    impl Debug;
    pub u16, restricted, set_restricted: 8, 0;
    pub u16, full, set_full: 24, 16;
    pub u16, lms, set_lms: 40, 32;
    pub secret, set_secret: 48;
    pub master, set_master: 49;
    pub pre_prov_master, set_pre_prov_master: 50;
}

impl KeysStatus {
    pub fn bits(&self) -> u64 {
        self.0
    }
}

impl From<u64> for KeysStatus {
    fn from(v: u64) -> Self {
        KeysStatus(v)
    }
}

/// Watchdog status register. The split between whole-seconds value and
/// residue ticks depends on whether the device counts quarter seconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Awdtsr(pub u32);

impl Awdtsr {
    const EXP: u32 = 1 << 31;

    fn val_bits(fract: bool) -> u32 {
        20 + if fract { 2 } else { 0 }
    }

    pub fn new(val: u32, residue: u32, expired: bool, fract: bool) -> Awdtsr {
        let vb = Self::val_bits(fract);
        let rb = 31 - vb;
        let mut v = val & ((1 << vb) - 1);
        v |= (residue & ((1 << rb) - 1)) << vb;
        if expired {
            v |= Self::EXP;
        }
        Awdtsr(v)
    }

    pub fn val(&self, fract: bool) -> u32 {
        self.0 & ((1 << Self::val_bits(fract)) - 1)
    }

    pub fn residue(&self, fract: bool) -> u32 {
        let vb = Self::val_bits(fract);
        (self.0 >> vb) & ((1 << (31 - vb)) - 1)
    }

    pub fn expired(&self) -> bool {
        self.0 & Self::EXP != 0
    }

    /// Time since the last touch, in milliseconds.
    pub fn elapsed_ms(&self, fract: bool, osc_rate_hz: u32) -> u32 {
        let whole = self.val(fract) * if fract { 250 } else { 1000 };
        if osc_rate_hz == 0 {
            return whole;
        }
        let res = u64::from(self.residue(fract)) * 64 * 1000 / u64::from(osc_rate_hz);
        whole + res as u32
    }
}
