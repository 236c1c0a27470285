// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A software model of one W77Q die behind a [`Bus`].
//!
//! The model speaks the same wire protocol as the part: OP0/OP1/OP2
//! framing, split input buffers, counter-salted signatures and the XOR
//! cipher. It keeps a small flash array (eight 64KiB sections plus an
//! optional vault), the keys, the configuration registers and the
//! watchdog, so every operation of the driver can be exercised without
//! hardware. Time only moves when [`SimDevice::advance`] is called.
//!
//! A handful of hooks let tests inject the faults the driver must cope
//! with: corrupted signatures, a stuck BUSY bit, error bits on a chosen
//! command, a session lost mid-command and a part that ignores software
//! resets.

use byteorder::{ByteOrder, LittleEndian};
use crc_any::CRC;
use log::{debug, trace};
use num_traits::FromPrimitive;
use packed_struct::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use w77q_regs::config::{
    len_tag_to_bytes, Aclr, AwdtThreshold, Awdtcfg, Devcfg, Gmc, Gmt, Scr, Smr, Sspr, VaultConfig,
};
use w77q_regs::status::{Awdtsr, Essr, HwVer, KeysStatus, Ssr};
use w77q_regs::{KB_64, NUM_MAIN_SECTIONS, NUM_SECTIONS, SECTION_VAULT};

use crate::cfg::{Feature, Features, Target};
use crate::cmd::{inst, std_cmd, Ctag, Kid, SecCmd, SignedData};
use crate::cmd_proc::{next_tc, SIG_SIZE};
use crate::crypto::{self, CipherKey, Direction, HashBuf, HashEngine, Key, Sha256Engine};
use crate::error::BusError;
use crate::tm::{Bus, Transaction};

const CTAG_SIZE: usize = 4;
const PAGE: usize = 32;
const LOG_ENTRY: usize = 16;
const MAIN_FLASH_SIZE: usize = NUM_MAIN_SECTIONS * KB_64 as usize;
const VAULT_MAX: usize = 2 * KB_64 as usize;
const TC_30_BIT_MAX: u32 = 0x3FFF_FFFF;

/// Outcome of one secure command: an optional response, or the SSR error
/// bits it raises.
type Reply = std::result::Result<Option<Vec<u8>>, u32>;
type SimResult<T> = std::result::Result<T, u32>;

#[derive(Clone, Copy, Debug)]
struct Fault {
    cmd: SecCmd,
    bits: u32,
    execute: bool,
    end_session: bool,
}

/// Which storage array a section lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Region {
    Main,
    Vault,
}

/// Simulated single-die W77Q part.
pub struct SimDevice {
    target: Target,
    features: Features,
    hw_ver: HwVer,
    hash: Sha256Engine,

    flash: Vec<u8>,
    vault: Vec<u8>,
    logs: Vec<Vec<[u8; LOG_ENTRY]>>,

    keys: HashMap<Kid, Key>,
    session: Option<(Kid, Key)>,
    tc: u32,
    dmc: u32,
    wid: u64,
    suid: [u8; 16],

    gmc: Gmc,
    gmt: Gmt,
    scr: [Scr; NUM_SECTIONS],
    pending_scr: [Option<Scr>; NUM_SECTIONS],
    pending_swap: [bool; NUM_SECTIONS],
    aclr: Aclr,
    granted_rd: [bool; NUM_MAIN_SECTIONS],
    granted_wr: [bool; NUM_MAIN_SECTIONS],
    rst_resp: [u8; 128],

    awdt: Awdtcfg,
    awdt_touched_ms: u64,
    awdt_expired: bool,
    now_ms: u64,

    errors: u32,
    por: bool,
    mc_maint: u8,
    ecc: (bool, bool),
    resp_ready: bool,
    obuf: Vec<u8>,
    split: Option<Vec<u8>>,
    write_enabled: bool,
    reset_armed: bool,
    ext_addr: u8,
    powered_down: bool,
    suspended: bool,

    rng_state: u64,
    rng_count: u128,

    transactions: usize,
    corrupt_sig: bool,
    stuck_busy: bool,
    ignore_resets: bool,
    faults: Vec<Fault>,
}

fn hw_ver_for(target: Target) -> HwVer {
    let (sec, size, ver) = match target {
        Target::W77q32jwRevB => (2, 0x15, 0),
        Target::W77q64jwRevA => (2, 0x16, 0),
        Target::W77q128jwRevA => (2, 0x17, 0),
        Target::W77q64jvRevA => (2, 0x16, 1),
        Target::W77q128jvRevA => (2, 0x17, 1),
        Target::W77q25nwxxiRevA => (3, 0x18, 0),
        Target::W77q25nwxxaRevA => (3, 0x18, 1),
        Target::W77t25nwxxiRevA => (3, 0x18, 2),
        Target::W77t25nwxxaRevA => (3, 0x18, 3),
    };
    let mut hw = HwVer::default();
    hw.set_revision(1);
    hw.set_hash_ver(1);
    hw.set_sec_ver(sec);
    hw.set_flash_size(size);
    hw.set_flash_ver(ver);
    hw
}

/// The factory section map: section `i` at `i * 64KiB`, 64KiB long.
fn default_gmt(features: &Features) -> Gmt {
    let ext = u8::from(features.has(Feature::ExtendSecLenBits));
    let mut gmt = Gmt::default();
    for i in 0..NUM_MAIN_SECTIONS {
        gmt.set_smr(i, Smr::new(i as u16, 0, true, ext));
    }
    gmt
}

fn default_gmc(features: &Features) -> Gmc {
    let mut devcfg = Devcfg::new();
    devcfg.format_en = true;
    if features.has(Feature::Vault) {
        devcfg.vault = VaultConfig::Vault64KbRpmc4.into();
    }
    let awdt = Awdtcfg::new(AwdtThreshold::Sec16).to_u32().unwrap_or_default();
    Gmc::new(awdt, devcfg.to_u32().unwrap_or_default(), 0)
}

/// Secure instruction decoding: the high nibble names the bus format, the
/// low bits the operation with the DTR bit masked off.
fn secure_op(cmd: u8) -> Option<u8> {
    if !matches!(cmd >> 4, 0xA | 0xB | 0xD | 0xF) {
        return None;
    }
    let op = cmd & 0x0b;
    (op <= inst::OP2).then_some(op)
}

fn read_u32(data: &[u8], at: usize) -> SimResult<u32> {
    data.get(at..at + 4).map(LittleEndian::read_u32).ok_or(Ssr::ERR)
}

fn reply(b: impl Into<Vec<u8>>) -> Reply {
    Ok(Some(b.into()))
}

fn packed<const N: usize>(r: std::result::Result<[u8; N], PackingError>) -> Reply {
    reply(r.map_err(|_| Ssr::ERR)?)
}

impl SimDevice {
    pub fn new(target: Target) -> SimDevice {
        let features = target.features();
        let gmc = default_gmc(&features);
        let awdt = Awdtcfg::from_u32(gmc.awdt_dflt).unwrap_or_else(|_| Awdtcfg::new(AwdtThreshold::Sec16));
        SimDevice {
            target,
            hw_ver: hw_ver_for(target),
            hash: Sha256Engine::default(),
            flash: vec![0xff; MAIN_FLASH_SIZE],
            vault: vec![0xff; VAULT_MAX],
            logs: vec![Vec::new(); NUM_MAIN_SECTIONS],
            keys: HashMap::new(),
            session: None,
            tc: 0,
            dmc: 0,
            wid: 0x0123_4567_89ab_cdef,
            suid: [0; 16],
            gmt: default_gmt(&features),
            gmc,
            scr: [Scr::default(); NUM_SECTIONS],
            pending_scr: [None; NUM_SECTIONS],
            pending_swap: [false; NUM_SECTIONS],
            aclr: Aclr::default(),
            granted_rd: [false; NUM_MAIN_SECTIONS],
            granted_wr: [false; NUM_MAIN_SECTIONS],
            rst_resp: [0; 128],
            awdt,
            awdt_touched_ms: 0,
            awdt_expired: false,
            now_ms: 0,
            errors: 0,
            por: true,
            mc_maint: 0,
            ecc: (false, false),
            resp_ready: false,
            obuf: Vec::new(),
            split: None,
            write_enabled: false,
            reset_armed: false,
            ext_addr: 0,
            powered_down: false,
            suspended: false,
            rng_state: 0x9e37_79b9_7f4a_7c15,
            rng_count: 0,
            transactions: 0,
            corrupt_sig: false,
            stuck_busy: false,
            ignore_resets: false,
            faults: Vec::new(),
            features,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    // --- setup and inspection ---

    pub fn set_master_key(&mut self, key: Key) {
        self.keys.insert(Kid::DEVICE_MASTER, key);
    }

    pub fn set_key(&mut self, kid: Kid, key: Key) {
        self.keys.insert(kid, key);
    }

    pub fn key(&self, kid: Kid) -> Option<Key> {
        self.keys.get(&kid).copied()
    }

    pub fn set_scr(&mut self, section: u8, scr: Scr) {
        if let Some(s) = self.scr.get_mut(usize::from(section)) {
            *s = scr;
        }
    }

    pub fn scr(&self, section: u8) -> Option<Scr> {
        self.scr.get(usize::from(section)).copied()
    }

    /// Install a section policy, keeping the rest of the SCR.
    pub fn set_policy(&mut self, section: u8, policy: Sspr) {
        if let (Some(s), Ok(v)) = (self.scr.get_mut(usize::from(section)), policy.to_u32()) {
            s.sspr = v;
        }
    }

    pub fn set_gmc(&mut self, gmc: Gmc) {
        self.gmc = gmc;
    }

    pub fn gmc(&self) -> Gmc {
        self.gmc
    }

    pub fn set_gmt(&mut self, gmt: Gmt) {
        self.gmt = gmt;
    }

    pub fn set_mc(&mut self, tc: u32, dmc: u32) {
        self.tc = tc;
        self.dmc = dmc;
    }

    pub fn mc(&self) -> [u32; 2] {
        [self.tc, self.dmc]
    }

    pub fn set_wid(&mut self, wid: u64) {
        self.wid = wid;
    }

    pub fn wid(&self) -> u64 {
        self.wid
    }

    pub fn set_mc_maint(&mut self, level: u8) {
        self.mc_maint = level & 3;
    }

    /// Report single and double bit ECC events in ESSR.
    pub fn set_ecc_events(&mut self, corrected: bool, uncorrectable: bool) {
        self.ecc = (corrected, uncorrectable);
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut [u8] {
        &mut self.flash
    }

    pub fn awdt(&self) -> &Awdtcfg {
        &self.awdt
    }

    pub fn session_kid(&self) -> Option<Kid> {
        self.session.map(|(k, _)| k)
    }

    pub fn plain_granted(&self, section: u8) -> (bool, bool) {
        let s = usize::from(section);
        match (self.granted_rd.get(s), self.granted_wr.get(s)) {
            (Some(&rd), Some(&wr)) => (rd, wr),
            _ => (false, false),
        }
    }

    /// Number of bus transactions seen so far.
    pub fn transactions(&self) -> usize {
        self.transactions
    }

    // --- fault injection ---

    /// The next signature the device computes, for checking or for a
    /// response, is off by one bit.
    pub fn corrupt_next_signature(&mut self) {
        self.corrupt_sig = true;
    }

    pub fn set_stuck_busy(&mut self, busy: bool) {
        self.stuck_busy = busy;
    }

    /// The next `cmd` is dropped and raises `bits` instead.
    pub fn fail_next(&mut self, cmd: SecCmd, bits: u32) {
        self.faults.push(Fault {
            cmd,
            bits,
            execute: false,
            end_session: false,
        });
    }

    /// Like [`fail_next`](Self::fail_next), and the session is lost too.
    pub fn fail_next_ending_session(&mut self, cmd: SecCmd, bits: u32) {
        self.faults.push(Fault {
            cmd,
            bits,
            execute: false,
            end_session: true,
        });
    }

    /// The next `cmd` runs normally and additionally raises `bits`.
    pub fn flag_next(&mut self, cmd: SecCmd, bits: u32) {
        self.faults.push(Fault {
            cmd,
            bits,
            execute: true,
            end_session: false,
        });
    }

    /// While set, RESET_DEVICE is accepted on the bus but does nothing.
    pub fn ignore_resets(&mut self, on: bool) {
        self.ignore_resets = on;
    }

    /// Let time pass. The watchdog fires, and may reset the part, once
    /// its threshold is crossed without a touch.
    pub fn advance(&mut self, d: Duration) {
        self.now_ms += d.as_millis() as u64;
        self.tick_watchdog();
    }

    pub fn power_cycle(&mut self) {
        self.reset(false);
    }

    fn software_reset(&mut self) {
        self.reset(false);
        self.por = false;
    }

    // --- state machine ---

    fn reset(&mut self, watchdog: bool) {
        debug!("sim reset (watchdog: {})", watchdog);
        self.session = None;
        for (scr, pending) in self.scr.iter_mut().zip(self.pending_scr.iter_mut()) {
            if let Some(p) = pending.take() {
                *scr = p;
            }
        }
        for s in 0..NUM_SECTIONS as u8 {
            if std::mem::take(&mut self.pending_swap[usize::from(s)]) && self.swap_halves(s).is_err() {
                debug!("sim section {} unmapped, swap dropped", s);
            }
        }
        self.aclr = Aclr::default();
        self.awdt = Awdtcfg::from_u32(self.gmc.awdt_dflt)
            .unwrap_or_else(|_| Awdtcfg::new(AwdtThreshold::Sec16));
        self.awdt_touched_ms = self.now_ms;
        self.awdt_expired = watchdog;
        self.grant_after_reset(None);
        self.tc = 0;
        self.dmc = self.dmc.wrapping_add(1);
        self.errors = 0;
        self.por = !watchdog;
        self.resp_ready = false;
        self.obuf.clear();
        self.split = None;
        self.write_enabled = false;
        self.reset_armed = false;
        self.ext_addr = 0;
        self.powered_down = false;
        self.suspended = false;
    }

    fn devcfg(&self) -> Devcfg {
        self.gmc.devcfg().unwrap_or_default()
    }

    /// Restore the reset-time plain access grants, for one section or all.
    fn grant_after_reset(&mut self, only: Option<usize>) {
        let rst_pa = self.devcfg().rst_pa;
        for s in 0..NUM_MAIN_SECTIONS {
            if only.map_or(true, |o| o == s) {
                let on = rst_pa & (1 << s) != 0;
                self.granted_rd[s] = on;
                self.granted_wr[s] = on;
            }
        }
    }

    fn tick_watchdog(&mut self) {
        if !self.awdt.enable || self.awdt_expired {
            return;
        }
        let limit = self.awdt.threshold_seconds().unwrap_or(u64::MAX / 1000) * 1000;
        if self.now_ms - self.awdt_touched_ms >= limit {
            debug!("sim watchdog expired");
            self.expire_watchdog();
        }
    }

    fn expire_watchdog(&mut self) {
        self.awdt_expired = true;
        if self.awdt.enable && self.awdt.sw_reset_en {
            self.reset(true);
        }
    }

    fn touch_watchdog(&mut self) {
        self.awdt_touched_ms = self.now_ms;
        self.awdt_expired = false;
    }

    fn ssr(&self) -> Ssr {
        let mut s = Ssr::from(self.errors);
        s.set_busy(self.stuck_busy);
        s.set_ses_ready(self.session.is_some());
        s.set_resp_ready(self.resp_ready);
        s.set_por(self.por);
        s.set_awdt_exp(self.awdt_expired);
        s.set_mc_maint(self.mc_maint);
        s.set_suspend_e(self.suspended);
        s.set_suspend_w(self.suspended);
        s.set_state(Ssr::STATE_WORKING);
        if let Some((kid, _)) = self.session {
            s.set_kid(kid.0 & 0xf);
            s.set_full_priv(kid.is_full());
        }
        s
    }

    fn essr(&self) -> Essr {
        let mut e = Essr::from(0u64);
        e.set_ssr_bits(self.ssr().bits());
        e.set_rng_rdy(self.features.has(Feature::Rng));
        e.set_ecc_sec(self.ecc.0);
        e.set_ecc_ded(self.ecc.1);
        if let Some((kid, _)) = self.session {
            e.set_kid_msb(kid.0 >> 4);
        }
        e
    }

    fn awdtsr(&self) -> Awdtsr {
        let fract = self.features.has(Feature::AwdtValSecFract);
        let unit = if fract { 250 } else { 1000 };
        let elapsed = self.now_ms - self.awdt_touched_ms;
        let osc = u64::from(self.awdt.osc_rate_hz(self.features.has(Feature::AwdtOscRateFrac)));
        let residue = (elapsed % unit) * osc / 1000 / 64;
        Awdtsr::new((elapsed / unit) as u32, residue as u32, self.awdt_expired, fract)
    }

    fn keys_status(&self) -> KeysStatus {
        let mut ks = KeysStatus::default();
        let (mut restricted, mut full) = (0u16, 0u16);
        for s in 0..NUM_SECTIONS as u8 {
            if self.keys.contains_key(&Kid::restricted(s)) {
                restricted |= 1 << s;
            }
            if self.keys.contains_key(&Kid::full(s)) {
                full |= 1 << s;
            }
        }
        ks.set_restricted(restricted);
        ks.set_full(full);
        ks.set_secret(self.keys.contains_key(&Kid::DEVICE_SECRET));
        ks.set_master(self.keys.contains_key(&Kid::DEVICE_MASTER));
        ks
    }

    fn next_random(&mut self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for chunk in out.chunks_mut(8) {
            let mut x = self.rng_state;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.rng_state = x;
            chunk.copy_from_slice(&x.to_le_bytes());
        }
        self.rng_count += 1;
        out
    }

    // --- geometry and access rules ---

    fn policy(&self, section: usize) -> Sspr {
        self.scr
            .get(section)
            .and_then(|s| s.policy().ok())
            .unwrap_or_default()
    }

    /// Where a section lives: region, base and size.
    fn section_range(&self, section: u8) -> Option<(Region, usize, usize)> {
        if section == SECTION_VAULT {
            if !self.features.has(Feature::Vault) {
                return None;
            }
            let size = self.devcfg().vault_size() as usize;
            return (size != 0).then_some((Region::Vault, 0, size.min(VAULT_MAX)));
        }
        if usize::from(section) >= NUM_MAIN_SECTIONS || !self.gmt.is_configured() {
            return None;
        }
        let ext = u8::from(self.features.has(Feature::ExtendSecLenBits));
        let size_scale = self.features.has(Feature::SecSizeScale);
        let smr = self.gmt.smr(usize::from(section));
        let len_tag = smr.len_tag(ext);
        let (enabled, scale) = if size_scale {
            (smr.top() || len_tag != 0, smr.top())
        } else {
            (smr.top(), false)
        };
        let base = smr.base_bytes(ext) as usize;
        let size = len_tag_to_bytes(len_tag, scale, size_scale) as usize;
        (enabled && base + size <= MAIN_FLASH_SIZE).then_some((Region::Main, base, size))
    }

    fn section_of(&self, addr: usize) -> Option<usize> {
        (0..NUM_MAIN_SECTIONS as u8).find_map(|s| match self.section_range(s) {
            Some((Region::Main, base, size)) if (base..base + size).contains(&addr) => {
                Some(usize::from(s))
            }
            _ => None,
        })
    }

    fn plain_rd_allowed(&self, s: usize) -> bool {
        let p = self.policy(s);
        s < NUM_MAIN_SECTIONS
            && p.pa_rd_en
            && (!p.auth_pa || self.granted_rd[s])
            && self.aclr.rd_lock & (1 << s) == 0
    }

    fn plain_wr_allowed(&self, s: usize) -> bool {
        let p = self.policy(s);
        s < NUM_MAIN_SECTIONS
            && p.pa_wr_en
            && (!p.auth_pa || self.granted_wr[s])
            && self.aclr.wr_lock & (1 << s) == 0
    }

    fn storage(&mut self, region: Region) -> &mut [u8] {
        match region {
            Region::Main => &mut self.flash,
            Region::Vault => &mut self.vault,
        }
    }

    fn storage_ref(&self, region: Region) -> &[u8] {
        match region {
            Region::Main => &self.flash,
            Region::Vault => &self.vault,
        }
    }

    /// Absolute byte range for `len` bytes at `offset` of `section`.
    fn span(&self, section: u8, offset: u32, len: usize) -> SimResult<(Region, usize)> {
        let (region, base, size) = self.section_range(section).ok_or(Ssr::ERR)?;
        let off = offset as usize;
        if off + len > size {
            return Err(Ssr::ERR);
        }
        Ok((region, base + off))
    }

    fn program(&mut self, region: Region, at: usize, data: &[u8]) {
        for (d, s) in self.storage(region)[at..].iter_mut().zip(data) {
            *d &= *s;
        }
    }

    fn erase(&mut self, region: Region, at: usize, len: usize) {
        self.storage(region)[at..at + len].fill(0xff);
    }

    fn erase_section(&mut self, section: u8) -> SimResult<()> {
        let (region, base, size) = self.section_range(section).ok_or(Ssr::ERR)?;
        self.erase(region, base, size);
        if let Some(log) = self.logs.get_mut(usize::from(section)) {
            log.clear();
        }
        Ok(())
    }

    /// Exchange the active image of a rollback section with its backup
    /// in the upper half.
    fn swap_halves(&mut self, section: u8) -> SimResult<()> {
        let (region, base, size) = self.section_range(section).ok_or(Ssr::ERR)?;
        let (lo, hi) = self.storage(region)[base..base + size].split_at_mut(size / 2);
        lo.swap_with_slice(hi);
        debug!("sim swapped section {}", section);
        Ok(())
    }

    fn section_bytes(&self, section: u8) -> SimResult<&[u8]> {
        let (region, base, size) = self.section_range(section).ok_or(Ssr::ERR)?;
        Ok(&self.storage_ref(region)[base..base + size])
    }

    fn section_digest(&mut self, section: u8) -> SimResult<u64> {
        let (region, base, size) = self.section_range(section).ok_or(Ssr::ERR)?;
        let data = match region {
            Region::Main => &self.flash[base..base + size],
            Region::Vault => &self.vault[base..base + size],
        };
        let d = self.hash.hash(&[data]);
        Ok(LittleEndian::read_u64(&d))
    }

    fn section_crc(&self, section: u8) -> SimResult<u32> {
        let mut crc = CRC::crc32();
        crc.digest(self.section_bytes(section)?);
        Ok(crc.get_crc() as u32)
    }

    // --- session crypto ---

    fn tc_exhausted(&self) -> bool {
        if self.features.has(Feature::Tc30Bit) {
            self.tc & TC_30_BIT_MAX == TC_30_BIT_MAX
        } else {
            self.tc == u32::MAX
        }
    }

    fn consume_tc(&mut self) -> SimResult<u32> {
        if self.tc_exhausted() {
            return Err(Ssr::MC_ERR);
        }
        let tc = self.tc;
        self.tc = next_tc(tc, self.features.has(Feature::Tc30Bit));
        Ok(tc)
    }

    /// Consume a counter for a command of the open session.
    fn open_ctx(&mut self) -> SimResult<(Kid, HashBuf, u32)> {
        let (kid, key) = self.session.ok_or(Ssr::SES_ERR)?;
        let tc = self.consume_tc()?;
        Ok((kid, HashBuf::new(&key, tc), tc))
    }

    fn tamper(&mut self, sig: u64) -> u64 {
        if std::mem::take(&mut self.corrupt_sig) {
            sig ^ 1
        } else {
            sig
        }
    }

    fn sign(&mut self, buf: HashBuf, kid: Kid, ctag: Ctag, data: &[u8]) -> u64 {
        let sig = crypto::calc_auth_signature(&mut self.hash, buf.with(ctag, data), kid);
        self.tamper(sig)
    }

    fn cipher(&mut self, buf: HashBuf, kid: Kid, dir: Direction) -> CipherKey {
        crypto::build_cipher_key(&mut self.hash, buf, kid, dir)
    }

    /// Check a host-signed command. Returns the session key id, the CTAG
    /// with its plain address and the decrypted payload.
    fn verify_signed(
        &mut self,
        wire: Ctag,
        data: &[u8],
        encrypted: bool,
        hidden_addr: bool,
    ) -> SimResult<(Kid, Ctag, Vec<u8>)> {
        let (kid, buf, _) = self.open_ctx()?;
        if data.len() < SIG_SIZE {
            return Err(Ssr::ERR);
        }
        let (payload, sig) = data.split_at(data.len() - SIG_SIZE);
        let mut plain = payload.to_vec();
        let mut ctag = wire;
        if encrypted || hidden_addr {
            let cipher = self.cipher(buf, kid, Direction::DecryptionOfInput);
            if hidden_addr {
                ctag = wire.with_addr(crypto::decrypt_address(wire.addr24(), &cipher));
            }
            if encrypted {
                crypto::encrypt_data(&mut plain, &cipher);
            }
        }
        if self.sign(buf, kid, ctag, &plain) != LittleEndian::read_u64(sig) {
            return Err(Ssr::AUTH_ERR);
        }
        Ok((kid, ctag, plain))
    }

    /// The section of a section key session, with full access required
    /// for writes.
    fn session_section(&self, kid: Kid, write: bool) -> SimResult<u8> {
        if !kid.is_section_key() || (write && !kid.is_full()) {
            return Err(Ssr::PRIV_ERR);
        }
        let s = kid.section();
        if write && self.policy(usize::from(s)).wp_en {
            return Err(Ssr::PRIV_ERR);
        }
        Ok(s)
    }

    fn session_on(&self, section: u8) -> bool {
        matches!(self.session, Some((k, _)) if k.is_section_key() && k.section() == section)
    }

    fn require_master(kid: Kid) -> SimResult<()> {
        if kid == Kid::DEVICE_MASTER {
            Ok(())
        } else {
            Err(Ssr::PRIV_ERR)
        }
    }

    fn section_param(ctag: Ctag) -> SimResult<u8> {
        let s = ctag.param(1);
        if usize::from(s) < NUM_SECTIONS {
            Ok(s)
        } else {
            Err(Ssr::ERR)
        }
    }

    fn main_section_param(ctag: Ctag) -> SimResult<usize> {
        let s = usize::from(ctag.param(1));
        if s < NUM_MAIN_SECTIONS {
            Ok(s)
        } else {
            Err(Ssr::ERR)
        }
    }

    /// Key a session open is checked against. Provisioning keys are
    /// derived from the device master key.
    fn open_key(&mut self, kid: Kid, mode: u8) -> Option<Key> {
        if kid.key_type() == Kid::SECTION_PROVISIONING || kid == Kid::DEVICE_KEY_PROVISIONING {
            let master = *self.keys.get(&Kid::DEVICE_MASTER)?;
            return Some(crypto::get_provision_key(
                &mut self.hash,
                &master,
                kid,
                mode & 1 != 0,
                mode & 2 != 0,
            ));
        }
        self.keys.get(&kid).copied()
    }

    // --- bus decoding ---

    fn op1(&mut self, frame: &[u8]) {
        let ctag_only_first = self.features.has(Feature::SplitIbufCtagOnlyFirst);
        if let Some(buf) = self.split.as_mut() {
            if buf.is_empty() || ctag_only_first {
                buf.extend_from_slice(frame);
            } else {
                buf.extend_from_slice(frame.get(CTAG_SIZE..).unwrap_or_default());
            }
            return;
        }
        self.execute(frame);
    }

    fn execute(&mut self, frame: &[u8]) {
        self.resp_ready = false;
        self.obuf.clear();
        if frame.len() < CTAG_SIZE {
            self.errors |= Ssr::ERR;
            return;
        }
        let ctag = Ctag(LittleEndian::read_u32(frame));
        let data = &frame[CTAG_SIZE..];
        let cmd = SecCmd::from_u8(ctag.opcode());
        trace!("sim {:?} ctag {:#010x} data {}", cmd, ctag.0, data.len());

        let mut extra = 0;
        if let Some(i) = self.faults.iter().position(|f| Some(f.cmd) == cmd) {
            let f = self.faults.remove(i);
            if !f.execute {
                debug!("sim dropping {:?} with {:#x}", f.cmd, f.bits);
                self.errors |= f.bits;
                if f.end_session {
                    self.session = None;
                }
                return;
            }
            extra = f.bits;
        }

        let r = match cmd {
            Some(c) => self.dispatch(c, ctag, data),
            None => Err(Ssr::ERR),
        };
        match r {
            Ok(Some(resp)) => {
                self.obuf = resp;
                self.resp_ready = true;
            }
            Ok(None) => {}
            Err(bits) => {
                debug!("sim {:?} failed with {:#x}", cmd, bits);
                self.errors |= bits;
            }
        }
        self.errors |= extra;
    }

    fn dispatch(&mut self, cmd: SecCmd, ctag: Ctag, data: &[u8]) -> Reply {
        match cmd {
            SecCmd::GetMc => {
                self.errors = 0;
                let mut out = self.tc.to_le_bytes().to_vec();
                out.extend_from_slice(&self.dmc.to_le_bytes());
                reply(out)
            }
            SecCmd::GetTc => reply(self.tc.to_le_bytes()),
            SecCmd::GetEssr => reply(self.essr().bits().to_le_bytes()),
            SecCmd::GetWid => reply(self.wid.to_le_bytes()),
            SecCmd::GetSuid => reply(self.suid),
            SecCmd::GetAwdtsr => reply(self.awdtsr().0.to_le_bytes()),
            SecCmd::GetVersion => reply(self.hw_ver.bits().to_le_bytes()),
            SecCmd::GetAwdt => reply(self.awdt.to_u32().map_err(|_| Ssr::ERR)?.to_le_bytes()),
            SecCmd::GetGmc => packed(self.gmc.pack()),
            SecCmd::GetGmt => packed(self.gmt.pack()),
            SecCmd::GetScr => {
                let s = Self::section_param(ctag)?;
                packed(self.scr[usize::from(s)].pack())
            }
            SecCmd::GetAclr => reply(self.aclr.to_u32().map_err(|_| Ssr::ERR)?.to_le_bytes()),
            SecCmd::GetKeysStatus => reply(self.keys_status().bits().to_le_bytes()),
            SecCmd::GetRstResp => reply(self.rst_resp),
            SecCmd::McMaint => {
                self.mc_maint = 0;
                Ok(None)
            }

            SecCmd::SessionOpen => self.session_open(ctag, data),
            SecCmd::SessionClose => {
                let kid = Kid(ctag.param(1));
                if self.session_kid() != Some(kid) {
                    return Err(Ssr::SES_ERR);
                }
                self.session = None;
                if ctag.param(2) & 1 != 0 && kid.is_section_key() {
                    self.revoke(usize::from(kid.section()), 3);
                }
                Ok(None)
            }
            SecCmd::InitSectionPa => {
                let s = Self::main_section_param(ctag)?;
                self.grant_after_reset(Some(s));
                if self.session_on(s as u8) {
                    self.session = None;
                }
                Ok(None)
            }
            SecCmd::PaGrant => self.pa_grant(ctag, data),
            SecCmd::PaGrantPlain => {
                let s = Self::main_section_param(ctag)?;
                if self.policy(s).auth_pa {
                    return Err(Ssr::PRIV_ERR);
                }
                self.grant(s);
                Ok(None)
            }
            SecCmd::PaRevoke => {
                let s = Self::main_section_param(ctag)?;
                self.revoke(s, ctag.param(2));
                Ok(None)
            }
            SecCmd::VerIntg => {
                let s = Self::section_param(ctag)?;
                let scr = self.scr[usize::from(s)];
                let ok = match ctag.param(2) {
                    0 => self.section_crc(s)? == scr.checksum,
                    _ => self.section_digest(s)? == scr.digest,
                };
                if ok {
                    Ok(None)
                } else {
                    Err(Ssr::INTG_ERR)
                }
            }

            SecCmd::CalcSig => {
                let what = SignedData::from_id(ctag.param(1)).ok_or(Ssr::ERR)?;
                let (kid, buf, tc) = self.open_ctx()?;
                let d = self.signed_data(what, tc)?;
                let sig = self.sign(buf, kid, ctag, &d);
                let mut out = tc.to_le_bytes().to_vec();
                out.extend_from_slice(&d);
                out.extend_from_slice(&sig.to_le_bytes());
                reply(out)
            }
            SecCmd::CalcCdi => {
                let (kid, buf, tc) = self.open_ctx()?;
                let section = self.session_section(kid, false)?;
                let digest = self.section_digest(section)?.to_le_bytes();
                let mut cdi = self.hash.hash(&[&digest, &[ctag.param(1)], &self.suid]);
                let cipher = self.cipher(buf, kid, Direction::EncryptionOfOutput);
                crypto::encrypt_data(&mut cdi, &cipher);
                let mut out = tc.to_le_bytes().to_vec();
                out.extend_from_slice(&cdi);
                reply(out)
            }
            SecCmd::GetRngr => {
                let (kid, buf, tc) = self.open_ctx()?;
                let rnd = self.next_random();
                let sig = self.sign(buf, kid, ctag, &rnd);
                let mut enc = rnd;
                let cipher = self.cipher(buf, kid, Direction::EncryptionOfOutput);
                crypto::encrypt_data(&mut enc, &cipher);
                let mut out = tc.to_le_bytes().to_vec();
                out.extend_from_slice(&enc);
                out.extend_from_slice(&sig.to_le_bytes());
                reply(out)
            }
            SecCmd::RngrPlain => reply(self.next_random()),
            SecCmd::RngrCounter => reply(&self.rng_count.to_le_bytes()[..12]),

            SecCmd::Srd => self.secure_read(ctag, false),
            SecCmd::Sard => self.secure_read(ctag, true),
            SecCmd::Sawr => {
                let (kid, ctag, page) = self.verify_signed(ctag, data, true, true)?;
                let s = self.session_section(kid, true)?;
                let (region, at) = self.span(s, ctag.addr24() & !(PAGE as u32 - 1), PAGE)?;
                self.program(region, at, &page);
                Ok(None)
            }
            SecCmd::Serase4 | SecCmd::Serase32 | SecCmd::Serase64 => {
                let size = match cmd {
                    SecCmd::Serase4 => 0x1000,
                    SecCmd::Serase32 => 0x8000,
                    _ => 0x1_0000,
                };
                let (kid, ctag, _) = self.verify_signed(ctag, data, false, true)?;
                let s = self.session_section(kid, true)?;
                let (region, at) = self.span(s, ctag.addr24() & !(size as u32 - 1), size)?;
                self.erase(region, at, size);
                Ok(None)
            }
            SecCmd::EraseSect => {
                let (kid, _, _) = self.verify_signed(ctag, data, false, false)?;
                let s = self.session_section(kid, true)?;
                self.erase_section(s)?;
                Ok(None)
            }
            SecCmd::EraseAll => {
                let (kid, _, _) = self.verify_signed(ctag, data, false, false)?;
                Self::require_master(kid)?;
                self.flash.fill(0xff);
                self.vault.fill(0xff);
                self.logs.iter_mut().for_each(Vec::clear);
                Ok(None)
            }
            SecCmd::EraseSectPlain => {
                let s = Self::main_section_param(ctag)?;
                if !self.plain_wr_allowed(s) {
                    return Err(Ssr::PRIV_ERR);
                }
                self.erase_section(s as u8)?;
                Ok(None)
            }
            SecCmd::MemCopy => {
                let len = (u32::from(ctag.param(1)) << 16)
                    | (u32::from(ctag.param(2)) << 8)
                    | u32::from(ctag.param(3));
                let (kid, _, d) = self.verify_signed(ctag, data, false, false)?;
                let s = self.session_section(kid, true)?;
                let (src, dest) = (read_u32(&d, 0)?, read_u32(&d, 4)?);
                let (region, from) = self.span(s, src, len as usize)?;
                let (_, to) = self.span(s, dest, len as usize)?;
                let chunk = self.storage_ref(region)[from..from + len as usize].to_vec();
                self.erase(region, to, chunk.len());
                self.program(region, to, &chunk);
                Ok(None)
            }
            SecCmd::MemCrc => {
                let s = Self::section_param(ctag)?;
                if !self.session_on(s) && !self.plain_rd_allowed(usize::from(s)) {
                    return Err(Ssr::PRIV_ERR);
                }
                let (addr, len) = (read_u32(data, 0)?, read_u32(data, 4)?);
                let (region, at) = self.span(s, addr, len as usize)?;
                let mut crc = CRC::crc32();
                crc.digest(&self.storage_ref(region)[at..at + len as usize]);
                reply((crc.get_crc() as u32).to_le_bytes())
            }

            SecCmd::LogSrd => {
                let (kid, buf, tc) = self.open_ctx()?;
                let s = self.session_section(kid, false)?;
                let (head, mut entry) = self.log_head(s)?;
                let cipher = self.cipher(buf, kid, Direction::EncryptionOfOutput);
                crypto::encrypt_data(&mut entry, &cipher);
                let mut out = tc.to_le_bytes().to_vec();
                out.extend_from_slice(&head.to_le_bytes());
                out.extend_from_slice(&entry);
                reply(out)
            }
            SecCmd::LogPrd => {
                let s = Self::main_section_param(ctag)?;
                if !self.plain_rd_allowed(s) {
                    return Err(Ssr::PRIV_ERR);
                }
                let (head, entry) = self.log_head(s as u8)?;
                let mut out = head.to_le_bytes().to_vec();
                out.extend_from_slice(&entry);
                reply(out)
            }
            SecCmd::LogSawr => {
                let (kid, _, entry) = self.verify_signed(ctag, data, true, false)?;
                let s = self.session_section(kid, true)?;
                self.log_append(s, &entry)?;
                Ok(None)
            }
            SecCmd::LogPwr => {
                let s = Self::main_section_param(ctag)?;
                if !self.plain_wr_allowed(s) {
                    return Err(Ssr::PRIV_ERR);
                }
                self.log_append(s as u8, data)?;
                Ok(None)
            }

            SecCmd::SetKey => {
                let (kid, ctag, key) = self.verify_signed(ctag, data, true, false)?;
                let target = Kid(ctag.param(1));
                let provisioner = if target.is_section_key() {
                    Kid::provisioning(target.section())
                } else if target == Kid::DEVICE_MASTER || target == Kid::DEVICE_SECRET {
                    Kid::DEVICE_KEY_PROVISIONING
                } else {
                    return Err(Ssr::ERR);
                };
                if kid != provisioner {
                    return Err(Ssr::PRIV_ERR);
                }
                let key: Key = key.as_slice().try_into().map_err(|_| Ssr::ERR)?;
                self.keys.insert(target, key);
                Ok(None)
            }
            SecCmd::SetSuid => {
                let (kid, _, suid) = self.verify_signed(ctag, data, false, false)?;
                Self::require_master(kid)?;
                self.suid = suid.as_slice().try_into().map_err(|_| Ssr::ERR)?;
                Ok(None)
            }
            SecCmd::SetGmc => {
                let (kid, _, d) = self.verify_signed(ctag, data, false, false)?;
                Self::require_master(kid)?;
                self.gmc = Gmc::unpack_from_slice(&d).map_err(|_| Ssr::ERR)?;
                Ok(None)
            }
            SecCmd::SetGmt => {
                let (kid, _, d) = self.verify_signed(ctag, data, false, false)?;
                Self::require_master(kid)?;
                self.gmt = Gmt::unpack_from_slice(&d).map_err(|_| Ssr::ERR)?;
                Ok(None)
            }
            SecCmd::SetScr | SecCmd::SetScrSwap => {
                let s = Self::section_param(ctag)?;
                let (kid, _, d) = self.verify_signed(ctag, data, false, false)?;
                if kid != Kid::full(s) {
                    return Err(Ssr::PRIV_ERR);
                }
                let scr = Scr::unpack_from_slice(&d).map_err(|_| Ssr::ERR)?;
                let swap = cmd == SecCmd::SetScrSwap;
                if swap && !scr.policy().map_or(false, |p| p.rollback_en) {
                    return Err(Ssr::ERR);
                }
                let i = usize::from(s);
                let mode = ctag.param(2);
                if mode & 1 != 0 {
                    self.pending_scr[i] = Some(scr);
                    self.pending_swap[i] = swap;
                    self.software_reset();
                    return Ok(None);
                }
                self.scr[i] = scr;
                if swap {
                    self.swap_halves(s)?;
                }
                if mode & 2 == 0 {
                    // without reload the old session and grants go away
                    self.session = None;
                    self.revoke(i, 3);
                }
                Ok(None)
            }
            SecCmd::SetRstResp => {
                let (kid, buf, _) = self.open_ctx()?;
                Self::require_master(kid)?;
                if data.len() != 64 + SIG_SIZE {
                    return Err(Ssr::ERR);
                }
                let (half, sig) = data.split_at(64);
                let digest = self.hash.hash(&[half]);
                if self.sign(buf, kid, ctag, &digest) != LittleEndian::read_u64(sig) {
                    return Err(Ssr::AUTH_ERR);
                }
                let at = if ctag.param(1) != 0 { 64 } else { 0 };
                self.rst_resp[at..at + 64].copy_from_slice(half);
                Ok(None)
            }
            SecCmd::SetAclr => {
                let v = read_u32(data, 0)?;
                let new = Aclr::from_u32(v).map_err(|_| Ssr::ERR)?;
                self.aclr.rd_lock |= new.rd_lock;
                self.aclr.wr_lock |= new.wr_lock;
                self.aclr.rd_lock_vault |= new.rd_lock_vault;
                self.aclr.wr_lock_vault |= new.wr_lock_vault;
                Ok(None)
            }

            SecCmd::SetAwdt => {
                let (kid, _, d) = self.verify_signed(ctag, data, false, false)?;
                let owner = Kid::full(*self.awdt.kid);
                if kid != Kid::DEVICE_MASTER && kid != owner {
                    return Err(Ssr::PRIV_ERR);
                }
                if self.awdt.lock {
                    return Err(Ssr::IGNORE_ERR);
                }
                self.apply_awdt(read_u32(&d, 0)?)
            }
            SecCmd::SetAwdtPlain => {
                if self.awdt.authenticated || self.awdt.lock {
                    return Err(Ssr::PRIV_ERR);
                }
                self.apply_awdt(read_u32(data, 0)?)
            }
            SecCmd::AwdtTouch => {
                let (kid, _, _) = self.verify_signed(ctag, data, false, false)?;
                if !kid.is_section_key() || kid.section() != *self.awdt.kid {
                    return Err(Ssr::PRIV_ERR);
                }
                self.touch_watchdog();
                Ok(None)
            }
            SecCmd::AwdtTouchPlain => {
                if self.awdt.authenticated {
                    return Err(Ssr::PRIV_ERR);
                }
                self.touch_watchdog();
                Ok(None)
            }
            SecCmd::AwdtExpire => {
                self.expire_watchdog();
                Ok(None)
            }

            SecCmd::Sformat => {
                let (kid, _, _) = self.verify_signed(ctag, data, false, false)?;
                Self::require_master(kid)?;
                self.format(ctag.param(1));
                Ok(None)
            }
            SecCmd::Format => {
                if !self.devcfg().format_en {
                    return Err(Ssr::PRIV_ERR);
                }
                self.format(ctag.param(1));
                Ok(None)
            }
            SecCmd::Sleep => Ok(None),
            SecCmd::None => Err(Ssr::ERR),
        }
    }

    fn session_open(&mut self, ctag: Ctag, data: &[u8]) -> Reply {
        // a failed open leaves no session behind
        self.session = None;
        if data.len() != 16 {
            return Err(Ssr::ERR);
        }
        let kid = Kid(ctag.param(1));
        let mode = ctag.param(2);
        let key = self.open_key(kid, mode).ok_or(Ssr::AUTH_ERR)?;
        let nonce = LittleEndian::read_u64(data);
        let sig = LittleEndian::read_u64(&data[8..]);
        let tc = self.consume_tc()?;
        let wid = (mode & 1 != 0).then_some(self.wid);
        let keys =
            crypto::session_key_and_signature(&mut self.hash, &key, ctag, [tc, self.dmc], nonce, wid);
        if self.tamper(keys.signature) != sig {
            return Err(Ssr::AUTH_ERR);
        }
        if kid.is_section_key() && usize::from(kid.section()) < NUM_MAIN_SECTIONS {
            self.grant(usize::from(kid.section()));
        }
        debug!("sim session open {:?}", kid);
        self.session = Some((kid, keys.session_key));
        Ok(None)
    }

    fn pa_grant(&mut self, ctag: Ctag, data: &[u8]) -> Reply {
        let kid = Kid(ctag.param(1));
        if data.len() != SIG_SIZE || !kid.is_section_key() {
            return Err(Ssr::ERR);
        }
        let key = self.keys.get(&kid).copied().ok_or(Ssr::AUTH_ERR)?;
        let tc = self.consume_tc()?;
        let keys = crypto::session_key_and_signature(
            &mut self.hash,
            &key,
            ctag,
            [tc, self.dmc],
            0,
            Some(self.wid),
        );
        if self.tamper(keys.signature) != LittleEndian::read_u64(data) {
            return Err(Ssr::AUTH_ERR);
        }
        let s = usize::from(kid.section());
        if s >= NUM_MAIN_SECTIONS {
            return Err(Ssr::ERR);
        }
        self.grant(s);
        Ok(None)
    }

    fn grant(&mut self, s: usize) {
        self.granted_rd[s] = true;
        self.granted_wr[s] = true;
    }

    fn revoke(&mut self, s: usize, kind: u8) {
        if s >= NUM_MAIN_SECTIONS {
            return;
        }
        if kind & 1 != 0 {
            self.granted_rd[s] = false;
        }
        if kind & 2 != 0 {
            self.granted_wr[s] = false;
        }
    }

    fn secure_read(&mut self, wire: Ctag, signed: bool) -> Reply {
        let (kid, buf, tc) = self.open_ctx()?;
        let cipher = self.cipher(buf, kid, Direction::EncryptionOfOutput);
        let addr = crypto::decrypt_address(wire.addr24(), &cipher);
        let s = self.session_section(kid, false)?;
        let (region, at) = self.span(s, addr & !(PAGE as u32 - 1), PAGE)?;
        let page = self.storage_ref(region)[at..at + PAGE].to_vec();
        let mut out = tc.to_le_bytes().to_vec();
        let mut enc = page.clone();
        crypto::encrypt_data(&mut enc, &cipher);
        out.extend_from_slice(&enc);
        if signed {
            let sig = self.sign(buf, kid, wire.with_addr(addr), &page);
            out.extend_from_slice(&sig.to_le_bytes());
        }
        reply(out)
    }

    fn signed_data(&mut self, what: SignedData, tc: u32) -> SimResult<Vec<u8>> {
        let d = match what {
            SignedData::SectionDigest(s) => self.section_digest(s)?.to_le_bytes().to_vec(),
            SignedData::Wid => self.wid.to_le_bytes().to_vec(),
            SignedData::Suid => self.suid.to_vec(),
            SignedData::HwVer => self.hw_ver.bits().to_le_bytes().to_vec(),
            SignedData::MemoryRange => vec![0; 8],
            SignedData::Ssr => self.ssr().bits().to_le_bytes().to_vec(),
            SignedData::Essr => self.essr().bits().to_le_bytes().to_vec(),
            SignedData::Awdtcfg => self.awdt.to_u32().map_err(|_| Ssr::ERR)?.to_le_bytes().to_vec(),
            SignedData::Awdtsr => self.awdtsr().0.to_le_bytes().to_vec(),
            SignedData::Mc => {
                let mut v = tc.to_le_bytes().to_vec();
                v.extend_from_slice(&self.dmc.to_le_bytes());
                v
            }
            SignedData::Gmc => self.gmc.pack().map_err(|_| Ssr::ERR)?.to_vec(),
            SignedData::Gmt => self.gmt.pack().map_err(|_| Ssr::ERR)?.to_vec(),
            SignedData::SectionConfig(s) => self
                .scr
                .get(usize::from(s))
                .ok_or(Ssr::ERR)?
                .pack()
                .map_err(|_| Ssr::ERR)?
                .to_vec(),
        };
        Ok(d)
    }

    /// Offset of the newest entry and the entry itself. An empty log
    /// reads as erased.
    fn log_head(&self, s: u8) -> SimResult<(u32, [u8; LOG_ENTRY])> {
        if !self.policy(usize::from(s)).slog {
            return Err(Ssr::PRIV_ERR);
        }
        let log = self.logs.get(usize::from(s)).ok_or(Ssr::ERR)?;
        Ok(match log.last() {
            Some(e) => (((log.len() - 1) * LOG_ENTRY) as u32, *e),
            None => (0, [0xff; LOG_ENTRY]),
        })
    }

    fn log_append(&mut self, s: u8, entry: &[u8]) -> SimResult<()> {
        if !self.policy(usize::from(s)).slog {
            return Err(Ssr::PRIV_ERR);
        }
        let entry: [u8; LOG_ENTRY] = entry.try_into().map_err(|_| Ssr::ERR)?;
        let n = self.logs.get(usize::from(s)).map_or(0, Vec::len);
        let (region, at) = self.span(s, (n * LOG_ENTRY) as u32, LOG_ENTRY)?;
        self.program(region, at, &entry);
        if let Some(log) = self.logs.get_mut(usize::from(s)) {
            log.push(entry);
        }
        Ok(())
    }

    fn apply_awdt(&mut self, v: u32) -> Reply {
        self.awdt = Awdtcfg::from_u32(v).map_err(|_| Ssr::ERR)?;
        self.touch_watchdog();
        debug!("sim watchdog configured: {:?}", self.awdt);
        Ok(None)
    }

    fn format(&mut self, mode: u8) {
        debug!("sim format, mode {:#x}", mode);
        self.session = None;
        self.flash.fill(0xff);
        self.vault.fill(0xff);
        self.logs.iter_mut().for_each(Vec::clear);
        self.scr = [Scr::default(); NUM_SECTIONS];
        self.pending_scr = [None; NUM_SECTIONS];
        self.pending_swap = [false; NUM_SECTIONS];
        if mode & 2 != 0 {
            self.gmc = default_gmc(&self.features);
            self.gmt = default_gmt(&self.features);
            self.keys.retain(|k, _| !k.is_section_key());
        }
        if mode & 1 != 0 {
            self.reset(false);
        } else {
            self.grant_after_reset(None);
        }
    }

    // --- standard instructions ---

    fn plain_byte(&self, addr: usize) -> u8 {
        match self.section_of(addr) {
            Some(s) if self.plain_rd_allowed(s) => self.flash[addr],
            _ => 0,
        }
    }

    fn plain_writable(&self, addr: usize, len: usize) -> bool {
        let first = self.section_of(addr);
        first.is_some()
            && first == self.section_of(addr + len.max(1) - 1)
            && first.map_or(false, |s| self.plain_wr_allowed(s))
    }

    fn standard(
        &mut self,
        cmd: u8,
        address: Option<u32>,
        data_out: &[u8],
        data_in: &mut [u8],
    ) -> std::result::Result<(), BusError> {
        if self.powered_down && cmd != std_cmd::RELEASE_POWER_DOWN {
            return Ok(());
        }
        let armed = std::mem::take(&mut self.reset_armed);
        let abs = |ext: u8| -> std::result::Result<usize, BusError> {
            let a = address.ok_or(BusError::Rejected("missing address"))?;
            Ok(((usize::from(ext)) << 24) | (a as usize & 0xff_ffff))
        };
        match cmd {
            std_cmd::WRITE_ENABLE => self.write_enabled = true,
            std_cmd::READ_STATUS => {
                if let Some(b) = data_in.first_mut() {
                    *b = u8::from(self.write_enabled) << 1;
                }
            }
            std_cmd::FAST_READ => {
                let a = abs(self.ext_addr)?;
                for (i, b) in data_in.iter_mut().enumerate() {
                    *b = if a + i < MAIN_FLASH_SIZE {
                        self.plain_byte(a + i)
                    } else {
                        0
                    };
                }
            }
            std_cmd::PAGE_PROGRAM => {
                let a = abs(self.ext_addr)?;
                if std::mem::take(&mut self.write_enabled) && self.plain_writable(a, data_out.len())
                {
                    self.program(Region::Main, a, data_out);
                } else {
                    debug!("sim ignoring plain program at {:#x}", a);
                }
            }
            std_cmd::SECTOR_ERASE => {
                let a = abs(self.ext_addr)? & !(std_cmd::SECTOR_SIZE as usize - 1);
                let size = std_cmd::SECTOR_SIZE as usize;
                if std::mem::take(&mut self.write_enabled) && self.plain_writable(a, size) {
                    self.erase(Region::Main, a, size);
                } else {
                    debug!("sim ignoring plain erase at {:#x}", a);
                }
            }
            std_cmd::SUSPEND => self.suspended = true,
            std_cmd::RESUME => self.suspended = false,
            std_cmd::POWER_DOWN => self.powered_down = true,
            std_cmd::RELEASE_POWER_DOWN => self.powered_down = false,
            std_cmd::DIE_SELECT => {}
            std_cmd::WRITE_EXT_ADDR => self.ext_addr = data_out.first().copied().unwrap_or(0),
            std_cmd::RESET_ENABLE => self.reset_armed = true,
            std_cmd::RESET_DEVICE => {
                if armed && !self.ignore_resets {
                    self.software_reset();
                } else {
                    debug!("sim ignoring reset (armed: {})", armed);
                }
            }
            inst::WR_IBUF_START => self.split = Some(Vec::new()),
            inst::WR_IBUF_END => {
                if let Some(frame) = self.split.take() {
                    self.execute(&frame);
                }
            }
            _ => return Err(BusError::Rejected("unknown instruction")),
        }
        Ok(())
    }
}

impl Bus for SimDevice {
    fn transact(&mut self, t: Transaction<'_>) -> std::result::Result<(), BusError> {
        self.transactions += 1;
        let Transaction {
            cmd,
            address,
            data_out,
            data_in,
            ..
        } = t;
        let Some(op) = secure_op(cmd) else {
            return self.standard(cmd, address, data_out, data_in);
        };
        if self.powered_down {
            data_in.fill(0xff);
            return Ok(());
        }
        match op {
            inst::OP0 => {
                let ssr = self.ssr().bits().to_le_bytes();
                for (d, s) in data_in.iter_mut().zip(ssr.iter().cycle()) {
                    *d = *s;
                }
            }
            inst::OP1 => self.op1(data_out),
            _ => {
                data_in.fill(0xff);
                let n = data_in.len().min(self.obuf.len());
                data_in[..n].copy_from_slice(&self.obuf[..n]);
                self.resp_ready = false;
            }
        }
        Ok(())
    }
}
