// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Section level operations built from the individual secure commands.
//!
//! These are what an application calls: they check the cached state
//! first, so that a request that cannot succeed fails before it reaches
//! the bus, and they keep the cached section state in step with the
//! device afterwards.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use w77q_regs::config::{len_tag_to_bytes, Awdtcfg, Devcfg, Gmc, Gmt, Sspr};
use w77q_regs::status::{HwVer, Ssr};
use w77q_regs::{KB_64, NUM_MAIN_SECTIONS, SECTION_VAULT};

use crate::cfg::Feature;
use crate::cmd::{std_cmd, ConfigAction, EraseType, Kid, PaRevokeType, SessionAccess};
use crate::cmd_data::{LOG_ENTRY_SIZE, READ_PAGE_SIZE, WRITE_PAGE_SIZE};
use crate::cmd_proc::Qlib;
use crate::config::TimeoutClass;
use crate::context::{DieState, ResetStatus, SectionState, DMC, TC};
use crate::crypto::{self, HashEngine, Key};
use crate::error::{DeviceError, QlibError, Result};
use crate::tm::Bus;

/// DMC value past which the part is close to the end of its life.
pub const DMC_EOL_THRESHOLD: u32 = 0x3FFF_F000;
/// Distance from the TC limit at which a reset is due.
const TC_RESET_MARGIN: u32 = 0xF;

/// Things the application should act on, from `get_notifications`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Notifications {
    pub mc_maintenance: bool,
    pub replace_device: bool,
    pub reset_device: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogStatus {
    /// Time since the last touch.
    pub elapsed_ms: u32,
    pub expired: bool,
}

/// Changes to a section's configuration. Fields left out keep the value
/// the section already has.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SectionConfig {
    pub policy: Option<Sspr>,
    /// Expected digest of the section contents.
    pub digest: Option<u64>,
    /// Expected CRC of the section contents.
    pub crc: Option<u32>,
    pub version: Option<u32>,
}

/// A section as `get_section_configuration` reports it. Disabled
/// sections read as all zeroes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SectionInfo {
    /// Flash address of the section; `u32::MAX` for the vault, which is
    /// not mapped.
    pub base: u32,
    pub size: u32,
    pub policy: Sspr,
    pub digest: u64,
    pub crc: u32,
    pub version: u32,
}

/// Global configuration read back from GMC.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    /// Watchdog configuration loaded at every reset.
    pub watchdog_default: Awdtcfg,
    pub safe_fallback: bool,
    pub speculative_ck: bool,
    pub plain_format: bool,
    pub boot_fail_reset: bool,
    pub reset_response: bool,
    pub rng_plain_access: bool,
    pub locked: bool,
    /// Vault size in bytes, per die.
    pub vault_size: Vec<u32>,
    /// Sections with plain access granted at reset, one mask per die.
    pub reset_pa: Vec<u8>,
}

/// Plain access a section has straight after reset: the policy must allow
/// it, and it must either not need a grant or be pre-granted in DEVCFG.
fn plain_after_reset(policy: &Sspr, rst_pa: u8, section: u8) -> (bool, bool) {
    let granted = !policy.auth_pa || rst_pa & (1 << section) != 0;
    (policy.pa_rd_en && granted, policy.pa_wr_en && granted)
}

/// Largest erase that starts at `addr` and fits in `remaining`.
fn erase_step(addr: u32, remaining: u32) -> EraseType {
    [EraseType::Block64K, EraseType::Block32K]
        .into_iter()
        .find(|t| {
            let size = t.size().unwrap_or(u32::MAX);
            addr % size == 0 && remaining >= size
        })
        .unwrap_or(EraseType::Sector4K)
}

impl<'k, B: Bus, H: HashEngine> Qlib<'k, B, H> {
    // --- lifecycle ---

    /// Forget everything known about the device, registered keys
    /// included. Nothing is sent on the bus.
    pub fn init_lib(&mut self) {
        for die in self.ctx.dies.iter_mut() {
            *die = DieState::new();
        }
        self.ctx.active_die = 0;
        self.ctx.suspended = false;
        self.ctx.watchdog_secure = false;
        self.ctx.watchdog_section = None;
        self.ctx.multi_transaction = false;
        self.ctx.ext_addr = 0;
        self.ctx.reset_status = ResetStatus::default();
    }

    /// Rebuild the cached view of every die: reset status, WID, section
    /// map and policies, and the watchdog mode.
    pub fn sync_state(&mut self) -> Result<()> {
        self.caps()?;
        self.sync_after_flash_reset()?;
        self.get_wid_unsigned()?;
        let dies = self.ctx.dies.len();
        for die in 0..dies {
            self.select_die(die)?;
            let devcfg = self.get_gmc_unsigned()?.devcfg().map_err(QlibError::Packing)?;
            self.load_section_map(&devcfg)?;
        }
        self.select_die(0)?;
        let awdt = self.get_awdt_unsigned()?;
        self.note_watchdog(&awdt);
        debug!("state synced, wid {:#018x}", self.ctx.wid);
        Ok(())
    }

    fn load_section_map(&mut self, devcfg: &Devcfg) -> Result<()> {
        let gmt = self.get_gmt_unsigned()?;
        let (ext, size_scale, vault) = {
            let caps = self.caps()?;
            (caps.sec_len_ext(), caps.has(Feature::SecSizeScale), caps.has(Feature::Vault))
        };
        let die = self.ctx.die_mut();
        for (i, s) in die.sections.iter_mut().take(NUM_MAIN_SECTIONS).enumerate() {
            *s = SectionState::default();
            if !gmt.is_configured() {
                continue;
            }
            let smr = gmt.smr(i);
            let len_tag = smr.len_tag(ext);
            let (enabled, scale) = if size_scale {
                (smr.top() || len_tag != 0, smr.top())
            } else {
                (smr.top(), false)
            };
            s.base = smr.base_bytes(ext);
            s.size = len_tag_to_bytes(len_tag, scale, size_scale);
            s.size_tag = len_tag;
            s.enabled = enabled;
        }
        if vault {
            die.vault_size = devcfg.vault_size();
            if let Some(v) = die.section_mut(SECTION_VAULT) {
                *v = SectionState {
                    size: devcfg.vault_size(),
                    enabled: devcfg.vault_size() != 0,
                    ..SectionState::default()
                };
            }
        }

        for section in 0..NUM_MAIN_SECTIONS as u8 {
            let enabled = self.ctx.die().section(section).map_or(false, |s| s.enabled);
            if !enabled {
                continue;
            }
            let policy = self.get_scr_unsigned(section)?.policy().map_err(QlibError::Packing)?;
            let (rd, wr) = plain_after_reset(&policy, devcfg.rst_pa, section);
            if let Some(s) = self.ctx.die_mut().section_mut(section) {
                s.policy = Some(policy);
                s.plain_rd = rd;
                s.plain_wr = wr;
            }
        }
        Ok(())
    }

    /// What the host has to assume after the flash went through a reset:
    /// no sessions, no granted plain access, counters unknown. Waits for
    /// the device to come back and records why it reset.
    pub fn sync_after_flash_reset(&mut self) -> Result<()> {
        for die in self.ctx.dies.iter_mut() {
            die.key_mngr.end_session();
            die.mc_in_sync = false;
            die.powered_down = false;
            for s in die.sections.iter_mut().take(NUM_MAIN_SECTIONS) {
                s.plain_rd = false;
                s.plain_wr = false;
            }
        }
        self.ctx.active_die = 0;
        self.ctx.ext_addr = 0;
        self.ctx.suspended = false;

        let timeout = self.timeout(TimeoutClass::SectorErase);
        let start = Instant::now();
        let ssr = loop {
            match self.get_ssr_unsigned() {
                Ok(ssr) if !ssr.busy() => break ssr,
                // the part does not answer while it is still in reset
                Ok(_) | Err(QlibError::Connectivity(_)) if start.elapsed() <= timeout => {}
                Ok(_) | Err(QlibError::Connectivity(_)) => return Err(QlibError::Timeout),
                Err(e) => return Err(e),
            }
        };
        self.ctx.reset_status = ResetStatus {
            power_on: ssr.por(),
            fallback_remap: ssr.fb_remap(),
            watchdog: ssr.awdt_exp(),
        };
        info!("flash reset: {:?}", self.ctx.reset_status);
        Ok(())
    }

    /// Software reset of the part. Fails with `CommandIgnored` if the DMC
    /// shows the reset never happened.
    pub fn reset_flash(&mut self) -> Result<()> {
        self.caps()?;
        self.select_die(0)?;
        self.synch_mc()?;
        let dmc = self.ctx.die().mc[DMC];

        self.std_reset()?;
        self.sync_state()?;

        self.synch_mc()?;
        let now = self.ctx.die().mc[DMC];
        if now <= dmc {
            warn!("DMC still {:#x} after reset", now);
            return Err(QlibError::CommandIgnored);
        }
        Ok(())
    }

    // --- checks shared by the operations below ---

    fn check_power_state(&self) -> Result<()> {
        if self.ctx.die().powered_down || self.ctx.suspended {
            Err(QlibError::CommandIgnored)
        } else {
            Ok(())
        }
    }

    fn check_section(&self, section: u8) -> Result<()> {
        if usize::from(section) >= self.caps()?.num_sections() {
            return Err(QlibError::InvalidParameter("section"));
        }
        Ok(())
    }

    fn check_main_section(&self, section: u8) -> Result<()> {
        if usize::from(section) >= NUM_MAIN_SECTIONS {
            return Err(QlibError::InvalidParameter("section"));
        }
        Ok(())
    }

    /// The open session must belong to `section`, with the full key when
    /// `full` is set.
    fn require_session_on(&self, section: u8, full: bool) -> Result<()> {
        let km = self.ctx.key_mngr();
        if !km.is_session_open() {
            return Err(DeviceError::Session.into());
        }
        if km.is_section_full_access(section) || (!full && km.is_section_restricted_access(section)) {
            Ok(())
        } else {
            Err(DeviceError::Privilege.into())
        }
    }

    /// The cached section, if `[offset, offset + len)` lies inside it.
    fn section_window(&self, section: u8, offset: u32, len: usize) -> Result<SectionState> {
        let s = *self
            .ctx
            .die()
            .section(section)
            .ok_or(QlibError::InvalidParameter("section"))?;
        let end = u64::from(offset) + len as u64;
        if end > u64::from(s.effective_size()) {
            return Err(QlibError::OutOfRange("section range"));
        }
        Ok(s)
    }

    /// Policy of a main section, read from the device if not cached yet.
    fn section_policy(&mut self, section: u8) -> Result<Sspr> {
        if let Some(p) = self.ctx.die().section(section).and_then(|s| s.policy) {
            return Ok(p);
        }
        let policy = self.get_scr_unsigned(section)?.policy().map_err(QlibError::Packing)?;
        if let Some(s) = self.ctx.die_mut().section_mut(section) {
            s.policy = Some(policy);
        }
        Ok(policy)
    }

    // --- keys ---

    /// Register the caller's key for a section. The key is referenced
    /// until removed or until `init_lib`.
    pub fn register_key(&mut self, section: u8, key: &'k Key, full: bool) -> Result<()> {
        if usize::from(section) >= w77q_regs::NUM_SECTIONS {
            return Err(QlibError::InvalidParameter("section"));
        }
        self.ctx
            .key_mngr_mut()
            .set_key(usize::from(section), Some(key), full);
        Ok(())
    }

    pub fn remove_key(&mut self, section: u8, full: bool) -> Result<()> {
        if usize::from(section) >= w77q_regs::NUM_SECTIONS {
            return Err(QlibError::InvalidParameter("section"));
        }
        let kid = if full {
            Kid::full(section)
        } else {
            Kid::restricted(section)
        };
        if self.ctx.key_mngr().kid() == kid {
            return Err(QlibError::IncorrectState);
        }
        self.ctx.key_mngr_mut().set_key(usize::from(section), None, full);
        Ok(())
    }

    /// Provision `new_key` under `new_kid` using the provisioning key
    /// derived from the device key.
    pub fn provision_key(&mut self, device_key: &Key, new_kid: Kid, new_key: &Key) -> Result<()> {
        let prov = if new_kid.is_section_key() {
            Kid::provisioning(new_kid.section())
        } else if new_kid == Kid::DEVICE_SECRET || new_kid == Kid::DEVICE_MASTER {
            Kid::DEVICE_KEY_PROVISIONING
        } else {
            return Err(QlibError::OutOfRange("key id"));
        };
        self.check_power_state()?;
        if self.ctx.key_mngr().is_session_open() {
            return Err(QlibError::IncorrectState);
        }
        let mut pk = crypto::get_provision_key(&mut self.hash, device_key, prov, true, false);
        self.synch_mc()?;
        let opened = self.session_open(prov, Some(&pk), true, false);
        crate::key_mngr::invalidate_key(&mut pk);
        opened?;

        let r = self.set_key(new_kid, new_key);
        let closed = self.session_close(prov, false);
        match &r {
            Ok(()) => info!("provisioned {:?}", new_kid),
            Err(e) => warn!("provisioning {:?} failed: {}", new_kid, e),
        }
        r.and(closed)
    }

    // --- sessions ---

    pub fn open_session(&mut self, section: u8, access: SessionAccess) -> Result<()> {
        self.check_section(section)?;
        self.check_power_state()?;
        if self.ctx.key_mngr().is_session_open() {
            return Err(QlibError::IncorrectState);
        }
        let (kid, ignore_scr) = match access {
            SessionAccess::Full => (Kid::full(section), false),
            SessionAccess::ConfigOnly => (Kid::full(section), true),
            SessionAccess::Restricted => (Kid::restricted(section), false),
        };
        if self.ctx.key_mngr().key_for(kid).is_none() {
            return Err(QlibError::NoKey { kid: kid.0 });
        }
        self.synch_mc()?;
        let r = self.session_open(kid, None, true, ignore_scr);
        let r = match r {
            // a session on a section also opens its plain access
            Ok(()) if usize::from(section) < NUM_MAIN_SECTIONS => self.refresh_section_policy(section),
            r => r,
        };
        self.prng.reseed();
        r
    }

    fn refresh_section_policy(&mut self, section: u8) -> Result<()> {
        let policy = self.get_scr_signed(section)?.policy().map_err(QlibError::Packing)?;
        if let Some(s) = self.ctx.die_mut().section_mut(section) {
            s.policy = Some(policy);
            s.plain_rd = policy.pa_rd_en;
            s.plain_wr = policy.pa_wr_en;
        }
        Ok(())
    }

    pub fn close_session(&mut self, section: u8) -> Result<()> {
        self.check_section(section)?;
        self.check_power_state()?;
        let kid = self.ctx.key_mngr().kid();
        if !kid.is_section_key() || kid.section() != section {
            return Err(QlibError::IncorrectState);
        }
        self.session_close(kid, false)?;
        self.ctx.die_mut().mc_in_sync = false;
        Ok(())
    }

    /// Reopen a session on a section key after a temporary session.
    fn reopen_session(&mut self, kid: Kid) -> Result<()> {
        let access = if kid.is_full() {
            SessionAccess::Full
        } else {
            SessionAccess::Restricted
        };
        self.open_session(kid.section(), access)
    }

    /// Open a short session on `section` and close it again, revoking
    /// plain access on the way out if asked to. Whatever session was open
    /// before is reopened afterwards.
    fn cycle_section_session(&mut self, section: u8, revoke: bool) -> Result<()> {
        let prev = self.ctx.key_mngr().kid();
        if prev.is_valid() && !prev.is_section_key() {
            return Err(QlibError::IncorrectState);
        }
        let access = if self.ctx.key_mngr().key_for(Kid::restricted(section)).is_some() {
            SessionAccess::Restricted
        } else if self.ctx.key_mngr().key_for(Kid::full(section)).is_some() {
            SessionAccess::Full
        } else {
            return Err(DeviceError::Privilege.into());
        };
        if prev.is_valid() {
            self.session_close(prev, false)?;
        }
        let r = self.open_session(section, access).and_then(|()| {
            let kid = self.ctx.key_mngr().kid();
            self.session_close(kid, revoke)
        });
        let reopened = if prev.is_valid() {
            self.reopen_session(prev)
        } else {
            Ok(())
        };
        r.and(reopened)
    }

    // --- plain access ---

    pub fn grant_plain_access(&mut self, section: u8) -> Result<()> {
        self.check_main_section(section)?;
        self.check_power_state()?;
        if self.has(Feature::PaGrantRevoke) {
            let km = self.ctx.key_mngr();
            let kid = [Kid::restricted(section), Kid::full(section)]
                .into_iter()
                .find(|k| km.key_for(*k).is_some())
                .ok_or(DeviceError::Privilege)?;
            self.pa_grant(kid)?;
            let policy = self.section_policy(section)?;
            if let Some(s) = self.ctx.die_mut().section_mut(section) {
                s.plain_rd = policy.pa_rd_en;
                s.plain_wr = policy.pa_wr_en;
            }
            return Ok(());
        }
        let kid = self.ctx.key_mngr().kid();
        if kid.is_section_key() && kid.section() == section {
            // the open session already granted it
            return Ok(());
        }
        self.cycle_section_session(section, false)
    }

    pub fn revoke_plain_access(&mut self, section: u8, kind: PaRevokeType) -> Result<()> {
        self.check_main_section(section)?;
        self.check_power_state()?;
        if self.has(Feature::PaGrantRevoke) {
            self.pa_revoke(section, kind)?;
            if let Some(s) = self.ctx.die_mut().section_mut(section) {
                if kind != PaRevokeType::Write {
                    s.plain_rd = false;
                }
                if kind != PaRevokeType::Read {
                    s.plain_wr = false;
                }
            }
            return Ok(());
        }
        if kind == PaRevokeType::Write {
            return Err(QlibError::NotSupported("write-only plain access revoke"));
        }
        let kid = self.ctx.key_mngr().kid();
        if kid.is_section_key() && kid.section() == section {
            self.session_close(kid, true)
        } else {
            self.cycle_section_session(section, true)
        }
    }

    /// Set or clear the ACLR lock bits of a section. Locks hold until the
    /// next reset.
    pub fn config_access(&mut self, section: u8, read_en: bool, write_en: bool) -> Result<()> {
        self.check_section(section)?;
        let mut aclr = self.get_aclr()?;
        if section == SECTION_VAULT {
            aclr.rd_lock_vault = !read_en;
            aclr.wr_lock_vault = !write_en;
        } else {
            let bit = 1u8 << section;
            aclr.rd_lock = if read_en { aclr.rd_lock & !bit } else { aclr.rd_lock | bit };
            aclr.wr_lock = if write_en { aclr.wr_lock & !bit } else { aclr.wr_lock | bit };
        }
        self.set_aclr(&aclr)?;
        if let Some(s) = self.ctx.die_mut().section_mut(section) {
            s.plain_rd &= read_en;
            s.plain_wr &= write_en;
        }
        Ok(())
    }

    // --- section configuration ---

    /// Rules a new policy has to satisfy before it goes to the device.
    fn check_policy(&self, section: u8, p: &Sspr) -> Result<()> {
        if section == SECTION_VAULT && (p.pa_rd_en || p.pa_wr_en || p.auth_pa) {
            return Err(QlibError::InvalidParameter("plain access to the vault"));
        }
        if p.slog && !self.has(Feature::SecureLog) {
            return Err(QlibError::InvalidParameter("secure log"));
        }
        if p.slog && (p.rollback_en || p.wp_en || p.auth_ac || p.integrity_ac || p.auth_cfg) {
            return Err(QlibError::InvalidParameter("secure log with integrity or rollback"));
        }
        let die = self.ctx.die();
        if section == SECTION_VAULT {
            if p.rollback_en && die.vault_size != 2 * KB_64 {
                return Err(QlibError::InvalidParameter("rollback needs the 128KiB vault"));
            }
            return Ok(());
        }
        let tag = die.section(section).map_or(0, |s| s.size_tag);
        if (p.rollback_en || p.slog) && self.has(Feature::SecSizeScale) && tag & (tag + 1) != 0 {
            return Err(QlibError::InvalidParameter("section size"));
        }
        if p.rollback_en && tag == 0 {
            return Err(QlibError::InvalidParameter("rollback needs two blocks"));
        }
        Ok(())
    }

    /// Write a section's configuration and confirm it by reading it
    /// back. Needs a full access session on the section. With `swap` the
    /// section's two halves change places as the new configuration is
    /// applied.
    pub fn config_section(
        &mut self,
        section: u8,
        cfg: &SectionConfig,
        swap: bool,
        action: ConfigAction,
    ) -> Result<()> {
        self.check_section(section)?;
        self.check_power_state()?;
        self.require_session_on(section, true)?;
        if let Some(p) = &cfg.policy {
            self.check_policy(section, p)?;
        }

        let mut scr = self.get_scr_unsigned(section)?;
        match cfg.version {
            Some(v) => scr.version = v,
            // erased
            None if scr.version == u32::MAX => scr.version = 0,
            None => {}
        }
        if let Some(crc) = cfg.crc {
            scr.checksum = crc;
        }
        if let Some(digest) = cfg.digest {
            scr.digest = digest;
        }
        if let Some(p) = &cfg.policy {
            scr.sspr = p.to_u32().map_err(QlibError::Packing)?;
        }

        let reset = action == ConfigAction::Reset;
        let reload = action == ConfigAction::Reload;
        let retries = if self.has(Feature::SetCmdFail) {
            self.config.errata.set_cmd_retries
        } else {
            0
        };
        let mut attempt = 0;
        loop {
            let r = if swap {
                self.set_scr_swap(section, &scr, reset, reload)
            } else {
                self.set_scr(section, &scr, reset, reload)
            };
            match r {
                Err(QlibError::Device(DeviceError::System))
                    if attempt < retries && !self.ctx.die().ssr.ses_ready() =>
                {
                    attempt += 1;
                    warn!(
                        "session lost configuring section {}, reopening ({}/{})",
                        section, attempt, retries
                    );
                    let kid = self.ctx.key_mngr().kid();
                    self.ctx.key_mngr_mut().end_session();
                    self.synch_mc()?;
                    self.session_open(kid, None, true, false)?;
                }
                r => break r?,
            }
        }

        if reset {
            let die = self.ctx.active_die;
            self.sync_state()?;
            self.select_die(die)?;
        }
        if self.get_scr_unsigned(section)? != scr {
            warn!("SCR {} read back differs from the value written", section);
            return Err(QlibError::CommandFail);
        }
        info!("section {} configured ({})", section, action);
        Ok(())
    }

    pub fn get_section_configuration(&mut self, section: u8) -> Result<SectionInfo> {
        self.check_section(section)?;
        self.check_power_state()?;
        let s = *self
            .ctx
            .die()
            .section(section)
            .ok_or(QlibError::InvalidParameter("section"))?;
        if s.effective_size() == 0 {
            return Ok(SectionInfo {
                base: if section == SECTION_VAULT { u32::MAX } else { 0 },
                ..SectionInfo::default()
            });
        }
        let scr = self.get_scr_unsigned(section)?;
        Ok(SectionInfo {
            base: if section == SECTION_VAULT { u32::MAX } else { s.base },
            size: s.size,
            policy: scr.policy().map_err(QlibError::Packing)?,
            digest: scr.digest,
            crc: scr.checksum,
            version: scr.version,
        })
    }

    /// Whether the device holds a key under `kid`, from GET_KEYS_STATUS.
    pub fn is_key_provisioned(&mut self, kid: Kid) -> Result<bool> {
        self.require(Feature::GetKeysStatus, "GET_KEYS_STATUS")?;
        if kid.is_section_key() && usize::from(kid.section()) >= w77q_regs::NUM_SECTIONS {
            return Err(QlibError::InvalidParameter("section"));
        }
        let ks = self.get_keys_status()?;
        let bit = 1u16 << kid.section();
        Ok(if kid.is_restricted() {
            ks.restricted() & bit != 0
        } else if kid.is_full() {
            ks.full() & bit != 0
        } else if kid == Kid::DEVICE_SECRET {
            ks.secret()
        } else if kid == Kid::DEVICE_MASTER {
            ks.master()
        } else if kid == Kid::DEVICE_KEY_PROVISIONING {
            ks.pre_prov_master()
        } else {
            return Err(QlibError::InvalidParameter("key id"));
        })
    }

    // --- secure data path ---

    /// Read from a section through the open session. With `auth` every
    /// page is signed by the device (SARD); otherwise aligned reads are
    /// pipelined.
    pub fn read(&mut self, section: u8, offset: u32, buf: &mut [u8], auth: bool) -> Result<()> {
        self.require_session_on(section, false)?;
        self.section_window(section, offset, buf.len())?;
        let page = READ_PAGE_SIZE as u32;
        if !auth && offset % page == 0 && buf.len() % READ_PAGE_SIZE == 0 {
            return self.srd_multi(offset, buf);
        }
        let mut addr = offset;
        let mut rest = buf;
        while !rest.is_empty() {
            let skip = (addr % page) as usize;
            let n = (READ_PAGE_SIZE - skip).min(rest.len());
            let data = if auth { self.sard(addr)? } else { self.srd(addr)? };
            let (part, tail) = std::mem::take(&mut rest).split_at_mut(n);
            part.copy_from_slice(&data[skip..skip + n]);
            addr += n as u32;
            rest = tail;
        }
        Ok(())
    }

    /// Write to a section through a full access session. Partial pages
    /// are padded with 0xFF, which leaves the flash contents unchanged.
    pub fn write(&mut self, section: u8, offset: u32, data: &[u8]) -> Result<()> {
        self.require_session_on(section, true)?;
        self.section_window(section, offset, data.len())?;
        let page = WRITE_PAGE_SIZE as u32;
        let mut addr = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let skip = (addr % page) as usize;
            let n = (WRITE_PAGE_SIZE - skip).min(rest.len());
            let mut buf = [0xffu8; WRITE_PAGE_SIZE];
            buf[skip..skip + n].copy_from_slice(&rest[..n]);
            self.sawr(addr - skip as u32, &buf)?;
            addr += n as u32;
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Erase `size` bytes at `offset`, both 4K aligned, using the largest
    /// erase that fits at each step.
    pub fn erase(&mut self, section: u8, offset: u32, size: u32) -> Result<()> {
        if offset % std_cmd::SECTOR_SIZE != 0 {
            return Err(QlibError::InvalidParameter("erase offset must be 4K aligned"));
        }
        if size % std_cmd::SECTOR_SIZE != 0 {
            return Err(QlibError::InvalidParameter("erase size must be 4K aligned"));
        }
        self.require_session_on(section, true)?;
        self.section_window(section, offset, size as usize)?;
        let mut addr = offset;
        let mut remaining = size;
        while remaining > 0 {
            let kind = erase_step(addr, remaining);
            let step = kind.size().unwrap_or(std_cmd::SECTOR_SIZE);
            self.serase(kind, addr)?;
            addr += step;
            remaining -= step;
        }
        Ok(())
    }

    /// Erase a whole section, either under a full access session or as a
    /// plain command where the section allows plain writes.
    pub fn erase_section(&mut self, section: u8, secure: bool) -> Result<()> {
        self.check_main_section(section)?;
        if secure {
            self.require_session_on(section, true)?;
            return self.serase(EraseType::Section, 0);
        }
        if !self.ctx.die().section(section).map_or(false, |s| s.plain_wr) {
            return Err(DeviceError::Privilege.into());
        }
        self.erase_sect_plain(section)
    }

    /// Copy within the section of the open full access session. The
    /// length is rounded down to whole pages.
    pub fn copy_within_section(&mut self, section: u8, dest: u32, src: u32, len: u32) -> Result<()> {
        let len = len & !(WRITE_PAGE_SIZE as u32 - 1);
        if len == 0 {
            return Err(QlibError::InvalidParameter("copy length"));
        }
        self.require_session_on(section, true)?;
        self.section_window(section, src, len as usize)?;
        self.section_window(section, dest, len as usize)?;
        if src < dest + len && dest < src + len {
            return Err(QlibError::OutOfRange("overlapping copy"));
        }
        self.mem_copy(dest, src, len)
    }

    /// CRC-32 of part of a section. The length is rounded down to whole
    /// pages.
    pub fn section_crc(&mut self, section: u8, offset: u32, len: u32) -> Result<u32> {
        let len = len & !(READ_PAGE_SIZE as u32 - 1);
        if len == 0 || (offset | len) & 0xff00_0000 != 0 {
            return Err(QlibError::InvalidParameter("crc range"));
        }
        self.check_main_section(section)?;
        self.section_window(section, offset, len as usize)?;
        self.mem_crc(section, offset, len)
    }

    // --- secure log ---

    pub fn secure_log_read(&mut self, section: u8, secure: bool) -> Result<(u32, [u8; LOG_ENTRY_SIZE])> {
        self.check_main_section(section)?;
        if secure {
            self.require_session_on(section, false)?;
            self.log_srd()
        } else {
            self.log_prd(section)
        }
    }

    /// Append entries to a section's log. `data` is a whole number of
    /// 16 byte entries.
    pub fn secure_log_write(&mut self, section: u8, data: &[u8], secure: bool) -> Result<()> {
        self.check_main_section(section)?;
        if data.is_empty() || data.len() % LOG_ENTRY_SIZE != 0 {
            return Err(QlibError::InvalidParameter("log data must be whole entries"));
        }
        if secure {
            self.require_session_on(section, true)?;
        }
        for chunk in data.chunks_exact(LOG_ENTRY_SIZE) {
            let mut entry = [0u8; LOG_ENTRY_SIZE];
            entry.copy_from_slice(chunk);
            if secure {
                self.log_sawr(&entry)?;
            } else {
                self.log_pwr(section, &entry)?;
            }
        }
        Ok(())
    }

    // --- plain data path ---

    pub fn plain_read(&mut self, section: u8, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.check_main_section(section)?;
        let s = self.section_window(section, offset, buf.len())?;
        if !s.plain_rd {
            return Err(DeviceError::Privilege.into());
        }
        self.std_read(s.base + offset, buf)
    }

    pub fn plain_write(&mut self, section: u8, offset: u32, data: &[u8]) -> Result<()> {
        self.check_main_section(section)?;
        let s = self.section_window(section, offset, data.len())?;
        if !s.plain_wr {
            return Err(DeviceError::Privilege.into());
        }
        self.std_write(s.base + offset, data)
    }

    pub fn plain_erase_sector(&mut self, section: u8, offset: u32) -> Result<()> {
        self.check_main_section(section)?;
        let s = self.section_window(section, offset, std_cmd::SECTOR_SIZE as usize)?;
        if !s.plain_wr {
            return Err(DeviceError::Privilege.into());
        }
        self.std_erase_sector(s.base + offset)
    }

    // --- global configuration ---

    /// Write GMC and/or GMT under a device master session, then reload
    /// the section map.
    pub fn configure_device(&mut self, master_key: &Key, gmc: Option<&Gmc>, gmt: Option<&Gmt>) -> Result<()> {
        self.with_master_session(master_key, |q| {
            if let Some(gmc) = gmc {
                q.set_gmc(gmc)?;
            }
            if let Some(gmt) = gmt {
                q.set_gmt(gmt)?;
            }
            Ok(())
        })?;
        let devcfg = self.get_gmc_unsigned()?.devcfg().map_err(QlibError::Packing)?;
        self.load_section_map(&devcfg)
    }

    /// Read the global configuration of every die. Fields the part does
    /// not implement read as off.
    pub fn get_device_config(&mut self) -> Result<DeviceConfig> {
        let orig = self.ctx.active_die;
        let r = self.read_device_config();
        let back = self.select_die(orig);
        let cfg = r?;
        back?;
        Ok(cfg)
    }

    fn read_device_config(&mut self) -> Result<DeviceConfig> {
        let dies = self.ctx.dies.len();
        self.select_die(0)?;
        let gmc = self.get_gmc_unsigned()?;
        let devcfg = gmc.devcfg().map_err(QlibError::Packing)?;
        let mut cfg = DeviceConfig {
            watchdog_default: Awdtcfg::from_u32(gmc.awdt_dflt).map_err(QlibError::Packing)?,
            safe_fallback: devcfg.fb_en,
            speculative_ck: devcfg.ck_specul,
            plain_format: devcfg.format_en,
            boot_fail_reset: devcfg.boot_fail_rst,
            reset_response: self.has(Feature::RstResp) && devcfg.rst_resp_en,
            rng_plain_access: self.has(Feature::Rng) && devcfg.rng_pa_en,
            locked: devcfg.cfg_lock,
            vault_size: Vec::with_capacity(dies),
            reset_pa: Vec::with_capacity(dies),
        };
        let vault = self.has(Feature::Vault);
        for die in 0..dies {
            let devcfg = if die == 0 {
                devcfg.clone()
            } else {
                self.select_die(die)?;
                self.get_gmc_unsigned()?.devcfg().map_err(QlibError::Packing)?
            };
            cfg.vault_size.push(if vault { devcfg.vault_size() } else { 0 });
            cfg.reset_pa.push(devcfg.rst_pa);
        }
        Ok(cfg)
    }

    /// Secure format of the whole part.
    pub fn format_device(&mut self, master_key: &Key, reset: bool, factory_default: bool) -> Result<()> {
        self.with_master_session(master_key, |q| q.sformat(reset, factory_default, false))
    }

    fn with_master_session<T>(
        &mut self,
        master_key: &Key,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.check_power_state()?;
        if self.ctx.key_mngr().is_session_open() {
            return Err(QlibError::IncorrectState);
        }
        self.synch_mc()?;
        self.session_open(Kid::DEVICE_MASTER, Some(master_key), true, false)?;
        let r = f(self);
        if self.ctx.key_mngr().is_session_open() {
            if let Err(e) = self.session_close(Kid::DEVICE_MASTER, false) {
                warn!("closing device master session failed: {}", e);
                return r.and(Err(e));
            }
        }
        r
    }

    // --- watchdog ---

    pub fn watchdog_configure(&mut self, cfg: &Awdtcfg) -> Result<()> {
        let cur = self.get_awdt_unsigned()?;
        if cur.lock {
            return Err(QlibError::IncorrectState);
        }
        if self.caps()?.target.is_q2() {
            if cfg.enable && cfg.fallback_en {
                return Err(QlibError::NotSupported("watchdog fallback"));
            }
        } else if cfg.enable && cfg.fallback_en && !cfg.sw_reset_en {
            return Err(QlibError::InvalidParameter("watchdog fallback needs sw reset"));
        }

        if cur.authenticated {
            self.require_session_on(*cur.kid, true)?;
            self.set_awdt(cfg)?;
        } else {
            self.set_awdt_plain(cfg)?;
        }
        if self.get_awdt_unsigned()? != *cfg {
            warn!("AWDTCFG read back differs from the value written");
            return Err(QlibError::CommandFail);
        }
        Ok(())
    }

    pub fn watchdog_get(&mut self) -> Result<WatchdogStatus> {
        let sr = self.get_awdtsr_unsigned()?;
        let cfg = self.get_awdt_unsigned()?;
        let fract = self.has(Feature::AwdtValSecFract);
        let osc = cfg.osc_rate_hz(self.has(Feature::AwdtOscRateFrac));
        Ok(WatchdogStatus {
            elapsed_ms: sr.elapsed_ms(fract, osc),
            expired: sr.expired(),
        })
    }

    /// Restart the watchdog count. An authenticated watchdog needs a
    /// session on its section.
    pub fn watchdog_touch(&mut self) -> Result<()> {
        if !self.ctx.watchdog_secure {
            return self.awdt_touch_plain();
        }
        let section = self.ctx.watchdog_section.unwrap_or(0);
        self.require_session_on(section, false)?;
        self.awdt_touch()
    }

    /// Force the watchdog to expire now, and resynchronise if that reset
    /// the flash.
    pub fn watchdog_trigger(&mut self) -> Result<()> {
        let cfg = self.get_awdt_unsigned()?;
        self.awdt_expire()?;
        if !self.ctx.die().ssr.awdt_exp() {
            return Err(QlibError::CommandIgnored);
        }
        if cfg.enable && cfg.sw_reset_en {
            self.sync_after_flash_reset()?;
        }
        Ok(())
    }

    // --- status ---

    pub fn get_notifications(&mut self) -> Result<Notifications> {
        if self.ctx.die().ssr.busy() {
            self.get_ssr_unsigned()?;
        }
        let mc_maintenance = self.ctx.die().ssr.mc_maint() != 0;
        self.synch_mc()?;
        let mc = self.ctx.die().mc;
        let max = self.tc_max();
        Ok(Notifications {
            mc_maintenance,
            replace_device: mc[DMC] >= DMC_EOL_THRESHOLD,
            reset_device: (mc[TC] & max) >= max - TC_RESET_MARGIN,
        })
    }

    pub fn perform_mc_maintenance(&mut self) -> Result<()> {
        self.mc_maint()?;
        self.ctx.die_mut().mc_in_sync = false;
        Ok(())
    }

    /// Check the device for sticky errors, and for uncorrectable ECC
    /// errors on parts with ECC.
    pub fn get_status(&mut self) -> Result<()> {
        if !self.has(Feature::Ecc) {
            self.get_ssr_unsigned()?;
            return self.check_last_ssr_errors(Ssr::ALL_ERRORS);
        }
        let essr = if self.ctx.suspended || !self.ctx.key_mngr().is_session_open() {
            self.get_essr_unsigned()?
        } else {
            self.get_essr_signed()?
        };
        self.ctx.die_mut().ssr = essr.ssr();
        if essr.ecc_ded() {
            return Err(DeviceError::Flash.into());
        }
        if essr.ecc_sec() {
            warn!("flash reported a corrected ECC error");
        }
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)
    }

    /// WID as read by the last `sync_state`.
    pub fn get_wid(&self) -> u64 {
        self.ctx.wid
    }

    pub fn get_hw_version(&mut self) -> Result<HwVer> {
        self.get_hw_ver_unsigned()
    }
}
