// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command processor: one method per secure command.
//!
//! Every method follows the same shape. The CTAG is built, the payload is
//! signed and encrypted if the command calls for it, the exchange runs
//! through the transaction manager, and the SSR it leaves behind is mapped
//! to an error before any response data is trusted.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use num_traits::FromPrimitive;
use packed_struct::prelude::*;
use std::time::Duration;
use w77q_regs::config::{Aclr, Awdtcfg, Gmc, Gmt, Scr};
use w77q_regs::status::{Awdtsr, Essr, HwVer, KeysStatus, Ssr, Tc};
use w77q_regs::{NUM_MAIN_SECTIONS, NUM_SECTIONS};

use crate::cfg::{Capabilities, Feature, Target};
use crate::cmd::{mode, Ctag, IntegrityType, Kid, PaRevokeType, SecCmd, SignedData};
use crate::config::{QlibConfig, TimeoutClass};
use crate::context::{Context, DieState, DMC, TC};
use crate::crypto::{self, CipherKey, Direction, HashBuf, HashEngine, Key, Sha256Engine};
use crate::error::{DeviceError, QlibError, Result};
use crate::prng::{EntropySource, Prng};
use crate::tm::{Bus, Tm};

pub const SIG_SIZE: usize = 8;
pub const TC_SIZE: usize = 4;

/// Largest DMC value the device accepts.
pub const DMC_MAX: u32 = 0x3FFF_FFFF;
const TC_30_BIT_MAX: u32 = 0x3FFF_FFFF;

/// Advance a transaction counter. With 30 bit counters the two top bits
/// carry the die id and are left alone.
pub fn next_tc(tc: u32, tc30: bool) -> u32 {
    if tc30 {
        (tc & !TC_30_BIT_MAX) | (tc.wrapping_add(1) & TC_30_BIT_MAX)
    } else {
        tc.wrapping_add(1)
    }
}

fn mc_from_bytes(b: &[u8]) -> [u32; 2] {
    [LittleEndian::read_u32(&b[0..4]), LittleEndian::read_u32(&b[4..8])]
}

/// Per-command crypto state: the salted hash buffer and the key id it
/// belongs to, plus the counter value it consumed.
#[derive(Clone, Copy)]
pub(crate) struct CmdCtx {
    pub buf: HashBuf,
    pub kid: Kid,
    pub tc: u32,
}

impl CmdCtx {
    pub fn sign<H: HashEngine + ?Sized>(&self, h: &mut H, ctag: Ctag, data: &[u8]) -> u64 {
        crypto::calc_auth_signature(h, self.buf.with(ctag, data), self.kid)
    }

    pub fn cipher<H: HashEngine + ?Sized>(&self, h: &mut H, dir: Direction) -> CipherKey {
        crypto::build_cipher_key(h, self.buf, self.kid, dir)
    }
}

/// The driver for one W77Q part.
///
/// `'k` is the lifetime of the section keys registered with the key
/// manager; they are referenced, never copied.
pub struct Qlib<'k, B, H = Sha256Engine> {
    pub(crate) tm: Tm<B>,
    pub(crate) hash: H,
    pub(crate) prng: Prng,
    pub(crate) config: QlibConfig,
    pub(crate) caps: Option<Capabilities>,
    pub(crate) ctx: Context<'k>,
}

impl<'k, B: Bus> Qlib<'k, B, Sha256Engine> {
    pub fn new(bus: B, entropy: Box<dyn EntropySource>, config: QlibConfig) -> Self {
        Qlib::with_hash(bus, Sha256Engine::default(), entropy, config)
    }
}

impl<'k, B: Bus, H: HashEngine> Qlib<'k, B, H> {
    pub fn with_hash(bus: B, hash: H, entropy: Box<dyn EntropySource>, config: QlibConfig) -> Self {
        Qlib {
            tm: Tm::new(bus, &config.bus),
            hash,
            prng: Prng::new(entropy),
            config,
            caps: None,
            ctx: Context::new(1),
        }
    }

    pub fn context(&self) -> &Context<'k> {
        &self.ctx
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.caps.as_ref()
    }

    pub fn config(&self) -> &QlibConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        self.tm.bus()
    }

    pub fn bus_mut(&mut self) -> &mut B {
        self.tm.bus_mut()
    }

    pub fn into_bus(self) -> B {
        self.tm.into_bus()
    }

    pub fn connect(&mut self) -> Result<()> {
        self.tm.connect()
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.tm.disconnect()
    }

    /// Resolve the capabilities of the attached part, either from a known
    /// target or by reading HW_VER. Must run before any feature-gated
    /// command.
    pub fn cfg_init(&mut self, target: Option<Target>) -> Result<()> {
        let caps = match target {
            Some(t) => Capabilities::from_target(t),
            None => {
                let hw = self.get_hw_ver_unsigned()?;
                Capabilities::from_hw_ver(hw)?
            }
        };
        info!("target {} features {:?}", caps.target, caps.features);
        self.tm.configure(&caps);
        let dies = caps.num_dies.max(1);
        self.ctx.dies.resize_with(dies, DieState::new);
        if self.ctx.active_die >= dies {
            self.ctx.active_die = 0;
        }
        self.caps = Some(caps);
        Ok(())
    }

    pub(crate) fn caps(&self) -> Result<&Capabilities> {
        self.caps.as_ref().ok_or(QlibError::IncorrectState)
    }

    pub(crate) fn has(&self, f: Feature) -> bool {
        self.caps.as_ref().map_or(false, |c| c.has(f))
    }

    pub(crate) fn require(&self, f: Feature, what: &'static str) -> Result<()> {
        self.caps()?.require(f, what)
    }

    pub(crate) fn timeout(&self, class: TimeoutClass) -> Duration {
        self.config.timeouts.get(class)
    }

    pub(crate) fn tc_max(&self) -> u32 {
        if self.has(Feature::Tc30Bit) {
            TC_30_BIT_MAX
        } else {
            u32::MAX
        }
    }

    /// Run one secure exchange and record the SSR it leaves behind.
    pub(crate) fn exec(
        &mut self,
        ctag: Ctag,
        out: &[u8],
        inp: &mut [u8],
        class: TimeoutClass,
    ) -> Result<()> {
        if self.ctx.die().powered_down {
            return Err(QlibError::CommandIgnored);
        }
        debug!(
            "{:?} ctag {:#010x} out {} in {}",
            SecCmd::from_u8(ctag.opcode()),
            ctag.0,
            out.len(),
            inp.len()
        );
        let timeout = self.timeout(class);
        match self.tm.secure_cmd(ctag, out, inp, timeout) {
            Ok(ssr) => {
                debug!("ssr {:#010x}", ssr.bits());
                self.ctx.die_mut().ssr = ssr;
                Ok(())
            }
            Err(e) => {
                // the device may or may not have consumed a counter
                self.ctx.die_mut().mc_in_sync = false;
                Err(e)
            }
        }
    }

    pub(crate) fn exec_checked(
        &mut self,
        ctag: Ctag,
        out: &[u8],
        inp: &mut [u8],
        class: TimeoutClass,
        mask: u32,
    ) -> Result<()> {
        self.exec(ctag, out, inp, class)?;
        self.check_last_ssr_errors(mask)
    }

    /// Map the sticky bits of the last SSR selected by `mask` to an error.
    /// Any error bit, masked or not, is cleared on the device with GET_MC,
    /// which also refreshes the cached counters.
    pub(crate) fn check_last_ssr_errors(&mut self, mask: u32) -> Result<()> {
        let ssr = self.ctx.die().ssr;
        let err = DeviceError::from_ssr(ssr, mask);
        if ssr.errors() != 0 {
            self.ctx.multi_transaction = false;
            if self.config.errata.clear_errors_with_get_mc {
                self.clear_sticky_errors();
            }
        }
        match err {
            Some(e) => {
                debug!("device error {:?} (ssr {:#010x})", e, ssr.bits());
                Err(e.into())
            }
            None => Ok(()),
        }
    }

    fn clear_sticky_errors(&mut self) {
        let mut buf = [0u8; 8];
        let r = self.exec(Ctag::plain(SecCmd::GetMc), &[], &mut buf, TimeoutClass::SecureCmd);
        let die = self.ctx.die_mut();
        match r {
            Ok(()) if !die.ssr.err() => die.mc = mc_from_bytes(&buf),
            _ => {
                warn!("GET_MC failed while clearing errors; counters out of sync");
                die.mc_in_sync = false;
            }
        }
    }

    fn read_unsigned(&mut self, ctag: Ctag, buf: &mut [u8]) -> Result<()> {
        self.exec_checked(ctag, &[], buf, TimeoutClass::SecureCmd, Ssr::ALL_ERRORS)
    }

    pub(crate) fn exec_plain(&mut self, ctag: Ctag, data: &[u8], class: TimeoutClass) -> Result<()> {
        self.exec_checked(ctag, data, &mut [], class, Ssr::ALL_ERRORS)
    }

    // --- monotonic counters ---

    /// Refresh the cached counters from the device unless they are already
    /// known to be in sync.
    pub fn synch_mc(&mut self) -> Result<()> {
        if self.ctx.die().mc_in_sync {
            return Ok(());
        }
        let old = self.ctx.die().mc;
        let mc = self.get_mc_unsigned()?;
        let max = self.tc_max();
        let cntr = if self.has(Feature::Tc30Bit) {
            mc[TC] & TC_30_BIT_MAX
        } else {
            mc[TC]
        };
        if cntr >= max || mc[DMC] >= DMC_MAX {
            return Err(DeviceError::MonotonicCounter.into());
        }
        if mc[DMC] < old[DMC] {
            // keep the last good pair
            warn!("DMC went backwards: {:#x} -> {:#x}", old[DMC], mc[DMC]);
            return Err(DeviceError::MonotonicCounter.into());
        }
        let die = self.ctx.die_mut();
        die.mc = mc;
        die.mc_in_sync = true;
        Ok(())
    }

    /// Consume one transaction counter value for a command about to be
    /// sent, returning the pair the command is bound to.
    pub(crate) fn use_mc(&mut self) -> Result<[u32; 2]> {
        self.synch_mc()?;
        let max = self.tc_max();
        let tc30 = self.has(Feature::Tc30Bit);
        let die = self.ctx.die_mut();
        let mc = die.mc;
        let cntr = if tc30 { mc[TC] & TC_30_BIT_MAX } else { mc[TC] };
        if cntr == max {
            return Err(DeviceError::MonotonicCounter.into());
        }
        die.mc[TC] = next_tc(mc[TC], tc30);
        Ok(mc)
    }

    /// Crypto context for the next command of the open session.
    pub(crate) fn session_context(&mut self) -> Result<CmdCtx> {
        let kid = self.ctx.key_mngr().kid();
        if !kid.is_valid() {
            return Err(DeviceError::Session.into());
        }
        let mc = self.use_mc()?;
        let buf = self.ctx.key_mngr_mut().next_context(mc[TC]);
        Ok(CmdCtx {
            buf,
            kid,
            tc: mc[TC],
        })
    }

    /// Response data starts with the counter the device used; it has to
    /// be the one the host bound the command to.
    pub(crate) fn check_tc(&mut self, resp: &[u8], expected: u32) -> Result<()> {
        let tc = LittleEndian::read_u32(&resp[..TC_SIZE]);
        if tc != expected {
            warn!("device used TC {:#x}, host expected {:#x}", tc, expected);
            self.ctx.die_mut().mc_in_sync = false;
            return Err(QlibError::IncorrectState);
        }
        Ok(())
    }

    /// Sign `data` under the open session and send it, encrypting the
    /// payload and hiding the CTAG address as requested. `ctag` carries the
    /// plain address when `addr` is set.
    pub(crate) fn signed_setter(
        &mut self,
        ctag: Ctag,
        data: &[u8],
        encrypt: bool,
        addr: Option<u32>,
        class: TimeoutClass,
    ) -> Result<()> {
        if data.len() > HashBuf::DATA_SIZE {
            return Err(QlibError::InvalidDataSize {
                size: data.len(),
                limit: HashBuf::DATA_SIZE,
            });
        }
        let c = self.session_context()?;
        let sig = c.sign(&mut self.hash, ctag, data);
        let mut out = Vec::with_capacity(data.len() + SIG_SIZE);
        out.extend_from_slice(data);
        let mut wire_ctag = ctag;
        if encrypt || addr.is_some() {
            let cipher = c.cipher(&mut self.hash, Direction::DecryptionOfInput);
            if let Some(a) = addr {
                wire_ctag = ctag.with_addr(crypto::encrypt_address(a, &cipher));
            }
            if encrypt {
                crypto::encrypt_data(&mut out, &cipher);
            }
        }
        out.extend_from_slice(&sig.to_le_bytes());
        self.exec(wire_ctag, &out, &mut [], class)
    }

    /// Signed setter that retries a spurious SYS_ERR on parts known to
    /// report one.
    fn signed_setter_retrying(&mut self, ctag: Ctag, data: &[u8]) -> Result<()> {
        let retries = if self.has(Feature::SetCmdFail) {
            self.config.errata.set_cmd_retries
        } else {
            0
        };
        let mut attempt = 0;
        loop {
            self.signed_setter(ctag, data, false, None, TimeoutClass::SecureCmd)?;
            match self.check_last_ssr_errors(Ssr::ALL_ERRORS) {
                // a lost session needs a new one first, left to the caller
                Err(QlibError::Device(DeviceError::System))
                    if attempt < retries && self.ctx.die().ssr.ses_ready() =>
                {
                    attempt += 1;
                    warn!(
                        "{:?} reported SYS_ERR, retry {}/{}",
                        SecCmd::from_u8(ctag.opcode()),
                        attempt,
                        retries
                    );
                }
                r => return r,
            }
        }
    }

    /// CALC_SIG: read a value together with a signature over it.
    pub fn calc_sig(&mut self, what: SignedData) -> Result<Vec<u8>> {
        let c = self.session_context()?;
        let ctag = Ctag::params(SecCmd::CalcSig, what.id(), 0, 0);
        let n = what.size();
        let mut resp = vec![0u8; TC_SIZE + n + SIG_SIZE];
        self.exec_checked(ctag, &[], &mut resp, TimeoutClass::SecureCmd, Ssr::ALL_ERRORS)?;
        self.check_tc(&resp, c.tc)?;
        let (data, sig) = resp[TC_SIZE..].split_at(n);
        if LittleEndian::read_u64(sig) != c.sign(&mut self.hash, ctag, data) {
            return Err(QlibError::SignatureMismatch);
        }
        Ok(data.to_vec())
    }

    // --- status and identity ---

    /// OP0 on its own.
    pub fn get_ssr_unsigned(&mut self) -> Result<Ssr> {
        if self.ctx.die().powered_down {
            return Err(QlibError::CommandIgnored);
        }
        let ssr = self.tm.get_ssr()?;
        self.ctx.die_mut().ssr = ssr;
        Ok(ssr)
    }

    pub fn get_ssr_signed(&mut self) -> Result<Ssr> {
        let d = self.calc_sig(SignedData::Ssr)?;
        Ok(Ssr::from(LittleEndian::read_u32(&d)))
    }

    pub fn get_essr_unsigned(&mut self) -> Result<Essr> {
        self.require(Feature::Essr, "GET_ESSR")?;
        let mut buf = [0u8; 8];
        self.read_unsigned(Ctag::plain(SecCmd::GetEssr), &mut buf)?;
        Ok(Essr::from(u64::from_le_bytes(buf)))
    }

    pub fn get_essr_signed(&mut self) -> Result<Essr> {
        self.require(Feature::Essr, "GET_ESSR")?;
        let d = self.calc_sig(SignedData::Essr)?;
        Ok(Essr::from(LittleEndian::read_u64(&d)))
    }

    pub fn get_wid_unsigned(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_unsigned(Ctag::plain(SecCmd::GetWid), &mut buf)?;
        let wid = u64::from_le_bytes(buf);
        self.ctx.wid = wid;
        Ok(wid)
    }

    pub fn get_wid_signed(&mut self) -> Result<u64> {
        let d = self.calc_sig(SignedData::Wid)?;
        let wid = LittleEndian::read_u64(&d);
        self.ctx.wid = wid;
        Ok(wid)
    }

    pub fn get_suid_unsigned(&mut self) -> Result<[u8; 16]> {
        let mut buf = [0u8; 16];
        self.read_unsigned(Ctag::plain(SecCmd::GetSuid), &mut buf)?;
        Ok(buf)
    }

    pub fn get_suid_signed(&mut self) -> Result<[u8; 16]> {
        let d = self.calc_sig(SignedData::Suid)?;
        let mut suid = [0u8; 16];
        suid.copy_from_slice(&d);
        Ok(suid)
    }

    pub fn get_hw_ver_unsigned(&mut self) -> Result<HwVer> {
        let mut buf = [0u8; 4];
        self.read_unsigned(Ctag::plain(SecCmd::GetVersion), &mut buf)?;
        Ok(HwVer::from(u32::from_le_bytes(buf)))
    }

    pub fn get_hw_ver_signed(&mut self) -> Result<HwVer> {
        let d = self.calc_sig(SignedData::HwVer)?;
        Ok(HwVer::from(LittleEndian::read_u32(&d)))
    }

    pub fn get_awdtsr_unsigned(&mut self) -> Result<Awdtsr> {
        let mut buf = [0u8; 4];
        self.read_unsigned(Ctag::plain(SecCmd::GetAwdtsr), &mut buf)?;
        Ok(Awdtsr(u32::from_le_bytes(buf)))
    }

    pub fn get_awdtsr_signed(&mut self) -> Result<Awdtsr> {
        let d = self.calc_sig(SignedData::Awdtsr)?;
        Ok(Awdtsr(LittleEndian::read_u32(&d)))
    }

    pub fn get_awdt_unsigned(&mut self) -> Result<Awdtcfg> {
        let mut buf = [0u8; 4];
        self.read_unsigned(Ctag::plain(SecCmd::GetAwdt), &mut buf)?;
        Awdtcfg::from_u32(u32::from_le_bytes(buf)).map_err(QlibError::Packing)
    }

    pub fn get_awdt_signed(&mut self) -> Result<Awdtcfg> {
        let d = self.calc_sig(SignedData::Awdtcfg)?;
        Awdtcfg::from_u32(LittleEndian::read_u32(&d)).map_err(QlibError::Packing)
    }

    pub fn get_gmc_unsigned(&mut self) -> Result<Gmc> {
        let mut buf = [0u8; 20];
        self.read_unsigned(Ctag::plain(SecCmd::GetGmc), &mut buf)?;
        Gmc::unpack(&buf).map_err(QlibError::Packing)
    }

    pub fn get_gmc_signed(&mut self) -> Result<Gmc> {
        let d = self.calc_sig(SignedData::Gmc)?;
        Gmc::unpack_from_slice(&d).map_err(QlibError::Packing)
    }

    pub fn get_gmt_unsigned(&mut self) -> Result<Gmt> {
        let mut buf = [0u8; 20];
        self.read_unsigned(Ctag::plain(SecCmd::GetGmt), &mut buf)?;
        Gmt::unpack(&buf).map_err(QlibError::Packing)
    }

    pub fn get_gmt_signed(&mut self) -> Result<Gmt> {
        let d = self.calc_sig(SignedData::Gmt)?;
        Gmt::unpack_from_slice(&d).map_err(QlibError::Packing)
    }

    pub fn get_scr_unsigned(&mut self, section: u8) -> Result<Scr> {
        let mut buf = [0u8; 20];
        self.read_unsigned(Ctag::params(SecCmd::GetScr, section, 0, 0), &mut buf)?;
        Scr::unpack(&buf).map_err(QlibError::Packing)
    }

    pub fn get_scr_signed(&mut self, section: u8) -> Result<Scr> {
        let d = self.calc_sig(SignedData::SectionConfig(section))?;
        Scr::unpack_from_slice(&d).map_err(QlibError::Packing)
    }

    /// Digest of a section's contents, signed.
    pub fn get_section_digest(&mut self, section: u8) -> Result<u64> {
        let d = self.calc_sig(SignedData::SectionDigest(section))?;
        Ok(LittleEndian::read_u64(&d))
    }

    pub fn get_mc_unsigned(&mut self) -> Result<[u32; 2]> {
        let mut buf = [0u8; 8];
        self.read_unsigned(Ctag::plain(SecCmd::GetMc), &mut buf)?;
        Ok(mc_from_bytes(&buf))
    }

    /// The counters as the device reports them, signed. The TC in the
    /// reply is the one this very command consumed.
    pub fn get_mc_signed(&mut self) -> Result<[u32; 2]> {
        let d = self.calc_sig(SignedData::Mc)?;
        Ok(mc_from_bytes(&d))
    }

    /// Current transaction counter, without the die bits on 30 bit parts.
    pub fn get_tc(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_unsigned(Ctag::plain(SecCmd::GetTc), &mut buf)?;
        let tc = Tc::from(u32::from_le_bytes(buf));
        Ok(if self.has(Feature::Tc30Bit) {
            tc.cntr()
        } else {
            tc.bits()
        })
    }

    pub fn mc_maint(&mut self) -> Result<()> {
        self.exec_plain(Ctag::plain(SecCmd::McMaint), &[], TimeoutClass::SectorErase)
    }

    pub fn get_keys_status(&mut self) -> Result<KeysStatus> {
        self.require(Feature::GetKeysStatus, "GET_KEYS_STATUS")?;
        let mut buf = [0u8; 8];
        self.read_unsigned(Ctag::plain(SecCmd::GetKeysStatus), &mut buf)?;
        Ok(KeysStatus::from(u64::from_le_bytes(buf)))
    }

    // --- sessions ---

    /// SESSION_OPEN. When `key` is `None` the key registered for `kid` is
    /// used. On any failure the session state is scrubbed.
    pub fn session_open(
        &mut self,
        kid: Kid,
        key: Option<&Key>,
        include_wid: bool,
        ignore_scr_validity: bool,
    ) -> Result<()> {
        let ctag = Ctag::params(
            SecCmd::SessionOpen,
            kid.0,
            mode::session_open(include_wid, ignore_scr_validity),
            0,
        );
        let key: &Key = match key {
            Some(k) => k,
            None => {
                if usize::from(kid.section()) >= NUM_SECTIONS {
                    return Err(QlibError::IncorrectState);
                }
                self.ctx
                    .key_mngr()
                    .key_for(kid)
                    .ok_or(QlibError::NoKey { kid: kid.0 })?
            }
        };
        let nonce = self.prng.nonce();
        let mc = self.use_mc()?;
        let wid = if include_wid { Some(self.ctx.wid) } else { None };
        let keys = crypto::session_key_and_signature(&mut self.hash, key, ctag, mc, nonce, wid);
        self.prng.set_seed(keys.seed);
        self.ctx.key_mngr_mut().start_session(kid, keys.session_key);

        let r = self.session_open_exchange(kid, ctag, nonce, keys.signature);
        match &r {
            Ok(()) => info!("session open, kid {:?}", kid),
            Err(e) => {
                warn!("session open for {:?} failed: {}", kid, e);
                self.ctx.key_mngr_mut().end_session();
            }
        }
        r
    }

    fn session_open_exchange(&mut self, kid: Kid, ctag: Ctag, nonce: u64, sig: u64) -> Result<()> {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&nonce.to_le_bytes());
        out[8..].copy_from_slice(&sig.to_le_bytes());
        self.exec(ctag, &out, &mut [], TimeoutClass::SecureCmd)?;

        if self.has(Feature::OpenSessSysErr) && self.config.errata.ignore_open_session_sys_err {
            let ssr = &mut self.ctx.die_mut().ssr;
            if ssr.sys_err() {
                warn!("ignoring SYS_ERR after SESSION_OPEN");
                ssr.clear(Ssr::SYS_ERR);
                if ssr.errors() == 0 {
                    // the bit is still sticky on the device
                    self.clear_sticky_errors();
                }
            }
        }
        let mask = if kid.is_full() {
            Ssr::IGNORE_INTEG_ERR
        } else {
            Ssr::ALL_ERRORS
        };
        self.check_last_ssr_errors(mask)?;

        let ssr = self.ctx.die().ssr;
        if !ssr.ses_ready() {
            return Err(QlibError::IncorrectState);
        }
        let opened = if self.has(Feature::EssrKidMsb) {
            let essr = self.get_essr_unsigned()?;
            Kid((essr.kid_msb() << 4) | ssr.kid()) == kid
        } else {
            ssr.kid() == kid.section()
        };
        if !opened {
            return Err(QlibError::IncorrectState);
        }
        Ok(())
    }

    /// SESSION_CLOSE, or the equivalent sequence on parts without it.
    pub fn session_close(&mut self, kid: Kid, revoke_pa: bool) -> Result<()> {
        if self.has(Feature::SessionCloseNotSupported) {
            return self.session_close_bypass(kid, revoke_pa);
        }
        let ctag = Ctag::params(SecCmd::SessionClose, kid.0, mode::session_close(revoke_pa), 0);
        self.exec_plain(ctag, &[], TimeoutClass::SecureCmd)?;
        self.forget_session(kid, revoke_pa)
    }

    fn forget_session(&mut self, kid: Kid, revoke_pa: bool) -> Result<()> {
        self.ctx.key_mngr_mut().end_session();
        info!("session closed, kid {:?}", kid);
        if revoke_pa {
            if usize::from(kid.section()) >= NUM_MAIN_SECTIONS {
                return Err(QlibError::IncorrectState);
            }
            if let Some(s) = self.ctx.die_mut().section_mut(kid.section()) {
                s.plain_rd = false;
                s.plain_wr = false;
            }
        }
        Ok(())
    }

    /// Close a session by re-initialising plain access, or by a session
    /// open the device is bound to reject.
    fn session_close_bypass(&mut self, kid: Kid, revoke_pa: bool) -> Result<()> {
        if revoke_pa {
            if usize::from(kid.section()) >= NUM_MAIN_SECTIONS {
                return Err(QlibError::IncorrectState);
            }
            self.init_section_pa(kid.section())?;
            return self.forget_session(kid, true);
        }

        let ctag = Ctag::params(SecCmd::SessionOpen, kid.0, mode::session_open(false, false), 0);
        let nonce = self.prng.nonce();
        let mc = self.use_mc()?;
        let keys = crypto::session_key_and_signature(&mut self.hash, &[0; 16], ctag, mc, nonce, None);
        self.prng.set_seed(keys.seed);
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&nonce.to_le_bytes());
        out[8..].copy_from_slice(&keys.signature.to_le_bytes());
        let r = self.exec(ctag, &out, &mut [], TimeoutClass::SecureCmd);
        self.ctx.key_mngr_mut().end_session();
        r?;
        // the rejection is expected, only the sticky bits need clearing
        self.check_last_ssr_errors(0)?;
        if self.ctx.die().ssr.ses_ready() {
            return Err(QlibError::IncorrectState);
        }
        info!("session closed by rejected open, kid {:?}", kid);
        Ok(())
    }

    // --- plain access ---

    pub fn init_section_pa(&mut self, section: u8) -> Result<()> {
        self.exec_checked(
            Ctag::params(SecCmd::InitSectionPa, section, 0, 0),
            &[],
            &mut [],
            TimeoutClass::SecureCmd,
            Ssr::IGNORE_INTEG_ERR,
        )
    }

    pub fn pa_grant_plain(&mut self, section: u8) -> Result<()> {
        self.require(Feature::PaGrantRevoke, "PA_GRANT_PLAIN")?;
        self.exec_plain(
            Ctag::params(SecCmd::PaGrantPlain, section, 0, 0),
            &[],
            TimeoutClass::SecureCmd,
        )
    }

    /// PA_GRANT: proves knowledge of a section key without opening a
    /// session.
    pub fn pa_grant(&mut self, kid: Kid) -> Result<()> {
        self.require(Feature::PaGrantRevoke, "PA_GRANT")?;
        if usize::from(kid.section()) >= NUM_SECTIONS {
            return Err(QlibError::IncorrectState);
        }
        let key = self
            .ctx
            .key_mngr()
            .key_for(kid)
            .ok_or(QlibError::NoKey { kid: kid.0 })?;
        let ctag = Ctag::params(SecCmd::PaGrant, kid.0, 0, 0);
        let mc = self.use_mc()?;
        let wid = Some(self.ctx.wid);
        let keys = crypto::session_key_and_signature(&mut self.hash, key, ctag, mc, 0, wid);
        self.exec_plain(ctag, &keys.signature.to_le_bytes(), TimeoutClass::SecureCmd)
    }

    pub fn pa_revoke(&mut self, section: u8, kind: PaRevokeType) -> Result<()> {
        self.require(Feature::PaGrantRevoke, "PA_REVOKE")?;
        self.exec_plain(
            Ctag::params(SecCmd::PaRevoke, section, kind as u8, 0),
            &[],
            TimeoutClass::SecureCmd,
        )
    }

    /// VER_INTG: ask the device to check a section's CRC or digest.
    pub fn check_integrity(&mut self, section: u8, kind: IntegrityType) -> Result<()> {
        if kind == IntegrityType::Digest {
            self.require(Feature::VerIntgDigest, "VER_INTG digest")?;
        }
        self.exec_plain(
            Ctag::params(SecCmd::VerIntg, section, kind as u8, 0),
            &[],
            TimeoutClass::SectorErase,
        )
    }

    // --- configuration ---

    pub fn set_key(&mut self, kid: Kid, key: &Key) -> Result<()> {
        let ctag = Ctag::params(SecCmd::SetKey, kid.0, 0, 0);
        self.signed_setter(ctag, key, true, None, TimeoutClass::Write)?;
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)
    }

    pub fn set_suid(&mut self, suid: &[u8; 16]) -> Result<()> {
        self.signed_setter(Ctag::plain(SecCmd::SetSuid), suid, false, None, TimeoutClass::Write)?;
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)
    }

    pub fn set_gmc(&mut self, gmc: &Gmc) -> Result<()> {
        let data = gmc.pack().map_err(QlibError::Packing)?;
        self.signed_setter_retrying(Ctag::plain(SecCmd::SetGmc), &data)
    }

    pub fn set_gmt(&mut self, gmt: &Gmt) -> Result<()> {
        let data = gmt.pack().map_err(QlibError::Packing)?;
        self.signed_setter_retrying(Ctag::plain(SecCmd::SetGmt), &data)
    }

    /// SET_SCR. Needs a full access session on the same section.
    pub fn set_scr(&mut self, section: u8, scr: &Scr, reset: bool, reload: bool) -> Result<()> {
        self.write_scr(SecCmd::SetScr, section, scr, reset, reload)
    }

    /// SET_SCR_SWAP: write the configuration of a rollback section and
    /// exchange its active image with the backup half in the same step.
    pub fn set_scr_swap(&mut self, section: u8, scr: &Scr, reset: bool, reload: bool) -> Result<()> {
        self.write_scr(SecCmd::SetScrSwap, section, scr, reset, reload)
    }

    fn write_scr(&mut self, cmd: SecCmd, section: u8, scr: &Scr, reset: bool, reload: bool) -> Result<()> {
        if !self.ctx.key_mngr().is_section_full_access(section) {
            return Err(QlibError::CommandIgnored);
        }
        let ctag = Ctag::params(cmd, section, mode::set_scr(reset, reload), 0);
        let data = scr.pack().map_err(QlibError::Packing)?;
        let readback = self.has(Feature::SetScrErrata289) && self.config.errata.set_scr_verify_readback;
        match self.signed_setter_retrying(ctag, &data) {
            Err(QlibError::Device(DeviceError::Session)) if readback => {
                warn!("{:?} reported a session error, verifying by read back", cmd);
                if self.get_scr_unsigned(section)? != *scr {
                    return Err(DeviceError::Session.into());
                }
            }
            r => r?,
        }
        if reset {
            // the part restarts; sync_after_flash_reset rebuilds the rest
            let die = self.ctx.die_mut();
            die.key_mngr.end_session();
            die.mc_in_sync = false;
            return Ok(());
        }
        let policy = scr.policy().ok();
        let die = self.ctx.die_mut();
        if let Some(s) = die.section_mut(section) {
            s.policy = policy;
            // a reload keeps the session, and with it the plain access the
            // new policy allows
            s.plain_rd = reload && policy.map_or(false, |p| p.pa_rd_en);
            s.plain_wr = reload && policy.map_or(false, |p| p.pa_wr_en);
        }
        if !reload {
            die.key_mngr.end_session();
            info!("session closed by {:?} on section {}", cmd, section);
        }
        Ok(())
    }

    pub fn set_awdt(&mut self, cfg: &Awdtcfg) -> Result<()> {
        let v = cfg.to_u32().map_err(QlibError::Packing)?;
        self.signed_setter(Ctag::plain(SecCmd::SetAwdt), &v.to_le_bytes(), false, None, TimeoutClass::Write)?;
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)?;
        self.note_watchdog(cfg);
        Ok(())
    }

    pub fn set_awdt_plain(&mut self, cfg: &Awdtcfg) -> Result<()> {
        let v = cfg.to_u32().map_err(QlibError::Packing)?;
        self.exec_plain(Ctag::plain(SecCmd::SetAwdtPlain), &v.to_le_bytes(), TimeoutClass::Write)?;
        self.note_watchdog(cfg);
        Ok(())
    }

    pub(crate) fn note_watchdog(&mut self, cfg: &Awdtcfg) {
        self.ctx.watchdog_secure = cfg.authenticated;
        self.ctx.watchdog_section = Some(*cfg.kid);
    }

    pub fn awdt_touch(&mut self) -> Result<()> {
        self.signed_setter(Ctag::plain(SecCmd::AwdtTouch), &[], false, None, TimeoutClass::SecureCmd)?;
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)
    }

    pub fn awdt_touch_plain(&mut self) -> Result<()> {
        self.exec_plain(Ctag::plain(SecCmd::AwdtTouchPlain), &[], TimeoutClass::SecureCmd)
    }

    /// Force the watchdog to expire.
    pub fn awdt_expire(&mut self) -> Result<()> {
        self.exec_plain(Ctag::plain(SecCmd::AwdtExpire), &[], TimeoutClass::SecureCmd)
    }

    pub fn sleep(&mut self) -> Result<()> {
        self.require(Feature::Sleep, "SLEEP")?;
        self.exec_plain(Ctag::plain(SecCmd::Sleep), &[], TimeoutClass::SecureCmd)
    }

    /// Write one 64 byte half of the reset response. Only the device
    /// master session may do this; the signature covers a digest of the
    /// data since it does not fit the hash buffer.
    pub fn set_rst_resp(&mut self, second_half: bool, half: &[u8; 64]) -> Result<()> {
        self.require(Feature::RstResp, "SET_RST_RESP")?;
        if self.ctx.key_mngr().kid() != Kid::DEVICE_MASTER {
            return Err(QlibError::CommandIgnored);
        }
        let ctag = Ctag::params(SecCmd::SetRstResp, u8::from(second_half), 0, 0);
        let digest = self.hash.hash(&[&half[..]]);
        let c = self.session_context()?;
        let sig = c.sign(&mut self.hash, ctag, &digest);
        let mut out = Vec::with_capacity(64 + SIG_SIZE);
        out.extend_from_slice(half);
        out.extend_from_slice(&sig.to_le_bytes());
        self.exec_plain(ctag, &out, TimeoutClass::Write)
    }

    pub fn get_rst_resp(&mut self) -> Result<[u8; 128]> {
        self.require(Feature::RstResp, "GET_RST_RESP")?;
        let mut buf = [0u8; 128];
        self.read_unsigned(Ctag::plain(SecCmd::GetRstResp), &mut buf)?;
        Ok(buf)
    }

    pub fn set_aclr(&mut self, aclr: &Aclr) -> Result<()> {
        let v = aclr.to_u32().map_err(QlibError::Packing)?;
        self.exec_plain(Ctag::plain(SecCmd::SetAclr), &v.to_le_bytes(), TimeoutClass::SecureCmd)
    }

    pub fn get_aclr(&mut self) -> Result<Aclr> {
        let mut buf = [0u8; 4];
        self.read_unsigned(Ctag::plain(SecCmd::GetAclr), &mut buf)?;
        Aclr::from_u32(u32::from_le_bytes(buf)).map_err(QlibError::Packing)
    }

    /// SFORMAT: secure format, under a device master session.
    pub fn sformat(&mut self, reset: bool, factory_default: bool, init: bool) -> Result<()> {
        let ctag = Ctag::mode(SecCmd::Sformat, mode::format(reset, factory_default, init));
        self.signed_setter(ctag, &[], false, None, TimeoutClass::ChipErase)?;
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)?;
        self.after_format();
        Ok(())
    }

    /// FORMAT: plain format, only honoured while DEVCFG allows it.
    pub fn format(&mut self, reset: bool, factory_default: bool) -> Result<()> {
        let ctag = Ctag::mode(SecCmd::Format, mode::format(reset, factory_default, false));
        self.exec_plain(ctag, &[], TimeoutClass::ChipErase)?;
        self.after_format();
        Ok(())
    }

    fn after_format(&mut self) {
        let die = self.ctx.die_mut();
        die.key_mngr.end_session();
        die.mc_in_sync = false;
        for s in die.sections.iter_mut() {
            *s = Default::default();
        }
    }

    /// CALC_CDI: next compound device identifier, encrypted on the wire.
    pub fn calc_cdi(&mut self, mode: u8) -> Result<[u8; 32]> {
        self.require(Feature::CalcCdi, "CALC_CDI")?;
        let c = self.session_context()?;
        let cipher = c.cipher(&mut self.hash, Direction::EncryptionOfOutput);
        let ctag = Ctag::params(SecCmd::CalcCdi, u8::from(mode != 0), 0, 0);
        let mut resp = [0u8; TC_SIZE + 32];
        self.exec_checked(ctag, &[], &mut resp, TimeoutClass::SecureCmd, Ssr::ALL_ERRORS)?;
        self.check_tc(&resp, c.tc)?;
        let mut cdi = [0u8; 32];
        cdi.copy_from_slice(&resp[TC_SIZE..]);
        crypto::encrypt_data(&mut cdi, &cipher);
        Ok(cdi)
    }
}
