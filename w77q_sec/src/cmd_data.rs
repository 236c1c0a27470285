// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data path: secure reads and writes, erase, secure log, random numbers,
//! and the standard SPI instructions used for plain access.
//!
//! Secure addresses are offsets into the section of the open session.
//! Their low bits are ignored by the device, so they are filled with
//! random bits before the address is hidden in the CTAG.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use w77q_regs::status::Ssr;

use crate::cfg::Feature;
use crate::cmd::{std_cmd, Ctag, EraseType, SecCmd};
use crate::cmd_proc::{CmdCtx, Qlib, SIG_SIZE, TC_SIZE};
use crate::config::TimeoutClass;
use crate::crypto::{self, CipherKey, Direction, HashEngine};
use crate::error::{QlibError, Result};
use crate::tm::Bus;

pub const READ_PAGE_SIZE: usize = 32;
pub const WRITE_PAGE_SIZE: usize = 32;
pub const LOG_ENTRY_SIZE: usize = 16;
pub const RNGR_SIZE: usize = 16;
pub const RNGR_COUNTER_SIZE: usize = 12;

const MAX_SEC_ADDR: u32 = 0xff_ffff;
const STD_ADDR_WINDOW: u32 = 1 << 24;

/// Everything needed to finish a secure read once the response arrives.
struct PendingRead {
    ctx: CmdCtx,
    cipher: CipherKey,
    /// CTAG with the randomized plain address, as covered by signatures.
    ctag: Ctag,
    /// CTAG as sent, with the address hidden.
    wire: Ctag,
}

impl<'k, B: Bus, H: HashEngine> Qlib<'k, B, H> {
    fn rand_bits(&mut self, span: u32) -> u32 {
        self.prng.get_rand32() & (span - 1)
    }

    fn prepare_read(&mut self, cmd: SecCmd, addr: u32) -> Result<PendingRead> {
        if addr > MAX_SEC_ADDR {
            return Err(QlibError::OutOfRange("secure address"));
        }
        let ctx = self.session_context()?;
        let cipher = ctx.cipher(&mut self.hash, Direction::EncryptionOfOutput);
        let addr = (addr & !(READ_PAGE_SIZE as u32 - 1)) | self.rand_bits(READ_PAGE_SIZE as u32);
        let ctag = Ctag::addr(cmd, addr);
        let wire = ctag.with_addr(crypto::encrypt_address(addr, &cipher));
        Ok(PendingRead {
            ctx,
            cipher,
            ctag,
            wire,
        })
    }

    /// Decrypt a `[TC][page]` response into `out`.
    fn finish_read(&mut self, p: &PendingRead, resp: &[u8], out: &mut [u8]) -> Result<()> {
        self.check_tc(resp, p.ctx.tc)?;
        out.copy_from_slice(&resp[TC_SIZE..TC_SIZE + out.len()]);
        crypto::encrypt_data(out, &p.cipher);
        Ok(())
    }

    /// SRD: one encrypted 32 byte page.
    pub fn srd(&mut self, addr: u32) -> Result<[u8; READ_PAGE_SIZE]> {
        let p = self.prepare_read(SecCmd::Srd, addr)?;
        let mut resp = [0u8; TC_SIZE + READ_PAGE_SIZE];
        self.exec_checked(p.wire, &[], &mut resp, TimeoutClass::SecureCmd, Ssr::ALL_ERRORS)?;
        let mut page = [0u8; READ_PAGE_SIZE];
        self.finish_read(&p, &resp, &mut page)?;
        Ok(page)
    }

    /// SARD: like SRD, with a signature over the plain data.
    pub fn sard(&mut self, addr: u32) -> Result<[u8; READ_PAGE_SIZE]> {
        let p = self.prepare_read(SecCmd::Sard, addr)?;
        let mut resp = [0u8; TC_SIZE + READ_PAGE_SIZE + SIG_SIZE];
        self.exec_checked(p.wire, &[], &mut resp, TimeoutClass::SecureCmd, Ssr::ALL_ERRORS)?;
        let mut page = [0u8; READ_PAGE_SIZE];
        self.finish_read(&p, &resp, &mut page)?;
        let sig = LittleEndian::read_u64(&resp[TC_SIZE + READ_PAGE_SIZE..]);
        if sig != p.ctx.sign(&mut self.hash, p.ctag, &page) {
            return Err(QlibError::SignatureMismatch);
        }
        Ok(page)
    }

    /// Read consecutive pages with SRD, starting the next page's exchange
    /// before the current one is decrypted. `out` must be a whole number
    /// of pages and `addr` page aligned.
    pub fn srd_multi(&mut self, addr: u32, out: &mut [u8]) -> Result<()> {
        if out.len() % READ_PAGE_SIZE != 0 || addr as usize % READ_PAGE_SIZE != 0 {
            return Err(QlibError::InvalidParameter("multi-page read must be page aligned"));
        }
        if out.is_empty() {
            return Ok(());
        }
        if self.ctx.die().powered_down || self.ctx.suspended {
            return Err(QlibError::CommandIgnored);
        }
        self.ctx.multi_transaction = true;
        let r = self.srd_pipeline(addr, out);
        if r.is_err() {
            // a command may still be queued on the device
            self.ctx.die_mut().mc_in_sync = false;
        }
        self.ctx.multi_transaction = false;
        r
    }

    fn srd_pipeline(&mut self, addr: u32, out: &mut [u8]) -> Result<()> {
        let timeout = self.timeout(TimeoutClass::SecureCmd);
        let pages = out.len() / READ_PAGE_SIZE;
        let mut cur = self.prepare_read(SecCmd::Srd, addr)?;
        self.tm.write_ibuf(cur.wire, &[])?;

        for (i, page) in out.chunks_mut(READ_PAGE_SIZE).enumerate() {
            let next = if i + 1 < pages {
                let a = addr + ((i + 1) * READ_PAGE_SIZE) as u32;
                Some(self.prepare_read(SecCmd::Srd, a)?)
            } else {
                None
            };

            let mut resp = [0u8; TC_SIZE + READ_PAGE_SIZE];
            let ssr = self.tm.wait_and_read(&mut resp, timeout)?;
            self.ctx.die_mut().ssr = ssr;
            // nothing may be queued behind a failed page
            self.check_last_ssr_errors(Ssr::ALL_ERRORS)?;
            if let Some(n) = &next {
                self.tm.write_ibuf(n.wire, &[])?;
            }
            self.finish_read(&cur, &resp, page)?;

            if let Some(n) = next {
                cur = n;
            }
        }
        debug!("read {} pages from {:#x}", pages, addr);
        Ok(())
    }

    /// SAWR: authenticated, encrypted write of one 32 byte page.
    pub fn sawr(&mut self, addr: u32, data: &[u8; WRITE_PAGE_SIZE]) -> Result<()> {
        if addr > MAX_SEC_ADDR {
            return Err(QlibError::OutOfRange("secure address"));
        }
        let addr = (addr & !(WRITE_PAGE_SIZE as u32 - 1)) | self.rand_bits(WRITE_PAGE_SIZE as u32);
        let ctag = Ctag::addr(SecCmd::Sawr, addr);
        self.signed_setter(ctag, data, true, Some(addr), TimeoutClass::Write)?;
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)
    }

    /// Secure erase. Address based types take a section offset aligned to
    /// their size; section and chip erase ignore `addr`.
    pub fn serase(&mut self, kind: EraseType, addr: u32) -> Result<()> {
        let (ctag, hidden, class) = match kind.size() {
            Some(size) => {
                if addr % size != 0 || addr > MAX_SEC_ADDR {
                    return Err(QlibError::InvalidParameter("erase address"));
                }
                let a = addr | self.rand_bits(size);
                let class = if kind == EraseType::Sector4K {
                    TimeoutClass::SectorErase
                } else {
                    TimeoutClass::BlockErase
                };
                (Ctag::addr(kind.cmd(), a), Some(a), class)
            }
            None => (Ctag::plain(kind.cmd()), None, TimeoutClass::ChipErase),
        };
        self.signed_setter(ctag, &[], false, hidden, class)?;
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)
    }

    pub fn erase_sect_plain(&mut self, section: u8) -> Result<()> {
        self.require(Feature::PlainErase, "ERASE_SECT_PLAIN")?;
        self.exec_plain(
            Ctag::params(SecCmd::EraseSectPlain, section, 0, 0),
            &[],
            TimeoutClass::ChipErase,
        )
    }

    /// MEM_COPY within the open session's section.
    pub fn mem_copy(&mut self, dest: u32, src: u32, len: u32) -> Result<()> {
        self.require(Feature::MemCopy, "MEM_COPY")?;
        if len > MAX_SEC_ADDR {
            return Err(QlibError::OutOfRange("copy length"));
        }
        let l = len.to_be_bytes();
        let ctag = Ctag::params(SecCmd::MemCopy, l[1], l[2], l[3]);
        let mut data = [0u8; 8];
        LittleEndian::write_u32(&mut data[..4], src);
        LittleEndian::write_u32(&mut data[4..], dest);
        self.signed_setter(ctag, &data, false, None, TimeoutClass::ChipErase)?;
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)
    }

    /// CRC-32 of a range of a section, computed by the device.
    pub fn mem_crc(&mut self, section: u8, addr: u32, len: u32) -> Result<u32> {
        self.require(Feature::MemCrc, "MEM_CRC")?;
        let mut data = [0u8; 8];
        LittleEndian::write_u32(&mut data[..4], addr);
        LittleEndian::write_u32(&mut data[4..], len);
        let mut crc = [0u8; 4];
        self.exec_checked(
            Ctag::params(SecCmd::MemCrc, section, 0, 0),
            &data,
            &mut crc,
            TimeoutClass::SectorErase,
            Ssr::ALL_ERRORS,
        )?;
        Ok(u32::from_le_bytes(crc))
    }

    /// LOG_SRD: the entry at the head of the open section's log, with the
    /// head address.
    pub fn log_srd(&mut self) -> Result<(u32, [u8; LOG_ENTRY_SIZE])> {
        self.require(Feature::SecureLog, "LOG_SRD")?;
        let c = self.session_context()?;
        let cipher = c.cipher(&mut self.hash, Direction::EncryptionOfOutput);
        let mut resp = [0u8; TC_SIZE + 4 + LOG_ENTRY_SIZE];
        self.exec_checked(
            Ctag::plain(SecCmd::LogSrd),
            &[],
            &mut resp,
            TimeoutClass::SecureCmd,
            Ssr::ALL_ERRORS,
        )?;
        self.check_tc(&resp, c.tc)?;
        let head = LittleEndian::read_u32(&resp[TC_SIZE..]);
        let mut entry = [0u8; LOG_ENTRY_SIZE];
        entry.copy_from_slice(&resp[TC_SIZE + 4..]);
        crypto::encrypt_data(&mut entry, &cipher);
        Ok((head, entry))
    }

    pub fn log_prd(&mut self, section: u8) -> Result<(u32, [u8; LOG_ENTRY_SIZE])> {
        self.require(Feature::SecureLog, "LOG_PRD")?;
        let mut resp = [0u8; 4 + LOG_ENTRY_SIZE];
        self.exec_checked(
            Ctag::params(SecCmd::LogPrd, section, 0, 0),
            &[],
            &mut resp,
            TimeoutClass::SecureCmd,
            Ssr::ALL_ERRORS,
        )?;
        let mut entry = [0u8; LOG_ENTRY_SIZE];
        entry.copy_from_slice(&resp[4..]);
        Ok((LittleEndian::read_u32(&resp), entry))
    }

    pub fn log_sawr(&mut self, entry: &[u8; LOG_ENTRY_SIZE]) -> Result<()> {
        self.require(Feature::SecureLog, "LOG_SAWR")?;
        self.signed_setter(Ctag::plain(SecCmd::LogSawr), entry, true, None, TimeoutClass::Write)?;
        self.check_last_ssr_errors(Ssr::ALL_ERRORS)
    }

    pub fn log_pwr(&mut self, section: u8, entry: &[u8; LOG_ENTRY_SIZE]) -> Result<()> {
        self.require(Feature::SecureLog, "LOG_PWR")?;
        self.exec_plain(
            Ctag::params(SecCmd::LogPwr, section, 0, 0),
            entry,
            TimeoutClass::Write,
        )
    }

    /// Random bytes from the device RNG, encrypted and signed.
    pub fn get_rngr(&mut self) -> Result<[u8; RNGR_SIZE]> {
        self.require(Feature::Rng, "GET_RNGR")?;
        let c = self.session_context()?;
        let cipher = c.cipher(&mut self.hash, Direction::EncryptionOfOutput);
        let ctag = Ctag::plain(SecCmd::GetRngr);
        let mut resp = [0u8; TC_SIZE + RNGR_SIZE + SIG_SIZE];
        self.exec_checked(ctag, &[], &mut resp, TimeoutClass::SecureCmd, Ssr::ALL_ERRORS)?;
        self.check_tc(&resp, c.tc)?;
        let mut rnd = [0u8; RNGR_SIZE];
        rnd.copy_from_slice(&resp[TC_SIZE..TC_SIZE + RNGR_SIZE]);
        crypto::encrypt_data(&mut rnd, &cipher);
        let sig = LittleEndian::read_u64(&resp[TC_SIZE + RNGR_SIZE..]);
        if sig != c.sign(&mut self.hash, ctag, &rnd) {
            return Err(QlibError::SignatureMismatch);
        }
        Ok(rnd)
    }

    pub fn get_rngr_plain(&mut self) -> Result<[u8; RNGR_SIZE]> {
        self.require(Feature::Rng, "GET_RNGR_PLAIN")?;
        let mut rnd = [0u8; RNGR_SIZE];
        self.exec_checked(
            Ctag::plain(SecCmd::RngrPlain),
            &[],
            &mut rnd,
            TimeoutClass::SecureCmd,
            Ssr::ALL_ERRORS,
        )?;
        Ok(rnd)
    }

    pub fn get_rngr_counter(&mut self) -> Result<[u8; RNGR_COUNTER_SIZE]> {
        self.require(Feature::Rng, "GET_RNGR_COUNTER")?;
        let mut cnt = [0u8; RNGR_COUNTER_SIZE];
        self.exec_checked(
            Ctag::plain(SecCmd::RngrCounter),
            &[],
            &mut cnt,
            TimeoutClass::SecureCmd,
            Ssr::ALL_ERRORS,
        )?;
        Ok(cnt)
    }

    // --- standard instructions ---

    fn check_std_allowed(&self) -> Result<()> {
        if self.ctx.die().powered_down || self.ctx.suspended {
            Err(QlibError::CommandIgnored)
        } else {
            Ok(())
        }
    }

    /// Point the extended address register at the 16MiB window holding
    /// `addr`, if it is not there already.
    fn set_ext_addr(&mut self, addr: u32) -> Result<()> {
        let hi = (addr >> 24) as u8;
        if hi != self.ctx.ext_addr {
            self.tm
                .standard(true, std_cmd::WRITE_EXT_ADDR, None, &[hi], 0, &mut [], None)?;
            self.ctx.ext_addr = hi;
        }
        Ok(())
    }

    /// FAST_READ at an absolute flash address. No policy checks happen
    /// here; see `plain_read` for the checked variant.
    pub fn std_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.check_std_allowed()?;
        let max = self.config.bus.max_read.max(1);
        let mut a = addr;
        let mut rest = buf;
        while !rest.is_empty() {
            let window_left = (STD_ADDR_WINDOW - (a % STD_ADDR_WINDOW)) as usize;
            let n = rest.len().min(max).min(window_left);
            let (part, tail) = std::mem::take(&mut rest).split_at_mut(n);
            self.set_ext_addr(a)?;
            self.tm.standard(
                false,
                std_cmd::FAST_READ,
                Some(a & (STD_ADDR_WINDOW - 1)),
                &[],
                std_cmd::FAST_READ_DUMMY,
                part,
                None,
            )?;
            a = a.wrapping_add(n as u32);
            rest = tail;
        }
        Ok(())
    }

    /// PAGE_PROGRAM, split on page boundaries.
    pub fn std_write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.check_std_allowed()?;
        let timeout = self.timeout(TimeoutClass::Write);
        let max = self.config.bus.max_write.max(1);
        let mut a = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let page_left = (std_cmd::PAGE_SIZE - (a % std_cmd::PAGE_SIZE)) as usize;
            let n = rest.len().min(page_left).min(max);
            let (part, tail) = rest.split_at(n);
            self.set_ext_addr(a)?;
            self.tm.standard(
                true,
                std_cmd::PAGE_PROGRAM,
                Some(a & (STD_ADDR_WINDOW - 1)),
                part,
                0,
                &mut [],
                Some(timeout),
            )?;
            a = a.wrapping_add(n as u32);
            rest = tail;
        }
        Ok(())
    }

    pub fn std_erase_sector(&mut self, addr: u32) -> Result<()> {
        self.check_std_allowed()?;
        if addr % std_cmd::SECTOR_SIZE != 0 {
            return Err(QlibError::InvalidParameter("sector address"));
        }
        let timeout = self.timeout(TimeoutClass::SectorErase);
        self.set_ext_addr(addr)?;
        self.tm.standard(
            true,
            std_cmd::SECTOR_ERASE,
            Some(addr & (STD_ADDR_WINDOW - 1)),
            &[],
            0,
            &mut [],
            Some(timeout),
        )
    }

    /// Software reset. The two instructions go out back to back, with
    /// nothing allowed in between.
    pub fn std_reset(&mut self) -> Result<()> {
        self.tm.atomic(|tm| {
            tm.standard(false, std_cmd::RESET_ENABLE, None, &[], 0, &mut [], None)?;
            tm.standard(false, std_cmd::RESET_DEVICE, None, &[], 0, &mut [], None)
        })?;
        debug!("software reset sent");
        Ok(())
    }

    /// Deep power down. Secure commands are refused until `power_up`.
    pub fn power_down(&mut self) -> Result<()> {
        if self.ctx.die().powered_down {
            return Ok(());
        }
        self.tm
            .standard(false, std_cmd::POWER_DOWN, None, &[], 0, &mut [], None)?;
        self.ctx.die_mut().powered_down = true;
        Ok(())
    }

    pub fn power_up(&mut self) -> Result<()> {
        self.tm
            .standard(false, std_cmd::RELEASE_POWER_DOWN, None, &[], 0, &mut [], None)?;
        self.ctx.die_mut().powered_down = false;
        Ok(())
    }

    /// Suspend an erase or program in progress.
    pub fn suspend(&mut self) -> Result<()> {
        if self.ctx.suspended {
            return Err(QlibError::IncorrectState);
        }
        self.tm
            .standard(false, std_cmd::SUSPEND, None, &[], 0, &mut [], None)?;
        self.ctx.suspended = true;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if !self.ctx.suspended {
            return Err(QlibError::IncorrectState);
        }
        self.tm
            .standard(false, std_cmd::RESUME, None, &[], 0, &mut [], None)?;
        self.ctx.suspended = false;
        Ok(())
    }

    /// Make `die` the target of every following command.
    pub fn select_die(&mut self, die: usize) -> Result<()> {
        if die >= self.ctx.dies.len() {
            return Err(QlibError::OutOfRange("die index"));
        }
        if die == self.ctx.active_die {
            return Ok(());
        }
        self.tm
            .standard(false, std_cmd::DIE_SELECT, None, &[die as u8], 0, &mut [], None)?;
        self.ctx.active_die = die;
        Ok(())
    }
}
