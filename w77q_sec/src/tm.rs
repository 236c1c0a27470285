// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transaction manager: frames secure and standard instructions onto the
//! bus adapter and polls the device until it is ready.

use log::{trace, warn};
use std::time::{Duration, Instant};
use w77q_regs::status::Ssr;

use crate::cfg::{Capabilities, Feature};
use crate::cmd::{inst, std_cmd, BusMode, Ctag};
use crate::config::BusConfig;
use crate::error::{BusError, QlibError, Result};

/// Largest data phase of one OP1 or OP2.
pub const MAX_IBUF_SIZE: usize = 256;
const CTAG_SIZE: usize = 4;

/// One write-then-read exchange on the bus.
#[derive(Debug)]
pub struct Transaction<'a> {
    pub format: BusMode,
    pub dtr: bool,
    pub cmd: u8,
    /// 24 bit address phase, sent most significant byte first.
    pub address: Option<u32>,
    pub data_out: &'a [u8],
    pub dummy_cycles: u8,
    pub data_in: &'a mut [u8],
}

/// The platform's SPI adapter.
pub trait Bus {
    fn transact(&mut self, t: Transaction<'_>) -> std::result::Result<(), BusError>;

    /// Called before an exchange that must not be interleaved with bus
    /// traffic from an interrupt handler.
    fn disable_interrupts(&mut self) {}

    fn restore_interrupts(&mut self) {}
}

impl<B: Bus + ?Sized> Bus for &mut B {
    fn transact(&mut self, t: Transaction<'_>) -> std::result::Result<(), BusError> {
        (**self).transact(t)
    }

    fn disable_interrupts(&mut self) {
        (**self).disable_interrupts()
    }

    fn restore_interrupts(&mut self) {
        (**self).restore_interrupts()
    }
}

/// Bus interface state: instruction opcodes for the configured format, chunk
/// limits, and the lock flag marking the bus as held by this driver.
#[derive(Debug)]
pub struct Tm<B> {
    bus: B,
    format: BusMode,
    dtr: bool,
    op0: u8,
    op1: u8,
    op2: u8,
    dummy_op0: u8,
    max_write: usize,
    max_read: usize,
    split_ibuf: bool,
    ctag_only_first: bool,
    locked: bool,
}

impl<B: Bus> Tm<B> {
    pub fn new(bus: B, cfg: &BusConfig) -> Tm<B> {
        let mut tm = Tm {
            bus,
            format: cfg.secure_format,
            dtr: cfg.dtr,
            op0: 0,
            op1: 0,
            op2: 0,
            dummy_op0: inst::dummy_cycles_op0(0),
            max_write: cfg.max_write,
            max_read: cfg.max_read,
            split_ibuf: false,
            ctag_only_first: false,
            locked: false,
        };
        tm.set_format(cfg.secure_format, cfg.dtr);
        tm
    }

    pub fn set_format(&mut self, format: BusMode, dtr: bool) {
        self.format = format;
        self.dtr = dtr;
        self.op0 = format.make_inst(inst::OP0, dtr);
        self.op1 = format.make_inst(inst::OP1, dtr);
        self.op2 = format.make_inst(inst::OP2, dtr);
    }

    /// Apply the part-specific framing rules.
    pub fn configure(&mut self, caps: &Capabilities) {
        self.dummy_op0 = inst::dummy_cycles_op0(caps.device_id);
        self.split_ibuf = caps.has(Feature::SplitIbuf);
        self.ctag_only_first = caps.has(Feature::SplitIbufCtagOnlyFirst);
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.locked {
            return Err(QlibError::DeviceBusy);
        }
        self.locked = true;
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        if !self.locked {
            return Err(QlibError::IncorrectState);
        }
        self.locked = false;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.locked
    }

    fn check_connected(&self) -> Result<()> {
        if self.locked {
            Ok(())
        } else {
            Err(QlibError::NotConnected)
        }
    }

    /// Run `f` with interrupts held off on platforms that need it.
    pub fn atomic<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.bus.disable_interrupts();
        let r = f(self);
        self.bus.restore_interrupts();
        r
    }

    fn raw(&mut self, t: Transaction<'_>) -> Result<()> {
        trace!(
            "xfer cmd {:#04x} addr {:?} out {} dummy {} in {}",
            t.cmd,
            t.address,
            t.data_out.len(),
            t.dummy_cycles,
            t.data_in.len()
        );
        Ok(self.bus.transact(t)?)
    }

    /// OP0: one read of the SSR.
    pub fn get_ssr(&mut self) -> Result<Ssr> {
        self.check_connected()?;
        let mut buf = [0u8; 4];
        let t = Transaction {
            format: self.format,
            dtr: self.dtr,
            cmd: self.op0,
            address: None,
            data_out: &[],
            dummy_cycles: self.dummy_op0,
            data_in: &mut buf,
        };
        self.raw(t)?;
        let v = u32::from_le_bytes(buf);
        if v == 0 || v == u32::MAX {
            return Err(QlibError::Connectivity(v));
        }
        Ok(Ssr::from(v))
    }

    /// Poll OP0 until the busy bit clears or `timeout` passes.
    pub fn wait_while_busy(&mut self, timeout: Duration) -> Result<Ssr> {
        let start = Instant::now();
        loop {
            let ssr = self.get_ssr()?;
            if !ssr.busy() {
                return Ok(ssr);
            }
            if start.elapsed() > timeout {
                warn!("device still busy after {:?}", timeout);
                return Err(QlibError::Timeout);
            }
        }
    }

    /// OP1: load the input buffer with the CTAG and payload.
    pub fn write_ibuf(&mut self, ctag: Ctag, data: &[u8]) -> Result<()> {
        self.check_connected()?;
        if data.len() > MAX_IBUF_SIZE {
            return Err(QlibError::InvalidDataSize {
                size: data.len(),
                limit: MAX_IBUF_SIZE,
            });
        }

        if CTAG_SIZE + data.len() <= self.max_write {
            let mut frame = Vec::with_capacity(CTAG_SIZE + data.len());
            frame.extend_from_slice(&ctag.bytes());
            frame.extend_from_slice(data);
            return self.op1_frame(&frame);
        }

        if !self.split_ibuf {
            return Err(QlibError::InvalidDataSize {
                size: CTAG_SIZE + data.len(),
                limit: self.max_write,
            });
        }

        // Each OP1 of a split write ends on a word boundary.
        let chunk = (self.max_write.saturating_sub(CTAG_SIZE)) & !3;
        if chunk == 0 {
            return Err(QlibError::InvalidDataSize {
                size: CTAG_SIZE,
                limit: self.max_write,
            });
        }
        self.std_inst(inst::WR_IBUF_START)?;
        let r = self.write_split(ctag, data, chunk);
        // the buffer is closed even if a chunk failed
        let end = self.std_inst(inst::WR_IBUF_END);
        r.and(end)
    }

    fn write_split(&mut self, ctag: Ctag, data: &[u8], first_chunk: usize) -> Result<()> {
        let mut rest = data;
        let mut chunk = first_chunk;
        let mut first = true;
        while !rest.is_empty() {
            let (part, tail) = rest.split_at(chunk.min(rest.len()));
            let mut frame = Vec::with_capacity(CTAG_SIZE + part.len());
            if first {
                frame.extend_from_slice(&ctag.bytes());
            } else if !self.ctag_only_first {
                frame.extend_from_slice(&[0; CTAG_SIZE]);
            }
            frame.extend_from_slice(part);
            self.op1_frame(&frame)?;

            if first && self.ctag_only_first {
                chunk = self.max_write & !3;
            }
            first = false;
            rest = tail;
        }
        Ok(())
    }

    fn op1_frame(&mut self, frame: &[u8]) -> Result<()> {
        let t = Transaction {
            format: self.format,
            dtr: self.dtr,
            cmd: self.op1,
            address: None,
            data_out: frame,
            dummy_cycles: 0,
            data_in: &mut [],
        };
        self.raw(t)
    }

    fn std_inst(&mut self, cmd: u8) -> Result<()> {
        let t = Transaction {
            format: BusMode::Single,
            dtr: false,
            cmd,
            address: None,
            data_out: &[],
            dummy_cycles: 0,
            data_in: &mut [],
        };
        self.raw(t)
    }

    /// OP2: read the output buffer.
    pub fn read_obuf(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_connected()?;
        if buf.len() > self.max_read {
            return Err(QlibError::InvalidDataSize {
                size: buf.len(),
                limit: self.max_read,
            });
        }
        let t = Transaction {
            format: self.format,
            dtr: self.dtr,
            cmd: self.op2,
            address: None,
            data_out: &[],
            dummy_cycles: inst::DUMMY_CYCLES_OP2,
            data_in: buf,
        };
        self.raw(t)
    }

    /// A complete secure exchange: OP1, poll, then OP2 if a response is
    /// expected. When the device has no response ready the read is skipped
    /// and the returned SSR carries the generic error bit.
    pub fn secure_cmd(
        &mut self,
        ctag: Ctag,
        data_out: &[u8],
        data_in: &mut [u8],
        timeout: Duration,
    ) -> Result<Ssr> {
        self.atomic(|tm| {
            tm.write_ibuf(ctag, data_out)?;
            tm.wait_and_read(data_in, timeout)
        })
    }

    /// Second half of [`Tm::secure_cmd`], used on its own when an OP1 was
    /// issued ahead of time.
    pub fn wait_and_read(&mut self, data_in: &mut [u8], timeout: Duration) -> Result<Ssr> {
        let mut ssr = self.wait_while_busy(timeout)?;
        if !data_in.is_empty() {
            if !ssr.resp_ready() {
                ssr.raise(Ssr::ERR);
                return Ok(ssr);
            }
            self.read_obuf(data_in)?;
        }
        Ok(ssr)
    }

    /// A standard (non-secure) instruction, optionally preceded by
    /// WRITE_ENABLE and followed by busy polling on status register 1.
    #[allow(clippy::too_many_arguments)]
    pub fn standard(
        &mut self,
        write_enable: bool,
        cmd: u8,
        address: Option<u32>,
        data_out: &[u8],
        dummy_cycles: u8,
        data_in: &mut [u8],
        wait: Option<Duration>,
    ) -> Result<()> {
        self.check_connected()?;
        if write_enable {
            self.std_inst(std_cmd::WRITE_ENABLE)?;
        }
        let t = Transaction {
            format: BusMode::Single,
            dtr: false,
            cmd,
            address,
            data_out,
            dummy_cycles,
            data_in,
        };
        self.raw(t)?;
        if let Some(timeout) = wait {
            self.wait_while_busy_std(timeout)?;
        }
        Ok(())
    }

    pub fn wait_while_busy_std(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let mut sr = [0u8; 1];
            let t = Transaction {
                format: BusMode::Single,
                dtr: false,
                cmd: std_cmd::READ_STATUS,
                address: None,
                data_out: &[],
                dummy_cycles: 0,
                data_in: &mut sr,
            };
            self.raw(t)?;
            if sr[0] & std_cmd::STATUS_BUSY == 0 {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(QlibError::Timeout);
            }
        }
    }
}
