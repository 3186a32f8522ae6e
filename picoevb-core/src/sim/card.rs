// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Simulated XDMA register file and staging RAM

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use spin::Mutex as SpinMutex;

use super::memory::{SimGpu, SimHostMemory};
use super::{IrqLine, SimDescriptors, SimEvent};
use crate::descriptor::{DescriptorMemory, DESC_LEN_MAX_WORD_ALIGNED};
use crate::regs::{
    target, Channel, ChannelCtrl, ChannelStatus, RegisterIo, CHAN_CTRL, CHAN_CTRL_W1C,
    CHAN_CTRL_W1S, CHAN_IDENTIFIER, CHAN_INT_EN, CHAN_PERF_CTRL, CHAN_PERF_CYC_HIGH,
    CHAN_PERF_CYC_LOW, CHAN_PERF_DAT_HIGH, CHAN_PERF_DAT_LOW, CHAN_STATUS, CHAN_STATUS_RD_CLR,
    IRQ_CH_INT_EN, IRQ_CH_INT_EN_W1C, IRQ_CH_INT_EN_W1S, SGDMA_CTRL, SGDMA_CTRL_W1C,
    SGDMA_CTRL_W1S, SGDMA_DESC_HIGH_ADDR, SGDMA_DESC_LOW_ADDR,
};
use crate::DeviceVariant;

const STAGING_PAGE: u64 = 4096;

/// XDMA block identifier with the channel type in bits 19:16
const XDMA_ID: u32 = 0x1fc0_0006;

/// Per-channel engine registers
#[derive(Default)]
struct ChannelRegs {
    ctrl: u32,
    status: u32,
    int_en: u32,
    perf_ctrl: u32,
    perf_cycles: u64,
    perf_data: u64,
    desc_lo: u32,
    desc_hi: u32,
}

#[derive(Default)]
struct RegisterFile {
    chans: [ChannelRegs; 2],
    irq_ch_int_en: u32,
    sgdma_ctrl: u32,
    other: HashMap<u32, u32>,
}

/// Fault and stall injection
#[derive(Default)]
struct Injection {
    fail_after: Option<u64>,
    stall: bool,
}

pub(crate) struct CardState {
    variant: &'static DeviceVariant,
    regs: SpinMutex<RegisterFile>,
    staging: Mutex<HashMap<u64, Box<[u8]>>>,
    injection: Mutex<Injection>,
    events: Mutex<Vec<SimEvent>>,
    writes: AtomicU64,
    runs: AtomicU64,
    led: AtomicU32,
    host: Arc<SimHostMemory>,
    gpu: Option<SimGpu>,
    descs: Arc<SimDescriptors>,
    irq: Arc<IrqLine>,
}

fn channel_index(channel: Channel) -> usize {
    match channel {
        Channel::H2c => 0,
        Channel::C2h => 1,
    }
}

fn channel_for(tgt: u32) -> Option<Channel> {
    match tgt {
        target::H2C | target::H2C_SGDMA => Some(Channel::H2c),
        target::C2H | target::C2H_SGDMA => Some(Channel::C2h),
        _ => None,
    }
}

// Lowest bit of each error field
const READ_ERR_UNSUPPORTED: u32 = 1 << 9;
const WRITE_ERR_DECODE: u32 = 1 << 14;
const DESC_ERR_UNSUPPORTED: u32 = 1 << 19;

fn read_err() -> u32 {
    ChannelStatus::DESC_STOPPED.bits() | READ_ERR_UNSUPPORTED
}

fn write_err() -> u32 {
    ChannelStatus::DESC_STOPPED.bits() | WRITE_ERR_DECODE
}

impl CardState {
    pub(crate) fn new(
        variant: &'static DeviceVariant,
        host: Arc<SimHostMemory>,
        gpu: Option<SimGpu>,
        descs: Arc<SimDescriptors>,
        irq: Arc<IrqLine>,
    ) -> Self {
        Self {
            variant,
            regs: SpinMutex::new(RegisterFile::default()),
            staging: Mutex::new(HashMap::new()),
            injection: Mutex::new(Injection::default()),
            events: Mutex::new(Vec::new()),
            writes: AtomicU64::new(0),
            runs: AtomicU64::new(0),
            led: AtomicU32::new(0),
            host,
            gpu,
            descs,
            irq,
        }
    }

    pub(crate) fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    pub(crate) fn led(&self) -> u32 {
        self.led.load(Ordering::SeqCst)
    }

    pub(crate) fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn fail_after(&self, runs: u64) {
        self.injection.lock().fail_after = Some(runs);
    }

    pub(crate) fn stall(&self, stall: bool) {
        self.injection.lock().stall = stall;
    }

    pub(crate) fn write_staging(&self, offset: u64, bytes: &[u8]) {
        let mut staging = self.staging.lock();
        let mut done = 0;
        while done < bytes.len() {
            let addr = offset + done as u64;
            let page = addr / STAGING_PAGE;
            let off = (addr % STAGING_PAGE) as usize;
            let this = (STAGING_PAGE as usize - off).min(bytes.len() - done);
            let buf = staging
                .entry(page)
                .or_insert_with(|| vec![0u8; STAGING_PAGE as usize].into_boxed_slice());
            buf[off..off + this].copy_from_slice(&bytes[done..done + this]);
            done += this;
        }
    }

    pub(crate) fn read_staging(&self, offset: u64, len: usize) -> Vec<u8> {
        let staging = self.staging.lock();
        let mut out = vec![0u8; len];
        let mut done = 0;
        while done < len {
            let addr = offset + done as u64;
            let page = addr / STAGING_PAGE;
            let off = (addr % STAGING_PAGE) as usize;
            let this = (STAGING_PAGE as usize - off).min(len - done);
            if let Some(buf) = staging.get(&page) {
                out[done..done + this].copy_from_slice(&buf[off..off + this]);
            }
            done += this;
        }
        out
    }

    fn bus_read(&self, addr: u64, out: &mut [u8]) -> bool {
        if self.host.owns_bus(addr) {
            return self.host.bus_read(addr, out);
        }
        match &self.gpu {
            Some(gpu) if gpu.owns_bus(addr) => gpu.bus_read(addr, out),
            _ => false,
        }
    }

    fn bus_write(&self, addr: u64, bytes: &[u8]) -> bool {
        if self.host.owns_bus(addr) {
            return self.host.bus_write(addr, bytes);
        }
        match &self.gpu {
            Some(gpu) if gpu.owns_bus(addr) => gpu.bus_write(addr, bytes),
            _ => false,
        }
    }

    /// Fetch the descriptor and move the data. Returns the final status.
    fn execute(&self, channel: Channel, desc_addr: u64) -> u32 {
        let desc = self.descs.load();
        if desc_addr != self.descs.bus_addr() {
            return ChannelStatus::DESC_STOPPED.bits() | DESC_ERR_UNSUPPORTED;
        }
        if !desc.has_magic() {
            return (ChannelStatus::DESC_STOPPED | ChannelStatus::MAGIC_STOPPED).bits();
        }
        let len = u64::from(desc.len);
        if len > DESC_LEN_MAX_WORD_ALIGNED {
            return (ChannelStatus::DESC_STOPPED | ChannelStatus::INVALID_LEN).bits();
        }

        let ram = self.variant.fpga_ram_size;
        let ok = match channel {
            Channel::H2c => {
                let offset = desc.dst();
                if offset.checked_add(len).map_or(true, |end| end > ram) {
                    return write_err();
                }
                let mut buf = vec![0u8; len as usize];
                if !self.bus_read(desc.src(), &mut buf) {
                    return read_err();
                }
                self.write_staging(offset, &buf);
                true
            }
            Channel::C2h => {
                let offset = desc.src();
                if offset.checked_add(len).map_or(true, |end| end > ram) {
                    return read_err();
                }
                let buf = self.read_staging(offset, len as usize);
                self.bus_write(desc.dst(), &buf)
            }
        };
        if !ok {
            return write_err();
        }

        trace!("sim {} moved 0x{:x} bytes", channel, len);
        (ChannelStatus::DESC_STOPPED | ChannelStatus::DESC_COMPLETED).bits()
    }

    /// Channel control write with RUN set
    fn start(&self, channel: Channel) -> bool {
        self.events.lock().push(SimEvent::Start(channel));

        let fail = {
            let mut injection = self.injection.lock();
            if injection.stall {
                let mut regs = self.regs.lock();
                regs.chans[channel_index(channel)].status = ChannelStatus::BUSY.bits();
                return false;
            }
            match injection.fail_after {
                Some(0) => {
                    injection.fail_after = None;
                    true
                }
                Some(n) => {
                    injection.fail_after = Some(n - 1);
                    false
                }
                None => false,
            }
        };

        let desc_addr = {
            let regs = self.regs.lock();
            let chan = &regs.chans[channel_index(channel)];
            (u64::from(chan.desc_hi) << 32) | u64::from(chan.desc_lo)
        };
        let status = if fail {
            read_err()
        } else {
            self.execute(channel, desc_addr)
        };
        self.runs.fetch_add(1, Ordering::SeqCst);

        let len = u64::from(self.descs.load().len);
        let mut regs = self.regs.lock();
        let irq_bit = channel.irq_bit(self.variant.num_h2c_channels);
        let irq_enabled = regs.irq_ch_int_en & irq_bit != 0;
        let chan = &mut regs.chans[channel_index(channel)];
        chan.status = status;
        chan.perf_data = len / 8;
        chan.perf_cycles = len / 8 + 64;
        irq_enabled && chan.int_en != 0
    }

    fn write_channel(&self, channel: Channel, reg: u32, value: u32) {
        let idx = channel_index(channel);
        let mut raise = false;
        match reg {
            CHAN_CTRL | CHAN_CTRL_W1S | CHAN_CTRL_W1C => {
                let (was_running, now_running) = {
                    let mut regs = self.regs.lock();
                    let chan = &mut regs.chans[idx];
                    let was = chan.ctrl & ChannelCtrl::RUN.bits() != 0;
                    chan.ctrl = match reg {
                        CHAN_CTRL => value,
                        CHAN_CTRL_W1S => chan.ctrl | value,
                        _ => chan.ctrl & !value,
                    };
                    let now = chan.ctrl & ChannelCtrl::RUN.bits() != 0;
                    if !now {
                        chan.status &= !ChannelStatus::BUSY.bits();
                    }
                    (was, now)
                };
                if !was_running && now_running {
                    raise = self.start(channel);
                } else if was_running && !now_running {
                    self.events.lock().push(SimEvent::Stop(channel));
                }
            }
            CHAN_INT_EN => self.regs.lock().chans[idx].int_en = value,
            CHAN_PERF_CTRL => self.regs.lock().chans[idx].perf_ctrl = value,
            _ => {
                self.regs.lock().other.insert(channel.reg(reg), value);
            }
        }
        if raise {
            self.irq.raise();
        }
    }

    fn write_sgdma(&self, channel: Channel, reg: u32, value: u32) {
        let mut regs = self.regs.lock();
        let chan = &mut regs.chans[channel_index(channel)];
        match reg {
            SGDMA_DESC_LOW_ADDR => chan.desc_lo = value,
            SGDMA_DESC_HIGH_ADDR => chan.desc_hi = value,
            _ => {
                regs.other.insert(channel.sgdma_reg(reg), value);
            }
        }
    }

    fn read_channel(&self, channel: Channel, reg: u32) -> u32 {
        let mut regs = self.regs.lock();
        let chan = &mut regs.chans[channel_index(channel)];
        match reg {
            CHAN_IDENTIFIER => XDMA_ID | ((channel_index(channel) as u32) << 16),
            CHAN_CTRL => chan.ctrl,
            CHAN_STATUS => chan.status,
            CHAN_STATUS_RD_CLR => {
                let status = chan.status;
                chan.status &= ChannelStatus::BUSY.bits();
                status
            }
            CHAN_INT_EN => chan.int_en,
            CHAN_PERF_CTRL => chan.perf_ctrl,
            CHAN_PERF_CYC_LOW => chan.perf_cycles as u32,
            CHAN_PERF_CYC_HIGH => (chan.perf_cycles >> 32) as u32,
            CHAN_PERF_DAT_LOW => chan.perf_data as u32,
            CHAN_PERF_DAT_HIGH => (chan.perf_data >> 32) as u32,
            _ => regs.other.get(&channel.reg(reg)).copied().unwrap_or(0),
        }
    }
}

/// BAR1: the XDMA register file
pub struct SimDma {
    pub(crate) card: Arc<CardState>,
}

impl RegisterIo for SimDma {
    fn read32(&self, offset: u32) -> u32 {
        let tgt = offset >> 12;
        let reg = offset & 0xFF;
        match (tgt, channel_for(tgt)) {
            (target::H2C | target::C2H, Some(channel)) => self.card.read_channel(channel, reg),
            (target::H2C_SGDMA | target::C2H_SGDMA, Some(channel)) => {
                let regs = self.card.regs.lock();
                let chan = &regs.chans[channel_index(channel)];
                match reg {
                    SGDMA_DESC_LOW_ADDR => chan.desc_lo,
                    SGDMA_DESC_HIGH_ADDR => chan.desc_hi,
                    _ => regs.other.get(&offset).copied().unwrap_or(0),
                }
            }
            (target::IRQ, _) if reg == IRQ_CH_INT_EN => self.card.regs.lock().irq_ch_int_en,
            (target::SGDMA_COMMON, _) if reg == SGDMA_CTRL => self.card.regs.lock().sgdma_ctrl,
            _ => self.card.regs.lock().other.get(&offset).copied().unwrap_or(0),
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        self.card.writes.fetch_add(1, Ordering::SeqCst);
        let tgt = offset >> 12;
        let reg = offset & 0xFF;
        match (tgt, channel_for(tgt)) {
            (target::H2C | target::C2H, Some(channel)) => self.card.write_channel(channel, reg, value),
            (target::H2C_SGDMA | target::C2H_SGDMA, Some(channel)) => {
                self.card.write_sgdma(channel, reg, value)
            }
            (target::IRQ, _) => {
                let mut regs = self.card.regs.lock();
                match reg {
                    IRQ_CH_INT_EN => regs.irq_ch_int_en = value,
                    IRQ_CH_INT_EN_W1S => regs.irq_ch_int_en |= value,
                    IRQ_CH_INT_EN_W1C => regs.irq_ch_int_en &= !value,
                    _ => {
                        regs.other.insert(offset, value);
                    }
                }
            }
            (target::SGDMA_COMMON, _) => {
                let mut regs = self.card.regs.lock();
                match reg {
                    SGDMA_CTRL => regs.sgdma_ctrl = value,
                    SGDMA_CTRL_W1S => regs.sgdma_ctrl |= value,
                    SGDMA_CTRL_W1C => regs.sgdma_ctrl &= !value,
                    _ => {
                        regs.other.insert(offset, value);
                    }
                }
            }
            _ => {
                self.card.regs.lock().other.insert(offset, value);
            }
        }
    }
}

/// BAR0: the GPIO block
pub struct SimGpio {
    pub(crate) card: Arc<CardState>,
}

impl RegisterIo for SimGpio {
    fn read32(&self, offset: u32) -> u32 {
        match offset {
            0 => self.card.led(),
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        self.card.writes.fetch_add(1, Ordering::SeqCst);
        if offset == 0 {
            self.card.led.store(value, Ordering::SeqCst);
        }
    }
}
