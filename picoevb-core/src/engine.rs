// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Single-shot XDMA transfers
//!
//! One descriptor slot, one completion signal. Every transfer programs the
//! descriptor, starts the channel, waits for the interrupt and tears the
//! channel back down, whatever the outcome.

use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error};

use crate::completion::{CancelToken, Completion, EngineLock, EngineLockGuard, WaitOutcome};
use crate::descriptor::{Descriptor, DescriptorMemory};
use crate::error::{Error, Result};
use crate::regs::{
    target, xdma_reg, Bar, Channel, ChannelCtrl, ChannelStatus, PerfCtrl, RegisterIo,
    CHAN_CTRL, CHAN_INT_EN, CHAN_PERF_CTRL, CHAN_PERF_CYC_HIGH, CHAN_PERF_CYC_LOW,
    CHAN_PERF_DAT_HIGH, CHAN_PERF_DAT_LOW, CHAN_STATUS_RD_CLR, IRQ_CH_INT_EN_W1C,
    IRQ_CH_INT_EN_W1S, SGDMA_CTRL_W1C, SGDMA_CTRL_W1S, SGDMA_DESC_ADJACENT,
    SGDMA_DESC_HIGH_ADDR, SGDMA_DESC_LOW_ADDR,
};

/// Status of a channel as seen by the interrupt handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqStatus {
    /// Nothing pending on this channel
    Idle,
    /// Transfer finished cleanly
    Completed(ChannelStatus),
    /// Transfer stopped with an error
    Errored(ChannelStatus),
}

impl IrqStatus {
    /// Classify a raw read-to-clear status value
    pub fn classify(raw: u32) -> Self {
        let status = ChannelStatus::from_bits_retain(raw) - ChannelStatus::BUSY;
        if status.is_empty() {
            IrqStatus::Idle
        } else if status.is_error() {
            IrqStatus::Errored(status)
        } else {
            IrqStatus::Completed(status)
        }
    }
}

/// Last status recorded for one direction; zero means success
struct ChannelResult {
    status: AtomicU32,
    failed: AtomicU32,
}

impl ChannelResult {
    const fn new() -> Self {
        Self {
            status: AtomicU32::new(0),
            failed: AtomicU32::new(0),
        }
    }

    fn record(&self, status: ChannelStatus, failed: bool) {
        self.status.store(status.bits(), Ordering::SeqCst);
        self.failed.store(failed as u32, Ordering::SeqCst);
    }

    fn take_error(&self) -> Option<u32> {
        if self.failed.load(Ordering::SeqCst) != 0 {
            Some(self.status.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}

/// The device's DMA engine
pub struct DmaEngine {
    bar: Bar<dyn RegisterIo>,
    descs: Arc<dyn DescriptorMemory>,
    num_h2c_channels: u32,
    completion: Arc<Completion>,
    lock: Arc<EngineLock>,
    h2c_result: ChannelResult,
    c2h_result: ChannelResult,
}

/// Proof that the caller holds the engine for the duration of a request
pub struct EngineGuard<'a> {
    engine: &'a DmaEngine,
    _lock: EngineLockGuard,
}

impl DmaEngine {
    pub fn new(
        bar: Arc<dyn RegisterIo>,
        descs: Arc<dyn DescriptorMemory>,
        num_h2c_channels: u32,
    ) -> Self {
        Self {
            bar: Bar::new("dma", bar),
            descs,
            num_h2c_channels,
            completion: Arc::new(Completion::new()),
            lock: Arc::new(EngineLock::new()),
            h2c_result: ChannelResult::new(),
            c2h_result: ChannelResult::new(),
        }
    }

    /// Take exclusive ownership of the engine. Fails with
    /// [`Error::Interrupted`] without touching hardware if cancelled first.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<EngineGuard<'_>> {
        match self.lock.lock(cancel) {
            Some(lock) => Ok(EngineGuard {
                engine: self,
                _lock: lock,
            }),
            None => Err(Error::Interrupted),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }

    fn result(&self, channel: Channel) -> &ChannelResult {
        match channel {
            Channel::H2c => &self.h2c_result,
            Channel::C2h => &self.c2h_result,
        }
    }

    /// Interrupt handler. Returns whether the interrupt came from this device.
    pub fn handle_irq(&self) -> bool {
        let mut handled = false;

        for channel in [Channel::H2c, Channel::C2h] {
            let raw = self.bar.read(channel.reg(CHAN_STATUS_RD_CLR));
            match IrqStatus::classify(raw) {
                IrqStatus::Idle => {}
                IrqStatus::Completed(status) => {
                    debug!("{} status 0x{:08x}", channel, status.bits());
                    self.result(channel).record(status, false);
                    self.completion.complete();
                    handled = true;
                }
                IrqStatus::Errored(status) => {
                    debug!("{} status 0x{:08x}", channel, status.bits());
                    self.result(channel).record(status, true);
                    self.completion.complete();
                    handled = true;
                }
            }
        }

        handled
    }
}

impl EngineGuard<'_> {
    /// Host to card: copy `len` bytes from bus address `pcie_addr` into staging RAM
    pub fn h2c_single(
        &self,
        pcie_addr: u64,
        ram_offset: u64,
        len: u64,
        cancel: &CancelToken,
    ) -> Result<()> {
        debug!(
            "DMA H2C PCI:0x{:x} -> BUF:0x{:04x} +0x{:x}",
            pcie_addr, ram_offset, len
        );
        let desc = Descriptor::single(pcie_addr, ram_offset, len as u32);
        self.engine.descs.store(&desc);
        self.run(Channel::H2c, cancel)
    }

    /// Card to host: copy `len` bytes from staging RAM to bus address `pcie_addr`
    pub fn c2h_single(
        &self,
        pcie_addr: u64,
        ram_offset: u64,
        len: u64,
        cancel: &CancelToken,
    ) -> Result<()> {
        debug!(
            "DMA C2H BUF:0x{:04x} -> PCI:0x{:x} +0x{:x}",
            ram_offset, pcie_addr, len
        );
        let desc = Descriptor::single(ram_offset, pcie_addr, len as u32);
        self.engine.descs.store(&desc);
        self.run(Channel::C2h, cancel)
    }

    fn run(&self, channel: Channel, cancel: &CancelToken) -> Result<()> {
        let engine = self.engine;
        let bar = &engine.bar;
        let irq_bit = channel.irq_bit(engine.num_h2c_channels);
        let descs_addr = engine.descs.bus_addr();

        engine.completion.reinit();
        engine.result(channel).record(ChannelStatus::empty(), false);

        // Descriptor location
        bar.write(channel.sgdma_reg(SGDMA_DESC_LOW_ADDR), descs_addr as u32);
        bar.write(
            channel.sgdma_reg(SGDMA_DESC_HIGH_ADDR),
            (descs_addr >> 32) as u32,
        );
        bar.write(channel.sgdma_reg(SGDMA_DESC_ADJACENT), 0);
        // Clear any stale status
        bar.read(channel.reg(CHAN_STATUS_RD_CLR));
        // Every interrupt source in the channel, then the channel at top level
        bar.write(channel.reg(CHAN_INT_EN), 0xFFFF_FFFF);
        bar.write(xdma_reg(target::IRQ, 0, IRQ_CH_INT_EN_W1S), irq_bit);
        bar.write(
            channel.reg(CHAN_PERF_CTRL),
            (PerfCtrl::RUN | PerfCtrl::AUTO_STOP).bits(),
        );

        // The device must observe the descriptor before it starts fetching
        fence(Ordering::SeqCst);
        bar.write(
            channel.reg(CHAN_CTRL),
            ChannelCtrl::run_all_interrupts().bits(),
        );

        let ret = match engine.completion.wait(cancel) {
            WaitOutcome::Cancelled => {
                error!("DMA {} interrupted", channel);
                Err(Error::Cancelled(channel))
            }
            WaitOutcome::Completed => match engine.result(channel).take_error() {
                Some(status) => {
                    error!("DMA {} failed, status 0x{:08x}", channel, status);
                    Err(Error::Hardware { channel, status })
                }
                None => Ok(()),
            },
        };

        self.teardown(channel, irq_bit);
        ret
    }

    fn teardown(&self, channel: Channel, irq_bit: u32) {
        let bar = &self.engine.bar;

        bar.write(xdma_reg(target::IRQ, 0, IRQ_CH_INT_EN_W1C), irq_bit);
        bar.write(channel.reg(CHAN_INT_EN), 0);
        // Cancel descriptor fetches
        let halt = channel.halt_bit();
        bar.write(xdma_reg(target::SGDMA_COMMON, 0, SGDMA_CTRL_W1S), halt);
        bar.write(xdma_reg(target::SGDMA_COMMON, 0, SGDMA_CTRL_W1C), halt);
        // Cancel channel operation
        bar.write(channel.reg(CHAN_CTRL), 0);

        let cyc_hi = bar.read(channel.reg(CHAN_PERF_CYC_HIGH));
        let cyc_lo = bar.read(channel.reg(CHAN_PERF_CYC_LOW));
        let dat_hi = bar.read(channel.reg(CHAN_PERF_DAT_HIGH));
        let dat_lo = bar.read(channel.reg(CHAN_PERF_DAT_LOW));
        debug!(
            "{} perf: {} cycles, {} beats",
            channel,
            (u64::from(cyc_hi) << 32) | u64::from(cyc_lo),
            (u64::from(dat_hi) << 32) | u64::from(dat_lo)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_masks_busy() {
        assert_eq!(IrqStatus::classify(0), IrqStatus::Idle);
        assert_eq!(
            IrqStatus::classify(ChannelStatus::BUSY.bits()),
            IrqStatus::Idle
        );
        assert_eq!(
            IrqStatus::classify((ChannelStatus::BUSY | ChannelStatus::DESC_COMPLETED).bits()),
            IrqStatus::Completed(ChannelStatus::DESC_COMPLETED)
        );
        assert_eq!(
            IrqStatus::classify(ChannelStatus::INVALID_LEN.bits()),
            IrqStatus::Errored(ChannelStatus::INVALID_LEN)
        );
    }
}
