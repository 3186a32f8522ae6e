// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! XDMA register map
//!
//! Register offsets are built as `target << 12 | channel << 8 | register`,
//! matching the layout of the Xilinx DMA/Bridge subsystem BAR.

use core::fmt;

use bitflags::bitflags;

/// Register block targets
pub mod target {
    pub const H2C: u32 = 0x0;
    pub const C2H: u32 = 0x1;
    pub const IRQ: u32 = 0x2;
    pub const CONFIG: u32 = 0x3;
    pub const H2C_SGDMA: u32 = 0x4;
    pub const C2H_SGDMA: u32 = 0x5;
    pub const SGDMA_COMMON: u32 = 0x6;
}

/// Build a register offset
pub const fn xdma_reg(target: u32, channel: u32, reg: u32) -> u32 {
    (target << 12) | (channel << 8) | reg
}

// Channel block (H2C and C2H share the layout)
pub const CHAN_IDENTIFIER: u32 = 0x00;
pub const CHAN_CTRL: u32 = 0x04;
pub const CHAN_CTRL_W1S: u32 = 0x08;
pub const CHAN_CTRL_W1C: u32 = 0x0C;
pub const CHAN_STATUS: u32 = 0x40;
pub const CHAN_STATUS_RD_CLR: u32 = 0x44;
pub const CHAN_COMPLETED_DESC_COUNT: u32 = 0x48;
pub const CHAN_INT_EN: u32 = 0x90;
pub const CHAN_PERF_CTRL: u32 = 0xC0;
pub const CHAN_PERF_CYC_LOW: u32 = 0xC4;
pub const CHAN_PERF_CYC_HIGH: u32 = 0xC8;
pub const CHAN_PERF_DAT_LOW: u32 = 0xCC;
pub const CHAN_PERF_DAT_HIGH: u32 = 0xD0;

// IRQ block
pub const IRQ_CH_INT_EN: u32 = 0x10;
pub const IRQ_CH_INT_EN_W1S: u32 = 0x14;
pub const IRQ_CH_INT_EN_W1C: u32 = 0x18;

// SGDMA channel block
pub const SGDMA_DESC_LOW_ADDR: u32 = 0x80;
pub const SGDMA_DESC_HIGH_ADDR: u32 = 0x84;
pub const SGDMA_DESC_ADJACENT: u32 = 0x88;
pub const SGDMA_DESC_CREDITS: u32 = 0x8C;

// SGDMA common block
pub const SGDMA_CTRL: u32 = 0x10;
pub const SGDMA_CTRL_W1S: u32 = 0x14;
pub const SGDMA_CTRL_W1C: u32 = 0x18;

/// Descriptor-halt bit of H2C channel 0 in the SGDMA common control register
pub const SGDMA_CTRL_H2C_DSC_HALT_SHIFT: u32 = 0;
/// Descriptor-halt bit of C2H channel 0 in the SGDMA common control register
pub const SGDMA_CTRL_C2H_DSC_HALT_SHIFT: u32 = 16;

bitflags! {
    /// Channel control register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelCtrl: u32 {
        const RUN = 1 << 0;
        const IE_DESC_STOPPED = 1 << 1;
        const IE_DESC_COMPLETED = 1 << 2;
        const IE_ALIGN_MISMATCH = 1 << 3;
        const IE_MAGIC_STOPPED = 1 << 4;
        const IE_INVALID_LEN = 1 << 5;
        const IE_IDLE_STOPPED = 1 << 6;
        const IE_READ_ERR = 0x1F << 9;
        const IE_WRITE_ERR = 0x1F << 14;
        const IE_DESC_ERR = 0x1F << 19;
    }
}

impl ChannelCtrl {
    /// Every interrupt source plus the run bit
    pub fn run_all_interrupts() -> Self {
        Self::all()
    }
}

bitflags! {
    /// Channel status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelStatus: u32 {
        const BUSY = 1 << 0;
        const DESC_STOPPED = 1 << 1;
        const DESC_COMPLETED = 1 << 2;
        const ALIGN_MISMATCH = 1 << 3;
        const MAGIC_STOPPED = 1 << 4;
        const INVALID_LEN = 1 << 5;
        const IDLE_STOPPED = 1 << 6;
        const READ_ERR = 0x1F << 9;
        const WRITE_ERR = 0x1F << 14;
        const DESC_ERR = 0x1F << 19;
    }
}

impl ChannelStatus {
    /// Status bits that mean the transfer failed
    pub const fn error_mask() -> Self {
        Self::DESC_ERR
            .union(Self::WRITE_ERR)
            .union(Self::READ_ERR)
            .union(Self::IDLE_STOPPED)
            .union(Self::INVALID_LEN)
            .union(Self::MAGIC_STOPPED)
            .union(Self::ALIGN_MISMATCH)
    }

    pub fn is_error(self) -> bool {
        self.intersects(Self::error_mask())
    }
}

bitflags! {
    /// Performance counter control register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PerfCtrl: u32 {
        const AUTO_STOP = 1 << 0;
        const CLEAR = 1 << 1;
        const RUN = 1 << 2;
    }
}

/// One direction of the DMA engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Host to card
    H2c,
    /// Card to host
    C2h,
}

impl Channel {
    /// Distance between the H2C and C2H register blocks
    pub const BLOCK_STRIDE: u32 = xdma_reg(target::C2H, 0, 0) - xdma_reg(target::H2C, 0, 0);

    /// Offset added to an H2C (or H2C SGDMA) register to reach this channel's copy
    pub const fn block_offset(self) -> u32 {
        match self {
            Channel::H2c => 0,
            Channel::C2h => Self::BLOCK_STRIDE,
        }
    }

    /// Channel block register
    pub const fn reg(self, reg: u32) -> u32 {
        xdma_reg(target::H2C, 0, reg) + self.block_offset()
    }

    /// SGDMA block register
    pub const fn sgdma_reg(self, reg: u32) -> u32 {
        xdma_reg(target::H2C_SGDMA, 0, reg) + self.block_offset()
    }

    /// Top-level interrupt enable bit; C2H bits follow all H2C bits
    pub const fn irq_bit(self, num_h2c_channels: u32) -> u32 {
        match self {
            Channel::H2c => 1 << 0,
            Channel::C2h => 1 << num_h2c_channels,
        }
    }

    /// Descriptor-halt bit in the SGDMA common control register
    pub const fn halt_bit(self) -> u32 {
        match self {
            Channel::H2c => 1 << SGDMA_CTRL_H2C_DSC_HALT_SHIFT,
            Channel::C2h => 1 << SGDMA_CTRL_C2H_DSC_HALT_SHIFT,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Channel::H2c => "H2C",
            Channel::C2h => "C2H",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A memory-mapped register window (one PCI BAR)
pub trait RegisterIo: Send + Sync {
    /// Read a 32-bit register at a byte offset
    fn read32(&self, offset: u32) -> u32;

    /// Write a 32-bit register at a byte offset
    fn write32(&self, offset: u32, value: u32);
}

/// Traced access to a register window
pub struct Bar<R: ?Sized> {
    name: &'static str,
    io: std::sync::Arc<R>,
}

impl<R: RegisterIo + ?Sized> Bar<R> {
    pub fn new(name: &'static str, io: std::sync::Arc<R>) -> Self {
        Self { name, io }
    }

    pub fn read(&self, reg: u32) -> u32 {
        let val = self.io.read32(reg);
        log::trace!("{}: readl(0x{:08x}) -> 0x{:08x}", self.name, reg, val);
        val
    }

    pub fn write(&self, reg: u32, val: u32) {
        log::trace!("{}: writel(0x{:08x}, 0x{:08x})", self.name, val, reg);
        self.io.write32(reg, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_register_offsets() {
        assert_eq!(Channel::H2c.reg(CHAN_CTRL), 0x0004);
        assert_eq!(Channel::C2h.reg(CHAN_CTRL), 0x1004);
        assert_eq!(Channel::H2c.sgdma_reg(SGDMA_DESC_LOW_ADDR), 0x4080);
        assert_eq!(Channel::C2h.sgdma_reg(SGDMA_DESC_HIGH_ADDR), 0x5084);
        assert_eq!(xdma_reg(target::IRQ, 0, IRQ_CH_INT_EN_W1S), 0x2014);
        assert_eq!(xdma_reg(target::SGDMA_COMMON, 0, SGDMA_CTRL_W1C), 0x6018);
    }

    #[test]
    fn test_irq_bits() {
        assert_eq!(Channel::H2c.irq_bit(1), 0b01);
        assert_eq!(Channel::C2h.irq_bit(1), 0b10);
        assert_eq!(Channel::C2h.irq_bit(4), 0b1_0000);
    }

    #[test]
    fn test_status_classification() {
        assert!(!ChannelStatus::DESC_COMPLETED.is_error());
        assert!(!(ChannelStatus::DESC_COMPLETED | ChannelStatus::DESC_STOPPED).is_error());
        assert!(ChannelStatus::MAGIC_STOPPED.is_error());
        assert!(ChannelStatus::from_bits_retain(1 << 10).is_error());
        assert!(!ChannelStatus::BUSY.is_error());
    }
}
