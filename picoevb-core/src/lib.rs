// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! PicoEVB / HTG-K800 DMA transfer engine
//!
//! Moves data between process memory or peer GPU memory and the card's
//! staging RAM through the Xilinx XDMA engine. Transfers of any size are
//! split into single-descriptor chunks; the engine is owned by one request
//! at a time.
//!
//! The platform supplies register access, descriptor memory, page pinning
//! and interrupts through the traits in [`regs`], [`descriptor`], [`pin`],
//! [`peer`] and [`device`]. [`sim`] implements all of them in software.

pub mod buffer;
pub mod completion;
pub mod control;
pub mod descriptor;
pub mod device;
pub mod engine;
pub mod error;
pub mod peer;
pub mod pin;
pub mod regs;
pub mod segment;
pub mod session;
#[cfg(feature = "sim")]
pub mod sim;
pub mod transfer;

pub use buffer::{DmaBuffer, Operand};
pub use completion::CancelToken;
pub use device::{Device, DeviceResources, InterruptSource, TransferOutcome};
pub use error::{Error, Result};
pub use session::Session;
pub use transfer::TransferReport;

/// Host page size
pub const PAGE_SIZE: u64 = 4096;

/// PCI vendor of the card's XDMA endpoint
pub const PCI_VENDOR_ID: u16 = 0x10DE;
/// PCI device id shared by every variant
pub const PCI_DEVICE_ID: u16 = 0x0001;

/// BAR holding the GPIO block
pub const BAR_GPIO: usize = 0;
/// BAR holding the XDMA registers
pub const BAR_DMA: usize = 1;

/// Per-board constants, selected by PCI subsystem id
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceVariant {
    pub name: &'static str,
    pub subsystem_device_id: u16,
    pub num_h2c_channels: u32,
    /// Staging RAM size in bytes
    pub fpga_ram_size: u64,
}

impl DeviceVariant {
    pub const PICOEVB: DeviceVariant = DeviceVariant {
        name: "picoevb",
        subsystem_device_id: 0x0001,
        num_h2c_channels: 1,
        fpga_ram_size: 64 * 1024,
    };

    pub const HTG_K800: DeviceVariant = DeviceVariant {
        name: "htg-k800",
        subsystem_device_id: 0x0002,
        num_h2c_channels: 1,
        fpga_ram_size: 2 * 1024 * 1024 * 1024,
    };

    pub const ALL: &'static [DeviceVariant] = &[Self::PICOEVB, Self::HTG_K800];

    /// Match the PCI subsystem ids; every variant carries the NVIDIA
    /// subsystem vendor
    pub fn from_subsystem(subsystem_vendor_id: u16, subsystem_device_id: u16) -> Option<&'static DeviceVariant> {
        if subsystem_vendor_id != PCI_VENDOR_ID {
            return None;
        }
        Self::ALL
            .iter()
            .find(|v| v.subsystem_device_id == subsystem_device_id)
    }

    pub fn from_name(name: &str) -> Option<&'static DeviceVariant> {
        Self::ALL.iter().find(|v| v.name.eq_ignore_ascii_case(name))
    }
}
