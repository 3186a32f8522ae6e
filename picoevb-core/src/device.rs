// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Device context
//!
//! One [`Device`] per attached card. It owns the register windows, the DMA
//! engine and the memory providers, and carries out every control
//! operation. Sessions are opened against it and passed back in by
//! reference.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::buffer::{DmaBuffer, Operand};
use crate::completion::CancelToken;
use crate::descriptor::DescriptorMemory;
use crate::engine::DmaEngine;
use crate::error::{Error, Result};
use crate::peer::PeerMemory;
use crate::pin::{DmaDirection, HostMemory};
use crate::regs::{Bar, RegisterIo};
use crate::session::Session;
use crate::transfer::{self, TransferReport};
use crate::DeviceVariant;

/// GPIO register driving the output pins
pub const GPIO_OUTPUT: u32 = 0x0;

/// Everything the platform hands the driver when a card is attached
pub struct DeviceResources {
    /// BAR0
    pub gpio: Arc<dyn RegisterIo>,
    /// BAR1
    pub dma: Arc<dyn RegisterIo>,
    pub descriptors: Arc<dyn DescriptorMemory>,
    pub host: Arc<dyn HostMemory>,
    pub peer: Option<Arc<dyn PeerMemory>>,
}

/// Blocks until the card raises its interrupt line
pub trait InterruptSource: Send + 'static {
    /// Wait for the next interrupt. `Ok(false)` means the source closed.
    fn wait(&mut self) -> Result<bool>;

    /// Acknowledge the interrupt once handled
    fn ack(&mut self, _handled: bool) -> Result<()> {
        Ok(())
    }
}

/// Result of a completed DMA request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub report: TransferReport,
    /// Time from submission to the last completion, including the wait for
    /// the engine and pinning
    pub elapsed: Duration,
}

pub struct Device {
    variant: &'static DeviceVariant,
    gpio: Bar<dyn RegisterIo>,
    engine: DmaEngine,
    host: Arc<dyn HostMemory>,
    peer: Option<Arc<dyn PeerMemory>>,
}

impl Device {
    pub fn new(variant: &'static DeviceVariant, res: DeviceResources) -> Self {
        info!(
            "{}: {} KiB staging RAM, {} H2C channel(s){}",
            variant.name,
            variant.fpga_ram_size / 1024,
            variant.num_h2c_channels,
            if res.peer.is_some() { ", peer memory" } else { "" }
        );
        Self {
            variant,
            gpio: Bar::new("gpio", res.gpio),
            engine: DmaEngine::new(res.dma, res.descriptors, variant.num_h2c_channels),
            host: res.host,
            peer: res.peer,
        }
    }

    pub fn variant(&self) -> &'static DeviceVariant {
        self.variant
    }

    pub fn engine(&self) -> &DmaEngine {
        &self.engine
    }

    /// A new client session
    pub fn open_session(&self) -> Session {
        Session::new(self.peer.clone())
    }

    /// Staging RAM capacity in bytes
    pub fn card_info(&self) -> u64 {
        self.variant.fpga_ram_size
    }

    pub fn set_led(&self, value: u32) {
        self.gpio.write(GPIO_OUTPUT, value);
    }

    pub fn pin_device_memory(&self, session: &Session, va: u64, size: u64) -> Result<u32> {
        session.pin(va, size)
    }

    pub fn unpin_device_memory(&self, session: &Session, handle: u64) -> Result<()> {
        session.unpin(handle)
    }

    fn check_card_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.variant.fpga_ram_size => Ok(()),
            _ => Err(Error::InvalidArgument("card range out of bounds")),
        }
    }

    fn pin(&self, session: &Session, operand: Operand, len: u64, dir: DmaDirection) -> Result<DmaBuffer> {
        DmaBuffer::pin(operand, len, dir, &self.host, session)
    }

    /// Copy `len` bytes from `src` to `dst` through the card's staging RAM
    pub fn h2c2h_dma(
        &self,
        session: &Session,
        src: Operand,
        dst: Operand,
        len: u64,
        cancel: &CancelToken,
    ) -> Result<TransferOutcome> {
        let start = Instant::now();
        let engine = self.engine.acquire(cancel)?;
        let src = self.pin(session, src, len, DmaDirection::ToDevice)?;
        let dst = self.pin(session, dst, len, DmaDirection::FromDevice)?;

        let report = transfer::h2c2h(
            &engine,
            src.segments(),
            dst.segments(),
            len,
            self.variant.fpga_ram_size,
            cancel,
        )
        .inspect_err(|err| error!("h2c2h of 0x{:x} bytes failed: {}", len, err))?;
        Ok(TransferOutcome {
            report,
            elapsed: start.elapsed(),
        })
    }

    /// Copy `len` bytes from `src` into staging RAM at `dst_offset`
    pub fn h2c_dma(
        &self,
        session: &Session,
        src: Operand,
        dst_offset: u64,
        len: u64,
        cancel: &CancelToken,
    ) -> Result<TransferOutcome> {
        self.check_card_range(dst_offset, len)?;

        let start = Instant::now();
        let engine = self.engine.acquire(cancel)?;
        let src = self.pin(session, src, len, DmaDirection::ToDevice)?;

        let report = transfer::h2c(&engine, src.segments(), dst_offset, len, cancel)
            .inspect_err(|err| error!("h2c of 0x{:x} bytes failed: {}", len, err))?;
        Ok(TransferOutcome {
            report,
            elapsed: start.elapsed(),
        })
    }

    /// Copy `len` bytes from staging RAM at `src_offset` into `dst`
    pub fn c2h_dma(
        &self,
        session: &Session,
        src_offset: u64,
        dst: Operand,
        len: u64,
        cancel: &CancelToken,
    ) -> Result<TransferOutcome> {
        self.check_card_range(src_offset, len)?;

        let start = Instant::now();
        let engine = self.engine.acquire(cancel)?;
        let dst = self.pin(session, dst, len, DmaDirection::FromDevice)?;

        let report = transfer::c2h(&engine, src_offset, dst.segments(), len, cancel)
            .inspect_err(|err| error!("c2h of 0x{:x} bytes failed: {}", len, err))?;
        Ok(TransferOutcome {
            report,
            elapsed: start.elapsed(),
        })
    }

    /// Interrupt handler; returns whether the interrupt was ours
    pub fn handle_irq(&self) -> bool {
        self.engine.handle_irq()
    }

    /// Run the interrupt handler on a dedicated thread fed by `source`
    pub fn spawn_irq_worker<S: InterruptSource>(self: &Arc<Self>, mut source: S) -> std::io::Result<thread::JoinHandle<()>> {
        let device = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}-irq", device.variant.name))
            .spawn(move || loop {
                match source.wait() {
                    Ok(true) => {
                        let handled = device.handle_irq();
                        if let Err(err) = source.ack(handled) {
                            error!("failed to acknowledge interrupt: {}", err);
                            break;
                        }
                    }
                    Ok(false) => {
                        info!("interrupt source closed");
                        break;
                    }
                    Err(err) => {
                        warn!("interrupt wait failed: {}", err);
                        break;
                    }
                }
            })
    }
}
