// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Software model of a PicoEVB-class card
//!
//! Implements every platform trait the engine needs: both BARs with XDMA
//! register semantics, coherent descriptor memory, fragmented process
//! memory, GPU memory with reclaim, and an interrupt line. A channel run
//! executes its descriptor synchronously and raises the interrupt if the
//! driver enabled it. Used by the tests and by the daemon when no real card
//! is present.

mod card;
mod memory;

use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};
use parking_lot::{Condvar, Mutex};

pub use self::card::{SimDma, SimGpio};
pub use self::memory::{
    SimGpu, SimHostMemory, GPU_BUS_BASE, GPU_VA_BASE, HOST_BUS_BASE, HOST_VA_BASE,
};

use self::card::CardState;
use crate::descriptor::{Descriptor, DescriptorMemory, DESC_SIZE};
use crate::device::{Device, DeviceResources, InterruptSource};
use crate::error::Result;
use crate::peer::{PeerMemory, GPU_PAGE_SHIFT_DGPU};
use crate::regs::Channel;
use crate::DeviceVariant;

/// Bus address of the descriptor slot
pub const DESC_BUS_ADDR: u64 = 0xfeed_0000;

/// Channel activity as seen by the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// RUN set
    Start(Channel),
    /// RUN cleared
    Stop(Channel),
}

/// Coherent memory holding the descriptor slot
pub struct SimDescriptors {
    bytes: Mutex<[u8; DESC_SIZE]>,
}

impl SimDescriptors {
    fn new() -> Self {
        Self {
            bytes: Mutex::new([0; DESC_SIZE]),
        }
    }

    /// Descriptor as the card would fetch it
    pub fn load(&self) -> Descriptor {
        Descriptor::from_bytes(&self.bytes.lock())
    }
}

impl DescriptorMemory for SimDescriptors {
    fn bus_addr(&self) -> u64 {
        DESC_BUS_ADDR
    }

    fn store(&self, desc: &Descriptor) {
        *self.bytes.lock() = desc.to_bytes();
    }
}

#[derive(Default)]
struct IrqState {
    pending: u64,
    closed: bool,
}

/// The card's interrupt line
#[derive(Default)]
pub struct IrqLine {
    state: Mutex<IrqState>,
    cond: Condvar,
}

impl IrqLine {
    fn raise(&self) {
        self.state.lock().pending += 1;
        self.cond.notify_all();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }
}

/// Receiving end of the simulated interrupt line
pub struct SimInterrupt {
    line: Arc<IrqLine>,
}

impl InterruptSource for SimInterrupt {
    fn wait(&mut self) -> Result<bool> {
        let mut state = self.line.state.lock();
        loop {
            if state.pending > 0 {
                state.pending = 0;
                return Ok(true);
            }
            if state.closed {
                return Ok(false);
            }
            self.line.cond.wait(&mut state);
        }
    }
}

/// Shape of the simulated system
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub variant: &'static DeviceVariant,
    /// Bytes of process memory
    pub host_size: usize,
    /// Scatter process memory pages over the bus
    pub fragmented_host: bool,
    /// Bytes of GPU memory; `None` leaves peer memory unsupported
    pub gpu_size: Option<usize>,
    pub gpu_page_shift: u32,
}

impl SimConfig {
    pub fn new(variant: &'static DeviceVariant) -> Self {
        Self {
            variant,
            host_size: 16 << 20,
            fragmented_host: true,
            gpu_size: Some(4 << 20),
            gpu_page_shift: GPU_PAGE_SHIFT_DGPU,
        }
    }

    pub fn host_size(mut self, size: usize) -> Self {
        self.host_size = size;
        self
    }

    pub fn fragmented_host(mut self, fragmented: bool) -> Self {
        self.fragmented_host = fragmented;
        self
    }

    pub fn gpu(mut self, size: Option<usize>, page_shift: u32) -> Self {
        self.gpu_size = size;
        self.gpu_page_shift = page_shift;
        self
    }
}

/// A simulated card plugged into a simulated host
pub struct SimCard {
    variant: &'static DeviceVariant,
    card: Arc<CardState>,
    host: Arc<SimHostMemory>,
    gpu: Option<SimGpu>,
    descs: Arc<SimDescriptors>,
    irq: Arc<IrqLine>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimCard {
    pub fn new(config: SimConfig) -> Self {
        let host = Arc::new(SimHostMemory::new(config.host_size, config.fragmented_host));
        let gpu = config
            .gpu_size
            .map(|size| SimGpu::new(size, config.gpu_page_shift));
        let descs = Arc::new(SimDescriptors::new());
        let irq = Arc::new(IrqLine::default());
        let card = Arc::new(CardState::new(
            config.variant,
            Arc::clone(&host),
            gpu.clone(),
            Arc::clone(&descs),
            Arc::clone(&irq),
        ));
        Self {
            variant: config.variant,
            card,
            host,
            gpu,
            descs,
            irq,
            worker: Mutex::new(None),
        }
    }

    /// Platform resources for [`Device::new`]
    pub fn resources(&self) -> DeviceResources {
        DeviceResources {
            gpio: Arc::new(SimGpio {
                card: Arc::clone(&self.card),
            }),
            dma: Arc::new(SimDma {
                card: Arc::clone(&self.card),
            }),
            descriptors: Arc::clone(&self.descs) as Arc<dyn DescriptorMemory>,
            host: Arc::clone(&self.host) as _,
            peer: self
                .gpu
                .as_ref()
                .map(|gpu| Arc::new(gpu.clone()) as Arc<dyn PeerMemory>),
        }
    }

    /// A receiver for the card's interrupt line
    pub fn interrupt(&self) -> SimInterrupt {
        SimInterrupt {
            line: Arc::clone(&self.irq),
        }
    }

    /// Build a device on this card and start its interrupt worker
    pub fn attach(&self) -> std::io::Result<Arc<Device>> {
        let device = Arc::new(Device::new(self.variant, self.resources()));
        let worker = device.spawn_irq_worker(self.interrupt())?;
        if let Some(old) = self.worker.lock().replace(worker) {
            warn!("sim: replacing interrupt worker");
            drop(old);
        }
        Ok(device)
    }

    /// Close the interrupt line and wait for the worker to exit
    pub fn shutdown(&self) {
        self.irq.close();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("sim: interrupt worker panicked");
            }
            info!("sim: interrupt worker stopped");
        }
    }

    pub fn host(&self) -> &Arc<SimHostMemory> {
        &self.host
    }

    pub fn gpu(&self) -> Option<&SimGpu> {
        self.gpu.as_ref()
    }

    /// Let `runs` more channel runs succeed, then fail the next one
    pub fn fail_after(&self, runs: u64) {
        self.card.fail_after(runs);
    }

    /// Keep channel runs busy forever without completing
    pub fn stall(&self, stall: bool) {
        self.card.stall(stall);
    }

    /// Register writes on both BARs so far
    pub fn register_writes(&self) -> u64 {
        self.card.writes()
    }

    /// Channel runs executed so far
    pub fn runs(&self) -> u64 {
        self.card.runs()
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.card.events()
    }

    pub fn led(&self) -> u32 {
        self.card.led()
    }

    pub fn read_staging(&self, offset: u64, len: usize) -> Vec<u8> {
        self.card.read_staging(offset, len)
    }

    pub fn write_staging(&self, offset: u64, bytes: &[u8]) {
        self.card.write_staging(offset, bytes)
    }
}

impl Drop for SimCard {
    fn drop(&mut self) {
        self.shutdown();
    }
}
