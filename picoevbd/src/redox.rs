// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Redox platform bindings
//!
//! BARs and the descriptor page are mapped with `physmap`, the interrupt is
//! read from an `irq:` file and clients reach the driver through a
//! `redox-scheme` socket. Host buffers are addresses in the daemon's own
//! address space (clients share them with the daemon via fmap), translated
//! page by page with `virttophys`. There is no IOMMU, so the bus address of
//! a page is its physical address.

use std::fs::File;
use std::io::{Read, Write};
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::{bail, Context};
use libredox::flag::{O_CLOEXEC, O_RDWR};
use log::{error, info, warn};
use parking_lot::Mutex;
use picoevb::descriptor::{Descriptor, DescriptorMemory, DESC_SIZE};
use picoevb::pin::{DmaDirection, HostMemory, PageFrame};
use picoevb::regs::RegisterIo;
use picoevb::{DeviceResources, DeviceVariant, InterruptSource, PAGE_SIZE};
use redox_event::{EventFlags, EventQueue};
use redox_scheme::{CallerCtx, OpenResult, RequestKind, SchemeBlock, SignalBehavior, Socket};
use syscall::schemev2::NewFdFlags;
use syscall::{Error as SysError, PhysmapFlags, Stat, EACCES, EAGAIN, MODE_FILE};

use crate::scheme::{PicoEvbScheme, SchemeError};
use crate::DriverConfig;

const GPIO_BAR_SIZE: usize = 0x1000;
const DMA_BAR_SIZE: usize = 0x1_0000;

const PCI_SUBSYSTEM_VENDOR_ID: usize = 0x2c;
const PCI_SUBSYSTEM_ID: usize = 0x2e;
const PCI_BAR0: usize = 0x10;
const PCI_INTERRUPT_LINE: usize = 0x3c;

/// A physmapped register window
struct MmioBar {
    base: NonNull<u32>,
    size: usize,
}

// SAFETY: the mapping lives as long as the struct and is only accessed
// through volatile 32-bit reads and writes.
unsafe impl Send for MmioBar {}
unsafe impl Sync for MmioBar {}

impl MmioBar {
    fn map(phys: usize, size: usize) -> anyhow::Result<Self> {
        let virt = unsafe {
            syscall::physmap(
                phys,
                size,
                PhysmapFlags::PHYSMAP_WRITE | PhysmapFlags::PHYSMAP_NO_CACHE,
            )
        }
        .map_err(|err| anyhow::anyhow!("physmap of 0x{:x}: {}", phys, err))?;
        let base = NonNull::new(virt as *mut u32).context("physmap returned null")?;
        Ok(Self { base, size })
    }

    fn slot(&self, offset: u32) -> Option<*mut u32> {
        let offset = offset as usize;
        if offset % 4 != 0 || offset + 4 > self.size {
            return None;
        }
        Some(unsafe { self.base.as_ptr().add(offset / 4) })
    }
}

impl RegisterIo for MmioBar {
    fn read32(&self, offset: u32) -> u32 {
        match self.slot(offset) {
            Some(ptr) => unsafe { ptr.read_volatile() },
            None => {
                error!("register read outside BAR at 0x{:x}", offset);
                u32::MAX
            }
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        match self.slot(offset) {
            Some(ptr) => unsafe { ptr.write_volatile(value) },
            None => error!("register write outside BAR at 0x{:x}", offset),
        }
    }
}

impl Drop for MmioBar {
    fn drop(&mut self) {
        let _ = unsafe { syscall::physunmap(self.base.as_ptr() as usize) };
    }
}

#[repr(C, align(4096))]
struct DescPage([u8; PAGE_SIZE as usize]);

/// Page-aligned descriptor slot in daemon memory
struct DescriptorPage {
    page: Mutex<Box<DescPage>>,
    bus: u64,
}

impl DescriptorPage {
    fn new() -> anyhow::Result<Self> {
        let page = Box::new(DescPage([0; PAGE_SIZE as usize]));
        let bus = unsafe { syscall::virttophys(page.0.as_ptr() as usize) }
            .map_err(|err| anyhow::anyhow!("virttophys of descriptor page: {}", err))?;
        Ok(Self {
            page: Mutex::new(page),
            bus: bus as u64,
        })
    }
}

impl DescriptorMemory for DescriptorPage {
    fn bus_addr(&self) -> u64 {
        self.bus
    }

    fn store(&self, desc: &Descriptor) {
        let mut page = self.page.lock();
        let bytes = desc.to_bytes();
        let slot = &mut page.0[..DESC_SIZE];
        for (dst, src) in slot.iter_mut().zip(bytes) {
            unsafe { std::ptr::write_volatile(dst, src) };
        }
    }
}

/// Daemon address space as the DMA host
struct DaemonMemory;

impl HostMemory for DaemonMemory {
    fn pin_pages(&self, start: u64, count: usize, _writable: bool) -> picoevb::Result<Vec<PageFrame>> {
        let mut frames = Vec::new();
        frames.try_reserve(count)?;
        for i in 0..count as u64 {
            let va = start + i * PAGE_SIZE;
            match unsafe { syscall::virttophys(va as usize) } {
                Ok(phys) => frames.push(PageFrame(phys as u64)),
                Err(err) => {
                    warn!("virttophys of 0x{:x}: {}", va, err);
                    break;
                }
            }
        }
        Ok(frames)
    }

    fn unpin_pages(&self, _pages: &[PageFrame], _dirty: bool) {}

    fn map_pages(&self, pages: &[PageFrame], _dir: DmaDirection) -> picoevb::Result<Vec<u64>> {
        Ok(pages.iter().map(|frame| frame.0).collect())
    }

    fn unmap_pages(&self, _bus_addrs: &[u64], _dir: DmaDirection) {}
}

/// `irq:N` file
struct IrqFile {
    file: File,
    buf: [u8; 8],
}

impl InterruptSource for IrqFile {
    fn wait(&mut self) -> picoevb::Result<bool> {
        match self.file.read(&mut self.buf) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(err) => {
                error!("irq read failed: {}", err);
                Err(picoevb::Error::Fault)
            }
        }
    }

    fn ack(&mut self, _handled: bool) -> picoevb::Result<()> {
        self.file.write_all(&self.buf).map_err(|err| {
            error!("irq ack failed: {}", err);
            picoevb::Error::Fault
        })
    }
}

/// What the PCI config space says about the card
struct PciInfo {
    variant: &'static DeviceVariant,
    bars: [usize; 2],
    irq: u8,
}

fn read_pci(config: &DriverConfig) -> anyhow::Result<PciInfo> {
    let fd = libredox::call::open(&config.pci_path, O_RDWR | O_CLOEXEC, 0)
        .map_err(|err| anyhow::anyhow!("open {}: {}", config.pci_path, err))?;
    let mut space = [0u8; 256];
    let len = libredox::call::read(fd, &mut space)
        .map_err(|err| anyhow::anyhow!("read pci config: {}", err))?;
    let _ = libredox::call::close(fd);
    if len < 0x40 {
        bail!("short pci config ({} bytes)", len);
    }

    let word = |off: usize| u32::from_le_bytes([space[off], space[off + 1], space[off + 2], space[off + 3]]);
    let half = |off: usize| u16::from_le_bytes([space[off], space[off + 1]]);
    let subvendor = half(PCI_SUBSYSTEM_VENDOR_ID);
    let subsystem = half(PCI_SUBSYSTEM_ID);

    let variant = match config.variant.as_deref() {
        Some(name) => DeviceVariant::from_name(name).with_context(|| format!("unknown variant '{}'", name))?,
        None => DeviceVariant::from_subsystem(subvendor, subsystem)
            .with_context(|| format!("unknown subsystem {:04x}:{:04x}", subvendor, subsystem))?,
    };
    let bars = [
        (word(PCI_BAR0) & !0xf) as usize,
        (word(PCI_BAR0 + 4) & !0xf) as usize,
    ];

    Ok(PciInfo {
        variant,
        bars,
        irq: config.irq.unwrap_or(space[PCI_INTERRUPT_LINE]),
    })
}

/// Map the card and build its platform resources
pub fn open_card(config: &DriverConfig) -> anyhow::Result<(&'static DeviceVariant, DeviceResources, impl InterruptSource)> {
    let pci = read_pci(config)?;
    info!(
        "{}: BAR0 0x{:x} BAR1 0x{:x} irq {}",
        pci.variant.name, pci.bars[0], pci.bars[1], pci.irq
    );

    let gpio = MmioBar::map(pci.bars[picoevb::BAR_GPIO], GPIO_BAR_SIZE)?;
    let dma = MmioBar::map(pci.bars[picoevb::BAR_DMA], DMA_BAR_SIZE)?;
    let irq = IrqFile {
        file: File::options()
            .read(true)
            .write(true)
            .open(format!("irq:{}", pci.irq))
            .with_context(|| format!("open irq:{}", pci.irq))?,
        buf: [0; 8],
    };

    let resources = DeviceResources {
        gpio: Arc::new(gpio),
        dma: Arc::new(dma),
        descriptors: Arc::new(DescriptorPage::new()?),
        host: Arc::new(DaemonMemory),
        // No GPU peer-memory provider on Redox yet
        peer: None,
    };
    Ok((pci.variant, resources, irq))
}

fn sys_err(err: SchemeError) -> SysError {
    SysError::new(err.errno())
}

struct SchemeAdapter<'a> {
    inner: &'a PicoEvbScheme,
}

impl SchemeBlock for SchemeAdapter<'_> {
    fn xopen(&mut self, path: &str, _flags: usize, ctx: &CallerCtx) -> syscall::Result<Option<OpenResult>> {
        if ctx.uid != 0 {
            return Err(SysError::new(EACCES));
        }
        let number = self.inner.open(path).map_err(sys_err)?;
        Ok(Some(OpenResult::ThisScheme {
            number,
            flags: NewFdFlags::empty(),
        }))
    }

    fn read(&mut self, id: usize, buf: &mut [u8], offset: u64, _flags: u32) -> syscall::Result<Option<usize>> {
        self.inner.read(id, buf, offset).map(Some).map_err(sys_err)
    }

    fn write(&mut self, id: usize, buf: &[u8], _offset: u64, _flags: u32) -> syscall::Result<Option<usize>> {
        self.inner.write(id, buf).map(Some).map_err(sys_err)
    }

    fn fpath(&mut self, id: usize, buf: &mut [u8]) -> syscall::Result<Option<usize>> {
        let path = format!("picoevb:{}", self.inner.path(id).map_err(sys_err)?);
        let n = buf.len().min(path.len());
        buf[..n].copy_from_slice(&path.as_bytes()[..n]);
        Ok(Some(n))
    }

    fn fstat(&mut self, id: usize, stat: &mut Stat) -> syscall::Result<Option<usize>> {
        self.inner.path(id).map_err(sys_err)?;
        stat.st_mode = MODE_FILE | 0o600;
        Ok(Some(0))
    }
}

/// Serve the scheme until it is unmounted
pub fn serve(scheme: &PicoEvbScheme, name: &str) -> anyhow::Result<()> {
    let socket = Socket::nonblock(name).with_context(|| format!("create scheme {}", name))?;
    let event_queue = EventQueue::<usize>::new().context("create event queue")?;
    event_queue
        .subscribe(socket.inner().raw(), 0, EventFlags::READ)
        .context("subscribe to scheme events")?;

    info!("serving {}:", name);
    let mut adapter = SchemeAdapter { inner: scheme };

    for event in event_queue {
        event.context("event queue")?;
        loop {
            let request = match socket.next_request(SignalBehavior::Restart) {
                Ok(Some(request)) => request,
                Ok(None) => {
                    info!("scheme unmounted");
                    return Ok(());
                }
                Err(err) if err.errno == EAGAIN => break,
                Err(err) => bail!("scheme read: {}", err),
            };

            match request.kind() {
                RequestKind::Call(call) => {
                    if let Some(resp) = call.handle_scheme_block(&mut adapter) {
                        socket.write_response(resp, SignalBehavior::Restart)?;
                    }
                }
                RequestKind::OnClose { id } => {
                    if let Err(err) = scheme.close(id) {
                        warn!("close {}: {}", id, err);
                    }
                }
                // Requests run to completion inline, so nothing is ever
                // pending when a cancellation arrives
                _ => {}
            }
        }
    }
    Ok(())
}
