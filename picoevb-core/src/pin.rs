// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Host memory pinning
//!
//! Turns a range of ordinary process memory into device-addressable
//! segments. Pages stay pinned and mapped until the [`HostBuffer`] drops.

use std::sync::Arc;

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::segment::SegmentList;
use crate::PAGE_SIZE;

/// Which way the device moves data through a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads the memory
    ToDevice,
    /// Device writes the memory
    FromDevice,
}

impl DmaDirection {
    pub fn device_writes(self) -> bool {
        self == DmaDirection::FromDevice
    }
}

/// A pinned page frame, opaque to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFrame(pub u64);

/// Process memory as seen by the driver
pub trait HostMemory: Send + Sync {
    /// Pin up to `count` pages starting at the page-aligned address `start`.
    /// May pin fewer than asked; the caller treats a short count as a fault.
    fn pin_pages(&self, start: u64, count: usize, writable: bool) -> Result<Vec<PageFrame>>;

    /// Drop the pins taken by [`HostMemory::pin_pages`]
    fn unpin_pages(&self, pages: &[PageFrame], dirty: bool);

    /// Map pinned pages for device access, one bus address per page
    fn map_pages(&self, pages: &[PageFrame], dir: DmaDirection) -> Result<Vec<u64>>;

    /// Undo [`HostMemory::map_pages`]
    fn unmap_pages(&self, bus_addrs: &[u64], dir: DmaDirection);
}

/// One scatter entry before device mapping: a piece of a single page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScatterEntry {
    page: usize,
    offset: u64,
    len: u64,
}

/// Split `[addr, addr + len)` into per-page pieces. The first piece starts at
/// the sub-page offset; the pieces sum to exactly `len`.
fn scatter(addr: u64, len: u64) -> Vec<ScatterEntry> {
    let mut entries = Vec::new();
    let mut offset = addr % PAGE_SIZE;
    let mut left = len;
    let mut page = 0;
    while left > 0 {
        let this = core::cmp::min(PAGE_SIZE - offset, left);
        entries.push(ScatterEntry {
            page,
            offset,
            len: this,
        });
        left -= this;
        offset = 0;
        page += 1;
    }
    entries
}

/// Number of pages covering `[addr, addr + len)`
pub fn page_span(addr: u64, len: u64) -> Result<usize> {
    if len == 0 {
        return Ok(0);
    }
    let start = addr - addr % PAGE_SIZE;
    let end = addr
        .checked_add(len)
        .ok_or(Error::InvalidArgument("address range overflows"))?;
    let pages = (end - start).div_ceil(PAGE_SIZE);
    usize::try_from(pages).map_err(|_| Error::OutOfMemory)
}

/// Pinned and mapped process memory
pub struct HostBuffer {
    mem: Arc<dyn HostMemory>,
    dir: DmaDirection,
    pages: Vec<PageFrame>,
    bus_addrs: Vec<u64>,
    segments: SegmentList,
}

impl HostBuffer {
    /// Pin `len` bytes at `addr` for a transfer in direction `dir`
    pub fn pin(mem: Arc<dyn HostMemory>, addr: u64, len: u64, dir: DmaDirection) -> Result<Self> {
        let count = page_span(addr, len)?;
        let start = addr - addr % PAGE_SIZE;

        let mut buf = HostBuffer {
            mem,
            dir,
            pages: Vec::new(),
            bus_addrs: Vec::new(),
            segments: SegmentList::new(),
        };
        if count == 0 {
            return Ok(buf);
        }

        buf.pages = buf.mem.pin_pages(start, count, dir.device_writes())?;
        if buf.pages.len() != count {
            warn!(
                "pinned {} of {} pages at 0x{:x}",
                buf.pages.len(),
                count,
                start
            );
            return Err(Error::Fault);
        }

        let entries = scatter(addr, len);
        buf.bus_addrs = buf.mem.map_pages(&buf.pages, dir)?;
        if buf.bus_addrs.len() != buf.pages.len() {
            return Err(Error::Fault);
        }

        for entry in entries {
            buf.segments
                .push(buf.bus_addrs[entry.page] + entry.offset, entry.len)?;
        }
        trace!(
            "pinned 0x{:x}+0x{:x}: {} pages, {} segments",
            addr,
            len,
            count,
            buf.segments.len()
        );
        Ok(buf)
    }

    pub fn segments(&self) -> &SegmentList {
        &self.segments
    }

    pub fn direction(&self) -> DmaDirection {
        self.dir
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if !self.bus_addrs.is_empty() {
            self.mem.unmap_pages(&self.bus_addrs, self.dir);
        }
        if !self.pages.is_empty() {
            self.mem.unpin_pages(&self.pages, self.dir.device_writes());
        }
    }
}
