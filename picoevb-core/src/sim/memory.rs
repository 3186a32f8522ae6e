// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Simulated host and GPU memory
//!
//! Both arenas hand out bus addresses that are only piecewise contiguous, so
//! that segment coalescing and chunking see realistic scatter lists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::peer::{PeerDmaMap, PeerMemory, PeerPages, RevokeHook};
use crate::pin::{DmaDirection, HostMemory, PageFrame};
use crate::PAGE_SIZE;

/// First virtual address of simulated process memory
pub const HOST_VA_BASE: u64 = 0x7f00_0000_0000;
/// Bus window of simulated process memory
pub const HOST_BUS_BASE: u64 = 0x1_0000_0000;
/// First virtual address of simulated GPU memory
pub const GPU_VA_BASE: u64 = 0x2_0000_0000;
/// Bus window of simulated GPU memory (BAR1 of the GPU)
pub const GPU_BUS_BASE: u64 = 0x40_0000_0000;

/// Run lengths of bus-contiguous host pages
const HOST_RUNS: &[usize] = &[1, 3, 2, 4, 8];
/// A single run covering the whole arena
const CONTIGUOUS: &[usize] = &[usize::MAX];
/// Run lengths of bus-contiguous GPU pages
const GPU_RUNS: &[usize] = &[2, 1, 3];

/// Assign a bus frame to each page. Consecutive pages share contiguous
/// frames in runs of the given lengths; runs are laid out in reverse order
/// with a one-frame hole between them.
fn fragmented_frames(pages: usize, runs: &[usize]) -> Vec<u64> {
    let mut spans = Vec::new();
    let mut page = 0;
    for len in runs.iter().cycle() {
        if page >= pages {
            break;
        }
        let len = (*len).min(pages - page);
        spans.push((page, len));
        page += len;
    }

    let mut frames = vec![0u64; pages];
    let mut next = 0u64;
    for &(first, len) in spans.iter().rev() {
        for (k, frame) in frames[first..first + len].iter_mut().enumerate() {
            *frame = next + k as u64;
        }
        next += len as u64 + 1;
    }
    frames
}

fn invert(frames: &[u64]) -> HashMap<u64, usize> {
    frames
        .iter()
        .enumerate()
        .map(|(page, frame)| (*frame, page))
        .collect()
}

/// Paged backing store addressed both virtually and through the bus
struct Arena {
    data: Mutex<Vec<u8>>,
    va_base: u64,
    bus_base: u64,
    page_size: u64,
    frames: Vec<u64>,
    pages_by_frame: HashMap<u64, usize>,
    next_alloc: Mutex<u64>,
}

impl Arena {
    fn new(size: usize, va_base: u64, bus_base: u64, page_size: u64, runs: &[usize]) -> Self {
        let pages = size.div_ceil(page_size as usize);
        let frames = fragmented_frames(pages, runs);
        let pages_by_frame = invert(&frames);
        Self {
            data: Mutex::new(vec![0u8; pages * page_size as usize]),
            va_base,
            bus_base,
            page_size,
            frames,
            pages_by_frame,
            next_alloc: Mutex::new(0),
        }
    }

    fn size(&self) -> u64 {
        self.frames.len() as u64 * self.page_size
    }

    fn page_count(&self) -> usize {
        self.frames.len()
    }

    fn alloc(&self, len: u64) -> Result<u64> {
        let mut next = self.next_alloc.lock();
        let len = len.max(1).next_multiple_of(self.page_size);
        if *next + len > self.size() {
            return Err(Error::OutOfMemory);
        }
        let va = self.va_base + *next;
        *next += len;
        Ok(va)
    }

    fn range(&self, va: u64, len: usize) -> Result<core::ops::Range<usize>> {
        let start = va.checked_sub(self.va_base).ok_or(Error::Fault)?;
        let end = start.checked_add(len as u64).ok_or(Error::Fault)?;
        if end > self.size() {
            return Err(Error::Fault);
        }
        Ok(start as usize..end as usize)
    }

    fn write(&self, va: u64, bytes: &[u8]) -> Result<()> {
        let range = self.range(va, bytes.len())?;
        self.data.lock()[range].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, va: u64, len: usize) -> Result<Vec<u8>> {
        let range = self.range(va, len)?;
        Ok(self.data.lock()[range].to_vec())
    }

    fn bus_addr(&self, page: usize) -> u64 {
        self.bus_base + self.frames[page] * self.page_size
    }

    fn owns_bus(&self, addr: u64) -> bool {
        addr >= self.bus_base && addr - self.bus_base < self.bus_span()
    }

    fn bus_span(&self) -> u64 {
        (self.frames.len() as u64 * 2 + 1) * self.page_size
    }

    /// Walk a bus range page by page, handing each piece's arena offset to `f`
    fn bus_walk(&self, addr: u64, len: usize, mut f: impl FnMut(usize, usize, usize)) -> bool {
        let mut addr = addr;
        let mut done = 0;
        while done < len {
            let Some(rel) = addr.checked_sub(self.bus_base) else {
                return false;
            };
            let frame = rel / self.page_size;
            let offset = (rel % self.page_size) as usize;
            let Some(&page) = self.pages_by_frame.get(&frame) else {
                return false;
            };
            let this = (self.page_size as usize - offset).min(len - done);
            f(page * self.page_size as usize + offset, done, this);
            done += this;
            addr += this as u64;
        }
        true
    }

    fn bus_read(&self, addr: u64, out: &mut [u8]) -> bool {
        let data = self.data.lock();
        let len = out.len();
        self.bus_walk(addr, len, |src, dst, n| {
            out[dst..dst + n].copy_from_slice(&data[src..src + n]);
        })
    }

    fn bus_write(&self, addr: u64, bytes: &[u8]) -> bool {
        let mut data = self.data.lock();
        self.bus_walk(addr, bytes.len(), |dst, src, n| {
            data[dst..dst + n].copy_from_slice(&bytes[src..src + n]);
        })
    }
}

/// Simulated process memory with 4 KiB pages
pub struct SimHostMemory {
    arena: Arena,
    pins: Mutex<Vec<u32>>,
    mapped: AtomicU64,
}

impl SimHostMemory {
    /// `fragmented` scatters pages over the bus; otherwise the arena is one
    /// contiguous bus range, as behind an IOMMU
    pub fn new(size: usize, fragmented: bool) -> Self {
        let runs = if fragmented { HOST_RUNS } else { CONTIGUOUS };
        let arena = Arena::new(size, HOST_VA_BASE, HOST_BUS_BASE, PAGE_SIZE, runs);
        let pins = Mutex::new(vec![0; arena.page_count()]);
        Self {
            arena,
            pins,
            mapped: AtomicU64::new(0),
        }
    }

    /// Allocate a page-aligned buffer
    pub fn alloc(&self, len: u64) -> Result<u64> {
        self.arena.alloc(len)
    }

    pub fn write(&self, va: u64, bytes: &[u8]) -> Result<()> {
        self.arena.write(va, bytes)
    }

    pub fn read(&self, va: u64, len: usize) -> Result<Vec<u8>> {
        self.arena.read(va, len)
    }

    /// Outstanding page pins
    pub fn pinned_pages(&self) -> u64 {
        self.pins.lock().iter().map(|&n| u64::from(n)).sum()
    }

    /// Pages currently mapped for device access
    pub fn mapped_pages(&self) -> u64 {
        self.mapped.load(Ordering::SeqCst)
    }

    pub(crate) fn owns_bus(&self, addr: u64) -> bool {
        self.arena.owns_bus(addr)
    }

    pub(crate) fn bus_read(&self, addr: u64, out: &mut [u8]) -> bool {
        self.arena.bus_read(addr, out)
    }

    pub(crate) fn bus_write(&self, addr: u64, bytes: &[u8]) -> bool {
        self.arena.bus_write(addr, bytes)
    }
}

impl HostMemory for SimHostMemory {
    fn pin_pages(&self, start: u64, count: usize, _writable: bool) -> Result<Vec<PageFrame>> {
        let Some(rel) = start.checked_sub(self.arena.va_base) else {
            return Ok(Vec::new());
        };
        let first = (rel / PAGE_SIZE) as usize;
        let available = self.arena.page_count().saturating_sub(first);
        let count = count.min(available);

        let mut pins = self.pins.lock();
        let mut pages = Vec::new();
        pages.try_reserve(count)?;
        for page in first..first + count {
            pins[page] += 1;
            pages.push(PageFrame(page as u64));
        }
        Ok(pages)
    }

    fn unpin_pages(&self, pages: &[PageFrame], _dirty: bool) {
        let mut pins = self.pins.lock();
        for page in pages {
            let pin = &mut pins[page.0 as usize];
            *pin = pin.saturating_sub(1);
        }
    }

    fn map_pages(&self, pages: &[PageFrame], _dir: DmaDirection) -> Result<Vec<u64>> {
        self.mapped.fetch_add(pages.len() as u64, Ordering::SeqCst);
        Ok(pages
            .iter()
            .map(|page| self.arena.bus_addr(page.0 as usize))
            .collect())
    }

    fn unmap_pages(&self, bus_addrs: &[u64], _dir: DmaDirection) {
        self.mapped.fetch_sub(bus_addrs.len() as u64, Ordering::SeqCst);
    }
}

struct PinRecord {
    id: u64,
    first_page: usize,
    count: usize,
    hook: Option<RevokeHook>,
}

struct GpuInner {
    arena: Arena,
    pins: Mutex<Vec<PinRecord>>,
    next_id: AtomicU64,
    puts: AtomicU64,
    frees: AtomicU64,
    mapped: AtomicU64,
}

/// Simulated GPU memory that can be pinned for peer-to-peer DMA
#[derive(Clone)]
pub struct SimGpu {
    inner: Arc<GpuInner>,
}

impl SimGpu {
    pub fn new(size: usize, page_shift: u32) -> Self {
        Self {
            inner: Arc::new(GpuInner {
                arena: Arena::new(size, GPU_VA_BASE, GPU_BUS_BASE, 1 << page_shift, GPU_RUNS),
                pins: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                puts: AtomicU64::new(0),
                frees: AtomicU64::new(0),
                mapped: AtomicU64::new(0),
            }),
        }
    }

    /// Allocate a GPU-page-aligned buffer
    pub fn alloc(&self, len: u64) -> Result<u64> {
        self.inner.arena.alloc(len)
    }

    pub fn write(&self, va: u64, bytes: &[u8]) -> Result<()> {
        self.inner.arena.write(va, bytes)
    }

    pub fn read(&self, va: u64, len: usize) -> Result<Vec<u8>> {
        self.inner.arena.read(va, len)
    }

    /// Take back every pinned range containing `va`, firing revocation hooks.
    /// Returns the number of ranges reclaimed.
    pub fn reclaim(&self, va: u64) -> usize {
        let arena = &self.inner.arena;
        let Some(rel) = va.checked_sub(arena.va_base) else {
            return 0;
        };
        let page = (rel / arena.page_size) as usize;

        let hooks: Vec<RevokeHook> = {
            let mut pins = self.inner.pins.lock();
            let mut hooks = Vec::new();
            pins.retain_mut(|pin| {
                if page >= pin.first_page && page < pin.first_page + pin.count {
                    hooks.extend(pin.hook.take());
                    false
                } else {
                    true
                }
            });
            hooks
        };
        let reclaimed = hooks.len();
        for hook in hooks {
            hook();
        }
        reclaimed
    }

    /// Ranges currently pinned
    pub fn live_pins(&self) -> usize {
        self.inner.pins.lock().len()
    }

    /// Ranges handed back by explicit unpin
    pub fn puts(&self) -> u64 {
        self.inner.puts.load(Ordering::SeqCst)
    }

    /// Ranges freed after reclaim
    pub fn frees(&self) -> u64 {
        self.inner.frees.load(Ordering::SeqCst)
    }

    /// Live device mappings
    pub fn mapped(&self) -> u64 {
        self.inner.mapped.load(Ordering::SeqCst)
    }

    pub(crate) fn owns_bus(&self, addr: u64) -> bool {
        self.inner.arena.owns_bus(addr)
    }

    pub(crate) fn bus_read(&self, addr: u64, out: &mut [u8]) -> bool {
        self.inner.arena.bus_read(addr, out)
    }

    pub(crate) fn bus_write(&self, addr: u64, bytes: &[u8]) -> bool {
        self.inner.arena.bus_write(addr, bytes)
    }
}

impl PeerMemory for SimGpu {
    fn page_size(&self) -> u64 {
        self.inner.arena.page_size
    }

    fn get_pages(&self, va: u64, len: u64, on_revoke: RevokeHook) -> Result<Box<dyn PeerPages>> {
        let arena = &self.inner.arena;
        if va % arena.page_size != 0 || len % arena.page_size != 0 {
            return Err(Error::InvalidArgument("unaligned peer range"));
        }
        let range = arena.range(va, len as usize)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let first_page = range.start / arena.page_size as usize;
        let count = (len / arena.page_size) as usize;
        self.inner.pins.lock().push(PinRecord {
            id,
            first_page,
            count,
            hook: Some(on_revoke),
        });

        Ok(Box::new(SimPeerPages {
            inner: Arc::clone(&self.inner),
            id,
            first_page,
            count,
        }))
    }
}

struct SimPeerPages {
    inner: Arc<GpuInner>,
    id: u64,
    first_page: usize,
    count: usize,
}

impl PeerPages for SimPeerPages {
    fn dma_map(&self, _dir: DmaDirection) -> Result<Box<dyn PeerDmaMap>> {
        let arena = &self.inner.arena;
        let entries = (self.first_page..self.first_page + self.count)
            .map(|page| arena.bus_addr(page))
            .collect();
        self.inner.mapped.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimPeerMap {
            inner: Arc::clone(&self.inner),
            entries,
        }))
    }

    fn put(self: Box<Self>) {
        self.inner.pins.lock().retain(|pin| pin.id != self.id);
        self.inner.puts.fetch_add(1, Ordering::SeqCst);
    }

    fn free(self: Box<Self>) {
        self.inner.frees.fetch_add(1, Ordering::SeqCst);
    }
}

struct SimPeerMap {
    inner: Arc<GpuInner>,
    entries: Vec<u64>,
}

impl PeerDmaMap for SimPeerMap {
    fn entries(&self) -> &[u64] {
        &self.entries
    }
}

impl Drop for SimPeerMap {
    fn drop(&mut self) {
        self.inner.mapped.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragmented_frames_runs() {
        let frames = fragmented_frames(6, &[1, 3, 2]);
        // Runs: [0], [1..4], [4..6], placed in reverse with holes
        assert_eq!(frames, vec![7, 3, 4, 5, 0, 1]);
        assert_eq!(invert(&frames).len(), 6);
    }

    #[test]
    fn test_host_bus_access_matches_virtual() {
        let host = SimHostMemory::new(64 * 1024, true);
        let va = host.alloc(3 * PAGE_SIZE).unwrap();
        let data: Vec<u8> = (0..3 * PAGE_SIZE as usize).map(|i| i as u8).collect();
        host.write(va, &data).unwrap();

        let pages = host.pin_pages(va, 3, false).unwrap();
        let bus = host.map_pages(&pages, DmaDirection::ToDevice).unwrap();
        for (i, addr) in bus.iter().enumerate() {
            let mut out = vec![0u8; PAGE_SIZE as usize];
            assert!(host.bus_read(*addr, &mut out));
            assert_eq!(&out[..], &data[i * PAGE_SIZE as usize..(i + 1) * PAGE_SIZE as usize]);
        }
        assert_eq!(host.pinned_pages(), 3);
        host.unmap_pages(&bus, DmaDirection::ToDevice);
        host.unpin_pages(&pages, false);
        assert_eq!(host.pinned_pages(), 0);
        assert_eq!(host.mapped_pages(), 0);
    }

    #[test]
    fn test_pin_past_end_is_short() {
        let host = SimHostMemory::new(4 * PAGE_SIZE as usize, true);
        let pages = host
            .pin_pages(HOST_VA_BASE + 2 * PAGE_SIZE, 4, true)
            .unwrap();
        assert_eq!(pages.len(), 2);
        host.unpin_pages(&pages, true);
    }

    #[test]
    fn test_gpu_reclaim_fires_hook_once() {
        let gpu = SimGpu::new(1 << 20, 16);
        let va = gpu.alloc(1 << 17).unwrap();
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        let pages = gpu
            .get_pages(
                va,
                1 << 17,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(gpu.live_pins(), 1);

        assert_eq!(gpu.reclaim(va + 0x1_0000), 1);
        assert_eq!(gpu.reclaim(va), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        pages.free();
        assert_eq!(gpu.frees(), 1);
        assert_eq!(gpu.live_pins(), 0);
    }
}
