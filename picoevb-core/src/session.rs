// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Client sessions and their peer memory handle tables
//!
//! A region leaves its table exactly once, through explicit unpin, through
//! revocation by the memory provider, or when the session closes. Whichever
//! path takes the pinned pages out of the region frees them; the others find
//! nothing left to do.

use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::peer::{align_region, PeerDmaMap, PeerMemory, PeerPages};
use crate::pin::DmaDirection;

/// Largest handle value clients can name
pub const HANDLE_MAX: u64 = i32::MAX as u64;

#[derive(Default)]
struct RegionState {
    handle: Option<u32>,
    pages: Option<Box<dyn PeerPages>>,
    revoked: bool,
}

/// A pinned range of peer device memory
pub struct PinnedRegion {
    va: u64,
    offset: u64,
    len: u64,
    state: Mutex<RegionState>,
}

impl PinnedRegion {
    fn new(va: u64, offset: u64, len: u64) -> Self {
        Self {
            va,
            offset,
            len,
            state: Mutex::new(RegionState::default()),
        }
    }

    /// Client virtual address the region was pinned from
    pub fn va(&self) -> u64 {
        self.va
    }

    /// Offset of the first byte within the first pinned page
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length requested at pin time
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current handle, `None` once released or revoked
    pub fn handle(&self) -> Option<u32> {
        self.state.lock().handle
    }

    pub fn is_revoked(&self) -> bool {
        self.state.lock().revoked
    }

    pub(crate) fn dma_map(&self, dir: DmaDirection) -> Result<Box<dyn PeerDmaMap>> {
        match self.state.lock().pages.as_ref() {
            Some(pages) => pages.dma_map(dir),
            None => Err(Error::InvalidArgument("region no longer pinned")),
        }
    }

    /// Invalidate the handle and take the pages, if still present
    fn detach(&self) -> (Option<u32>, Option<Box<dyn PeerPages>>) {
        let mut state = self.state.lock();
        (state.handle.take(), state.pages.take())
    }
}

/// Arena of live regions keyed by handle
#[derive(Default)]
pub struct HandleTable {
    slots: Vec<Option<Arc<PinnedRegion>>>,
    live: usize,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the smallest free handle
    pub fn allocate(&mut self, region: Arc<PinnedRegion>) -> Result<u32> {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                if self.slots.len() as u64 > HANDLE_MAX {
                    return Err(Error::OutOfMemory);
                }
                self.slots.try_reserve(1)?;
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[index] = Some(region);
        self.live += 1;
        Ok(index as u32)
    }

    pub fn get(&self, handle: u32) -> Option<&Arc<PinnedRegion>> {
        self.slots.get(handle as usize).and_then(Option::as_ref)
    }

    pub fn remove(&mut self, handle: u32) -> Option<Arc<PinnedRegion>> {
        let region = self.slots.get_mut(handle as usize)?.take()?;
        self.live -= 1;
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        Some(region)
    }

    /// Remove `handle` only if it still refers to `region`
    fn remove_if(&mut self, handle: u32, region: &Arc<PinnedRegion>) -> bool {
        match self.get(handle) {
            Some(current) if Arc::ptr_eq(current, region) => self.remove(handle).is_some(),
            _ => false,
        }
    }

    fn drain(&mut self) -> Vec<Arc<PinnedRegion>> {
        self.live = 0;
        self.slots.drain(..).flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

/// Revocation path, run by the provider's hook
fn revoke(table: &Weak<Mutex<HandleTable>>, region: &Weak<PinnedRegion>) {
    let Some(region) = region.upgrade() else {
        return;
    };
    let (handle, pages) = {
        let mut state = region.state.lock();
        state.revoked = true;
        (state.handle.take(), state.pages.take())
    };

    if let (Some(handle), Some(table)) = (handle, table.upgrade()) {
        table.lock().remove_if(handle, &region);
    }
    if let Some(pages) = pages {
        debug!("peer region 0x{:x} revoked", region.va);
        pages.free();
    }
}

/// One open client connection
pub struct Session {
    table: Arc<Mutex<HandleTable>>,
    peer: Option<Arc<dyn PeerMemory>>,
}

impl Session {
    pub fn new(peer: Option<Arc<dyn PeerMemory>>) -> Self {
        Self {
            table: Arc::new(Mutex::new(HandleTable::new())),
            peer,
        }
    }

    pub fn peer_memory(&self) -> Option<&Arc<dyn PeerMemory>> {
        self.peer.as_ref()
    }

    /// Pin `size` bytes of peer memory at `va` and return a handle for it
    pub fn pin(&self, va: u64, size: u64) -> Result<u32> {
        let peer = self
            .peer
            .as_ref()
            .ok_or(Error::InvalidArgument("no peer memory provider"))?;
        if size == 0 {
            return Err(Error::InvalidArgument("empty region"));
        }
        let (base, offset, aligned_len) = align_region(va, size, peer.page_size())?;

        let region = Arc::new(PinnedRegion::new(va, offset, size));
        let hook = {
            let table = Arc::downgrade(&self.table);
            let region = Arc::downgrade(&region);
            Box::new(move || revoke(&table, &region))
        };
        let pages = peer.get_pages(base, aligned_len, hook)?;

        let mut table = self.table.lock();
        let handle = match table.allocate(Arc::clone(&region)) {
            Ok(handle) => handle,
            Err(err) => {
                drop(table);
                pages.put();
                return Err(err);
            }
        };

        let mut state = region.state.lock();
        if state.revoked {
            drop(state);
            table.remove(handle);
            drop(table);
            pages.free();
            warn!("peer region 0x{:x} revoked while pinning", va);
            return Err(Error::Fault);
        }
        state.handle = Some(handle);
        state.pages = Some(pages);

        debug!(
            "pinned peer 0x{:x}+0x{:x} as handle {} (base 0x{:x}, offset 0x{:x})",
            va, size, handle, base, offset
        );
        Ok(handle)
    }

    /// Explicitly release a handle
    pub fn unpin(&self, handle: u64) -> Result<()> {
        let handle = checked_handle(handle)?;
        let region = self
            .table
            .lock()
            .remove(handle)
            .ok_or(Error::InvalidArgument("unknown handle"))?;

        if let (_, Some(pages)) = region.detach() {
            pages.put();
        }
        debug!("unpinned handle {}", handle);
        Ok(())
    }

    /// Look up a live region
    pub fn lookup(&self, handle: u64) -> Result<Arc<PinnedRegion>> {
        let handle = checked_handle(handle)?;
        self.table
            .lock()
            .get(handle)
            .cloned()
            .ok_or(Error::InvalidArgument("unknown handle"))
    }

    /// Number of live handles
    pub fn handle_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Release every remaining handle
    pub fn revoke_all(&self) {
        let regions = self.table.lock().drain();
        if !regions.is_empty() {
            info!("releasing {} pinned regions", regions.len());
        }
        for region in regions {
            if let (_, Some(pages)) = region.detach() {
                pages.put();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.revoke_all();
    }
}

fn checked_handle(handle: u64) -> Result<u32> {
    if handle > HANDLE_MAX {
        return Err(Error::InvalidArgument("handle out of range"));
    }
    Ok(handle as u32)
}
