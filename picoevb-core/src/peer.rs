// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Peer device memory (GPU memory exposed for peer-to-peer DMA)
//!
//! A region is pinned once through [`PeerMemory::get_pages`] and referenced
//! by handle afterwards. Each transfer maps the pinned pages for the card and
//! walks the mapping like a host scatter list.

use std::sync::Arc;

use log::trace;

use crate::error::{Error, Result};
use crate::pin::DmaDirection;
use crate::segment::SegmentList;
use crate::session::PinnedRegion;

/// Page size of discrete GPUs
pub const GPU_PAGE_SHIFT_DGPU: u32 = 16;
/// Page size of integrated GPUs sharing system memory
pub const GPU_PAGE_SHIFT_IGPU: u32 = 12;

/// Called by the provider when it reclaims a region behind the driver's back
pub type RevokeHook = Box<dyn FnOnce() + Send>;

/// Provider of pinnable peer device memory
pub trait PeerMemory: Send + Sync {
    /// Pin granularity
    fn page_size(&self) -> u64;

    /// Pin the page-aligned range `[va, va + len)`. `on_revoke` runs at most
    /// once if the provider later reclaims the memory.
    fn get_pages(&self, va: u64, len: u64, on_revoke: RevokeHook) -> Result<Box<dyn PeerPages>>;
}

/// Pages pinned by a [`PeerMemory`] provider
pub trait PeerPages: Send + Sync {
    /// Map the pages for access by the card
    fn dma_map(&self, dir: DmaDirection) -> Result<Box<dyn PeerDmaMap>>;

    /// Hand the pages back to the provider after an explicit unpin
    fn put(self: Box<Self>);

    /// Free bookkeeping for pages the provider has already reclaimed
    fn free(self: Box<Self>);
}

/// A live device mapping of peer pages; unmapped on drop
pub trait PeerDmaMap: Send {
    /// Bus address of each page, in order
    fn entries(&self) -> &[u64];
}

/// Split a virtual address into its page-aligned base and sub-page offset,
/// and compute the page-rounded length covering `size` bytes
pub fn align_region(va: u64, size: u64, page_size: u64) -> Result<(u64, u64, u64)> {
    let offset = va & (page_size - 1);
    let base = va - offset;
    let aligned_len = offset
        .checked_add(size)
        .and_then(|end| end.checked_next_multiple_of(page_size))
        .ok_or(Error::InvalidArgument("region size overflows"))?;
    Ok((base, offset, aligned_len))
}

/// Build the segment list for `len` bytes of a region whose data starts
/// `offset` bytes into the first mapped page
fn walk_entries(entries: &[u64], page_size: u64, offset: u64, len: u64) -> Result<SegmentList> {
    let mut segments = SegmentList::new();
    let mut offset = offset;
    let mut left = len;
    for &bus in entries {
        if left == 0 {
            break;
        }
        let this = core::cmp::min(page_size - offset, left);
        segments.push(bus + offset, this)?;
        left -= this;
        offset = 0;
    }
    Ok(segments)
}

/// A pinned peer region mapped for one transfer
pub struct PeerBuffer {
    region: Arc<PinnedRegion>,
    // Unmapped before the region reference goes away
    map: Option<Box<dyn PeerDmaMap>>,
    segments: SegmentList,
}

impl PeerBuffer {
    /// Map `len` bytes of `region`, rejecting lengths beyond the region
    pub fn map(region: Arc<PinnedRegion>, len: u64, dir: DmaDirection, page_size: u64) -> Result<Self> {
        if len > region.len() {
            return Err(Error::InvalidArgument("length exceeds pinned region"));
        }

        let map = region.dma_map(dir)?;
        let segments = walk_entries(map.entries(), page_size, region.offset(), len)?;
        trace!(
            "mapped peer region 0x{:x}+0x{:x}: {} segments",
            region.va(),
            len,
            segments.len()
        );

        Ok(PeerBuffer {
            region,
            map: Some(map),
            segments,
        })
    }

    pub fn segments(&self) -> &SegmentList {
        &self.segments
    }

    pub fn region(&self) -> &Arc<PinnedRegion> {
        &self.region
    }
}

impl Drop for PeerBuffer {
    fn drop(&mut self) {
        drop(self.map.take());
    }
}
