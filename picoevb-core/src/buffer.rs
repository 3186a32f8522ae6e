// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Transfer operands

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::peer::PeerBuffer;
use crate::pin::{DmaDirection, HostBuffer, HostMemory};
use crate::segment::SegmentList;
use crate::session::Session;

/// Where a transfer operand lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Process virtual address
    Host(u64),
    /// Peer device memory handle returned by a pin request
    Device(u64),
}

impl Operand {
    pub fn new(value: u64, is_device: bool) -> Self {
        if is_device {
            Operand::Device(value)
        } else {
            Operand::Host(value)
        }
    }
}

/// A pinned, device-addressable transfer operand. Dropping it releases the
/// mapping and the pins.
pub enum DmaBuffer {
    Host(HostBuffer),
    Peer(PeerBuffer),
}

impl DmaBuffer {
    /// Pin `len` bytes of `operand` for a transfer in direction `dir`
    pub fn pin(
        operand: Operand,
        len: u64,
        dir: DmaDirection,
        host: &Arc<dyn HostMemory>,
        session: &Session,
    ) -> Result<Self> {
        match operand {
            Operand::Host(addr) => Ok(DmaBuffer::Host(HostBuffer::pin(
                Arc::clone(host),
                addr,
                len,
                dir,
            )?)),
            Operand::Device(handle) => {
                let peer = session
                    .peer_memory()
                    .ok_or(Error::InvalidArgument("no peer memory provider"))?;
                let region = session.lookup(handle)?;
                Ok(DmaBuffer::Peer(PeerBuffer::map(
                    region,
                    len,
                    dir,
                    peer.page_size(),
                )?))
            }
        }
    }

    pub fn segments(&self) -> &SegmentList {
        match self {
            DmaBuffer::Host(buf) => buf.segments(),
            DmaBuffer::Peer(buf) => buf.segments(),
        }
    }

    pub fn is_peer(&self) -> bool {
        matches!(self, DmaBuffer::Peer(_))
    }
}
