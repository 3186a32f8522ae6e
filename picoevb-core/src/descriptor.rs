// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware transfer descriptor

use bitflags::bitflags;

/// Largest length the 28-bit descriptor length field can carry, rounded down to a word
pub const DESC_LEN_MAX_WORD_ALIGNED: u64 = 0x0FFF_FFFC;

/// Descriptor size in bytes
pub const DESC_SIZE: usize = 32;

bitflags! {
    /// Descriptor control word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescControl: u32 {
        const STOP = 1 << 0;
        const COMPLETED = 1 << 1;
        const EOP = 1 << 4;
        const MAGIC = 0xAD4B << 16;
    }
}

/// Upper half of the control word must carry this value
pub const DESC_MAGIC_MASK: u32 = 0xFFFF << 16;

/// XDMA descriptor, exactly as the engine fetches it
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub control: u32,
    pub len: u32,
    pub src_lo: u32,
    pub src_hi: u32,
    pub dst_lo: u32,
    pub dst_hi: u32,
    pub next_lo: u32,
    pub next_hi: u32,
}

impl Descriptor {
    /// A stand-alone descriptor: stop after this one, raise completion, no next pointer
    pub fn single(src: u64, dst: u64, len: u32) -> Self {
        let control =
            DescControl::MAGIC | DescControl::EOP | DescControl::COMPLETED | DescControl::STOP;
        Self {
            control: control.bits(),
            len,
            src_lo: src as u32,
            src_hi: (src >> 32) as u32,
            dst_lo: dst as u32,
            dst_hi: (dst >> 32) as u32,
            next_lo: 0,
            next_hi: 0,
        }
    }

    pub fn src(&self) -> u64 {
        (u64::from(self.src_hi) << 32) | u64::from(self.src_lo)
    }

    pub fn dst(&self) -> u64 {
        (u64::from(self.dst_hi) << 32) | u64::from(self.dst_lo)
    }

    pub fn next(&self) -> u64 {
        (u64::from(self.next_hi) << 32) | u64::from(self.next_lo)
    }

    pub fn has_magic(&self) -> bool {
        self.control & DESC_MAGIC_MASK == DescControl::MAGIC.bits()
    }

    /// Little-endian image as laid out in descriptor memory
    pub fn to_bytes(&self) -> [u8; DESC_SIZE] {
        let words = [
            self.control,
            self.len,
            self.src_lo,
            self.src_hi,
            self.dst_lo,
            self.dst_hi,
            self.next_lo,
            self.next_hi,
        ];
        let mut bytes = [0u8; DESC_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8; DESC_SIZE]) -> Self {
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            control: words[0],
            len: words[1],
            src_lo: words[2],
            src_hi: words[3],
            dst_lo: words[4],
            dst_hi: words[5],
            next_lo: words[6],
            next_hi: words[7],
        }
    }
}

/// Coherent memory holding the engine's single descriptor slot
pub trait DescriptorMemory: Send + Sync {
    /// Bus address the engine fetches the descriptor from
    fn bus_addr(&self) -> u64;

    /// Store the descriptor; must be visible to the device after the next write barrier
    fn store(&self, desc: &Descriptor);
}
