// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Multi-chunk transfer sequencing
//!
//! Large transfers are split at segment boundaries, at the descriptor length
//! limit and, for buffer-to-buffer copies, at the staging RAM size. Each chunk
//! is one single-shot transfer (two for buffer-to-buffer, staged at RAM
//! offset 0). The first failing chunk ends the transfer; chunks already done
//! stay done.

use crate::completion::CancelToken;
use crate::descriptor::DESC_LEN_MAX_WORD_ALIGNED;
use crate::engine::EngineGuard;
use crate::error::{Error, Result};
use crate::segment::{SegmentCursor, SegmentList};

/// Outcome of a completed multi-chunk transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Chunks issued; one per pair for buffer-to-buffer copies
    pub chunks: u64,
    pub bytes: u64,
}

/// Length of the next chunk. `None` bounds do not apply.
pub fn chunk_len(src_left: Option<u64>, dst_left: Option<u64>, staging: Option<u64>, overall: u64) -> u64 {
    [src_left, dst_left, staging, Some(DESC_LEN_MAX_WORD_ALIGNED), Some(overall)]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(overall)
}

fn segment_left(cursor: &SegmentCursor<'_>) -> Result<u64> {
    match cursor.remaining_in_segment() {
        0 => Err(Error::InvalidArgument("segment list shorter than transfer")),
        left => Ok(left),
    }
}

/// Host to card: `len` bytes from `src` into staging RAM at `dst_offset`.
/// The caller has checked the offset range against the card capacity.
pub fn h2c(
    engine: &EngineGuard<'_>,
    src: &SegmentList,
    dst_offset: u64,
    len: u64,
    cancel: &CancelToken,
) -> Result<TransferReport> {
    let mut report = TransferReport::default();
    let mut src = src.cursor();
    let mut dst_offset = dst_offset;
    let mut remaining = len;

    while remaining > 0 {
        let chunk = chunk_len(Some(segment_left(&src)?), None, None, remaining);
        let piece = src.take(chunk)?;
        engine.h2c_single(piece.addr, dst_offset, chunk, cancel)?;

        remaining -= chunk;
        dst_offset += chunk;
        report.chunks += 1;
        report.bytes += chunk;
    }

    Ok(report)
}

/// Card to host: `len` bytes from staging RAM at `src_offset` into `dst`
pub fn c2h(
    engine: &EngineGuard<'_>,
    src_offset: u64,
    dst: &SegmentList,
    len: u64,
    cancel: &CancelToken,
) -> Result<TransferReport> {
    let mut report = TransferReport::default();
    let mut dst = dst.cursor();
    let mut src_offset = src_offset;
    let mut remaining = len;

    while remaining > 0 {
        let chunk = chunk_len(None, Some(segment_left(&dst)?), None, remaining);
        let piece = dst.take(chunk)?;
        engine.c2h_single(piece.addr, src_offset, chunk, cancel)?;

        remaining -= chunk;
        src_offset += chunk;
        report.chunks += 1;
        report.bytes += chunk;
    }

    Ok(report)
}

/// Buffer to buffer through staging RAM offset 0
pub fn h2c2h(
    engine: &EngineGuard<'_>,
    src: &SegmentList,
    dst: &SegmentList,
    len: u64,
    staging: u64,
    cancel: &CancelToken,
) -> Result<TransferReport> {
    let mut report = TransferReport::default();
    let mut src = src.cursor();
    let mut dst = dst.cursor();
    let mut remaining = len;

    while remaining > 0 {
        let chunk = chunk_len(
            Some(segment_left(&src)?),
            Some(segment_left(&dst)?),
            Some(staging),
            remaining,
        );
        let src_piece = src.take(chunk)?;
        let dst_piece = dst.take(chunk)?;

        engine.h2c_single(src_piece.addr, 0, chunk, cancel)?;
        engine.c2h_single(dst_piece.addr, 0, chunk, cancel)?;

        remaining -= chunk;
        report.chunks += 1;
        report.bytes += chunk;
    }

    Ok(report)
}
