// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Scatter-gather segment lists

use crate::error::{Error, Result};

/// A bus-address range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u64,
}

impl Segment {
    pub const fn new(addr: u64, len: u64) -> Self {
        Self { addr, len }
    }

    pub const fn end(&self) -> u64 {
        self.addr + self.len
    }
}

/// Ordered bus-address ranges describing one pinned buffer.
/// Adjacent ranges are merged as they are pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentList {
    segments: Vec<Segment>,
    total: u64,
}

impl SegmentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a range, extending the last segment when the two are contiguous
    pub fn push(&mut self, addr: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.total += len;
        if let Some(last) = self.segments.last_mut() {
            if last.end() == addr {
                last.len += len;
                return Ok(());
            }
        }
        self.segments.try_reserve(1)?;
        self.segments.push(Segment::new(addr, len));
        Ok(())
    }

    /// Sum of segment lengths
    pub fn total_len(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.segments.iter()
    }

    pub fn as_slice(&self) -> &[Segment] {
        &self.segments
    }

    pub fn cursor(&self) -> SegmentCursor<'_> {
        SegmentCursor {
            segments: &self.segments,
            index: 0,
            offset: 0,
        }
    }
}

impl<'a> IntoIterator for &'a SegmentList {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}

/// Walks a segment list handing out contiguous pieces
pub struct SegmentCursor<'a> {
    segments: &'a [Segment],
    index: usize,
    offset: u64,
}

impl SegmentCursor<'_> {
    /// Take up to `max` contiguous bytes. Fails if the list is exhausted.
    pub fn take(&mut self, max: u64) -> Result<Segment> {
        let seg = self
            .segments
            .get(self.index)
            .ok_or(Error::InvalidArgument("segment list exhausted"))?;
        let len = core::cmp::min(max, seg.len - self.offset);
        let piece = Segment::new(seg.addr + self.offset, len);

        self.offset += len;
        if self.offset == seg.len {
            self.index += 1;
            self.offset = 0;
        }
        Ok(piece)
    }

    /// Bytes left in the current segment
    pub fn remaining_in_segment(&self) -> u64 {
        self.segments
            .get(self.index)
            .map_or(0, |seg| seg.len - self.offset)
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_coalesces_adjacent() {
        let mut list = SegmentList::new();
        list.push(0x1000, 0x1000).unwrap();
        list.push(0x2000, 0x1000).unwrap();
        list.push(0x5000, 0x800).unwrap();
        list.push(0x5800, 0x800).unwrap();
        list.push(0x1000, 0x10).unwrap();

        assert_eq!(
            list.as_slice(),
            &[
                Segment::new(0x1000, 0x2000),
                Segment::new(0x5000, 0x1000),
                Segment::new(0x1000, 0x10),
            ]
        );
        assert_eq!(list.total_len(), 0x3010);
    }

    #[test]
    fn test_push_ignores_empty() {
        let mut list = SegmentList::new();
        list.push(0x1000, 0).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.total_len(), 0);
    }

    #[test]
    fn test_cursor_splits_and_advances() {
        let mut list = SegmentList::new();
        list.push(0x1000, 0x300).unwrap();
        list.push(0x8000, 0x100).unwrap();

        let mut cursor = list.cursor();
        assert_eq!(cursor.take(0x200).unwrap(), Segment::new(0x1000, 0x200));
        assert_eq!(cursor.remaining_in_segment(), 0x100);
        assert_eq!(cursor.take(0x200).unwrap(), Segment::new(0x1200, 0x100));
        assert_eq!(cursor.take(0x200).unwrap(), Segment::new(0x8000, 0x100));
        assert!(cursor.is_exhausted());
        assert_eq!(
            cursor.take(1),
            Err(Error::InvalidArgument("segment list exhausted"))
        );
    }
}
