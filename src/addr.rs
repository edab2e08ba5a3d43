//! Address-home lookup and line segmentation.
//!
//! Every physical address belongs to exactly one home tile, determined by a
//! configured table of half-open ranges. Multi-byte accesses that cross a
//! line boundary are split into one segment per line; the segmentation
//! itself carries no atomicity guarantee across segments (only single lines
//! are coherent units).

use crate::config::SimConfig;
use crate::error::{SimError, Result};
use crate::message::TileId;

/// One line-aligned piece of a (possibly multi-line) memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Line-aligned base address this segment falls within.
    pub line_base: u64,
    /// Byte offset of the segment's start within the line.
    pub offset: usize,
    /// Number of bytes this segment covers.
    pub len: usize,
}

/// The address-home boundary table, plus the line size used to segment
/// accesses.
pub struct AddressMap {
    line_size: u64,
    boundaries: Vec<(u64, u64)>,
}

impl AddressMap {
    /// Build a map from a validated configuration. `config.boundaries` is
    /// assumed to already satisfy [`SimConfig::validate`]'s contiguity
    /// check: callers should validate the config before constructing a map.
    pub fn new(config: &SimConfig) -> Self {
        AddressMap {
            line_size: config.line_size as u64,
            boundaries: config
                .boundaries
                .iter()
                .map(|b| (b.base, b.limit))
                .collect(),
        }
    }

    pub fn line_size(&self) -> u64 {
        self.line_size
    }

    /// The line-aligned base address containing `addr`.
    pub fn line_base(&self, addr: u64) -> u64 {
        addr & !(self.line_size - 1)
    }

    /// The home tile for a line-aligned address. `addr` need not itself be
    /// aligned; only the line it falls in matters.
    pub fn home_of(&self, addr: u64) -> Result<TileId> {
        let line = self.line_base(addr);
        self.boundaries
            .iter()
            .position(|(base, limit)| line >= *base && line < *limit)
            .map(|idx| idx as TileId)
            .ok_or_else(|| {
                SimError::Configuration(format!(
                    "address 0x{line:016x} is not covered by any boundary entry"
                ))
            })
    }

    /// Split a `size`-byte access starting at `addr` into per-line segments,
    /// each no larger than one cache line.
    pub fn segment(&self, addr: u64, size: usize) -> Vec<Segment> {
        if size == 0 {
            return Vec::new();
        }
        let mut segments = Vec::new();
        let mut remaining = size;
        let mut cursor = addr;
        while remaining > 0 {
            let line_base = self.line_base(cursor);
            let offset = (cursor - line_base) as usize;
            let room_in_line = self.line_size as usize - offset;
            let take = room_in_line.min(remaining);
            segments.push(Segment {
                line_base,
                offset,
                len: take,
            });
            remaining -= take;
            cursor += take as u64;
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> AddressMap {
        AddressMap::new(&SimConfig::default_two_tile())
    }

    #[test]
    fn home_of_respects_boundaries() {
        let m = map();
        assert_eq!(m.home_of(0).unwrap(), 0);
        assert_eq!(m.home_of(0x0007_ffc0).unwrap(), 0);
        assert_eq!(m.home_of(0x0008_0000).unwrap(), 1);
        assert_eq!(m.home_of(0x000f_ffc0).unwrap(), 1);
    }

    #[test]
    fn home_of_rejects_out_of_range_address() {
        let m = map();
        assert!(m.home_of(0x0020_0000).is_err());
    }

    #[test]
    fn segment_within_one_line_is_a_single_segment() {
        let m = map();
        let segs = m.segment(4, 8);
        assert_eq!(segs, vec![Segment { line_base: 0, offset: 4, len: 8 }]);
    }

    #[test]
    fn segment_crossing_a_line_boundary_splits_in_two() {
        let m = map();
        let segs = m.segment(60, 8);
        assert_eq!(
            segs,
            vec![
                Segment { line_base: 0, offset: 60, len: 4 },
                Segment { line_base: 64, offset: 0, len: 4 },
            ]
        );
    }

    #[test]
    fn segment_spanning_many_lines() {
        let m = map();
        let segs = m.segment(0, 64 * 3 + 5);
        assert_eq!(segs.len(), 4);
        assert_eq!(segs.iter().map(|s| s.len).sum::<usize>(), 64 * 3 + 5);
    }
}
