use crate::mem_sub_partition::{NUM_SECTORS, SECTOR_SIZE};
use crate::{address, mem_fetch};

/// Per-sector line state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    INVALID,
    RESERVED,
    VALID,
    MODIFIED,
}

/// A cache line with per-sector state.
///
/// Line caches use the same representation with every operation covering the
/// full sector mask.
#[derive(Debug, Clone)]
pub struct Line {
    tag: address,
    block_addr: address,
    status: [Status; NUM_SECTORS],
    alloc_cycle: u64,
    fill_cycle: u64,
    last_access_cycle: u64,
    /// A sector filled while this is set keeps its current state (the fill
    /// was superseded by a later write).
    ignore_on_fill: [bool; NUM_SECTORS],
    /// The arriving fill must land in MODIFIED state (write before fill).
    modified_on_fill: [bool; NUM_SECTORS],
    readable_on_fill: [bool; NUM_SECTORS],
    /// A sector is readable once it holds complete data.
    readable: [bool; NUM_SECTORS],
    dirty_byte_mask: mem_fetch::ByteMask,
}

impl Default for Line {
    fn default() -> Self {
        Self {
            tag: 0,
            block_addr: 0,
            status: [Status::INVALID; NUM_SECTORS],
            alloc_cycle: 0,
            fill_cycle: 0,
            last_access_cycle: 0,
            ignore_on_fill: [false; NUM_SECTORS],
            modified_on_fill: [false; NUM_SECTORS],
            readable_on_fill: [false; NUM_SECTORS],
            readable: [true; NUM_SECTORS],
            dirty_byte_mask: mem_fetch::ByteMask::ZERO,
        }
    }
}

impl std::fmt::Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Line(tag={}, status={:?})", self.tag, self.status)
    }
}

fn sectors(mask: &mem_fetch::SectorMask) -> impl Iterator<Item = usize> + '_ {
    (0..NUM_SECTORS).filter(|sector| mask[*sector])
}

impl Line {
    #[must_use]
    pub fn tag(&self) -> address {
        self.tag
    }

    #[must_use]
    pub fn block_addr(&self) -> address {
        self.block_addr
    }

    /// The combined state of the masked sectors.
    ///
    /// Any invalid sector makes the whole request a (sector) miss; any
    /// reserved one a pending hit.
    #[must_use]
    pub fn status(&self, mask: &mem_fetch::SectorMask) -> Status {
        let mut combined = Status::MODIFIED;
        let mut any = false;
        for sector in sectors(mask) {
            any = true;
            combined = combined.min(self.status[sector]);
        }
        if any {
            combined
        } else {
            Status::INVALID
        }
    }

    pub fn set_status(&mut self, status: Status, mask: &mem_fetch::SectorMask) {
        for sector in sectors(mask) {
            self.status[sector] = status;
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status.iter().any(|s| *s == Status::VALID)
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.status.iter().any(|s| *s == Status::MODIFIED)
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.status.iter().any(|s| *s == Status::RESERVED)
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.status.iter().all(|s| *s == Status::INVALID)
    }

    /// All masked sectors hold complete data.
    #[must_use]
    pub fn is_readable(&self, mask: &mem_fetch::SectorMask) -> bool {
        sectors(mask).all(|sector| {
            self.readable[sector]
                && matches!(self.status[sector], Status::VALID | Status::MODIFIED)
        })
    }

    pub fn set_readable(&mut self, readable: bool, mask: &mem_fetch::SectorMask) {
        for sector in sectors(mask) {
            self.readable[sector] = readable;
        }
    }

    pub fn set_readable_on_fill(&mut self, readable: bool, mask: &mem_fetch::SectorMask) {
        for sector in sectors(mask) {
            self.readable_on_fill[sector] = readable;
        }
    }

    pub fn set_ignore_on_fill(&mut self, ignore: bool, mask: &mem_fetch::SectorMask) {
        for sector in sectors(mask) {
            self.ignore_on_fill[sector] = ignore;
        }
    }

    pub fn set_modified_on_fill(&mut self, modified: bool, mask: &mem_fetch::SectorMask) {
        for sector in sectors(mask) {
            self.modified_on_fill[sector] = modified;
        }
    }

    /// Record written bytes.
    pub fn set_byte_mask(&mut self, byte_mask: &mem_fetch::ByteMask) {
        self.dirty_byte_mask |= *byte_mask;
    }

    #[must_use]
    pub fn dirty_byte_mask(&self) -> mem_fetch::ByteMask {
        self.dirty_byte_mask
    }

    /// Mask of MODIFIED sectors.
    #[must_use]
    pub fn dirty_sector_mask(&self) -> mem_fetch::SectorMask {
        let mut mask = mem_fetch::SectorMask::ZERO;
        for sector in 0..NUM_SECTORS {
            if self.status[sector] == Status::MODIFIED {
                mask.set(sector, true);
            }
        }
        mask
    }

    /// Bytes that must be written back when this line is evicted.
    #[must_use]
    pub fn modified_size(&self) -> u32 {
        self.dirty_sector_mask().count_ones() as u32 * SECTOR_SIZE
    }

    #[must_use]
    pub fn last_access_time(&self) -> u64 {
        self.last_access_cycle
    }

    pub fn set_last_access_time(&mut self, time: u64) {
        self.last_access_cycle = time;
    }

    #[must_use]
    pub fn alloc_time(&self) -> u64 {
        self.alloc_cycle
    }

    #[must_use]
    pub fn fill_time(&self) -> u64 {
        self.fill_cycle
    }

    /// Reserve the line for a miss: the whole line is reset and the masked
    /// sectors become RESERVED.
    pub fn allocate(
        &mut self,
        tag: address,
        block_addr: address,
        sector_mask: &mem_fetch::SectorMask,
        time: u64,
    ) {
        self.tag = tag;
        self.block_addr = block_addr;
        self.status = [Status::INVALID; NUM_SECTORS];
        self.ignore_on_fill = [false; NUM_SECTORS];
        self.modified_on_fill = [false; NUM_SECTORS];
        self.readable_on_fill = [false; NUM_SECTORS];
        self.readable = [true; NUM_SECTORS];
        self.dirty_byte_mask = mem_fetch::ByteMask::ZERO;
        self.alloc_cycle = time;
        self.last_access_cycle = time;
        self.fill_cycle = 0;
        self.set_status(Status::RESERVED, sector_mask);
    }

    /// Reserve further sectors of an already-resident line.
    pub fn allocate_sector(&mut self, sector_mask: &mem_fetch::SectorMask, time: u64) {
        debug_assert!(!self.is_invalid());
        for sector in sectors(sector_mask) {
            self.status[sector] = Status::RESERVED;
            self.ignore_on_fill[sector] = false;
            self.modified_on_fill[sector] = false;
            self.readable_on_fill[sector] = false;
            self.readable[sector] = true;
        }
        self.last_access_cycle = time;
    }

    /// Deliver fill data for the masked sectors.
    pub fn fill(
        &mut self,
        sector_mask: &mem_fetch::SectorMask,
        byte_mask: &mem_fetch::ByteMask,
        time: u64,
    ) {
        let mut fills_dirty = false;
        for sector in sectors(sector_mask) {
            if self.ignore_on_fill[sector] {
                continue;
            }
            self.status[sector] = if self.modified_on_fill[sector] {
                fills_dirty = true;
                Status::MODIFIED
            } else {
                Status::VALID
            };
            if self.readable_on_fill[sector] || !self.modified_on_fill[sector] {
                self.readable[sector] = true;
            }
        }
        // only a fill that completes an earlier write carries dirty bytes
        if fills_dirty {
            self.set_byte_mask(byte_mask);
        }
        self.fill_cycle = time;
    }
}

#[cfg(test)]
mod tests {
    use super::{Line, Status};
    use crate::mem_fetch::{ByteMask, SectorMask};

    fn sector(idx: usize) -> SectorMask {
        let mut mask = SectorMask::ZERO;
        mask.set(idx, true);
        mask
    }

    #[test]
    fn line_lifecycle() {
        let mut line = Line::default();
        assert!(line.is_invalid());

        line.allocate(0x80, 0x80, &sector(0), 10);
        assert!(line.is_reserved());
        assert_eq!(line.status(&sector(0)), Status::RESERVED);
        assert_eq!(line.alloc_time(), 10);

        line.fill(&sector(0), &ByteMask::ZERO, 20);
        assert_eq!(line.status(&sector(0)), Status::VALID);
        assert!(line.is_valid());
        assert!(!line.is_reserved());

        line.set_status(Status::MODIFIED, &sector(0));
        assert!(line.is_modified());
        assert_eq!(line.modified_size(), crate::mem_sub_partition::SECTOR_SIZE);
    }

    #[test]
    fn partial_sector_state_is_a_miss() {
        let mut line = Line::default();
        line.allocate(0x80, 0x80, &sector(0), 0);
        line.fill(&sector(0), &ByteMask::ZERO, 1);

        // sector 1 was never fetched
        let mut both = sector(0);
        both.set(1, true);
        assert_eq!(line.status(&both), Status::INVALID);
        assert_eq!(line.status(&sector(1)), Status::INVALID);
        assert_eq!(line.status(&sector(0)), Status::VALID);
    }
}
