use super::{address, cache, mem_fetch};
use cache::block::{Line, Status};

/// A dirty line displaced by an allocation, to be written back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictedBlockInfo {
    pub block_addr: address,
    pub modified_size: u32,
    pub byte_mask: mem_fetch::ByteMask,
    pub sector_mask: mem_fetch::SectorMask,
}

/// Outcome of a tag array access.
#[derive(Debug, PartialEq, Eq)]
pub struct AccessStatus {
    pub index: Option<usize>,
    pub writeback: bool,
    pub evicted: Option<EvictedBlockInfo>,
    pub status: cache::RequestStatus,
}

/// Set-associative tag store.
#[derive(Debug)]
pub struct TagArray {
    /// `num_sets x associativity` lines.
    pub lines: Vec<Line>,
    config: cache::Config,
    pub num_dirty: usize,
    num_access: u64,
    num_miss: u64,
    num_pending_hit: u64,
    num_reservation_fail: u64,
}

impl TagArray {
    #[must_use]
    pub fn new(config: cache::Config) -> Self {
        let lines = (0..config.total_lines()).map(|_| Line::default()).collect();
        Self {
            lines,
            config,
            num_dirty: 0,
            num_access: 0,
            num_miss: 0,
            num_pending_hit: 0,
            num_reservation_fail: 0,
        }
    }

    /// Probe the set for `block_addr`.
    ///
    /// Pure with respect to the array: no replacement state is touched. On a
    /// miss the returned index is the victim chosen by the replacement
    /// policy among non-reserved lines; if every line of the set is reserved
    /// the probe fails.
    #[must_use]
    pub fn probe(
        &self,
        block_addr: address,
        sector_mask: &mem_fetch::SectorMask,
        is_write: bool,
    ) -> (Option<usize>, cache::RequestStatus) {
        let set_index = self.config.set_index(block_addr) as usize;
        let tag = self.config.tag(block_addr);

        let mut invalid_line = None;
        let mut valid_line = None;
        let mut valid_time = u64::MAX;
        let mut all_reserved = true;

        // only evict clean lines until the dirty ratio exceeds the limit
        let dirty_line_percent = (self.num_dirty * 100) / self.config.total_lines().max(1);

        for way in 0..self.config.associativity {
            let idx = set_index * self.config.associativity + way;
            let line = &self.lines[idx];
            if line.tag() == tag {
                match line.status(sector_mask) {
                    Status::RESERVED => {
                        return (Some(idx), cache::RequestStatus::HIT_RESERVED);
                    }
                    Status::VALID => {
                        return (Some(idx), cache::RequestStatus::HIT);
                    }
                    Status::MODIFIED => {
                        let status = if is_write || line.is_readable(sector_mask) {
                            cache::RequestStatus::HIT
                        } else {
                            cache::RequestStatus::SECTOR_MISS
                        };
                        return (Some(idx), status);
                    }
                    Status::INVALID if line.is_valid() || line.is_modified() => {
                        return (Some(idx), cache::RequestStatus::SECTOR_MISS);
                    }
                    Status::INVALID => {}
                }
            }
            if !line.is_reserved() {
                if !line.is_modified()
                    || dirty_line_percent >= self.config.l1_cache_write_ratio_percent
                {
                    all_reserved = false;
                    if line.is_invalid() {
                        invalid_line = Some(idx);
                    } else {
                        // track the best replacement candidate
                        let candidate_time = match self.config.replacement_policy {
                            cache::config::ReplacementPolicy::LRU => line.last_access_time(),
                            cache::config::ReplacementPolicy::FIFO => line.alloc_time(),
                        };
                        if candidate_time < valid_time {
                            valid_time = candidate_time;
                            valid_line = Some(idx);
                        }
                    }
                }
            }
        }

        if all_reserved {
            // miss, and no space to allocate a line
            return (None, cache::RequestStatus::RESERVATION_FAIL);
        }

        let victim = match (invalid_line, valid_line) {
            (Some(invalid), _) => invalid,
            (None, Some(valid)) => valid,
            (None, None) => panic!("found neither a valid nor an invalid line"),
        };
        (Some(victim), cache::RequestStatus::MISS)
    }

    /// Access the tag array: update replacement state and allocate on miss
    /// under the allocate-on-miss policy.
    pub fn access(
        &mut self,
        block_addr: address,
        fetch: &mem_fetch::MemFetch,
        time: u64,
    ) -> AccessStatus {
        log::trace!("tag_array::access({fetch}, time={time})");
        self.num_access += 1;

        let sector_mask = self
            .config
            .access_sector_mask(&fetch.access.sector_mask, fetch.addr());

        let mut writeback = false;
        let mut evicted = None;

        let (index, status) = self.probe(block_addr, &sector_mask, fetch.is_write());
        match status {
            cache::RequestStatus::HIT | cache::RequestStatus::HIT_RESERVED => {
                if status == cache::RequestStatus::HIT_RESERVED {
                    self.num_pending_hit += 1;
                }
                let line = &mut self.lines[index.expect("hit has index")];
                line.set_last_access_time(time);
            }
            cache::RequestStatus::MISS => {
                self.num_miss += 1;
                let index = index.expect("miss has victim index");
                if self.config.allocate_policy == cache::config::AllocatePolicy::ON_MISS {
                    let line = &mut self.lines[index];
                    if line.is_modified() {
                        writeback = true;
                        evicted = Some(EvictedBlockInfo {
                            block_addr: line.block_addr(),
                            modified_size: line.modified_size(),
                            byte_mask: line.dirty_byte_mask(),
                            sector_mask: line.dirty_sector_mask(),
                        });
                        self.num_dirty -= 1;
                    }
                    line.allocate(
                        self.config.tag(block_addr),
                        self.config.block_addr(block_addr),
                        &sector_mask,
                        time,
                    );
                }
            }
            cache::RequestStatus::SECTOR_MISS => {
                debug_assert_eq!(self.config.kind, cache::config::Kind::Sector);
                self.num_miss += 1;
                let index = index.expect("sector miss has index");
                if self.config.allocate_policy == cache::config::AllocatePolicy::ON_MISS {
                    let line = &mut self.lines[index];
                    let was_modified = line.is_modified();
                    line.allocate_sector(&sector_mask, time);
                    if was_modified && !line.is_modified() {
                        self.num_dirty -= 1;
                    }
                }
            }
            cache::RequestStatus::RESERVATION_FAIL => {
                self.num_reservation_fail += 1;
            }
            cache::RequestStatus::MSHR_HIT => {
                panic!("tag_array access: MSHR_HIT cannot be returned here");
            }
        }
        AccessStatus {
            index,
            writeback,
            evicted,
            status,
        }
    }

    /// Fill the line reserved by an earlier allocate-on-miss access.
    pub fn fill_on_miss(
        &mut self,
        cache_index: usize,
        sector_mask: &mem_fetch::SectorMask,
        byte_mask: &mem_fetch::ByteMask,
        time: u64,
    ) {
        debug_assert_eq!(
            self.config.allocate_policy,
            cache::config::AllocatePolicy::ON_MISS
        );
        let line = &mut self.lines[cache_index];
        let was_modified = line.is_modified();
        line.fill(sector_mask, byte_mask, time);
        if line.is_modified() && !was_modified {
            self.num_dirty += 1;
        }
    }

    /// Allocate and fill in one step, under the allocate-on-fill policy.
    pub fn fill_on_fill(
        &mut self,
        addr: address,
        sector_mask: &mem_fetch::SectorMask,
        byte_mask: &mem_fetch::ByteMask,
        is_write: bool,
        time: u64,
    ) {
        let sector_mask = self.config.access_sector_mask(sector_mask, addr);
        let (index, status) = self.probe(self.config.block_addr(addr), &sector_mask, is_write);
        if status == cache::RequestStatus::RESERVATION_FAIL {
            return;
        }
        let index = index.expect("probe succeeded");
        let line = &mut self.lines[index];
        let mut was_modified = line.is_modified();

        match status {
            cache::RequestStatus::MISS => {
                line.allocate(
                    self.config.tag(addr),
                    self.config.block_addr(addr),
                    &sector_mask,
                    time,
                );
            }
            cache::RequestStatus::SECTOR_MISS => {
                debug_assert_eq!(self.config.kind, cache::config::Kind::Sector);
                line.allocate_sector(&sector_mask, time);
            }
            _ => {}
        }
        if was_modified && !line.is_modified() {
            self.num_dirty -= 1;
        }
        was_modified = line.is_modified();
        line.fill(&sector_mask, byte_mask, time);
        if line.is_modified() && !was_modified {
            self.num_dirty += 1;
        }
    }

    /// Insert a line as if it had been fetched, for modeling host-to-device
    /// copies warming the cache.
    pub fn populate_memcopy(
        &mut self,
        addr: address,
        sector_mask: &mem_fetch::SectorMask,
        time: u64,
    ) {
        self.fill_on_fill(addr, sector_mask, &mem_fetch::ByteMask::ZERO, false, time);
    }

    /// Invalidate dirty lines.
    ///
    /// Returns the number of flushed lines.
    pub fn flush(&mut self) -> usize {
        let mut flushed = 0;
        let all = !mem_fetch::SectorMask::ZERO;
        for line in &mut self.lines {
            if line.is_modified() {
                line.set_status(Status::INVALID, &all);
                flushed += 1;
            }
        }
        self.num_dirty = 0;
        flushed
    }

    /// Invalidate every line.
    pub fn invalidate(&mut self) {
        let all = !mem_fetch::SectorMask::ZERO;
        for line in &mut self.lines {
            line.set_status(Status::INVALID, &all);
        }
        self.num_dirty = 0;
    }

    #[must_use]
    pub fn get_block(&self, idx: usize) -> &Line {
        &self.lines[idx]
    }

    pub fn get_block_mut(&mut self, idx: usize) -> &mut Line {
        &mut self.lines[idx]
    }

    #[must_use]
    pub fn num_used_lines(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| line.is_valid() || line.is_modified())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::TagArray;
    use crate::{cache, mem_fetch, warp::ActiveMask};

    fn test_config() -> cache::Config {
        cache::Config {
            kind: cache::config::Kind::Normal,
            num_sets: 4,
            line_size: 128,
            associativity: 2,
            replacement_policy: cache::config::ReplacementPolicy::LRU,
            write_policy: cache::config::WritePolicy::WRITE_BACK,
            allocate_policy: cache::config::AllocatePolicy::ON_MISS,
            write_allocate_policy: cache::config::WriteAllocatePolicy::WRITE_ALLOCATE,
            mshr_entries: 16,
            mshr_max_merge: 8,
            miss_queue_size: 4,
            l1_cache_write_ratio_percent: 0,
            data_port_width: None,
        }
    }

    fn read_fetch(addr: crate::address) -> mem_fetch::MemFetch {
        let access = mem_fetch::access::Builder {
            kind: mem_fetch::access::Kind::GLOBAL_ACC_R,
            addr,
            req_size_bytes: 128,
            is_write: false,
            warp_active_mask: ActiveMask::ZERO,
            byte_mask: mem_fetch::ByteMask::ZERO,
            sector_mask: mem_fetch::SectorMask::ZERO,
        }
        .build();
        mem_fetch::Builder {
            uid: 0,
            access,
            instr: None,
            warp_id: 0,
            core_id: Some(0),
            cluster_id: Some(0),
            physical_addr: crate::mcu::PhysicalAddress::default(),
            partition_addr: addr,
        }
        .build()
    }

    #[test]
    fn probe_has_no_side_effects() {
        let config = test_config();
        let tags = TagArray::new(config.clone());
        let mask = config.access_sector_mask(&mem_fetch::SectorMask::ZERO, 0x80);
        let before = tags.probe(0x80, &mask, false);
        let after = tags.probe(0x80, &mask, false);
        assert_eq!(before, after);
        assert_eq!(before.1, cache::RequestStatus::MISS);
    }

    #[test]
    fn miss_allocates_then_fill_validates() {
        let config = test_config();
        let mut tags = TagArray::new(config.clone());
        let fetch = read_fetch(0x80);
        let mask = config.access_sector_mask(&mem_fetch::SectorMask::ZERO, 0x80);

        let result = tags.access(0x80, &fetch, 1);
        assert_eq!(result.status, cache::RequestStatus::MISS);
        let index = result.index.unwrap();

        // the reservation is visible as a pending hit
        let (_, status) = tags.probe(0x80, &mask, false);
        assert_eq!(status, cache::RequestStatus::HIT_RESERVED);

        tags.fill_on_miss(index, &mask, &mem_fetch::ByteMask::ZERO, 2);
        let (_, status) = tags.probe(0x80, &mask, false);
        assert_eq!(status, cache::RequestStatus::HIT);
    }

    #[test]
    fn all_reserved_fails_allocation() {
        let config = test_config();
        let mut tags = TagArray::new(config);
        // two ways per set: reserve both lines of set 0
        let set_stride = 128 * 4;
        tags.access(0x0, &read_fetch(0x0), 1);
        tags.access(set_stride, &read_fetch(set_stride), 1);

        let third = 2 * set_stride;
        let result = tags.access(third, &read_fetch(third), 2);
        assert_eq!(result.status, cache::RequestStatus::RESERVATION_FAIL);
        assert_eq!(result.index, None);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let config = test_config();
        let mut tags = TagArray::new(config.clone());
        let mask = config.access_sector_mask(&mem_fetch::SectorMask::ZERO, 0);
        let set_stride: u64 = 128 * 4;

        let a = tags.access(0, &read_fetch(0), 1);
        let b = tags.access(set_stride, &read_fetch(set_stride), 2);
        tags.fill_on_miss(a.index.unwrap(), &mask, &mem_fetch::ByteMask::ZERO, 3);
        tags.fill_on_miss(b.index.unwrap(), &mask, &mem_fetch::ByteMask::ZERO, 4);

        // touch `a` so that `b` becomes the least recently used line
        tags.access(0, &read_fetch(0), 5);

        let c = tags.access(2 * set_stride, &read_fetch(2 * set_stride), 6);
        assert_eq!(c.status, cache::RequestStatus::MISS);
        assert_eq!(c.index, b.index);
    }
}
