use crate::{
    address, cache, interconn as ic, mcu, mem_fetch, UidGenerator,
    mem_fetch::access::Kind as AccessKind,
};
use cache::config::{WriteAllocatePolicy, WritePolicy};
use std::collections::VecDeque;
use std::sync::Arc;

/// A read/write cache.
///
/// One parameterized implementation serves both the per-core L1D and the
/// per-sub-partition L2 slice; they differ only in configuration and in the
/// access kinds used for write-allocate reads and writebacks.
pub struct Data {
    pub inner: cache::base::Base,
    mem_controller: Arc<mcu::MemoryController>,
    fetch_uids: UidGenerator,
    /// Access kind of write-allocate read requests (L1 or L2).
    write_alloc_kind: AccessKind,
    /// Access kind of writeback requests (L1 or L2).
    write_back_kind: AccessKind,
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.inner, f)
    }
}

pub struct Builder {
    pub name: String,
    /// Core id or sub-partition id, depending on the level.
    pub id: usize,
    pub config: cache::Config,
    pub mem_controller: Arc<mcu::MemoryController>,
    pub fetch_uids: UidGenerator,
    pub write_alloc_kind: AccessKind,
    pub write_back_kind: AccessKind,
}

impl Builder {
    #[must_use]
    pub fn build(self) -> Data {
        Data {
            inner: cache::base::Base::new(self.name, self.id, self.config),
            mem_controller: self.mem_controller,
            fetch_uids: self.fetch_uids,
            write_alloc_kind: self.write_alloc_kind,
            write_back_kind: self.write_back_kind,
        }
    }
}

impl Data {
    /// Classify and service an access; see the per-policy handlers.
    ///
    /// A `RESERVATION_FAIL` leaves the cache untouched and the caller
    /// re-presents the access next cycle.
    pub fn access(
        &mut self,
        addr: address,
        fetch: mem_fetch::MemFetch,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> cache::RequestStatus {
        debug_assert_eq!(addr, fetch.addr());
        debug_assert!(
            fetch.access_kind().is_inst() || fetch.data_size() <= self.inner.config.atom_size()
        );

        let is_write = fetch.is_write();
        let access_kind: stats::cache::AccessKind = fetch.access_kind().into();
        let block_addr = self.inner.config.block_addr(addr);
        let sector_mask = self
            .inner
            .config
            .access_sector_mask(&fetch.access.sector_mask, addr);

        log::debug!(
            "{}::access({fetch}, write={is_write}, size={}, block={block_addr}, time={time})",
            self.inner.name,
            fetch.data_size(),
        );

        let (probe_index, probe_status) =
            self.inner.tag_array.probe(block_addr, &sector_mask, is_write);
        let data_size = fetch.data_size();

        let access_status = if is_write {
            match (probe_index, probe_status) {
                (Some(index), cache::RequestStatus::HIT) => {
                    self.write_hit(addr, index, &fetch, time, events)
                }
                (Some(index), status) if status != cache::RequestStatus::RESERVATION_FAIL => {
                    self.write_miss(addr, Some(index), fetch, time, events, status)
                }
                _ => {
                    // all lines in the set are reserved
                    self.inner.stats.inc(
                        access_kind,
                        cache::ReservationFailure::LINE_ALLOC_FAIL.into(),
                        1,
                    );
                    cache::RequestStatus::RESERVATION_FAIL
                }
            }
        } else {
            match (probe_index, probe_status) {
                (Some(_), cache::RequestStatus::HIT) => self.read_hit(addr, &fetch, time),
                (Some(index), status) if status != cache::RequestStatus::RESERVATION_FAIL => {
                    self.read_miss(addr, index, fetch, time, events, status)
                }
                _ => {
                    self.inner.stats.inc(
                        access_kind,
                        cache::ReservationFailure::LINE_ALLOC_FAIL.into(),
                        1,
                    );
                    cache::RequestStatus::RESERVATION_FAIL
                }
            }
        };

        self.inner.bandwidth.use_data_port(data_size);
        self.inner.stats.inc(
            access_kind,
            cache::select_status(probe_status, access_status).into(),
            1,
        );
        access_status
    }

    fn read_hit(
        &mut self,
        addr: address,
        fetch: &mem_fetch::MemFetch,
        time: u64,
    ) -> cache::RequestStatus {
        let block_addr = self.inner.config.block_addr(addr);
        let result = self.inner.tag_array.access(block_addr, fetch, time);
        let index = result.index.expect("read hit has cache index");

        // atomics perform their read-modify-write in the line
        if fetch.is_atomic() {
            let sector_mask = self
                .inner
                .config
                .access_sector_mask(&fetch.access.sector_mask, addr);
            let was_modified = self.inner.tag_array.get_block(index).is_modified();
            let block = self.inner.tag_array.get_block_mut(index);
            block.set_status(cache::block::Status::MODIFIED, &sector_mask);
            block.set_byte_mask(&fetch.access.byte_mask);
            if !was_modified {
                self.inner.tag_array.num_dirty += 1;
            }
        }
        cache::RequestStatus::HIT
    }

    /// Send a read request below and perform a writeback of the evicted line
    /// if necessary.
    fn read_miss(
        &mut self,
        addr: address,
        cache_index: usize,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        _probe_status: cache::RequestStatus,
    ) -> cache::RequestStatus {
        if !self.inner.miss_queue_can_fit(1) {
            let access_kind: stats::cache::AccessKind = fetch.access_kind().into();
            self.inner.stats.inc(
                access_kind,
                cache::ReservationFailure::MISS_QUEUE_FULL.into(),
                1,
            );
            return cache::RequestStatus::RESERVATION_FAIL;
        }

        let block_addr = self.inner.config.block_addr(addr);
        let source = (fetch.physical_addr, fetch.access.warp_active_mask);
        let (should_miss, writeback, evicted) = self.inner.send_read_request(
            block_addr,
            cache_index,
            fetch,
            time,
            events,
            false,
            false,
        );

        if !should_miss {
            return cache::RequestStatus::RESERVATION_FAIL;
        }
        if writeback && !self.inner.config.write_policy.is_write_through() {
            if let Some(evicted) = evicted {
                self.send_writeback(evicted, source, time, events);
            }
        }
        cache::RequestStatus::MISS
    }

    fn write_hit(
        &mut self,
        addr: address,
        cache_index: usize,
        fetch: &mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
    ) -> cache::RequestStatus {
        match self.inner.config.write_policy {
            WritePolicy::READ_ONLY => {
                panic!("write hit on read-only cache {}", self.inner.name)
            }
            WritePolicy::WRITE_BACK => self.write_hit_write_back(addr, cache_index, fetch, time),
            WritePolicy::WRITE_THROUGH => {
                self.write_hit_write_through(addr, cache_index, fetch, time, events)
            }
            WritePolicy::WRITE_EVICT => {
                self.write_hit_write_evict(cache_index, fetch, time, events)
            }
        }
    }

    /// Write-back hit: mark the block modified, no traffic below.
    fn write_hit_write_back(
        &mut self,
        addr: address,
        cache_index: usize,
        fetch: &mem_fetch::MemFetch,
        time: u64,
    ) -> cache::RequestStatus {
        let block_addr = self.inner.config.block_addr(addr);
        // update replacement state
        let result = self.inner.tag_array.access(block_addr, fetch, time);
        debug_assert_eq!(result.index, Some(cache_index));

        let sector_mask = self
            .inner
            .config
            .access_sector_mask(&fetch.access.sector_mask, addr);
        let was_modified = self.inner.tag_array.get_block(cache_index).is_modified();
        let block = self.inner.tag_array.get_block_mut(cache_index);
        block.set_status(cache::block::Status::MODIFIED, &sector_mask);
        block.set_byte_mask(&fetch.access.byte_mask);
        if !was_modified {
            self.inner.tag_array.num_dirty += 1;
        }
        self.update_readable(fetch, cache_index);
        cache::RequestStatus::HIT
    }

    /// Write-through hit: update the line and forward the write below.
    fn write_hit_write_through(
        &mut self,
        addr: address,
        cache_index: usize,
        fetch: &mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
    ) -> cache::RequestStatus {
        if self.inner.miss_queue_full() {
            let access_kind: stats::cache::AccessKind = fetch.access_kind().into();
            self.inner.stats.inc(
                access_kind,
                cache::ReservationFailure::MISS_QUEUE_FULL.into(),
                1,
            );
            return cache::RequestStatus::RESERVATION_FAIL;
        }
        let status = self.write_hit_write_back(addr, cache_index, fetch, time);
        self.send_write_request(fetch.clone(), cache::Event::WriteRequestSent, time, events);
        status
    }

    /// Write-evict hit: invalidate the block and forward the write below.
    fn write_hit_write_evict(
        &mut self,
        cache_index: usize,
        fetch: &mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
    ) -> cache::RequestStatus {
        if self.inner.miss_queue_full() {
            let access_kind: stats::cache::AccessKind = fetch.access_kind().into();
            self.inner.stats.inc(
                access_kind,
                cache::ReservationFailure::MISS_QUEUE_FULL.into(),
                1,
            );
            return cache::RequestStatus::RESERVATION_FAIL;
        }
        let sector_mask = self
            .inner
            .config
            .access_sector_mask(&fetch.access.sector_mask, fetch.addr());
        let block = self.inner.tag_array.get_block_mut(cache_index);
        block.set_status(cache::block::Status::INVALID, &sector_mask);
        self.send_write_request(fetch.clone(), cache::Event::WriteRequestSent, time, events);
        cache::RequestStatus::HIT
    }

    fn write_miss(
        &mut self,
        addr: address,
        cache_index: Option<usize>,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        probe_status: cache::RequestStatus,
    ) -> cache::RequestStatus {
        match self.inner.config.write_allocate_policy {
            WriteAllocatePolicy::NO_WRITE_ALLOCATE => {
                self.write_miss_no_write_allocate(fetch, time, events)
            }
            WriteAllocatePolicy::WRITE_ALLOCATE => {
                self.write_miss_write_allocate_naive(addr, cache_index, fetch, time, events)
            }
            WriteAllocatePolicy::FETCH_ON_WRITE => {
                self.write_miss_fetch_on_write(addr, cache_index, fetch, time, events)
            }
            WriteAllocatePolicy::LAZY_FETCH_ON_READ => {
                self.write_miss_lazy_fetch_on_read(addr, fetch, time, events, probe_status)
            }
        }
    }

    /// Write miss without allocation: forward the write below.
    fn write_miss_no_write_allocate(
        &mut self,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
    ) -> cache::RequestStatus {
        if self.inner.miss_queue_full() {
            let access_kind: stats::cache::AccessKind = fetch.access_kind().into();
            self.inner.stats.inc(
                access_kind,
                cache::ReservationFailure::MISS_QUEUE_FULL.into(),
                1,
            );
            return cache::RequestStatus::RESERVATION_FAIL;
        }
        self.send_write_request(fetch, cache::Event::WriteRequestSent, time, events);
        cache::RequestStatus::MISS
    }

    /// Naive write-allocate: send the write and a read for the line.
    ///
    /// Worst case three requests leave this cycle (write, allocate read,
    /// writeback of the evicted line), so capacity is checked conservatively.
    fn write_miss_write_allocate_naive(
        &mut self,
        addr: address,
        cache_index: Option<usize>,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
    ) -> cache::RequestStatus {
        debug_assert_eq!(addr, fetch.addr());
        let block_addr = self.inner.config.block_addr(addr);
        let mshr_addr = self.inner.config.mshr_addr(fetch.addr());

        let mshr_hit = self.inner.mshrs.probe(mshr_addr);
        let mshr_free = !self.inner.mshrs.full(mshr_addr);
        let queue_too_full = !self.inner.miss_queue_can_fit(2);
        let access_kind: stats::cache::AccessKind = fetch.access_kind().into();

        if queue_too_full || !(mshr_hit && mshr_free || !mshr_hit && mshr_free) {
            let failure = if queue_too_full {
                cache::ReservationFailure::MISS_QUEUE_FULL
            } else if mshr_hit && !mshr_free {
                cache::ReservationFailure::MSHR_MERGE_ENTRY_FAIL
            } else {
                cache::ReservationFailure::MSHR_ENTRY_FAIL
            };
            self.inner.stats.inc(access_kind, failure.into(), 1);
            return cache::RequestStatus::RESERVATION_FAIL;
        }

        self.send_write_request(fetch.clone(), cache::Event::WriteRequestSent, time, events);

        // now perform the read
        let new_access = mem_fetch::access::Builder {
            kind: self.write_alloc_kind,
            addr: fetch.addr(),
            req_size_bytes: self.inner.config.atom_size(),
            is_write: false,
            warp_active_mask: fetch.access.warp_active_mask,
            byte_mask: fetch.access.byte_mask,
            sector_mask: fetch.access.sector_mask,
        }
        .build();
        let physical_addr = self.mem_controller.decode(new_access.addr);
        let partition_addr = self.mem_controller.partition_address(new_access.addr);
        let new_fetch = mem_fetch::Builder {
            uid: self.fetch_uids.next_id(),
            access: new_access,
            instr: None,
            warp_id: fetch.warp_id,
            core_id: fetch.core_id,
            cluster_id: fetch.cluster_id,
            physical_addr,
            partition_addr,
        }
        .build();

        let Some(cache_index) = cache_index else {
            return cache::RequestStatus::RESERVATION_FAIL;
        };

        let source = (fetch.physical_addr, fetch.access.warp_active_mask);
        let (should_miss, writeback, evicted) = self.inner.send_read_request(
            block_addr,
            cache_index,
            new_fetch,
            time,
            events,
            false,
            true,
        );
        events.push(cache::Event::WriteAllocateSent);

        if should_miss {
            if writeback && !self.inner.config.write_policy.is_write_through() {
                if let Some(evicted) = evicted {
                    self.send_writeback(evicted, source, time, events);
                }
            }
            return cache::RequestStatus::MISS;
        }
        cache::RequestStatus::RESERVATION_FAIL
    }

    /// Fetch-on-write: reserve the line and fetch it, carrying the original
    /// write along so the data is merged once the fill arrives.
    ///
    /// A write covering the whole atom skips the fetch entirely.
    fn write_miss_fetch_on_write(
        &mut self,
        addr: address,
        cache_index: Option<usize>,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
    ) -> cache::RequestStatus {
        debug_assert_eq!(addr, fetch.addr());
        let block_addr = self.inner.config.block_addr(addr);
        let mshr_addr = self.inner.config.mshr_addr(fetch.addr());
        let access_kind: stats::cache::AccessKind = fetch.access_kind().into();

        if fetch.access.byte_mask.count_ones() == self.inner.config.atom_size() as usize {
            // the whole atom is written: no fetch needed
            if self.inner.miss_queue_full() {
                self.inner.stats.inc(
                    access_kind,
                    cache::ReservationFailure::MISS_QUEUE_FULL.into(),
                    1,
                );
                return cache::RequestStatus::RESERVATION_FAIL;
            }
            let result = self.inner.tag_array.access(block_addr, &fetch, time);
            debug_assert_ne!(result.status, cache::RequestStatus::RESERVATION_FAIL);
            let index = result.index.expect("allocated line");
            let sector_mask = self
                .inner
                .config
                .access_sector_mask(&fetch.access.sector_mask, addr);
            let was_modified = self.inner.tag_array.get_block(index).is_modified();
            let block = self.inner.tag_array.get_block_mut(index);
            block.set_status(cache::block::Status::MODIFIED, &sector_mask);
            block.set_ignore_on_fill(true, &sector_mask);
            block.set_byte_mask(&fetch.access.byte_mask);
            if !was_modified {
                self.inner.tag_array.num_dirty += 1;
            }
            let source = (fetch.physical_addr, fetch.access.warp_active_mask);
            if result.writeback && !self.inner.config.write_policy.is_write_through() {
                if let Some(evicted) = result.evicted {
                    self.send_writeback(evicted, source, time, events);
                }
            }
            return cache::RequestStatus::MISS;
        }

        // a read of the same block is already pending: merging a write into
        // it would return stale data
        if self.inner.mshrs.probe(mshr_addr) {
            self.inner.stats.inc(
                access_kind,
                cache::ReservationFailure::MSHR_RW_PENDING.into(),
                1,
            );
            return cache::RequestStatus::RESERVATION_FAIL;
        }
        if self.inner.mshrs.full(mshr_addr) || !self.inner.miss_queue_can_fit(2) {
            let failure = if self.inner.mshrs.full(mshr_addr) {
                cache::ReservationFailure::MSHR_ENTRY_FAIL
            } else {
                cache::ReservationFailure::MISS_QUEUE_FULL
            };
            self.inner.stats.inc(access_kind, failure.into(), 1);
            return cache::RequestStatus::RESERVATION_FAIL;
        }

        let Some(cache_index) = cache_index else {
            return cache::RequestStatus::RESERVATION_FAIL;
        };

        let new_access = mem_fetch::access::Builder {
            kind: self.write_alloc_kind,
            addr: fetch.addr(),
            req_size_bytes: self.inner.config.atom_size(),
            is_write: false,
            warp_active_mask: fetch.access.warp_active_mask,
            byte_mask: fetch.access.byte_mask,
            sector_mask: fetch.access.sector_mask,
        }
        .build();
        let physical_addr = self.mem_controller.decode(new_access.addr);
        let partition_addr = self.mem_controller.partition_address(new_access.addr);
        let mut new_fetch = mem_fetch::Builder {
            uid: self.fetch_uids.next_id(),
            access: new_access,
            instr: None,
            warp_id: fetch.warp_id,
            core_id: fetch.core_id,
            cluster_id: fetch.cluster_id,
            physical_addr,
            partition_addr,
        }
        .build();
        let source = (fetch.physical_addr, fetch.access.warp_active_mask);
        new_fetch.original_write_fetch = Some(Box::new(fetch));

        let (should_miss, writeback, evicted) = self.inner.send_read_request(
            block_addr,
            cache_index,
            new_fetch,
            time,
            events,
            false,
            true,
        );
        events.push(cache::Event::WriteAllocateSent);

        if should_miss {
            if writeback && !self.inner.config.write_policy.is_write_through() {
                if let Some(evicted) = evicted {
                    self.send_writeback(evicted, source, time, events);
                }
            }
            return cache::RequestStatus::MISS;
        }
        cache::RequestStatus::RESERVATION_FAIL
    }

    /// Lazy fetch on read: writes dirty the line immediately; the fetch is
    /// deferred until a read touches an incomplete sector.
    fn write_miss_lazy_fetch_on_read(
        &mut self,
        addr: address,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        _probe_status: cache::RequestStatus,
    ) -> cache::RequestStatus {
        let block_addr = self.inner.config.block_addr(addr);
        let access_kind: stats::cache::AccessKind = fetch.access_kind().into();

        if self.inner.miss_queue_full() {
            self.inner.stats.inc(
                access_kind,
                cache::ReservationFailure::MISS_QUEUE_FULL.into(),
                1,
            );
            return cache::RequestStatus::RESERVATION_FAIL;
        }

        if self.inner.config.write_policy.is_write_through() {
            self.send_write_request(fetch.clone(), cache::Event::WriteRequestSent, time, events);
        }

        let result = self.inner.tag_array.access(block_addr, &fetch, time);
        debug_assert_ne!(result.status, cache::RequestStatus::HIT);
        let index = result.index.expect("allocated line");
        let sector_mask = self
            .inner
            .config
            .access_sector_mask(&fetch.access.sector_mask, addr);

        let was_modified = self.inner.tag_array.get_block(index).is_modified();
        let block = self.inner.tag_array.get_block_mut(index);
        block.set_status(cache::block::Status::MODIFIED, &sector_mask);
        block.set_byte_mask(&fetch.access.byte_mask);
        if result.status == cache::RequestStatus::HIT_RESERVED {
            block.set_ignore_on_fill(true, &sector_mask);
            block.set_modified_on_fill(true, &sector_mask);
        }
        if fetch.access.byte_mask.count_ones() == self.inner.config.atom_size() as usize {
            block.set_readable(true, &sector_mask);
        } else {
            block.set_readable(false, &sector_mask);
            if result.status == cache::RequestStatus::HIT_RESERVED {
                block.set_readable_on_fill(true, &sector_mask);
            }
        }
        if !was_modified {
            self.inner.tag_array.num_dirty += 1;
        }
        self.update_readable(&fetch, index);

        if result.status != cache::RequestStatus::RESERVATION_FAIL {
            let source = (fetch.physical_addr, fetch.access.warp_active_mask);
            if result.writeback && !self.inner.config.write_policy.is_write_through() {
                if let Some(evicted) = result.evicted {
                    self.send_writeback(evicted, source, time, events);
                }
            }
            return cache::RequestStatus::MISS;
        }
        cache::RequestStatus::RESERVATION_FAIL
    }

    /// A sector with all bytes written becomes readable without a fetch.
    fn update_readable(&mut self, fetch: &mem_fetch::MemFetch, cache_index: usize) {
        use crate::mem_sub_partition::{NUM_SECTORS, SECTOR_SIZE};
        let sector_mask = self
            .inner
            .config
            .access_sector_mask(&fetch.access.sector_mask, fetch.addr());
        let block = self.inner.tag_array.get_block_mut(cache_index);
        for sector in 0..NUM_SECTORS {
            if !sector_mask[sector] {
                continue;
            }
            let dirty = block.dirty_byte_mask();
            let sector_bytes =
                &dirty[sector * SECTOR_SIZE as usize..(sector + 1) * SECTOR_SIZE as usize];
            if sector_bytes.all() {
                let mut mask = mem_fetch::SectorMask::ZERO;
                mask.set(sector, true);
                block.set_readable(true, &mask);
            }
        }
    }

    /// Queue a write or writeback towards the next level.
    fn send_write_request(
        &mut self,
        mut fetch: mem_fetch::MemFetch,
        event: cache::Event,
        time: u64,
        events: &mut Vec<cache::Event>,
    ) {
        log::debug!("{}::send_write_request({fetch})", self.inner.name);
        events.push(event);
        fetch.set_status(self.inner.miss_queue_status, time);
        self.inner.miss_queue.push_back(fetch);
    }

    /// Generate the writeback for an evicted dirty line.
    ///
    /// The evicted address may decode to a different chip under advanced
    /// partition hashing, so the destination is pinned to the evicting
    /// fetch's partition.
    fn send_writeback(
        &mut self,
        evicted: crate::tag_array::EvictedBlockInfo,
        source: (mcu::PhysicalAddress, crate::warp::ActiveMask),
        time: u64,
        events: &mut Vec<cache::Event>,
    ) {
        let (source_physical_addr, warp_active_mask) = source;
        let writeback_access = mem_fetch::access::Builder {
            kind: self.write_back_kind,
            addr: evicted.block_addr,
            req_size_bytes: evicted.modified_size,
            is_write: true,
            warp_active_mask,
            byte_mask: evicted.byte_mask,
            sector_mask: evicted.sector_mask,
        }
        .build();
        let mut physical_addr = self.mem_controller.decode(writeback_access.addr);
        physical_addr.chip = source_physical_addr.chip;
        physical_addr.sub_partition = source_physical_addr.sub_partition;
        let partition_addr = self.mem_controller.partition_address(writeback_access.addr);

        let writeback_fetch = mem_fetch::Builder {
            uid: self.fetch_uids.next_id(),
            access: writeback_access,
            instr: None,
            warp_id: 0,
            core_id: None,
            cluster_id: None,
            physical_addr,
            partition_addr,
        }
        .build();
        log::trace!(
            "{}: sending writeback {writeback_fetch}",
            self.inner.name
        );
        self.send_write_request(
            writeback_fetch,
            cache::Event::WriteBackRequestSent {
                evicted_block: Some(evicted),
            },
            time,
            events,
        );
    }

    /// Insert lines touched by a host-to-device copy.
    pub fn populate_memcopy(
        &mut self,
        addr: address,
        sector_mask: mem_fetch::SectorMask,
        time: u64,
    ) {
        self.inner.tag_array.populate_memcopy(addr, &sector_mask, time);
    }

    pub fn cycle(
        &mut self,
        mem_port: &mut dyn ic::Connection<ic::Packet<mem_fetch::MemFetch>>,
        time: u64,
    ) {
        self.inner.cycle(mem_port, time);
    }

    pub fn fill(&mut self, fetch: mem_fetch::MemFetch, time: u64) {
        self.inner.fill(fetch, time);
    }

    #[must_use]
    pub fn waiting_for_fill(&self, fetch: &mem_fetch::MemFetch) -> bool {
        self.inner.waiting_for_fill(fetch)
    }

    #[must_use]
    pub fn has_ready_accesses(&self) -> bool {
        self.inner.has_ready_accesses()
    }

    #[must_use]
    pub fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>> {
        self.inner.ready_accesses()
    }

    pub fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        self.inner.next_access()
    }

    #[must_use]
    pub fn write_allocate_policy(&self) -> WriteAllocatePolicy {
        self.inner.config.write_allocate_policy
    }

    #[must_use]
    pub fn has_free_data_port(&self) -> bool {
        self.inner.bandwidth.has_free_data_port()
    }

    #[must_use]
    pub fn has_free_fill_port(&self) -> bool {
        self.inner.bandwidth.has_free_fill_port()
    }

    pub fn flush(&mut self) -> usize {
        self.inner.flush()
    }

    pub fn invalidate(&mut self) {
        self.inner.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use crate::{cache, config, fifo::Fifo, interconn as ic, mem_fetch, warp::ActiveMask};
    use bitvec::array::BitArray;
    use bitvec::field::BitField;
    use color_eyre::eyre;
    use std::sync::Arc;

    fn l1_cache() -> eyre::Result<super::Data> {
        let config = config::GPU::default();
        let mem_controller = Arc::new(crate::mcu::MemoryController::new(&config)?);
        Ok(super::Builder {
            name: "test-l1d".to_string(),
            id: 0,
            config: (&config.data_cache_l1).into(),
            mem_controller,
            fetch_uids: crate::UidGenerator::new(),
            write_alloc_kind: mem_fetch::access::Kind::L1_WR_ALLOC_R,
            write_back_kind: mem_fetch::access::Kind::L1_WRBK_ACC,
        }
        .build())
    }

    fn sector_read(uid: u64, addr: crate::address) -> mem_fetch::MemFetch {
        let mut sector_mask = mem_fetch::SectorMask::ZERO;
        sector_mask.set(((addr % 128) / 32) as usize, true);
        let mut active_mask: ActiveMask = BitArray::ZERO;
        active_mask.store(u32::MAX);
        let access = mem_fetch::access::Builder {
            kind: mem_fetch::access::Kind::GLOBAL_ACC_R,
            addr,
            req_size_bytes: 32,
            is_write: false,
            warp_active_mask: active_mask,
            byte_mask: mem_fetch::ByteMask::ZERO,
            sector_mask,
        }
        .build();
        mem_fetch::Builder {
            uid,
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
    fn miss_then_fill_then_hit() -> eyre::Result<()> {
        let mut l1 = l1_cache()?;
        let mut events = Vec::new();
        let addr = 0x800;

        let status = l1.access(addr, sector_read(1, addr), &mut events, 1);
        assert_eq!(status, cache::RequestStatus::MISS);
        assert!(cache::was_read_sent(&events));

        // the miss leaves through the memory port
        let mut port: Fifo<ic::Packet<mem_fetch::MemFetch>> = Fifo::new(None);
        l1.cycle(&mut port, 2);
        let outgoing = port.dequeue().unwrap().fetch;
        assert_eq!(outgoing.addr(), addr);

        // same line misses into the mshr, no new request
        events.clear();
        let status = l1.access(addr, sector_read(2, addr), &mut events, 3);
        assert_eq!(status, cache::RequestStatus::MISS);
        l1.cycle(&mut port, 4);
        assert!(port.dequeue().is_none());

        // fill and drain both merged accesses
        l1.fill(outgoing, 5);
        assert!(l1.has_ready_accesses());
        assert_eq!(l1.next_access().unwrap().uid, 1);
        assert_eq!(l1.next_access().unwrap().uid, 2);

        events.clear();
        let status = l1.access(addr, sector_read(3, addr), &mut events, 6);
        assert_eq!(status, cache::RequestStatus::HIT);
        Ok(())
    }

    #[test]
    fn mshr_of_size_one_coalesces_same_line() -> eyre::Result<()> {
        let mut l1 = l1_cache()?;
        l1.inner.mshrs = crate::mshr::Table::new(1, 8);
        let mut events = Vec::new();
        let addr = 0x80;

        for uid in 0..4 {
            let status = l1.access(addr, sector_read(uid, addr), &mut events, 1);
            assert_eq!(status, cache::RequestStatus::MISS);
        }
        // exactly one outgoing miss
        let mut port: Fifo<ic::Packet<mem_fetch::MemFetch>> = Fifo::new(None);
        l1.cycle(&mut port, 2);
        let outgoing = port.dequeue().unwrap().fetch;
        assert!(port.dequeue().is_none());

        // and four response deliveries
        l1.fill(outgoing, 3);
        let mut delivered = 0;
        while l1.next_access().is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, 4);
        Ok(())
    }
}
