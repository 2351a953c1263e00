use crate::{
    address, cache, interconn as ic, mem_fetch, mshr,
    tag_array::{self, TagArray},
};
use std::collections::{HashMap, VecDeque};

/// An access accepted by the cache that waits for a fill from below.
#[derive(Debug)]
struct PendingRequest {
    block_addr: address,
    addr: address,
    cache_index: usize,
    data_size: u32,
    /// A lower sectored level may split the request; the fill completes
    /// once every slice arrived.
    bytes_remaining: u32,
}

/// Common cache machinery: tag array, miss status holding registers and the
/// miss queue towards the next memory level.
///
/// The read-only and data caches differ only in their `access` logic.
pub struct Base {
    pub name: String,
    /// Core id or sub-partition id, depending on the cache level.
    pub id: usize,
    pub config: cache::Config,

    pub miss_queue: VecDeque<mem_fetch::MemFetch>,
    pub miss_queue_status: mem_fetch::Status,
    pub mshrs: mshr::Table,
    pub tag_array: TagArray,
    pub bandwidth: cache::bandwidth::Manager,

    pub stats: stats::cache::Cache,

    /// Outstanding misses by fetch uid.
    pending: HashMap<u64, PendingRequest>,
}

impl std::fmt::Debug for Base {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Base")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("miss_queue", &self.miss_queue.len())
            .finish()
    }
}

impl Base {
    #[must_use]
    pub fn new(name: String, id: usize, config: cache::Config) -> Self {
        let tag_array = TagArray::new(config.clone());
        let mshrs = mshr::Table::new(config.mshr_entries, config.mshr_max_merge);
        let bandwidth = cache::bandwidth::Manager::new(config.data_port_width());
        Self {
            name,
            id,
            miss_queue: VecDeque::new(),
            miss_queue_status: mem_fetch::Status::INITIALIZED,
            mshrs,
            tag_array,
            bandwidth,
            stats: stats::cache::Cache::default(),
            config,
            pending: HashMap::new(),
        }
    }

    /// Can `n` more misses be queued this cycle?
    #[must_use]
    pub fn miss_queue_can_fit(&self, n: usize) -> bool {
        self.miss_queue.len() + n <= self.config.miss_queue_size
    }

    #[must_use]
    pub fn miss_queue_full(&self) -> bool {
        self.miss_queue.len() >= self.config.miss_queue_size
    }

    /// Is this fetch waiting to be filled by a lower memory level?
    #[must_use]
    pub fn waiting_for_fill(&self, fetch: &mem_fetch::MemFetch) -> bool {
        self.pending.contains_key(&fetch.uid)
    }

    /// Accepted accesses whose fills have arrived and are ready to return.
    #[must_use]
    pub fn has_ready_accesses(&self) -> bool {
        self.mshrs.has_ready_accesses()
    }

    #[must_use]
    pub fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>> {
        self.mshrs.ready_accesses()
    }

    pub fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        self.mshrs.next_access()
    }

    pub fn flush(&mut self) -> usize {
        self.tag_array.flush()
    }

    pub fn invalidate(&mut self) {
        self.tag_array.invalidate();
    }

    /// Read miss handler: check for an MSHR merge or a free MSHR entry, then
    /// reserve the line and queue the outgoing miss.
    #[allow(clippy::too_many_arguments)]
    pub fn send_read_request(
        &mut self,
        block_addr: address,
        cache_index: usize,
        mut fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        read_only: bool,
        write_allocate: bool,
    ) -> (bool, bool, Option<tag_array::EvictedBlockInfo>) {
        let mut should_miss = false;
        let mut writeback = false;
        let mut evicted = None;

        let mshr_addr = self.config.mshr_addr(fetch.addr());
        let mshr_hit = self.mshrs.probe(mshr_addr);
        let mshr_full = self.mshrs.full(mshr_addr);
        let access_kind: stats::cache::AccessKind = fetch.access_kind().into();

        log::debug!(
            "{}::send_read_request({fetch}) (block={block_addr}, mshr_addr={mshr_addr}, mshr_hit={mshr_hit}, mshr_full={mshr_full}, miss_queue_full={})",
            self.name,
            self.miss_queue_full(),
        );

        if mshr_hit && !mshr_full {
            // merge with the outstanding miss for this block
            if read_only {
                self.tag_array.access(block_addr, &fetch, time);
            } else {
                let result = self.tag_array.access(block_addr, &fetch, time);
                writeback = result.writeback;
                evicted = result.evicted;
            }
            self.mshrs.add(mshr_addr, fetch);
            self.stats
                .inc(access_kind, cache::RequestStatus::MSHR_HIT.into(), 1);
            should_miss = true;
        } else if !mshr_hit && !mshr_full && !self.miss_queue_full() {
            let tag_array::AccessStatus {
                index,
                writeback: evicted_writeback,
                evicted: evicted_block,
                ..
            } = self.tag_array.access(block_addr, &fetch, time);
            if !read_only {
                writeback = evicted_writeback;
                evicted = evicted_block;
            }
            let cache_index = index.unwrap_or(cache_index);

            self.pending.insert(
                fetch.uid,
                PendingRequest {
                    block_addr: mshr_addr,
                    addr: fetch.addr(),
                    cache_index,
                    data_size: fetch.data_size(),
                    bytes_remaining: self.config.atom_size(),
                },
            );

            // the outgoing miss requests the whole cache atom
            fetch.access.req_size_bytes = self.config.atom_size();
            fetch.access.addr = mshr_addr;

            self.mshrs.add(mshr_addr, fetch.clone());
            fetch.set_status(self.miss_queue_status, time);
            self.miss_queue.push_back(fetch);
            if !write_allocate {
                events.push(cache::Event::ReadRequestSent);
            }
            should_miss = true;
        } else if mshr_hit && mshr_full {
            self.stats.inc(
                access_kind,
                cache::ReservationFailure::MSHR_MERGE_ENTRY_FAIL.into(),
                1,
            );
        } else if !mshr_hit && mshr_full {
            self.stats.inc(
                access_kind,
                cache::ReservationFailure::MSHR_ENTRY_FAIL.into(),
                1,
            );
        } else {
            self.stats.inc(
                access_kind,
                cache::ReservationFailure::MISS_QUEUE_FULL.into(),
                1,
            );
        }
        (should_miss, writeback, evicted)
    }

    /// Drain the head of the miss queue into the memory port.
    pub fn cycle(
        &mut self,
        mem_port: &mut dyn ic::Connection<ic::Packet<mem_fetch::MemFetch>>,
        time: u64,
    ) {
        if let Some(fetch) = self.miss_queue.front() {
            if mem_port.can_send(&[fetch.packet_size()]) {
                let fetch = self.miss_queue.pop_front().unwrap();
                log::debug!(
                    "{}::memport::push({}, data size={}, control size={})",
                    self.name,
                    fetch.addr(),
                    fetch.data_size(),
                    fetch.control_size(),
                );
                mem_port.send(ic::Packet { fetch, time });
            }
        }
        self.bandwidth.replenish_port_bandwidth();
    }

    /// Is this fetch (or the original request it was split from) waiting
    /// here?
    #[must_use]
    pub fn waiting_for_any_fill(&self, fetch: &mem_fetch::MemFetch) -> bool {
        self.pending.contains_key(&fetch.uid)
            || fetch
                .original_fetch
                .as_ref()
                .is_some_and(|original| self.pending.contains_key(&original.uid))
    }

    /// Accept a fill response from the lower memory level.
    ///
    /// When a sectored lower level split the request, each slice counts
    /// towards the original; the line fills once all bytes arrived.
    pub fn fill(&mut self, mut fetch: mem_fetch::MemFetch, time: u64) {
        let key = if self.pending.contains_key(&fetch.uid) {
            fetch.uid
        } else {
            // a slice of a split request: attribute it to the original
            let original = fetch
                .original_fetch
                .as_ref()
                .expect("fill for fetch that was never sent");
            original.uid
        };
        {
            let pending = self.pending.get_mut(&key).unwrap();
            pending.bytes_remaining = pending.bytes_remaining.saturating_sub(fetch.data_size());
            if pending.bytes_remaining > 0 {
                return;
            }
        }

        let pending = self.pending.remove(&key).unwrap();
        self.bandwidth.use_fill_port(fetch.data_size());

        fetch.access.req_size_bytes = pending.data_size;
        fetch.access.addr = pending.addr;

        let sector_mask = self
            .config
            .access_sector_mask(&fetch.access.sector_mask, fetch.addr());

        match self.config.allocate_policy {
            cache::config::AllocatePolicy::ON_MISS => {
                self.tag_array.fill_on_miss(
                    pending.cache_index,
                    &sector_mask,
                    &fetch.access.byte_mask,
                    time,
                );
            }
            cache::config::AllocatePolicy::ON_FILL => {
                self.tag_array.fill_on_fill(
                    pending.block_addr,
                    &fetch.access.sector_mask,
                    &fetch.access.byte_mask,
                    fetch.is_write(),
                    time,
                );
            }
        }

        let byte_mask = fetch.access.byte_mask;
        let is_atomic = fetch.is_atomic();
        let original_write = fetch.original_write_fetch.is_some();

        let has_atomic = self.mshrs.mark_ready(pending.block_addr).unwrap_or(false);

        if (has_atomic && is_atomic) || original_write {
            // atomics and fetch-on-write dirty the line right after the fill
            debug_assert_eq!(
                self.config.allocate_policy,
                cache::config::AllocatePolicy::ON_MISS
            );
            let was_modified = self.tag_array.get_block(pending.cache_index).is_modified();
            let block = self.tag_array.get_block_mut(pending.cache_index);
            block.set_status(cache::block::Status::MODIFIED, &sector_mask);
            block.set_byte_mask(&byte_mask);
            if !was_modified {
                self.tag_array.num_dirty += 1;
            }
        }
    }
}
