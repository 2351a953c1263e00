use crate::{
    address, cache, config, fifo::Fifo, interconn::Packet, mcu, mem_fetch, UidGenerator,
};
use mem_fetch::access::Kind as AccessKind;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Largest single memory access in bytes (one cache line).
pub const MAX_MEMORY_ACCESS_SIZE: u32 = 128;

/// Sectors per line.
pub const NUM_SECTORS: usize = 4;

/// Sector width in bytes.
pub const SECTOR_SIZE: u32 = 32;

/// One L2 slice together with the queues that connect it to the
/// interconnect on one side and the DRAM channel on the other.
pub struct MemorySubPartition {
    /// Global sub partition id.
    pub id: usize,
    pub partition_id: usize,
    pub config: Arc<config::GPU>,
    mem_controller: Arc<mcu::MemoryController>,
    fetch_uids: UidGenerator,

    pub interconn_to_l2_queue: Fifo<Packet<mem_fetch::MemFetch>>,
    pub l2_to_dram_queue: Fifo<Packet<mem_fetch::MemFetch>>,
    pub dram_to_l2_queue: Fifo<Packet<mem_fetch::MemFetch>>,
    /// L2 hit and reply queue towards the interconnect.
    pub l2_to_interconn_queue: Fifo<Packet<mem_fetch::MemFetch>>,
    /// Fixed-delay queue modeling the raster-ops stage in front of the L2.
    pub rop_queue: VecDeque<(u64, mem_fetch::MemFetch)>,

    pub l2_cache: cache::Data,

    /// Uids of requests inside this sub partition.
    request_tracker: HashSet<u64>,
}

impl std::fmt::Debug for MemorySubPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemorySubPartition")
            .field("id", &self.id)
            .finish()
    }
}

impl MemorySubPartition {
    pub fn new(
        id: usize,
        partition_id: usize,
        config: Arc<config::GPU>,
        mem_controller: Arc<mcu::MemoryController>,
        fetch_uids: UidGenerator,
    ) -> Self {
        let l2_cache = cache::data::Builder {
            name: format!("sub-{id}-L2"),
            id,
            config: (&config.data_cache_l2).into(),
            mem_controller: Arc::clone(&mem_controller),
            fetch_uids: fetch_uids.clone(),
            write_alloc_kind: AccessKind::L2_WR_ALLOC_R,
            write_back_kind: AccessKind::L2_WRBK_ACC,
        }
        .build();

        Self {
            id,
            partition_id,
            interconn_to_l2_queue: Fifo::new(Some(config.dram_partition_queue_interconn_to_l2)),
            l2_to_dram_queue: Fifo::new(Some(config.dram_partition_queue_l2_to_dram)),
            dram_to_l2_queue: Fifo::new(Some(config.dram_partition_queue_dram_to_l2)),
            l2_to_interconn_queue: Fifo::new(Some(config.dram_partition_queue_l2_to_interconn)),
            rop_queue: VecDeque::new(),
            l2_cache,
            request_tracker: HashSet::new(),
            config,
            mem_controller,
            fetch_uids,
        }
    }

    /// Would accepting a request that may split into `n` sector requests
    /// overflow the input queue?
    #[must_use]
    pub fn full(&self, n: usize) -> bool {
        !self.interconn_to_l2_queue.can_fit(n)
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        !self.request_tracker.is_empty()
    }

    /// Split an oversize request into 32B sector requests that point back at
    /// the original fetch.
    fn breakdown_request_to_sector_requests(
        &self,
        fetch: mem_fetch::MemFetch,
    ) -> Vec<mem_fetch::MemFetch> {
        let sector_size = SECTOR_SIZE as usize;
        let mut sector_requests = Vec::new();

        let make_sector_fetch = |sector: usize, addr: address, original: &mem_fetch::MemFetch| {
            let mut sector_mask = mem_fetch::SectorMask::ZERO;
            sector_mask.set(sector, true);
            let mut byte_mask = mem_fetch::ByteMask::ZERO;
            byte_mask[sector * sector_size..(sector + 1) * sector_size].fill(true);

            let access = mem_fetch::access::MemAccess {
                addr,
                req_size_bytes: SECTOR_SIZE,
                byte_mask: original.access.byte_mask & byte_mask,
                sector_mask,
                ..original.access.clone()
            };
            let physical_addr = self.mem_controller.decode(addr);
            let partition_addr = self.mem_controller.partition_address(addr);
            mem_fetch::MemFetch {
                uid: self.fetch_uids.next_id(),
                original_fetch: Some(Box::new(original.clone())),
                access,
                physical_addr,
                partition_addr,
                ..original.clone()
            }
        };

        if fetch.data_size() == SECTOR_SIZE && fetch.access.sector_mask.count_ones() == 1 {
            sector_requests.push(fetch);
        } else if fetch.data_size() == MAX_MEMORY_ACCESS_SIZE {
            // whole line: every sector
            for sector in 0..NUM_SECTORS {
                let addr = fetch.addr() + (sector_size * sector) as u64;
                sector_requests.push(make_sector_fetch(sector, addr, &fetch));
            }
        } else if fetch.data_size() == 64
            && (fetch.access.sector_mask.all() || fetch.access.sector_mask.not_any())
        {
            // a 64B request covers the lower or upper half of the line
            let start = if fetch.addr() % u64::from(MAX_MEMORY_ACCESS_SIZE) == 0 {
                0
            } else {
                2
            };
            for sector in start..start + 2 {
                let addr = fetch.addr() + (sector_size * (sector - start)) as u64;
                sector_requests.push(make_sector_fetch(sector, addr, &fetch));
            }
        } else {
            // arbitrary masks: one request per marked sector
            for sector in 0..NUM_SECTORS {
                if fetch.access.sector_mask[sector] {
                    let addr = fetch.addr() + (sector_size * sector) as u64;
                    sector_requests.push(make_sector_fetch(sector, addr, &fetch));
                }
            }
        }
        debug_assert!(!sector_requests.is_empty(), "no sector requests generated");
        sector_requests
    }

    /// Accept a request ejected from the interconnect.
    ///
    /// Non-texture requests pass through the ROP delay first.
    pub fn push(&mut self, fetch: mem_fetch::MemFetch, time: u64) {
        let mut requests = Vec::new();
        if self.config.data_cache_l2.kind == cache::config::Kind::Sector {
            requests.extend(self.breakdown_request_to_sector_requests(fetch));
        } else {
            requests.push(fetch);
        }

        for mut fetch in requests {
            self.request_tracker.insert(fetch.uid);
            assert!(!self.interconn_to_l2_queue.full());

            if fetch.is_texture() {
                fetch.set_status(mem_fetch::Status::IN_PARTITION_ICNT_TO_L2_QUEUE, time);
                self.interconn_to_l2_queue.enqueue(Packet { fetch, time });
            } else {
                let ready_cycle = time + self.config.rop_latency;
                fetch.set_status(mem_fetch::Status::IN_PARTITION_ROP_DELAY, time);
                log::trace!("{}: {fetch}", console::style("PUSH TO ROP").red());
                self.rop_queue.push_back((ready_cycle, fetch));
            }
        }
    }

    /// The next reply towards the interconnect, skipping writebacks which
    /// terminate here.
    pub fn top(&mut self) -> Option<&mem_fetch::MemFetch> {
        while let Some(packet) = self.l2_to_interconn_queue.first() {
            if packet.fetch.access_kind().is_writeback() {
                let packet = self.l2_to_interconn_queue.dequeue().unwrap();
                self.request_tracker.remove(&packet.fetch.uid);
                continue;
            }
            break;
        }
        self.l2_to_interconn_queue.first().map(|packet| &packet.fetch)
    }

    pub fn pop(&mut self) -> Option<mem_fetch::MemFetch> {
        let fetch = self.l2_to_interconn_queue.dequeue()?.fetch;
        self.request_tracker.remove(&fetch.uid);
        debug_assert!(!fetch.access_kind().is_writeback());
        Some(fetch)
    }

    pub fn set_done(&mut self, uid: u64) {
        self.request_tracker.remove(&uid);
    }

    pub fn flush_l2(&mut self) -> usize {
        self.l2_cache.flush()
    }

    pub fn invalidate_l2(&mut self) {
        self.l2_cache.invalidate();
    }

    /// Warm an L2 sector for a host-to-device copy.
    pub fn force_l2_tag_update(
        &mut self,
        addr: address,
        sector_mask: mem_fetch::SectorMask,
        time: u64,
    ) {
        self.l2_cache.populate_memcopy(addr, sector_mask, time);
    }

    /// One L2-side cycle, in the §fixed order: drain L2 replies, drain DRAM
    /// returns, advance the L2 miss queue, service a new access, pop the ROP
    /// delay queue.
    pub fn cache_cycle(&mut self, cycle: u64) {
        use cache::config::WriteAllocatePolicy;
        use mem_fetch::Status;

        // L2 fills that completed return towards the cores
        if self.l2_cache.has_ready_accesses() && !self.l2_to_interconn_queue.full() {
            let mut fetch = self.l2_cache.next_access().unwrap();

            // write-allocate reads are not passed back up
            if fetch.access_kind() != AccessKind::L2_WR_ALLOC_R {
                fetch.set_reply();
                fetch.reply_cycle = Some(cycle);
                fetch.set_status(Status::IN_PARTITION_L2_TO_ICNT_QUEUE, cycle);
                self.l2_to_interconn_queue.enqueue(Packet { fetch, time: cycle });
            } else if self.config.data_cache_l2.write_allocate_policy
                == WriteAllocatePolicy::FETCH_ON_WRITE
            {
                // acknowledge the original write whose data arrived
                let mut original = *fetch.original_write_fetch.take().expect("original write");
                self.request_tracker.remove(&fetch.uid);
                original.set_reply();
                original.reply_cycle = Some(cycle);
                original.set_status(Status::IN_PARTITION_L2_TO_ICNT_QUEUE, cycle);
                self.l2_to_interconn_queue.enqueue(Packet {
                    fetch: original,
                    time: cycle,
                });
            } else {
                self.request_tracker.remove(&fetch.uid);
            }
        }

        // DRAM returns fill the L2 or pass through as acknowledgements
        if let Some(packet) = self.dram_to_l2_queue.first() {
            if self.l2_cache.waiting_for_fill(&packet.fetch) {
                if self.l2_cache.has_free_fill_port() {
                    let mut reply = self.dram_to_l2_queue.dequeue().unwrap().fetch;
                    log::debug!("sub partition {}: filling L2 with {reply}", self.id);
                    reply.set_status(Status::IN_PARTITION_L2_FILL_QUEUE, cycle);
                    self.l2_cache.fill(reply, cycle);
                }
            } else if !self.l2_to_interconn_queue.full() {
                let mut reply = self.dram_to_l2_queue.dequeue().unwrap();
                debug_assert!(reply.fetch.is_reply() || reply.fetch.access_kind().is_writeback());
                reply
                    .fetch
                    .set_status(Status::IN_PARTITION_L2_TO_ICNT_QUEUE, cycle);
                self.l2_to_interconn_queue.enqueue(reply);
            }
        }

        // prior L2 misses move into the DRAM queue
        let MemorySubPartition {
            ref mut l2_cache,
            ref mut l2_to_dram_queue,
            ..
        } = *self;
        l2_cache.cycle(l2_to_dram_queue, cycle);

        // service a new access from the interconnect side
        if !self.l2_to_dram_queue.full() {
            if let Some(packet) = self.interconn_to_l2_queue.first() {
                let fetch = &packet.fetch;
                if !self.config.data_cache_l2_texture_only || fetch.is_texture() {
                    let output_full = self.l2_to_interconn_queue.full();
                    let port_free = self.l2_cache.has_free_data_port();
                    if !output_full && port_free {
                        let mut events = Vec::new();
                        let status = self.l2_cache.access(
                            fetch.addr(),
                            fetch.clone(),
                            &mut events,
                            cycle,
                        );
                        let write_sent = cache::was_write_sent(&events);
                        let read_sent = cache::was_read_sent(&events);
                        log::debug!(
                            "sub partition {}: L2 access {fetch} => {status:?}",
                            self.id
                        );

                        if status == cache::RequestStatus::HIT {
                            let mut packet = self.interconn_to_l2_queue.dequeue().unwrap();
                            if !write_sent {
                                // the L2 absorbed the access and replies
                                debug_assert!(!read_sent || packet.fetch.is_write());
                                if packet.fetch.access_kind().is_writeback() {
                                    self.request_tracker.remove(&packet.fetch.uid);
                                } else {
                                    packet.fetch.set_reply();
                                    packet.fetch.reply_cycle = Some(cycle);
                                    packet
                                        .fetch
                                        .set_status(Status::IN_PARTITION_L2_TO_ICNT_QUEUE, cycle);
                                    self.l2_to_interconn_queue.enqueue(packet);
                                }
                            }
                        } else if status != cache::RequestStatus::RESERVATION_FAIL {
                            // the L2 accepted the request
                            let mut packet = self.interconn_to_l2_queue.dequeue().unwrap();
                            let should_fetch = matches!(
                                self.l2_cache.write_allocate_policy(),
                                WriteAllocatePolicy::FETCH_ON_WRITE
                                    | WriteAllocatePolicy::LAZY_FETCH_ON_READ
                            );
                            let absorbed_write = packet.fetch.is_write()
                                && (!should_fetch || status == cache::RequestStatus::MISS)
                                && !cache::was_writeallocate_sent(&events)
                                && !write_sent;
                            if absorbed_write {
                                if packet.fetch.access_kind().is_writeback() {
                                    self.request_tracker.remove(&packet.fetch.uid);
                                } else {
                                    packet.fetch.set_reply();
                                    packet.fetch.reply_cycle = Some(cycle);
                                    packet
                                        .fetch
                                        .set_status(Status::IN_PARTITION_L2_TO_ICNT_QUEUE, cycle);
                                    self.l2_to_interconn_queue.enqueue(packet);
                                }
                            }
                        } else {
                            // L2 lock-up: try again next cycle
                            debug_assert!(!write_sent);
                            debug_assert!(!read_sent);
                        }
                    }
                } else {
                    // L2 disabled for this access: straight to DRAM
                    let mut packet = self.interconn_to_l2_queue.dequeue().unwrap();
                    packet
                        .fetch
                        .set_status(Status::IN_PARTITION_L2_TO_DRAM_QUEUE, cycle);
                    self.l2_to_dram_queue.enqueue(packet);
                }
            }
        }

        // the ROP delay expires into the L2 input queue
        if !self.interconn_to_l2_queue.full() {
            if let Some((ready_cycle, _)) = self.rop_queue.front() {
                if cycle >= *ready_cycle {
                    let (_, mut fetch) = self.rop_queue.pop_front().unwrap();
                    fetch.set_status(Status::IN_PARTITION_ICNT_TO_L2_QUEUE, cycle);
                    self.interconn_to_l2_queue.enqueue(Packet { fetch, time: cycle });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{config, mem_fetch, warp::ActiveMask, UidGenerator};
    use bitvec::array::BitArray;
    use bitvec::field::BitField;
    use color_eyre::eyre;
    use std::sync::Arc;

    fn sub_partition() -> eyre::Result<super::MemorySubPartition> {
        let config = Arc::new(config::GPU::default());
        let mem_controller = Arc::new(crate::mcu::MemoryController::new(&config)?);
        Ok(super::MemorySubPartition::new(
            0,
            0,
            config,
            mem_controller,
            UidGenerator::new(),
        ))
    }

    fn line_read(uid: u64, addr: crate::address) -> mem_fetch::MemFetch {
        let mut active_mask: ActiveMask = BitArray::ZERO;
        active_mask.store(u32::MAX);
        let access = mem_fetch::access::Builder {
            kind: mem_fetch::access::Kind::GLOBAL_ACC_R,
            addr,
            req_size_bytes: super::MAX_MEMORY_ACCESS_SIZE,
            is_write: false,
            warp_active_mask: active_mask,
            byte_mask: !mem_fetch::ByteMask::ZERO,
            sector_mask: !mem_fetch::SectorMask::ZERO,
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
    fn oversize_requests_split_into_sectors() -> eyre::Result<()> {
        let mut sub = sub_partition()?;
        sub.push(line_read(1, 0x1000), 0);
        // four linked 32B sector requests sit in the ROP queue
        assert_eq!(sub.rop_queue.len(), 4);
        for (sector, (_, fetch)) in sub.rop_queue.iter().enumerate() {
            assert_eq!(fetch.data_size(), super::SECTOR_SIZE);
            assert_eq!(fetch.access.sector_mask.count_ones(), 1);
            assert!(fetch.access.sector_mask[sector]);
            assert!(fetch.original_fetch.is_some());
        }
        Ok(())
    }

    #[test]
    fn rop_delay_holds_requests() -> eyre::Result<()> {
        let mut sub = sub_partition()?;
        sub.push(line_read(1, 0x1000), 0);
        let rop_latency = sub.config.rop_latency;

        sub.cache_cycle(1);
        assert!(sub.interconn_to_l2_queue.is_empty());

        sub.cache_cycle(rop_latency + 1);
        assert!(!sub.interconn_to_l2_queue.is_empty());
        Ok(())
    }
}
