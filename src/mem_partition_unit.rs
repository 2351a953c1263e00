use crate::{
    address, arbitration::Arbitration, config, dram, mcu, mem_fetch,
    mem_sub_partition::MemorySubPartition, UidGenerator,
};
use std::sync::Arc;

/// One memory partition: a DRAM channel and its sub partitions.
pub struct MemoryPartitionUnit {
    pub id: usize,
    pub dram: dram::Dram,
    pub sub_partitions: Vec<MemorySubPartition>,
    arbitration: Arbitration,
    config: Arc<config::GPU>,
}

impl std::fmt::Debug for MemoryPartitionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemoryPartitionUnit")
            .field("id", &self.id)
            .finish()
    }
}

impl MemoryPartitionUnit {
    pub fn new(
        id: usize,
        config: Arc<config::GPU>,
        mem_controller: Arc<mcu::MemoryController>,
        fetch_uids: UidGenerator,
    ) -> Self {
        let num_sub_partitions = config.num_sub_partitions_per_memory_controller;
        let sub_partitions = (0..num_sub_partitions)
            .map(|i| {
                let sub_id = id * num_sub_partitions + i;
                MemorySubPartition::new(
                    sub_id,
                    id,
                    Arc::clone(&config),
                    Arc::clone(&mem_controller),
                    fetch_uids.clone(),
                )
            })
            .collect();

        let dram = dram::Dram::new(id, &config);
        let arbitration = Arbitration::new(&config);
        Self {
            id,
            dram,
            sub_partitions,
            arbitration,
            config,
        }
    }

    fn global_to_local_sub_id(&self, global_sub_partition_id: usize) -> usize {
        global_sub_partition_id - self.id * self.config.num_sub_partitions_per_memory_controller
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.dram.busy() || self.sub_partitions.iter().any(MemorySubPartition::busy)
    }

    /// Warm the owning L2 slice for a host-to-device copy.
    pub fn handle_memcpy_to_gpu(
        &mut self,
        addr: address,
        global_sub_partition_id: usize,
        sector_mask: mem_fetch::SectorMask,
        time: u64,
    ) {
        let local_id = self.global_to_local_sub_id(global_sub_partition_id);
        log::trace!(
            "copy engine request for address {addr} (sub partition {global_sub_partition_id})"
        );
        self.sub_partitions[local_id].force_l2_tag_update(addr, sector_mask, time);
    }

    /// Advance every sub partition's L2 side.
    pub fn cache_cycle(&mut self, cycle: u64) {
        for sub in &mut self.sub_partitions {
            sub.cache_cycle(cycle);
        }
    }

    /// Advance the DRAM side: retire serviced requests towards the owning
    /// sub partition and issue new ones under credit arbitration.
    pub fn dram_cycle(&mut self, cycle: u64) {
        use mem_fetch::Status;

        // serviced requests return to their sub partition
        if let Some(returned) = self.dram.return_queue_top() {
            let global_sub_id = returned.sub_partition_id();
            let local_id = self.global_to_local_sub_id(global_sub_id);
            if returned.access_kind().is_writeback() {
                // writebacks terminate in DRAM
                let fetch = self.dram.return_queue_pop().unwrap();
                self.arbitration.return_credit(local_id);
                self.sub_partitions[local_id].set_done(fetch.uid);
            } else {
                let sub = &mut self.sub_partitions[local_id];
                debug_assert_eq!(sub.id, global_sub_id);
                if !sub.dram_to_l2_queue.full() {
                    let mut fetch = self.dram.return_queue_pop().unwrap();
                    fetch.set_reply();
                    fetch.set_status(Status::IN_PARTITION_DRAM_TO_L2_QUEUE, cycle);
                    self.arbitration.return_credit(local_id);
                    log::debug!(
                        "partition {}: {fetch} returned from dram to sub partition {global_sub_id}",
                        self.id
                    );
                    sub.dram_to_l2_queue.enqueue(crate::interconn::Packet {
                        fetch,
                        time: cycle,
                    });
                }
            }
        }

        self.dram.cycle(cycle);

        // arbitrate the L2-to-DRAM queues onto the channel
        let num_subs = self.sub_partitions.len();
        let last_borrower = self.arbitration.last_borrower();
        for i in 0..num_subs {
            let local_id = (i + last_borrower + 1) % num_subs;
            let sub = &mut self.sub_partitions[local_id];
            let can_issue = self.arbitration.has_credits(local_id)
                && !sub.dram_to_l2_queue.full()
                && !sub.l2_to_dram_queue.is_empty();
            if !can_issue || self.dram.full() {
                continue;
            }
            let mut packet = sub.l2_to_dram_queue.dequeue().unwrap();
            log::debug!(
                "partition {}: issue {} from sub partition {} to DRAM",
                self.id,
                packet.fetch,
                sub.id
            );
            packet.fetch.set_status(Status::IN_PARTITION_DRAM, cycle);
            self.dram.push(packet.fetch, cycle);
            self.arbitration.borrow_credit(local_id);
            // the DRAM accepts one request per cycle
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{config, interconn::Packet, mem_fetch, warp::ActiveMask, UidGenerator};
    use color_eyre::eyre;
    use std::sync::Arc;

    fn partition() -> eyre::Result<super::MemoryPartitionUnit> {
        let config = Arc::new(config::GPU::default());
        let mem_controller = Arc::new(crate::mcu::MemoryController::new(&config)?);
        Ok(super::MemoryPartitionUnit::new(
            0,
            config,
            mem_controller,
            UidGenerator::new(),
        ))
    }

    fn read(uid: u64, sub_partition: u64) -> mem_fetch::MemFetch {
        let access = mem_fetch::access::Builder {
            kind: mem_fetch::access::Kind::GLOBAL_ACC_R,
            addr: 0x100,
            req_size_bytes: 32,
            is_write: false,
            warp_active_mask: ActiveMask::ZERO,
            byte_mask: mem_fetch::ByteMask::ZERO,
            sector_mask: mem_fetch::SectorMask::ZERO,
        }
        .build();
        let mut fetch = mem_fetch::Builder {
            uid,
            access,
            instr: None,
            warp_id: 0,
            core_id: Some(0),
            cluster_id: Some(0),
            physical_addr: crate::mcu::PhysicalAddress::default(),
            partition_addr: 0x100,
        }
        .build();
        fetch.physical_addr.sub_partition = sub_partition;
        fetch
    }

    #[test]
    fn read_request_travels_to_dram_and_back() -> eyre::Result<()> {
        let mut partition = partition()?;
        partition.sub_partitions[0]
            .l2_to_dram_queue
            .enqueue(Packet {
                fetch: read(1, 0),
                time: 0,
            });

        for cycle in 0..10_000 {
            partition.dram_cycle(cycle);
            if let Some(packet) = partition.sub_partitions[0].dram_to_l2_queue.first() {
                assert!(packet.fetch.is_reply());
                assert_eq!(packet.fetch.uid, 1);
                return Ok(());
            }
        }
        panic!("request never returned from DRAM");
    }
}
