use crate::{address, cache, interconn as ic, mem_fetch};
use std::collections::VecDeque;

/// A read-only cache, used for L1I, L1C and L1T.
pub struct ReadOnly {
    pub inner: cache::base::Base,
}

impl std::fmt::Debug for ReadOnly {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.inner, f)
    }
}

impl ReadOnly {
    #[must_use]
    pub fn new(name: String, id: usize, config: cache::Config) -> Self {
        debug_assert_eq!(
            config.write_policy,
            cache::config::WritePolicy::READ_ONLY
        );
        Self {
            inner: cache::base::Base::new(name, id, config),
        }
    }

    pub fn access(
        &mut self,
        addr: address,
        fetch: mem_fetch::MemFetch,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> cache::RequestStatus {
        debug_assert!(!fetch.is_write());
        let block_addr = self.inner.config.block_addr(addr);
        let sector_mask = self
            .inner
            .config
            .access_sector_mask(&fetch.access.sector_mask, addr);
        let access_kind: stats::cache::AccessKind = fetch.access_kind().into();

        log::debug!(
            "{}::access({fetch}, block={block_addr}, time={time})",
            self.inner.name
        );

        let (probe_index, probe_status) = self.inner.tag_array.probe(block_addr, &sector_mask, false);

        let access_status = match (probe_index, probe_status) {
            (Some(_), cache::RequestStatus::HIT) => {
                // update replacement state
                self.inner.tag_array.access(block_addr, &fetch, time);
                cache::RequestStatus::HIT
            }
            (Some(index), status) if status != cache::RequestStatus::RESERVATION_FAIL => {
                if self.inner.miss_queue_full() {
                    self.inner.stats.inc(
                        access_kind,
                        cache::ReservationFailure::MISS_QUEUE_FULL.into(),
                        1,
                    );
                    cache::RequestStatus::RESERVATION_FAIL
                } else {
                    let (should_miss, _, _) = self.inner.send_read_request(
                        block_addr, index, fetch, time, events, true, false,
                    );
                    if should_miss {
                        cache::RequestStatus::MISS
                    } else {
                        cache::RequestStatus::RESERVATION_FAIL
                    }
                }
            }
            _ => {
                self.inner.stats.inc(
                    access_kind,
                    cache::ReservationFailure::LINE_ALLOC_FAIL.into(),
                    1,
                );
                cache::RequestStatus::RESERVATION_FAIL
            }
        };
        self.inner.stats.inc(
            access_kind,
            cache::select_status(probe_status, access_status).into(),
            1,
        );
        access_status
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
    pub fn has_free_fill_port(&self) -> bool {
        self.inner.bandwidth.has_free_fill_port()
    }

    pub fn invalidate(&mut self) {
        self.inner.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use crate::{cache, config, fifo::Fifo, interconn as ic, mem_fetch, warp::ActiveMask};
    use color_eyre::eyre;

    fn inst_fetch(uid: u64, addr: crate::address) -> mem_fetch::MemFetch {
        let access = mem_fetch::access::Builder {
            kind: mem_fetch::access::Kind::INST_ACC_R,
            addr,
            req_size_bytes: 16,
            is_write: false,
            warp_active_mask: ActiveMask::ZERO,
            byte_mask: mem_fetch::ByteMask::ZERO,
            sector_mask: mem_fetch::SectorMask::ZERO,
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
    fn read_only_miss_roundtrip() -> eyre::Result<()> {
        let config = config::GPU::default();
        let mut l1i = super::ReadOnly::new("test-l1i".to_string(), 0, (&config.inst_cache_l1).into());
        let mut events = Vec::new();

        let addr = crate::instruction::PROGRAM_MEM_START;
        let status = l1i.access(addr, inst_fetch(1, addr), &mut events, 1);
        assert_eq!(status, cache::RequestStatus::MISS);

        let mut port: Fifo<ic::Packet<mem_fetch::MemFetch>> = Fifo::new(None);
        l1i.cycle(&mut port, 2);
        let outgoing = port.dequeue().unwrap().fetch;

        l1i.fill(outgoing, 3);
        assert!(l1i.has_ready_accesses());
        let ready = l1i.next_access().unwrap();
        assert_eq!(ready.uid, 1);

        let status = l1i.access(addr, inst_fetch(2, addr), &mut events, 4);
        assert_eq!(status, cache::RequestStatus::HIT);
        Ok(())
    }
}
