use crate::{
    cache, config, fifo::Fifo, func_unit as fu, interconn as ic,
    instruction::{CacheOperator, MemorySpace, WarpInstruction},
    mcu, mem_fetch, mem_sub_partition, operand_collector::RegisterFileUnit,
    scoreboard::Scoreboard, warp, UidGenerator,
};
use mem_fetch::access::Kind as AccessKind;
use mem_fetch::MemFetch;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strum::EnumCount;

/// Clients arbitrating for the load/store unit's single writeback port.
#[derive(strum::EnumCount, strum::FromRepr, Hash, PartialEq, Eq, Clone, Copy, Debug)]
#[repr(usize)]
enum WritebackClient {
    SharedMemory = 0,
    L1T = 1,
    L1C = 2,
    /// Global/local responses that bypassed the L1.
    GlobalLocal = 3,
    L1D = 4,
}

/// Entry of the texture reorder buffer: texture replies return to the warp
/// in request order.
#[derive(Debug)]
struct TexRobEntry {
    uid: u64,
    ready: Option<MemFetch>,
}

/// The memory pipeline: drives shared memory, the L1 data, constant and
/// texture caches, and turns coalesced accesses into interconnect traffic.
pub struct LoadStoreUnit {
    core_id: usize,
    cluster_id: usize,
    config: Arc<config::GPU>,
    mem_controller: Arc<mcu::MemoryController>,
    fetch_uids: UidGenerator,

    pub inner: fu::PipelinedUnit,
    pub data_l1: cache::Data,
    pub const_l1: cache::ReadOnly,
    pub tex_l1: cache::ReadOnly,
    tex_reorder_buffer: VecDeque<TexRobEntry>,

    pub response_queue: Fifo<ic::Packet<MemFetch>>,
    next_writeback: Option<WarpInstruction>,
    /// Next global response that bypassed the L1.
    next_global: Option<MemFetch>,
    /// Outstanding loads per `(warp, destination register)`.
    pub pending_writes: HashMap<usize, HashMap<u32, usize>>,

    /// Per-bank L1D access pipelines modeling the tag lookup latency.
    l1_latency_queue: Box<[Box<[Option<MemFetch>]>]>,
    /// L1 hits wait out the hit latency here.
    l1_hit_latency_queue: VecDeque<(u64, MemFetch)>,

    writeback_arb: usize,
}

impl std::fmt::Display for LoadStoreUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "LdstUnit[{}:{}]", self.cluster_id, self.core_id)
    }
}

impl LoadStoreUnit {
    pub fn new(
        core_id: usize,
        cluster_id: usize,
        config: Arc<config::GPU>,
        mem_controller: Arc<mcu::MemoryController>,
        fetch_uids: UidGenerator,
    ) -> Self {
        debug_assert!(config.shared_memory_latency > 1);
        let inner = fu::PipelinedUnit::new(0, fu::Kind::Mem, config.shared_memory_latency, 0);

        let data_l1 = cache::data::Builder {
            name: format!("core-{cluster_id}-{core_id}-L1D"),
            id: core_id,
            config: (&config.data_cache_l1).into(),
            mem_controller: Arc::clone(&mem_controller),
            fetch_uids: fetch_uids.clone(),
            write_alloc_kind: AccessKind::L1_WR_ALLOC_R,
            write_back_kind: AccessKind::L1_WRBK_ACC,
        }
        .build();
        let const_l1 = cache::ReadOnly::new(
            format!("core-{cluster_id}-{core_id}-L1C"),
            core_id,
            (&config.const_cache_l1).into(),
        );
        let tex_l1 = cache::ReadOnly::new(
            format!("core-{cluster_id}-{core_id}-L1T"),
            core_id,
            (&config.tex_cache_l1).into(),
        );

        let l1_banks = config.l1_banks;
        let l1_latency = config.l1_latency.max(1);
        let l1_latency_queue = utils::box_slice![utils::box_slice![None; l1_latency]; l1_banks];

        Self {
            core_id,
            cluster_id,
            inner,
            data_l1,
            const_l1,
            tex_l1,
            tex_reorder_buffer: VecDeque::new(),
            response_queue: Fifo::new(Some(config.num_ldst_response_buffer_size)),
            next_writeback: None,
            next_global: None,
            pending_writes: HashMap::new(),
            l1_latency_queue,
            l1_hit_latency_queue: VecDeque::new(),
            writeback_arb: 0,
            config,
            mem_controller,
            fetch_uids,
        }
    }

    #[must_use]
    pub fn response_buffer_full(&self) -> bool {
        self.response_queue.full()
    }

    /// Accept a response from the cluster's interconnect side.
    pub fn fill(&mut self, mut fetch: MemFetch, time: u64) {
        fetch.set_status(mem_fetch::Status::IN_SHADER_LDST_RESPONSE_FIFO, time);
        self.response_queue.enqueue(ic::Packet { fetch, time });
    }

    pub fn flush(&mut self) {
        self.data_l1.flush();
    }

    pub fn invalidate(&mut self) {
        self.data_l1.invalidate();
        self.const_l1.invalidate();
        self.tex_l1.invalidate();
    }

    #[must_use]
    pub fn can_issue(&self, instr: &WarpInstruction) -> bool {
        use crate::opcodes::ArchOp;
        match instr.opcode.category {
            ArchOp::LOAD_OP | ArchOp::STORE_OP | ArchOp::MEMORY_BARRIER_OP => {
                self.inner.dispatch_reg.is_none()
            }
            _ => false,
        }
    }

    /// Accept an instruction from the OC|EX register.
    pub fn issue(&mut self, instr: WarpInstruction, stats: &mut stats::Stats) {
        // track how many responses must return per destination register
        if instr.is_load() && instr.memory_space != Some(MemorySpace::Shared) {
            let num_accesses = instr.mem_access_queue.len();
            for out_reg in instr.outputs() {
                let pending = self
                    .pending_writes
                    .entry(instr.warp_id)
                    .or_default()
                    .entry(*out_reg)
                    .or_default();
                *pending += num_accesses;
            }
        }

        if let Some(space) = instr.memory_space {
            let count = instr.active_thread_count() as u64;
            let counters = &mut stats.instructions;
            match (space, instr.is_store()) {
                (MemorySpace::Global, false) => counters.num_global_loads += count,
                (MemorySpace::Global, true) => counters.num_global_stores += count,
                (MemorySpace::Local, false) => counters.num_local_loads += count,
                (MemorySpace::Local, true) => counters.num_local_stores += count,
                (MemorySpace::Shared, false) => counters.num_shared_loads += count,
                (MemorySpace::Shared, true) => counters.num_shared_stores += count,
                (MemorySpace::Constant, _) => counters.num_const_loads += count,
                (MemorySpace::Texture, _) => counters.num_texture_loads += count,
            }
        }

        self.inner.issue(instr);
    }

    #[must_use]
    pub fn pending_writes(&self, warp_id: usize, reg_id: u32) -> Option<usize> {
        self.pending_writes.get(&warp_id)?.get(&reg_id).copied()
    }

    fn store_ack(warps: &mut [warp::Warp], fetch: &MemFetch) {
        debug_assert_eq!(fetch.kind, mem_fetch::Kind::WRITE_ACK);
        let warp = &mut warps[fetch.warp_id];
        warp.num_outstanding_stores -= 1;
    }

    /// Decrement the pending counters of a returned load; release the
    /// scoreboard once a register has no responses left.
    fn finish_load(
        pending_writes: &mut HashMap<usize, HashMap<u32, usize>>,
        scoreboard: &mut Scoreboard,
        stats: &mut stats::Stats,
        instr: &mut WarpInstruction,
    ) {
        let mut completed = false;
        for out_reg in instr.outputs() {
            let pending = pending_writes.entry(instr.warp_id).or_default();
            let still_pending = pending.get_mut(out_reg).expect("pending write entry");
            debug_assert!(*still_pending > 0);
            *still_pending -= 1;
            if *still_pending == 0 {
                pending.remove(out_reg);
                scoreboard.release(instr.warp_id, *out_reg);
                completed = true;
            }
        }
        if completed {
            crate::core::warp_inst_complete(instr, stats);
        }
    }

    /// The writeback stage of the memory pipeline: one client per cycle gets
    /// to write its destination registers.
    pub fn writeback(
        &mut self,
        operand_collector: &mut RegisterFileUnit,
        scoreboard: &mut Scoreboard,
        warps: &mut [warp::Warp],
        stats: &mut stats::Stats,
        cycle: u64,
    ) {
        if let Some(ref next_writeback) = self.next_writeback {
            if operand_collector.writeback(next_writeback) {
                let mut next_writeback = self.next_writeback.take().unwrap();
                let mut instr_completed = false;
                for out_reg in next_writeback.outputs() {
                    debug_assert!(*out_reg > 0);
                    if next_writeback.memory_space == Some(MemorySpace::Shared) {
                        // shared memory loads complete in one writeback
                        scoreboard.release(next_writeback.warp_id, *out_reg);
                        instr_completed = true;
                    } else {
                        let pending = self
                            .pending_writes
                            .entry(next_writeback.warp_id)
                            .or_default();
                        let still_pending = pending.get_mut(out_reg).expect("pending write");
                        debug_assert!(*still_pending > 0);
                        *still_pending -= 1;
                        if *still_pending == 0 {
                            pending.remove(out_reg);
                            scoreboard.release(next_writeback.warp_id, *out_reg);
                            instr_completed = true;
                        }
                    }
                }
                if instr_completed {
                    crate::core::warp_inst_complete(&mut next_writeback, stats);
                }
            }
        }

        // arbitrate the writeback clients for the next cycle
        let mut serviced_client = None;
        for client in 0..WritebackClient::COUNT {
            if self.next_writeback.is_some() {
                break;
            }
            let next_client_id = (client + self.writeback_arb) % WritebackClient::COUNT;
            match WritebackClient::from_repr(next_client_id).unwrap() {
                WritebackClient::SharedMemory => {
                    if let Some(pipe_reg) = self.inner.pipeline_reg[0].take() {
                        warps[pipe_reg.warp_id].num_instr_in_pipeline -= 1;
                        self.next_writeback = Some(pipe_reg);
                        serviced_client = Some(next_client_id);
                    }
                }
                WritebackClient::L1T => {
                    // move one ready texture fill into the reorder buffer
                    if let Some(fetch) = self.tex_l1.next_access() {
                        if let Some(entry) = self
                            .tex_reorder_buffer
                            .iter_mut()
                            .find(|entry| entry.uid == fetch.uid)
                        {
                            entry.ready = Some(fetch);
                        }
                    }
                    // responses leave the buffer strictly in request order
                    if self
                        .tex_reorder_buffer
                        .front()
                        .is_some_and(|entry| entry.ready.is_some())
                    {
                        let entry = self.tex_reorder_buffer.pop_front().unwrap();
                        let mut fetch = entry.ready.unwrap();
                        fetch.set_status(mem_fetch::Status::IN_SHADER_L1T_ROB, cycle);
                        self.next_writeback = fetch.instr.take();
                        serviced_client = Some(next_client_id);
                    }
                }
                WritebackClient::L1C => {
                    if let Some(mut fetch) = self.const_l1.next_access() {
                        self.next_writeback = fetch.instr.take();
                        serviced_client = Some(next_client_id);
                    }
                }
                WritebackClient::GlobalLocal => {
                    if let Some(mut next_global) = self.next_global.take() {
                        self.next_writeback = next_global.instr.take();
                        serviced_client = Some(next_client_id);
                    }
                }
                WritebackClient::L1D => {
                    if let Some(mut fetch) = self.data_l1.next_access() {
                        self.next_writeback = fetch.instr.take();
                        serviced_client = Some(next_client_id);
                    }
                }
            }
        }

        if let Some(serviced) = serviced_client {
            self.writeback_arb = (serviced + 1) % WritebackClient::COUNT;
        }
    }

    /// Shared memory takes no cache path; bank conflicts stretch the
    /// initiation interval computed by the coalescer.
    fn shared_cycle(&mut self, stall: &mut bool) {
        let Some(dispatch) = &mut self.inner.dispatch_reg else {
            return;
        };
        if dispatch.memory_space != Some(MemorySpace::Shared) {
            return;
        }
        if dispatch.active_thread_count() == 0 {
            return;
        }
        dispatch.dispatch_delay_cycles = dispatch.dispatch_delay_cycles.saturating_sub(1);
        *stall = dispatch.dispatch_delay_cycles > 0;
    }

    /// Present the next constant access to the L1C.
    fn constant_cycle(
        &mut self,
        scoreboard: &mut Scoreboard,
        stats: &mut stats::Stats,
        stall: &mut bool,
        cycle: u64,
    ) {
        let Some(dispatch) = &self.inner.dispatch_reg else {
            return;
        };
        if dispatch.memory_space != Some(MemorySpace::Constant) {
            return;
        }
        let Some(access) = dispatch.mem_access_queue.back() else {
            return;
        };

        let physical_addr = self.mem_controller.decode(access.addr);
        let partition_addr = self.mem_controller.partition_address(access.addr);
        let fetch = mem_fetch::Builder {
            uid: self.fetch_uids.next_id(),
            access: access.clone(),
            instr: Some(dispatch.clone()),
            warp_id: dispatch.warp_id,
            core_id: Some(self.core_id),
            cluster_id: Some(self.cluster_id),
            physical_addr,
            partition_addr,
        }
        .build();

        let mut events = Vec::new();
        let status = self.const_l1.access(fetch.addr(), fetch, &mut events, cycle);
        match status {
            cache::RequestStatus::RESERVATION_FAIL => {
                *stall = true;
            }
            status => {
                let instr = self.inner.dispatch_reg.as_mut().unwrap();
                instr.mem_access_queue.pop_back();
                if status == cache::RequestStatus::HIT {
                    // hits complete without a memory round trip
                    let mut instr = instr.clone();
                    Self::finish_load(&mut self.pending_writes, scoreboard, stats, &mut instr);
                }
            }
        }
        let instr = self.inner.dispatch_reg.as_ref().unwrap();
        if !instr.mem_access_queue.is_empty() {
            *stall = true;
        }
    }

    /// Present the next texture access to the L1T; misses take a slot in the
    /// reorder buffer.
    fn texture_cycle(&mut self, stall: &mut bool, cycle: u64) {
        let Some(dispatch) = &mut self.inner.dispatch_reg else {
            return;
        };
        if dispatch.memory_space != Some(MemorySpace::Texture) {
            return;
        }
        let Some(access) = dispatch.mem_access_queue.back() else {
            return;
        };

        let physical_addr = self.mem_controller.decode(access.addr);
        let partition_addr = self.mem_controller.partition_address(access.addr);
        let fetch = mem_fetch::Builder {
            uid: self.fetch_uids.next_id(),
            access: access.clone(),
            instr: Some(dispatch.clone()),
            warp_id: dispatch.warp_id,
            core_id: Some(self.core_id),
            cluster_id: Some(self.cluster_id),
            physical_addr,
            partition_addr,
        }
        .build();
        let fetch_uid = fetch.uid;

        let mut events = Vec::new();
        let status = self.tex_l1.access(fetch.addr(), fetch, &mut events, cycle);
        match status {
            cache::RequestStatus::RESERVATION_FAIL => {
                *stall = true;
            }
            status => {
                self.inner
                    .dispatch_reg
                    .as_mut()
                    .unwrap()
                    .mem_access_queue
                    .pop_back();
                if status == cache::RequestStatus::HIT {
                    // hits also pass through the reorder buffer so replies
                    // stay in order; synthesize the ready entry
                    let instr = self.inner.dispatch_reg.as_ref().unwrap().clone();
                    self.pop_tex_hit(instr, fetch_uid);
                } else {
                    self.tex_reorder_buffer.push_back(TexRobEntry {
                        uid: fetch_uid,
                        ready: None,
                    });
                }
            }
        }
        let instr = self.inner.dispatch_reg.as_ref().unwrap();
        if !instr.mem_access_queue.is_empty() {
            *stall = true;
        }
    }

    fn pop_tex_hit(&mut self, instr: WarpInstruction, uid: u64) {
        let physical_addr = mcu::PhysicalAddress::default();
        let access = mem_fetch::access::Builder {
            kind: AccessKind::TEXTURE_ACC_R,
            addr: 0,
            req_size_bytes: 0,
            is_write: false,
            warp_active_mask: instr.active_mask,
            byte_mask: mem_fetch::ByteMask::ZERO,
            sector_mask: mem_fetch::SectorMask::ZERO,
        }
        .build();
        let warp_id = instr.warp_id;
        let mut fetch = mem_fetch::Builder {
            uid,
            access,
            instr: Some(instr),
            warp_id,
            core_id: Some(self.core_id),
            cluster_id: Some(self.cluster_id),
            physical_addr,
            partition_addr: 0,
        }
        .build();
        fetch.set_status(mem_fetch::Status::IN_SHADER_L1T_ROB, 0);
        self.tex_reorder_buffer.push_back(TexRobEntry {
            uid,
            ready: Some(fetch),
        });
    }

    /// Global and local accesses: bypass to the interconnect or enter the
    /// banked L1D pipelines.
    fn memory_cycle(
        &mut self,
        warps: &mut [warp::Warp],
        mem_port: &mut dyn ic::Connection<ic::Packet<MemFetch>>,
        stall: &mut bool,
        cycle: u64,
    ) {
        let Some(dispatch) = &self.inner.dispatch_reg else {
            return;
        };
        if !matches!(
            dispatch.memory_space,
            Some(MemorySpace::Global | MemorySpace::Local)
        ) {
            return;
        }
        if dispatch.active_thread_count() == 0 || dispatch.mem_access_queue.is_empty() {
            return;
        }

        let bypass_l1 = dispatch.cache_operator == Some(CacheOperator::Global)
            || (dispatch.memory_space == Some(MemorySpace::Global)
                && self.config.global_mem_skip_l1_data_cache
                && dispatch.cache_operator != Some(CacheOperator::L1));

        if bypass_l1 {
            let Some(access) = dispatch.mem_access_queue.back() else {
                return;
            };
            let packet_size = if dispatch.is_store() || dispatch.is_atomic() {
                access.size()
            } else {
                access.control_size()
            };
            if mem_port.can_send(&[packet_size]) {
                let instr = self.inner.dispatch_reg.as_mut().unwrap();
                if instr.is_store() {
                    warps[instr.warp_id].num_outstanding_stores += 1;
                }
                let access = instr.mem_access_queue.pop_back().unwrap();
                let physical_addr = self.mem_controller.decode(access.addr);
                let partition_addr = self.mem_controller.partition_address(access.addr);
                let mut fetch = mem_fetch::Builder {
                    uid: self.fetch_uids.next_id(),
                    access,
                    instr: Some(instr.clone()),
                    warp_id: instr.warp_id,
                    core_id: Some(self.core_id),
                    cluster_id: Some(self.cluster_id),
                    physical_addr,
                    partition_addr,
                }
                .build();
                fetch.inject_cycle = Some(cycle);
                mem_port.send(ic::Packet { fetch, time: cycle });
            } else {
                *stall = true;
            }
        } else {
            // one request per L1D bank per cycle enters the latency pipeline
            for _ in 0..self.config.l1_banks {
                let Some(access) = self
                    .inner
                    .dispatch_reg
                    .as_ref()
                    .and_then(|instr| instr.mem_access_queue.back())
                else {
                    break;
                };
                let bank = self.l1_bank(access.addr);
                let slot_idx = self.config.l1_latency.max(1) - 1;
                if self.l1_latency_queue[bank][slot_idx].is_some() {
                    // bank conflict: try again next cycle
                    *stall = true;
                    break;
                }
                let instr = self.inner.dispatch_reg.as_mut().unwrap();
                let is_store = instr.is_store();
                let access = instr.mem_access_queue.pop_back().unwrap();
                let physical_addr = self.mem_controller.decode(access.addr);
                let partition_addr = self.mem_controller.partition_address(access.addr);
                let mut fetch = mem_fetch::Builder {
                    uid: self.fetch_uids.next_id(),
                    access,
                    instr: Some(instr.clone()),
                    warp_id: instr.warp_id,
                    core_id: Some(self.core_id),
                    cluster_id: Some(self.cluster_id),
                    physical_addr,
                    partition_addr,
                }
                .build();
                fetch.inject_cycle = Some(cycle);
                let data_size = fetch.data_size();
                self.l1_latency_queue[bank][slot_idx] = Some(fetch);

                if is_store {
                    let inc_ack =
                        if self.config.data_cache_l1.kind == cache::config::Kind::Sector {
                            (data_size / mem_sub_partition::SECTOR_SIZE).max(1)
                        } else {
                            1
                        };
                    warps[instr.warp_id].num_outstanding_stores += inc_ack as usize;
                }
            }
        }

        if self
            .inner
            .dispatch_reg
            .as_ref()
            .is_some_and(|instr| !instr.mem_access_queue.is_empty())
        {
            *stall = true;
        }
    }

    fn l1_bank(&self, addr: crate::address) -> usize {
        let interleaving = self.config.l1_banks_byte_interleaving as u64;
        ((addr / interleaving) % self.config.l1_banks as u64) as usize
    }

    /// Accesses at the head of each bank pipeline probe the L1D.
    fn l1_latency_queue_cycle(
        &mut self,
        scoreboard: &mut Scoreboard,
        warps: &mut [warp::Warp],
        stats: &mut stats::Stats,
        cycle: u64,
    ) {
        for bank in 0..self.config.l1_banks {
            if let Some(fetch) = &self.l1_latency_queue[bank][0] {
                let mut events = Vec::new();
                let status =
                    self.data_l1
                        .access(fetch.addr(), fetch.clone(), &mut events, cycle);
                let write_sent = cache::was_write_sent(&events);
                let read_sent = cache::was_read_sent(&events);

                let dec_ack = if self.config.data_cache_l1.kind == cache::config::Kind::Sector {
                    (fetch.data_size() / mem_sub_partition::SECTOR_SIZE).max(1)
                } else {
                    1
                };

                if status == cache::RequestStatus::HIT {
                    debug_assert!(!read_sent);
                    let mut fetch = self.l1_latency_queue[bank][0].take().unwrap();
                    let instr = fetch.instr.as_mut().unwrap();
                    if instr.is_store() && !write_sent {
                        // the write was absorbed by the L1
                        fetch.set_reply();
                        for _ in 0..dec_ack {
                            Self::store_ack(warps, &fetch);
                        }
                    }
                    let hit_latency = self.config.l1_hit_latency as u64;
                    self.l1_hit_latency_queue.push_back((cycle + hit_latency, fetch));
                } else if status == cache::RequestStatus::RESERVATION_FAIL {
                    debug_assert!(!read_sent);
                    debug_assert!(!write_sent);
                    // the cache refused: retry next cycle
                } else {
                    debug_assert!(matches!(
                        status,
                        cache::RequestStatus::MISS
                            | cache::RequestStatus::HIT_RESERVED
                            | cache::RequestStatus::SECTOR_MISS
                    ));
                    let mut fetch = self.l1_latency_queue[bank][0].take().unwrap();
                    let instr = fetch.instr.as_ref().unwrap();

                    let write_allocate_policy = self.config.data_cache_l1.write_allocate_policy;
                    let should_fetch = write_allocate_policy.is_fetch_on_write()
                        || write_allocate_policy.is_lazy_fetch_on_read();
                    let write_allocate_sent = cache::was_writeallocate_sent(&events);

                    if !self.config.data_cache_l1.write_policy.is_write_through()
                        && instr.is_store()
                        && should_fetch
                        && !write_allocate_sent
                    {
                        // the store completed in the L1
                        fetch.set_reply();
                        for _ in 0..dec_ack {
                            Self::store_ack(warps, &fetch);
                        }
                    }
                }
            }

            // advance the bank pipeline
            let l1_latency = self.config.l1_latency.max(1);
            for stage in 0..l1_latency - 1 {
                if self.l1_latency_queue[bank][stage].is_none() {
                    self.l1_latency_queue[bank][stage] =
                        self.l1_latency_queue[bank][stage + 1].take();
                }
            }
        }

        // completed L1 hits release their registers
        while let Some((ready_cycle, _)) = self.l1_hit_latency_queue.front() {
            if cycle < *ready_cycle {
                break;
            }
            let (_, mut fetch) = self.l1_hit_latency_queue.pop_front().unwrap();
            let mut instr = fetch.instr.take().unwrap();
            if instr.is_load() {
                Self::finish_load(&mut self.pending_writes, scoreboard, stats, &mut instr);
            }
        }
    }

    /// One memory pipeline cycle.
    pub fn cycle(
        &mut self,
        operand_collector: &mut RegisterFileUnit,
        scoreboard: &mut Scoreboard,
        warps: &mut [warp::Warp],
        stats: &mut stats::Stats,
        mem_port: &mut dyn ic::Connection<ic::Packet<MemFetch>>,
        cycle: u64,
    ) {
        self.writeback(operand_collector, scoreboard, warps, stats, cycle);

        // the shared memory pipeline moves towards writeback
        let depth = self.inner.pipeline_reg.len();
        for stage in 0..depth - 1 {
            if self.inner.pipeline_reg[stage].is_none() {
                let moving = self.inner.pipeline_reg[stage + 1].take();
                self.inner.pipeline_reg[stage] = moving;
            }
        }

        // route responses into the caches or the bypass slot
        if let Some(packet) = self.response_queue.first() {
            match packet.fetch.access_kind() {
                AccessKind::TEXTURE_ACC_R => {
                    if self.tex_l1.has_free_fill_port() {
                        let ic::Packet { fetch, time } = self.response_queue.dequeue().unwrap();
                        self.tex_l1.fill(fetch, time);
                    }
                }
                AccessKind::CONST_ACC_R => {
                    if self.const_l1.has_free_fill_port() {
                        let ic::Packet { fetch, time } = self.response_queue.dequeue().unwrap();
                        self.const_l1.fill(fetch, time);
                    }
                }
                _ => {
                    if packet.fetch.kind == mem_fetch::Kind::WRITE_ACK {
                        let packet = self.response_queue.dequeue().unwrap();
                        Self::store_ack(warps, &packet.fetch);
                    } else {
                        debug_assert!(!packet.fetch.is_write());
                        // replies the L1 is not waiting on bypassed the cache
                        if self.data_l1.inner.waiting_for_any_fill(&packet.fetch) {
                            if self.data_l1.has_free_fill_port() {
                                let ic::Packet { fetch, time } =
                                    self.response_queue.dequeue().unwrap();
                                self.data_l1.fill(fetch, time);
                            }
                        } else if self.next_global.is_none() {
                            let ic::Packet { mut fetch, .. } =
                                self.response_queue.dequeue().unwrap();
                            fetch.set_status(mem_fetch::Status::IN_SHADER_FETCHED, cycle);
                            self.next_global = Some(fetch);
                        }
                    }
                }
            }
        }

        // cache internals
        self.data_l1.cycle(mem_port, cycle);
        self.const_l1.cycle(mem_port, cycle);
        self.tex_l1.cycle(mem_port, cycle);
        self.l1_latency_queue_cycle(scoreboard, warps, stats, cycle);

        let mut stall = false;
        self.shared_cycle(&mut stall);
        self.constant_cycle(scoreboard, stats, &mut stall, cycle);
        self.texture_cycle(&mut stall, cycle);
        self.memory_cycle(warps, mem_port, &mut stall, cycle);

        if stall {
            return;
        }

        // retire the dispatch register
        let Some(dispatch) = self.inner.dispatch_reg.as_ref() else {
            return;
        };
        let warp_id = dispatch.warp_id;
        if dispatch.is_load() {
            if dispatch.memory_space == Some(MemorySpace::Shared) {
                // shared loads travel the latency pipeline
                let slot_idx = self.config.shared_memory_latency - 1;
                if self.inner.pipeline_reg[slot_idx].is_none() {
                    let dispatch = self.inner.dispatch_reg.take().unwrap();
                    self.inner.pipeline_reg[slot_idx] = Some(dispatch);
                }
            } else {
                let mut dispatch = self.inner.dispatch_reg.take().unwrap();
                let pending = self.pending_writes.entry(warp_id).or_default();
                let has_pending = dispatch
                    .outputs()
                    .any(|reg| pending.get(reg).copied().unwrap_or(0) > 0);
                if !has_pending {
                    // every access hit; registers whose entry is already
                    // gone were completed by the hit path
                    let mut completed_here = false;
                    for reg in dispatch.outputs() {
                        if pending.remove(reg).is_some() {
                            scoreboard.release(warp_id, *reg);
                            completed_here = true;
                        }
                    }
                    if completed_here {
                        crate::core::warp_inst_complete(&mut dispatch, stats);
                    }
                }
                warps[warp_id].num_instr_in_pipeline -= 1;
            }
        } else {
            // stores and memory barriers exit the pipeline here
            let mut dispatch = self.inner.dispatch_reg.take().unwrap();
            debug_assert_eq!(dispatch.outputs().count(), 0);
            warps[warp_id].num_instr_in_pipeline -= 1;
            crate::core::warp_inst_complete(&mut dispatch, stats);
        }
    }
}
