use super::{
    barrier, cache, config, fifo::Fifo, func_unit as fu, instruction::WarpInstruction,
    interconn as ic, kernel::Kernel, mcu, mem_fetch, opcodes,
    operand_collector as opcoll, register_set::RegisterSet, scheduler as sched,
    scoreboard::Scoreboard, warp::Warp, UidGenerator,
};
use crate::instruction::{MemorySpace, PROGRAM_MEM_START};
use bitvec::{array::BitArray, BitArr};
use color_eyre::eyre;
use console::style;
use std::sync::Arc;
use strum::IntoEnumIterator;

/// Pipeline registers between the core's stages.
#[derive(strum::EnumIter, strum::EnumCount, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum PipelineStage {
    ID_OC_SP = 0,
    ID_OC_DP = 1,
    ID_OC_INT = 2,
    ID_OC_SFU = 3,
    ID_OC_MEM = 4,
    OC_EX_SP = 5,
    OC_EX_DP = 6,
    OC_EX_INT = 7,
    OC_EX_SFU = 8,
    OC_EX_MEM = 9,
    EX_WB = 10,
}

type ResultBus = BitArr!(for fu::MAX_ALU_LATENCY);

#[derive(Debug, Default)]
struct InstrFetchBuffer {
    valid: bool,
    warp_id: usize,
}

/// Count a completed warp instruction.
pub fn warp_inst_complete(instr: &mut WarpInstruction, stats: &mut stats::Stats) {
    stats.sim.instructions += instr.active_thread_count() as u64;
}

/// One shader core.
///
/// Stages are advanced in reverse order each cycle (writeback, execute,
/// issue, operand collect, decode, fetch) so no instruction traverses two
/// stages in one cycle.
pub struct Core {
    pub core_id: usize,
    pub cluster_id: usize,
    /// Core id across all clusters.
    pub global_core_id: usize,
    pub config: Arc<config::GPU>,
    mem_controller: Arc<mcu::MemoryController>,
    instr_uids: UidGenerator,
    fetch_uids: UidGenerator,

    pub current_kernel: Option<Arc<Kernel>>,
    pub warps: Vec<Warp>,
    thread_active: Vec<bool>,
    pub instr_l1: cache::ReadOnly,
    instr_fetch_buffer: InstrFetchBuffer,
    last_warp_fetched: Option<usize>,

    pub scoreboard: Scoreboard,
    pub operand_collector: opcoll::RegisterFileUnit,
    pub pipeline_reg: Vec<RegisterSet>,
    pub schedulers: Vec<sched::Scheduler>,
    scheduler_issue_priority: usize,
    alu_units: Vec<fu::PipelinedUnit>,
    /// The OC|EX register each ALU unit drains.
    alu_issue_ports: Vec<PipelineStage>,
    pub ldst_unit: fu::LoadStoreUnit,
    result_busses: Vec<ResultBus>,
    pub barriers: barrier::BarrierSet,

    /// Threads left per hardware block slot.
    block_status: Vec<usize>,
    num_active_blocks: usize,
    num_active_warps: usize,
    num_active_threads: usize,
    dynamic_warp_id: usize,
    max_blocks_per_shader: usize,
    thread_block_size: usize,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("core_id", &self.core_id)
            .field("cluster_id", &self.cluster_id)
            .finish()
    }
}

impl Core {
    pub fn new(
        core_id: usize,
        cluster_id: usize,
        config: Arc<config::GPU>,
        mem_controller: Arc<mcu::MemoryController>,
        fetch_uids: UidGenerator,
        instr_uids: UidGenerator,
    ) -> Self {
        let global_core_id = config.global_core_id(cluster_id, core_id);
        let max_warps = config.max_warps_per_core();

        let warps = (0..max_warps).map(|_| Warp::default()).collect();
        let thread_active = vec![false; config.max_threads_per_core];

        let instr_l1 = cache::ReadOnly::new(
            format!("core-{cluster_id}-{core_id}-L1I"),
            global_core_id,
            (&config.inst_cache_l1).into(),
        );

        let scoreboard = Scoreboard::new(core_id, cluster_id, max_warps);
        let barriers = barrier::BarrierSet::new(
            config.max_concurrent_blocks_per_core,
            config.max_barriers_per_block,
        );

        let pipeline_reg: Vec<_> = PipelineStage::iter()
            .map(|stage| RegisterSet::new(stage, config.pipeline_width(stage)))
            .collect();

        let mut schedulers: Vec<_> = (0..config.num_schedulers_per_core)
            .map(|id| sched::Scheduler::new(id, config.scheduler))
            .collect();
        for warp_id in 0..max_warps {
            // distribute warps evenly over the schedulers
            schedulers[warp_id % config.num_schedulers_per_core].add_supervised_warp(warp_id);
        }

        let mut alu_units = Vec::new();
        let mut alu_issue_ports = Vec::new();
        for unit_id in 0..config.num_sp_units {
            alu_units.push(fu::PipelinedUnit::new(
                unit_id,
                fu::Kind::Sp,
                config.max_sp_latency,
                unit_id,
            ));
            alu_issue_ports.push(PipelineStage::OC_EX_SP);
        }
        for unit_id in 0..config.num_int_units {
            alu_units.push(fu::PipelinedUnit::new(
                unit_id,
                fu::Kind::Int,
                config.max_int_latency,
                unit_id,
            ));
            alu_issue_ports.push(PipelineStage::OC_EX_INT);
        }
        for unit_id in 0..config.num_sfu_units {
            alu_units.push(fu::PipelinedUnit::new(
                unit_id,
                fu::Kind::Sfu,
                config.max_sfu_latency,
                unit_id,
            ));
            alu_issue_ports.push(PipelineStage::OC_EX_SFU);
        }
        for unit_id in 0..config.num_dp_units {
            alu_units.push(fu::PipelinedUnit::new(
                unit_id,
                fu::Kind::Dp,
                config.max_dp_latency,
                unit_id,
            ));
            alu_issue_ports.push(PipelineStage::OC_EX_DP);
        }

        let ldst_unit = fu::LoadStoreUnit::new(
            core_id,
            cluster_id,
            Arc::clone(&config),
            Arc::clone(&mem_controller),
            fetch_uids.clone(),
        );

        let result_busses = (0..pipeline_reg[PipelineStage::EX_WB as usize].size())
            .map(|_| BitArray::ZERO)
            .collect();

        let mut operand_collector = opcoll::RegisterFileUnit::new(Arc::clone(&config));
        Self::init_operand_collector(&mut operand_collector, &config);

        Self {
            core_id,
            cluster_id,
            global_core_id,
            mem_controller,
            instr_uids,
            fetch_uids,
            current_kernel: None,
            warps,
            thread_active,
            instr_l1,
            instr_fetch_buffer: InstrFetchBuffer::default(),
            last_warp_fetched: None,
            scoreboard,
            operand_collector,
            pipeline_reg,
            schedulers,
            scheduler_issue_priority: 0,
            alu_units,
            alu_issue_ports,
            ldst_unit,
            result_busses,
            barriers,
            block_status: vec![0; config.max_concurrent_blocks_per_core],
            num_active_blocks: 0,
            num_active_warps: 0,
            num_active_threads: 0,
            dynamic_warp_id: 0,
            max_blocks_per_shader: 0,
            thread_block_size: 0,
            config,
        }
    }

    fn init_operand_collector(collector: &mut opcoll::RegisterFileUnit, config: &config::GPU) {
        use opcoll::Kind as CuKind;
        collector.add_cu_set(
            CuKind::GEN_CUS,
            config.operand_collector_num_units_gen,
            config.operand_collector_num_out_ports_gen,
        );
        for _ in 0..config.operand_collector_num_in_ports_gen {
            let mut in_stages = vec![PipelineStage::ID_OC_SP, PipelineStage::ID_OC_MEM];
            let mut out_stages = vec![PipelineStage::OC_EX_SP, PipelineStage::OC_EX_MEM];
            if config.num_sfu_units > 0 {
                in_stages.push(PipelineStage::ID_OC_SFU);
                out_stages.push(PipelineStage::OC_EX_SFU);
            }
            if config.num_int_units > 0 {
                in_stages.push(PipelineStage::ID_OC_INT);
                out_stages.push(PipelineStage::OC_EX_INT);
            }
            if config.num_dp_units > 0 {
                in_stages.push(PipelineStage::ID_OC_DP);
                out_stages.push(PipelineStage::OC_EX_DP);
            }
            collector.add_port(in_stages, out_stages, vec![CuKind::GEN_CUS]);
        }

        if config.enable_specialized_operand_collector {
            collector.add_cu_set(
                CuKind::SP_CUS,
                config.operand_collector_num_units_sp,
                config.operand_collector_num_out_ports_sp,
            );
            collector.add_cu_set(
                CuKind::MEM_CUS,
                config.operand_collector_num_units_mem,
                config.operand_collector_num_out_ports_mem,
            );
            for _ in 0..config.operand_collector_num_in_ports_sp {
                collector.add_port(
                    vec![PipelineStage::ID_OC_SP],
                    vec![PipelineStage::OC_EX_SP],
                    vec![CuKind::SP_CUS, CuKind::GEN_CUS],
                );
            }
            for _ in 0..config.operand_collector_num_in_ports_mem {
                collector.add_port(
                    vec![PipelineStage::ID_OC_MEM],
                    vec![PipelineStage::OC_EX_MEM],
                    vec![CuKind::MEM_CUS, CuKind::GEN_CUS],
                );
            }
        }

        collector.init(config.num_reg_banks);
    }

    #[must_use]
    pub fn id(&self) -> (usize, usize) {
        (self.cluster_id, self.core_id)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.num_active_blocks > 0
    }

    #[must_use]
    pub fn num_active_blocks(&self) -> usize {
        self.num_active_blocks
    }

    /// Threads that have not yet exited.
    #[must_use]
    pub fn not_completed(&self) -> usize {
        self.num_active_threads
    }

    pub fn cache_flush(&mut self) {
        self.ldst_unit.flush();
    }

    pub fn cache_invalidate(&mut self) {
        self.ldst_unit.invalidate();
    }

    #[must_use]
    pub fn ldst_unit_response_buffer_full(&self) -> bool {
        self.ldst_unit.response_buffer_full()
    }

    #[must_use]
    pub fn fetch_unit_response_buffer_full(&self) -> bool {
        false
    }

    /// An instruction-fetch reply arrived from the interconnect.
    pub fn accept_fetch_response(&mut self, mut fetch: mem_fetch::MemFetch, time: u64) {
        fetch.set_status(mem_fetch::Status::IN_SHADER_FETCHED, time);
        self.instr_l1.fill(fetch, time);
    }

    /// A data reply arrived from the interconnect.
    pub fn accept_ldst_unit_response(&mut self, fetch: mem_fetch::MemFetch, time: u64) {
        self.ldst_unit.fill(fetch, time);
    }

    pub fn set_kernel(&mut self, kernel: Arc<Kernel>) {
        log::debug!("kernel {} bound to core {:?}", kernel, self.id());
        self.current_kernel = Some(kernel);
    }

    /// One core cycle, stages in reverse order.
    pub fn cycle(
        &mut self,
        icnt_port: &mut Fifo<ic::Packet<mem_fetch::MemFetch>>,
        stats: &mut stats::Stats,
        cycle: u64,
    ) -> eyre::Result<()> {
        if !self.is_active() && self.not_completed() == 0 {
            return Ok(());
        }
        log::debug!(
            "{} active blocks={} threads={}",
            style(format!("cycle {cycle:03} core {:?}", self.id())).blue(),
            self.num_active_blocks,
            self.num_active_threads,
        );
        self.writeback(stats);
        self.execute(icnt_port, stats, cycle);
        self.issue(stats, cycle)?;
        for _ in 0..self.config.reg_file_port_throughput {
            self.operand_collector.step(&mut self.pipeline_reg);
        }
        for _ in 0..self.config.inst_fetch_throughput {
            self.decode(cycle);
            self.fetch(icnt_port, stats, cycle);
        }
        Ok(())
    }

    /// Drain completed instructions from the EX|WB registers into the
    /// register file.
    fn writeback(&mut self, stats: &mut stats::Stats) {
        let exec_writeback = &mut self.pipeline_reg[PipelineStage::EX_WB as usize];
        while let Some(mut ready) = exec_writeback.get_ready_mut().and_then(Option::take) {
            // The writeback can generally stall on the banked register file,
            // but the operand collector's allocations were just reset, so a
            // single-destination instruction always succeeds. Multi-register
            // writebacks are allowed through unstalled.
            self.operand_collector.writeback(&ready);
            self.scoreboard.release_all(&ready);
            self.warps[ready.warp_id].num_instr_in_pipeline -= 1;
            warp_inst_complete(&mut ready, stats);
        }
    }

    /// Advance the functional units and issue from the OC|EX registers.
    fn execute(
        &mut self,
        icnt_port: &mut Fifo<ic::Packet<mem_fetch::MemFetch>>,
        stats: &mut stats::Stats,
        cycle: u64,
    ) {
        for result_bus in &mut self.result_busses {
            result_bus.shift_left(1);
        }

        // the EX_WB register set lives past all OC|EX sets
        let (operand_regs, writeback_regs) =
            self.pipeline_reg.split_at_mut(PipelineStage::EX_WB as usize);
        let result_port = &mut writeback_regs[0];

        for (unit_idx, unit) in self.alu_units.iter_mut().enumerate() {
            unit.cycle(result_port);

            let issue_port = self.alu_issue_ports[unit_idx];
            let issue_reg = &mut operand_regs[issue_port as usize];
            let ready_slot = if self.config.sub_core_model {
                issue_reg.get_ready_sub_core_mut(unit.issue_reg_id)
            } else {
                issue_reg.get_ready_mut()
            };
            let Some(slot) = ready_slot else {
                continue;
            };
            let Some(instr) = slot.as_ref() else {
                continue;
            };
            if !unit.can_issue(instr) {
                continue;
            }
            // ALU pipelines are not stallable: reserve a result bus slot
            let latency = instr.latency.min(fu::MAX_ALU_LATENCY - 1);
            let result_bus = self
                .result_busses
                .iter_mut()
                .find(|bus| !bus[latency]);
            if let Some(result_bus) = result_bus {
                result_bus.set(latency, true);
                unit.issue(slot.take().unwrap());
            }
        }

        // the memory pipeline
        self.ldst_unit.cycle(
            &mut self.operand_collector,
            &mut self.scoreboard,
            &mut self.warps,
            stats,
            icnt_port,
            cycle,
        );
        let mem_issue_reg = &mut operand_regs[PipelineStage::OC_EX_MEM as usize];
        if let Some(slot) = mem_issue_reg.get_ready_mut() {
            if let Some(instr) = slot.as_ref() {
                if self.ldst_unit.can_issue(instr) {
                    let instr = slot.take().unwrap();
                    self.ldst_unit.issue(instr, stats);
                }
            }
        }
    }

    /// Pick ready warps and move their instructions into the ID|OC stage.
    fn issue(&mut self, stats: &mut stats::Stats, cycle: u64) -> eyre::Result<()> {
        let num_schedulers = self.schedulers.len();
        for i in 0..num_schedulers {
            let scheduler_idx = (self.scheduler_issue_priority + i) % num_schedulers;
            self.issue_from_scheduler(scheduler_idx, stats, cycle)?;
        }
        self.scheduler_issue_priority = (self.scheduler_issue_priority + 1) % num_schedulers;
        Ok(())
    }

    fn issue_from_scheduler(
        &mut self,
        scheduler_idx: usize,
        stats: &mut stats::Stats,
        cycle: u64,
    ) -> eyre::Result<()> {
        use opcodes::ArchOp;

        // release memory barriers whose writes have drained
        for warp_id in self.schedulers[scheduler_idx].supervised_warps.clone() {
            if self.warps[warp_id].waiting_for_memory_barrier
                && self.scoreboard.pending_writes(warp_id).is_empty()
            {
                self.warps[warp_id].waiting_for_memory_barrier = false;
            }
        }

        let order = self.schedulers[scheduler_idx].prioritized_warps(&self.warps);
        let max_issue = self.config.max_instruction_issue_per_warp;
        let dual_issue_diff_units = self.config.dual_issue_only_to_different_exec_units;

        let mut valid_inst = false;
        let mut ready_inst = false;
        let mut issued_inst = false;

        for (supervised_idx, warp_id) in order {
            if self.warps[warp_id].done_exit() {
                continue;
            }
            if self.warps[warp_id].waiting() || self.barriers.is_waiting_at_barrier(warp_id) {
                continue;
            }

            let mut issued = 0;
            let mut checked = 0;
            let mut prev_issue_stage: Option<PipelineStage> = None;

            while checked < max_issue && checked <= issued && issued < max_issue {
                let Some(instr) = self.warps[warp_id].ibuffer_peek() else {
                    break;
                };
                valid_inst = true;

                if self.scoreboard.has_collision(warp_id, instr) {
                    log::trace!("warp {warp_id} fails scoreboard");
                    break;
                }
                ready_inst = true;

                let scheduler_id = self.schedulers[scheduler_idx].id;
                let stage = match instr.opcode.category {
                    ArchOp::LOAD_OP | ArchOp::STORE_OP | ArchOp::MEMORY_BARRIER_OP => {
                        Some(PipelineStage::ID_OC_MEM)
                    }
                    ArchOp::BARRIER_OP => None,
                    ArchOp::SFU_OP => Some(PipelineStage::ID_OC_SFU),
                    ArchOp::DP_OP if self.config.num_dp_units > 0 => Some(PipelineStage::ID_OC_DP),
                    ArchOp::DP_OP => Some(PipelineStage::ID_OC_SFU),
                    ArchOp::INT_OP | ArchOp::ALU_OP if self.config.num_int_units > 0 => {
                        Some(PipelineStage::ID_OC_INT)
                    }
                    _ => Some(PipelineStage::ID_OC_SP),
                };

                match stage {
                    None => {
                        // barriers complete at issue
                        let mut instr = self.warps[warp_id].ibuffer_take().unwrap();
                        instr.uid = self.instr_uids.next_id();
                        let block_hw_id = self.warps[warp_id].block_hw_id;
                        let barrier = instr.barrier.expect("barrier instruction");
                        self.barriers
                            .warp_reached_barrier(block_hw_id, warp_id, &barrier);
                        self.warps[warp_id].num_instr_in_pipeline -= 1;
                        warp_inst_complete(&mut instr, stats);
                        self.warps[warp_id].ibuffer_step();
                        issued += 1;
                        issued_inst = true;
                    }
                    Some(stage) => {
                        let has_free = if self.config.sub_core_model {
                            self.pipeline_reg[stage as usize].has_free_sub_core(scheduler_id)
                        } else {
                            self.pipeline_reg[stage as usize].has_free()
                        };
                        let diff_unit_ok = !dual_issue_diff_units
                            || prev_issue_stage != Some(stage);

                        if has_free && diff_unit_ok {
                            let instr = self.warps[warp_id].ibuffer_take().unwrap();
                            self.issue_warp(stage, warp_id, instr, scheduler_id, cycle)?;
                            self.warps[warp_id].ibuffer_step();
                            issued += 1;
                            issued_inst = true;
                            prev_issue_stage = Some(stage);
                        } else {
                            log::trace!("warp {warp_id}: no free {stage:?} register");
                        }
                    }
                }
                checked += 1;
            }

            if issued > 0 {
                self.schedulers[scheduler_idx].issued(supervised_idx, issued);
                if issued == 1 {
                    stats.scheduler.num_single_issue += 1;
                } else {
                    stats.scheduler.num_dual_issue += 1;
                }
                break;
            }
        }

        if !valid_inst {
            stats.scheduler.issue_raw_hazard_stall += 1;
        } else if !ready_inst {
            stats.scheduler.issue_control_hazard_stall += 1;
        } else if !issued_inst {
            stats.scheduler.issue_pipeline_stall += 1;
        }
        Ok(())
    }

    /// Move one instruction into the ID|OC register of `stage`.
    fn issue_warp(
        &mut self,
        stage: PipelineStage,
        warp_id: usize,
        mut instr: WarpInstruction,
        scheduler_id: usize,
        cycle: u64,
    ) -> eyre::Result<()> {
        instr.uid = self.instr_uids.next_id();
        instr.warp_id = warp_id;
        instr.issue_cycle = Some(cycle);
        instr.dispatch_delay_cycles = instr.initiation_interval;
        instr.scheduler_id = Some(scheduler_id);

        let warp = &mut self.warps[warp_id];

        // lanes executing their exit retire here
        if instr.opcode.category == opcodes::ArchOp::EXIT_OPS {
            for lane in 0..self.config.warp_size {
                if instr.active_mask[lane] {
                    warp.set_thread_completed(lane);
                }
            }
        }

        if instr.opcode.category == opcodes::ArchOp::MEMORY_BARRIER_OP {
            warp.waiting_for_memory_barrier = true;
        }

        // local accesses of more than 4 bytes split into 4B chunks in a
        // remapped, interleaved address space
        if instr.memory_space == Some(MemorySpace::Local)
            && (instr.is_load() || instr.is_store())
        {
            let total_cores = self.config.total_cores();
            for lane in 0..self.config.warp_size {
                if !instr.active_mask[lane] {
                    continue;
                }
                let thread_id = self.config.warp_size * warp_id + lane;
                let translated = self.translate_local_memaddr(
                    instr.threads[lane].mem_req_addr[0],
                    thread_id,
                    total_cores,
                    instr.data_size,
                );
                instr.set_addresses(lane, translated);
            }
        }

        if instr.is_load() || instr.is_store() {
            if let Some(accesses) = instr.generate_mem_accesses(&self.config) {
                for access in accesses {
                    self.mem_controller.check_in_range(access.addr)?;
                    instr.mem_access_queue.push_back(access);
                }
            }
        }

        if self.warps[warp_id].done() && self.warps[warp_id].functional_done() {
            self.warps[warp_id].ibuffer_flush();
        }

        self.scoreboard.reserve_all(&instr);

        let slot = if self.config.sub_core_model {
            self.pipeline_reg[stage as usize]
                .get_free_sub_core_mut(scheduler_id)
                .expect("free sub-core slot was checked")
        } else {
            self.pipeline_reg[stage as usize]
                .get_free_mut()
                .expect("free slot was checked")
        };
        crate::register_set::move_warp(Some(instr), slot);
        Ok(())
    }

    /// Map a thread-local address into the flat local memory space.
    #[must_use]
    fn translate_local_memaddr(
        &self,
        local_addr: crate::address,
        thread_id: usize,
        num_cores: usize,
        data_size: u32,
    ) -> Vec<crate::address> {
        let (thread_base, max_concurrent_threads) = if self.config.local_mem_map {
            // threads of a block map to contiguous addresses, blocks
            // interleave across cores
            let threads_per_block = self.thread_block_size.max(1);
            let blocks_per_core = self.max_blocks_per_shader.max(1);
            let temp = self.global_core_id + num_cores * (thread_id / threads_per_block);
            let rest = thread_id % threads_per_block;
            let thread_base = 4 * (threads_per_block * temp + rest);
            let max_concurrent_threads = threads_per_block * blocks_per_core * num_cores;
            (thread_base, max_concurrent_threads)
        } else {
            let thread_base =
                4 * (self.config.max_threads_per_core * self.global_core_id + thread_id);
            let max_concurrent_threads = num_cores * self.config.max_threads_per_core;
            (thread_base, max_concurrent_threads)
        };
        debug_assert!(thread_base < 4 * max_concurrent_threads);

        let local_generic_start = self.config.local_mem_base_addr;
        let mut translated = Vec::new();
        if data_size >= 4 {
            // split into 4B words, interleaved across threads
            debug_assert_eq!(data_size % 4, 0);
            debug_assert_eq!(local_addr % 4, 0);
            for i in 0..(data_size / 4) {
                let local_word = local_addr / 4 + u64::from(i);
                let linear = local_word * max_concurrent_threads as u64 * 4
                    + thread_base as u64
                    + local_generic_start;
                translated.push(linear);
            }
        } else {
            let local_word = local_addr / 4;
            let local_word_offset = local_addr % 4;
            debug_assert_eq!((local_addr + u64::from(data_size) - 1) / 4, local_word);
            let linear = local_word * max_concurrent_threads as u64 * 4
                + local_word_offset
                + thread_base as u64
                + local_generic_start;
            translated.push(linear);
        }
        translated
    }

    /// Fill warp instruction buffers from the trace streams.
    fn decode(&mut self, _cycle: u64) {
        let InstrFetchBuffer { valid, warp_id } = self.instr_fetch_buffer;
        if !valid {
            return;
        }

        let warp = &mut self.warps[warp_id];
        let instr1 = warp.next_trace_inst().cloned();
        let instr2 = if instr1.is_some() {
            warp.next_trace_inst().cloned()
        } else {
            None
        };

        for (slot, instr) in [instr1, instr2].into_iter().enumerate() {
            let Some(instr) = instr else {
                break;
            };
            let warp = &mut self.warps[warp_id];
            log::trace!("warp {warp_id}: ibuffer fill slot {slot} with {instr}");
            warp.ibuffer_fill(slot, instr);
            warp.num_instr_in_pipeline += 1;
        }
        self.instr_fetch_buffer.valid = false;
    }

    /// Probe the L1I for the next warp needing instructions; retire warps
    /// that completed.
    fn fetch(
        &mut self,
        icnt_port: &mut Fifo<ic::Packet<mem_fetch::MemFetch>>,
        _stats: &mut stats::Stats,
        cycle: u64,
    ) {
        if !self.instr_fetch_buffer.valid {
            if self.instr_l1.has_ready_accesses() {
                let fetch = self.instr_l1.next_access().unwrap();
                let warp = &mut self.warps[fetch.warp_id];
                warp.has_imiss_pending = false;
                self.instr_fetch_buffer = InstrFetchBuffer {
                    valid: true,
                    warp_id: fetch.warp_id,
                };
            } else {
                let max_warps = self.config.max_warps_per_core();
                for i in 0..max_warps {
                    let last = self.last_warp_fetched.unwrap_or(0);
                    let warp_id = (last + 1 + i) % max_warps;

                    self.retire_warp_if_completed(warp_id);

                    let warp = &self.warps[warp_id];
                    let should_fetch = !warp.functional_done()
                        && !warp.has_imiss_pending
                        && warp.ibuffer_empty();
                    if !should_fetch {
                        continue;
                    }
                    let Some(pc) = warp.pc() else {
                        continue;
                    };
                    self.last_warp_fetched = Some(warp_id);

                    // fetch up to 16 bytes from the line holding pc
                    let ppc = pc as u64 + PROGRAM_MEM_START;
                    let line_size = self.config.inst_cache_l1.line_size as usize;
                    let offset_in_line = pc & (line_size - 1);
                    let num_bytes = 16.min(line_size - offset_in_line);

                    let access = mem_fetch::access::Builder {
                        kind: mem_fetch::access::Kind::INST_ACC_R,
                        addr: ppc,
                        req_size_bytes: num_bytes as u32,
                        is_write: false,
                        warp_active_mask: BitArray::ZERO,
                        byte_mask: mem_fetch::ByteMask::ZERO,
                        sector_mask: mem_fetch::SectorMask::ZERO,
                    }
                    .build();
                    let fetch = mem_fetch::Builder {
                        uid: self.fetch_uids.next_id(),
                        access,
                        instr: None,
                        warp_id,
                        core_id: Some(self.core_id),
                        cluster_id: Some(self.cluster_id),
                        physical_addr: self.mem_controller.decode(ppc),
                        partition_addr: self.mem_controller.partition_address(ppc),
                    }
                    .build();

                    let status = if self.config.perfect_inst_const_cache {
                        cache::RequestStatus::HIT
                    } else {
                        let mut events = Vec::new();
                        self.instr_l1.access(ppc, fetch, &mut events, cycle)
                    };
                    log::trace!("L1I access for warp {warp_id} pc {pc} => {status:?}");

                    match status {
                        cache::RequestStatus::MISS => {
                            self.warps[warp_id].has_imiss_pending = true;
                        }
                        cache::RequestStatus::HIT => {
                            self.instr_fetch_buffer = InstrFetchBuffer {
                                valid: true,
                                warp_id,
                            };
                        }
                        _ => debug_assert_eq!(status, cache::RequestStatus::RESERVATION_FAIL),
                    }
                    break;
                }
            }
        }
        self.instr_l1.cycle(icnt_port, cycle);
    }

    /// A warp whose lanes all exited and whose stores drained is reclaimed.
    fn retire_warp_if_completed(&mut self, warp_id: usize) {
        let warp = &self.warps[warp_id];
        let has_pending_writes = !self.scoreboard.pending_writes(warp_id).is_empty();
        if !(warp.hardware_done() && !has_pending_writes && !warp.done_exit()) {
            return;
        }
        let block_hw_id = warp.block_hw_id;
        let kernel = warp.kernel.clone();

        // the barrier set must see the warp gone before its block deallocates
        self.barriers.warp_exited(warp_id);

        let mut did_exit = false;
        for lane in 0..self.config.warp_size {
            let thread_id = warp_id * self.config.warp_size + lane;
            if self.thread_active[thread_id] {
                self.thread_active[thread_id] = false;
                self.register_thread_in_block_exited(block_hw_id, kernel.as_deref());
                self.num_active_threads -= 1;
                did_exit = true;
            }
        }
        if did_exit {
            self.num_active_warps -= 1;
            self.warps[warp_id].done_exit = true;
        }
    }

    fn register_thread_in_block_exited(&mut self, block_hw_id: usize, kernel: Option<&Kernel>) {
        debug_assert!(block_hw_id < self.block_status.len());
        debug_assert!(self.block_status[block_hw_id] > 0);
        self.block_status[block_hw_id] -= 1;

        if self.block_status[block_hw_id] > 0 {
            return;
        }

        // this was the last thread of the block
        self.barriers.deallocate(block_hw_id);
        self.num_active_blocks -= 1;
        if let Some(kernel) = kernel {
            kernel.dec_running();
            if self.num_active_blocks == 0 {
                if kernel.no_more_blocks_to_run()
                    && !kernel.running()
                    && self
                        .current_kernel
                        .as_ref()
                        .is_some_and(|current| current.id() == kernel.id())
                {
                    self.current_kernel = None;
                }
            }
        } else if self.num_active_blocks == 0 {
            self.current_kernel = None;
        }
    }

    /// Can another block of this kernel be issued to the core?
    #[must_use]
    pub fn can_issue_block(&self, kernel: &Kernel) -> bool {
        let Ok(max_blocks) = self.config.max_blocks(kernel) else {
            return false;
        };
        self.num_active_blocks < max_blocks
    }

    /// Bind the next block of the kernel to this core.
    pub fn issue_block(&mut self, kernel: &Arc<Kernel>, stats: &mut stats::Stats, cycle: u64) {
        debug_assert!(self.can_issue_block(kernel));
        self.max_blocks_per_shader = self.config.max_blocks(kernel).unwrap();
        self.thread_block_size = self.config.threads_per_block_padded(kernel);

        let free_block_hw_id = (0..self.max_blocks_per_shader)
            .find(|id| self.block_status[*id] == 0)
            .expect("free block slot");

        let threads_per_block = kernel.threads_per_block();
        let padded_threads_per_block = self.thread_block_size;
        let start_thread = free_block_hw_id * padded_threads_per_block;
        let end_thread = start_thread + threads_per_block;

        let start_warp = start_thread / self.config.warp_size;
        let end_warp = end_thread.div_ceil(self.config.warp_size);

        // bind the trace streams of the next block to the hardware warps
        let Some(block) = kernel.next_block_and_traces(
            &mut self.warps[start_warp..end_warp],
            &self.config,
        ) else {
            return;
        };
        log::debug!(
            "core {:?}: issue block {} of kernel {}",
            self.id(),
            block,
            kernel
        );

        let mut warp_mask: barrier::WarpMask = BitArray::ZERO;
        let mut num_threads_in_block = 0;
        for thread_id in start_thread..end_thread {
            self.thread_active[thread_id] = true;
            num_threads_in_block += 1;
            warp_mask.set(thread_id / self.config.warp_size, true);
        }
        self.block_status[free_block_hw_id] = num_threads_in_block;

        for warp_id in start_warp..end_warp {
            let mut active_mask: crate::warp::ActiveMask = BitArray::ZERO;
            let mut num_active = 0;
            for lane in 0..self.config.warp_size {
                let thread_id = warp_id * self.config.warp_size + lane;
                if thread_id < end_thread {
                    active_mask.set(lane, true);
                    num_active += 1;
                }
            }
            let warp = &mut self.warps[warp_id];
            warp.init(
                free_block_hw_id,
                warp_id,
                self.dynamic_warp_id,
                active_mask,
                Arc::clone(kernel),
            );
            warp.launch_simt_stack();
            self.dynamic_warp_id += 1;
            self.num_active_warps += 1;
            self.num_active_threads += num_active;
        }

        self.barriers.allocate(free_block_hw_id, warp_mask);
        kernel.inc_running();
        kernel.set_started(cycle);
        self.num_active_blocks += 1;
        stats.sim.num_blocks += 1;
    }
}
