use crate::{
    cluster::Cluster, config, interconn as ic, kernel_manager::KernelManager, mcu, mem_fetch,
    mem_partition_unit::MemoryPartitionUnit, mem_sub_partition, streams::StreamManager, trace,
    Kernel, UidGenerator,
};
use color_eyre::eyre::{self, WrapErr};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use trace_model::Command;

/// The watchdog fired: no instruction completed while kernels were resident.
#[derive(thiserror::Error, Debug)]
#[error("deadlock detected: no instruction completed for {threshold} cycles (cycle {cycle})\n{snapshot}")]
pub struct DeadlockDetected {
    pub cycle: u64,
    pub threshold: u64,
    pub snapshot: String,
}

/// How a simulation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// All commands processed and all kernels drained.
    Completed,
    /// A cycle, instruction or block limit was reached; not an error.
    LimitReached,
}

/// The top-level cycle driver.
///
/// Owns the clusters, the memory partitions and the interconnect, and
/// advances them in a fixed order each cycle, so identical configurations
/// and traces produce identical statistics.
pub struct Simulator {
    pub config: Arc<config::GPU>,
    pub stats: stats::Stats,
    mem_controller: Arc<mcu::MemoryController>,
    interconn: ic::Interconnect<mem_fetch::MemFetch>,
    pub clusters: Vec<Cluster>,
    pub mem_partition_units: Vec<MemoryPartitionUnit>,
    pub kernel_manager: KernelManager,
    stream_manager: StreamManager,

    traces_dir: PathBuf,
    commands: VecDeque<Command>,
    /// Kernels read from the command list, waiting to launch.
    kernel_window: VecDeque<Arc<Kernel>>,

    cycle: u64,
    last_cluster_issue: usize,
    /// Deadlock watchdog state.
    instructions_last_progress: u64,
    cycle_last_progress: u64,
}

impl Simulator {
    pub fn new(config: Arc<config::GPU>, traces_dir: PathBuf) -> eyre::Result<Self> {
        config.validate()?;
        let mem_controller = Arc::new(mcu::MemoryController::new(&config)?);

        let topology = match &config.interconnect_file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .open(path)
                    .wrap_err_with(|| format!("failed to open topology {}", path.display()))?;
                ic::Topology::parse(std::io::BufReader::new(file))?
            }
            None => ic::Topology::star(config.total_nodes()),
        };
        if topology.num_nodes() != config.total_nodes() {
            eyre::bail!(
                "topology has {} nodes but the configuration needs {} ({} clusters + {} sub partitions)",
                topology.num_nodes(),
                config.total_nodes(),
                config.num_simt_clusters,
                config.total_sub_partitions(),
            );
        }
        let interconn = ic::Interconnect::new(topology, config.interconnect.clone());

        let fetch_uids = UidGenerator::new();
        let instr_uids = UidGenerator::new();

        let clusters = (0..config.num_simt_clusters)
            .map(|cluster_id| {
                Cluster::new(
                    cluster_id,
                    Arc::clone(&config),
                    Arc::clone(&mem_controller),
                    fetch_uids.clone(),
                    instr_uids.clone(),
                )
            })
            .collect();
        let mem_partition_units = (0..config.num_memory_controllers)
            .map(|id| {
                MemoryPartitionUnit::new(
                    id,
                    Arc::clone(&config),
                    Arc::clone(&mem_controller),
                    fetch_uids.clone(),
                )
            })
            .collect();

        let stats = stats::Stats::new(
            config.total_cores(),
            config.total_sub_partitions(),
            config.num_memory_controllers,
            config.dram_timing.num_banks,
        );
        let kernel_manager = KernelManager::new(Arc::clone(&config));

        Ok(Self {
            stats,
            mem_controller,
            interconn,
            clusters,
            mem_partition_units,
            kernel_manager,
            stream_manager: StreamManager::default(),
            traces_dir,
            commands: VecDeque::new(),
            kernel_window: VecDeque::new(),
            cycle: 0,
            last_cluster_issue: config.num_simt_clusters - 1,
            instructions_last_progress: 0,
            cycle_last_progress: 0,
            config,
        })
    }

    pub fn add_commands(&mut self, commands: Vec<Command>) {
        self.commands.extend(commands);
    }

    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.cycle
    }

    /// Fill the kernel window from the command list, executing copies.
    pub fn process_commands(&mut self) -> eyre::Result<()> {
        while self.kernel_window.len() < self.config.kernel_window_size()
            && !self.commands.is_empty()
        {
            match self.commands.pop_front().unwrap() {
                Command::MemcpyHtoD {
                    dest_device_addr,
                    num_bytes,
                } => self.memcopy_to_gpu(dest_device_addr, num_bytes)?,
                Command::KernelLaunch { id, trace_file } => {
                    let kernel =
                        trace::read_kernel(&self.traces_dir, id, &trace_file, &self.config)?;
                    self.kernel_window.push_back(Arc::new(kernel));
                }
            }
        }
        Ok(())
    }

    /// Queue a kernel directly, bypassing the command list.
    pub fn launch_kernel(&mut self, kernel: Kernel) -> Arc<Kernel> {
        let kernel = Arc::new(kernel);
        self.kernel_window.push_back(Arc::clone(&kernel));
        kernel
    }

    /// A host-to-device copy warms the L2 slices the span maps to.
    pub fn memcopy_to_gpu(&mut self, addr: crate::address, num_bytes: u64) -> eyre::Result<()> {
        log::debug!("memcopy: {num_bytes} bytes to {addr:#x}");
        self.mem_controller.check_in_range(addr)?;
        self.mem_controller
            .check_in_range(addr + num_bytes.saturating_sub(1))?;
        if !self.config.fill_l2_on_memcopy {
            return Ok(());
        }
        let chunk_size = u64::from(mem_sub_partition::SECTOR_SIZE);
        let mut transferred = 0;
        while transferred < num_bytes {
            let write_addr = addr + transferred;
            let mut sector_mask = mem_fetch::SectorMask::ZERO;
            sector_mask.set(((write_addr % 128) / chunk_size) as usize, true);
            let physical = self.mem_controller.decode(write_addr);
            let global_sub_id = physical.sub_partition as usize;
            let partition_id =
                global_sub_id / self.config.num_sub_partitions_per_memory_controller;
            self.mem_partition_units[partition_id].handle_memcpy_to_gpu(
                write_addr,
                global_sub_id,
                sector_mask,
                self.cycle,
            );
            transferred += chunk_size;
        }
        Ok(())
    }

    /// Launch every windowed kernel whose stream is idle, while the window
    /// allows it.
    pub fn launch_kernels(&mut self) {
        for kernel in &self.kernel_window {
            let stream_busy = self.stream_manager.is_busy(kernel.config.stream_id);
            if stream_busy || kernel.launched() || !self.kernel_manager.can_start_kernel() {
                continue;
            }
            let launch_latency = self.config.kernel_launch_latency
                + kernel.num_blocks() * self.config.block_launch_latency;
            match self
                .kernel_manager
                .try_launch_kernel(Arc::clone(kernel), launch_latency)
            {
                Ok(()) => {
                    log::debug!("launched kernel {kernel} at cycle {}", self.cycle);
                    self.stream_manager.reserve_stream(kernel.config.stream_id);
                    self.stats.sim.kernels_launched += 1;
                }
                Err(err) => log::debug!("kernel {kernel} not launched: {err}"),
            }
        }
    }

    /// Anything in flight?
    #[must_use]
    pub fn active(&self) -> bool {
        self.kernel_manager.more_blocks_to_run()
            || self.clusters.iter().any(|cluster| cluster.not_completed() > 0)
            || self.mem_partition_units.iter().any(MemoryPartitionUnit::busy)
            || self.interconn.busy()
    }

    fn limit_reached(&self) -> bool {
        let cycle_limit = self
            .config
            .max_cycles
            .is_some_and(|limit| self.cycle >= limit);
        let instruction_limit = self
            .config
            .max_instructions
            .is_some_and(|limit| self.stats.sim.instructions >= limit);
        let block_limit = self
            .config
            .max_blocks
            .is_some_and(|limit| self.stats.sim.num_blocks >= limit);
        cycle_limit || instruction_limit || block_limit
    }

    /// Advance the whole device by one cycle, in the fixed order: memory
    /// partitions, interconnect, cluster ejection, cores, cluster injection.
    pub fn cycle(&mut self) -> eyre::Result<()> {
        // new blocks reach the cores
        self.issue_block_to_core();

        // (1) the memory partitions: DRAM side, then the L2 side and queues
        for partition in &mut self.mem_partition_units {
            partition.dram_cycle(self.cycle);
        }
        for partition in &mut self.mem_partition_units {
            for sub in &mut partition.sub_partitions {
                let node = self.config.mem_id_to_device_id(sub.id);
                if sub.full(mem_sub_partition::NUM_SECTORS) {
                    self.stats.sim.stall_dram_full += 1;
                } else if let Some(fetch) = self.interconn.pop(node) {
                    log::trace!("sub partition {}: got {fetch} from interconnect", sub.id);
                    sub.push(fetch, self.cycle);
                }
                sub.cache_cycle(self.cycle);

                // replies back into the network
                if let Some(reply) = sub.top() {
                    // read replies carry data, write acks only the header
                    let response_size = if reply.is_write() {
                        reply.control_size()
                    } else {
                        reply.size()
                    };
                    let dest_cluster = reply.cluster_id.expect("reply has destination");
                    if self.interconn.has_buffer(node, response_size) {
                        let mut reply = sub.pop().unwrap();
                        reply.set_status(mem_fetch::Status::IN_ICNT_TO_SHADER, self.cycle);
                        self.interconn.push(node, dest_cluster, reply, response_size);
                    }
                }
            }
        }

        // (2) the network moves
        self.interconn.advance();

        // (3) ejection into the clusters
        for cluster in &mut self.clusters {
            cluster.interconn_cycle(&mut self.interconn, &mut self.stats, self.cycle);
        }

        // (4) the core pipelines
        for cluster in &mut self.clusters {
            cluster.cycle(&mut self.stats, self.cycle)?;
        }

        // (5) injection of the cores' outgoing traffic
        for cluster in &mut self.clusters {
            while let Some(packet) = cluster.injection_buffer.first() {
                let dest_node = self.config.mem_id_to_device_id(packet.fetch.sub_partition_id());
                let size = packet.fetch.packet_size();
                if !self.interconn.has_buffer(cluster.cluster_id, size) {
                    break;
                }
                let ic::Packet { mut fetch, .. } = cluster.injection_buffer.dequeue().unwrap();
                fetch.set_status(mem_fetch::Status::IN_ICNT_TO_MEM, self.cycle);
                fetch.inject_cycle.get_or_insert(self.cycle);
                self.interconn
                    .push(cluster.cluster_id, dest_node, fetch, size);
            }
        }

        // (6) bookkeeping
        self.kernel_manager.decrement_launch_latency();
        self.cycle += 1;
        self.stats.sim.cycles = self.cycle;
        Ok(())
    }

    fn issue_block_to_core(&mut self) {
        let num_clusters = self.clusters.len();
        for i in 0..num_clusters {
            let cluster_idx = (self.last_cluster_issue + 1 + i) % num_clusters;
            let issued = self.clusters[cluster_idx].issue_block_to_core(
                &mut self.kernel_manager,
                &mut self.stats,
                self.cycle,
            );
            if issued > 0 {
                self.last_cluster_issue = cluster_idx;
            }
        }
    }

    /// Abort when no instruction completes while kernels are resident.
    fn check_deadlock(&mut self) -> Result<(), DeadlockDetected> {
        if self.stats.sim.instructions != self.instructions_last_progress {
            self.instructions_last_progress = self.stats.sim.instructions;
            self.cycle_last_progress = self.cycle;
            return Ok(());
        }
        let stalled_for = self.cycle - self.cycle_last_progress;
        if stalled_for >= self.config.deadlock_detect_cycles && self.kernel_manager.any_running() {
            return Err(DeadlockDetected {
                cycle: self.cycle,
                threshold: self.config.deadlock_detect_cycles,
                snapshot: self.state_snapshot(),
            });
        }
        Ok(())
    }

    /// A diagnostic dump of every pipeline and queue, for deadlock reports.
    #[must_use]
    pub fn state_snapshot(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for cluster in &self.clusters {
            let _ = writeln!(
                out,
                "cluster {}: response fifo={} injection buffer={}",
                cluster.cluster_id,
                cluster.response_fifo.len(),
                cluster.injection_buffer.len(),
            );
            for core in &cluster.cores {
                let _ = writeln!(
                    out,
                    "  core {}: active blocks={} active threads={}",
                    core.core_id,
                    core.num_active_blocks(),
                    core.not_completed(),
                );
            }
        }
        for partition in &self.mem_partition_units {
            for sub in &partition.sub_partitions {
                let _ = writeln!(
                    out,
                    "sub partition {}: icnt->l2={} l2->dram={} dram->l2={} l2->icnt={} rop={}",
                    sub.id,
                    sub.interconn_to_l2_queue.len(),
                    sub.l2_to_dram_queue.len(),
                    sub.dram_to_l2_queue.len(),
                    sub.l2_to_interconn_queue.len(),
                    sub.rop_queue.len(),
                );
            }
        }
        let _ = writeln!(out, "interconnect busy={}", self.interconn.busy());
        out
    }

    fn cleanup_finished_kernel(&mut self, kernel: &Kernel) {
        log::debug!("kernel {kernel} finished at cycle {}", self.cycle);
        kernel.set_completed(self.cycle);
        self.stream_manager.release_stream(kernel.config.stream_id);
        self.kernel_window
            .retain(|windowed| windowed.id() != kernel.id());
        if self.config.flush_l1_cache {
            for cluster in &mut self.clusters {
                cluster.cache_invalidate();
            }
        }
        if self.config.flush_l2_cache {
            for partition in &mut self.mem_partition_units {
                for sub in &mut partition.sub_partitions {
                    sub.flush_l2();
                }
            }
        }
    }

    /// Drive the simulation until the command list and all kernels drain, a
    /// limit fires, or a deadlock is detected.
    pub fn run_to_completion(&mut self) -> eyre::Result<ExitReason> {
        let mut exit_reason = ExitReason::Completed;
        log::info!("running to completion");

        while !self.commands.is_empty() || !self.kernel_window.is_empty() {
            self.process_commands()?;
            self.launch_kernels();

            let mut finished_kernel = None;
            loop {
                if !self.active() {
                    break;
                }
                if self.limit_reached() {
                    log::info!(
                        "reached limit at cycle {} ({} instructions, {} blocks)",
                        self.cycle,
                        self.stats.sim.instructions,
                        self.stats.sim.num_blocks,
                    );
                    self.kernel_manager.stop_all_running_kernels(self.cycle);
                    exit_reason = ExitReason::LimitReached;
                    break;
                }
                self.cycle()?;
                self.check_deadlock()?;

                finished_kernel = self.kernel_manager.get_finished_kernel();
                if finished_kernel.is_some() {
                    break;
                }
            }

            if let Some(kernel) = finished_kernel {
                self.cleanup_finished_kernel(&kernel);
            } else if exit_reason == ExitReason::LimitReached {
                self.kernel_window.clear();
                break;
            } else if !self.active() && self.commands.is_empty() {
                // kernels that never became active (empty grids) drain here
                while let Some(kernel) = self.kernel_manager.get_finished_kernel() {
                    self.cleanup_finished_kernel(&kernel);
                }
                if self.kernel_window.iter().all(|kernel| kernel.launched()) {
                    break;
                }
            }
        }

        self.finalize_stats();
        Ok(exit_reason)
    }

    /// Gather the per-component counters into the final statistics.
    fn finalize_stats(&mut self) {
        for cluster in &self.clusters {
            for core in &cluster.cores {
                let id = core.global_core_id;
                self.stats.l1i_stats[id] = core.instr_l1.inner.stats.clone();
                self.stats.l1d_stats[id] = core.ldst_unit.data_l1.inner.stats.clone();
                self.stats.l1c_stats[id] = core.ldst_unit.const_l1.inner.stats.clone();
                self.stats.l1t_stats[id] = core.ldst_unit.tex_l1.inner.stats.clone();
            }
        }
        for partition in &self.mem_partition_units {
            for sub in &partition.sub_partitions {
                self.stats.l2d_stats[sub.id] = sub.l2_cache.inner.stats.clone();
            }
            let chip = partition.id;
            let dram = &partition.dram.stats;
            self.stats.dram.bank_reads[chip] = dram.bank_reads[0].clone();
            self.stats.dram.bank_writes[chip] = dram.bank_writes[0].clone();
            self.stats.dram.total_reads += dram.total_reads;
            self.stats.dram.total_writes += dram.total_writes;
            self.stats.dram.row_hits += dram.row_hits;
            self.stats.dram.row_misses += dram.row_misses;
            self.stats.dram.num_activates += dram.num_activates;
            self.stats.dram.num_precharges += dram.num_precharges;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DeadlockDetected, ExitReason, Simulator};
    use crate::{config, trace};
    use color_eyre::eyre;
    use std::path::PathBuf;
    use std::sync::Arc;
    use trace_model::{BlockTrace, Dim, KernelLaunch, KernelTrace, TraceInstruction, WarpTrace};

    const WARP_SIZE: usize = 32;

    fn launch(id: u64, stream_id: u64) -> KernelLaunch {
        KernelLaunch {
            name: format!("kernel-{id}"),
            id,
            trace_file: String::new(),
            grid: Dim::new(1, 1, 1),
            block: Dim::new(WARP_SIZE as u32, 1, 1),
            shared_mem_bytes: 0,
            num_registers: 16,
            stream_id,
            shared_mem_base_addr: 0,
            local_mem_base_addr: 0,
        }
    }

    fn exit_instruction(pc: u32) -> TraceInstruction {
        TraceInstruction {
            pc,
            active_mask: u32::MAX,
            dest_regs: vec![],
            opcode: "EXIT".to_string(),
            src_regs: vec![],
            mem_width: 0,
            addrs: [0; 32],
            block_id: Dim::new(0, 0, 0),
            warp_id: 0,
            instr_idx: 0,
            line: 1,
        }
    }

    fn load_instruction(pc: u32, base: u64, stride: u64) -> TraceInstruction {
        let mut addrs = [0u64; 32];
        for (lane, addr) in addrs.iter_mut().enumerate() {
            *addr = base + stride * lane as u64;
        }
        TraceInstruction {
            pc,
            active_mask: u32::MAX,
            dest_regs: vec![1],
            opcode: "LDG.E".to_string(),
            src_regs: vec![2],
            mem_width: 4,
            addrs,
            block_id: Dim::new(0, 0, 0),
            warp_id: 0,
            instr_idx: 0,
            line: 1,
        }
    }

    fn single_warp_kernel(
        launch: KernelLaunch,
        instructions: Vec<TraceInstruction>,
    ) -> KernelTrace {
        KernelTrace {
            launch,
            blocks: vec![BlockTrace {
                block: Dim::new(0, 0, 0),
                block_id: 0,
                warps: vec![WarpTrace {
                    warp_id: 0,
                    instructions,
                }],
            }],
        }
    }

    fn test_config() -> config::GPU {
        let mut config = config::GPU::default();
        // instruction fetches hit so kernels start immediately
        config.perfect_inst_const_cache = true;
        config
    }

    fn simulator(config: config::GPU) -> eyre::Result<Simulator> {
        Simulator::new(Arc::new(config), PathBuf::from("."))
    }

    fn line_cache_l1() -> config::CacheConfig {
        config::CacheConfig::parse("64:128:6:L:T:M:L:128:8:4", config::CacheKind::Normal).unwrap()
    }

    #[test]
    fn memcpy_and_noop_kernel() -> eyre::Result<()> {
        let config = test_config();
        let mut sim = simulator(config)?;

        sim.memcopy_to_gpu(0x1000, 64)?;
        let kernel = trace::kernel_from_trace(
            single_warp_kernel(launch(0, 0), vec![exit_instruction(0)]),
            &sim.config,
        )?;
        sim.launch_kernel(kernel);

        let exit = sim.run_to_completion()?;
        assert_eq!(exit, ExitReason::Completed);
        // one exit instruction for 32 lanes
        assert_eq!(sim.stats.sim.instructions, WARP_SIZE as u64);
        assert_eq!(sim.stats.sim.kernels_launched, 1);
        assert_eq!(sim.stats.sim.num_blocks, 1);
        // a no-op kernel finishes within the front-end depth
        assert!(sim.stats.sim.cycles < 100);
        // the memcpy warmed the L2 without dirtying lines
        let l2 = sim.stats.l2d_stats.reduce();
        assert_eq!(l2.num_misses(), 0);
        Ok(())
    }

    #[test]
    fn coalesced_load_is_a_single_access() -> eyre::Result<()> {
        let mut config = test_config();
        config.data_cache_l1 = line_cache_l1();
        let mut sim = simulator(config)?;

        sim.memcopy_to_gpu(0x2000, 128)?;
        // 32 lanes load A[tid * 4] from a 128B-aligned base
        let kernel = trace::kernel_from_trace(
            single_warp_kernel(
                launch(0, 0),
                vec![load_instruction(0, 0x2000, 4), exit_instruction(16)],
            ),
            &sim.config,
        )?;
        sim.launch_kernel(kernel);

        let exit = sim.run_to_completion()?;
        assert_eq!(exit, ExitReason::Completed);
        assert_eq!(sim.stats.sim.instructions, 2 * WARP_SIZE as u64);

        let l1d = sim.stats.l1d_stats.reduce();
        use stats::cache::{AccessKind, AccessStat, RequestStatus};
        let reads: u64 = [
            RequestStatus::HIT,
            RequestStatus::HIT_RESERVED,
            RequestStatus::MISS,
            RequestStatus::SECTOR_MISS,
            RequestStatus::MSHR_HIT,
        ]
        .into_iter()
        .map(|status| l1d.count(AccessKind::GLOBAL_ACC_R, AccessStat::Status(status)))
        .sum();
        assert_eq!(reads, 1, "expected exactly one L1D access: {l1d:?}");
        assert_eq!(
            l1d.count(
                AccessKind::GLOBAL_ACC_R,
                AccessStat::Status(RequestStatus::MISS)
            ),
            1
        );
        Ok(())
    }

    #[test]
    fn strided_load_is_uncoalesced() -> eyre::Result<()> {
        let mut config = test_config();
        config.data_cache_l1 = line_cache_l1();
        let mut sim = simulator(config)?;

        // 32 lanes load A[tid * 128]: one access per lane
        let kernel = trace::kernel_from_trace(
            single_warp_kernel(
                launch(0, 0),
                vec![load_instruction(0, 0x8000, 128), exit_instruction(16)],
            ),
            &sim.config,
        )?;
        sim.launch_kernel(kernel);

        let exit = sim.run_to_completion()?;
        assert_eq!(exit, ExitReason::Completed);

        let l1d = sim.stats.l1d_stats.reduce();
        use stats::cache::{AccessKind, AccessStat, RequestStatus};
        assert_eq!(
            l1d.count(
                AccessKind::GLOBAL_ACC_R,
                AccessStat::Status(RequestStatus::MISS)
            ),
            32,
            "expected 32 separate misses: {l1d:?}"
        );
        Ok(())
    }

    #[test]
    fn kernels_on_one_stream_serialize() -> eyre::Result<()> {
        let config = test_config();
        let mut sim = simulator(config)?;

        let first = sim.launch_kernel(trace::kernel_from_trace(
            single_warp_kernel(
                launch(0, 1),
                vec![load_instruction(0, 0x4000, 4), exit_instruction(16)],
            ),
            &sim.config,
        )?);
        let second = sim.launch_kernel(trace::kernel_from_trace(
            single_warp_kernel(launch(1, 1), vec![exit_instruction(0)]),
            &sim.config,
        )?);

        let exit = sim.run_to_completion()?;
        assert_eq!(exit, ExitReason::Completed);
        assert_eq!(sim.stats.sim.kernels_launched, 2);

        // the second kernel must not start before the first finished
        let first_completed = first.completed_cycle().expect("first kernel completed");
        let second_started = second.start_cycle().expect("second kernel started");
        assert!(
            second_started >= first_completed,
            "kernel 1 started at {second_started} before kernel 0 completed at {first_completed}"
        );
        Ok(())
    }

    #[test]
    fn blocked_ejection_detects_deadlock() -> eyre::Result<()> {
        let mut config = test_config();
        // no packet can ever leave the network
        config.interconnect.ejection_buffer_size = 0;
        config.deadlock_detect_cycles = 2_000;
        let mut sim = simulator(config)?;

        let kernel = trace::kernel_from_trace(
            single_warp_kernel(
                launch(0, 0),
                vec![load_instruction(0, 0x2000, 4), exit_instruction(16)],
            ),
            &sim.config,
        )?;
        sim.launch_kernel(kernel);

        let err = sim.run_to_completion().unwrap_err();
        let deadlock = err
            .downcast_ref::<DeadlockDetected>()
            .expect("deadlock error");
        assert_eq!(deadlock.threshold, 2_000);
        assert!(!deadlock.snapshot.is_empty());
        Ok(())
    }

    #[test]
    fn identical_runs_produce_identical_statistics() -> eyre::Result<()> {
        let run = || -> eyre::Result<String> {
            let mut sim = simulator(test_config())?;
            sim.memcopy_to_gpu(0x2000, 256)?;
            let kernel = trace::kernel_from_trace(
                single_warp_kernel(
                    launch(0, 0),
                    vec![
                        load_instruction(0, 0x2000, 4),
                        load_instruction(16, 0x6000, 64),
                        exit_instruction(32),
                    ],
                ),
                &sim.config,
            )?;
            sim.launch_kernel(kernel);
            sim.run_to_completion()?;
            Ok(serde_json::to_string_pretty(&sim.stats)?)
        };

        let first = run()?;
        let second = run()?;
        assert_eq!(first, second, "statistics must be byte-identical");
        Ok(())
    }

    #[test]
    fn cycle_limit_exits_gracefully() -> eyre::Result<()> {
        let mut config = test_config();
        config.max_cycles = Some(10);
        let mut sim = simulator(config)?;

        let kernel = trace::kernel_from_trace(
            single_warp_kernel(
                launch(0, 0),
                vec![load_instruction(0, 0x2000, 128), exit_instruction(16)],
            ),
            &sim.config,
        )?;
        sim.launch_kernel(kernel);

        let exit = sim.run_to_completion()?;
        assert_eq!(exit, ExitReason::LimitReached);
        assert!(sim.stats.sim.cycles <= 11);
        Ok(())
    }
}
