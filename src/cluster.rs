use super::{
    config, core::Core, fifo::Fifo, interconn as ic, kernel_manager::KernelManager, mcu,
    mem_fetch, UidGenerator,
};
use color_eyre::eyre;
use std::collections::VecDeque;
use std::sync::Arc;

/// A group of shader cores sharing one interconnect port.
pub struct Cluster {
    pub cluster_id: usize,
    pub cores: Vec<Core>,
    pub config: Arc<config::GPU>,
    /// Core tick order; rotated when round-robin simulation order is on.
    core_sim_order: VecDeque<usize>,
    /// Next core considered for block issue.
    block_issue_next_core: usize,
    /// Packets ejected from the interconnect, waiting for a core to accept.
    pub response_fifo: VecDeque<mem_fetch::MemFetch>,
    /// Outgoing packets of all cores, drained into the interconnect.
    pub injection_buffer: Fifo<ic::Packet<mem_fetch::MemFetch>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("cluster_id", &self.cluster_id)
            .finish()
    }
}

impl Cluster {
    pub fn new(
        cluster_id: usize,
        config: Arc<config::GPU>,
        mem_controller: Arc<mcu::MemoryController>,
        fetch_uids: UidGenerator,
        instr_uids: UidGenerator,
    ) -> Self {
        let num_cores = config.num_cores_per_simt_cluster;
        let cores = (0..num_cores)
            .map(|core_id| {
                Core::new(
                    core_id,
                    cluster_id,
                    Arc::clone(&config),
                    Arc::clone(&mem_controller),
                    fetch_uids.clone(),
                    instr_uids.clone(),
                )
            })
            .collect();
        Self {
            cluster_id,
            cores,
            core_sim_order: (0..num_cores).collect(),
            block_issue_next_core: num_cores - 1,
            response_fifo: VecDeque::new(),
            injection_buffer: Fifo::new(Some(config.num_cluster_ejection_buffer_size)),
            config,
        }
    }

    #[must_use]
    pub fn num_active_sms(&self) -> usize {
        self.cores.iter().filter(|core| core.is_active()).count()
    }

    #[must_use]
    pub fn not_completed(&self) -> usize {
        self.cores.iter().map(Core::not_completed).sum()
    }

    pub fn cache_flush(&mut self) {
        for core in &mut self.cores {
            core.cache_flush();
        }
    }

    pub fn cache_invalidate(&mut self) {
        for core in &mut self.cores {
            core.cache_invalidate();
        }
    }

    /// Deliver the response FIFO head to its core and eject the next packet
    /// from the interconnect.
    pub fn interconn_cycle(
        &mut self,
        icnt: &mut ic::Interconnect<mem_fetch::MemFetch>,
        stats: &mut stats::Stats,
        cycle: u64,
    ) {
        use mem_fetch::access::Kind as AccessKind;

        if let Some(fetch) = self.response_fifo.front() {
            // fetches carry the core id local to their cluster
            let core_id = fetch.core_id.expect("fetch has core");
            let core = &mut self.cores[core_id];
            match fetch.access_kind() {
                AccessKind::INST_ACC_R => {
                    if !core.fetch_unit_response_buffer_full() {
                        let fetch = self.response_fifo.pop_front().unwrap();
                        log::trace!("cluster {}: accepted instr fetch {fetch}", self.cluster_id);
                        core.accept_fetch_response(fetch, cycle);
                    }
                }
                _ => {
                    if !core.ldst_unit_response_buffer_full() {
                        let fetch = self.response_fifo.pop_front().unwrap();
                        log::trace!("cluster {}: accepted ldst fetch {fetch}", self.cluster_id);
                        core.accept_ldst_unit_response(fetch, cycle);
                    }
                }
            }
        }

        if self.response_fifo.len() >= self.config.num_cluster_ejection_buffer_size {
            stats.sim.stall_icnt_to_shader += 1;
            return;
        }
        if let Some(mut fetch) = icnt.pop(self.cluster_id) {
            debug_assert_eq!(fetch.cluster_id, Some(self.cluster_id));
            debug_assert!(fetch.is_reply());
            fetch.icnt_receive_cycle = Some(cycle);
            fetch.set_status(mem_fetch::Status::IN_CLUSTER_TO_SHADER_QUEUE, cycle);
            self.response_fifo.push_back(fetch);
        }
    }

    /// Advance every core, in simulation order.
    pub fn cycle(&mut self, stats: &mut stats::Stats, cycle: u64) -> eyre::Result<()> {
        let Cluster {
            ref mut cores,
            ref mut injection_buffer,
            ref core_sim_order,
            ..
        } = *self;
        for core_id in core_sim_order {
            cores[*core_id].cycle(injection_buffer, stats, cycle)?;
        }
        if self.config.simt_core_sim_order == config::SchedulingOrder::RoundRobin {
            self.core_sim_order.rotate_left(1);
        }
        Ok(())
    }

    /// Issue up to one block to a core of this cluster.
    pub fn issue_block_to_core(
        &mut self,
        kernel_manager: &mut KernelManager,
        stats: &mut stats::Stats,
        cycle: u64,
    ) -> usize {
        let num_cores = self.cores.len();
        let mut num_blocks_issued = 0;

        for i in 0..num_cores {
            let core_id = (i + self.block_issue_next_core + 1) % num_cores;
            let core = &mut self.cores[core_id];

            let should_select_new_kernel = match core.current_kernel.as_ref() {
                // a new kernel once the current one has no blocks left and
                // the core drained
                Some(current) => current.no_more_blocks_to_run() && core.not_completed() == 0,
                None => true,
            };
            if should_select_new_kernel {
                if let Some(kernel) = kernel_manager.select_kernel() {
                    core.set_kernel(kernel);
                }
            }

            let Some(kernel) = core.current_kernel.clone() else {
                continue;
            };
            if !kernel.no_more_blocks_to_run() && core.can_issue_block(&kernel) {
                core.issue_block(&kernel, stats, cycle);
                num_blocks_issued += 1;
                self.block_issue_next_core = core_id;
                break;
            }
        }
        num_blocks_issued
    }
}
