use crate::{address, cache, core::PipelineStage, dram, interconn, opcodes, scheduler, Kernel};
use std::path::PathBuf;

pub use cache::config::Kind as CacheKind;

pub const WORD_SIZE: address = 4;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid cache config {value:?}: {message}")]
    InvalidCacheConfig { value: String, message: String },

    #[error("invalid dram timing config {value:?} (expected nbk:tCCD:tRRD:tRCD:tRAS:tRP:tRC:CL:WL)")]
    InvalidDramTiming { value: String },

    #[error("invalid option {option}: {message}")]
    InvalidOption { option: String, message: String },

    #[error(transparent)]
    AddressMapping(#[from] crate::mcu::Error),
}

/// Simulation order of the cores within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingOrder {
    Fixed,
    RoundRobin,
}

/// Per-cache configuration, parsed from
/// `N:lineSz:assoc:repl:writePol:allocPol:writeAllocPol:mshrN:mshrMerges:missQSz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub kind: CacheKind,
    pub num_sets: usize,
    pub line_size: u32,
    pub associativity: usize,
    pub replacement_policy: cache::config::ReplacementPolicy,
    pub write_policy: cache::config::WritePolicy,
    pub allocate_policy: cache::config::AllocatePolicy,
    pub write_allocate_policy: cache::config::WriteAllocatePolicy,
    pub mshr_entries: usize,
    pub mshr_max_merge: usize,
    pub miss_queue_size: usize,
    pub l1_cache_write_ratio_percent: usize,
    pub data_port_width: Option<usize>,
}

impl CacheConfig {
    /// Parse the flat colon-separated cache configuration format.
    pub fn parse(value: &str, kind: CacheKind) -> Result<Self, Error> {
        use cache::config::{AllocatePolicy, ReplacementPolicy, WriteAllocatePolicy, WritePolicy};

        let invalid = |message: String| Error::InvalidCacheConfig {
            value: value.to_string(),
            message,
        };
        let fields: Vec<&str> = value.split(':').map(str::trim).collect();
        let [num_sets, line_size, associativity, repl, write_pol, alloc_pol, write_alloc_pol, mshr_entries, mshr_max_merge, miss_queue_size] =
            fields[..]
        else {
            return Err(invalid(format!("expected 10 fields, got {}", fields.len())));
        };

        let parse_num = |field: &str, name: &str| {
            field
                .parse::<usize>()
                .map_err(|_| invalid(format!("invalid {name} {field:?}")))
        };

        let replacement_policy = match repl {
            "L" => ReplacementPolicy::LRU,
            "F" => ReplacementPolicy::FIFO,
            other => return Err(invalid(format!("unknown replacement policy {other:?}"))),
        };
        let write_policy = match write_pol {
            "R" => WritePolicy::READ_ONLY,
            "B" => WritePolicy::WRITE_BACK,
            "T" => WritePolicy::WRITE_THROUGH,
            "E" => WritePolicy::WRITE_EVICT,
            other => return Err(invalid(format!("unknown write policy {other:?}"))),
        };
        let allocate_policy = match alloc_pol {
            "M" => AllocatePolicy::ON_MISS,
            "F" => AllocatePolicy::ON_FILL,
            other => return Err(invalid(format!("unknown allocation policy {other:?}"))),
        };
        let write_allocate_policy = match write_alloc_pol {
            "N" => WriteAllocatePolicy::NO_WRITE_ALLOCATE,
            "W" => WriteAllocatePolicy::WRITE_ALLOCATE,
            "F" => WriteAllocatePolicy::FETCH_ON_WRITE,
            "L" => WriteAllocatePolicy::LAZY_FETCH_ON_READ,
            other => return Err(invalid(format!("unknown write allocate policy {other:?}"))),
        };

        let config = Self {
            kind,
            num_sets: parse_num(num_sets, "set count")?,
            line_size: parse_num(line_size, "line size")? as u32,
            associativity: parse_num(associativity, "associativity")?,
            replacement_policy,
            write_policy,
            allocate_policy,
            write_allocate_policy,
            mshr_entries: parse_num(mshr_entries, "mshr entry count")?,
            mshr_max_merge: parse_num(mshr_max_merge, "mshr merge limit")?,
            miss_queue_size: parse_num(miss_queue_size, "miss queue size")?,
            l1_cache_write_ratio_percent: 0,
            data_port_width: None,
        };
        let runtime: cache::Config = (&config).into();
        runtime.validate().map_err(invalid)?;
        Ok(config)
    }
}

/// The complete configuration of the simulated device.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug)]
pub struct GPU {
    /// Number of processing clusters.
    pub num_simt_clusters: usize,
    /// Cores per cluster.
    pub num_cores_per_simt_cluster: usize,
    /// Warp schedulers per core.
    pub num_schedulers_per_core: usize,
    pub scheduler: scheduler::Kind,
    /// Threads per core.
    pub max_threads_per_core: usize,
    pub warp_size: usize,
    /// Max instructions issued per warp per cycle (1 or 2).
    pub max_instruction_issue_per_warp: usize,
    /// Dual issue must target different execution units.
    pub dual_issue_only_to_different_exec_units: bool,
    pub simt_core_sim_order: SchedulingOrder,

    pub num_sp_units: usize,
    pub num_dp_units: usize,
    pub num_int_units: usize,
    pub num_sfu_units: usize,
    /// Pipeline depths.
    pub max_sp_latency: usize,
    pub max_int_latency: usize,
    pub max_dp_latency: usize,
    pub max_sfu_latency: usize,
    /// `(latency, initiation interval)` per op class.
    pub latency_int: (usize, usize),
    pub latency_sp: (usize, usize),
    pub latency_dp: (usize, usize),
    pub latency_sfu: (usize, usize),

    pub pipeline_widths: Vec<(PipelineStage, usize)>,

    pub num_reg_banks: usize,
    pub reg_bank_use_warp_id: bool,
    pub sub_core_model: bool,
    pub enable_specialized_operand_collector: bool,
    pub operand_collector_num_units_gen: usize,
    pub operand_collector_num_units_sp: usize,
    pub operand_collector_num_units_mem: usize,
    pub operand_collector_num_in_ports_gen: usize,
    pub operand_collector_num_in_ports_sp: usize,
    pub operand_collector_num_in_ports_mem: usize,
    pub operand_collector_num_out_ports_gen: usize,
    pub operand_collector_num_out_ports_sp: usize,
    pub operand_collector_num_out_ports_mem: usize,
    pub reg_file_port_throughput: usize,
    pub inst_fetch_throughput: usize,

    pub shared_memory_latency: usize,
    pub shared_memory_num_banks: usize,
    pub shared_memory_warp_parts: usize,
    /// Shared memory per core, limits concurrent blocks.
    pub shared_memory_size: u32,
    /// Registers per core, limits concurrent blocks.
    pub shader_registers: usize,
    pub max_concurrent_blocks_per_core: usize,
    pub max_barriers_per_block: usize,

    pub inst_cache_l1: CacheConfig,
    pub data_cache_l1: CacheConfig,
    pub const_cache_l1: CacheConfig,
    pub tex_cache_l1: CacheConfig,
    pub data_cache_l2: CacheConfig,
    pub data_cache_l2_texture_only: bool,
    /// L1D banks and their access latency pipeline.
    pub l1_banks: usize,
    pub l1_banks_byte_interleaving: usize,
    pub l1_latency: usize,
    pub l1_hit_latency: usize,
    pub global_mem_skip_l1_data_cache: bool,
    pub perfect_inst_const_cache: bool,
    pub flush_l1_cache: bool,
    pub flush_l2_cache: bool,

    pub num_cluster_ejection_buffer_size: usize,
    pub num_ldst_response_buffer_size: usize,

    /// Memory channels.
    pub num_memory_controllers: usize,
    pub num_sub_partitions_per_memory_controller: usize,
    pub dram_timing: dram::Timing,
    pub dram_frfcfs_sched_queue_size: usize,
    pub dram_return_queue_size: usize,
    pub dram_burst_length: usize,
    pub dram_data_command_freq_ratio: usize,
    pub dram_partition_queue_interconn_to_l2: usize,
    pub dram_partition_queue_l2_to_dram: usize,
    pub dram_partition_queue_dram_to_l2: usize,
    pub dram_partition_queue_l2_to_interconn: usize,
    /// Raster-ops delay in front of the L2.
    pub rop_latency: u64,
    /// Linear-address bit mapping, `dramid@<bit>;<mask>` format.
    pub memory_addr_mapping: Option<String>,
    /// Modeled DRAM capacity.
    pub dram_size_bytes: u64,
    pub fill_l2_on_memcopy: bool,

    /// Network description file; a single crossbar when absent.
    pub interconnect_file: Option<PathBuf>,
    pub interconnect: interconn::Config,

    pub local_mem_map: bool,
    pub local_mem_base_addr: u64,

    /// Concurrent-kernel window; `window_size = 1` unless
    /// `concurrent_kernel_sm` is set.
    pub concurrent_kernel_sm: bool,
    pub max_concurrent_kernels: usize,
    pub kernel_launch_latency: usize,
    pub block_launch_latency: usize,

    /// Simulation limits; `None` is unlimited.
    pub max_cycles: Option<u64>,
    pub max_instructions: Option<u64>,
    pub max_blocks: Option<u64>,
    /// Abort when no instruction completes for this many cycles.
    pub deadlock_detect_cycles: u64,
    /// Suppress per-cycle logging.
    pub silent: bool,
}

impl Default for GPU {
    fn default() -> Self {
        Self {
            num_simt_clusters: 4,
            num_cores_per_simt_cluster: 1,
            num_schedulers_per_core: 2,
            scheduler: scheduler::Kind::Gto,
            max_threads_per_core: 2048,
            warp_size: 32,
            max_instruction_issue_per_warp: 2,
            dual_issue_only_to_different_exec_units: true,
            simt_core_sim_order: SchedulingOrder::RoundRobin,

            num_sp_units: 4,
            num_dp_units: 0,
            num_int_units: 0,
            num_sfu_units: 1,
            max_sp_latency: 16,
            max_int_latency: 16,
            max_dp_latency: 16,
            max_sfu_latency: 32,
            latency_int: (4, 2),
            latency_sp: (4, 1),
            latency_dp: (8, 4),
            latency_sfu: (20, 4),

            pipeline_widths: vec![
                (PipelineStage::ID_OC_SP, 4),
                (PipelineStage::ID_OC_DP, 0),
                (PipelineStage::ID_OC_INT, 0),
                (PipelineStage::ID_OC_SFU, 1),
                (PipelineStage::ID_OC_MEM, 1),
                (PipelineStage::OC_EX_SP, 4),
                (PipelineStage::OC_EX_DP, 0),
                (PipelineStage::OC_EX_INT, 0),
                (PipelineStage::OC_EX_SFU, 1),
                (PipelineStage::OC_EX_MEM, 1),
                (PipelineStage::EX_WB, 6),
            ],

            num_reg_banks: 16,
            reg_bank_use_warp_id: false,
            sub_core_model: false,
            enable_specialized_operand_collector: true,
            operand_collector_num_units_gen: 4,
            operand_collector_num_units_sp: 4,
            operand_collector_num_units_mem: 2,
            operand_collector_num_in_ports_gen: 1,
            operand_collector_num_in_ports_sp: 1,
            operand_collector_num_in_ports_mem: 1,
            operand_collector_num_out_ports_gen: 1,
            operand_collector_num_out_ports_sp: 1,
            operand_collector_num_out_ports_mem: 1,
            reg_file_port_throughput: 1,
            inst_fetch_throughput: 1,

            shared_memory_latency: 3,
            shared_memory_num_banks: 32,
            shared_memory_warp_parts: 1,
            shared_memory_size: 96 * 1024,
            shader_registers: 65536,
            max_concurrent_blocks_per_core: 32,
            max_barriers_per_block: 16,

            inst_cache_l1: CacheConfig::parse("8:128:4:L:R:F:N:8:4:4", CacheKind::Normal)
                .unwrap(),
            data_cache_l1: CacheConfig::parse("64:128:6:L:T:M:L:128:8:4", CacheKind::Sector)
                .unwrap(),
            const_cache_l1: CacheConfig::parse("64:64:2:L:R:F:N:8:4:4", CacheKind::Normal)
                .unwrap(),
            tex_cache_l1: CacheConfig::parse("16:128:2:L:R:F:N:8:4:4", CacheKind::Normal)
                .unwrap(),
            data_cache_l2: CacheConfig::parse("64:128:16:L:B:M:L:64:16:32", CacheKind::Sector)
                .unwrap(),
            data_cache_l2_texture_only: false,
            l1_banks: 4,
            l1_banks_byte_interleaving: 32,
            l1_latency: 4,
            l1_hit_latency: 10,
            global_mem_skip_l1_data_cache: false,
            perfect_inst_const_cache: false,
            flush_l1_cache: false,
            flush_l2_cache: false,

            num_cluster_ejection_buffer_size: 8,
            num_ldst_response_buffer_size: 2,

            num_memory_controllers: 8,
            num_sub_partitions_per_memory_controller: 2,
            dram_timing: dram::Timing::parse("16:2:6:12:28:12:40:12:4").unwrap(),
            dram_frfcfs_sched_queue_size: 64,
            dram_return_queue_size: 116,
            dram_burst_length: 8,
            dram_data_command_freq_ratio: 4,
            dram_partition_queue_interconn_to_l2: 8,
            dram_partition_queue_l2_to_dram: 8,
            dram_partition_queue_dram_to_l2: 8,
            dram_partition_queue_l2_to_interconn: 8,
            rop_latency: 120,
            memory_addr_mapping: Some(
                "dramid@8;00000000.00000000.00000000.00000000.0000RRRR.RRRRRRRR.RBBBCCCC.BCCSSSSS"
                    .to_string(),
            ),
            dram_size_bytes: 4 * 1024 * 1024 * 1024,
            fill_l2_on_memcopy: true,

            interconnect_file: None,
            interconnect: interconn::Config::default(),

            local_mem_map: true,
            local_mem_base_addr: 0x1000_0000,

            concurrent_kernel_sm: false,
            max_concurrent_kernels: 32,
            kernel_launch_latency: 0,
            block_launch_latency: 0,

            max_cycles: None,
            max_instructions: None,
            max_blocks: None,
            deadlock_detect_cycles: 100_000,
            silent: false,
        }
    }
}

impl GPU {
    #[must_use]
    pub fn max_warps_per_core(&self) -> usize {
        self.max_threads_per_core / self.warp_size
    }

    #[must_use]
    pub fn total_cores(&self) -> usize {
        self.num_simt_clusters * self.num_cores_per_simt_cluster
    }

    #[must_use]
    pub fn total_sub_partitions(&self) -> usize {
        self.num_memory_controllers * self.num_sub_partitions_per_memory_controller
    }

    #[must_use]
    pub fn global_core_id(&self, cluster_id: usize, core_id: usize) -> usize {
        cluster_id * self.num_cores_per_simt_cluster + core_id
    }

    #[must_use]
    pub fn global_core_id_to_core_id(&self, global_core_id: usize) -> usize {
        global_core_id % self.num_cores_per_simt_cluster
    }

    #[must_use]
    pub fn global_core_id_to_cluster_id(&self, global_core_id: usize) -> usize {
        global_core_id / self.num_cores_per_simt_cluster
    }

    /// Interconnect node of a memory sub partition.
    ///
    /// Nodes 0..num_clusters are the clusters; the sub partitions follow.
    #[must_use]
    pub fn mem_id_to_device_id(&self, sub_partition_id: usize) -> usize {
        sub_partition_id + self.num_simt_clusters
    }

    #[must_use]
    pub fn total_nodes(&self) -> usize {
        self.num_simt_clusters + self.total_sub_partitions()
    }

    #[must_use]
    pub fn pipeline_width(&self, stage: PipelineStage) -> usize {
        self.pipeline_widths
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, width)| *width)
            .unwrap_or(0)
    }

    /// `(latency, initiation interval)` of an op class.
    #[must_use]
    pub fn latency_of(&self, category: opcodes::ArchOp) -> (usize, usize) {
        use opcodes::ArchOp;
        match category {
            ArchOp::SP_OP => self.latency_sp,
            ArchOp::INT_OP | ArchOp::ALU_OP => self.latency_int,
            ArchOp::DP_OP => self.latency_dp,
            ArchOp::SFU_OP => self.latency_sfu,
            _ => (1, 1),
        }
    }

    #[must_use]
    pub fn shared_mem_bank(&self, addr: address) -> u64 {
        (addr / WORD_SIZE) % self.shared_memory_num_banks as u64
    }

    #[must_use]
    pub fn threads_per_block_padded(&self, kernel: &Kernel) -> usize {
        utils::pad_to_multiple(kernel.threads_per_block(), self.warp_size)
    }

    /// Maximum concurrent blocks of this kernel per core, limited by
    /// threads, shared memory, registers and the block slot count.
    pub fn max_blocks(&self, kernel: &Kernel) -> Result<usize, Error> {
        let threads_per_block = self.threads_per_block_padded(kernel);
        let by_threads = self.max_threads_per_core / threads_per_block;

        let by_shared_mem = if kernel.config.shared_mem_bytes > 0 {
            self.shared_memory_size as usize / kernel.config.shared_mem_bytes as usize
        } else {
            usize::MAX
        };
        let by_registers = if kernel.config.num_registers > 0 {
            // register allocation granularity is 4
            self.shader_registers
                / (threads_per_block * ((kernel.config.num_registers + 3) & !3) as usize)
        } else {
            usize::MAX
        };

        let limit = by_threads
            .min(by_shared_mem)
            .min(by_registers)
            .min(self.max_concurrent_blocks_per_core);
        if limit == 0 {
            return Err(Error::InvalidOption {
                option: "kernel".to_string(),
                message: format!(
                    "kernel {} requires more resources than one core provides",
                    kernel.name()
                ),
            });
        }
        Ok(limit)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |option: &str, message: String| Error::InvalidOption {
            option: option.to_string(),
            message,
        };
        if self.max_threads_per_core % self.warp_size != 0 {
            return Err(invalid(
                "max_threads_per_core",
                "must be a multiple of the warp size".to_string(),
            ));
        }
        if self.max_warps_per_core() > crate::barrier::MAX_WARPS_PER_CORE {
            return Err(invalid(
                "max_threads_per_core",
                format!("at most {} warps per core", crate::barrier::MAX_WARPS_PER_CORE),
            ));
        }
        if self.num_schedulers_per_core == 0 {
            return Err(invalid("num_schedulers_per_core", "must be nonzero".to_string()));
        }
        if self.concurrent_kernel_sm {
            // only the single-kernel-per-core window is modeled
            return Err(invalid(
                "concurrent_kernel_sm",
                "concurrent kernels per core are not modeled".to_string(),
            ));
        }
        if self.sub_core_model {
            for stage in [
                PipelineStage::ID_OC_SP,
                PipelineStage::ID_OC_SFU,
                PipelineStage::ID_OC_MEM,
            ] {
                if self.pipeline_width(stage) != self.num_schedulers_per_core {
                    return Err(invalid(
                        "sub_core_model",
                        format!(
                            "{stage:?} width must equal the scheduler count under the sub-core model"
                        ),
                    ));
                }
            }
        }
        for cache in [
            &self.inst_cache_l1,
            &self.data_cache_l1,
            &self.const_cache_l1,
            &self.tex_cache_l1,
            &self.data_cache_l2,
        ] {
            let runtime: cache::Config = cache.into();
            runtime.validate().map_err(|message| {
                invalid("cache", message)
            })?;
        }
        Ok(())
    }

    /// The kernel window size: one unless concurrent kernels are enabled.
    #[must_use]
    pub fn kernel_window_size(&self) -> usize {
        if self.concurrent_kernel_sm {
            self.max_concurrent_kernels
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheConfig, CacheKind, GPU};
    use crate::cache;

    #[test]
    fn default_config_is_valid() {
        let config = GPU::default();
        config.validate().unwrap();
    }

    #[test]
    fn parses_cache_config_string() {
        let config = CacheConfig::parse("64:128:6:L:T:M:L:128:8:4", CacheKind::Sector).unwrap();
        assert_eq!(config.num_sets, 64);
        assert_eq!(config.line_size, 128);
        assert_eq!(config.associativity, 6);
        assert_eq!(
            config.replacement_policy,
            cache::config::ReplacementPolicy::LRU
        );
        assert_eq!(
            config.write_policy,
            cache::config::WritePolicy::WRITE_THROUGH
        );
        assert_eq!(
            config.write_allocate_policy,
            cache::config::WriteAllocatePolicy::LAZY_FETCH_ON_READ
        );
        assert_eq!(config.mshr_entries, 128);
        assert_eq!(config.miss_queue_size, 4);
    }

    #[test]
    fn rejects_malformed_cache_config() {
        assert!(CacheConfig::parse("64:128:6", CacheKind::Normal).is_err());
        assert!(CacheConfig::parse("64:128:6:X:T:M:L:128:8:4", CacheKind::Normal).is_err());
        // a write-back cache allocating on fill can deadlock
        assert!(CacheConfig::parse("64:128:6:L:B:F:L:128:8:4", CacheKind::Normal).is_err());
    }
}
