use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use warpsim::{config, trace, Simulator};

#[derive(Parser, Debug)]
#[command(author, version, about = "trace-driven GPU performance simulator", long_about = None)]
struct Options {
    /// Directory holding the command list and kernel traces.
    #[arg(value_name = "TRACE_DIR")]
    traces_dir: PathBuf,

    /// Command list file, relative to the trace directory.
    #[arg(long = "commands", default_value = "commands.txt")]
    commands: PathBuf,

    #[arg(long = "n_simt_clusters")]
    n_simt_clusters: Option<usize>,

    #[arg(long = "n_simt_cores_per_cluster")]
    n_simt_cores_per_cluster: Option<usize>,

    #[arg(long = "gpgpu_num_sched_per_core")]
    gpgpu_num_sched_per_core: Option<usize>,

    /// Support concurrent kernels on a core (not modeled; window sizing only).
    #[arg(long = "gpgpu_concurrent_kernel_sm", default_value_t = false)]
    gpgpu_concurrent_kernel_sm: bool,

    /// Stop after this many cycles.
    #[arg(long = "gpu_max_cycle_opt")]
    gpu_max_cycle_opt: Option<u64>,

    /// Stop after this many committed instructions.
    #[arg(long = "gpu_max_insn_opt")]
    gpu_max_insn_opt: Option<u64>,

    /// Stop after this many issued blocks.
    #[arg(long = "gpu_max_cta_opt")]
    gpu_max_cta_opt: Option<u64>,

    /// L1 instruction cache (`N:lineSz:assoc:repl:writePol:allocPol:writeAllocPol:mshrN:mshrMerges:missQSz`).
    #[arg(long = "gpgpu_cache:il1")]
    cache_il1: Option<String>,

    /// Per-core L1 data cache.
    #[arg(long = "gpgpu_cache:dl1")]
    cache_dl1: Option<String>,

    /// Per-core L1 constant cache.
    #[arg(long = "gpgpu_const_cache:l1")]
    cache_cl1: Option<String>,

    /// Per-core L1 texture cache.
    #[arg(long = "gpgpu_tex_cache:l1")]
    cache_tl1: Option<String>,

    /// Unified L2 cache, per sub partition.
    #[arg(long = "gpgpu_cache:dl2")]
    cache_dl2: Option<String>,

    /// DRAM timing (`nbk:tCCD:tRRD:tRCD:tRAS:tRP:tRC:CL:WL`).
    #[arg(long = "gpgpu_dram_timing_opt")]
    dram_timing: Option<String>,

    #[arg(long = "gpgpu_n_mem")]
    n_mem: Option<usize>,

    #[arg(long = "gpgpu_n_sub_partition_per_mchannel")]
    n_sub_partition_per_mchannel: Option<usize>,

    /// Linear address mapping (`dramid@<bit>;<mask>`).
    #[arg(long = "gpgpu_mem_addr_mapping")]
    mem_addr_mapping: Option<String>,

    /// Interconnect topology description file.
    #[arg(long = "inter_config_file")]
    inter_config_file: Option<PathBuf>,

    /// Abort when no instruction completes for this many cycles.
    #[arg(long = "deadlock_detect_cycles")]
    deadlock_detect_cycles: Option<u64>,
}

impl Options {
    fn to_config(&self) -> eyre::Result<config::GPU> {
        use config::{CacheConfig, CacheKind};

        let mut config = config::GPU::default();
        if let Some(n) = self.n_simt_clusters {
            config.num_simt_clusters = n;
        }
        if let Some(n) = self.n_simt_cores_per_cluster {
            config.num_cores_per_simt_cluster = n;
        }
        if let Some(n) = self.gpgpu_num_sched_per_core {
            config.num_schedulers_per_core = n;
        }
        config.concurrent_kernel_sm = self.gpgpu_concurrent_kernel_sm;
        config.max_cycles = self.gpu_max_cycle_opt;
        config.max_instructions = self.gpu_max_insn_opt;
        config.max_blocks = self.gpu_max_cta_opt;
        if let Some(ref value) = self.cache_il1 {
            config.inst_cache_l1 = CacheConfig::parse(value, CacheKind::Normal)?;
        }
        if let Some(ref value) = self.cache_dl1 {
            config.data_cache_l1 = CacheConfig::parse(value, CacheKind::Sector)?;
        }
        if let Some(ref value) = self.cache_cl1 {
            config.const_cache_l1 = CacheConfig::parse(value, CacheKind::Normal)?;
        }
        if let Some(ref value) = self.cache_tl1 {
            config.tex_cache_l1 = CacheConfig::parse(value, CacheKind::Normal)?;
        }
        if let Some(ref value) = self.cache_dl2 {
            config.data_cache_l2 = CacheConfig::parse(value, CacheKind::Sector)?;
        }
        if let Some(ref value) = self.dram_timing {
            config.dram_timing = warpsim::dram::Timing::parse(value)?;
        }
        if let Some(n) = self.n_mem {
            config.num_memory_controllers = n;
        }
        if let Some(n) = self.n_sub_partition_per_mchannel {
            config.num_sub_partitions_per_memory_controller = n;
        }
        if let Some(ref mapping) = self.mem_addr_mapping {
            config.memory_addr_mapping = Some(mapping.clone());
        }
        config.interconnect_file = self.inter_config_file.clone();
        if let Some(cycles) = self.deadlock_detect_cycles {
            config.deadlock_detect_cycles = cycles;
        }

        // environment overrides
        config.silent = std::env::var("SILENT").is_ok_and(|value| value == "yes");
        if let Ok(cycles) = std::env::var("CYCLES") {
            let cycles = cycles
                .parse()
                .wrap_err_with(|| format!("invalid CYCLES override {cycles:?}"))?;
            config.max_cycles = Some(cycles);
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();

    let mut log_builder = env_logger::Builder::from_default_env();
    if std::env::var("SILENT").is_ok_and(|value| value == "yes") {
        log_builder.filter_level(log::LevelFilter::Error);
    }
    log_builder.init();

    let config = Arc::new(options.to_config()?);
    let commands = trace::read_command_file(&options.traces_dir.join(&options.commands))?;

    let mut sim = Simulator::new(config, options.traces_dir.clone())?;
    sim.add_commands(commands);
    let exit_reason = sim.run_to_completion()?;
    log::info!("simulation exited: {exit_reason:?}");

    serde_json::to_writer_pretty(std::io::stdout().lock(), &sim.stats)?;
    println!();
    Ok(())
}
