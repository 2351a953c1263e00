pub mod cache;
pub mod dram;
pub mod instructions;
pub mod scheduler;
pub mod sim;

pub use cache::{Cache, PerCache};
pub use dram::Dram;
pub use instructions::InstructionCounts;
pub use scheduler::Scheduler;
pub use sim::Sim;

use serde::Serialize;

/// All statistics of a simulation run.
///
/// Containers iterate in a deterministic order so that serialized output is
/// byte-identical for identical runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub sim: Sim,
    pub instructions: InstructionCounts,
    pub scheduler: Scheduler,
    pub dram: Dram,
    pub l1i_stats: PerCache,
    pub l1d_stats: PerCache,
    pub l1c_stats: PerCache,
    pub l1t_stats: PerCache,
    pub l2d_stats: PerCache,
}

/// Per-level cache shorthand used when components report accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    L1I,
    L1D,
    L1C,
    L1T,
    L2D,
}

impl Stats {
    #[must_use]
    pub fn new(
        num_cores: usize,
        num_sub_partitions: usize,
        num_dram_chips: usize,
        num_dram_banks: usize,
    ) -> Self {
        Self {
            sim: Sim::default(),
            instructions: InstructionCounts::default(),
            scheduler: Scheduler::default(),
            dram: Dram::new(num_dram_chips, num_dram_banks),
            l1i_stats: PerCache::new(num_cores),
            l1d_stats: PerCache::new(num_cores),
            l1c_stats: PerCache::new(num_cores),
            l1t_stats: PerCache::new(num_cores),
            l2d_stats: PerCache::new(num_sub_partitions),
        }
    }

    pub fn cache_mut(&mut self, level: CacheLevel, unit: usize) -> &mut Cache {
        match level {
            CacheLevel::L1I => &mut self.l1i_stats[unit],
            CacheLevel::L1D => &mut self.l1d_stats[unit],
            CacheLevel::L1C => &mut self.l1c_stats[unit],
            CacheLevel::L1T => &mut self.l1t_stats[unit],
            CacheLevel::L2D => &mut self.l2d_stats[unit],
        }
    }
}
