use serde::Serialize;

/// Simulator-level aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Sim {
    /// Simulated cycles.
    pub cycles: u64,
    /// Committed warp-instruction lane counts.
    pub instructions: u64,
    /// Thread blocks issued to cores.
    pub num_blocks: u64,
    /// Kernels launched.
    pub kernels_launched: u64,
    /// Cycles a memory sub partition refused an interconnect ejection.
    pub stall_dram_full: u64,
    /// Cycles a cluster ejection buffer refused an interconnect packet.
    pub stall_icnt_to_shader: u64,
}
