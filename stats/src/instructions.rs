use serde::Serialize;

/// Committed instruction counts by memory space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstructionCounts {
    pub num_global_loads: u64,
    pub num_global_stores: u64,
    pub num_local_loads: u64,
    pub num_local_stores: u64,
    pub num_shared_loads: u64,
    pub num_shared_stores: u64,
    pub num_const_loads: u64,
    pub num_texture_loads: u64,
}
