use super::dim::Dim;
use serde::{Deserialize, Serialize};

/// Information about a kernel launch, read from the per-kernel trace header.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelLaunch {
    /// Kernel name.
    pub name: String,
    /// Unique kernel launch id.
    pub id: u64,
    /// Path to the trace file for this kernel, relative to the trace directory.
    pub trace_file: String,
    /// The grid dimensions.
    pub grid: Dim,
    /// The block dimensions.
    pub block: Dim,
    /// Shared memory bytes used per block.
    pub shared_mem_bytes: u32,
    /// Registers used per thread.
    pub num_registers: u32,
    /// Stream the kernel was launched on.
    pub stream_id: u64,
    /// Base address of the shared memory space.
    pub shared_mem_base_addr: u64,
    /// Base address of the local memory space.
    pub local_mem_base_addr: u64,
}

impl KernelLaunch {
    #[must_use]
    pub fn threads_per_block(&self) -> usize {
        self.block.size() as usize
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.grid.size() as usize
    }
}

impl std::fmt::Display for KernelLaunch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

impl std::cmp::Ord for KernelLaunch {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::cmp::PartialOrd for KernelLaunch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A single entry of the command list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// A host-to-device copy: `MemcpyHtoD,<addr>,<bytes>`.
    MemcpyHtoD { dest_device_addr: u64, num_bytes: u64 },
    /// A kernel launch: `kernel-<N>,<relative path to kernel trace>`.
    KernelLaunch { id: u64, trace_file: String },
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Command::MemcpyHtoD {
                dest_device_addr,
                num_bytes,
            } => write!(f, "MemcpyHtoD({dest_device_addr:#x}, {num_bytes} bytes)"),
            Command::KernelLaunch { id, trace_file } => {
                write!(f, "KernelLaunch(kernel-{id}, {trace_file})")
            }
        }
    }
}
