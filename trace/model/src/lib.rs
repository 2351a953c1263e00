pub mod command;
pub mod dim;
pub mod reader;

pub use command::{Command, KernelLaunch};
pub use dim::{Dim, Point};
pub use reader::{read_commands, read_kernel_trace, Error};

use serde::{Deserialize, Serialize};

/// One decoded instruction of a warp's trace stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceInstruction {
    /// Program counter (byte offset into the kernel).
    pub pc: u32,
    /// Lanes that execute this instruction.
    pub active_mask: u32,
    /// Destination registers.
    pub dest_regs: Vec<u32>,
    /// Opcode mnemonic, e.g. `LDG` or `IADD`.
    pub opcode: String,
    /// Source registers.
    pub src_regs: Vec<u32>,
    /// Access width in bytes for memory instructions, zero otherwise.
    pub mem_width: u32,
    /// Per-lane addresses for memory instructions (zero for inactive lanes).
    pub addrs: [u64; 32],
    /// The thread block this instruction belongs to.
    pub block_id: Dim,
    /// The warp within the block.
    pub warp_id: u32,
    /// Position in the warp's instruction stream.
    pub instr_idx: u32,
    /// Source line in the trace file.
    pub line: usize,
}

/// The instruction stream of one warp of one thread block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpTrace {
    pub warp_id: u32,
    pub instructions: Vec<TraceInstruction>,
}

/// All warp streams of one thread block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTrace {
    pub block: Dim,
    /// Flat index of the block within the kernel grid.
    pub block_id: u64,
    pub warps: Vec<WarpTrace>,
}

/// A fully parsed kernel trace: launch header plus per-block warp streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelTrace {
    pub launch: KernelLaunch,
    pub blocks: Vec<BlockTrace>,
}

impl KernelTrace {
    /// Sort blocks by their flat id so handout order is deterministic.
    pub fn sort_blocks(&mut self) {
        self.blocks.sort_by_key(|block| block.block_id);
    }
}

/// Render bit containers as `0`/`1` strings for logging.
pub trait ToBitString {
    fn to_bit_string(&self) -> String;
}

impl<T, O> ToBitString for bitvec::slice::BitSlice<T, O>
where
    T: bitvec::store::BitStore,
    O: bitvec::order::BitOrder,
{
    fn to_bit_string(&self) -> String {
        self.iter()
            .map(|bit| if *bit { '1' } else { '0' })
            .collect()
    }
}
