use crate::{config, instruction::WarpInstruction, warp::Warp};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A kernel launch together with its trace, shared between the driver and
/// the cores executing its blocks.
pub struct Kernel {
    pub config: trace_model::KernelLaunch,
    /// Per-block warp traces, ordered by flat block id.
    block_traces: Vec<trace_model::BlockTrace>,
    /// The next block to hand out.
    next_block: Mutex<usize>,
    /// Blocks currently resident on cores.
    num_running_blocks: AtomicUsize,
    launched: Mutex<bool>,
    start_cycle: Mutex<Option<u64>>,
    completed_cycle: Mutex<Option<u64>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.config.name)
            .field("id", &self.config.id)
            .field("grid", &self.config.grid)
            .field("block", &self.config.block)
            .finish()
    }
}

impl std::fmt::Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}#{}", self.config.name, self.config.id)
    }
}

impl Kernel {
    #[must_use]
    pub fn new(mut trace: trace_model::KernelTrace) -> Self {
        trace.sort_blocks();
        Self {
            config: trace.launch,
            block_traces: trace.blocks,
            next_block: Mutex::new(0),
            num_running_blocks: AtomicUsize::new(0),
            launched: Mutex::new(false),
            start_cycle: Mutex::new(None),
            completed_cycle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.config.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn threads_per_block(&self) -> usize {
        self.config.threads_per_block()
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.config.num_blocks()
    }

    pub fn set_launched(&self) {
        *self.launched.lock().unwrap() = true;
    }

    #[must_use]
    pub fn launched(&self) -> bool {
        *self.launched.lock().unwrap()
    }

    pub fn set_started(&self, cycle: u64) {
        self.start_cycle.lock().unwrap().get_or_insert(cycle);
    }

    pub fn set_completed(&self, cycle: u64) {
        self.completed_cycle.lock().unwrap().get_or_insert(cycle);
    }

    #[must_use]
    pub fn start_cycle(&self) -> Option<u64> {
        *self.start_cycle.lock().unwrap()
    }

    #[must_use]
    pub fn completed_cycle(&self) -> Option<u64> {
        *self.completed_cycle.lock().unwrap()
    }

    pub fn inc_running(&self) {
        self.num_running_blocks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_running(&self) {
        let previous = self.num_running_blocks.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0);
    }

    /// Are blocks of this kernel still resident on cores?
    #[must_use]
    pub fn running(&self) -> bool {
        self.num_running_blocks.load(Ordering::SeqCst) > 0
    }

    #[must_use]
    pub fn no_more_blocks_to_run(&self) -> bool {
        *self.next_block.lock().unwrap() >= self.block_traces.len()
    }

    /// All blocks handed out and none resident.
    #[must_use]
    pub fn done(&self) -> bool {
        self.no_more_blocks_to_run() && !self.running()
    }

    /// Hand the next block's traces to the given hardware warps.
    ///
    /// Returns the block's dimensions, or `None` when the grid is drained.
    pub fn next_block_and_traces(
        &self,
        warps: &mut [Warp],
        config: &config::GPU,
    ) -> Option<trace_model::Dim> {
        let mut next_block = self.next_block.lock().unwrap();
        let block_trace = self.block_traces.get(*next_block)?;
        *next_block += 1;

        for warp in warps.iter_mut() {
            warp.clear();
        }
        for warp_trace in &block_trace.warps {
            // warp ids in the trace are relative to the block
            let warp = &mut warps[warp_trace.warp_id as usize];
            for entry in &warp_trace.instructions {
                // malformed instructions were rejected when the kernel was read
                let instr = WarpInstruction::from_trace(&self.config, entry, config)
                    .expect("trace was validated at load time");
                warp.push_trace_instruction(instr);
            }
        }
        Some(block_trace.block)
    }

    /// Validate that every instruction of the trace decodes.
    pub fn validate(&self, config: &config::GPU) -> Result<(), crate::instruction::Error> {
        for block in &self.block_traces {
            for warp in &block.warps {
                for entry in &warp.instructions {
                    WarpInstruction::from_trace(&self.config, entry, config)?;
                }
            }
        }
        Ok(())
    }
}
