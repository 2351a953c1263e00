use crate::{instruction::WarpInstruction, kernel::Kernel, simt};
use bitvec::{array::BitArray, BitArr};
use std::collections::VecDeque;
use std::sync::Arc;

/// Number of lanes per warp.
pub const WARP_SIZE: usize = 32;

/// Bitmask with a 1 at position i when lane i is active.
pub type ActiveMask = BitArr!(for WARP_SIZE, in u32);

/// Instruction buffer slots per warp.
const IBUFFER_SIZE: usize = 2;

/// Shader-side warp state.
#[derive(Debug)]
pub struct Warp {
    /// Hardware block slot this warp belongs to.
    pub block_hw_id: usize,
    pub warp_id: usize,
    /// Issue-order id, unique per core across reuses of the warp slot.
    pub dynamic_warp_id: usize,
    pub kernel: Option<Arc<Kernel>>,

    /// Cursor into the trace instruction stream.
    pub trace_pc: usize,
    pub trace_instructions: VecDeque<WarpInstruction>,
    pub active_mask: ActiveMask,
    pub simt_stack: simt::Stack,

    pub done_exit: bool,
    pub num_instr_in_pipeline: usize,
    pub num_outstanding_stores: usize,
    pub num_outstanding_atomics: usize,
    pub has_imiss_pending: bool,
    pub waiting_for_memory_barrier: bool,
    instr_buffer: Vec<Option<WarpInstruction>>,
    next: usize,
}

impl Default for Warp {
    fn default() -> Self {
        Self {
            block_hw_id: 0,
            warp_id: u32::MAX as usize,
            dynamic_warp_id: u32::MAX as usize,
            kernel: None,
            trace_pc: 0,
            trace_instructions: VecDeque::new(),
            active_mask: BitArray::ZERO,
            simt_stack: simt::Stack::new(),
            done_exit: false,
            num_instr_in_pipeline: 0,
            num_outstanding_stores: 0,
            num_outstanding_atomics: 0,
            has_imiss_pending: false,
            waiting_for_memory_barrier: false,
            instr_buffer: vec![None; IBUFFER_SIZE],
            next: 0,
        }
    }
}

impl Warp {
    pub fn init(
        &mut self,
        block_hw_id: usize,
        warp_id: usize,
        dynamic_warp_id: usize,
        active_mask: ActiveMask,
        kernel: Arc<Kernel>,
    ) {
        self.block_hw_id = block_hw_id;
        self.warp_id = warp_id;
        self.dynamic_warp_id = dynamic_warp_id;
        self.done_exit = false;
        self.kernel = Some(kernel);
        self.active_mask = active_mask;
        self.waiting_for_memory_barrier = false;
    }

    pub fn reset(&mut self) {
        debug_assert_eq!(self.num_outstanding_stores, 0);
        debug_assert_eq!(self.num_instr_in_pipeline, 0);
        self.has_imiss_pending = false;
        self.warp_id = u32::MAX as usize;
        self.dynamic_warp_id = u32::MAX as usize;
        self.active_mask.fill(false);
        self.done_exit = true;
        self.waiting_for_memory_barrier = false;
        self.next = 0;
    }

    /// Clear the trace stream and the simt stack for a new thread block.
    pub fn clear(&mut self) {
        self.trace_pc = 0;
        self.trace_instructions.clear();
    }

    /// Initialize the simt stack from the first trace instruction.
    pub fn launch_simt_stack(&mut self) {
        let start_pc = self.trace_instructions.front().map_or(0, |instr| instr.pc);
        self.simt_stack.launch(start_pc, self.active_mask);
    }

    #[must_use]
    pub fn current_instr(&self) -> Option<&WarpInstruction> {
        self.trace_instructions.get(self.trace_pc)
    }

    pub fn push_trace_instruction(&mut self, instr: WarpInstruction) {
        self.trace_instructions.push_back(instr);
    }

    /// Advance the trace cursor, updating the simt stack from the trace.
    pub fn next_trace_inst(&mut self) -> Option<&WarpInstruction> {
        if self.trace_pc >= self.trace_instructions.len() {
            return None;
        }
        let (pc, is_branch, branch_mask) = {
            let instr = &self.trace_instructions[self.trace_pc];
            (instr.pc, instr.is_branch(), instr.active_mask)
        };
        self.simt_stack.reconverge(pc);
        if is_branch {
            // taken and not-taken masks come from the trace: the next trace
            // instruction carries the mask of the path that executes first
            let next = self
                .trace_instructions
                .get(self.trace_pc + 1)
                .map(|next| (next.pc, next.active_mask));
            if let Some((next_pc, next_mask)) = next {
                let taken_mask = next_mask & branch_mask;
                let not_taken_mask = branch_mask & !taken_mask;
                let fallthrough_pc = pc + 16;
                self.simt_stack.diverge(
                    next_pc,
                    fallthrough_pc,
                    taken_mask,
                    not_taken_mask,
                    next_pc.max(fallthrough_pc),
                );
            }
        }
        self.trace_pc += 1;
        Some(&self.trace_instructions[self.trace_pc - 1])
    }

    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.trace_instructions.len()
    }

    #[must_use]
    pub fn pc(&self) -> Option<usize> {
        debug_assert!(self.trace_pc <= self.instruction_count());
        self.trace_instructions
            .get(self.trace_pc)
            .map(|instr| instr.pc)
    }

    /// All trace instructions have been fetched.
    #[must_use]
    pub fn done(&self) -> bool {
        self.trace_pc == self.instruction_count()
    }

    pub fn ibuffer_fill(&mut self, slot: usize, instr: WarpInstruction) {
        debug_assert!(slot < self.instr_buffer.len());
        self.instr_buffer[slot] = Some(instr);
        self.next = 0;
    }

    #[must_use]
    pub fn ibuffer_empty(&self) -> bool {
        self.instr_buffer.iter().all(Option::is_none)
    }

    pub fn ibuffer_flush(&mut self) {
        for slot in &mut self.instr_buffer {
            if slot.is_some() {
                self.num_instr_in_pipeline -= 1;
            }
            *slot = None;
        }
    }

    #[must_use]
    pub fn ibuffer_peek(&self) -> Option<&WarpInstruction> {
        self.instr_buffer[self.next].as_ref()
    }

    pub fn ibuffer_take(&mut self) -> Option<WarpInstruction> {
        self.instr_buffer[self.next].take()
    }

    pub fn ibuffer_step(&mut self) {
        self.next = (self.next + 1) % IBUFFER_SIZE;
    }

    #[must_use]
    pub fn done_exit(&self) -> bool {
        self.done_exit
    }

    /// All lanes have executed their exit.
    #[must_use]
    pub fn functional_done(&self) -> bool {
        self.active_mask.not_any()
    }

    #[must_use]
    pub fn hardware_done(&self) -> bool {
        self.functional_done() && self.stores_done() && self.num_instr_in_pipeline == 0
    }

    #[must_use]
    pub fn stores_done(&self) -> bool {
        self.num_outstanding_stores == 0
    }

    pub fn set_thread_completed(&mut self, lane: usize) {
        self.active_mask.set(lane, false);
        let mut exited = ActiveMask::ZERO;
        exited.set(lane, true);
        self.simt_stack.exit_lanes(exited);
    }

    #[must_use]
    pub fn waiting(&self) -> bool {
        if self.functional_done() {
            // waiting to be initialized with a kernel
            true
        } else if self.waiting_for_memory_barrier {
            true
        } else {
            self.num_outstanding_atomics > 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Warp;

    #[test]
    fn ibuffer_round_robin() {
        let mut warp = Warp::default();
        assert!(warp.ibuffer_empty());
        assert!(warp.ibuffer_peek().is_none());
        warp.ibuffer_step();
        assert!(warp.ibuffer_peek().is_none());
    }

    #[test]
    fn fresh_warp_is_waiting() {
        let warp = Warp::default();
        assert!(warp.functional_done());
        assert!(warp.waiting());
    }
}
