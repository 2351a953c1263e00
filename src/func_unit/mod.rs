pub mod load_store;

pub use load_store::LoadStoreUnit;

use crate::{instruction::WarpInstruction, opcodes::ArchOp, register_set, warp};
use bitvec::{array::BitArray, BitArr};

pub const MAX_ALU_LATENCY: usize = 512;
pub type OccupiedSlots = BitArr!(for MAX_ALU_LATENCY);

/// The execution pipelines a core can instantiate.
///
/// Units differ only by their name, their op-class filter and the latencies
/// the configuration assigns to those op classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Sp,
    Dp,
    Int,
    Sfu,
    Mem,
}

impl Kind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Sp => "SPUnit",
            Kind::Dp => "DPUnit",
            Kind::Int => "IntUnit",
            Kind::Sfu => "SFUUnit",
            Kind::Mem => "LdstUnit",
        }
    }

    /// Can this pipeline execute the op class?
    #[must_use]
    pub fn accepts(&self, category: ArchOp) -> bool {
        match self {
            Kind::Sp => matches!(
                category,
                ArchOp::SP_OP
                    | ArchOp::ALU_OP
                    | ArchOp::INT_OP
                    | ArchOp::BRANCH_OP
                    | ArchOp::EXIT_OPS
                    | ArchOp::NO_OP
            ),
            Kind::Int => matches!(
                category,
                ArchOp::INT_OP | ArchOp::ALU_OP | ArchOp::BRANCH_OP | ArchOp::EXIT_OPS
            ),
            Kind::Dp => matches!(category, ArchOp::DP_OP),
            // cores without dedicated DP units run doubles on the SFU
            Kind::Sfu => matches!(category, ArchOp::SFU_OP | ArchOp::DP_OP),
            Kind::Mem => matches!(
                category,
                ArchOp::LOAD_OP | ArchOp::STORE_OP | ArchOp::MEMORY_BARRIER_OP
            ),
        }
    }
}

/// A pipelined SIMD execution unit.
///
/// Instructions enter the dispatch register, wait out their initiation
/// interval, then traverse `latency` pipeline slots towards the result port.
#[derive(Debug)]
pub struct PipelinedUnit {
    pub id: usize,
    pub kind: Kind,
    pub pipeline_reg: Vec<Option<WarpInstruction>>,
    pub dispatch_reg: Option<WarpInstruction>,
    /// Result-slot reservations by remaining latency.
    pub occupied: OccupiedSlots,
    /// With the sub-core model, the issue register slot this unit reads.
    pub issue_reg_id: usize,
    active_insts_in_pipeline: usize,
}

impl std::fmt::Display for PipelinedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind.name(), self.id)
    }
}

impl PipelinedUnit {
    #[must_use]
    pub fn new(id: usize, kind: Kind, depth: usize, issue_reg_id: usize) -> Self {
        debug_assert!(depth > 0);
        let pipeline_reg = (0..depth).map(|_| None).collect();
        Self {
            id,
            kind,
            pipeline_reg,
            dispatch_reg: None,
            occupied: BitArray::ZERO,
            issue_reg_id,
            active_insts_in_pipeline: 0,
        }
    }

    #[must_use]
    pub fn can_issue(&self, instr: &WarpInstruction) -> bool {
        self.kind.accepts(instr.opcode.category)
            && self.dispatch_reg.is_none()
            && !self.occupied[instr.latency.min(MAX_ALU_LATENCY - 1)]
    }

    pub fn issue(&mut self, instr: WarpInstruction) {
        debug_assert!(self.dispatch_reg.is_none());
        self.occupied
            .set(instr.latency.min(MAX_ALU_LATENCY - 1), true);
        self.dispatch_reg = Some(instr);
    }

    #[must_use]
    pub fn active_lanes_in_pipeline(&self) -> usize {
        let mut active: warp::ActiveMask = BitArray::ZERO;
        for stage in self.pipeline_reg.iter().flatten() {
            active |= stage.active_mask;
        }
        active.count_ones()
    }

    #[must_use]
    pub fn num_active_instr_in_pipeline(&self) -> usize {
        self.pipeline_reg.iter().flatten().count()
    }

    /// ALU pipelines never stall; only the memory pipeline does.
    #[must_use]
    pub fn stallable(&self) -> bool {
        self.kind == Kind::Mem
    }

    /// Advance the pipeline by one cycle, moving the head into the result
    /// port (EX|WB registers).
    pub fn cycle(&mut self, result_port: &mut register_set::RegisterSet) {
        if let Some(finished) = self.pipeline_reg[0].take() {
            debug_assert!(result_port.has_free());
            result_port.move_in_from(Some(finished));
            debug_assert!(self.active_insts_in_pipeline > 0);
            self.active_insts_in_pipeline -= 1;
        }

        if self.active_insts_in_pipeline > 0 {
            for stage in 0..(self.pipeline_reg.len() - 1) {
                if self.pipeline_reg[stage].is_none() {
                    let moving = self.pipeline_reg[stage + 1].take();
                    register_set::move_warp(moving, &mut self.pipeline_reg[stage]);
                }
            }
        }

        if let Some(ref mut dispatch) = self.dispatch_reg {
            dispatch.dispatch_delay_cycles = dispatch.dispatch_delay_cycles.saturating_sub(1);
            if dispatch.dispatch_delay_cycles == 0 {
                let start_stage = dispatch
                    .latency
                    .saturating_sub(dispatch.initiation_interval)
                    .min(self.pipeline_reg.len() - 1);
                if self.pipeline_reg[start_stage].is_none() {
                    let dispatch = self.dispatch_reg.take().unwrap();
                    register_set::move_warp(Some(dispatch), &mut self.pipeline_reg[start_stage]);
                    self.active_insts_in_pipeline += 1;
                }
            }
        }

        // the result-slot reservations march towards slot zero
        self.occupied.shift_left(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{Kind, PipelinedUnit};
    use crate::core::PipelineStage;
    use crate::register_set::RegisterSet;
    use crate::{config, instruction::WarpInstruction};
    use color_eyre::eyre;
    use trace_model::{Dim, KernelLaunch, TraceInstruction};

    fn alu_instr() -> eyre::Result<WarpInstruction> {
        let launch = KernelLaunch {
            name: "test".to_string(),
            id: 0,
            trace_file: String::new(),
            grid: Dim::new(1, 1, 1),
            block: Dim::new(32, 1, 1),
            shared_mem_bytes: 0,
            num_registers: 8,
            stream_id: 0,
            shared_mem_base_addr: 0,
            local_mem_base_addr: 0,
        };
        let trace = TraceInstruction {
            pc: 0,
            active_mask: u32::MAX,
            dest_regs: vec![1],
            opcode: "FADD".to_string(),
            src_regs: vec![2, 3],
            mem_width: 0,
            addrs: [0; 32],
            block_id: Dim::new(0, 0, 0),
            warp_id: 0,
            instr_idx: 0,
            line: 1,
        };
        Ok(WarpInstruction::from_trace(
            &launch,
            &trace,
            &config::GPU::default(),
        )?)
    }

    #[test]
    fn instruction_traverses_the_pipeline() -> eyre::Result<()> {
        let config = config::GPU::default();
        let (latency, _) = config.latency_of(crate::opcodes::ArchOp::SP_OP);
        let mut unit = PipelinedUnit::new(0, Kind::Sp, super::MAX_ALU_LATENCY.min(64), 0);
        let mut result_port = RegisterSet::new(PipelineStage::EX_WB, 2);

        let instr = alu_instr()?;
        assert!(unit.can_issue(&instr));
        unit.issue(instr);
        assert!(!unit.can_issue(&alu_instr()?));

        let mut cycles: usize = 0;
        while !result_port.has_ready() {
            unit.cycle(&mut result_port);
            cycles += 1;
            assert!(cycles < 200, "instruction never completed");
        }
        assert!(cycles >= latency);
        Ok(())
    }

    #[test]
    fn op_class_filter() -> eyre::Result<()> {
        let unit = PipelinedUnit::new(0, Kind::Sfu, 16, 0);
        let instr = alu_instr()?;
        assert!(!unit.can_issue(&instr));
        Ok(())
    }
}
