use super::core::PipelineStage;
use super::instruction::WarpInstruction;

/// A pipeline register between two stages: a fixed array of instruction
/// slots that are either free or hold a ready instruction.
///
/// Under the sub-core model each scheduler owns the slot matching its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSet {
    pub stage: PipelineStage,
    pub regs: Box<[Option<WarpInstruction>]>,
}

impl RegisterSet {
    #[must_use]
    pub fn new(stage: PipelineStage, size: usize) -> Self {
        let regs = (0..size).map(|_| None).collect();
        Self { stage, regs }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.regs.len()
    }

    #[must_use]
    pub fn has_free(&self) -> bool {
        self.regs.iter().any(Option::is_none)
    }

    /// Under the sub-core model a scheduler may only use its own slot.
    #[must_use]
    pub fn has_free_sub_core(&self, reg_id: usize) -> bool {
        self.regs.get(reg_id).is_some_and(Option::is_none)
    }

    #[must_use]
    pub fn has_ready(&self) -> bool {
        self.regs.iter().any(Option::is_some)
    }

    pub fn get_free_mut(&mut self) -> Option<&mut Option<WarpInstruction>> {
        self.regs.iter_mut().find(|slot| slot.is_none())
    }

    pub fn get_free_sub_core_mut(&mut self, reg_id: usize) -> Option<&mut Option<WarpInstruction>> {
        self.regs.get_mut(reg_id).filter(|slot| slot.is_none())
    }

    /// The oldest ready instruction, by issue uid.
    #[must_use]
    pub fn get_ready(&self) -> Option<(usize, &WarpInstruction)> {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|instr| (idx, instr)))
            .min_by_key(|(_, instr)| instr.uid)
    }

    pub fn get_ready_mut(&mut self) -> Option<&mut Option<WarpInstruction>> {
        let ready_idx = self.get_ready().map(|(idx, _)| idx)?;
        self.regs.get_mut(ready_idx)
    }

    pub fn get_ready_sub_core_mut(
        &mut self,
        reg_id: usize,
    ) -> Option<&mut Option<WarpInstruction>> {
        self.regs.get_mut(reg_id).filter(|slot| slot.is_some())
    }

    pub fn move_in_from(&mut self, src: Option<WarpInstruction>) {
        let free = self.get_free_mut().expect("free register slot");
        move_warp(src, free);
    }
}

impl std::fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let instructions = self
            .regs
            .iter()
            .map(|slot| slot.as_ref().map(std::string::ToString::to_string));
        f.debug_list().entries(instructions).finish()
    }
}

/// Move an instruction between pipeline slots.
pub fn move_warp(from: Option<WarpInstruction>, to: &mut Option<WarpInstruction>) {
    debug_assert!(to.is_none());
    *to = from;
}

#[cfg(test)]
mod tests {
    use super::RegisterSet;
    use crate::core::PipelineStage;

    #[test]
    fn tracks_free_and_ready_slots() {
        let set = RegisterSet::new(PipelineStage::ID_OC_SP, 2);
        assert!(set.has_free());
        assert!(!set.has_ready());
        assert!(set.has_free_sub_core(0));
        assert!(set.has_free_sub_core(1));
        assert!(!set.has_free_sub_core(2));
    }
}
