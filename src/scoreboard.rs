use super::instruction::WarpInstruction;
use std::collections::HashSet;

/// Tracks pending destination registers per warp.
///
/// An instruction may issue only when none of its source or destination
/// registers are pending (RAW and WAW; WAR cannot occur with in-order issue).
#[derive(Debug, Default)]
pub struct Scoreboard {
    pub core_id: usize,
    pub cluster_id: usize,
    warp_registers: Box<[HashSet<u32>]>,
}

impl Scoreboard {
    #[must_use]
    pub fn new(core_id: usize, cluster_id: usize, max_warps: usize) -> Self {
        Self {
            core_id,
            cluster_id,
            warp_registers: utils::box_slice![HashSet::new(); max_warps],
        }
    }

    /// Does the instruction collide with a pending register?
    #[must_use]
    pub fn has_collision(&self, warp_id: usize, instr: &WarpInstruction) -> bool {
        use itertools::Itertools;
        let reserved = &self.warp_registers[warp_id];
        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "scoreboard: warp {warp_id} has reserved registers {:?}",
                reserved.iter().sorted().collect::<Vec<_>>(),
            );
        }
        instr
            .inputs()
            .chain(instr.outputs())
            .any(|reg| reserved.contains(reg))
    }

    #[must_use]
    pub fn pending_writes(&self, warp_id: usize) -> &HashSet<u32> {
        &self.warp_registers[warp_id]
    }

    pub fn reserve(&mut self, warp_id: usize, reg_num: u32) {
        let registers = &mut self.warp_registers[warp_id];
        assert!(
            !registers.contains(&reg_num),
            "core {}: reserving an already reserved register (warp={warp_id}, reg={reg_num})",
            self.core_id,
        );
        log::trace!("scoreboard: warp {warp_id} reserves register {reg_num}");
        registers.insert(reg_num);
    }

    /// Reserve all destination registers of an instruction on issue.
    pub fn reserve_all(&mut self, instr: &WarpInstruction) {
        for &out_reg in instr.outputs() {
            self.reserve(instr.warp_id, out_reg);
        }
    }

    pub fn release(&mut self, warp_id: usize, reg_num: u32) {
        let removed = self.warp_registers[warp_id].remove(&reg_num);
        if removed {
            log::trace!("scoreboard: warp {warp_id} releases register {reg_num}");
        }
    }

    /// Release all destination registers of an instruction on writeback.
    pub fn release_all(&mut self, instr: &WarpInstruction) {
        for &out_reg in instr.outputs() {
            self.release(instr.warp_id, out_reg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Scoreboard;
    use crate::{config, instruction::WarpInstruction};
    use color_eyre::eyre;
    use trace_model::{Dim, KernelLaunch, TraceInstruction};

    fn instr(dest_regs: Vec<u32>, src_regs: Vec<u32>) -> eyre::Result<WarpInstruction> {
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
            dest_regs,
            opcode: "IADD".to_string(),
            src_regs,
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
    fn detects_raw_and_waw_hazards() -> eyre::Result<()> {
        let mut scoreboard = Scoreboard::new(0, 0, 4);
        // writes R3 (trace registers are incremented by one)
        let producer = instr(vec![2], vec![0, 1])?;
        scoreboard.reserve_all(&producer);

        // RAW: reads R3
        let raw = instr(vec![4], vec![2])?;
        assert!(scoreboard.has_collision(0, &raw));

        // WAW: writes R3
        let waw = instr(vec![2], vec![5])?;
        assert!(scoreboard.has_collision(0, &waw));

        // independent registers pass
        let independent = instr(vec![6], vec![4, 5])?;
        assert!(!scoreboard.has_collision(0, &independent));

        scoreboard.release_all(&producer);
        assert!(!scoreboard.has_collision(0, &raw));
        Ok(())
    }
}
