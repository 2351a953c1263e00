use crate::instruction;
use bitvec::{array::BitArray, BitArr};
use std::collections::HashMap;

pub const MAX_WARPS_PER_CORE: usize = 64;
pub type WarpMask = BitArr!(for MAX_WARPS_PER_CORE);

/// Per-core named barriers.
///
/// A warp reaching a barrier stalls until every active warp of its block has
/// arrived at the same barrier id.
#[derive(Debug)]
pub struct BarrierSet {
    max_blocks_per_core: usize,
    max_barriers_per_block: usize,
    /// Warps of each active block, by hardware block id.
    warps_per_block: HashMap<usize, WarpMask>,
    /// Warps waiting at each named barrier.
    barrier_to_warps: Box<[WarpMask]>,
    active_warps: WarpMask,
    warps_at_barrier: WarpMask,
}

impl BarrierSet {
    #[must_use]
    pub fn new(max_blocks_per_core: usize, max_barriers_per_block: usize) -> Self {
        Self {
            max_blocks_per_core,
            max_barriers_per_block,
            warps_per_block: HashMap::new(),
            barrier_to_warps: utils::box_slice![BitArray::ZERO; max_barriers_per_block],
            active_warps: BitArray::ZERO,
            warps_at_barrier: BitArray::ZERO,
        }
    }

    #[must_use]
    pub fn is_waiting_at_barrier(&self, warp_id: usize) -> bool {
        self.warps_at_barrier[warp_id]
    }

    /// Register the warps of a newly launched block.
    pub fn allocate(&mut self, block_hw_id: usize, warps: WarpMask) {
        assert!(block_hw_id < self.max_blocks_per_core);
        assert!(
            !self.warps_per_block.contains_key(&block_hw_id),
            "block should not already be active"
        );
        self.warps_per_block.insert(block_hw_id, warps);
        assert!(self.warps_per_block.len() <= self.max_blocks_per_core);

        self.active_warps |= warps;
        self.warps_at_barrier &= !warps;
        for barrier in self.barrier_to_warps.iter_mut() {
            *barrier &= !warps;
        }
    }

    /// Remove a completed block.
    pub fn deallocate(&mut self, block_hw_id: usize) {
        let Some(warps_in_block) = self.warps_per_block.remove(&block_hw_id) else {
            return;
        };
        let at_barrier = warps_in_block & self.warps_at_barrier;
        assert!(!at_barrier.any(), "warps stuck at barrier");
        let active = warps_in_block & self.active_warps;
        assert!(!active.any(), "warps in completed block still running");

        self.active_warps &= !warps_in_block;
        self.warps_at_barrier &= !warps_in_block;
        for barrier in self.barrier_to_warps.iter_mut() {
            *barrier &= !warps_in_block;
        }
    }

    /// A warp exited: a barrier may release without it.
    pub fn warp_exited(&mut self, warp_id: usize) {
        self.active_warps.set(warp_id, false);

        let Some(warps_in_block) = self
            .warps_per_block
            .values()
            .find(|warps| warps[warp_id])
            .copied()
        else {
            return;
        };
        let active = warps_in_block & self.active_warps;
        for barrier_id in 0..self.max_barriers_per_block {
            let at_barrier = warps_in_block & self.barrier_to_warps[barrier_id];
            if at_barrier == active && active.any() {
                self.barrier_to_warps[barrier_id] &= !at_barrier;
                self.warps_at_barrier &= !at_barrier;
            }
        }
    }

    /// A warp reached a barrier instruction.
    pub fn warp_reached_barrier(
        &mut self,
        block_hw_id: usize,
        warp_id: usize,
        barrier: &instruction::BarrierInfo,
    ) {
        let warps_in_block = self
            .warps_per_block
            .get(&block_hw_id)
            .copied()
            .expect("block not registered with the barrier set");
        assert!(warps_in_block[warp_id], "warp not in the block");
        assert!(barrier.id < self.max_barriers_per_block);

        self.barrier_to_warps[barrier.id].set(warp_id, true);
        self.warps_at_barrier.set(warp_id, true);

        let at_barrier = warps_in_block & self.barrier_to_warps[barrier.id];
        let active = warps_in_block & self.active_warps;
        if at_barrier == active {
            // all active warps arrived: release everyone
            self.barrier_to_warps[barrier.id] &= !at_barrier;
            self.warps_at_barrier &= !at_barrier;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BarrierSet, WarpMask};
    use crate::instruction::BarrierInfo;
    use bitvec::array::BitArray;

    fn warps(ids: &[usize]) -> WarpMask {
        let mut mask: WarpMask = BitArray::ZERO;
        for id in ids {
            mask.set(*id, true);
        }
        mask
    }

    #[test]
    fn barrier_releases_when_all_warps_arrive() {
        let mut barriers = BarrierSet::new(8, 16);
        barriers.allocate(0, warps(&[0, 1]));

        barriers.warp_reached_barrier(0, 0, &BarrierInfo { id: 0 });
        assert!(barriers.is_waiting_at_barrier(0));
        assert!(!barriers.is_waiting_at_barrier(1));

        barriers.warp_reached_barrier(0, 1, &BarrierInfo { id: 0 });
        assert!(!barriers.is_waiting_at_barrier(0));
        assert!(!barriers.is_waiting_at_barrier(1));
    }

    #[test]
    fn exited_warps_release_a_barrier() {
        let mut barriers = BarrierSet::new(8, 16);
        barriers.allocate(0, warps(&[0, 1]));

        barriers.warp_reached_barrier(0, 0, &BarrierInfo { id: 0 });
        // warp 1 exits without reaching the barrier
        barriers.warp_exited(1);
        assert!(!barriers.is_waiting_at_barrier(0));
    }
}
