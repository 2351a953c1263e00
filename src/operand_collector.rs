use super::{config, core::PipelineStage, instruction::WarpInstruction, register_set};
use bitvec::{array::BitArray, BitArr};
use register_set::RegisterSet;
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

pub const MAX_REG_OPERANDS: usize = 32;

/// The register file bank an operand lives in.
///
/// Under the sub-core model each scheduler owns a contiguous slice of banks.
fn compute_register_bank(
    reg_num: u32,
    warp_id: usize,
    num_banks: usize,
    bank_warp_shift: usize,
    sub_core_model: bool,
    banks_per_scheduler: usize,
    scheduler_id: usize,
) -> usize {
    let mut bank = reg_num as usize;
    if bank_warp_shift > 0 {
        bank += warp_id;
    }
    if sub_core_model {
        let bank_num = (scheduler_id * banks_per_scheduler) + (bank % banks_per_scheduler);
        debug_assert!(bank_num < num_banks);
        bank_num
    } else {
        bank % num_banks
    }
}

/// A source (read) operand buffered by a collector unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceOperand {
    pub warp_id: usize,
    /// Index of this operand within the instruction.
    pub operand: usize,
    pub register: u32,
    pub bank: usize,
    pub scheduler_id: usize,
    pub collector_unit_id: usize,
}

/// A destination (write) operand on its way to the register file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationOperand {
    pub warp_id: usize,
    pub register: u32,
    pub bank: usize,
}

/// The collector unit pools instructions can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    SP_CUS,
    DP_CUS,
    INT_CUS,
    SFU_CUS,
    MEM_CUS,
    GEN_CUS,
}

#[derive(Debug, Clone)]
struct PendingInstruction {
    warp_instr: WarpInstruction,
    /// Issued into this register set once all operands arrived.
    output_register: PipelineStage,
    src_operands: Vec<Option<SourceOperand>>,
    not_ready: BitArr!(for MAX_REG_OPERANDS * 2),
}

/// Buffers the source operands of one instruction until all of them have
/// been read from the register file banks.
#[derive(Debug, Clone)]
pub struct CollectorUnit {
    pub id: usize,
    pub kind: Kind,
    pending: Option<PendingInstruction>,
    num_banks: usize,
    bank_warp_shift: usize,
    sub_core_model: bool,
    num_banks_per_scheduler: usize,
    /// With the sub-core model, the output register slot this unit may use.
    reg_id: usize,
}

impl CollectorUnit {
    fn new(kind: Kind, id: usize) -> Self {
        Self {
            id,
            kind,
            pending: None,
            num_banks: 0,
            bank_warp_shift: 0,
            sub_core_model: false,
            num_banks_per_scheduler: 0,
            reg_id: 0,
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.pending.is_none()
    }

    /// Ready for dispatch: no outstanding operand reads and a free slot in
    /// the output register set.
    #[must_use]
    fn ready(&self, pipeline_reg: &[RegisterSet]) -> bool {
        let Some(ref pending) = self.pending else {
            return false;
        };
        let output = &pipeline_reg[pending.output_register as usize];
        let has_free = if self.sub_core_model {
            output.has_free_sub_core(self.reg_id)
        } else {
            output.has_free()
        };
        pending.not_ready.not_any() && has_free
    }

    fn dispatch(&mut self, pipeline_reg: &mut [RegisterSet]) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        debug_assert!(pending.not_ready.not_any());
        let output = &mut pipeline_reg[pending.output_register as usize];
        if self.sub_core_model {
            let slot = output
                .get_free_sub_core_mut(self.reg_id)
                .expect("free sub-core slot");
            register_set::move_warp(Some(pending.warp_instr), slot);
        } else {
            let slot = output.get_free_mut().expect("free slot");
            register_set::move_warp(Some(pending.warp_instr), slot);
        }
    }

    /// Assign the oldest ready instruction of the input register set to this
    /// unit and queue its operand reads.
    fn allocate(&mut self, input: &mut RegisterSet, output_register: PipelineStage) -> bool {
        debug_assert!(self.is_free());
        let Some(ready_reg) = input.get_ready_mut().and_then(Option::take) else {
            return false;
        };

        let mut src_operands = vec![None; MAX_REG_OPERANDS * 2];
        let mut not_ready = BitArray::ZERO;

        let mut seen = SmallVec::<[u32; 8]>::new();
        for (op, reg_num) in ready_reg
            .inputs()
            .copied()
            .enumerate()
            .filter(|(_, reg_num)| {
                if seen.contains(reg_num) {
                    false
                } else {
                    seen.push(*reg_num);
                    true
                }
            })
        {
            let scheduler_id = ready_reg.scheduler_id.unwrap_or(0);
            let bank = compute_register_bank(
                reg_num,
                ready_reg.warp_id,
                self.num_banks,
                self.bank_warp_shift,
                self.sub_core_model,
                self.num_banks_per_scheduler,
                scheduler_id,
            );
            src_operands[op] = Some(SourceOperand {
                warp_id: ready_reg.warp_id,
                collector_unit_id: self.id,
                operand: op,
                register: reg_num,
                bank,
                scheduler_id,
            });
            not_ready.set(op, true);
        }

        self.reg_id = ready_reg.scheduler_id.unwrap_or(0);
        self.pending = Some(PendingInstruction {
            warp_instr: ready_reg,
            output_register,
            src_operands,
            not_ready,
        });
        true
    }

    fn collect_operand(&mut self, op: usize) {
        if let Some(ref mut pending) = self.pending {
            pending.not_ready.set(op, false);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Allocation {
    Read(SourceOperand),
    Write(DestinationOperand),
}

/// Arbitrates the register file banks between operand reads and writebacks.
///
/// Each bank serves at most one operand per cycle; writes take priority over
/// reads. Reads are granted with a wavefront allocator over the
/// bank-by-collector request matrix.
#[derive(Debug, Default)]
pub struct Arbiter {
    num_banks: usize,
    num_collectors: usize,
    bank_warp_shift: usize,
    sub_core_model: bool,
    num_banks_per_scheduler: usize,

    allocated_banks: Box<[Option<Allocation>]>,
    queue: Box<[VecDeque<SourceOperand>]>,
    /// Priority diagonal of the wavefront allocator.
    last_cu: usize,
    inmatch: Vec<Option<usize>>,
    request: ndarray::Array2<bool>,
}

impl Arbiter {
    pub fn init(
        &mut self,
        num_collectors: usize,
        num_banks: usize,
        bank_warp_shift: usize,
        sub_core_model: bool,
        num_banks_per_scheduler: usize,
    ) {
        debug_assert!(num_collectors > 0);
        debug_assert!(num_banks > 0);
        self.num_collectors = num_collectors;
        self.num_banks = num_banks;
        self.bank_warp_shift = bank_warp_shift;
        self.sub_core_model = sub_core_model;
        self.num_banks_per_scheduler = num_banks_per_scheduler;
        self.allocated_banks = utils::box_slice![None; num_banks];
        self.queue = utils::box_slice![VecDeque::new(); num_banks];
        self.inmatch = vec![None; num_banks];
        self.request = ndarray::Array2::from_elem((num_banks, num_collectors), false);
        self.last_cu = 0;
    }

    fn add_read_requests(&mut self, cu: &CollectorUnit) {
        let Some(ref pending) = cu.pending else {
            return;
        };
        for op in pending.src_operands.iter().flatten() {
            self.queue[op.bank].push_back(op.clone());
        }
    }

    #[must_use]
    fn bank_idle(&self, bank: usize) -> bool {
        self.allocated_banks[bank].is_none()
    }

    fn allocate_bank_for_write(&mut self, bank: usize, op: DestinationOperand) {
        debug_assert!(bank < self.num_banks);
        self.allocated_banks[bank] = Some(Allocation::Write(op));
    }

    fn allocate_bank_for_read(&mut self, bank: usize, op: SourceOperand) {
        debug_assert!(bank < self.num_banks);
        self.allocated_banks[bank] = Some(Allocation::Read(op));
    }

    /// Grant at most one read per bank such that no two grants target the
    /// same collector unit, using the booksim wavefront allocator.
    fn allocate_reads(&mut self) -> SmallVec<[SourceOperand; 8]> {
        let mut allocated = SmallVec::new();
        let no_allocation = self.allocated_banks.iter().all(Option::is_none);
        let empty_queues = self.queue.iter().all(VecDeque::is_empty);

        if no_allocation && empty_queues {
            self.last_cu = (self.last_cu + 1) % self.num_collectors;
            return allocated;
        }

        let num_inputs = self.num_banks;
        let num_outputs = self.num_collectors;

        self.inmatch.fill(None);
        self.request.fill(false);
        for bank in 0..num_inputs {
            if let Some(op) = self.queue[bank].front() {
                debug_assert!(op.collector_unit_id < num_outputs);
                self.request[(bank, op.collector_unit_id)] = true;
            }
            if matches!(self.allocated_banks[bank], Some(Allocation::Write(_))) {
                // writes win the bank outright
                self.inmatch[bank] = Some(usize::MAX);
            }
        }

        // walk the diagonals of the request matrix
        let square = num_inputs.max(num_outputs);
        let mut cu_priority = self.last_cu;
        for p in 0..square {
            let mut output = (cu_priority + p) % num_outputs;
            for input in 0..num_inputs {
                if self.inmatch[input].is_none() && self.request[(input, output)] {
                    self.inmatch[input] = Some(output);
                }
                output = (output + 1) % num_outputs;
            }
        }
        cu_priority = (cu_priority + 1) % num_outputs;
        self.last_cu = cu_priority;

        for bank in 0..num_inputs {
            if self.inmatch[bank].is_some_and(|output| output != usize::MAX) {
                if let Some(op) = self.queue[bank].pop_front() {
                    allocated.push(op);
                }
            }
        }

        for read in &allocated {
            let bank = compute_register_bank(
                read.register,
                read.warp_id,
                self.num_banks,
                self.bank_warp_shift,
                self.sub_core_model,
                self.num_banks_per_scheduler,
                read.scheduler_id,
            );
            self.allocate_bank_for_read(bank, read.clone());
        }
        allocated
    }

    fn reset_allocation(&mut self) {
        self.allocated_banks.fill(None);
    }
}

/// Dispatches ready collector units of one pool into their output register.
#[derive(Debug, Clone)]
pub struct DispatchUnit {
    last_collector_unit: usize,
    kind: Kind,
    sub_core_model: bool,
    num_warp_schedulers: usize,
}

impl DispatchUnit {
    #[must_use]
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            last_collector_unit: 0,
            sub_core_model: false,
            num_warp_schedulers: 0,
        }
    }

    /// Round-robin pick of a ready collector unit from this unit's pool.
    ///
    /// With the sub-core model the scan starts at the next unit belonging to
    /// a different scheduler than the last dispatch.
    fn find_ready(
        &mut self,
        collector_units: &[CollectorUnit],
        pool: &[usize],
        pipeline_reg: &[RegisterSet],
    ) -> Option<usize> {
        let num_units = pool.len();
        if num_units == 0 {
            return None;
        }
        let units_per_scheduler = (num_units / self.num_warp_schedulers.max(1)).max(1);
        let increment = if self.sub_core_model {
            units_per_scheduler - (self.last_collector_unit % units_per_scheduler)
        } else {
            1
        };
        for i in 0..num_units {
            let idx = (self.last_collector_unit + increment + i) % num_units;
            let cu_id = pool[idx];
            if collector_units[cu_id].ready(pipeline_reg) {
                self.last_collector_unit = idx;
                return Some(cu_id);
            }
        }
        None
    }
}

/// A port connecting input pipeline registers to collector unit pools and
/// output pipeline registers.
#[derive(Debug, Clone)]
pub struct Port {
    pub in_stages: Vec<PipelineStage>,
    pub out_stages: Vec<PipelineStage>,
    pub collector_kinds: Vec<Kind>,
}

/// The operand collector: collector units, the bank arbiter and the
/// dispatch units in front of the banked register file.
#[derive(Debug)]
pub struct RegisterFileUnit {
    pub config: Arc<config::GPU>,
    pub arbiter: Arbiter,
    pub collector_units: Vec<CollectorUnit>,
    /// Pool of collector unit indices per kind.
    pools: BTreeMap<Kind, Vec<usize>>,
    dispatch_units: Vec<DispatchUnit>,
    in_ports: Vec<Port>,
    num_banks: usize,
    bank_warp_shift: usize,
    sub_core_model: bool,
    num_banks_per_scheduler: usize,
}

impl RegisterFileUnit {
    #[must_use]
    pub fn new(config: Arc<config::GPU>) -> Self {
        Self {
            config,
            arbiter: Arbiter::default(),
            collector_units: Vec::new(),
            pools: BTreeMap::new(),
            dispatch_units: Vec::new(),
            in_ports: Vec::new(),
            num_banks: 0,
            bank_warp_shift: 0,
            sub_core_model: false,
            num_banks_per_scheduler: 0,
        }
    }

    pub fn add_cu_set(&mut self, kind: Kind, num_units: usize, num_dispatch_units: usize) {
        let pool = self.pools.entry(kind).or_default();
        for _ in 0..num_units {
            let id = self.collector_units.len();
            self.collector_units.push(CollectorUnit::new(kind, id));
            pool.push(id);
        }
        for _ in 0..num_dispatch_units {
            self.dispatch_units.push(DispatchUnit::new(kind));
        }
    }

    pub fn add_port(
        &mut self,
        in_stages: Vec<PipelineStage>,
        out_stages: Vec<PipelineStage>,
        collector_kinds: Vec<Kind>,
    ) {
        debug_assert_eq!(in_stages.len(), out_stages.len());
        self.in_ports.push(Port {
            in_stages,
            out_stages,
            collector_kinds,
        });
    }

    /// Must be called once all collector unit sets have been added.
    pub fn init(&mut self, num_banks: usize) {
        self.num_banks = num_banks;
        self.bank_warp_shift = usize::from(self.config.reg_bank_use_warp_id);
        self.sub_core_model = self.config.sub_core_model;
        let num_schedulers = self.config.num_schedulers_per_core;
        self.num_banks_per_scheduler = if self.sub_core_model {
            num_banks / num_schedulers
        } else {
            num_banks
        };
        let num_collectors = self.collector_units.len();
        self.arbiter.init(
            num_collectors,
            num_banks,
            self.bank_warp_shift,
            self.sub_core_model,
            self.num_banks_per_scheduler,
        );
        for cu in &mut self.collector_units {
            cu.num_banks = num_banks;
            cu.bank_warp_shift = self.bank_warp_shift;
            cu.sub_core_model = self.sub_core_model;
            cu.num_banks_per_scheduler = self.num_banks_per_scheduler;
        }
        for dispatch in &mut self.dispatch_units {
            dispatch.sub_core_model = self.sub_core_model;
            dispatch.num_warp_schedulers = num_schedulers;
        }
    }

    /// One operand collector cycle: dispatch ready units, grant bank reads,
    /// pick up new instructions, release the banks.
    pub fn step(&mut self, pipeline_reg: &mut [RegisterSet]) {
        self.dispatch_ready_cu(pipeline_reg);

        let granted = self.arbiter.allocate_reads();
        for read in granted {
            self.collector_units[read.collector_unit_id].collect_operand(read.operand);
        }

        for port_idx in 0..self.in_ports.len() {
            self.allocate_cu(port_idx, pipeline_reg);
        }
        self.arbiter.reset_allocation();
    }

    fn dispatch_ready_cu(&mut self, pipeline_reg: &mut [RegisterSet]) {
        for dispatch in &mut self.dispatch_units {
            let pool = self.pools.get(&dispatch.kind).cloned().unwrap_or_default();
            if let Some(cu_id) = dispatch.find_ready(&self.collector_units, &pool, pipeline_reg) {
                self.collector_units[cu_id].dispatch(pipeline_reg);
            }
        }
    }

    /// Move the oldest ready instruction of a port's input registers into a
    /// free collector unit of an allowed pool.
    fn allocate_cu(&mut self, port_idx: usize, pipeline_reg: &mut [RegisterSet]) {
        let port = self.in_ports[port_idx].clone();
        for (stage_idx, in_stage) in port.in_stages.iter().enumerate() {
            if !pipeline_reg[*in_stage as usize].has_ready() {
                continue;
            }
            let output_register = port.out_stages[stage_idx];
            let free_cu = port.collector_kinds.iter().find_map(|kind| {
                self.pools
                    .get(kind)?
                    .iter()
                    .copied()
                    .find(|cu_id| self.collector_units[*cu_id].is_free())
            });
            if let Some(cu_id) = free_cu {
                let input = &mut pipeline_reg[*in_stage as usize];
                if self.collector_units[cu_id].allocate(input, output_register) {
                    let cu = &self.collector_units[cu_id];
                    self.arbiter.add_read_requests(cu);
                }
            }
            break;
        }
    }

    /// Write a completed instruction's destination registers back.
    ///
    /// Returns false when a required bank is busy this cycle; the caller
    /// retries next cycle.
    pub fn writeback(&mut self, instr: &WarpInstruction) -> bool {
        for (op, reg_num) in instr.outputs().copied().enumerate() {
            let scheduler_id = instr.scheduler_id.unwrap_or(0);
            let bank = compute_register_bank(
                reg_num,
                instr.warp_id,
                self.num_banks,
                self.bank_warp_shift,
                self.sub_core_model,
                self.num_banks_per_scheduler,
                scheduler_id,
            );
            if self.arbiter.bank_idle(bank) {
                self.arbiter.allocate_bank_for_write(
                    bank,
                    DestinationOperand {
                        warp_id: instr.warp_id,
                        register: reg_num,
                        bank,
                    },
                );
            } else {
                log::trace!(
                    "writeback of {instr} operand {op} stalled: bank {bank} busy"
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{Kind, RegisterFileUnit};
    use crate::core::PipelineStage;
    use crate::register_set::RegisterSet;
    use std::sync::Arc;

    fn pipeline() -> Vec<RegisterSet> {
        use strum::IntoEnumIterator;
        PipelineStage::iter()
            .map(|stage| RegisterSet::new(stage, 2))
            .collect()
    }

    #[test]
    fn idle_collector_makes_no_progress() {
        let config = Arc::new(crate::config::GPU::default());
        let mut unit = RegisterFileUnit::new(config);
        unit.add_cu_set(Kind::GEN_CUS, 4, 1);
        unit.add_port(
            vec![PipelineStage::ID_OC_SP],
            vec![PipelineStage::OC_EX_SP],
            vec![Kind::GEN_CUS],
        );
        unit.init(16);

        let mut pipeline = pipeline();
        for _ in 0..4 {
            unit.step(&mut pipeline);
        }
        assert!(unit.collector_units.iter().all(super::CollectorUnit::is_free));
    }
}
