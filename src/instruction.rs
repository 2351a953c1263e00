use super::{address, config, mem_fetch, opcodes, warp};
use bitvec::{array::BitArray, field::BitField, BitArr};
use mem_fetch::access::{Builder as MemAccessBuilder, Kind as AccessKind, MemAccess};
use std::collections::{HashMap, VecDeque};
use trace_model::ToBitString;

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemorySpace {
    Local,
    Shared,
    Constant,
    Texture,
    Global,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheOperator {
    /// Cache at all levels (`.ca`).
    All,
    /// Cache at L2 only, bypassing L1 (`.cg`).
    Global,
    /// Force L1 (`.nc`).
    L1,
    /// Streaming (`.cs`).
    Streaming,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct BarrierInfo {
    pub id: usize,
}

pub const MAX_ACCESSES_PER_THREAD: usize = 8;

/// Per-lane effective addresses.
///
/// Up to 8 requests per lane to support 32B accesses split into 4B chunks.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct PerThreadInfo {
    pub mem_req_addr: [address; MAX_ACCESSES_PER_THREAD],
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("line {line}: undefined opcode {opcode:?}")]
    UndefinedOpcode { opcode: String, line: usize },
}

#[derive(Debug, Default)]
struct TransactionInfo {
    chunk_mask: mem_fetch::SectorMask,
    byte_mask: mem_fetch::ByteMask,
    active_mask: warp::ActiveMask,
}

fn line_size_based_tag_func(addr: address, line_size: u64) -> u64 {
    addr & !(line_size - 1)
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.chars().all(char::is_numeric)
}

/// Derive the per-lane data width in bytes from opcode suffixes like
/// `LDG.E.64` or `.U16`; defaults to 4 bytes.
fn data_width_from_opcode(opcode: &str) -> u32 {
    for token in opcode.split('.').map(str::trim) {
        if is_number(token) {
            return token.parse::<u32>().unwrap_or(32) / 8;
        }
        if let Some(rest) = token.strip_prefix('U') {
            if is_number(rest) {
                return rest.parse::<u32>().unwrap_or(32) / 8;
            }
        }
    }
    4
}

/// A decoded instruction of one warp.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct WarpInstruction {
    /// Globally unique id, assigned when the instruction is issued.
    pub uid: u64,
    pub warp_id: usize,
    /// The scheduler unit that issued this instruction.
    pub scheduler_id: Option<usize>,
    pub pc: usize,
    /// Position in the warp's trace stream.
    pub trace_idx: usize,
    pub opcode: opcodes::Opcode,
    pub active_mask: warp::ActiveMask,
    pub cache_operator: Option<CacheOperator>,
    pub memory_space: Option<MemorySpace>,
    pub barrier: Option<BarrierInfo>,
    pub is_atomic: bool,
    pub threads: Vec<PerThreadInfo>,
    pub mem_access_queue: VecDeque<MemAccess>,
    /// Operation latency in cycles.
    pub latency: usize,
    pub initiation_interval: usize,
    pub dispatch_delay_cycles: usize,
    pub issue_cycle: Option<u64>,
    /// Size of the word being operated on.
    pub data_size: u32,

    outputs: [Option<u32>; 8],
    inputs: [Option<u32>; 24],
}

impl std::fmt::Debug for WarpInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WarpInstruction")
            .field("opcode", &self.opcode)
            .field("warp_id", &self.warp_id)
            .field("pc", &self.pc)
            .field("active_mask", &self.active_mask.to_bit_string())
            .field("memory_space", &self.memory_space)
            .finish()
    }
}

impl std::fmt::Display for WarpInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}[pc={},warp={}]", self.opcode, self.pc, self.warp_id)
    }
}

impl WarpInstruction {
    pub fn from_trace(
        launch: &trace_model::KernelLaunch,
        trace: &trace_model::TraceInstruction,
        config: &config::GPU,
    ) -> Result<Self, Error> {
        use opcodes::Op;

        let mut opcode = opcodes::get(&trace.opcode).ok_or_else(|| Error::UndefinedOpcode {
            opcode: trace.opcode.clone(),
            line: trace.line,
        })?;

        let mut active_mask: warp::ActiveMask = BitArray::ZERO;
        active_mask.store(trace.active_mask);

        let mut threads: Vec<_> = (0..config.warp_size)
            .map(|_| PerThreadInfo::default())
            .collect();

        let mut outputs: [Option<u32>; 8] = [None; 8];
        for (slot, reg) in outputs.iter_mut().zip(trace.dest_regs.iter()) {
            // register numbering starts from R1; R0 of the trace maps to 1
            *slot = Some(reg + 1);
        }
        let mut inputs: [Option<u32>; 24] = [None; 24];
        for (slot, reg) in inputs.iter_mut().zip(trace.src_regs.iter()) {
            *slot = Some(reg + 1);
        }

        let (latency, initiation_interval) = config.latency_of(opcode.category);

        let mut data_size = 0;
        if trace.mem_width > 0 {
            // traced widths can be wrong, so prefer the opcode suffix
            data_size = data_width_from_opcode(&trace.opcode);
            for (lane, thread) in threads.iter_mut().enumerate() {
                thread.mem_req_addr[0] = trace.addrs[lane];
            }
        }

        let mut is_atomic = false;
        let mut cache_operator = None;
        let mut memory_space = None;
        let mut barrier = None;

        match opcode.op {
            Op::LDC => {
                data_size = 4;
                memory_space = Some(MemorySpace::Constant);
                cache_operator = Some(CacheOperator::All);
                // constant loads execute on the memory pipeline even though
                // the opcode table classifies them as ALU
                opcode.category = opcodes::ArchOp::LOAD_OP;
            }
            Op::LDG | Op::LDL | Op::STG | Op::STL => {
                assert!(data_size > 0);
                cache_operator = Some(CacheOperator::All);
                memory_space = if matches!(opcode.op, Op::LDL | Op::STL) {
                    Some(MemorySpace::Local)
                } else {
                    Some(MemorySpace::Global)
                };
            }
            Op::ATOM | Op::RED | Op::ATOMG => {
                assert!(data_size > 0);
                memory_space = Some(MemorySpace::Global);
                is_atomic = true;
                // atomics are resolved at the L2
                cache_operator = Some(CacheOperator::Global);
            }
            Op::LDS | Op::STS => {
                assert!(data_size > 0);
                memory_space = Some(MemorySpace::Shared);
            }
            Op::ATOMS => {
                assert!(data_size > 0);
                memory_space = Some(MemorySpace::Shared);
                is_atomic = true;
            }
            Op::TEX | Op::TLD => {
                assert!(data_size > 0);
                memory_space = Some(MemorySpace::Texture);
                cache_operator = Some(CacheOperator::All);
            }
            Op::LD | Op::ST => {
                assert!(data_size > 0);
                // generic access: resolve the space from the first active address
                let shared_base = launch.shared_mem_base_addr;
                let local_base = launch.local_mem_base_addr;
                if shared_base == 0 || local_base == 0 {
                    memory_space = Some(MemorySpace::Shared);
                } else if let Some(lane) = active_mask.first_one() {
                    let addr = trace.addrs[lane];
                    if (shared_base..local_base).contains(&addr) {
                        memory_space = Some(MemorySpace::Shared);
                    } else if (local_base..local_base + LOCAL_MEM_SIZE_MAX).contains(&addr) {
                        memory_space = Some(MemorySpace::Local);
                        cache_operator = Some(CacheOperator::All);
                    } else {
                        memory_space = Some(MemorySpace::Global);
                        cache_operator = Some(CacheOperator::All);
                    }
                }
            }
            Op::BAR => {
                barrier = Some(BarrierInfo { id: 0 });
            }
            _ => {}
        }

        Ok(Self {
            uid: 0,
            warp_id: trace.warp_id as usize,
            scheduler_id: None,
            pc: trace.pc as usize,
            trace_idx: trace.instr_idx as usize,
            opcode,
            active_mask,
            cache_operator,
            memory_space,
            barrier,
            is_atomic,
            threads,
            mem_access_queue: VecDeque::new(),
            latency,
            initiation_interval,
            dispatch_delay_cycles: initiation_interval,
            issue_cycle: None,
            data_size,
            outputs,
            inputs,
        })
    }

    pub fn inputs(&self) -> impl Iterator<Item = &u32> {
        self.inputs.iter().filter_map(Option::as_ref)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &u32> {
        self.outputs.iter().filter_map(Option::as_ref)
    }

    #[must_use]
    pub fn active_thread_count(&self) -> usize {
        self.active_mask.count_ones()
    }

    #[must_use]
    pub fn is_load(&self) -> bool {
        self.opcode.category == opcodes::ArchOp::LOAD_OP
            || (self.opcode.op == opcodes::Op::LDC && self.memory_space.is_some())
    }

    #[must_use]
    pub fn is_store(&self) -> bool {
        self.opcode.category == opcodes::ArchOp::STORE_OP
    }

    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.is_atomic
    }

    #[must_use]
    pub fn is_branch(&self) -> bool {
        self.opcode.category == opcodes::ArchOp::BRANCH_OP
    }

    #[must_use]
    pub fn is_memory_instruction(&self) -> bool {
        self.memory_space.is_some()
    }

    pub fn set_addresses(&mut self, lane: usize, addresses: Vec<address>) {
        let thread = &mut self.threads[lane];
        for (slot, addr) in thread.mem_req_addr.iter_mut().zip(addresses) {
            *slot = addr;
        }
    }

    #[must_use]
    pub fn access_kind(&self) -> Option<AccessKind> {
        let is_write = self.is_store();
        match self.memory_space {
            Some(MemorySpace::Constant) => Some(AccessKind::CONST_ACC_R),
            Some(MemorySpace::Texture) => Some(AccessKind::TEXTURE_ACC_R),
            Some(MemorySpace::Global) if is_write => Some(AccessKind::GLOBAL_ACC_W),
            Some(MemorySpace::Global) => Some(AccessKind::GLOBAL_ACC_R),
            Some(MemorySpace::Local) if is_write => Some(AccessKind::LOCAL_ACC_W),
            Some(MemorySpace::Local) => Some(AccessKind::LOCAL_ACC_R),
            _ => None,
        }
    }

    /// Generate the memory accesses of this instruction.
    ///
    /// Global and local accesses are coalesced at sector/line granularity;
    /// shared memory produces no traffic but models bank conflicts as a
    /// longer initiation interval; constant and texture accesses coalesce at
    /// their cache's line size.
    pub fn generate_mem_accesses(&mut self, config: &config::GPU) -> Option<Vec<MemAccess>> {
        if !(self.is_load() || self.is_store()) {
            return None;
        }
        if self.active_thread_count() == 0 {
            // predicated off
            return None;
        }
        let is_write = self.is_store();

        match self.memory_space {
            Some(MemorySpace::Shared) => {
                let total_accesses = self.shared_mem_bank_accesses(config);
                debug_assert!(total_accesses >= 1);
                debug_assert!(total_accesses <= config.warp_size);
                // bank conflicts are modeled as a larger initiation interval
                self.dispatch_delay_cycles = total_accesses;
                None
            }
            Some(MemorySpace::Constant) => {
                let line_size = config.const_cache_l1.line_size;
                Some(self.coalesce_by_line(AccessKind::CONST_ACC_R, line_size))
            }
            Some(MemorySpace::Texture) => {
                let line_size = config.tex_cache_l1.line_size;
                Some(self.coalesce_by_line(AccessKind::TEXTURE_ACC_R, line_size))
            }
            Some(MemorySpace::Global | MemorySpace::Local) => {
                let access_kind = self.access_kind().expect("access kind");
                Some(self.memory_coalescing_arch(is_write, access_kind, config))
            }
            None => panic!("generated mem accesses for instruction without memory space"),
        }
    }

    /// Number of shared-memory bank accesses: the maximum number of distinct
    /// words any single bank must serve.
    fn shared_mem_bank_accesses(&self, config: &config::GPU) -> usize {
        let warp_parts = config.shared_memory_warp_parts;
        let subwarp_size = config.warp_size / warp_parts;
        let mut total_accesses = 0;

        for subwarp in 0..warp_parts {
            // bank -> distinct word addresses
            let mut bank_accesses: HashMap<u64, std::collections::HashSet<address>> =
                HashMap::new();
            for i in 0..subwarp_size {
                let lane = subwarp * subwarp_size + i;
                if !self.active_mask[lane] {
                    continue;
                }
                let addr = self.threads[lane].mem_req_addr[0];
                let bank = config.shared_mem_bank(addr);
                let word = line_size_based_tag_func(addr, config::WORD_SIZE);
                bank_accesses.entry(bank).or_default().insert(word);
            }
            let max_bank_accesses = bank_accesses
                .values()
                .map(std::collections::HashSet::len)
                .max()
                .unwrap_or(0);
            total_accesses += max_bank_accesses;
        }
        total_accesses
    }

    /// Coalesce lane addresses at plain line granularity (constant/texture).
    fn coalesce_by_line(&self, kind: AccessKind, line_size: u32) -> Vec<MemAccess> {
        let mut transactions: Vec<(address, warp::ActiveMask)> = Vec::new();
        for (lane, thread) in self.threads.iter().enumerate() {
            if !self.active_mask[lane] {
                continue;
            }
            let line_addr = line_size_based_tag_func(thread.mem_req_addr[0], u64::from(line_size));
            match transactions.iter_mut().find(|(addr, _)| *addr == line_addr) {
                Some((_, mask)) => mask.set(lane, true),
                None => {
                    let mut mask = warp::ActiveMask::ZERO;
                    mask.set(lane, true);
                    transactions.push((line_addr, mask));
                }
            }
        }
        transactions.sort_by_key(|(addr, _)| *addr);
        transactions
            .into_iter()
            .map(|(addr, active_mask)| {
                MemAccessBuilder {
                    kind,
                    addr,
                    req_size_bytes: line_size,
                    is_write: false,
                    warp_active_mask: active_mask,
                    byte_mask: mem_fetch::ByteMask::ZERO,
                    sector_mask: !mem_fetch::SectorMask::ZERO,
                }
                .build()
            })
            .collect()
    }

    /// Coalesce global/local lane addresses into the minimum set of
    /// segment-granularity transactions, then shrink each transaction.
    ///
    /// The produced accesses are ordered by block address, so the access of
    /// the lowest active lane of each group comes first.
    fn memory_coalescing_arch(
        &self,
        is_write: bool,
        access_kind: AccessKind,
        config: &config::GPU,
    ) -> Vec<MemAccess> {
        let warp_parts = config.shared_memory_warp_parts;
        let subwarp_size = config.warp_size / warp_parts;

        // sector caches coalesce at 32B segments, line caches at 128B;
        // accesses that bypass the L1 meet the sectored L2 directly
        let sector_segments = config.data_cache_l1.kind == config::CacheKind::Sector
            || self.cache_operator == Some(CacheOperator::Global)
            || config.global_mem_skip_l1_data_cache;
        let segment_size: u64 = match self.data_size {
            1 => 32,
            2 => {
                if sector_segments {
                    32
                } else {
                    64
                }
            }
            4 | 8 | 16 => {
                if sector_segments {
                    32
                } else {
                    128
                }
            }
            size => panic!("invalid data size {size}"),
        };

        let mut accesses: Vec<MemAccess> = Vec::new();
        for subwarp in 0..warp_parts {
            let mut subwarp_transactions: HashMap<address, TransactionInfo> = HashMap::new();

            // step 1: find all transactions generated by this subwarp
            for i in 0..subwarp_size {
                let lane = subwarp * subwarp_size + i;
                if !self.active_mask[lane] {
                    continue;
                }
                let thread = &self.threads[lane];

                let mut data_size_coales = self.data_size;
                let mut num_accesses = 1;
                if self.memory_space == Some(MemorySpace::Local) {
                    // local accesses above 4B were split into 4B chunks
                    if self.data_size >= 4 {
                        data_size_coales = 4;
                        num_accesses = self.data_size / 4;
                    }
                }
                debug_assert!(num_accesses as usize <= MAX_ACCESSES_PER_THREAD);

                let mut access = 0;
                while access < MAX_ACCESSES_PER_THREAD && thread.mem_req_addr[access] != 0 {
                    let addr = thread.mem_req_addr[access];
                    let block_addr = line_size_based_tag_func(addr, segment_size);
                    // which 32B chunk within a 128B line does this lane touch
                    let chunk = (addr & 127) / 32;
                    let tx = subwarp_transactions.entry(block_addr).or_default();

                    tx.chunk_mask.set(chunk as usize, true);
                    tx.active_mask.set(lane, true);
                    let idx = (addr & 127) as usize;
                    for i in 0..data_size_coales as usize {
                        if idx + i < crate::mem_sub_partition::MAX_MEMORY_ACCESS_SIZE as usize {
                            tx.byte_mask.set(idx + i, true);
                        }
                    }

                    // a lane can straddle two segments
                    let end_addr = addr + u64::from(data_size_coales) - 1;
                    if block_addr != line_size_based_tag_func(end_addr, segment_size) {
                        let spill_block = line_size_based_tag_func(end_addr, segment_size);
                        let chunk = (end_addr & 127) / 32;
                        let tx = subwarp_transactions.entry(spill_block).or_default();
                        tx.chunk_mask.set(chunk as usize, true);
                        tx.active_mask.set(lane, true);
                        let idx = (end_addr & 127) as usize;
                        tx.byte_mask.set(idx, true);
                    }

                    access += 1;
                }
            }

            // deterministic ordering: smallest addresses first
            let mut subwarp_accesses: Vec<_> = subwarp_transactions.into_iter().collect();
            subwarp_accesses.sort_by_key(|(block_addr, _)| *block_addr);

            // step 2: reduce each transaction size where possible
            accesses.extend(subwarp_accesses.into_iter().map(|(block_addr, tx)| {
                memory_coalescing_arch_reduce(is_write, access_kind, &tx, block_addr, segment_size)
            }));
        }
        accesses
    }
}

/// Shrink a 128B transaction to 64B or 32B when only part of it is used.
fn memory_coalescing_arch_reduce(
    is_write: bool,
    access_kind: AccessKind,
    tx: &TransactionInfo,
    mut addr: address,
    segment_size: u64,
) -> MemAccess {
    debug_assert_eq!(addr & (segment_size - 1), 0);
    debug_assert!(tx.chunk_mask.count_ones() >= 1);
    // halves of the segment, to check whether a 64B segment can be
    // compressed into a single 32B segment
    let mut halves: BitArr!(for 2, in u8) = BitArray::ZERO;

    let mut req_size_bytes = segment_size as u32;
    if segment_size == 128 {
        let lower_half_used = tx.chunk_mask[0] || tx.chunk_mask[1];
        let upper_half_used = tx.chunk_mask[2] || tx.chunk_mask[3];
        if lower_half_used && !upper_half_used {
            req_size_bytes = 64;
            halves |= &tx.chunk_mask[0..2];
        } else if !lower_half_used && upper_half_used {
            addr += 64;
            req_size_bytes = 64;
            halves |= &tx.chunk_mask[2..4];
        } else {
            assert!(lower_half_used && upper_half_used);
        }
    } else if segment_size == 64 {
        if addr % 128 == 0 {
            halves |= &tx.chunk_mask[0..2];
        } else {
            debug_assert_eq!(addr % 128, 64);
            halves |= &tx.chunk_mask[2..4];
        }
    }

    if req_size_bytes == 64 {
        let lower_half_used = halves[0];
        let upper_half_used = halves[1];
        if lower_half_used && !upper_half_used {
            req_size_bytes = 32;
        } else if !lower_half_used && upper_half_used {
            addr += 32;
            req_size_bytes = 32;
        } else {
            assert!(lower_half_used && upper_half_used);
        }
    }

    MemAccessBuilder {
        kind: access_kind,
        addr,
        req_size_bytes,
        is_write,
        warp_active_mask: tx.active_mask,
        byte_mask: tx.byte_mask,
        sector_mask: tx.chunk_mask,
    }
    .build()
}

// Volta max local memory is 16kB per thread
pub const LOCAL_MEM_SIZE_MAX: u64 = 1 << 14;

/// Start of the program (instruction) memory space, distinct from data spaces.
pub const PROGRAM_MEM_START: address = 0xF000_0000;

#[cfg(test)]
mod tests {
    use super::WarpInstruction;
    use crate::config;
    use color_eyre::eyre;
    use trace_model::{Dim, KernelLaunch, TraceInstruction};

    fn launch() -> KernelLaunch {
        KernelLaunch {
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
        }
    }

    fn load(addrs: [u64; 32]) -> TraceInstruction {
        TraceInstruction {
            pc: 0,
            active_mask: u32::MAX,
            dest_regs: vec![1],
            opcode: "LDG.E".to_string(),
            src_regs: vec![2],
            mem_width: 4,
            addrs,
            block_id: Dim::new(0, 0, 0),
            warp_id: 0,
            instr_idx: 0,
            line: 1,
        }
    }

    #[test]
    fn coalesces_unit_stride_to_sectors() -> eyre::Result<()> {
        let config = config::GPU::default();
        let mut addrs = [0u64; 32];
        for (lane, addr) in addrs.iter_mut().enumerate() {
            *addr = 0x8000_0000 + 4 * lane as u64;
        }
        let mut instr = WarpInstruction::from_trace(&launch(), &load(addrs), &config)?;
        let accesses = instr.generate_mem_accesses(&config).unwrap();
        // 128 contiguous bytes at sector granularity: four 32B transactions
        assert_eq!(accesses.len(), 4);
        assert!(accesses.iter().all(|access| access.req_size_bytes == 32));
        assert_eq!(accesses[0].addr, 0x8000_0000);
        assert_eq!(accesses[3].addr, 0x8000_0060);
        Ok(())
    }

    #[test]
    fn strided_access_is_uncoalesced() -> eyre::Result<()> {
        let config = config::GPU::default();
        let mut addrs = [0u64; 32];
        for (lane, addr) in addrs.iter_mut().enumerate() {
            *addr = 0x8000_0000 + 128 * lane as u64;
        }
        let mut instr = WarpInstruction::from_trace(&launch(), &load(addrs), &config)?;
        let accesses = instr.generate_mem_accesses(&config).unwrap();
        assert_eq!(accesses.len(), 32);
        Ok(())
    }

    #[test]
    fn accesses_are_ordered_by_lowest_lane() -> eyre::Result<()> {
        let config = config::GPU::default();
        let mut addrs = [0u64; 32];
        for (lane, addr) in addrs.iter_mut().enumerate() {
            *addr = 0x8000_0000 + 32 * lane as u64;
        }
        let mut instr = WarpInstruction::from_trace(&launch(), &load(addrs), &config)?;
        let accesses = instr.generate_mem_accesses(&config).unwrap();
        let addrs: Vec<_> = accesses.iter().map(|access| access.addr).collect();
        let mut sorted = addrs.clone();
        sorted.sort_unstable();
        assert_eq!(addrs, sorted);
        assert_eq!(accesses[0].warp_active_mask.first_one(), Some(0));
        Ok(())
    }
}
