use serde::Serialize;

/// DRAM activity counters, per channel and bank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Dram {
    /// Read commands issued, indexed by `[chip][bank]`.
    pub bank_reads: Vec<Vec<u64>>,
    /// Write commands issued, indexed by `[chip][bank]`.
    pub bank_writes: Vec<Vec<u64>>,
    pub total_reads: u64,
    pub total_writes: u64,
    pub row_hits: u64,
    pub row_misses: u64,
    pub num_activates: u64,
    pub num_precharges: u64,
}

impl Dram {
    #[must_use]
    pub fn new(num_chips: usize, num_banks: usize) -> Self {
        Self {
            bank_reads: vec![vec![0; num_banks]; num_chips],
            bank_writes: vec![vec![0; num_banks]; num_chips],
            ..Self::default()
        }
    }

    pub fn inc_read(&mut self, chip: usize, bank: usize) {
        self.total_reads += 1;
        self.bank_reads[chip][bank] += 1;
    }

    pub fn inc_write(&mut self, chip: usize, bank: usize) {
        self.total_writes += 1;
        self.bank_writes[chip][bank] += 1;
    }
}
