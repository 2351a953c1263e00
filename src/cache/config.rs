use crate::{address, mem_sub_partition};
use serde::{Deserialize, Serialize};

/// Cache organization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    /// Whole lines are transferred at once.
    Normal, // N
    /// Lines are split into 32B sectors with per-sector state.
    Sector, // S
}

/// Cache write-allocate policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum WriteAllocatePolicy {
    NO_WRITE_ALLOCATE,  // N
    WRITE_ALLOCATE,     // W
    FETCH_ON_WRITE,     // F
    LAZY_FETCH_ON_READ, // L
}

impl WriteAllocatePolicy {
    #[must_use]
    pub fn is_fetch_on_write(self) -> bool {
        self == Self::FETCH_ON_WRITE
    }

    #[must_use]
    pub fn is_lazy_fetch_on_read(self) -> bool {
        self == Self::LAZY_FETCH_ON_READ
    }
}

/// Cache write policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum WritePolicy {
    READ_ONLY,     // R
    WRITE_BACK,    // B
    WRITE_THROUGH, // T
    WRITE_EVICT,   // E
}

impl WritePolicy {
    #[must_use]
    pub fn is_write_through(self) -> bool {
        self == Self::WRITE_THROUGH
    }
}

/// Cache line allocation policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AllocatePolicy {
    ON_MISS, // M
    ON_FILL, // F
}

/// Cache replacement policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplacementPolicy {
    LRU,  // L
    FIFO, // F
}

/// Resolved configuration of a single cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub kind: Kind,
    pub num_sets: usize,
    pub line_size: u32,
    pub associativity: usize,

    pub replacement_policy: ReplacementPolicy,
    pub write_policy: WritePolicy,
    pub allocate_policy: AllocatePolicy,
    pub write_allocate_policy: WriteAllocatePolicy,

    pub mshr_entries: usize,
    pub mshr_max_merge: usize,
    pub miss_queue_size: usize,

    /// Only evict clean lines until this percentage of lines is dirty.
    pub l1_cache_write_ratio_percent: usize,
    pub data_port_width: Option<usize>,
}

impl Config {
    /// The transfer granularity: a sector for sector caches, otherwise a line.
    #[must_use]
    pub fn atom_size(&self) -> u32 {
        if self.kind == Kind::Sector {
            mem_sub_partition::SECTOR_SIZE
        } else {
            self.line_size
        }
    }

    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.num_sets * self.associativity
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_lines() * self.line_size as usize
    }

    #[must_use]
    pub fn line_size_log2(&self) -> u32 {
        self.line_size.ilog2()
    }

    #[must_use]
    pub fn data_port_width(&self) -> usize {
        let width = self.data_port_width.unwrap_or(self.line_size as usize);
        debug_assert!(self.line_size as usize % width == 0);
        width
    }

    /// The tag includes the set index bits, so set functions that alias
    /// different indexes onto one set still compare correctly.
    #[must_use]
    pub fn tag(&self, addr: address) -> address {
        addr & !u64::from(self.line_size - 1)
    }

    #[must_use]
    pub fn block_addr(&self, addr: address) -> address {
        addr & !u64::from(self.line_size - 1)
    }

    /// Linear set index.
    #[must_use]
    pub fn set_index(&self, addr: address) -> u64 {
        (addr >> self.line_size_log2()) & (self.num_sets as u64 - 1)
    }

    /// Miss status holding registers operate at block granularity.
    #[must_use]
    pub fn mshr_addr(&self, addr: address) -> address {
        addr & !u64::from(self.line_size - 1)
    }

    /// The sector mask a request occupies in this cache.
    #[must_use]
    pub fn access_sector_mask(
        &self,
        mask: &crate::mem_fetch::SectorMask,
        addr: address,
    ) -> crate::mem_fetch::SectorMask {
        use crate::mem_fetch::SectorMask;
        match self.kind {
            Kind::Normal => !SectorMask::ZERO,
            Kind::Sector if mask.not_any() => {
                let mut mask = SectorMask::ZERO;
                let sector =
                    (addr % u64::from(self.line_size)) / u64::from(mem_sub_partition::SECTOR_SIZE);
                mask.set(sector as usize, true);
                mask
            }
            Kind::Sector => *mask,
        }
    }

    /// Reject configurations the model cannot honor.
    pub fn validate(&self) -> Result<(), String> {
        if !utils::is_power_of_two(self.num_sets) {
            return Err(format!("number of sets ({}) must be a power of two", self.num_sets));
        }
        if !utils::is_power_of_two(self.line_size as usize) {
            return Err(format!("line size ({}) must be a power of two", self.line_size));
        }
        // A write-back cache allocating on fill deadlocks: an incoming fill
        // evicting a dirty line generates a writeback, which can stall the
        // fill when the network is congested.
        if self.allocate_policy == AllocatePolicy::ON_FILL
            && self.write_policy == WritePolicy::WRITE_BACK
        {
            return Err("write-back caches cannot allocate on fill".to_string());
        }
        if matches!(
            self.write_allocate_policy,
            WriteAllocatePolicy::FETCH_ON_WRITE | WriteAllocatePolicy::LAZY_FETCH_ON_READ
        ) && self.allocate_policy == AllocatePolicy::ON_FILL
        {
            return Err(
                "fetch-on-write and lazy-fetch-on-read require allocate-on-miss".to_string(),
            );
        }
        if self.kind == Kind::Sector
            && self.line_size / mem_sub_partition::SECTOR_SIZE
                != mem_sub_partition::NUM_SECTORS as u32
        {
            return Err(format!(
                "sector cache line size ({}) must be {} sectors of {} bytes",
                self.line_size,
                mem_sub_partition::NUM_SECTORS,
                mem_sub_partition::SECTOR_SIZE
            ));
        }
        Ok(())
    }
}

impl From<&crate::config::CacheConfig> for Config {
    fn from(config: &crate::config::CacheConfig) -> Self {
        Self {
            kind: config.kind,
            num_sets: config.num_sets,
            line_size: config.line_size,
            associativity: config.associativity,
            replacement_policy: config.replacement_policy,
            write_policy: config.write_policy,
            allocate_policy: config.allocate_policy,
            write_allocate_policy: config.write_allocate_policy,
            mshr_entries: config.mshr_entries,
            mshr_max_merge: config.mshr_max_merge,
            miss_queue_size: config.miss_queue_size,
            l1_cache_write_ratio_percent: config.l1_cache_write_ratio_percent,
            data_port_width: config.data_port_width,
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} bytes ({} sets, {}-way, {} byte lines)",
            self.total_bytes(),
            self.num_sets,
            self.associativity,
            self.line_size
        )
    }
}
