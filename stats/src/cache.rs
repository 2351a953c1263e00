use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// The kind of memory access, as seen by a cache.
#[allow(non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(
    Debug, strum::EnumIter, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
pub enum AccessKind {
    GLOBAL_ACC_R,
    LOCAL_ACC_R,
    CONST_ACC_R,
    TEXTURE_ACC_R,
    GLOBAL_ACC_W,
    LOCAL_ACC_W,
    L1_WRBK_ACC,
    L2_WRBK_ACC,
    INST_ACC_R,
    L1_WR_ALLOC_R,
    L2_WR_ALLOC_R,
}

#[allow(non_camel_case_types)]
#[derive(
    Debug, strum::EnumIter, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
pub enum RequestStatus {
    HIT,
    HIT_RESERVED,
    MISS,
    RESERVATION_FAIL,
    SECTOR_MISS,
    MSHR_HIT,
}

#[allow(non_camel_case_types)]
#[derive(
    Debug, strum::EnumIter, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
pub enum ReservationFailure {
    /// All lines in the set are reserved.
    LINE_ALLOC_FAIL,
    /// The miss queue (to interconnect or DRAM) is full.
    MISS_QUEUE_FULL,
    MSHR_ENTRY_FAIL,
    MSHR_MERGE_ENTRY_FAIL,
    MSHR_RW_PENDING,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessStat {
    Status(RequestStatus),
    ReservationFailure(ReservationFailure),
}

impl std::fmt::Display for AccessStat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AccessStat::Status(status) => write!(f, "{status:?}"),
            AccessStat::ReservationFailure(failure) => write!(f, "{failure:?}"),
        }
    }
}

/// Access counters of a single cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cache {
    pub accesses: BTreeMap<(AccessKind, AccessStat), u64>,
}

impl Serialize for Cache {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.accesses.len()))?;
        for ((kind, stat), count) in &self.accesses {
            map.serialize_entry(&format!("{kind:?}[{stat}]"), count)?;
        }
        map.end()
    }
}

impl Cache {
    pub fn inc(&mut self, kind: AccessKind, stat: AccessStat, count: u64) {
        *self.accesses.entry((kind, stat)).or_insert(0) += count;
    }

    #[must_use]
    pub fn count(&self, kind: AccessKind, stat: AccessStat) -> u64 {
        self.accesses.get(&(kind, stat)).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_with(&self, predicate: impl Fn(&AccessStat) -> bool) -> u64 {
        self.accesses
            .iter()
            .filter(|((_, stat), _)| predicate(stat))
            .map(|(_, count)| count)
            .sum()
    }

    #[must_use]
    pub fn num_hits(&self) -> u64 {
        self.total_with(|stat| matches!(stat, AccessStat::Status(RequestStatus::HIT)))
    }

    #[must_use]
    pub fn num_misses(&self) -> u64 {
        self.total_with(|stat| {
            matches!(
                stat,
                AccessStat::Status(RequestStatus::MISS | RequestStatus::SECTOR_MISS)
            )
        })
    }

    #[must_use]
    pub fn num_reservation_failures(&self) -> u64 {
        self.total_with(|stat| matches!(stat, AccessStat::ReservationFailure(_)))
    }

    pub fn merge(&mut self, other: &Cache) {
        for (key, count) in &other.accesses {
            *self.accesses.entry(*key).or_insert(0) += count;
        }
    }
}

/// Counters for a set of caches of the same level, one entry per unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PerCache(pub Vec<Cache>);

impl PerCache {
    #[must_use]
    pub fn new(num_units: usize) -> Self {
        Self(vec![Cache::default(); num_units])
    }

    #[must_use]
    pub fn reduce(&self) -> Cache {
        let mut total = Cache::default();
        for unit in &self.0 {
            total.merge(unit);
        }
        total
    }
}

impl std::ops::Index<usize> for PerCache {
    type Output = Cache;
    fn index(&self, unit: usize) -> &Cache {
        &self.0[unit]
    }
}

impl std::ops::IndexMut<usize> for PerCache {
    fn index_mut(&mut self, unit: usize) -> &mut Cache {
        &mut self.0[unit]
    }
}
