use super::{address, mem_fetch};
use std::collections::{HashMap, VecDeque};

/// A miss status holding entry: the fetches waiting on one block address.
#[derive(Debug, Default)]
pub struct Entry {
    requests: VecDeque<mem_fetch::MemFetch>,
    has_atomic: bool,
}

impl Entry {
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Miss status holding register table.
///
/// At most one outstanding request per block address; further accesses to the
/// same block merge into the existing entry, bounded by `max_merged`. Once a
/// fill arrives, all merged fetches return together in insertion order.
#[derive(Debug)]
pub struct Table {
    num_entries: usize,
    max_merged: usize,
    entries: HashMap<address, Entry>,
    /// Block addresses whose fill has arrived, in fill order.
    ///
    /// Draining the merged requests may take several cycles.
    current_response: VecDeque<address>,
}

impl Table {
    #[must_use]
    pub fn new(num_entries: usize, max_merged: usize) -> Self {
        Self {
            num_entries,
            max_merged,
            entries: HashMap::with_capacity(num_entries),
            current_response: VecDeque::new(),
        }
    }

    /// Is there an outstanding request for this block address?
    #[must_use]
    pub fn probe(&self, block_addr: address) -> bool {
        self.entries.contains_key(&block_addr)
    }

    /// No more space for tracking a new access to this block address?
    #[must_use]
    pub fn full(&self, block_addr: address) -> bool {
        match self.entries.get(&block_addr) {
            Some(entry) => entry.requests.len() >= self.max_merged,
            None => self.entries.len() >= self.num_entries,
        }
    }

    pub fn add(&mut self, block_addr: address, fetch: mem_fetch::MemFetch) {
        let is_atomic = fetch.is_atomic();
        let entry = self.entries.entry(block_addr).or_default();
        assert!(entry.requests.len() < self.max_merged);
        entry.has_atomic |= is_atomic;
        entry.requests.push_back(fetch);
        assert!(self.entries.len() <= self.num_entries);
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_response.clear();
    }

    /// Accept a fill response: mark the entry ready for draining.
    ///
    /// Returns whether the entry contains an atomic operation, or `None` if
    /// no entry exists for the block address.
    pub fn mark_ready(&mut self, block_addr: address) -> Option<bool> {
        let has_atomic = self.entries.get(&block_addr).map(|entry| {
            self.current_response.push_back(block_addr);
            entry.has_atomic
        });
        log::trace!("mshr::mark_ready(block_addr={block_addr}, has_atomic={has_atomic:?})");
        debug_assert!(self.current_response.len() <= self.entries.len());
        has_atomic
    }

    #[must_use]
    pub fn has_ready_accesses(&self) -> bool {
        !self.current_response.is_empty()
    }

    #[must_use]
    pub fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>> {
        let block_addr = self.current_response.front()?;
        let entry = self.entries.get(block_addr)?;
        Some(&entry.requests)
    }

    /// Pop the next merged fetch whose fill has arrived.
    pub fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        let block_addr = *self.current_response.front()?;
        let entry = self.entries.get_mut(&block_addr)?;
        debug_assert!(!entry.requests.is_empty());
        let fetch = entry.requests.pop_front();

        if entry.requests.is_empty() {
            self.entries.remove(&block_addr);
            self.current_response.pop_front();
        }
        fetch
    }
}

#[cfg(test)]
mod tests {
    use crate::mem_fetch;
    use crate::warp::ActiveMask;
    use color_eyre::eyre;

    fn fetch(uid: u64, addr: crate::address) -> mem_fetch::MemFetch {
        let access = mem_fetch::access::Builder {
            kind: mem_fetch::access::Kind::GLOBAL_ACC_R,
            addr,
            req_size_bytes: 32,
            is_write: false,
            warp_active_mask: ActiveMask::ZERO,
            byte_mask: mem_fetch::ByteMask::ZERO,
            sector_mask: mem_fetch::SectorMask::ZERO,
        }
        .build();
        mem_fetch::Builder {
            uid,
            access,
            instr: None,
            warp_id: 0,
            core_id: Some(0),
            cluster_id: Some(0),
            physical_addr: crate::mcu::PhysicalAddress::default(),
            partition_addr: addr,
        }
        .build()
    }

    #[test]
    fn merges_same_block_and_returns_in_order() -> eyre::Result<()> {
        let mut mshrs = super::Table::new(4, 4);
        let block_addr = 0x80;

        assert!(!mshrs.probe(block_addr));
        mshrs.add(block_addr, fetch(1, block_addr));
        mshrs.add(block_addr, fetch(2, block_addr + 4));
        assert!(mshrs.probe(block_addr));
        assert_eq!(mshrs.num_entries(), 1);

        assert!(!mshrs.has_ready_accesses());
        assert_eq!(mshrs.mark_ready(block_addr), Some(false));

        let first = mshrs.next_access().unwrap();
        let second = mshrs.next_access().unwrap();
        assert_eq!((first.uid, second.uid), (1, 2));
        assert_eq!(mshrs.next_access(), None);
        assert!(!mshrs.probe(block_addr));
        Ok(())
    }

    #[test]
    fn respects_merge_and_entry_limits() {
        let mut mshrs = super::Table::new(1, 2);
        let block_addr = 0x80;
        mshrs.add(block_addr, fetch(1, block_addr));
        assert!(!mshrs.full(block_addr));
        mshrs.add(block_addr, fetch(2, block_addr));
        // merge limit reached for the tracked block
        assert!(mshrs.full(block_addr));
        // entry limit reached for any other block
        assert!(mshrs.full(0x100));
    }
}
