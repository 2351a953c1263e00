use super::{config, fifo::Fifo, mem_fetch};
use std::collections::VecDeque;

/// DRAM timing parameters, in command-clock cycles.
///
/// Parsed from strings of the form `nbk:tCCD:tRRD:tRCD:tRAS:tRP:tRC:CL:WL`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timing {
    pub num_banks: usize,
    /// Column-to-column delay (back to back data transfers).
    pub t_ccd: u64,
    /// Row-to-row activation delay across banks.
    pub t_rrd: u64,
    /// Row activate to column command.
    pub t_rcd: u64,
    /// Row activate to precharge.
    pub t_ras: u64,
    /// Precharge to activate.
    pub t_rp: u64,
    /// Activate to activate, same bank.
    pub t_rc: u64,
    /// Read column latency.
    pub cl: u64,
    /// Write column latency.
    pub wl: u64,
}

impl Timing {
    pub fn parse(value: &str) -> Result<Self, config::Error> {
        let fields: Vec<u64> = value
            .split(':')
            .map(|field| {
                field
                    .trim()
                    .parse()
                    .map_err(|_| config::Error::InvalidDramTiming {
                        value: value.to_string(),
                    })
            })
            .collect::<Result<_, _>>()?;
        let [num_banks, t_ccd, t_rrd, t_rcd, t_ras, t_rp, t_rc, cl, wl] = fields[..] else {
            return Err(config::Error::InvalidDramTiming {
                value: value.to_string(),
            });
        };
        Ok(Self {
            num_banks: num_banks as usize,
            t_ccd,
            t_rrd,
            t_rcd,
            t_ras,
            t_rp,
            t_rc,
            cl,
            wl,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BankState {
    Idle,
    Active { row: u64 },
}

/// Per-bank state machine with earliest-issue constraints.
#[derive(Debug, Clone)]
struct Bank {
    state: BankState,
    /// Earliest cycle an ACT may issue (tRP after precharge, tRC after the
    /// previous ACT).
    next_activate: u64,
    /// Earliest cycle a PRE may issue (tRAS after activate).
    next_precharge: u64,
    /// Earliest cycle a RD/WR may issue (tRCD after activate, tCCD between
    /// transfers).
    next_column: u64,
    last_activate: u64,
}

impl Default for Bank {
    fn default() -> Self {
        Self {
            state: BankState::Idle,
            next_activate: 0,
            next_precharge: 0,
            next_column: 0,
            last_activate: 0,
        }
    }
}

#[derive(Debug)]
struct Request {
    fetch: mem_fetch::MemFetch,
    row: u64,
    arrive_cycle: u64,
}

/// One DRAM channel: banks, an FR-FCFS scheduler and a return queue.
///
/// Requests are popped from per-bank queues preferring row hits over older
/// row misses; at most one command (ACT, PRE or column access) issues per
/// cycle. Completed requests appear in the return queue after the column
/// latency plus the burst time.
pub struct Dram {
    pub chip_id: usize,
    timing: Timing,
    banks: Vec<Bank>,
    queues: Vec<VecDeque<Request>>,
    num_pending: usize,
    sched_queue_size: usize,
    /// Transfers in flight: `(ready_cycle, fetch)` ordered by readiness.
    in_service: VecDeque<(u64, mem_fetch::MemFetch)>,
    pub return_queue: Fifo<mem_fetch::MemFetch>,
    /// Data-bus cycles of one burst.
    burst_cycles: u64,
    /// Cycle of the last activate on any bank, for tRRD.
    last_activate_any: u64,
    bank_priority: usize,
    pub stats: stats::Dram,
}

impl std::fmt::Debug for Dram {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dram")
            .field("chip_id", &self.chip_id)
            .field("num_pending", &self.num_pending)
            .field("in_service", &self.in_service.len())
            .finish()
    }
}

impl Dram {
    #[must_use]
    pub fn new(chip_id: usize, config: &config::GPU) -> Self {
        let timing = config.dram_timing.clone();
        let banks = vec![Bank::default(); timing.num_banks];
        let queues = (0..timing.num_banks).map(|_| VecDeque::new()).collect();
        let burst_cycles =
            (config.dram_burst_length / config.dram_data_command_freq_ratio).max(1) as u64;
        Self {
            chip_id,
            banks,
            queues,
            num_pending: 0,
            sched_queue_size: config.dram_frfcfs_sched_queue_size,
            in_service: VecDeque::new(),
            return_queue: Fifo::new(Some(config.dram_return_queue_size)),
            burst_cycles,
            last_activate_any: 0,
            bank_priority: 0,
            stats: stats::Dram::new(1, timing.num_banks),
            timing,
        }
    }

    /// Can another request be accepted?
    #[must_use]
    pub fn full(&self) -> bool {
        self.sched_queue_size > 0 && self.num_pending >= self.sched_queue_size
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.num_pending > 0 || !self.in_service.is_empty() || !self.return_queue.is_empty()
    }

    pub fn push(&mut self, fetch: mem_fetch::MemFetch, cycle: u64) {
        debug_assert!(!self.full());
        let bank = fetch.physical_addr.bank as usize % self.timing.num_banks;
        let row = fetch.physical_addr.row;
        self.queues[bank].push_back(Request {
            fetch,
            row,
            arrive_cycle: cycle,
        });
        self.num_pending += 1;
    }

    /// FR-FCFS pick for one bank: the oldest request hitting the open row,
    /// or the oldest request overall when no row hit exists.
    fn schedule(&self, bank_id: usize) -> Option<usize> {
        let queue = &self.queues[bank_id];
        if queue.is_empty() {
            return None;
        }
        if let BankState::Active { row } = self.banks[bank_id].state {
            if let Some(hit) = queue.iter().position(|request| request.row == row) {
                return Some(hit);
            }
        }
        Some(0)
    }

    /// Advance one command-clock cycle: retire finished transfers and issue
    /// at most one command.
    pub fn cycle(&mut self, cycle: u64) {
        // data transfers that completed move to the return queue
        while let Some((ready, _)) = self.in_service.front() {
            if *ready > cycle || self.return_queue.full() {
                break;
            }
            let (_, fetch) = self.in_service.pop_front().unwrap();
            self.return_queue.enqueue(fetch);
        }

        // one command per cycle, banks arbitrated round robin
        let num_banks = self.timing.num_banks;
        for i in 0..num_banks {
            let bank_id = (self.bank_priority + i) % num_banks;
            let Some(request_idx) = self.schedule(bank_id) else {
                continue;
            };
            let row = self.queues[bank_id][request_idx].row;
            let state = self.banks[bank_id].state;
            let next_column = self.banks[bank_id].next_column;
            let next_precharge = self.banks[bank_id].next_precharge;
            let next_activate = self.banks[bank_id].next_activate;

            match state {
                BankState::Active { row: open_row } if open_row == row => {
                    // row hit: issue the column access
                    if cycle < next_column {
                        continue;
                    }
                    let request = self.queues[bank_id].remove(request_idx).unwrap();
                    self.num_pending -= 1;

                    let is_write = request.fetch.is_write();
                    let column_latency = if is_write {
                        self.timing.wl
                    } else {
                        self.timing.cl
                    };
                    let ready = cycle + column_latency + self.burst_cycles;
                    let bank = &mut self.banks[bank_id];
                    bank.next_column = cycle + self.timing.t_ccd.max(self.burst_cycles);

                    if is_write {
                        self.stats.inc_write(0, bank_id);
                    } else {
                        self.stats.inc_read(0, bank_id);
                    }
                    if request.arrive_cycle < cycle {
                        self.stats.row_hits += 1;
                    }
                    self.insert_in_service(ready, request.fetch);
                    self.bank_priority = (bank_id + 1) % num_banks;
                    break;
                }
                BankState::Active { .. } => {
                    // row conflict: precharge once tRAS has elapsed
                    if cycle < next_precharge {
                        continue;
                    }
                    let bank = &mut self.banks[bank_id];
                    bank.state = BankState::Idle;
                    bank.next_activate = bank
                        .next_activate
                        .max(cycle + self.timing.t_rp)
                        .max(bank.last_activate + self.timing.t_rc);
                    self.stats.num_precharges += 1;
                    self.stats.row_misses += 1;
                    self.bank_priority = (bank_id + 1) % num_banks;
                    break;
                }
                BankState::Idle => {
                    if cycle < next_activate
                        || (self.stats.num_activates > 0
                            && cycle < self.last_activate_any + self.timing.t_rrd)
                    {
                        continue;
                    }
                    let bank = &mut self.banks[bank_id];
                    bank.state = BankState::Active { row };
                    bank.last_activate = cycle;
                    bank.next_column = cycle + self.timing.t_rcd;
                    bank.next_precharge = cycle + self.timing.t_ras;
                    self.last_activate_any = cycle;
                    self.stats.num_activates += 1;
                    self.bank_priority = (bank_id + 1) % num_banks;
                    break;
                }
            }
        }
    }

    fn insert_in_service(&mut self, ready: u64, fetch: mem_fetch::MemFetch) {
        // keep the queue ordered by readiness
        let position = self
            .in_service
            .iter()
            .position(|(other, _)| *other > ready)
            .unwrap_or(self.in_service.len());
        self.in_service.insert(position, (ready, fetch));
    }

    pub fn return_queue_pop(&mut self) -> Option<mem_fetch::MemFetch> {
        self.return_queue.dequeue()
    }

    #[must_use]
    pub fn return_queue_top(&self) -> Option<&mem_fetch::MemFetch> {
        self.return_queue.first()
    }
}

#[cfg(test)]
mod tests {
    use crate::{config, mem_fetch, warp::ActiveMask};
    use color_eyre::eyre;

    fn request(uid: u64, bank: u64, row: u64) -> mem_fetch::MemFetch {
        let access = mem_fetch::access::Builder {
            kind: mem_fetch::access::Kind::GLOBAL_ACC_R,
            addr: 0x100,
            req_size_bytes: 32,
            is_write: false,
            warp_active_mask: ActiveMask::ZERO,
            byte_mask: mem_fetch::ByteMask::ZERO,
            sector_mask: mem_fetch::SectorMask::ZERO,
        }
        .build();
        let mut fetch = mem_fetch::Builder {
            uid,
            access,
            instr: None,
            warp_id: 0,
            core_id: Some(0),
            cluster_id: Some(0),
            physical_addr: crate::mcu::PhysicalAddress::default(),
            partition_addr: 0x100,
        }
        .build();
        fetch.physical_addr.bank = bank;
        fetch.physical_addr.row = row;
        fetch
    }

    fn run_until_return(dram: &mut super::Dram, start: u64, limit: u64) -> Option<(u64, u64)> {
        for cycle in start..limit {
            dram.cycle(cycle);
            if let Some(fetch) = dram.return_queue_pop() {
                return Some((cycle, fetch.uid));
            }
        }
        None
    }

    #[test]
    fn row_hit_is_faster_than_conflict() -> eyre::Result<()> {
        let config = config::GPU::default();
        let mut dram = super::Dram::new(0, &config);
        dram.push(request(1, 0, 1), 0);
        let (first, _) = run_until_return(&mut dram, 0, 1000).unwrap();

        // same row: only CL + burst
        dram.push(request(2, 0, 1), first);
        let (second, _) = run_until_return(&mut dram, first + 1, 1000).unwrap();
        let hit_latency = second - first;

        // different row: precharge + activate first
        dram.push(request(3, 0, 2), second);
        let (third, _) = run_until_return(&mut dram, second + 1, 10_000).unwrap();
        let conflict_latency = third - second;

        assert!(conflict_latency > hit_latency);
        let timing = &config.dram_timing;
        assert!(conflict_latency >= timing.t_rp + timing.t_rcd);
        Ok(())
    }

    #[test]
    fn row_hits_are_preferred_over_older_misses() -> eyre::Result<()> {
        let config = config::GPU::default();
        let mut dram = super::Dram::new(0, &config);

        // open row 1
        dram.push(request(1, 0, 1), 0);
        let (cycle, _) = run_until_return(&mut dram, 0, 1000).unwrap();

        // an older conflict and a younger hit
        dram.push(request(2, 0, 2), cycle);
        dram.push(request(3, 0, 1), cycle + 1);
        let (_, first_uid) = run_until_return(&mut dram, cycle + 2, 10_000).unwrap();
        assert_eq!(first_uid, 3);
        Ok(())
    }

    #[test]
    fn bounded_scheduler_queue() -> eyre::Result<()> {
        let mut config = config::GPU::default();
        config.dram_frfcfs_sched_queue_size = 2;
        let mut dram = super::Dram::new(0, &config);
        assert!(!dram.full());
        dram.push(request(1, 0, 1), 0);
        dram.push(request(2, 0, 1), 0);
        assert!(dram.full());
        Ok(())
    }
}
