use super::config;

/// Credit-based arbitration between the sub partitions sharing one DRAM
/// channel.
///
/// Each sub partition holds a small private credit allowance; beyond that it
/// borrows from a shared pool sized after the DRAM queues, so one congested
/// sub partition cannot monopolize the channel.
#[derive(Debug)]
pub struct Arbitration {
    /// Sub partition that borrowed a credit most recently.
    last_borrower: usize,
    shared_credit_limit: usize,
    private_credit_limit: usize,

    private_credit: Vec<usize>,
    shared_credit: usize,
}

impl Arbitration {
    #[must_use]
    pub fn new(config: &config::GPU) -> Self {
        let num_borrowers = config.num_sub_partitions_per_memory_controller;
        assert!(num_borrowers > 0);
        let mut shared_credit_limit = config.dram_frfcfs_sched_queue_size
            + config.dram_return_queue_size
            - (num_borrowers - 1);
        if config.dram_frfcfs_sched_queue_size == 0 || config.dram_return_queue_size == 0 {
            // unlimited queues, unlimited credits
            shared_credit_limit = 0;
        }
        Self {
            last_borrower: num_borrowers - 1,
            shared_credit_limit,
            private_credit_limit: 1,
            private_credit: vec![0; num_borrowers],
            shared_credit: 0,
        }
    }

    #[must_use]
    pub fn has_credits(&self, sub_partition: usize) -> bool {
        if self.private_credit[sub_partition] < self.private_credit_limit {
            return true;
        }
        self.shared_credit_limit == 0 || self.shared_credit < self.shared_credit_limit
    }

    pub fn borrow_credit(&mut self, sub_partition: usize) {
        if self.private_credit[sub_partition] < self.private_credit_limit {
            self.private_credit[sub_partition] += 1;
        } else if self.shared_credit_limit == 0 || self.shared_credit < self.shared_credit_limit {
            self.shared_credit += 1;
        } else {
            panic!("dram arbitration: borrowing from depleted credit");
        }
        self.last_borrower = sub_partition;
    }

    pub fn return_credit(&mut self, sub_partition: usize) {
        if self.private_credit[sub_partition] > 0 {
            self.private_credit[sub_partition] -= 1;
        } else {
            debug_assert!(
                self.shared_credit > 0,
                "dram arbitration: returning more than the available credits"
            );
            self.shared_credit = self.shared_credit.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn last_borrower(&self) -> usize {
        self.last_borrower
    }
}

#[cfg(test)]
mod tests {
    use crate::config;

    #[test]
    fn credits_flow_between_private_and_shared() {
        let config = config::GPU::default();
        let mut arb = super::Arbitration::new(&config);

        assert!(arb.has_credits(0));
        arb.borrow_credit(0);
        assert_eq!(arb.last_borrower(), 0);
        // first credit was private, the next borrows from the shared pool
        assert!(arb.has_credits(0));
        arb.borrow_credit(0);
        arb.return_credit(0);
        arb.return_credit(0);
        assert!(arb.has_credits(0));
    }
}
