use super::warp::Warp;

/// Warp scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Loose round robin.
    Lrr,
    /// Greedy-then-oldest: keep issuing the last warp, then prefer the
    /// oldest by dynamic warp id.
    Gto,
}

/// One warp scheduler: owns a subset of the core's warps and produces the
/// priority order the issue stage follows.
#[derive(Debug)]
pub struct Scheduler {
    pub id: usize,
    pub kind: Kind,
    /// Warp ids this scheduler arbitrates between.
    pub supervised_warps: Vec<usize>,
    /// Index (into `supervised_warps`) of the last warp that issued.
    last_supervised_issued_idx: usize,
    pub num_issued_last_cycle: usize,
}

impl Scheduler {
    #[must_use]
    pub fn new(id: usize, kind: Kind) -> Self {
        Self {
            id,
            kind,
            supervised_warps: Vec::new(),
            last_supervised_issued_idx: 0,
            num_issued_last_cycle: 0,
        }
    }

    pub fn add_supervised_warp(&mut self, warp_id: usize) {
        self.supervised_warps.push(warp_id);
    }

    /// Record that the warp at `supervised_idx` issued this cycle.
    pub fn issued(&mut self, supervised_idx: usize, num_issued: usize) {
        self.last_supervised_issued_idx = supervised_idx;
        self.num_issued_last_cycle = num_issued;
    }

    /// The warps to consider this cycle, most preferred first.
    ///
    /// Returns `(supervised index, warp id)` pairs.
    #[must_use]
    pub fn prioritized_warps(&self, warps: &[Warp]) -> Vec<(usize, usize)> {
        let num_warps = self.supervised_warps.len();
        let mut order = Vec::with_capacity(num_warps);
        match self.kind {
            Kind::Lrr => {
                // start after the last issued warp
                for i in 0..num_warps {
                    let idx = (self.last_supervised_issued_idx + 1 + i) % num_warps;
                    order.push((idx, self.supervised_warps[idx]));
                }
            }
            Kind::Gto => {
                // greedy: the last issued warp keeps priority, the rest are
                // ordered oldest dynamic warp first
                let greedy_idx = self.last_supervised_issued_idx;
                order.push((greedy_idx, self.supervised_warps[greedy_idx]));
                let mut rest: Vec<(usize, usize)> = (0..num_warps)
                    .filter(|idx| *idx != greedy_idx)
                    .map(|idx| (idx, self.supervised_warps[idx]))
                    .collect();
                rest.sort_by_key(|(_, warp_id)| {
                    let warp = &warps[*warp_id];
                    (warp.dynamic_warp_id, *warp_id)
                });
                order.extend(rest);
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::{Kind, Scheduler};
    use crate::warp::Warp;

    fn warps(dynamic_ids: &[usize]) -> Vec<Warp> {
        dynamic_ids
            .iter()
            .enumerate()
            .map(|(warp_id, dynamic_id)| {
                let mut warp = Warp::default();
                warp.warp_id = warp_id;
                warp.dynamic_warp_id = *dynamic_id;
                warp
            })
            .collect()
    }

    #[test]
    fn lrr_rotates_after_issue() {
        let mut scheduler = Scheduler::new(0, Kind::Lrr);
        for warp_id in 0..4 {
            scheduler.add_supervised_warp(warp_id);
        }
        let warps = warps(&[0, 1, 2, 3]);

        let order: Vec<usize> = scheduler
            .prioritized_warps(&warps)
            .into_iter()
            .map(|(_, warp_id)| warp_id)
            .collect();
        assert_eq!(order, vec![1, 2, 3, 0]);

        scheduler.issued(2, 1);
        let order: Vec<usize> = scheduler
            .prioritized_warps(&warps)
            .into_iter()
            .map(|(_, warp_id)| warp_id)
            .collect();
        assert_eq!(order, vec![3, 0, 1, 2]);
    }

    #[test]
    fn gto_prefers_greedy_then_oldest() {
        let mut scheduler = Scheduler::new(0, Kind::Gto);
        for warp_id in 0..4 {
            scheduler.add_supervised_warp(warp_id);
        }
        // warp 2 is the oldest by dynamic id
        let warps = warps(&[3, 2, 0, 1]);

        scheduler.issued(3, 1);
        let order: Vec<usize> = scheduler
            .prioritized_warps(&warps)
            .into_iter()
            .map(|(_, warp_id)| warp_id)
            .collect();
        // greedy warp 3 first, then by dynamic warp id: 2 (0), 1 (2), 0 (3)
        assert_eq!(order, vec![3, 2, 1, 0]);
    }
}
