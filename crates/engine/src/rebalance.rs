//! Local rebalancing pass over an eligible worker list.
//!
//! The pass is pure bookkeeping: it proposes [`Transfer`]s, the engine
//! carries them out against storage and reports back how many assignments
//! actually moved. Moves can fall short when the donor holds items outside
//! the recipient's range.
//!
//! With `S` existing active assignments over `n` workers in index order
//! (least loaded first), each worker gets a quota of `S / n`, and the
//! `S % n` most-loaded workers one more. A two-pointer walk pairs the
//! lowest-loaded worker under quota with the highest-loaded worker over
//! quota. Each pairing ends with one side satisfied or the donor exhausted,
//! so there are at most `n - 1` transfers.

/// A batch move: `count` oldest assignments from `from` to `to`.
///
/// Both are positions in the load list the pass was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Donor position
    pub from: usize,
    /// Recipient position
    pub to: usize,
    /// Assignments requested
    pub count: u64,
}

/// State of one rebalancing pass.
#[derive(Debug, Clone)]
pub struct RebalancePass {
    loads: Vec<u64>,
    quotas: Vec<u64>,
    target: u64,
    lo: usize,
    hi: usize,
}

impl RebalancePass {
    /// Start a pass over loads given in index order.
    pub fn new(loads: Vec<u64>) -> Self {
        let n = loads.len();
        let existing: u64 = loads.iter().sum();

        let (target, quotas) = if n == 0 {
            (0, Vec::new())
        } else {
            let n64 = n as u64;
            let base = existing / n64;
            let extra = (existing % n64) as usize;
            let quotas = (0..n)
                .map(|i| if i >= n - extra { base + 1 } else { base })
                .collect();
            // Ideal per-worker load once the incoming item is counted.
            ((existing + 1).div_ceil(n64), quotas)
        };

        Self {
            loads,
            quotas,
            target,
            lo: 0,
            hi: n.saturating_sub(1),
        }
    }

    /// `ceil((S + 1) / n)`.
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Current loads, updated by [`RebalancePass::settle`].
    pub fn loads(&self) -> &[u64] {
        &self.loads
    }

    /// Per-position quotas.
    pub fn quotas(&self) -> &[u64] {
        &self.quotas
    }

    /// The next move to perform, or `None` when the pass is over.
    pub fn next_transfer(&mut self) -> Option<Transfer> {
        while self.lo < self.hi {
            let deficit = self.quotas[self.lo].saturating_sub(self.loads[self.lo]);
            if deficit == 0 {
                self.lo += 1;
                continue;
            }
            let surplus = self.loads[self.hi].saturating_sub(self.quotas[self.hi]);
            if surplus == 0 {
                self.hi -= 1;
                continue;
            }
            return Some(Transfer {
                from: self.hi,
                to: self.lo,
                count: deficit.min(surplus),
            });
        }
        None
    }

    /// Record that `moved` of the requested assignments were moved.
    ///
    /// A short move means the donor has nothing more the recipient may take,
    /// so the walk gives up on that donor.
    pub fn settle(&mut self, transfer: Transfer, moved: u64) {
        let moved = moved.min(transfer.count).min(self.loads[transfer.from]);
        self.loads[transfer.to] += moved;
        self.loads[transfer.from] -= moved;
        if moved < transfer.count && self.hi == transfer.from && self.hi > self.lo {
            self.hi -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a pass where every requested move succeeds.
    fn run_full(loads: Vec<u64>) -> (RebalancePass, Vec<Transfer>) {
        let mut pass = RebalancePass::new(loads);
        let mut transfers = Vec::new();
        while let Some(t) = pass.next_transfer() {
            pass.settle(t, t.count);
            transfers.push(t);
        }
        (pass, transfers)
    }

    #[test]
    fn test_five_five_zero() {
        // Index order puts the idle worker first.
        let (pass, transfers) = run_full(vec![0, 5, 5]);
        assert_eq!(pass.target(), 4);
        assert_eq!(pass.loads(), &[3, 3, 4]);
        assert_eq!(
            transfers,
            vec![
                Transfer { from: 2, to: 0, count: 1 },
                Transfer { from: 1, to: 0, count: 2 },
            ]
        );
    }

    #[test]
    fn test_balanced_input_moves_nothing() {
        let (pass, transfers) = run_full(vec![2, 2, 3]);
        assert!(transfers.is_empty());
        assert_eq!(pass.loads(), &[2, 2, 3]);
    }

    #[test]
    fn test_transfer_count_is_bounded() {
        let loads = vec![0, 0, 0, 0, 1, 7, 9, 30];
        let n = loads.len();
        let (pass, transfers) = run_full(loads);
        assert!(transfers.len() < n);
        let max = pass.loads().iter().max().unwrap();
        let min = pass.loads().iter().min().unwrap();
        assert!(max - min <= 1);
        assert_eq!(pass.loads().iter().sum::<u64>(), 47);
    }

    #[test]
    fn test_short_move_abandons_donor() {
        let mut pass = RebalancePass::new(vec![0, 4, 6]);
        let first = pass.next_transfer().unwrap();
        assert_eq!(first, Transfer { from: 2, to: 0, count: 2 });

        // Donor only had one item the recipient could take.
        pass.settle(first, 1);
        let second = pass.next_transfer().unwrap();
        assert_eq!(second.from, 1);
        assert_eq!(second.to, 0);
        pass.settle(second, second.count);

        assert!(pass.next_transfer().is_none());
        assert_eq!(pass.loads().iter().sum::<u64>(), 10);
    }

    #[test]
    fn test_nothing_movable_terminates() {
        let mut pass = RebalancePass::new(vec![0, 0, 9]);
        let mut rounds = 0;
        while let Some(t) = pass.next_transfer() {
            pass.settle(t, 0);
            rounds += 1;
        }
        assert_eq!(rounds, 1);
        assert_eq!(pass.loads(), &[0, 0, 9]);
    }

    #[test]
    fn test_degenerate_sizes() {
        let (pass, transfers) = run_full(vec![]);
        assert!(transfers.is_empty());
        assert_eq!(pass.target(), 0);

        let (pass, transfers) = run_full(vec![7]);
        assert!(transfers.is_empty());
        assert_eq!(pass.target(), 8);
        assert_eq!(pass.quotas(), &[7]);
    }
}
