//! Copy-on-write planning view of the grid
//!
//! Every planning cycle forks the master, mutates the fork, and swaps
//! it back only when the chain confirmed the batch. The generation
//! recorded at fork time guards the swap: a commit against a master
//! that moved on fails loudly and leaves the master untouched.

use crate::asset::Side;
use crate::errors::{Error, Result};

use super::master::Grid;
use super::types::OrderRecord;

/// Tentative grid state for one planning cycle.
#[derive(Debug, Clone)]
pub struct WorkingGrid {
    base_generation: u64,
    grid: Grid,
    /// Boundary move computed by the planner, applied atomically with
    /// the slot-role patches at commit.
    pending_boundary: Option<usize>,
}

impl WorkingGrid {
    /// Clone the master for tentative mutation.
    pub fn fork(master: &Grid) -> Self {
        Self {
            base_generation: master.generation,
            grid: master.clone(),
            pending_boundary: None,
        }
    }

    pub fn base_generation(&self) -> u64 {
        self.base_generation
    }

    /// Read access to the forked state (lookups, sums).
    pub fn view(&self) -> &Grid {
        &self.grid
    }

    pub fn slot_mut(&mut self, idx: usize) -> Result<&mut OrderRecord> {
        self.grid.slots.get_mut(idx).ok_or(Error::SlotNotFound(idx))
    }

    /// Replace the record at a slot with a patched copy.
    pub fn update(&mut self, idx: usize, patch: impl FnOnce(&mut OrderRecord)) -> Result<()> {
        let rec = self.slot_mut(idx)?;
        patch(rec);
        rec.slot = idx;
        Ok(())
    }

    /// Stage a boundary move; roles must already match the new index.
    pub fn set_pending_boundary(&mut self, boundary_idx: usize) {
        self.pending_boundary = Some(boundary_idx);
    }

    pub fn pending_boundary(&self) -> Option<usize> {
        self.pending_boundary
    }

    /// The boundary the commit will install.
    pub fn effective_boundary(&self) -> usize {
        self.pending_boundary.unwrap_or(self.grid.boundary_idx)
    }

    /// The side of the book a slot would belong to after commit.
    pub fn side_of_index(&self, idx: usize) -> Side {
        if idx < self.effective_boundary() {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    /// Atomically replace the master. Succeeds only when the master is
    /// still at the generation this fork was taken from; the new
    /// master's generation increases by exactly one.
    pub fn commit(mut self, master: &mut Grid) -> Result<u64> {
        if master.generation != self.base_generation {
            return Err(Error::GenerationConflict {
                expected: self.base_generation,
                actual: master.generation,
            });
        }
        if let Some(boundary) = self.pending_boundary {
            self.grid.boundary_idx = boundary;
        }
        self.grid.generation = self.base_generation + 1;
        self.grid.validate()?;
        *master = self.grid;
        master.rebuild_index();
        Ok(master.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Side;
    use crate::grid::master::tests::test_grid;
    use crate::grid::types::{OrderState, RawOnChain};

    #[test]
    fn test_fork_does_not_touch_master() {
        let master = test_grid();
        let before = master.clone();
        let mut working = WorkingGrid::fork(&master);
        working
            .update(0, |rec| {
                rec.size = 1234;
            })
            .unwrap();
        assert_eq!(master.slots[0].size, before.slots[0].size);
    }

    #[test]
    fn test_commit_bumps_generation_once() {
        let mut master = test_grid();
        let mut working = WorkingGrid::fork(&master);
        working
            .update(2, |rec| {
                rec.size = 400;
                rec.mark_active(
                    "1.7.9".into(),
                    RawOnChain {
                        for_sale: 400,
                        to_receive: 40,
                    },
                );
            })
            .unwrap();
        let generation = working.commit(&mut master).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(master.generation, 1);
        assert_eq!(master.slots[2].state, OrderState::Active);
        assert_eq!(master.find_by_order_id("1.7.9"), Some(2));
    }

    #[test]
    fn test_stale_commit_leaves_master_unchanged() {
        let mut master = test_grid();
        let stale = WorkingGrid::fork(&master);
        let fresh = WorkingGrid::fork(&master);
        fresh.commit(&mut master).unwrap();

        let snapshot = master.clone();
        let err = stale.commit(&mut master).unwrap_err();
        assert!(matches!(err, Error::GenerationConflict { expected: 0, actual: 1 }));
        assert_eq!(master.generation, snapshot.generation);
        assert_eq!(master.slots, snapshot.slots);
    }

    #[test]
    fn test_pending_boundary_applied_with_roles() {
        let mut master = test_grid();
        let boundary = master.boundary_idx;
        let mut working = WorkingGrid::fork(&master);

        // shift boundary one slot down: the slot just below becomes
        // part of the sell side, so its role must change in the same
        // commit
        working
            .update(boundary - 1, |rec| {
                rec.role = crate::grid::types::OrderRole::Spread;
            })
            .unwrap();
        working.set_pending_boundary(boundary - 1);
        assert_eq!(working.side_of_index(boundary - 1), Side::Sell);
        working.commit(&mut master).unwrap();
        assert_eq!(master.boundary_idx, boundary - 1);
        assert!(master.validate().is_ok());
    }
}
