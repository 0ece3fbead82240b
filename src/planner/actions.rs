//! Plan and action types
//!
//! A plan is an ordered list of typed actions broadcast as one chain
//! batch. Rotate pairs a cancel with a create so same-side opposing
//! ops net their fund requirements inside a single transaction. The
//! planner records the fresh funds each side needs as it stages
//! actions; the executor re-verifies that figure before broadcast.

use crate::asset::{Amount, Price, Side, SidePair};
use crate::grid::Grid;

/// One typed step of a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Broadcast a new limit order for a VIRTUAL slot.
    Create {
        slot: usize,
        price: Price,
        size: Amount,
    },
    /// Cancel an on-chain order; its size returns to the free balance.
    Cancel { slot: usize, order_id: String },
    /// In-place modify: PARTIAL size adjustments and same-side price nudges.
    Update {
        slot: usize,
        order_id: String,
        new_price: Option<Price>,
        new_size: Amount,
    },
    /// Atomic cancel-src + create-dst pair.
    Rotate {
        src: usize,
        dst: usize,
        /// Chain id of the src order, when one is still resting.
        order_id: Option<String>,
        price: Price,
        size: Amount,
    },
}

impl Action {
    /// Chain order id this action references (stale-order attribution).
    pub fn order_id(&self) -> Option<&str> {
        match self {
            Action::Cancel { order_id, .. } | Action::Update { order_id, .. } => Some(order_id),
            Action::Rotate { order_id, .. } => order_id.as_deref(),
            Action::Create { .. } => None,
        }
    }
}

/// Ordered action list plus its bookkeeping sums.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<Action>,
    /// Native-asset fees the batch will owe (op lifecycle only).
    pub op_fees: Amount,
    /// Fresh funds the plan draws per side, recorded at staging time
    /// against the pre-plan sizes.
    required: SidePair<Amount>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Number of chain ops after Rotate expansion.
    pub fn op_count(&self) -> usize {
        self.actions
            .iter()
            .map(|a| match a {
                Action::Rotate {
                    order_id: Some(_), ..
                } => 2,
                _ => 1,
            })
            .sum()
    }

    /// Record fresh funds a staged action draws on a side.
    pub fn add_required(&mut self, side: Side, amount: Amount) {
        *self.required.get_mut(side) = self.required.get(side).saturating_add(amount);
    }

    pub fn required_funds(&self, side: Side) -> Amount {
        *self.required.get(side)
    }

    /// Sum of creation sizes staged on a side (Create plus Rotate
    /// destinations), resolved against the working view's boundary.
    /// These sizes live in the shadow's virtual reservation, so the
    /// pre-plan spendable balance is `headroom + staged`.
    pub fn staged_creates(&self, view: &Grid, side: Side) -> Amount {
        self.actions
            .iter()
            .map(|a| match a {
                Action::Create { slot, size, .. } if view.side_of_index(*slot) == side => *size,
                Action::Rotate { dst, size, .. } if view.side_of_index(*dst) == side => *size,
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{PairPrecision, Price, Side};
    use crate::grid::master::tests::test_grid;

    fn price(p: f64) -> Price {
        Price::from_human(p, PairPrecision::new(4, 8))
    }

    #[test]
    fn test_required_funds_bookkeeping() {
        let mut plan = Plan::new();
        plan.add_required(Side::Buy, 5_000);
        plan.add_required(Side::Buy, 2_000);
        assert_eq!(plan.required_funds(Side::Buy), 7_000);
        assert_eq!(plan.required_funds(Side::Sell), 0);
    }

    #[test]
    fn test_staged_creates_by_side() {
        let grid = test_grid();
        let sell_slot = grid.boundary_idx;
        let mut plan = Plan::new();
        plan.push(Action::Create {
            slot: 0,
            price: price(900.0),
            size: 5_000,
        });
        plan.push(Action::Rotate {
            src: 1,
            dst: sell_slot,
            order_id: Some("1.7.1".into()),
            price: price(1005.0),
            size: 7_000,
        });
        plan.push(Action::Cancel {
            slot: 2,
            order_id: "1.7.2".into(),
        });
        assert_eq!(plan.staged_creates(&grid, Side::Buy), 5_000);
        assert_eq!(plan.staged_creates(&grid, Side::Sell), 7_000);
    }

    #[test]
    fn test_op_count_expands_rotations() {
        let mut plan = Plan::new();
        plan.push(Action::Rotate {
            src: 0,
            dst: 5,
            order_id: Some("1.7.1".into()),
            price: price(1000.0),
            size: 1,
        });
        plan.push(Action::Rotate {
            src: 0,
            dst: 5,
            order_id: None,
            price: price(1000.0),
            size: 1,
        });
        plan.push(Action::Update {
            slot: 1,
            order_id: "1.7.2".into(),
            new_price: None,
            new_size: 10,
        });
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.op_count(), 4);
    }

    #[test]
    fn test_action_order_ids() {
        let cancel = Action::Cancel {
            slot: 0,
            order_id: "1.7.9".into(),
        };
        assert_eq!(cancel.order_id(), Some("1.7.9"));
        let create = Action::Create {
            slot: 0,
            price: price(1.0),
            size: 1,
        };
        assert_eq!(create.order_id(), None);
    }
}
