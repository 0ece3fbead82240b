//! Master grid: the frozen slot array
//!
//! The master is conceptually immutable between commits. Planning
//! cycles fork a [`WorkingGrid`](super::working::WorkingGrid), mutate
//! the fork, and swap it back in under the generation guard.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::asset::{Amount, PairPrecision, Price, Side};
use crate::config::BotConfig;
use crate::errors::{Error, Result};

use super::types::{OrderRecord, OrderRole, OrderState};

/// Ordered slot array plus boundary metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grid {
    pub slots: Vec<OrderRecord>,
    /// Smallest index on the sell side of the book.
    pub boundary_idx: usize,
    /// SPREAD placeholders realizing the target half-spread, counted at build.
    pub gap_slots: usize,
    pub session_id: u64,
    /// Increments on every successful commit.
    pub generation: u64,
    pub increment_bps: u32,
    /// chain order id -> slot, rebuilt on build/load/commit.
    #[serde(skip)]
    order_index: HashMap<String, usize>,
}

impl Grid {
    /// Build the initial geometric layout from config and a reference
    /// price. Roles fall out of comparing each rung to the reference
    /// offset by half the target spread.
    pub fn build(
        cfg: &BotConfig,
        prec: PairPrecision,
        ref_price_human: f64,
        session_id: u64,
        now_ms: u64,
    ) -> Result<Self> {
        let min_human = cfg.min_price.resolve(ref_price_human);
        let max_human = cfg.max_price.resolve(ref_price_human);
        if min_human <= 0.0 || min_human >= max_human {
            return Err(Error::Config(format!(
                "grid bounds [{min_human}, {max_human}] are not an increasing positive range"
            )));
        }

        let reference = Price::from_human(ref_price_human, prec);
        let max_price = Price::from_human(max_human, prec);
        let step_bps = cfg.increment_bps();
        let half_spread = cfg.target_spread_bps() / 2;
        let buy_edge = reference.scaled(10_000, 10_000 + half_spread);
        let sell_edge = reference.scaled(10_000 + half_spread, 10_000);

        let mut slots = Vec::new();
        let mut price = Price::from_human(min_human, prec);
        let mut boundary_idx = None;
        let mut gap_slots = 0;
        while price <= max_price {
            let idx = slots.len();
            if idx >= MAX_SLOTS {
                return Err(Error::Config(format!(
                    "increment {} produces more than {MAX_SLOTS} slots",
                    cfg.increment_percent
                )));
            }
            let role = if price < buy_edge {
                OrderRole::Buy
            } else if price > sell_edge {
                OrderRole::Sell
            } else {
                gap_slots += 1;
                OrderRole::Spread
            };
            if boundary_idx.is_none() && price >= reference {
                boundary_idx = Some(idx);
            }
            slots.push(OrderRecord::placeholder(idx, role, price, session_id, now_ms));
            price = price.step_up(step_bps);
        }
        if slots.len() < 2 {
            return Err(Error::Config("grid needs at least two slots".into()));
        }

        let grid = Self {
            boundary_idx: boundary_idx.unwrap_or(slots.len()),
            gap_slots,
            session_id,
            generation: 0,
            increment_bps: step_bps,
            order_index: HashMap::new(),
            slots,
        };
        grid.validate()?;
        debug!(
            "built grid: {} slots, boundary={}, gap={}",
            grid.slots.len(),
            grid.boundary_idx,
            grid.gap_slots
        );
        Ok(grid)
    }

    /// Reassemble a grid from persisted parts; the lookup index is
    /// rebuilt here.
    pub fn from_parts(
        slots: Vec<OrderRecord>,
        boundary_idx: usize,
        gap_slots: usize,
        session_id: u64,
        generation: u64,
        increment_bps: u32,
    ) -> Self {
        let mut grid = Self {
            slots,
            boundary_idx,
            gap_slots,
            session_id,
            generation,
            increment_bps,
            order_index: HashMap::new(),
        };
        grid.rebuild_index();
        grid
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, idx: usize) -> Result<&OrderRecord> {
        self.slots.get(idx).ok_or(Error::SlotNotFound(idx))
    }

    /// Look a live order up by its chain id.
    pub fn find_by_order_id(&self, order_id: &str) -> Option<usize> {
        self.order_index.get(order_id).copied()
    }

    /// Rebuild the id -> slot map. Called after build, load and commit.
    pub fn rebuild_index(&mut self) {
        self.order_index = self
            .slots
            .iter()
            .filter_map(|rec| rec.chain_order_id.clone().map(|id| (id, rec.slot)))
            .collect();
    }

    /// The role a slot index implies from the boundary alone.
    pub fn side_of_index(&self, idx: usize) -> Side {
        if idx < self.boundary_idx {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn live_count(&self, side: Side) -> usize {
        self.slots
            .iter()
            .filter(|r| r.is_live() && r.role.committed_side() == Some(side))
            .count()
    }

    /// Sum of live (ACTIVE + PARTIAL) sizes committed on a side.
    pub fn committed(&self, side: Side) -> Amount {
        self.slots
            .iter()
            .filter(|r| r.is_live() && r.role.committed_side() == Some(side))
            .map(|r| r.size)
            .sum()
    }

    /// Sum of VIRTUAL sizes pending creation on a side.
    pub fn virtual_committed(&self, side: Side) -> Amount {
        self.slots
            .iter()
            .filter(|r| r.state == OrderState::Virtual && r.role.committed_side() == Some(side))
            .map(|r| r.size)
            .sum()
    }

    /// Live slot nearest the boundary on a side (the best-priced order).
    pub fn best_live(&self, side: Side) -> Option<usize> {
        match side {
            Side::Buy => self
                .slots
                .iter()
                .rev()
                .find(|r| r.is_live() && r.role == OrderRole::Buy)
                .map(|r| r.slot),
            Side::Sell => self
                .slots
                .iter()
                .find(|r| r.is_live() && r.role == OrderRole::Sell)
                .map(|r| r.slot),
        }
    }

    /// Live slot farthest from the boundary on a side (the window edge).
    pub fn edge_live(&self, side: Side) -> Option<usize> {
        match side {
            Side::Buy => self
                .slots
                .iter()
                .find(|r| r.is_live() && r.role == OrderRole::Buy)
                .map(|r| r.slot),
            Side::Sell => self
                .slots
                .iter()
                .rev()
                .find(|r| r.is_live() && r.role == OrderRole::Sell)
                .map(|r| r.slot),
        }
    }

    /// SPREAD placeholder nearest the boundary on the given side of it.
    pub fn spread_slot(&self, side: Side) -> Option<usize> {
        match side {
            Side::Sell => (self.boundary_idx..self.slots.len())
                .find(|&i| self.slots[i].role == OrderRole::Spread),
            Side::Buy => (0..self.boundary_idx)
                .rev()
                .find(|&i| self.slots[i].role == OrderRole::Spread),
        }
    }

    /// Lowest SPREAD placeholder strictly above every live buy and the
    /// given index: where a replacement sell belongs after a buy fill.
    pub fn spread_above(&self, idx: usize) -> Option<usize> {
        let floor = match self.best_live(Side::Buy) {
            Some(b) => idx.max(b),
            None => idx,
        };
        (floor + 1..self.slots.len()).find(|&i| self.slots[i].role == OrderRole::Spread)
    }

    /// Highest SPREAD placeholder strictly below every live sell and
    /// the given index: where a replacement buy belongs after a sell
    /// fill.
    pub fn spread_below(&self, idx: usize) -> Option<usize> {
        let ceil = match self.best_live(Side::Sell) {
            Some(s) => idx.min(s),
            None => idx,
        };
        (0..ceil).rev().find(|&i| self.slots[i].role == OrderRole::Spread)
    }

    /// Counts per (role, state) for status logging.
    pub fn count_by_role_and_state(&self) -> HashMap<(OrderRole, OrderState), usize> {
        let mut counts = HashMap::new();
        for rec in &self.slots {
            *counts.entry((rec.role, rec.state)).or_insert(0) += 1;
        }
        counts
    }

    /// Structural invariants: strictly increasing prices, slot identity,
    /// role agreement with the boundary, per-record rules.
    pub fn validate(&self) -> Result<()> {
        if self.boundary_idx > self.slots.len() {
            return Err(Error::IllegalState(format!(
                "boundary {} beyond {} slots",
                self.boundary_idx,
                self.slots.len()
            )));
        }
        for (idx, rec) in self.slots.iter().enumerate() {
            if rec.slot != idx {
                return Err(Error::IllegalState(format!(
                    "slot field {} disagrees with position {idx}",
                    rec.slot
                )));
            }
            rec.validate()?;
            if idx > 0 && self.slots[idx - 1].price >= rec.price {
                return Err(Error::IllegalState(format!(
                    "prices not strictly increasing at slot {idx}"
                )));
            }
            match rec.role {
                OrderRole::Buy if idx >= self.boundary_idx => {
                    return Err(Error::IllegalState(format!(
                        "buy slot {idx} at or above boundary {}",
                        self.boundary_idx
                    )));
                }
                OrderRole::Sell if idx < self.boundary_idx => {
                    return Err(Error::IllegalState(format!(
                        "sell slot {idx} below boundary {}",
                        self.boundary_idx
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Safety stop for pathological increment settings.
const MAX_SLOTS: usize = 10_000;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::test_config;

    pub(crate) fn test_precision() -> PairPrecision {
        PairPrecision::new(4, 8)
    }

    pub(crate) fn test_grid() -> Grid {
        Grid::build(&test_config(), test_precision(), 1000.0, 1, 0).unwrap()
    }

    #[test]
    fn test_build_layout() {
        let grid = test_grid();
        // 900 .. 1100 at 0.5% is ~40 rungs
        assert!(grid.len() >= 38 && grid.len() <= 42, "len={}", grid.len());
        assert!(grid.validate().is_ok());
        assert!(grid.gap_slots >= 1);

        // roles are contiguous: buys, spread window, sells
        let first_sell = grid
            .slots
            .iter()
            .position(|r| r.role == OrderRole::Sell)
            .unwrap();
        let last_buy = grid
            .slots
            .iter()
            .rposition(|r| r.role == OrderRole::Buy)
            .unwrap();
        assert!(last_buy < grid.boundary_idx);
        assert!(first_sell >= grid.boundary_idx);
        for rec in &grid.slots[last_buy + 1..first_sell] {
            assert_eq!(rec.role, OrderRole::Spread);
        }
    }

    #[test]
    fn test_boundary_is_first_at_or_above_reference() {
        let grid = test_grid();
        let prec = test_precision();
        let reference = Price::from_human(1000.0, prec);
        assert!(grid.slots[grid.boundary_idx].price >= reference);
        assert!(grid.slots[grid.boundary_idx - 1].price < reference);
    }

    #[test]
    fn test_spread_slot_lookup() {
        let grid = test_grid();
        let sell_gap = grid.spread_slot(Side::Sell).unwrap();
        let buy_gap = grid.spread_slot(Side::Buy).unwrap();
        assert!(sell_gap >= grid.boundary_idx);
        assert!(buy_gap < grid.boundary_idx);
        assert_eq!(grid.slots[sell_gap].role, OrderRole::Spread);
    }

    #[test]
    fn test_order_index_roundtrip() {
        let mut grid = test_grid();
        let idx = grid.spread_slot(Side::Sell).unwrap();
        grid.slots[idx].size = 500;
        grid.slots[idx].mark_active(
            "1.7.77".into(),
            super::super::types::RawOnChain {
                for_sale: 500,
                to_receive: 50,
            },
        );
        grid.slots[idx].role = OrderRole::Sell;
        grid.rebuild_index();
        assert_eq!(grid.find_by_order_id("1.7.77"), Some(idx));
        assert_eq!(grid.find_by_order_id("1.7.78"), None);
        assert_eq!(grid.committed(Side::Sell), 500);
        assert_eq!(grid.live_count(Side::Sell), 1);
    }

    #[test]
    fn test_bad_bounds_rejected() {
        let mut cfg = test_config();
        cfg.min_price = crate::config::PriceBound::Absolute(1200.0);
        assert!(Grid::build(&cfg, test_precision(), 1000.0, 1, 0).is_err());
    }
}
