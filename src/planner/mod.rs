//! Plan computation
//!
//! The planner is a pure function from `(master Grid, Ledger, event)`
//! to a [`PlanOutcome`]: the action batch, the projected working grid,
//! and the projected shadow ledger. It never touches the master.
//!
//! Projection convention: cancellations and fills are applied to the
//! shadow immediately (the chain nets them ahead of creations inside
//! one atomic batch); creations stay VIRTUAL reservations until the
//! worker locks them at commit time.

pub mod actions;
pub mod sizing;

use log::{debug, warn};

use crate::asset::{Amount, PairPrecision, Side};
use crate::config::BotConfig;
use crate::errors::Result;
use crate::grid::{Grid, OrderRole, OrderState, QueuedFill, WorkingGrid};
use crate::ledger::Ledger;

pub use actions::{Action, Plan};
pub use sizing::adaptive_batch_size;

/// Everything a planning cycle produces.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub working: WorkingGrid,
    pub shadow: Ledger,
}

impl PlanOutcome {
    /// A cycle that changed nothing at all.
    pub fn is_noop(&self) -> bool {
        self.plan.is_empty() && self.working.pending_boundary().is_none()
    }
}

/// Pure plan computation against a frozen master view.
pub struct Planner {
    cfg: BotConfig,
    prec: PairPrecision,
    /// Per-op creation fee in native fee-asset units.
    creation_fee: Amount,
}

impl Planner {
    pub fn new(cfg: BotConfig, prec: PairPrecision, creation_fee: Amount) -> Self {
        Self {
            cfg,
            prec,
            creation_fee,
        }
    }

    pub fn set_creation_fee(&mut self, fee: Amount) {
        self.creation_fee = fee;
    }

    fn min_units(&self, side: Side) -> Amount {
        self.cfg.min_order_units(side, self.prec.committed(side))
    }

    /// Budget for brand-new placements on a side.
    fn placement_budget(&self, ledger: &Ledger, side: Side) -> Amount {
        let configured = self
            .cfg
            .bot_funds
            .get(side)
            .resolve(ledger.side(side).chain_total, self.prec.committed(side));
        configured.min(ledger.available(side).saturating_add(ledger.cache(side)))
    }

    /// Budget divergence ideals are measured against: what the side has
    /// deployed plus what it could still deploy.
    fn ideal_budget(&self, ledger: &Ledger, side: Side) -> Amount {
        let configured = self
            .cfg
            .bot_funds
            .get(side)
            .resolve(ledger.side(side).chain_total, self.prec.committed(side));
        configured.min(
            ledger
                .side(side)
                .grid_committed
                .saturating_add(ledger.available(side))
                .saturating_add(ledger.cache(side)),
        )
    }

    /// React to a batch of fills drained from the queue. The caller
    /// bounds the batch via the adaptive tier table, which is what
    /// caps boundary-moving reactions per cycle.
    pub fn plan_fills(
        &self,
        master: &Grid,
        ledger: &Ledger,
        fills: &[QueuedFill],
    ) -> Result<PlanOutcome> {
        let mut working = WorkingGrid::fork(master);
        let mut shadow = ledger.snapshot();
        let mut plan = Plan::new();
        shadow.pause();

        for fill in fills {
            self.react_to_fill(&mut working, &mut shadow, &mut plan, fill)?;
        }

        plan.op_fees = plan.op_count() as Amount * self.creation_fee;
        shadow.resume(working.view())?;
        Ok(PlanOutcome {
            plan,
            working,
            shadow,
        })
    }

    fn react_to_fill(
        &self,
        working: &mut WorkingGrid,
        shadow: &mut Ledger,
        plan: &mut Plan,
        queued: &QueuedFill,
    ) -> Result<()> {
        let fill = &queued.fill;
        let Some(idx) = working.view().find_by_order_id(&fill.order_id) else {
            warn!("fill for unknown order {} ignored", fill.order_id);
            return Ok(());
        };
        let rec = working.view().slot(idx)?.clone();
        let Some(side) = rec.role.committed_side() else {
            warn!("fill hit spread placeholder slot {idx}; ignoring");
            return Ok(());
        };

        let remaining = rec.size.saturating_sub(fill.paid);
        if queued.balance_settled {
            // an adopted snapshot already carries this fill's funds
            debug!("fill {} already settled in balances", fill.key());
        } else {
            shadow.apply_fill(side, fill.paid, fill.received, fill.fee, fill.is_maker);
        }

        if remaining == 0 {
            self.react_full_fill(working, shadow, plan, idx, side, fill.received)?;
        } else {
            self.react_partial_fill(working, shadow, plan, idx, side, remaining, fill.received)?;
        }
        Ok(())
    }

    /// Full consumption: the filled slot joins the spread window and
    /// the proceeds fund a replacement in the placeholder just across
    /// it on the opposite side. When the opposite side is already at
    /// its order cap, the rotation pairs in a cancel of that side's
    /// far edge, sliding the whole window with the market.
    fn react_full_fill(
        &self,
        working: &mut WorkingGrid,
        shadow: &mut Ledger,
        plan: &mut Plan,
        idx: usize,
        side: Side,
        proceeds: Amount,
    ) -> Result<()> {
        working.update(idx, |r| r.release(OrderRole::Spread))?;
        let opposite = side.opposite();

        let size = proceeds;
        if size < self.min_units(opposite).saturating_mul(2) {
            debug!(
                "fill proceeds {} below double-dust on {}; banked as cache",
                size,
                opposite.as_str()
            );
            shadow.add_cache(opposite, size);
            return Ok(());
        }

        let dst = match opposite {
            Side::Sell => working.view().spread_above(idx),
            Side::Buy => working.view().spread_below(idx),
        };
        let Some(dst) = dst.filter(|_| shadow.available(opposite) >= size) else {
            debug!(
                "no fundable placeholder on {}; proceeds cached",
                opposite.as_str()
            );
            shadow.add_cache(opposite, size);
            return Ok(());
        };

        let price = working.view().slot(dst)?.price;
        working.update(dst, |r| {
            r.role = OrderRole::of(opposite);
            r.size = size;
            r.original_size = size;
        })?;
        plan.add_required(opposite, size);

        // the replacement may land inside the old gap; the boundary
        // follows it in the same commit as the role patch
        let boundary = working.effective_boundary();
        match opposite {
            Side::Sell if dst < boundary => working.set_pending_boundary(dst),
            Side::Buy if dst >= boundary => working.set_pending_boundary(dst + 1),
            _ => {}
        }

        // cap overflow: pair a cancel of the growing side's far edge
        // into the rotation, the freed capital becoming surplus
        let cap = *self.cfg.active_orders.get(opposite) as usize;
        let over_cap = working.view().live_count(opposite) >= cap.max(1);
        let src = if over_cap {
            working.view().edge_live(opposite)
        } else {
            None
        };
        match src {
            Some(src_idx) => {
                let src_rec = working.view().slot(src_idx)?.clone();
                shadow.unlock(opposite, src_rec.size);
                shadow.add_cache(opposite, src_rec.size);
                let role = src_rec.role;
                working.update(src_idx, |r| r.release(role))?;
                plan.push(Action::Rotate {
                    src: src_idx,
                    dst,
                    order_id: src_rec.chain_order_id,
                    price,
                    size,
                });
            }
            None => {
                plan.push(Action::Rotate {
                    src: idx,
                    dst,
                    order_id: None,
                    price,
                    size,
                });
            }
        }
        Ok(())
    }

    /// Partial execution: substantial remainders anchor in place with
    /// the proceeds banked for later placements; dust remainders merge
    /// into an adjacent same-role slot.
    fn react_partial_fill(
        &self,
        working: &mut WorkingGrid,
        shadow: &mut Ledger,
        plan: &mut Plan,
        idx: usize,
        side: Side,
        remaining: Amount,
        proceeds: Amount,
    ) -> Result<()> {
        let rec = working.view().slot(idx)?.clone();
        let original = rec.original_size.max(rec.size);
        let dust_floor =
            (original as u128 * self.cfg.dust_threshold_bps() as u128 / 10_000) as Amount;

        if remaining >= dust_floor {
            let price = rec.price;
            working.update(idx, |r| {
                r.mark_partial(
                    remaining,
                    crate::grid::RawOnChain {
                        for_sale: remaining,
                        to_receive: match side {
                            Side::Sell => price.quote_amount(remaining),
                            Side::Buy => price.base_amount(remaining),
                        },
                    },
                )
            })?;
            shadow.add_cache(side.opposite(), proceeds);
            return Ok(());
        }

        // dust: absorb the remainder into a neighbour instead of
        // leaving a tiny order resting
        let merge_target = self.dust_merge_target(working.view(), idx, side, remaining);
        match merge_target {
            Some(MergeTarget::Live(target)) => {
                let target_rec = working.view().slot(target)?.clone();
                let order_id = rec.chain_order_id.clone().unwrap_or_default();
                plan.push(Action::Cancel {
                    slot: idx,
                    order_id,
                });
                shadow.unlock(side, remaining);
                let merged = target_rec.size + remaining;
                plan.push(Action::Update {
                    slot: target,
                    order_id: target_rec.chain_order_id.clone().unwrap_or_default(),
                    new_price: None,
                    new_size: merged,
                });
                plan.add_required(side, remaining);
                working.update(target, |r| {
                    r.size = merged;
                    if r.size >= r.original_size {
                        r.original_size = r.size;
                        r.state = OrderState::Active;
                    }
                })?;
                working.update(idx, |r| r.release(OrderRole::Spread))?;
            }
            Some(MergeTarget::Placeholder(target)) => {
                let order_id = rec.chain_order_id.clone().unwrap_or_default();
                shadow.unlock(side, remaining);
                let price = working.view().slot(target)?.price;
                working.update(target, |r| {
                    r.role = OrderRole::of(side);
                    r.size = remaining;
                    r.original_size = remaining;
                })?;
                working.update(idx, |r| r.release(OrderRole::Spread))?;
                plan.push(Action::Rotate {
                    src: idx,
                    dst: target,
                    order_id: Some(order_id),
                    price,
                    size: remaining,
                });
            }
            None => {
                // nothing to merge into; the dust order stays resting
                let price = rec.price;
                working.update(idx, |r| {
                    r.mark_partial(
                        remaining,
                        crate::grid::RawOnChain {
                            for_sale: remaining,
                            to_receive: match side {
                                Side::Sell => price.quote_amount(remaining),
                                Side::Buy => price.base_amount(remaining),
                            },
                        },
                    )
                })?;
            }
        }
        shadow.add_cache(side.opposite(), proceeds);
        Ok(())
    }

    /// Neighbour the dust remainder merges into. A spread placeholder
    /// qualifies only when the merged size clears the economic minimum;
    /// otherwise the next live same-role slot takes it.
    fn dust_merge_target(
        &self,
        grid: &Grid,
        idx: usize,
        side: Side,
        remaining: Amount,
    ) -> Option<MergeTarget> {
        let role = OrderRole::of(side);
        let neighbours: Vec<usize> = match side {
            // walk away from the boundary first, staying on-side
            Side::Buy => (0..idx).rev().chain(idx + 1..grid.len()).collect(),
            Side::Sell => (idx + 1..grid.len()).chain((0..idx).rev()).collect(),
        };
        let mut fallback = None;
        for n in neighbours {
            let rec = grid.slot(n).ok()?;
            if rec.role == role && rec.is_live() {
                return Some(MergeTarget::Live(n));
            }
            if rec.role == OrderRole::Spread
                && grid.side_of_index(n) == side
                && remaining >= self.min_units(side)
                && fallback.is_none()
            {
                fallback = Some(MergeTarget::Placeholder(n));
            }
        }
        fallback
    }

    /// Compare live sizes to the geometric ideal; when the RMS relative
    /// deviation exceeds the configured threshold, resize every slot
    /// that is off by more than the double-dust floor.
    pub fn plan_divergence(&self, master: &Grid, ledger: &Ledger) -> Result<Option<PlanOutcome>> {
        let mut working = WorkingGrid::fork(master);
        let mut shadow = ledger.snapshot();
        let mut plan = Plan::new();
        shadow.pause();

        let threshold_bps = (self.cfg.divergence_threshold_percent * 100.0).round() as u64;
        for side in [Side::Buy, Side::Sell] {
            let live = live_by_distance(master, side);
            if live.is_empty() {
                continue;
            }
            let budget = self.ideal_budget(ledger, side);
            let (ideals, _) = sizing::allocate(budget, live.len(), self.cfg.weight_ratio_bps(side));

            if rms_deviation_bps(master, &live, &ideals) <= threshold_bps {
                continue;
            }

            let floor = self.min_units(side).saturating_mul(2);
            for (rank, &slot) in live.iter().enumerate() {
                let rec = master.slot(slot)?.clone();
                let ideal = ideals[rank];
                if ideal.abs_diff(rec.size) < floor {
                    continue;
                }
                if ideal < floor {
                    // shrinking below double-dust: plain cancel, the
                    // freed capital goes to cache
                    plan.push(Action::Cancel {
                        slot,
                        order_id: rec.chain_order_id.clone().unwrap_or_default(),
                    });
                    shadow.unlock(side, rec.size);
                    shadow.add_cache(side, rec.size);
                    let role = rec.role;
                    working.update(slot, |r| r.release(role))?;
                    continue;
                }
                let growth = ideal.saturating_sub(rec.size);
                if growth > 0 {
                    let from_cache = growth.min(shadow.cache(side));
                    if shadow.available(side).saturating_add(from_cache) < growth {
                        continue; // cannot fund this resize yet
                    }
                    shadow.deduct_cache(side, from_cache);
                    plan.add_required(side, growth);
                }
                shadow.unlock(side, rec.size);
                let price = rec.price;
                working.update(slot, |r| {
                    r.release(r.role);
                    r.size = ideal;
                    r.original_size = ideal;
                })?;
                plan.push(Action::Rotate {
                    src: slot,
                    dst: slot,
                    order_id: rec.chain_order_id.clone(),
                    price,
                    size: ideal,
                });
            }
        }

        plan.op_fees = plan.op_count() as Amount * self.creation_fee;
        shadow.resume(working.view())?;
        let outcome = PlanOutcome {
            plan,
            working,
            shadow,
        };
        Ok(if outcome.is_noop() { None } else { Some(outcome) })
    }

    /// When the live spread is wider than the target plus tolerance,
    /// tighten it with exactly one action to avoid cascades.
    pub fn plan_spread_correction(
        &self,
        master: &Grid,
        ledger: &Ledger,
    ) -> Result<Option<PlanOutcome>> {
        if self.cfg.active_orders.buy == 0 && self.cfg.active_orders.sell == 0 {
            return Ok(None);
        }
        let (Some(best_buy), Some(best_sell)) =
            (master.best_live(Side::Buy), master.best_live(Side::Sell))
        else {
            return Ok(None);
        };
        let buy_price = master.slot(best_buy)?.price;
        let sell_price = master.slot(best_sell)?.price;
        let spread_bps = sell_price.diff_bps(&buy_price);
        let target = self.cfg.target_spread_bps();
        let threshold =
            target + (target as f64 * self.cfg.spread_tolerance_steps).round() as u64;
        if spread_bps <= threshold {
            return Ok(None);
        }

        // act on the side whose edge drifted farther from the boundary
        let boundary_price = master
            .slot(master.boundary_idx.min(master.len() - 1))?
            .price;
        let side = if boundary_price.diff_bps(&buy_price) >= sell_price.diff_bps(&boundary_price) {
            Side::Buy
        } else {
            Side::Sell
        };

        let mut working = WorkingGrid::fork(master);
        let mut shadow = ledger.snapshot();
        let mut plan = Plan::new();
        shadow.pause();

        let best = master.best_live(side).expect("side has a live order");
        let best_rec = master.slot(best)?.clone();
        if best_rec.state == OrderState::Partial && best_rec.original_size > best_rec.size {
            // restore the eroded edge order to its original size
            let growth = best_rec.original_size - best_rec.size;
            let from_cache = growth.min(shadow.cache(side));
            if shadow.available(side).saturating_add(from_cache) >= growth {
                shadow.deduct_cache(side, from_cache);
                plan.push(Action::Update {
                    slot: best,
                    order_id: best_rec.chain_order_id.clone().unwrap_or_default(),
                    new_price: None,
                    new_size: best_rec.original_size,
                });
                plan.add_required(side, growth);
                working.update(best, |r| {
                    r.size = r.original_size;
                    r.state = OrderState::Active;
                })?;
            }
        } else if let Some(gap) = master.spread_slot(side) {
            // activate one placeholder at the edge
            let n = master.live_count(side) + 1;
            let budget = self.placement_budget(ledger, side);
            let (ideals, _) = sizing::allocate(budget, n, self.cfg.weight_ratio_bps(side));
            let size = ideals[0];
            if size >= self.min_units(side)
                && master.live_count(side) < *self.cfg.active_orders.get(side) as usize
            {
                let from_cache = size.min(shadow.cache(side));
                shadow.deduct_cache(side, from_cache);
                let price = master.slot(gap)?.price;
                working.update(gap, |r| {
                    r.role = OrderRole::of(side);
                    r.size = size;
                    r.original_size = size;
                })?;
                plan.push(Action::Create {
                    slot: gap,
                    price,
                    size,
                });
                plan.add_required(side, size);
            }
        }

        plan.op_fees = plan.op_count() as Amount * self.creation_fee;
        shadow.resume(working.view())?;
        debug_assert!(plan.len() <= 1, "spread correction emits at most one action");
        let outcome = PlanOutcome {
            plan,
            working,
            shadow,
        };
        Ok(if outcome.is_noop() { None } else { Some(outcome) })
    }

    /// Move the boundary at most one slot toward the side holding the
    /// heavier free balance, never across a live order. Produces role
    /// patches plus a pending boundary; there is nothing to broadcast.
    pub fn plan_boundary_sync(
        &self,
        master: &Grid,
        ledger: &Ledger,
    ) -> Result<Option<PlanOutcome>> {
        let boundary = master.boundary_idx;
        if boundary == 0 || boundary >= master.len() {
            return Ok(None);
        }
        let boundary_price = master.slot(boundary)?.price;

        // value both free balances in quote units at the boundary price
        let buy_value = ledger.side(Side::Buy).chain_free as u128;
        let sell_value =
            boundary_price.quote_amount(ledger.side(Side::Sell).chain_free) as u128;
        let step = self.cfg.increment_bps() as u128;

        let (toward, new_boundary) = if buy_value * 10_000 > sell_value * (10_000 + step) {
            (Side::Buy, boundary + 1)
        } else if sell_value * 10_000 > buy_value * (10_000 + step) {
            (Side::Sell, boundary - 1)
        } else {
            return Ok(None);
        };

        // clamp: the slot changing sides must not carry a live order
        let crossing = match toward {
            Side::Buy => boundary,
            Side::Sell => boundary - 1,
        };
        if master.slot(crossing)?.is_live() {
            debug!("boundary shift toward {} clamped at live slot {crossing}", toward.as_str());
            return Ok(None);
        }

        let mut working = WorkingGrid::fork(master);
        let shadow = ledger.snapshot();
        working.update(crossing, |r| {
            if r.role != OrderRole::Spread {
                r.release(OrderRole::Spread);
            }
        })?;
        working.set_pending_boundary(new_boundary);
        Ok(Some(PlanOutcome {
            plan: Plan::new(),
            working,
            shadow,
        }))
    }

    /// Full teardown: cancel every live order. The caller rebuilds the
    /// grid and reruns startup reconciliation afterwards.
    pub fn plan_reset(&self, master: &Grid, ledger: &Ledger) -> Result<PlanOutcome> {
        let mut working = WorkingGrid::fork(master);
        let mut shadow = ledger.snapshot();
        let mut plan = Plan::new();
        shadow.pause();

        for rec in master.slots.iter().filter(|r| r.is_live()) {
            let side = rec.role.committed_side().expect("live slots have a side");
            plan.push(Action::Cancel {
                slot: rec.slot,
                order_id: rec.chain_order_id.clone().unwrap_or_default(),
            });
            shadow.unlock(side, rec.size);
            let role = rec.role;
            working.update(rec.slot, |r| r.release(role))?;
        }

        plan.op_fees = plan.op_count() as Amount * self.creation_fee;
        shadow.resume(working.view())?;
        Ok(PlanOutcome {
            plan,
            working,
            shadow,
        })
    }
}

enum MergeTarget {
    Live(usize),
    Placeholder(usize),
}

/// Live slots on a side ordered by distance from the boundary.
fn live_by_distance(grid: &Grid, side: Side) -> Vec<usize> {
    let mut slots: Vec<usize> = grid
        .slots
        .iter()
        .filter(|r| r.is_live() && r.role.committed_side() == Some(side))
        .map(|r| r.slot)
        .collect();
    match side {
        Side::Buy => slots.sort_by_key(|&i| std::cmp::Reverse(i)),
        Side::Sell => slots.sort(),
    }
    slots
}

/// RMS of the per-slot relative deviation from ideal, in basis points.
fn rms_deviation_bps(grid: &Grid, slots: &[usize], ideals: &[Amount]) -> u64 {
    let mut sum_sq: u128 = 0;
    let mut n: u128 = 0;
    for (rank, &slot) in slots.iter().enumerate() {
        let ideal = ideals[rank];
        if ideal == 0 {
            continue;
        }
        let current = grid.slots[slot].size;
        let dev = ideal.abs_diff(current) as u128 * 10_000 / ideal as u128;
        sum_sq += dev * dev;
        n += 1;
    }
    if n == 0 {
        return 0;
    }
    isqrt(sum_sq / n) as u64
}

fn isqrt(v: u128) -> u128 {
    if v < 2 {
        return v;
    }
    let mut x = v;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + v / x) / 2;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::grid::master::tests::{test_grid, test_precision};
    use crate::grid::{FillEvent, RawOnChain};

    fn planner() -> Planner {
        Planner::new(test_config(), test_precision(), 0)
    }

    /// Master with three live orders per side hugging the boundary and
    /// a funded ledger that matches what the chain would report.
    fn seeded() -> (Grid, Ledger) {
        let mut grid = test_grid();
        let boundary = grid.boundary_idx;
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
        assert!(boundary > last_buy && boundary <= first_sell);

        let mut oid = 100;
        for idx in (last_buy - 2)..=last_buy {
            let price = grid.slots[idx].price;
            let size = price.quote_amount(10_000); // one A-unit of quote
            grid.slots[idx].size = size;
            grid.slots[idx].mark_active(
                format!("1.7.{oid}"),
                RawOnChain {
                    for_sale: size,
                    to_receive: 10_000,
                },
            );
            oid += 1;
        }
        for idx in first_sell..first_sell + 3 {
            let size = 10_000;
            grid.slots[idx].size = size;
            let quote = grid.slots[idx].price.quote_amount(size);
            grid.slots[idx].mark_active(
                format!("1.7.{oid}"),
                RawOnChain {
                    for_sale: size,
                    to_receive: quote,
                },
            );
            oid += 1;
        }
        grid.rebuild_index();
        grid.validate().unwrap();

        let buy_committed = grid.committed(Side::Buy);
        let mut ledger = Ledger::new(test_precision(), None, 0);
        ledger
            .set_chain_totals(buy_committed, 0, 30_000, 0)
            .unwrap();
        ledger.recalculate(&grid).unwrap();
        (grid, ledger)
    }

    fn full_fill_of(grid: &Grid, slot: usize) -> FillEvent {
        let rec = &grid.slots[slot];
        let side = rec.role.committed_side().unwrap();
        let received = match side {
            Side::Buy => rec.price.base_amount(rec.size),
            Side::Sell => rec.price.quote_amount(rec.size),
        };
        FillEvent {
            order_id: rec.chain_order_id.clone().unwrap(),
            block_num: 5_000,
            history_id: 1,
            paid: rec.size,
            received,
            fee: 0,
            is_maker: true,
        }
    }

    #[test]
    fn test_full_fill_rotates_into_opposite_spread() {
        let (grid, ledger) = seeded();
        let best_buy = grid.best_live(Side::Buy).unwrap();
        let fill = full_fill_of(&grid, best_buy);

        let outcome = planner().plan_fills(&grid, &ledger, &[fill.clone().into()]).unwrap();
        assert_eq!(outcome.plan.len(), 1);
        let (src, dst, size) = match &outcome.plan.actions[0] {
            Action::Rotate { src, dst, size, order_id, .. } => {
                // the sell side sat at its cap, so the far sell edge is
                // the paired cancel
                assert_eq!(*src, grid.edge_live(Side::Sell).unwrap());
                assert!(order_id.is_some());
                (*src, *dst, *size)
            }
            other => panic!("expected rotate, got {other:?}"),
        };
        // replacement sits in the gap just above the filled buy
        assert!(dst > best_buy);
        assert_eq!(grid.slots[dst].role, OrderRole::Spread);
        assert_eq!(size, fill.received);

        let view = outcome.working.view();
        // filled slot and cancelled edge are placeholders again
        assert_eq!(view.slots[best_buy].role, OrderRole::Spread);
        assert!(!view.slots[src].is_live());
        // the boundary follows the replacement in the same commit
        match outcome.working.pending_boundary() {
            Some(b) => assert!(b <= dst && grid.boundary_idx.abs_diff(b) <= grid.gap_slots),
            None => assert!(dst >= grid.boundary_idx),
        }
        // proceeds plus the cancelled edge both land on the sell side
        let freed = grid.slots[src].size;
        assert_eq!(
            outcome.shadow.side(Side::Sell).chain_free,
            ledger.side(Side::Sell).chain_free + fill.received + freed
        );
        assert_eq!(outcome.shadow.cache(Side::Sell), freed);

        // committing the outcome yields a structurally valid master
        let mut master = grid.clone();
        outcome.working.commit(&mut master).unwrap();
        assert!(master.validate().is_ok());
    }

    #[test]
    fn test_fill_for_unknown_order_is_ignored() {
        let (grid, ledger) = seeded();
        let fill = FillEvent {
            order_id: "1.7.9999".into(),
            block_num: 1,
            history_id: 1,
            paid: 10,
            received: 10,
            fee: 0,
            is_maker: false,
        };
        let outcome = planner().plan_fills(&grid, &ledger, &[fill.into()]).unwrap();
        assert!(outcome.plan.is_empty());
    }

    #[test]
    fn test_substantial_partial_anchors_in_place() {
        let (grid, ledger) = seeded();
        let best_sell = grid.best_live(Side::Sell).unwrap();
        let rec = grid.slots[best_sell].clone();
        // 40% filled leaves 60%: far above the 5% dust threshold
        let paid = rec.size * 2 / 5;
        let fill = FillEvent {
            order_id: rec.chain_order_id.clone().unwrap(),
            block_num: 5_001,
            history_id: 2,
            paid,
            received: rec.price.quote_amount(paid),
            fee: 0,
            is_maker: true,
        };
        let outcome = planner().plan_fills(&grid, &ledger, &[fill.into()]).unwrap();
        assert!(outcome.plan.is_empty());
        let view = outcome.working.view();
        assert_eq!(view.slots[best_sell].state, OrderState::Partial);
        assert_eq!(view.slots[best_sell].size, rec.size - paid);
    }

    #[test]
    fn test_dust_partial_merges_into_adjacent_slot() {
        let (grid, ledger) = seeded();
        let best_sell = grid.best_live(Side::Sell).unwrap();
        let rec = grid.slots[best_sell].clone();
        // 97% filled leaves 3%: below the 5% dust threshold
        let remaining = rec.size * 3 / 100;
        let paid = rec.size - remaining;
        let fill = FillEvent {
            order_id: rec.chain_order_id.clone().unwrap(),
            block_num: 5_002,
            history_id: 3,
            paid,
            received: rec.price.quote_amount(paid),
            fee: 0,
            is_maker: true,
        };
        let outcome = planner().plan_fills(&grid, &ledger, &[fill.into()]).unwrap();
        // cancel of the dust order + update growing a live neighbour
        let cancel = outcome
            .plan
            .actions
            .iter()
            .find(|a| matches!(a, Action::Cancel { .. }));
        let update = outcome.plan.actions.iter().find_map(|a| match a {
            Action::Update { slot, new_size, .. } => Some((*slot, *new_size)),
            _ => None,
        });
        assert!(cancel.is_some());
        let (target, new_size) = update.expect("dust merge emits an update");
        assert_eq!(grid.slots[target].role, OrderRole::Sell);
        assert_eq!(new_size, grid.slots[target].size + remaining);
        // the absorbed slot is free again
        assert_eq!(
            outcome.working.view().slots[best_sell].role,
            OrderRole::Spread
        );
    }

    #[test]
    fn test_divergence_below_threshold_is_noop() {
        let (grid, mut ledger) = seeded();
        // sizes *are* the flat ideal when budget == committed
        ledger.recalculate(&grid).unwrap();
        let outcome = planner().plan_divergence(&grid, &ledger).unwrap();
        // small quantization wobble stays under the double-dust floor
        assert!(outcome.is_none() || outcome.unwrap().plan.is_empty());
    }

    #[test]
    fn test_divergence_resizes_skewed_slots() {
        let (mut grid, mut ledger) = seeded();
        // skew one sell far off ideal
        let slot = grid.best_live(Side::Sell).unwrap();
        grid.slots[slot].size = 40_000;
        grid.slots[slot].original_size = 40_000;
        let committed = grid.committed(Side::Sell);
        ledger
            .set_chain_totals(grid.committed(Side::Buy), 0, committed, 0)
            .unwrap();
        ledger.recalculate(&grid).unwrap();

        let outcome = planner()
            .plan_divergence(&grid, &ledger)
            .unwrap()
            .expect("skew beyond threshold");
        assert!(outcome
            .plan
            .actions
            .iter()
            .any(|a| matches!(a, Action::Rotate { src, dst, .. } if src == dst)));
    }

    #[test]
    fn test_spread_correction_single_action() {
        let (mut grid, mut ledger) = seeded();
        // the two lowest sells disappear, leaving a ~2.5% hole
        let mut freed = 0;
        for _ in 0..2 {
            let best_sell = grid.best_live(Side::Sell).unwrap();
            freed += grid.slots[best_sell].size;
            grid.slots[best_sell].release(OrderRole::Spread);
        }
        grid.rebuild_index();
        let committed = grid.committed(Side::Sell);
        ledger
            .set_chain_totals(grid.committed(Side::Buy), 0, committed + freed, freed)
            .unwrap();
        ledger.recalculate(&grid).unwrap();

        let outcome = planner()
            .plan_spread_correction(&grid, &ledger)
            .unwrap()
            .expect("spread beyond tolerance");
        assert_eq!(outcome.plan.len(), 1);
        assert!(matches!(
            outcome.plan.actions[0],
            Action::Create { .. } | Action::Update { .. }
        ));
    }

    #[test]
    fn test_spread_check_silent_with_zero_caps() {
        let (grid, ledger) = seeded();
        let mut cfg = test_config();
        cfg.active_orders = crate::asset::SidePair::new(0, 0);
        let planner = Planner::new(cfg, test_precision(), 0);
        assert!(planner.plan_spread_correction(&grid, &ledger).unwrap().is_none());
    }

    #[test]
    fn test_boundary_shift_clamped_at_live_slot() {
        let (grid, mut ledger) = seeded();
        // sell side much heavier in free funds; shift toward sell would
        // cross slot boundary-1 only if it is not live
        ledger
            .set_chain_totals(grid.committed(Side::Buy), 0, 1_030_000, 1_000_000)
            .unwrap();
        ledger.recalculate(&grid).unwrap();
        let outcome = planner().plan_boundary_sync(&grid, &ledger).unwrap();
        if let Some(o) = &outcome {
            let crossing = grid.boundary_idx - 1;
            assert!(!grid.slots[crossing].is_live());
            assert_eq!(o.working.pending_boundary(), Some(grid.boundary_idx - 1));
        }
    }

    #[test]
    fn test_reset_cancels_everything() {
        let (grid, ledger) = seeded();
        let outcome = planner().plan_reset(&grid, &ledger).unwrap();
        assert_eq!(
            outcome.plan.len(),
            grid.live_count(Side::Buy) + grid.live_count(Side::Sell)
        );
        assert!(outcome
            .plan
            .actions
            .iter()
            .all(|a| matches!(a, Action::Cancel { .. })));
        let view = outcome.working.view();
        assert_eq!(view.live_count(Side::Buy), 0);
        assert_eq!(view.live_count(Side::Sell), 0);
    }

    #[test]
    fn test_planner_respects_available_funds() {
        // property 7 at the planner level: staged creations never
        // exceed what the shadow could fund
        let (grid, ledger) = seeded();
        let best_buy = grid.best_live(Side::Buy).unwrap();
        let fill = full_fill_of(&grid, best_buy);
        let outcome = planner().plan_fills(&grid, &ledger, &[fill.into()]).unwrap();
        for side in [Side::Buy, Side::Sell] {
            let staged = outcome.plan.staged_creates(outcome.working.view(), side);
            let required = outcome.plan.required_funds(side);
            let spendable = outcome.shadow.headroom(side) + staged as i128;
            assert!(
                required as i128 <= spendable,
                "side {side:?}: required {required} exceeds spendable {spendable}"
            );
            assert!(outcome.shadow.headroom(side) >= 0, "side {side:?} over-reserved");
        }
    }

    #[test]
    fn test_isqrt() {
        assert_eq!(isqrt(0), 0);
        assert_eq!(isqrt(1), 1);
        assert_eq!(isqrt(15), 3);
        assert_eq!(isqrt(16), 4);
        assert_eq!(isqrt(10_000), 100);
    }

    #[test]
    fn test_live_by_distance_ordering() {
        let (grid, _) = seeded();
        let buys = live_by_distance(&grid, Side::Buy);
        let sells = live_by_distance(&grid, Side::Sell);
        // index 0 is nearest the boundary on both sides
        assert!(buys[0] > buys[1]);
        assert!(sells[0] < sells[1]);
    }
}
