//! Fund accounting
//!
//! The ledger is the authoritative in-memory view of both sides'
//! funds, always in integer base units. Every commit re-verifies the
//! conservation invariants against the last chain snapshot; breaches
//! come back as recoverable or critical errors and are never silently
//! absorbed.
//!
//! Invariants, checked per side within `max(2, chain_total/1000)` base
//! units:
//!   I1  chain_total = chain_free + chain_committed
//!   I2  available <= chain_free
//!   I3  grid_committed <= chain_total

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::asset::{format_by_precision, Amount, PairPrecision, Side};
use crate::errors::{Error, Result, Severity};
use crate::grid::Grid;

/// Critical breaches start at this multiple of the tolerance.
const CRITICAL_FACTOR: Amount = 10;

/// One side's integer fund state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideLedger {
    /// Last observed chain-side total balance.
    pub chain_total: Amount,
    /// Last observed chain-side unencumbered balance.
    pub chain_free: Amount,
    /// What the chain locks in open orders; total minus free.
    pub chain_committed: Amount,
    /// Sum of live (ACTIVE + PARTIAL) grid sizes on this side.
    pub grid_committed: Amount,
    /// Sum of VIRTUAL sizes planned but not yet confirmed.
    pub virtual_committed: Amount,
    /// Fill surplus not yet spent on replacement orders.
    pub cache_funds: Amount,
    #[serde(skip)]
    pub precision: u32,
}

impl SideLedger {
    fn tolerance(&self) -> Amount {
        2.max(self.chain_total / 1000)
    }
}

/// Two-sided fund ledger with invariant verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub buy: SideLedger,
    pub sell: SideLedger,
    /// Pending native-chain fees the worker has committed to.
    pub fees_owed: Amount,
    /// Which side's asset pays chain fees, if either.
    pub fee_side: Option<Side>,
    /// Configured multiple of the creation fee held back from planning.
    pub fee_reservation: Amount,
    #[serde(skip)]
    pause_depth: u32,
    #[serde(skip)]
    needs_recalc: bool,
}

impl Ledger {
    pub fn new(precision: PairPrecision, fee_side: Option<Side>, fee_reservation: Amount) -> Self {
        Self {
            buy: SideLedger {
                precision: precision.quote,
                ..SideLedger::default()
            },
            sell: SideLedger {
                precision: precision.base,
                ..SideLedger::default()
            },
            fees_owed: 0,
            fee_side,
            fee_reservation,
            pause_depth: 0,
            needs_recalc: false,
        }
    }

    pub fn side(&self, side: Side) -> &SideLedger {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut SideLedger {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    /// Restore skip-serialized precision fields after deserialization.
    pub fn restore_precision(&mut self, precision: PairPrecision) {
        self.buy.precision = precision.quote;
        self.sell.precision = precision.base;
    }

    /// Fee charges this side's funds must hold back from planning.
    fn fee_holdback(&self, side: Side) -> Amount {
        if self.fee_side == Some(side) {
            self.fees_owed.saturating_add(self.fee_reservation)
        } else {
            0
        }
    }

    /// Funds a new plan may spend on this side.
    pub fn available(&self, side: Side) -> Amount {
        let s = self.side(side);
        s.chain_free
            .saturating_sub(s.virtual_committed)
            .saturating_sub(s.cache_funds)
            .saturating_sub(self.fee_holdback(side))
    }

    /// Signed version of `available`: negative when reservations
    /// (virtual sizes, cache, fee holdback) exceed the free balance.
    pub fn headroom(&self, side: Side) -> i128 {
        let s = self.side(side);
        s.chain_free as i128
            - s.virtual_committed as i128
            - s.cache_funds as i128
            - self.fee_holdback(side) as i128
    }

    /// Replace chain-observed fields from a fresh snapshot.
    pub fn set_chain_totals(
        &mut self,
        buy_total: Amount,
        buy_free: Amount,
        sell_total: Amount,
        sell_free: Amount,
    ) -> Result<()> {
        for (side, total, free) in [
            (Side::Buy, buy_total, buy_free),
            (Side::Sell, sell_total, sell_free),
        ] {
            if free > total {
                return Err(Error::Invariant {
                    side,
                    name: "I1",
                    magnitude: free - total,
                    severity: Severity::Critical,
                });
            }
            let s = self.side_mut(side);
            s.chain_total = total;
            s.chain_free = free;
            s.chain_committed = total - free;
        }
        debug!(
            "chain totals: buy {}/{} free, sell {}/{} free",
            format_by_precision(self.buy.chain_free, self.buy.precision),
            format_by_precision(self.buy.chain_total, self.buy.precision),
            format_by_precision(self.sell.chain_free, self.sell.precision),
            format_by_precision(self.sell.chain_total, self.sell.precision),
        );
        Ok(())
    }

    /// Recompute grid-derived sums and verify all invariants. Between
    /// `pause`/`resume` the work is deferred to the final `resume`.
    pub fn recalculate(&mut self, grid: &Grid) -> Result<()> {
        if self.pause_depth > 0 {
            self.needs_recalc = true;
            return Ok(());
        }
        for side in [Side::Buy, Side::Sell] {
            let grid_committed = grid.committed(side);
            let virtual_committed = grid.virtual_committed(side);
            let s = self.side_mut(side);
            s.grid_committed = grid_committed;
            s.virtual_committed = virtual_committed;
        }
        self.needs_recalc = false;
        self.check_invariants()
    }

    /// Reference-counted batching around multi-step mutations.
    pub fn pause(&mut self) {
        self.pause_depth += 1;
    }

    pub fn resume(&mut self, grid: &Grid) -> Result<()> {
        debug_assert!(self.pause_depth > 0, "resume without pause");
        self.pause_depth = self.pause_depth.saturating_sub(1);
        if self.pause_depth == 0 && self.needs_recalc {
            self.recalculate(grid)
        } else {
            Ok(())
        }
    }

    /// Verify I1-I3 on both sides within tolerance.
    pub fn check_invariants(&self) -> Result<()> {
        for side in [Side::Buy, Side::Sell] {
            let s = self.side(side);
            let tol = s.tolerance();

            let lhs = s.chain_total;
            let rhs = s.chain_free.saturating_add(s.chain_committed);
            self.verify(side, "I1", lhs.abs_diff(rhs), tol)?;

            let available = self.available(side);
            self.verify(side, "I2", available.saturating_sub(s.chain_free), tol)?;

            self.verify(
                side,
                "I3",
                s.grid_committed.saturating_sub(s.chain_total),
                tol,
            )?;
        }
        Ok(())
    }

    fn verify(&self, side: Side, name: &'static str, magnitude: Amount, tol: Amount) -> Result<()> {
        if magnitude <= tol {
            return Ok(());
        }
        let severity = if magnitude <= tol.saturating_mul(CRITICAL_FACTOR) {
            Severity::Recoverable
        } else {
            Severity::Critical
        };
        warn!(
            "{} invariant {} breached by {} base units ({:?})",
            side.as_str(),
            name,
            magnitude,
            severity
        );
        Err(Error::Invariant {
            side,
            name,
            magnitude,
            severity,
        })
    }

    /// Atomic check-and-subtract against a side's free balance.
    pub fn try_deduct(&mut self, side: Side, amount: Amount) -> bool {
        let s = self.side_mut(side);
        if s.chain_free < amount {
            return false;
        }
        s.chain_free -= amount;
        s.chain_total = s.chain_total.saturating_sub(amount);
        true
    }

    pub fn add_cache(&mut self, side: Side, amount: Amount) {
        self.side_mut(side).cache_funds += amount;
    }

    /// Spend from a side's cache; false without mutation if short.
    pub fn deduct_cache(&mut self, side: Side, amount: Amount) -> bool {
        let s = self.side_mut(side);
        if s.cache_funds < amount {
            return false;
        }
        s.cache_funds -= amount;
        true
    }

    pub fn cache(&self, side: Side) -> Amount {
        self.side(side).cache_funds
    }

    /// Project a confirmed creation: the chain moved `amount` from free
    /// into its open-order lock.
    pub fn lock(&mut self, side: Side, amount: Amount) -> Result<()> {
        let s = self.side_mut(side);
        if s.chain_free < amount {
            return Err(Error::Invariant {
                side,
                name: "I2",
                magnitude: amount - s.chain_free,
                severity: Severity::Critical,
            });
        }
        s.chain_free -= amount;
        s.chain_committed += amount;
        Ok(())
    }

    /// Project a confirmed cancellation: locked funds return to free.
    pub fn unlock(&mut self, side: Side, amount: Amount) {
        let s = self.side_mut(side);
        s.chain_committed = s.chain_committed.saturating_sub(amount);
        s.chain_free = s.chain_free.saturating_add(amount);
    }

    /// Apply one fill: the filled order's side gives up `outgoing` from
    /// its chain lock, the opposite side is credited `proceeds`, and
    /// the native fee asset pays `fee`. Proceeds arrive already net of
    /// the projected maker refund; nothing here re-adds it.
    pub fn apply_fill(
        &mut self,
        side: Side,
        outgoing: Amount,
        proceeds: Amount,
        fee: Amount,
        is_maker: bool,
    ) {
        {
            let s = self.side_mut(side);
            s.chain_total = s.chain_total.saturating_sub(outgoing);
            s.chain_committed = s.chain_committed.saturating_sub(outgoing);
        }
        {
            let o = self.side_mut(side.opposite());
            o.chain_total = o.chain_total.saturating_add(proceeds);
            o.chain_free = o.chain_free.saturating_add(proceeds);
        }
        if fee > 0 {
            if let Some(fee_side) = self.fee_side {
                let f = self.side_mut(fee_side);
                f.chain_total = f.chain_total.saturating_sub(fee);
                f.chain_free = f.chain_free.saturating_sub(fee);
            }
        }
        debug!(
            "fill applied: {} gave {}, credited {} ({}), fee {}",
            side.as_str(),
            outgoing,
            proceeds,
            if is_maker { "maker" } else { "taker" },
            fee
        );
    }

    /// Op lifecycle fee accrual (create/update/cancel only).
    pub fn accrue_op_fees(&mut self, amount: Amount) {
        self.fees_owed = self.fees_owed.saturating_add(amount);
    }

    /// Settle accrued fees against the fee side's free balance.
    pub fn settle_fees(&mut self) {
        let owed = self.fees_owed;
        if owed == 0 {
            return;
        }
        if let Some(side) = self.fee_side {
            if self.try_deduct(side, owed) {
                self.fees_owed = 0;
            } else {
                warn!("fee settlement deferred: {} owed exceeds free", owed);
            }
        } else {
            self.fees_owed = 0;
        }
    }

    /// Immutable copy for post-event analysis.
    pub fn snapshot(&self) -> Ledger {
        self.clone()
    }
}
