//! Chain reconciliation
//!
//! Brings internal state into agreement with the chain: on startup, on
//! a periodic timer, after batch failures, and on request. The chain
//! is always the authority; the reconciler's job is to adopt what it
//! finds, credit offline fills exactly once, and flag drift rather
//! than paper over it.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use crate::asset::{PairPrecision, Side};
use crate::chain::{AccountTotals, AssetFees, ChainAdapter, OpenOrder, PriceMode};
use crate::config::{BotConfig, StartPrice};
use crate::errors::{Error, Result};
use crate::grid::{Grid, OrderRole, OrderState, RawOnChain};
use crate::ledger::Ledger;
use crate::persist::PersistedState;
use crate::planner::Action;

/// How long executor-reported stale ids block duplicate fill credit.
const STALE_CLEANED_TTL_MS: u64 = 3_600_000;

/// Result of one startup reconciliation attempt.
pub struct Bootstrap {
    pub grid: Grid,
    pub ledger: Ledger,
    /// Fill dedup map carried over from disk plus orphan credits.
    pub processed_fills: HashMap<String, u64>,
    /// Unrecognized chain orders to cancel in the first batch.
    pub cancels: Vec<String>,
    /// Size/price alignment updates for adjacent-slot adoptions.
    pub align_updates: Vec<Action>,
    /// Fee schedule of the pair, fetched fresh.
    pub fees: AssetFees,
    pub fee_side: Option<Side>,
    /// Committed sums disagreed with the chain beyond tolerance.
    pub drift_detected: bool,
}

/// Price corrections produced by a periodic pass.
pub struct Resync {
    pub totals: AccountTotals,
    pub corrections: Vec<Action>,
    /// Caller should run a divergence check after applying totals.
    pub divergence_due: bool,
}

/// Reconciliation engine for one worker.
pub struct Reconciler {
    cfg: BotConfig,
    prec: PairPrecision,
    /// Order ids already settled through the stale-order path, with
    /// first-seen stamps; blocks orphan double credit.
    stale_cleaned: HashMap<String, u64>,
}

impl Reconciler {
    pub fn new(cfg: BotConfig, prec: PairPrecision) -> Self {
        Self {
            cfg,
            prec,
            stale_cleaned: HashMap::new(),
        }
    }

    /// Remember ids the executor reported stale so a delayed orphan
    /// fill cannot credit them a second time.
    pub fn mark_stale_cleaned(&mut self, ids: impl IntoIterator<Item = String>, now_ms: u64) {
        for id in ids {
            self.stale_cleaned.entry(id).or_insert(now_ms);
        }
    }

    pub fn is_stale_cleaned(&self, order_id: &str) -> bool {
        self.stale_cleaned.contains_key(order_id)
    }

    pub fn prune_stale_cleaned(&mut self, now_ms: u64) {
        self.stale_cleaned
            .retain(|_, &mut seen| now_ms.saturating_sub(seen) < STALE_CLEANED_TTL_MS);
    }

    fn price_mode(&self) -> PriceMode {
        match &self.cfg.start_price {
            StartPrice::Fixed(p) => PriceMode::Fixed(*p),
            StartPrice::Mode(m) => match m.as_str() {
                "pool" => PriceMode::Pool,
                "orderbook" => PriceMode::Orderbook,
                _ => PriceMode::Market,
            },
        }
    }

    /// Half a grid step: the price tolerance for exact slot matches.
    fn exact_tol_bps(&self) -> u64 {
        (self.cfg.increment_bps() / 2).max(1) as u64
    }

    /// One and a half steps: the limit for adjacent-slot adoption.
    fn adjacent_tol_bps(&self) -> u64 {
        self.exact_tol_bps() * 3
    }

    /// One startup reconciliation pass. The worker retries this up to
    /// `maxRecoveryAttempts` with the configured interval in between;
    /// no orders are planned until a pass succeeds.
    pub async fn bootstrap(
        &mut self,
        chain: &dyn ChainAdapter,
        persisted: Option<&PersistedState>,
        session_id: u64,
        now_ms: u64,
    ) -> Result<Bootstrap> {
        // fee schedule and fee side, fetched before anything else
        let fees_a = chain
            .asset_fees(&self.cfg.asset_a, 0, true)
            .await
            .map_err(chain_err)?;
        let fees_b = chain
            .asset_fees(&self.cfg.asset_b, 0, true)
            .await
            .map_err(chain_err)?;
        let (fees, fee_side) = if fees_a.is_fee_asset {
            (fees_a, Some(Side::Sell))
        } else if fees_b.is_fee_asset {
            (fees_b, Some(Side::Buy))
        } else {
            (fees_b, None)
        };

        let mut processed_fills = persisted
            .map(|p| p.processed_fills.clone())
            .unwrap_or_default();

        // start from the persisted grid when there is one, otherwise
        // build fresh from the reference price
        let mut grid = match persisted {
            Some(p) => {
                let (grid, _) = p.restore(self.prec);
                info!(
                    "restored grid: {} slots, generation {}, session {}",
                    grid.len(),
                    grid.generation,
                    grid.session_id
                );
                grid
            }
            None => {
                let reference = chain
                    .reference_price(&self.price_mode())
                    .await
                    .map_err(chain_err)?;
                Grid::build(&self.cfg, self.prec, reference, session_id, now_ms)?
            }
        };

        let totals = chain.account_totals().await.map_err(chain_err)?;
        let open_orders = chain.open_orders().await.map_err(chain_err)?;
        let history = chain.fill_history(0).await.map_err(chain_err)?;

        let mut cancels = Vec::new();
        let mut align_updates = Vec::new();
        let open_ids: HashSet<&str> = open_orders.iter().map(|o| o.order_id.as_str()).collect();

        // pass 1: grid records whose order vanished from the book are
        // fully filled; credit their proceeds from history exactly once
        for idx in 0..grid.len() {
            let rec = grid.slots[idx].clone();
            let Some(order_id) = rec.chain_order_id.clone() else {
                continue;
            };
            if open_ids.contains(order_id.as_str()) {
                continue;
            }
            let already_cleaned = self.is_stale_cleaned(&order_id);
            let mut credited = 0usize;
            for fill in history.iter().filter(|f| f.order_id == order_id) {
                let key = fill.key();
                if already_cleaned || processed_fills.contains_key(&key) {
                    continue;
                }
                processed_fills.insert(key, now_ms);
                credited += 1;
            }
            info!(
                "order {order_id} (slot {idx}) filled while offline; {credited} fills recorded"
            );
            // the freed slot joins the spread window
            grid.slots[idx].release(OrderRole::Spread);
        }
        grid.rebuild_index();

        // pass 2: classify every order resting on chain
        for order in &open_orders {
            let order_id = order.order_id.as_str();
            if let Some(idx) = grid.find_by_order_id(order_id) {
                // session-identity guard: adoption by id is always
                // safe since the id is confirmed live
                let observed = RawOnChain {
                    for_sale: order.for_sale,
                    to_receive: order.to_receive,
                };
                let rec = &mut grid.slots[idx];
                let original = rec.original_size.max(rec.size);
                if order.for_sale < original {
                    rec.mark_partial(order.for_sale, observed);
                } else {
                    rec.size = order.for_sale;
                    rec.original_size = order.for_sale;
                    rec.state = OrderState::Active;
                    rec.raw_on_chain = Some(observed);
                }
                rec.session_id = session_id;
                continue;
            }

            match self.match_free_slot(&grid, order) {
                SlotMatch::Exact(idx) => {
                    self.adopt(&mut grid, idx, order, session_id, now_ms);
                }
                SlotMatch::Adjacent(idx) => {
                    self.adopt(&mut grid, idx, order, session_id, now_ms);
                    // nudge the adopted order onto the ladder price
                    align_updates.push(Action::Update {
                        slot: idx,
                        order_id: order.order_id.clone(),
                        new_price: Some(grid.slots[idx].price),
                        new_size: order.for_sale,
                    });
                }
                SlotMatch::None => {
                    warn!(
                        "unrecognized chain order {} ({} for sale); scheduling cancel",
                        order.order_id, order.for_sale
                    );
                    cancels.push(order.order_id.clone());
                }
            }
        }

        grid.rebuild_index();

        grid.session_id = session_id;
        grid.validate()?;

        // ledger from the fresh snapshot; the chain is the authority
        let mut ledger = Ledger::new(self.prec, fee_side, 0);
        ledger.fee_reservation =
            fees.creation_fee * self.cfg.fee_reservation_multiplier as crate::asset::Amount;
        if let Some(p) = persisted {
            ledger.buy.cache_funds = p.cache_funds.buy;
            ledger.sell.cache_funds = p.cache_funds.sell;
            ledger.fees_owed = p.fees_owed;
        }
        ledger.set_chain_totals(
            totals.buy_total,
            totals.buy_free,
            totals.sell_total,
            totals.sell_free,
        )?;

        // drift check: committed per the grid vs committed per chain
        let mut drift_detected = false;
        for side in [Side::Buy, Side::Sell] {
            let adopted = grid.committed(side);
            let chain_side = ledger.side(side);
            let tol = 2.max(chain_side.chain_total / 1000);
            if adopted.abs_diff(chain_side.chain_committed) > tol {
                warn!(
                    "{} committed drift: grid {} vs chain {}; trusting chain",
                    side.as_str(),
                    adopted,
                    chain_side.chain_committed
                );
                drift_detected = true;
            }
        }

        ledger.recalculate(&grid)?;
        info!(
            "bootstrap reconciled: {} buys, {} sells, {} cancels pending, drift={}",
            grid.live_count(Side::Buy),
            grid.live_count(Side::Sell),
            cancels.len(),
            drift_detected
        );

        Ok(Bootstrap {
            grid,
            ledger,
            processed_fills,
            cancels,
            align_updates,
            fees,
            fee_side,
            drift_detected,
        })
    }

    fn adopt(
        &self,
        grid: &mut Grid,
        idx: usize,
        order: &OpenOrder,
        session_id: u64,
        now_ms: u64,
    ) {
        let side = order.side(&self.cfg.asset_a);
        let rec = &mut grid.slots[idx];
        rec.role = OrderRole::of(side);
        rec.size = order.for_sale;
        rec.original_size = order.for_sale;
        rec.state = OrderState::Active;
        rec.chain_order_id = Some(order.order_id.clone());
        rec.raw_on_chain = Some(RawOnChain {
            for_sale: order.for_sale,
            to_receive: order.to_receive,
        });
        rec.session_id = session_id;
        rec.created_at_ms = now_ms;
        debug!("adopted order {} into slot {idx}", order.order_id);
    }

    /// Find a free slot for an unmatched chain order: same side of the
    /// boundary, no live order, ladder price within tolerance.
    fn match_free_slot(&self, grid: &Grid, order: &OpenOrder) -> SlotMatch {
        let side = order.side(&self.cfg.asset_a);
        let price = order.price(&self.cfg.asset_a);
        let mut best: Option<(usize, u64)> = None;
        for rec in &grid.slots {
            if rec.is_live() || grid.side_of_index(rec.slot) != side {
                continue;
            }
            let diff = rec.price.diff_bps(&price);
            if best.map(|(_, d)| diff < d).unwrap_or(true) {
                best = Some((rec.slot, diff));
            }
        }
        match best {
            Some((idx, diff)) if diff <= self.exact_tol_bps() => SlotMatch::Exact(idx),
            Some((idx, diff)) if diff <= self.adjacent_tol_bps() => SlotMatch::Adjacent(idx),
            _ => SlotMatch::None,
        }
    }

    /// Periodic pass: fresh totals, one walk over the book emitting
    /// price corrections for drifted orders. No-op updates (within
    /// tolerance, or identical after quantization) are suppressed.
    pub async fn resync(&mut self, chain: &dyn ChainAdapter, grid: &Grid) -> Result<Resync> {
        let totals = chain.account_totals().await.map_err(chain_err)?;
        let open_orders = chain.open_orders().await.map_err(chain_err)?;

        let mut corrections = Vec::new();
        for order in &open_orders {
            let Some(idx) = grid.find_by_order_id(&order.order_id) else {
                continue;
            };
            let slot_price = grid.slots[idx].price;
            let observed = order.price(&self.cfg.asset_a);
            if observed.within_bps(&slot_price, self.exact_tol_bps()) {
                continue;
            }
            if order.for_sale == 0 {
                continue;
            }
            corrections.push(Action::Update {
                slot: idx,
                order_id: order.order_id.clone(),
                new_price: Some(slot_price),
                new_size: order.for_sale,
            });
        }
        debug!(
            "resync: {} corrections across {} open orders",
            corrections.len(),
            open_orders.len()
        );
        Ok(Resync {
            totals,
            corrections,
            divergence_due: true,
        })
    }
}

enum SlotMatch {
    Exact(usize),
    Adjacent(usize),
    None,
}

fn chain_err(err: crate::chain::ChainError) -> Error {
    match err {
        crate::chain::ChainError::Transport(msg) => Error::Transient(msg),
        crate::chain::ChainError::OrderNotFound(id) => Error::StaleOrder(id),
        crate::chain::ChainError::InsufficientFunds => Error::InsufficientFunds {
            side: Side::Buy,
            required: 0,
            available: 0,
        },
        crate::chain::ChainError::Illegal(msg) => Error::IllegalState(msg),
        crate::chain::ChainError::MissingAsset(sym) => Error::MissingPrecision(sym),
    }
}
