//! Plan broadcast
//!
//! The executor turns a plan into one atomic chain batch, re-verifies
//! funds before anything leaves the process, retries transient
//! transport trouble with backoff, and classifies every other failure
//! so the worker knows whether to commit, reconcile, or halt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::asset::Side;
use crate::chain::{ChainAdapter, ChainError, ChainOp, OpResult};
use crate::grid::WorkingGrid;
use crate::ledger::Ledger;
use crate::planner::{Action, Plan};

/// Interpreted outcome of one broadcast attempt.
#[derive(Debug, Clone)]
pub enum BatchResult {
    /// Chain applied the batch; per-op results in plan-op order.
    Confirmed(Vec<OpResult>),
    /// Referenced order ids no longer exist on chain.
    StaleOrder(HashSet<String>),
    /// Pre-flight or chain-side funds rejection.
    InsufficientFunds,
    /// Structurally invalid batch; hard abort.
    IllegalState(String),
    /// Transport trouble that outlived the retry budget.
    Transient(String),
}

/// Broadcasts plans against the chain adapter.
pub struct Executor {
    chain: Arc<dyn ChainAdapter>,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl Executor {
    pub fn new(chain: Arc<dyn ChainAdapter>, max_retries: u32, retry_base_delay_ms: u64) -> Self {
        Self {
            chain,
            max_retries: max_retries.max(1),
            retry_base_delay_ms,
        }
    }

    /// Expand plan actions into chain ops. Rotations become their
    /// cancel/create pair, adjacent so the chain nets their funds
    /// inside the one transaction.
    pub fn compile(plan: &Plan, working: &WorkingGrid) -> Vec<ChainOp> {
        let view = working.view();
        let mut ops = Vec::with_capacity(plan.op_count());
        for action in &plan.actions {
            match action {
                Action::Create { slot, price, size } => {
                    let side = view
                        .slots
                        .get(*slot)
                        .and_then(|r| r.role.committed_side())
                        .unwrap_or_else(|| view.side_of_index(*slot));
                    ops.push(ChainOp::Create {
                        side,
                        price: *price,
                        size: *size,
                    });
                }
                Action::Cancel { order_id, .. } => {
                    ops.push(ChainOp::Cancel {
                        order_id: order_id.clone(),
                    });
                }
                Action::Update {
                    order_id,
                    new_price,
                    new_size,
                    ..
                } => {
                    ops.push(ChainOp::Update {
                        order_id: order_id.clone(),
                        new_price: *new_price,
                        new_size: *new_size,
                    });
                }
                Action::Rotate {
                    dst,
                    order_id,
                    price,
                    size,
                    ..
                } => {
                    if let Some(id) = order_id {
                        ops.push(ChainOp::Cancel {
                            order_id: id.clone(),
                        });
                    }
                    let side = view
                        .slots
                        .get(*dst)
                        .and_then(|r| r.role.committed_side())
                        .unwrap_or_else(|| view.side_of_index(*dst));
                    ops.push(ChainOp::Create {
                        side,
                        price: *price,
                        size: *size,
                    });
                }
            }
        }
        ops
    }

    /// Re-verify per-side funds against the shadow ledger. Runs even
    /// though the planner already respected the same bound.
    fn preflight(plan: &Plan, working: &WorkingGrid, shadow: &Ledger) -> Result<(), Side> {
        for side in [Side::Buy, Side::Sell] {
            let staged = plan.staged_creates(working.view(), side) as i128;
            let required = plan.required_funds(side) as i128;
            let spendable = shadow.headroom(side) + staged;
            if required > spendable || shadow.headroom(side) < 0 {
                return Err(side);
            }
        }
        Ok(())
    }

    /// Broadcast a plan. Never touches the master; the caller commits
    /// or discards based on the returned classification.
    pub async fn execute(
        &self,
        plan: &Plan,
        working: &WorkingGrid,
        shadow: &Ledger,
    ) -> BatchResult {
        if plan.is_empty() {
            return BatchResult::Confirmed(Vec::new());
        }
        if let Err(side) = Self::preflight(plan, working, shadow) {
            warn!(
                "pre-flight rejected plan: {} side requires {} beyond spendable",
                side.as_str(),
                plan.required_funds(side)
            );
            return BatchResult::InsufficientFunds;
        }

        let ops = Self::compile(plan, working);
        debug!("broadcasting batch of {} ops", ops.len());

        let mut attempt = 0;
        loop {
            match self.chain.broadcast_batch(&ops).await {
                Ok(results) => return BatchResult::Confirmed(results),
                Err(ChainError::OrderNotFound(id)) => {
                    warn!("batch referenced stale order {id}");
                    let mut ids = HashSet::new();
                    ids.insert(id);
                    return BatchResult::StaleOrder(ids);
                }
                Err(ChainError::InsufficientFunds) => return BatchResult::InsufficientFunds,
                Err(ChainError::Illegal(msg)) => return BatchResult::IllegalState(msg),
                Err(ChainError::MissingAsset(sym)) => {
                    return BatchResult::IllegalState(format!("unknown asset {sym}"))
                }
                Err(ChainError::Transport(msg)) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        return BatchResult::Transient(msg);
                    }
                    let delay = self.retry_base_delay_ms * 2u64.pow(attempt - 1);
                    warn!(
                        "broadcast attempt {attempt}/{} failed ({msg}); retrying in {delay}ms",
                        self.max_retries
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{PairPrecision, Price};
    use crate::chain::mock::MockChain;
    use crate::chain::AccountTotals;
    use crate::grid::master::tests::{test_grid, test_precision};
    use crate::grid::OrderRole;
    use crate::ledger::Ledger;

    fn setup() -> (Arc<MockChain>, WorkingGrid, Ledger) {
        let chain = Arc::new(MockChain::new("A", 4, "B", 8, 1000.0));
        let working = WorkingGrid::fork(&test_grid());
        let ledger = Ledger::new(test_precision(), None, 0);
        (chain, working, ledger)
    }

    fn sell_create_plan(working: &mut WorkingGrid, size: u64) -> Plan {
        let dst = working.view().spread_slot(crate::asset::Side::Sell).unwrap();
        let price = working.view().slots[dst].price;
        working
            .update(dst, |r| {
                r.role = OrderRole::Sell;
                r.size = size;
                r.original_size = size;
            })
            .unwrap();
        let mut plan = Plan::new();
        plan.push(Action::Create {
            slot: dst,
            price,
            size,
        });
        plan.add_required(crate::asset::Side::Sell, size);
        plan
    }

    #[tokio::test]
    async fn test_empty_plan_confirms_without_broadcast() {
        let (chain, working, ledger) = setup();
        let executor = Executor::new(chain.clone(), 3, 1);
        let result = executor.execute(&Plan::new(), &working, &ledger).await;
        assert!(matches!(result, BatchResult::Confirmed(r) if r.is_empty()));
        assert_eq!(chain.broadcast_count().await, 0);
    }

    #[tokio::test]
    async fn test_preflight_rejects_overdraft_without_broadcast() {
        let (chain, mut working, mut ledger) = setup();
        // shadow has no sell funds at all
        ledger.set_chain_totals(0, 0, 0, 0).unwrap();
        let plan = sell_create_plan(&mut working, 10_000);
        ledger.recalculate(working.view()).unwrap();

        let executor = Executor::new(chain.clone(), 3, 1);
        let result = executor.execute(&plan, &working, &ledger).await;
        assert!(matches!(result, BatchResult::InsufficientFunds));
        assert_eq!(chain.broadcast_count().await, 0);
    }

    #[tokio::test]
    async fn test_confirmed_batch_returns_per_op_results() {
        let (chain, mut working, mut ledger) = setup();
        chain
            .set_totals(AccountTotals {
                buy_total: 0,
                buy_free: 0,
                sell_total: 50_000,
                sell_free: 50_000,
            })
            .await;
        ledger.set_chain_totals(0, 0, 50_000, 50_000).unwrap();
        let plan = sell_create_plan(&mut working, 10_000);
        ledger.recalculate(working.view()).unwrap();

        let executor = Executor::new(chain, 3, 1);
        match executor.execute(&plan, &working, &ledger).await {
            BatchResult::Confirmed(results) => {
                assert_eq!(results.len(), 1);
                assert!(matches!(&results[0], OpResult::Created { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_order_classification() {
        let (chain, working, ledger) = setup();
        let mut plan = Plan::new();
        plan.push(Action::Cancel {
            slot: 0,
            order_id: "1.7.12345".into(),
        });
        let executor = Executor::new(chain, 3, 1);
        match executor.execute(&plan, &working, &ledger).await {
            BatchResult::StaleOrder(ids) => {
                assert!(ids.contains("1.7.12345"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (chain, working, ledger) = setup();
        let mut plan = Plan::new();
        plan.push(Action::Cancel {
            slot: 0,
            order_id: "1.7.1".into(),
        });
        chain
            .add_open_order(crate::chain::OpenOrder {
                order_id: "1.7.1".into(),
                sell_asset: "A".into(),
                for_sale: 10,
                to_receive: 1,
            })
            .await;
        let executor = Executor::new(chain.clone(), 2, 1);
        chain
            .fail_next(ChainError::Transport("socket dropped".into()))
            .await;
        let result = executor.execute(&plan, &working, &ledger).await;
        // first failure consumed fail_next; retry succeeded
        match result {
            BatchResult::Confirmed(results) => assert_eq!(results.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(chain.broadcast_count().await, 2);
    }

    #[test]
    fn test_compile_expands_rotation() {
        let mut working = WorkingGrid::fork(&test_grid());
        let dst = working.view().spread_slot(crate::asset::Side::Sell).unwrap();
        working
            .update(dst, |r| {
                r.role = OrderRole::Sell;
                r.size = 500;
            })
            .unwrap();
        let mut plan = Plan::new();
        plan.push(Action::Rotate {
            src: 0,
            dst,
            order_id: Some("1.7.4".into()),
            price: Price::from_human(1005.0, PairPrecision::new(4, 8)),
            size: 500,
        });
        let ops = Executor::compile(&plan, &working);
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], ChainOp::Cancel { order_id } if order_id == "1.7.4"));
        assert!(
            matches!(&ops[1], ChainOp::Create { side, size, .. } if *side == crate::asset::Side::Sell && *size == 500)
        );
    }
}
