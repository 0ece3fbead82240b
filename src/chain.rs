//! Chain adapter interface
//!
//! The core never talks to a node directly; it consumes this narrow
//! async trait. The real implementation (RPC transport, operation
//! builder, signer) lives outside the crate. A scripted mock ships in
//! [`mock`] so every pipeline path can be exercised in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::asset::{Amount, Price, Side};
use crate::grid::FillEvent;

/// Errors surfaced by the chain adapter, already classified.
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("insufficient funds for batch")]
    InsufficientFunds,

    #[error("operation structurally invalid: {0}")]
    Illegal(String),

    #[error("asset not known to chain: {0}")]
    MissingAsset(String),
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Account balances in base units, both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountTotals {
    pub buy_total: Amount,
    pub buy_free: Amount,
    pub sell_total: Amount,
    pub sell_free: Amount,
}

/// An order resting on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: String,
    /// Symbol of the asset the order offers.
    pub sell_asset: String,
    pub for_sale: Amount,
    pub to_receive: Amount,
}

impl OpenOrder {
    /// The book side this order plays for a worker whose base asset is
    /// `asset_a`.
    pub fn side(&self, asset_a: &str) -> Side {
        if self.sell_asset == asset_a {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    /// Price as quote-per-base, regardless of which asset is offered.
    pub fn price(&self, asset_a: &str) -> Price {
        match self.side(asset_a) {
            Side::Sell => Price::new(self.to_receive, self.for_sale.max(1)),
            Side::Buy => Price::new(self.for_sale, self.to_receive.max(1)),
        }
    }
}

/// Reference price source.
#[derive(Debug, Clone, PartialEq)]
pub enum PriceMode {
    Pool,
    Market,
    Orderbook,
    Fixed(f64),
}

/// Fee schedule for one asset. For the native fee asset the maker
/// refund fraction is projected into fill proceeds by the adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssetFees {
    pub creation_fee: Amount,
    pub maker_refund_bps: u32,
    /// True when this asset is the chain's native fee asset.
    pub is_fee_asset: bool,
}

/// One operation of a batched transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOp {
    Create {
        /// Side whose asset the order offers.
        side: Side,
        price: Price,
        size: Amount,
    },
    Update {
        order_id: String,
        new_price: Option<Price>,
        new_size: Amount,
    },
    Cancel {
        order_id: String,
    },
}

/// Per-op outcome of a confirmed batch. Chains with atomic batch
/// semantics reject the whole transaction instead; adapters for
/// chains that apply ops independently surface the survivors here and
/// mark the rest `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Created { order_id: String },
    Updated,
    Cancelled,
    Failed { reason: String },
}

/// Narrow chain surface the core consumes.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Fill stream for the worker's account.
    async fn subscribe_fills(&self) -> ChainResult<mpsc::Receiver<FillEvent>>;

    async fn account_totals(&self) -> ChainResult<AccountTotals>;

    async fn open_orders(&self) -> ChainResult<Vec<OpenOrder>>;

    /// Completed fills since a block height, oldest first.
    async fn fill_history(&self, since_block: u64) -> ChainResult<Vec<FillEvent>>;

    /// Broadcast an atomic batch; per-op results on success.
    async fn broadcast_batch(&self, ops: &[ChainOp]) -> ChainResult<Vec<OpResult>>;

    /// Decimal places for a symbol. Errors when unknown; the core
    /// never assumes a default.
    async fn asset_precision(&self, symbol: &str) -> ChainResult<u32>;

    async fn reference_price(&self, mode: &PriceMode) -> ChainResult<f64>;

    async fn asset_fees(&self, symbol: &str, amount: Amount, is_maker: bool)
        -> ChainResult<AssetFees>;
}

/// Scripted in-memory chain for tests.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        totals: AccountTotals,
        open_orders: Vec<OpenOrder>,
        history: Vec<FillEvent>,
        fail_next: Option<ChainError>,
        broadcast_log: Vec<Vec<ChainOp>>,
        fill_tx: Option<mpsc::Sender<FillEvent>>,
    }

    /// Mock chain with scripted balances, orders and failures.
    pub struct MockChain {
        asset_a: String,
        asset_b: String,
        precisions: HashMap<String, u32>,
        fees: AssetFees,
        reference: f64,
        next_oid: AtomicU64,
        inner: Arc<Mutex<Inner>>,
    }

    impl MockChain {
        pub fn new(asset_a: &str, prec_a: u32, asset_b: &str, prec_b: u32, reference: f64) -> Self {
            let mut precisions = HashMap::new();
            precisions.insert(asset_a.to_string(), prec_a);
            precisions.insert(asset_b.to_string(), prec_b);
            Self {
                asset_a: asset_a.to_string(),
                asset_b: asset_b.to_string(),
                precisions,
                fees: AssetFees::default(),
                reference,
                next_oid: AtomicU64::new(1),
                inner: Arc::new(Mutex::new(Inner::default())),
            }
        }

        pub fn with_fees(mut self, fees: AssetFees) -> Self {
            self.fees = fees;
            self
        }

        /// Move the id counter past any hand-seeded order ids.
        pub fn set_next_oid(&self, next: u64) {
            self.next_oid.store(next, Ordering::SeqCst);
        }

        pub async fn set_totals(&self, totals: AccountTotals) {
            self.inner.lock().await.totals = totals;
        }

        pub async fn add_open_order(&self, order: OpenOrder) {
            self.inner.lock().await.open_orders.push(order);
        }

        pub async fn remove_open_order(&self, order_id: &str) {
            let mut inner = self.inner.lock().await;
            inner.open_orders.retain(|o| o.order_id != order_id);
        }

        pub async fn push_history(&self, fill: FillEvent) {
            self.inner.lock().await.history.push(fill);
        }

        pub async fn fail_next(&self, err: ChainError) {
            self.inner.lock().await.fail_next = Some(err);
        }

        pub async fn open_order_ids(&self) -> Vec<String> {
            self.inner
                .lock()
                .await
                .open_orders
                .iter()
                .map(|o| o.order_id.clone())
                .collect()
        }

        pub async fn broadcast_count(&self) -> usize {
            self.inner.lock().await.broadcast_log.len()
        }

        pub async fn broadcast_log(&self) -> Vec<Vec<ChainOp>> {
            self.inner.lock().await.broadcast_log.clone()
        }

        /// Deliver a fill to the subscriber, mirroring it in history
        /// and the open-order book the way a node would.
        pub async fn deliver_fill(&self, fill: FillEvent, fully_consumed: bool) {
            let mut inner = self.inner.lock().await;
            if fully_consumed {
                inner.open_orders.retain(|o| o.order_id != fill.order_id);
            } else if let Some(order) = inner
                .open_orders
                .iter_mut()
                .find(|o| o.order_id == fill.order_id)
            {
                order.for_sale = order.for_sale.saturating_sub(fill.paid);
            }
            inner.history.push(fill.clone());
            let tx = inner.fill_tx.clone();
            drop(inner);
            if let Some(tx) = tx {
                let _ = tx.send(fill).await;
            }
        }

        fn committed_symbol(&self, side: Side) -> &str {
            match side {
                Side::Sell => &self.asset_a,
                Side::Buy => &self.asset_b,
            }
        }
    }

    #[async_trait]
    impl ChainAdapter for MockChain {
        async fn subscribe_fills(&self) -> ChainResult<mpsc::Receiver<FillEvent>> {
            let (tx, rx) = mpsc::channel(64);
            self.inner.lock().await.fill_tx = Some(tx);
            Ok(rx)
        }

        async fn account_totals(&self) -> ChainResult<AccountTotals> {
            Ok(self.inner.lock().await.totals)
        }

        async fn open_orders(&self) -> ChainResult<Vec<OpenOrder>> {
            Ok(self.inner.lock().await.open_orders.clone())
        }

        async fn fill_history(&self, since_block: u64) -> ChainResult<Vec<FillEvent>> {
            Ok(self
                .inner
                .lock()
                .await
                .history
                .iter()
                .filter(|f| f.block_num >= since_block)
                .cloned()
                .collect())
        }

        async fn broadcast_batch(&self, ops: &[ChainOp]) -> ChainResult<Vec<OpResult>> {
            let mut inner = self.inner.lock().await;
            inner.broadcast_log.push(ops.to_vec());
            if let Some(err) = inner.fail_next.take() {
                return Err(err);
            }

            // atomic semantics: validate every op before applying any
            for op in ops {
                match op {
                    ChainOp::Cancel { order_id } | ChainOp::Update { order_id, .. } => {
                        if !inner.open_orders.iter().any(|o| &o.order_id == order_id) {
                            return Err(ChainError::OrderNotFound(order_id.clone()));
                        }
                    }
                    ChainOp::Create { side, size, .. } => {
                        let free = match side {
                            Side::Sell => inner.totals.sell_free,
                            Side::Buy => inner.totals.buy_free,
                        };
                        if free < *size {
                            return Err(ChainError::InsufficientFunds);
                        }
                    }
                }
            }

            let mut results = Vec::with_capacity(ops.len());
            for op in ops {
                match op {
                    ChainOp::Cancel { order_id } => {
                        let pos = inner
                            .open_orders
                            .iter()
                            .position(|o| &o.order_id == order_id)
                            .expect("validated above");
                        let order = inner.open_orders.remove(pos);
                        let side = order.side(&self.asset_a);
                        match side {
                            Side::Sell => inner.totals.sell_free += order.for_sale,
                            Side::Buy => inner.totals.buy_free += order.for_sale,
                        }
                        results.push(OpResult::Cancelled);
                    }
                    ChainOp::Update {
                        order_id,
                        new_price,
                        new_size,
                    } => {
                        let pos = inner
                            .open_orders
                            .iter()
                            .position(|o| &o.order_id == order_id)
                            .expect("validated above");
                        let side = if inner.open_orders[pos].sell_asset == self.asset_a {
                            Side::Sell
                        } else {
                            Side::Buy
                        };
                        let old = inner.open_orders[pos].for_sale;
                        inner.open_orders[pos].for_sale = *new_size;
                        if let Some(p) = new_price {
                            inner.open_orders[pos].to_receive = match side {
                                Side::Sell => p.quote_amount(*new_size),
                                Side::Buy => p.base_amount(*new_size),
                            };
                        }
                        let delta_up = new_size.saturating_sub(old);
                        let delta_down = old.saturating_sub(*new_size);
                        match side {
                            Side::Sell => {
                                inner.totals.sell_free = (inner.totals.sell_free + delta_down)
                                    .saturating_sub(delta_up);
                            }
                            Side::Buy => {
                                inner.totals.buy_free = (inner.totals.buy_free + delta_down)
                                    .saturating_sub(delta_up);
                            }
                        }
                        results.push(OpResult::Updated);
                    }
                    ChainOp::Create { side, price, size } => {
                        let order_id = format!("1.7.{}", self.next_oid.fetch_add(1, Ordering::SeqCst));
                        let to_receive = match side {
                            Side::Sell => price.quote_amount(*size),
                            Side::Buy => price.base_amount(*size),
                        };
                        inner.open_orders.push(OpenOrder {
                            order_id: order_id.clone(),
                            sell_asset: self.committed_symbol(*side).to_string(),
                            for_sale: *size,
                            to_receive,
                        });
                        match side {
                            Side::Sell => inner.totals.sell_free -= size,
                            Side::Buy => inner.totals.buy_free -= size,
                        }
                        results.push(OpResult::Created { order_id });
                    }
                }
            }
            Ok(results)
        }

        async fn asset_precision(&self, symbol: &str) -> ChainResult<u32> {
            self.precisions
                .get(symbol)
                .copied()
                .ok_or_else(|| ChainError::MissingAsset(symbol.to_string()))
        }

        async fn reference_price(&self, mode: &PriceMode) -> ChainResult<f64> {
            match mode {
                PriceMode::Fixed(p) => Ok(*p),
                _ => Ok(self.reference),
            }
        }

        async fn asset_fees(
            &self,
            _symbol: &str,
            _amount: Amount,
            _is_maker: bool,
        ) -> ChainResult<AssetFees> {
            Ok(self.fees)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockChain;
    use super::*;
    use crate::asset::PairPrecision;

    fn chain() -> MockChain {
        MockChain::new("A", 4, "B", 8, 1000.0)
    }

    #[tokio::test]
    async fn test_precision_fails_loudly_when_absent() {
        let chain = chain();
        assert_eq!(chain.asset_precision("A").await.unwrap(), 4);
        assert!(matches!(
            chain.asset_precision("C").await,
            Err(ChainError::MissingAsset(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_create_assigns_ids_and_locks_funds() {
        let chain = chain();
        chain
            .set_totals(AccountTotals {
                buy_total: 0,
                buy_free: 0,
                sell_total: 50_000,
                sell_free: 50_000,
            })
            .await;
        let price = Price::from_human(1005.0, PairPrecision::new(4, 8));
        let results = chain
            .broadcast_batch(&[ChainOp::Create {
                side: Side::Sell,
                price,
                size: 10_000,
            }])
            .await
            .unwrap();
        assert!(matches!(&results[0], OpResult::Created { .. }));
        let totals = chain.account_totals().await.unwrap();
        assert_eq!(totals.sell_free, 40_000);
        assert_eq!(chain.open_order_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_atomic_on_stale_cancel() {
        let chain = chain();
        chain
            .set_totals(AccountTotals {
                buy_total: 0,
                buy_free: 0,
                sell_total: 50_000,
                sell_free: 50_000,
            })
            .await;
        let price = Price::from_human(1005.0, PairPrecision::new(4, 8));
        let err = chain
            .broadcast_batch(&[
                ChainOp::Create {
                    side: Side::Sell,
                    price,
                    size: 10_000,
                },
                ChainOp::Cancel {
                    order_id: "1.7.12345".into(),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::OrderNotFound(id) if id == "1.7.12345"));
        // nothing was applied
        assert!(chain.open_order_ids().await.is_empty());
        assert_eq!(chain.account_totals().await.unwrap().sell_free, 50_000);
    }

    #[tokio::test]
    async fn test_open_order_side_and_price() {
        let order = OpenOrder {
            order_id: "1.7.1".into(),
            sell_asset: "A".into(),
            for_sale: 10_000,
            to_receive: 100_500_000_000,
        };
        assert_eq!(order.side("A"), Side::Sell);
        let p = order.price("A");
        let expected = Price::from_human(1005.0, PairPrecision::new(4, 8));
        assert!(p.within_bps(&expected, 1));
    }

    #[tokio::test]
    async fn test_deliver_fill_updates_book_and_stream() {
        let chain = chain();
        chain
            .add_open_order(OpenOrder {
                order_id: "1.7.3".into(),
                sell_asset: "A".into(),
                for_sale: 10_000,
                to_receive: 100_500_000_000,
            })
            .await;
        let mut rx = chain.subscribe_fills().await.unwrap();
        let fill = FillEvent {
            order_id: "1.7.3".into(),
            block_num: 100,
            history_id: 1,
            paid: 10_000,
            received: 100_500_000_000,
            fee: 0,
            is_maker: true,
        };
        chain.deliver_fill(fill.clone(), true).await;
        assert!(chain.open_order_ids().await.is_empty());
        assert_eq!(rx.recv().await.unwrap(), fill);
        assert_eq!(chain.fill_history(0).await.unwrap().len(), 1);
    }
}
