//! Slot records and fill events

use serde::{Deserialize, Serialize};

use crate::asset::{Amount, Price, Side};
use crate::errors::{Error, Result};

/// Which part the slot plays in the book.
///
/// SPREAD slots are the placeholders realizing the configured empty
/// zone around the boundary; they never carry an on-chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderRole {
    Buy,
    Sell,
    Spread,
}

impl OrderRole {
    /// The fund side this role commits, if any.
    pub fn committed_side(&self) -> Option<Side> {
        match self {
            OrderRole::Buy => Some(Side::Buy),
            OrderRole::Sell => Some(Side::Sell),
            OrderRole::Spread => None,
        }
    }

    pub fn of(side: Side) -> Self {
        match side {
            Side::Buy => OrderRole::Buy,
            Side::Sell => OrderRole::Sell,
        }
    }
}

/// On-chain status of a slot's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    /// Planned but not on chain.
    Virtual,
    /// Confirmed on chain with full remaining size.
    Active,
    /// On chain with less than the original size remaining.
    Partial,
}

/// Last observed on-chain integer amounts; the authoritative size
/// reference when adopting or correcting an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOnChain {
    pub for_sale: Amount,
    pub to_receive: Amount,
}

/// One slot of the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    /// Stable identity within a grid generation.
    pub slot: usize,
    pub role: OrderRole,
    pub state: OrderState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_order_id: Option<String>,
    pub price: Price,
    /// Committed-asset base units still on offer.
    pub size: Amount,
    /// Size at creation; PARTIAL is always strictly below this.
    pub original_size: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_on_chain: Option<RawOnChain>,
    /// Worker generation that created the record.
    pub session_id: u64,
    pub created_at_ms: u64,
}

impl OrderRecord {
    /// A dormant placeholder at a ladder price.
    pub fn placeholder(slot: usize, role: OrderRole, price: Price, session_id: u64, now_ms: u64) -> Self {
        Self {
            slot,
            role,
            state: OrderState::Virtual,
            chain_order_id: None,
            price,
            size: 0,
            original_size: 0,
            raw_on_chain: None,
            session_id,
            created_at_ms: now_ms,
        }
    }

    /// ACTIVE or PARTIAL: there is an order resting on chain.
    pub fn is_live(&self) -> bool {
        matches!(self.state, OrderState::Active | OrderState::Partial)
    }

    /// Confirm an on-chain creation for this slot.
    pub fn mark_active(&mut self, order_id: String, raw: RawOnChain) {
        self.chain_order_id = Some(order_id);
        self.state = OrderState::Active;
        self.original_size = self.size;
        self.raw_on_chain = Some(raw);
    }

    /// Record a partial execution leaving `remaining` on chain.
    pub fn mark_partial(&mut self, remaining: Amount, raw: RawOnChain) {
        self.size = remaining;
        self.state = OrderState::Partial;
        self.raw_on_chain = Some(raw);
    }

    /// Planner decision: the slot goes back to a bare placeholder.
    /// The only path that clears a chain order id.
    pub fn release(&mut self, role: OrderRole) {
        self.role = role;
        self.state = OrderState::Virtual;
        self.chain_order_id = None;
        self.size = 0;
        self.original_size = 0;
        self.raw_on_chain = None;
    }

    /// Per-record invariants; boundary agreement is checked by the Grid.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::IllegalState(msg));
        match self.state {
            OrderState::Active | OrderState::Partial => {
                if self.chain_order_id.is_none() {
                    return fail(format!("slot {} live without chain order id", self.slot));
                }
                if self.size == 0 {
                    return fail(format!("slot {} live with zero size", self.slot));
                }
                if self.state == OrderState::Partial && self.size >= self.original_size {
                    return fail(format!(
                        "slot {} partial with size {} >= original {}",
                        self.slot, self.size, self.original_size
                    ));
                }
            }
            OrderState::Virtual => {
                if self.chain_order_id.is_some() {
                    return fail(format!("slot {} virtual with chain order id", self.slot));
                }
            }
        }
        if self.role == OrderRole::Spread && (self.state != OrderState::Virtual || self.size != 0) {
            return fail(format!("slot {} spread placeholder carries size", self.slot));
        }
        Ok(())
    }
}

/// A fill delivered by the chain subscription or found in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillEvent {
    pub order_id: String,
    pub block_num: u64,
    pub history_id: u64,
    /// Committed-asset base units the order gave up.
    pub paid: Amount,
    /// Opposite-asset base units received, net of the projected maker
    /// refund for the native fee asset.
    pub received: Amount,
    /// Fee charged in the native fee asset, already taken by the chain.
    pub fee: Amount,
    pub is_maker: bool,
}

impl FillEvent {
    /// Deduplication key, stable across restarts.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.order_id, self.block_num, self.history_id)
    }
}

/// A fill waiting in the worker queue.
///
/// `balance_settled` flips when a chain snapshot is adopted while the
/// fill is still queued: the fresh totals already include its
/// proceeds, so the planner must react to it without crediting the
/// ledger a second time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFill {
    pub fill: FillEvent,
    pub balance_settled: bool,
}

impl From<FillEvent> for QueuedFill {
    fn from(fill: FillEvent) -> Self {
        Self {
            fill,
            balance_settled: false,
        }
    }
}
