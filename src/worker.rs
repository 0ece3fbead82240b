//! Worker event loop
//!
//! One worker runs one trading pair. Thin callbacks enqueue events; a
//! single consumer pops one event at a time, takes locks in canonical
//! order (`fill -> grid -> fund`, `reconcile -> grid -> fund`,
//! `persist` leaf), and drives the plan/broadcast/commit pipeline
//! synchronously inside them. Nothing mutates the master grid or
//! ledger outside a commit or a reconciliation pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::asset::{PairPrecision, Side};
use crate::chain::{ChainAdapter, ChainOp, OpResult};
use crate::config::BotConfig;
use crate::errors::{Error, Result, Severity};
use crate::executor::{BatchResult, Executor};
use crate::grid::{FillEvent, Grid, OrderRole, QueuedFill, RawOnChain, WorkingGrid};
use crate::persist::{PersistedState, StateStore};
use crate::planner::{adaptive_batch_size, Action, PlanOutcome, Planner};
use crate::reconciler::Reconciler;
use crate::sync::{with_lock_tracking, CancelToken, LockSet};

/// Wall-clock milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Everything the consumer loop reacts to.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Fill(FillEvent),
    PeriodicTick,
    SpreadCheck,
    DivergenceCheck,
    Reset,
    Shutdown,
}

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Bootstrapping,
    Normal,
    Rebalancing,
    Broadcasting,
    /// The chain accepted the batch; the working state is being swapped
    /// in and persisted before the pipeline returns to Normal.
    Confirmed,
    Resyncing,
    Halted,
}

/// Work that must happen after the pipeline locks are released.
enum Followup {
    None,
    RefreshTotals,
    Resync,
    RecoverStale(HashSet<String>),
}

/// One trading pair's planner/accountant/synchronizer.
pub struct Worker {
    cfg: BotConfig,
    prec: PairPrecision,
    chain: Arc<dyn ChainAdapter>,
    locks: LockSet,
    pub(crate) status: WorkerStatus,
    master: Grid,
    ledger: crate::ledger::Ledger,
    planner: Planner,
    executor: Executor,
    reconciler: Reconciler,
    store: StateStore,
    queue: VecDeque<QueuedFill>,
    processed_fills: HashMap<String, u64>,
    session_id: u64,
    /// Set while Rebalancing/Broadcasting; the watchdog clears stuck
    /// flags after the pipeline timeout without touching orders.
    pipeline_since: Option<u64>,
    /// Plans are suppressed until this stamp after an IllegalState.
    maintenance_until: u64,
}

impl Worker {
    /// Fetch chain metadata, run startup reconciliation (with the
    /// configured retry budget), and return a worker in NORMAL state.
    pub async fn bootstrap(cfg: BotConfig, chain: Arc<dyn ChainAdapter>) -> Result<Worker> {
        cfg.validate()?;
        let prec_a = chain
            .asset_precision(&cfg.asset_a)
            .await
            .map_err(|_| Error::MissingPrecision(cfg.asset_a.clone()))?;
        let prec_b = chain
            .asset_precision(&cfg.asset_b)
            .await
            .map_err(|_| Error::MissingPrecision(cfg.asset_b.clone()))?;
        let prec = PairPrecision::new(prec_a, prec_b);

        let session_id = now_ms();
        let store = StateStore::new(cfg.state_path(), cfg.processed_fill_ttl_secs * 1_000);
        let persisted = store.load()?;
        if persisted.is_some() {
            info!("{}: resuming from persisted state", cfg.bot_key);
        }

        let mut reconciler = Reconciler::new(cfg.clone(), prec);
        let mut attempt = 0;
        let boot = loop {
            attempt += 1;
            match reconciler
                .bootstrap(chain.as_ref(), persisted.as_ref(), session_id, now_ms())
                .await
            {
                Ok(boot) => break boot,
                Err(e) if attempt < cfg.max_recovery_attempts => {
                    warn!(
                        "{}: reconciliation attempt {attempt}/{} failed: {e}",
                        cfg.bot_key, cfg.max_recovery_attempts
                    );
                    tokio::time::sleep(Duration::from_millis(cfg.recovery_retry_interval_ms)).await;
                }
                Err(e) => {
                    error!("{}: reconciliation exhausted its attempts: {e}", cfg.bot_key);
                    return Err(e);
                }
            }
        };

        let mut master = boot.grid;
        let mut ledger = boot.ledger;

        // housekeeping batch: drop unrecognized orders, realign
        // adjacent adoptions, then trust a fresh snapshot
        let mut ops: Vec<ChainOp> = boot
            .cancels
            .iter()
            .map(|id| ChainOp::Cancel {
                order_id: id.clone(),
            })
            .collect();
        for action in &boot.align_updates {
            if let Action::Update {
                order_id,
                new_price,
                new_size,
                ..
            } = action
            {
                ops.push(ChainOp::Update {
                    order_id: order_id.clone(),
                    new_price: *new_price,
                    new_size: *new_size,
                });
            }
        }
        if !ops.is_empty() {
            match chain.broadcast_batch(&ops).await {
                Ok(results) => info!("startup housekeeping applied {} ops", results.len()),
                Err(e) => warn!("startup housekeeping failed ({e}); resync will retry"),
            }
            let totals = chain
                .account_totals()
                .await
                .map_err(|e| Error::Transient(e.to_string()))?;
            ledger.set_chain_totals(
                totals.buy_total,
                totals.buy_free,
                totals.sell_total,
                totals.sell_free,
            )?;
            ledger.recalculate(&master)?;
        }
        master.rebuild_index();

        let planner = Planner::new(cfg.clone(), prec, boot.fees.creation_fee);
        let executor = Executor::new(chain.clone(), cfg.max_broadcast_retries, cfg.retry_base_delay_ms);
        info!(
            "{}: bootstrap complete (session {session_id}, {} buys / {} sells live)",
            cfg.bot_key,
            master.live_count(Side::Buy),
            master.live_count(Side::Sell)
        );

        Ok(Worker {
            cfg,
            prec,
            chain,
            locks: LockSet::new(),
            status: WorkerStatus::Normal,
            master,
            ledger,
            planner,
            executor,
            reconciler,
            store,
            queue: VecDeque::new(),
            processed_fills: boot.processed_fills,
            session_id,
            pipeline_since: None,
            maintenance_until: 0,
        })
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn grid(&self) -> &Grid {
        &self.master
    }

    pub fn ledger(&self) -> &crate::ledger::Ledger {
        &self.ledger
    }

    pub fn precision(&self) -> PairPrecision {
        self.prec
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.lock_timeout_ms)
    }

    /// Consume events until shutdown. Lock-order tracking is enabled
    /// for the whole loop.
    pub async fn run(
        &mut self,
        events: mpsc::Receiver<WorkerEvent>,
        cancel: CancelToken,
    ) -> Result<()> {
        with_lock_tracking(self.run_inner(events, cancel)).await
    }

    async fn run_inner(
        &mut self,
        mut events: mpsc::Receiver<WorkerEvent>,
        cancel: CancelToken,
    ) -> Result<()> {
        let period = Duration::from_secs(self.cfg.resync_interval_secs.max(1));
        let mut resync_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            if self.status == WorkerStatus::Halted {
                error!("{}: halted; refusing further events", self.cfg.bot_key);
                return Err(Error::Halted);
            }
            let keep_going = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("{}: shutdown signal", self.cfg.bot_key);
                    false
                }
                maybe = events.recv() => match maybe {
                    Some(event) => self.handle_event(event, &cancel).await?,
                    None => false,
                },
                _ = resync_timer.tick() => {
                    self.handle_event(WorkerEvent::PeriodicTick, &cancel).await?
                }
            };
            if !keep_going {
                break;
            }
        }
        // graceful exit: flush persistence, drop the subscription
        self.persist(&cancel).await;
        Ok(())
    }

    /// Dispatch one event. Returns false when the loop should stop.
    pub(crate) async fn handle_event(
        &mut self,
        event: WorkerEvent,
        cancel: &CancelToken,
    ) -> Result<bool> {
        self.watchdog();
        match event {
            WorkerEvent::Fill(fill) => {
                self.enqueue_fill(fill);
                if self.status == WorkerStatus::Normal {
                    self.process_fills(cancel).await?;
                }
            }
            WorkerEvent::SpreadCheck => {
                // dropped, not queued, while the pipeline is busy
                if self.maintenance_allowed() {
                    self.run_maintenance(Maintenance::Spread, cancel).await?;
                }
            }
            WorkerEvent::DivergenceCheck => {
                if self.maintenance_allowed() {
                    self.run_maintenance(Maintenance::Divergence, cancel).await?;
                }
            }
            WorkerEvent::PeriodicTick => {
                self.resync(cancel).await?;
                if self.regeneration_due() {
                    warn!(
                        "{}: cache share beyond {}%; regenerating grid",
                        self.cfg.bot_key, self.cfg.grid_regeneration_percent
                    );
                    self.reset(cancel).await?;
                    return Ok(true);
                }
                if self.maintenance_allowed() {
                    self.boundary_sync(cancel).await?;
                    self.run_maintenance(Maintenance::Divergence, cancel).await?;
                }
                if self.status == WorkerStatus::Normal && !self.queue.is_empty() {
                    self.process_fills(cancel).await?;
                }
            }
            WorkerEvent::Reset => {
                self.reset(cancel).await?;
            }
            WorkerEvent::Shutdown => {
                self.persist(cancel).await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn maintenance_allowed(&self) -> bool {
        self.status == WorkerStatus::Normal && now_ms() >= self.maintenance_until
    }

    /// Accumulated cache surplus beyond the configured share of the
    /// deployed grid calls for a full regeneration.
    fn regeneration_due(&self) -> bool {
        let pct_bps = (self.cfg.grid_regeneration_percent * 100.0).round() as u128;
        if pct_bps == 0 {
            return false;
        }
        [Side::Buy, Side::Sell].into_iter().any(|side| {
            let committed = self.ledger.side(side).grid_committed as u128;
            committed > 0 && self.ledger.cache(side) as u128 * 10_000 > committed * pct_bps
        })
    }

    /// Clear stuck pipeline flags after the configured timeout. Orders
    /// are left alone; only the status is unblocked.
    fn watchdog(&mut self) {
        if let Some(since) = self.pipeline_since {
            let limit = self.cfg.pipeline_timeout_secs * 1_000;
            if matches!(
                self.status,
                WorkerStatus::Rebalancing | WorkerStatus::Broadcasting | WorkerStatus::Confirmed
            ) && now_ms().saturating_sub(since) > limit
            {
                warn!("{}: pipeline stuck beyond {limit}ms; unblocking", self.cfg.bot_key);
                self.status = WorkerStatus::Normal;
                self.pipeline_since = None;
            }
        }
    }

    /// Queue a fill unless it was already credited; ordering and
    /// batching happen at drain time.
    fn enqueue_fill(&mut self, fill: FillEvent) {
        self.enqueue(QueuedFill::from(fill));
    }

    fn enqueue(&mut self, queued: QueuedFill) {
        let key = queued.fill.key();
        if self.processed_fills.contains_key(&key) {
            debug!("duplicate fill {key} dropped");
            return;
        }
        if self.reconciler.is_stale_cleaned(&queued.fill.order_id) {
            debug!("fill {key} for stale-cleaned order dropped");
            return;
        }
        if self.queue.iter().any(|q| q.fill.key() == key) {
            return;
        }
        self.queue.push_back(queued);
    }

    /// A fresh chain snapshot was adopted: funds of anything still
    /// queued are already reflected in it.
    fn mark_queue_settled(&mut self) {
        for queued in self.queue.iter_mut() {
            queued.balance_settled = true;
        }
    }

    /// Drain one adaptive batch of fills through the full pipeline.
    pub(crate) async fn process_fills(&mut self, cancel: &CancelToken) -> Result<()> {
        for _ in 0..3 {
            if self.queue.is_empty() || self.status != WorkerStatus::Normal {
                return Ok(());
            }
            let followup = self.fill_cycle(cancel).await?;
            if !self.apply_followup(followup, cancel).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// One fill-lock -> grid-lock -> fund-lock pass over the queue.
    async fn fill_cycle(&mut self, cancel: &CancelToken) -> Result<Followup> {
        let _fill = match self.locks.fill.acquire(self.lock_timeout(), cancel).await {
            Ok(guard) => guard,
            Err(Error::LockTimeout(name)) => {
                warn!("{name} lock timed out; scheduling resync");
                return Ok(Followup::Resync);
            }
            Err(e) => return Err(e),
        };

        // blockchain arrival order
        self.queue
            .make_contiguous()
            .sort_by_key(|q| (q.fill.block_num, q.fill.history_id));
        let batch_size = adaptive_batch_size(
            self.queue.len(),
            &self.cfg.batch_stress_tiers,
            self.cfg.max_fill_batch_size,
        );
        let batch: Vec<QueuedFill> = self.queue.drain(..batch_size.min(self.queue.len())).collect();
        debug!(
            "draining {} of {} queued fills",
            batch.len(),
            batch.len() + self.queue.len()
        );

        let _grid = self.locks.grid.acquire(self.lock_timeout(), cancel).await?;
        self.status = WorkerStatus::Rebalancing;
        self.pipeline_since = Some(now_ms());

        let outcome = match self.planner.plan_fills(&self.master, &self.ledger, &batch) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.requeue(batch);
                self.status = WorkerStatus::Normal;
                self.pipeline_since = None;
                return Ok(self.note_ledger_issue(e));
            }
        };

        let _fund = self.locks.fund.acquire(self.lock_timeout(), cancel).await?;
        self.status = WorkerStatus::Broadcasting;
        let result = self
            .executor
            .execute(&outcome.plan, &outcome.working, &outcome.shadow)
            .await;
        let followup = self.settle(outcome, result, batch, cancel).await?;
        self.status = WorkerStatus::Normal;
        self.pipeline_since = None;
        Ok(followup)
    }

    /// Interpret a batch result while the pipeline locks are held.
    async fn settle(
        &mut self,
        outcome: PlanOutcome,
        result: BatchResult,
        fills: Vec<QueuedFill>,
        cancel: &CancelToken,
    ) -> Result<Followup> {
        match result {
            BatchResult::Confirmed(results) => {
                self.status = WorkerStatus::Confirmed;
                let followup = self.commit(outcome, results)?;
                let now = now_ms();
                for queued in &fills {
                    self.processed_fills.insert(queued.fill.key(), now);
                }
                self.persist(cancel).await;
                Ok(followup)
            }
            BatchResult::StaleOrder(ids) => {
                warn!("batch hit stale orders {ids:?}; discarding working state");
                self.requeue(fills);
                Ok(Followup::RecoverStale(ids))
            }
            BatchResult::InsufficientFunds => {
                warn!("batch rejected for funds; will refresh balances and re-plan");
                self.requeue(fills);
                Ok(Followup::RefreshTotals)
            }
            BatchResult::IllegalState(msg) => {
                error!("chain rejected batch as illegal: {msg}");
                self.maintenance_until =
                    now_ms() + self.cfg.pipeline_timeout_secs.saturating_mul(1_000);
                self.requeue(fills);
                Ok(Followup::Resync)
            }
            BatchResult::Transient(msg) => {
                warn!("broadcast failed transiently after retries: {msg}");
                self.requeue(fills);
                Ok(Followup::None)
            }
        }
    }

    /// Swap the working grid into the master and adopt the shadow
    /// ledger, applying per-op chain effects first.
    fn commit(&mut self, outcome: PlanOutcome, results: Vec<OpResult>) -> Result<Followup> {
        let PlanOutcome {
            plan,
            mut working,
            mut shadow,
        } = outcome;

        let mut stale = HashSet::new();
        let mut needs_resync = false;
        let mut cursor = results.into_iter();
        shadow.pause();

        for action in plan.actions.clone() {
            match action {
                Action::Create { slot, price, size } => {
                    match cursor.next() {
                        Some(OpResult::Created { order_id }) => {
                            self.activate(&mut working, &mut shadow, slot, order_id, price, size)?;
                        }
                        Some(OpResult::Failed { reason }) => {
                            warn!("create at slot {slot} failed: {reason}");
                            working.update(slot, |r| r.release(r.role))?;
                            needs_resync = true;
                        }
                        other => {
                            warn!("unexpected op result {other:?} for create");
                            needs_resync = true;
                        }
                    }
                }
                Action::Cancel { slot, order_id } => match cursor.next() {
                    Some(OpResult::Cancelled) => {}
                    Some(OpResult::Failed { reason }) => {
                        warn!("cancel of {order_id} failed: {reason}");
                        let _ = slot;
                        stale.insert(order_id);
                    }
                    other => warn!("unexpected op result {other:?} for cancel"),
                },
                Action::Update {
                    slot,
                    order_id,
                    new_size,
                    ..
                } => match cursor.next() {
                    Some(OpResult::Updated) => {
                        let old = self.master.slot(slot)?.size;
                        let side = self.master.side_of_index(slot);
                        if new_size > old {
                            shadow.lock(side, new_size - old)?;
                        } else {
                            shadow.unlock(side, old - new_size);
                        }
                        working.update(slot, |r| {
                            let price = r.price;
                            r.raw_on_chain = Some(RawOnChain {
                                for_sale: new_size,
                                to_receive: match side {
                                    Side::Sell => price.quote_amount(new_size),
                                    Side::Buy => price.base_amount(new_size),
                                },
                            });
                        })?;
                    }
                    Some(OpResult::Failed { reason }) => {
                        warn!("update of {order_id} failed: {reason}");
                        stale.insert(order_id);
                    }
                    other => warn!("unexpected op result {other:?} for update"),
                },
                Action::Rotate {
                    dst,
                    order_id,
                    price,
                    size,
                    ..
                } => {
                    if let Some(cancel_id) = order_id {
                        match cursor.next() {
                            Some(OpResult::Cancelled) => {}
                            Some(OpResult::Failed { reason }) => {
                                warn!("rotation cancel of {cancel_id} failed: {reason}");
                                stale.insert(cancel_id);
                            }
                            other => warn!("unexpected op result {other:?} for rotation cancel"),
                        }
                    }
                    match cursor.next() {
                        Some(OpResult::Created { order_id }) => {
                            self.activate(&mut working, &mut shadow, dst, order_id, price, size)?;
                        }
                        Some(OpResult::Failed { reason }) => {
                            warn!("rotation create at slot {dst} failed: {reason}");
                            working.update(dst, |r| r.release(r.role))?;
                            needs_resync = true;
                        }
                        other => {
                            warn!("unexpected op result {other:?} for rotation create");
                            needs_resync = true;
                        }
                    }
                }
            }
        }

        shadow.accrue_op_fees(plan.op_fees);
        if let Err(e) = working.commit(&mut self.master) {
            // a commit raced a newer generation; the chain already
            // applied the batch, so only a resync can square us up
            error!("commit refused: {e}");
            return Ok(Followup::Resync);
        }
        let resume = shadow.resume(&self.master);
        self.ledger = shadow;
        if let Err(e) = resume {
            if matches!(self.note_ledger_issue(e), Followup::Resync) {
                needs_resync = true;
            }
        }

        if !stale.is_empty() {
            Ok(Followup::RecoverStale(stale))
        } else if needs_resync {
            Ok(Followup::Resync)
        } else {
            Ok(Followup::None)
        }
    }

    /// Mark a confirmed creation live in the working grid and project
    /// the chain-side fund lock.
    fn activate(
        &self,
        working: &mut WorkingGrid,
        shadow: &mut crate::ledger::Ledger,
        slot: usize,
        order_id: String,
        price: crate::asset::Price,
        size: crate::asset::Amount,
    ) -> Result<()> {
        let side = working
            .view()
            .slot(slot)?
            .role
            .committed_side()
            .unwrap_or_else(|| working.side_of_index(slot));
        shadow.lock(side, size)?;
        working.update(slot, |r| {
            r.mark_active(
                order_id,
                RawOnChain {
                    for_sale: size,
                    to_receive: match side {
                        Side::Sell => price.quote_amount(size),
                        Side::Buy => price.base_amount(size),
                    },
                },
            );
        })
    }

    fn requeue(&mut self, fills: Vec<QueuedFill>) {
        for queued in fills {
            self.enqueue(queued);
        }
    }

    /// Classify a ledger error into followup work. Recoverable
    /// breaches recalculate once and continue; critical ones resync.
    fn note_ledger_issue(&mut self, err: Error) -> Followup {
        match err {
            Error::Invariant {
                severity: Severity::Recoverable,
                ..
            } => {
                warn!("recoverable ledger breach: {err}; recalculating once");
                if self.ledger.recalculate(&self.master).is_err() {
                    Followup::Resync
                } else {
                    Followup::None
                }
            }
            Error::Invariant {
                severity: Severity::Critical,
                ..
            } => {
                error!("critical ledger breach: {err}; scheduling resync");
                Followup::Resync
            }
            other => {
                warn!("planning failed: {other}");
                Followup::None
            }
        }
    }

    async fn apply_followup(&mut self, followup: Followup, cancel: &CancelToken) -> Result<bool> {
        match followup {
            Followup::None => Ok(true),
            Followup::RefreshTotals => {
                self.refresh_totals(cancel).await?;
                Ok(true)
            }
            Followup::Resync => {
                self.resync(cancel).await?;
                Ok(self.status == WorkerStatus::Normal)
            }
            Followup::RecoverStale(ids) => {
                self.recover_stale(ids, cancel).await?;
                Ok(true)
            }
        }
    }

    /// Pull a fresh balance snapshot under the fund lock.
    async fn refresh_totals(&mut self, cancel: &CancelToken) -> Result<()> {
        let _fund = self.locks.fund.acquire(self.lock_timeout(), cancel).await?;
        let totals = match self.chain.account_totals().await {
            Ok(t) => t,
            Err(e) => {
                warn!("balance refresh failed: {e}");
                return Ok(());
            }
        };
        self.ledger.set_chain_totals(
            totals.buy_total,
            totals.buy_free,
            totals.sell_total,
            totals.sell_free,
        )?;
        self.mark_queue_settled();
        if let Err(e) = self.ledger.recalculate(&self.master) {
            if matches!(self.note_ledger_issue(e), Followup::Resync) {
                self.status = WorkerStatus::Resyncing;
            }
        }
        Ok(())
    }

    /// Stale-order recovery: free the affected slots, record their
    /// completed fills at most once, then trust a fresh snapshot.
    async fn recover_stale(&mut self, ids: HashSet<String>, cancel: &CancelToken) -> Result<()> {
        let now = now_ms();
        self.reconciler.mark_stale_cleaned(ids.iter().cloned(), now);

        let _rec = self.locks.reconcile.acquire(self.lock_timeout(), cancel).await?;
        cancel.check()?;
        let _grid = self.locks.grid.acquire(self.lock_timeout(), cancel).await?;

        let mut working = WorkingGrid::fork(&self.master);
        for id in &ids {
            if let Some(idx) = self.master.find_by_order_id(id) {
                info!("releasing slot {idx} held by stale order {id}");
                working.update(idx, |r| r.release(OrderRole::Spread))?;
            }
        }

        // the stale order may have completed rather than vanished;
        // its history entries are recorded exactly once
        match self.chain.fill_history(0).await {
            Ok(history) => {
                for fill in history {
                    if ids.contains(&fill.order_id) {
                        self.processed_fills.entry(fill.key()).or_insert(now);
                    }
                }
            }
            Err(e) => warn!("fill history unavailable during stale recovery: {e}"),
        }

        let _fund = self.locks.fund.acquire(self.lock_timeout(), cancel).await?;
        if let Err(e) = working.commit(&mut self.master) {
            error!("stale recovery commit refused: {e}");
            return Ok(());
        }
        // the queued fills for these orders were not applied; balances
        // are deliberately left alone so their replay credits exactly
        // once, and the released lock surfaces at the next snapshot
        if let Err(e) = self.ledger.recalculate(&self.master) {
            let _ = self.note_ledger_issue(e);
        }
        drop(_fund);
        drop(_grid);
        drop(_rec);
        self.persist(cancel).await;
        Ok(())
    }

    /// Periodic / error-triggered resync: fresh totals, one walk over
    /// the book for price corrections, then housekeeping.
    pub(crate) async fn resync(&mut self, cancel: &CancelToken) -> Result<()> {
        self.status = WorkerStatus::Resyncing;
        let outcome = {
            let _rec = self.locks.reconcile.acquire(self.lock_timeout(), cancel).await?;
            cancel.check()?;
            let resync = match self.reconciler.resync(self.chain.as_ref(), &self.master).await {
                Ok(resync) => resync,
                Err(e) => {
                    warn!("resync pass failed: {e}");
                    self.status = WorkerStatus::Normal;
                    return Ok(());
                }
            };

            let _grid = self.locks.grid.acquire(self.lock_timeout(), cancel).await?;
            let _fund = self.locks.fund.acquire(self.lock_timeout(), cancel).await?;
            self.ledger.set_chain_totals(
                resync.totals.buy_total,
                resync.totals.buy_free,
                resync.totals.sell_total,
                resync.totals.sell_free,
            )?;
            self.mark_queue_settled();
            match self.ledger.recalculate(&self.master) {
                Ok(()) => {}
                Err(e) => {
                    if matches!(self.note_ledger_issue(e), Followup::Resync) {
                        // a fresh snapshot that still will not balance
                        // is unrecoverable
                        self.status = WorkerStatus::Halted;
                        return Ok(());
                    }
                }
            }

            if resync.corrections.is_empty() {
                None
            } else {
                let working = WorkingGrid::fork(&self.master);
                let mut plan = crate::planner::Plan::new();
                for action in resync.corrections {
                    plan.push(action);
                }
                let shadow = self.ledger.snapshot();
                let result = self.executor.execute(&plan, &working, &shadow).await;
                Some(
                    self.settle(
                        PlanOutcome {
                            plan,
                            working,
                            shadow,
                        },
                        result,
                        Vec::new(),
                        cancel,
                    )
                    .await?,
                )
            }
        };

        self.reconciler.prune_stale_cleaned(now_ms());
        self.status = WorkerStatus::Normal;
        if let Some(followup) = outcome {
            if let Followup::RecoverStale(ids) = followup {
                self.recover_stale(ids, cancel).await?;
            }
        }
        self.persist(cancel).await;
        Ok(())
    }

    /// Shift the boundary at most one slot toward the heavier side;
    /// role patches and the new index land in one commit, with no
    /// broadcast involved.
    async fn boundary_sync(&mut self, cancel: &CancelToken) -> Result<()> {
        let _grid = self.locks.grid.acquire(self.lock_timeout(), cancel).await?;
        let Some(outcome) = self.planner.plan_boundary_sync(&self.master, &self.ledger)? else {
            return Ok(());
        };
        let _fund = self.locks.fund.acquire(self.lock_timeout(), cancel).await?;
        if let Err(e) = outcome.working.commit(&mut self.master) {
            warn!("boundary sync commit refused: {e}");
            return Ok(());
        }
        info!("boundary shifted to {}", self.master.boundary_idx);
        if let Err(e) = self.ledger.recalculate(&self.master) {
            let _ = self.note_ledger_issue(e);
        }
        Ok(())
    }

    /// Divergence and spread maintenance share the pipeline shape of a
    /// fill cycle, minus the fill lock.
    async fn run_maintenance(&mut self, kind: Maintenance, cancel: &CancelToken) -> Result<()> {
        let followup = {
            let _grid = self.locks.grid.acquire(self.lock_timeout(), cancel).await?;
            self.status = WorkerStatus::Rebalancing;
            self.pipeline_since = Some(now_ms());

            let planned = match kind {
                Maintenance::Spread => self.planner.plan_spread_correction(&self.master, &self.ledger),
                Maintenance::Divergence => self.planner.plan_divergence(&self.master, &self.ledger),
            };
            let outcome = match planned {
                Ok(Some(outcome)) => outcome,
                Ok(None) => {
                    self.status = WorkerStatus::Normal;
                    self.pipeline_since = None;
                    return Ok(());
                }
                Err(e) => {
                    self.status = WorkerStatus::Normal;
                    self.pipeline_since = None;
                    let followup = self.note_ledger_issue(e);
                    drop(_grid);
                    self.apply_followup(followup, cancel).await?;
                    return Ok(());
                }
            };

            let _fund = self.locks.fund.acquire(self.lock_timeout(), cancel).await?;
            self.status = WorkerStatus::Broadcasting;
            let result = self
                .executor
                .execute(&outcome.plan, &outcome.working, &outcome.shadow)
                .await;
            let followup = self.settle(outcome, result, Vec::new(), cancel).await?;
            self.status = WorkerStatus::Normal;
            self.pipeline_since = None;
            followup
        };
        self.apply_followup(followup, cancel).await?;
        Ok(())
    }

    /// Full teardown on explicit request: cancel everything on chain,
    /// rebuild the grid from config, reconcile from scratch.
    async fn reset(&mut self, cancel: &CancelToken) -> Result<()> {
        info!("{}: reset requested; tearing down grid", self.cfg.bot_key);
        let followup = {
            let _grid = self.locks.grid.acquire(self.lock_timeout(), cancel).await?;
            let outcome = self.planner.plan_reset(&self.master, &self.ledger)?;
            let _fund = self.locks.fund.acquire(self.lock_timeout(), cancel).await?;
            self.status = WorkerStatus::Broadcasting;
            let result = self
                .executor
                .execute(&outcome.plan, &outcome.working, &outcome.shadow)
                .await;
            let followup = self.settle(outcome, result, Vec::new(), cancel).await?;
            self.status = WorkerStatus::Normal;
            self.pipeline_since = None;
            followup
        };
        self.apply_followup(followup, cancel).await?;

        // rebuild from config and rerun startup reconciliation against
        // the emptied book
        self.session_id = now_ms();
        {
            let _rec = self.locks.reconcile.acquire(self.lock_timeout(), cancel).await?;
            cancel.check()?;
            let boot = self
                .reconciler
                .bootstrap(self.chain.as_ref(), None, self.session_id, now_ms())
                .await?;
            let _grid = self.locks.grid.acquire(self.lock_timeout(), cancel).await?;
            let _fund = self.locks.fund.acquire(self.lock_timeout(), cancel).await?;
            self.master = boot.grid;
            self.ledger = boot.ledger;
            // the replay shield survives a reset
        }
        self.persist(cancel).await;
        info!("{}: grid rebuilt after reset", self.cfg.bot_key);
        Ok(())
    }

    /// Flush state to disk under the persist lock. Disk trouble is
    /// logged and flagged; memory stays authoritative and the next
    /// commit retries.
    async fn persist(&mut self, cancel: &CancelToken) {
        let guard = self.locks.persist.acquire(self.lock_timeout(), cancel).await;
        if guard.is_err() {
            warn!("persist lock unavailable; state flush skipped");
            return;
        }
        let now = now_ms();
        let mut state = PersistedState::capture(
            &self.cfg.bot_key,
            &self.master,
            &self.ledger,
            &self.processed_fills,
            now,
        );
        if let Err(e) = self.store.save(&mut state, now) {
            warn!(
                "state write to {:?} failed ({e}); in-memory state remains authoritative",
                self.store.path()
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Maintenance {
    Spread,
    Divergence,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::SidePair;
    use crate::chain::mock::MockChain;
    use crate::chain::AccountTotals;
    use crate::config::tests::test_config;
    use crate::grid::{OrderRole, OrderState};
    use crate::reconciler::tests::s1_chain;
    use crate::sync::cancel_pair;

    fn token() -> CancelToken {
        let (handle, token) = cancel_pair();
        std::mem::forget(handle);
        token
    }

    /// Worker bootstrapped against the S1 book, with its state file in
    /// a scratch directory.
    async fn seeded_worker() -> (Worker, Arc<MockChain>, tempfile::TempDir) {
        let chain = Arc::new(s1_chain().await);
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config();
        cfg.weight_distribution = SidePair::new(1.0, 1.0);
        cfg.state_dir = dir.path().to_path_buf();
        let worker = Worker::bootstrap(cfg, chain.clone()).await.unwrap();
        (worker, chain, dir)
    }

    /// The taker consumption of the 995 buy: 10^12 B paid out,
    /// 10.0502 A received.
    fn buy_fill() -> FillEvent {
        FillEvent {
            order_id: "1.7.4".into(),
            block_num: 7_000,
            history_id: 3,
            paid: 1_000_000_000_000,
            received: 100_502,
            fee: 0,
            is_maker: true,
        }
    }

    async fn apply_buy_fill_on_chain(chain: &MockChain, sell_free_extra: u64) {
        chain.remove_open_order("1.7.4").await;
        chain
            .set_totals(AccountTotals {
                buy_total: 2_000_000_000_000,
                buy_free: 0,
                sell_total: 130_502,
                sell_free: 100_502 + sell_free_extra,
            })
            .await;
    }

    #[tokio::test]
    async fn test_bootstrap_reaches_normal() {
        let (worker, _chain, _dir) = seeded_worker().await;
        assert_eq!(worker.status(), WorkerStatus::Normal);
        assert_eq!(worker.grid().live_count(Side::Buy), 3);
        assert_eq!(worker.grid().live_count(Side::Sell), 3);
        assert!(worker.ledger().check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_s2_full_fill_triggers_rotation() {
        let (mut worker, chain, _dir) = seeded_worker().await;
        let cancel = token();
        let buy_slot = worker.grid().find_by_order_id("1.7.4").unwrap();
        apply_buy_fill_on_chain(&chain, 0).await;

        worker
            .handle_event(WorkerEvent::Fill(buy_fill()), &cancel)
            .await
            .unwrap();

        assert_eq!(worker.status(), WorkerStatus::Normal);
        assert_eq!(chain.broadcast_count().await, 1);

        // the filled slot joined the spread window
        assert!(worker.grid().find_by_order_id("1.7.4").is_none());
        assert_eq!(worker.grid().slots[buy_slot].role, OrderRole::Spread);

        // proceeds became a sell just above the filled buy; the sell
        // side was at its cap, so the far sell edge went with it
        let open = chain.open_order_ids().await;
        assert!(open.contains(&"1.7.100".to_string()));
        assert!(!open.contains(&"1.7.3".to_string()));
        let new_slot = worker.grid().find_by_order_id("1.7.100").unwrap();
        let rec = &worker.grid().slots[new_slot];
        assert_eq!(rec.role, OrderRole::Sell);
        assert_eq!(rec.state, OrderState::Active);
        assert_eq!(rec.size, 100_502);
        assert!(new_slot > buy_slot);

        // ledger agrees with the chain and conserves funds
        assert!(worker.ledger().check_invariants().is_ok());
        assert_eq!(worker.ledger().side(Side::Sell).chain_free, 10_000);
        assert_eq!(worker.ledger().cache(Side::Sell), 10_000);
        assert_eq!(
            worker.ledger().side(Side::Buy).chain_total,
            2_000_000_000_000
        );

        // the fill is recorded and a replayed delivery is a no-op
        assert!(worker.processed_fills.contains_key("1.7.4:7000:3"));
        worker
            .handle_event(WorkerEvent::Fill(buy_fill()), &cancel)
            .await
            .unwrap();
        assert_eq!(chain.broadcast_count().await, 1);
    }

    #[tokio::test]
    async fn test_s5_stale_order_in_batch() {
        let (mut worker, chain, _dir) = seeded_worker().await;
        let cancel = token();
        let stale_slot = worker.grid().find_by_order_id("1.7.3").unwrap();

        // the far sell edge vanished behind the worker's back, and the
        // 995 buy fills, so the rotation will reference the dead id
        chain.remove_open_order("1.7.3").await;
        apply_buy_fill_on_chain(&chain, 10_000).await;

        worker
            .handle_event(WorkerEvent::Fill(buy_fill()), &cancel)
            .await
            .unwrap();

        // first broadcast bounced, recovery ran, the re-plan went out
        assert_eq!(chain.broadcast_count().await, 2);
        let log = chain.broadcast_log().await;
        let replan = log.last().unwrap();
        assert!(
            replan.iter().all(|op| !matches!(
                op,
                ChainOp::Cancel { order_id } | ChainOp::Update { order_id, .. }
                    if order_id == "1.7.3"
            )),
            "re-plan must not reference the stale id"
        );

        // the stale slot is a placeholder again and the fill landed once
        assert_eq!(worker.grid().slots[stale_slot].state, OrderState::Virtual);
        assert!(worker.grid().find_by_order_id("1.7.3").is_none());
        assert!(worker.processed_fills.contains_key("1.7.4:7000:3"));
        assert!(worker.reconciler.is_stale_cleaned("1.7.3"));
        assert!(worker.ledger().check_invariants().is_ok());

        // the replacement sell is live
        let new_slot = worker.grid().find_by_order_id("1.7.100").unwrap();
        assert_eq!(worker.grid().slots[new_slot].size, 100_502);
        assert_eq!(worker.status(), WorkerStatus::Normal);
    }

    #[tokio::test]
    async fn test_s6_adaptive_batching_under_burst() {
        let (mut worker, chain, _dir) = seeded_worker().await;
        let cancel = token();

        // 29 fills land while the worker is resyncing: they buffer
        worker.status = WorkerStatus::Resyncing;
        for i in 0..29u64 {
            let fill = FillEvent {
                order_id: format!("9.9.{i}"),
                block_num: 8_000 + i,
                history_id: i,
                paid: 1,
                received: 1,
                fee: 0,
                is_maker: false,
            };
            worker
                .handle_event(WorkerEvent::Fill(fill), &cancel)
                .await
                .unwrap();
        }
        assert_eq!(worker.queue.len(), 29);
        assert_eq!(chain.broadcast_count().await, 0);

        // drain: tiers 1/2/3/4 bound every cycle at four fills
        let before = worker.grid().generation;
        worker.status = WorkerStatus::Normal;
        while !worker.queue.is_empty() {
            worker.process_fills(&cancel).await.unwrap();
        }
        let cycles = worker.grid().generation - before;
        assert_eq!(cycles, 11, "29 fills over 4/4/4/3/3/3/2/2/2/1/1");

        // every fill accounted for exactly once, none dropped
        for i in 0..29u64 {
            assert!(worker
                .processed_fills
                .contains_key(&format!("9.9.{i}:{}:{i}", 8_000 + i)));
        }
        assert!(worker.ledger().check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_state() {
        let (mut worker, _chain, _dir) = seeded_worker().await;
        let cancel = token();
        let path = worker.cfg.state_path();
        assert!(!path.exists());

        let keep_going = worker
            .handle_event(WorkerEvent::Shutdown, &cancel)
            .await
            .unwrap();
        assert!(!keep_going);
        assert!(path.exists());

        let store = StateStore::new(path, 3_600_000);
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.generation, worker.grid().generation);
        assert!(saved.previous_session_marker);
    }

    #[tokio::test]
    async fn test_fills_buffer_while_pipeline_busy() {
        let (mut worker, chain, _dir) = seeded_worker().await;
        let cancel = token();
        apply_buy_fill_on_chain(&chain, 0).await;

        worker.status = WorkerStatus::Broadcasting;
        worker.pipeline_since = Some(now_ms());
        worker
            .handle_event(WorkerEvent::Fill(buy_fill()), &cancel)
            .await
            .unwrap();
        assert_eq!(worker.queue.len(), 1);
        assert_eq!(chain.broadcast_count().await, 0);

        // maintenance events are dropped outright while busy
        worker
            .handle_event(WorkerEvent::DivergenceCheck, &cancel)
            .await
            .unwrap();
        assert_eq!(chain.broadcast_count().await, 0);
    }

    #[tokio::test]
    async fn test_watchdog_unblocks_stuck_pipeline() {
        let (mut worker, _chain, _dir) = seeded_worker().await;
        let cancel = token();
        worker.status = WorkerStatus::Rebalancing;
        worker.pipeline_since =
            Some(now_ms() - worker.cfg.pipeline_timeout_secs * 1_000 - 1_000);

        // any event runs the watchdog first
        worker
            .handle_event(WorkerEvent::SpreadCheck, &cancel)
            .await
            .unwrap();
        assert_ne!(worker.status(), WorkerStatus::Rebalancing);
    }
}
