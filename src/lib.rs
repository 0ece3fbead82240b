//! Grid market-making core for an on-chain central limit order book
//!
//! One worker per trading pair places a geometric ladder of buy and
//! sell limit orders around a reference price, reacts to fills by
//! rotating the ladder with the market, and keeps an integer
//! base-unit ledger provably consistent with live chain balances
//! across restarts, partial executions, and transient failures.
//!
//! The crate is the planner/accountant/synchronizer core. The chain
//! RPC client, signer and subscription transport are consumed through
//! the [`chain::ChainAdapter`] trait; the process supervisor and
//! interactive tooling live outside.
//!
//! Pipeline for every event: fork the master grid into a working
//! copy, plan against it and a shadow ledger, broadcast the plan as
//! one atomic batch, and only on confirmation swap the working state
//! in under a generation guard. Failures discard the fork and hand
//! control to the reconciler, which treats the chain as the single
//! source of truth.

#![deny(unreachable_pub)]

pub mod asset;
pub mod chain;
pub mod config;
pub mod errors;
pub mod executor;
pub mod grid;
pub mod keyring;
pub mod ledger;
pub mod persist;
pub mod planner;
pub mod reconciler;
pub mod runner;
pub mod sync;
pub mod worker;

pub use asset::{Amount, PairPrecision, Price, Side, SidePair};
pub use chain::{ChainAdapter, ChainError};
pub use config::{BotConfig, Settings};
pub use errors::{Error, Result, Severity};
pub use executor::{BatchResult, Executor};
pub use grid::{FillEvent, Grid, OrderRecord, OrderRole, OrderState, WorkingGrid};
pub use ledger::Ledger;
pub use planner::{Action, Plan, Planner};
pub use reconciler::Reconciler;
pub use runner::{WorkerControl, WorkerRunner};
pub use worker::{Worker, WorkerEvent, WorkerStatus};
