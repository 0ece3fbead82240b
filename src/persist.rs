//! Per-worker state file
//!
//! One JSON document per bot key. Writes reload the file first so a
//! concurrent writer's processed-fill entries survive, prune expired
//! dedup entries, and land through a temp file + rename. The in-memory
//! state stays authoritative when the disk misbehaves; the write is
//! retried on the next commit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::asset::{Amount, PairPrecision, SidePair};
use crate::errors::Result;
use crate::grid::{Grid, OrderRecord};
use crate::ledger::{Ledger, SideLedger};

/// Grid portion of the state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedGrid {
    pub boundary_idx: usize,
    pub gap_slots: usize,
    pub increment_bps: u32,
    pub slots: Vec<OrderRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedLedger {
    pub buy: SideLedger,
    pub sell: SideLedger,
}

/// Everything a worker persists between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub bot_key: String,
    pub session_id: u64,
    pub generation: u64,
    pub grid: PersistedGrid,
    pub ledger: PersistedLedger,
    /// Kept outside the per-side ledger blocks in the document layout.
    pub cache_funds: SidePair<Amount>,
    pub fees_owed: Amount,
    /// "orderId:blockNum:historyId" -> first-seen ms, the restart
    /// replay shield.
    #[serde(default)]
    pub processed_fills: HashMap<String, u64>,
    /// True on any file written by a completed session; loading code
    /// treats the recorded orders as potentially stale.
    #[serde(default)]
    pub previous_session_marker: bool,
    #[serde(default)]
    pub last_updated_ms: u64,
}

impl PersistedState {
    /// Snapshot live state into the document layout.
    pub fn capture(
        bot_key: &str,
        grid: &Grid,
        ledger: &Ledger,
        processed_fills: &HashMap<String, u64>,
        now_ms: u64,
    ) -> Self {
        let strip = |side: &SideLedger| SideLedger {
            cache_funds: 0,
            ..side.clone()
        };
        Self {
            bot_key: bot_key.to_string(),
            session_id: grid.session_id,
            generation: grid.generation,
            grid: PersistedGrid {
                boundary_idx: grid.boundary_idx,
                gap_slots: grid.gap_slots,
                increment_bps: grid.increment_bps,
                slots: grid.slots.clone(),
            },
            ledger: PersistedLedger {
                buy: strip(&ledger.buy),
                sell: strip(&ledger.sell),
            },
            cache_funds: SidePair::new(ledger.buy.cache_funds, ledger.sell.cache_funds),
            fees_owed: ledger.fees_owed,
            processed_fills: processed_fills.clone(),
            previous_session_marker: true,
            last_updated_ms: now_ms,
        }
    }

    /// Rebuild the in-memory grid and ledger. The caller supplies the
    /// precision pair; it is never persisted (chain metadata wins).
    pub fn restore(&self, precision: PairPrecision) -> (Grid, Ledger) {
        let grid = Grid::from_parts(
            self.grid.slots.clone(),
            self.grid.boundary_idx,
            self.grid.gap_slots,
            self.session_id,
            self.generation,
            self.grid.increment_bps,
        );

        let mut ledger = Ledger::new(precision, None, 0);
        ledger.buy = self.ledger.buy.clone();
        ledger.sell = self.ledger.sell.clone();
        ledger.buy.cache_funds = self.cache_funds.buy;
        ledger.sell.cache_funds = self.cache_funds.sell;
        ledger.fees_owed = self.fees_owed;
        ledger.restore_precision(precision);
        (grid, ledger)
    }

    fn prune_fills(&mut self, now_ms: u64, ttl_ms: u64) {
        self.processed_fills
            .retain(|_, &mut seen| now_ms.saturating_sub(seen) < ttl_ms);
    }
}

/// Serialized access to one worker's state file.
pub struct StateStore {
    path: PathBuf,
    ttl_ms: u64,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, ttl_ms: u64) -> Self {
        Self {
            path: path.into(),
            ttl_ms: ttl_ms.max(3_600_000),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted document. Missing file is a clean first run;
    /// an unreadable one is logged and treated the same, the chain
    /// being the authority either way.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<PersistedState>(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("state file {:?} unreadable ({e}); starting fresh", self.path);
                Ok(None)
            }
        }
    }

    /// Write the document: reload first so another writer's dedup
    /// entries survive, prune expired entries, then temp + rename.
    pub fn save(&self, state: &mut PersistedState, now_ms: u64) -> Result<()> {
        if let Some(existing) = self.load()? {
            for (key, seen) in existing.processed_fills {
                state
                    .processed_fills
                    .entry(key)
                    .and_modify(|v| *v = (*v).max(seen))
                    .or_insert(seen);
            }
        }
        state.prune_fills(now_ms, self.ttl_ms);
        state.last_updated_ms = now_ms;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("state saved to {:?}", self.path);
        Ok(())
    }
}
