//! Worker configuration
//!
//! One `BotConfig` per trading pair, loaded through the `config` crate
//! (file source layered with `DEXGRID_`-prefixed environment
//! overrides). Validation runs before the worker enters its loop; a bad
//! increment or missing asset never reaches the planner.

use std::path::PathBuf;

use config::{Config, File};
use serde::{Deserialize, Serialize};

use crate::asset::{to_base_units, Amount, Side, SidePair};
use crate::errors::{Error, Result};

/// Grid price bound: absolute, or a multiple of the start price ("2x").
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PriceBound {
    Absolute(f64),
    Multiple(#[serde(with = "multiple_str")] f64),
}

impl PriceBound {
    pub fn resolve(&self, start_price: f64) -> f64 {
        match self {
            PriceBound::Absolute(p) => *p,
            PriceBound::Multiple(m) => m * start_price,
        }
    }
}

mod multiple_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let s = String::deserialize(d)?;
        let trimmed = s
            .strip_suffix(['x', 'X'])
            .ok_or_else(|| de::Error::custom(format!("expected \"Nx\" multiple, got '{s}'")))?;
        trimmed
            .parse::<f64>()
            .map_err(|e| de::Error::custom(format!("bad multiple '{s}': {e}")))
    }

    pub(super) fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{v}x"))
    }
}

/// Side budget: absolute human amount, or a percentage of the balance.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FundsSpec {
    Absolute(f64),
    Percent(#[serde(with = "percent_str")] f64),
}

impl FundsSpec {
    /// Resolve to base units against the side's total chain balance.
    pub fn resolve(&self, chain_total: Amount, precision: u32) -> Amount {
        match self {
            FundsSpec::Absolute(h) => to_base_units(*h, precision),
            FundsSpec::Percent(pct) => {
                (chain_total as u128 * (*pct * 100.0).round() as u128 / 10_000) as Amount
            }
        }
    }
}

mod percent_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let s = String::deserialize(d)?;
        let trimmed = s
            .strip_suffix('%')
            .ok_or_else(|| de::Error::custom(format!("expected \"N%\" percent, got '{s}'")))?;
        trimmed
            .parse::<f64>()
            .map_err(|e| de::Error::custom(format!("bad percent '{s}': {e}")))
    }

    pub(super) fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{v}%"))
    }
}

/// Where the reference price comes from.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StartPrice {
    Fixed(f64),
    /// "pool", "market" or "orderbook"
    Mode(String),
}

/// Per-pair configuration consumed by the core.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    /// Stable identifier; also names the state file.
    pub bot_key: String,
    /// Sell-side (base) asset symbol.
    pub asset_a: String,
    /// Buy-side (quote) asset symbol.
    pub asset_b: String,

    pub start_price: StartPrice,
    pub min_price: PriceBound,
    pub max_price: PriceBound,

    /// Geometric step between adjacent slots, percent, in (0.01, 10).
    pub increment_percent: f64,
    /// Target width of the empty zone around the boundary, percent.
    pub target_spread_percent: f64,
    /// Extra spread slack before correction fires, in target-spreads.
    #[serde(default = "default_spread_tolerance_steps")]
    pub spread_tolerance_steps: f64,

    /// Geometric size bias per side, in [-1, 2]; 0.5 is neutral.
    pub weight_distribution: SidePair<f64>,
    pub bot_funds: SidePair<FundsSpec>,
    /// Max concurrent on-chain orders per side.
    pub active_orders: SidePair<u32>,
    /// Minimum economic order size per side, human units.
    #[serde(default = "default_min_order_size")]
    pub min_order_size: SidePair<f64>,

    #[serde(default = "default_partial_dust")]
    pub partial_dust_threshold_percent: f64,
    #[serde(default = "default_divergence")]
    pub divergence_threshold_percent: f64,
    /// cacheFunds / grid allocation ratio that triggers regeneration.
    #[serde(default = "default_grid_regeneration")]
    pub grid_regeneration_percent: f64,

    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default = "default_recovery_retry_interval")]
    pub recovery_retry_interval_ms: u64,

    #[serde(default = "default_max_fill_batch")]
    pub max_fill_batch_size: usize,
    /// (queue depth threshold, fills per cycle) tiers, ascending.
    #[serde(default = "default_stress_tiers")]
    pub batch_stress_tiers: Vec<(usize, usize)>,

    #[serde(default = "default_fee_multiplier")]
    pub fee_reservation_multiplier: u32,

    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_pipeline_timeout")]
    pub pipeline_timeout_secs: u64,
    #[serde(default = "default_processed_fill_ttl")]
    pub processed_fill_ttl_secs: u64,

    #[serde(default = "default_max_broadcast_retries")]
    pub max_broadcast_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_spread_tolerance_steps() -> f64 {
    1.0
}

fn default_min_order_size() -> SidePair<f64> {
    SidePair::new(0.01, 0.01)
}

fn default_partial_dust() -> f64 {
    5.0
}

fn default_divergence() -> f64 {
    3.0
}

fn default_grid_regeneration() -> f64 {
    25.0
}

fn default_max_recovery_attempts() -> u32 {
    5
}

fn default_recovery_retry_interval() -> u64 {
    60_000
}

fn default_max_fill_batch() -> usize {
    4
}

fn default_stress_tiers() -> Vec<(usize, usize)> {
    vec![(0, 1), (4, 2), (10, 3), (20, 4)]
}

fn default_fee_multiplier() -> u32 {
    4
}

fn default_resync_interval() -> u64 {
    4 * 3600
}

fn default_lock_timeout() -> u64 {
    20_000
}

fn default_pipeline_timeout() -> u64 {
    300
}

fn default_processed_fill_ttl() -> u64 {
    3600
}

fn default_max_broadcast_retries() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

impl BotConfig {
    /// Validate the configuration; every failure is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.asset_a.is_empty() || self.asset_b.is_empty() || self.asset_a == self.asset_b {
            return Err(Error::Config("assetA/assetB must name two assets".into()));
        }
        if self.increment_percent <= 0.01 || self.increment_percent >= 10.0 {
            return Err(Error::Config(format!(
                "incrementPercent {} outside (0.01, 10)",
                self.increment_percent
            )));
        }
        if self.target_spread_percent <= 0.0 {
            return Err(Error::Config("targetSpreadPercent must be positive".into()));
        }
        for side in [Side::Buy, Side::Sell] {
            let w = *self.weight_distribution.get(side);
            if !(-1.0..=2.0).contains(&w) {
                return Err(Error::Config(format!(
                    "weightDistribution.{} {} outside [-1, 2]",
                    side.as_str(),
                    w
                )));
            }
        }
        if let StartPrice::Fixed(p) = self.start_price {
            if p <= 0.0 || !p.is_finite() {
                return Err(Error::Config("startPrice must be positive".into()));
            }
            let min = self.min_price.resolve(p);
            let max = self.max_price.resolve(p);
            if min <= 0.0 || min >= max {
                return Err(Error::Config(format!(
                    "price bounds [{min}, {max}] are not an increasing positive range"
                )));
            }
        }
        if self.batch_stress_tiers.is_empty()
            || self.batch_stress_tiers.windows(2).any(|w| w[0].0 >= w[1].0)
        {
            return Err(Error::Config(
                "batchStressTiers must be non-empty with ascending depth thresholds".into(),
            ));
        }
        if self.max_fill_batch_size == 0 {
            return Err(Error::Config("maxFillBatchSize must be at least 1".into()));
        }
        if self.max_recovery_attempts == 0 {
            return Err(Error::Config("maxRecoveryAttempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Geometric step in basis points.
    pub fn increment_bps(&self) -> u32 {
        (self.increment_percent * 100.0).round() as u32
    }

    /// Target spread in basis points.
    pub fn target_spread_bps(&self) -> u64 {
        (self.target_spread_percent * 100.0).round() as u64
    }

    /// Per-slot weight ratio for a side, in basis points of the
    /// previous slot's weight. `ratio = 2^(0.5 - d)`: 0.5 is flat,
    /// larger values concentrate size near the boundary, negative
    /// values push it toward the grid edge.
    pub fn weight_ratio_bps(&self, side: Side) -> u64 {
        let d = *self.weight_distribution.get(side);
        let ratio = 2f64.powf(0.5 - d);
        ((ratio * 10_000.0).round() as u64).clamp(100, 100_000)
    }

    /// Minimum economic size for a side, base units.
    pub fn min_order_units(&self, side: Side, precision: u32) -> Amount {
        to_base_units(*self.min_order_size.get(side), precision).max(1)
    }

    /// Dust threshold as basis points of the original size.
    pub fn dust_threshold_bps(&self) -> u64 {
        (self.partial_dust_threshold_percent * 100.0).round() as u64
    }

    /// State file path for this worker.
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.bot_key))
    }
}

/// Credential daemon connection parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyringConfig {
    pub socket_path: PathBuf,
    pub ready_path: PathBuf,
    /// Account whose signing key the worker requests.
    pub account_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Top-level settings document for one worker process.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bot: BotConfig,
    #[serde(default)]
    pub log: LogConfig,
    pub keyring: Option<KeyringConfig>,
}

impl Settings {
    /// Load settings from a file, with `DEXGRID_`-prefixed environment
    /// variables overriding file values.
    pub fn load(config_path: &str) -> Result<Self> {
        let raw = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(config::Environment::with_prefix("DEXGRID").separator("__"))
            .build()?;
        let settings: Settings = raw.try_deserialize().map_err(Error::from)?;
        settings.bot.validate()?;
        Ok(settings)
    }
}
