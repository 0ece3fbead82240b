//! Integer base-unit amounts, sides, and rational prices
//!
//! All ledger and planner arithmetic runs on integer base units
//! ("satoshis"): `floor(human * 10^precision)`. Floats appear only at
//! the configuration edge and in display formatting.

use serde::{Deserialize, Serialize};

/// Balance or order size in base units of some asset.
pub type Amount = u64;

/// Which side of the book funds belong to.
///
/// The SELL side accounts the base asset (assetA); the BUY side the
/// quote asset (assetB). An order's size is denominated in the base
/// units of the asset its side commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// A pair of values keyed by side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidePair<T> {
    pub buy: T,
    pub sell: T,
}

impl<T> SidePair<T> {
    pub fn new(buy: T, sell: T) -> Self {
        Self { buy, sell }
    }

    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }
}

/// Decimal precision of the two assets in a trading pair.
///
/// `base` is assetA (the asset SELL slots offer), `quote` is assetB.
/// Precisions come from chain metadata and must never be defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairPrecision {
    pub base: u32,
    pub quote: u32,
}

impl PairPrecision {
    pub fn new(base: u32, quote: u32) -> Self {
        Self { base, quote }
    }

    /// Precision of the asset the given side commits.
    pub fn committed(&self, side: Side) -> u32 {
        match side {
            Side::Buy => self.quote,
            Side::Sell => self.base,
        }
    }
}

/// Convert a human-readable quantity to base units (config edge only).
pub fn to_base_units(human: f64, precision: u32) -> Amount {
    (human * 10f64.powi(precision as i32)).floor() as Amount
}

/// Render base units as a human decimal string, side-aware via precision.
pub fn format_by_precision(amount: Amount, precision: u32) -> String {
    let unit = 10u64.pow(precision);
    let whole = amount / unit;
    let frac = amount % unit;
    if precision == 0 {
        format!("{whole}")
    } else {
        format!("{whole}.{frac:0width$}", width = precision as usize)
    }
}

/// Integer division rounding half to even (banker's rounding).
pub fn div_round_half_even(n: u128, d: u128) -> u128 {
    debug_assert!(d > 0);
    let q = n / d;
    let r = n % d;
    let twice = r * 2;
    if twice > d || (twice == d && q % 2 == 1) {
        q + 1
    } else {
        q
    }
}

/// Price of the base asset expressed as an integer pair: `num` quote
/// base units are exchanged for `den` base base units.
///
/// Comparison is by cross multiplication in `u128`; no float ever
/// enters an ordering or tolerance decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Price {
    pub num: u64,
    pub den: u64,
}

impl Price {
    pub fn new(num: u64, den: u64) -> Self {
        debug_assert!(den > 0);
        Self { num, den }
    }

    /// Build a price from a human quote-per-base number at the config
    /// edge. `num = round(p * 10^quote_precision)`, `den = 10^base`.
    pub fn from_human(p: f64, precision: PairPrecision) -> Self {
        let num = (p * 10f64.powi(precision.quote as i32)).round() as u64;
        let den = 10u64.pow(precision.base);
        Self { num, den }
    }

    /// Quote base units bought/sold for `base_size` base units, rounded down.
    pub fn quote_amount(&self, base_size: Amount) -> Amount {
        (base_size as u128 * self.num as u128 / self.den as u128) as Amount
    }

    /// Base base units corresponding to `quote_size` quote units, rounded down.
    pub fn base_amount(&self, quote_size: Amount) -> Amount {
        debug_assert!(self.num > 0);
        (quote_size as u128 * self.den as u128 / self.num as u128) as Amount
    }

    /// Next rung on a geometric ladder: multiply by `1 + step_bps/10000`.
    pub fn step_up(&self, step_bps: u32) -> Self {
        let num = self.num as u128 * (10_000 + step_bps as u128) / 10_000;
        Self {
            num: num as u64,
            den: self.den,
        }
    }

    /// Scale by the rational `mul/div` (used for spread-edge offsets).
    pub fn scaled(&self, mul: u64, div: u64) -> Self {
        let num = self.num as u128 * mul as u128 / div as u128;
        Self {
            num: num as u64,
            den: self.den,
        }
    }

    /// Absolute relative distance from `other`, in basis points of `other`.
    pub fn diff_bps(&self, other: &Price) -> u64 {
        let a = self.num as u128 * other.den as u128;
        let b = other.num as u128 * self.den as u128;
        if b == 0 {
            return u64::MAX;
        }
        let diff = a.abs_diff(b);
        (diff.saturating_mul(10_000) / b).min(u64::MAX as u128) as u64
    }

    /// True when the relative distance to `other` is within `tol_bps`.
    pub fn within_bps(&self, other: &Price, tol_bps: u64) -> bool {
        self.diff_bps(other) <= tol_bps
    }

    /// Display only. Never feed the result back into planning math.
    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl PartialEq for Price {
    fn eq(&self, other: &Self) -> bool {
        self.num as u128 * other.den as u128 == other.num as u128 * self.den as u128
    }
}

impl Eq for Price {}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.num as u128 * other.den as u128).cmp(&(other.num as u128 * self.den as u128))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prec() -> PairPrecision {
        // assetA precision 4, assetB precision 8
        PairPrecision::new(4, 8)
    }

    #[test]
    fn test_base_unit_conversion() {
        assert_eq!(to_base_units(3.0, 4), 30_000);
        assert_eq!(to_base_units(30_000.0, 8), 3_000_000_000_000);
        assert_eq!(format_by_precision(30_000, 4), "3.0000");
        assert_eq!(format_by_precision(123_456, 4), "12.3456");
        assert_eq!(format_by_precision(7, 0), "7");
    }

    #[test]
    fn test_price_amounts() {
        let p = Price::from_human(1000.0, prec());
        // 1.0000 assetA at 1000 B/A = 1000.00000000 assetB
        assert_eq!(p.quote_amount(10_000), 100_000_000_000);
        assert_eq!(p.base_amount(100_000_000_000), 10_000);
    }

    #[test]
    fn test_price_ordering() {
        let lo = Price::from_human(995.0, prec());
        let hi = Price::from_human(1005.0, prec());
        assert!(lo < hi);
        assert_eq!(lo, Price::from_human(995.0, prec()));
    }

    #[test]
    fn test_price_ladder_strictly_increases() {
        let mut p = Price::from_human(100.0, prec());
        for _ in 0..200 {
            let next = p.step_up(50);
            assert!(next > p);
            p = next;
        }
    }

    #[test]
    fn test_diff_bps() {
        let a = Price::from_human(1000.0, prec());
        let b = Price::from_human(1005.0, prec());
        // 0.5% below b
        assert_eq!(a.diff_bps(&b), 49); // floor((5/1005)*10000)
        assert!(b.within_bps(&a, 51));
        assert!(!b.within_bps(&a, 40));
    }

    #[test]
    fn test_div_round_half_even() {
        assert_eq!(div_round_half_even(5, 2), 2); // 2.5 -> 2 (even)
        assert_eq!(div_round_half_even(7, 2), 4); // 3.5 -> 4 (even)
        assert_eq!(div_round_half_even(9, 4), 2); // 2.25 -> 2
        assert_eq!(div_round_half_even(11, 4), 3); // 2.75 -> 3
    }
}
