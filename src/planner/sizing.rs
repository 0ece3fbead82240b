//! Size allocation and batching arithmetic
//!
//! All in integer base units. Weights are geometric in the distance
//! from the boundary; division rounds half to even and the remainder
//! is surfaced so callers can bank it as cache funds.

use crate::asset::{div_round_half_even, Amount};

/// Weights are capped so `budget * weight` stays inside u128.
const WEIGHT_SCALE: u128 = 1_000_000;
const WEIGHT_CAP: u128 = 1_000_000_000_000_000;

/// Geometric weights `w_i = ratio^i` for `n` slots, `ratio` in basis
/// points. Index 0 is the slot nearest the boundary.
fn weights(n: usize, ratio_bps: u64) -> Vec<u128> {
    let mut out = Vec::with_capacity(n);
    let mut w = WEIGHT_SCALE;
    for _ in 0..n {
        out.push(w);
        w = (w.saturating_mul(ratio_bps as u128) / 10_000).clamp(1, WEIGHT_CAP);
    }
    out
}

/// Split `budget` across `n` slots by geometric weight. Returns the
/// per-slot sizes (index 0 nearest the boundary) and the unallocated
/// remainder. `sum(sizes) + remainder == budget` exactly.
pub fn allocate(budget: Amount, n: usize, ratio_bps: u64) -> (Vec<Amount>, Amount) {
    if n == 0 || budget == 0 {
        return (vec![0; n], budget);
    }
    let w = weights(n, ratio_bps);
    let total: u128 = w.iter().sum();
    let mut sizes = Vec::with_capacity(n);
    let mut allocated: Amount = 0;
    for wi in &w {
        let raw = div_round_half_even(budget as u128 * wi, total) as Amount;
        // never over-allocate past the budget on rounding-up slots
        let size = raw.min(budget - allocated);
        sizes.push(size);
        allocated += size;
    }
    (sizes, budget - allocated)
}

/// Fills to drain this cycle given the queue depth, from the
/// configured `(depth threshold, batch)` tiers, capped by `max_batch`.
pub fn adaptive_batch_size(queue_depth: usize, tiers: &[(usize, usize)], max_batch: usize) -> usize {
    let mut batch = 1;
    for &(threshold, size) in tiers {
        if queue_depth >= threshold {
            batch = size;
        }
    }
    batch.min(max_batch).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_flat_allocation() {
        let (sizes, rem) = allocate(1_000, 4, 10_000);
        assert_eq!(sizes, vec![250, 250, 250, 250]);
        assert_eq!(rem, 0);
    }

    #[test]
    fn test_center_heavy_allocation_decreases() {
        // ratio < 1: more size near the boundary
        let (sizes, _) = allocate(100_000, 5, 5_000);
        for pair in sizes.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        assert!(sizes[0] > sizes[4]);
    }

    #[test]
    fn test_edge_heavy_allocation_increases() {
        let (sizes, _) = allocate(100_000, 5, 20_000);
        assert!(sizes[0] < sizes[4]);
    }

    #[test]
    fn test_zero_slots_returns_budget() {
        let (sizes, rem) = allocate(500, 0, 10_000);
        assert!(sizes.is_empty());
        assert_eq!(rem, 500);
    }

    #[test]
    fn test_adaptive_batch_tiers() {
        let tiers = [(0, 1), (4, 2), (10, 3), (20, 4)];
        assert_eq!(adaptive_batch_size(0, &tiers, 4), 1);
        assert_eq!(adaptive_batch_size(3, &tiers, 4), 1);
        assert_eq!(adaptive_batch_size(4, &tiers, 4), 2);
        assert_eq!(adaptive_batch_size(15, &tiers, 4), 3);
        assert_eq!(adaptive_batch_size(29, &tiers, 4), 4);
        // the configured hard cap wins over the tier table
        assert_eq!(adaptive_batch_size(29, &tiers, 2), 2);
    }

    proptest! {
        /// Allocation is exact: sizes plus remainder reproduce the budget.
        #[test]
        fn prop_allocation_conserves_budget(
            budget in 0u64..10_000_000_000,
            n in 0usize..64,
            ratio in 100u64..40_000,
        ) {
            let (sizes, rem) = allocate(budget, n, ratio);
            prop_assert_eq!(sizes.len(), n);
            let total: u128 = sizes.iter().map(|&s| s as u128).sum::<u128>() + rem as u128;
            prop_assert_eq!(total, budget as u128);
        }

        #[test]
        fn prop_batch_size_within_bounds(depth in 0usize..10_000) {
            let tiers = [(0usize, 1usize), (4, 2), (10, 3), (20, 4)];
            let b = adaptive_batch_size(depth, &tiers, 4);
            prop_assert!((1..=4).contains(&b));
        }
    }
}
