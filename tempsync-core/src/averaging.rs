//! Averaging math: coordinator aggregation, worker update, stability predicate.

/// Largest spread between worker readings that still counts as converged.
pub const DEFAULT_TOLERANCE: f64 = 1e-4;

/// Weight of the coordinator's current estimate in the aggregation.
const ESTIMATE_WEIGHT: f64 = 2.0;

/// Next global estimate from the current one and one reading per worker:
/// `(2E + Σr) / (N + 2)`. Readings are summed in the given order.
pub fn next_estimate(current: f64, readings: &[f64]) -> f64 {
    let sum: f64 = readings.iter().sum();
    (ESTIMATE_WEIGHT * current + sum) / (readings.len() as f64 + ESTIMATE_WEIGHT)
}

/// Worker's next local value after receiving the central value: `(3L + 2C) / 5`.
pub fn local_update(local: f64, central: f64) -> f64 {
    (local * 3.0 + 2.0 * central) / 5.0
}

/// Maximum pairwise difference between readings (max − min). None if empty.
pub fn spread(readings: &[f64]) -> Option<f64> {
    let mut it = readings.iter().copied();
    let first = it.next()?;
    let (lo, hi) = it.fold((first, first), |(lo, hi), r| (lo.min(r), hi.max(r)));
    Some(hi - lo)
}

/// True when every pair of readings agrees within `tolerance`. An empty set is never stable.
pub fn is_stable(readings: &[f64], tolerance: f64) -> bool {
    match spread(readings) {
        Some(s) => s <= tolerance,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9
    }

    #[test]
    fn aggregation_formula() {
        assert!(approx(next_estimate(0.0, &[10.0, 20.0]), 7.5));
        // Four-worker case divides by six.
        let e = next_estimate(10.0, &[100.0, 22.0, 50.0, 40.0]);
        assert!(approx(e, (20.0 + 212.0) / 6.0));
        assert!(approx(next_estimate(3.0, &[9.0]), 5.0));
    }

    #[test]
    fn local_update_formula() {
        assert!(approx(local_update(10.0, 7.5), 9.0));
        assert!(approx(local_update(20.0, 7.5), 15.0));
        assert!(approx(local_update(5.0, 5.0), 5.0));
    }

    #[test]
    fn spread_is_max_minus_min() {
        assert_eq!(spread(&[]), None);
        assert_eq!(spread(&[4.0]), Some(0.0));
        assert_eq!(spread(&[3.0, 9.0, 1.0, 4.0]), Some(8.0));
    }

    #[test]
    fn stability_uses_all_pairs() {
        // Neighbours are each within tolerance but the extremes are not.
        let drifting = [0.0, 0.00006, 0.00012];
        assert!(!is_stable(&drifting, DEFAULT_TOLERANCE));
        assert!(is_stable(&[1.0, 1.00005, 0.99996], DEFAULT_TOLERANCE));
        assert!(is_stable(&[2.0, 2.0 + DEFAULT_TOLERANCE / 2.0], DEFAULT_TOLERANCE));
        assert!(!is_stable(&[], DEFAULT_TOLERANCE));
        assert!(is_stable(&[42.0], DEFAULT_TOLERANCE));
    }
}
