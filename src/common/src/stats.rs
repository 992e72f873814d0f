//! Small descriptive statistics over Decimal prices.

use rust_decimal::prelude::MathematicalOps;
use rust_decimal::Decimal;

/// Arithmetic mean. None for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().copied().sum();
    Some(sum / Decimal::from(values.len()))
}

/// Median (average of the two middle values for even counts).
pub fn median(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / Decimal::TWO)
    } else {
        Some(sorted[mid])
    }
}

/// Sample standard deviation (n - 1 denominator). None with fewer than two
/// values.
pub fn sample_std_dev(values: &[Decimal]) -> Option<Decimal> {
    if values.len() < 2 {
        return None;
    }
    let avg = mean(values)?;
    let sum_sq: Decimal = values.iter().map(|v| (*v - avg) * (*v - avg)).sum();
    let variance = sum_sq / Decimal::from(values.len() - 1);
    variance.sqrt()
}

/// Percentage change from `previous` to `current`. None when previous is zero.
pub fn pct_change(current: Decimal, previous: Decimal) -> Option<Decimal> {
    if previous.is_zero() {
        return None;
    }
    Some((current - previous) / previous * Decimal::ONE_HUNDRED)
}

/// Round a derived statistic for storage.
pub fn round_stat(value: Decimal) -> Decimal {
    value.round_dp(4)
}
