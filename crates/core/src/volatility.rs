//! Realized volatility from per-minute price extrema.

/// Annualization factor for one-minute bars: 252 days of 390 minutes.
const MINUTES_PER_YEAR: f64 = 252.0 * 390.0;

/// Realized volatility of a single one-minute bar from its low and high.
#[must_use]
pub fn realized_vol(low: f64, high: f64) -> f64 {
    (MINUTES_PER_YEAR * (low / high).ln().powi(2)).sqrt()
}

/// Realized volatility of the most recent bar. NaN without data.
#[must_use]
pub fn realized_vol_last(extrema: &[(f64, f64)]) -> f64 {
    extrema
        .last()
        .map_or(f64::NAN, |(low, high)| realized_vol(*low, *high))
}

/// Mean realized volatility across all bars. NaN without data.
#[must_use]
pub fn realized_vol_ma(extrema: &[(f64, f64)]) -> f64 {
    if extrema.is_empty() {
        return f64::NAN;
    }
    let total: f64 = extrema
        .iter()
        .map(|(low, high)| realized_vol(*low, *high))
        .sum();
    total / extrema.len() as f64
}

/// Mean of the finite values, NaN when there are none.
#[must_use]
pub fn mean_ignoring_nan(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_bar_has_zero_vol() {
        assert_eq!(realized_vol(100.0, 100.0), 0.0);
    }

    #[test]
    fn one_percent_range_annualizes() {
        let vol = realized_vol(99.0, 100.0);
        let expected = (252.0_f64 * 390.0).sqrt() * (100.0_f64 / 99.0).ln();
        assert!((vol - expected).abs() < 1e-9);
    }

    #[test]
    fn empty_extrema_are_nan() {
        assert!(realized_vol_last(&[]).is_nan());
        assert!(realized_vol_ma(&[]).is_nan());
    }

    #[test]
    fn last_uses_final_bar_and_ma_averages() {
        let bars = [(100.0, 100.0), (99.0, 100.0)];
        assert!((realized_vol_last(&bars) - realized_vol(99.0, 100.0)).abs() < 1e-12);
        assert!((realized_vol_ma(&bars) - realized_vol(99.0, 100.0) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn nan_values_are_skipped_in_mean() {
        assert!((mean_ignoring_nan([0.2, f64::NAN, 0.4]) - 0.3).abs() < 1e-12);
        assert!(mean_ignoring_nan([f64::NAN]).is_nan());
        assert!(mean_ignoring_nan(Vec::new()).is_nan());
    }
}
