//! Rough Black-Scholes pricing.
//!
//! Used as a sanity check on quoted bids and asks before orders go out, not as
//! a source of value to trade on.

use chrono::NaiveDateTime;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::errors::ValidationError;

/// Trading-day seconds per year used to normalize tenors.
const SECONDS_PER_YEAR: f64 = 252.0 * 24.0 * 60.0 * 60.0;

fn norm_cdf(x: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.cdf(x),
        Err(_) => f64::NAN,
    }
}

fn inputs_valid(spot: f64, strike: f64, t: f64, sigma: f64) -> bool {
    [spot, strike, t, sigma].iter().all(|v| v.is_finite() && *v > 0.0)
}

#[must_use]
pub fn d1(spot: f64, strike: f64, r: f64, sigma: f64, t: f64) -> f64 {
    ((spot / strike).ln() + (r + sigma * sigma / 2.0) * t) / (sigma * t.sqrt())
}

#[must_use]
pub fn d2(d1: f64, sigma: f64, t: f64) -> f64 {
    d1 - sigma * t.sqrt()
}

/// Hull (15.20). NaN when any of spot, strike, tenor or sigma is not positive.
#[must_use]
pub fn price_call(spot: f64, strike: f64, t: f64, sigma: f64, r: f64) -> f64 {
    if !inputs_valid(spot, strike, t, sigma) {
        return f64::NAN;
    }
    let d1 = d1(spot, strike, r, sigma, t);
    let d2 = d2(d1, sigma, t);
    let call = spot * norm_cdf(d1) - strike * (-r * t).exp() * norm_cdf(d2);
    call.max(0.0)
}

/// Hull (15.21). NaN when any of spot, strike, tenor or sigma is not positive.
#[must_use]
pub fn price_put(spot: f64, strike: f64, t: f64, sigma: f64, r: f64) -> f64 {
    if !inputs_valid(spot, strike, t, sigma) {
        return f64::NAN;
    }
    let d1 = d1(spot, strike, r, sigma, t);
    let d2 = d2(d1, sigma, t);
    let put = strike * (-r * t).exp() * norm_cdf(-d2) - spot * norm_cdf(-d1);
    put.max(0.0)
}

/// Time to `expiration` in years of continuous trading time.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidTenor`] when expiration is not in the future.
pub fn tenor_years(expiration: NaiveDateTime, now: NaiveDateTime) -> Result<f64, ValidationError> {
    let seconds = (expiration - now).num_seconds();
    if seconds <= 0 {
        return Err(ValidationError::InvalidTenor(seconds));
    }
    Ok(seconds as f64 / SECONDS_PER_YEAR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const EPS: f64 = 1e-4;

    #[test]
    fn call_matches_textbook_value() {
        // Hull example 15.6: S=42, K=40, r=10%, sigma=20%, T=0.5 -> c = 4.76
        let c = price_call(42.0, 40.0, 0.5, 0.2, 0.1);
        assert!((c - 4.7594).abs() < 1e-3, "call = {c}");
    }

    #[test]
    fn put_matches_textbook_value() {
        // Same example -> p = 0.81
        let p = price_put(42.0, 40.0, 0.5, 0.2, 0.1);
        assert!((p - 0.8086).abs() < 1e-3, "put = {p}");
    }

    #[test]
    fn put_call_parity_holds() {
        let (s, k, t, sigma, r) = (100.0, 105.0, 0.1, 0.3, 0.02);
        let c = price_call(s, k, t, sigma, r);
        let p = price_put(s, k, t, sigma, r);
        let parity = s - k * (-r * t).exp();
        assert!((c - p - parity).abs() < EPS);
    }

    #[test]
    fn degenerate_inputs_are_nan_not_panics() {
        assert!(price_call(100.0, 100.0, 0.1, 0.0, 0.02).is_nan());
        assert!(price_put(0.0, 100.0, 0.1, 0.2, 0.02).is_nan());
        assert!(price_call(100.0, 100.0, 0.1, f64::NAN, 0.02).is_nan());
    }

    #[test]
    fn tenor_is_normalized_to_trading_years() {
        let now = NaiveDate::from_ymd_opt(2021, 11, 24)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let expiration = now + chrono::Duration::hours(24);
        let t = tenor_years(expiration, now).unwrap();
        assert!((t - 1.0 / 252.0).abs() < 1e-12);
    }

    #[test]
    fn expired_tenor_is_rejected() {
        let now = NaiveDate::from_ymd_opt(2021, 11, 24)
            .unwrap()
            .and_hms_opt(16, 0, 0)
            .unwrap();
        assert_eq!(tenor_years(now, now), Err(ValidationError::InvalidTenor(0)));
    }
}
