//! Threshold model deciding when implied volatility is cheap enough to buy.

use serde::{Deserialize, Serialize};

use crate::config::ModelWeights;

/// Per-tick feature vector of one underlying.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Features {
    /// Realized vol moving average minus implied vol.
    pub vol_ma_gap: f64,
    /// Latest realized vol minus implied vol.
    pub vol_gap: f64,
    pub iv: f64,
    pub real_vol_last: f64,
    pub real_vol_ma: f64,
}

impl Features {
    #[must_use]
    pub fn new(iv: f64, real_vol_last: f64, real_vol_ma: f64) -> Self {
        Self {
            vol_ma_gap: real_vol_ma - iv,
            vol_gap: real_vol_last - iv,
            iv,
            real_vol_last,
            real_vol_ma,
        }
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::new(f64::NAN, f64::NAN, f64::NAN)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SignalModel {
    weights: ModelWeights,
}

impl SignalModel {
    #[must_use]
    pub const fn new(weights: ModelWeights) -> Self {
        Self { weights }
    }

    /// Buy signal. Any NaN feature makes the comparison false.
    #[must_use]
    pub fn eval(&self, f: &Features) -> bool {
        f.vol_ma_gap > self.weights.w1
            && f.vol_gap > self.weights.w2
            && f.iv < self.weights.w3
            && f.real_vol_last < f.real_vol_ma
    }
}

impl Default for SignalModel {
    fn default() -> Self {
        Self::new(ModelWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cheap_iv_with_cooling_realized_vol_signals() {
        let model = SignalModel::default();
        // iv 0.15, last 0.25, ma 0.30 -> gaps 0.15 and 0.10
        let features = Features::new(0.15, 0.25, 0.30);
        assert!(model.eval(&features));
    }

    #[test]
    fn rich_iv_does_not_signal() {
        let model = SignalModel::default();
        let features = Features::new(0.30, 0.40, 0.50);
        assert!(!model.eval(&features));
    }

    #[test]
    fn accelerating_realized_vol_does_not_signal() {
        let model = SignalModel::default();
        let features = Features::new(0.10, 0.40, 0.30);
        assert!(!model.eval(&features));
    }

    #[test]
    fn nan_features_never_signal() {
        let model = SignalModel::default();
        assert!(!model.eval(&Features::default()));
        assert!(!model.eval(&Features::new(f64::NAN, 0.25, 0.30)));
    }
}
