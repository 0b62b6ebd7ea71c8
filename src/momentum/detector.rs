/// Momentum buy-signal detection over per-symbol price windows

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::window::{PriceSample, PriceWindow};

/// Extra history kept past the lookback so a baseline sample survives.
const WINDOW_SLACK_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalDecision {
    /// Threshold met and cooldown elapsed; the cooldown clock restarts now.
    Buy { pct_change: f64 },
    /// Measurable change that does not qualify (below threshold or cooling).
    Hold { pct_change: f64 },
    /// Not enough history to measure a lookback change.
    Insufficient,
}

#[derive(Debug, Clone, Copy)]
pub struct RuleParams {
    pub threshold_pct: f64,
    pub lookback_minutes: i64,
    pub cooldown_minutes: i64,
}

struct PairState {
    window: PriceWindow,
    last_buy: Option<DateTime<Utc>>,
}

/// One detector instance owns every symbol's window and cooldown clock, so
/// tests can build isolated detectors instead of sharing ambient state.
#[derive(Default)]
pub struct MomentumDetector {
    pairs: DashMap<String, PairState>,
}

impl MomentumDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample and decide. The sample's own timestamp is "now", so
    /// replayed series evaluate deterministically. The firing decision and
    /// the cooldown-clock update happen under the same entry guard; two
    /// concurrent evaluations of one symbol cannot both fire.
    pub fn observe(&self, symbol: &str, sample: PriceSample, rule: &RuleParams) -> SignalDecision {
        let mut entry = self.pairs.entry(symbol.to_string()).or_insert_with(|| PairState {
            window: PriceWindow::new(
                Duration::minutes(rule.lookback_minutes),
                Duration::minutes(WINDOW_SLACK_MINUTES),
            ),
            last_buy: None,
        });

        let now = sample.ts;
        entry.window.push(sample);

        let Some(pct_change) = entry.window.pct_change(now) else {
            return SignalDecision::Insufficient;
        };

        let cooled = entry
            .last_buy
            .map_or(true, |t| now - t >= Duration::minutes(rule.cooldown_minutes));

        debug!(symbol, pct_change, cooled, "momentum check");

        if pct_change >= rule.threshold_pct && cooled {
            entry.last_buy = Some(now);
            SignalDecision::Buy { pct_change }
        } else {
            SignalDecision::Hold { pct_change }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn sample(mins: i64, price: f64) -> PriceSample {
        PriceSample {
            ts: t0() + Duration::minutes(mins),
            price,
        }
    }

    fn rule() -> RuleParams {
        RuleParams {
            threshold_pct: 5.0,
            lookback_minutes: 60,
            cooldown_minutes: 180,
        }
    }

    #[test]
    fn test_fires_on_six_percent_move() {
        let d = MomentumDetector::new();
        let r = rule();
        assert_eq!(
            d.observe("BTC-USD", sample(0, 100.0), &r),
            SignalDecision::Insufficient
        );
        assert_eq!(
            d.observe("BTC-USD", sample(10, 100.0), &r),
            SignalDecision::Insufficient
        );
        match d.observe("BTC-USD", sample(61, 106.0), &r) {
            SignalDecision::Buy { pct_change } => assert!((pct_change - 6.0).abs() < 1e-9),
            other => panic!("expected buy, got {other:?}"),
        }
    }

    #[test]
    fn test_cooldown_limits_to_one_fire() {
        let d = MomentumDetector::new();
        let r = rule();
        d.observe("BTC-USD", sample(0, 100.0), &r);
        d.observe("BTC-USD", sample(61, 106.0), &r); // fires
        // Sustained qualifying momentum inside the cooldown never re-fires.
        let mut fires = 0;
        for m in [70, 90, 120, 180, 239] {
            if matches!(
                d.observe("BTC-USD", sample(m, 120.0), &r),
                SignalDecision::Buy { .. }
            ) {
                fires += 1;
            }
        }
        assert_eq!(fires, 0);
        // Past the cooldown it may fire again.
        assert!(matches!(
            d.observe("BTC-USD", sample(241, 140.0), &r),
            SignalDecision::Buy { .. }
        ));
    }

    #[test]
    fn test_flat_and_decreasing_never_fire() {
        let d = MomentumDetector::new();
        let r = rule();
        d.observe("ETH-USD", sample(0, 100.0), &r);
        assert!(matches!(
            d.observe("ETH-USD", sample(61, 100.0), &r),
            SignalDecision::Hold { .. }
        ));
        assert!(matches!(
            d.observe("ETH-USD", sample(70, 95.0), &r),
            SignalDecision::Hold { .. }
        ));
    }

    #[test]
    fn test_zero_threshold_fires_on_flat() {
        let d = MomentumDetector::new();
        let r = RuleParams {
            threshold_pct: 0.0,
            ..rule()
        };
        d.observe("ETH-USD", sample(0, 100.0), &r);
        assert!(matches!(
            d.observe("ETH-USD", sample(61, 100.0), &r),
            SignalDecision::Buy { .. }
        ));
    }

    #[test]
    fn test_symbols_are_independent() {
        let d = MomentumDetector::new();
        let r = rule();
        d.observe("BTC-USD", sample(0, 100.0), &r);
        d.observe("ETH-USD", sample(0, 200.0), &r);
        assert!(matches!(
            d.observe("BTC-USD", sample(61, 106.0), &r),
            SignalDecision::Buy { .. }
        ));
        // ETH cooldown untouched by the BTC fire.
        assert!(matches!(
            d.observe("ETH-USD", sample(61, 212.0), &r),
            SignalDecision::Buy { .. }
        ));
    }
}
