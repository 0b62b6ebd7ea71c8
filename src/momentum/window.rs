/// Rolling price window for momentum measurement

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSample {
    pub ts: DateTime<Utc>,
    pub price: f64,
}

/// Bounded ring of price samples, newest-last. Keeps everything inside the
/// lookback window plus a slack margin so one stale sample survives as the
/// percent-change baseline.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    samples: VecDeque<PriceSample>,
    lookback: Duration,
    slack: Duration,
}

impl PriceWindow {
    pub fn new(lookback: Duration, slack: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            lookback,
            slack,
        }
    }

    /// Append a sample and evict. Of the samples older than the lookback
    /// boundary only the most recent survives (it is the baseline); nothing
    /// outlives lookback + slack. Out-of-order samples are dropped to keep
    /// timestamps monotonic.
    pub fn push(&mut self, sample: PriceSample) {
        if let Some(last) = self.samples.back() {
            if sample.ts < last.ts {
                return;
            }
        }
        self.samples.push_back(sample);
        let boundary = sample.ts - self.lookback;
        while self.samples.len() >= 2 && self.samples[1].ts <= boundary {
            self.samples.pop_front();
        }
        let cutoff = sample.ts - (self.lookback + self.slack);
        while let Some(front) = self.samples.front() {
            if front.ts < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Percent change of the newest sample against the baseline: the last
    /// sample at or before `now - lookback`. None when there is no such
    /// baseline, fewer than two samples, or a degenerate base price.
    pub fn pct_change(&self, now: DateTime<Utc>) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let boundary = now - self.lookback;
        let mut base: Option<f64> = None;
        for s in &self.samples {
            if s.ts <= boundary {
                base = Some(s.price);
            } else {
                break;
            }
        }
        let base = base?;
        let last = self.samples.back()?.price;
        if !base.is_finite() || !last.is_finite() || base <= 0.0 {
            return None;
        }
        Some((last - base) / base * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn window() -> PriceWindow {
        PriceWindow::new(Duration::minutes(60), Duration::minutes(30))
    }

    fn sample(mins: i64, price: f64) -> PriceSample {
        PriceSample {
            ts: t0() + Duration::minutes(mins),
            price,
        }
    }

    #[test]
    fn test_single_sample_gives_no_change() {
        let mut w = window();
        w.push(sample(0, 100.0));
        assert_eq!(w.pct_change(t0()), None);
    }

    #[test]
    fn test_no_sample_past_lookback_boundary() {
        let mut w = window();
        // Both samples are inside the lookback; neither can be the baseline.
        w.push(sample(0, 100.0));
        w.push(sample(10, 106.0));
        assert_eq!(w.pct_change(t0() + Duration::minutes(30)), None);
    }

    #[test]
    fn test_baseline_is_last_sample_before_boundary() {
        let mut w = window();
        w.push(sample(0, 100.0));
        w.push(sample(10, 102.0));
        w.push(sample(61, 106.0));
        // now = t0+61m, boundary = t0+1m: the t0 sample is the baseline
        let change = w.pct_change(t0() + Duration::minutes(61)).unwrap();
        assert!((change - 6.0).abs() < 1e-9);

        // now = t0+70m, boundary = t0+10m: the t0+10m sample takes over
        let change = w.pct_change(t0() + Duration::minutes(70)).unwrap();
        assert!((change - (106.0 - 102.0) / 102.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_only_one_stale_baseline_survives() {
        let mut w = window();
        w.push(sample(0, 100.0));
        w.push(sample(30, 101.0));
        w.push(sample(95, 102.0));
        // Both t0 and t0+30m predate the t0+35m boundary; only the newer
        // of the two is kept as the baseline.
        assert_eq!(w.len(), 2);
        let change = w.pct_change(t0() + Duration::minutes(95)).unwrap();
        assert!((change - (102.0 - 101.0) / 101.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_eviction_past_lookback_plus_slack() {
        let mut w = window();
        w.push(sample(0, 100.0));
        w.push(sample(50, 101.0));
        w.push(sample(95, 102.0));
        assert_eq!(w.len(), 2); // the t0 sample fell out (95 > 60 + 30)
    }

    #[test]
    fn test_zero_base_price_guard() {
        let mut w = window();
        w.push(sample(0, 0.0));
        w.push(sample(61, 106.0));
        assert_eq!(w.pct_change(t0() + Duration::minutes(61)), None);
    }

    #[test]
    fn test_out_of_order_sample_dropped() {
        let mut w = window();
        w.push(sample(10, 100.0));
        w.push(sample(5, 90.0));
        assert_eq!(w.len(), 1);
    }
}
