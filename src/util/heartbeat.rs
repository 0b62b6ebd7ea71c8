/// Tick counters drained into the periodic status line

use std::sync::atomic::{AtomicU64, Ordering};

use crate::util::clock::is_crypto;

#[derive(Default)]
pub struct Heartbeat {
    stock: AtomicU64,
    crypto: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, symbol: &str) {
        if is_crypto(symbol) {
            self.crypto.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stock.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns (stock, crypto) counts since the last drain and resets both.
    pub fn drain(&self) -> (u64, u64) {
        (
            self.stock.swap(0, Ordering::Relaxed),
            self.crypto.swap(0, Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_resets() {
        let hb = Heartbeat::new();
        hb.inc("AAPL");
        hb.inc("AAPL");
        hb.inc("BTC-USD");
        assert_eq!(hb.drain(), (2, 1));
        assert_eq!(hb.drain(), (0, 0));
    }
}
