/// Simulated ledger for dry-run mode
///
/// When no real order may be sent, this ledger is the authoritative book:
/// it owns quantities and average costs, journals every simulated fill,
/// and persists the whole state document atomically on each mutation so a
/// crash between an open and a close cannot leave a half-applied entry.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::positions::PositionSnapshot;
use crate::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimPosition {
    pub qty: f64,
    #[serde(rename = "avgCost")]
    pub avg_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimTrade {
    pub t: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub realized: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimOrder {
    pub t: String,
    pub kind: String,
    pub side: String,
    pub symbol: String,
    pub qty: f64,
    pub price: f64,
    pub note: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SimState {
    positions: HashMap<String, SimPosition>,
    orders: Vec<SimOrder>,
    trades: Vec<SimTrade>,
}

/// What a simulated close actually did, after slippage and fees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseFill {
    pub qty: f64,
    pub fill_price: f64,
    pub avg_cost: f64,
    pub realized: f64,
}

pub struct SimLedger {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
    slippage_bps: f64,
    flat_fee: f64,
}

impl SimLedger {
    pub fn new(path: impl Into<PathBuf>, slippage_bps: f64, flat_fee: f64) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
            slippage_bps,
            flat_fee,
        }
    }

    fn apply_slippage(&self, raw: f64) -> f64 {
        if self.slippage_bps.is_finite() && self.slippage_bps > 0.0 {
            raw * (1.0 - self.slippage_bps / 10_000.0)
        } else {
            raw
        }
    }

    /// Record a simulated buy. Weighted-average cost across adds.
    pub async fn open(&self, symbol: &str, qty: f64, price: f64) -> BrokerResult<SimPosition> {
        if !qty.is_finite() || !price.is_finite() || qty <= 0.0 || price <= 0.0 {
            return Err(BrokerError::InvalidOrder(format!(
                "open {symbol}: qty={qty} price={price}"
            )));
        }
        let _guard = self.lock.lock().await;
        let mut s = load_state(&self.path)?;

        let cur = s
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(SimPosition { qty: 0.0, avg_cost: 0.0 });
        let new_qty = cur.qty + qty;
        let new_avg = (cur.qty * cur.avg_cost + qty * price) / new_qty;
        let pos = SimPosition { qty: new_qty, avg_cost: new_avg };
        s.positions.insert(symbol.to_string(), pos);

        let t = Utc::now().to_rfc3339();
        s.trades.push(SimTrade {
            t: t.clone(),
            symbol: symbol.to_string(),
            side: "BUY".to_string(),
            qty,
            price,
            realized: 0.0,
        });
        s.orders.push(SimOrder {
            t,
            kind: "market".to_string(),
            side: "BUY".to_string(),
            symbol: symbol.to_string(),
            qty,
            price,
            note: "sim-open".to_string(),
        });

        save_state(&self.path, &s)?;
        info!(symbol, qty, price, "[DRY] open position");
        Ok(pos)
    }

    /// Record a simulated sell. Quantity is clamped to holdings, slippage
    /// shaves the fill before PnL, and a fully closed position is removed
    /// rather than kept at zero.
    pub async fn close(&self, symbol: &str, qty: f64, raw_price: f64) -> BrokerResult<CloseFill> {
        if !qty.is_finite() || !raw_price.is_finite() || qty <= 0.0 || raw_price <= 0.0 {
            return Err(BrokerError::InvalidOrder(format!(
                "close {symbol}: qty={qty} price={raw_price}"
            )));
        }
        let _guard = self.lock.lock().await;
        let mut s = load_state(&self.path)?;

        let cur = match s.positions.get(symbol).copied() {
            Some(p) if p.qty > 0.0 => p,
            _ => return Err(BrokerError::NoPosition(symbol.to_string())),
        };

        let sell_qty = qty.min(cur.qty);
        let fill = self.apply_slippage(raw_price);
        let realized = sell_qty * (fill - cur.avg_cost) - self.flat_fee;

        let rem = cur.qty - sell_qty;
        if rem <= 0.0 {
            s.positions.remove(symbol);
        } else {
            s.positions
                .insert(symbol.to_string(), SimPosition { qty: rem, avg_cost: cur.avg_cost });
        }

        let t = Utc::now().to_rfc3339();
        s.trades.push(SimTrade {
            t: t.clone(),
            symbol: symbol.to_string(),
            side: "SELL".to_string(),
            qty: sell_qty,
            price: fill,
            realized,
        });
        s.orders.push(SimOrder {
            t,
            kind: "market".to_string(),
            side: "SELL".to_string(),
            symbol: symbol.to_string(),
            qty: sell_qty,
            price: fill,
            note: "sim-close".to_string(),
        });

        save_state(&self.path, &s)?;
        info!(symbol, qty = sell_qty, fill, realized, "[DRY] close position");
        Ok(CloseFill {
            qty: sell_qty,
            fill_price: fill,
            avg_cost: cur.avg_cost,
            realized,
        })
    }

    pub async fn position(&self, symbol: &str) -> BrokerResult<PositionSnapshot> {
        let s = load_state(&self.path)?;
        Ok(s.positions
            .get(symbol)
            .map(|p| PositionSnapshot { qty: p.qty, avg_cost: p.avg_cost })
            .unwrap_or_default())
    }

    pub async fn list_positions(&self) -> BrokerResult<HashMap<String, SimPosition>> {
        Ok(load_state(&self.path)?.positions)
    }

    pub async fn journal(&self) -> BrokerResult<(Vec<SimOrder>, Vec<SimTrade>)> {
        let s = load_state(&self.path)?;
        Ok((s.orders, s.trades))
    }

    pub async fn unrealized(&self, symbol: &str, mark: f64) -> BrokerResult<f64> {
        let s = load_state(&self.path)?;
        Ok(s.positions
            .get(symbol)
            .map(|p| (mark - p.avg_cost) * p.qty)
            .unwrap_or(0.0))
    }
}

fn load_state(path: &Path) -> BrokerResult<SimState> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SimState::default()),
        Err(e) => Err(e.into()),
    }
}

fn save_state(path: &Path, state: &SimState) -> BrokerResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger_in(dir: &tempfile::TempDir) -> SimLedger {
        SimLedger::new(dir.path().join("sim_state.json"), 0.0, 0.0)
    }

    #[tokio::test]
    async fn test_open_rejects_bad_orders() {
        let dir = tempdir().unwrap();
        let l = ledger_in(&dir);
        assert!(matches!(
            l.open("BTC-USD", 0.0, 100.0).await,
            Err(BrokerError::InvalidOrder(_))
        ));
        assert!(matches!(
            l.open("BTC-USD", 1.0, f64::NAN).await,
            Err(BrokerError::InvalidOrder(_))
        ));
    }

    #[tokio::test]
    async fn test_weighted_average_cost() {
        let dir = tempdir().unwrap();
        let l = ledger_in(&dir);
        l.open("AAPL", 10.0, 100.0).await.unwrap();
        let pos = l.open("AAPL", 10.0, 110.0).await.unwrap();
        assert_eq!(pos.qty, 20.0);
        assert!((pos.avg_cost - 105.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_close_clamps_and_removes_at_zero() {
        let dir = tempdir().unwrap();
        let l = ledger_in(&dir);
        l.open("AAPL", 10.0, 100.0).await.unwrap();
        let fill = l.close("AAPL", 25.0, 110.0).await.unwrap();
        assert_eq!(fill.qty, 10.0); // never oversell
        assert!((fill.realized - 100.0).abs() < 1e-9);
        assert_eq!(l.position("AAPL").await.unwrap(), PositionSnapshot::flat());
        assert!(matches!(
            l.close("AAPL", 1.0, 110.0).await,
            Err(BrokerError::NoPosition(_))
        ));
    }

    #[tokio::test]
    async fn test_slippage_and_fee() {
        let dir = tempdir().unwrap();
        let l = SimLedger::new(dir.path().join("sim_state.json"), 100.0, 0.5);
        l.open("BTC-USD", 1.0, 100.0).await.unwrap();
        let fill = l.close("BTC-USD", 1.0, 110.0).await.unwrap();
        // 100 bps shaves 1%: fill 108.9; pnl = 8.9 - 0.5 fee
        assert!((fill.fill_price - 108.9).abs() < 1e-9);
        assert!((fill.realized - 8.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pnl_reconciles_across_sequence() {
        let dir = tempdir().unwrap();
        let l = ledger_in(&dir);
        l.open("AAPL", 10.0, 100.0).await.unwrap();
        l.open("AAPL", 10.0, 110.0).await.unwrap(); // avg 105
        let a = l.close("AAPL", 5.0, 120.0).await.unwrap();
        let b = l.close("AAPL", 15.0, 90.0).await.unwrap();
        let (_, trades) = l.journal().await.unwrap();
        let total: f64 = trades.iter().map(|t| t.realized).sum();
        assert!((total - (a.realized + b.realized)).abs() < 1e-9);
        assert!((a.realized - 75.0).abs() < 1e-9);
        assert!((b.realized - (-225.0)).abs() < 1e-9);
        // book is empty, quantity never went negative
        assert!(l.list_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sim_state.json");
        {
            let l = SimLedger::new(&path, 0.0, 0.0);
            l.open("ETH-USD", 2.0, 3000.0).await.unwrap();
        }
        let l = SimLedger::new(&path, 0.0, 0.0);
        let snap = l.position("ETH-USD").await.unwrap();
        assert_eq!(snap.qty, 2.0);
        assert_eq!(snap.avg_cost, 3000.0);
        assert!((l.unrealized("ETH-USD", 3100.0).await.unwrap() - 200.0).abs() < 1e-9);
    }
}
