/// Trade and mark-to-market CSV journals
///
/// The dashboard parses these files by column position, so the header
/// layout is part of the contract and must not be reordered.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

const TRADES_HEADER: &str =
    "ts,session,symbol,side,qty,fill_price,avg_cost,slippage_bps,fee,reason,mode,realized_pnl,cum_pnl";
const MTM_HEADER: &str = "ts,session,symbol,price,qty,avg_cost,unreal_pnl";

/// Fixed-precision cell formatting; keeps the files diffable.
fn f6(n: f64) -> String {
    format!("{n:.6}")
}

#[derive(Debug, Clone, Copy, Default)]
struct PerfBucket {
    cum_pnl: f64,
    trades: u64,
}

#[derive(Debug, Clone)]
pub struct ExitRecord<'a> {
    pub symbol: &'a str,
    pub qty: f64,
    pub fill_price: f64,
    pub avg_cost: f64,
    pub slippage_bps: f64,
    pub fee: f64,
    pub reason: &'a str,
    pub mode: &'a str,
    pub realized_pnl: f64,
}

pub struct TradeJournal {
    trades_path: PathBuf,
    mtm_path: PathBuf,
    session: String,
    perf: Mutex<HashMap<String, PerfBucket>>,
}

impl TradeJournal {
    pub fn new(trades_path: impl Into<PathBuf>, mtm_path: impl Into<PathBuf>) -> Self {
        let journal = Self {
            trades_path: trades_path.into(),
            mtm_path: mtm_path.into(),
            session: uuid::Uuid::new_v4().to_string(),
            perf: Mutex::new(HashMap::new()),
        };
        ensure_header(&journal.trades_path, TRADES_HEADER);
        ensure_header(&journal.mtm_path, MTM_HEADER);
        journal
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn trade_count(&self, symbol: &str) -> u64 {
        self.perf
            .lock()
            .unwrap()
            .get(symbol)
            .map(|b| b.trades)
            .unwrap_or(0)
    }

    /// Append one executed-exit row and return the symbol's cumulative PnL.
    pub fn record_exit(&self, rec: &ExitRecord<'_>) -> f64 {
        let cum = {
            let mut perf = self.perf.lock().unwrap();
            let bucket = perf.entry(rec.symbol.to_string()).or_default();
            bucket.cum_pnl += rec.realized_pnl;
            bucket.trades += 1;
            bucket.cum_pnl
        };
        let row = [
            Utc::now().to_rfc3339(),
            self.session.clone(),
            rec.symbol.to_string(),
            "sell".to_string(),
            f6(rec.qty),
            f6(rec.fill_price),
            f6(rec.avg_cost),
            f6(rec.slippage_bps),
            f6(rec.fee),
            rec.reason.to_string(),
            rec.mode.to_string(),
            f6(rec.realized_pnl),
            f6(cum),
        ];
        append_row(&self.trades_path, &row);
        cum
    }

    /// Append one mark-to-market sample for a held position.
    pub fn record_mark(&self, symbol: &str, price: f64, qty: f64, avg_cost: f64) {
        let row = [
            Utc::now().to_rfc3339(),
            self.session.clone(),
            symbol.to_string(),
            f6(price),
            f6(qty),
            f6(avg_cost),
            f6((price - avg_cost) * qty),
        ];
        append_row(&self.mtm_path, &row);
    }
}

fn ensure_header(path: &Path, header: &str) {
    if path.exists() {
        return;
    }
    if let Some(dir) = path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    if let Err(err) = fs::write(path, format!("{header}\n")) {
        warn!(path = %path.display(), %err, "could not seed journal header");
    }
}

fn append_row(path: &Path, cells: &[String]) {
    let line = cells.join(",");
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{line}"));
    if let Err(err) = result {
        warn!(path = %path.display(), %err, "journal append failed");
    }
}
