/// Bracket/exit management for held positions
///
/// One tick per symbol per poll interval: refresh the mark, ratchet the
/// high-water price, rebuild the exit plan from config + overrides, then
/// check EOD closeout ahead of target/stop. Dry-run mode settles through
/// the simulated ledger; live mode places real sell orders. A symbol that
/// closes stays closed for the rest of the process; a restart re-derives
/// everything from the authoritative book.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use colored::Colorize;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::broker::{with_backoff, BrokerClient, LimitSell, MarketSell, PositionSnapshot, SimLedger};
use crate::config::{BracketTicker, Config};
use crate::error::BrokerResult;
use crate::journal::{ExitRecord, TradeJournal};
use crate::overrides::{OverrideRecord, OverrideStore};
use crate::util::{is_crypto, MarketCalendar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketState {
    NoPosition,
    Open,
    ClosingRequested,
    Closed,
}

#[derive(Debug, Clone)]
struct SymbolBook {
    state: BracketState,
    high_water: f64,
    closed_reason: Option<&'static str>,
    closed_at: Option<DateTime<Utc>>,
}

impl Default for SymbolBook {
    fn default() -> Self {
        Self {
            state: BracketState::NoPosition,
            high_water: f64::NEG_INFINITY,
            closed_reason: None,
            closed_at: None,
        }
    }
}

enum ExitKind {
    /// Limit sell at the target price; the price doubles as the dry fill.
    Limit(f64),
    /// Market sell; carries the current mark for the dry fill.
    Market(f64),
}

pub struct BracketManager {
    cfg: Arc<Config>,
    broker: Arc<dyn BrokerClient>,
    ledger: Option<Arc<SimLedger>>,
    overrides: Arc<OverrideStore>,
    journal: Arc<TradeJournal>,
    calendar: Arc<dyn MarketCalendar>,
    books: DashMap<String, SymbolBook>,
}

impl BracketManager {
    pub fn new(
        cfg: Arc<Config>,
        broker: Arc<dyn BrokerClient>,
        ledger: Option<Arc<SimLedger>>,
        overrides: Arc<OverrideStore>,
        journal: Arc<TradeJournal>,
        calendar: Arc<dyn MarketCalendar>,
    ) -> Self {
        Self {
            cfg,
            broker,
            ledger,
            overrides,
            journal,
            calendar,
            books: DashMap::new(),
        }
    }

    pub fn state(&self, symbol: &str) -> BracketState {
        self.books
            .get(symbol)
            .map(|b| b.state)
            .unwrap_or(BracketState::NoPosition)
    }

    pub fn is_closed(&self, symbol: &str) -> bool {
        self.state(symbol) == BracketState::Closed
    }

    pub fn closed_reason(&self, symbol: &str) -> Option<&'static str> {
        self.books.get(symbol).and_then(|b| b.closed_reason)
    }

    pub fn closed_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.books.get(symbol).and_then(|b| b.closed_at)
    }

    /// Arm the bracket right after a confirmed entry fill.
    pub fn note_entry(&self, symbol: &str, entry_price: f64) {
        let mut book = self.books.entry(symbol.to_string()).or_default();
        book.state = BracketState::Open;
        book.high_water = entry_price;
    }

    /// One exit-evaluation tick for a symbol. Errors are meant to be caught
    /// at the scheduling boundary; they never poison other symbols.
    pub async fn manage(&self, ticker: &BracketTicker) -> anyhow::Result<()> {
        let symbol = ticker.symbol.as_str();
        if self.is_closed(symbol) {
            return Ok(());
        }

        let now = Utc::now();
        if self.cfg.runtime.market_hours_only && !is_crypto(symbol) && !self.calendar.is_open(now)
        {
            debug!(symbol, "outside market hours; tick skipped");
            return Ok(());
        }

        let price =
            with_backoff(&format!("quote:{symbol}"), || self.broker.get_quote(symbol)).await?;

        let snap = match self.position_snapshot(symbol).await {
            Ok(snap) => snap,
            Err(err) => {
                warn!(symbol, %err, "position query failed; skipping tick");
                return Ok(());
            }
        };
        let held = snap.qty;
        let mut avg_cost = snap.avg_cost;

        // Some venues cannot report an average cost for crypto pairs. Seed
        // it once from the current mark and remember it in the overrides
        // document so percent exits keep a stable basis across ticks.
        if is_crypto(symbol) && !(avg_cost.is_finite() && avg_cost > 0.0) {
            let ovr = self.overrides.get(symbol);
            match ovr.avg_cost.filter(|c| *c > 0.0) {
                Some(c) => avg_cost = c,
                None => {
                    avg_cost = price;
                    let patch = OverrideRecord {
                        avg_cost: Some(price),
                        ..Default::default()
                    };
                    if let Err(err) = self.overrides.upsert(symbol, patch).await {
                        warn!(symbol, %err, "could not persist seeded avg cost");
                    }
                    info!(symbol, avg_cost, "seeded avg cost from mark");
                }
            }
        }

        if held > 0.0 {
            self.journal.record_mark(symbol, price, held, avg_cost);
        }

        // Re-derive Open from the authoritative book (fresh start or restart).
        {
            let mut book = self.books.entry(symbol.to_string()).or_default();
            if book.state == BracketState::NoPosition && held > 0.0 {
                book.state = BracketState::Open;
                book.high_water = price;
                info!(symbol, held, "position found; bracket armed");
            }
        }

        let high_water = self.update_high_water(symbol, price);

        // EOD closeout runs ahead of target/stop.
        let ovr = self.overrides.get(symbol);
        let eod_enabled = if is_crypto(symbol) {
            ovr.eod_close.unwrap_or(false)
        } else {
            ovr.eod_close.unwrap_or(self.cfg.runtime.eod_close_enabled)
        };
        let eod_cutoff = ovr.eod_cutoff_min.unwrap_or(self.cfg.runtime.eod_cutoff_minutes);
        let eod_pct = ovr.eod_close_pct.unwrap_or(self.cfg.runtime.eod_close_partial_pct);
        let minutes_to_close = self.calendar.minutes_to_close(now);

        if eod_enabled && minutes_to_close >= 0 && minutes_to_close <= eod_cutoff && held > 0.0 {
            let close_qty = (held * eod_pct / 100.0).floor();
            if close_qty > 0.0 {
                self.cancel_stale_sells(symbol).await;
                let full = close_qty == held;
                info!(symbol, close_qty, minutes_to_close, "EOD closeout triggered");
                self.execute_exit(ticker, close_qty, ExitKind::Market(price), "eod_closeout", full)
                    .await?;
                return Ok(());
            }
        }

        let plan = self.overrides.compute_exits(
            symbol,
            ticker.target,
            ticker.stop,
            avg_cost,
            high_water,
            ticker.trail_pct,
        );

        self.cancel_stale_sells(symbol).await;

        if held <= 0.0 || held < ticker.qty {
            return Ok(());
        }
        // A ticker with qty 0 was synthesized for a momentum entry; it exits
        // whatever the book holds.
        let exit_qty = if ticker.qty > 0.0 { ticker.qty } else { held };

        if price >= plan.target {
            debug!(symbol, price, target = plan.target, source = %plan.source, "target reached");
            self.execute_exit(ticker, exit_qty, ExitKind::Limit(plan.target), "target_hit", true)
                .await?;
        } else if price <= plan.stop {
            debug!(symbol, price, stop = plan.stop, source = %plan.source, "stop reached");
            self.execute_exit(ticker, exit_qty, ExitKind::Market(price), "stop_hit", true)
                .await?;
        }
        Ok(())
    }

    async fn position_snapshot(&self, symbol: &str) -> BrokerResult<PositionSnapshot> {
        match &self.ledger {
            Some(ledger) => ledger.position(symbol).await,
            None => {
                with_backoff(&format!("positions:{symbol}"), || self.broker.position(symbol)).await
            }
        }
    }

    fn update_high_water(&self, symbol: &str, price: f64) -> f64 {
        let mut book = self.books.entry(symbol.to_string()).or_default();
        book.high_water = book.high_water.max(price);
        book.high_water
    }

    /// Cancel open sell orders for the symbol so a new exit cannot race a
    /// stale one into a double fill. Best-effort: a failed cancel is logged
    /// and never blocks the exit itself.
    async fn cancel_stale_sells(&self, symbol: &str) {
        if self.ledger.is_some() {
            return; // the simulated book has no resting orders
        }
        let open = match with_backoff("openOrders", || self.broker.list_open_sell_orders()).await {
            Ok(open) => open,
            Err(err) => {
                warn!(symbol, %err, "could not list open sell orders");
                return;
            }
        };
        let mut cancelled = 0;
        for order in open.iter().filter(|o| o.symbol == symbol) {
            match self.broker.cancel_order(order).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(err) => warn!(symbol, order_id = %order.id, %err, "cancel failed"),
            }
        }
        if cancelled > 0 {
            info!(symbol, cancelled, "cancelled stale sell orders");
        }
    }

    async fn execute_exit(
        &self,
        ticker: &BracketTicker,
        qty: f64,
        kind: ExitKind,
        reason: &'static str,
        full_close: bool,
    ) -> anyhow::Result<()> {
        let symbol = ticker.symbol.as_str();
        self.set_state(symbol, BracketState::ClosingRequested);

        match self.settle(ticker, qty, &kind, reason).await {
            Ok(()) => {
                if full_close {
                    self.mark_closed(symbol, reason);
                } else {
                    self.set_state(symbol, BracketState::Open);
                    info!(symbol, qty, reason, "partial exit; bracket stays armed");
                }
                Ok(())
            }
            Err(err) => {
                // The order did not go out; the position is still ours.
                self.set_state(symbol, BracketState::Open);
                error!(symbol, reason, %err, "exit attempt failed; position remains open");
                Err(err.into())
            }
        }
    }

    async fn settle(
        &self,
        ticker: &BracketTicker,
        qty: f64,
        kind: &ExitKind,
        reason: &'static str,
    ) -> BrokerResult<()> {
        let symbol = ticker.symbol.as_str();

        if let Some(ledger) = &self.ledger {
            let raw = match kind {
                ExitKind::Limit(price) | ExitKind::Market(price) => *price,
            };
            let fill =
                with_backoff(&format!("simClose:{symbol}"), || ledger.close(symbol, qty, raw))
                    .await?;
            let cum = self.journal.record_exit(&ExitRecord {
                symbol,
                qty: fill.qty,
                fill_price: fill.fill_price,
                avg_cost: fill.avg_cost,
                slippage_bps: self.cfg.runtime.dry_run_slippage_bps,
                fee: self.cfg.runtime.dry_run_fee,
                reason,
                mode: "DRY_RUN",
                realized_pnl: fill.realized,
            });
            info!(
                symbol,
                qty = fill.qty,
                fill = fill.fill_price,
                realized = fill.realized,
                cum,
                reason,
                "[DRY RUN] exit simulated"
            );
            return Ok(());
        }

        match kind {
            ExitKind::Limit(limit) => {
                let order = LimitSell {
                    symbol: symbol.to_string(),
                    qty,
                    limit_price: *limit,
                    time_in_force: ticker.time_in_force.clone(),
                };
                let ack = with_backoff(&format!("limitSell:{symbol}"), || {
                    self.broker.place_limit_sell(&order)
                })
                .await?;
                info!(symbol, limit, order_id = %ack.id, reason, "placed LIMIT sell");
            }
            ExitKind::Market(mark) => {
                let order = MarketSell {
                    symbol: symbol.to_string(),
                    qty,
                    time_in_force: ticker.time_in_force.clone(),
                };
                let ack = with_backoff(&format!("marketSell:{symbol}"), || {
                    self.broker.place_market_sell(&order)
                })
                .await?;
                info!(symbol, mark, order_id = %ack.id, reason, "placed MARKET sell");
            }
        }
        Ok(())
    }

    fn set_state(&self, symbol: &str, state: BracketState) {
        self.books.entry(symbol.to_string()).or_default().state = state;
    }

    fn mark_closed(&self, symbol: &str, reason: &'static str) {
        {
            let mut book = self.books.entry(symbol.to_string()).or_default();
            book.state = BracketState::Closed;
            book.closed_reason = Some(reason);
            book.closed_at = Some(Utc::now());
        }
        println!("{} {} closed ({})", "🚪".bright_red(), symbol, reason);
        info!(symbol, reason, "bracket closed for this run");
    }
}
