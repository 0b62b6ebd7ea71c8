/// Polling engine
///
/// One task per tracked symbol, woken on that symbol's poll interval.
/// Each wake runs the entry leg (momentum detection + admission + buy)
/// and then the exit leg (bracket manage) strictly in order. A per-symbol
/// in-flight guard means a slow tick is skipped, never overlapped; two
/// concurrent exits for one position cannot happen. A failed tick is
/// logged and charged to that symbol alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use colored::Colorize;
use dashmap::DashMap;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broker::{with_backoff, BrokerClient, MarketBuy, SimLedger};
use crate::config::{BracketTicker, Config, MomentumRule};
use crate::error::BrokerResult;
use crate::execution::admission::{AdmissionController, PositionCheck};
use crate::execution::bracket::BracketManager;
use crate::momentum::{MomentumDetector, PriceSample, RuleParams, SignalDecision};
use crate::overrides::{OverrideMode, OverrideRecord, OverrideStore};
use crate::util::{is_crypto, Heartbeat};

#[derive(Clone)]
struct SymbolPlan {
    symbol: String,
    rule: Option<MomentumRule>,
    ticker: BracketTicker,
    poll: Duration,
}

pub struct Engine {
    cfg: Arc<Config>,
    broker: Arc<dyn BrokerClient>,
    ledger: Option<Arc<SimLedger>>,
    detector: MomentumDetector,
    admission: AdmissionController,
    overrides: Arc<OverrideStore>,
    bracket: Arc<BracketManager>,
    heartbeat: Arc<Heartbeat>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    universe: Vec<String>,
}

impl Engine {
    pub fn new(
        cfg: Arc<Config>,
        broker: Arc<dyn BrokerClient>,
        ledger: Option<Arc<SimLedger>>,
        overrides: Arc<OverrideStore>,
        bracket: Arc<BracketManager>,
        heartbeat: Arc<Heartbeat>,
    ) -> Self {
        let mut universe: Vec<String> = cfg
            .tickers
            .iter()
            .map(|t| t.symbol.clone())
            .chain(cfg.momentum.iter().map(|r| r.symbol.clone()))
            .collect();
        universe.sort();
        universe.dedup();

        Self {
            admission: AdmissionController::new(cfg.runtime.max_concurrent),
            detector: MomentumDetector::new(),
            cfg,
            broker,
            ledger,
            overrides,
            bracket,
            heartbeat,
            inflight: DashMap::new(),
            universe,
        }
    }

    fn symbol_plans(&self) -> Vec<SymbolPlan> {
        self.universe
            .iter()
            .map(|symbol| {
                let rule = self.cfg.momentum.iter().find(|r| &r.symbol == symbol).cloned();
                let ticker = self
                    .cfg
                    .tickers
                    .iter()
                    .find(|t| &t.symbol == symbol)
                    .cloned()
                    .unwrap_or_else(|| BracketTicker {
                        symbol: symbol.clone(),
                        qty: 0.0, // sized at entry; exit whatever is held
                        target: None,
                        stop: None,
                        time_in_force: "gtc".to_string(),
                        trail_pct: None,
                    });
                let poll = rule
                    .as_ref()
                    .map(|r| self.cfg.poll_ms_for(r))
                    .unwrap_or(self.cfg.runtime.poll_ms);
                SymbolPlan {
                    symbol: symbol.clone(),
                    rule,
                    ticker,
                    poll: Duration::from_millis(poll),
                }
            })
            .collect()
    }

    /// Spawn one polling loop per symbol plus the status loop.
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for plan in self.symbol_plans() {
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval(plan.poll);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    timer.tick().await;
                    engine.tick(&plan).await;
                }
            }));
        }

        let engine = self;
        handles.push(tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(60));
            timer.tick().await; // skip the immediate tick; nothing to report yet
            loop {
                timer.tick().await;
                let (stock, crypto) = engine.heartbeat.drain();
                info!(
                    stock,
                    crypto,
                    active = engine.admission.count_active(),
                    "heartbeat"
                );
            }
        }));
        handles
    }

    async fn tick(&self, plan: &SymbolPlan) {
        let guard = self
            .inflight
            .entry(plan.symbol.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let Ok(_running) = guard.try_lock() else {
            debug!(symbol = %plan.symbol, "previous tick still running; skipping");
            return;
        };

        self.heartbeat.inc(&plan.symbol);
        if let Err(err) = self.evaluate(plan).await {
            error!(symbol = %plan.symbol, %err, "tick failed");
        }
    }

    async fn evaluate(&self, plan: &SymbolPlan) -> anyhow::Result<()> {
        if let Some(rule) = &plan.rule {
            self.evaluate_entry(rule).await?;
        }
        self.bracket.manage(&plan.ticker).await
    }

    async fn evaluate_entry(&self, rule: &MomentumRule) -> anyhow::Result<()> {
        let symbol = rule.symbol.as_str();
        if self.bracket.is_closed(symbol) {
            return Ok(()); // closed for this run; no re-entries
        }

        let price =
            with_backoff(&format!("quote:{symbol}"), || self.broker.get_quote(symbol)).await?;
        let params = RuleParams {
            threshold_pct: rule.threshold_pct,
            lookback_minutes: rule.lookback_minutes,
            cooldown_minutes: self.cfg.cooldown_for(rule),
        };
        let sample = PriceSample {
            ts: Utc::now(),
            price,
        };
        let SignalDecision::Buy { pct_change } = self.detector.observe(symbol, sample, &params)
        else {
            return Ok(());
        };
        info!(symbol, pct_change, price, "momentum buy signal");

        // Cheap periodic re-sync of the active set against the book.
        if rand::thread_rng().gen::<f64>() < 0.1 {
            self.refresh_active_set().await;
        }

        // Fresh authoritative reads for the rest of the universe, then claim
        // a slot. The claim is atomic; the cap cannot be overshot.
        for other in self.universe.iter().filter(|s| s.as_str() != symbol) {
            let check = self.position_check(other).await;
            self.admission.record(other, check);
        }
        if !self.admission.try_admit(symbol) {
            return Ok(());
        }

        let qty = match rule.order.qty {
            Some(q) if q > 0.0 => q,
            _ => rule.order.size_usd.map(|s| s / price).unwrap_or(0.0),
        };

        if let Err(err) = self.place_entry(rule, qty, price).await {
            self.admission.release(symbol);
            return Err(err.into());
        }
        self.bracket.note_entry(symbol, price);

        // Hand the position to the bracket manager: percent bracket plus,
        // for crypto, the entry price as the cost basis.
        let mut patch = OverrideRecord::default();
        if let Some(bracket) = &rule.bracket {
            if bracket.target_pct.is_some() || bracket.stop_pct.is_some() {
                patch.mode = Some(OverrideMode::Percent);
                patch.target_pct = bracket.target_pct;
                patch.stop_pct = bracket.stop_pct;
                patch.trail_pct = bracket.trail_pct;
            }
        }
        if is_crypto(symbol) {
            patch.avg_cost = Some(price);
        }
        if patch != OverrideRecord::default() {
            with_backoff(&format!("overrides:{symbol}"), || {
                self.overrides.upsert(symbol, patch.clone())
            })
            .await?;
            info!(
                symbol,
                target_pct = ?patch.target_pct,
                stop_pct = ?patch.stop_pct,
                trail_pct = ?patch.trail_pct,
                "post-buy bracket overrides set"
            );
        }
        Ok(())
    }

    async fn place_entry(&self, rule: &MomentumRule, qty: f64, price: f64) -> BrokerResult<()> {
        let symbol = rule.symbol.as_str();
        if let Some(ledger) = &self.ledger {
            with_backoff(&format!("simOpen:{symbol}"), || ledger.open(symbol, qty, price))
                .await?;
            println!(
                "{} [DRY RUN] BUY {} qty {:.6} @ {:.4}",
                "🚀".bright_green(),
                symbol,
                qty,
                price
            );
            return Ok(());
        }
        let order = MarketBuy {
            symbol: symbol.to_string(),
            qty: rule.order.qty,
            size_usd: rule.order.size_usd,
            time_in_force: rule
                .order
                .time_in_force
                .clone()
                .unwrap_or_else(|| "gtc".to_string()),
        };
        let ack = with_backoff(&format!("buy:{symbol}"), || {
            self.broker.place_market_buy(&order)
        })
        .await?;
        info!(symbol, price, order_id = %ack.id, "momentum BUY placed");
        Ok(())
    }

    async fn position_check(&self, symbol: &str) -> PositionCheck {
        let result = match &self.ledger {
            Some(ledger) => ledger.position(symbol).await,
            None => self.broker.position(symbol).await,
        };
        match result {
            Ok(snap) => PositionCheck::Confirmed(snap.qty),
            Err(err) => {
                debug!(symbol, %err, "position check failed");
                PositionCheck::Unknown
            }
        }
    }

    /// Cull flags for symbols confirmed flat; re-flag confirmed holdings.
    async fn refresh_active_set(&self) {
        for symbol in &self.universe {
            let check = self.position_check(symbol).await;
            self.admission.record(symbol, check);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::StubBroker;
    use crate::journal::TradeJournal;
    use crate::util::NyseCalendar;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    fn config(max_concurrent: usize, symbols: &[&str]) -> Config {
        let mut cfg: Config = toml::from_str(
            r#"
            [runtime]
            dry_run = true

            [files]
            overrides = "unused"
            trades_csv = "unused"
            mtm_csv = "unused"
            sim_state = "unused"
        "#,
        )
        .unwrap();
        cfg.runtime.max_concurrent = max_concurrent;
        for s in symbols {
            cfg.momentum.push(MomentumRule {
                symbol: s.to_string(),
                threshold_pct: 5.0,
                lookback_minutes: 60,
                poll_ms: None,
                cooldown_minutes: Some(180),
                order: crate::config::OrderSizing {
                    qty: None,
                    size_usd: Some(100.0),
                    time_in_force: None,
                },
                bracket: Some(crate::config::PostBuyBracket {
                    target_pct: Some(4.0),
                    stop_pct: Some(2.0),
                    trail_pct: None,
                }),
            });
        }
        cfg
    }

    struct Rig {
        engine: Arc<Engine>,
        broker: Arc<StubBroker>,
        ledger: Arc<SimLedger>,
        _dir: tempfile::TempDir,
    }

    fn rig(cfg: Config) -> Rig {
        let dir = tempdir().unwrap();
        let cfg = Arc::new(cfg);
        let broker = Arc::new(StubBroker::new());
        let ledger = Arc::new(SimLedger::new(dir.path().join("sim_state.json"), 0.0, 0.0));
        let overrides = Arc::new(OverrideStore::new(dir.path().join("overrides.json")));
        let journal = Arc::new(TradeJournal::new(
            dir.path().join("trades.csv"),
            dir.path().join("mtm.csv"),
        ));
        let broker_dyn: Arc<dyn BrokerClient> = broker.clone();
        let bracket = Arc::new(BracketManager::new(
            cfg.clone(),
            broker_dyn.clone(),
            Some(ledger.clone()),
            overrides.clone(),
            journal,
            Arc::new(NyseCalendar),
        ));
        let engine = Arc::new(Engine::new(
            cfg,
            broker_dyn,
            Some(ledger.clone()),
            overrides,
            bracket,
            Arc::new(Heartbeat::new()),
        ));
        Rig {
            engine,
            broker,
            ledger,
            _dir: dir,
        }
    }

    /// Pre-load the detector so the next observed quote can fire.
    fn prime_detector(engine: &Engine, symbol: &str, base_price: f64) {
        let params = RuleParams {
            threshold_pct: 5.0,
            lookback_minutes: 60,
            cooldown_minutes: 180,
        };
        for minutes_ago in [70, 65] {
            engine.detector.observe(
                symbol,
                PriceSample {
                    ts: Utc::now() - ChronoDuration::minutes(minutes_ago),
                    price: base_price,
                },
                &params,
            );
        }
    }

    #[tokio::test]
    async fn test_entry_pipeline_opens_and_seeds_bracket() {
        let r = rig(config(3, &["BTC-USD"]));
        prime_detector(&r.engine, "BTC-USD", 100.0);
        r.broker.set_quote("BTC-USD", 106.0);

        let plans = r.engine.symbol_plans();
        r.engine.evaluate(&plans[0]).await.unwrap();

        let pos = r.ledger.position("BTC-USD").await.unwrap();
        assert!((pos.qty - 100.0 / 106.0).abs() < 1e-9);
        assert!((pos.avg_cost - 106.0).abs() < 1e-9);

        let record = r.engine.overrides.get("BTC-USD");
        assert_eq!(record.mode, Some(OverrideMode::Percent));
        assert_eq!(record.target_pct, Some(4.0));
        assert_eq!(record.avg_cost, Some(106.0));

        assert_eq!(r.engine.admission.count_active(), 1);
        // no exit on the same tick: 106 is well inside the bracket
        assert!(!r.engine.bracket.is_closed("BTC-USD"));
    }

    #[tokio::test]
    async fn test_admission_cap_blocks_second_entry() {
        let r = rig(config(1, &["BTC-USD", "ETH-USD"]));
        prime_detector(&r.engine, "BTC-USD", 100.0);
        prime_detector(&r.engine, "ETH-USD", 200.0);
        r.broker.set_quote("BTC-USD", 106.0);
        r.broker.set_quote("ETH-USD", 212.0);

        let plans = r.engine.symbol_plans();
        let btc = plans.iter().find(|p| p.symbol == "BTC-USD").unwrap();
        let eth = plans.iter().find(|p| p.symbol == "ETH-USD").unwrap();

        r.engine.evaluate(btc).await.unwrap();
        r.engine.evaluate(eth).await.unwrap();

        assert!(r.ledger.position("BTC-USD").await.unwrap().is_held());
        // the cap of one kept the second signal out of the book
        assert!(!r.ledger.position("ETH-USD").await.unwrap().is_held());
        assert_eq!(r.engine.admission.count_active(), 1);
    }

    #[tokio::test]
    async fn test_single_flight_skips_overlapping_tick() {
        let r = rig(config(3, &["BTC-USD"]));
        r.broker.set_quote("BTC-USD", 100.0);
        let plans = r.engine.symbol_plans();

        let guard = r
            .engine
            .inflight
            .entry("BTC-USD".to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let held = guard.lock().await;
        r.engine.tick(&plans[0]).await; // must skip, not block
        drop(held);
        assert_eq!(r.engine.heartbeat.drain(), (0, 0));

        r.engine.tick(&plans[0]).await;
        assert_eq!(r.engine.heartbeat.drain(), (0, 1));
    }
}
