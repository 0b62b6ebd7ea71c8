/// Typed configuration structures loaded from config.toml

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub runtime: Runtime,
    #[serde(default)]
    pub broker: Broker,
    pub files: Files,
    #[serde(default)]
    pub momentum: Vec<MomentumRule>,
    #[serde(default)]
    pub tickers: Vec<BracketTicker>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Runtime {
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub market_hours_only: bool,
    #[serde(default)]
    pub eod_close_enabled: bool,
    #[serde(default = "default_eod_cutoff")]
    pub eod_cutoff_minutes: i64,
    #[serde(default = "default_eod_close_pct")]
    pub eod_close_partial_pct: f64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub dry_run_slippage_bps: f64,
    #[serde(default)]
    pub dry_run_fee: f64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Broker {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Files {
    pub overrides: String,
    pub trades_csv: String,
    pub mtm_csv: String,
    pub sim_state: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

/// One momentum entry rule; a buy fires when the lookback percent change
/// clears the threshold and the cooldown has elapsed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MomentumRule {
    pub symbol: String,
    pub threshold_pct: f64,
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,
    pub poll_ms: Option<u64>,
    pub cooldown_minutes: Option<i64>,
    pub order: OrderSizing,
    pub bracket: Option<PostBuyBracket>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderSizing {
    pub qty: Option<f64>,
    pub size_usd: Option<f64>,
    pub time_in_force: Option<String>,
}

/// Percent bracket written to the overrides document right after a buy,
/// so the bracket manager takes the position over on its next tick.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostBuyBracket {
    pub target_pct: Option<f64>,
    pub stop_pct: Option<f64>,
    pub trail_pct: Option<f64>,
}

/// A statically configured bracket: exit `qty` at `target` (limit) or
/// `stop` (market). Momentum-entered symbols get a synthesized ticker with
/// qty 0, meaning "exit whatever is held".
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BracketTicker {
    pub symbol: String,
    #[serde(default)]
    pub qty: f64,
    pub target: Option<f64>,
    pub stop: Option<f64>,
    #[serde(default = "default_tif")]
    pub time_in_force: String,
    pub trail_pct: Option<f64>,
}

fn default_poll_ms() -> u64 {
    30_000
}
fn default_max_concurrent() -> usize {
    3
}
fn default_eod_cutoff() -> i64 {
    5
}
fn default_eod_close_pct() -> f64 {
    100.0
}
fn default_cooldown_minutes() -> i64 {
    180
}
fn default_lookback_minutes() -> i64 {
    60
}
fn default_tif() -> String {
    "gfd".to_string()
}
fn default_log_dir() -> String {
    "var".to_string()
}

impl Config {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runtime.poll_ms == 0 {
            anyhow::bail!("runtime.poll_ms must be > 0");
        }
        for rule in &self.momentum {
            if !rule.threshold_pct.is_finite() {
                anyhow::bail!("momentum rule {}: threshold_pct must be finite", rule.symbol);
            }
            if rule.lookback_minutes <= 0 {
                anyhow::bail!("momentum rule {}: lookback_minutes must be > 0", rule.symbol);
            }
            let sized = rule.order.qty.map_or(false, |q| q > 0.0)
                || rule.order.size_usd.map_or(false, |s| s > 0.0);
            if !sized {
                anyhow::bail!("momentum rule {}: order needs qty or size_usd", rule.symbol);
            }
        }
        for t in &self.tickers {
            if t.qty < 0.0 {
                anyhow::bail!("ticker {}: qty must be >= 0", t.symbol);
            }
        }
        Ok(())
    }

    /// Effective poll interval for a momentum rule.
    pub fn poll_ms_for(&self, rule: &MomentumRule) -> u64 {
        rule.poll_ms.unwrap_or(self.runtime.poll_ms)
    }

    /// Effective cooldown for a momentum rule.
    pub fn cooldown_for(&self, rule: &MomentumRule) -> i64 {
        rule.cooldown_minutes.unwrap_or(self.runtime.cooldown_minutes)
    }
}
