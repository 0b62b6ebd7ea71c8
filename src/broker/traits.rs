/// Broker collaborator interface
///
/// Everything the engine needs from a brokerage: quotes, an authoritative
/// position read, entry/exit order placement and open-order housekeeping.
/// Object-safe so dry-run and live implementations swap behind one Arc.

use async_trait::async_trait;

use crate::broker::positions::PositionSnapshot;
use crate::error::BrokerResult;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub id: String,
}

/// One open sell order as listed by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct SellOrder {
    pub id: String,
    pub symbol: String,
}

#[derive(Debug, Clone)]
pub struct MarketBuy {
    pub symbol: String,
    pub qty: Option<f64>,
    pub size_usd: Option<f64>,
    pub time_in_force: String,
}

#[derive(Debug, Clone)]
pub struct LimitSell {
    pub symbol: String,
    pub qty: f64,
    pub limit_price: f64,
    pub time_in_force: String,
}

#[derive(Debug, Clone)]
pub struct MarketSell {
    pub symbol: String,
    pub qty: f64,
    pub time_in_force: String,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Latest mark for the symbol; NoQuote when the feed has nothing.
    async fn get_quote(&self, symbol: &str) -> BrokerResult<f64>;

    /// Authoritative holdings; {0, 0} for symbols the broker cannot see.
    async fn position(&self, symbol: &str) -> BrokerResult<PositionSnapshot>;

    async fn place_market_buy(&self, order: &MarketBuy) -> BrokerResult<OrderAck>;

    async fn place_limit_sell(&self, order: &LimitSell) -> BrokerResult<OrderAck>;

    async fn place_market_sell(&self, order: &MarketSell) -> BrokerResult<OrderAck>;

    /// Best-effort cancel; Ok(false) when the order was already gone.
    async fn cancel_order(&self, order: &SellOrder) -> BrokerResult<bool>;

    async fn list_open_sell_orders(&self) -> BrokerResult<Vec<SellOrder>>;
}
