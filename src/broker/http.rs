/// Live broker client over the brokerage REST API

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::broker::positions::{snapshot_from_listing, PositionSnapshot};
use crate::broker::traits::{BrokerClient, LimitSell, MarketBuy, MarketSell, OrderAck, SellOrder};
use crate::error::{BrokerError, BrokerResult};

pub struct HttpBroker {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpBroker {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(&self, path: &str) -> BrokerResult<Value> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        Self::into_json(response).await
    }

    async fn post_json(&self, path: &str, payload: &Value) -> BrokerResult<Value> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        Self::into_json(response).await
    }

    async fn into_json(response: reqwest::Response) -> BrokerResult<Value> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| BrokerError::Network(e.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(BrokerError::Network(format!("{status}: {body}")))
        } else {
            Err(BrokerError::Api(format!("{status}: {body}")))
        }
    }

    fn ack_from(value: &Value) -> OrderAck {
        OrderAck {
            id: value["id"].as_str().unwrap_or("unknown").to_string(),
        }
    }
}

#[async_trait]
impl BrokerClient for HttpBroker {
    async fn get_quote(&self, symbol: &str) -> BrokerResult<f64> {
        let value = match self.get_json(&format!("/v1/quotes/{symbol}")).await {
            Err(BrokerError::Api(msg)) if msg.starts_with(StatusCode::NOT_FOUND.as_str()) => {
                return Err(BrokerError::NoQuote(symbol.to_string()))
            }
            other => other?,
        };
        match value["price"].as_f64() {
            Some(price) if price.is_finite() && price > 0.0 => Ok(price),
            _ => Err(BrokerError::NoQuote(symbol.to_string())),
        }
    }

    async fn position(&self, symbol: &str) -> BrokerResult<PositionSnapshot> {
        let listing = self.get_json("/v1/positions").await?;
        Ok(snapshot_from_listing(symbol, &listing))
    }

    async fn place_market_buy(&self, order: &MarketBuy) -> BrokerResult<OrderAck> {
        let value = self
            .post_json(
                "/v1/orders",
                &json!({
                    "symbol": order.symbol,
                    "side": "buy",
                    "type": "market",
                    "qty": order.qty,
                    "size_usd": order.size_usd,
                    "time_in_force": order.time_in_force,
                }),
            )
            .await?;
        Ok(Self::ack_from(&value))
    }

    async fn place_limit_sell(&self, order: &LimitSell) -> BrokerResult<OrderAck> {
        if !order.limit_price.is_finite() || order.limit_price <= 0.0 || order.qty <= 0.0 {
            return Err(BrokerError::InvalidOrder(format!(
                "limit sell {}: qty={} limit={}",
                order.symbol, order.qty, order.limit_price
            )));
        }
        let value = self
            .post_json(
                "/v1/orders",
                &json!({
                    "symbol": order.symbol,
                    "side": "sell",
                    "type": "limit",
                    "qty": order.qty,
                    "limit_price": order.limit_price,
                    "time_in_force": order.time_in_force,
                }),
            )
            .await?;
        Ok(Self::ack_from(&value))
    }

    async fn place_market_sell(&self, order: &MarketSell) -> BrokerResult<OrderAck> {
        if order.qty <= 0.0 {
            return Err(BrokerError::InvalidOrder(format!(
                "market sell {}: qty={}",
                order.symbol, order.qty
            )));
        }
        let value = self
            .post_json(
                "/v1/orders",
                &json!({
                    "symbol": order.symbol,
                    "side": "sell",
                    "type": "market",
                    "qty": order.qty,
                    "time_in_force": order.time_in_force,
                }),
            )
            .await?;
        Ok(Self::ack_from(&value))
    }

    async fn cancel_order(&self, order: &SellOrder) -> BrokerResult<bool> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/orders/{}", order.id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        Ok(response.status().is_success())
    }

    async fn list_open_sell_orders(&self) -> BrokerResult<Vec<SellOrder>> {
        let value = self.get_json("/v1/orders?status=open&side=sell").await?;
        let mut out = Vec::new();
        if let Some(items) = value.as_array() {
            for item in items {
                if let (Some(id), Some(symbol)) = (item["id"].as_str(), item["symbol"].as_str()) {
                    out.push(SellOrder {
                        id: id.to_string(),
                        symbol: symbol.to_string(),
                    });
                }
            }
        }
        Ok(out)
    }
}
