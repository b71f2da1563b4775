//! REST broker client.
//!
//! Generic JSON-over-HTTPS brokerage adapter: account snapshot, latest
//! quote, order submission and cancellation. Maps transport and HTTP status
//! failures onto the execution error taxonomy so the engine's retry policy
//! stays broker-agnostic.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::domain::{AccountSnapshot, OrderStatus, Position, PositionSide};
use crate::error::ExecutionError;

use super::broker::{BrokerAck, BrokerClient, BrokerOrderRequest};

pub struct RestBroker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountDto {
    equity: Decimal,
    buying_power: Decimal,
    #[serde(default)]
    positions: Vec<PositionDto>,
}

#[derive(Debug, Deserialize)]
struct PositionDto {
    symbol: String,
    side: String,
    quantity: Decimal,
    entry_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct QuoteDto {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderDto {
    id: String,
    status: String,
    #[serde(default)]
    filled_quantity: Decimal,
    avg_fill_price: Option<Decimal>,
}

impl RestBroker {
    pub fn new(config: &BrokerConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        // The key lives in the environment only, never in config files.
        let api_key = std::env::var(&config.api_key_env).ok();
        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, ExecutionError> {
        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ExecutionError::Transient(format!("malformed broker response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), &body))
    }
}

fn classify_transport(error: reqwest::Error) -> ExecutionError {
    if error.is_timeout() || error.is_connect() {
        ExecutionError::ConnectivityLost(error.to_string())
    } else {
        ExecutionError::Transient(error.to_string())
    }
}

fn classify_status(status: u16, body: &str) -> ExecutionError {
    match status {
        429 => ExecutionError::RateLimited(body.to_string()),
        403 if body.contains("insufficient") => ExecutionError::InsufficientAsset(body.to_string()),
        401 | 403 => ExecutionError::PermissionDenied(body.to_string()),
        404 | 422 if body.contains("instrument") || body.contains("symbol") => {
            ExecutionError::UnknownInstrument(body.to_string())
        }
        400..=499 => ExecutionError::Rejected(format!("{status}: {body}")),
        _ => ExecutionError::Transient(format!("{status}: {body}")),
    }
}

fn parse_status(raw: &str) -> OrderStatus {
    match raw.to_ascii_lowercase().as_str() {
        "filled" => OrderStatus::Filled,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "accepted" | "new" | "pending_new" => OrderStatus::Submitted,
        "canceled" | "cancelled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Submitted,
    }
}

#[async_trait]
impl BrokerClient for RestBroker {
    fn name(&self) -> &str {
        "rest"
    }

    async fn get_account(&self) -> Result<AccountSnapshot, ExecutionError> {
        let dto: AccountDto = self
            .send(self.request(reqwest::Method::GET, "/v1/account"))
            .await?;
        let positions = dto
            .positions
            .into_iter()
            .map(|p| Position {
                side: if p.side.eq_ignore_ascii_case("short") {
                    PositionSide::Short
                } else {
                    PositionSide::Long
                },
                symbol: p.symbol,
                quantity: p.quantity,
                entry_price: p.entry_price,
            })
            .collect();
        Ok(AccountSnapshot {
            equity: dto.equity,
            buying_power: dto.buying_power,
            positions,
            fetched_at: Utc::now(),
        })
    }

    async fn latest_price(&self, symbol: &str) -> Result<Decimal, ExecutionError> {
        let venue = symbol.replace('/', "");
        let dto: QuoteDto = self
            .send(self.request(reqwest::Method::GET, &format!("/v1/quotes/{venue}")))
            .await?;
        Ok(dto.price)
    }

    async fn submit_order(
        &self,
        request: &BrokerOrderRequest,
    ) -> Result<BrokerAck, ExecutionError> {
        let dto: OrderDto = self
            .send(
                self.request(reqwest::Method::POST, "/v1/orders")
                    .json(request),
            )
            .await?;
        Ok(BrokerAck {
            broker_order_id: dto.id,
            status: parse_status(&dto.status),
            filled_quantity: dto.filled_quantity,
            avg_fill_price: dto.avg_fill_price,
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), ExecutionError> {
        let _: serde_json::Value = self
            .send(self.request(
                reqwest::Method::DELETE,
                &format!("/v1/orders/{broker_order_id}"),
            ))
            .await?;
        Ok(())
    }
}
