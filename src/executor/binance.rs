//! Binance spot REST client implementing [`ExchangeClient`]. HMAC-SHA256
//! request signing for trade endpoints; public endpoints are unsigned.

use crate::executor::{ExchangeClient, ExchangePosition, Fill};
use crate::domain::position::Side;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;

fn build_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(5)
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

pub struct BinanceExchangeClient {
    client: ClientWithMiddleware,
    api_key: String,
    api_secret: String,
    base_url: String,
}

impl BinanceExchangeClient {
    pub fn new(api_key: String, api_secret: String, base_url: String) -> Self {
        Self {
            client: build_client(),
            api_key,
            api_secret,
            base_url,
        }
    }

    fn sign(&self, query: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, mut params: Vec<(&str, String)>) -> String {
        params.push(("timestamp", chrono::Utc::now().timestamp_millis().to_string()));
        let query: String = params.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn market_order(&self, symbol: &str, side: &str, quantity_param: (&str, String)) -> Result<Fill> {
        let query = self.signed_query(vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            quantity_param,
        ]);
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("failed to place market order on Binance")?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance order rejected: {body}");
        }

        #[derive(Deserialize)]
        struct OrderResponse {
            #[serde(rename = "executedQty")]
            executed_qty: String,
            #[serde(rename = "cummulativeQuoteQty")]
            cumulative_quote_qty: String,
        }

        let parsed: OrderResponse = response.json().await.context("failed to parse Binance order response")?;
        let executed_quantity = Decimal::from_str(&parsed.executed_qty).context("invalid executedQty")?;
        let quote_spent = Decimal::from_str(&parsed.cumulative_quote_qty).context("invalid cummulativeQuoteQty")?;
        let avg_price = if executed_quantity.is_zero() {
            Decimal::ZERO
        } else {
            quote_spent / executed_quantity
        };

        Ok(Fill {
            symbol: symbol.to_string(),
            avg_price,
            executed_quantity,
        })
    }
}

#[async_trait]
impl ExchangeClient for BinanceExchangeClient {
    async fn market_buy(&self, symbol: &str, quote_amount: Decimal) -> Result<Fill> {
        self.market_order(symbol, "BUY", ("quoteOrderQty", quote_amount.to_string())).await
    }

    async fn market_sell(&self, symbol: &str, base_quantity: Decimal) -> Result<Fill> {
        self.market_order(symbol, "SELL", ("quantity", base_quantity.to_string())).await
    }

    async fn get_usdt_balance(&self) -> Result<Decimal> {
        let query = self.signed_query(vec![]);
        let url = format!("{}/api/v3/account?{}", self.base_url, query);

        #[derive(Deserialize)]
        struct Balance {
            asset: String,
            free: String,
        }
        #[derive(Deserialize)]
        struct AccountResponse {
            balances: Vec<Balance>,
        }

        let response = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("failed to fetch Binance account")?;
        let parsed: AccountResponse = response.json().await.context("failed to parse Binance account response")?;

        parsed
            .balances
            .into_iter()
            .find(|b| b.asset == "USDT")
            .map(|b| Decimal::from_str(&b.free).unwrap_or(Decimal::ZERO))
            .context("USDT balance not present in account response")
    }

    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>> {
        let query = self.signed_query(vec![]);
        let url = format!("{}/api/v3/account?{}", self.base_url, query);

        #[derive(Deserialize)]
        struct Balance {
            asset: String,
            free: String,
        }
        #[derive(Deserialize)]
        struct AccountResponse {
            balances: Vec<Balance>,
        }

        let response = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("failed to fetch Binance account")?;
        let parsed: AccountResponse = response.json().await.context("failed to parse Binance account response")?;

        Ok(parsed
            .balances
            .into_iter()
            .filter(|b| b.asset != "USDT")
            .filter_map(|b| {
                let qty = Decimal::from_str(&b.free).ok()?;
                if qty.is_zero() {
                    return None;
                }
                Some(ExchangePosition {
                    symbol: format!("{}USDT", b.asset),
                    side: Side::Long,
                    quantity: qty,
                    avg_price: Decimal::ZERO,
                })
            })
            .collect())
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal> {
        #[derive(Deserialize)]
        struct PriceResponse {
            price: String,
        }
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let response = self.client.get(&url).send().await.context("failed to fetch Binance price")?;
        let parsed: PriceResponse = response.json().await.context("failed to parse Binance price response")?;
        Decimal::from_str(&parsed.price).context("invalid price in Binance response")
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/api/v3/ping", self.base_url);
        let response = self.client.get(&url).send().await.context("failed to reach Binance")?;
        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!("Binance ping returned status {}", response.status())
        }
    }
}
