use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use market_core::{Bar, Interval, MarketError, MarketKind, RequestBudget, RetryPolicy, TimeRange};
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub spot_base: String,
    pub derivatives_base: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    /// Requests per minute budget shared by both endpoints.
    pub rate_limit_per_min: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            spot_base: "https://api.binance.com".to_string(),
            derivatives_base: "https://dapi.binance.com".to_string(),
            api_key: None,
            api_secret: None,
            rate_limit_per_min: 1100,
        }
    }
}

/// Thin K-line client over the exchange's public REST endpoints.
#[derive(Clone)]
pub struct ExchangeClient {
    config: ExchangeConfig,
    client: Client,
    budget: Arc<RequestBudget>,
    retry: RetryPolicy,
}

impl ExchangeClient {
    pub fn new(config: ExchangeConfig) -> Self {
        if config.api_key.is_none() || config.api_secret.is_none() {
            tracing::warn!(
                "Exchange credentials missing; authenticated endpoints disabled, public K-line endpoints remain usable"
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            budget: Arc::new(RequestBudget::per_minute(config.rate_limit_per_min as u32)),
            config,
            client,
            retry: RetryPolicy::default(),
        }
    }

    /// Spot K-lines: `GET {spot_base}/api/v3/klines`.
    pub async fn spot_klines(
        &self,
        symbol: &str,
        interval: Interval,
        range: TimeRange,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        let url = format!("{}/api/v3/klines", self.config.spot_base);
        self.fetch_klines(&url, symbol, MarketKind::Spot, interval, range, limit, token)
            .await
    }

    /// Derivatives K-lines: `GET {derivatives_base}/dapi/v1/klines`.
    pub async fn futures_klines(
        &self,
        symbol: &str,
        interval: Interval,
        range: TimeRange,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        let url = format!("{}/dapi/v1/klines", self.config.derivatives_base);
        self.fetch_klines(&url, symbol, MarketKind::Futures, interval, range, limit, token)
            .await
    }

    async fn fetch_klines(
        &self,
        url: &str,
        symbol: &str,
        kind: MarketKind,
        interval: Interval,
        range: TimeRange,
        limit: usize,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        let rows: Vec<serde_json::Value> = self
            .retry
            .run("exchange klines", token, || async {
                self.budget.reserve().await;

                let response = self
                    .client
                    .get(url)
                    .query(&[
                        ("symbol", symbol.to_string()),
                        ("interval", interval.as_str().to_string()),
                        ("limit", limit.to_string()),
                        ("startTime", range.from.timestamp_millis().to_string()),
                        ("endTime", range.to.timestamp_millis().to_string()),
                    ])
                    .send()
                    .await
                    .map_err(|e| MarketError::UpstreamUnavailable(e.to_string()))?;

                let status = response.status();
                if status.is_client_error() && status.as_u16() != 429 {
                    let body = response.text().await.unwrap_or_default();
                    return Err(MarketError::InvalidInput(format!("HTTP {status}: {body}")));
                }
                if !status.is_success() {
                    return Err(MarketError::UpstreamUnavailable(format!("HTTP {status}")));
                }

                response
                    .json()
                    .await
                    .map_err(|e| MarketError::UpstreamUnavailable(e.to_string()))
            })
            .await?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(bar) = parse_kline_row(row, symbol, kind, interval) {
                bars.push(bar);
            }
        }

        Ok(bars)
    }
}

/// One exchange K-line row is a heterogeneous array:
/// `[openTimeMs, open, high, low, close, volume, closeTimeMs, ...]`.
/// Only the first seven fields are consumed; prices arrive as strings.
fn parse_kline_row(
    row: &serde_json::Value,
    symbol: &str,
    kind: MarketKind,
    interval: Interval,
) -> Option<Bar> {
    let fields = row.as_array()?;
    if fields.len() < 7 {
        return None;
    }

    let open_time = DateTime::from_timestamp_millis(fields[0].as_i64()?)?;

    Some(Bar {
        symbol: symbol.to_string(),
        kind,
        interval,
        open_time,
        open: value_f64(&fields[1])?,
        high: value_f64(&fields[2])?,
        low: value_f64(&fields[3])?,
        close: value_f64(&fields[4])?,
        volume: value_f64(&fields[5])?,
        is_valid: true,
        quality_score: 0,
    })
}

fn value_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    prices: Vec<(i64, f64)>,
    #[serde(default)]
    total_volumes: Vec<(i64, f64)>,
}

/// Aggregator market-chart client (fallback source).
#[derive(Clone)]
pub struct AggregatorClient {
    base: String,
    client: Client,
    budget: Arc<RequestBudget>,
    retry: RetryPolicy,
}

impl AggregatorClient {
    pub fn new(base: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            base,
            client,
            budget: Arc::new(RequestBudget::per_minute(30)),
            retry: RetryPolicy::default(),
        }
    }

    /// Map an exchange pair symbol to the aggregator's coin id.
    pub fn coin_id(symbol: &str) -> String {
        let base = symbol
            .strip_suffix("USDT")
            .or_else(|| symbol.strip_suffix("USD"))
            .unwrap_or(symbol);
        match base {
            "BTC" => "bitcoin".to_string(),
            "ETH" => "ethereum".to_string(),
            "SOL" => "solana".to_string(),
            "BNB" => "binancecoin".to_string(),
            "XRP" => "ripple".to_string(),
            other => other.to_lowercase(),
        }
    }

    /// `GET {base}/api/v3/coins/{id}/market_chart`; only the `prices`
    /// (and, when present, `total_volumes`) series are consumed.
    pub async fn market_chart(
        &self,
        symbol: &str,
        interval: Interval,
        days: u32,
        token: &CancellationToken,
    ) -> Result<Vec<Bar>, MarketError> {
        let coin = Self::coin_id(symbol);
        let url = format!("{}/api/v3/coins/{}/market_chart", self.base, coin);
        let hourly = !matches!(interval, Interval::Day1) || days <= 90;

        let chart: MarketChartResponse = self
            .retry
            .run("aggregator market_chart", token, || async {
                self.budget.reserve().await;

                let days_param = days.to_string();
                let mut request = self
                    .client
                    .get(&url)
                    .query(&[("vs_currency", "usd"), ("days", days_param.as_str())]);
                if hourly {
                    request = request.query(&[("interval", "hourly")]);
                }

                let response = request
                    .send()
                    .await
                    .map_err(|e| MarketError::UpstreamUnavailable(e.to_string()))?;

                if !response.status().is_success() {
                    return Err(MarketError::UpstreamUnavailable(format!(
                        "HTTP {}",
                        response.status()
                    )));
                }

                response
                    .json()
                    .await
                    .map_err(|e| MarketError::UpstreamUnavailable(e.to_string()))
            })
            .await?;

        let mut bars = Vec::with_capacity(chart.prices.len().saturating_sub(1));
        for pair in chart.prices.windows(2) {
            let (_, prev_price) = pair[0];
            let (ts, price) = pair[1];
            let Some(open_time) = DateTime::from_timestamp_millis(ts) else {
                continue;
            };

            let volume = chart
                .total_volumes
                .iter()
                .find(|(vts, _)| *vts == ts)
                .map(|(_, v)| *v)
                .unwrap_or(0.0);

            bars.push(Bar {
                symbol: symbol.to_string(),
                kind: MarketKind::Spot,
                interval,
                open_time,
                open: prev_price,
                high: prev_price.max(price),
                low: prev_price.min(price),
                close: price,
                volume,
                is_valid: true,
                quality_score: 0,
            });
        }

        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_row_parses_string_prices() {
        let row = serde_json::json!([
            1700000000000i64,
            "42000.10",
            "42500.00",
            "41900.00",
            "42400.50",
            "123.456",
            1700003599999i64,
            "ignored",
            0
        ]);
        let bar = parse_kline_row(&row, "BTCUSDT", MarketKind::Spot, Interval::Hour1).unwrap();
        assert_eq!(bar.open, 42000.10);
        assert_eq!(bar.close, 42400.50);
        assert_eq!(bar.volume, 123.456);
    }

    #[test]
    fn kline_row_rejects_short_arrays() {
        let row = serde_json::json!([1700000000000i64, "1", "2"]);
        assert!(parse_kline_row(&row, "BTCUSDT", MarketKind::Spot, Interval::Hour1).is_none());
    }

    #[test]
    fn coin_ids_map_major_pairs() {
        assert_eq!(AggregatorClient::coin_id("BTCUSDT"), "bitcoin");
        assert_eq!(AggregatorClient::coin_id("ETHUSD"), "ethereum");
        assert_eq!(AggregatorClient::coin_id("DOGEUSDT"), "doge");
    }
}
