use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::core::clock::Clock;
use crate::core::quote::{FetchKind, FetchRequest, Fetched, Quantity, Quote, Series, SourceId};
use crate::core::source::{FetchError, SourceClient};
use crate::providers::util::{build_client, get_text};

fn chart_symbol(quantity: Quantity) -> Option<&'static str> {
    match quantity {
        Quantity::GoldUsd => Some("GC=F"),
        Quantity::SilverUsd => Some("SI=F"),
        Quantity::UsdKrw => Some("KRW=X"),
        Quantity::DomesticGold => None,
    }
}

/// Yahoo Finance chart API: futures for gold and silver, spot for USD/KRW.
pub struct YahooChartSource {
    base_url: String,
    user_agent: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl YahooChartSource {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        YahooChartSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
            timeout,
            clock,
        }
    }

    async fn chart(&self, symbol: &str, query: &str) -> Result<PriceChartItem, FetchError> {
        let url = format!("{}/v8/finance/chart/{}?{}", self.base_url, symbol, query);
        let client = build_client(&self.user_agent, self.timeout)?;
        let text = get_text(&client, &url).await?;

        let data: YahooChartResponse = serde_json::from_str(&text).map_err(|e| {
            FetchError::Unparseable(format!("Failed to parse JSON response for {symbol}: {e}"))
        })?;

        data.chart
            .result
            .and_then(|items| items.into_iter().next())
            .ok_or_else(|| FetchError::Empty(format!("No chart data found for symbol: {symbol}")))
    }
}

#[derive(Deserialize, Debug)]
struct YahooChartResponse {
    chart: ChartResult,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    // Required but nullable: Yahoo sends `null` for unknown symbols.
    #[serde(deserialize_with = "Option::deserialize")]
    result: Option<Vec<PriceChartItem>>,
}

#[derive(Deserialize, Debug)]
struct Indicators {
    quote: Vec<IndicatorQuote>,
}

#[derive(Deserialize, Debug)]
struct IndicatorQuote {
    close: Option<Vec<Option<f64>>>,
}

#[derive(Deserialize, Debug)]
struct PriceChartItem {
    meta: PriceChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: Option<Indicators>,
}

#[derive(Deserialize, Debug)]
struct PriceChartMeta {
    #[serde(alias = "regularMarketPrice")]
    regular_market_price: Option<f64>,
    #[serde(alias = "regularMarketTime")]
    regular_market_time: Option<i64>,
}

fn closes(item: &PriceChartItem) -> Vec<(i64, f64)> {
    let (Some(timestamps), Some(closes)) = (
        item.timestamp.as_ref(),
        item.indicators
            .as_ref()
            .and_then(|inds| inds.quote.first())
            .and_then(|q| q.close.as_ref()),
    ) else {
        return Vec::new();
    };

    timestamps
        .iter()
        .zip(closes.iter())
        .filter_map(|(ts, close)| close.filter(|c| c.is_finite() && *c > 0.0).map(|c| (*ts, c)))
        .collect()
}

#[async_trait]
impl SourceClient for YahooChartSource {
    fn id(&self) -> SourceId {
        SourceId::Yahoo
    }

    fn supports(&self, request: &FetchRequest) -> bool {
        chart_symbol(request.quantity).is_some()
    }

    #[instrument(
        name = "YahooChartFetch",
        skip(self),
        fields(request = %request)
    )]
    async fn fetch(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
        let symbol = chart_symbol(request.quantity).ok_or_else(|| {
            FetchError::Empty(format!("Yahoo does not quote {}", request.quantity))
        })?;

        match request.kind {
            FetchKind::Live => {
                let item = self.chart(symbol, "interval=1m&range=1d").await?;
                let value = item
                    .meta
                    .regular_market_price
                    .filter(|v| v.is_finite() && *v > 0.0)
                    .ok_or_else(|| {
                        FetchError::Empty(format!("No market price for symbol: {symbol}"))
                    })?;
                let observed_at = item
                    .meta
                    .regular_market_time
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                    .unwrap_or_else(|| self.clock.now());
                debug!("Yahoo live {} = {} at {}", symbol, value, observed_at);
                Ok(Fetched::Point(Quote {
                    symbol: request.quantity,
                    value,
                    observed_at,
                    source: SourceId::Yahoo,
                }))
            }
            FetchKind::History => {
                let item = self.chart(symbol, "interval=1d&range=3mo").await?;
                let points: Vec<_> = closes(&item)
                    .into_iter()
                    .filter_map(|(ts, close)| Utc.timestamp_opt(ts, 0).single().map(|at| (at, close)))
                    .collect();
                if points.is_empty() {
                    return Err(FetchError::Empty(format!(
                        "No daily closes for symbol: {symbol}"
                    )));
                }
                debug!("Yahoo history {} with {} points", symbol, points.len());
                Ok(Fetched::Series(Series::from_points(
                    request.quantity,
                    SourceId::Yahoo,
                    points,
                )))
            }
        }
    }
}
