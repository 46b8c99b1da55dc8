//! Naver Finance daily quote pages (HTML) and the market index chart API (JSON).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::core::clock::Clock;
use crate::core::quote::{FetchKind, FetchRequest, Fetched, Quantity, Quote, Series, SourceId};
use crate::core::source::{FetchError, SourceClient};
use crate::providers::util::{
    RecentSeries, build_client, get_text, parse_number, parse_seoul_date,
};

/// Scrapes a `table.tbl_exchange` daily quote page: date in the first cell,
/// closing price in the second.
pub struct NaverDailyQuoteSource {
    id: SourceId,
    base_url: String,
    pages: HashMap<Quantity, String>,
    user_agent: String,
    timeout: Duration,
    recent: RecentSeries,
}

// The live value is the newest row of the page the history key reads.
const REUSE_WINDOW: Duration = Duration::from_secs(5);

impl NaverDailyQuoteSource {
    /// International settlement prices for gold and silver (USD per troy ounce).
    pub fn world(
        base_url: &str,
        gold_code: &str,
        silver_code: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Self {
        let page = |code: &str| format!("/marketindex/worldDailyQuote.naver?marketindexCd={code}&fdtc=2&page=1");
        Self {
            id: SourceId::NaverWorld,
            base_url: base_url.trim_end_matches('/').to_string(),
            pages: HashMap::from([
                (Quantity::GoldUsd, page(gold_code)),
                (Quantity::SilverUsd, page(silver_code)),
            ]),
            user_agent: user_agent.to_string(),
            timeout,
            recent: RecentSeries::new(REUSE_WINDOW),
        }
    }

    /// Domestic gold prices (KRW per gram).
    pub fn domestic(base_url: &str, user_agent: &str, timeout: Duration) -> Self {
        Self {
            id: SourceId::NaverDomestic,
            base_url: base_url.trim_end_matches('/').to_string(),
            pages: HashMap::from([(
                Quantity::DomesticGold,
                "/marketindex/goldDailyQuote.naver?page=1".to_string(),
            )]),
            user_agent: user_agent.to_string(),
            timeout,
            recent: RecentSeries::new(REUSE_WINDOW),
        }
    }
}

fn parse_daily_table(html: &str) -> Result<Vec<(DateTime<Utc>, f64)>, FetchError> {
    let document = Html::parse_document(html);
    let table_selector = Selector::parse("table.tbl_exchange")
        .map_err(|e| FetchError::Unparseable(format!("Invalid selector: {e}")))?;
    let row_selector = Selector::parse("tr")
        .map_err(|e| FetchError::Unparseable(format!("Invalid selector: {e}")))?;
    let cell_selector = Selector::parse("td")
        .map_err(|e| FetchError::Unparseable(format!("Invalid selector: {e}")))?;

    let table = document
        .select(&table_selector)
        .next()
        .ok_or_else(|| FetchError::Unparseable("Quote table not found in page".to_string()))?;

    let mut points = Vec::new();
    for row in table.select(&row_selector) {
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|td| td.text().collect::<String>().trim().to_string())
            .collect();
        // Header rows use <th> and have no cells.
        if cells.len() < 2 {
            continue;
        }
        let at = parse_seoul_date(&cells[0], "%Y.%m.%d").ok_or_else(|| {
            FetchError::Unparseable(format!("Unexpected date cell: '{}'", cells[0]))
        })?;
        let value = parse_number(&cells[1]).ok_or_else(|| {
            FetchError::Unparseable(format!("Unexpected price cell: '{}'", cells[1]))
        })?;
        points.push((at, value));
    }
    Ok(points)
}

#[async_trait]
impl SourceClient for NaverDailyQuoteSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn supports(&self, request: &FetchRequest) -> bool {
        self.pages.contains_key(&request.quantity)
    }

    #[instrument(
        name = "NaverDailyQuoteFetch",
        skip(self),
        fields(source = %self.id, request = %request)
    )]
    async fn fetch(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
        let page = self.pages.get(&request.quantity).ok_or_else(|| {
            FetchError::Empty(format!("{} does not publish {}", self.id, request.quantity))
        })?;
        let url = format!("{}{}", self.base_url, page);
        let series = self
            .recent
            .get_or_fetch(request.quantity, || async move {
                let client = build_client(&self.user_agent, self.timeout)?;
                let html = get_text(&client, &url).await?;

                let points = parse_daily_table(&html)?;
                if points.is_empty() {
                    return Err(FetchError::Empty(format!(
                        "No rows in daily quote table for {}",
                        request.quantity
                    )));
                }
                debug!("{} returned {} daily rows", self.id, points.len());
                Ok(Series::from_points(request.quantity, self.id, points))
            })
            .await?;

        match request.kind {
            FetchKind::History => Ok(Fetched::Series(Series::clone(&series))),
            FetchKind::Live => series.last().map(Fetched::Point).ok_or_else(|| {
                FetchError::Empty(format!("No latest row for {}", request.quantity))
            }),
        }
    }
}

/// Naver market index chart API for USD/KRW.
pub struct NaverFxSource {
    base_url: String,
    user_agent: String,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl NaverFxSource {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
            timeout,
            clock,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FxChartResponse {
    result: Vec<FxChartPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FxChartPoint {
    close_price: Numeric,
    local_traded_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    fn value(&self) -> Option<f64> {
        match self {
            Numeric::Number(v) => Some(*v).filter(|v| v.is_finite()),
            Numeric::Text(text) => parse_number(text),
        }
    }
}

fn parse_traded_at(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_seoul_date(text, "%Y-%m-%d"))
        .or_else(|| parse_seoul_date(text, "%Y%m%d"))
}

#[async_trait]
impl SourceClient for NaverFxSource {
    fn id(&self) -> SourceId {
        SourceId::NaverFx
    }

    fn supports(&self, request: &FetchRequest) -> bool {
        request.quantity == Quantity::UsdKrw
    }

    #[instrument(name = "NaverFxFetch", skip(self), fields(request = %request))]
    async fn fetch(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
        if !self.supports(request) {
            return Err(FetchError::Empty(format!(
                "naver_fx does not publish {}",
                request.quantity
            )));
        }
        let url = format!(
            "{}/api/iuser/marketindex/getChartData.nhn?marketindexCd=FX_USDKRW&periodType=day",
            self.base_url
        );
        let client = build_client(&self.user_agent, self.timeout)?;
        let text = get_text(&client, &url).await?;
        let data: FxChartResponse = serde_json::from_str(&text).map_err(|e| {
            FetchError::Unparseable(format!("Failed to parse FX chart response: {e}"))
        })?;

        let mut points = Vec::with_capacity(data.result.len());
        for point in &data.result {
            let value = point.close_price.value().ok_or_else(|| {
                FetchError::Unparseable(format!("Unexpected closePrice: {:?}", point.close_price))
            })?;
            let at = point.local_traded_at.as_deref().and_then(parse_traded_at);
            points.push((at, value));
        }

        match request.kind {
            FetchKind::Live => {
                let (at, value) = points
                    .last()
                    .copied()
                    .ok_or_else(|| FetchError::Empty("FX chart has no points".to_string()))?;
                Ok(Fetched::Point(Quote {
                    symbol: Quantity::UsdKrw,
                    value,
                    observed_at: at.unwrap_or_else(|| self.clock.now()),
                    source: SourceId::NaverFx,
                }))
            }
            FetchKind::History => {
                if points.is_empty() {
                    return Err(FetchError::Empty("FX chart has no points".to_string()));
                }
                let dated: Vec<_> = points
                    .into_iter()
                    .filter_map(|(at, value)| at.map(|at| (at, value)))
                    .collect();
                if dated.is_empty() {
                    return Err(FetchError::Unparseable(
                        "FX chart points carry no trade dates".to_string(),
                    ));
                }
                Ok(Fetched::Series(Series::from_points(
                    Quantity::UsdKrw,
                    SourceId::NaverFx,
                    dated,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WORLD_PAGE: &str = r#"
        <html><body>
        <table class="tbl_exchange today">
          <thead><tr><th>날짜</th><th>종가</th><th>전일대비</th><th>등락율</th></tr></thead>
          <tbody>
            <tr class="up"><td class="date">2024.01.03</td><td class="num">2,042.80</td><td class="num">4.10</td><td class="num">+0.20%</td></tr>
            <tr class="down"><td class="date">2024.01.02</td><td class="num">2,038.70</td><td class="num">3.00</td><td class="num">-0.15%</td></tr>
          </tbody>
        </table>
        </body></html>"#;

    fn seoul_midnight(day: u32) -> DateTime<Utc> {
        // Midnight in Seoul is 15:00 UTC on the previous day.
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap() - chrono::Duration::hours(9)
    }

    async fn mount_page(mock_server: &MockServer, page_path: &str, body: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(page_path))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(mock_server)
            .await;
    }

    fn world(uri: &str) -> NaverDailyQuoteSource {
        NaverDailyQuoteSource::world(uri, "CMDT_GC", "CMDT_SI", "test", Duration::from_secs(5))
    }

    #[test]
    fn test_parse_daily_table() {
        let points = parse_daily_table(WORLD_PAGE).unwrap();
        assert_eq!(
            points,
            vec![(seoul_midnight(3), 2042.8), (seoul_midnight(2), 2038.7)]
        );
    }

    #[test]
    fn test_missing_table_is_unparseable() {
        let err = parse_daily_table("<html><body><p>점검 중</p></body></html>").unwrap_err();
        assert!(matches!(err, FetchError::Unparseable(_)));
    }

    #[test]
    fn test_changed_cell_layout_is_unparseable() {
        let html = r#"<table class="tbl_exchange"><tr><td>2,042.80</td><td>2024.01.03</td></tr></table>"#;
        let err = parse_daily_table(html).unwrap_err();
        assert!(matches!(err, FetchError::Unparseable(ref msg) if msg.contains("date")));
    }

    #[tokio::test]
    async fn test_world_history_is_sorted_series() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/marketindex/worldDailyQuote.naver"))
            .and(query_param("marketindexCd", "CMDT_GC"))
            .respond_with(ResponseTemplate::new(200).set_body_string(WORLD_PAGE))
            .mount(&mock_server)
            .await;

        let fetched = world(&mock_server.uri())
            .fetch(&FetchRequest::history(Quantity::GoldUsd))
            .await
            .unwrap();
        let series = fetched.as_series().unwrap();
        assert_eq!(series.source, SourceId::NaverWorld);
        assert_eq!(series.first_at(), Some(seoul_midnight(2)));
        assert_eq!(series.last().unwrap().value, 2042.8);
    }

    #[tokio::test]
    async fn test_world_live_is_latest_row() {
        let mock_server = MockServer::start().await;
        mount_page(&mock_server, "/marketindex/worldDailyQuote.naver", WORLD_PAGE, 200).await;

        let fetched = world(&mock_server.uri())
            .fetch(&FetchRequest::live(Quantity::SilverUsd))
            .await
            .unwrap();
        let quote = fetched.as_quote().unwrap();
        assert_eq!(quote.symbol, Quantity::SilverUsd);
        assert_eq!(quote.observed_at, seoul_midnight(3));
    }

    #[tokio::test]
    async fn test_live_and_history_share_one_page_per_quantity() {
        let mock_server = MockServer::start().await;
        for code in ["CMDT_GC", "CMDT_SI"] {
            Mock::given(method("GET"))
                .and(path("/marketindex/worldDailyQuote.naver"))
                .and(query_param("marketindexCd", code))
                .respond_with(ResponseTemplate::new(200).set_body_string(WORLD_PAGE))
                .expect(1)
                .mount(&mock_server)
                .await;
        }

        let source = world(&mock_server.uri());
        let gold_live_req = FetchRequest::live(Quantity::GoldUsd);
        let gold_history_req = FetchRequest::history(Quantity::GoldUsd);
        let silver_live_req = FetchRequest::live(Quantity::SilverUsd);
        let (gold_live, gold_history, silver_live) = tokio::join!(
            source.fetch(&gold_live_req),
            source.fetch(&gold_history_req),
            source.fetch(&silver_live_req),
        );
        assert_eq!(gold_live.unwrap().as_quote().unwrap().value, 2042.8);
        assert_eq!(gold_history.unwrap().as_series().unwrap().len(), 2);
        assert_eq!(
            silver_live.unwrap().as_quote().unwrap().symbol,
            Quantity::SilverUsd
        );
    }

    #[tokio::test]
    async fn test_empty_table_is_empty() {
        let mock_server = MockServer::start().await;
        mount_page(
            &mock_server,
            "/marketindex/goldDailyQuote.naver",
            r#"<table class="tbl_exchange"><thead><tr><th>날짜</th></tr></thead><tbody></tbody></table>"#,
            200,
        )
        .await;

        let source = NaverDailyQuoteSource::domestic(&mock_server.uri(), "test", Duration::from_secs(5));
        let err = source
            .fetch(&FetchRequest::history(Quantity::DomesticGold))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Empty(_)));
    }

    #[test]
    fn test_world_and_domestic_support() {
        let world = world("http://localhost");
        assert!(world.supports(&FetchRequest::live(Quantity::GoldUsd)));
        assert!(!world.supports(&FetchRequest::live(Quantity::DomesticGold)));
        let domestic = NaverDailyQuoteSource::domestic("http://localhost", "test", Duration::from_secs(5));
        assert!(domestic.supports(&FetchRequest::history(Quantity::DomesticGold)));
        assert!(!domestic.supports(&FetchRequest::history(Quantity::UsdKrw)));
    }

    fn fx(uri: &str) -> NaverFxSource {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 3, 2, 0, 0).unwrap(),
        ));
        NaverFxSource::new(uri, "test", Duration::from_secs(5), clock)
    }

    #[tokio::test]
    async fn test_fx_history_and_live() {
        let mock_server = MockServer::start().await;
        mount_page(
            &mock_server,
            "/api/iuser/marketindex/getChartData.nhn",
            r#"{"result": [
                {"localTradedAt": "2024-01-02", "closePrice": "1,295.50"},
                {"localTradedAt": "2024-01-03", "closePrice": 1300.0}
            ]}"#,
            200,
        )
        .await;
        let source = fx(&mock_server.uri());

        let history = source
            .fetch(&FetchRequest::history(Quantity::UsdKrw))
            .await
            .unwrap();
        let series = history.as_series().unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.first_at(), Some(seoul_midnight(2)));

        let live = source.fetch(&FetchRequest::live(Quantity::UsdKrw)).await.unwrap();
        let quote = live.as_quote().unwrap();
        assert_eq!(quote.value, 1300.0);
        assert_eq!(quote.observed_at, seoul_midnight(3));
    }

    #[tokio::test]
    async fn test_fx_live_without_date_is_client_stamped() {
        let mock_server = MockServer::start().await;
        mount_page(
            &mock_server,
            "/api/iuser/marketindex/getChartData.nhn",
            r#"{"result": [{"closePrice": "1,310.20"}]}"#,
            200,
        )
        .await;

        let live = fx(&mock_server.uri())
            .fetch(&FetchRequest::live(Quantity::UsdKrw))
            .await
            .unwrap();
        let quote = live.as_quote().unwrap();
        assert_eq!(quote.value, 1310.2);
        assert_eq!(
            quote.observed_at,
            Utc.with_ymd_and_hms(2024, 1, 3, 2, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_fx_page_change_is_unparseable() {
        let mock_server = MockServer::start().await;
        mount_page(
            &mock_server,
            "/api/iuser/marketindex/getChartData.nhn",
            "<html>moved</html>",
            200,
        )
        .await;

        let err = fx(&mock_server.uri())
            .fetch(&FetchRequest::live(Quantity::UsdKrw))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unparseable(_)));
    }

    #[tokio::test]
    async fn test_fx_empty_result() {
        let mock_server = MockServer::start().await;
        mount_page(
            &mock_server,
            "/api/iuser/marketindex/getChartData.nhn",
            r#"{"result": []}"#,
            200,
        )
        .await;

        let err = fx(&mock_server.uri())
            .fetch(&FetchRequest::live(Quantity::UsdKrw))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Empty(_)));
    }
}
