//! KRX gold market closing prices via the public data portal (data.go.kr).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::core::quote::{FetchKind, FetchRequest, Fetched, Quantity, Series, SourceId};
use crate::core::source::{FetchError, SourceClient};
use crate::providers::util::{
    RecentSeries, build_client, get_text, parse_number, parse_seoul_date,
};

pub struct KrxGoldSource {
    base_url: String,
    service_key: String,
    item_name: String,
    rows: u32,
    user_agent: String,
    timeout: Duration,
    recent: RecentSeries,
}

// One settlement table serves both the live and the history key.
const REUSE_WINDOW: Duration = Duration::from_secs(5);

impl KrxGoldSource {
    pub fn new(
        base_url: &str,
        service_key: &str,
        item_name: &str,
        rows: u32,
        user_agent: &str,
        timeout: Duration,
    ) -> Self {
        KrxGoldSource {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            item_name: item_name.to_string(),
            rows,
            user_agent: user_agent.to_string(),
            timeout,
            recent: RecentSeries::new(REUSE_WINDOW),
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/1160100/service/GetGeneralProductInfoService/getGoldPriceInfo?serviceKey={}&resultType=json&numOfRows={}&pageNo=1",
            self.base_url, self.service_key, self.rows
        )
    }
}

#[derive(Debug, Deserialize)]
struct PortalResponse {
    response: PortalBody,
}

#[derive(Debug, Deserialize)]
struct PortalBody {
    header: PortalHeader,
    body: Option<GoldBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalHeader {
    result_code: String,
    result_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoldBody {
    items: GoldItems,
}

// The portal sends `"items": ""` when a query has no rows.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GoldItems {
    Rows { item: OneOrMany },
    Blank(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<GoldItem>),
    One(GoldItem),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoldItem {
    bas_dt: String,
    itms_nm: String,
    clpr: String,
}

fn parse_items(text: &str, item_name: &str) -> Result<Series, FetchError> {
    let data: PortalResponse = serde_json::from_str(text)
        .map_err(|e| FetchError::Unparseable(format!("Failed to parse KRX gold response: {e}")))?;

    let header = data.response.header;
    if header.result_code != "00" {
        return Err(FetchError::Unreachable(format!(
            "KRX gold service returned {}: {}",
            header.result_code,
            header.result_msg.unwrap_or_default()
        )));
    }

    let items = match data.response.body.map(|body| body.items) {
        Some(GoldItems::Rows {
            item: OneOrMany::Many(items),
        }) => items,
        Some(GoldItems::Rows {
            item: OneOrMany::One(item),
        }) => vec![item],
        Some(GoldItems::Blank(_)) | None => Vec::new(),
    };

    let mut series = Series::new(Quantity::DomesticGold, SourceId::Krx);
    for item in items.iter().filter(|item| item.itms_nm.trim() == item_name) {
        let at = parse_seoul_date(&item.bas_dt, "%Y%m%d").ok_or_else(|| {
            FetchError::Unparseable(format!("Unexpected basDt: '{}'", item.bas_dt))
        })?;
        let value = parse_number(&item.clpr)
            .ok_or_else(|| FetchError::Unparseable(format!("Unexpected clpr: '{}'", item.clpr)))?;
        series.insert(at, value);
    }

    if series.is_empty() {
        return Err(FetchError::Empty(format!("No KRX rows for '{item_name}'")));
    }
    Ok(series)
}

#[async_trait]
impl SourceClient for KrxGoldSource {
    fn id(&self) -> SourceId {
        SourceId::Krx
    }

    fn supports(&self, request: &FetchRequest) -> bool {
        request.quantity == Quantity::DomesticGold
    }

    #[instrument(name = "KrxGoldFetch", skip(self), fields(request = %request))]
    async fn fetch(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
        if !self.supports(request) {
            return Err(FetchError::Empty(format!(
                "krx does not publish {}",
                request.quantity
            )));
        }
        let series = self
            .recent
            .get_or_fetch(request.quantity, || async move {
                let client = build_client(&self.user_agent, self.timeout)?;
                let text = get_text(&client, &self.url()).await?;
                let series = parse_items(&text, &self.item_name)?;
                debug!("KRX returned {} rows for {}", series.len(), self.item_name);
                Ok(series)
            })
            .await?;

        match request.kind {
            FetchKind::History => Ok(Fetched::Series(Series::clone(&series))),
            FetchKind::Live => series
                .last()
                .map(Fetched::Point)
                .ok_or_else(|| FetchError::Empty("No KRX closing price".to_string())),
        }
    }
}
