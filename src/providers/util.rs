use crate::core::quote::{Quantity, Series};
use crate::core::source::FetchError;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Asia::Seoul;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

// Query parameters whose values never leave the adapter.
const SECRET_PARAMS: &[&str] = &["serviceKey", "apiKey", "key", "token"];

/// Builds the HTTP client every adapter uses. The timeout bounds the whole request.
pub fn build_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
        .map_err(|e| FetchError::Unreachable(format!("Failed to build HTTP client: {e}")))
}

/// GETs `url` and returns the body. Transport failures and non-success statuses
/// are `Unreachable`.
pub async fn get_text(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
    let shown = redact_url(url);
    debug!("Requesting {}", shown);
    let response = client.get(url).send().await.map_err(|e| {
        FetchError::Unreachable(format!("Request error: {} URL: {shown}", e.without_url()))
    })?;

    if !response.status().is_success() {
        return Err(FetchError::Unreachable(format!(
            "HTTP error: {} URL: {}",
            response.status(),
            shown
        )));
    }

    response.text().await.map_err(|e| {
        FetchError::Unreachable(format!(
            "Failed to read body from {shown}: {}",
            e.without_url()
        ))
    })
}

/// `url` with credential query values masked, for logs and error text.
pub fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        // Keep the path but never an unparsed query.
        return url.split('?').next().unwrap_or_default().to_string();
    };
    if parsed.query().is_none() {
        return parsed.to_string();
    }
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(name, value)| {
            let value = if SECRET_PARAMS.iter().any(|p| name.eq_ignore_ascii_case(p)) {
                "REDACTED".to_string()
            } else {
                value.into_owned()
            };
            (name.into_owned(), value)
        })
        .collect();
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}

/// Parsed daily series kept for a short window per quantity. The live and
/// history keys of a daily source read the same rows, so a refresh that asks
/// for both makes one upstream request.
pub struct RecentSeries {
    window: Duration,
    slots: Mutex<HashMap<Quantity, Arc<Mutex<Option<(Instant, Arc<Series>)>>>>>,
}

impl RecentSeries {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the kept series for `quantity` if it is within the window,
    /// otherwise runs `fetch`. Concurrent callers for one quantity wait for a
    /// single fetch. Failures are not kept.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        quantity: Quantity,
        fetch: F,
    ) -> Result<Arc<Series>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Series, FetchError>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(quantity).or_default())
        };
        let mut slot = slot.lock().await;

        if let Some((_, series)) = slot
            .as_ref()
            .filter(|(at, _)| at.elapsed() <= self.window)
        {
            debug!("Reusing daily rows for {}", quantity);
            return Ok(Arc::clone(series));
        }

        let series = Arc::new(fetch().await?);
        *slot = Some((Instant::now(), Arc::clone(&series)));
        Ok(series)
    }
}

/// Parses numbers as published upstream, e.g. `"2,073.40"` or `" 86500 "`.
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// A calendar date published without a time, taken as midnight in Seoul.
pub fn seoul_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    Seoul
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_seoul_date(text: &str, format: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(text.trim(), format)
        .ok()
        .and_then(seoul_midnight)
}
