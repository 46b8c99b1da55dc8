//! Price observation types shared by sources, the cache and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

/// A logical quantity the board tracks. Each one may be served by several sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// International gold, USD per troy ounce.
    GoldUsd,
    /// International silver, USD per troy ounce.
    SilverUsd,
    /// KRW per USD.
    UsdKrw,
    /// KRX gold settlement, KRW per gram.
    DomesticGold,
}

impl Quantity {
    pub const ALL: [Quantity; 4] = [
        Quantity::GoldUsd,
        Quantity::SilverUsd,
        Quantity::UsdKrw,
        Quantity::DomesticGold,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Quantity::GoldUsd => "gold_usd",
            Quantity::SilverUsd => "silver_usd",
            Quantity::UsdKrw => "usd_krw",
            Quantity::DomesticGold => "domestic_gold",
        }
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a request wants the current point value or the historical series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    Live,
    History,
}

impl Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FetchKind::Live => "live",
            FetchKind::History => "history",
        })
    }
}

/// One fetch for one quantity. Also used as the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FetchRequest {
    pub quantity: Quantity,
    pub kind: FetchKind,
}

impl FetchRequest {
    pub const fn live(quantity: Quantity) -> Self {
        Self {
            quantity,
            kind: FetchKind::Live,
        }
    }

    pub const fn history(quantity: Quantity) -> Self {
        Self {
            quantity,
            kind: FetchKind::History,
        }
    }
}

impl Display for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.quantity, self.kind)
    }
}

/// Identity of an upstream source, used for provenance and preference lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Yahoo,
    NaverWorld,
    NaverFx,
    NaverDomestic,
    Krx,
}

impl SourceId {
    pub const fn as_str(self) -> &'static str {
        match self {
            SourceId::Yahoo => "yahoo",
            SourceId::NaverWorld => "naver_world",
            SourceId::NaverFx => "naver_fx",
            SourceId::NaverDomestic => "naver_domestic",
            SourceId::Krx => "krx",
        }
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yahoo" => Ok(SourceId::Yahoo),
            "naver_world" => Ok(SourceId::NaverWorld),
            "naver_fx" => Ok(SourceId::NaverFx),
            "naver_domestic" => Ok(SourceId::NaverDomestic),
            "krx" => Ok(SourceId::Krx),
            _ => Err(anyhow::anyhow!("Unknown source: {}", s)),
        }
    }
}

/// A single scalar observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: Quantity,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    pub source: SourceId,
}

/// Time-ordered observations of one quantity from one source.
///
/// Timestamps are unique; inserting an existing timestamp replaces its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub symbol: Quantity,
    pub source: SourceId,
    points: BTreeMap<DateTime<Utc>, f64>,
}

impl Series {
    pub fn new(symbol: Quantity, source: SourceId) -> Self {
        Self {
            symbol,
            source,
            points: BTreeMap::new(),
        }
    }

    pub fn from_points(
        symbol: Quantity,
        source: SourceId,
        points: impl IntoIterator<Item = (DateTime<Utc>, f64)>,
    ) -> Self {
        let mut series = Self::new(symbol, source);
        for (at, value) in points {
            series.insert(at, value);
        }
        series
    }

    pub fn insert(&mut self, at: DateTime<Utc>, value: f64) {
        self.points.insert(at, value);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl DoubleEndedIterator<Item = (DateTime<Utc>, f64)> + '_ {
        self.points.iter().map(|(at, value)| (*at, *value))
    }

    pub fn first_at(&self) -> Option<DateTime<Utc>> {
        self.points.keys().next().copied()
    }

    pub fn last(&self) -> Option<Quote> {
        self.points.iter().next_back().map(|(at, value)| Quote {
            symbol: self.symbol,
            value: *value,
            observed_at: *at,
            source: self.source,
        })
    }
}

/// What a source returns: a point quote for live requests, a series for history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Fetched {
    Point(Quote),
    Series(Series),
}

impl Fetched {
    pub fn source(&self) -> SourceId {
        match self {
            Fetched::Point(quote) => quote.source,
            Fetched::Series(series) => series.source,
        }
    }

    pub fn as_quote(&self) -> Option<&Quote> {
        match self {
            Fetched::Point(quote) => Some(quote),
            Fetched::Series(_) => None,
        }
    }

    pub fn as_series(&self) -> Option<&Series> {
        match self {
            Fetched::Series(series) => Some(series),
            Fetched::Point(_) => None,
        }
    }
}
