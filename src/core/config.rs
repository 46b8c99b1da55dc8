use crate::core::derive::UnitConstants;
use crate::core::quote::{FetchKind, FetchRequest, Quantity, SourceId};
use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct YahooProviderConfig {
    pub base_url: String,
}

impl Default for YahooProviderConfig {
    fn default() -> Self {
        YahooProviderConfig {
            base_url: "https://query1.finance.yahoo.com".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct NaverProviderConfig {
    /// Host of the daily quote pages.
    pub base_url: String,
    /// Host of the market index chart API.
    pub fx_base_url: String,
    pub gold_code: String,
    pub silver_code: String,
}

impl Default for NaverProviderConfig {
    fn default() -> Self {
        NaverProviderConfig {
            base_url: "https://finance.naver.com".to_string(),
            fx_base_url: "https://marketindex.naver.com".to_string(),
            gold_code: "CMDT_GC".to_string(),
            silver_code: "CMDT_SI".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct KrxProviderConfig {
    pub base_url: String,
    pub service_key: Option<String>,
    /// Product whose closing price is used, e.g. the 1kg 99.99 contract.
    pub item_name: String,
    pub rows: u32,
}

impl Default for KrxProviderConfig {
    fn default() -> Self {
        KrxProviderConfig {
            base_url: "https://apis.data.go.kr".to_string(),
            service_key: None,
            item_name: "금 99.99_1Kg".to_string(),
            rows: 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub yahoo: YahooProviderConfig,
    pub naver: NaverProviderConfig,
    pub krx: KrxProviderConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            timeout_secs: 10,
            user_agent: "Mozilla/5.0 (compatible; donprice/0.1)".to_string(),
        }
    }
}

/// Upper bound for every cache duration in the config.
pub const MAX_CACHE_SECS: u64 = 366 * 24 * 60 * 60;

/// Seconds a successful fetch stays fresh, per kind.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct TtlSecs {
    pub live: u64,
    pub history: u64,
}

impl TtlSecs {
    fn get(&self, kind: FetchKind) -> u64 {
        match kind {
            FetchKind::Live => self.live,
            FetchKind::History => self.history,
        }
    }
}

/// A per-quantity entry as written in the file. Missing kinds keep that
/// quantity's defaults.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct PerKind<T> {
    live: Option<T>,
    history: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PerQuantity<T> {
    gold_usd: PerKind<T>,
    silver_usd: PerKind<T>,
    usd_krw: PerKind<T>,
    domestic_gold: PerKind<T>,
}

impl<T> Default for PerQuantity<T> {
    fn default() -> Self {
        PerQuantity {
            gold_usd: PerKind::default(),
            silver_usd: PerKind::default(),
            usd_krw: PerKind::default(),
            domestic_gold: PerKind::default(),
        }
    }
}

impl<T> Default for PerKind<T> {
    fn default() -> Self {
        PerKind {
            live: None,
            history: None,
        }
    }
}

impl PerKind<u64> {
    fn over(self, defaults: TtlSecs) -> TtlSecs {
        TtlSecs {
            live: self.live.unwrap_or(defaults.live),
            history: self.history.unwrap_or(defaults.history),
        }
    }
}

impl PerKind<Vec<SourceId>> {
    fn over(self, defaults: SourceLists) -> SourceLists {
        SourceLists {
            live: self.live.unwrap_or(defaults.live),
            history: self.history.unwrap_or(defaults.history),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(from = "PerQuantity<u64>")]
pub struct TtlTable {
    pub gold_usd: TtlSecs,
    pub silver_usd: TtlSecs,
    pub usd_krw: TtlSecs,
    pub domestic_gold: TtlSecs,
}

impl Default for TtlTable {
    fn default() -> Self {
        TtlTable {
            gold_usd: TtlSecs {
                live: 60,
                history: 60 * 60,
            },
            silver_usd: TtlSecs {
                live: 60,
                history: 60 * 60,
            },
            usd_krw: TtlSecs {
                live: 300,
                history: 60 * 60,
            },
            domestic_gold: TtlSecs {
                live: 600,
                history: 6 * 60 * 60,
            },
        }
    }
}

impl From<PerQuantity<u64>> for TtlTable {
    fn from(file: PerQuantity<u64>) -> Self {
        let defaults = TtlTable::default();
        TtlTable {
            gold_usd: file.gold_usd.over(defaults.gold_usd),
            silver_usd: file.silver_usd.over(defaults.silver_usd),
            usd_krw: file.usd_krw.over(defaults.usd_krw),
            domestic_gold: file.domestic_gold.over(defaults.domestic_gold),
        }
    }
}

impl TtlTable {
    pub fn get(&self, quantity: Quantity) -> TtlSecs {
        match quantity {
            Quantity::GoldUsd => self.gold_usd,
            Quantity::SilverUsd => self.silver_usd,
            Quantity::UsdKrw => self.usd_krw,
            Quantity::DomesticGold => self.domestic_gold,
        }
    }
}

/// Age beyond which a served value is flagged stale, per kind.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct StalenessConfig {
    pub live_secs: u64,
    pub history_secs: u64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        StalenessConfig {
            live_secs: 30 * 60,
            history_secs: 48 * 60 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub negative_ttl_secs: u64,
    pub ttl: TtlTable,
    pub staleness: StalenessConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            negative_ttl_secs: 30,
            ttl: TtlTable::default(),
            staleness: StalenessConfig::default(),
        }
    }
}

/// Ordered source preferences per kind. Earlier entries win.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
pub struct SourceLists {
    pub live: Vec<SourceId>,
    pub history: Vec<SourceId>,
}

impl SourceLists {
    fn get(&self, kind: FetchKind) -> &[SourceId] {
        match kind {
            FetchKind::Live => &self.live,
            FetchKind::History => &self.history,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(from = "PerQuantity<Vec<SourceId>>")]
pub struct SourceTable {
    pub gold_usd: SourceLists,
    pub silver_usd: SourceLists,
    pub usd_krw: SourceLists,
    pub domestic_gold: SourceLists,
}

impl Default for SourceTable {
    fn default() -> Self {
        use SourceId::*;
        SourceTable {
            gold_usd: SourceLists {
                live: vec![Yahoo, NaverWorld],
                history: vec![NaverWorld, Yahoo],
            },
            silver_usd: SourceLists {
                live: vec![Yahoo, NaverWorld],
                history: vec![NaverWorld, Yahoo],
            },
            usd_krw: SourceLists {
                live: vec![NaverFx, Yahoo],
                history: vec![NaverFx, Yahoo],
            },
            domestic_gold: SourceLists {
                live: vec![Krx, NaverDomestic],
                history: vec![Krx, NaverDomestic],
            },
        }
    }
}

impl From<PerQuantity<Vec<SourceId>>> for SourceTable {
    fn from(file: PerQuantity<Vec<SourceId>>) -> Self {
        let mut defaults = SourceTable::default();
        SourceTable {
            gold_usd: file.gold_usd.over(std::mem::take(&mut defaults.gold_usd)),
            silver_usd: file.silver_usd.over(std::mem::take(&mut defaults.silver_usd)),
            usd_krw: file.usd_krw.over(std::mem::take(&mut defaults.usd_krw)),
            domestic_gold: file.domestic_gold.over(std::mem::take(&mut defaults.domestic_gold)),
        }
    }
}

impl SourceTable {
    pub fn get(&self, quantity: Quantity) -> &SourceLists {
        match quantity {
            Quantity::GoldUsd => &self.gold_usd,
            Quantity::SilverUsd => &self.silver_usd,
            Quantity::UsdKrw => &self.usd_krw,
            Quantity::DomesticGold => &self.domestic_gold,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub providers: ProvidersConfig,
    pub network: NetworkConfig,
    pub cache: CacheConfig,
    pub sources: SourceTable,
    pub units: UnitConstants,
}

impl AppConfig {
    /// Loads the config from the default location, or built-in defaults if none exists.
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        if !config_path.exists() {
            debug!(
                "No config at {}, using built-in defaults",
                config_path.display()
            );
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("kr", "donprice", "donprice")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::from_yaml(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    pub fn from_yaml(config_str: &str) -> Result<Self> {
        // An empty document deserializes as null; treat it as "all defaults".
        let config: Self = if config_str.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(config_str)?
        };
        config.validate()?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.timeout_secs == 0 {
            bail!("network.timeout_secs must be greater than zero");
        }
        if !(self.units.grams_per_troy_ounce > 0.0) {
            bail!("units.grams_per_troy_ounce must be positive");
        }
        if !(self.units.grams_per_don > 0.0) {
            bail!("units.grams_per_don must be positive");
        }

        let cache = &self.cache;
        let mut durations = vec![
            ("cache.negative_ttl_secs".to_string(), cache.negative_ttl_secs),
            ("cache.staleness.live_secs".to_string(), cache.staleness.live_secs),
            ("cache.staleness.history_secs".to_string(), cache.staleness.history_secs),
        ];
        for quantity in Quantity::ALL {
            let ttl = cache.ttl.get(quantity);
            durations.push((format!("cache.ttl.{}.live", quantity.as_str()), ttl.live));
            durations.push((format!("cache.ttl.{}.history", quantity.as_str()), ttl.history));
        }
        for (name, secs) in durations {
            if secs > MAX_CACHE_SECS {
                bail!("{name} must be at most {MAX_CACHE_SECS} seconds, got {secs}");
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.negative_ttl_secs)
    }

    pub fn ttl(&self, request: FetchRequest) -> Duration {
        Duration::from_secs(self.cache.ttl.get(request.quantity).get(request.kind))
    }

    pub fn staleness_threshold(&self, kind: FetchKind) -> Duration {
        Duration::from_secs(match kind {
            FetchKind::Live => self.cache.staleness.live_secs,
            FetchKind::History => self.cache.staleness.history_secs,
        })
    }

    pub fn preferred_sources(&self, request: FetchRequest) -> &[SourceId] {
        self.sources.get(request.quantity).get(request.kind)
    }
}
