pub mod krx;
pub mod naver;
pub mod util;
pub mod yahoo_finance;

use crate::core::clock::Clock;
use crate::core::config::AppConfig;
use crate::core::quote::{FetchRequest, SourceId};
use crate::core::source::SourceClient;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// The adapters available to the resolver, keyed by id.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<SourceId, Arc<dyn SourceClient>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every adapter the config can support. KRX needs a service key and is
    /// left out without one.
    pub fn from_config(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let timeout = config.timeout();
        let user_agent = config.network.user_agent.as_str();
        let providers = &config.providers;
        let mut registry = Self::new();

        registry.register(Arc::new(yahoo_finance::YahooChartSource::new(
            &providers.yahoo.base_url,
            user_agent,
            timeout,
            Arc::clone(&clock),
        )));
        registry.register(Arc::new(naver::NaverDailyQuoteSource::world(
            &providers.naver.base_url,
            &providers.naver.gold_code,
            &providers.naver.silver_code,
            user_agent,
            timeout,
        )));
        registry.register(Arc::new(naver::NaverDailyQuoteSource::domestic(
            &providers.naver.base_url,
            user_agent,
            timeout,
        )));
        registry.register(Arc::new(naver::NaverFxSource::new(
            &providers.naver.fx_base_url,
            user_agent,
            timeout,
            clock,
        )));

        match providers.krx.service_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => registry.register(Arc::new(krx::KrxGoldSource::new(
                &providers.krx.base_url,
                key,
                &providers.krx.item_name,
                providers.krx.rows,
                user_agent,
                timeout,
            ))),
            None => debug!("No KRX service key configured; krx source disabled"),
        }

        registry
    }

    pub fn register(&mut self, source: Arc<dyn SourceClient>) {
        self.sources.insert(source.id(), source);
    }

    pub fn get(&self, id: SourceId) -> Option<&Arc<dyn SourceClient>> {
        self.sources.get(&id)
    }

    /// The preference list for a request, in order, minus sources that are not
    /// registered or cannot serve it.
    pub fn sources_for(&self, request: FetchRequest, ids: &[SourceId]) -> Vec<Arc<dyn SourceClient>> {
        ids.iter()
            .filter_map(|id| match self.sources.get(id) {
                Some(source) if source.supports(&request) => Some(Arc::clone(source)),
                Some(_) => {
                    debug!("Source {} cannot serve {}; skipping", id, request);
                    None
                }
                None => {
                    debug!("Source {} is not registered; skipping for {}", id, request);
                    None
                }
            })
            .collect()
    }
}
