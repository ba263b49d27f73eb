// Model price resolution: exact name, then canonical name, then regex rows,
// always taking the greatest effective date not after the observation start.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::debug;

use crate::domain::{ModelPrice, Result};
use crate::storage::ConfigStore;

/// Date-style suffixes providers append to model names. Bounded set; a
/// canonical name is the model with one trailing suffix removed.
static DATE_SUFFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"-\d{8}$",             // gpt-4o-20240806
        r"-\d{4}-\d{2}-\d{2}$", // gpt-4o-2024-08-06
        r"@\d{8}$",             // gemini-pro@20240409
        r"-\d{4}$",             // gpt-4-0613
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("static suffix pattern"))
    .collect()
});

/// Strip a recognized date suffix, yielding the canonical model name.
pub fn canonical_model(model: &str) -> String {
    for suffix in DATE_SUFFIXES.iter() {
        if suffix.is_match(model) {
            return suffix.replace(model, "").into_owned();
        }
    }
    model.to_string()
}

pub struct PriceResolver {
    store: ConfigStore,
    cache: Cache<String, ModelPrice>,
}

impl PriceResolver {
    pub fn new(store: ConfigStore) -> Self {
        Self::with_ttl(store, Duration::from_secs(3600))
    }

    pub fn with_ttl(store: ConfigStore, ttl: Duration) -> Self {
        Self {
            store,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Resolve the price row for `(provider, model)` as of `at`. Hits are
    /// cached per start date to bound config-store load from the cost
    /// handlers; misses are re-looked-up so a newly added price row takes
    /// effect without waiting out the TTL.
    pub async fn resolve(
        &self,
        provider: &str,
        model: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ModelPrice>> {
        let cache_key = format!("{provider}|{model}|{}", at.date_naive());
        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(Some(cached));
        }

        let resolved = self.lookup(provider, model, at).await?;
        if let Some(price) = &resolved {
            self.cache.insert(cache_key, price.clone()).await;
        }
        Ok(resolved)
    }

    async fn lookup(
        &self,
        provider: &str,
        model: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ModelPrice>> {
        if let Some(price) = self.store.resolve_price(provider, model, at).await? {
            return Ok(Some(price));
        }

        let canonical = canonical_model(model);
        if canonical != model {
            if let Some(price) = self.store.resolve_price(provider, &canonical, at).await? {
                debug!(model, canonical, "Price resolved via canonical model name");
                return Ok(Some(price));
            }
        }

        // regex rows, newest effective date first
        for price in self.store.regex_prices(provider, at).await? {
            let Some(pattern) = price.model_regex.as_deref() else {
                continue;
            };
            match Regex::new(pattern) {
                Ok(regex) if regex.is_match(model) => {
                    debug!(model, pattern, "Price resolved via regex row");
                    return Ok(Some(price));
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(pattern, error = %e, "Skipping invalid price regex");
                }
            }
        }

        Ok(None)
    }

    /// Drop all cached resolutions; called when pricing rows are edited.
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }
}
