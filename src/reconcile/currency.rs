//! Exchange-rate conversion for multi-currency reconciliation.
//!
//! Rates come from an external provider when one is configured, cached for
//! 24h; provider failures fall back to a static table. Same-currency lookups
//! short-circuit to 1.0 and unknown pairs resolve to 1.0 rather than failing
//! the matcher.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

const CACHE_TTL_HOURS: i64 = 24;

/// Static baseline rates for the default deployment.
fn static_rate(pair: &str) -> Option<f64> {
    match pair {
        "USD_IDR" => Some(15_700.0),
        "EUR_IDR" => Some(17_000.0),
        "SGD_IDR" => Some(11_500.0),
        _ => None,
    }
}

struct CachedRate {
    rate: f64,
    fetched_at: DateTime<Utc>,
}

/// Rate source abstraction; the production deployment points this at an
/// exchange-rate HTTP API via `reqwest`, tests inject fixed tables.
pub trait RateProvider: Send + Sync {
    fn fetch(&self, from: &str, to: &str) -> Option<f64>;
}

/// Provider backed by a blocking `reqwest` client. Any error degrades to the
/// static table.
pub struct HttpRateProvider {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpRateProvider {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client: reqwest::blocking::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl RateProvider for HttpRateProvider {
    fn fetch(&self, from: &str, to: &str) -> Option<f64> {
        let url = format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), from, to);
        let response = self.client.get(&url).send().ok()?;
        let body: serde_json::Value = response.json().ok()?;
        body.get("rate").and_then(|v| v.as_f64())
    }
}

pub struct CurrencyService {
    provider: Option<Box<dyn RateProvider>>,
    cache: RwLock<HashMap<String, CachedRate>>,
}

impl Default for CurrencyService {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CurrencyService {
    pub fn new(provider: Option<Box<dyn RateProvider>>) -> Self {
        Self { provider, cache: RwLock::new(HashMap::new()) }
    }

    /// Current conversion rate from `from` to `to`. Never fails: unknown
    /// pairs resolve to 1.0.
    pub fn rate(&self, from: &str, to: &str) -> f64 {
        if from.eq_ignore_ascii_case(to) {
            return 1.0;
        }
        let pair = format!("{}_{}", from.to_uppercase(), to.to_uppercase());

        if let Some(cached) = self.cache.read().get(&pair) {
            if Utc::now() - cached.fetched_at < Duration::hours(CACHE_TTL_HOURS) {
                return cached.rate;
            }
        }

        if let Some(provider) = &self.provider {
            if let Some(rate) = provider.fetch(from, to) {
                self.cache
                    .write()
                    .insert(pair.clone(), CachedRate { rate, fetched_at: Utc::now() });
                debug!(pair = %pair, rate, "Exchange rate refreshed");
                return rate;
            }
            warn!(pair = %pair, "Rate provider failed; using static table");
        }

        // Static table, then the inverse of a known pair, then parity.
        if let Some(rate) = static_rate(&pair) {
            return rate;
        }
        let inverse_pair = format!("{}_{}", to.to_uppercase(), from.to_uppercase());
        if let Some(rate) = static_rate(&inverse_pair) {
            if rate > 0.0 {
                return 1.0 / rate;
            }
        }
        1.0
    }

    /// Convert an amount between currencies.
    pub fn convert(&self, amount: f64, from: &str, to: &str) -> f64 {
        amount * self.rate(from, to)
    }
}
