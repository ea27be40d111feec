use std::sync::Mutex;
use std::time::{Duration, Instant};

use meter_core::PriceTable;
use tracing::warn;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

struct CachedTable {
    table: PriceTable,
    fetched_at: Instant,
}

/// TTL-cached price table. Remote fetches are best-effort: on miss or
/// failure the last good table applies, and before any fetch succeeds the
/// built-in substring-keyed defaults do.
pub struct PricingOracle {
    client: reqwest::Client,
    url: Option<String>,
    ttl: Duration,
    cache: Mutex<Option<CachedTable>>,
}

impl PricingOracle {
    pub fn new(url: Option<String>, ttl: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Current table for a pass. Never fails; the fallback chain is
    /// fresh-cache, remote, stale-cache, built-in defaults.
    pub async fn table(&self) -> PriceTable {
        if let Some(table) = self.cached(false) {
            return table;
        }
        let Some(url) = self.url.clone() else {
            return self.fallback();
        };
        match self.fetch(&url).await {
            Ok(table) => {
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                *cache = Some(CachedTable {
                    table: table.clone(),
                    fetched_at: Instant::now(),
                });
                table
            }
            Err(err) => {
                warn!(url = url.as_str(), %err, "price table fetch failed, using fallback");
                self.fallback()
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<PriceTable, reqwest::Error> {
        let table: PriceTable = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(table)
    }

    fn cached(&self, allow_stale: bool) -> Option<PriceTable> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.as_ref().and_then(|entry| {
            if allow_stale || entry.fetched_at.elapsed() < self.ttl {
                Some(entry.table.clone())
            } else {
                None
            }
        })
    }

    fn fallback(&self) -> PriceTable {
        self.cached(true).unwrap_or_else(PriceTable::builtin)
    }
}
