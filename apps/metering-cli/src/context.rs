//! Per-invocation context: configuration, catalog and the ledger service

use crate::output::OutputFormat;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use metering_core::MeteringConfig;
use metering_ledger::{LedgerStore, MeteringService, PgLedgerStore, PricingCatalog, QuotaPool};
use std::sync::Arc;

pub struct AppContext {
    pub config: MeteringConfig,
    pub format: OutputFormat,
}

impl AppContext {
    /// Load configuration from `path` (if given) with `METERING__*` overrides
    pub fn load(path: Option<&str>, catalog: Option<String>, format: OutputFormat) -> Result<Self> {
        let mut config = match path {
            Some(path) => MeteringConfig::load_from_file(path)
                .with_context(|| format!("Failed to load configuration from {path}"))?,
            None => MeteringConfig::load().context("Failed to load configuration")?,
        };
        if let Some(catalog) = catalog {
            config.catalog.path = catalog;
        }
        Ok(Self { config, format })
    }

    pub fn catalog(&self) -> Result<PricingCatalog> {
        PricingCatalog::load(&self.config.catalog.path)
            .with_context(|| format!("Failed to load catalog {}", self.config.catalog.path))
    }

    pub async fn store(&self) -> Result<PgLedgerStore> {
        PgLedgerStore::connect(&self.config.database)
            .await
            .context("Failed to connect to the ledger database")
    }

    pub async fn service(&self) -> Result<MeteringService> {
        let catalog = Arc::new(self.catalog()?);
        let store: Arc<dyn LedgerStore> = Arc::new(self.store().await?);
        Ok(MeteringService::new(store, catalog, &self.config.ledger))
    }
}

pub fn parse_pool(pool: &str) -> Result<QuotaPool> {
    pool.parse::<QuotaPool>()
        .with_context(|| format!("Unknown pool '{pool}' (ai_units, retrieval, audio, image)"))
}

/// RFC 3339 timestamp or a `YYYY-MM-DD` date (midnight UTC)
pub fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .with_context(|| format!("Invalid time '{value}', expected RFC 3339 or YYYY-MM-DD"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_time() {
        let midnight = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_time("2026-10-01").unwrap(), midnight);
        assert_eq!(
            parse_time("2026-10-01T09:00:00+09:00").unwrap(),
            midnight
        );
        assert!(parse_time("October").is_err());
    }

    #[test]
    fn test_parse_pool() {
        assert_eq!(parse_pool("image").unwrap(), QuotaPool::Image);
        assert!(parse_pool("video").is_err());
    }
}
