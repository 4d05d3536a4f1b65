// Engine configuration
// Every section has defaults so a partial JSON document is enough to override one value

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// Volatility classes for cached data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    Listing,
    Price,
    Calendar,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub listing_ttl_seconds: u64,
    pub price_ttl_seconds: u64,
    pub calendar_ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            listing_ttl_seconds: 30,
            price_ttl_seconds: 300,
            calendar_ttl_hours: 6,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Listing => Duration::from_secs(self.listing_ttl_seconds),
            TtlClass::Price => Duration::from_secs(self.price_ttl_seconds),
            TtlClass::Calendar => Duration::from_secs(self.calendar_ttl_hours * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TaxConfig {
    // Flat amount per adult per night, guest houses
    pub per_adult_night: f64,
    // Share of the discounted accommodation cost, other property types
    pub accommodation_rate: f64,
}

impl Default for TaxConfig {
    fn default() -> Self {
        Self {
            per_adult_night: 0.75,
            accommodation_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            user_agent: concat!("rental-pricing-engine/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    pub base_url: String,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub tax: TaxConfig,
    pub http: HttpConfig,
    pub lookup: LookupConfig,
    pub scan_horizon_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            tax: TaxConfig::default(),
            http: HttpConfig::default(),
            lookup: LookupConfig::default(),
            scan_horizon_days: 90,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_horizon_days == 0 {
            return Err(ConfigError::Invalid(
                "scan_horizon_days must be at least 1".to_string(),
            ));
        }
        if self.tax.per_adult_night < 0.0 || self.tax.accommodation_rate < 0.0 {
            return Err(ConfigError::Invalid("tax rates must not be negative".to_string()));
        }
        if self.http.timeout_ms == 0 {
            return Err(ConfigError::Invalid("http timeout must be positive".to_string()));
        }
        Ok(())
    }
}
