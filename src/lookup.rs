// Server-side property lookups
// Listing filters change quickly and use the short TTL; price batches use the price TTL

use std::sync::Arc;

use chrono::NaiveDate;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheKey, TtlCache};
use crate::config::{EngineConfig, TtlClass};
use crate::http::HttpClient;
use crate::stay::GuestCounts;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("Lookup request failed: {0}")]
    Http(String),

    #[error("Unexpected lookup response: {0}")]
    Decode(String),

    #[error("Invalid lookup url: {0}")]
    Url(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingQuery {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub guests: GuestCounts,
}

impl CacheKey for ListingQuery {
    fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.start, self.end, self.guests.adults, self.guests.children, self.guests.infants
        )
    }
}

// Property ids are kept sorted and unique so equivalent batches share a cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceBatchQuery {
    property_ids: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub guests: GuestCounts,
}

impl PriceBatchQuery {
    pub fn new<I, S>(property_ids: I, start: NaiveDate, end: NaiveDate, guests: GuestCounts) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut property_ids: Vec<String> = property_ids.into_iter().map(Into::into).collect();
        property_ids.sort();
        property_ids.dedup();
        Self {
            property_ids,
            start,
            end,
            guests,
        }
    }

    pub fn property_ids(&self) -> &[String] {
        &self.property_ids
    }
}

impl CacheKey for PriceBatchQuery {
    fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.start,
            self.end,
            self.guests.adults,
            self.guests.children,
            self.guests.infants,
            self.property_ids.join(",")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyQuote {
    pub property_id: String,
    #[serde(default)]
    pub total_price: Option<f64>,
    #[serde(default)]
    pub platform_price: Option<f64>,
    #[serde(default)]
    pub min_nights: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    available: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PriceBatchResponse {
    quotes: Vec<PropertyQuote>,
}

pub struct PropertyLookup {
    http: Arc<dyn HttpClient>,
    base_url: String,
    listings: TtlCache<ListingQuery, Vec<String>, LookupError>,
    prices: TtlCache<PriceBatchQuery, Vec<PropertyQuote>, LookupError>,
}

impl PropertyLookup {
    pub fn new(http: Arc<dyn HttpClient>, config: &EngineConfig) -> Self {
        Self::with_caches(
            http,
            config.lookup.base_url.clone(),
            TtlCache::new("listing", config.cache.ttl_for(TtlClass::Listing)),
            TtlCache::new("prices", config.cache.ttl_for(TtlClass::Price)),
        )
    }

    pub fn with_caches(
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        listings: TtlCache<ListingQuery, Vec<String>, LookupError>,
        prices: TtlCache<PriceBatchQuery, Vec<PropertyQuote>, LookupError>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            listings,
            prices,
        }
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<String, LookupError> {
        let base = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        Url::parse_with_params(&base, params)
            .map(String::from)
            .map_err(|e| LookupError::Url(e.to_string()))
    }

    fn guest_params(start: NaiveDate, end: NaiveDate, guests: GuestCounts) -> Vec<(&'static str, String)> {
        vec![
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("adults", guests.adults.to_string()),
            ("children", guests.children.to_string()),
            ("infants", guests.infants.to_string()),
        ]
    }

    pub(crate) fn listing_url(&self, query: &ListingQuery) -> Result<String, LookupError> {
        self.endpoint(
            "availability",
            &Self::guest_params(query.start, query.end, query.guests),
        )
    }

    pub(crate) fn prices_url(&self, query: &PriceBatchQuery) -> Result<String, LookupError> {
        let mut params = vec![("ids", query.property_ids.join(","))];
        params.extend(Self::guest_params(query.start, query.end, query.guests));
        self.endpoint("prices", &params)
    }

    // Ids of the properties free for the whole query range
    pub async fn available_properties(
        &self,
        query: &ListingQuery,
    ) -> Result<Vec<String>, LookupError> {
        let url = self.listing_url(query)?;
        let http = Arc::clone(&self.http);
        self.listings
            .get_or_fetch(query, move || async move {
                let response: ListingResponse = fetch_json(http.as_ref(), &url).await?;
                Ok(response.available)
            })
            .await
    }

    pub async fn batch_prices(
        &self,
        query: &PriceBatchQuery,
    ) -> Result<Vec<PropertyQuote>, LookupError> {
        if query.property_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.prices_url(query)?;
        let http = Arc::clone(&self.http);
        self.prices
            .get_or_fetch(query, move || async move {
                let response: PriceBatchResponse = fetch_json(http.as_ref(), &url).await?;
                Ok(response.quotes)
            })
            .await
    }
}

async fn fetch_json<T: DeserializeOwned>(http: &dyn HttpClient, url: &str) -> Result<T, LookupError> {
    let body = http
        .get_text(url)
        .await
        .map_err(|e| LookupError::Http(e.to_string()))?;
    debug!(url, bytes = body.len(), "lookup response received");
    serde_json::from_str(&body).map_err(|e| LookupError::Decode(e.to_string()))
}
