// Pricing document model and season resolution
// A season is active on day/month periods that repeat every year and may wrap over New Year

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::stay::PricingError;

pub const DEFAULT_PLATFORM_DISCOUNT: f64 = 17.0;

const DAYS_IN_MONTH: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

// Year-independent calendar position, written `DD-MM` in pricing documents.
// Ordering compares the month first, then the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayMonth {
    month: u32,
    day: u32,
}

impl DayMonth {
    pub fn new(day: u32, month: u32) -> Option<Self> {
        if !(1..=12).contains(&month) {
            return None;
        }
        if day == 0 || day > DAYS_IN_MONTH[(month - 1) as usize] {
            return None;
        }
        Some(Self { month, day })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            day: date.day(),
        }
    }

    pub fn day(&self) -> u32 {
        self.day
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl FromStr for DayMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (day, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected DD-MM, got {:?}", s))?;
        let day: u32 = day
            .parse()
            .map_err(|_| format!("invalid day in {:?}", s))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in {:?}", s))?;
        DayMonth::new(day, month).ok_or_else(|| format!("no such day/month {:?}", s))
    }
}

impl TryFrom<String> for DayMonth {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DayMonth> for String {
    fn from(value: DayMonth) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DayMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}-{:02}", self.day, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DayMonth,
    pub end: DayMonth,
}

impl Period {
    pub fn new(start: DayMonth, end: DayMonth) -> Self {
        Self { start, end }
    }

    // 01-12 → 28-02 runs from December into the next year
    pub fn wraps_year(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        let position = DayMonth::of(date);
        if self.wraps_year() {
            position >= self.start || position <= self.end
        } else {
            self.start <= position && position <= self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Season {
    pub name: String,
    #[serde(default)]
    pub periods: Vec<Period>,
    pub price: f64,
    #[serde(default)]
    pub min_nights: Option<u32>,
    #[serde(default)]
    pub platform_prices: Option<BTreeMap<String, f64>>,
}

impl Season {
    pub fn min_nights(&self) -> u32 {
        self.min_nights.unwrap_or(1).max(1)
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        self.periods.iter().any(|period| period.contains(date))
    }
}

// Length-of-stay discount tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discount {
    pub min_nights: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cleaning {
    pub price: f64,
    #[serde(default)]
    pub included: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformPricing {
    #[serde(default)]
    pub use_percentage: bool,
    #[serde(default = "default_platform_discount")]
    pub default_discount: f64,
}

impl Default for PlatformPricing {
    fn default() -> Self {
        Self {
            use_percentage: false,
            default_discount: DEFAULT_PLATFORM_DISCOUNT,
        }
    }
}

fn default_platform_discount() -> f64 {
    DEFAULT_PLATFORM_DISCOUNT
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlatformMarkup {
    #[serde(default)]
    pub percentage: Option<f64>,
}

// Per-property pricing configuration. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingDocument {
    #[serde(default)]
    pub seasons: Vec<Season>,
    #[serde(default)]
    pub discounts: Vec<Discount>,
    #[serde(default)]
    pub cleaning: Option<Cleaning>,
    #[serde(default)]
    pub platform_pricing: Option<PlatformPricing>,
    #[serde(default)]
    pub platform_markup: Option<PlatformMarkup>,
    #[serde(default)]
    pub capacity: u32,
}

impl PricingDocument {
    // An unreadable or season-less document means there is nothing to price with
    pub fn from_json(json: &str) -> Result<Self, PricingError> {
        let document: PricingDocument = serde_json::from_str(json).map_err(|err| {
            warn!(error = %err, "pricing document could not be parsed");
            PricingError::NoPricingData
        })?;
        if document.seasons.is_empty() {
            return Err(PricingError::NoPricingData);
        }
        Ok(document)
    }

    pub fn has_pricing(&self) -> bool {
        !self.seasons.is_empty()
    }

    // Season applying to `date`: the first season (in document order) with a
    // period covering it, otherwise the first season of the document.
    // `None` only when the document has no seasons.
    pub fn resolve_season(&self, date: NaiveDate) -> Option<&Season> {
        self.matching_season(date).or_else(|| self.seasons.first())
    }

    // Strict variant without the first-season fallback
    pub fn matching_season(&self, date: NaiveDate) -> Option<&Season> {
        self.seasons.iter().find(|season| season.covers(date))
    }
}
