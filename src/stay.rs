// Stay price calculation
// Turns a date range, guest counts and a pricing document into a full price breakdown

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::TaxConfig;
use crate::platform::platform_price;
use crate::season::{Discount, PricingDocument};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PricingError {
    #[error("No pricing data available")]
    NoPricingData,

    #[error("Minimum stay is {required} nights, {requested} requested")]
    MinStayViolation { required: u32, requested: u32 },

    #[error("Invalid date range: {start} to {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("{guests} guests exceed the capacity of {capacity}")]
    CapacityExceeded { guests: u32, capacity: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuestCounts {
    pub adults: u32,
    pub children: u32,
    pub infants: u32,
}

impl GuestCounts {
    pub fn new(adults: u32, children: u32, infants: u32) -> Self {
        Self {
            adults,
            children,
            infants,
        }
    }

    pub fn adults(adults: u32) -> Self {
        Self::new(adults, 0, 0)
    }

    // Infants do not take a bed
    pub fn occupants(&self) -> u32 {
        self.adults + self.children
    }
}

// Selects the tourist tax regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    GuestHouse,
    #[default]
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StayRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub guests: GuestCounts,
    pub kind: PropertyKind,
}

impl StayRequest {
    pub fn new(start: NaiveDate, end: NaiveDate, guests: GuestCounts) -> Self {
        Self {
            start,
            end,
            guests,
            kind: PropertyKind::default(),
        }
    }

    pub fn with_kind(mut self, kind: PropertyKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn nights(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_days()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", content = "amount", rename_all = "snake_case")]
pub enum CleaningFee {
    None,
    Included,
    Charged(f64),
}

impl CleaningFee {
    pub fn amount(&self) -> f64 {
        match self {
            CleaningFee::Charged(amount) => *amount,
            CleaningFee::None | CleaningFee::Included => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NightPrice {
    pub date: NaiveDate,
    pub season_name: String,
    pub direct_price: f64,
    pub platform_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StayBreakdown {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub nights: u32,
    pub nights_price: f64,
    pub platform_nights_price: f64,
    pub discount: Option<Discount>,
    pub discount_amount: f64,
    pub platform_discount_amount: f64,
    pub cleaning: CleaningFee,
    pub tourist_tax: f64,
    pub total_price: f64,
    pub platform_price: f64,
}

impl StayBreakdown {
    pub fn discount_percentage(&self) -> f64 {
        self.discount.map(|tier| tier.percentage).unwrap_or(0.0)
    }

    pub fn average_nightly_price(&self) -> f64 {
        if self.nights == 0 {
            return 0.0;
        }
        self.nights_price / self.nights as f64
    }

    // Per-night rows, derived again from the document on demand
    pub fn nights_breakdown<'a>(
        &self,
        document: &'a PricingDocument,
    ) -> impl Iterator<Item = NightPrice> + 'a {
        night_prices(document, self.start, self.end)
    }
}

// Nights in [start, end); dates without a season are skipped
pub fn night_prices(
    document: &PricingDocument,
    start: NaiveDate,
    end: NaiveDate,
) -> impl Iterator<Item = NightPrice> + '_ {
    start
        .iter_days()
        .take_while(move |date| *date < end)
        .filter_map(move |date| {
            document.resolve_season(date).map(|season| NightPrice {
                date,
                season_name: season.name.clone(),
                direct_price: season.price,
                platform_price: platform_price(season, document),
            })
        })
}

// Length-of-stay tier for a stay of `nights`: the qualifying tier with the
// largest `min_nights`. Tiers never stack. Among tiers with equal
// `min_nights` the first defined wins.
pub fn select_discount(discounts: &[Discount], nights: u32) -> Option<&Discount> {
    let mut tiers: Vec<&Discount> = discounts.iter().collect();
    tiers.sort_by(|a, b| b.min_nights.cmp(&a.min_nights));
    tiers.into_iter().find(|tier| tier.min_nights <= nights)
}

// Half-up to cents
pub fn round_currency(value: f64) -> f64 {
    let cents = value * 100.0;
    (cents + 1e-7_f64.copysign(cents)).round() / 100.0
}

// Children are not counted in either regime
pub fn tourist_tax(
    config: &TaxConfig,
    kind: PropertyKind,
    guests: GuestCounts,
    nights: u32,
    discounted_accommodation: f64,
) -> f64 {
    let adults = guests.adults as f64;
    let tax = match kind {
        PropertyKind::GuestHouse => config.per_adult_night * adults * nights as f64,
        PropertyKind::Standard => config.accommodation_rate * discounted_accommodation * adults,
    };
    round_currency(tax)
}

// Minimum stay when arriving on `start`, taken from the first night's season
pub fn minimum_stay(document: &PricingDocument, start: NaiveDate) -> Option<u32> {
    document.resolve_season(start).map(|season| season.min_nights())
}

#[derive(Debug, Clone, Default)]
pub struct StayCalculator {
    tax: TaxConfig,
}

impl StayCalculator {
    pub fn new(tax: TaxConfig) -> Self {
        Self { tax }
    }

    pub fn compute(
        &self,
        document: &PricingDocument,
        request: &StayRequest,
    ) -> Result<StayBreakdown, PricingError> {
        let nights = request.nights();
        if nights <= 0 {
            return Err(PricingError::InvalidRange {
                start: request.start,
                end: request.end,
            });
        }
        let nights = u32::try_from(nights).map_err(|_| PricingError::InvalidRange {
            start: request.start,
            end: request.end,
        })?;

        let required = minimum_stay(document, request.start).ok_or(PricingError::NoPricingData)?;
        if nights < required {
            return Err(PricingError::MinStayViolation {
                required,
                requested: nights,
            });
        }

        let occupants = request.guests.occupants();
        if document.capacity > 0 && occupants > document.capacity {
            return Err(PricingError::CapacityExceeded {
                guests: occupants,
                capacity: document.capacity,
            });
        }

        let (nights_price, platform_nights_price) =
            night_prices(document, request.start, request.end).fold(
                (0.0, 0.0),
                |(direct, platform), night| {
                    (direct + night.direct_price, platform + night.platform_price)
                },
            );

        let discount = select_discount(&document.discounts, nights).copied();
        let percentage = discount.map(|tier| tier.percentage).unwrap_or(0.0);
        let discount_amount = nights_price * percentage / 100.0;
        let platform_discount_amount = platform_nights_price * percentage / 100.0;

        let cleaning = match document.cleaning {
            Some(cleaning) if cleaning.included => CleaningFee::Included,
            Some(cleaning) => CleaningFee::Charged(cleaning.price),
            None => CleaningFee::None,
        };

        let tax = tourist_tax(
            &self.tax,
            request.kind,
            request.guests,
            nights,
            nights_price - discount_amount,
        );

        let total_price = nights_price - discount_amount + cleaning.amount() + tax;
        let platform_price =
            platform_nights_price - platform_discount_amount + cleaning.amount() + tax;

        debug!(
            start = %request.start,
            end = %request.end,
            nights,
            total_price,
            "stay priced"
        );

        Ok(StayBreakdown {
            start: request.start,
            end: request.end,
            nights,
            nights_price,
            platform_nights_price,
            discount,
            discount_amount,
            platform_discount_amount,
            cleaning,
            tourist_tax: tax,
            total_price,
            platform_price,
        })
    }
}
