// Platform-price derivation
// One rule set for both the per-night comparison price and the headline "from" price

use serde::Serialize;

use crate::season::{PricingDocument, Season};

// Nightly price a guest would pay for `season` on a third-party platform.
// In priority order: the average of the season's positive per-platform prices
// (unless the document asks for percentage pricing), the flat platform markup,
// the document's default discount read as an inverse markup, and finally the
// direct price itself.
pub fn platform_price(season: &Season, document: &PricingDocument) -> f64 {
    let use_percentage = document
        .platform_pricing
        .map(|pricing| pricing.use_percentage)
        .unwrap_or(false);

    if !use_percentage {
        if let Some(average) = season
            .platform_prices
            .as_ref()
            .and_then(|prices| positive_average(prices.values().copied()))
        {
            return average;
        }
    }

    if let Some(percentage) = document.platform_markup.and_then(|markup| markup.percentage) {
        return season.price * (1.0 + percentage / 100.0);
    }

    if let Some(pricing) = document.platform_pricing {
        let discount = pricing.default_discount;
        if discount > 0.0 && discount < 100.0 {
            return season.price * (100.0 / (100.0 - discount));
        }
    }

    season.price
}

// Zero or negative entries mean "not listed on that platform"
fn positive_average(prices: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = prices
        .filter(|price| *price > 0.0)
        .fold((0.0, 0usize), |(sum, count), price| (sum + price, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartingPrice {
    pub season_name: String,
    pub direct_price: f64,
    pub platform_price: f64,
}

impl StartingPrice {
    // Saving shown next to the struck-through platform price, in percent
    pub fn saving_percentage(&self) -> f64 {
        if self.platform_price <= 0.0 || self.platform_price <= self.direct_price {
            return 0.0;
        }
        (1.0 - self.direct_price / self.platform_price) * 100.0
    }
}

// Headline price before any dates are picked: the cheapest season
pub fn starting_price(document: &PricingDocument) -> Option<StartingPrice> {
    let cheapest = document
        .seasons
        .iter()
        .min_by(|a, b| a.price.total_cmp(&b.price))?;

    Some(StartingPrice {
        season_name: cheapest.name.clone(),
        direct_price: cheapest.price,
        platform_price: platform_price(cheapest, document),
    })
}
