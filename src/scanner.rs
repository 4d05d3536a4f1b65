// Forward scan for the next blocked date
// Caps an in-progress date selection; the scan is bounded because feeds can be sparse or open-ended

use chrono::{Days, NaiveDate};

use crate::availability::UnavailableDateSet;

pub const DEFAULT_SCAN_HORIZON_DAYS: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardScanner {
    horizon_days: u32,
}

impl Default for ForwardScanner {
    fn default() -> Self {
        Self {
            horizon_days: DEFAULT_SCAN_HORIZON_DAYS,
        }
    }
}

impl ForwardScanner {
    pub fn new(horizon_days: u32) -> Self {
        Self { horizon_days }
    }

    pub fn horizon_days(&self) -> u32 {
        self.horizon_days
    }

    // Earliest blocked date in `from + 1 ..= from + horizon_days`.
    pub fn find_next_unavailable(
        &self,
        unavailable: &UnavailableDateSet,
        from: NaiveDate,
    ) -> Option<NaiveDate> {
        (1..=u64::from(self.horizon_days))
            .map_while(|offset| from.checked_add_days(Days::new(offset)))
            .find(|date| unavailable.contains(*date))
    }

    // Guests may leave on the morning of the next blocked day
    pub fn max_checkout(
        &self,
        unavailable: &UnavailableDateSet,
        start: NaiveDate,
    ) -> Option<NaiveDate> {
        if unavailable.contains(start) {
            return None;
        }
        self.find_next_unavailable(unavailable, start)
    }
}
