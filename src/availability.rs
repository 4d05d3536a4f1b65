// Availability ingestion
// Fetches iCalendar feeds, expands busy intervals into days and merges them per property

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStatsReport, TtlCache};
use crate::config::{EngineConfig, TtlClass};
use crate::http::HttpClient;
use crate::scanner::ForwardScanner;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Invalid horizon: {start} to {end}")]
    InvalidHorizon { start: NaiveDate, end: NaiveDate },
}

// All-day busy interval; `end` is exclusive, as in iCalendar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyInterval {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BusyInterval {
    // Blocked days clipped to [from, to]
    pub fn days_within(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
        let first = self.start.max(from);
        let end = self.end;
        first
            .iter_days()
            .take_while(move |date| *date < end && *date <= to)
    }
}

#[derive(Debug, Clone, Copy)]
struct FeedDate {
    date: NaiveDate,
    // a DTEND like 20250605T100000 still blocks the 5th
    past_midnight: bool,
}

fn parse_feed_date(value: &str) -> Option<FeedDate> {
    let value = value.trim();
    let date = NaiveDate::parse_from_str(value.get(0..8)?, "%Y%m%d").ok()?;
    let past_midnight = match value.get(8..9) {
        Some("T") => value
            .get(9..15)
            .map(|time| time != "000000")
            .unwrap_or(false),
        _ => false,
    };
    Some(FeedDate {
        date,
        past_midnight,
    })
}

#[derive(Debug, Default)]
struct PendingEvent {
    start: Option<FeedDate>,
    end: Option<FeedDate>,
}

impl PendingEvent {
    fn into_interval(self) -> Option<BusyInterval> {
        let start = self.start?.date;
        let one_day = start.checked_add_days(Days::new(1))?;
        let end = match self.end {
            Some(end) if end.past_midnight => end.date.checked_add_days(Days::new(1))?,
            Some(end) => end.date,
            None => one_day,
        };
        Some(BusyInterval {
            start,
            end: if end <= start { one_day } else { end },
        })
    }
}

// RFC 5545 continuation lines start with a space or a tab
fn unfold(body: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in body.lines() {
        if let Some(continuation) = raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')) {
            if let Some(last) = lines.last_mut() {
                last.push_str(continuation);
                continue;
            }
        }
        lines.push(raw.to_string());
    }
    lines
}

// Busy intervals of every VEVENT in an iCalendar body.
// Events without a readable DTSTART are skipped. A missing DTEND, or one not
// after DTSTART, blocks the start day only.
pub fn parse_busy_intervals(body: &str) -> Result<Vec<BusyInterval>, FeedError> {
    let lines = unfold(body.trim_start_matches('\u{feff}'));
    if !lines
        .iter()
        .any(|line| line.trim().eq_ignore_ascii_case("BEGIN:VCALENDAR"))
    {
        return Err(FeedError::Parse("missing BEGIN:VCALENDAR".to_string()));
    }

    let mut intervals = Vec::new();
    let mut event: Option<PendingEvent> = None;

    for line in &lines {
        let Some((name, value)) = line.trim_end().split_once(':') else {
            continue;
        };
        // DTSTART;VALUE=DATE:20250601
        let property = name.split(';').next().unwrap_or(name).to_ascii_uppercase();
        let value = value.trim();

        match property.as_str() {
            "BEGIN" if value.eq_ignore_ascii_case("VEVENT") => {
                event = Some(PendingEvent::default());
            }
            "END" if value.eq_ignore_ascii_case("VEVENT") => {
                if let Some(pending) = event.take() {
                    match pending.into_interval() {
                        Some(interval) => intervals.push(interval),
                        None => debug!("skipping event without a usable DTSTART"),
                    }
                }
            }
            "DTSTART" => {
                if let Some(pending) = event.as_mut() {
                    pending.start = parse_feed_date(value);
                }
            }
            "DTEND" => {
                if let Some(pending) = event.as_mut() {
                    pending.end = parse_feed_date(value);
                }
            }
            _ => {}
        }
    }

    Ok(intervals)
}

// Individual days of `intervals` inside [horizon_start, horizon_end], sorted
pub fn expand_within(
    intervals: &[BusyInterval],
    horizon_start: NaiveDate,
    horizon_end: NaiveDate,
) -> Vec<NaiveDate> {
    intervals
        .iter()
        .flat_map(|interval| interval.days_within(horizon_start, horizon_end))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// Blocked calendar days of one property, merged over all its feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnavailableDateSet {
    dates: BTreeSet<NaiveDate>,
}

impl UnavailableDateSet {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.dates.iter().copied()
    }

    // No blocked night in [start, end); the checkout day may be blocked
    pub fn is_range_available(&self, start: NaiveDate, end: NaiveDate) -> bool {
        if end <= start {
            return false;
        }
        self.dates.range(start..end).next().is_none()
    }
}

impl FromIterator<NaiveDate> for UnavailableDateSet {
    fn from_iter<T: IntoIterator<Item = NaiveDate>>(iter: T) -> Self {
        Self {
            dates: iter.into_iter().collect(),
        }
    }
}

impl Extend<NaiveDate> for UnavailableDateSet {
    fn extend<T: IntoIterator<Item = NaiveDate>>(&mut self, iter: T) {
        self.dates.extend(iter);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub feed_url: String,
    pub horizon_start: NaiveDate,
    pub horizon_end: NaiveDate,
}

impl CacheKey for FeedKey {
    fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.horizon_start, self.horizon_end, self.feed_url
        )
    }
}

pub type FeedCache = TtlCache<FeedKey, Vec<NaiveDate>, FeedError>;

// Loads and merges the calendar feeds of a property.
// Feeds fail independently: a failing feed contributes no dates and is kept
// as AvailabilityService::last_error while the others are still merged.
pub struct AvailabilityService {
    http: Arc<dyn HttpClient>,
    cache: FeedCache,
    scanner: ForwardScanner,
    last_error: Mutex<Option<FeedError>>,
    current: RwLock<Arc<UnavailableDateSet>>,
}

impl AvailabilityService {
    pub fn new(http: Arc<dyn HttpClient>, config: &EngineConfig) -> Self {
        let cache = TtlCache::new("ical", config.cache.ttl_for(TtlClass::Calendar));
        Self::with_cache(http, cache, ForwardScanner::new(config.scan_horizon_days))
    }

    pub fn with_cache(http: Arc<dyn HttpClient>, cache: FeedCache, scanner: ForwardScanner) -> Self {
        Self {
            http,
            cache,
            scanner,
            last_error: Mutex::new(None),
            current: RwLock::new(Arc::new(UnavailableDateSet::default())),
        }
    }

    pub async fn load_unavailable_dates(
        &self,
        feed_urls: &[String],
        horizon_start: NaiveDate,
        horizon_end: NaiveDate,
    ) -> Result<Arc<UnavailableDateSet>, FeedError> {
        if horizon_end < horizon_start {
            return Err(FeedError::InvalidHorizon {
                start: horizon_start,
                end: horizon_end,
            });
        }

        *self.last_error.lock() = None;

        let results = join_all(
            feed_urls
                .iter()
                .map(|url| self.load_feed(url, horizon_start, horizon_end)),
        )
        .await;

        let mut merged = UnavailableDateSet::default();
        let mut failed = 0usize;
        for (url, result) in feed_urls.iter().zip(results) {
            match result {
                Ok(days) => merged.extend(days),
                Err(err) => {
                    warn!(feed = %url, error = %err, "calendar feed skipped");
                    failed += 1;
                    *self.last_error.lock() = Some(err);
                }
            }
        }

        let merged = Arc::new(merged);
        info!(
            feeds = feed_urls.len(),
            failed,
            unavailable = merged.len(),
            "availability refreshed"
        );
        *self.current.write() = Arc::clone(&merged);
        Ok(merged)
    }

    async fn load_feed(
        &self,
        url: &str,
        horizon_start: NaiveDate,
        horizon_end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, FeedError> {
        let key = FeedKey {
            feed_url: url.to_string(),
            horizon_start,
            horizon_end,
        };
        let http = Arc::clone(&self.http);
        let url = url.to_string();

        self.cache
            .get_or_fetch(&key, move || async move {
                let body = http
                    .get_text(&url)
                    .await
                    .map_err(|err| FeedError::Fetch {
                        url: url.clone(),
                        message: err.to_string(),
                    })?;
                let intervals = parse_busy_intervals(&body)?;
                debug!(feed = %url, events = intervals.len(), "calendar feed parsed");
                Ok(expand_within(&intervals, horizon_start, horizon_end))
            })
            .await
    }

    // Set published by the latest ingestion cycle
    pub fn current(&self) -> Arc<UnavailableDateSet> {
        Arc::clone(&self.current.read())
    }

    pub fn is_unavailable(&self, date: NaiveDate) -> bool {
        self.current.read().contains(date)
    }

    pub fn find_next_unavailable(&self, from: NaiveDate, horizon_days: u32) -> Option<NaiveDate> {
        ForwardScanner::new(horizon_days).find_next_unavailable(&self.current(), from)
    }

    pub fn max_checkout(&self, start: NaiveDate) -> Option<NaiveDate> {
        self.scanner.max_checkout(&self.current(), start)
    }

    pub fn last_error(&self) -> Option<FeedError> {
        self.last_error.lock().clone()
    }

    pub fn cache_stats(&self) -> CacheStatsReport {
        self.cache.stats()
    }

    pub fn sweep_cache(&self) -> usize {
        self.cache.sweep_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::clock::ManualClock;
    use crate::http::mock_http::MockHttpClient;
    use crate::season::tests::date;
    use std::time::Duration;

    const AIRBNB: &str = "https://airbnb.test/calendar.ics";
    const BOOKING: &str = "https://booking.test/calendar.ics";

    fn feed(events: &[(&str, Option<&str>)]) -> String {
        let mut body = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//test//EN\r\n");
        for (start, end) in events {
            body.push_str("BEGIN:VEVENT\r\n");
            body.push_str(&format!("DTSTART;VALUE=DATE:{start}\r\n"));
            if let Some(end) = end {
                body.push_str(&format!("DTEND;VALUE=DATE:{end}\r\n"));
            }
            body.push_str("SUMMARY:Reserved\r\nEND:VEVENT\r\n");
        }
        body.push_str("END:VCALENDAR\r\n");
        body
    }

    fn urls(feeds: &[&str]) -> Vec<String> {
        feeds.iter().map(|url| url.to_string()).collect()
    }

    fn service_with(mock: Arc<MockHttpClient>) -> (AvailabilityService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let cache = TtlCache::with_backend(
            "ical",
            Duration::from_secs(6 * 3600),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        );
        (
            AvailabilityService::with_cache(mock, cache, ForwardScanner::default()),
            clock,
        )
    }

    #[test]
    fn test_exclusive_end_expands_to_four_days() {
        let intervals = parse_busy_intervals(&feed(&[("20250601", Some("20250605"))])).unwrap();
        let days = expand_within(&intervals, date(2025, 5, 1), date(2025, 7, 1));
        assert_eq!(
            days,
            vec![
                date(2025, 6, 1),
                date(2025, 6, 2),
                date(2025, 6, 3),
                date(2025, 6, 4)
            ]
        );
    }

    #[test]
    fn test_days_outside_horizon_are_dropped() {
        let intervals = parse_busy_intervals(&feed(&[("20250628", Some("20250704"))])).unwrap();
        let days = expand_within(&intervals, date(2025, 6, 30), date(2025, 7, 2));
        assert_eq!(
            days,
            vec![date(2025, 6, 30), date(2025, 7, 1), date(2025, 7, 2)]
        );
    }

    #[test]
    fn test_event_variants() {
        let body = "BEGIN:VCALENDAR\n\
                    BEGIN:VEVENT\nDTSTART:20250710\nEND:VEVENT\n\
                    BEGIN:VEVENT\nDTSTART:20250801T150000Z\nDTEND:20250803T100000Z\nEND:VEVENT\n\
                    BEGIN:VEVENT\nDTSTART:20250901\nDTEND:20250901\nEND:VEVENT\n\
                    BEGIN:VEVENT\nDTSTART:garbage\nDTEND:20250905\nEND:VEVENT\n\
                    END:VCALENDAR\n";
        let intervals = parse_busy_intervals(body).unwrap();
        assert_eq!(
            intervals,
            vec![
                BusyInterval {
                    start: date(2025, 7, 10),
                    end: date(2025, 7, 11)
                },
                BusyInterval {
                    start: date(2025, 8, 1),
                    end: date(2025, 8, 4)
                },
                BusyInterval {
                    start: date(2025, 9, 1),
                    end: date(2025, 9, 2)
                },
            ]
        );
    }

    #[test]
    fn test_folded_lines_are_unfolded() {
        let body = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nDTSTART;VALUE=\r\n DATE:20250601\r\nDTEND;VALUE=DATE:2025\r\n 0603\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let intervals = parse_busy_intervals(body).unwrap();
        assert_eq!(
            intervals,
            vec![BusyInterval {
                start: date(2025, 6, 1),
                end: date(2025, 6, 3)
            }]
        );
    }

    #[test]
    fn test_byte_order_mark_is_ignored() {
        let body = format!("\u{feff}{}", feed(&[("20250601", Some("20250603"))]));
        let intervals = parse_busy_intervals(&body).unwrap();
        assert_eq!(
            intervals,
            vec![BusyInterval {
                start: date(2025, 6, 1),
                end: date(2025, 6, 3)
            }]
        );
    }

    #[test]
    fn test_not_a_calendar() {
        assert!(matches!(
            parse_busy_intervals("<html>maintenance</html>"),
            Err(FeedError::Parse(_))
        ));
    }

    #[test]
    fn test_range_availability() {
        let set: UnavailableDateSet = [date(2025, 6, 10)].into_iter().collect();
        assert!(set.is_range_available(date(2025, 6, 5), date(2025, 6, 10)));
        assert!(!set.is_range_available(date(2025, 6, 5), date(2025, 6, 11)));
        assert!(!set.is_range_available(date(2025, 6, 10), date(2025, 6, 12)));
        assert!(!set.is_range_available(date(2025, 6, 5), date(2025, 6, 5)));
    }

    #[tokio::test]
    async fn test_feeds_are_merged() {
        let mock = MockHttpClient::new();
        mock.respond(AIRBNB, &feed(&[("20250601", Some("20250605"))]));
        mock.respond(
            BOOKING,
            &feed(&[("20250604", Some("20250606")), ("20250720", Some("20250721"))]),
        );
        let (service, _clock) = service_with(mock.into_arc());

        let set = service
            .load_unavailable_dates(&urls(&[AIRBNB, BOOKING]), date(2025, 6, 1), date(2025, 8, 31))
            .await
            .unwrap();

        assert_eq!(set.len(), 6);
        assert!(service.is_unavailable(date(2025, 6, 5)));
        assert!(service.is_unavailable(date(2025, 7, 20)));
        assert!(!service.is_unavailable(date(2025, 6, 6)));
        assert!(service.last_error().is_none());
        assert_eq!(
            service.find_next_unavailable(date(2025, 6, 10), 90),
            Some(date(2025, 7, 20))
        );
        assert_eq!(service.find_next_unavailable(date(2025, 6, 10), 30), None);
        assert_eq!(service.max_checkout(date(2025, 6, 6)), Some(date(2025, 7, 20)));
    }

    #[tokio::test]
    async fn test_concurrent_loads_fetch_each_feed_once() {
        let mock = Arc::new(MockHttpClient::with_delay(30));
        mock.respond(AIRBNB, &feed(&[("20250601", Some("20250605"))]));
        mock.respond(BOOKING, &feed(&[("20250610", Some("20250612"))]));
        let (service, _clock) = service_with(Arc::clone(&mock));
        let feeds = urls(&[AIRBNB, BOOKING]);

        let (first, second) = tokio::join!(
            service.load_unavailable_dates(&feeds, date(2025, 6, 1), date(2025, 6, 30)),
            service.load_unavailable_dates(&feeds, date(2025, 6, 1), date(2025, 6, 30)),
        );
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(mock.calls_to(AIRBNB), 1);
        assert_eq!(mock.calls_to(BOOKING), 1);

        // a later call within the ttl does not hit the network either
        service
            .load_unavailable_dates(&feeds, date(2025, 6, 1), date(2025, 6, 30))
            .await
            .unwrap();
        assert_eq!(mock.total_calls(), 2);

        let stats = service.cache_stats();
        assert_eq!(stats.fetch_count, 2);
        assert_eq!(stats.dedup_count, 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry_refetches_and_horizon_is_part_of_key() {
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(AIRBNB, &feed(&[("20250601", Some("20250605"))]));
        let (service, clock) = service_with(Arc::clone(&mock));
        let feeds = urls(&[AIRBNB]);

        service
            .load_unavailable_dates(&feeds, date(2025, 6, 1), date(2025, 6, 30))
            .await
            .unwrap();
        service
            .load_unavailable_dates(&feeds, date(2025, 6, 1), date(2025, 7, 31))
            .await
            .unwrap();
        assert_eq!(mock.calls_to(AIRBNB), 2);

        clock.advance(Duration::from_secs(6 * 3600 + 1));
        assert_eq!(service.sweep_cache(), 2);
        service
            .load_unavailable_dates(&feeds, date(2025, 6, 1), date(2025, 6, 30))
            .await
            .unwrap();
        assert_eq!(mock.calls_to(AIRBNB), 3);
    }

    #[tokio::test]
    async fn test_failing_feed_does_not_block_others() {
        let mock = MockHttpClient::new();
        mock.respond(AIRBNB, &feed(&[("20250601", Some("20250603"))]));
        mock.fail(BOOKING, 503);
        let (service, _clock) = service_with(mock.into_arc());

        let set = service
            .load_unavailable_dates(&urls(&[AIRBNB, BOOKING]), date(2025, 6, 1), date(2025, 6, 30))
            .await
            .unwrap();

        assert_eq!(set.len(), 2);
        assert!(matches!(
            service.last_error(),
            Some(FeedError::Fetch { ref url, .. }) if url == BOOKING
        ));

        // the failure was not cached
        let _ = service
            .load_unavailable_dates(&urls(&[BOOKING]), date(2025, 6, 1), date(2025, 6, 30))
            .await;
        assert_eq!(service.cache_stats().fetch_count, 3);
    }

    #[tokio::test]
    async fn test_inverted_horizon_is_rejected() {
        let (service, _clock) = service_with(MockHttpClient::new().into_arc());
        let result = service
            .load_unavailable_dates(&urls(&[AIRBNB]), date(2025, 7, 1), date(2025, 6, 1))
            .await;
        assert_eq!(
            result,
            Err(FeedError::InvalidHorizon {
                start: date(2025, 7, 1),
                end: date(2025, 6, 1)
            })
        );
    }
}
