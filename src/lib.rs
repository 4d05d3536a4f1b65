// Main library file for the rental pricing & availability engine

// Foundation
pub mod cache;
pub mod clock;
pub mod config;
pub mod http;

// Pricing
pub mod platform;
pub mod season;
pub mod stay;

// Availability
pub mod availability;
pub mod lookup;
pub mod scanner;

// Re-export key types for convenience
pub use availability::{AvailabilityService, BusyInterval, FeedError, UnavailableDateSet};
pub use cache::{CacheKey, CacheStatsReport, KeyValueStore, MemoryStore, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, TtlClass};
pub use http::{HttpClient, HttpError, ReqwestHttpClient};
pub use lookup::{ListingQuery, PriceBatchQuery, PropertyLookup, PropertyQuote};
pub use platform::{platform_price, starting_price, StartingPrice};
pub use scanner::ForwardScanner;
pub use season::{PricingDocument, Season};
pub use stay::{
    select_discount, GuestCounts, PricingError, PropertyKind, StayBreakdown, StayCalculator,
    StayRequest,
};
