//! Market-data feed port trait.

use crate::domain::snapshot::MarketSnapshot;
use chrono::NaiveDateTime;

/// Source of price and indicator snapshots for one instrument.
pub trait MarketDataFeed {
    /// Name used in log lines and errors, usually the file or symbol.
    fn source_name(&self) -> &str;

    /// Every timestamp the feed can serve. Order and uniqueness are not
    /// guaranteed; the harness sorts and de-duplicates.
    fn timestamps(&self) -> Vec<NaiveDateTime>;

    fn snapshot(&self, timestamp: NaiveDateTime) -> Option<MarketSnapshot>;
}
