//! CSV market-data feed adapter.
//!
//! Expected header: `timestamp,price,<granularity>.<field>,...`, e.g.
//! `timestamp,price,5m.rsi,12h.ema`. Empty indicator cells are treated as
//! missing values. Timestamps are `YYYY-MM-DD HH:MM:SS`, ISO `T`-separated,
//! or epoch milliseconds.

use crate::domain::error::PerpError;
use crate::domain::snapshot::MarketSnapshot;
use crate::ports::feed_port::MarketDataFeed;
use chrono::{DateTime, NaiveDateTime};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::Path;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug)]
pub struct CsvFeed {
    name: String,
    snapshots: BTreeMap<NaiveDateTime, MarketSnapshot>,
}

impl CsvFeed {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, PerpError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let file = fs::File::open(path).map_err(|e| PerpError::Feed {
            source_name: name.clone(),
            reason: format!("failed to open: {}", e),
        })?;
        Self::from_reader(name, file)
    }

    pub fn from_reader<R: Read>(name: impl Into<String>, reader: R) -> Result<Self, PerpError> {
        let name = name.into();
        let feed_err = |reason: String| PerpError::Feed {
            source_name: name.clone(),
            reason,
        };

        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| feed_err(format!("CSV header error: {}", e)))?
            .clone();

        if headers.get(0) != Some("timestamp") || headers.get(1) != Some("price") {
            return Err(feed_err(
                "header must start with timestamp,price".to_string(),
            ));
        }

        let mut columns = Vec::new();
        for header in headers.iter().skip(2) {
            let (granularity, field) = header
                .split_once('.')
                .filter(|(g, f)| !g.is_empty() && !f.is_empty())
                .ok_or_else(|| {
                    feed_err(format!(
                        "column {} is not <granularity>.<field>",
                        header
                    ))
                })?;
            columns.push((granularity.to_string(), field.to_string()));
        }

        let mut snapshots = BTreeMap::new();
        for (row, result) in rdr.records().enumerate() {
            let line = row + 2;
            let record = result.map_err(|e| feed_err(format!("CSV parse error: {}", e)))?;

            let ts_str = record
                .get(0)
                .ok_or_else(|| feed_err(format!("line {}: missing timestamp", line)))?;
            let timestamp = parse_timestamp(ts_str)
                .ok_or_else(|| feed_err(format!("line {}: invalid timestamp {}", line, ts_str)))?;

            let price: f64 = record
                .get(1)
                .ok_or_else(|| feed_err(format!("line {}: missing price", line)))?
                .parse()
                .map_err(|e| feed_err(format!("line {}: invalid price: {}", line, e)))?;

            let mut snapshot = MarketSnapshot::new(timestamp, price);
            for (idx, (granularity, field)) in columns.iter().enumerate() {
                let cell = record.get(idx + 2).unwrap_or("");
                if cell.is_empty() {
                    continue;
                }
                let value: f64 = cell.parse().map_err(|e| {
                    feed_err(format!(
                        "line {}: invalid {}.{} value: {}",
                        line, granularity, field, e
                    ))
                })?;
                snapshot.set_indicator(granularity, field, value);
            }
            snapshots.insert(timestamp, snapshot);
        }

        Ok(Self { name, snapshots })
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// First and last timestamp.
    pub fn range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let first = self.snapshots.keys().next()?;
        let last = self.snapshots.keys().next_back()?;
        Some((*first, *last))
    }

    /// Every `granularity.field` pair seen in the file.
    pub fn indicator_columns(&self) -> BTreeSet<String> {
        self.snapshots
            .values()
            .flat_map(|s| {
                s.indicators.iter().flat_map(|(granularity, fields)| {
                    fields.keys().map(move |field| format!("{}.{}", granularity, field))
                })
            })
            .collect()
    }
}

impl MarketDataFeed for CsvFeed {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn timestamps(&self) -> Vec<NaiveDateTime> {
        self.snapshots.keys().copied().collect()
    }

    fn snapshot(&self, timestamp: NaiveDateTime) -> Option<MarketSnapshot> {
        self.snapshots.get(&timestamp).cloned()
    }
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        let millis: i64 = value.parse().ok()?;
        return DateTime::from_timestamp_millis(millis).map(|dt| dt.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}
