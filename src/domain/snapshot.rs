//! Market snapshots: one price sample plus opaque indicator values.

use chrono::NaiveDateTime;
use std::collections::{BTreeSet, HashMap};

/// Indicator values keyed by granularity (`5m`, `12h`, ...) and then by field.
pub type IndicatorMap = HashMap<String, HashMap<String, f64>>;

#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub timestamp: NaiveDateTime,
    pub price: f64,
    pub indicators: IndicatorMap,
}

impl MarketSnapshot {
    pub fn new(timestamp: NaiveDateTime, price: f64) -> Self {
        MarketSnapshot {
            timestamp,
            price,
            indicators: HashMap::new(),
        }
    }

    pub fn with_indicator(mut self, granularity: &str, field: &str, value: f64) -> Self {
        self.set_indicator(granularity, field, value);
        self
    }

    pub fn set_indicator(&mut self, granularity: &str, field: &str, value: f64) {
        self.indicators
            .entry(granularity.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    pub fn indicator(&self, granularity: &str, field: &str) -> Option<f64> {
        self.indicators.get(granularity)?.get(field).copied()
    }

    pub fn granularities(&self) -> BTreeSet<&str> {
        self.indicators.keys().map(String::as_str).collect()
    }
}
