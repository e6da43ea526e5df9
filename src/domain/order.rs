//! Order records: one immutable entry per fill.

use chrono::NaiveDateTime;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "long" => Some(Direction::Long),
            "short" => Some(Direction::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Open,
    Close,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Open => "open",
            OrderSide::Close => "close",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "open" => Some(OrderSide::Open),
            "close" => Some(OrderSide::Close),
            _ => None,
        }
    }
}

/// A single fill against a position.
///
/// `margin` is the margin contributed by an open fill or released by a close
/// fill. `brutto_pnl_usd` is only set on close fills.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub client_order_id: String,
    pub side: OrderSide,
    pub direction: Direction,
    pub size: f64,
    pub avg_price: f64,
    pub fee: f64,
    pub margin: f64,
    pub leverage: f64,
    pub timestamp: NaiveDateTime,
    pub position_avg_entry_price: f64,
    pub brutto_pnl_usd: Option<f64>,
}

impl Order {
    pub fn is_open(&self) -> bool {
        self.side == OrderSide::Open
    }

    pub fn is_close(&self) -> bool {
        self.side == OrderSide::Close
    }

    /// Gross PnL plus fee for close fills; just the fee for open fills.
    pub fn net_pnl_usd(&self) -> f64 {
        self.brutto_pnl_usd.unwrap_or(0.0) + self.fee
    }
}
