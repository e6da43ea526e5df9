//! Open and closed leveraged positions.

use chrono::NaiveDateTime;

use crate::domain::order::{Direction, Order};

/// The current open exposure for one strategy on one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub avg_entry_price: f64,
    pub leverage: f64,
    pub margin: f64,
    pub cumulative_fee: f64,
    pub unrealized_pnl_usd: f64,
    pub unrealized_pnl_percent: f64,
    pub orders: Vec<Order>,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub opened_at: NaiveDateTime,
    /// Sum of the USD amounts requested by the open orders.
    pub amount_usd: f64,
}

impl Position {
    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter().filter(|o| o.is_open())
    }

    pub fn close_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter().filter(|o| o.is_close())
    }

    pub fn first_order(&self) -> Option<&Order> {
        self.orders.first()
    }

    pub fn last_order(&self) -> Option<&Order> {
        self.orders.last()
    }

    /// Size-weighted average price over the open orders plus one more fill
    /// of `size` at `price`. Closes do not move the average.
    pub fn weighted_open_price_with(&self, price: f64, size: f64) -> f64 {
        let (value, total) = self
            .open_orders()
            .fold((price * size, size), |(v, s), o| (v + o.avg_price * o.size, s + o.size));
        if total > 0.0 { value / total } else { 0.0 }
    }

    pub fn realized_brutto_usd(&self) -> f64 {
        self.close_orders().filter_map(|o| o.brutto_pnl_usd).sum()
    }

    /// Total margin committed by the open orders over the position's life.
    pub fn committed_margin(&self) -> f64 {
        self.open_orders().map(|o| o.margin).sum()
    }

    pub fn track_extrema(&mut self, price: f64) {
        if price > self.highest_price {
            self.highest_price = price;
        }
        if price < self.lowest_price {
            self.lowest_price = price;
        }
    }

    pub fn hold_minutes(&self, now: NaiveDateTime) -> f64 {
        (now - self.opened_at).num_seconds() as f64 / 60.0
    }
}

/// Immutable snapshot of a position taken when its size reached zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub symbol: String,
    pub direction: Direction,
    pub avg_entry_price: f64,
    pub leverage: f64,
    pub cumulative_fee: f64,
    pub orders: Vec<Order>,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub opened_at: NaiveDateTime,
    pub amount_usd: f64,
    pub realized_pnl_usd: f64,
    pub realized_pnl_percent: f64,
    pub is_liquidated: bool,
    pub closed_at: NaiveDateTime,
}

impl ClosedPosition {
    pub fn from_position(
        position: Position,
        closed_at: NaiveDateTime,
        is_liquidated: bool,
    ) -> Self {
        let realized_pnl_usd = position.realized_brutto_usd() + position.cumulative_fee;
        let committed = position.committed_margin();
        let realized_pnl_percent = if committed > 0.0 {
            realized_pnl_usd / committed * 100.0
        } else {
            0.0
        };
        ClosedPosition {
            symbol: position.symbol,
            direction: position.direction,
            avg_entry_price: position.avg_entry_price,
            leverage: position.leverage,
            cumulative_fee: position.cumulative_fee,
            orders: position.orders,
            highest_price: position.highest_price,
            lowest_price: position.lowest_price,
            opened_at: position.opened_at,
            amount_usd: position.amount_usd,
            realized_pnl_usd,
            realized_pnl_percent,
            is_liquidated,
            closed_at,
        }
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl_usd > 0.0
    }

    pub fn hold_minutes(&self) -> f64 {
        (self.closed_at - self.opened_at).num_seconds() as f64 / 60.0
    }

    pub fn exit_price(&self) -> Option<f64> {
        self.orders.iter().rev().find(|o| o.is_close()).map(|o| o.avg_price)
    }
}
